use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::ControlError;

pub const PSTATE: &str = "pstate.bin";
pub const GSTATE: &str = "gstate.bin";
pub const COUNTER: &str = "counter.bin";
pub const FORECAST: &str = "forecast.bin";

/// Binary snapshots of the history buffers in the state directory.
///
/// Writes go to a temporary file that is renamed over the target, so a
/// crash mid-write leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<(), ControlError> {
        let bytes = bincode::serialize(value)?;
        self.save_bytes(name, &bytes)
    }

    /// Returns `Ok(None)` when no snapshot was written yet.
    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, ControlError> {
        match self.load_bytes(name)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn save_bytes(&self, name: &str, bytes: &[u8]) -> Result<(), ControlError> {
        fs::create_dir_all(&self.dir)?;
        let target = self.dir.join(name);
        let tmp = self.dir.join(format!("{name}.tmp"));
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(bytes)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &target)?;
        debug!(file = %target.display(), bytes = bytes.len(), "snapshot written");
        Ok(())
    }

    pub fn load_bytes(&self, name: &str) -> Result<Option<Vec<u8>>, ControlError> {
        match fs::read(self.dir.join(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{CounterHistory, GstateHistory, PstateHistory};
    use crate::domain::PowerSample;

    #[test]
    fn test_history_round_trip_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("state"));

        let mut p = PstateHistory::default();
        for n in 0..90 {
            p.seconds.push(PowerSample {
                grid: n * 7 - 300,
                pv: n * 11,
                soc: 500 + n,
                ..Default::default()
            });
        }
        p.hours.seek(13);
        store.save(PSTATE, &p).unwrap();
        store.save(GSTATE, &GstateHistory::default()).unwrap();

        let loaded: PstateHistory = store.load(PSTATE).unwrap().unwrap();
        assert_eq!(loaded, p);
        let before = fs::read(dir.path().join("state").join(PSTATE)).unwrap();
        store.save(PSTATE, &loaded).unwrap();
        let after = fs::read(dir.path().join("state").join(PSTATE)).unwrap();
        assert_eq!(before, after);
        assert!(!dir.path().join("state").join("pstate.bin.tmp").exists());
    }

    #[test]
    fn test_missing_snapshot_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let c: Option<CounterHistory> = store.load(COUNTER).unwrap();
        assert!(c.is_none());
    }

    #[test]
    fn test_corrupt_snapshot_is_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        store.save_bytes(GSTATE, &[1, 2, 3]).unwrap();
        let err = store.load::<GstateHistory>(GSTATE).unwrap_err();
        assert!(matches!(err, ControlError::Persistence(_)));
    }
}
