//! Dashboard files in the run directory. Everything here is best effort:
//! failures are logged and never reach the control loop.

use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

use crate::domain::{GlobalState, PowerSample};
use crate::error::ControlError;

/// Flat CSV row of a sample.
#[derive(Debug, Serialize)]
pub struct SampleRow {
    pub slot: usize,
    pub pv: i32,
    pub grid: i32,
    pub akku: i32,
    pub load: i32,
    pub mppt1: i32,
    pub mppt2: i32,
    pub mppt3: i32,
    pub mppt4: i32,
    pub p1: i32,
    pub p2: i32,
    pub p3: i32,
    pub soc: i32,
    pub temp_in: f32,
    pub temp_out: f32,
    pub valid: bool,
    pub offline: bool,
    pub distorted: bool,
}

impl SampleRow {
    fn new(slot: usize, s: &PowerSample) -> Self {
        Self {
            slot,
            pv: s.pv,
            grid: s.grid,
            akku: s.akku,
            load: s.load,
            mppt1: s.mppt1,
            mppt2: s.mppt2,
            mppt3: s.mppt3,
            mppt4: s.mppt4,
            p1: s.p1,
            p2: s.p2,
            p3: s.p3,
            soc: s.soc,
            temp_in: s.temp_in,
            temp_out: s.temp_out,
            valid: s.flags.valid,
            offline: s.flags.offline,
            distorted: s.flags.distorted,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct GstateRow {
    pub slot: usize,
    pub pv: i32,
    pub today: i32,
    pub tomorrow: i32,
    pub akku: i32,
    pub soc: i32,
    pub ttl: i32,
    pub success: i32,
    pub survive: i32,
    pub heating: i32,
}

impl GstateRow {
    fn new(slot: usize, g: &GlobalState) -> Self {
        Self {
            slot,
            pv: g.pv,
            today: g.today,
            tomorrow: g.tomorrow,
            akku: g.akku,
            soc: g.soc,
            ttl: g.ttl,
            success: g.success,
            survive: g.survive,
            heating: g.heating,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Exporter {
    dir: PathBuf,
}

impl Exporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn json<T: Serialize + ?Sized>(&self, file: &str, value: &T) {
        if let Err(e) = self.try_json(file, value) {
            debug!(file, error = %e, "export failed");
        }
    }

    /// Samples in slot order, one row each.
    pub fn samples<'a>(&self, file: &str, samples: impl IntoIterator<Item = &'a PowerSample>) {
        let rows = samples
            .into_iter()
            .enumerate()
            .map(|(slot, s)| SampleRow::new(slot, s));
        if let Err(e) = self.try_csv(file, rows) {
            debug!(file, error = %e, "export failed");
        }
    }

    pub fn gstates<'a>(&self, file: &str, states: impl IntoIterator<Item = &'a GlobalState>) {
        let rows = states
            .into_iter()
            .enumerate()
            .map(|(slot, g)| GstateRow::new(slot, g));
        if let Err(e) = self.try_csv(file, rows) {
            debug!(file, error = %e, "export failed");
        }
    }

    fn try_json<T: Serialize + ?Sized>(&self, file: &str, value: &T) -> Result<(), ControlError> {
        fs::create_dir_all(&self.dir)?;
        let body = serde_json::to_vec_pretty(value)
            .map_err(|e| ControlError::Persistence(e.to_string()))?;
        fs::write(self.dir.join(file), body)?;
        Ok(())
    }

    fn try_csv<R: Serialize>(
        &self,
        file: &str,
        rows: impl Iterator<Item = R>,
    ) -> Result<(), ControlError> {
        fs::create_dir_all(&self.dir)?;
        let mut w = csv::Writer::from_path(self.dir.join(file))?;
        for row in rows {
            w.serialize(row)?;
        }
        w.flush()?;
        Ok(())
    }
}
