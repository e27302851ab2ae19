//! Radiation based forecaster learning one factor per MPPT string and hour.
//!
//! Input is an hourly CSV export with the columns `idx,ts,TTT,Rad1h,SunD1,RSunD`,
//! `ts` being the unix timestamp at the end of the hour.

use chrono::{DateTime, Days, NaiveDate, TimeZone, Timelike};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::{night_need, ForecastSummary, Forecaster};
use crate::error::ControlError;

#[derive(Debug, Clone, Deserialize)]
pub struct MosmixRow {
    pub idx: i32,
    pub ts: i64,
    #[serde(rename = "TTT")]
    pub ttt: f32,
    #[serde(rename = "Rad1h")]
    pub rad1h: i32,
    #[serde(rename = "SunD1")]
    pub sund1: i32,
    #[serde(rename = "RSunD")]
    pub rsund: i32,
}

/// One hour of one day. Factors are stored in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HourSlot {
    pub rad1h: i32,
    pub sund1: i32,
    pub x: i32,
    pub mppt: [i32; 4],
    pub fac: [i32; 4],
    pub exp: [i32; 4],
}

impl HourSlot {
    fn update_x(&mut self) {
        self.x = (self.rad1h as f64 * (1.0 + self.sund1 as f64 / 3600.0 / 2.0)) as i32;
    }

    fn update_exp(&mut self) {
        for i in 0..4 {
            self.exp[i] = self.x * self.fac[i] / 100;
        }
    }

    fn expected(&self) -> i32 {
        self.exp.iter().sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct MosmixState {
    day: Option<NaiveDate>,
    today: [HourSlot; 24],
    tomorrow: [HourSlot; 24],
}

pub struct MosmixForecaster {
    path: PathBuf,
    rad1h_min: i32,
    rows: Vec<MosmixRow>,
    state: MosmixState,
}

impl MosmixForecaster {
    pub fn new(path: PathBuf, rad1h_min: i32) -> Self {
        Self {
            path,
            rad1h_min,
            rows: Vec::new(),
            state: MosmixState::default(),
        }
    }

    pub fn today(&self) -> &[HourSlot; 24] {
        &self.state.today
    }

    pub fn tomorrow(&self) -> &[HourSlot; 24] {
        &self.state.tomorrow
    }

    pub fn parse(reader: impl std::io::Read) -> Result<Vec<MosmixRow>, ControlError> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut rows = Vec::new();
        for row in rdr.deserialize() {
            rows.push(row?);
        }
        Ok(rows)
    }

    /// Replaces the raw rows and fills the 24-hour slots.
    pub fn apply_rows(&mut self, rows: Vec<MosmixRow>, now: DateTime<Tz>) {
        self.roll_day(now);
        let today = now.date_naive();
        let tomorrow = today.checked_add_days(Days::new(1));
        for row in &rows {
            let Some(t) = now.timezone().timestamp_opt(row.ts, 0).single() else {
                continue;
            };
            // the row covers the hour before its timestamp
            let start = t - chrono::Duration::hours(1);
            let h = start.hour() as usize;
            let slot = if start.date_naive() == today {
                &mut self.state.today[h]
            } else if Some(start.date_naive()) == tomorrow {
                &mut self.state.tomorrow[h]
            } else {
                continue;
            };
            slot.rad1h = row.rad1h;
            slot.sund1 = row.sund1;
            slot.update_x();
            slot.update_exp();
        }
        self.rows = rows;
    }

    /// Moves tomorrow into today once the date changes.
    fn roll_day(&mut self, now: DateTime<Tz>) {
        let day = now.date_naive();
        match self.state.day {
            Some(d) if d == day => {}
            Some(d) if d.checked_add_days(Days::new(1)) == Some(day) => {
                self.state.today = self.state.tomorrow;
                for slot in self.state.today.iter_mut() {
                    slot.mppt = [0; 4];
                }
                self.state.tomorrow = [HourSlot::default(); 24];
                self.state.day = Some(day);
                debug!("mosmix takeover of tomorrow's slots");
            }
            _ => {
                self.state = MosmixState {
                    day: Some(day),
                    ..MosmixState::default()
                };
            }
        }
    }

    /// Hours between sundown and sunrise around the coming midnight.
    fn night_hours(&self, now: DateTime<Tz>) -> Option<Vec<u32>> {
        let tz = now.timezone();
        let midnight = now.date_naive().checked_add_days(Days::new(1))?.and_hms_opt(0, 0, 0)?;
        let midnight_ts = tz.from_local_datetime(&midnight).earliest()?.timestamp();
        let mid = self.rows.iter().position(|r| r.ts == midnight_ts)?;

        let lo = mid.saturating_sub(12);
        let hi = (mid + 12).min(self.rows.len() - 1);
        let now_ts = now.timestamp();

        let mut from = mid;
        while from > lo {
            let r = &self.rows[from - 1];
            if r.rad1h > self.rad1h_min || r.ts <= now_ts {
                break;
            }
            from -= 1;
        }
        let mut to = mid;
        while to < hi {
            if self.rows[to + 1].rad1h > self.rad1h_min {
                break;
            }
            to += 1;
        }

        let hours = self.rows[from..=to]
            .iter()
            .filter_map(|r| tz.timestamp_opt(r.ts - 3600, 0).single())
            .map(|t| t.hour())
            .collect();
        Some(hours)
    }
}

impl Forecaster for MosmixForecaster {
    fn forecast(&self, now: DateTime<Tz>) -> ForecastSummary {
        let hour = now.hour() as usize;
        let today: i32 = self.state.today.iter().map(HourSlot::expected).sum();
        let tomorrow = self.state.tomorrow.iter().map(HourSlot::expected).sum();
        let sod = self.state.today[..=hour].iter().map(HourSlot::expected).sum();
        ForecastSummary {
            today,
            tomorrow,
            sod,
            eod: today - sod,
        }
    }

    fn survival_need(&self, now: DateTime<Tz>, profile: &[i32; 24]) -> i32 {
        match self.night_hours(now) {
            Some(hours) => hours.iter().map(|&h| profile[h as usize]).sum(),
            None => night_need(profile),
        }
    }

    fn learn(&mut self, now: DateTime<Tz>, mppt_wh: [u64; 4]) {
        self.roll_day(now);
        let h = now.hour() as usize;
        let m0 = &mut self.state.today[h];
        m0.update_x();
        for (i, &wh) in mppt_wh.iter().enumerate() {
            if m0.x > 0 && wh > 0 {
                m0.mppt[i] = wh as i32;
                let fac = (wh as f64 / m0.x as f64 * 100.0) as i32;
                debug!(hour = h, string = i + 1, old = m0.fac[i], new = fac, "mosmix factor");
                m0.fac[i] = fac;
            }
        }
        m0.update_exp();
        let fac = m0.fac;
        let m1 = &mut self.state.tomorrow[h];
        m1.fac = fac;
        m1.update_x();
        m1.update_exp();
    }

    fn refresh(&mut self, now: DateTime<Tz>) {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "cannot open mosmix file");
                self.roll_day(now);
                return;
            }
        };
        match Self::parse(file) {
            Ok(rows) => {
                info!(path = %self.path.display(), rows = rows.len(), "mosmix loaded");
                self.apply_rows(rows, now);
            }
            Err(e) => warn!(error = %e, "mosmix parse failed"),
        }
    }

    fn state(&self) -> Result<Vec<u8>, ControlError> {
        Ok(bincode::serialize(&self.state)?)
    }

    fn restore(&mut self, bytes: &[u8]) -> Result<(), ControlError> {
        self.state = bincode::deserialize(bytes)?;
        Ok(())
    }
}
