pub mod mosmix;

pub use mosmix::*;

use chrono::{DateTime, Timelike};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::config::{ForecastConfig, ForecastProvider};
use crate::error::ControlError;

/// Expected PV yield in Wh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForecastSummary {
    pub today: i32,
    pub tomorrow: i32,
    /// Part of today already elapsed.
    pub sod: i32,
    /// Part of today still to come.
    pub eod: i32,
}

/// Forecast collaborator consumed by the collector.
#[cfg_attr(test, mockall::automock)]
pub trait Forecaster: Send + Sync {
    fn forecast(&self, now: DateTime<Tz>) -> ForecastSummary;

    /// Energy needed to get through the coming night, given the average
    /// consumption per hour of day.
    fn survival_need(&self, now: DateTime<Tz>, profile: &[i32; 24]) -> i32;

    /// Feeds the measured per-string yield of the hour that just ended.
    fn learn(&mut self, now: DateTime<Tz>, mppt_wh: [u64; 4]);

    /// Re-reads external forecast data.
    fn refresh(&mut self, now: DateTime<Tz>);

    /// Serialized learned state.
    fn state(&self) -> Result<Vec<u8>, ControlError>;

    fn restore(&mut self, bytes: &[u8]) -> Result<(), ControlError>;
}

/// Night hours used when no radiation data tells sundown and sunrise.
pub fn night_need(profile: &[i32; 24]) -> i32 {
    (18..24).chain(0..6).map(|h| profile[h]).sum()
}

/// Constant daily yields spread over a fixed sine day.
pub struct StaticForecaster {
    pub today_wh: i32,
    pub tomorrow_wh: i32,
    pub sunrise: f64,
    pub sunset: f64,
}

impl StaticForecaster {
    pub fn new(today_wh: i32, tomorrow_wh: i32) -> Self {
        Self {
            today_wh,
            tomorrow_wh,
            sunrise: 6.0,
            sunset: 18.0,
        }
    }

    /// Fraction of the day's yield produced until `hour` (exclusive).
    fn elapsed(&self, hour: f64) -> f64 {
        if hour <= self.sunrise {
            return 0.0;
        }
        if hour >= self.sunset {
            return 1.0;
        }
        let x = (hour - self.sunrise) / (self.sunset - self.sunrise).max(0.01);
        // integral of sin(pi*x) normalized to [0, 1]
        (1.0 - (PI * x).cos()) / 2.0
    }
}

impl Forecaster for StaticForecaster {
    fn forecast(&self, now: DateTime<Tz>) -> ForecastSummary {
        let hour = now.hour() as f64 + 1.0;
        let sod = (self.today_wh as f64 * self.elapsed(hour)).round() as i32;
        ForecastSummary {
            today: self.today_wh,
            tomorrow: self.tomorrow_wh,
            sod,
            eod: self.today_wh - sod,
        }
    }

    fn survival_need(&self, _now: DateTime<Tz>, profile: &[i32; 24]) -> i32 {
        night_need(profile)
    }

    fn learn(&mut self, _now: DateTime<Tz>, _mppt_wh: [u64; 4]) {}

    fn refresh(&mut self, _now: DateTime<Tz>) {}

    fn state(&self) -> Result<Vec<u8>, ControlError> {
        Ok(Vec::new())
    }

    fn restore(&mut self, _bytes: &[u8]) -> Result<(), ControlError> {
        Ok(())
    }
}

/// Builds the configured forecaster.
pub fn from_config(cfg: &ForecastConfig, now: DateTime<Tz>) -> Box<dyn Forecaster> {
    match cfg.provider {
        ForecastProvider::Static => Box::new(StaticForecaster::new(
            cfg.static_today_wh,
            cfg.static_tomorrow_wh,
        )),
        ForecastProvider::Mosmix => {
            let mut m = MosmixForecaster::new(cfg.mosmix_csv.clone(), cfg.rad1h_min);
            m.refresh(now);
            Box::new(m)
        }
    }
}
