//! In-process house model: a PV day curve, a wandering base load, the
//! simulated devices and a battery following its commands.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::Arc;
use tracing::debug;

use super::{Actuator, TelemetrySource};
use crate::config::Config;
use crate::domain::{BatteryCommand, Command, InverterStatus, Reading, Season};
use crate::error::ControlError;

/// Base load changes every this many seconds.
const BASE_LOAD_PERIOD: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeviceLoad {
    total: i32,
    watts: i32,
}

#[derive(Debug)]
struct Loads {
    devices: HashMap<String, DeviceLoad>,
    battery: BatteryCommand,
}

impl Default for Loads {
    fn default() -> Self {
        Self {
            devices: HashMap::new(),
            battery: BatteryCommand::Standby,
        }
    }
}

/// Consumers attached to the simulated house, shared with the actuators.
#[derive(Debug, Clone, Default)]
pub struct SimulatedLoads(Arc<Mutex<Loads>>);

impl SimulatedLoads {
    pub fn actuator(&self, name: &str, total: i32) -> SimulatedActuator {
        self.0.lock().devices.insert(
            name.to_string(),
            DeviceLoad { total, watts: 0 },
        );
        SimulatedActuator {
            name: name.to_string(),
            loads: self.clone(),
        }
    }

    pub fn device_watts(&self) -> i32 {
        self.0.lock().devices.values().map(|d| d.watts).sum()
    }

    pub fn watts(&self, name: &str) -> Option<i32> {
        self.0.lock().devices.get(name).map(|d| d.watts)
    }

    pub fn battery(&self) -> BatteryCommand {
        self.0.lock().battery
    }
}

/// Applies commands to the simulated house.
#[derive(Debug, Clone)]
pub struct SimulatedActuator {
    name: String,
    loads: SimulatedLoads,
}

#[async_trait]
impl Actuator for SimulatedActuator {
    async fn send(&self, command: &Command) -> Result<(), ControlError> {
        let mut loads = self.loads.0.lock();
        match *command {
            Command::Battery(cmd) => loads.battery = cmd,
            Command::Switch { on } => {
                let d = loads
                    .devices
                    .get_mut(&self.name)
                    .ok_or_else(|| ControlError::actuation(&self.name, "not attached"))?;
                d.watts = if on { d.total } else { 0 };
            }
            Command::Percent { percent } => {
                let d = loads
                    .devices
                    .get_mut(&self.name)
                    .ok_or_else(|| ControlError::actuation(&self.name, "not attached"))?;
                d.watts = percent.clamp(0, 100) * d.total / 100;
            }
        }
        Ok(())
    }
}

pub struct SimulatedHome {
    tz: Tz,
    loads: SimulatedLoads,
    rng: StdRng,
    noise: Option<Normal<f64>>,
    peak_w: i32,
    capacity_wh: i32,
    charge_max_w: i32,
    discharge_max_w: i32,
    min_soc: i32,
    /// State of charge in per-mille.
    soc: f64,
    base_load: i32,
    base_changed: Option<i64>,
    consumed_ws: u64,
    produced_ws: u64,
    mppt_ws: [u64; 4],
    last: Option<i64>,
}

impl SimulatedHome {
    pub fn new(cfg: &Config, loads: SimulatedLoads) -> Self {
        let rng = match cfg.telemetry.sim_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let peak_w = cfg.telemetry.sim_peak_w;
        Self {
            tz: cfg.controller.timezone,
            loads,
            rng,
            noise: Normal::new(0.0, peak_w as f64 * 0.001).ok(),
            peak_w,
            capacity_wh: cfg.battery.capacity_wh,
            charge_max_w: cfg.battery.charge_max_w,
            discharge_max_w: cfg.battery.discharge_max_w,
            min_soc: cfg.battery.min_soc,
            soc: 500.0,
            base_load: 150,
            base_changed: None,
            consumed_ws: 0,
            produced_ws: 0,
            mppt_ws: [0; 4],
            last: None,
        }
    }

    pub fn loads(&self) -> &SimulatedLoads {
        &self.loads
    }

    pub fn with_soc(mut self, soc: i32) -> Self {
        self.soc = soc.clamp(0, 1000) as f64;
        self
    }

    /// Clear-sky production at `now`, scaled by season.
    fn pv_curve(&self, now: &DateTime<Tz>) -> f64 {
        let hour = now.hour() as f64 + now.minute() as f64 / 60.0 + now.second() as f64 / 3600.0;
        if !(6.0..18.0).contains(&hour) {
            return 0.0;
        }
        let season = match Season::of_month(now.month()) {
            Season::Summer => 1.0,
            Season::Transition => 0.7,
            Season::Winter => 0.35,
        };
        self.peak_w as f64 * season * (PI * (hour - 6.0) / 12.0).sin()
    }

    /// Advances the model to `now` and returns the resulting reading.
    pub fn step(&mut self, now: DateTime<Tz>) -> Reading {
        let ts = now.timestamp();
        let dt = self.last.map_or(1, |l| (ts - l).clamp(0, 3600)) as u64;
        self.last = Some(ts);

        let due = self
            .base_changed
            .map_or(true, |b| ts < b || ts - b >= BASE_LOAD_PERIOD);
        if due {
            self.base_load = self.rng.gen_range(100..=200);
            self.base_changed = Some(ts);
        }

        let noise = self.noise.map_or(0.0, |n| n.sample(&mut self.rng));
        let curve = self.pv_curve(&now);
        let pv = if curve > 0.0 { (curve + noise).max(0.0) as i32 } else { 0 };
        let consumption = self.base_load + self.loads.device_watts();

        let akku = match self.loads.battery() {
            BatteryCommand::Charge { limit } if self.soc < 1000.0 => {
                let max = if limit > 0 { limit.min(self.charge_max_w) } else { self.charge_max_w };
                -(pv - consumption).clamp(0, max)
            }
            BatteryCommand::Discharge { limit } if self.soc > self.min_soc as f64 => {
                let max = if limit > 0 { limit.min(self.discharge_max_w) } else { self.discharge_max_w };
                (consumption - pv).clamp(0, max)
            }
            _ => 0,
        };
        if self.capacity_wh > 0 {
            let wh = -akku as f64 * dt as f64 / 3600.0;
            self.soc = (self.soc + wh * 1000.0 / self.capacity_wh as f64).clamp(0.0, 1000.0);
        }

        let grid = consumption - pv - akku;
        let ac1 = pv + akku;
        let mppt1 = pv * 6 / 10;
        let mppt2 = pv - mppt1;
        let p2 = grid / 3;
        let p1 = grid - 2 * p2;

        if grid > 0 {
            self.consumed_ws += grid as u64 * dt;
        } else {
            self.produced_ws += (-grid) as u64 * dt;
        }
        self.mppt_ws[0] += mppt1.max(0) as u64 * dt;
        self.mppt_ws[1] += mppt2.max(0) as u64 * dt;

        let temp_out = match Season::of_month(now.month()) {
            Season::Summer => 24.0,
            Season::Transition => 12.0,
            Season::Winter => 2.0,
        };

        debug!(pv, grid, akku, consumption, soc = self.soc as i32, "simulated home");
        Reading {
            grid: Some(grid),
            akku: Some(akku),
            ac1: Some(ac1),
            ac2: Some(0),
            dc1: Some(pv),
            dc2: Some(0),
            mppt1: Some(mppt1),
            mppt2: Some(mppt2),
            mppt3: Some(0),
            mppt4: Some(0),
            p1: Some(p1),
            p2: Some(p2),
            p3: Some(p2),
            v1: Some(230),
            v2: Some(230),
            v3: Some(230),
            f: Some(0),
            soc: Some(self.soc as i32),
            inv1: Some(if pv > 0 { InverterStatus::Mppt } else { InverterStatus::Sleeping }),
            inv2: None,
            temp_in: Some(21.0),
            temp_out: Some(temp_out),
            meter_consumed: Some(self.consumed_ws / 3600),
            meter_produced: Some(self.produced_ws / 3600),
            meter_mppt: Some(self.mppt_ws.map(|ws| ws / 3600)),
        }
    }
}

#[async_trait]
impl TelemetrySource for SimulatedHome {
    async fn poll(&mut self) -> Result<Reading, ControlError> {
        let now = Utc::now().with_timezone(&self.tz);
        Ok(self.step(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Europe::Vienna;

    fn home() -> SimulatedHome {
        let mut cfg = Config::default();
        cfg.telemetry.sim_seed = Some(7);
        SimulatedHome::new(&cfg, SimulatedLoads::default())
    }

    fn balance(r: &Reading) -> i32 {
        let load = -(r.ac1.unwrap() + r.ac2.unwrap() + r.grid.unwrap());
        r.mppt1.unwrap() + r.mppt2.unwrap() + r.grid.unwrap() + r.akku.unwrap() + load
    }

    #[test]
    fn test_night_has_no_pv() {
        let mut h = home();
        let r = h.step(Vienna.with_ymd_and_hms(2026, 6, 1, 2, 0, 0).unwrap());
        assert_eq!(r.mppt1, Some(0));
        assert!((100..=200).contains(&r.grid.unwrap()));
        assert_eq!(r.inv1, Some(InverterStatus::Sleeping));
    }

    #[tokio::test]
    async fn test_device_load_shows_on_grid() {
        let mut h = home();
        let heater = h.loads().actuator("heater", 1000);
        let t = Vienna.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap();
        let before = h.step(t);
        heater.send(&Command::Switch { on: true }).await.unwrap();
        let after = h.step(t + chrono::Duration::seconds(1));
        let dgrid = after.grid.unwrap() - before.grid.unwrap();
        assert!((900..1100).contains(&dgrid), "dgrid {dgrid}");
        assert_eq!(balance(&after), 0);
        let phases = after.p1.unwrap() + after.p2.unwrap() + after.p3.unwrap();
        assert_eq!(phases, after.grid.unwrap());
    }

    #[tokio::test]
    async fn test_battery_absorbs_surplus() {
        let mut h = home().with_soc(400);
        let akku = h.loads().actuator("akku", 4500);
        akku.send(&Command::Battery(BatteryCommand::Charge { limit: 0 }))
            .await
            .unwrap();
        let t = Vienna.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap();
        let first = h.step(t);
        let r = h.step(t + chrono::Duration::seconds(60));
        assert!(r.akku.unwrap() < 0);
        assert!(r.soc.unwrap() >= first.soc.unwrap());
        assert_eq!(balance(&r), 0);
    }
}
