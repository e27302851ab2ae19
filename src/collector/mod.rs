//! Telemetry aggregation: one sample per second, classified and rolled up
//! into minute, hour, day and hour-of-week history.

pub mod classify;
pub mod gstate;
pub mod ring;
pub mod rollup;

pub use ring::RingBuffer;
pub use rollup::Rollover;

use chrono::{DateTime, Datelike, Timelike};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::domain::{
    Counter, Counters, DeviceKind, DispatchState, GlobalState, PowerSample, Reading, Season,
};
use crate::forecast::Forecaster;
use rollup::{DAYS, HOURS, HOURS_OF_WEEK, MINUTES, SECONDS};

/// Sample history snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PstateHistory {
    pub seconds: RingBuffer<PowerSample>,
    pub minutes: RingBuffer<PowerSample>,
    pub hours: RingBuffer<PowerSample>,
    pub days: RingBuffer<PowerSample>,
    pub week: RingBuffer<PowerSample>,
}

impl Default for PstateHistory {
    fn default() -> Self {
        Self {
            seconds: RingBuffer::new(SECONDS),
            minutes: RingBuffer::new(MINUTES),
            hours: RingBuffer::new(HOURS),
            days: RingBuffer::new(DAYS),
            week: RingBuffer::new(HOURS_OF_WEEK),
        }
    }
}

/// GlobalState snapshot including the derived load profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GstateHistory {
    pub current: GlobalState,
    pub week: RingBuffer<GlobalState>,
    pub profile: [i32; 24],
}

impl Default for GstateHistory {
    fn default() -> Self {
        Self {
            current: GlobalState::default(),
            week: RingBuffer::new(HOURS_OF_WEEK),
            profile: [0; 24],
        }
    }
}

/// Counter snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterHistory {
    pub counters: Counters,
    pub week: RingBuffer<Counter>,
}

impl Default for CounterHistory {
    fn default() -> Self {
        Self {
            counters: Counters::default(),
            week: RingBuffer::new(HOURS_OF_WEEK),
        }
    }
}

/// Classifications derived at minute granularity and stamped onto every
/// following second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct MinuteFlags {
    offline: bool,
    burnout: bool,
    distorted: bool,
    pv_rising: bool,
    pv_falling: bool,
    grid_upload: bool,
    grid_download: bool,
    akku_discharge: bool,
    emergency: bool,
}

pub struct Collector {
    cfg: Arc<Config>,
    pub current: PowerSample,
    pub pstate: PstateHistory,
    pub gstate: GstateHistory,
    pub counter: CounterHistory,
    minute_flags: MinuteFlags,
    stable_count: usize,
    emergency_count: usize,
    heaters_total: i32,
    last_tick: Option<DateTime<Tz>>,
}

impl Collector {
    pub fn new(cfg: Arc<Config>) -> Self {
        let heaters_total = cfg
            .devices
            .iter()
            .filter(|d| d.kind == DeviceKind::OnOff)
            .map(|d| d.total)
            .sum();
        Self {
            cfg,
            current: PowerSample::default(),
            pstate: PstateHistory::default(),
            gstate: GstateHistory::default(),
            counter: CounterHistory::default(),
            minute_flags: MinuteFlags::default(),
            stable_count: 0,
            emergency_count: 0,
            heaters_total,
            last_tick: None,
        }
    }

    /// Resumes from persisted history.
    pub fn restore(&mut self, p: PstateHistory, g: GstateHistory, c: CounterHistory) {
        self.current = *p.seconds.current();
        self.pstate = p;
        self.gstate = g;
        self.counter = c;
    }

    pub fn global(&self) -> &GlobalState {
        &self.gstate.current
    }

    pub fn last_minute(&self) -> &PowerSample {
        self.pstate.minutes.current()
    }

    /// Processes one control cycle: rolls up completed periods, then stores
    /// the classified sample for `now`.
    pub fn tick(
        &mut self,
        now: DateTime<Tz>,
        raw: &Reading,
        forecaster: &mut dyn Forecaster,
    ) -> Rollover {
        let roll = rollup::rollover(self.last_tick, now);
        if let Some(last) = self.last_tick {
            if roll.minute {
                self.rollup_minute(last, now, forecaster);
            }
            if roll.hour {
                self.rollup_hour(last, forecaster);
                forecaster.refresh(now);
            }
            if roll.day {
                self.rollup_day(last);
            }
        }
        self.ingest(now, raw, roll.minute || self.last_tick.is_none());
        self.last_tick = Some(now);
        roll
    }

    /// Classifies one reading. A rejected reading is replaced by the last
    /// valid values so the next deltas, the counters and the minute means
    /// never see it; only its own cycle is flagged.
    fn ingest(&mut self, now: DateTime<Tz>, raw: &Reading, first_of_minute: bool) {
        let th = &self.cfg.thresholds;
        let season = Season::of_month(now.month());
        let minimum = th.minimum(season.is_winter());
        let prev = self.current;

        let mut s = classify::build_sample(raw, &prev, th, first_of_minute);
        let valid = match classify::check_validity(&s, &prev, raw, th, minimum) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "sample rejected");
                false
            }
        };

        if valid {
            self.stable_count = if s.dgrid == 0 { self.stable_count + 1 } else { 0 };
        }
        self.emergency_count = if s.grid > 2 * th.emergency {
            self.emergency_count + 1
        } else {
            0
        };

        let mf = self.minute_flags;
        let mut flags = s.flags;
        flags.valid = valid;
        flags.stable = self.stable_count >= th.stable_cycles;
        flags.emergency = self.emergency_count >= 3 || mf.emergency;
        flags.offline = mf.offline;
        flags.burnout = mf.burnout;
        flags.distorted = mf.distorted || !valid;
        flags.pv_rising = mf.pv_rising;
        flags.pv_falling = mf.pv_falling;
        flags.grid_upload = mf.grid_upload;
        flags.grid_download = mf.grid_download;
        flags.akku_discharge = mf.akku_discharge;
        flags.summer = season.is_summer();
        flags.winter = season.is_winter();

        if flags.emergency && !prev.flags.emergency {
            warn!(grid = s.grid, akku = s.akku, "emergency condition");
        }

        if !valid {
            let restart = first_of_minute;
            s = PowerSample {
                dpv: 0,
                dgrid: 0,
                dload: 0,
                sdpv: if restart { 0 } else { prev.sdpv },
                sdgrid: if restart { 0 } else { prev.sdgrid },
                sdload: if restart { 0 } else { prev.sdload },
                ..prev
            };
            flags.delta = false;
        }
        s.flags = flags;

        let counters = &mut self.counter.counters;
        counters.own.add_second(s.grid, s.mppt());
        if valid {
            if let Some(c) = raw.meter_consumed {
                counters.meter.consumed = c;
            }
            if let Some(p) = raw.meter_produced {
                counters.meter.produced = p;
            }
            if let Some(m) = raw.meter_mppt {
                counters.meter.mppt = m;
            }
        }

        debug!(
            pv = s.pv,
            grid = s.grid,
            akku = s.akku,
            load = s.load,
            soc = s.soc,
            valid = s.flags.valid,
            stable = s.flags.stable,
            "sample"
        );

        self.pstate.seconds.seek(now.second() as usize);
        *self.pstate.seconds.current_mut() = s;
        self.current = s;
    }

    fn rollup_minute(&mut self, last: DateTime<Tz>, now: DateTime<Tz>, forecaster: &dyn Forecaster) {
        let th = &self.cfg.thresholds;
        let m = rollup::aggregate(&self.pstate.seconds, last.second() as usize);
        self.pstate.minutes.seek(last.minute() as usize);
        *self.pstate.minutes.current_mut() = m;

        let minutes = &self.pstate.minutes;
        let (m0, m1, m2) = (minutes.back(0), minutes.back(1), minutes.back(2));
        let season = Season::of_month(now.month());
        let minimum = th.minimum(season.is_winter());

        let offline = [m0, m1, m2]
            .iter()
            .all(|m| classify::minute_offline(m, th, minimum));
        let b = &self.cfg.burnout;
        let burnout = offline
            && b.enabled
            && (b.from_hour..=b.to_hour).contains(&now.hour())
            && m0.temp_in < b.temp_in_max
            && m0.soc > b.soc_min
            && self.gstate.current.today >= self.cfg.battery.capacity_wh;
        let flow = gstate::flow_flags([m0, m1, m2]);
        let dpv = m0.pv - m1.pv;

        let mf = MinuteFlags {
            offline: offline && !burnout,
            burnout,
            distorted: classify::distorted(m0, &[m1, m2]),
            pv_rising: dpv > th.noise,
            pv_falling: dpv < -th.noise,
            grid_upload: flow.grid_upload,
            grid_download: flow.grid_download,
            akku_discharge: flow.akku_discharge,
            emergency: m0.grid > th.emergency || m0.akku > th.emergency,
        };
        if mf.offline != self.minute_flags.offline {
            info!(offline = mf.offline, pv = m0.pv, load = m0.load, "offline state changed");
        }
        if mf.burnout && !self.minute_flags.burnout {
            info!(soc = m0.soc, temp_in = m0.temp_in, "burnout window");
        }
        self.minute_flags = mf;

        let soc6_slot = now.weekday().num_days_from_monday() as usize * HOURS + 6;
        let soc6 = if now.hour() >= 6 {
            self.gstate.week.get(soc6_slot).soc
        } else {
            m0.soc
        };
        let (daily, _) = self.counter.counters.daily();
        let input = gstate::GlobalInputs {
            now,
            minutes: [m0, m1, m2],
            daily,
            soc6,
            forecast: forecaster.forecast(now),
            need_survive: forecaster.survival_need(now, &self.gstate.profile),
            heaters_total: self.heaters_total,
        };
        let g = gstate::compute(&self.cfg, &input);
        debug!(
            today = g.today,
            tomorrow = g.tomorrow,
            success = g.success,
            survive = g.survive,
            heating = g.heating,
            charge_akku = g.charge_akku,
            "global state"
        );
        self.gstate.current = g;
    }

    fn rollup_hour(&mut self, last: DateTime<Tz>, forecaster: &mut dyn Forecaster) {
        let h = PowerSample::average(self.pstate.minutes.iter());
        self.pstate.hours.seek(last.hour() as usize);
        *self.pstate.hours.current_mut() = h;

        let slot = rollup::hour_of_week(&last);
        self.pstate.week.seek(slot);
        *self.pstate.week.current_mut() = h;
        self.gstate.week.seek(slot);
        *self.gstate.week.current_mut() = self.gstate.current;
        self.counter.week.seek(slot);
        *self.counter.week.current_mut() = self.counter.counters.meter;

        let (own, meter) = self.counter.counters.hourly();
        info!(
            hour = last.hour(),
            own_consumed = own.consumed,
            meter_consumed = meter.consumed,
            own_produced = own.produced,
            meter_produced = meter.produced,
            own_pv = own.pv(),
            meter_pv = meter.pv(),
            "hourly counters"
        );
        forecaster.learn(last, own.mppt);
        self.counter.counters.mark_hour();
    }

    fn rollup_day(&mut self, last: DateTime<Tz>) {
        let d = PowerSample::average(self.pstate.hours.iter());
        self.pstate.days.seek(rollup::day_of_week(&last));
        *self.pstate.days.current_mut() = d;

        let (own, _) = self.counter.counters.daily();
        let g = &self.gstate.current;
        let strike = if g.today > 0 {
            own.pv() as i64 * 1000 / g.today as i64
        } else {
            0
        };
        info!(
            day = %last.date_naive(),
            pv = own.pv(),
            consumed = own.consumed,
            produced = own.produced,
            forecast = g.today,
            strike_permille = strike,
            avg_load = d.load,
            "daily summary"
        );

        self.gstate.profile = rollup::load_profile(&self.pstate.week);
        debug!(profile = ?self.gstate.profile, "load profile");
        self.counter.counters.mark_day();
    }

    /// Mirrors the dispatcher's aggregate flags into the current sample.
    pub fn mark_dispatch(&mut self, d: &DispatchState) {
        let f = &mut self.current.flags;
        f.all_up = d.all_up;
        f.all_down = d.all_down;
        f.all_standby = d.all_standby;
        f.check_standby = d.check_standby;
        *self.pstate.seconds.current_mut() = self.current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forecast::StaticForecaster;
    use chrono::{Duration, TimeZone};
    use chrono_tz::Europe::Vienna;
    use rstest::rstest;

    fn reading(grid: i32, pv: i32) -> Reading {
        let ac1 = pv;
        let load = ac1 + grid;
        Reading {
            grid: Some(grid),
            akku: Some(0),
            ac1: Some(ac1),
            ac2: Some(0),
            mppt1: Some(pv),
            p1: Some(grid),
            p2: Some(0),
            p3: Some(0),
            soc: Some(500),
            temp_in: Some(21.0),
            meter_consumed: Some(1000 + load as u64 / 100),
            ..Default::default()
        }
    }

    #[test]
    fn test_stability_after_unchanged_grid() {
        let mut c = Collector::new(Arc::new(Config::default()));
        let mut f = StaticForecaster::new(20000, 20000);
        let t0 = Vienna.with_ymd_and_hms(2026, 3, 10, 12, 0, 10).unwrap();
        for i in 0..4 {
            c.tick(t0 + chrono::Duration::seconds(i), &reading(-300, 3000), &mut f);
        }
        assert!(c.current.flags.valid);
        assert!(c.current.flags.stable);
        assert_eq!(c.current.load, -2700);

        c.tick(t0 + chrono::Duration::seconds(4), &reading(200, 3000), &mut f);
        assert!(!c.current.flags.stable);
    }

    #[test]
    fn test_minute_rollup_and_offline() {
        let mut c = Collector::new(Arc::new(Config::default()));
        let mut f = StaticForecaster::new(20000, 20000);
        let t0 = Vienna.with_ymd_and_hms(2026, 3, 10, 21, 0, 0).unwrap();
        for i in 0..(3 * 60 + 1) {
            c.tick(t0 + chrono::Duration::seconds(i), &reading(400, 0), &mut f);
        }
        assert_eq!(c.last_minute().grid, 400);
        assert!(c.current.flags.offline);
        assert!(!c.current.flags.burnout);
    }

    #[test]
    fn test_emergency_after_three_seconds() {
        let mut c = Collector::new(Arc::new(Config::default()));
        let mut f = StaticForecaster::new(20000, 20000);
        let t0 = Vienna.with_ymd_and_hms(2026, 3, 10, 12, 0, 10).unwrap();
        c.tick(t0, &reading(2500, 0), &mut f);
        c.tick(t0 + chrono::Duration::seconds(1), &reading(2500, 0), &mut f);
        assert!(!c.current.flags.emergency);
        c.tick(t0 + chrono::Duration::seconds(2), &reading(2500, 0), &mut f);
        assert!(c.current.flags.emergency);
    }

    #[test]
    fn test_hour_rollup_feeds_week_history() {
        let mut c = Collector::new(Arc::new(Config::default()));
        let mut f = StaticForecaster::new(20000, 20000);
        let t0 = Vienna.with_ymd_and_hms(2026, 3, 10, 10, 59, 58).unwrap();
        for i in 0..3 {
            c.tick(t0 + chrono::Duration::seconds(i), &reading(-300, 3000), &mut f);
        }
        let slot = rollup::hour_of_week(&t0);
        assert_eq!(c.gstate.week.cursor(), slot);
        assert_eq!(c.counter.week.get(slot).consumed, c.counter.counters.meter.consumed);
    }

    #[test]
    fn test_rejected_reading_degrades_only_its_cycle() {
        let mut c = Collector::new(Arc::new(Config::default()));
        let mut f = StaticForecaster::new(20000, 20000);
        let t0 = Vienna.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let mut valid = Vec::new();
        for i in 0..60 {
            let mut r = reading(-300, 3000);
            if i == 2 {
                r.p1 = Some(3200);
            }
            c.tick(t0 + Duration::seconds(i), &r, &mut f);
            valid.push(c.current.flags.valid);
        }
        assert_eq!(valid[..5], [true, true, false, true, true]);
        assert!(valid[5..].iter().all(|&v| v));

        let replaced = c.pstate.seconds.get(2);
        assert_eq!(replaced.p1, -300);
        assert!(replaced.flags.distorted);
        assert!(!replaced.flags.valid);

        c.tick(t0 + Duration::seconds(60), &reading(-300, 3000), &mut f);
        assert_eq!(c.last_minute().p1, -300);
        assert_eq!(c.last_minute().grid, -300);
    }

    #[rstest]
    #[case(15.0, 500, true)]
    #[case(21.0, 500, false)]
    #[case(15.0, 100, false)]
    fn test_cold_morning_offline_becomes_burnout(
        #[case] temp_in: f32,
        #[case] soc: i32,
        #[case] burnout: bool,
    ) {
        let mut c = Collector::new(Arc::new(Config::default()));
        let mut f = StaticForecaster::new(20000, 20000);
        let t0 = Vienna.with_ymd_and_hms(2026, 3, 10, 6, 0, 0).unwrap();
        let r = Reading {
            temp_in: Some(temp_in),
            soc: Some(soc),
            ..reading(400, 0)
        };
        for i in 0..(2 * 60 + 1) {
            c.tick(t0 + Duration::seconds(i), &r, &mut f);
        }
        assert!(c.global().today >= Config::default().battery.capacity_wh);
        assert_eq!(c.current.flags.burnout, burnout);
        assert_eq!(c.current.flags.offline, !burnout);
    }
}
