//! Minutely GlobalState and strategy flags.

use chrono::{DateTime, Datelike, Timelike, Weekday};
use chrono_tz::Tz;

use crate::config::{BatteryConfig, Config, HeatingConfig};
use crate::domain::{ratio_offset, Counter, GlobalState, PowerSample, Season};
use crate::forecast::ForecastSummary;

/// Everything the minutely computation reads besides configuration.
pub struct GlobalInputs<'a> {
    pub now: DateTime<Tz>,
    /// The three most recent minutes, newest first.
    pub minutes: [&'a PowerSample; 3],
    pub daily: Counter,
    /// State of charge recorded at 06:00 today.
    pub soc6: i32,
    pub forecast: ForecastSummary,
    pub need_survive: i32,
    /// Summed rated power of relay heaters.
    pub heaters_total: i32,
}

/// Staged direction flags over the last three minutes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowFlags {
    pub grid_upload: bool,
    pub grid_download: bool,
    pub akku_discharge: bool,
}

fn staged(values: [i32; 3]) -> bool {
    let [m0, m1, m2] = values;
    (m0 > 50 && m1 > 50 && m2 > 50) || (m0 > 75 && m1 > 75) || m0 > 100
}

pub fn flow_flags(minutes: [&PowerSample; 3]) -> FlowFlags {
    FlowFlags {
        grid_upload: staged(minutes.map(|m| -m.grid)),
        grid_download: staged(minutes.map(|m| m.grid)),
        akku_discharge: staged(minutes.map(|m| m.akku)),
    }
}

pub fn akku_available(battery: &BatteryConfig, soc: i32) -> i32 {
    let usable = (soc - battery.min_soc).max(0) as i64;
    (battery.capacity_wh as i64 * usable / 1000) as i32
}

pub fn heating_enabled(h: &HeatingConfig, now: &DateTime<Tz>, tin: f32, tout: f32) -> bool {
    let month = now.month();
    let hour = now.hour();
    let summer = Season::of_month(month).is_summer();

    // forced windows win over the temperature rules
    match month {
        5 | 9 if hour >= 16 && tin < h.off_in + 1.0 => return true,
        4 | 10 if hour >= 14 && tin < h.off_in + 1.0 => return true,
        11 | 12 | 1 | 2 | 3 if tin < h.winter_on_below => return true,
        _ => {}
    }

    if summer && tin > h.summer_off_in {
        return false;
    }
    if !summer && tin > h.off_in && tout > h.off_out {
        return false;
    }
    tin <= h.hard_off_in
}

pub fn charge_akku_needed(
    battery: &BatteryConfig,
    now: &DateTime<Tz>,
    g: &GlobalState,
    soc6: i32,
) -> bool {
    let season = g.season;
    let empty = g.soc < battery.reserve_soc;
    let critical = g.survive < 0;
    let weekend = matches!(now.weekday(), Weekday::Fri | Weekday::Sat)
        && g.soc < 500
        && !season.is_summer();
    if empty || critical || weekend || season.is_winter() {
        return true;
    }

    let window = (9..16).contains(&now.hour());
    if season.is_summer() {
        window && soc6 < 222
    } else {
        window && (soc6 < 333 || g.tomorrow < battery.capacity_wh * 2)
    }
}

/// Recomputes the GlobalState from the latest minutes and forecasts.
pub fn compute(cfg: &Config, input: &GlobalInputs<'_>) -> GlobalState {
    let th = &cfg.thresholds;
    let [m0, m1, m2] = input.minutes;
    let season = Season::of_month(input.now.month());
    let minimum = th.minimum(season.is_winter());

    let mut g = GlobalState {
        season,
        soc: m0.soc,
        consumed: input.daily.consumed as i32,
        produced: input.daily.produced as i32,
        pv: input.daily.pv() as i32,
        today: input.forecast.today,
        tomorrow: input.forecast.tomorrow,
        sod: input.forecast.sod,
        eod: input.forecast.eod,
        need_survive: input.need_survive,
        ..GlobalState::default()
    };

    g.akku = akku_available(&cfg.battery, g.soc);

    let akku = (m0.akku + m1.akku + m2.akku) / 3;
    let load = -(m0.load + m1.load + m2.load) / 3;
    let drain = akku.max(load);
    g.ttl = if drain > 0 && g.soc > cfg.battery.min_soc {
        g.akku * 60 / drain
    } else {
        0
    };

    g.success = if g.sod > minimum && g.pv > th.noise {
        ratio_offset(g.pv as i64, g.sod as i64)
    } else {
        0
    };

    let tocharge = (g.need_survive - g.akku).max(0);
    let available = if g.sod == 0 {
        0
    } else {
        (g.eod - tocharge).max(0)
    };
    g.survive = ratio_offset((available + g.akku) as i64, g.need_survive as i64);

    g.need_heating = g.need_survive + input.heaters_total * cfg.heating.hours;
    g.heating = ratio_offset((available + g.akku) as i64, g.need_heating as i64);

    g.heating_enabled = heating_enabled(&cfg.heating, &input.now, m0.temp_in, m0.temp_out);
    g.charge_akku = charge_akku_needed(&cfg.battery, &input.now, &g, input.soc6);
    g
}
