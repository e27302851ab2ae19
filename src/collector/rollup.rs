use chrono::{DateTime, Datelike, Timelike};
use chrono_tz::Tz;

use super::ring::RingBuffer;
use crate::domain::PowerSample;

pub const SECONDS: usize = 60;
pub const MINUTES: usize = 60;
pub const HOURS: usize = 24;
pub const DAYS: usize = 7;
pub const HOURS_OF_WEEK: usize = HOURS * DAYS;

/// Which period boundaries were crossed between two ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rollover {
    pub minute: bool,
    pub hour: bool,
    pub day: bool,
}

impl Rollover {
    pub fn any(&self) -> bool {
        self.minute || self.hour || self.day
    }
}

pub fn rollover(last: Option<DateTime<Tz>>, now: DateTime<Tz>) -> Rollover {
    let Some(last) = last else {
        return Rollover::default();
    };
    let day = last.date_naive() != now.date_naive();
    let hour = day || last.hour() != now.hour();
    let minute = hour || last.timestamp() / 60 != now.timestamp() / 60;
    Rollover { minute, hour, day }
}

/// Slot in the per-hour-of-week arrays, Monday 00:00 is zero.
pub fn hour_of_week(t: &DateTime<Tz>) -> usize {
    t.weekday().num_days_from_monday() as usize * HOURS + t.hour() as usize
}

pub fn day_of_week(t: &DateTime<Tz>) -> usize {
    t.weekday().num_days_from_monday() as usize
}

/// Mean of all slots. The summed-delta fields carry the value accumulated
/// at the last slot instead of a mean.
pub fn aggregate(ring: &RingBuffer<PowerSample>, last_slot: usize) -> PowerSample {
    let mut out = PowerSample::average(ring.iter());
    let last = ring.get(last_slot);
    out.sdpv = last.sdpv;
    out.sdgrid = last.sdgrid;
    out.sdload = last.sdload;
    out
}

/// Average consumption per hour of day over the whole week, in W.
pub fn load_profile(week: &RingBuffer<PowerSample>) -> [i32; 24] {
    let mut profile = [0i32; 24];
    for (h, slot) in profile.iter_mut().enumerate() {
        let sum: i64 = (0..DAYS)
            .map(|d| -week.get(d * HOURS + h).load as i64)
            .sum();
        *slot = (sum / DAYS as i64).max(0) as i32;
    }
    profile
}
