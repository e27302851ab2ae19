use serde::{Deserialize, Serialize};

/// Monotonic energy totals in Wh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub consumed: u64,
    pub produced: u64,
    pub mppt: [u64; 4],
}

fn delta(now: u64, base: u64) -> u64 {
    if now == 0 || base == 0 {
        return 0;
    }
    now.saturating_sub(base)
}

impl Counter {
    /// Field-wise `self - base`. A field is only computed when both sides
    /// are nonzero, so a missing baseline never reports the full total.
    pub fn since(&self, base: &Counter) -> Counter {
        Counter {
            consumed: delta(self.consumed, base.consumed),
            produced: delta(self.produced, base.produced),
            mppt: [
                delta(self.mppt[0], base.mppt[0]),
                delta(self.mppt[1], base.mppt[1]),
                delta(self.mppt[2], base.mppt[2]),
                delta(self.mppt[3], base.mppt[3]),
            ],
        }
    }

    pub fn pv(&self) -> u64 {
        self.mppt.iter().sum()
    }
}

/// Locally integrated energy in watt-seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Integrator {
    consumed_ws: u64,
    produced_ws: u64,
    mppt_ws: [u64; 4],
}

impl Integrator {
    /// Adds one second of power. Grid import counts as consumed, export as
    /// produced. Negative string values are ignored.
    pub fn add_second(&mut self, grid: i32, mppt: [i32; 4]) {
        if grid > 0 {
            self.consumed_ws += grid as u64;
        } else {
            self.produced_ws += grid.unsigned_abs() as u64;
        }
        for (acc, p) in self.mppt_ws.iter_mut().zip(mppt) {
            if p > 0 {
                *acc += p as u64;
            }
        }
    }

    pub fn counter(&self) -> Counter {
        Counter {
            consumed: self.consumed_ws / 3600,
            produced: self.produced_ws / 3600,
            mppt: self.mppt_ws.map(|ws| ws / 3600),
        }
    }
}

/// Self-integrated and meter-reported counters with their baselines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub own: Integrator,
    pub meter: Counter,
    pub own_daily_base: Counter,
    pub meter_daily_base: Counter,
    pub own_hourly_base: Counter,
    pub meter_hourly_base: Counter,
}

impl Counters {
    pub fn daily(&self) -> (Counter, Counter) {
        (
            self.own.counter().since(&self.own_daily_base),
            self.meter.since(&self.meter_daily_base),
        )
    }

    pub fn hourly(&self) -> (Counter, Counter) {
        (
            self.own.counter().since(&self.own_hourly_base),
            self.meter.since(&self.meter_hourly_base),
        )
    }

    pub fn mark_hour(&mut self) {
        self.own_hourly_base = self.own.counter();
        self.meter_hourly_base = self.meter;
    }

    pub fn mark_day(&mut self) {
        self.own_daily_base = self.own.counter();
        self.meter_daily_base = self.meter;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_integrator_whole_hour() {
        let mut i = Integrator::default();
        for _ in 0..3600 {
            i.add_second(1000, [500, 0, 0, 0]);
        }
        let c = i.counter();
        assert_eq!(c.consumed, 1000);
        assert_eq!(c.produced, 0);
        assert_eq!(c.mppt[0], 500);
    }

    #[test]
    fn test_since_requires_both_operands() {
        let now = Counter {
            consumed: 100,
            produced: 0,
            mppt: [50, 0, 0, 0],
        };
        let base = Counter {
            consumed: 0,
            produced: 0,
            mppt: [20, 0, 0, 0],
        };
        let d = now.since(&base);
        assert_eq!(d.consumed, 0);
        assert_eq!(d.mppt[0], 30);
    }

    proptest! {
        #[test]
        fn test_daily_delta_never_negative(steps in prop::collection::vec((-5000i32..5000, 0i32..5000), 1..500)) {
            let mut counters = Counters::default();
            counters.own.add_second(3600, [3600; 4]);
            counters.own.add_second(-3600, [0; 4]);
            counters.mark_day();
            let mut last = counters.daily().0;
            for (grid, pv) in steps {
                counters.own.add_second(grid, [pv, pv / 2, 0, 0]);
                let (own, _) = counters.daily();
                prop_assert!(own.consumed >= last.consumed);
                prop_assert!(own.produced >= last.produced);
                prop_assert!(own.mppt[0] >= last.mppt[0]);
                last = own;
            }
        }
    }
}
