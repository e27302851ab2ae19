//! Per-second sample construction and plausibility classification.

use crate::config::Thresholds;
use crate::domain::{PowerSample, Reading};
use crate::error::ControlError;

/// Values at or below this are treated as a sleeping MPPT tracker.
const MPPT_SLEEP: i32 = 1;

fn shape(v: i32) -> i32 {
    if v <= MPPT_SLEEP {
        0
    } else {
        v
    }
}

fn filtered(d: i32, noise: i32) -> i32 {
    if d.abs() <= noise {
        0
    } else {
        d
    }
}

/// Builds the current sample from the last-known reading and computes the
/// first differences against `prev`. `first_of_minute` restarts the summed
/// absolute deltas.
pub fn build_sample(
    raw: &Reading,
    prev: &PowerSample,
    th: &Thresholds,
    first_of_minute: bool,
) -> PowerSample {
    let mut s = PowerSample {
        grid: raw.grid.unwrap_or_default(),
        akku: raw.akku.unwrap_or_default(),
        ac1: raw.ac1.unwrap_or_default(),
        ac2: raw.ac2.unwrap_or_default(),
        dc1: raw.dc1.unwrap_or_default(),
        dc2: raw.dc2.unwrap_or_default(),
        mppt1: shape(raw.mppt1.unwrap_or_default()),
        mppt2: shape(raw.mppt2.unwrap_or_default()),
        mppt3: shape(raw.mppt3.unwrap_or_default()),
        mppt4: shape(raw.mppt4.unwrap_or_default()),
        p1: raw.p1.unwrap_or_default(),
        p2: raw.p2.unwrap_or_default(),
        p3: raw.p3.unwrap_or_default(),
        v1: raw.v1.unwrap_or_default(),
        v2: raw.v2.unwrap_or_default(),
        v3: raw.v3.unwrap_or_default(),
        f: raw.f.unwrap_or_default(),
        soc: raw.soc.unwrap_or_default(),
        temp_in: raw.temp_in.unwrap_or_default(),
        temp_out: raw.temp_out.unwrap_or_default(),
        ..PowerSample::default()
    };
    s.pv = s.mppt1 + s.mppt2 + s.mppt3 + s.mppt4;
    s.load = -(s.ac1 + s.ac2 + s.grid);

    s.dpv = filtered(s.pv - prev.pv, th.noise);
    s.dgrid = filtered(s.grid - prev.grid, th.noise);
    s.dload = filtered(s.load - prev.load, th.noise);

    let (sdpv, sdgrid, sdload) = if first_of_minute {
        (0, 0, 0)
    } else {
        (prev.sdpv, prev.sdgrid, prev.sdload)
    };
    s.sdpv = sdpv + s.dpv.abs();
    s.sdgrid = sdgrid + s.dgrid.abs();
    s.sdload = sdload + s.dload.abs();

    let dac = (s.ac1 - prev.ac1).abs().max((s.ac2 - prev.ac2).abs());
    s.flags.delta = s.dgrid != 0 || dac > th.noise;
    s
}

/// Plausibility checks. The first failing check is reported.
pub fn check_validity(
    s: &PowerSample,
    prev: &PowerSample,
    raw: &Reading,
    th: &Thresholds,
    minimum: i32,
) -> Result<(), ControlError> {
    let sum = s.pv + s.grid + s.akku + s.load;
    if sum.abs() > th.suspicious {
        return Err(ControlError::TelemetryInvalid(format!(
            "energy balance off by {sum} W"
        )));
    }

    let psum = s.phase_sum();
    if psum < s.grid - minimum || psum > s.grid + minimum {
        return Err(ControlError::TelemetryInvalid(format!(
            "phase sum {psum} W disagrees with grid {} W",
            s.grid
        )));
    }

    let spikes = [s.p1 - prev.p1, s.p2 - prev.p2, s.p3 - prev.p3];
    if spikes.iter().any(|d| d.abs() > th.spike) {
        return Err(ControlError::TelemetryInvalid(format!(
            "phase spike {spikes:?}"
        )));
    }

    if s.grid < -th.noise && s.akku > th.noise {
        let waste = s.grid.abs().min(s.akku);
        return Err(ControlError::TelemetryInvalid(format!(
            "wasting {waste} W from battery to grid"
        )));
    }

    if s.load >= 0 {
        return Err(ControlError::TelemetryInvalid(format!(
            "non-negative load {} W",
            s.load
        )));
    }

    for status in [raw.inv1, raw.inv2].into_iter().flatten() {
        if status.is_abnormal() {
            return Err(ControlError::TelemetryInvalid(format!(
                "inverter status {status:?}"
            )));
        }
    }

    Ok(())
}

/// Production below the offline threshold for one minute.
pub fn minute_offline(m: &PowerSample, th: &Thresholds, minimum: i32) -> bool {
    if m.pv <= minimum {
        return true;
    }
    let consumption = -m.load;
    consumption > 0 && m.pv * 100 / consumption < th.offline_ratio_percent
}

/// Cloud flicker: the summed absolute PV delta of a minute exceeds its
/// average production.
pub fn distorted(last: &PowerSample, older: &[&PowerSample]) -> bool {
    if last.pv > 0 && last.sdpv > last.pv {
        return true;
    }
    older
        .iter()
        .any(|m| m.pv > 0 && m.sdpv as i64 * 2 > m.pv as i64 * 3)
}
