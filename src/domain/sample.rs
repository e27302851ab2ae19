use serde::{Deserialize, Serialize};

/// A partial raw reading as delivered by a telemetry provider.
///
/// Every field is optional; absent fields keep their last-known value when
/// merged into the shared reading.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub grid: Option<i32>,
    pub akku: Option<i32>,
    pub ac1: Option<i32>,
    pub ac2: Option<i32>,
    pub dc1: Option<i32>,
    pub dc2: Option<i32>,
    pub mppt1: Option<i32>,
    pub mppt2: Option<i32>,
    pub mppt3: Option<i32>,
    pub mppt4: Option<i32>,
    pub p1: Option<i32>,
    pub p2: Option<i32>,
    pub p3: Option<i32>,
    pub v1: Option<i32>,
    pub v2: Option<i32>,
    pub v3: Option<i32>,
    pub f: Option<i32>,
    /// Battery state of charge in per-mille.
    pub soc: Option<i32>,
    pub inv1: Option<InverterStatus>,
    pub inv2: Option<InverterStatus>,
    pub temp_in: Option<f32>,
    pub temp_out: Option<f32>,
    /// Cumulative meter registers in Wh.
    pub meter_consumed: Option<u64>,
    pub meter_produced: Option<u64>,
    pub meter_mppt: Option<[u64; 4]>,
}

macro_rules! merge_fields {
    ($dst:ident, $src:ident, $($field:ident),+ $(,)?) => {
        $( if $src.$field.is_some() { $dst.$field = $src.$field; } )+
    };
}

impl Reading {
    /// Overwrites every field that is present in `update`.
    pub fn merge(&mut self, update: &Reading) {
        merge_fields!(
            self, update, grid, akku, ac1, ac2, dc1, dc2, mppt1, mppt2, mppt3, mppt4, p1, p2, p3,
            v1, v2, v3, f, soc, inv1, inv2, temp_in, temp_out, meter_consumed, meter_produced,
            meter_mppt,
        );
    }
}

/// Operating status reported by an inverter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InverterStatus {
    #[default]
    Unknown,
    Sleeping,
    Starting,
    Mppt,
    Throttled,
    Fault,
}

impl InverterStatus {
    /// Anything but normal tracking or an idle night state is abnormal.
    pub fn is_abnormal(self) -> bool {
        matches!(self, InverterStatus::Fault | InverterStatus::Throttled)
    }
}

/// Named classifications of a sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleFlags {
    pub valid: bool,
    pub stable: bool,
    pub distorted: bool,
    pub delta: bool,
    pub pv_rising: bool,
    pub pv_falling: bool,
    pub check_standby: bool,
    pub all_up: bool,
    pub all_down: bool,
    pub all_standby: bool,
    pub offline: bool,
    pub burnout: bool,
    pub emergency: bool,
    pub grid_upload: bool,
    pub grid_download: bool,
    pub akku_discharge: bool,
    pub summer: bool,
    pub winter: bool,
}

impl SampleFlags {
    /// Combines flags of an aggregated period. Conditions that are only
    /// meaningful when present for the whole period are AND-ed.
    fn fold(self, other: SampleFlags) -> SampleFlags {
        SampleFlags {
            valid: self.valid && other.valid,
            stable: self.stable && other.stable,
            distorted: self.distorted || other.distorted,
            delta: self.delta || other.delta,
            pv_rising: self.pv_rising || other.pv_rising,
            pv_falling: self.pv_falling || other.pv_falling,
            check_standby: self.check_standby || other.check_standby,
            all_up: self.all_up && other.all_up,
            all_down: self.all_down && other.all_down,
            all_standby: self.all_standby && other.all_standby,
            offline: self.offline && other.offline,
            burnout: self.burnout || other.burnout,
            emergency: self.emergency || other.emergency,
            grid_upload: self.grid_upload || other.grid_upload,
            grid_download: self.grid_download || other.grid_download,
            akku_discharge: self.akku_discharge || other.akku_discharge,
            summer: self.summer || other.summer,
            winter: self.winter || other.winter,
        }
    }

    fn all_set() -> SampleFlags {
        SampleFlags {
            valid: true,
            stable: true,
            all_up: true,
            all_down: true,
            all_standby: true,
            offline: true,
            ..SampleFlags::default()
        }
    }
}

/// One second's snapshot of the installation. Power values in W, positive
/// grid means import, positive akku means discharge, load is negative while
/// the house consumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerSample {
    pub pv: i32,
    pub grid: i32,
    pub akku: i32,
    pub ac1: i32,
    pub ac2: i32,
    pub dc1: i32,
    pub dc2: i32,
    pub mppt1: i32,
    pub mppt2: i32,
    pub mppt3: i32,
    pub mppt4: i32,
    pub p1: i32,
    pub p2: i32,
    pub p3: i32,
    pub v1: i32,
    pub v2: i32,
    pub v3: i32,
    pub f: i32,
    pub soc: i32,
    pub load: i32,
    pub dpv: i32,
    pub dgrid: i32,
    pub dload: i32,
    pub sdpv: i32,
    pub sdgrid: i32,
    pub sdload: i32,
    pub temp_in: f32,
    pub temp_out: f32,
    pub flags: SampleFlags,
}

macro_rules! sum_fields {
    ($acc:ident, $s:ident, $($field:ident),+ $(,)?) => {
        $( $acc.$field += $s.$field as i64; )+
    };
}

macro_rules! div_fields {
    ($out:ident, $acc:ident, $n:ident, $($field:ident),+ $(,)?) => {
        $( $out.$field = ($acc.$field / $n) as i32; )+
    };
}

#[derive(Default)]
struct Sums {
    pv: i64,
    grid: i64,
    akku: i64,
    ac1: i64,
    ac2: i64,
    dc1: i64,
    dc2: i64,
    mppt1: i64,
    mppt2: i64,
    mppt3: i64,
    mppt4: i64,
    p1: i64,
    p2: i64,
    p3: i64,
    v1: i64,
    v2: i64,
    v3: i64,
    f: i64,
    soc: i64,
    load: i64,
    dpv: i64,
    dgrid: i64,
    dload: i64,
    sdpv: i64,
    sdgrid: i64,
    sdload: i64,
}

impl PowerSample {
    /// Arithmetic mean of a period. Returns a zeroed sample for an empty input.
    pub fn average<'a>(samples: impl IntoIterator<Item = &'a PowerSample>) -> PowerSample {
        let mut acc = Sums::default();
        let mut tin = 0.0f64;
        let mut tout = 0.0f64;
        let mut flags = SampleFlags::all_set();
        let mut n = 0i64;

        for s in samples {
            sum_fields!(
                acc, s, pv, grid, akku, ac1, ac2, dc1, dc2, mppt1, mppt2, mppt3, mppt4, p1, p2,
                p3, v1, v2, v3, f, soc, load, dpv, dgrid, dload, sdpv, sdgrid, sdload,
            );
            tin += s.temp_in as f64;
            tout += s.temp_out as f64;
            flags = flags.fold(s.flags);
            n += 1;
        }

        if n == 0 {
            return PowerSample::default();
        }

        let mut out = PowerSample::default();
        div_fields!(
            out, acc, n, pv, grid, akku, ac1, ac2, dc1, dc2, mppt1, mppt2, mppt3, mppt4, p1, p2,
            p3, v1, v2, v3, f, soc, load, dpv, dgrid, dload, sdpv, sdgrid, sdload,
        );
        out.temp_in = (tin / n as f64) as f32;
        out.temp_out = (tout / n as f64) as f32;
        out.flags = flags;
        out
    }

    pub fn mppt(&self) -> [i32; 4] {
        [self.mppt1, self.mppt2, self.mppt3, self.mppt4]
    }

    pub fn phase_sum(&self) -> i32 {
        self.p1 + self.p2 + self.p3
    }

    pub fn akku_charging(&self, noise: i32) -> bool {
        self.akku < -noise
    }

    pub fn akku_discharging(&self, noise: i32) -> bool {
        self.akku > noise
    }
}
