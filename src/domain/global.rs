use serde::{Deserialize, Serialize};

/// Ratios are stored as per-mille offsets from 100 %: 0 means exactly
/// enough, negative is a deficit, capped at +1000.
pub const RATIO_CAP: i32 = 1000;

/// Converts `have / need` into a per-mille offset from 100 %.
pub fn ratio_offset(have: i64, need: i64) -> i32 {
    if need <= 0 {
        return RATIO_CAP;
    }
    let permille = have * 1000 / need - 1000;
    permille.clamp(-1000, RATIO_CAP as i64) as i32
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Season {
    Summer,
    Winter,
    #[default]
    Transition,
}

impl Season {
    /// Summer is May to August, winter November to January.
    pub fn of_month(month: u32) -> Season {
        match month {
            5..=8 => Season::Summer,
            11 | 12 | 1 => Season::Winter,
            _ => Season::Transition,
        }
    }

    pub fn is_summer(self) -> bool {
        self == Season::Summer
    }

    pub fn is_winter(self) -> bool {
        self == Season::Winter
    }
}

/// Daily and periodic summary. Energy values in Wh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalState {
    pub produced: i32,
    pub consumed: i32,
    pub pv: i32,
    pub today: i32,
    pub tomorrow: i32,
    /// Forecast already elapsed today (start of day).
    pub sod: i32,
    /// Forecast remaining today (end of day).
    pub eod: i32,
    pub need_survive: i32,
    pub need_heating: i32,
    /// Usable battery energy above minimum state of charge.
    pub akku: i32,
    pub soc: i32,
    /// Minutes the battery lasts at current discharge.
    pub ttl: i32,
    pub success: i32,
    pub survive: i32,
    pub heating: i32,
    pub season: Season,
    pub heating_enabled: bool,
    pub charge_akku: bool,
}
