use serde::{Deserialize, Serialize};
use strum::Display;

/// What the dispatcher did in a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Action {
    #[default]
    Idle,
    Emergency,
    Burnout,
    Locked,
    Response,
    Standby,
    RampUp,
    RampDown,
    Steal,
}

/// Per-cycle derived values of the dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchState {
    /// Requested ramp power in W, positive means more consumption.
    pub ramp: i32,
    /// Expected load of all non-battery devices in W.
    pub xload: i32,
    /// Observed load in percent of `xload`.
    pub dxload: i32,
    pub lock: u32,
    pub steal: i32,
    pub all_up: bool,
    pub all_down: bool,
    pub all_standby: bool,
    pub charge_akku: bool,
    pub check_standby: bool,
    /// Consecutive cycles with observed load far below expected.
    pub low_load_cycles: u32,
    /// Registry index of the device with an unconfirmed delta.
    pub pending: Option<usize>,
    /// Deltas of devices ramped earlier in the same cycle as the pending
    /// one. They show up in the same phase observation.
    pub pending_offset: i32,
    pub action: Action,
}
