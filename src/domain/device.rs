use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::{debug, warn};

use crate::config::Thresholds;

/// Device family. Selects the ramp behaviour and the command encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeviceKind {
    /// Relay switched load, full power or nothing.
    OnOff,
    /// Load driven in percent of its rated power.
    Percentage,
    /// Battery storage with charge/discharge/standby modes.
    Battery,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum DeviceState {
    /// Permanently excluded, e.g. no actuation address.
    Disabled,
    #[default]
    Active,
    Charge,
    Discharge,
    Standby,
    StandbyCheck,
    ActiveChecked,
}

impl DeviceState {
    pub fn can_transition_to(self, next: DeviceState) -> bool {
        use DeviceState::*;
        if self == next || next == Disabled {
            return true;
        }
        matches!(
            (self, next),
            (Active, StandbyCheck)
                | (Active, Standby)
                | (StandbyCheck, ActiveChecked)
                | (StandbyCheck, Standby)
                | (StandbyCheck, Active)
                | (ActiveChecked, Active)
                | (ActiveChecked, Standby)
                | (Standby, Active)
                | (Charge, Discharge)
                | (Charge, Standby)
                | (Discharge, Charge)
                | (Discharge, Standby)
                | (Standby, Charge)
                | (Standby, Discharge)
        )
    }

    /// Participates in ramping.
    pub fn is_rampable(self) -> bool {
        matches!(
            self,
            DeviceState::Active
                | DeviceState::ActiveChecked
                | DeviceState::StandbyCheck
                | DeviceState::Charge
                | DeviceState::Discharge
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatteryCommand {
    Charge { limit: i32 },
    Discharge { limit: i32 },
    Standby,
}

/// Native command of a device family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Switch { on: bool },
    Percent { percent: i32 },
    Battery(BatteryCommand),
}

/// A command addressed to a named device, queued for sending after the
/// control state is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actuation {
    pub device: String,
    pub command: Command,
}

/// Inputs a device needs to decide how to follow a ramp request.
#[derive(Debug, Clone, Copy)]
pub struct RampContext<'a> {
    pub thresholds: &'a Thresholds,
    pub now: i64,
    pub hour: u32,
    pub winter: bool,
    pub offline: bool,
    pub distorted: bool,
    pub heating_enabled: bool,
    pub charge_akku: bool,
    pub grid_upload: bool,
    pub soc: i32,
    pub pv: i32,
    pub minimum: i32,
    pub phases: [i32; 3],
    /// Another device already took action in this cycle.
    pub other_ramped: bool,
    /// Bypass automatic restrictions (override, emergency, standby probe).
    pub forced: bool,
    pub charge_limit: i32,
}

/// Result of a ramp request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RampOutcome {
    /// Expected change of consumption in W.
    pub delta: i32,
    /// Cycles to wait before judging the effect.
    pub lock: u32,
    pub command: Option<Command>,
    /// Whether the delta shows up on the grid phases and can be confirmed.
    pub expect_response: bool,
}

impl RampOutcome {
    pub fn acted(&self) -> bool {
        self.delta != 0 || self.command.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    pub kind: DeviceKind,
    /// Rated power in W.
    pub total: i32,
    /// Minimum power in W the device can be started with.
    pub min: i32,
    /// Allowed hours `[from, to)` outside winter.
    pub window: Option<(u32, u32)>,
    pub state: DeviceState,
    /// Power level in percent of `total`.
    pub power: i32,
    /// Last commanded, not yet confirmed delta.
    pub delta: i32,
    /// Expected consumption in W.
    pub load: i32,
    /// Phase powers when the last command was issued.
    pub phases: [i32; 3],
    pub noresponse: u32,
    pub override_until: Option<i64>,
}

impl Device {
    pub fn new(name: impl Into<String>, kind: DeviceKind, total: i32, min: i32) -> Self {
        let state = match kind {
            DeviceKind::Battery => DeviceState::Standby,
            _ => DeviceState::Active,
        };
        Self {
            name: name.into(),
            kind,
            total,
            min,
            window: None,
            state,
            power: 0,
            delta: 0,
            load: 0,
            phases: [0; 3],
            noresponse: 0,
            override_until: None,
        }
    }

    pub fn with_window(mut self, from: u32, to: u32) -> Self {
        self.window = Some((from, to));
        self
    }

    pub fn is_battery(&self) -> bool {
        self.kind == DeviceKind::Battery
    }

    pub fn is_adjustable(&self) -> bool {
        self.kind == DeviceKind::Percentage
    }

    pub fn is_full(&self) -> bool {
        self.power >= 100
    }

    pub fn is_overridden(&self) -> bool {
        self.override_until.is_some()
    }

    /// Moves to `next` when the lifecycle allows it.
    pub fn transition(&mut self, next: DeviceState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(device = %self.name, from = %self.state, to = %next, "rejected state transition");
            return false;
        }
        if self.state != next {
            debug!(device = %self.name, from = %self.state, to = %next, "state transition");
        }
        self.state = next;
        true
    }

    /// Tracks the measured battery flow. Positive `akku` is discharge.
    pub fn observe_battery(&mut self, akku: i32) {
        self.load = -akku;
        self.power = if self.total > 0 {
            (self.load * 100 / self.total).clamp(-100, 100)
        } else {
            0
        };
    }

    /// Requests a change of consumption by `req` W. Returns what the device
    /// did; nothing happens when the request cannot be followed.
    pub fn ramp(&mut self, req: i32, ctx: &RampContext<'_>) -> RampOutcome {
        let rampable =
            self.state.is_rampable() || (self.is_battery() && self.state == DeviceState::Standby);
        if req == 0 || !rampable {
            return RampOutcome::default();
        }
        if self.is_overridden() && !ctx.forced {
            return RampOutcome::default();
        }
        let outcome = match self.kind {
            DeviceKind::OnOff => self.ramp_switch(req, ctx),
            DeviceKind::Percentage => self.ramp_percent(req, ctx),
            DeviceKind::Battery => self.ramp_battery(req, ctx),
        };
        if outcome.expect_response {
            self.delta = outcome.delta;
            self.phases = ctx.phases;
        }
        outcome
    }

    fn outside_window(&self, ctx: &RampContext<'_>) -> bool {
        match self.window {
            Some((from, to)) if !ctx.winter => ctx.hour < from || ctx.hour >= to,
            _ => false,
        }
    }

    fn ramp_switch(&mut self, req: i32, ctx: &RampContext<'_>) -> RampOutcome {
        if req > 0 && !ctx.forced && self.power == 0 {
            if !ctx.heating_enabled || self.outside_window(ctx) {
                self.transition(DeviceState::Standby);
                return RampOutcome::default();
            }
        }

        // keep on when on, keep off when off
        if (req > 0 && self.power > 0) || (req < 0 && self.power == 0) {
            return RampOutcome::default();
        }

        let min = if !ctx.forced && self.min > 0 { self.min } else { self.total };
        if req > 0 && req < min {
            return RampOutcome::default();
        }

        let on = req > 0;
        self.power = if on { 100 } else { 0 };
        self.load = if on { self.total } else { 0 };
        debug!(device = %self.name, on, "switching");
        RampOutcome {
            delta: if on { self.total } else { -self.total },
            lock: ctx.thresholds.wait_response,
            command: Some(Command::Switch { on }),
            expect_response: true,
        }
    }

    fn ramp_percent(&mut self, req: i32, ctx: &RampContext<'_>) -> RampOutcome {
        if self.total <= 0 || (self.power >= 100 && req > 0) || (self.power <= 0 && req < 0) {
            return RampOutcome::default();
        }

        if self.power == 0 && req > 0 && !ctx.forced && self.outside_window(ctx) {
            self.transition(DeviceState::Standby);
            return RampOutcome::default();
        }

        // electronic thermostats need a minimum to start up
        if !ctx.forced && self.power == 0 && req < self.min {
            return RampOutcome::default();
        }

        let mut step = req * 100 / self.total;
        if req < 0 && req < step * self.total / 100 {
            step -= 1;
        }

        let cap = if ctx.forced {
            100
        } else {
            let base = if self.power < 5 {
                ctx.thresholds.startup_step_percent
            } else {
                ctx.thresholds.max_step_percent
            };
            if ctx.distorted {
                (base / 2).max(1)
            } else {
                base
            }
        };
        let step = step.clamp(-cap, cap);
        if step == 0 {
            return RampOutcome::default();
        }

        let floor = if self.min > 0 && !ctx.forced && !ctx.offline {
            self.min * 100 / self.total
        } else {
            0
        };
        let power = (self.power + step).clamp(floor.min(100), 100);
        if power == self.power {
            return RampOutcome::default();
        }

        let lock = if self.power == 0 {
            ctx.thresholds.wait_thermostat
        } else {
            ctx.thresholds.wait_response
        };
        let delta = (power - self.power) * self.total / 100;
        debug!(device = %self.name, from = self.power, to = power, "stepping");
        self.power = power;
        self.load = power * self.total / 100;
        RampOutcome {
            delta,
            lock,
            command: Some(Command::Percent { percent: power }),
            expect_response: true,
        }
    }

    /// The battery follows surplus on its own while charging, so most ramps
    /// are bookkeeping only. Only starting a charge is an actual command.
    fn ramp_battery(&mut self, req: i32, ctx: &RampContext<'_>) -> RampOutcome {
        let charging = self.state == DeviceState::Charge && self.load > ctx.thresholds.noise;

        if req < 0 {
            if !charging || self.load < ctx.minimum {
                return RampOutcome::default();
            }
            return RampOutcome {
                delta: req.max(-self.load),
                ..RampOutcome::default()
            };
        }

        if ctx.soc >= 1000 {
            if self.state != DeviceState::Standby && self.transition(DeviceState::Standby) {
                return RampOutcome {
                    command: Some(Command::Battery(BatteryCommand::Standby)),
                    ..RampOutcome::default()
                };
            }
            return RampOutcome::default();
        }

        if (self.state == DeviceState::Charge && ctx.grid_upload) || self.power > 90 {
            return RampOutcome::default();
        }

        if charging {
            let mut max = ctx.pv.min(self.total);
            if ctx.charge_limit > 0 {
                max = max.min(ctx.charge_limit);
            }
            let remain = (max - self.load).max(0);
            let delta = if self.load < ctx.minimum {
                ctx.minimum
            } else {
                req.min(remain)
            };
            return RampOutcome {
                delta,
                ..RampOutcome::default()
            };
        }

        if ctx.other_ramped || !ctx.charge_akku {
            return RampOutcome::default();
        }

        match self.battery_mode(DeviceState::Charge, ctx.charge_limit) {
            Some(command) => RampOutcome {
                delta: req,
                lock: ctx.thresholds.wait_start_charge,
                command: Some(command),
                expect_response: false,
            },
            None => RampOutcome::default(),
        }
    }

    /// Switches the battery mode. Returns the command to send, or `None`
    /// when the battery already is in that mode.
    pub fn battery_mode(&mut self, mode: DeviceState, limit: i32) -> Option<Command> {
        if !self.is_battery() || self.state == mode || !self.transition(mode) {
            return None;
        }
        let command = match mode {
            DeviceState::Charge => BatteryCommand::Charge { limit },
            DeviceState::Discharge => BatteryCommand::Discharge { limit },
            _ => BatteryCommand::Standby,
        };
        debug!(device = %self.name, mode = %mode, limit, "battery mode");
        Some(Command::Battery(command))
    }
}
