//! One decision per control cycle.
//!
//! Priority: emergency, burnout, lock, response confirmation, standby
//! probe, ramp, steal. Commands are collected in an outbox and sent by the
//! caller after the controller state is released.

use chrono::{DateTime, Timelike};
use chrono_tz::Tz;
use std::cmp::Reverse;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::program;
use crate::config::{Config, Thresholds};
use crate::domain::{
    Action, Actuation, BatteryCommand, Command, Device, DeviceState, DispatchState, GlobalState,
    PowerSample, Program, ProgramKind, RampContext, RampOutcome,
};
use crate::error::ControlError;

/// Result of an administrative override request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideOutcome {
    Started,
    /// An override is already running, the request is ignored.
    AlreadyActive,
    Unknown,
    Disabled,
}

/// What a cycle decides on.
#[derive(Debug, Clone, Copy)]
pub struct Inputs<'a> {
    pub now: DateTime<Tz>,
    pub sample: &'a PowerSample,
    pub global: &'a GlobalState,
}

impl<'a> Inputs<'a> {
    pub fn new(now: DateTime<Tz>, sample: &'a PowerSample, global: &'a GlobalState) -> Self {
        Self { now, sample, global }
    }

    fn context<'c>(
        &self,
        cfg: &'c Config,
        charge_limit: i32,
        other_ramped: bool,
        forced: bool,
    ) -> RampContext<'c> {
        let s = self.sample;
        let winter = s.flags.winter;
        RampContext {
            thresholds: &cfg.thresholds,
            now: self.now.timestamp(),
            hour: self.now.hour(),
            winter,
            offline: s.flags.offline,
            distorted: s.flags.distorted,
            heating_enabled: self.global.heating_enabled,
            charge_akku: self.global.charge_akku,
            grid_upload: s.flags.grid_upload,
            soc: s.soc,
            pv: s.pv,
            minimum: cfg.thresholds.minimum(winter),
            phases: [s.p1, s.p2, s.p3],
            other_ramped,
            forced,
            charge_limit,
        }
    }
}

/// Power the devices should change by: inverted grid flow net of battery
/// discharge, zero inside the dead band.
pub fn ramp_power(th: &Thresholds, s: &PowerSample) -> i32 {
    let mut ramp = -s.grid;
    if s.akku_discharging(th.noise) {
        ramp -= s.akku;
    }

    let idle = if s.akku_charging(th.noise) {
        ramp.abs() <= th.deadband_high
    } else {
        -th.deadband_high <= ramp && ramp < -th.deadband_low
    };
    if idle {
        return 0;
    }

    // react faster on falling production
    if ramp < 0 && s.flags.pv_falling {
        ramp += ramp / 2;
    }
    ramp
}

fn filtered(v: i32, noise: i32) -> i32 {
    if v.abs() <= noise {
        0
    } else {
        v
    }
}

pub struct Dispatcher {
    cfg: Arc<Config>,
    pub devices: Vec<Device>,
    program: Option<Program>,
    pub state: DispatchState,
    /// Admin selected program, kept until the next day.
    pinned: bool,
    charge_limit: i32,
    burnout_until: Option<i64>,
    outbox: Vec<Actuation>,
}

impl Dispatcher {
    pub fn new(cfg: Arc<Config>, devices: Vec<Device>) -> Self {
        Self {
            cfg,
            devices,
            program: None,
            state: DispatchState::default(),
            pinned: false,
            charge_limit: 0,
            burnout_until: None,
            outbox: Vec::new(),
        }
    }

    pub fn program(&self) -> Option<ProgramKind> {
        self.program.as_ref().map(|p| p.kind)
    }

    /// Device names in current priority order.
    pub fn priority(&self) -> Vec<&str> {
        self.order()
            .into_iter()
            .map(|i| self.devices[i].name.as_str())
            .collect()
    }

    pub fn device(&self, name: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.name == name)
    }

    pub fn charge_limit(&self) -> i32 {
        self.charge_limit
    }

    /// Commands produced since the last call.
    pub fn take_outbox(&mut self) -> Vec<Actuation> {
        std::mem::take(&mut self.outbox)
    }

    fn order(&self) -> Vec<usize> {
        self.program
            .as_ref()
            .map(|p| p.order.clone())
            .unwrap_or_else(|| (0..self.devices.len()).collect())
    }

    fn battery_index(&self) -> Option<usize> {
        self.devices.iter().position(|d| d.is_battery())
    }

    fn push(&mut self, idx: usize, command: Command) {
        self.outbox.push(Actuation {
            device: self.devices[idx].name.clone(),
            command,
        });
    }

    fn apply(&mut self, idx: usize, out: RampOutcome) {
        if let Some(command) = out.command {
            self.push(idx, command);
        }
    }

    /// Applies an outcome of the regular ramp walk: the command is queued,
    /// the lock extended and the pending confirmation handed to this device.
    fn record(&mut self, idx: usize, out: RampOutcome) {
        self.apply(idx, out);
        self.state.lock = self.state.lock.max(out.lock);
        if out.expect_response {
            match self.state.pending {
                Some(prev) if prev != idx => {
                    self.state.pending_offset += self.devices[prev].delta;
                    self.devices[prev].delta = 0;
                }
                Some(_) => {}
                None => self.state.pending_offset = 0,
            }
            self.state.pending = Some(idx);
        }
    }

    fn clear_pending(&mut self) {
        if let Some(p) = self.state.pending.take() {
            self.devices[p].delta = 0;
        }
    }

    fn battery_mode(&mut self, mode: DeviceState, limit: i32) {
        let Some(b) = self.battery_index() else {
            return;
        };
        if self.devices[b].state == DeviceState::Disabled {
            return;
        }
        if let Some(command) = self.devices[b].battery_mode(mode, limit) {
            info!(device = %self.devices[b].name, mode = %mode, limit, "battery mode");
            self.push(b, command);
        }
    }

    /// Ramps every automatic non-battery device to zero.
    fn all_down(&mut self, i: &Inputs<'_>, skip_overridden: bool) {
        let cfg = self.cfg.clone();
        let ctx = i.context(&cfg, self.charge_limit, false, true);
        for idx in 0..self.devices.len() {
            let d = &mut self.devices[idx];
            if d.is_battery() || d.power <= 0 || (skip_overridden && d.is_overridden()) {
                continue;
            }
            let total = d.total;
            let out = d.ramp(-total, &ctx);
            d.delta = 0;
            self.apply(idx, out);
        }
    }

    /// Activates `kind`. Re-selecting the active program does nothing.
    pub fn select_program(&mut self, kind: ProgramKind, i: &Inputs<'_>) -> bool {
        if self.program() == Some(kind) {
            return false;
        }
        let registry: Vec<String> = self.devices.iter().map(|d| d.name.clone()).collect();
        let program = Program::resolve(kind, &self.cfg.programs, &registry);
        let names: Vec<&str> = program.order.iter().map(|&o| registry[o].as_str()).collect();
        info!(program = %kind, order = ?names, "program selected");
        self.program = Some(program);

        // start from a known state
        self.all_down(i, true);
        self.clear_pending();
        self.state.lock = self.cfg.thresholds.wait_response;
        true
    }

    /// Admin selection, kept until the next day rollover.
    pub fn pin_program(&mut self, kind: ProgramKind, i: &Inputs<'_>) -> bool {
        self.pinned = true;
        self.select_program(kind, i)
    }

    pub fn override_device(&mut self, name: &str, seconds: u64, i: &Inputs<'_>) -> OverrideOutcome {
        let Some(idx) = self.devices.iter().position(|d| d.name == name) else {
            return OverrideOutcome::Unknown;
        };
        let cfg = self.cfg.clone();
        let ctx = i.context(&cfg, self.charge_limit, false, true);
        let d = &mut self.devices[idx];
        if d.state == DeviceState::Disabled {
            return OverrideOutcome::Disabled;
        }
        if d.is_overridden() {
            info!(device = %d.name, "override already active, ignored");
            return OverrideOutcome::AlreadyActive;
        }

        d.override_until = Some(i.now.timestamp() + seconds as i64);
        info!(device = %d.name, seconds, "override started");
        if d.is_battery() {
            if let Some(command) = d.battery_mode(DeviceState::Charge, 0) {
                self.push(idx, command);
            }
        } else {
            if d.state != DeviceState::Active {
                d.transition(DeviceState::Active);
            }
            let total = d.total;
            let out = d.ramp(total, &ctx);
            d.delta = 0;
            self.apply(idx, out);
        }
        if self.state.pending == Some(idx) {
            self.state.pending = None;
        }
        OverrideOutcome::Started
    }

    fn check_overrides(&mut self, i: &Inputs<'_>) {
        let ts = i.now.timestamp();
        let cfg = self.cfg.clone();
        let ctx = i.context(&cfg, self.charge_limit, false, true);
        for idx in 0..self.devices.len() {
            let d = &mut self.devices[idx];
            match d.override_until {
                Some(until) if ts >= until => d.override_until = None,
                _ => continue,
            }
            info!(device = %d.name, "override expired");
            if d.is_battery() {
                if let Some(command) = d.battery_mode(DeviceState::Standby, 0) {
                    self.push(idx, command);
                }
            } else {
                let total = d.total;
                let out = d.ramp(-total, &ctx);
                d.delta = 0;
                self.apply(idx, out);
            }
            if self.state.pending == Some(idx) {
                self.state.pending = None;
            }
        }
    }

    fn update_aggregates(&mut self, i: &Inputs<'_>) {
        let th = &self.cfg.thresholds;
        let s = i.sample;

        let mut any = false;
        let mut any_full = false;
        let mut all_up = true;
        let mut all_down = true;
        let mut all_standby = true;
        let mut xload = 0;
        for d in self
            .devices
            .iter()
            .filter(|d| !d.is_battery() && d.state != DeviceState::Disabled)
        {
            any = true;
            xload += d.load;
            if d.power > 0 {
                all_down = false;
            }
            if d.is_full() {
                any_full = true;
            } else if d.state != DeviceState::Standby {
                all_up = false;
            }
            if d.state != DeviceState::Standby {
                all_standby = false;
            }
        }

        let st = &mut self.state;
        st.all_up = any && all_up && any_full;
        st.all_down = any && all_down;
        st.all_standby = any && all_standby;
        st.xload = xload;
        let observed = (-s.load - th.baseload(s.flags.winter)).max(0);
        st.dxload = if xload > 0 { observed * 100 / xload } else { 100 };
        st.charge_akku = i.global.charge_akku;
    }

    /// Runs one control cycle. `Err` means the cycle was skipped for the
    /// given reason.
    pub fn cycle(&mut self, i: &Inputs<'_>) -> Result<Action, ControlError> {
        self.check_overrides(i);
        if let Some(b) = self.battery_index() {
            self.devices[b].observe_battery(i.sample.akku);
        }
        self.update_aggregates(i);
        self.state.ramp = ramp_power(&self.cfg.thresholds, i.sample);

        let result = self.decide(i);
        self.state.action = match result {
            Ok(action) => action,
            Err(_) => Action::Idle,
        };
        if let Ok(action) = result {
            if !matches!(action, Action::Idle | Action::Locked) {
                debug!(
                    action = %action,
                    ramp = self.state.ramp,
                    lock = self.state.lock,
                    xload = self.state.xload,
                    dxload = self.state.dxload,
                    "dispatch"
                );
            }
        }
        result
    }

    fn decide(&mut self, i: &Inputs<'_>) -> Result<Action, ControlError> {
        let s = i.sample;

        if s.flags.emergency {
            self.emergency(i);
            return Ok(Action::Emergency);
        }
        if self.burnout(i) {
            return Ok(Action::Burnout);
        }
        if self.state.lock > 0 {
            self.state.lock -= 1;
            return Ok(Action::Locked);
        }
        if !s.flags.valid {
            return Err(ControlError::TelemetryInvalid(
                "sample failed plausibility checks".to_string(),
            ));
        }
        if self.response(i) {
            return Ok(Action::Response);
        }
        if s.flags.offline {
            return Err(ControlError::TelemetryOffline);
        }
        if self.standby(i) {
            return Ok(Action::Standby);
        }

        let enough = self.cfg.thresholds.enough;
        let ramp = self.state.ramp;
        if ramp < 0 && !self.state.all_down {
            if self.ramp_down(i) {
                return Ok(Action::RampDown);
            }
        } else if ramp > 0
            && !self.state.all_up
            && s.flags.stable
            && !s.flags.pv_falling
            && (!s.flags.distorted || ramp >= enough)
        {
            if self.ramp_up(i) {
                return Ok(Action::RampUp);
            }
        }

        if self.steal(i) {
            return Ok(Action::Steal);
        }
        Ok(Action::Idle)
    }

    fn emergency(&mut self, i: &Inputs<'_>) {
        if self.state.action != Action::Emergency {
            let e = ControlError::EmergencyCondition(format!(
                "grid {} W, akku {} W",
                i.sample.grid, i.sample.akku
            ));
            warn!(error = %e, "curtailing all devices");
        }
        self.battery_mode(DeviceState::Discharge, 0);
        self.all_down(i, false);
        self.clear_pending();
        self.state.lock = self.cfg.thresholds.wait_response;
    }

    /// Early morning battery drain when the forecast guarantees a recharge.
    fn burnout(&mut self, i: &Inputs<'_>) -> bool {
        if !i.sample.flags.burnout || self.burnout_until.is_some() {
            return false;
        }
        let b = self.cfg.burnout.clone();
        info!(soc = i.sample.soc, seconds = b.seconds, devices = ?b.devices, "burnout");
        self.burnout_until = Some(i.now.timestamp() + b.seconds as i64);
        self.battery_mode(DeviceState::Discharge, 0);
        for name in &b.devices {
            self.override_device(name, b.seconds, i);
        }
        self.state.lock = self.cfg.thresholds.wait_response;
        true
    }

    /// Judges the effect of the last commanded delta. Returns true when the
    /// cycle should end here.
    fn response(&mut self, i: &Inputs<'_>) -> bool {
        let Some(idx) = self.state.pending else {
            return false;
        };
        let cfg = self.cfg.clone();
        let th = &cfg.thresholds;
        let s = i.sample;
        let charging = s.akku_charging(th.noise);

        let d = &mut self.devices[idx];
        let delta = d.delta;
        let expected = delta - delta / 3;
        if expected == 0 {
            self.state.pending = None;
            return false;
        }

        // earlier same-cycle steps are part of the observation, so only the
        // sum net of them can confirm a handed-over delta
        let offset = self.state.pending_offset;
        let diffs = [s.p1 - d.phases[0], s.p2 - d.phases[1], s.p3 - d.phases[2]]
            .map(|x| filtered(x, th.noise));
        let sum: i32 = diffs.iter().sum::<i32>() - offset;
        let beyond = |x: i32| if expected > 0 { x >= expected } else { x <= expected };
        let confirmed = (offset == 0 && diffs.iter().any(|&x| beyond(x))) || beyond(sum);
        let checking = d.state == DeviceState::StandbyCheck;

        if confirmed {
            if checking {
                info!(device = %d.name, expected, observed = sum, "standby check negative");
                d.transition(DeviceState::ActiveChecked);
            } else {
                debug!(device = %d.name, expected, observed = ?diffs, "response ok");
            }
            d.noresponse = 0;
            d.delta = 0;
            self.state.pending = None;
            if charging {
                self.state.lock = th.wait_akku;
            }
            return false;
        }

        if checking {
            info!(device = %d.name, expected, observed = sum, "standby check positive, entering standby");
            let ctx = i.context(&cfg, self.charge_limit, false, true);
            let d = &mut self.devices[idx];
            let total = d.total;
            let out = d.ramp(-total, &ctx);
            d.transition(DeviceState::Standby);
            d.delta = 0;
            self.apply(idx, out);
            self.state.pending = None;
            return true;
        }

        // ramping down without visible effect is harmless
        if delta < 0 {
            d.delta = 0;
            self.state.pending = None;
            return false;
        }

        // a charging battery may have absorbed the change
        if charging {
            debug!(device = %d.name, expected, "response absorbed by battery");
            d.delta = 0;
            self.state.pending = None;
            return false;
        }

        d.noresponse += 1;
        info!(
            device = %d.name,
            expected,
            observed = sum,
            noresponse = d.noresponse,
            "no response"
        );
        if d.noresponse >= th.noresponse_limit {
            d.delta = 0;
            self.state.pending = None;
            if d.state == DeviceState::Active {
                self.perform_standby(idx, i);
            }
        }
        true
    }

    /// Reversible ramp that tests whether a device still consumes.
    fn perform_standby(&mut self, idx: usize, i: &Inputs<'_>) -> bool {
        let cfg = self.cfg.clone();
        let ctx = i.context(&cfg, self.charge_limit, false, true);
        let d = &mut self.devices[idx];
        if !d.transition(DeviceState::StandbyCheck) {
            return false;
        }
        let req = if d.is_adjustable() {
            if d.power < 50 {
                500
            } else {
                -500
            }
        } else if d.power > 0 {
            -d.total
        } else {
            d.total
        };
        let out = d.ramp(req, &ctx);
        if !out.acted() {
            d.transition(DeviceState::Active);
            return false;
        }
        info!(device = %d.name, req, power = d.power, "standby probe");
        self.apply(idx, out);
        self.state.lock = out.lock;
        if out.expect_response {
            self.state.pending = Some(idx);
            self.state.pending_offset = 0;
        }
        true
    }

    /// Best probe candidate: adjustable and already unresponsive devices
    /// first, the highest no-response count within a tier.
    fn standby_candidate(&self) -> Option<usize> {
        let eligible = |d: &Device| {
            !d.is_battery() && d.state == DeviceState::Active && d.power > 0 && !d.is_overridden()
        };
        let tiers: [fn(&Device) -> bool; 4] = [
            |d| d.is_adjustable() && d.noresponse > 0,
            |d| d.noresponse > 0,
            |d| d.is_adjustable(),
            |_| true,
        ];
        tiers.iter().find_map(|tier| {
            self.devices
                .iter()
                .enumerate()
                .filter(|(_, d)| eligible(*d) && tier(*d))
                .min_by_key(|(idx, d)| (Reverse(d.noresponse), *idx))
                .map(|(idx, _)| idx)
        })
    }

    fn standby(&mut self, i: &Inputs<'_>) -> bool {
        let th = &self.cfg.thresholds;
        let st = &mut self.state;
        if st.xload > 0 && st.dxload < th.standby_ratio_percent {
            st.low_load_cycles += 1;
        } else {
            st.low_load_cycles = 0;
        }
        st.check_standby = st.low_load_cycles as usize >= th.standby_cycles;
        if !st.check_standby || st.pending.is_some() || !i.sample.flags.stable {
            return false;
        }
        let Some(idx) = self.standby_candidate() else {
            return false;
        };
        info!(
            device = %self.devices[idx].name,
            xload = self.state.xload,
            dxload = self.state.dxload,
            "observed load far below expected"
        );
        self.state.low_load_cycles = 0;
        self.perform_standby(idx, i)
    }

    fn ramp_up(&mut self, i: &Inputs<'_>) -> bool {
        let cfg = self.cfg.clone();
        let th = &cfg.thresholds;
        let mut remaining = self.state.ramp;
        let mut acted = false;
        for idx in self.order() {
            if remaining <= th.noise {
                break;
            }
            let ctx = i.context(&cfg, self.charge_limit, acted, false);
            let out = self.devices[idx].ramp(remaining, &ctx);
            if !out.acted() {
                continue;
            }
            debug!(device = %self.devices[idx].name, req = remaining, delta = out.delta, "ramp up");
            acted = true;
            self.record(idx, out);
            remaining -= out.delta * th.budget_factor_percent / 100;
        }
        acted
    }

    fn ramp_down(&mut self, i: &Inputs<'_>) -> bool {
        let cfg = self.cfg.clone();
        let th = &cfg.thresholds;
        let mut remaining = self.state.ramp;
        let mut acted = false;
        for idx in self.order().into_iter().rev() {
            if remaining >= -th.noise {
                break;
            }
            let ctx = i.context(&cfg, self.charge_limit, acted, false);
            let out = self.devices[idx].ramp(remaining, &ctx);
            if !out.acted() {
                continue;
            }
            debug!(device = %self.devices[idx].name, req = remaining, delta = out.delta, "ramp down");
            acted = true;
            self.record(idx, out);
            remaining -= out.delta * th.budget_factor_percent / 100;
        }
        acted
    }

    /// Moves power from lower to higher priority devices without waiting
    /// for a full ramp cycle. The victims curtail in a following cycle.
    fn steal(&mut self, i: &Inputs<'_>) -> bool {
        let s = i.sample;
        self.state.steal = 0;
        if !s.flags.valid
            || !s.flags.stable
            || s.flags.distorted
            || self.state.pending.is_some()
            || self.state.all_up
        {
            return false;
        }

        let cfg = self.cfg.clone();
        let th = &cfg.thresholds;
        let minimum = th.minimum(s.flags.winter);
        let charging = s.akku_charging(th.noise);
        let order = self.order();

        for (rank, &t) in order.iter().enumerate() {
            let thief = &self.devices[t];
            if thief.is_battery()
                || !thief.state.is_rampable()
                || thief.is_full()
                || thief.is_overridden()
            {
                continue;
            }

            let steal: i32 = order[rank + 1..]
                .iter()
                .map(|&v| {
                    let victim = &self.devices[v];
                    if victim.is_battery() {
                        if charging && -s.akku > minimum {
                            -s.akku * 9 / 10
                        } else {
                            0
                        }
                    } else if victim.state.is_rampable()
                        && victim.load > 0
                        && victim.noresponse == 0
                        && !victim.is_overridden()
                    {
                        victim.load
                    } else {
                        0
                    }
                })
                .sum();

            let base = if thief.is_adjustable() {
                thief.total / 100
            } else {
                thief.total
            };
            let need = (base + base * th.steal_margin_percent / 100).max(thief.min);
            if steal < need {
                continue;
            }

            let ctx = i.context(&cfg, self.charge_limit, false, false);
            let out = self.devices[t].ramp(steal, &ctx);
            if !out.acted() {
                continue;
            }
            info!(device = %self.devices[t].name, steal, need, delta = out.delta, "steal");
            self.apply(t, out);
            // power moves between devices, no visible response expected
            self.devices[t].delta = 0;
            self.clear_pending();
            self.state.steal = steal;
            self.state.lock = if charging { th.wait_akku } else { out.lock };
            return true;
        }
        false
    }

    /// Hourly housekeeping: standby marks expire and no-response counters
    /// restart.
    pub fn hourly(&mut self, i: &Inputs<'_>) {
        for d in self.devices.iter_mut().filter(|d| !d.is_battery()) {
            if matches!(d.state, DeviceState::Standby | DeviceState::ActiveChecked) {
                d.transition(DeviceState::Active);
            }
            d.noresponse = 0;
        }
        if i.sample.flags.offline {
            self.all_down(i, true);
            self.clear_pending();
        }
        debug!(offline = i.sample.flags.offline, "hourly housekeeping");
    }

    /// Minutely housekeeping: charge limit, battery discharge and program
    /// re-evaluation.
    pub fn minutely(&mut self, i: &Inputs<'_>) {
        let cfg = self.cfg.clone();
        let b = &cfg.battery;
        let s = i.sample;
        let g = i.global;

        self.charge_limit = if g.season.is_summer() || g.today > 3 * b.capacity_wh {
            b.charge_max_w / 4
        } else if g.today > 2 * b.capacity_wh {
            b.charge_max_w / 2
        } else {
            0
        };

        if s.flags.offline || s.flags.grid_download {
            // stay above the winter reserve to avoid forced charging from grid
            if s.flags.winter && s.soc < 70 {
                self.battery_mode(DeviceState::Standby, 0);
            } else {
                let limit = if g.survive < 0 {
                    cfg.thresholds.baseload(s.flags.winter)
                } else {
                    0
                };
                self.battery_mode(DeviceState::Discharge, limit);
            }
        }

        if s.flags.offline {
            self.state.low_load_cycles = 0;
            self.clear_pending();
        }

        if !self.pinned {
            let kind = program::select(&cfg, g, s.soc);
            self.select_program(kind, i);
        }
    }

    pub fn daily(&mut self) {
        self.pinned = false;
        self.burnout_until = None;
    }

    /// Aligns the battery state with the measured flow after startup and
    /// resends the matching mode so inverter and registry agree.
    pub fn init_battery(&mut self, s: &PowerSample) {
        let noise = self.cfg.thresholds.noise;
        let Some(b) = self.battery_index() else {
            return;
        };
        let d = &mut self.devices[b];
        if d.state == DeviceState::Disabled {
            return;
        }
        d.observe_battery(s.akku);
        if s.akku_charging(noise) {
            d.transition(DeviceState::Charge);
        } else if s.akku_discharging(noise) {
            d.transition(DeviceState::Discharge);
        }
        let command = match d.state {
            DeviceState::Charge => BatteryCommand::Charge {
                limit: self.charge_limit,
            },
            DeviceState::Discharge => BatteryCommand::Discharge { limit: 0 },
            _ => BatteryCommand::Standby,
        };
        info!(device = %d.name, state = %d.state, "battery initialized");
        self.push(b, Command::Battery(command));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::domain::DeviceKind;
    use crate::hardware::DeviceFactory;
    use chrono::TimeZone;
    use chrono_tz::Europe::Vienna;
    use proptest::prelude::*;

    fn config(devices: Vec<DeviceConfig>) -> Arc<Config> {
        let mut cfg = Config::default();
        cfg.programs.boilers = devices.iter().map(|d| d.name.clone()).collect();
        cfg.devices = devices;
        Arc::new(cfg)
    }

    fn dispatcher(devices: Vec<DeviceConfig>) -> Dispatcher {
        let cfg = config(devices);
        let fleet = DeviceFactory::default().build(&cfg.devices);
        let mut d = Dispatcher::new(cfg, fleet.devices);
        let s = PowerSample::default();
        let g = GlobalState::default();
        d.select_program(ProgramKind::Boilers, &Inputs::new(now(), &s, &g));
        d.state.lock = 0;
        d.take_outbox();
        d
    }

    fn boilers() -> Vec<DeviceConfig> {
        vec![
            DeviceConfig::new("boiler1", DeviceKind::Percentage, 2000),
            DeviceConfig::new("boiler2", DeviceKind::Percentage, 2000),
        ]
    }

    fn now() -> DateTime<Tz> {
        Vienna.with_ymd_and_hms(2026, 4, 10, 12, 0, 0).unwrap()
    }

    fn sample(grid: i32) -> PowerSample {
        let mut s = PowerSample {
            pv: 3000,
            grid,
            ac1: 3000,
            load: -(3000 + grid),
            soc: 500,
            p1: grid,
            ..Default::default()
        };
        s.flags.valid = true;
        s.flags.stable = true;
        s
    }

    fn heating() -> GlobalState {
        GlobalState {
            heating_enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_ramp_power_deadband() {
        let th = Thresholds::default();
        assert_eq!(ramp_power(&th, &sample(-500)), 500);
        assert_eq!(ramp_power(&th, &sample(-30)), 0);
        assert_eq!(ramp_power(&th, &sample(20)), 0);
        assert_eq!(ramp_power(&th, &sample(21)), -21);
        assert_eq!(ramp_power(&th, &sample(-36)), 36);

        let mut falling = sample(400);
        falling.flags.pv_falling = true;
        assert_eq!(ramp_power(&th, &falling), -600);

        let mut discharging = sample(0);
        discharging.akku = 800;
        assert_eq!(ramp_power(&th, &discharging), -800);
    }

    #[test]
    fn test_surplus_carries_to_next_device() {
        let mut d = dispatcher(boilers());
        let s = sample(-500);
        let g = GlobalState::default();
        let action = d.cycle(&Inputs::new(now(), &s, &g)).unwrap();

        assert_eq!(action, Action::RampUp);
        assert_eq!(d.state.ramp, 500);
        assert_eq!(d.devices[0].power, 5);
        assert_eq!(d.devices[1].power, 5);
        assert_eq!(d.state.pending, Some(1));
        assert_eq!(d.devices[0].delta, 0);
        assert_eq!(d.state.lock, Config::default().thresholds.wait_thermostat);
        let out = d.take_outbox();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].command, Command::Percent { percent: 5 });
    }

    #[test]
    fn test_lock_blocks_ramp() {
        let mut d = dispatcher(boilers());
        d.state.lock = 2;
        let s = sample(-500);
        let g = GlobalState::default();
        assert_eq!(d.cycle(&Inputs::new(now(), &s, &g)).unwrap(), Action::Locked);
        assert_eq!(d.state.lock, 1);
        assert!(d.take_outbox().is_empty());
    }

    #[test]
    fn test_invalid_sample_is_skipped() {
        let mut d = dispatcher(boilers());
        let mut s = sample(-500);
        s.flags.valid = false;
        let g = GlobalState::default();
        let err = d.cycle(&Inputs::new(now(), &s, &g)).unwrap_err();
        assert!(matches!(err, ControlError::TelemetryInvalid(_)));
        assert_eq!(d.devices[0].power, 0);
    }

    #[test]
    fn test_inconclusive_response_leads_to_standby_probe() {
        let mut d = dispatcher(vec![DeviceConfig::new("heater", DeviceKind::OnOff, 1000)]);
        let g = heating();
        let s = sample(-1500);
        d.cycle(&Inputs::new(now(), &s, &g)).unwrap();
        assert_eq!(d.devices[0].power, 100);
        assert_eq!(d.devices[0].delta, 1000);
        d.state.lock = 0;

        // the grid shows only 50 W of the commanded 1000 W
        let s = sample(-1450);
        let limit = Config::default().thresholds.noresponse_limit;
        for n in 1..limit {
            assert_eq!(d.cycle(&Inputs::new(now(), &s, &g)).unwrap(), Action::Response);
            assert_eq!(d.devices[0].noresponse, n);
            assert_eq!(d.devices[0].state, DeviceState::Active);
        }
        d.take_outbox();
        d.cycle(&Inputs::new(now(), &s, &g)).unwrap();
        assert_eq!(d.devices[0].state, DeviceState::StandbyCheck);
        assert_eq!(d.devices[0].power, 0);
        assert_eq!(d.take_outbox()[0].command, Command::Switch { on: false });

        // still no change after the probe: the device is dead weight
        d.state.lock = 0;
        d.cycle(&Inputs::new(now(), &s, &g)).unwrap();
        assert_eq!(d.devices[0].state, DeviceState::Standby);
    }

    #[test]
    fn test_confirmed_response_resets_counter() {
        let mut d = dispatcher(vec![DeviceConfig::new("heater", DeviceKind::OnOff, 1000)]);
        let g = heating();
        d.cycle(&Inputs::new(now(), &sample(-1500), &g)).unwrap();
        d.devices[0].noresponse = 3;
        d.state.lock = 0;
        let s = sample(-520);
        d.cycle(&Inputs::new(now(), &s, &g)).unwrap();
        assert_eq!(d.devices[0].noresponse, 0);
        assert_eq!(d.state.pending, None);
    }

    #[test]
    fn test_reselecting_program_is_noop() {
        let mut d = dispatcher(boilers());
        let s = sample(-500);
        let g = GlobalState::default();
        d.cycle(&Inputs::new(now(), &s, &g)).unwrap();
        d.take_outbox();
        let lock = d.state.lock;

        assert!(!d.select_program(ProgramKind::Boilers, &Inputs::new(now(), &s, &g)));
        assert!(d.take_outbox().is_empty());
        assert_eq!(d.state.lock, lock);
        assert_eq!(d.devices[0].power, 5);

        assert!(d.select_program(ProgramKind::Modest, &Inputs::new(now(), &s, &g)));
        assert_eq!(d.devices[0].power, 0);
        assert_eq!(d.state.lock, Config::default().thresholds.wait_response);
    }

    #[test]
    fn test_emergency_bypasses_lock() {
        let mut cfgs = boilers();
        cfgs.insert(0, DeviceConfig::new("akku", DeviceKind::Battery, 4500));
        let mut d = dispatcher(cfgs);
        d.devices[1].power = 50;
        d.devices[1].load = 1000;
        d.state.lock = 5;
        let mut s = sample(2500);
        s.flags.emergency = true;
        let g = GlobalState::default();
        assert_eq!(d.cycle(&Inputs::new(now(), &s, &g)).unwrap(), Action::Emergency);
        assert_eq!(d.devices[1].power, 0);
        assert_eq!(d.devices[0].state, DeviceState::Discharge);
        let out = d.take_outbox();
        assert!(out.contains(&Actuation {
            device: "akku".into(),
            command: Command::Battery(BatteryCommand::Discharge { limit: 0 }),
        }));
    }

    #[test]
    fn test_override_is_not_extended() {
        let mut d = dispatcher(boilers());
        let s = sample(0);
        let g = GlobalState::default();
        let i = Inputs::new(now(), &s, &g);
        assert_eq!(d.override_device("boiler2", 600, &i), OverrideOutcome::Started);
        assert_eq!(d.devices[1].power, 100);
        let until = d.devices[1].override_until;
        assert_eq!(d.override_device("boiler2", 3600, &i), OverrideOutcome::AlreadyActive);
        assert_eq!(d.devices[1].override_until, until);
        assert_eq!(d.override_device("nope", 60, &i), OverrideOutcome::Unknown);

        // expires and switches back off
        let later = now() + chrono::Duration::seconds(601);
        d.cycle(&Inputs::new(later, &s, &g)).ok();
        assert_eq!(d.devices[1].override_until, None);
        assert_eq!(d.devices[1].power, 0);
    }

    #[test]
    fn test_steal_from_lower_priority() {
        let mut d = dispatcher(vec![
            DeviceConfig::new("heater", DeviceKind::OnOff, 1000),
            DeviceConfig::new("boiler1", DeviceKind::Percentage, 2000),
        ]);
        d.devices[1].power = 80;
        d.devices[1].load = 1600;
        let s = sample(0);
        let g = heating();
        assert_eq!(d.cycle(&Inputs::new(now(), &s, &g)).unwrap(), Action::Steal);
        assert_eq!(d.devices[0].power, 100);
        assert_eq!(d.state.steal, 1600);
        assert_eq!(d.state.pending, None);
    }

    #[test]
    fn test_hourly_reactivates_standby() {
        let mut d = dispatcher(boilers());
        d.devices[0].state = DeviceState::Standby;
        d.devices[1].state = DeviceState::ActiveChecked;
        d.devices[1].noresponse = 4;
        let s = sample(0);
        let g = GlobalState::default();
        d.hourly(&Inputs::new(now(), &s, &g));
        assert_eq!(d.devices[0].state, DeviceState::Active);
        assert_eq!(d.devices[1].state, DeviceState::Active);
        assert_eq!(d.devices[1].noresponse, 0);
    }

    #[test]
    fn test_init_battery_follows_measured_flow() {
        let mut d = dispatcher(vec![DeviceConfig::new("akku", DeviceKind::Battery, 4500)]);
        let mut s = sample(0);
        s.akku = -1200;
        d.init_battery(&s);
        assert_eq!(d.devices[0].state, DeviceState::Charge);
        assert_eq!(d.devices[0].load, 1200);
        let out = d.take_outbox();
        assert_eq!(
            out[0].command,
            Command::Battery(BatteryCommand::Charge { limit: 0 })
        );
    }

    #[test]
    fn test_standby_candidate_prefers_adjustable_unresponsive() {
        let mut d = dispatcher(vec![
            DeviceConfig::new("heater", DeviceKind::OnOff, 1000),
            DeviceConfig::new("boiler1", DeviceKind::Percentage, 2000),
            DeviceConfig::new("boiler2", DeviceKind::Percentage, 2000),
        ]);
        for dev in d.devices.iter_mut() {
            dev.power = 100;
        }
        assert_eq!(d.standby_candidate(), Some(1));
        d.devices[0].noresponse = 2;
        assert_eq!(d.standby_candidate(), Some(0));
        d.devices[2].noresponse = 1;
        assert_eq!(d.standby_candidate(), Some(2));
    }

    #[test]
    fn test_handed_over_delta_is_judged_net_of_earlier_steps() {
        let mut d = dispatcher(boilers());
        let g = GlobalState::default();
        d.cycle(&Inputs::new(now(), &sample(-500), &g)).unwrap();
        assert_eq!(d.state.pending, Some(1));
        assert_eq!(d.state.pending_offset, 100);
        d.state.lock = 0;

        // only boiler1 shows up on the phases
        let s = sample(-400);
        assert_eq!(d.cycle(&Inputs::new(now(), &s, &g)).unwrap(), Action::Response);
        assert_eq!(d.devices[1].noresponse, 1);
        assert_eq!(d.state.pending, Some(1));

        // both steps visible
        d.state.lock = 0;
        let s = sample(-300);
        d.cycle(&Inputs::new(now(), &s, &g)).unwrap();
        assert_eq!(d.devices[1].noresponse, 0);
    }

    #[test]
    fn test_burnout_overrides_heaters_once_per_day() {
        let mut d = dispatcher(vec![
            DeviceConfig::new("akku", DeviceKind::Battery, 4500),
            DeviceConfig::new("kitchen", DeviceKind::OnOff, 450),
            DeviceConfig::new("living", DeviceKind::OnOff, 450),
            DeviceConfig::new("boiler1", DeviceKind::Percentage, 2000),
        ]);
        d.state.lock = 5;
        let mut s = sample(400);
        s.flags.burnout = true;
        let g = GlobalState::default();

        assert_eq!(d.cycle(&Inputs::new(now(), &s, &g)).unwrap(), Action::Burnout);
        assert_eq!(d.devices[0].state, DeviceState::Discharge);
        assert_eq!(d.devices[1].power, 100);
        assert_eq!(d.devices[2].power, 100);
        assert!(d.devices[1].is_overridden());
        assert_eq!(d.devices[3].power, 0);
        assert_eq!(d.state.lock, Config::default().thresholds.wait_response);
        let out = d.take_outbox();
        assert!(out.contains(&Actuation {
            device: "akku".into(),
            command: Command::Battery(BatteryCommand::Discharge { limit: 0 }),
        }));
        assert!(out.contains(&Actuation {
            device: "living".into(),
            command: Command::Switch { on: true },
        }));

        let later = now() + chrono::Duration::seconds(1);
        assert_eq!(d.cycle(&Inputs::new(later, &s, &g)).unwrap(), Action::Locked);

        d.daily();
        assert_eq!(d.cycle(&Inputs::new(later, &s, &g)).unwrap(), Action::Burnout);
    }

    /// Boiler at half power while the phases show almost nothing.
    fn idle_boiler() -> (Dispatcher, PowerSample) {
        let mut d = dispatcher(vec![DeviceConfig::new("boiler1", DeviceKind::Percentage, 2000)]);
        d.devices[0].power = 50;
        d.devices[0].load = 1000;
        let mut s = PowerSample {
            pv: 300,
            ac1: 300,
            load: -300,
            soc: 500,
            ..Default::default()
        };
        s.flags.valid = true;
        s.flags.stable = true;
        (d, s)
    }

    #[test]
    fn test_low_observed_load_starts_standby_probe() {
        let (mut d, s) = idle_boiler();
        let g = GlobalState::default();
        let cycles = Config::default().thresholds.standby_cycles;
        for _ in 1..cycles {
            assert_eq!(d.cycle(&Inputs::new(now(), &s, &g)).unwrap(), Action::Idle);
            assert!(!d.state.check_standby);
        }
        assert_eq!(d.state.dxload, 10);

        assert_eq!(d.cycle(&Inputs::new(now(), &s, &g)).unwrap(), Action::Standby);
        assert!(d.state.check_standby);
        assert_eq!(d.state.low_load_cycles, 0);
        assert_eq!(d.devices[0].state, DeviceState::StandbyCheck);
        assert_eq!(d.devices[0].power, 25);
        assert_eq!(d.devices[0].delta, -500);
        assert_eq!(d.state.pending, Some(0));
        assert_eq!(d.take_outbox()[0].command, Command::Percent { percent: 25 });
    }

    #[test]
    fn test_visible_probe_marks_device_active_checked() {
        let (mut d, s) = idle_boiler();
        let g = GlobalState::default();
        for _ in 0..Config::default().thresholds.standby_cycles {
            d.cycle(&Inputs::new(now(), &s, &g)).unwrap();
        }
        assert_eq!(d.devices[0].state, DeviceState::StandbyCheck);
        d.devices[0].noresponse = 2;
        d.state.lock = 0;

        // the probe removed 400 W from the phase
        let mut after = s;
        after.pv = 700;
        after.ac1 = 700;
        after.grid = -400;
        after.p1 = -400;
        d.cycle(&Inputs::new(now(), &after, &g)).unwrap();
        assert_eq!(d.devices[0].state, DeviceState::ActiveChecked);
        assert_eq!(d.devices[0].noresponse, 0);
        assert_ne!(d.devices[0].delta, -500);
    }

    fn arb_state() -> impl Strategy<Value = DeviceState> {
        prop_oneof![
            Just(DeviceState::Active),
            Just(DeviceState::Standby),
            Just(DeviceState::StandbyCheck),
            Just(DeviceState::ActiveChecked),
            Just(DeviceState::Disabled),
        ]
    }

    proptest! {
        #[test]
        fn test_all_up_and_all_down_exclusive(
            devices in prop::collection::vec((0i32..=100, arb_state()), 1..6),
            grid in -3000i32..3000,
        ) {
            let cfgs = (0..devices.len())
                .map(|n| DeviceConfig::new(&format!("d{n}"), DeviceKind::Percentage, 1000))
                .collect();
            let mut d = dispatcher(cfgs);
            for (dev, (power, state)) in d.devices.iter_mut().zip(&devices) {
                dev.power = *power;
                dev.load = power * 10;
                dev.state = *state;
            }
            let s = sample(grid);
            let g = GlobalState::default();
            let _ = d.cycle(&Inputs::new(now(), &s, &g));
            let enabled = d.devices.iter().any(|x| x.state != DeviceState::Disabled);
            prop_assert!(!(enabled && d.state.all_up && d.state.all_down));
        }
    }
}
