pub mod dispatcher;
pub mod program;
pub mod ticker;

use anyhow::Result;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collector::{Collector, CounterHistory, GstateHistory, PstateHistory};
use crate::config::{Config, TelemetrySourceKind};
use crate::domain::{
    Actuation, Device, DispatchState, GlobalState, PowerSample, ProgramKind, Reading,
};
use crate::forecast::{self, Forecaster};
use crate::hardware::{
    Actuator, DeviceFactory, Fleet, SimulatedHome, SimulatedLoads, TelemetrySource,
};
use crate::repo::{snapshots, Exporter, SnapshotStore};

pub use dispatcher::{Dispatcher, Inputs, OverrideOutcome};

/// A command bound to the transport that delivers it.
pub type Outgoing = (Arc<dyn Actuator>, Actuation);

/// Write side of the shared last-known reading.
#[derive(Clone, Default)]
pub struct TelemetryHandle {
    reading: Arc<parking_lot::Mutex<Reading>>,
}

impl TelemetryHandle {
    /// Merges a partial reading. Absent fields keep their last value.
    pub fn on_reading(&self, update: &Reading) {
        self.reading.lock().merge(update);
    }

    pub fn snapshot(&self) -> Reading {
        self.reading.lock().clone()
    }
}

/// Everything the admin surface reports about the current cycle.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub sample: PowerSample,
    pub global: GlobalState,
    pub dispatch: DispatchState,
    pub program: Option<ProgramKind>,
    pub priority: Vec<String>,
    pub charge_limit: i32,
}

pub struct Controller {
    cfg: Arc<Config>,
    pub collector: Collector,
    pub dispatcher: Dispatcher,
    forecaster: Box<dyn Forecaster>,
    store: SnapshotStore,
    exporter: Exporter,
    telemetry: TelemetryHandle,
    actuators: HashMap<String, Arc<dyn Actuator>>,
    started: bool,
}

impl Controller {
    pub fn new(
        cfg: Arc<Config>,
        fleet: Fleet,
        mut forecaster: Box<dyn Forecaster>,
        now: DateTime<Tz>,
    ) -> Self {
        let store = SnapshotStore::new(&cfg.controller.state_dir);
        let exporter = Exporter::new(&cfg.controller.run_dir);

        let mut collector = Collector::new(cfg.clone());
        let pstate = load_or_default::<PstateHistory>(&store, snapshots::PSTATE);
        let gstate = load_or_default::<GstateHistory>(&store, snapshots::GSTATE);
        let counter = load_or_default::<CounterHistory>(&store, snapshots::COUNTER);
        collector.restore(pstate, gstate, counter);
        match store.load_bytes(snapshots::FORECAST) {
            Ok(Some(bytes)) => {
                if let Err(e) = forecaster.restore(&bytes) {
                    warn!(error = %e, "forecast state not restored");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "forecast state not loaded"),
        }

        let mut dispatcher = Dispatcher::new(cfg.clone(), fleet.devices);
        let sample = collector.current;
        let global = *collector.global();
        let inputs = Inputs::new(now, &sample, &global);
        dispatcher.select_program(program::select(&cfg, &global, global.soc), &inputs);
        dispatcher.take_outbox();
        dispatcher.state.lock = cfg.controller.startup_lock;

        info!(
            devices = dispatcher.devices.len(),
            program = ?dispatcher.program(),
            lock = dispatcher.state.lock,
            "controller ready"
        );
        Self {
            cfg,
            collector,
            dispatcher,
            forecaster,
            store,
            exporter,
            telemetry: TelemetryHandle::default(),
            actuators: fleet.actuators,
            started: false,
        }
    }

    pub fn telemetry(&self) -> TelemetryHandle {
        self.telemetry.clone()
    }

    /// Runs one control cycle at `now` and returns the commands to send.
    pub fn cycle(&mut self, now: DateTime<Tz>) -> Vec<Outgoing> {
        let raw = self.telemetry.snapshot();
        let roll = self.collector.tick(now, &raw, self.forecaster.as_mut());
        let sample = self.collector.current;
        let global = *self.collector.global();
        let inputs = Inputs::new(now, &sample, &global);

        if !self.started {
            self.dispatcher.init_battery(&sample);
            self.started = true;
        }
        if roll.day {
            self.dispatcher.daily();
            self.persist();
        }
        if roll.hour {
            self.dispatcher.hourly(&inputs);
            self.export_hourly();
        }
        if roll.minute {
            self.dispatcher.minutely(&inputs);
            self.export_minutely();
        }

        if let Err(e) = self.dispatcher.cycle(&inputs) {
            debug!(error = %e, "dispatch skipped");
        }
        self.collector.mark_dispatch(&self.dispatcher.state);
        self.drain()
    }

    /// Pending commands bound to their transports.
    pub fn drain(&mut self) -> Vec<Outgoing> {
        self.dispatcher
            .take_outbox()
            .into_iter()
            .filter_map(|a| match self.actuators.get(&a.device) {
                Some(actuator) => Some((actuator.clone(), a)),
                None => {
                    debug!(device = %a.device, "no transport, command dropped");
                    None
                }
            })
            .collect()
    }

    fn inputs_now(&self) -> (DateTime<Tz>, PowerSample, GlobalState) {
        let now = Utc::now().with_timezone(&self.cfg.controller.timezone);
        (now, self.collector.current, *self.collector.global())
    }

    pub fn override_device(&mut self, name: &str, seconds: u64) -> OverrideOutcome {
        let (now, sample, global) = self.inputs_now();
        self.dispatcher
            .override_device(name, seconds, &Inputs::new(now, &sample, &global))
    }

    /// Admin program selection, kept until the next day.
    pub fn select_program(&mut self, kind: ProgramKind) -> bool {
        let (now, sample, global) = self.inputs_now();
        self.dispatcher
            .pin_program(kind, &Inputs::new(now, &sample, &global))
    }

    pub fn status(&self) -> Status {
        Status {
            sample: self.collector.current,
            global: *self.collector.global(),
            dispatch: self.dispatcher.state,
            program: self.dispatcher.program(),
            priority: self
                .dispatcher
                .priority()
                .into_iter()
                .map(str::to_string)
                .collect(),
            charge_limit: self.dispatcher.charge_limit(),
        }
    }

    pub fn devices(&self) -> &[Device] {
        &self.dispatcher.devices
    }

    /// Writes all history snapshots. Failures are logged.
    pub fn persist(&self) {
        let results = [
            self.store.save(snapshots::PSTATE, &self.collector.pstate),
            self.store.save(snapshots::GSTATE, &self.collector.gstate),
            self.store.save(snapshots::COUNTER, &self.collector.counter),
            self.forecaster
                .state()
                .and_then(|bytes| self.store.save_bytes(snapshots::FORECAST, &bytes)),
        ];
        let failed = results.iter().filter(|r| r.is_err()).count();
        for e in results.into_iter().filter_map(Result::err) {
            warn!(error = %e, "snapshot not written");
        }
        if failed == 0 {
            info!(dir = %self.store.dir().display(), "state persisted");
        }
    }

    fn export_minutely(&self) {
        self.exporter.json("pstate.json", &self.collector.current);
        self.exporter.json("gstate.json", self.collector.global());
        self.exporter.json("dstate.json", &self.dispatcher.state);
        self.exporter.json("devices.json", &self.dispatcher.devices);
    }

    fn export_hourly(&self) {
        let p = &self.collector.pstate;
        self.exporter.samples("pstate-minutes.csv", p.minutes.as_slice());
        self.exporter.samples("pstate-hours.csv", p.hours.as_slice());
        self.exporter
            .gstates("gstate-week.csv", self.collector.gstate.week.as_slice());
    }
}

fn load_or_default<T>(store: &SnapshotStore, name: &str) -> T
where
    T: serde::de::DeserializeOwned + Default,
{
    match store.load(name) {
        Ok(Some(v)) => v,
        Ok(None) => {
            info!(file = name, "no snapshot, starting with empty history");
            T::default()
        }
        Err(e) => {
            warn!(file = name, error = %e, "snapshot not loaded, starting with empty history");
            T::default()
        }
    }
}

/// Sends commands concurrently. Failures surface as missing responses in
/// a later cycle, nothing is retried here.
pub async fn send_all(out: Vec<Outgoing>) {
    let sends = out.iter().map(|(actuator, a)| async move {
        if let Err(e) = actuator.send(&a.command).await {
            warn!(device = %a.device, error = %e, "actuation failed");
        }
    });
    join_all(sends).await;
}

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub controller: Arc<Mutex<Controller>>,
    pub telemetry: TelemetryHandle,
    pub cancel: CancellationToken,
}

impl AppState {
    /// Wires the device registry, the forecaster and the telemetry source.
    pub fn new(cfg: Config) -> Result<(Self, Option<Box<dyn TelemetrySource>>)> {
        let cfg = Arc::new(cfg);
        let now = Utc::now().with_timezone(&cfg.controller.timezone);

        let loads = SimulatedLoads::default();
        let fleet = DeviceFactory::new(cfg.controller.hardware_mode)
            .with_loads(loads.clone())
            .build(&cfg.devices);
        let forecaster = forecast::from_config(&cfg.forecast, now);
        let controller = Controller::new(cfg.clone(), fleet, forecaster, now);
        let telemetry = controller.telemetry();

        let source: Option<Box<dyn TelemetrySource>> = match cfg.telemetry.source {
            TelemetrySourceKind::Simulated => Some(Box::new(SimulatedHome::new(&cfg, loads))),
            TelemetrySourceKind::External => None,
        };

        Ok((
            Self {
                cfg,
                controller: Arc::new(Mutex::new(controller)),
                telemetry,
                cancel: CancellationToken::new(),
            },
            source,
        ))
    }
}

/// Starts telemetry ingestion and the control loop. The returned handle
/// completes once the loop has observed cancellation and persisted state.
pub fn spawn_controller_tasks(
    state: AppState,
    source: Option<Box<dyn TelemetrySource>>,
) -> tokio::task::JoinHandle<()> {
    if let Some(source) = source {
        let telemetry = state.telemetry.clone();
        let cancel = state.cancel.clone();
        let every = Duration::from_millis(state.cfg.telemetry.poll_millis.max(100));
        tokio::spawn(async move {
            if let Err(e) = ingest(source, telemetry, every, cancel).await {
                warn!(error=%e, "telemetry ingestion stopped");
            }
        });
    }

    tokio::spawn(async move {
        if let Err(e) = run(state.controller, state.cfg.controller.timezone, state.cancel).await {
            warn!(error=%e, "control loop stopped");
        }
    })
}

/// One cycle per wall-clock second until cancelled. Cancellation is only
/// observed between cycles.
pub async fn run(controller: Arc<Mutex<Controller>>, tz: Tz, cancel: CancellationToken) -> Result<()> {
    info!("control loop started");
    while ticker::wait_next_second(&cancel).await {
        let now = Utc::now().with_timezone(&tz);
        let out = controller.lock().await.cycle(now);
        if !out.is_empty() {
            tokio::spawn(send_all(out));
        }
    }
    controller.lock().await.persist();
    info!("control loop stopped");
    Ok(())
}

pub async fn ingest(
    mut source: Box<dyn TelemetrySource>,
    telemetry: TelemetryHandle,
    every: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        match source.poll().await {
            Ok(reading) => telemetry.on_reading(&reading),
            Err(e) => warn!(error = %e, "telemetry poll failed"),
        }
    }
    Ok(())
}
