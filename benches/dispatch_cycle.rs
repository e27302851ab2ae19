use chrono::{Duration, TimeZone};
use chrono_tz::Europe::Vienna;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;

use solar_dispatcher::config::Config;
use solar_dispatcher::controller::{Controller, Dispatcher, Inputs};
use solar_dispatcher::domain::{GlobalState, PowerSample, Reading};
use solar_dispatcher::forecast::StaticForecaster;
use solar_dispatcher::hardware::DeviceFactory;

fn registry() -> Arc<Config> {
    let mut cfg: Config = figment::Figment::new()
        .merge(figment::providers::Toml::file("config/default.toml"))
        .extract()
        .unwrap_or_default();
    cfg.controller.state_dir = std::env::temp_dir().join("solar-dispatcher-bench");
    cfg.controller.run_dir = cfg.controller.state_dir.clone();
    Arc::new(cfg)
}

fn dispatch_only(c: &mut Criterion) {
    let cfg = registry();
    let fleet = DeviceFactory::default().build(&cfg.devices);
    let mut d = Dispatcher::new(cfg.clone(), fleet.devices);
    let now = Vienna.with_ymd_and_hms(2026, 4, 10, 12, 0, 0).unwrap();
    let mut s = PowerSample {
        pv: 6000,
        grid: -2500,
        ac1: 6000,
        load: -3500,
        soc: 500,
        p1: -834,
        p2: -833,
        p3: -833,
        ..Default::default()
    };
    s.flags.valid = true;
    s.flags.stable = true;
    let g = GlobalState::default();

    c.bench_function("dispatcher_cycle", |b| {
        b.iter(|| {
            d.state.lock = 0;
            let r = d.cycle(&Inputs::new(now, black_box(&s), &g));
            d.take_outbox();
            r
        })
    });
}

fn controller_cycle(c: &mut Criterion) {
    let cfg = registry();
    let fleet = DeviceFactory::default().build(&cfg.devices);
    let start = Vienna.with_ymd_and_hms(2026, 4, 10, 12, 0, 0).unwrap();
    let mut ctl = Controller::new(
        cfg,
        fleet,
        Box::new(StaticForecaster::new(30000, 30000)),
        start,
    );
    ctl.telemetry().on_reading(&Reading {
        grid: Some(-2500),
        akku: Some(0),
        ac1: Some(6000),
        ac2: Some(0),
        mppt1: Some(3600),
        mppt2: Some(2400),
        p1: Some(-834),
        p2: Some(-833),
        p3: Some(-833),
        soc: Some(500),
        ..Default::default()
    });

    let mut n = 0;
    c.bench_function("controller_cycle", |b| {
        b.iter(|| {
            n += 1;
            ctl.cycle(start + Duration::seconds(n)).len()
        })
    });
}

criterion_group!(benches, dispatch_only, controller_cycle);
criterion_main!(benches);
