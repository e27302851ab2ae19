use anyhow::Result;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use validator::Validate;

use crate::domain::DeviceKind;
use crate::hardware::HardwareMode;

#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    #[validate(nested)]
    pub controller: ControllerConfig,
    #[serde(default)]
    #[validate(nested)]
    pub thresholds: Thresholds,
    #[serde(default)]
    #[validate(nested)]
    pub battery: BatteryConfig,
    #[serde(default)]
    #[validate(nested)]
    pub burnout: BurnoutConfig,
    #[serde(default)]
    pub heating: HeatingConfig,
    #[serde(default)]
    pub forecast: ForecastConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    #[validate(nested)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub programs: ProgramsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct ControllerConfig {
    pub timezone: chrono_tz::Tz,
    pub state_dir: PathBuf,
    pub run_dir: PathBuf,
    /// Cycles to hold still after startup while the first samples settle.
    #[validate(range(max = 600))]
    pub startup_lock: u32,
    pub hardware_mode: HardwareMode,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::Europe::Vienna,
            state_dir: PathBuf::from("state"),
            run_dir: PathBuf::from("run"),
            startup_lock: 10,
            hardware_mode: HardwareMode::Simulated,
        }
    }
}

/// Installation-tuned constants of the control loop. All power values in W.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct Thresholds {
    #[validate(range(min = 1))]
    pub noise: i32,
    #[validate(range(min = 1))]
    pub suspicious: i32,
    #[validate(range(min = 1))]
    pub emergency: i32,
    /// Surplus large enough to ramp up without waiting for stability.
    pub enough: i32,
    pub spike: i32,
    pub baseload_summer: i32,
    pub baseload_winter: i32,
    pub deadband_low: i32,
    pub deadband_high: i32,
    #[validate(range(min = 1))]
    pub wait_response: u32,
    #[validate(range(min = 1))]
    pub wait_thermostat: u32,
    pub wait_akku: u32,
    pub wait_start_charge: u32,
    #[validate(range(min = 1))]
    pub noresponse_limit: u32,
    pub override_seconds: u64,
    #[validate(range(min = 1, max = 100))]
    pub standby_ratio_percent: i32,
    #[validate(range(min = 1))]
    pub standby_cycles: usize,
    #[validate(range(min = 1))]
    pub stable_cycles: usize,
    #[validate(range(min = 1, max = 100))]
    pub offline_ratio_percent: i32,
    #[validate(range(min = 1, max = 100))]
    pub max_step_percent: i32,
    #[validate(range(min = 1, max = 100))]
    pub startup_step_percent: i32,
    #[validate(range(min = 100))]
    pub budget_factor_percent: i32,
    pub steal_margin_percent: i32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            noise: 10,
            suspicious: 500,
            emergency: 1000,
            enough: 2000,
            spike: 3000,
            baseload_summer: 200,
            baseload_winter: 300,
            deadband_low: -35,
            deadband_high: 20,
            wait_response: 6,
            wait_thermostat: 12,
            wait_akku: 15,
            wait_start_charge: 30,
            noresponse_limit: 5,
            override_seconds: 600,
            standby_ratio_percent: 50,
            standby_cycles: 3,
            stable_cycles: 3,
            offline_ratio_percent: 50,
            max_step_percent: 10,
            startup_step_percent: 5,
            budget_factor_percent: 150,
            steal_margin_percent: 10,
        }
    }
}

impl Thresholds {
    pub fn baseload(&self, winter: bool) -> i32 {
        if winter {
            self.baseload_winter
        } else {
            self.baseload_summer
        }
    }

    pub fn minimum(&self, winter: bool) -> i32 {
        self.baseload(winter) / 2
    }
}

/// Battery parameters. State of charge values are per-mille.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct BatteryConfig {
    #[validate(range(min = 1))]
    pub capacity_wh: i32,
    #[validate(range(min = 1))]
    pub charge_max_w: i32,
    #[validate(range(min = 1))]
    pub discharge_max_w: i32,
    #[validate(range(max = 1000))]
    pub min_soc: i32,
    #[validate(range(max = 1000))]
    pub reserve_soc: i32,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            capacity_wh: 11000,
            charge_max_w: 4500,
            discharge_max_w: 4500,
            min_soc: 50,
            reserve_soc: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct BurnoutConfig {
    pub enabled: bool,
    #[validate(range(max = 23))]
    pub from_hour: u32,
    #[validate(range(max = 23))]
    pub to_hour: u32,
    pub temp_in_max: f32,
    pub soc_min: i32,
    pub seconds: u64,
    pub devices: Vec<String>,
}

impl Default for BurnoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            from_hour: 6,
            to_hour: 8,
            temp_in_max: 18.0,
            soc_min: 150,
            seconds: 3600,
            devices: vec!["kitchen".to_string(), "living".to_string()],
        }
    }
}

/// Indoor/outdoor temperature rules for the heating flag.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HeatingConfig {
    pub summer_off_in: f32,
    pub off_in: f32,
    pub off_out: f32,
    pub hard_off_in: f32,
    pub winter_on_below: f32,
    /// Hours of full heater power counted into the heating need.
    pub hours: i32,
}

impl Default for HeatingConfig {
    fn default() -> Self {
        Self {
            summer_off_in: 18.0,
            off_in: 24.0,
            off_out: 15.0,
            hard_off_in: 26.0,
            winter_on_below: 28.0,
            hours: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ForecastProvider {
    Mosmix,
    #[default]
    Static,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ForecastConfig {
    pub provider: ForecastProvider,
    pub mosmix_csv: PathBuf,
    /// Radiation below this value counts as night for survival estimation.
    pub rad1h_min: i32,
    pub static_today_wh: i32,
    pub static_tomorrow_wh: i32,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            provider: ForecastProvider::Static,
            mosmix_csv: PathBuf::from("run/mosmix.csv"),
            rad1h_min: 100,
            static_today_wh: 30000,
            static_tomorrow_wh: 30000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetrySourceKind {
    #[default]
    Simulated,
    /// Readings are pushed from outside via the ingestion handle.
    External,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub source: TelemetrySourceKind,
    pub poll_millis: u64,
    pub sim_peak_w: i32,
    pub sim_seed: Option<u64>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            source: TelemetrySourceKind::Simulated,
            poll_millis: 1000,
            sim_peak_w: 12000,
            sim_seed: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            file_prefix: "solar-dispatcher".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct DeviceConfig {
    #[validate(length(min = 1))]
    pub name: String,
    pub kind: DeviceKind,
    #[serde(default)]
    pub total: i32,
    #[serde(default)]
    pub min: i32,
    #[serde(default)]
    #[validate(range(max = 23))]
    pub from: Option<u32>,
    #[serde(default)]
    #[validate(range(max = 24))]
    pub to: Option<u32>,
    /// Host or base URL the actuator talks to.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub relay: Option<u8>,
    #[serde(default = "default_udp_port")]
    pub port: u16,
}

fn default_udp_port() -> u16 {
    1975
}

impl DeviceConfig {
    pub fn new(name: &str, kind: DeviceKind, total: i32) -> Self {
        Self {
            name: name.to_string(),
            kind,
            total,
            min: 0,
            from: None,
            to: None,
            address: None,
            relay: None,
            port: default_udp_port(),
        }
    }

    pub fn min(mut self, min: i32) -> Self {
        self.min = min;
        self
    }

    pub fn window(mut self, from: u32, to: u32) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn address(mut self, address: &str) -> Self {
        self.address = Some(address.to_string());
        self
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProgramsConfig {
    pub modest: Vec<String>,
    pub greedy: Vec<String>,
    pub plenty: Vec<String>,
    pub boilers: Vec<String>,
    pub boiler1: Vec<String>,
    pub boiler3: Vec<String>,
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for ProgramsConfig {
    fn default() -> Self {
        Self {
            modest: names(&[
                "akku", "boiler1", "boiler2", "boiler3", "kitchen", "living", "bedroom", "desk",
                "heater",
            ]),
            greedy: names(&[
                "kitchen", "living", "bedroom", "desk", "heater", "boiler1", "boiler2", "boiler3",
                "akku",
            ]),
            plenty: names(&[
                "kitchen", "living", "bedroom", "desk", "heater", "akku", "boiler1", "boiler2",
                "boiler3",
            ]),
            boilers: names(&[
                "boiler1", "boiler2", "boiler3", "kitchen", "living", "bedroom", "desk", "akku",
            ]),
            boiler1: names(&["boiler1", "akku", "boiler2", "boiler3"]),
            boiler3: names(&["boiler3", "akku", "boiler1", "boiler2"]),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let figment = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("SOLAR__").split("__"));
        let cfg: Config = figment.extract()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.name == name)
    }
}
