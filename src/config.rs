#![allow(dead_code)]
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Top-level application configuration (SPEC_FULL.md §6 configuration surface).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    pub station: StationConfig,

    #[validate(nested)]
    pub tariff: TariffConfig,

    #[validate(nested)]
    pub workers: WorkerConfig,

    #[validate(nested)]
    pub database: DatabaseConfig,

    #[validate(nested)]
    pub telemetry: TelemetryConfig,
}

/// Station admission and pile fleet configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct StationConfig {
    #[validate(range(min = 1, max = 10_000))]
    pub waiting_area_capacity: usize,

    #[validate(range(min = 0.1, max = 1000.0))]
    pub fast_pile_max_kw: f64,

    #[validate(range(min = 0.1, max = 1000.0))]
    pub trickle_pile_max_kw: f64,

    #[serde(default = "default_fast_pile_count")]
    #[validate(range(min = 1, max = 1000))]
    pub fast_pile_count: usize,

    #[serde(default = "default_trickle_pile_count")]
    #[validate(range(min = 1, max = 1000))]
    pub trickle_pile_count: usize,

    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default = "default_charging_speed_factor")]
    #[validate(range(min = 1.0, max = 100_000.0))]
    pub charging_speed_factor: f64,

    #[serde(default = "default_event_buffer_capacity")]
    #[validate(range(min = 1, max = 100_000))]
    pub event_buffer_capacity: usize,
}

/// Tariff rates consumed by the progress & billing component (SPEC_FULL.md §4.4).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TariffConfig {
    #[serde(default = "default_peak_price")]
    #[validate(range(min = 0.0))]
    pub peak_price: f64,

    #[serde(default = "default_normal_price")]
    #[validate(range(min = 0.0))]
    pub normal_price: f64,

    #[serde(default = "default_valley_price")]
    #[validate(range(min = 0.0))]
    pub valley_price: f64,

    #[serde(default = "default_service_price")]
    #[validate(range(min = 0.0))]
    pub service_price: f64,
}

/// Periodic worker cadences and timeouts (SPEC_FULL.md §4, §5).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct WorkerConfig {
    #[serde(default = "default_dispatch_interval_ms")]
    #[validate(range(min = 1, max = 60_000))]
    pub dispatch_interval_ms: u64,

    #[serde(default = "default_progress_interval_s")]
    #[validate(range(min = 1, max = 3600))]
    pub progress_interval_s: u64,

    #[serde(default = "default_promotion_interval_s")]
    #[validate(range(min = 1, max = 3600))]
    pub promotion_interval_s: u64,

    #[serde(default = "default_timeout_sweep_interval_s")]
    #[validate(range(min = 1, max = 3600))]
    pub timeout_sweep_interval_s: u64,

    #[serde(default = "default_completing_timeout_s")]
    #[validate(range(min = 1, max = 86_400))]
    pub completing_timeout_s: u64,
}

/// Durable store connection pool, active only under the `db` feature.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,

    #[serde(default = "default_db_max_connections")]
    #[validate(range(min = 1, max = 100))]
    pub max_connections: u32,

    #[serde(default = "default_db_acquire_timeout_s")]
    pub acquire_timeout_s: u64,
}

/// Tracing configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

fn default_fast_pile_count() -> usize { 2 }
fn default_trickle_pile_count() -> usize { 3 }
fn default_timezone() -> String { "UTC".to_string() }
fn default_charging_speed_factor() -> f64 { 1.0 }
fn default_event_buffer_capacity() -> usize { 100 }
fn default_peak_price() -> f64 { 1.00 }
fn default_normal_price() -> f64 { 0.70 }
fn default_valley_price() -> f64 { 0.40 }
fn default_service_price() -> f64 { 0.80 }
fn default_dispatch_interval_ms() -> u64 { 500 }
fn default_progress_interval_s() -> u64 { 10 }
fn default_promotion_interval_s() -> u64 { 5 }
fn default_timeout_sweep_interval_s() -> u64 { 60 }
fn default_completing_timeout_s() -> u64 { 60 }
fn default_database_url() -> String { "postgres://localhost/charge_dispatch".to_string() }
fn default_db_max_connections() -> u32 { 30 }
fn default_db_acquire_timeout_s() -> u64 { 30 }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> LogFormat { LogFormat::Pretty }

impl AppConfig {
    /// Load configuration from TOML files and environment variables.
    ///
    /// Order (later overrides earlier):
    /// 1. `config/default.toml`
    /// 2. `config/<environment>.toml` (or `config/development.toml` if unset)
    /// 3. Environment variables with a `DISPATCH__` prefix (`DISPATCH__TARIFF__PEAK_PRICE`)
    pub fn load() -> Result<Self> {
        Self::load_with_env(None)
    }

    pub fn load_with_env(environment: Option<&str>) -> Result<Self> {
        let mut figment = Figment::new().merge(Toml::file("config/default.toml"));

        if let Some(env) = environment {
            figment = figment.merge(Toml::file(format!("config/{}.toml", env)));
        } else {
            figment = figment.merge(Toml::file("config/development.toml").nested());
        }

        figment = figment.merge(Env::prefixed("DISPATCH__").split("__"));

        let config: AppConfig = figment.extract().context("failed to parse configuration")?;
        config.validate().context("configuration validation failed")?;
        Ok(config)
    }
}

pub type Config = AppConfig;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AppConfig {
        AppConfig {
            station: StationConfig {
                waiting_area_capacity: 20,
                fast_pile_max_kw: 60.0,
                trickle_pile_max_kw: 7.0,
                fast_pile_count: 2,
                trickle_pile_count: 3,
                timezone: "UTC".to_string(),
                charging_speed_factor: 1.0,
                event_buffer_capacity: 100,
            },
            tariff: TariffConfig {
                peak_price: 1.00,
                normal_price: 0.70,
                valley_price: 0.40,
                service_price: 0.80,
            },
            workers: WorkerConfig {
                dispatch_interval_ms: 500,
                progress_interval_s: 10,
                promotion_interval_s: 5,
                timeout_sweep_interval_s: 60,
                completing_timeout_s: 60,
            },
            database: DatabaseConfig {
                url: "postgres://localhost/charge_dispatch".to_string(),
                max_connections: 30,
                acquire_timeout_s: 30,
            },
            telemetry: TelemetryConfig {
                log_level: "info".to_string(),
                log_format: LogFormat::Pretty,
            },
        }
    }

    #[test]
    fn sample_config_is_valid() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut cfg = sample();
        cfg.station.waiting_area_capacity = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn negative_tariff_is_rejected() {
        let mut cfg = sample();
        cfg.tariff.peak_price = -1.0;
        assert!(cfg.validate().is_err());
    }
}
