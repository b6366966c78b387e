//! Code for the configuration of the application.

use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    clearing::ClearingStrategy,
    color,
    printer::{AutomationConfig, Printer, PrinterModel, Serial},
};

/// The configuration of the application.
#[derive(Default, Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Dispatcher tuning.
    pub dispatcher: DispatcherConfig,
    /// Clearing watchdog tuning.
    pub watchdog: WatchdogConfig,
    /// Telemetry tuning.
    pub telemetry: TelemetryConfig,
    /// Clearing safety guards.
    pub clearing: ClearingConfig,
    /// The fleet.
    pub printers: Vec<PrinterConfig>,
}

impl Config {
    /// Parse a configuration from a toml file.
    pub fn from_file(file: &Path) -> Result<Self> {
        let config =
            std::fs::read_to_string(file).with_context(|| format!("Config file not found at {}", file.display()))?;
        Self::from_str(&config)
    }

    /// Parse a configuration from a toml string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(config: &str) -> Result<Self> {
        let config: Self = toml::from_str(config)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.dispatcher.interval_secs > 0,
            "dispatcher.interval_secs must be at least 1"
        );
        anyhow::ensure!(
            self.telemetry.initial_backoff_secs > 0,
            "telemetry.initial_backoff_secs must be at least 1"
        );
        anyhow::ensure!(
            self.telemetry.max_backoff_secs >= self.telemetry.initial_backoff_secs,
            "telemetry.max_backoff_secs must not be below telemetry.initial_backoff_secs"
        );
        Ok(())
    }
}

/// Dispatcher tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Seconds between dispatch cycles.
    pub interval_secs: u64,
    /// Largest color distance accepted as a substitute.
    pub color_threshold: f64,
    /// Seconds a job may sit in `UPLOADING` before it is failed.
    pub stale_upload_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            color_threshold: color::DEFAULT_THRESHOLD,
            stale_upload_secs: 300,
        }
    }
}

impl DispatcherConfig {
    /// Time between cycles.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// How long an upload may take.
    pub fn stale_upload(&self) -> Duration {
        Duration::from_secs(self.stale_upload_secs)
    }
}

/// Clearing watchdog tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Seconds to wait for a clearing attempt to report back.
    pub timeout_secs: u64,
    /// Seconds to rest between a failed attempt and the retry.
    pub retry_pause_secs: u64,
    /// Stepper current multiplier for the retry.
    pub retry_current_boost: f64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            retry_pause_secs: 10,
            retry_current_boost: 1.2,
        }
    }
}

impl WatchdogConfig {
    /// Bound on one attempt.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Rest before the retry.
    pub fn retry_pause(&self) -> Duration {
        Duration::from_secs(self.retry_pause_secs)
    }
}

/// Telemetry tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Lifetime of a hot snapshot in the cache.
    pub snapshot_ttl_secs: u64,
    /// First reconnect delay.
    pub initial_backoff_secs: u64,
    /// Longest reconnect delay.
    pub max_backoff_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            snapshot_ttl_secs: 60,
            initial_backoff_secs: 1,
            max_backoff_secs: 60,
        }
    }
}

impl TelemetryConfig {
    /// Snapshot lifetime.
    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_secs)
    }

    /// First reconnect delay.
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs(self.initial_backoff_secs)
    }

    /// Longest reconnect delay.
    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

/// Smallest part height, in millimeters, each strategy may clear.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClearingConfig {
    /// Gantry sweep.
    pub a1_gantry_sweep_min_mm: f64,
    /// Toolhead push.
    pub a1_toolhead_push_min_mm: f64,
    /// Mechanical sweep.
    pub x1_mechanical_sweep_min_mm: f64,
}

impl Default for ClearingConfig {
    fn default() -> Self {
        Self {
            a1_gantry_sweep_min_mm: 50.0,
            a1_toolhead_push_min_mm: 0.0,
            x1_mechanical_sweep_min_mm: 38.0,
        }
    }
}

/// The configuration for a single printer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrinterConfig {
    /// The serial number.
    pub serial: String,
    /// Display name, the serial when absent.
    pub name: Option<String>,
    /// Network address.
    pub ip: String,
    /// LAN access code.
    pub access_code: String,
    /// Model, worked out from the serial when absent.
    pub model: Option<PrinterModel>,
    /// Initial automation settings.
    #[serde(default)]
    pub automation: Option<AutomationSettings>,
}

/// Automation settings as written in the config file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AutomationSettings {
    /// Clear automatically.
    pub auto_eject: bool,
    /// How.
    pub strategy: Option<ClearingStrategy>,
    /// Release temperature.
    pub thermal_release_temp: Option<f64>,
    /// Jobs between calibrations.
    pub calibration_interval: Option<u32>,
}

impl PrinterConfig {
    /// The printer record this entry describes.
    pub fn to_printer(&self) -> Result<Printer> {
        let serial = Serial(self.serial.clone());
        let model = self
            .model
            .or_else(|| PrinterModel::from_serial(&serial))
            .ok_or_else(|| anyhow::anyhow!("cannot tell the model of printer {serial}, set `model`"))?;

        let mut printer = Printer::new(
            serial.clone(),
            self.name.clone().unwrap_or_else(|| serial.to_string()),
            self.ip.clone(),
            self.access_code.clone(),
            model,
        );

        if let Some(settings) = &self.automation {
            let defaults = AutomationConfig::default();
            printer.automation = AutomationConfig {
                auto_eject: settings.auto_eject,
                strategy: settings.strategy.unwrap_or(defaults.strategy),
                thermal_release_temp: settings.thermal_release_temp.unwrap_or(defaults.thermal_release_temp),
                jobs_since_calibration: 0,
                calibration_interval: settings.calibration_interval.unwrap_or(defaults.calibration_interval),
            };
        }

        Ok(printer)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::from_str("").unwrap();
        assert_eq!(config.dispatcher.interval_secs, 10);
        assert_eq!(config.dispatcher.color_threshold, 5.0);
        assert_eq!(config.watchdog.timeout(), Duration::from_secs(120));
        assert_eq!(config.telemetry.max_backoff(), Duration::from_secs(60));
        assert_eq!(config.clearing.x1_mechanical_sweep_min_mm, 38.0);
        assert!(config.printers.is_empty());
    }

    #[test]
    fn test_config_rejects_zero_intervals() {
        let err = Config::from_str("[dispatcher]\ninterval_secs = 0").unwrap_err();
        assert!(err.to_string().contains("dispatcher.interval_secs"), "{err}");

        let err = Config::from_str("[telemetry]\ninitial_backoff_secs = 0").unwrap_err();
        assert!(err.to_string().contains("telemetry.initial_backoff_secs"), "{err}");

        let err = Config::from_str("[telemetry]\ninitial_backoff_secs = 30\nmax_backoff_secs = 5").unwrap_err();
        assert!(err.to_string().contains("telemetry.max_backoff_secs"), "{err}");

        assert!(Config::from_str("[dispatcher]\ninterval_secs = 1").is_ok());
    }

    #[test]
    fn test_config_from_str_with_printers() {
        let config = r#"
            [dispatcher]
            color_threshold = 8.5

            [[printers]]
            serial = "03919A3B1800123"
            ip = "10.0.0.5"
            access_code = "12345678"

            [printers.automation]
            auto_eject = true
            strategy = "A1_GANTRY_SWEEP"
            calibration_interval = 3

            [[printers]]
            serial = "LAB-X1"
            name = "x1 in the lab"
            ip = "10.0.0.6"
            access_code = "87654321"
            model = "X1C"
        "#;
        let config = Config::from_str(config).unwrap();
        assert_eq!(config.dispatcher.color_threshold, 8.5);
        assert_eq!(config.dispatcher.stale_upload_secs, 300);
        assert_eq!(config.printers.len(), 2);

        let a1 = config.printers[0].to_printer().unwrap();
        assert_eq!(a1.model, PrinterModel::A1);
        assert_eq!(a1.name, "03919A3B1800123");
        assert!(a1.automation.auto_eject);
        assert_eq!(a1.automation.strategy, ClearingStrategy::A1GantrySweep);
        assert_eq!(a1.automation.thermal_release_temp, 28.0);
        assert_eq!(a1.automation.calibration_interval, 3);

        let x1 = config.printers[1].to_printer().unwrap();
        assert_eq!(x1.model, PrinterModel::X1Carbon);
        assert_eq!(x1.automation, AutomationConfig::default());
    }

    #[test]
    fn test_unknown_model_needs_explicit_model() {
        let config = r#"
            [[printers]]
            serial = "LAB-X1"
            ip = "10.0.0.6"
            access_code = "87654321"
        "#;
        let config = Config::from_str(config).unwrap();
        assert!(config.printers[0].to_printer().is_err());
    }
}
