use anyhow::{Context, Result};
use canbms_lib::fault::Thresholds;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ThermalConfig {
    #[serde(default = "ThermalConfig::default_count")]
    pub count: usize,
    #[serde(
        default = "ThermalConfig::default_cadence",
        with = "humantime_serde"
    )]
    pub cadence: Duration,
    /// Receive poll interval of the monitor.
    #[serde(
        default = "ThermalConfig::default_poll_interval",
        with = "humantime_serde"
    )]
    pub poll_interval: Duration,
    /// Temperatures the simulated sensor picks from, in °C.
    #[serde(default = "ThermalConfig::default_samples")]
    pub samples: Vec<f64>,
    #[serde(default = "ThermalConfig::default_buffer_size")]
    pub buffer_size: usize,
}

impl ThermalConfig {
    fn default_count() -> usize {
        12
    }

    fn default_cadence() -> Duration {
        Duration::from_millis(400)
    }

    fn default_poll_interval() -> Duration {
        Duration::from_millis(50)
    }

    fn default_samples() -> Vec<f64> {
        vec![22.5, 35.0, 59.9, -5.0, 65.5]
    }

    fn default_buffer_size() -> usize {
        64
    }
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            count: Self::default_count(),
            cadence: Self::default_cadence(),
            poll_interval: Self::default_poll_interval(),
            samples: Self::default_samples(),
            buffer_size: Self::default_buffer_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub thermal: ThermalConfig,
}

impl AppConfig {
    pub const DEFAULT_CONFIG_FILE: &str = "canbms.yaml";

    pub fn load(config_file_path: &Path) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read config from file: {config_file_path:?}"))?;
        Ok(config)
    }

    /// A missing default file is fine, an explicitly named one has to exist.
    pub fn load_or_default(config_file_path: &str) -> Result<Self> {
        let path = Path::new(config_file_path);
        if config_file_path == Self::DEFAULT_CONFIG_FILE && !path.exists() {
            log::debug!("No config file {config_file_path:?}, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "thresholds:\n  voltage_max: 4.1\nthermal:\n  cadence: 250ms\n  poll_interval: 1s 500ms\n  samples: [20.0, 70.0]"
        )
        .unwrap();
        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.thresholds.voltage_max, 4.1);
        assert_eq!(config.thresholds.voltage_min, 3.0);
        assert_eq!(config.thermal.cadence, Duration::from_millis(250));
        assert_eq!(config.thermal.poll_interval, Duration::from_millis(1500));
        assert_eq!(config.thermal.samples, vec![20.0, 70.0]);
        assert_eq!(config.thermal.count, 12);
    }

    #[test]
    fn bad_duration_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "thermal:\n  cadence: soon").unwrap();
        assert!(AppConfig::load(file.path()).is_err());
    }

    #[test]
    fn missing_default_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_or_default(AppConfig::DEFAULT_CONFIG_FILE);
        // only valid when the working directory has no config of its own
        if !Path::new(AppConfig::DEFAULT_CONFIG_FILE).exists() {
            assert_eq!(config.unwrap(), AppConfig::default());
        }
        let named = dir.path().join("absent.yaml");
        assert!(AppConfig::load_or_default(named.to_str().unwrap()).is_err());
    }
}
