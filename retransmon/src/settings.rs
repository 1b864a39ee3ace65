use std::net::SocketAddr;
use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

const ENV_PREFIX: &str = "RETRANSMON";
const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:2112";

/// Prometheus scrape endpoint configuration
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub addr: String,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: DEFAULT_METRICS_ADDR.to_string(),
        }
    }
}

/// Per-CPU perf buffer configuration
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct PerfSettings {
    /// Pages per CPU buffer. Must be a power of two; aya picks its own
    /// default when unset.
    pub page_count: Option<usize>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub metrics: MetricsSettings,
    #[serde(default)]
    pub perf: PerfSettings,
    /// Print one JSON line per retransmission on stdout.
    #[serde(default = "default_json_output")]
    pub json_output: bool,
}

fn default_json_output() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            metrics: MetricsSettings::default(),
            perf: PerfSettings::default(),
            json_output: default_json_output(),
        }
    }
}

impl Settings {
    /// Loads settings from an optional config file, then `RETRANSMON_*`
    /// environment variables (`__` separates nested keys, e.g.
    /// `RETRANSMON_METRICS__ADDR`).
    pub fn new(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut builder = Config::builder();
        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path).required(true));
        }

        let s = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.metrics.enabled {
            self.metrics_addr()?;
        }
        if let Some(pages) = self.perf.page_count
            && !pages.is_power_of_two()
        {
            return Err(ConfigError::Message(format!(
                "perf.page_count must be a power of two, got {}",
                pages
            )));
        }
        Ok(())
    }

    pub fn metrics_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.metrics.addr.parse().map_err(|e| {
            ConfigError::Message(format!("invalid metrics.addr {:?}: {}", self.metrics.addr, e))
        })
    }
}
