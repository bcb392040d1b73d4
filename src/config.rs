use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the statbeam daemon.
///
/// Values come from an optional YAML file; command-line flags overlay
/// individual fields afterwards.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// UDP port to listen for metrics on. Default: 8125.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Address to bind the UDP listener to. Default: "0.0.0.0".
    #[serde(default = "default_address")]
    pub address: String,

    /// Downstream Graphite TCP endpoint (host:port). Default: "127.0.0.1:2003".
    #[serde(default = "default_graphite")]
    pub graphite: String,

    /// Flush interval. Default: 10s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Timer percentiles to publish, signed integers in [-100, 100];
    /// negative values select the lower tail. Default: [50, 90].
    #[serde(default = "default_percentiles")]
    pub percentiles: Vec<i32>,

    /// Bucket name counting accepted samples per interval; empty disables.
    /// Default: "statsd.count".
    #[serde(default = "default_receive_counter")]
    pub receive_counter: String,
}

// --- Default value functions ---

fn default_port() -> u16 {
    8125
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_graphite() -> String {
    "127.0.0.1:2003".to_string()
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_percentiles() -> Vec<i32> {
    vec![50, 90]
}

fn default_receive_counter() -> String {
    "statsd.count".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            address: default_address(),
            graphite: default_graphite(),
            flush_interval: default_flush_interval(),
            percentiles: default_percentiles(),
            receive_counter: default_receive_counter(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            bail!("address must not be empty");
        }

        if self.graphite.is_empty() {
            bail!("graphite endpoint must not be empty");
        }

        if self.flush_interval.is_zero() {
            bail!("flush interval must be positive");
        }

        for &p in &self.percentiles {
            if !(-100..=100).contains(&p) {
                bail!("percentile {p} out of range [-100, 100]");
            }
        }

        Ok(())
    }
}

/// Parse a comma-separated percentile list, e.g. `"50,90,-10"`.
pub fn parse_percentiles(input: &str) -> Result<Vec<i32>> {
    input
        .split(',')
        .map(|part| {
            let part = part.trim();
            part.parse::<i32>()
                .with_context(|| format!("invalid percentile {part:?}"))
        })
        .collect()
}
