use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the arraysight poller.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Target cluster connection configuration.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Poll cadence configuration.
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Object template files, one collector per template.
    #[serde(default)]
    pub templates: Vec<PathBuf>,
}

/// Target cluster connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name stamped on all instances as a global label.
    #[serde(default)]
    pub name: String,

    /// Management endpoint (e.g. "https://10.0.0.1").
    #[serde(default)]
    pub endpoint: String,

    /// Basic-auth username.
    #[serde(default)]
    pub username: String,

    /// Basic-auth password.
    #[serde(default)]
    pub password: String,

    /// Skip TLS certificate verification. Default: false.
    #[serde(default)]
    pub insecure: bool,

    /// Request timeout. Default: 30s.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Poll cadence configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Data poll interval. Default: 60s.
    #[serde(default = "default_data_interval", with = "humantime_serde")]
    pub data: Duration,

    /// Instance poll interval. Default: 10m.
    #[serde(default = "default_instance_interval", with = "humantime_serde")]
    pub instance: Duration,

    /// Counter schema refresh interval. Default: 20m.
    #[serde(default = "default_counter_interval", with = "humantime_serde")]
    pub counter: Duration,

    /// Stand-by back-off after a rejected request. Default: 5m.
    #[serde(default = "default_standby_interval", with = "humantime_serde")]
    pub standby: Duration,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_data_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_instance_interval() -> Duration {
    Duration::from_secs(600)
}

fn default_counter_interval() -> Duration {
    Duration::from_secs(1200)
}

fn default_standby_interval() -> Duration {
    Duration::from_secs(300)
}

// --- Default trait impls ---

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            endpoint: String::new(),
            username: String::new(),
            password: String::new(),
            insecure: false,
            timeout: default_timeout(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            data: default_data_interval(),
            instance: default_instance_interval(),
            counter: default_counter_interval(),
            standby: default_standby_interval(),
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

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.cluster.endpoint.is_empty() {
            bail!("cluster.endpoint is required");
        }

        if self.cluster.name.is_empty() {
            bail!("cluster.name is required");
        }

        if self.templates.is_empty() {
            bail!("at least one template is required");
        }

        if self.schedule.data.is_zero() {
            bail!("schedule.data must be positive");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule_values() {
        let schedule = ScheduleConfig::default();
        assert_eq!(schedule.data, Duration::from_secs(60));
        assert_eq!(schedule.instance, Duration::from_secs(600));
        assert_eq!(schedule.counter, Duration::from_secs(1200));
        assert_eq!(schedule.standby, Duration::from_secs(300));
    }

    #[test]
    fn test_parse_yaml() {
        let cfg: Config = serde_yaml::from_str(
            r#"
cluster:
  name: cl01
  endpoint: https://10.0.0.1
  username: monitor
  password: secret
schedule:
  data: 30s
templates:
  - conf/disk.yaml
"#,
        )
        .expect("parse");
        assert_eq!(cfg.cluster.name, "cl01");
        assert_eq!(cfg.schedule.data, Duration::from_secs(30));
        assert_eq!(cfg.schedule.instance, Duration::from_secs(600));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_missing_endpoint() {
        let cfg: Config = serde_yaml::from_str("cluster:\n  name: cl01\n").expect("parse");
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("cluster.endpoint"));
    }

    #[test]
    fn test_validation_missing_templates() {
        let cfg: Config =
            serde_yaml::from_str("cluster:\n  name: cl01\n  endpoint: https://10.0.0.1\n")
                .expect("parse");
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("template"));
    }
}
