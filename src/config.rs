use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;

use crate::tracer::event::ProbeKind;

/// Upper bound for `probe.max_args`; the kernel loop is unrolled to this.
pub const MAX_ARGS_LIMIT: u32 = 64;

/// Missing or invalid configuration. Always fatal at startup.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} is required (set it in the config file or via {env})")]
    Missing {
        key: &'static str,
        env: &'static str,
    },

    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Top-level configuration for the snoopd agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Capturing host identifier attached to every point. Default: $HOSTNAME.
    #[serde(default)]
    pub host: String,

    /// Delivery channel capacity between the record source and the pump. Default: 1000.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// How often pump statistics are logged. Default: 60s.
    #[serde(default = "default_stats_interval", with = "humantime_serde")]
    pub stats_interval: Duration,

    /// Probe selection and tuning.
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Metrics store connection configuration.
    #[serde(default)]
    pub sink: SinkConfig,

    /// Shutdown behavior.
    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Probe selection and tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    /// Which probe to attach (execve, readline). Default: execve.
    #[serde(default)]
    pub kind: ProbeKind,

    /// Binary or shared library providing `readline`. Default: /bin/bash.
    #[serde(default = "default_readline_binary")]
    pub readline_binary: String,

    /// Symbol the readline uretprobe attaches to. Default: readline.
    #[serde(default = "default_readline_symbol")]
    pub readline_symbol: String,

    /// Arguments reported per execve before the "..." marker. Default: 20.
    #[serde(default = "default_max_args")]
    pub max_args: u32,
}

/// InfluxDB connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    /// InfluxDB base URL (e.g., "http://influxdb.monitoring.svc:8086").
    #[serde(default)]
    pub address: String,

    /// Target database.
    #[serde(default)]
    pub database: String,

    /// Target retention policy.
    #[serde(default)]
    pub retention_policy: String,

    /// Basic auth username.
    #[serde(default)]
    pub username: String,

    /// Basic auth password.
    #[serde(default)]
    pub password: String,

    /// Per-request timeout. Default: 5s.
    #[serde(default = "default_sink_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Request body compression (none, gzip). Default: none.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Additional HTTP headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Shutdown behavior.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShutdownConfig {
    /// Process records already queued in the channel before exiting. Default: false.
    #[serde(default)]
    pub drain_buffered: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthConfig {
    /// Listen address (e.g., ":9090"). Empty disables the server.
    #[serde(default)]
    pub addr: String,
}

// --- Default value functions ---

fn default_channel_capacity() -> usize {
    1000
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_readline_binary() -> String {
    "/bin/bash".to_string()
}

fn default_readline_symbol() -> String {
    "readline".to_string()
}

fn default_max_args() -> u32 {
    20
}

fn default_sink_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_compression() -> String {
    "none".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            host: String::new(),
            channel_capacity: default_channel_capacity(),
            stats_interval: default_stats_interval(),
            probe: ProbeConfig::default(),
            sink: SinkConfig::default(),
            shutdown: ShutdownConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            kind: ProbeKind::default(),
            readline_binary: default_readline_binary(),
            readline_symbol: default_readline_symbol(),
            max_args: default_max_args(),
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            database: String::new(),
            retention_policy: String::new(),
            username: String::new(),
            password: String::new(),
            timeout: default_sink_timeout(),
            compression: default_compression(),
            headers: HashMap::new(),
        }
    }
}

// --- Loading, environment overrides and validation ---

impl Config {
    /// Load configuration from an optional YAML file, apply environment
    /// overrides, and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(path) => {
                let data = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                serde_yaml::from_str::<Config>(&data)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Config::default(),
        };

        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;

        Ok(cfg)
    }

    /// Apply environment overrides. Unset and empty variables leave the
    /// file value in place.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("MONITOR_DATABASE") {
            self.sink.database = v;
        }
        if let Some(v) = get("MONITOR_RP") {
            self.sink.retention_policy = v;
        }
        if let Some(v) = get("MONITOR_HOST") {
            self.sink.address = v;
        }
        if let Some(v) = get("MONITOR_USERNAME") {
            self.sink.username = v;
        }
        if let Some(v) = get("MONITOR_PASSWORD") {
            self.sink.password = v;
        }
        if self.host.is_empty() {
            if let Some(v) = get("HOSTNAME") {
                self.host = v;
            }
        }
        if let Some(v) = get("SNOOPD_PROBE") {
            self.probe.kind = ProbeKind::from_name(&v).ok_or_else(|| ConfigError::Invalid {
                key: "probe.kind",
                reason: format!("unknown probe {v:?} (expected execve or readline)"),
            })?;
        }
        if let Some(v) = get("SNOOPD_READLINE_BINARY") {
            self.probe.readline_binary = v;
        }
        if let Some(v) = get("SNOOPD_MAX_ARGS") {
            self.probe.max_args = v.parse().map_err(|e| ConfigError::Invalid {
                key: "probe.max_args",
                reason: format!("{v:?}: {e}"),
            })?;
        }

        Ok(())
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sink.database.is_empty() {
            return Err(ConfigError::Missing {
                key: "sink.database",
                env: "MONITOR_DATABASE",
            });
        }

        if self.sink.retention_policy.is_empty() {
            return Err(ConfigError::Missing {
                key: "sink.retention_policy",
                env: "MONITOR_RP",
            });
        }

        if self.sink.address.is_empty() {
            return Err(ConfigError::Missing {
                key: "sink.address",
                env: "MONITOR_HOST",
            });
        }

        if !(self.sink.address.starts_with("http://") || self.sink.address.starts_with("https://"))
        {
            return Err(ConfigError::Invalid {
                key: "sink.address",
                reason: format!("{:?} must start with http:// or https://", self.sink.address),
            });
        }

        if self.sink.timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "sink.timeout",
                reason: "must be positive".to_string(),
            });
        }

        match self.sink.compression.as_str() {
            "none" | "gzip" => {}
            other => {
                return Err(ConfigError::Invalid {
                    key: "sink.compression",
                    reason: format!("unsupported compression {other:?}"),
                })
            }
        }

        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "channel_capacity",
                reason: "must be positive".to_string(),
            });
        }

        if self.stats_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "stats_interval",
                reason: "must be positive".to_string(),
            });
        }

        if self.probe.max_args == 0 || self.probe.max_args > MAX_ARGS_LIMIT {
            return Err(ConfigError::Invalid {
                key: "probe.max_args",
                reason: format!("must be between 1 and {MAX_ARGS_LIMIT}"),
            });
        }

        if self.probe.kind == ProbeKind::Readline {
            if self.probe.readline_binary.is_empty() {
                return Err(ConfigError::Missing {
                    key: "probe.readline_binary",
                    env: "SNOOPD_READLINE_BINARY",
                });
            }
            if self.probe.readline_symbol.is_empty() {
                return Err(ConfigError::Invalid {
                    key: "probe.readline_symbol",
                    reason: "must not be empty".to_string(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            sink: SinkConfig {
                address: "http://localhost:8086".to_string(),
                database: "monitor".to_string(),
                retention_policy: "autogen".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn env(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v).to_string())
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.channel_capacity, 1000);
        assert_eq!(cfg.stats_interval, Duration::from_secs(60));
        assert_eq!(cfg.probe.kind, ProbeKind::Execve);
        assert_eq!(cfg.probe.readline_binary, "/bin/bash");
        assert_eq!(cfg.probe.readline_symbol, "readline");
        assert_eq!(cfg.probe.max_args, 20);
        assert_eq!(cfg.sink.timeout, Duration::from_secs(5));
        assert_eq!(cfg.sink.compression, "none");
        assert!(!cfg.shutdown.drain_buffered);
        assert!(cfg.health.addr.is_empty());
    }

    #[test]
    fn test_valid_config_passes() {
        assert_eq!(valid_config().validate(), Ok(()));
    }

    #[test]
    fn test_missing_required_fields() {
        let mut cfg = valid_config();
        cfg.sink.database.clear();
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::Missing {
                key: "sink.database",
                env: "MONITOR_DATABASE"
            })
        );

        let mut cfg = valid_config();
        cfg.sink.retention_policy.clear();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Missing {
                key: "sink.retention_policy",
                ..
            })
        ));

        let mut cfg = valid_config();
        cfg.sink.address.clear();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Missing {
                key: "sink.address",
                ..
            })
        ));
    }

    #[test]
    fn test_invalid_values() {
        let mut cfg = valid_config();
        cfg.sink.address = "localhost:8086".to_string();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid {
                key: "sink.address",
                ..
            })
        ));

        let mut cfg = valid_config();
        cfg.sink.compression = "zstd".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.channel_capacity = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.probe.max_args = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.probe.max_args = MAX_ARGS_LIMIT + 1;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.probe.kind = ProbeKind::Readline;
        cfg.probe.readline_binary.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = Config::default();
        cfg.apply_env(env(&[
            ("MONITOR_DATABASE", "monitor"),
            ("MONITOR_RP", "two_weeks"),
            ("MONITOR_HOST", "https://influx:8086"),
            ("HOSTNAME", "node-7"),
            ("SNOOPD_PROBE", "readline"),
            ("SNOOPD_READLINE_BINARY", "/lib/libreadline.so.8"),
            ("SNOOPD_MAX_ARGS", "32"),
        ]))
        .expect("env applies");

        assert_eq!(cfg.sink.database, "monitor");
        assert_eq!(cfg.sink.retention_policy, "two_weeks");
        assert_eq!(cfg.sink.address, "https://influx:8086");
        assert_eq!(cfg.host, "node-7");
        assert_eq!(cfg.probe.kind, ProbeKind::Readline);
        assert_eq!(cfg.probe.readline_binary, "/lib/libreadline.so.8");
        assert_eq!(cfg.probe.max_args, 32);
        assert_eq!(cfg.validate(), Ok(()));
    }

    #[test]
    fn test_env_empty_values_are_ignored() {
        let mut cfg = valid_config();
        cfg.apply_env(env(&[("MONITOR_DATABASE", "")]))
            .expect("env applies");
        assert_eq!(cfg.sink.database, "monitor");
    }

    #[test]
    fn test_hostname_does_not_override_file_host() {
        let mut cfg = valid_config();
        cfg.host = "from-file".to_string();
        cfg.apply_env(env(&[("HOSTNAME", "from-env")]))
            .expect("env applies");
        assert_eq!(cfg.host, "from-file");
    }

    #[test]
    fn test_env_invalid_values() {
        let mut cfg = Config::default();
        assert!(matches!(
            cfg.apply_env(env(&[("SNOOPD_PROBE", "tracepoint")])),
            Err(ConfigError::Invalid {
                key: "probe.kind",
                ..
            })
        ));
        assert!(matches!(
            cfg.apply_env(env(&[("SNOOPD_MAX_ARGS", "many")])),
            Err(ConfigError::Invalid {
                key: "probe.max_args",
                ..
            })
        ));
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
host: edge-1
channel_capacity: 256
stats_interval: 30s
probe:
  kind: readline
  readline_binary: /usr/lib/libreadline.so
sink:
  address: http://influx:8086
  database: monitor
  retention_policy: autogen
  timeout: 2s
  compression: gzip
  headers:
    X-Scope: ops
shutdown:
  drain_buffered: true
health:
  addr: ":9100"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse yaml");
        assert_eq!(cfg.host, "edge-1");
        assert_eq!(cfg.channel_capacity, 256);
        assert_eq!(cfg.stats_interval, Duration::from_secs(30));
        assert_eq!(cfg.probe.kind, ProbeKind::Readline);
        assert_eq!(cfg.probe.max_args, 20);
        assert_eq!(cfg.sink.timeout, Duration::from_secs(2));
        assert_eq!(cfg.sink.compression, "gzip");
        assert_eq!(cfg.sink.headers.get("X-Scope").map(String::as_str), Some("ops"));
        assert!(cfg.shutdown.drain_buffered);
        assert_eq!(cfg.health.addr, ":9100");
        assert_eq!(cfg.validate(), Ok(()));
    }

    #[test]
    fn test_parse_yaml_unknown_probe_fails() {
        let yaml = "probe:\n  kind: tracepoint\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("snoopd.yaml");
        std::fs::write(
            &path,
            "sink:\n  address: http://influx:8086\n  database: monitor\n  retention_policy: autogen\n",
        )
        .expect("write config");

        let cfg = Config::load(Some(&path)).expect("load");
        assert_eq!(cfg.sink.database, "monitor");
    }
}
