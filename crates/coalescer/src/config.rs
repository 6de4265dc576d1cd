use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "coalescer".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// The data part of a [`Coalescer`](crate::Coalescer) configuration.
///
/// Key generators and caching predicates are closures and are attached through the
/// [`CoalescerBuilder`](crate::CoalescerBuilder) instead.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CoalescerConfig {
    /// Name of the coalescer, reported as the `coalescer` tag on all metrics.
    pub name: String,

    /// How long a successful result is reused.
    #[serde(with = "humantime_serde")]
    pub cache_duration: Duration,

    /// Restricts key derivation to the arguments at these positions.
    pub key_fields: Option<Vec<usize>>,

    /// Maximum nesting depth of arguments when deriving keys.
    ///
    /// Arguments nested deeper than this, including values that refer to themselves, cannot be
    /// keyed and are never coalesced.
    pub max_key_depth: usize,

    /// Maximum number of completed results held in memory.
    pub max_capacity: u64,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            name: "default".into(),
            cache_duration: Duration::from_millis(300),
            key_fields: None,
            max_key_depth: 128,
            max_capacity: 10_000,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The coalescer settings.
    pub coalescer: CoalescerConfig,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.coalescer, CoalescerConfig::default());
        assert_eq!(cfg.coalescer.cache_duration, Duration::from_millis(300));
        assert_eq!(cfg.logging.level, LevelFilter::INFO);
        assert_eq!(cfg.metrics.prefix, "coalescer");
    }

    #[test]
    fn test_coalescer_config() {
        // Individual settings can be changed without affecting the other defaults.
        let yaml = r#"
            coalescer:
              name: search
              cache_duration: 1s 500ms
              key_fields: [0, 1]
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();

        assert_eq!(cfg.coalescer.name, "search");
        assert_eq!(cfg.coalescer.cache_duration, Duration::from_millis(1500));
        assert_eq!(cfg.coalescer.key_fields, Some(vec![0, 1]));
        assert_eq!(cfg.coalescer.max_key_depth, 128);
        assert_eq!(cfg.coalescer.max_capacity, 10_000);
    }

    #[test]
    fn test_logging_config() {
        let yaml = r#"
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();

        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);

        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_metrics_config() {
        let yaml = r#"
            metrics:
              statsd: "127.0.0.1:8125"
              prefix: stress
              custom_tags:
                env: test
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();

        assert_eq!(cfg.metrics.statsd.as_deref(), Some("127.0.0.1:8125"));
        assert_eq!(cfg.metrics.prefix, "stress");
        assert_eq!(cfg.metrics.custom_tags["env"], "test");
    }

    #[test]
    fn test_config_file() {
        let dir = coalescer_test::tempdir();
        let path = dir.path().join("config.yml");
        fs::write(&path, "coalescer:\n  cache_duration: 2s\n").unwrap();

        let cfg = Config::get(Some(&path)).unwrap();
        assert_eq!(cfg.coalescer.cache_duration, Duration::from_secs(2));
        assert_eq!(cfg.coalescer.name, "default");

        assert!(Config::get(Some(&dir.path().join("missing.yml"))).is_err());
    }

    #[test]
    fn test_empty_config() {
        let err = Config::from_reader("  \n".as_bytes()).unwrap_err();
        assert_eq!(err.to_string(), "config file empty");
    }
}
