//! Configuration for Table Views
//!
//! A table view is configured with the topic it folds, the schema its
//! values are encoded with, and how often partition topology is re-checked.
//! The struct round-trips through serde so it can live in a TOML file.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default interval between partition topology checks
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Wire schema of the values published on a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    /// Raw payload bytes
    Bytes,
    /// UTF-8 text
    String,
    /// JSON document
    Json,
}

impl fmt::Display for SchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaType::Bytes => write!(f, "bytes"),
            SchemaType::String => write!(f, "string"),
            SchemaType::Json => write!(f, "json"),
        }
    }
}

/// Table view configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableViewConfig {
    /// Topic to fold into the view (required)
    pub topic: String,
    /// Value schema; must be paired with a decoder of the same type
    pub schema: Option<SchemaType>,
    /// Interval between partition topology checks (0 = default of 60s)
    #[serde(rename = "refresh_interval_ms", with = "duration_millis")]
    pub refresh_interval: Duration,
}

impl Default for TableViewConfig {
    fn default() -> Self {
        TableViewConfig {
            topic: String::new(),
            schema: None,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}

impl TableViewConfig {
    pub fn new(topic: impl Into<String>) -> Self {
        TableViewConfig {
            topic: topic.into(),
            ..Default::default()
        }
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Refresh interval with the zero value mapped to the default
    pub fn effective_refresh_interval(&self) -> Duration {
        if self.refresh_interval.is_zero() {
            DEFAULT_REFRESH_INTERVAL
        } else {
            self.refresh_interval
        }
    }
}

/// Errors detected while validating a table view configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// No topic was configured
    TopicRequired,
    /// A schema was configured but no decoder for its value type
    MissingValueType(SchemaType),
    /// A decoder was supplied (or required) but no schema was configured
    MissingSchema,
    /// The decoder decodes a different schema than the configured one
    SchemaMismatch {
        configured: SchemaType,
        decoder: SchemaType,
    },
    /// Configuration text could not be parsed
    Parse(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::TopicRequired => write!(f, "topic is required"),
            ConfigError::MissingValueType(schema) => write!(
                f,
                "a value type decoder is required when schema '{}' is present",
                schema
            ),
            ConfigError::MissingSchema => {
                write!(f, "a value schema is required for this value type")
            }
            ConfigError::SchemaMismatch {
                configured,
                decoder,
            } => write!(
                f,
                "schema mismatch: configured '{}' but decoder reads '{}'",
                configured, decoder
            ),
            ConfigError::Parse(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

mod duration_millis {
    use serde::{ser, Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).map_err(|_| {
            <S::Error as ser::Error>::custom(format!(
                "duration {:?} does not fit in u64 milliseconds",
                duration
            ))
        })?;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
