//! Session configuration.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Result;
use crate::writer::DEFAULT_CHANNEL_CAPACITY;

/// Default application name announced during negotiation.
pub const DEFAULT_APPLICATION_NAME: &str = "etp-session";

/// Default application version announced during negotiation.
pub const DEFAULT_APPLICATION_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default wait for a correlated response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default wait for session negotiation to finish.
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Default slice size when sending a blob as Chunk messages (256 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Default ceiling on one reassembled blob (256 MiB).
pub const DEFAULT_MAX_BLOB_SIZE: usize = 256 * 1024 * 1024;

/// Default ceiling on how long a blob may stay incomplete.
pub const DEFAULT_MAX_BLOB_AGE: Duration = Duration::from_secs(300);

/// Default number of protocol violations tolerated before closing.
pub const DEFAULT_MAX_PROTOCOL_VIOLATIONS: u32 = 16;

/// Default data object formats announced by 1.2 sessions.
pub const DEFAULT_SUPPORTED_FORMATS: &[&str] = &["xml"];

/// Configuration for one session.
///
/// Durations are expressed in milliseconds when deserialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    pub application_name: String,
    pub application_version: String,
    /// Body compression to offer (`"gzip"`) or `None` for plain bodies.
    pub compression: Option<String>,
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    /// Deadline for negotiation, counted from `connect`. Zero waits forever.
    #[serde(with = "millis")]
    pub negotiation_timeout: Duration,
    pub chunk_size: usize,
    /// Largest reassembled blob, and largest decompressed message body.
    pub max_blob_size: usize,
    #[serde(with = "millis")]
    pub max_blob_age: Duration,
    /// Violations tolerated before the session closes itself. `0` disables
    /// the limit.
    pub max_protocol_violations: u32,
    pub supported_formats: Vec<String>,
    /// Outbound frame queue capacity.
    pub channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            application_name: DEFAULT_APPLICATION_NAME.to_string(),
            application_version: DEFAULT_APPLICATION_VERSION.to_string(),
            compression: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_blob_size: DEFAULT_MAX_BLOB_SIZE,
            max_blob_age: DEFAULT_MAX_BLOB_AGE,
            max_protocol_violations: DEFAULT_MAX_PROTOCOL_VIOLATIONS,
            supported_formats: DEFAULT_SUPPORTED_FORMATS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl SessionConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

mod millis {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &Duration,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.application_name, DEFAULT_APPLICATION_NAME);
        assert_eq!(config.compression, None);
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(config.supported_formats, vec!["xml".to_string()]);
    }

    #[test]
    fn test_from_json_partial() {
        let config = SessionConfig::from_json(
            r#"{"applicationName":"rig-17","compression":"gzip","requestTimeout":1500}"#,
        )
        .unwrap();
        assert_eq!(config.application_name, "rig-17");
        assert_eq!(config.compression.as_deref(), Some("gzip"));
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(SessionConfig::from_json("{").is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        let config = SessionConfig {
            max_blob_age: Duration::from_secs(2),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"maxBlobAge\":2000"));
        assert_eq!(SessionConfig::from_json(&json).unwrap(), config);
    }
}
