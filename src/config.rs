//! Engine configuration

use crate::{IdempotencyError, PublishStrategy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration, deserialisable from JSON.
///
/// Every field has a default, so `{}` is a valid configuration:
///
/// ```rust
/// use phased_idempotency::IdempotencyConfig;
///
/// let config = IdempotencyConfig::from_json_str(r#"{ "default_lock_timeout": 5000 }"#).unwrap();
/// assert_eq!(config.cleanup.retention_days, 30);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// Lock timeout used by handlers that do not set their own, in
    /// milliseconds in the serialized form
    #[serde(with = "duration_millis")]
    pub default_lock_timeout: Duration,
    /// Publish strategy added to handler processes unless they configure a
    /// conflicting one
    pub default_publishing: Option<PublishStrategy>,
    /// Retention cleanup
    pub cleanup: CleanupConfig,
    /// Durable store location, used with the `lmdb` feature
    pub lmdb: LmdbConfig,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            default_lock_timeout: Duration::from_secs(30),
            default_publishing: None,
            cleanup: CleanupConfig::default(),
            lmdb: LmdbConfig::default(),
        }
    }
}

impl IdempotencyConfig {
    /// Parse and validate configuration text
    pub fn from_json_str(text: &str) -> Result<Self, IdempotencyError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every value, including nested sections
    pub fn validate(&self) -> Result<(), IdempotencyError> {
        if self.default_lock_timeout.is_zero() {
            return Err(IdempotencyError::assertion(
                "default_lock_timeout must be greater than zero",
            ));
        }
        self.cleanup.validate()?;
        self.lmdb.validate()
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Retention cleanup settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Records older than this are removed
    pub retention_days: u32,
    /// Upper bound of records removed by one run
    pub max_records_to_remove: u64,
    /// Records deleted per store call
    pub batch_size: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            max_records_to_remove: 1_000_000,
            batch_size: 10_000,
        }
    }
}

impl CleanupConfig {
    /// Reject zero batch sizes and limits
    pub fn validate(&self) -> Result<(), IdempotencyError> {
        if self.batch_size == 0 {
            return Err(IdempotencyError::assertion("cleanup.batch_size must be greater than zero"));
        }
        if self.max_records_to_remove == 0 {
            return Err(IdempotencyError::assertion(
                "cleanup.max_records_to_remove must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Age after which records are removed
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }
}

/// LMDB environment settings, used with the `lmdb` feature
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LmdbConfig {
    /// Directory of the environment; created when missing
    pub path: PathBuf,
    /// Maximum size of the memory map in bytes
    pub map_size: usize,
    /// Maximum number of concurrent read transactions
    pub max_readers: u32,
}

impl Default for LmdbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("idempotency.lmdb"),
            map_size: 1024 * 1024 * 1024,
            max_readers: 126,
        }
    }
}

impl LmdbConfig {
    /// Reject a zero map size or reader count
    pub fn validate(&self) -> Result<(), IdempotencyError> {
        if self.map_size == 0 || self.max_readers == 0 {
            return Err(IdempotencyError::assertion(
                "lmdb.map_size and lmdb.max_readers must be greater than zero",
            ));
        }
        Ok(())
    }
}
