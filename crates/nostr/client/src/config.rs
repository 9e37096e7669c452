//! Engine configuration.
//!
//! Every struct is `#[serde(default)]`, so a TOML file only needs the keys it
//! changes. Durations are written as integer milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};
use crate::pool::PoolConfig;

/// What to do with a cached result set when negentropy is off or fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackSync {
    /// Only ask for events newer than the newest cached one.
    #[default]
    Since,
    /// Send the filters unchanged.
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Verify signatures of events arriving from relays.
    pub check_sigs: bool,
    /// Route author queries through the outbox router and track relay lists.
    pub automatic_outbox_model: bool,
    /// Use NIP-77 when a request carries a cached result set.
    pub negentropy: bool,
    pub fallback_sync: FallbackSync,
    /// Upper bound on one negentropy session before falling back.
    #[serde(with = "duration_ms")]
    pub negentropy_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub cleanup_interval: Duration,
    /// How long a cancelled query lingers before cleanup removes it.
    #[serde(with = "duration_ms")]
    pub cancel_grace: Duration,
    pub pool: PoolConfig,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            check_sigs: true,
            automatic_outbox_model: true,
            negentropy: false,
            fallback_sync: FallbackSync::Since,
            negentropy_timeout: Duration::from_secs(10),
            cleanup_interval: Duration::from_secs(1),
            cancel_grace: Duration::from_secs(5),
            pool: PoolConfig::default(),
        }
    }
}

impl SystemConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|error| ClientError::Config(error.to_string()))
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() -> Result<()> {
        let config = SystemConfig::from_toml_str("")?;
        assert!(config.check_sigs);
        assert!(!config.negentropy);
        assert_eq!(config.fallback_sync, FallbackSync::Since);
        assert_eq!(config.cleanup_interval, Duration::from_secs(1));
        assert_eq!(config.pool.max_connections, PoolConfig::default().max_connections);
        Ok(())
    }

    #[test]
    fn nested_tables_override_only_given_keys() -> Result<()> {
        let config = SystemConfig::from_toml_str(
            r#"
            check_sigs = false
            negentropy = true
            fallback_sync = "none"
            cleanup_interval = 250

            [pool]
            max_connections = 4

            [pool.relay]
            connect_timeout = 1500
            negentropy_frame_size_limit = 8192
            "#,
        )?;

        assert!(!config.check_sigs);
        assert!(config.negentropy);
        assert_eq!(config.fallback_sync, FallbackSync::None);
        assert_eq!(config.cleanup_interval, Duration::from_millis(250));
        assert_eq!(config.pool.max_connections, 4);
        assert_eq!(config.pool.relay.connect_timeout, Duration::from_millis(1500));
        assert_eq!(config.pool.relay.negentropy_frame_size_limit, 8192);
        assert_eq!(
            config.pool.relay.publish_timeout,
            crate::relay::RelayConfig::default().publish_timeout
        );
        Ok(())
    }

    #[test]
    fn invalid_toml_is_a_config_error() {
        let result = SystemConfig::from_toml_str("cleanup_interval = \"soon\"");
        assert!(matches!(result, Err(ClientError::Config(_))));
    }
}
