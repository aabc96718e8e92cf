//! Hierarchy Engine Configuration
//!
//! Tunables for locking, paging and caching. Defaults match the values the
//! engine was tuned with; every field can be overridden from JSON.
//!
//! # Examples
//!
//! ```
//! use hierarchy_core::HierarchyConfig;
//!
//! let config = HierarchyConfig::from_json_str(r#"{ "partialProviderSize": 50 }"#).unwrap();
//! assert_eq!(config.partial_provider_size, 50);
//! assert_eq!(config.max_allowed_similar_ancestors_when_suppressed, 10);
//! ```

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for hierarchy population and caching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HierarchyConfig {
    /// A lock older than this is considered abandoned (milliseconds)
    pub lock_timeout_ms: u64,

    /// Poll interval while waiting for a locked level (milliseconds)
    pub lock_wait_interval_ms: u64,

    /// Row count above which a paged query is split into partial providers
    pub partial_provider_size: usize,

    /// Maximum number of nodes kept in the in-memory quick cache
    pub quick_cache_capacity: usize,

    /// Similar-ancestor budget for specifications that suppress the check
    pub max_allowed_similar_ancestors_when_suppressed: usize,

    /// SQLite busy timeout for cache and store connections (milliseconds)
    pub busy_timeout_ms: u64,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 90_000,
            lock_wait_interval_ms: 200,
            partial_provider_size: 1000,
            quick_cache_capacity: 1000,
            max_allowed_similar_ancestors_when_suppressed: 10,
            busy_timeout_ms: 30_000,
        }
    }
}

impl HierarchyConfig {
    /// Parse a configuration from JSON, filling missing fields with defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_wait_interval(&self) -> Duration {
        Duration::from_millis(self.lock_wait_interval_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HierarchyConfig::default();
        assert_eq!(config.lock_timeout(), Duration::from_secs(90));
        assert_eq!(config.lock_wait_interval(), Duration::from_millis(200));
        assert_eq!(config.partial_provider_size, 1000);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = HierarchyConfig::from_json_str(r#"{"lockWaitIntervalMs": 5}"#).unwrap();
        assert_eq!(config.lock_wait_interval_ms, 5);
        assert_eq!(config.quick_cache_capacity, 1000);
    }

    #[test]
    fn test_invalid_json_is_error() {
        assert!(HierarchyConfig::from_json_str("{ not json").is_err());
    }
}
