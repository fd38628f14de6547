//! Configuration structures for Arbor.

use crate::error::{ArborError, Result};
use crate::page::{MIN_PAGE_SIZE, PAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Container (paged storage) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Directory for container files written at checkpoint.
    pub data_dir: PathBuf,
    /// Logical page size in bytes, at most PAGE_SIZE.
    pub page_size: usize,
    /// Enable fsync after checkpoint writes.
    pub fsync_enabled: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            page_size: PAGE_SIZE,
            fsync_enabled: true,
        }
    }
}

/// Lock manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Maximum time a blocking lock request waits, in milliseconds.
    pub wait_timeout_ms: u64,
    /// Check the waits-for graph before blocking.
    pub deadlock_detection: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 60_000,
            deadlock_detection: true,
        }
    }
}

/// Per-open index configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Upper bound on rows per page, excluding the control row (None = limited by space only).
    pub max_rows_per_page: Option<usize>,
    /// Run a full consistency check after every structure modification.
    pub check_consistency: bool,
}

impl IndexConfig {
    /// Returns the effective row limit.
    pub fn rows_per_page_limit(&self) -> usize {
        self.max_rows_per_page.unwrap_or(usize::MAX)
    }
}

/// Top-level configuration aggregating every component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArborConfig {
    /// Container settings.
    pub container: ContainerConfig,
    /// Lock manager settings.
    pub lock: LockConfig,
    /// Index settings.
    pub index: IndexConfig,
}

impl ArborConfig {
    /// Parses a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ArborConfig =
            serde_json::from_str(json).map_err(|e| ArborError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<()> {
        let page_size = self.container.page_size;
        if !(MIN_PAGE_SIZE..=PAGE_SIZE).contains(&page_size) {
            return Err(ArborError::InvalidParameter {
                name: "page_size".to_string(),
                value: page_size.to_string(),
            });
        }
        // A split needs at least two rows to divide between pages.
        if let Some(max_rows) = self.index.max_rows_per_page {
            if max_rows < 2 {
                return Err(ArborError::InvalidParameter {
                    name: "max_rows_per_page".to_string(),
                    value: max_rows.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_config_defaults() {
        let config = ContainerConfig::default();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.page_size, PAGE_SIZE);
        assert!(config.fsync_enabled);
    }

    #[test]
    fn test_lock_config_defaults() {
        let config = LockConfig::default();
        assert_eq!(config.wait_timeout_ms, 60_000);
        assert!(config.deadlock_detection);
    }

    #[test]
    fn test_index_config_defaults() {
        let config = IndexConfig::default();
        assert!(config.max_rows_per_page.is_none());
        assert_eq!(config.rows_per_page_limit(), usize::MAX);
        assert!(!config.check_consistency);
    }

    #[test]
    fn test_from_json_partial() {
        let config = ArborConfig::from_json(
            r#"{ "index": { "max_rows_per_page": 4 }, "container": { "page_size": 4096 } }"#,
        )
        .unwrap();
        assert_eq!(config.index.max_rows_per_page, Some(4));
        assert_eq!(config.container.page_size, 4096);
        assert_eq!(config.lock.wait_timeout_ms, 60_000);
    }

    #[test]
    fn test_from_json_rejects_bad_page_size() {
        let err = ArborConfig::from_json(r#"{ "container": { "page_size": 100 } }"#).unwrap_err();
        assert!(matches!(err, ArborError::InvalidParameter { .. }));
    }

    #[test]
    fn test_from_json_rejects_single_row_pages() {
        let err =
            ArborConfig::from_json(r#"{ "index": { "max_rows_per_page": 1 } }"#).unwrap_err();
        assert!(matches!(err, ArborError::InvalidParameter { .. }));
    }

    #[test]
    fn test_from_json_malformed() {
        let err = ArborConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, ArborError::ConfigError(_)));
    }

    #[test]
    fn test_serde_roundtrip() {
        let original = ArborConfig {
            index: IndexConfig {
                max_rows_per_page: Some(8),
                check_consistency: true,
            },
            ..Default::default()
        };
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: ArborConfig = serde_json::from_str(&serialized).unwrap();

        assert_eq!(deserialized.index.max_rows_per_page, Some(8));
        assert!(deserialized.index.check_consistency);
        assert_eq!(deserialized.container.page_size, original.container.page_size);
    }
}
