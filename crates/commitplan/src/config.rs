//! Commit configuration.

use commitplan_core::{ConfigError, Error, Result};
use serde::{Deserialize, Serialize};

/// Default bound on deferred-value chains.
pub const DEFAULT_MAX_SUPPLIER_DEPTH: usize = 1000;

/// Configuration for one commit pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitConfig {
    /// Maximum number of hops followed when resolving a deferred value.
    pub max_supplier_depth: usize,
    /// Keep a summary of every compiled row operation in the commit report.
    pub archive_operations: bool,
    /// Use the only column of a generated-key row when the generated PK column
    /// is not present by name.
    pub generated_key_fallback: bool,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            max_supplier_depth: DEFAULT_MAX_SUPPLIER_DEPTH,
            archive_operations: false,
            generated_key_fallback: true,
        }
    }
}

impl CommitConfig {
    /// Create the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the deferred-value chain bound (builder pattern).
    #[must_use]
    pub fn max_supplier_depth(mut self, value: usize) -> Self {
        self.max_supplier_depth = value;
        self
    }

    /// Set the archive flag (builder pattern).
    #[must_use]
    pub fn archive_operations(mut self, value: bool) -> Self {
        self.archive_operations = value;
        self
    }

    /// Set the generated-key fallback flag (builder pattern).
    #[must_use]
    pub fn generated_key_fallback(mut self, value: bool) -> Self {
        self.generated_key_fallback = value;
        self
    }

    /// Parse a configuration from JSON; missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the compiler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_supplier_depth == 0 {
            return Err(Error::Config(ConfigError {
                message: "max_supplier_depth must be at least 1".to_string(),
            }));
        }
        Ok(())
    }
}
