//! Engine configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, Result};
use crate::identity::{DEFAULT_PREFIX, DEFAULT_SCHEME};
use crate::registrar::DEFAULT_PORT;

/// Configuration for the reconciliation engine.
///
/// Everything the engine would otherwise pick up from ambient state is set
/// here once, at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Asset used when a call does not name one.
    pub default_asset: String,
    /// Transport scheme assumed when an identity block has none.
    pub scheme: String,
    /// Prefix of the identity metadata keys.
    pub metadata_prefix: String,
    /// Port added to physical paths whose scheme has no well-known port.
    pub default_port: u16,
    /// Maximum directory lookups in flight during batch reconciliation.
    pub max_concurrent_lookups: usize,
    /// Copies requested by rules when the caller does not say.
    pub default_copies: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_asset: "data".to_string(),
            scheme: DEFAULT_SCHEME.to_string(),
            metadata_prefix: DEFAULT_PREFIX.to_string(),
            default_port: DEFAULT_PORT,
            max_concurrent_lookups: 8,
            default_copies: 1,
        }
    }
}

impl EngineConfig {
    /// Load from a `.toml` or `.json` file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: EngineConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| ReconcileError::Config {
                msg: format!("{}: {}", path.display(), e),
            })?,
            "json" => serde_json::from_str(&contents).map_err(|e| ReconcileError::Config {
                msg: format!("{}: {}", path.display(), e),
            })?,
            _ => {
                return Err(ReconcileError::Config {
                    msg: format!("unsupported config file extension: {:?}", ext),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| {
            Err(ReconcileError::Config {
                msg: msg.to_string(),
            })
        };
        if self.default_asset.is_empty() {
            return invalid("default_asset must not be empty");
        }
        if self.scheme.is_empty() {
            return invalid("scheme must not be empty");
        }
        if self.metadata_prefix.is_empty() || self.metadata_prefix.contains(':') {
            return invalid("metadata_prefix must be non-empty and contain no ':'");
        }
        if self.default_port == 0 {
            return invalid("default_port must be non-zero");
        }
        if self.max_concurrent_lookups == 0 {
            return invalid("max_concurrent_lookups must be at least 1");
        }
        if self.default_copies == 0 {
            return invalid("default_copies must be at least 1");
        }
        Ok(())
    }
}
