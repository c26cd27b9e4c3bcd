//! Asset identity resolution.
//!
//! Derives the `(scope, name)` replication identity of a catalog asset from the
//! identity block embedded in the asset's metadata. This is the only place in
//! the crate that knows how identities are derived; every other module goes
//! through [`IdentityResolver::resolve`].
//!
//! The block lives under `<prefix>:config` and every key inside it carries the
//! same prefix:
//!
//! ```json
//! "replication:config": {
//!     "replication:host": "https://directory.example.org",
//!     "replication:scope": "exp",
//!     "replication:name": "run1",
//!     "replication:scheme": "https",
//!     "replication:size": 1048576,
//!     "replication:checksum": "ad:0a1b2c3d"
//! }
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::catalog::CatalogItem;
use crate::error::{ReconcileError, Result};

/// Metadata key prefix used when none is configured.
pub const DEFAULT_PREFIX: &str = "replication";

/// Transport scheme assumed when the identity block omits one.
pub const DEFAULT_SCHEME: &str = "https";

/// The `(scope, name)` pair under which the directory tracks identical copies.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicationIdentity {
    /// Namespace the name lives in.
    pub scope: String,
    /// Name, unique within the scope.
    pub name: String,
}

impl ReplicationIdentity {
    /// Creates an identity from its parts.
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ReplicationIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.name)
    }
}

impl FromStr for ReplicationIdentity {
    type Err = String;

    /// Parses the `scope:name` form. The name may itself contain colons.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((scope, name)) if !scope.is_empty() && !name.is_empty() => {
                Ok(Self::new(scope, name))
            }
            _ => Err(format!("expected scope:name, got {:?}", s)),
        }
    }
}

/// A validated identity block, with the fields needed to register a replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetIdentity {
    /// Replication identity.
    pub identity: ReplicationIdentity,
    /// Directory service host advertised by the catalog producer.
    pub host: Option<String>,
    /// Transport scheme replicas are advertised over.
    pub scheme: String,
    /// Payload size in bytes.
    pub size: Option<u64>,
    /// Payload checksum (e.g. `ad:<adler32>` or `md5:<hex>`).
    pub checksum: Option<String>,
}

/// Resolves asset identities from catalog metadata.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    prefix: String,
    default_scheme: String,
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX, DEFAULT_SCHEME)
    }
}

impl IdentityResolver {
    /// Create a resolver for the given metadata prefix and fallback scheme.
    pub fn new(prefix: impl Into<String>, default_scheme: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            default_scheme: default_scheme.into(),
        }
    }

    /// Key of the identity block inside an asset's metadata.
    pub fn config_key(&self) -> String {
        format!("{}:config", self.prefix)
    }

    /// Key of a single field inside the identity block.
    pub fn field_key(&self, field: &str) -> String {
        format!("{}:{}", self.prefix, field)
    }

    /// Resolve the identity of `asset_name` within `item`.
    pub fn resolve(&self, item: &CatalogItem, asset_name: &str) -> Result<AssetIdentity> {
        let asset = item.assets.get(asset_name).ok_or_else(|| {
            ReconcileError::malformed(asset_name, format!("item {} has no such asset", item.id))
        })?;

        let key = self.config_key();
        let block = match asset.extra.get(&key) {
            Some(Value::Object(block)) => block,
            Some(_) => {
                return Err(ReconcileError::malformed(
                    asset_name,
                    format!("{} is not an object", key),
                ))
            }
            None => return Err(ReconcileError::malformed(asset_name, format!("{} missing", key))),
        };

        let scope = self.required_str(block, asset_name, "scope")?;
        let name = self.required_str(block, asset_name, "name")?;
        let host = self.optional_str(block, asset_name, "host")?;
        let scheme = self
            .optional_str(block, asset_name, "scheme")?
            .unwrap_or_else(|| self.default_scheme.clone());
        let checksum = self.optional_str(block, asset_name, "checksum")?;

        let size_key = self.field_key("size");
        let size = match block.get(&size_key) {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.as_u64().ok_or_else(|| {
                ReconcileError::malformed(
                    asset_name,
                    format!("{} must be a non-negative integer", size_key),
                )
            })?),
        };

        Ok(AssetIdentity {
            identity: ReplicationIdentity { scope, name },
            host,
            scheme,
            size,
            checksum,
        })
    }

    fn required_str(&self, block: &Map<String, Value>, asset: &str, field: &str) -> Result<String> {
        let key = self.field_key(field);
        match self.optional_str(block, asset, field)? {
            Some(v) if !v.is_empty() => Ok(v),
            Some(_) => Err(ReconcileError::malformed(asset, format!("{} is empty", key))),
            None => Err(ReconcileError::malformed(asset, format!("{} missing", key))),
        }
    }

    fn optional_str(
        &self,
        block: &Map<String, Value>,
        asset: &str,
        field: &str,
    ) -> Result<Option<String>> {
        let key = self.field_key(field);
        match block.get(&key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(ReconcileError::malformed(asset, format!("{} must be a string", key))),
        }
    }
}
