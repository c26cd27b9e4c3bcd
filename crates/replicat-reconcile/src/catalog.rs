//! Catalog items and the binder that writes replica locations back into them.
//!
//! Items are structural JSON documents owned by the external catalog. Fields
//! the engine does not understand are carried through untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{ReconcileError, Result};
use crate::identity::{AssetIdentity, IdentityResolver};
use crate::query::ReplicaLocation;

/// A catalog entry with named asset records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    /// Stable catalog identifier. Unrelated to replication identities.
    pub id: String,
    /// Asset records by name.
    #[serde(default)]
    pub assets: BTreeMap<String, Asset>,
    /// Remaining catalog fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One named payload within a catalog item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    /// Primary access path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    /// Human readable title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Storage location name -> physical path, written by the binder.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub alternate: BTreeMap<String, String>,
    /// Remaining asset fields, including the embedded identity block.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CatalogItem {
    /// Create an item with no assets.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            assets: BTreeMap::new(),
            extra: Map::new(),
        }
    }

    /// Parse an item from its JSON document.
    pub fn from_json(doc: &str) -> Result<Self> {
        Ok(serde_json::from_str(doc)?)
    }

    /// Serialize the item back into its JSON document.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Recorded alternate path of `asset` at `location`, if any.
    pub fn alternate_path(&self, asset: &str, location: &str) -> Option<&str> {
        self.assets
            .get(asset)
            .and_then(|a| a.alternate.get(location))
            .map(String::as_str)
    }
}

/// Reads identity metadata out of items and writes discovered locations back in.
#[derive(Debug, Clone, Default)]
pub struct CatalogBinder {
    resolver: IdentityResolver,
}

impl CatalogBinder {
    /// Create a binder that reads identities with `resolver`.
    pub fn new(resolver: IdentityResolver) -> Self {
        Self { resolver }
    }

    /// Read the embedded identity of `asset` back out of `item`.
    pub fn embedded_identity(&self, item: &CatalogItem, asset: &str) -> Result<AssetIdentity> {
        self.resolver.resolve(item, asset)
    }

    /// Record each replica location as an alternate access point on `asset`.
    ///
    /// Entries for the same location are overwritten; other entries are kept.
    /// Returns the number of locations written.
    pub fn bind_alternates(
        &self,
        item: &mut CatalogItem,
        asset: &str,
        replicas: &[ReplicaLocation],
    ) -> Result<usize> {
        let record = item.assets.get_mut(asset).ok_or_else(|| {
            ReconcileError::malformed(asset, format!("item {} has no such asset", item.id))
        })?;
        for replica in replicas {
            record
                .alternate
                .insert(replica.location.clone(), replica.path.clone());
        }
        debug!(item = %item.id, asset, count = replicas.len(), "bound alternate locations");
        Ok(replicas.len())
    }
}
