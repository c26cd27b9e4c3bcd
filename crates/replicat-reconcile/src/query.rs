//! Replica lookup.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::directory::DirectoryService;
use crate::error::Result;
use crate::identity::AssetIdentity;

/// One location holding a replica, with the path it is reachable at.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaLocation {
    /// Storage location name.
    pub location: String,
    /// Physical access path at that location.
    pub path: String,
}

/// Read-only queries for existing replicas.
#[derive(Clone)]
pub struct ReplicaQuery {
    directory: Arc<dyn DirectoryService>,
}

impl ReplicaQuery {
    /// Create a query helper over `directory`.
    pub fn new(directory: Arc<dyn DirectoryService>) -> Self {
        Self { directory }
    }

    /// Locations holding `identity` over its scheme, optionally restricted
    /// to locations matching `location_filter`.
    ///
    /// An identity unknown to the directory and an identity known but absent
    /// at the filtered locations both yield an empty list.
    pub async fn find_replicas(
        &self,
        identity: &AssetIdentity,
        location_filter: Option<&str>,
    ) -> Result<Vec<ReplicaLocation>> {
        let records = self
            .directory
            .list_replicas(
                std::slice::from_ref(&identity.identity),
                std::slice::from_ref(&identity.scheme),
                location_filter,
            )
            .await?;

        let mut found: Vec<ReplicaLocation> = records
            .into_iter()
            .filter(|r| r.identity == identity.identity)
            .flat_map(|r| r.locations.into_iter())
            .filter_map(|(location, paths)| {
                paths
                    .into_iter()
                    .next()
                    .map(|path| ReplicaLocation { location, path })
            })
            .collect();
        found.sort();
        found.dedup_by(|a, b| a.location == b.location);

        debug!(
            identity = %identity.identity,
            filter = location_filter.unwrap_or("*"),
            found = found.len(),
            "replica lookup"
        );
        Ok(found)
    }
}
