//! Replica registration.
//!
//! `ensure_replica` is check-then-create. The check and the create are not
//! atomic, so two callers can both see the replica missing; the directory's
//! "already exists" answer on create is taken as success.

use std::sync::Arc;

use tracing::{debug, info};

use crate::directory::{DirectoryError, DirectoryService};
use crate::error::{EnsureOutcome, Result};
use crate::identity::AssetIdentity;
use crate::query::ReplicaQuery;

/// Port assumed for schemes without a well-known default.
pub const DEFAULT_PORT: u16 = 443;

/// Well-known port of a transport scheme.
pub fn scheme_port(scheme: &str) -> Option<u16> {
    match scheme {
        "https" | "davs" | "s3s" => Some(443),
        "http" | "dav" | "s3" => Some(80),
        "root" | "xroot" => Some(1094),
        "gsiftp" => Some(2811),
        "srm" => Some(8443),
        _ => None,
    }
}

/// Rewrite `path` so its authority carries an explicit port.
///
/// Paths without a `scheme://` prefix and paths that already name a port are
/// returned unchanged.
pub fn normalize_physical_path(path: &str, default_port: u16) -> String {
    let Some((scheme, rest)) = path.split_once("://") else {
        return path.to_string();
    };
    let auth_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let (authority, tail) = rest.split_at(auth_end);
    if authority.is_empty() {
        return path.to_string();
    }
    let host = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
    let has_port = match host.rfind(']') {
        // [v6]:port
        Some(close) => host[close + 1..].starts_with(':'),
        None => host.contains(':'),
    };
    if has_port {
        return path.to_string();
    }
    let port = scheme_port(scheme).unwrap_or(default_port);
    format!("{}://{}:{}{}", scheme, authority, port, tail)
}

/// Registers replicas at source locations.
#[derive(Clone)]
pub struct ReplicaRegistrar {
    directory: Arc<dyn DirectoryService>,
    query: ReplicaQuery,
    default_port: u16,
}

impl ReplicaRegistrar {
    /// Create a registrar over `directory`.
    pub fn new(directory: Arc<dyn DirectoryService>, default_port: u16) -> Self {
        Self {
            query: ReplicaQuery::new(directory.clone()),
            directory,
            default_port,
        }
    }

    /// Make sure a replica of `identity` is recorded at `source_location`.
    ///
    /// `size` and `checksum` fall back to the values in the identity block.
    pub async fn ensure_replica(
        &self,
        identity: &AssetIdentity,
        source_location: &str,
        physical_path: &str,
        size: Option<u64>,
        checksum: Option<&str>,
    ) -> Result<EnsureOutcome> {
        let existing = self
            .query
            .find_replicas(identity, Some(source_location))
            .await?;
        if !existing.is_empty() {
            debug!(
                identity = %identity.identity,
                location = source_location,
                "replica already registered"
            );
            return Ok(EnsureOutcome::AlreadyPresent);
        }

        let path = normalize_physical_path(physical_path, self.default_port);
        let size = size.or(identity.size);
        let checksum = checksum.or(identity.checksum.as_deref());
        match self
            .directory
            .add_replica(source_location, &identity.identity, &path, size, checksum)
            .await
        {
            Ok(()) => {
                info!(
                    identity = %identity.identity,
                    location = source_location,
                    path = %path,
                    "replica registered"
                );
                Ok(EnsureOutcome::Created)
            }
            Err(DirectoryError::AlreadyExists { what }) => {
                debug!(identity = %identity.identity, %what, "concurrent replica create, ignoring");
                Ok(EnsureOutcome::DuplicateCreateIgnored)
            }
            Err(e) => Err(e.into()),
        }
    }
}
