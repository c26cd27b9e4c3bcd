//! Directory service interface.
//!
//! The directory service is the external system that tracks replicas and
//! replication rules. The engine only talks to it through [`DirectoryService`].
//! [`MemoryDirectory`] is an in-memory implementation for tests and dry runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::expression::{ExpressionError, LocationExpression, LocationUniverse};
use crate::identity::ReplicationIdentity;
use crate::rules::RuleState;

/// Errors reported by a directory service.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// The object being created already exists.
    #[error("already exists: {what}")]
    AlreadyExists {
        /// Description of the conflicting object.
        what: String,
    },
    /// The object does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// Description of the missing object.
        what: String,
    },
    /// The service could not be reached or failed internally.
    #[error("service unavailable: {msg}")]
    Unavailable {
        /// Error message from the transport or service.
        msg: String,
    },
    /// A location expression was rejected.
    #[error("invalid location expression {expr:?}: {source}")]
    InvalidExpression {
        /// The expression as sent.
        expr: String,
        /// Parse failure.
        #[source]
        source: ExpressionError,
    },
}

/// Parse `expr`, tagging a failure with the offending expression.
fn parse_expression(expr: &str) -> Result<LocationExpression, DirectoryError> {
    LocationExpression::parse(expr).map_err(|source| DirectoryError::InvalidExpression {
        expr: expr.to_string(),
        source,
    })
}

/// The account a directory session is authenticated as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account name.
    pub account: String,
}

/// Replicas of one identity as reported by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaRecord {
    /// Identity the record describes.
    pub identity: ReplicationIdentity,
    /// Size in bytes, if known.
    pub bytes: Option<u64>,
    /// Checksum, if known.
    pub checksum: Option<String>,
    /// Location name -> physical paths, after scheme and location filtering.
    pub locations: BTreeMap<String, Vec<String>>,
}

/// A replication rule as reported by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleRecord {
    /// Service-assigned rule identifier.
    pub id: String,
    /// Identity the rule covers.
    pub identity: ReplicationIdentity,
    /// Number of copies to maintain.
    pub copies: u32,
    /// Destination location expression.
    pub location_expression: String,
    /// Current lifecycle state.
    pub state: RuleState,
}

/// Filter for listing replication rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleFilter {
    /// Only rules for these identities. Empty means all.
    pub identities: Vec<ReplicationIdentity>,
    /// Only rules whose destination matches this expression.
    pub location_expression: Option<String>,
    /// Only rules in this state.
    pub state: Option<RuleState>,
}

/// Operations the engine needs from the directory service.
#[async_trait]
pub trait DirectoryService: Send + Sync {
    /// Returns the account the session is authenticated as.
    async fn whoami(&self) -> Result<Account, DirectoryError>;

    /// Lists replicas of `identities` advertised over any of `schemes`,
    /// restricted to locations matching `location_expression` if given.
    ///
    /// Identities known to the service are returned even when no location
    /// survives the filters; unknown identities are omitted.
    async fn list_replicas(
        &self,
        identities: &[ReplicationIdentity],
        schemes: &[String],
        location_expression: Option<&str>,
    ) -> Result<Vec<ReplicaRecord>, DirectoryError>;

    /// Registers a replica of `identity` at `location`.
    async fn add_replica(
        &self,
        location: &str,
        identity: &ReplicationIdentity,
        physical_path: &str,
        size: Option<u64>,
        checksum: Option<&str>,
    ) -> Result<(), DirectoryError>;

    /// Creates one rule per identity. Returns the new rule identifiers.
    async fn add_replication_rule(
        &self,
        identities: &[ReplicationIdentity],
        copies: u32,
        location_expression: &str,
    ) -> Result<Vec<String>, DirectoryError>;

    /// Deletes a rule by identifier.
    async fn delete_replication_rule(&self, rule_id: &str) -> Result<(), DirectoryError>;

    /// Lists rules matching `filter`.
    async fn list_replication_rules(
        &self,
        filter: &RuleFilter,
    ) -> Result<Vec<RuleRecord>, DirectoryError>;
}

/// Call counters for the in-memory directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryDirectoryStats {
    /// Number of `list_replicas` calls.
    pub list_replica_calls: u64,
    /// Number of `add_replica` calls.
    pub add_replica_calls: u64,
    /// Number of `add_replication_rule` calls.
    pub add_rule_calls: u64,
    /// Number of `delete_replication_rule` calls.
    pub delete_rule_calls: u64,
    /// Number of `list_replication_rules` calls.
    pub list_rule_calls: u64,
}

#[derive(Debug, Default)]
struct StoredReplica {
    bytes: Option<u64>,
    checksum: Option<String>,
    paths: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct DirectoryState {
    universe: LocationUniverse,
    base_urls: BTreeMap<String, String>,
    replicas: BTreeMap<ReplicationIdentity, StoredReplica>,
    rules: BTreeMap<String, RuleRecord>,
    next_rule_id: u64,
    unavailable: bool,
    stale_reads: bool,
    stats: MemoryDirectoryStats,
}

impl DirectoryState {
    fn check_available(&self) -> Result<(), DirectoryError> {
        if self.unavailable {
            return Err(DirectoryError::Unavailable {
                msg: "directory marked unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn copies_at(&self, identity: &ReplicationIdentity, targets: &BTreeSet<String>) -> usize {
        self.replicas
            .get(identity)
            .map(|r| r.paths.keys().filter(|l| targets.contains(*l)).count())
            .unwrap_or(0)
    }

    fn rule_matches(&self, rule: &RuleRecord, filter: &RuleFilter, wanted: Option<&BTreeSet<String>>) -> bool {
        if !filter.identities.is_empty() && !filter.identities.contains(&rule.identity) {
            return false;
        }
        if let Some(state) = &filter.state {
            if &rule.state != state {
                return false;
            }
        }
        match (&filter.location_expression, wanted) {
            (Some(expr), Some(wanted)) => {
                if &rule.location_expression == expr {
                    return true;
                }
                match LocationExpression::parse(&rule.location_expression) {
                    Ok(dest) => {
                        let dest = dest.resolve(&self.universe);
                        !dest.is_empty() && dest.is_subset(wanted)
                    }
                    Err(_) => false,
                }
            }
            _ => true,
        }
    }
}

/// In-memory directory service.
pub struct MemoryDirectory {
    account: String,
    state: Mutex<DirectoryState>,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new("root")
    }
}

impl MemoryDirectory {
    /// Create an empty directory whose session belongs to `account`.
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            state: Mutex::new(DirectoryState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DirectoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a storage location with a base URL and attributes.
    pub fn add_location(&self, name: &str, base_url: &str, attributes: &[(&str, &str)]) {
        let mut state = self.lock();
        state.universe.insert(
            name.to_string(),
            attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        state
            .base_urls
            .insert(name.to_string(), base_url.trim_end_matches('/').to_string());
    }

    /// Make every call fail with `Unavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// While set, list calls report nothing, as if another caller's writes
    /// were not yet visible. Creates still see the true state.
    pub fn set_stale_reads(&self, stale: bool) {
        self.lock().stale_reads = stale;
    }

    /// Force a rule into `state`. Returns false if the rule does not exist.
    pub fn set_rule_state(&self, rule_id: &str, state: RuleState) -> bool {
        let mut guard = self.lock();
        match guard.rules.get_mut(rule_id) {
            Some(rule) => {
                rule.state = state;
                true
            }
            None => false,
        }
    }

    /// Finish a rule: materialize replicas at its destination locations and
    /// mark it `OK`. Returns false if the rule does not exist.
    pub fn complete_rule(&self, rule_id: &str) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(rule) = state.rules.get_mut(rule_id) else {
            return false;
        };
        let targets = LocationExpression::parse(&rule.location_expression)
            .map(|e| e.resolve(&state.universe))
            .unwrap_or_default();
        let replica = state.replicas.entry(rule.identity.clone()).or_default();
        for location in targets.iter().take(rule.copies as usize) {
            let base = state
                .base_urls
                .get(location)
                .cloned()
                .unwrap_or_else(|| format!("https://{}:443", location.to_lowercase()));
            replica.paths.entry(location.clone()).or_insert_with(|| {
                format!("{}/{}/{}", base, rule.identity.scope, rule.identity.name)
            });
        }
        rule.state = RuleState::Ok;
        true
    }

    /// All rules currently held, ordered by id.
    pub fn rules(&self) -> Vec<RuleRecord> {
        self.lock().rules.values().cloned().collect()
    }

    /// Number of replica records (location entries) held for `identity`.
    pub fn replica_count(&self, identity: &ReplicationIdentity) -> usize {
        self.lock()
            .replicas
            .get(identity)
            .map(|r| r.paths.len())
            .unwrap_or(0)
    }

    /// Call counters.
    pub fn stats(&self) -> MemoryDirectoryStats {
        self.lock().stats.clone()
    }
}

fn scheme_of(path: &str) -> Option<&str> {
    path.split_once("://").map(|(scheme, _)| scheme)
}

#[async_trait]
impl DirectoryService for MemoryDirectory {
    async fn whoami(&self) -> Result<Account, DirectoryError> {
        self.lock().check_available()?;
        Ok(Account {
            account: self.account.clone(),
        })
    }

    async fn list_replicas(
        &self,
        identities: &[ReplicationIdentity],
        schemes: &[String],
        location_expression: Option<&str>,
    ) -> Result<Vec<ReplicaRecord>, DirectoryError> {
        let mut state = self.lock();
        state.check_available()?;
        state.stats.list_replica_calls += 1;
        if state.stale_reads {
            return Ok(Vec::new());
        }
        let wanted = match location_expression {
            Some(expr) => Some(parse_expression(expr)?.resolve(&state.universe)),
            None => None,
        };

        let mut records = Vec::new();
        for identity in identities {
            let Some(stored) = state.replicas.get(identity) else {
                continue;
            };
            let locations = stored
                .paths
                .iter()
                .filter(|(loc, _)| wanted.as_ref().map_or(true, |w| w.contains(*loc)))
                .filter(|(_, path)| {
                    schemes.is_empty()
                        || scheme_of(path).map_or(false, |s| schemes.iter().any(|w| w == s))
                })
                .map(|(loc, path)| (loc.clone(), vec![path.clone()]))
                .collect();
            records.push(ReplicaRecord {
                identity: identity.clone(),
                bytes: stored.bytes,
                checksum: stored.checksum.clone(),
                locations,
            });
        }
        Ok(records)
    }

    async fn add_replica(
        &self,
        location: &str,
        identity: &ReplicationIdentity,
        physical_path: &str,
        size: Option<u64>,
        checksum: Option<&str>,
    ) -> Result<(), DirectoryError> {
        let mut state = self.lock();
        state.check_available()?;
        state.stats.add_replica_calls += 1;
        if !state.universe.contains_key(location) {
            state.universe.insert(location.to_string(), BTreeMap::new());
        }
        let stored = state.replicas.entry(identity.clone()).or_default();
        if stored.paths.contains_key(location) {
            return Err(DirectoryError::AlreadyExists {
                what: format!("replica {} at {}", identity, location),
            });
        }
        stored.paths.insert(location.to_string(), physical_path.to_string());
        if size.is_some() {
            stored.bytes = size;
        }
        if let Some(checksum) = checksum {
            stored.checksum = Some(checksum.to_string());
        }
        debug!(identity = %identity, location, "memory directory: replica added");
        Ok(())
    }

    async fn add_replication_rule(
        &self,
        identities: &[ReplicationIdentity],
        copies: u32,
        location_expression: &str,
    ) -> Result<Vec<String>, DirectoryError> {
        let mut state = self.lock();
        state.check_available()?;
        state.stats.add_rule_calls += 1;
        let targets = parse_expression(location_expression)?.resolve(&state.universe);

        if let Some(dup) = state.rules.values().find(|r| {
            r.location_expression == location_expression && identities.contains(&r.identity)
        }) {
            return Err(DirectoryError::AlreadyExists {
                what: format!("rule for {} at {}", dup.identity, location_expression),
            });
        }

        let mut ids = Vec::with_capacity(identities.len());
        for identity in identities {
            state.next_rule_id += 1;
            let id = format!("rule-{:08}", state.next_rule_id);
            let satisfied = state.copies_at(identity, &targets) >= copies as usize;
            let rule = RuleRecord {
                id: id.clone(),
                identity: identity.clone(),
                copies,
                location_expression: location_expression.to_string(),
                state: if satisfied {
                    RuleState::Ok
                } else {
                    RuleState::Replicating
                },
            };
            state.rules.insert(id.clone(), rule);
            ids.push(id);
        }
        Ok(ids)
    }

    async fn delete_replication_rule(&self, rule_id: &str) -> Result<(), DirectoryError> {
        let mut state = self.lock();
        state.check_available()?;
        state.stats.delete_rule_calls += 1;
        state
            .rules
            .remove(rule_id)
            .map(|_| ())
            .ok_or_else(|| DirectoryError::NotFound {
                what: format!("rule {}", rule_id),
            })
    }

    async fn list_replication_rules(
        &self,
        filter: &RuleFilter,
    ) -> Result<Vec<RuleRecord>, DirectoryError> {
        let mut state = self.lock();
        state.check_available()?;
        state.stats.list_rule_calls += 1;
        if state.stale_reads {
            return Ok(Vec::new());
        }
        let wanted = match &filter.location_expression {
            Some(expr) => Some(parse_expression(expr)?.resolve(&state.universe)),
            None => None,
        };
        Ok(state
            .rules
            .values()
            .filter(|r| state.rule_matches(r, filter, wanted.as_ref()))
            .cloned()
            .collect())
    }
}
