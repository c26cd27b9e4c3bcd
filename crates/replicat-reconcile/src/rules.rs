//! Replication rules: creation, deletion and lifecycle states.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::directory::{DirectoryError, DirectoryService, RuleFilter, RuleRecord};
use crate::error::{EnsureOutcome, Result};
use crate::identity::ReplicationIdentity;

/// Lifecycle state of a replication rule, as reported by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RuleState {
    /// Copies are being made.
    Replicating,
    /// Progress is blocked; needs an operator decision.
    Stuck,
    /// All requested copies exist.
    Ok,
    /// A state this engine does not know, kept verbatim.
    Unrecognized(String),
}

impl RuleState {
    /// Wire name of the state.
    pub fn as_str(&self) -> &str {
        match self {
            RuleState::Replicating => "REPLICATING",
            RuleState::Stuck => "STUCK",
            RuleState::Ok => "OK",
            RuleState::Unrecognized(s) => s,
        }
    }

    /// Returns true for the terminal success state.
    pub fn is_ok(&self) -> bool {
        matches!(self, RuleState::Ok)
    }
}

impl From<&str> for RuleState {
    fn from(s: &str) -> Self {
        match s {
            "REPLICATING" => RuleState::Replicating,
            "STUCK" => RuleState::Stuck,
            "OK" => RuleState::Ok,
            other => RuleState::Unrecognized(other.to_string()),
        }
    }
}

impl From<String> for RuleState {
    fn from(s: String) -> Self {
        RuleState::from(s.as_str())
    }
}

impl From<RuleState> for String {
    fn from(state: RuleState) -> Self {
        state.as_str().to_string()
    }
}

impl fmt::Display for RuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Creates, lists and deletes replication rules.
#[derive(Clone)]
pub struct RuleManager {
    directory: Arc<dyn DirectoryService>,
}

impl RuleManager {
    /// Create a rule manager over `directory`.
    pub fn new(directory: Arc<dyn DirectoryService>) -> Self {
        Self { directory }
    }

    /// Make sure a rule keeping `copies` copies of `identity` at
    /// `destination` exists.
    pub async fn ensure_rule(
        &self,
        identity: &ReplicationIdentity,
        destination: &str,
        copies: u32,
    ) -> Result<EnsureOutcome> {
        let existing = self
            .rules_for(std::slice::from_ref(identity), destination, None)
            .await?;
        if let Some(rule) = existing
            .iter()
            .find(|r| &r.identity == identity && r.location_expression == destination)
        {
            // The existing rule is kept as is; copies are not raised or lowered.
            if rule.copies != copies {
                warn!(
                    identity = %identity,
                    destination,
                    rule_id = %rule.id,
                    existing = rule.copies,
                    requested = copies,
                    "rule present with a different copy count, leaving it unchanged"
                );
            } else {
                debug!(identity = %identity, destination, "rule already present");
            }
            return Ok(EnsureOutcome::AlreadyPresent);
        }

        match self
            .directory
            .add_replication_rule(std::slice::from_ref(identity), copies, destination)
            .await
        {
            Ok(ids) => {
                info!(identity = %identity, destination, copies, rule_ids = ?ids, "rule created");
                Ok(EnsureOutcome::Created)
            }
            Err(DirectoryError::AlreadyExists { what }) => {
                debug!(identity = %identity, %what, "concurrent rule create, ignoring");
                Ok(EnsureOutcome::DuplicateCreateIgnored)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Rules for `identities` whose destination matches `location_expression`,
    /// optionally restricted to one state.
    ///
    /// An empty identity list matches nothing.
    pub async fn rules_for(
        &self,
        identities: &[ReplicationIdentity],
        location_expression: &str,
        state: Option<RuleState>,
    ) -> Result<Vec<RuleRecord>> {
        if identities.is_empty() {
            return Ok(Vec::new());
        }
        let filter = RuleFilter {
            identities: identities.to_vec(),
            location_expression: Some(location_expression.to_string()),
            state,
        };
        let mut rules = self.directory.list_replication_rules(&filter).await?;
        rules.retain(|r| identities.contains(&r.identity));
        if let Some(state) = &filter.state {
            rules.retain(|r| &r.state == state);
        }
        Ok(rules)
    }

    /// Delete the rules of `identities` at `location_expression`, optionally
    /// only those in `state_filter`. Returns the ids of deleted rules.
    ///
    /// Rules that vanish between listing and deletion are skipped.
    pub async fn delete_rules(
        &self,
        identities: &[ReplicationIdentity],
        location_expression: &str,
        state_filter: Option<RuleState>,
    ) -> Result<Vec<String>> {
        let rules = self
            .rules_for(identities, location_expression, state_filter)
            .await?;
        let mut deleted = Vec::with_capacity(rules.len());
        for rule in rules {
            match self.directory.delete_replication_rule(&rule.id).await {
                Ok(()) => {
                    info!(rule_id = %rule.id, identity = %rule.identity, state = %rule.state, "rule deleted");
                    deleted.push(rule.id);
                }
                Err(DirectoryError::NotFound { .. }) => {
                    warn!(rule_id = %rule.id, "rule disappeared before delete");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(deleted)
    }
}
