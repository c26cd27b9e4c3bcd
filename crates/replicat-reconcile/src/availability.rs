//! Availability tracking across batches of catalog items.
//!
//! Turns the asynchronous progress of replication rules into a per-batch
//! summary and the set of identities that are safe to fetch. Items are mapped
//! to rules only through their replication identities; the catalog id of an
//! item plays no part in matching.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::batch::BatchOutcome;
use crate::catalog::CatalogItem;
use crate::directory::RuleRecord;
use crate::error::Result;
use crate::identity::{IdentityResolver, ReplicationIdentity};
use crate::rules::{RuleManager, RuleState};

/// Rule counts per lifecycle state for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AvailabilitySummary {
    /// Rules in `OK`.
    pub ok: usize,
    /// Rules in `STUCK`.
    pub stuck: usize,
    /// Rules in `REPLICATING`.
    pub replicating: usize,
    /// Rules in states this engine does not know, by state name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unrecognized: BTreeMap<String, usize>,
    /// Number of matching rules.
    #[serde(rename = "Total")]
    pub total: usize,
}

impl AvailabilitySummary {
    /// Count `rules` by state.
    pub fn from_rules<'a>(rules: impl IntoIterator<Item = &'a RuleRecord>) -> Self {
        let mut summary = Self::default();
        for rule in rules {
            match &rule.state {
                RuleState::Ok => summary.ok += 1,
                RuleState::Stuck => summary.stuck += 1,
                RuleState::Replicating => summary.replicating += 1,
                RuleState::Unrecognized(s) => *summary.unrecognized.entry(s.clone()).or_default() += 1,
            }
            summary.total += 1;
        }
        summary
    }

    /// Returns true if any rule is stuck or in an unknown state.
    pub fn requires_attention(&self) -> bool {
        self.stuck > 0 || !self.unrecognized.is_empty()
    }

    /// Format as a one-line summary.
    pub fn summary_line(&self) -> String {
        let mut line = format!(
            "{} rules: {} OK, {} REPLICATING, {} STUCK",
            self.total, self.ok, self.replicating, self.stuck
        );
        for (state, n) in &self.unrecognized {
            line.push_str(&format!(", {} {}", n, state));
        }
        line
    }
}

/// Aggregates rule state for batches of items.
#[derive(Clone)]
pub struct AvailabilityTracker {
    rules: RuleManager,
    resolver: IdentityResolver,
}

impl AvailabilityTracker {
    /// Create a tracker.
    pub fn new(rules: RuleManager, resolver: IdentityResolver) -> Self {
        Self { rules, resolver }
    }

    /// Every identity carried by `items`.
    ///
    /// Assets without an identity block are not replicated and are skipped.
    /// Assets with a malformed block are reported against their item.
    pub fn identities(&self, items: &[CatalogItem]) -> BatchOutcome<BTreeSet<ReplicationIdentity>> {
        let key = self.resolver.config_key();
        let mut outcome = BatchOutcome::new(BTreeSet::new());
        for item in items {
            for (name, asset) in &item.assets {
                if !asset.extra.contains_key(&key) {
                    continue;
                }
                match self.resolver.resolve(item, name) {
                    Ok(id) => {
                        outcome.value.insert(id.identity);
                    }
                    Err(e) => {
                        warn!(item = %item.id, asset = %name, error = %e, "skipping asset");
                        outcome.push_error(&item.id, Some(name.as_str()), e);
                    }
                }
            }
        }
        outcome
    }

    /// One snapshot of the rules covering `items` at `location_expression`.
    async fn snapshot(
        &self,
        items: &[CatalogItem],
        location_expression: &str,
    ) -> Result<BatchOutcome<Vec<RuleRecord>>> {
        let ids = self.identities(items);
        let wanted: Vec<ReplicationIdentity> = ids.value.iter().cloned().collect();
        let rules = self.rules.rules_for(&wanted, location_expression, None).await?;
        Ok(ids.map(|_| rules))
    }

    /// Count the rules covering `items` at `location_expression`, by state.
    pub async fn summarize(
        &self,
        items: &[CatalogItem],
        location_expression: &str,
    ) -> Result<BatchOutcome<AvailabilitySummary>> {
        let snapshot = self.snapshot(items, location_expression).await?;
        let outcome = snapshot.map(|rules| AvailabilitySummary::from_rules(&rules));
        debug!(
            location = location_expression,
            summary = %outcome.value.summary_line(),
            "availability summary"
        );
        Ok(outcome)
    }

    /// Identities from `items` with an `OK` rule at `location_expression`.
    ///
    /// An identity is available when its best matching rule is `OK`; any
    /// `OK` rule means the copies exist regardless of other, newer rules.
    pub async fn available_identities(
        &self,
        items: &[CatalogItem],
        location_expression: &str,
    ) -> Result<BatchOutcome<BTreeSet<ReplicationIdentity>>> {
        let snapshot = self.snapshot(items, location_expression).await?;
        Ok(snapshot.map(|rules| {
            rules
                .into_iter()
                .filter(|r| r.state.is_ok())
                .map(|r| r.identity)
                .collect()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DirectoryService, MemoryDirectory};
    use serde_json::json;
    use std::sync::Arc;

    fn item(id: &str, assets: &[(&str, &str)]) -> CatalogItem {
        let mut map = serde_json::Map::new();
        for (asset, name) in assets {
            map.insert(
                asset.to_string(),
                json!({"replication:config": {
                    "replication:scope": "exp",
                    "replication:name": name
                }}),
            );
        }
        serde_json::from_value(json!({"id": id, "assets": map})).unwrap()
    }

    fn tracker(dir: &Arc<MemoryDirectory>) -> AvailabilityTracker {
        AvailabilityTracker::new(RuleManager::new(dir.clone()), IdentityResolver::default())
    }

    fn rid(name: &str) -> ReplicationIdentity {
        ReplicationIdentity::new("exp", name)
    }

    async fn rule(dir: &MemoryDirectory, name: &str, expr: &str, state: RuleState) -> String {
        let ids = dir.add_replication_rule(&[rid(name)], 1, expr).await.unwrap();
        dir.set_rule_state(&ids[0], state);
        ids[0].clone()
    }

    mod summary {
        use super::*;

        #[test]
        fn test_partition_and_line() {
            let rules = vec![
                RuleRecord {
                    id: "1".into(),
                    identity: rid("a"),
                    copies: 1,
                    location_expression: "S".into(),
                    state: RuleState::Ok,
                },
                RuleRecord {
                    id: "2".into(),
                    identity: rid("b"),
                    copies: 1,
                    location_expression: "S".into(),
                    state: RuleState::Stuck,
                },
            ];
            let s = AvailabilitySummary::from_rules(&rules);
            assert_eq!(s.ok + s.stuck + s.replicating, s.total);
            assert!(s.requires_attention());
            assert_eq!(s.summary_line(), "2 rules: 1 OK, 0 REPLICATING, 1 STUCK");
        }

        #[test]
        fn test_serialized_keys() {
            let s = AvailabilitySummary {
                ok: 1,
                total: 1,
                ..Default::default()
            };
            let v = serde_json::to_value(&s).unwrap();
            assert_eq!(v, json!({"OK": 1, "STUCK": 0, "REPLICATING": 0, "Total": 1}));
        }

        #[tokio::test]
        async fn test_counts_rules_not_items() {
            let dir = Arc::new(MemoryDirectory::default());
            rule(&dir, "a", "SITE2", RuleState::Ok).await;
            rule(&dir, "b", "SITE2", RuleState::Replicating).await;
            rule(&dir, "c", "SITE2", RuleState::Stuck).await;
            rule(&dir, "a", "SITE3", RuleState::Ok).await;

            // One item carrying two replicated assets, one item with one.
            let items = vec![item("X", &[("data", "a"), ("meta", "b")]), item("Y", &[("data", "c")])];
            let outcome = tracker(&dir).summarize(&items, "SITE2").await.unwrap();
            let s = outcome.value;
            assert_eq!((s.ok, s.replicating, s.stuck, s.total), (1, 1, 1, 3));
            assert!(outcome.errors.is_empty());
        }

        #[tokio::test]
        async fn test_unrecognized_state_surfaced() {
            let dir = Arc::new(MemoryDirectory::default());
            rule(&dir, "a", "SITE2", RuleState::from("SUSPENDED")).await;
            let outcome = tracker(&dir)
                .summarize(&[item("X", &[("data", "a")])], "SITE2")
                .await
                .unwrap();
            assert_eq!(outcome.value.unrecognized.get("SUSPENDED"), Some(&1));
            assert_eq!(outcome.value.total, 1);
            assert!(outcome.value.requires_attention());
        }

        #[tokio::test]
        async fn test_single_snapshot_per_call() {
            let dir = Arc::new(MemoryDirectory::default());
            let items: Vec<CatalogItem> = (0..20)
                .map(|i| item(&format!("I{i}"), &[("data", format!("n{i}").as_str())]))
                .collect();
            tracker(&dir).summarize(&items, "SITE2").await.unwrap();
            assert_eq!(dir.stats().list_rule_calls, 1);
        }

        #[tokio::test]
        async fn test_malformed_item_does_not_abort_batch() {
            let dir = Arc::new(MemoryDirectory::default());
            rule(&dir, "a", "SITE2", RuleState::Ok).await;
            let bad: CatalogItem = serde_json::from_value(json!({
                "id": "BAD",
                "assets": {"data": {"replication:config": {"replication:scope": "exp"}}}
            }))
            .unwrap();
            let outcome = tracker(&dir)
                .summarize(&[bad, item("X", &[("data", "a")])], "SITE2")
                .await
                .unwrap();
            assert_eq!(outcome.value.total, 1);
            assert_eq!(outcome.failed_item_ids(), vec!["BAD"]);
        }

        #[tokio::test]
        async fn test_no_identities_no_rules() {
            let dir = Arc::new(MemoryDirectory::default());
            rule(&dir, "a", "SITE2", RuleState::Ok).await;
            let plain: CatalogItem =
                serde_json::from_value(json!({"id": "P", "assets": {"thumb": {"href": "x"}}})).unwrap();
            let outcome = tracker(&dir).summarize(&[plain], "SITE2").await.unwrap();
            assert_eq!(outcome.value.total, 0);
            assert!(outcome.all_succeeded());
        }
    }

    mod available {
        use super::*;

        #[tokio::test]
        async fn test_only_ok_identities() {
            let dir = Arc::new(MemoryDirectory::default());
            rule(&dir, "a", "SITE2", RuleState::Ok).await;
            rule(&dir, "b", "SITE2", RuleState::Replicating).await;
            rule(&dir, "c", "SITE2", RuleState::Stuck).await;
            let items = vec![
                item("X", &[("data", "a")]),
                item("Y", &[("data", "b")]),
                item("Z", &[("data", "c")]),
                item("W", &[("data", "d")]),
            ];
            let outcome = tracker(&dir)
                .available_identities(&items, "SITE2")
                .await
                .unwrap();
            assert_eq!(outcome.value, BTreeSet::from([rid("a")]));
        }

        #[tokio::test]
        async fn test_ok_elsewhere_does_not_count() {
            let dir = Arc::new(MemoryDirectory::default());
            rule(&dir, "a", "SITE3", RuleState::Ok).await;
            let outcome = tracker(&dir)
                .available_identities(&[item("X", &[("data", "a")])], "SITE2")
                .await
                .unwrap();
            assert!(outcome.value.is_empty());
        }

        #[tokio::test]
        async fn test_shared_identity_across_items() {
            let dir = Arc::new(MemoryDirectory::default());
            rule(&dir, "shared", "SITE2", RuleState::Ok).await;
            let items = vec![item("X", &[("data", "shared")]), item("Y", &[("data", "shared")])];
            let t = tracker(&dir);
            let outcome = t.available_identities(&items, "SITE2").await.unwrap();
            assert_eq!(outcome.value.len(), 1);
            let summary = t.summarize(&items, "SITE2").await.unwrap();
            assert_eq!(summary.value.total, 1);
        }
    }
}
