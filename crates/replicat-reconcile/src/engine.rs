//! The reconciliation engine that ties all components together.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use crate::availability::{AvailabilitySummary, AvailabilityTracker};
use crate::batch::BatchOutcome;
use crate::catalog::{CatalogBinder, CatalogItem};
use crate::config::EngineConfig;
use crate::directory::{Account, DirectoryService};
use crate::error::{EnsureOutcome, ReconcileError, Result};
use crate::identity::{AssetIdentity, IdentityResolver, ReplicationIdentity};
use crate::query::{ReplicaLocation, ReplicaQuery};
use crate::registrar::ReplicaRegistrar;
use crate::rules::{RuleManager, RuleState};
use crate::transfer::{TransferRequest, TransferRequestor, TransferService};

/// The reconciliation engine.
///
/// Holds no state of its own besides configuration and collaborator handles;
/// every call recomputes from the directory's current view.
#[derive(Clone)]
pub struct ReconcileEngine {
    config: EngineConfig,
    account: Account,
    binder: CatalogBinder,
    query: ReplicaQuery,
    registrar: ReplicaRegistrar,
    rules: RuleManager,
    tracker: AvailabilityTracker,
    transfer: TransferRequestor,
}

impl ReconcileEngine {
    /// Validate `config`, check the directory session and build the engine.
    pub async fn connect(
        config: EngineConfig,
        directory: Arc<dyn DirectoryService>,
        transfer: Arc<dyn TransferService>,
    ) -> Result<Self> {
        config.validate()?;
        let account = directory.whoami().await?;
        info!(account = %account.account, "directory session established");

        let resolver = IdentityResolver::new(config.metadata_prefix.clone(), config.scheme.clone());
        let binder = CatalogBinder::new(resolver.clone());
        let rules = RuleManager::new(directory.clone());
        Ok(Self {
            account,
            query: ReplicaQuery::new(directory.clone()),
            registrar: ReplicaRegistrar::new(directory, config.default_port),
            tracker: AvailabilityTracker::new(rules.clone(), resolver),
            transfer: TransferRequestor::new(transfer, binder.clone()),
            rules,
            binder,
            config,
        })
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Account the directory session is authenticated as.
    pub fn account(&self) -> &Account {
        &self.account
    }

    /// The catalog binder.
    pub fn binder(&self) -> &CatalogBinder {
        &self.binder
    }

    /// Resolve the identity of `asset` in `item`.
    pub fn resolve(&self, item: &CatalogItem, asset: &str) -> Result<AssetIdentity> {
        self.binder.embedded_identity(item, asset)
    }

    /// See [`ReplicaQuery::find_replicas`].
    pub async fn find_replicas(
        &self,
        identity: &AssetIdentity,
        location_filter: Option<&str>,
    ) -> Result<Vec<ReplicaLocation>> {
        self.query.find_replicas(identity, location_filter).await
    }

    /// See [`ReplicaRegistrar::ensure_replica`].
    pub async fn ensure_replica(
        &self,
        identity: &AssetIdentity,
        source_location: &str,
        physical_path: &str,
        size: Option<u64>,
        checksum: Option<&str>,
    ) -> Result<EnsureOutcome> {
        self.registrar
            .ensure_replica(identity, source_location, physical_path, size, checksum)
            .await
    }

    /// See [`RuleManager::ensure_rule`]. `copies` defaults to the configured value.
    pub async fn ensure_rule(
        &self,
        identity: &ReplicationIdentity,
        destination: &str,
        copies: Option<u32>,
    ) -> Result<EnsureOutcome> {
        let copies = copies.unwrap_or(self.config.default_copies);
        self.rules.ensure_rule(identity, destination, copies).await
    }

    /// See [`RuleManager::delete_rules`].
    pub async fn delete_rules(
        &self,
        identities: &[ReplicationIdentity],
        location_expression: &str,
        state_filter: Option<RuleState>,
    ) -> Result<Vec<String>> {
        self.rules
            .delete_rules(identities, location_expression, state_filter)
            .await
    }

    /// See [`AvailabilityTracker::summarize`].
    pub async fn summarize(
        &self,
        items: &[CatalogItem],
        location_expression: &str,
    ) -> Result<BatchOutcome<AvailabilitySummary>> {
        self.tracker.summarize(items, location_expression).await
    }

    /// See [`AvailabilityTracker::available_identities`].
    pub async fn available_identities(
        &self,
        items: &[CatalogItem],
        location_expression: &str,
    ) -> Result<BatchOutcome<BTreeSet<ReplicationIdentity>>> {
        self.tracker
            .available_identities(items, location_expression)
            .await
    }

    /// See [`TransferRequestor::fetch`].
    pub async fn fetch(
        &self,
        item: &CatalogItem,
        target: &str,
        location: &str,
    ) -> Result<TransferRequest> {
        self.transfer.fetch(item, target, location).await
    }

    /// Fetch the default asset of `item` from `location`.
    pub async fn download(&self, item: &CatalogItem, location: &str) -> Result<TransferRequest> {
        self.fetch(item, &self.config.default_asset, location).await
    }

    /// Look up every replica of `target` in `item` and record them as
    /// alternates. Returns the updated item.
    pub async fn reconcile_asset(&self, mut item: CatalogItem, target: &str) -> Result<CatalogItem> {
        let identity = self.resolve(&item, target)?;
        let replicas = self.query.find_replicas(&identity, None).await?;
        self.binder.bind_alternates(&mut item, target, &replicas)?;
        Ok(item)
    }

    /// [`reconcile_asset`](Self::reconcile_asset) for the default asset.
    pub async fn reconcile_item(&self, item: CatalogItem) -> Result<CatalogItem> {
        let target = self.config.default_asset.clone();
        self.reconcile_asset(item, &target).await
    }

    /// Reconcile many items concurrently.
    ///
    /// Items with malformed identities are reported per item and left out of
    /// the result; successful items keep their input order. A directory
    /// failure aborts the batch.
    pub async fn reconcile_items(
        &self,
        items: Vec<CatalogItem>,
    ) -> Result<BatchOutcome<Vec<CatalogItem>>> {
        let target = self.config.default_asset.as_str();
        let results: Vec<(String, Result<CatalogItem>)> = stream::iter(items)
            .map(|item| async move {
                let id = item.id.clone();
                (id, self.reconcile_asset(item, target).await)
            })
            .buffered(self.config.max_concurrent_lookups)
            .collect()
            .await;

        let mut outcome = BatchOutcome::new(Vec::with_capacity(results.len()));
        for (id, result) in results {
            match result {
                Ok(item) => outcome.value.push(item),
                Err(e) if e.is_per_item() => {
                    warn!(item = %id, error = %e, "reconciliation failed");
                    outcome.push_error(&id, Some(target), e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcome)
    }

    /// Request fetches of `target` from `location` for every item whose
    /// identity has an `OK` rule there.
    ///
    /// `location` is a location expression. Ready items are bound to every
    /// replica it selects and fetched from the first one in name order.
    /// Items not yet available are skipped silently; failures are reported
    /// per item.
    pub async fn fetch_available(
        &self,
        items: &[CatalogItem],
        target: &str,
        location: &str,
    ) -> Result<BatchOutcome<Vec<TransferRequest>>> {
        let available = self.tracker.available_identities(items, location).await?;
        let ready = available.value;
        let mut outcome = BatchOutcome {
            value: Vec::new(),
            errors: available.errors,
        };

        for item in items {
            let already_reported = outcome
                .errors
                .iter()
                .any(|e| e.item_id == item.id && e.asset.as_deref() == Some(target));
            if already_reported {
                continue;
            }
            let identity = match self.resolve(item, target) {
                Ok(identity) => identity,
                Err(e) => {
                    outcome.push_error(&item.id, Some(target), e);
                    continue;
                }
            };
            if !ready.contains(&identity.identity) {
                continue;
            }

            // `location` may select several sites; fetch from the first bound one.
            let replicas = self.query.find_replicas(&identity, Some(location)).await?;
            let mut bound = item.clone();
            let request = match replicas.first() {
                Some(source) => self
                    .binder
                    .bind_alternates(&mut bound, target, &replicas)
                    .and_then(|_| self.transfer.request_for(&bound, target, &source.location)),
                None => Err(ReconcileError::LocationNotResolved {
                    asset: target.to_string(),
                    location: location.to_string(),
                }),
            };
            match request {
                Ok(request) => outcome.value.push(request),
                Err(e) if e.is_per_item() => outcome.push_error(&item.id, Some(target), e),
                Err(e) => return Err(e),
            }
        }

        self.transfer.submit(outcome.value.clone()).await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::transfer::RecordingTransfer;
    use serde_json::json;

    fn item(id: &str, name: &str) -> CatalogItem {
        serde_json::from_value(json!({
            "id": id,
            "assets": {"data": {
                "href": format!("https://origin/{name}"),
                "replication:config": {
                    "replication:scope": "exp",
                    "replication:name": name
                }
            }}
        }))
        .unwrap()
    }

    fn rid(name: &str) -> ReplicationIdentity {
        ReplicationIdentity::new("exp", name)
    }

    async fn engine() -> (Arc<MemoryDirectory>, Arc<RecordingTransfer>, ReconcileEngine) {
        let dir = Arc::new(MemoryDirectory::new("jdoe"));
        dir.add_location("SITE1", "https://site1.example.org:443/store", &[("tier", "disk")]);
        dir.add_location("SITE2", "https://site2.example.org:443/store", &[("tier", "disk")]);
        let transfer = Arc::new(RecordingTransfer::new());
        let engine = ReconcileEngine::connect(EngineConfig::default(), dir.clone(), transfer.clone())
            .await
            .unwrap();
        (dir, transfer, engine)
    }

    mod connect {
        use super::*;

        #[tokio::test]
        async fn test_records_account() {
            let (_dir, _transfer, engine) = engine().await;
            assert_eq!(engine.account().account, "jdoe");
            assert_eq!(engine.config().default_asset, "data");
        }

        #[tokio::test]
        async fn test_unavailable_directory_fails() {
            let dir = Arc::new(MemoryDirectory::default());
            dir.set_unavailable(true);
            let result = ReconcileEngine::connect(
                EngineConfig::default(),
                dir,
                Arc::new(RecordingTransfer::new()),
            )
            .await;
            assert!(matches!(result, Err(ReconcileError::DirectoryUnavailable { .. })));
        }

        #[tokio::test]
        async fn test_invalid_config_fails() {
            let config = EngineConfig {
                max_concurrent_lookups: 0,
                ..Default::default()
            };
            let result = ReconcileEngine::connect(
                config,
                Arc::new(MemoryDirectory::default()),
                Arc::new(RecordingTransfer::new()),
            )
            .await;
            assert!(matches!(result, Err(ReconcileError::Config { .. })));
        }
    }

    mod reconcile {
        use super::*;

        #[tokio::test]
        async fn test_reconcile_item_binds_all_locations() {
            let (_dir, _transfer, engine) = engine().await;
            let a = item("A", "run1");
            let id = engine.resolve(&a, "data").unwrap();
            engine
                .ensure_replica(&id, "SITE1", "https://site1.example.org/store/exp/run1", None, None)
                .await
                .unwrap();
            engine
                .ensure_replica(&id, "SITE2", "https://site2.example.org/store/exp/run1", None, None)
                .await
                .unwrap();

            let a = engine.reconcile_item(a).await.unwrap();
            assert_eq!(
                a.alternate_path("data", "SITE1"),
                Some("https://site1.example.org:443/store/exp/run1")
            );
            assert_eq!(
                a.alternate_path("data", "SITE2"),
                Some("https://site2.example.org:443/store/exp/run1")
            );
        }

        #[tokio::test]
        async fn test_reconcile_items_reports_bad_items() {
            let (_dir, _transfer, engine) = engine().await;
            let bad: CatalogItem =
                serde_json::from_value(json!({"id": "BAD", "assets": {}})).unwrap();
            let items = vec![item("A", "run1"), bad, item("C", "run3")];
            let outcome = engine.reconcile_items(items).await.unwrap();
            let ids: Vec<&str> = outcome.value.iter().map(|i| i.id.as_str()).collect();
            assert_eq!(ids, vec!["A", "C"]);
            assert_eq!(outcome.failed_item_ids(), vec!["BAD"]);
        }

        #[tokio::test]
        async fn test_reconcile_items_aborts_on_directory_failure() {
            let (dir, _transfer, engine) = engine().await;
            dir.set_unavailable(true);
            let result = engine.reconcile_items(vec![item("A", "run1")]).await;
            assert!(matches!(result, Err(ReconcileError::DirectoryUnavailable { .. })));
        }
    }

    mod rules {
        use super::*;

        #[tokio::test]
        async fn test_ensure_rule_uses_default_copies() {
            let config = EngineConfig {
                default_copies: 2,
                ..Default::default()
            };
            let dir = Arc::new(MemoryDirectory::default());
            let engine = ReconcileEngine::connect(config, dir.clone(), Arc::new(RecordingTransfer::new()))
                .await
                .unwrap();
            engine.ensure_rule(&rid("run1"), "tier=disk", None).await.unwrap();
            engine.ensure_rule(&rid("run2"), "SITE1", Some(1)).await.unwrap();
            let rules = dir.rules();
            assert_eq!(rules[0].copies, 2);
            assert_eq!(rules[1].copies, 1);
        }
    }

    mod transfer {
        use super::*;

        #[tokio::test]
        async fn test_download_requires_bound_location() {
            let (_dir, transfer, engine) = engine().await;
            let err = engine.download(&item("A", "run1"), "SITE2").await.unwrap_err();
            assert!(matches!(err, ReconcileError::LocationNotResolved { .. }));
            assert!(transfer.submitted().is_empty());
        }

        #[tokio::test]
        async fn test_fetch_available_only_ready_items() {
            let (dir, transfer, engine) = engine().await;
            let items = vec![item("A", "run1"), item("B", "run2")];
            for it in &items {
                let id = engine.resolve(it, "data").unwrap();
                engine
                    .ensure_replica(&id, "SITE1", "https://site1.example.org/store/x", None, None)
                    .await
                    .unwrap();
                engine.ensure_rule(&id.identity, "SITE2", None).await.unwrap();
            }
            let rule_a = dir
                .rules()
                .into_iter()
                .find(|r| r.identity == rid("run1"))
                .unwrap();
            assert!(dir.complete_rule(&rule_a.id));

            let outcome = engine.fetch_available(&items, "data", "SITE2").await.unwrap();
            assert!(outcome.all_succeeded());
            assert_eq!(outcome.value.len(), 1);
            assert_eq!(outcome.value[0].identity, rid("run1"));
            assert_eq!(
                outcome.value[0].physical_path,
                "https://site2.example.org:443/store/exp/run1"
            );
            assert_eq!(transfer.submitted(), outcome.value);
        }

        #[tokio::test]
        async fn test_fetch_available_by_attribute_expression() {
            let (dir, transfer, engine) = engine().await;
            let a = item("A", "run1");
            let id = engine.resolve(&a, "data").unwrap();
            engine.ensure_rule(&id.identity, "tier=disk", None).await.unwrap();
            assert!(dir.complete_rule(&dir.rules()[0].id));

            let outcome = engine
                .fetch_available(std::slice::from_ref(&a), "data", "tier=disk")
                .await
                .unwrap();
            assert!(outcome.all_succeeded());
            assert_eq!(outcome.value.len(), 1);
            assert_eq!(outcome.value[0].source_location, "SITE1");
            assert_eq!(
                outcome.value[0].physical_path,
                "https://site1.example.org:443/store/exp/run1"
            );
            assert_eq!(transfer.submitted(), outcome.value);
        }

        #[tokio::test]
        async fn test_fetch_available_by_union_expression() {
            let (dir, _transfer, engine) = engine().await;
            let a = item("A", "run1");
            let id = engine.resolve(&a, "data").unwrap();
            engine.ensure_rule(&id.identity, "SITE2", None).await.unwrap();
            assert!(dir.complete_rule(&dir.rules()[0].id));

            let outcome = engine
                .fetch_available(std::slice::from_ref(&a), "data", "SITE1|SITE2")
                .await
                .unwrap();
            assert!(outcome.all_succeeded());
            assert_eq!(outcome.value.len(), 1);
            assert_eq!(outcome.value[0].source_location, "SITE2");
        }

        #[tokio::test]
        async fn test_fetch_available_nothing_ready_submits_nothing() {
            let (_dir, transfer, engine) = engine().await;
            let outcome = engine
                .fetch_available(&[item("A", "run1")], "data", "SITE2")
                .await
                .unwrap();
            assert!(outcome.value.is_empty());
            assert!(transfer.submitted().is_empty());
        }
    }
}
