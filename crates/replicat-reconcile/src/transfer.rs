//! Transfer requests.
//!
//! Byte transfer is done by an external subsystem behind [`TransferService`].
//! The engine only builds and submits requests; it never observes completion.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::catalog::{CatalogBinder, CatalogItem};
use crate::error::{ReconcileError, Result};
use crate::identity::ReplicationIdentity;

/// Errors reported by a transfer service.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// The transfer service refused the requests.
    #[error("rejected: {msg}")]
    Rejected {
        /// Reason given by the service.
        msg: String,
    },
}

impl From<TransferError> for ReconcileError {
    fn from(err: TransferError) -> Self {
        ReconcileError::Transfer {
            msg: err.to_string(),
        }
    }
}

/// One fetch request handed to the transfer subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// What to fetch.
    pub identity: ReplicationIdentity,
    /// Location to fetch from.
    pub source_location: String,
    /// Physical path advertised by that location.
    pub physical_path: String,
}

impl TransferRequest {
    /// The `scope:name` form of the identity.
    pub fn did(&self) -> String {
        self.identity.to_string()
    }
}

/// Accepts transfer requests and performs them asynchronously.
#[async_trait]
pub trait TransferService: Send + Sync {
    /// Submit a batch of requests.
    async fn submit(&self, requests: Vec<TransferRequest>) -> std::result::Result<(), TransferError>;
}

/// Transfer service that records requests instead of moving bytes.
#[derive(Default)]
pub struct RecordingTransfer {
    submitted: Mutex<Vec<TransferRequest>>,
    reject: Mutex<Option<String>>,
}

impl RecordingTransfer {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every following submission with `msg`, or accept again with `None`.
    pub fn set_reject(&self, msg: Option<&str>) {
        *self.reject.lock().unwrap_or_else(|e| e.into_inner()) = msg.map(str::to_string);
    }

    /// All requests accepted so far.
    pub fn submitted(&self) -> Vec<TransferRequest> {
        self.submitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl TransferService for RecordingTransfer {
    async fn submit(&self, requests: Vec<TransferRequest>) -> std::result::Result<(), TransferError> {
        if let Some(msg) = self.reject.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            return Err(TransferError::Rejected { msg });
        }
        self.submitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(requests);
        Ok(())
    }
}

/// Builds fetch requests for items already bound to a location.
#[derive(Clone)]
pub struct TransferRequestor {
    transfer: Arc<dyn TransferService>,
    binder: CatalogBinder,
}

impl TransferRequestor {
    /// Create a requestor submitting to `transfer`.
    pub fn new(transfer: Arc<dyn TransferService>, binder: CatalogBinder) -> Self {
        Self { transfer, binder }
    }

    /// Build the request for fetching `target` of `item` from `location`.
    ///
    /// Fails with `LocationNotResolved` if no alternate path has been bound
    /// for `location`.
    pub fn request_for(
        &self,
        item: &CatalogItem,
        target: &str,
        location: &str,
    ) -> Result<TransferRequest> {
        let identity = self.binder.embedded_identity(item, target)?;
        let path = item
            .alternate_path(target, location)
            .ok_or_else(|| ReconcileError::LocationNotResolved {
                asset: target.to_string(),
                location: location.to_string(),
            })?;
        Ok(TransferRequest {
            identity: identity.identity,
            source_location: location.to_string(),
            physical_path: path.to_string(),
        })
    }

    /// Request a fetch of `target` of `item` from `location`.
    pub async fn fetch(
        &self,
        item: &CatalogItem,
        target: &str,
        location: &str,
    ) -> Result<TransferRequest> {
        let request = self.request_for(item, target, location)?;
        self.submit(vec![request.clone()]).await?;
        Ok(request)
    }

    /// Submit prepared requests in one call.
    pub async fn submit(&self, requests: Vec<TransferRequest>) -> Result<()> {
        if requests.is_empty() {
            return Ok(());
        }
        let count = requests.len();
        self.transfer.submit(requests).await?;
        info!(count, "transfer requests submitted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ReplicaLocation;
    use serde_json::json;

    fn bound_item() -> CatalogItem {
        let mut item: CatalogItem = serde_json::from_value(json!({
            "id": "A",
            "assets": {"data": {"replication:config": {
                "replication:scope": "exp",
                "replication:name": "run1"
            }}}
        }))
        .unwrap();
        CatalogBinder::default()
            .bind_alternates(
                &mut item,
                "data",
                &[ReplicaLocation {
                    location: "SITE2".to_string(),
                    path: "https://s2:443/exp/run1".to_string(),
                }],
            )
            .unwrap();
        item
    }

    fn requestor() -> (Arc<RecordingTransfer>, TransferRequestor) {
        let transfer = Arc::new(RecordingTransfer::new());
        let requestor = TransferRequestor::new(transfer.clone(), CatalogBinder::default());
        (transfer, requestor)
    }

    #[tokio::test]
    async fn test_fetch_submits_request() {
        let (transfer, requestor) = requestor();
        let req = requestor.fetch(&bound_item(), "data", "SITE2").await.unwrap();
        assert_eq!(req.did(), "exp:run1");
        assert_eq!(req.physical_path, "https://s2:443/exp/run1");
        assert_eq!(transfer.submitted(), vec![req]);
    }

    #[tokio::test]
    async fn test_unbound_location_is_precondition_error() {
        let (transfer, requestor) = requestor();
        let err = requestor
            .fetch(&bound_item(), "data", "SITE9")
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::LocationNotResolved { .. }));
        assert!(transfer.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_identity_blocks_fetch() {
        let (_transfer, requestor) = requestor();
        let mut item = bound_item();
        item.assets.get_mut("data").unwrap().extra.clear();
        let err = requestor.fetch(&item, "data", "SITE2").await.unwrap_err();
        assert!(matches!(err, ReconcileError::MalformedIdentity { .. }));
    }

    #[tokio::test]
    async fn test_rejection_propagates() {
        let (transfer, requestor) = requestor();
        transfer.set_reject(Some("quota exceeded"));
        let err = requestor
            .fetch(&bound_item(), "data", "SITE2")
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Transfer { .. }));
        assert!(transfer.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_empty_submit_is_no_op() {
        let (_transfer, requestor) = requestor();
        requestor.submit(Vec::new()).await.unwrap();
    }
}
