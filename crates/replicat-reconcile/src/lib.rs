#![warn(missing_docs)]

//! Replicat reconciliation engine: maps catalog assets to replication
//! identities, keeps replicas and replication rules in a directory service
//! in step with the catalog, and reports when copies are safe to fetch.

pub mod availability;
pub mod batch;
pub mod catalog;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod expression;
pub mod identity;
pub mod query;
pub mod registrar;
pub mod rules;
pub mod telemetry;
pub mod transfer;

pub use availability::{AvailabilitySummary, AvailabilityTracker};
pub use batch::{BatchOutcome, ItemError};
pub use catalog::{Asset, CatalogBinder, CatalogItem};
pub use config::EngineConfig;
pub use directory::{DirectoryError, DirectoryService, MemoryDirectory};
pub use engine::ReconcileEngine;
pub use error::{EnsureOutcome, ReconcileError, Result};
pub use identity::{AssetIdentity, IdentityResolver, ReplicationIdentity};
pub use query::ReplicaLocation;
pub use rules::RuleState;
pub use transfer::{RecordingTransfer, TransferRequest, TransferService};
