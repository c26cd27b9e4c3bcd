//! Batch results with per-item error attribution.
//!
//! Batch operations process every item independently; a failure on one item
//! is recorded here and the rest of the batch carries on.

use crate::error::ReconcileError;

/// A failure attributed to one catalog item (and asset, when known).
#[derive(Debug)]
pub struct ItemError {
    /// Catalog id of the failing item.
    pub item_id: String,
    /// Asset the failure concerns.
    pub asset: Option<String>,
    /// The failure.
    pub error: ReconcileError,
}

/// Result of a batch operation: the value computed from every item that
/// succeeded, plus the items that did not.
#[derive(Debug)]
pub struct BatchOutcome<T> {
    /// Aggregate result.
    pub value: T,
    /// Per-item failures, in input order.
    pub errors: Vec<ItemError>,
}

impl<T> BatchOutcome<T> {
    /// Create an outcome with no failures.
    pub fn new(value: T) -> Self {
        Self {
            value,
            errors: Vec::new(),
        }
    }

    /// Record a failure for `item_id`.
    pub fn push_error(&mut self, item_id: &str, asset: Option<&str>, error: ReconcileError) {
        self.errors.push(ItemError {
            item_id: item_id.to_string(),
            asset: asset.map(str::to_string),
            error,
        });
    }

    /// Returns true if every item succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.errors.is_empty()
    }

    /// Ids of the failing items (deduplicated, input order).
    pub fn failed_item_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        for e in &self.errors {
            if !ids.contains(&e.item_id.as_str()) {
                ids.push(&e.item_id);
            }
        }
        ids
    }

    /// Map the value, keeping errors.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> BatchOutcome<U> {
        BatchOutcome {
            value: f(self.value),
            errors: self.errors,
        }
    }
}
