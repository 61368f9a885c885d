//! Presence store adapter
//!
//! Collection-scoped document CRUD, conjunctive filtered queries and push
//! change notifications. The adapter never retries; callers own retry policy.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use tokio::sync::mpsc;

use crate::errors::StoreError;

/// Body of a stored document.
pub type Document = serde_json::Map<String, Value>;

/// A document together with its id inside its collection.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub data: Document,
}

impl StoredDocument {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A single equality, inequality or range predicate on a field.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(field: &str, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.to_string(),
            op,
            value: value.into(),
        }
    }

    /// Documents lacking the field never match, whatever the operator.
    pub fn matches(&self, doc: &Document) -> bool {
        let Some(actual) = doc.get(&self.field) else {
            return false;
        };
        let ordering = compare_values(actual, &self.value);
        match self.op {
            FilterOp::Eq => ordering == Some(Ordering::Equal) || actual == &self.value,
            FilterOp::Ne => ordering != Some(Ordering::Equal) && actual != &self.value,
            FilterOp::Lt => ordering == Some(Ordering::Less),
            FilterOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
            FilterOp::Gt => ordering == Some(Ordering::Greater),
            FilterOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        }
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Query over one collection, optionally pinned to a single document.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub document_id: Option<String>,
    pub filters: Vec<Filter>,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            document_id: None,
            filters: Vec::new(),
        }
    }

    /// Watch or read exactly one document.
    pub fn document(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            document_id: Some(id.into()),
            filters: Vec::new(),
        }
    }

    pub fn filter(mut self, field: &str, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::new(field, op, value));
        self
    }

    pub fn where_eq(self, field: &str, value: impl Into<Value>) -> Self {
        self.filter(field, FilterOp::Eq, value)
    }

    pub fn matches(&self, id: &str, doc: &Document) -> bool {
        if let Some(expected) = &self.document_id {
            if expected != id {
                return false;
            }
        }
        self.filters.iter().all(|f| f.matches(doc))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One change pushed to a subscriber. `Added`/`Removed` are relative to the
/// subscription's query: a document entering the result set is `Added`.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub document: StoredDocument,
}

/// Unregisters a subscription when cancelled or dropped.
pub struct SubscriptionGuard {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SubscriptionGuard {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("active", &self.is_active())
            .finish()
    }
}

/// A live subscription: a change stream plus the guard that ends it.
#[derive(Debug)]
pub struct Subscription {
    changes: mpsc::UnboundedReceiver<DocumentChange>,
    guard: SubscriptionGuard,
}

impl Subscription {
    pub fn new(changes: mpsc::UnboundedReceiver<DocumentChange>, guard: SubscriptionGuard) -> Self {
        Self { changes, guard }
    }

    /// Next change, or `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<DocumentChange> {
        self.changes.recv().await
    }

    /// Non-blocking variant of [`Subscription::next`].
    pub fn try_next(&mut self) -> Option<DocumentChange> {
        self.changes.try_recv().ok()
    }

    pub fn unsubscribe(&mut self) {
        self.guard.cancel();
    }

    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<DocumentChange>, SubscriptionGuard) {
        (self.changes, self.guard)
    }
}

/// Contract every presence store backend satisfies.
///
/// A document database backend and [`MemoryStore`] both implement it; the
/// choice is made once when the [`crate::context::SignalContext`] is built.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Create or overwrite a document under a caller-chosen id.
    async fn put(&self, collection: &str, id: &str, doc: Document) -> Result<(), StoreError>;

    /// Merge fields into an existing document; `NotFound` if absent.
    async fn update(&self, collection: &str, id: &str, partial: Document) -> Result<(), StoreError>;

    /// Create a document under a store-assigned id.
    async fn add(&self, collection: &str, doc: Document) -> Result<String, StoreError>;

    /// Delete a document. Deleting a missing document is a no-op.
    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError>;

    /// Delete several documents as one atomic batch.
    async fn delete_batch(&self, targets: &[(String, String)]) -> Result<(), StoreError>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<StoredDocument>, StoreError>;

    async fn query(&self, query: &Query) -> Result<Vec<StoredDocument>, StoreError>;

    /// Push changes matching `query` from now on.
    async fn subscribe(&self, query: Query) -> Result<Subscription, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_filter_operators() {
        let d = doc(json!({"role": "navigator", "lastSeen": 1_000}));

        assert!(Filter::new("role", FilterOp::Eq, "navigator").matches(&d));
        assert!(!Filter::new("role", FilterOp::Ne, "navigator").matches(&d));
        assert!(Filter::new("lastSeen", FilterOp::Gt, 999).matches(&d));
        assert!(!Filter::new("lastSeen", FilterOp::Gt, 1_000).matches(&d));
        assert!(Filter::new("lastSeen", FilterOp::Ge, 1_000).matches(&d));
        assert!(Filter::new("lastSeen", FilterOp::Lt, 1_000.5).matches(&d));
        assert!(Filter::new("lastSeen", FilterOp::Le, 1_000).matches(&d));
    }

    #[test]
    fn test_missing_field_never_matches() {
        let d = doc(json!({"role": "navigator"}));
        assert!(!Filter::new("status", FilterOp::Eq, "available").matches(&d));
        assert!(!Filter::new("status", FilterOp::Ne, "available").matches(&d));
    }

    #[test]
    fn test_document_query() {
        let d = doc(json!({"type": "offer"}));
        let q = Query::document("sessions", "S1").where_eq("type", "offer");
        assert!(q.matches("S1", &d));
        assert!(!q.matches("S2", &d));
    }

    #[test]
    fn test_guard_cancels_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut guard = SubscriptionGuard::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(guard.is_active());
        guard.cancel();
        guard.cancel();
        drop(guard);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
