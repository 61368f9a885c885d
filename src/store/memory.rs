//! In-memory presence store
//!
//! Behaves like the document database the browsers share: last-writer-wins
//! documents, query-relative change events, atomic batch deletes. Failure
//! injection makes outage and heartbeat-stall scenarios reproducible.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;

use super::{
    ChangeKind, Document, DocumentChange, PresenceStore, Query, StoredDocument, Subscription,
    SubscriptionGuard,
};
use crate::errors::StoreError;

struct Listener {
    query: Query,
    sender: mpsc::UnboundedSender<DocumentChange>,
}

#[derive(Default)]
struct MemoryInner {
    collections: HashMap<String, BTreeMap<String, Document>>,
    listeners: HashMap<u64, Listener>,
    next_listener: u64,
    next_document: u64,
    unavailable: bool,
    failing_writes: HashMap<(String, String), u32>,
    initial_snapshot: bool,
    write_count: u64,
}

impl MemoryInner {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable("store is offline".to_string()));
        }
        Ok(())
    }

    fn check_write(&mut self, collection: &str, id: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let key = (collection.to_string(), id.to_string());
        if let Some(remaining) = self.failing_writes.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::Unavailable(format!(
                    "injected write failure on {}/{}",
                    collection, id
                )));
            }
        }
        Ok(())
    }

    fn write(&mut self, collection: &str, id: &str, after: Option<Document>) {
        let docs = self.collections.entry(collection.to_string()).or_default();
        let before = match &after {
            Some(doc) => docs.insert(id.to_string(), doc.clone()),
            None => docs.remove(id),
        };
        self.write_count += 1;
        self.notify(collection, id, before.as_ref(), after.as_ref());
    }

    fn notify(&mut self, collection: &str, id: &str, before: Option<&Document>, after: Option<&Document>) {
        let mut closed = Vec::new();
        for (listener_id, listener) in &self.listeners {
            if listener.query.collection != collection {
                continue;
            }
            let was = before.map_or(false, |d| listener.query.matches(id, d));
            let is = after.map_or(false, |d| listener.query.matches(id, d));
            let change = match (was, is, before, after) {
                (false, true, _, Some(doc)) => (ChangeKind::Added, doc),
                (true, true, _, Some(doc)) => (ChangeKind::Modified, doc),
                (true, false, Some(doc), _) => (ChangeKind::Removed, after.unwrap_or(doc)),
                _ => continue,
            };
            let event = DocumentChange {
                kind: change.0,
                document: StoredDocument {
                    id: id.to_string(),
                    data: change.1.clone(),
                },
            };
            if listener.sender.send(event).is_err() {
                closed.push(*listener_id);
            }
        }
        for listener_id in closed {
            self.listeners.remove(&listener_id);
        }
    }

    fn matching(&self, query: &Query) -> Vec<StoredDocument> {
        self.collections
            .get(&query.collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(id, doc)| query.matches(id, doc))
                    .map(|(id, doc)| StoredDocument {
                        id: id.clone(),
                        data: doc.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Shared in-process document store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay currently matching documents as `Added` on every subscribe,
    /// the way document databases deliver an initial snapshot.
    pub fn with_initial_snapshot() -> Self {
        let store = Self::new();
        store.lock().initial_snapshot = true;
        store
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate a backend outage; every operation fails while unavailable.
    pub fn set_available(&self, available: bool) {
        self.lock().unavailable = !available;
    }

    /// Fail the next `times` writes targeting one document.
    pub fn fail_writes(&self, collection: &str, id: &str, times: u32) {
        self.lock()
            .failing_writes
            .insert((collection.to_string(), id.to_string()), times);
    }

    pub fn document_count(&self, collection: &str) -> usize {
        self.lock()
            .collections
            .get(collection)
            .map_or(0, |docs| docs.len())
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Number of successful writes, batch deletes counting once per document.
    pub fn write_count(&self) -> u64 {
        self.lock().write_count
    }

    /// Write a document without failure injection or availability checks.
    pub fn seed(&self, collection: &str, id: &str, doc: Document) {
        self.lock().write(collection, id, Some(doc));
    }
}

fn remove_listener(inner: &Weak<Mutex<MemoryInner>>, listener_id: u64) {
    if let Some(inner) = inner.upgrade() {
        let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.listeners.remove(&listener_id);
    }
}

#[async_trait]
impl PresenceStore for MemoryStore {
    async fn put(&self, collection: &str, id: &str, doc: Document) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check_write(collection, id)?;
        inner.write(collection, id, Some(doc));
        log::trace!("memory store: put {}/{}", collection, id);
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, partial: Document) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check_write(collection, id)?;
        let mut merged = inner
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
            .ok_or_else(|| StoreError::not_found(collection, id))?;
        for (field, value) in partial {
            merged.insert(field, value);
        }
        inner.write(collection, id, Some(merged));
        log::trace!("memory store: update {}/{}", collection, id);
        Ok(())
    }

    async fn add(&self, collection: &str, doc: Document) -> Result<String, StoreError> {
        let mut inner = self.lock();
        inner.check_available()?;
        inner.next_document += 1;
        let id = format!("mem_{:08}", inner.next_document);
        inner.write(collection, &id, Some(doc));
        log::trace!("memory store: add {}/{}", collection, id);
        Ok(id)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check_write(collection, id)?;
        let exists = inner
            .collections
            .get(collection)
            .map_or(false, |docs| docs.contains_key(id));
        if exists {
            inner.write(collection, id, None);
        }
        Ok(())
    }

    async fn delete_batch(&self, targets: &[(String, String)]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        // All checks run before any delete so a failure leaves nothing half-applied.
        for (collection, id) in targets {
            inner.check_write(collection, id)?;
        }
        for (collection, id) in targets {
            let exists = inner
                .collections
                .get(collection)
                .map_or(false, |docs| docs.contains_key(id));
            if exists {
                inner.write(collection, id, None);
            }
        }
        log::trace!("memory store: batch deleted {} documents", targets.len());
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<StoredDocument>, StoreError> {
        let inner = self.lock();
        inner.check_available()?;
        Ok(inner
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|doc| StoredDocument {
                id: id.to_string(),
                data: doc.clone(),
            }))
    }

    async fn query(&self, query: &Query) -> Result<Vec<StoredDocument>, StoreError> {
        let inner = self.lock();
        inner.check_available()?;
        Ok(inner.matching(query))
    }

    async fn subscribe(&self, query: Query) -> Result<Subscription, StoreError> {
        let mut inner = self.lock();
        inner.check_available()?;

        let (sender, receiver) = mpsc::unbounded_channel();
        if inner.initial_snapshot {
            for document in inner.matching(&query) {
                let _ = sender.send(DocumentChange {
                    kind: ChangeKind::Added,
                    document,
                });
            }
        }

        inner.next_listener += 1;
        let listener_id = inner.next_listener;
        inner.listeners.insert(listener_id, Listener { query, sender });

        let weak = Arc::downgrade(&self.inner);
        let guard = SubscriptionGuard::new(move || remove_listener(&weak, listener_id));
        Ok(Subscription::new(receiver, guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FilterOp;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_put_get_update() {
        let store = MemoryStore::new();
        store.put("peers", "a", doc(json!({"status": "available", "lastSeen": 1}))).await.unwrap();
        store.update("peers", "a", doc(json!({"lastSeen": 2}))).await.unwrap();

        let stored = store.get("peers", "a").await.unwrap().unwrap();
        assert_eq!(stored.field("lastSeen"), Some(&json!(2)));
        assert_eq!(stored.field("status"), Some(&json!("available")));
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = store.update("peers", "ghost", doc(json!({"x": 1}))).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_add_assigns_unique_ids() {
        let store = MemoryStore::new();
        let a = store.add("sessions", doc(json!({"n": 1}))).await.unwrap();
        let b = store.add("sessions", doc(json!({"n": 2}))).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(store.document_count("sessions"), 2);
    }

    #[tokio::test]
    async fn test_query_conjunctive_filters() {
        let store = MemoryStore::new();
        store.seed("peers", "a", doc(json!({"role": "navigator", "lastSeen": 10})));
        store.seed("peers", "b", doc(json!({"role": "navigator", "lastSeen": 90})));
        store.seed("peers", "c", doc(json!({"role": "interface", "lastSeen": 90})));

        let query = Query::collection("peers")
            .where_eq("role", "navigator")
            .filter("lastSeen", FilterOp::Gt, 50);
        let found = store.query(&query).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "b");
    }

    #[tokio::test]
    async fn test_subscribe_is_forward_only() {
        let store = MemoryStore::new();
        store.seed("peers", "old", doc(json!({"role": "navigator"})));

        let mut sub = store
            .subscribe(Query::collection("peers").where_eq("role", "navigator"))
            .await
            .unwrap();
        assert!(sub.try_next().is_none());

        store.put("peers", "new", doc(json!({"role": "navigator"}))).await.unwrap();
        let change = sub.next().await.unwrap();
        assert_eq!(change.kind, ChangeKind::Added);
        assert_eq!(change.document.id, "new");
    }

    #[tokio::test]
    async fn test_change_kinds_are_query_relative() {
        let store = MemoryStore::new();
        let mut sub = store
            .subscribe(Query::collection("peers").where_eq("status", "available"))
            .await
            .unwrap();

        store.put("peers", "a", doc(json!({"status": "available"}))).await.unwrap();
        store.update("peers", "a", doc(json!({"lastSeen": 5}))).await.unwrap();
        store.update("peers", "a", doc(json!({"status": "offline"}))).await.unwrap();

        let kinds: Vec<ChangeKind> = (0..3).map(|_| sub.try_next().unwrap().kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Added, ChangeKind::Modified, ChangeKind::Removed]);
    }

    #[tokio::test]
    async fn test_initial_snapshot_replays_matches() {
        let store = MemoryStore::with_initial_snapshot();
        store.seed("sessions", "S1", doc(json!({"type": "offer"})));

        let mut sub = store.subscribe(Query::document("sessions", "S1")).await.unwrap();
        let change = sub.try_next().unwrap();
        assert_eq!(change.kind, ChangeKind::Added);
        assert_eq!(change.document.id, "S1");
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_listener() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe(Query::collection("peers")).await.unwrap();
        assert_eq!(store.listener_count(), 1);

        sub.unsubscribe();
        assert_eq!(store.listener_count(), 0);

        store.put("peers", "a", doc(json!({}))).await.unwrap();
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_batch_delete_is_atomic() {
        let store = MemoryStore::new();
        store.seed("sessions", "S1", doc(json!({})));
        store.seed("sessions/S1/candidates", "c1", doc(json!({})));
        store.fail_writes("sessions/S1/candidates", "c1", 1);

        let targets = vec![
            ("sessions".to_string(), "S1".to_string()),
            ("sessions/S1/candidates".to_string(), "c1".to_string()),
        ];
        assert!(store.delete_batch(&targets).await.is_err());
        assert_eq!(store.document_count("sessions"), 1);

        store.delete_batch(&targets).await.unwrap();
        assert_eq!(store.document_count("sessions"), 0);
        assert_eq!(store.document_count("sessions/S1/candidates"), 0);
    }

    #[tokio::test]
    async fn test_outage_and_injected_failures() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.query(&Query::collection("peers")).await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_available(true);

        store.put("peers", "a", doc(json!({"n": 0}))).await.unwrap();
        store.fail_writes("peers", "a", 2);
        assert!(store.update("peers", "a", doc(json!({"n": 1}))).await.is_err());
        assert!(store.update("peers", "a", doc(json!({"n": 2}))).await.is_err());
        store.update("peers", "a", doc(json!({"n": 3}))).await.unwrap();
    }
}
