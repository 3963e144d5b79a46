//! In-process document store.
//!
//! All state sits behind one mutex. Subscribers are notified while the lock
//! is held, which gives every feed the same write order as the store itself
//! and closes the gap between a snapshot and the first diff.
//!
//! Access rules (`deny`) emulate store-side authorization so that tests can
//! exercise permission-denied paths. Stall rules (`stall`) emulate a backend
//! that stops answering.

use super::{child_path, split_path, ChangeFeed, CollectionEvent, ConditionalWrite, Document, DocumentStore};
use crate::errors::StoreError;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Operation class matched by access rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Read,
    /// Merge, conditional set and append.
    Write,
    /// Document and collection deletion.
    Delete,
}

/// In-memory [`DocumentStore`]. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Documents keyed by full path.
    docs: BTreeMap<String, Document>,
    /// Append sequence, shared by all collections.
    sequence: u64,
    watchers: Vec<Watcher>,
    rules: Vec<(StoreOp, String)>,
    stalls: Vec<(StoreOp, String)>,
    write_count: u64,
}

#[derive(Debug)]
struct Watcher {
    collection: String,
    sender: mpsc::UnboundedSender<CollectionEvent>,
}

impl Inner {
    fn check(&self, op: StoreOp, path: &str) -> Result<(), StoreError> {
        if self
            .rules
            .iter()
            .any(|(rule_op, prefix)| *rule_op == op && path.starts_with(prefix.as_str()))
        {
            warn!(
                target: "call.store.memory",
                op = ?op,
                path = %path,
                "Access rule denied operation"
            );
            return Err(StoreError::PermissionDenied(path.to_string()));
        }
        Ok(())
    }

    fn entries(&self, collection: &str) -> Vec<(String, Document)> {
        self.docs
            .iter()
            .filter_map(|(path, doc)| match split_path(path) {
                Ok((parent, id)) if parent == collection => Some((id.to_string(), doc.clone())),
                _ => None,
            })
            .collect()
    }

    fn notify(&mut self, collection: &str, event: &CollectionEvent) {
        // Closed receivers are pruned on the next notification.
        self.watchers.retain(|watcher| {
            if watcher.collection != collection {
                return !watcher.sender.is_closed();
            }
            watcher.sender.send(event.clone()).is_ok()
        });
    }

    /// Apply a merge and notify; returns whether anything changed.
    fn apply_merge(&mut self, path: &str, fields: Document) -> Result<bool, StoreError> {
        let (collection, id) = split_path(path)?;
        let (collection, id) = (collection.to_string(), id.to_string());

        let existing = self.docs.get(path);
        let created = existing.is_none();
        let changed = created
            || fields
                .iter()
                .any(|(key, value)| existing.and_then(|doc| doc.get(key)) != Some(value));

        if !changed {
            return Ok(false);
        }

        let doc = self.docs.entry(path.to_string()).or_default();
        for (key, value) in fields {
            doc.insert(key, value);
        }
        let snapshot = doc.clone();
        self.write_count += 1;

        let event = if created {
            CollectionEvent::Added(id, snapshot)
        } else {
            CollectionEvent::Modified(id, snapshot)
        };
        self.notify(&collection, &event);
        Ok(true)
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    /// Deny `op` on every path starting with `prefix`.
    pub fn deny(&self, op: StoreOp, prefix: impl Into<String>) {
        if let Ok(mut inner) = self.lock() {
            inner.rules.push((op, prefix.into()));
        }
    }

    /// Make `op` on every path starting with `prefix` never complete.
    /// Blocking merges are not affected.
    pub fn stall(&self, op: StoreOp, prefix: impl Into<String>) {
        if let Ok(mut inner) = self.lock() {
            inner.stalls.push((op, prefix.into()));
        }
    }

    /// Remove all access and stall rules. Operations already stalled stay
    /// stalled.
    pub fn allow_all(&self) {
        if let Ok(mut inner) = self.lock() {
            inner.rules.clear();
            inner.stalls.clear();
        }
    }

    async fn hold_if_stalled(&self, op: StoreOp, path: &str) {
        let stalled = self.lock().is_ok_and(|inner| {
            inner
                .stalls
                .iter()
                .any(|(rule_op, prefix)| *rule_op == op && path.starts_with(prefix.as_str()))
        });
        if stalled {
            debug!(
                target: "call.store.memory",
                op = ?op,
                path = %path,
                "Stall rule holding operation"
            );
            std::future::pending::<()>().await;
        }
    }

    /// Number of writes that changed data.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.lock().map(|inner| inner.write_count).unwrap_or(0)
    }

    /// Whether any document exists under `prefix`.
    #[must_use]
    pub fn has_documents_under(&self, prefix: &str) -> bool {
        self.lock()
            .map(|inner| inner.docs.keys().any(|path| path.starts_with(prefix)))
            .unwrap_or(false)
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Document>, StoreError> {
        self.hold_if_stalled(StoreOp::Read, path).await;
        let inner = self.lock()?;
        inner.check(StoreOp::Read, path)?;
        Ok(inner.docs.get(path).cloned())
    }

    async fn merge(&self, path: &str, fields: Document) -> Result<bool, StoreError> {
        self.hold_if_stalled(StoreOp::Write, path).await;
        let mut inner = self.lock()?;
        inner.check(StoreOp::Write, path)?;
        inner.apply_merge(path, fields)
    }

    async fn set_if_absent(
        &self,
        path: &str,
        guard_field: &str,
        fields: Document,
    ) -> Result<ConditionalWrite, StoreError> {
        self.hold_if_stalled(StoreOp::Write, path).await;
        let mut inner = self.lock()?;
        inner.check(StoreOp::Write, path)?;

        if let Some(doc) = inner.docs.get(path) {
            if doc.get(guard_field).is_some_and(|value| !value.is_null()) {
                debug!(
                    target: "call.store.memory",
                    path = %path,
                    field = %guard_field,
                    "Conditional write lost, field already set"
                );
                return Ok(ConditionalWrite::Exists(doc.clone()));
            }
        }

        inner.apply_merge(path, fields)?;
        Ok(ConditionalWrite::Written)
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.hold_if_stalled(StoreOp::Delete, path).await;
        let mut inner = self.lock()?;
        inner.check(StoreOp::Delete, path)?;
        let (collection, id) = split_path(path)?;

        if inner.docs.remove(path).is_some() {
            inner.write_count += 1;
            inner.notify(collection, &CollectionEvent::Removed(id.to_string()));
        }
        Ok(())
    }

    async fn append(&self, collection: &str, doc: Document) -> Result<String, StoreError> {
        self.hold_if_stalled(StoreOp::Write, collection).await;
        let mut inner = self.lock()?;
        inner.check(StoreOp::Write, collection)?;

        inner.sequence += 1;
        let id = format!("{:020}", inner.sequence);
        inner.docs.insert(child_path(collection, &id), doc.clone());
        inner.write_count += 1;
        inner.notify(collection, &CollectionEvent::Added(id.clone(), doc));
        Ok(id)
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Document)>, StoreError> {
        self.hold_if_stalled(StoreOp::Read, collection).await;
        let inner = self.lock()?;
        inner.check(StoreOp::Read, collection)?;
        Ok(inner.entries(collection))
    }

    async fn delete_collection(&self, collection: &str) -> Result<usize, StoreError> {
        self.hold_if_stalled(StoreOp::Delete, collection).await;
        let mut inner = self.lock()?;
        inner.check(StoreOp::Delete, collection)?;

        let ids: Vec<String> = inner.entries(collection).into_iter().map(|(id, _)| id).collect();
        for id in &ids {
            inner.docs.remove(&child_path(collection, id));
            inner.write_count += 1;
            inner.notify(collection, &CollectionEvent::Removed(id.clone()));
        }
        Ok(ids.len())
    }

    async fn watch_collection(
        &self,
        collection: &str,
    ) -> Result<ChangeFeed<CollectionEvent>, StoreError> {
        let mut inner = self.lock()?;
        inner.check(StoreOp::Read, collection)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let snapshot = CollectionEvent::Snapshot(inner.entries(collection));
        sender
            .send(snapshot)
            .map_err(|_| StoreError::Unavailable("feed closed".to_string()))?;
        inner.watchers.push(Watcher {
            collection: collection.to_string(),
            sender,
        });

        Ok(ChangeFeed::from_receiver(receiver, None))
    }

    fn merge_blocking(&self, path: &str, fields: Document) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.check(StoreOp::Write, path)?;
        inner.apply_merge(path, fields).map(|_| ())
    }
}
