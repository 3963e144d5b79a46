//! Realtime document store abstraction.
//!
//! The call session exchanges all signaling through a store that offers
//! field-merge writes, one atomic conditional write, append-only
//! collections and change feeds. Two backends are provided:
//!
//! - [`MemoryStore`] - in-process, used by tests and single-host demos
//! - [`RedisDocumentStore`] - Redis hashes plus Redis streams for change feeds
//!
//! # Paths
//!
//! Documents are addressed by slash-separated paths. The last segment is the
//! document id and everything before it is the collection, so
//! `channel/c1/call/active/participants/alice` lives in collection
//! `channel/c1/call/active/participants`.
//!
//! # Change feeds
//!
//! [`DocumentStore::watch_collection`] first yields a
//! [`CollectionEvent::Snapshot`] of the collection, then one event per write
//! in write order, with no gap between the two. Dropping a [`ChangeFeed`]
//! stops the backend listener.

pub mod lua_scripts;
mod memory;
mod redis;

pub use self::memory::{MemoryStore, StoreOp};
pub use self::redis::RedisDocumentStore;

use crate::errors::StoreError;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde_json::Value;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;

/// A stored document: a JSON object.
pub type Document = serde_json::Map<String, Value>;

/// One delivery on a collection feed.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionEvent {
    /// Entries present at subscription time, ordered by id.
    Snapshot(Vec<(String, Document)>),
    Added(String, Document),
    Modified(String, Document),
    Removed(String),
}

/// Outcome of [`DocumentStore::set_if_absent`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionalWrite {
    Written,
    /// The guard field was already set; carries the current document.
    Exists(Document),
}

/// A subscription to store changes.
pub struct ChangeFeed<T> {
    stream: BoxStream<'static, T>,
    guard: Option<DropGuard>,
}

impl<T: Send + 'static> ChangeFeed<T> {
    /// Build a feed over a channel. `guard` is dropped with the feed.
    #[must_use]
    pub fn from_receiver(receiver: mpsc::UnboundedReceiver<T>, guard: Option<DropGuard>) -> Self {
        let stream = futures::stream::unfold(receiver, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();

        Self {
            stream,
            guard,
        }
    }

    /// Next delivery, or `None` once the backend listener has stopped.
    pub async fn next(&mut self) -> Option<T> {
        self.stream.next().await
    }

    /// Transform each delivery into zero or more items, keeping the listener
    /// alive for as long as the returned feed.
    #[must_use]
    pub fn flat_map<U, F>(self, mut f: F) -> ChangeFeed<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> Vec<U> + Send + 'static,
    {
        ChangeFeed {
            stream: self
                .stream
                .flat_map(move |item| futures::stream::iter(f(item)))
                .boxed(),
            guard: self.guard,
        }
    }

    #[must_use]
    pub fn filter_map<U, F>(self, mut f: F) -> ChangeFeed<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> Option<U> + Send + 'static,
    {
        self.flat_map(move |item| f(item).into_iter().collect())
    }
}

impl<T> Stream for ChangeFeed<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().stream.poll_next_unpin(cx)
    }
}

/// Split a document path into `(collection, id)`.
///
/// # Errors
///
/// Returns `StoreError::NotFound` for a path without a collection segment.
pub fn split_path(path: &str) -> Result<(&str, &str), StoreError> {
    match path.rsplit_once('/') {
        Some((collection, id)) if !collection.is_empty() && !id.is_empty() => {
            Ok((collection, id))
        }
        _ => Err(StoreError::NotFound(format!("invalid document path: {path}"))),
    }
}

/// Path of document `id` inside `collection`.
#[must_use]
pub fn child_path(collection: &str, id: &str) -> String {
    format!("{collection}/{id}")
}

/// Narrow a collection feed to a single document: the current value first,
/// then `Some(doc)` on every write and `None` on deletion.
#[must_use]
pub fn document_feed(
    collection_feed: ChangeFeed<CollectionEvent>,
    id: String,
) -> ChangeFeed<Option<Document>> {
    collection_feed.filter_map(move |event| match event {
        CollectionEvent::Snapshot(entries) => Some(
            entries
                .into_iter()
                .find(|(entry_id, _)| *entry_id == id)
                .map(|(_, doc)| doc),
        ),
        CollectionEvent::Added(entry_id, doc) | CollectionEvent::Modified(entry_id, doc)
            if entry_id == id =>
        {
            Some(Some(doc))
        }
        CollectionEvent::Removed(entry_id) if entry_id == id => Some(None),
        _ => None,
    })
}

/// Storage seam under the signaling channel.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Document>, StoreError>;

    /// Merge top-level `fields` into the document, creating it if absent.
    ///
    /// Returns `false` when every field already held the given value; such a
    /// merge produces no change event.
    async fn merge(&self, path: &str, fields: Document) -> Result<bool, StoreError>;

    /// Atomically merge `fields` only if `guard_field` is absent or null.
    async fn set_if_absent(
        &self,
        path: &str,
        guard_field: &str,
        fields: Document,
    ) -> Result<ConditionalWrite, StoreError>;

    /// Delete a document. Deleting a missing document is not an error.
    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    /// Append a document under a store-assigned, monotonically ordered id.
    async fn append(&self, collection: &str, doc: Document) -> Result<String, StoreError>;

    /// All documents in a collection, ordered by id.
    async fn list(&self, collection: &str) -> Result<Vec<(String, Document)>, StoreError>;

    /// Delete every document in a collection; returns how many were removed.
    async fn delete_collection(&self, collection: &str) -> Result<usize, StoreError>;

    async fn watch_collection(
        &self,
        collection: &str,
    ) -> Result<ChangeFeed<CollectionEvent>, StoreError>;

    async fn watch_document(&self, path: &str) -> Result<ChangeFeed<Option<Document>>, StoreError> {
        let (collection, id) = split_path(path)?;
        let feed = self.watch_collection(collection).await?;
        Ok(document_feed(feed, id.to_string()))
    }

    /// Synchronous merge for process teardown, where no async runtime may be
    /// left to drive a future.
    fn merge_blocking(&self, path: &str, fields: Document) -> Result<(), StoreError>;
}

/// Convert a serializable value into a [`Document`].
///
/// # Errors
///
/// Returns `StoreError::Serialization` if `value` does not serialize to a
/// JSON object.
pub fn to_document<T: serde::Serialize>(value: &T) -> Result<Document, StoreError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Serialization(format!(
            "expected object, got {other}"
        ))),
    }
}

/// Decode a [`Document`] into a typed value.
///
/// # Errors
///
/// Returns `StoreError::Serialization` if the document does not match `T`.
pub fn from_document<T: serde::de::DeserializeOwned>(doc: Document) -> Result<T, StoreError> {
    Ok(serde_json::from_value(Value::Object(doc))?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_split_path() {
        assert_eq!(
            split_path("channel/c1/call/active").unwrap(),
            ("channel/c1/call", "active")
        );
        assert!(split_path("active").is_err());
        assert!(split_path("channel/").is_err());
    }

    #[tokio::test]
    async fn test_document_feed_tracks_single_id() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut feed = document_feed(ChangeFeed::from_receiver(rx, None), "a".to_string());

        tx.send(CollectionEvent::Snapshot(vec![(
            "b".to_string(),
            doc(json!({"x": 1})),
        )]))
        .unwrap();
        tx.send(CollectionEvent::Added("b".to_string(), doc(json!({"x": 2}))))
            .unwrap();
        tx.send(CollectionEvent::Added("a".to_string(), doc(json!({"x": 3}))))
            .unwrap();
        tx.send(CollectionEvent::Removed("a".to_string())).unwrap();
        drop(tx);

        assert_eq!(feed.next().await, Some(None));
        assert_eq!(feed.next().await, Some(Some(doc(json!({"x": 3})))));
        assert_eq!(feed.next().await, Some(None));
        assert_eq!(feed.next().await, None);
    }

    #[tokio::test]
    async fn test_flat_map_keeps_state_between_deliveries() {
        let (tx, rx) = mpsc::unbounded_channel::<u32>();
        let mut total = 0;
        let mut feed = ChangeFeed::from_receiver(rx, None).flat_map(move |n| {
            total += n;
            vec![total; 2]
        });

        tx.send(1).unwrap();
        tx.send(2).unwrap();
        drop(tx);

        let items: Vec<u32> = (&mut feed).collect().await;
        assert_eq!(items, vec![1, 1, 3, 3]);
    }

    #[test]
    fn test_to_document_rejects_non_objects() {
        assert!(to_document(&json!({"a": 1})).is_ok());
        assert!(matches!(
            to_document(&json!([1, 2])),
            Err(StoreError::Serialization(_))
        ));
    }
}
