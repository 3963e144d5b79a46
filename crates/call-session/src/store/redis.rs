//! Redis-backed document store.
//!
//! Collections are Redis hashes; change feeds are Redis streams written by
//! the same Lua script as the data (see [`lua_scripts`](super::lua_scripts)).
//!
//! # Connection Pattern
//!
//! Request/response commands share one `MultiplexedConnection`, cloned per
//! operation. Each change feed gets its own connection because its listener
//! sits in a blocking `XREAD` and would stall the shared pipeline.

use super::{
    lua_scripts, split_path, ChangeFeed, CollectionEvent, ConditionalWrite, Document,
    DocumentStore,
};
use crate::errors::StoreError;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, RedisError, Script};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

/// Approximate cap on each change stream.
const STREAM_MAX_LEN: usize = 1000;

/// How long a listener blocks in `XREAD` before re-checking cancellation.
const LISTENER_BLOCK_MS: usize = 5000;

/// Maximum stream entries read per `XREAD`.
const LISTENER_BATCH: usize = 100;

/// Redis [`DocumentStore`].
///
/// Cheaply cloneable; clones share the multiplexed connection.
#[derive(Clone)]
pub struct RedisDocumentStore {
    client: Client,
    connection: MultiplexedConnection,
    key_prefix: String,
    merge_script: Script,
    set_if_absent_script: Script,
    delete_script: Script,
    append_script: Script,
    delete_collection_script: Script,
    snapshot_script: Script,
}

fn map_redis_error(operation: &'static str, e: &RedisError) -> StoreError {
    if e.code() == Some("NOPERM") {
        return StoreError::PermissionDenied(operation.to_string());
    }
    StoreError::Unavailable(format!("{operation} failed: {e}"))
}

impl RedisDocumentStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., `redis://localhost:6379`)
    /// * `key_prefix` - Namespace for all keys written by this store
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the connection fails.
    pub async fn new(redis_url: &str, key_prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Never log redis_url: it may embed a password.
            error!(
                target: "call.store.redis",
                error = %e,
                "Failed to open Redis client"
            );
            StoreError::Unavailable(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(
                    target: "call.store.redis",
                    error = %e,
                    "Failed to connect to Redis"
                );
                StoreError::Unavailable(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self {
            client,
            connection,
            key_prefix: key_prefix.into(),
            merge_script: Script::new(lua_scripts::MERGE_DOCUMENT),
            set_if_absent_script: Script::new(lua_scripts::SET_IF_ABSENT),
            delete_script: Script::new(lua_scripts::DELETE_DOCUMENT),
            append_script: Script::new(lua_scripts::APPEND_DOCUMENT),
            delete_collection_script: Script::new(lua_scripts::DELETE_COLLECTION),
            snapshot_script: Script::new(lua_scripts::SNAPSHOT_COLLECTION),
        })
    }

    fn hash_key(&self, collection: &str) -> String {
        format!("{}:doc:{collection}", self.key_prefix)
    }

    fn stream_key(&self, collection: &str) -> String {
        format!("{}:feed:{collection}", self.key_prefix)
    }

    fn sequence_key(&self, collection: &str) -> String {
        format!("{}:seq:{collection}", self.key_prefix)
    }

    /// Read a collection and the stream cursor matching that read.
    async fn snapshot(
        &self,
        collection: &str,
    ) -> Result<(String, Vec<(String, Document)>), StoreError> {
        let mut conn = self.connection.clone();

        let (cursor, flat): (String, Vec<String>) = self
            .snapshot_script
            .key(self.hash_key(collection))
            .key(self.stream_key(collection))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(
                    target: "call.store.redis",
                    error = %e,
                    collection = %collection,
                    "Failed to snapshot collection"
                );
                map_redis_error("snapshot", &e)
            })?;

        let mut entries = Vec::with_capacity(flat.len() / 2);
        for pair in flat.chunks_exact(2) {
            if let [id, json] = pair {
                entries.push((id.clone(), decode_document(json)?));
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        Ok((cursor, entries))
    }
}

fn decode_document(json: &str) -> Result<Document, StoreError> {
    // Lua cjson encodes an empty table as an object, so `{}` round-trips.
    Ok(serde_json::from_str(json)?)
}

fn encode_document(doc: &Document) -> Result<String, StoreError> {
    Ok(serde_json::to_string(doc)?)
}

/// Translate one stream entry into a collection event.
fn parse_entry(entry: &StreamId) -> Option<CollectionEvent> {
    let op: String = entry.get("op")?;
    let id: String = entry.get("id")?;

    match op.as_str() {
        "removed" => Some(CollectionEvent::Removed(id)),
        "added" | "modified" => {
            let json: String = entry.get("doc")?;
            let doc = decode_document(&json)
                .map_err(|e| {
                    warn!(
                        target: "call.store.redis",
                        error = %e,
                        "Skipping undecodable stream entry"
                    );
                })
                .ok()?;
            if op == "added" {
                Some(CollectionEvent::Added(id, doc))
            } else {
                Some(CollectionEvent::Modified(id, doc))
            }
        }
        _ => None,
    }
}

/// Long-poll a change stream from `cursor` until cancelled, the feed is
/// dropped, or Redis fails. Ending the loop closes the feed.
async fn run_listener(
    mut conn: MultiplexedConnection,
    stream_key: String,
    mut cursor: String,
    sender: mpsc::UnboundedSender<CollectionEvent>,
    cancel_token: CancellationToken,
) {
    let options = StreamReadOptions::default()
        .block(LISTENER_BLOCK_MS)
        .count(LISTENER_BATCH);

    loop {
        let keys = [&stream_key];
        let ids = [&cursor];
        let reply: Result<Option<StreamReadReply>, RedisError> = tokio::select! {
            () = cancel_token.cancelled() => break,
            reply = conn.xread_options(&keys, &ids, &options) => reply,
        };

        match reply {
            Ok(Some(reply)) => {
                for key in reply.keys {
                    for entry in key.ids {
                        cursor.clone_from(&entry.id);
                        if let Some(event) = parse_entry(&entry) {
                            if sender.send(event).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    target: "call.store.redis",
                    error = %e,
                    "Change stream listener failed, closing feed"
                );
                break;
            }
        }
    }

    debug!(target: "call.store.redis", "Change stream listener stopped");
}

#[async_trait::async_trait]
impl DocumentStore for RedisDocumentStore {
    async fn get(&self, path: &str) -> Result<Option<Document>, StoreError> {
        let (collection, id) = split_path(path)?;
        let mut conn = self.connection.clone();

        let json: Option<String> = conn
            .hget(self.hash_key(collection), id)
            .await
            .map_err(|e| {
                warn!(target: "call.store.redis", error = %e, "Failed to get document");
                map_redis_error("get", &e)
            })?;

        json.as_deref().map(decode_document).transpose()
    }

    #[instrument(skip_all, fields(path = %path))]
    async fn merge(&self, path: &str, fields: Document) -> Result<bool, StoreError> {
        let (collection, id) = split_path(path)?;
        let mut conn = self.connection.clone();

        let changed: i64 = self
            .merge_script
            .key(self.hash_key(collection))
            .key(self.stream_key(collection))
            .arg(id)
            .arg(encode_document(&fields)?)
            .arg(STREAM_MAX_LEN)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(target: "call.store.redis", error = %e, "Failed to merge document");
                map_redis_error("merge", &e)
            })?;

        Ok(changed == 1)
    }

    #[instrument(skip_all, fields(path = %path, guard = %guard_field))]
    async fn set_if_absent(
        &self,
        path: &str,
        guard_field: &str,
        fields: Document,
    ) -> Result<ConditionalWrite, StoreError> {
        let (collection, id) = split_path(path)?;
        let mut conn = self.connection.clone();

        let (written, current): (i64, String) = self
            .set_if_absent_script
            .key(self.hash_key(collection))
            .key(self.stream_key(collection))
            .arg(id)
            .arg(guard_field)
            .arg(encode_document(&fields)?)
            .arg(STREAM_MAX_LEN)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(target: "call.store.redis", error = %e, "Conditional write failed");
                map_redis_error("set_if_absent", &e)
            })?;

        if written == 1 {
            Ok(ConditionalWrite::Written)
        } else {
            Ok(ConditionalWrite::Exists(decode_document(&current)?))
        }
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let (collection, id) = split_path(path)?;
        let mut conn = self.connection.clone();

        let _: i64 = self
            .delete_script
            .key(self.hash_key(collection))
            .key(self.stream_key(collection))
            .arg(id)
            .arg(STREAM_MAX_LEN)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(target: "call.store.redis", error = %e, "Failed to delete document");
                map_redis_error("delete", &e)
            })?;

        Ok(())
    }

    async fn append(&self, collection: &str, doc: Document) -> Result<String, StoreError> {
        let mut conn = self.connection.clone();

        self.append_script
            .key(self.hash_key(collection))
            .key(self.stream_key(collection))
            .key(self.sequence_key(collection))
            .arg(encode_document(&doc)?)
            .arg(STREAM_MAX_LEN)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(target: "call.store.redis", error = %e, "Failed to append document");
                map_redis_error("append", &e)
            })
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Document)>, StoreError> {
        let (_, entries) = self.snapshot(collection).await?;
        Ok(entries)
    }

    async fn delete_collection(&self, collection: &str) -> Result<usize, StoreError> {
        let mut conn = self.connection.clone();

        let removed: usize = self
            .delete_collection_script
            .key(self.hash_key(collection))
            .key(self.stream_key(collection))
            .arg(STREAM_MAX_LEN)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(target: "call.store.redis", error = %e, "Failed to delete collection");
                map_redis_error("delete_collection", &e)
            })?;

        debug!(
            target: "call.store.redis",
            removed = removed,
            "Collection deleted"
        );
        Ok(removed)
    }

    #[instrument(skip_all, fields(collection = %collection))]
    async fn watch_collection(
        &self,
        collection: &str,
    ) -> Result<ChangeFeed<CollectionEvent>, StoreError> {
        let listener_conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                warn!(target: "call.store.redis", error = %e, "Failed to open listener connection");
                map_redis_error("watch", &e)
            })?;

        let (cursor, entries) = self.snapshot(collection).await?;
        let (sender, receiver) = mpsc::unbounded_channel();
        sender
            .send(CollectionEvent::Snapshot(entries))
            .map_err(|_| StoreError::Unavailable("feed closed".to_string()))?;

        let cancel_token = CancellationToken::new();
        tokio::spawn(run_listener(
            listener_conn,
            self.stream_key(collection),
            cursor,
            sender,
            cancel_token.clone(),
        ));

        Ok(ChangeFeed::from_receiver(
            receiver,
            Some(cancel_token.drop_guard()),
        ))
    }

    fn merge_blocking(&self, path: &str, fields: Document) -> Result<(), StoreError> {
        let (collection, id) = split_path(path)?;
        let mut conn = self.client.get_connection().map_err(|e| {
            warn!(target: "call.store.redis", error = %e, "Blocking connection failed");
            map_redis_error("merge_blocking", &e)
        })?;

        let _: i64 = self
            .merge_script
            .key(self.hash_key(collection))
            .key(self.stream_key(collection))
            .arg(id)
            .arg(encode_document(&fields)?)
            .arg(STREAM_MAX_LEN)
            .invoke(&mut conn)
            .map_err(|e| {
                warn!(target: "call.store.redis", error = %e, "Blocking merge failed");
                map_redis_error("merge_blocking", &e)
            })?;

        Ok(())
    }
}
