//! Lua scripts for the Redis document store.
//!
//! Every write updates the collection hash and appends to the collection's
//! change stream inside one script, so a listener that resumes from the
//! cursor returned by [`SNAPSHOT_COLLECTION`] sees exactly the writes after
//! the snapshot, in order.
//!
//! # Key layout
//!
//! - `{prefix}:doc:{collection}` - HASH of document id to JSON
//! - `{prefix}:feed:{collection}` - STREAM of `op`/`id`/`doc` entries
//! - `{prefix}:seq:{collection}` - append counter

/// Merge top-level fields into a document.
///
/// Arguments:
/// - KEYS[1]: Collection hash
/// - KEYS[2]: Collection change stream
/// - ARGV[1]: Document id
/// - ARGV[2]: Fields to merge (JSON object)
/// - ARGV[3]: Approximate stream length cap
///
/// Returns:
/// - 1: Document created or changed
/// - 0: Every field already held the given value (no stream entry)
pub const MERGE_DOCUMENT: &str = r#"
local existing = redis.call('HGET', KEYS[1], ARGV[1])
local fields = cjson.decode(ARGV[2])
local doc = {}
local op = 'added'

if existing then
    doc = cjson.decode(existing)
    op = 'modified'
end

local changed = (op == 'added')
for k, v in pairs(fields) do
    if not changed then
        if doc[k] == nil or cjson.encode(doc[k]) ~= cjson.encode(v) then
            changed = true
        end
    end
    doc[k] = v
end

if not changed then
    return 0
end

local encoded = cjson.encode(doc)
redis.call('HSET', KEYS[1], ARGV[1], encoded)
redis.call('XADD', KEYS[2], 'MAXLEN', '~', ARGV[3], '*', 'op', op, 'id', ARGV[1], 'doc', encoded)
return 1
"#;

/// Merge fields only if a guard field is absent or null.
///
/// Arguments:
/// - KEYS[1]: Collection hash
/// - KEYS[2]: Collection change stream
/// - ARGV[1]: Document id
/// - ARGV[2]: Guard field name
/// - ARGV[3]: Fields to merge (JSON object)
/// - ARGV[4]: Approximate stream length cap
///
/// Returns:
/// - {1, ''}: Written
/// - {0, doc}: Guard field already set, current document JSON
pub const SET_IF_ABSENT: &str = r#"
local existing = redis.call('HGET', KEYS[1], ARGV[1])
local doc = {}
local op = 'added'

if existing then
    doc = cjson.decode(existing)
    op = 'modified'
    local guard = doc[ARGV[2]]
    if guard ~= nil and guard ~= cjson.null then
        return {0, existing}
    end
end

for k, v in pairs(cjson.decode(ARGV[3])) do
    doc[k] = v
end

local encoded = cjson.encode(doc)
redis.call('HSET', KEYS[1], ARGV[1], encoded)
redis.call('XADD', KEYS[2], 'MAXLEN', '~', ARGV[4], '*', 'op', op, 'id', ARGV[1], 'doc', encoded)
return {1, ''}
"#;

/// Delete one document.
///
/// Arguments:
/// - KEYS[1]: Collection hash
/// - KEYS[2]: Collection change stream
/// - ARGV[1]: Document id
/// - ARGV[2]: Approximate stream length cap
///
/// Returns:
/// - 1: Deleted
/// - 0: Document did not exist
pub const DELETE_DOCUMENT: &str = r#"
if redis.call('HDEL', KEYS[1], ARGV[1]) == 1 then
    redis.call('XADD', KEYS[2], 'MAXLEN', '~', ARGV[2], '*', 'op', 'removed', 'id', ARGV[1], 'doc', '')
    return 1
end
return 0
"#;

/// Append a document under the next sequence id.
///
/// Arguments:
/// - KEYS[1]: Collection hash
/// - KEYS[2]: Collection change stream
/// - KEYS[3]: Sequence counter
/// - ARGV[1]: Document (JSON object)
/// - ARGV[2]: Approximate stream length cap
///
/// Returns:
/// - The assigned id (zero-padded so lexical order is append order)
pub const APPEND_DOCUMENT: &str = r#"
local n = redis.call('INCR', KEYS[3])
local id = string.format('%020d', n)
redis.call('HSET', KEYS[1], id, ARGV[1])
redis.call('XADD', KEYS[2], 'MAXLEN', '~', ARGV[2], '*', 'op', 'added', 'id', id, 'doc', ARGV[1])
return id
"#;

/// Delete every document in a collection.
///
/// Arguments:
/// - KEYS[1]: Collection hash
/// - KEYS[2]: Collection change stream
/// - ARGV[1]: Approximate stream length cap
///
/// Returns:
/// - Number of documents removed
pub const DELETE_COLLECTION: &str = r#"
local ids = redis.call('HKEYS', KEYS[1])
table.sort(ids)
for _, id in ipairs(ids) do
    redis.call('XADD', KEYS[2], 'MAXLEN', '~', ARGV[1], '*', 'op', 'removed', 'id', id, 'doc', '')
end
redis.call('DEL', KEYS[1])
return #ids
"#;

/// Read a collection together with the stream cursor it corresponds to.
///
/// Arguments:
/// - KEYS[1]: Collection hash
/// - KEYS[2]: Collection change stream
///
/// Returns:
/// - {cursor, {id1, doc1, id2, doc2, ...}}
pub const SNAPSHOT_COLLECTION: &str = r#"
local last = redis.call('XREVRANGE', KEYS[2], '+', '-', 'COUNT', 1)
local cursor = '0-0'
if last[1] then
    cursor = last[1][1]
end
return {cursor, redis.call('HGETALL', KEYS[1])}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_write_appends_to_the_change_stream() {
        for script in [
            MERGE_DOCUMENT,
            SET_IF_ABSENT,
            DELETE_DOCUMENT,
            APPEND_DOCUMENT,
            DELETE_COLLECTION,
        ] {
            assert!(script.contains("XADD"), "write script without XADD");
            assert!(script.contains("MAXLEN"));
        }
    }

    #[test]
    fn test_conditional_write_checks_null_guard() {
        assert!(SET_IF_ABSENT.contains("cjson.null"));
        assert!(SET_IF_ABSENT.contains("return {0, existing}"));
    }

    #[test]
    fn test_unchanged_merge_skips_stream() {
        let no_change = MERGE_DOCUMENT.find("return 0").unwrap_or(usize::MAX);
        let xadd = MERGE_DOCUMENT.find("XADD").unwrap_or(0);
        assert!(no_change < xadd);
    }

    #[test]
    fn test_snapshot_returns_cursor_and_entries() {
        assert!(SNAPSHOT_COLLECTION.contains("XREVRANGE"));
        assert!(SNAPSHOT_COLLECTION.contains("HGETALL"));
        assert!(SNAPSHOT_COLLECTION.len() < 500);
    }
}
