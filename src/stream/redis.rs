//! Redis Streams transport adapter.
//!
//! Consumer-group reads map to `XREADGROUP`, the pending/claim lifecycle to
//! `XPENDING`/`XCLAIM`, and the leader-lease primitives to `SET NX EX` plus
//! two server-side Lua scripts, so every compare-semantics write is atomic
//! on the server. No client-side CAS anywhere.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamMaxlen, StreamPendingCountReply, StreamRangeReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, Script};
use tracing::{debug, info};

use super::{GroupInfo, PendingEntry, StreamEntry, StreamTransport};

const EXTEND_IF_OWNER: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('EXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

const DELETE_IF_OWNER: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Transport backed by a Redis server. `ConnectionManager` transparently
/// reconnects, so transient connection loss surfaces as per-call errors that
/// the supervisors retry with backoff.
#[derive(Clone)]
pub struct RedisStreamTransport {
    conn: ConnectionManager,
    extend_script: Script,
    delete_script: Script,
}

impl RedisStreamTransport {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid REDIS_URL")?;
        let conn = client
            .get_connection_manager()
            .await
            .context("failed to connect to Redis")?;
        info!("Connected to Redis stream transport");
        Ok(Self {
            conn,
            extend_script: Script::new(EXTEND_IF_OWNER),
            delete_script: Script::new(DELETE_IF_OWNER),
        })
    }

    fn to_entry(id: redis::streams::StreamId) -> StreamEntry {
        let mut fields = HashMap::with_capacity(id.map.len());
        for (key, value) in &id.map {
            if let Ok(v) = redis::from_redis_value::<String>(value) {
                fields.insert(key.clone(), v);
            }
        }
        StreamEntry { id: id.id, fields }
    }
}

#[async_trait]
impl StreamTransport for RedisStreamTransport {
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        maxlen: usize,
    ) -> Result<String> {
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd_maxlen(stream, StreamMaxlen::Approx(maxlen), "*", fields)
            .await
            .with_context(|| format!("XADD {} failed", stream))?;
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<String> =
            conn.xgroup_create_mkstream(stream, group, "$").await;
        match created {
            Ok(_) => {
                debug!(stream, group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e).with_context(|| format!("XGROUP CREATE {} {} failed", stream, group)),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms as usize);
        let reply: StreamReadReply = conn
            .xread_options(&[stream], &[">"], &opts)
            .await
            .with_context(|| format!("XREADGROUP {} {} failed", stream, group))?;
        let mut out = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                out.push(Self::to_entry(id));
            }
        }
        Ok(out)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let n: u64 = conn
            .xack(stream, group, ids)
            .await
            .with_context(|| format!("XACK {} {} failed", stream, group))?;
        Ok(n)
    }

    async fn list_pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingCountReply = conn
            .xpending_count(stream, group, "-", "+", count)
            .await
            .with_context(|| format!("XPENDING {} {} failed", stream, group))?;
        Ok(reply
            .ids
            .into_iter()
            .map(|p| PendingEntry {
                id: p.id,
                consumer: p.consumer,
                idle_ms: p.last_delivered_ms as u64,
                delivery_count: p.times_delivered as u64,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let reply: StreamClaimReply = conn
            .xclaim(stream, group, consumer, min_idle_ms as usize, ids)
            .await
            .with_context(|| format!("XCLAIM {} {} failed", stream, group))?;
        Ok(reply.ids.into_iter().map(Self::to_entry).collect())
    }

    async fn range(&self, stream: &str, start: &str, count: usize) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let start = if start.is_empty() { "-" } else { start };
        let reply: StreamRangeReply = conn
            .xrange_count(stream, start, "+", count)
            .await
            .with_context(|| format!("XRANGE {} failed", stream))?;
        Ok(reply.ids.into_iter().map(Self::to_entry).collect())
    }

    async fn len(&self, stream: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let n: u64 = conn
            .xlen(stream)
            .await
            .with_context(|| format!("XLEN {} failed", stream))?;
        Ok(n)
    }

    async fn groups(&self, stream: &str) -> Result<Vec<GroupInfo>> {
        let mut conn = self.conn.clone();
        // Parsed as raw key/value maps so the Redis 7 `lag` field is picked
        // up when present without requiring it.
        let raw: Vec<HashMap<String, redis::Value>> = redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(stream)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("XINFO GROUPS {} failed", stream))?;
        let mut out = Vec::with_capacity(raw.len());
        for entry in raw {
            let get_str = |k: &str| -> String {
                entry
                    .get(k)
                    .and_then(|v| redis::from_redis_value::<String>(v).ok())
                    .unwrap_or_default()
            };
            let get_u64 = |k: &str| -> Option<u64> {
                entry
                    .get(k)
                    .and_then(|v| redis::from_redis_value::<u64>(v).ok())
            };
            out.push(GroupInfo {
                name: get_str("name"),
                consumers: get_u64("consumers").unwrap_or(0),
                pending: get_u64("pending").unwrap_or(0),
                last_delivered_id: get_str("last-delivered-id"),
                lag: get_u64("lag"),
            });
        }
        Ok(out)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl_sec: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_sec)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("SET NX {} failed", key))?;
        Ok(reply.is_some())
    }

    async fn compare_and_extend(&self, key: &str, expected: &str, ttl_sec: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .extend_script
            .key(key)
            .arg(expected)
            .arg(ttl_sec)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("extend-if-owner script failed for {}", key))?;
        Ok(extended == 1)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .delete_script
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("delete-if-owner script failed for {}", key))?;
        Ok(deleted == 1)
    }
}
