//! Stream transport contract and adapters.
//!
//! The platform speaks to an append-only log with consumer groups (Redis
//! Streams in production, an in-memory twin in tests). Everything the core
//! needs from the transport is captured by [`StreamTransport`]; all
//! compare-semantics writes are atomic on the server side.

pub mod consumer;
pub mod dlq;
pub mod memory;
pub mod redis;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;

/// Canonical stream names.
pub mod names {
    pub const PRICE_UPDATES: &str = "stream:price-updates";
    pub const SWAP_EVENTS: &str = "stream:swap-events";
    pub const OPPORTUNITIES: &str = "stream:opportunities";
    pub const WHALE_ALERTS: &str = "stream:whale-alerts";
    pub const PENDING_OPPORTUNITIES: &str = "stream:pending-opportunities";
    pub const EXECUTION_REQUESTS: &str = "stream:execution-requests";
    pub const EXECUTION_RESULTS: &str = "stream:execution-results";
    pub const SERVICE_HEALTH: &str = "stream:service-health";
    pub const SERVICE_EVENTS: &str = "stream:service-events";
    pub const COORDINATOR_EVENTS: &str = "stream:coordinator-events";
    pub const HEALTH: &str = "stream:health";
    pub const HEALTH_ALERTS: &str = "stream:health-alerts";
    pub const VOLUME_AGGREGATES: &str = "stream:volume-aggregates";
    pub const CIRCUIT_BREAKER: &str = "stream:circuit-breaker";
    pub const SYSTEM_FAILOVER: &str = "stream:system-failover";
    pub const SYSTEM_COMMANDS: &str = "stream:system-commands";
    pub const FAST_LANE: &str = "stream:fast-lane";
    pub const DEAD_LETTER_QUEUE: &str = "stream:dead-letter-queue";
    pub const FORWARDING_DLQ: &str = "stream:forwarding-dlq";
    pub const SERVICE_DEGRADATION: &str = "stream:service-degradation";

    /// Streams the coordinator watches every scan. The last two are optional:
    /// nothing may ever produce to them and that is not a finding.
    pub const MONITORED: &[&str] = &[
        PRICE_UPDATES,
        SWAP_EVENTS,
        OPPORTUNITIES,
        WHALE_ALERTS,
        PENDING_OPPORTUNITIES,
        EXECUTION_REQUESTS,
        EXECUTION_RESULTS,
        SERVICE_HEALTH,
        COORDINATOR_EVENTS,
        VOLUME_AGGREGATES,
        SYSTEM_FAILOVER,
        DEAD_LETTER_QUEUE,
        FORWARDING_DLQ,
        SERVICE_DEGRADATION,
    ];
}

/// Default per-stream MAXLEN cap enforced at produce time.
pub const DEFAULT_MAXLEN: usize = 10_000;

/// One immutable record read from a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    /// Opaque ordered ID, monotonic per stream (`<ms>-<seq>`).
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(|s| s.as_str())
    }

    /// Parse a JSON-carrying field into a typed payload.
    pub fn json_field<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let raw = self
            .field(name)
            .ok_or_else(|| anyhow::anyhow!("missing field '{}' on entry {}", name, self.id))?;
        Ok(serde_json::from_str(raw)?)
    }
}

/// Pending (delivered, unacknowledged) entry summary.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle_ms: u64,
    pub delivery_count: u64,
}

/// Consumer-group summary used by the fleet-health scan.
#[derive(Debug, Clone)]
pub struct GroupInfo {
    pub name: String,
    pub consumers: u64,
    pub pending: u64,
    pub last_delivered_id: String,
    /// Entries not yet delivered to the group; absent on servers that do not
    /// report it.
    pub lag: Option<u64>,
}

/// Append-only log with consumer groups plus the atomic lease primitives the
/// leadership engine requires. Compare-semantics methods MUST be atomic on
/// the transport; the core never does client-side read-then-write on a lease.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Append an entry, trimming the stream to roughly `maxlen`.
    async fn append(&self, stream: &str, fields: &[(String, String)], maxlen: usize)
        -> Result<String>;

    /// Create the consumer group if it does not exist (idempotent).
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()>;

    /// Read up to `count` new entries for `consumer`, blocking up to
    /// `block_ms` when the stream is drained.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>>;

    /// Acknowledge delivered entries; returns how many were still pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64>;

    async fn list_pending(&self, stream: &str, group: &str, count: usize)
        -> Result<Vec<PendingEntry>>;

    /// Reassign pending entries idle for at least `min_idle_ms` to `consumer`.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>>;

    /// Read entries in ID order starting at `start` (`-` for the beginning,
    /// `(id` for an exclusive cursor).
    async fn range(&self, stream: &str, start: &str, count: usize) -> Result<Vec<StreamEntry>>;

    async fn len(&self, stream: &str) -> Result<u64>;

    async fn groups(&self, stream: &str) -> Result<Vec<GroupInfo>>;

    /// Atomic create-if-absent with TTL. Returns true when this call created
    /// the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl_sec: u64) -> Result<bool>;

    /// Atomically extend the TTL only while the key still holds `expected`.
    async fn compare_and_extend(&self, key: &str, expected: &str, ttl_sec: u64) -> Result<bool>;

    /// Atomically delete the key only while it still holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;
}

/// Split a stream ID into its `(ms, seq)` parts for ordering. Malformed IDs
/// sort first.
pub fn parse_id(id: &str) -> (u64, u64) {
    let mut parts = id.splitn(2, '-');
    let ms = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let seq = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (ms, seq)
}
