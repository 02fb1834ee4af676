//! In-memory stream transport.
//!
//! Implements the full transport contract (consumer groups, PEL, claim,
//! lease CAS) under a single process lock, so the protocol paths can be
//! exercised without a server. Used by tests and `--standalone` runs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{parse_id, GroupInfo, PendingEntry, StreamEntry, StreamTransport};

#[derive(Default)]
struct MemGroup {
    last_delivered: (u64, u64),
    pel: HashMap<String, PelItem>,
    consumers: HashSet<String>,
}

struct PelItem {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Default)]
struct MemStream {
    entries: Vec<StreamEntry>,
    groups: HashMap<String, MemGroup>,
}

struct Lease {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, MemStream>,
    leases: HashMap<String, Lease>,
    last_ms: u64,
    last_seq: u64,
}

/// Process-local transport with the same observable semantics as the Redis
/// adapter.
#[derive(Clone)]
pub struct MemoryTransport {
    state: Arc<Mutex<State>>,
    wakers: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            wakers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn notify_for(&self, stream: &str) -> Arc<Notify> {
        self.wakers
            .lock()
            .entry(stream.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn next_id(state: &mut State) -> String {
        let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        if now_ms <= state.last_ms {
            state.last_seq += 1;
        } else {
            state.last_ms = now_ms;
            state.last_seq = 0;
        }
        format!("{}-{}", state.last_ms, state.last_seq)
    }

    fn try_deliver(
        state: &mut State,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Vec<StreamEntry> {
        let Some(s) = state.streams.get_mut(stream) else {
            return Vec::new();
        };
        let Some(g) = s.groups.get_mut(group) else {
            return Vec::new();
        };
        g.consumers.insert(consumer.to_string());

        let mut out = Vec::new();
        for entry in &s.entries {
            if out.len() >= count {
                break;
            }
            let id = parse_id(&entry.id);
            if id > g.last_delivered {
                g.last_delivered = id;
                g.pel.insert(
                    entry.id.clone(),
                    PelItem {
                        consumer: consumer.to_string(),
                        delivered_at: Instant::now(),
                        delivery_count: 1,
                    },
                );
                out.push(entry.clone());
            }
        }
        out
    }
}

#[async_trait]
impl StreamTransport for MemoryTransport {
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        maxlen: usize,
    ) -> Result<String> {
        let id = {
            let mut state = self.state.lock();
            let id = Self::next_id(&mut state);
            let s = state.streams.entry(stream.to_string()).or_default();
            s.entries.push(StreamEntry {
                id: id.clone(),
                fields: fields.iter().cloned().collect(),
            });
            if maxlen > 0 && s.entries.len() > maxlen {
                let excess = s.entries.len() - maxlen;
                s.entries.drain(0..excess);
            }
            id
        };
        self.notify_for(stream).notify_waiters();
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut state = self.state.lock();
        let s = state.streams.entry(stream.to_string()).or_default();
        s.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>> {
        let deadline = Instant::now() + Duration::from_millis(block_ms);
        loop {
            let notify = self.notify_for(stream);
            let notified = notify.notified();
            {
                let mut state = self.state.lock();
                let delivered = Self::try_deliver(&mut state, stream, group, consumer, count);
                if !delivered.is_empty() {
                    return Ok(delivered);
                }
            }
            let now = Instant::now();
            if block_ms == 0 || now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64> {
        let mut state = self.state.lock();
        let mut acked = 0;
        if let Some(g) = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        {
            for id in ids {
                if g.pel.remove(id).is_some() {
                    acked += 1;
                }
            }
        }
        Ok(acked)
    }

    async fn list_pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        let state = self.state.lock();
        let mut out = Vec::new();
        if let Some(g) = state.streams.get(stream).and_then(|s| s.groups.get(group)) {
            for (id, item) in &g.pel {
                out.push(PendingEntry {
                    id: id.clone(),
                    consumer: item.consumer.clone(),
                    idle_ms: item.delivered_at.elapsed().as_millis() as u64,
                    delivery_count: item.delivery_count,
                });
            }
        }
        out.sort_by_key(|p| parse_id(&p.id));
        out.truncate(count);
        Ok(out)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>> {
        let mut state = self.state.lock();
        let Some(s) = state.streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Some(g) = s.groups.get_mut(group) else {
            return Ok(Vec::new());
        };
        g.consumers.insert(consumer.to_string());

        let mut out = Vec::new();
        for id in ids {
            let Some(item) = g.pel.get_mut(id) else {
                continue;
            };
            if (item.delivered_at.elapsed().as_millis() as u64) < min_idle_ms {
                continue;
            }
            // Entry may have been trimmed from the log; the PEL reference is
            // then dropped, matching server behavior.
            match s.entries.iter().find(|e| &e.id == id) {
                Some(entry) => {
                    item.consumer = consumer.to_string();
                    item.delivered_at = Instant::now();
                    item.delivery_count += 1;
                    out.push(entry.clone());
                }
                None => {
                    g.pel.remove(id);
                }
            }
        }
        Ok(out)
    }

    async fn range(&self, stream: &str, start: &str, count: usize) -> Result<Vec<StreamEntry>> {
        let state = self.state.lock();
        let Some(s) = state.streams.get(stream) else {
            return Ok(Vec::new());
        };
        let (cursor, exclusive) = match start {
            "-" | "" | "0" => ((0, 0), false),
            s if s.starts_with('(') => (parse_id(&s[1..]), true),
            s => (parse_id(s), false),
        };
        let out = s
            .entries
            .iter()
            .filter(|e| {
                let id = parse_id(&e.id);
                if exclusive {
                    id > cursor
                } else {
                    id >= cursor
                }
            })
            .take(count)
            .cloned()
            .collect();
        Ok(out)
    }

    async fn len(&self, stream: &str) -> Result<u64> {
        let state = self.state.lock();
        Ok(state
            .streams
            .get(stream)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn groups(&self, stream: &str) -> Result<Vec<GroupInfo>> {
        let state = self.state.lock();
        let Some(s) = state.streams.get(stream) else {
            return Ok(Vec::new());
        };
        let out = s
            .groups
            .iter()
            .map(|(name, g)| {
                let lag = s
                    .entries
                    .iter()
                    .filter(|e| parse_id(&e.id) > g.last_delivered)
                    .count() as u64;
                GroupInfo {
                    name: name.clone(),
                    consumers: g.consumers.len() as u64,
                    pending: g.pel.len() as u64,
                    last_delivered_id: format!("{}-{}", g.last_delivered.0, g.last_delivered.1),
                    lag: Some(lag),
                }
            })
            .collect();
        Ok(out)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl_sec: u64) -> Result<bool> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let live = state
            .leases
            .get(key)
            .map(|l| l.expires_at > now)
            .unwrap_or(false);
        if live {
            return Ok(false);
        }
        state.leases.insert(
            key.to_string(),
            Lease {
                value: value.to_string(),
                expires_at: now + Duration::from_secs(ttl_sec),
            },
        );
        Ok(true)
    }

    async fn compare_and_extend(&self, key: &str, expected: &str, ttl_sec: u64) -> Result<bool> {
        let mut state = self.state.lock();
        let now = Instant::now();
        match state.leases.get_mut(key) {
            Some(lease) if lease.expires_at > now && lease.value == expected => {
                lease.expires_at = now + Duration::from_secs(ttl_sec);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let owned = state
            .leases
            .get(key)
            .map(|l| l.expires_at > now && l.value == expected)
            .unwrap_or(false);
        if owned {
            state.leases.remove(key);
        }
        Ok(owned)
    }
}
