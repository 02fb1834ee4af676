//! Dead-letter queue supervisor.
//!
//! Periodically scans the DLQ stream, tallies entries by their `[CODE]`
//! bracket tag, and supports operator-driven replay of preserved payloads
//! onto the execution-requests stream. Replayed payloads carry marker fields
//! and still pass through downstream validation like any other entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::models::DlqEntry;
use crate::stream::{names, parse_id, StreamEntry, StreamTransport, DEFAULT_MAXLEN};

/// Hard cap on pagination during replay lookups.
const MAX_REPLAY_PAGES: usize = 100;
const REPLAY_PAGE_SIZE: usize = 100;

/// Serialize a [`DlqEntry`] to flat stream fields.
pub fn to_fields(entry: &DlqEntry) -> Vec<(String, String)> {
    let mut fields = vec![
        (
            "originalMessageId".to_string(),
            entry.original_message_id.clone(),
        ),
        ("originalStream".to_string(), entry.original_stream.clone()),
        ("opportunityId".to_string(), entry.opportunity_id.clone()),
        (
            "opportunityType".to_string(),
            entry.opportunity_type.clone(),
        ),
        ("error".to_string(), entry.error.clone()),
        ("timestamp".to_string(), entry.timestamp.to_string()),
        ("service".to_string(), entry.service.clone()),
        ("instanceId".to_string(), entry.instance_id.clone()),
    ];
    if let Some(payload) = &entry.original_payload {
        fields.push(("originalPayload".to_string(), payload.clone()));
    }
    fields
}

/// Rebuild a [`DlqEntry`] from stream fields. Returns `None` when the
/// mandatory fields are missing.
pub fn from_entry(entry: &StreamEntry) -> Option<DlqEntry> {
    Some(DlqEntry {
        original_message_id: entry.field("originalMessageId")?.to_string(),
        original_stream: entry.field("originalStream")?.to_string(),
        opportunity_id: entry.field("opportunityId").unwrap_or_default().to_string(),
        opportunity_type: entry
            .field("opportunityType")
            .unwrap_or_default()
            .to_string(),
        error: entry.field("error")?.to_string(),
        timestamp: entry
            .field("timestamp")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        service: entry.field("service").unwrap_or_default().to_string(),
        instance_id: entry.field("instanceId").unwrap_or_default().to_string(),
        original_payload: entry.field("originalPayload").map(|s| s.to_string()),
    })
}

/// Append a dead-letter entry to the DLQ stream.
pub async fn publish(
    transport: &dyn StreamTransport,
    entry: &DlqEntry,
    maxlen: usize,
) -> Result<String> {
    transport
        .append(names::DEAD_LETTER_QUEUE, &to_fields(entry), maxlen)
        .await
}

/// Extract the `[CODE]` bracket tag from an error string.
fn error_code(error: &str) -> &str {
    if let Some(open) = error.find('[') {
        if let Some(close) = error[open..].find(']') {
            let code = &error[open + 1..open + close];
            if !code.is_empty() {
                return code;
            }
        }
    }
    "UNKNOWN"
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DlqStats {
    pub total_messages: u64,
    pub by_error_code: HashMap<String, u64>,
    /// Age of the oldest entry at scan time, from its stream ID.
    pub oldest_entry_age_ms: u64,
    pub last_scan_at: i64,
    pub replayed_total: u64,
}

#[derive(Debug, Clone)]
pub struct DlqConfig {
    pub scan_interval: Duration,
    pub max_messages_per_scan: usize,
    pub maxlen: usize,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
            max_messages_per_scan: 1_000,
            maxlen: DEFAULT_MAXLEN,
        }
    }
}

/// Periodic DLQ scanner and replay gateway.
pub struct DlqSupervisor {
    transport: Arc<dyn StreamTransport>,
    config: DlqConfig,
    stats: Arc<RwLock<DlqStats>>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DlqSupervisor {
    pub fn new(transport: Arc<dyn StreamTransport>, config: DlqConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            transport,
            config,
            stats: Arc::new(RwLock::new(DlqStats::default())),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    pub fn start(self: &Arc<Self>) {
        let mut slot = self.task.lock();
        if slot.is_some() {
            return;
        }
        let this = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        *slot = Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval(this.config.scan_interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return;
                        }
                    }
                    _ = timer.tick() => {
                        if let Err(e) = this.scan().await {
                            warn!(error = %e, "DLQ scan failed");
                        }
                    }
                }
            }
        }));
        info!(
            interval_secs = self.config.scan_interval.as_secs(),
            "DLQ supervisor started"
        );
    }

    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("DLQ supervisor stopped");
    }

    /// One scan cycle: tally by error code and refresh the stats snapshot
    /// atomically.
    pub async fn scan(&self) -> Result<DlqStats> {
        let entries = self
            .transport
            .range(
                names::DEAD_LETTER_QUEUE,
                "-",
                self.config.max_messages_per_scan,
            )
            .await?;

        let now = chrono::Utc::now().timestamp_millis();
        let mut by_error_code: HashMap<String, u64> = HashMap::new();
        for entry in &entries {
            let code = entry.field("error").map(error_code).unwrap_or("UNKNOWN");
            *by_error_code.entry(code.to_string()).or_insert(0) += 1;
        }
        let oldest_entry_age_ms = entries
            .first()
            .map(|e| {
                let (ms, _) = parse_id(&e.id);
                (now.max(0) as u64).saturating_sub(ms)
            })
            .unwrap_or(0);

        let replayed_total = self.stats.read().replayed_total;
        let stats = DlqStats {
            total_messages: entries.len() as u64,
            by_error_code,
            oldest_entry_age_ms,
            last_scan_at: now,
            replayed_total,
        };
        *self.stats.write() = stats.clone();
        Ok(stats)
    }

    pub fn get_stats(&self) -> DlqStats {
        self.stats.read().clone()
    }

    /// Replay one DLQ entry by message ID. The preserved payload is appended
    /// to the execution-requests stream with `{replayed, originalError,
    /// replayedAt}` markers. Returns false (and logs) when the entry cannot
    /// be found or has no replayable payload.
    pub async fn replay(&self, message_id: &str) -> Result<bool> {
        let Some(entry) = self.find_entry(message_id).await? else {
            warn!(message_id, "DLQ replay: entry not found");
            return Ok(false);
        };
        let Some(dlq_entry) = from_entry(&entry) else {
            error!(message_id, "DLQ replay: entry is missing mandatory fields");
            return Ok(false);
        };
        let Some(raw_payload) = dlq_entry.original_payload.as_deref() else {
            error!(message_id, "DLQ replay: entry has no original payload");
            return Ok(false);
        };
        let parsed: serde_json::Value = match serde_json::from_str(raw_payload) {
            Ok(v) => v,
            Err(e) => {
                error!(message_id, error = %e, "DLQ replay: payload is not valid JSON");
                return Ok(false);
            }
        };
        let serde_json::Value::Object(mut payload) = parsed else {
            error!(message_id, "DLQ replay: payload is not a JSON object");
            return Ok(false);
        };

        payload.insert("replayed".to_string(), serde_json::Value::Bool(true));
        payload.insert(
            "originalError".to_string(),
            serde_json::Value::String(dlq_entry.error.clone()),
        );
        payload.insert(
            "replayedAt".to_string(),
            serde_json::Value::from(chrono::Utc::now().timestamp_millis()),
        );

        let fields = vec![(
            "data".to_string(),
            serde_json::Value::Object(payload).to_string(),
        )];
        self.transport
            .append(names::EXECUTION_REQUESTS, &fields, self.config.maxlen)
            .await?;
        self.stats.write().replayed_total += 1;
        info!(message_id, original_stream = %dlq_entry.original_stream, "DLQ entry replayed");
        Ok(true)
    }

    /// Bounded pagination through the DLQ looking for a message ID.
    async fn find_entry(&self, message_id: &str) -> Result<Option<StreamEntry>> {
        let mut cursor = "-".to_string();
        for _ in 0..MAX_REPLAY_PAGES {
            let page = self
                .transport
                .range(names::DEAD_LETTER_QUEUE, &cursor, REPLAY_PAGE_SIZE)
                .await?;
            if page.is_empty() {
                return Ok(None);
            }
            if let Some(found) = page.iter().find(|e| e.id == message_id) {
                return Ok(Some(found.clone()));
            }
            let last = page.last().map(|e| e.id.clone()).unwrap_or_default();
            cursor = format!("({}", last);
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DlqCode;
    use crate::stream::memory::MemoryTransport;

    fn dlq_entry(error: String, payload: Option<&str>) -> DlqEntry {
        DlqEntry {
            original_message_id: "1-1".to_string(),
            original_stream: "stream:price-updates".to_string(),
            opportunity_id: String::new(),
            opportunity_type: String::new(),
            error,
            timestamp: chrono::Utc::now().timestamp_millis(),
            service: "chainarb".to_string(),
            instance_id: "inst-1".to_string(),
            original_payload: payload.map(|s| s.to_string()),
        }
    }

    fn supervisor(t: Arc<MemoryTransport>) -> Arc<DlqSupervisor> {
        Arc::new(DlqSupervisor::new(t, DlqConfig::default()))
    }

    #[test]
    fn test_error_code_extraction() {
        assert_eq!(error_code("[VAL_BAD_SHAPE] broken"), "VAL_BAD_SHAPE");
        assert_eq!(error_code("prefix [ERR_NO_CHAIN] detail"), "ERR_NO_CHAIN");
        assert_eq!(error_code("no code here"), "UNKNOWN");
        assert_eq!(error_code("[] empty"), "UNKNOWN");
    }

    #[test]
    fn test_fields_round_trip() {
        let entry = dlq_entry(
            DlqCode::ErrHandlerFatal.tag("boom"),
            Some(r#"{"chain":"polygon"}"#),
        );
        let fields = to_fields(&entry);
        let stream_entry = StreamEntry {
            id: "9-0".to_string(),
            fields: fields.into_iter().collect(),
        };
        let parsed = from_entry(&stream_entry).unwrap();
        assert_eq!(parsed.original_message_id, entry.original_message_id);
        assert_eq!(parsed.error, entry.error);
        assert_eq!(parsed.original_payload, entry.original_payload);
        assert_eq!(parsed.timestamp, entry.timestamp);
    }

    #[tokio::test]
    async fn test_scan_tallies_by_code() {
        let t = Arc::new(MemoryTransport::new());
        for _ in 0..3 {
            publish(
                t.as_ref(),
                &dlq_entry(DlqCode::ValBadShape.tag("x"), None),
                1000,
            )
            .await
            .unwrap();
        }
        publish(
            t.as_ref(),
            &dlq_entry(DlqCode::ErrNoChain.tag("y"), None),
            1000,
        )
        .await
        .unwrap();

        let sup = supervisor(t);
        let stats = sup.scan().await.unwrap();
        assert_eq!(stats.total_messages, 4);
        assert_eq!(stats.by_error_code.get("VAL_BAD_SHAPE"), Some(&3));
        assert_eq!(stats.by_error_code.get("ERR_NO_CHAIN"), Some(&1));
        assert_eq!(sup.get_stats().total_messages, 4);
    }

    #[tokio::test]
    async fn test_replay_appends_with_marker_fields() {
        let t = Arc::new(MemoryTransport::new());
        let entry = dlq_entry(
            DlqCode::ErrHandlerFatal.tag("handler blew up"),
            Some(r#"{"chain":"polygon","price":1.25}"#),
        );
        let id = publish(t.as_ref(), &entry, 1000).await.unwrap();

        let sup = supervisor(t.clone());
        assert!(sup.replay(&id).await.unwrap());

        let requests = t.range(names::EXECUTION_REQUESTS, "-", 10).await.unwrap();
        assert_eq!(requests.len(), 1);
        let payload: serde_json::Value = requests[0].json_field("data").unwrap();
        // Original payload plus exactly the three marker fields.
        assert_eq!(payload["chain"], "polygon");
        assert_eq!(payload["price"], 1.25);
        assert_eq!(payload["replayed"], true);
        assert_eq!(payload["originalError"], entry.error);
        assert!(payload["replayedAt"].is_i64());
        assert_eq!(payload.as_object().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_replay_without_payload_is_rejected() {
        let t = Arc::new(MemoryTransport::new());
        let id = publish(
            t.as_ref(),
            &dlq_entry(DlqCode::ValMissingId.tag("no payload"), None),
            1000,
        )
        .await
        .unwrap();

        let sup = supervisor(t.clone());
        assert!(!sup.replay(&id).await.unwrap());
        assert_eq!(t.len(names::EXECUTION_REQUESTS).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replay_with_invalid_json_is_rejected() {
        let t = Arc::new(MemoryTransport::new());
        let id = publish(
            t.as_ref(),
            &dlq_entry(DlqCode::Unknown.tag("garbage"), Some("{{not json")),
            1000,
        )
        .await
        .unwrap();

        let sup = supervisor(t.clone());
        assert!(!sup.replay(&id).await.unwrap());
        assert_eq!(t.len(names::EXECUTION_REQUESTS).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replay_unknown_id_returns_false() {
        let t = Arc::new(MemoryTransport::new());
        publish(
            t.as_ref(),
            &dlq_entry(DlqCode::Unknown.tag("x"), Some("{}")),
            1000,
        )
        .await
        .unwrap();

        let sup = supervisor(t.clone());
        assert!(!sup.replay("999999-0").await.unwrap());
    }
}
