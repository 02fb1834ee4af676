//! Stream consumer runtime.
//!
//! Reads consumer-group entries, dispatches them to registered handlers,
//! acknowledges on success, and routes fatal entries to the dead-letter
//! queue. Delivery is at-least-once; handlers must be idempotent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::models::{DlqCode, DlqEntry};
use crate::stream::{dlq, StreamEntry, StreamTransport, DEFAULT_MAXLEN};
use crate::util::backoff::Backoff;

/// Length thresholds for the consumer-side stream observations.
const STREAM_GROWTH_DELTA: u64 = 100;
const UNBOUNDED_STREAM_LEN: u64 = 50_000;

/// Handler outcome classification drives the PEL lifecycle: transient
/// failures leave the entry pending for a later claim, fatal failures are
/// dead-lettered and acknowledged.
#[derive(Debug)]
pub enum HandlerError {
    Transient(anyhow::Error),
    Fatal { code: DlqCode, message: String },
}

impl HandlerError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        HandlerError::Transient(err.into())
    }

    pub fn fatal(code: DlqCode, message: impl Into<String>) -> Self {
        HandlerError::Fatal {
            code,
            message: message.into(),
        }
    }
}

/// Per-stream message handler. Invoked once per delivered entry; must be
/// safe to re-invoke for the same entry.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle(&self, entry: &StreamEntry) -> Result<(), HandlerError>;
}

/// One (stream, group, handler) binding.
pub struct HandlerRegistration {
    pub stream: String,
    pub group: String,
    pub handler: Arc<dyn StreamHandler>,
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub consumer_id: String,
    pub service: String,
    pub batch_size: usize,
    pub block_ms: u64,
    /// Pending entries idle longer than this are claimed for retry.
    pub claim_idle_ms: u64,
    /// How often the claim pass runs.
    pub claim_interval: Duration,
    /// Deliveries beyond this count dead-letter the entry.
    pub max_deliveries: u64,
    pub shutdown_timeout: Duration,
    pub maxlen: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_id: "consumer-0".to_string(),
            service: "chainarb".to_string(),
            batch_size: 10,
            block_ms: 2_000,
            claim_idle_ms: 30_000,
            claim_interval: Duration::from_secs(15),
            max_deliveries: 3,
            shutdown_timeout: Duration::from_secs(5),
            maxlen: DEFAULT_MAXLEN,
        }
    }
}

#[derive(Debug, Default)]
pub struct ConsumerStats {
    pub processed: AtomicU64,
    pub acked: AtomicU64,
    pub transient_failures: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub claimed: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumerStatsSnapshot {
    pub processed: u64,
    pub acked: u64,
    pub transient_failures: u64,
    pub dead_lettered: u64,
    pub claimed: u64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            transient_failures: self.transient_failures.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            claimed: self.claimed.load(Ordering::Relaxed),
        }
    }
}

/// Drives one dispatch loop per registered stream plus a shared claim pass.
pub struct StreamConsumerRuntime {
    transport: Arc<dyn StreamTransport>,
    config: ConsumerConfig,
    instance_id: String,
    registrations: Vec<Arc<HandlerRegistration>>,
    stats: Arc<ConsumerStats>,
    shutdown_tx: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl StreamConsumerRuntime {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        config: ConsumerConfig,
        instance_id: String,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            transport,
            config,
            instance_id,
            registrations: Vec::new(),
            stats: Arc::new(ConsumerStats::default()),
            shutdown_tx,
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn register(
        &mut self,
        stream: impl Into<String>,
        group: impl Into<String>,
        handler: Arc<dyn StreamHandler>,
    ) {
        self.registrations.push(Arc::new(HandlerRegistration {
            stream: stream.into(),
            group: group.into(),
            handler,
        }));
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.stats.clone()
    }

    /// Create groups and spawn one dispatch loop per registration.
    pub async fn start(&self) -> Result<()> {
        for reg in &self.registrations {
            self.transport.ensure_group(&reg.stream, &reg.group).await?;
        }
        let mut tasks = self.tasks.lock();
        for reg in &self.registrations {
            let worker = Worker {
                transport: self.transport.clone(),
                config: self.config.clone(),
                instance_id: self.instance_id.clone(),
                stats: self.stats.clone(),
                registration: reg.clone(),
            };
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                worker.run(&mut shutdown_rx).await;
            }));
        }
        info!(
            consumers = self.registrations.len(),
            consumer_id = %self.config.consumer_id,
            "Stream consumer runtime started"
        );
        Ok(())
    }

    /// Signal all loops to stop and drain in-flight handlers within the
    /// shutdown timeout; anything still running after that is abandoned.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            if tokio::time::timeout(self.config.shutdown_timeout, handle)
                .await
                .is_err()
            {
                warn!("Consumer loop did not drain within shutdown timeout; abandoning");
            }
        }
        info!("Stream consumer runtime stopped");
    }
}

/// State for one (stream, group) dispatch loop.
struct Worker {
    transport: Arc<dyn StreamTransport>,
    config: ConsumerConfig,
    instance_id: String,
    stats: Arc<ConsumerStats>,
    registration: Arc<HandlerRegistration>,
}

impl Worker {
    async fn run(&self, shutdown_rx: &mut watch::Receiver<bool>) {
        let mut claim_timer = tokio::time::interval(self.config.claim_interval);
        claim_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_len: Option<u64> = None;
        let mut read_backoff = Backoff::default();

        loop {
            // Only the blocked read races shutdown; once entries are in
            // hand, dispatch runs to completion so in-flight handlers drain
            // instead of being dropped mid-invocation.
            let read = tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!(stream = %self.registration.stream, "Dispatch loop stopping");
                        return;
                    }
                    continue;
                }
                _ = claim_timer.tick() => {
                    if let Err(e) = self.claim_pass().await {
                        warn!(stream = %self.registration.stream, error = %e, "Claim pass failed");
                    }
                    self.observe_stream_length(&mut last_len).await;
                    continue;
                }
                read = self.transport.read_group(
                    &self.registration.stream,
                    &self.registration.group,
                    &self.config.consumer_id,
                    self.config.batch_size,
                    self.config.block_ms,
                ) => read,
            };
            match read {
                Ok(entries) => {
                    read_backoff.reset();
                    for entry in entries {
                        self.dispatch_entry(&entry).await;
                    }
                }
                Err(e) => {
                    if read_backoff.exhausted() {
                        error!(
                            stream = %self.registration.stream,
                            error = %e,
                            "Stream read still failing after retry budget"
                        );
                    } else {
                        warn!(stream = %self.registration.stream, error = %e, "Stream read failed");
                    }
                    tokio::time::sleep(read_backoff.next_delay()).await;
                }
            }
        }
    }

    /// One blocking read followed by dispatch of every delivered entry.
    #[cfg(test)]
    async fn poll_once(&self) -> Result<()> {
        let entries = self
            .transport
            .read_group(
                &self.registration.stream,
                &self.registration.group,
                &self.config.consumer_id,
                self.config.batch_size,
                self.config.block_ms,
            )
            .await?;
        for entry in entries {
            self.dispatch_entry(&entry).await;
        }
        Ok(())
    }

    /// Validate, invoke the handler, and settle the entry.
    async fn dispatch_entry(&self, entry: &StreamEntry) {
        self.stats.processed.fetch_add(1, Ordering::Relaxed);

        if let Err((code, message)) = self.validate(entry) {
            self.dead_letter(entry, code, &message).await;
            return;
        }

        match self.registration.handler.handle(entry).await {
            Ok(()) => {
                if let Err(e) = self
                    .transport
                    .ack(
                        &self.registration.stream,
                        &self.registration.group,
                        &[entry.id.clone()],
                    )
                    .await
                {
                    warn!(id = %entry.id, error = %e, "Ack failed; entry will be redelivered");
                } else {
                    self.stats.acked.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(HandlerError::Transient(e)) => {
                // Leave in the PEL; the claim pass retries it later.
                self.stats.transient_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    id = %entry.id,
                    stream = %self.registration.stream,
                    error = %e,
                    "Transient handler failure; entry left pending"
                );
            }
            Err(HandlerError::Fatal { code, message }) => {
                self.dead_letter(entry, code, &message).await;
            }
        }
    }

    /// Schema check enforced before the handler sees the entry: a `data`
    /// field must be present and hold valid JSON.
    fn validate(&self, entry: &StreamEntry) -> Result<(), (DlqCode, String)> {
        if entry.id.is_empty() {
            return Err((DlqCode::ValMissingId, "entry has no id".to_string()));
        }
        let Some(data) = entry.field("data") else {
            return Err((
                DlqCode::ValBadShape,
                "entry has no 'data' field".to_string(),
            ));
        };
        if serde_json::from_str::<serde_json::Value>(data).is_err() {
            return Err((
                DlqCode::ValBadShape,
                "'data' field is not valid JSON".to_string(),
            ));
        }
        Ok(())
    }

    /// Publish the preserved payload to the DLQ and acknowledge the original
    /// so the poisoned entry stops cycling through the group.
    async fn dead_letter(&self, entry: &StreamEntry, code: DlqCode, message: &str) {
        let dlq_entry = DlqEntry {
            original_message_id: entry.id.clone(),
            original_stream: self.registration.stream.clone(),
            opportunity_id: entry.field("opportunityId").unwrap_or_default().to_string(),
            opportunity_type: entry
                .field("opportunityType")
                .unwrap_or_default()
                .to_string(),
            error: code.tag(message),
            timestamp: chrono::Utc::now().timestamp_millis(),
            service: self.config.service.clone(),
            instance_id: self.instance_id.clone(),
            original_payload: entry.field("data").map(|s| s.to_string()),
        };
        if let Err(e) = dlq::publish(self.transport.as_ref(), &dlq_entry, self.config.maxlen).await
        {
            error!(id = %entry.id, error = %e, "Failed to dead-letter entry; leaving pending");
            return;
        }
        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self
            .transport
            .ack(
                &self.registration.stream,
                &self.registration.group,
                &[entry.id.clone()],
            )
            .await
        {
            warn!(id = %entry.id, error = %e, "Ack after dead-letter failed");
        }
        warn!(
            id = %entry.id,
            stream = %self.registration.stream,
            error = %dlq_entry.error,
            "Entry routed to DLQ"
        );
    }

    /// Reclaim stuck pending entries; entries past the delivery budget are
    /// dead-lettered instead of retried.
    async fn claim_pass(&self) -> Result<()> {
        let pending = self
            .transport
            .list_pending(&self.registration.stream, &self.registration.group, 100)
            .await?;

        let mut to_claim = Vec::new();
        for p in pending {
            if p.idle_ms < self.config.claim_idle_ms {
                continue;
            }
            if p.delivery_count > self.config.max_deliveries {
                // Past the retry budget; fetch the body via claim so the
                // payload is preserved on the DLQ entry.
                let entries = self
                    .transport
                    .claim(
                        &self.registration.stream,
                        &self.registration.group,
                        &self.config.consumer_id,
                        self.config.claim_idle_ms,
                        &[p.id.clone()],
                    )
                    .await?;
                for entry in entries {
                    self.dead_letter(
                        &entry,
                        DlqCode::ErrHandlerFatal,
                        &format!("delivery count {} exceeded budget", p.delivery_count),
                    )
                    .await;
                }
            } else {
                to_claim.push(p.id);
            }
        }

        if to_claim.is_empty() {
            return Ok(());
        }
        let claimed = self
            .transport
            .claim(
                &self.registration.stream,
                &self.registration.group,
                &self.config.consumer_id,
                self.config.claim_idle_ms,
                &to_claim,
            )
            .await?;
        self.stats
            .claimed
            .fetch_add(claimed.len() as u64, Ordering::Relaxed);
        for entry in claimed {
            self.dispatch_entry(&entry).await;
        }
        Ok(())
    }

    /// Length watch: flags runaway producers before the MAXLEN cap starts
    /// discarding unread entries.
    async fn observe_stream_length(&self, last_len: &mut Option<u64>) {
        let Ok(len) = self.transport.len(&self.registration.stream).await else {
            return;
        };
        if len > UNBOUNDED_STREAM_LEN {
            warn!(
                stream = %self.registration.stream,
                len,
                "UNBOUNDED_STREAM: length above absolute threshold"
            );
        } else if let Some(prev) = *last_len {
            if len > prev && len - prev > STREAM_GROWTH_DELTA {
                warn!(
                    stream = %self.registration.stream,
                    prev,
                    len,
                    "STREAM_GROWING: length grew faster than consumption"
                );
            }
        }
        *last_len = Some(len);
    }
}
