//! Coordinator / failover supervisor.
//!
//! Owns the leadership engine and the standby activation manager, scans the
//! fleet's streams for health findings, publishes them, and drives
//! cross-region failover: a primary region that stays critical past the
//! partition's failover timeout gets a LEADER_LOST published on
//! `stream:system-failover`, which standby regions react to by activating.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::leadership::{LeaderElector, StandbyActivationManager};
use crate::models::{AlertKind, LeadershipAlert, Severity};
use crate::stream::{names, StreamTransport, DEFAULT_MAXLEN};

/// Stream-length and group thresholds from the findings table.
const UNBOUNDED_STREAM_LEN: u64 = 50_000;
const STREAM_GROWTH_DELTA: u64 = 100;
const CONSUMER_LAG_THRESHOLD: u64 = 100;
const MISSING_ACK_PENDING: u64 = 10;
const STUCK_MESSAGE_IDLE_MS: u64 = 30_000;
const DELIVERY_FAILURE_COUNT: u64 = 3;
/// Per-group pending entries inspected for stuck/delivery findings.
const PENDING_SAMPLE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FindingKind {
    NoConsumerGroup,
    UnboundedStream,
    StreamGrowing,
    DeadConsumer,
    ConsumerLag,
    MissingAck,
    StuckMessage,
    DeliveryFailure,
}

impl FindingKind {
    pub fn severity(&self) -> Severity {
        match self {
            FindingKind::NoConsumerGroup | FindingKind::UnboundedStream => Severity::Warning,
            FindingKind::StreamGrowing
            | FindingKind::MissingAck
            | FindingKind::StuckMessage
            | FindingKind::DeliveryFailure => Severity::Warning,
            FindingKind::DeadConsumer | FindingKind::ConsumerLag => Severity::Critical,
        }
    }

    /// MEDIUM/HIGH/CRITICAL bucket used on the published finding.
    pub fn level(&self) -> &'static str {
        match self {
            FindingKind::NoConsumerGroup | FindingKind::UnboundedStream => "MEDIUM",
            FindingKind::StreamGrowing
            | FindingKind::MissingAck
            | FindingKind::StuckMessage
            | FindingKind::DeliveryFailure => "HIGH",
            FindingKind::DeadConsumer | FindingKind::ConsumerLag => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthFinding {
    pub kind: FindingKind,
    pub level: &'static str,
    pub stream: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub detail: String,
}

impl HealthFinding {
    fn new(kind: FindingKind, stream: &str, group: Option<&str>, detail: String) -> Self {
        Self {
            kind,
            level: kind.level(),
            stream: stream.to_string(),
            group: group.map(|g| g.to_string()),
            detail,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub region_id: String,
    pub scan_interval: Duration,
    /// How long the region may stay critical before failover fires.
    pub failover_timeout: Duration,
    /// Cross-region signaling gate: when false, health findings are still
    /// published locally but no failover signal is emitted and standby
    /// instances do not watch for one.
    pub cross_region_enabled: bool,
    pub maxlen: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            region_id: "primary".to_string(),
            scan_interval: Duration::from_secs(30),
            failover_timeout: Duration::from_secs(60),
            cross_region_enabled: true,
            maxlen: DEFAULT_MAXLEN,
        }
    }
}

/// Per-stream state remembered between scans for growth/ack comparisons.
#[derive(Debug, Default, Clone)]
struct ScanMemory {
    len: u64,
    pending_by_group: HashMap<String, u64>,
}

pub struct Coordinator {
    transport: Arc<dyn StreamTransport>,
    elector: Arc<LeaderElector>,
    standby: Arc<StandbyActivationManager>,
    config: CoordinatorConfig,
    previous: Mutex<HashMap<String, ScanMemory>>,
    critical_since: Mutex<Option<Instant>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        elector: Arc<LeaderElector>,
        standby: Arc<StandbyActivationManager>,
        config: CoordinatorConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            transport,
            elector,
            standby,
            config,
            previous: Mutex::new(HashMap::new()),
            critical_since: Mutex::new(None),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn elector(&self) -> Arc<LeaderElector> {
        self.elector.clone()
    }

    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        self.elector.start();

        {
            let this = self.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
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
                            if let Err(e) = this.scan_once().await {
                                warn!(error = %e, "Fleet health scan failed");
                            }
                        }
                    }
                }
            }));
        }

        // Standby regions watch the failover stream and self-promote.
        if self.elector.is_standby() && !self.config.cross_region_enabled {
            info!(
                region = %self.config.region_id,
                "Cross-region health disabled; standby will not watch for failover signals"
            );
        } else if self.elector.is_standby() {
            let this = self.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                let group = format!("failover:{}", this.config.region_id);
                if let Err(e) = this
                    .transport
                    .ensure_group(names::SYSTEM_FAILOVER, &group)
                    .await
                {
                    warn!(error = %e, "Failed to create failover consumer group");
                    return;
                }
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                return;
                            }
                        }
                        result = this.watch_failover_once(&group) => {
                            if let Err(e) = result {
                                warn!(error = %e, "Failover watch read failed");
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                    }
                }
            }));
        }
        info!(region = %self.config.region_id, "Coordinator started");
    }

    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.elector.stop().await;
        info!(region = %self.config.region_id, "Coordinator stopped");
    }

    /// One consumer-group read of the failover stream; LEADER_LOST alerts
    /// trigger standby activation.
    pub(crate) async fn watch_failover_once(&self, group: &str) -> Result<()> {
        let consumer = format!("coordinator:{}", self.config.region_id);
        let entries = self
            .transport
            .read_group(names::SYSTEM_FAILOVER, group, &consumer, 10, 2_000)
            .await?;
        for entry in &entries {
            let Ok(alert) = entry.json_field::<LeadershipAlert>("data") else {
                continue;
            };
            if alert.kind == AlertKind::LeaderLost {
                info!(region = %self.config.region_id, "Failover signal observed; activating standby");
                // Spawned so a shutdown mid-read cannot drop the activation
                // attempt before its flags reset.
                let standby = self.standby.clone();
                let attempt = tokio::spawn(async move { standby.activate_standby().await });
                if let Ok(activated) = attempt.await {
                    info!(activated, "Standby activation attempt finished");
                }
            }
        }
        let ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();
        if !ids.is_empty() {
            self.transport
                .ack(names::SYSTEM_FAILOVER, group, &ids)
                .await?;
        }
        Ok(())
    }

    /// One fleet-health pass over the monitored streams. Findings are
    /// published to `stream:service-health`; sustained critical findings
    /// trip the failover publication.
    pub async fn scan_once(&self) -> Result<Vec<HealthFinding>> {
        let mut findings = Vec::new();
        let mut memory = HashMap::new();

        for stream in names::MONITORED {
            match self.scan_stream(stream).await {
                Ok((stream_findings, state)) => {
                    findings.extend(stream_findings);
                    memory.insert(stream.to_string(), state);
                }
                Err(e) => debug!(stream, error = %e, "Stream not inspectable this scan"),
            }
        }
        *self.previous.lock() = memory;

        for finding in &findings {
            self.publish_finding(finding).await;
        }
        self.evaluate_failover(&findings).await?;
        Ok(findings)
    }

    async fn scan_stream(&self, stream: &str) -> Result<(Vec<HealthFinding>, ScanMemory)> {
        let mut findings = Vec::new();
        let len = self.transport.len(stream).await?;
        let groups = self.transport.groups(stream).await.unwrap_or_default();
        let previous = self.previous.lock().get(stream).cloned();

        // Optional streams may legitimately have no producer or group.
        let optional = stream == names::FORWARDING_DLQ || stream == names::SERVICE_DEGRADATION;
        if len > 0 && groups.is_empty() && !optional {
            findings.push(HealthFinding::new(
                FindingKind::NoConsumerGroup,
                stream,
                None,
                format!("{} entries with no consumer group", len),
            ));
        }
        if len > UNBOUNDED_STREAM_LEN {
            findings.push(HealthFinding::new(
                FindingKind::UnboundedStream,
                stream,
                None,
                format!("length {} above absolute threshold", len),
            ));
        }
        if let Some(prev) = &previous {
            if len > prev.len && len - prev.len > STREAM_GROWTH_DELTA {
                findings.push(HealthFinding::new(
                    FindingKind::StreamGrowing,
                    stream,
                    None,
                    format!("grew {} -> {} since last scan", prev.len, len),
                ));
            }
        }

        let mut pending_by_group = HashMap::new();
        for group in &groups {
            pending_by_group.insert(group.name.clone(), group.pending);

            if group.pending > 0 && group.consumers == 0 {
                findings.push(HealthFinding::new(
                    FindingKind::DeadConsumer,
                    stream,
                    Some(&group.name),
                    format!("{} pending entries with no consumers", group.pending),
                ));
            }
            if let Some(lag) = group.lag {
                if lag > CONSUMER_LAG_THRESHOLD {
                    findings.push(HealthFinding::new(
                        FindingKind::ConsumerLag,
                        stream,
                        Some(&group.name),
                        format!("lag {} behind stream head", lag),
                    ));
                }
            }
            if group.pending > MISSING_ACK_PENDING {
                let prior = previous
                    .as_ref()
                    .and_then(|p| p.pending_by_group.get(&group.name).copied());
                if let Some(prior) = prior {
                    if group.pending >= prior {
                        findings.push(HealthFinding::new(
                            FindingKind::MissingAck,
                            stream,
                            Some(&group.name),
                            format!("pending {} not decreasing (was {})", group.pending, prior),
                        ));
                    }
                }
            }

            let pending_entries = self
                .transport
                .list_pending(stream, &group.name, PENDING_SAMPLE)
                .await
                .unwrap_or_default();
            for p in pending_entries {
                if p.idle_ms > STUCK_MESSAGE_IDLE_MS {
                    findings.push(HealthFinding::new(
                        FindingKind::StuckMessage,
                        stream,
                        Some(&group.name),
                        format!("entry {} idle {}ms", p.id, p.idle_ms),
                    ));
                }
                if p.delivery_count > DELIVERY_FAILURE_COUNT {
                    findings.push(HealthFinding::new(
                        FindingKind::DeliveryFailure,
                        stream,
                        Some(&group.name),
                        format!("entry {} delivered {} times", p.id, p.delivery_count),
                    ));
                }
            }
        }

        Ok((
            findings,
            ScanMemory {
                len,
                pending_by_group,
            },
        ))
    }

    async fn publish_finding(&self, finding: &HealthFinding) {
        let payload = match serde_json::to_string(finding) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Failed to serialize health finding");
                return;
            }
        };
        let fields = vec![
            ("data".to_string(), payload),
            ("region".to_string(), self.config.region_id.clone()),
        ];
        if let Err(e) = self
            .transport
            .append(names::SERVICE_HEALTH, &fields, self.config.maxlen)
            .await
        {
            warn!(error = %e, "Failed to publish health finding");
        }
    }

    /// Sustained critical health fires a LEADER_LOST on the failover stream
    /// so the standby region takes over. Gated on cross-region health being
    /// enabled for this deployment.
    async fn evaluate_failover(&self, findings: &[HealthFinding]) -> Result<()> {
        if !self.config.cross_region_enabled {
            return Ok(());
        }
        let critical = findings
            .iter()
            .any(|f| f.kind.severity() == Severity::Critical);
        let should_fire = {
            let mut since = self.critical_since.lock();
            if !critical {
                *since = None;
                false
            } else {
                let started = since.get_or_insert_with(Instant::now);
                if started.elapsed() < self.config.failover_timeout {
                    false
                } else {
                    *since = None;
                    true
                }
            }
        };
        if !should_fire {
            return Ok(());
        }

        warn!(
            region = %self.config.region_id,
            timeout_secs = self.config.failover_timeout.as_secs(),
            "Region critical past failover timeout; publishing failover signal"
        );
        let alert = LeadershipAlert::new(
            AlertKind::LeaderLost,
            Severity::Critical,
            "region health critical past failover timeout",
        )
        .with_data(serde_json::json!({ "region": self.config.region_id }));
        publish_alert(
            self.transport.as_ref(),
            &alert,
            self.config.maxlen,
        )
        .await?;
        Ok(())
    }
}

/// Append a leadership alert to `stream:system-failover`.
pub async fn publish_alert(
    transport: &dyn StreamTransport,
    alert: &LeadershipAlert,
    maxlen: usize,
) -> Result<String> {
    let fields = vec![
        ("data".to_string(), serde_json::to_string(alert)?),
        ("type".to_string(), alert.kind.as_str().to_string()),
    ];
    transport
        .append(names::SYSTEM_FAILOVER, &fields, maxlen)
        .await
}
