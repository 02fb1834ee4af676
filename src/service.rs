//! Partition service factory.
//!
//! Builds every component of one detector deployment from `Config`, wires
//! the leadership callbacks to the failover stream, and owns startup and
//! shutdown ordering.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::{key_fingerprint, ApiState, HealthState};
use crate::circuit::CircuitBreaker;
use crate::config::Config;
use crate::coordinator::{publish_alert, Coordinator, CoordinatorConfig};
use crate::detector::engine::{
    CrossChainDetector, DetectorConfig, PriceUpdateHandler, SwapEventHandler, WhaleAlertHandler,
};
use crate::leadership::election::ElectionConfig;
use crate::leadership::{LeaderElector, StandbyActivationManager};
use crate::models::LeadershipAlert;
use crate::stream::consumer::{ConsumerConfig, StreamConsumerRuntime};
use crate::stream::dlq::{DlqConfig, DlqSupervisor};
use crate::stream::{names, StreamTransport, DEFAULT_MAXLEN};

/// Consumer group shared by the partition's detector instances.
const DETECTOR_GROUP: &str = "detector";
/// Housekeeping cadence for snapshot TTL and bridge retention.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

pub struct PartitionService {
    pub config: Config,
    transport: Arc<dyn StreamTransport>,
    breaker: Arc<CircuitBreaker>,
    health: Arc<HealthState>,
    detector: Arc<CrossChainDetector>,
    consumer: Arc<StreamConsumerRuntime>,
    dlq: Arc<DlqSupervisor>,
    coordinator: Arc<Coordinator>,
    alert_rx: Mutex<Option<mpsc::UnboundedReceiver<LeadershipAlert>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started_at: Instant,
}

impl PartitionService {
    pub fn build(config: Config, transport: Arc<dyn StreamTransport>) -> Arc<Self> {
        let breaker = Arc::new(CircuitBreaker::new());
        let health = Arc::new(HealthState::default());

        let detector = Arc::new(CrossChainDetector::new(
            transport.clone(),
            DetectorConfig::default(),
            breaker.clone(),
            None,
        ));

        let elector = Arc::new(LeaderElector::new(
            transport.clone(),
            ElectionConfig {
                lock_key: format!("lock:leader:{}", config.partition.id),
                instance_id: config.instance_id.clone(),
                is_standby: config.is_standby,
                can_become_leader: config.can_become_leader,
                ..ElectionConfig::default()
            },
        ));
        let (alert_tx, alert_rx) = mpsc::unbounded_channel();
        elector.on_alert(Arc::new(move |alert| {
            // Advisory: a full channel or dropped receiver never blocks the
            // election state machine.
            let _ = alert_tx.send(alert);
        }));
        elector.on_leadership_change(Arc::new(|is_leader| {
            info!(is_leader, "Leadership changed");
        }));

        let standby = Arc::new(StandbyActivationManager::new(elector.clone()));
        let coordinator = Arc::new(Coordinator::new(
            transport.clone(),
            elector,
            standby,
            CoordinatorConfig {
                region_id: config.region_id.clone(),
                failover_timeout: config.partition.failover_timeout,
                cross_region_enabled: config.enable_cross_region_health,
                ..CoordinatorConfig::default()
            },
        ));

        let mut consumer = StreamConsumerRuntime::new(
            transport.clone(),
            ConsumerConfig {
                consumer_id: config.instance_id.clone(),
                service: format!("detector:{}", config.partition.id),
                ..ConsumerConfig::default()
            },
            config.instance_id.clone(),
        );
        consumer.register(
            names::PRICE_UPDATES,
            DETECTOR_GROUP,
            Arc::new(PriceUpdateHandler {
                detector: detector.clone(),
            }),
        );
        consumer.register(
            names::WHALE_ALERTS,
            DETECTOR_GROUP,
            Arc::new(WhaleAlertHandler {
                detector: detector.clone(),
            }),
        );
        consumer.register(
            names::SWAP_EVENTS,
            DETECTOR_GROUP,
            Arc::new(SwapEventHandler {
                detector: detector.clone(),
            }),
        );

        let dlq = Arc::new(DlqSupervisor::new(transport.clone(), DlqConfig::default()));

        Arc::new(Self {
            config,
            transport,
            breaker,
            health,
            detector,
            consumer: Arc::new(consumer),
            dlq,
            coordinator,
            alert_rx: Mutex::new(Some(alert_rx)),
            tasks: Mutex::new(Vec::new()),
            started_at: Instant::now(),
        })
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!(
            partition = %self.config.partition.id,
            chains = ?self.config.partition.chains,
            instance_id = %self.config.instance_id,
            region = %self.config.region_id,
            standby = self.config.is_standby,
            "Starting partition service"
        );
        if let Some(key) = &self.config.circuit_breaker_api_key {
            info!(fingerprint = %key_fingerprint(key), "Circuit breaker API key configured");
        }

        // Leadership alerts drain to the failover stream.
        if let Some(mut alert_rx) = self.alert_rx.lock().take() {
            let transport = self.transport.clone();
            self.tasks.lock().push(tokio::spawn(async move {
                while let Some(alert) = alert_rx.recv().await {
                    if let Err(e) =
                        publish_alert(transport.as_ref(), &alert, DEFAULT_MAXLEN).await
                    {
                        warn!(error = %e, "Failed to publish leadership alert");
                    }
                }
            }));
        }

        self.coordinator.start();
        self.dlq.start();
        self.consumer.start().await?;

        // Periodic snapshot TTL and bridge retention housekeeping.
        {
            let detector = self.detector.clone();
            self.tasks.lock().push(tokio::spawn(async move {
                let mut timer = tokio::time::interval(CLEANUP_INTERVAL);
                timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    timer.tick().await;
                    detector.cleanup();
                }
            }));
        }

        self.health.set_running(true);
        if self.config.no_chain_endpoints() {
            warn!("No chain endpoints configured; reporting degraded until workers connect");
            self.health.set_degraded(true);
        }
        info!("Partition service started");
        Ok(())
    }

    pub async fn stop(&self) {
        info!("Stopping partition service");
        self.health.set_running(false);
        self.consumer.stop().await;
        self.dlq.stop().await;
        self.coordinator.stop().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("Partition service stopped");
    }

    pub fn detector(&self) -> Arc<CrossChainDetector> {
        self.detector.clone()
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }

    pub fn health(&self) -> Arc<HealthState> {
        self.health.clone()
    }

    pub fn dlq(&self) -> Arc<DlqSupervisor> {
        self.dlq.clone()
    }

    pub fn api_state(&self) -> Arc<ApiState> {
        Arc::new(ApiState {
            health: self.health.clone(),
            breaker: self.breaker.clone(),
            transport: self.transport.clone(),
            elector: self.coordinator.elector(),
            detector_stats: self.detector.stats(),
            consumer_stats: self.consumer.stats(),
            dlq: self.dlq.clone(),
            api_key: self.config.circuit_breaker_api_key.clone(),
            instance_id: self.config.instance_id.clone(),
            region_id: self.config.region_id.clone(),
            partition_id: self.config.partition.id.clone(),
            started_at: self.started_at,
            maxlen: DEFAULT_MAXLEN,
        })
    }
}
