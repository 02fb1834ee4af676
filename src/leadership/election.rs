//! Leadership election engine.
//!
//! A single leader per deployment holds a lease key on the stream transport.
//! All lease writes are server-side atomic (create-if-absent,
//! extend-if-owner, delete-if-owner); the engine never reads then writes.
//! A jittered heartbeat renews the lease while leading and keeps trying to
//! acquire while following. Consecutive renewal exceptions demote the
//! leader; a renewal that comes back "not owner" demotes immediately.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::models::{AlertKind, LeadershipAlert, Severity};
use crate::stream::StreamTransport;

pub type LeadershipChangeFn = Arc<dyn Fn(bool) + Send + Sync>;
pub type AlertFn = Arc<dyn Fn(LeadershipAlert) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ElectionConfig {
    pub lock_key: String,
    pub lock_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub instance_id: String,
    pub is_standby: bool,
    pub can_become_leader: bool,
    pub max_heartbeat_failures: u32,
    /// Total uniform jitter range applied around the heartbeat interval.
    pub jitter_range: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            lock_key: "lock:leader".to_string(),
            lock_ttl: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            instance_id: "instance-0".to_string(),
            is_standby: false,
            can_become_leader: true,
            max_heartbeat_failures: 3,
            jitter_range: Duration::from_millis(4_000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ElectionState {
    Init,
    Follower,
    Leader,
    Stopped,
}

/// Lease-based single-leader election over the transport's atomic key
/// primitives.
pub struct LeaderElector {
    transport: Arc<dyn StreamTransport>,
    config: ElectionConfig,
    state: Mutex<ElectionState>,
    is_leader: AtomicBool,
    is_standby: AtomicBool,
    activating: AtomicBool,
    consecutive_failures: AtomicU32,
    on_change: Mutex<Option<LeadershipChangeFn>>,
    on_alert: Mutex<Option<AlertFn>>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LeaderElector {
    pub fn new(transport: Arc<dyn StreamTransport>, mut config: ElectionConfig) -> Self {
        // The lease must outlive at least three missed heartbeats, otherwise
        // a single slow renewal loses leadership.
        let max_heartbeat = config.lock_ttl / 3;
        if config.heartbeat_interval > max_heartbeat {
            warn!(
                configured_ms = config.heartbeat_interval.as_millis() as u64,
                clamped_ms = max_heartbeat.as_millis() as u64,
                "Heartbeat interval too long for lock TTL; clamping"
            );
            config.heartbeat_interval = max_heartbeat;
        }
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            transport,
            is_standby: AtomicBool::new(config.is_standby),
            config,
            state: Mutex::new(ElectionState::Init),
            is_leader: AtomicBool::new(false),
            activating: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            on_change: Mutex::new(None),
            on_alert: Mutex::new(None),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    pub fn on_leadership_change(&self, f: LeadershipChangeFn) {
        *self.on_change.lock() = Some(f);
    }

    pub fn on_alert(&self, f: AlertFn) {
        *self.on_alert.lock() = Some(f);
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn is_standby(&self) -> bool {
        self.is_standby.load(Ordering::SeqCst)
    }

    pub fn set_standby(&self, standby: bool) {
        self.is_standby.store(standby, Ordering::SeqCst);
    }

    /// External gate from the standby activation manager: while set, a
    /// standby instance is allowed to contend for the lease.
    pub fn set_activating(&self, activating: bool) {
        self.activating.store(activating, Ordering::SeqCst);
    }

    pub fn can_become_leader(&self) -> bool {
        self.config.can_become_leader
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    pub fn state(&self) -> ElectionState {
        *self.state.lock()
    }

    /// Begin the election loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.task.lock();
        if slot.is_some() {
            return;
        }
        {
            let mut state = self.state.lock();
            if *state == ElectionState::Init || *state == ElectionState::Stopped {
                *state = ElectionState::Follower;
            }
        }
        let this = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        *slot = Some(tokio::spawn(async move {
            info!(
                instance_id = %this.config.instance_id,
                lock_key = %this.config.lock_key,
                standby = this.is_standby(),
                "Leadership election loop started"
            );
            loop {
                let delay = this.jittered_delay();
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {
                        this.tick().await;
                    }
                }
            }
        }));
    }

    /// Stop the loop and release the lease if held. Idempotent.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        if self.is_leader.swap(false, Ordering::SeqCst) {
            // Release only while still owner; a lost lease makes this a no-op.
            match self
                .transport
                .compare_and_delete(&self.config.lock_key, &self.config.instance_id)
                .await
            {
                Ok(released) => {
                    debug!(released, "Leadership lease release attempted on stop")
                }
                Err(e) => warn!(error = %e, "Lease release failed on stop"),
            }
            self.fire_change(false);
        }
        *self.state.lock() = ElectionState::Stopped;
        info!(instance_id = %self.config.instance_id, "Leadership election stopped");
    }

    /// One acquisition attempt. Returns current leader status; I/O errors
    /// are logged and leave leader state untouched.
    pub async fn try_acquire(&self) -> bool {
        if !self.config.can_become_leader {
            return false;
        }
        if self.is_standby() && !self.activating.load(Ordering::SeqCst) {
            return false;
        }

        let ttl_sec = ttl_seconds(self.config.lock_ttl);
        match self
            .transport
            .set_if_absent(&self.config.lock_key, &self.config.instance_id, ttl_sec)
            .await
        {
            Ok(true) => {
                self.become_leader();
                return true;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "Lease acquisition failed");
                return false;
            }
        }

        // Key exists: renew if we are the owner, otherwise someone else leads.
        match self
            .transport
            .compare_and_extend(&self.config.lock_key, &self.config.instance_id, ttl_sec)
            .await
        {
            Ok(true) => {
                // We already held the lease (e.g. restart before expiry).
                self.become_leader();
                true
            }
            Ok(false) => {
                if self.is_leader() {
                    self.demote(
                        AlertKind::LeaderLost,
                        Severity::Warning,
                        "lease ownership lost to another instance",
                    );
                }
                false
            }
            Err(e) => {
                warn!(error = %e, "Lease renewal check failed");
                false
            }
        }
    }

    /// One heartbeat: renew while leading, contend while following.
    pub(crate) async fn tick(&self) {
        if self.is_leader() {
            let ttl_sec = ttl_seconds(self.config.lock_ttl);
            match self
                .transport
                .compare_and_extend(&self.config.lock_key, &self.config.instance_id, ttl_sec)
                .await
            {
                Ok(true) => {
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                }
                Ok(false) => {
                    self.demote(
                        AlertKind::LeaderLost,
                        Severity::Warning,
                        "lease renewal returned not-owner",
                    );
                }
                Err(e) => {
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    error!(
                        failures,
                        error = %e,
                        "Heartbeat renewal failed"
                    );
                    self.fire_alert(LeadershipAlert::new(
                        AlertKind::LeaderHeartbeatFailure,
                        Severity::Warning,
                        format!("heartbeat renewal failed ({} consecutive)", failures),
                    ));
                    if failures >= self.config.max_heartbeat_failures {
                        self.consecutive_failures.store(0, Ordering::SeqCst);
                        self.demote(
                            AlertKind::LeaderDemotion,
                            Severity::Critical,
                            "max consecutive heartbeat failures reached",
                        );
                    }
                }
            }
        } else {
            let _ = self.try_acquire().await;
        }
    }

    fn become_leader(&self) {
        if !self.is_leader.swap(true, Ordering::SeqCst) {
            *self.state.lock() = ElectionState::Leader;
            self.consecutive_failures.store(0, Ordering::SeqCst);
            info!(instance_id = %self.config.instance_id, "Acquired leadership");
            self.fire_alert(
                LeadershipAlert::new(
                    AlertKind::LeaderAcquired,
                    Severity::Info,
                    "leadership acquired",
                )
                .with_data(serde_json::json!({ "instanceId": self.config.instance_id })),
            );
            self.fire_change(true);
        }
    }

    fn demote(&self, kind: AlertKind, severity: Severity, reason: &str) {
        if self.is_leader.swap(false, Ordering::SeqCst) {
            *self.state.lock() = ElectionState::Follower;
            warn!(instance_id = %self.config.instance_id, reason, "Demoted from leadership");
            self.fire_alert(
                LeadershipAlert::new(kind, severity, reason.to_string()).with_data(
                    serde_json::json!({ "instanceId": self.config.instance_id }),
                ),
            );
            self.fire_change(false);
        }
    }

    fn fire_change(&self, is_leader: bool) {
        let cb = self.on_change.lock().clone();
        if let Some(cb) = cb {
            cb(is_leader);
        }
    }

    fn fire_alert(&self, alert: LeadershipAlert) {
        let cb = self.on_alert.lock().clone();
        if let Some(cb) = cb {
            cb(alert);
        }
    }

    fn jittered_delay(&self) -> Duration {
        let jitter_ms = self.config.jitter_range.as_millis() as i64;
        let offset = if jitter_ms > 0 {
            rand::thread_rng().gen_range(-jitter_ms / 2..=jitter_ms / 2)
        } else {
            0
        };
        let base = self.config.heartbeat_interval.as_millis() as i64 + offset;
        Duration::from_millis(base.max(1_000) as u64)
    }
}

fn ttl_seconds(ttl: Duration) -> u64 {
    let ms = ttl.as_millis() as u64;
    ms.div_ceil(1_000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::memory::MemoryTransport;
    use crate::stream::{GroupInfo, PendingEntry, StreamEntry};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    /// Delegating transport that fails `compare_and_extend` a configured
    /// number of times.
    struct FlakyTransport {
        inner: MemoryTransport,
        fail_extends: AtomicU32,
    }

    impl FlakyTransport {
        fn new(inner: MemoryTransport, failures: u32) -> Self {
            Self {
                inner,
                fail_extends: AtomicU32::new(failures),
            }
        }
    }

    #[async_trait]
    impl crate::stream::StreamTransport for FlakyTransport {
        async fn append(
            &self,
            stream: &str,
            fields: &[(String, String)],
            maxlen: usize,
        ) -> Result<String> {
            self.inner.append(stream, fields, maxlen).await
        }
        async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
            self.inner.ensure_group(stream, group).await
        }
        async fn read_group(
            &self,
            stream: &str,
            group: &str,
            consumer: &str,
            count: usize,
            block_ms: u64,
        ) -> Result<Vec<StreamEntry>> {
            self.inner
                .read_group(stream, group, consumer, count, block_ms)
                .await
        }
        async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64> {
            self.inner.ack(stream, group, ids).await
        }
        async fn list_pending(
            &self,
            stream: &str,
            group: &str,
            count: usize,
        ) -> Result<Vec<PendingEntry>> {
            self.inner.list_pending(stream, group, count).await
        }
        async fn claim(
            &self,
            stream: &str,
            group: &str,
            consumer: &str,
            min_idle_ms: u64,
            ids: &[String],
        ) -> Result<Vec<StreamEntry>> {
            self.inner
                .claim(stream, group, consumer, min_idle_ms, ids)
                .await
        }
        async fn range(&self, stream: &str, start: &str, count: usize) -> Result<Vec<StreamEntry>> {
            self.inner.range(stream, start, count).await
        }
        async fn len(&self, stream: &str) -> Result<u64> {
            self.inner.len(stream).await
        }
        async fn groups(&self, stream: &str) -> Result<Vec<GroupInfo>> {
            self.inner.groups(stream).await
        }
        async fn set_if_absent(&self, key: &str, value: &str, ttl_sec: u64) -> Result<bool> {
            self.inner.set_if_absent(key, value, ttl_sec).await
        }
        async fn compare_and_extend(&self, key: &str, expected: &str, ttl_sec: u64) -> Result<bool> {
            let remaining = self.fail_extends.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_extends.store(remaining - 1, Ordering::SeqCst);
                anyhow::bail!("injected transport failure");
            }
            self.inner.compare_and_extend(key, expected, ttl_sec).await
        }
        async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
            self.inner.compare_and_delete(key, expected).await
        }
    }

    fn elector(transport: Arc<dyn crate::stream::StreamTransport>, id: &str) -> Arc<LeaderElector> {
        Arc::new(LeaderElector::new(
            transport,
            ElectionConfig {
                instance_id: id.to_string(),
                ..ElectionConfig::default()
            },
        ))
    }

    #[tokio::test]
    async fn test_first_instance_acquires_leadership() {
        let transport = Arc::new(MemoryTransport::new());
        let a = elector(transport.clone(), "a");
        let changes = Arc::new(AtomicU32::new(0));
        let acquired_alerts = Arc::new(AtomicU32::new(0));
        {
            let changes = changes.clone();
            a.on_leadership_change(Arc::new(move |is_leader| {
                assert!(is_leader);
                changes.fetch_add(1, Ordering::SeqCst);
            }));
            let acquired_alerts = acquired_alerts.clone();
            a.on_alert(Arc::new(move |alert| {
                if alert.kind == AlertKind::LeaderAcquired {
                    acquired_alerts.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }

        assert!(a.try_acquire().await);
        assert!(a.is_leader());
        assert_eq!(a.state(), ElectionState::Leader);
        assert_eq!(changes.load(Ordering::SeqCst), 1);
        assert_eq!(acquired_alerts.load(Ordering::SeqCst), 1);

        // Renewal keeps leadership without re-firing the callback.
        assert!(a.try_acquire().await);
        assert_eq!(changes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_instance_cannot_acquire() {
        let transport = Arc::new(MemoryTransport::new());
        let a = elector(transport.clone(), "a");
        let b = elector(transport.clone(), "b");

        assert!(a.try_acquire().await);
        assert!(!b.try_acquire().await);
        assert!(!b.is_leader());
    }

    #[tokio::test]
    async fn test_standby_gated_until_activating() {
        let transport = Arc::new(MemoryTransport::new());
        let standby = Arc::new(LeaderElector::new(
            transport.clone(),
            ElectionConfig {
                instance_id: "standby".to_string(),
                is_standby: true,
                ..ElectionConfig::default()
            },
        ));

        assert!(!standby.try_acquire().await);
        standby.set_activating(true);
        assert!(standby.try_acquire().await);
        assert!(standby.is_leader());
    }

    #[tokio::test]
    async fn test_ineligible_instance_never_acquires() {
        let transport = Arc::new(MemoryTransport::new());
        let e = Arc::new(LeaderElector::new(
            transport.clone(),
            ElectionConfig {
                instance_id: "watcher".to_string(),
                can_become_leader: false,
                ..ElectionConfig::default()
            },
        ));
        assert!(!e.try_acquire().await);
        // No lease was created, so another instance acquires cleanly.
        let other = elector(transport, "other");
        assert!(other.try_acquire().await);
    }

    #[tokio::test]
    async fn test_renewal_not_owner_demotes_immediately() {
        let transport = Arc::new(MemoryTransport::new());
        let a = elector(transport.clone(), "a");
        assert!(a.try_acquire().await);

        let lost = Arc::new(AtomicU32::new(0));
        {
            let lost = lost.clone();
            a.on_alert(Arc::new(move |alert| {
                if alert.kind == AlertKind::LeaderLost {
                    lost.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }

        // Another party takes the lease behind our back.
        assert!(transport.compare_and_delete("lock:leader", "a").await.unwrap());
        assert!(transport.set_if_absent("lock:leader", "b", 30).await.unwrap());

        a.tick().await;
        assert!(!a.is_leader());
        assert_eq!(a.state(), ElectionState::Follower);
        assert_eq!(lost.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_three_renewal_exceptions_demote_with_critical_alert() {
        let inner = MemoryTransport::new();
        let flaky = Arc::new(FlakyTransport::new(inner, 0));
        let a = elector(flaky.clone(), "a");
        assert!(a.try_acquire().await);

        let demotions = Arc::new(Mutex::new(Vec::new()));
        let changes = Arc::new(AtomicU32::new(0));
        {
            let demotions = demotions.clone();
            a.on_alert(Arc::new(move |alert| {
                if alert.kind == AlertKind::LeaderDemotion {
                    demotions.lock().push(alert.severity);
                }
            }));
            let changes = changes.clone();
            a.on_leadership_change(Arc::new(move |is_leader| {
                if !is_leader {
                    changes.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }

        flaky.fail_extends.store(3, Ordering::SeqCst);
        a.tick().await;
        a.tick().await;
        assert!(a.is_leader(), "still leader after two failures");
        a.tick().await;

        assert!(!a.is_leader());
        assert_eq!(demotions.lock().as_slice(), &[Severity::Critical]);
        assert_eq!(changes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_renewal_success_resets_failure_counter() {
        let inner = MemoryTransport::new();
        let flaky = Arc::new(FlakyTransport::new(inner, 0));
        let a = elector(flaky.clone(), "a");
        assert!(a.try_acquire().await);

        flaky.fail_extends.store(2, Ordering::SeqCst);
        a.tick().await;
        a.tick().await;
        // Clean renewal resets the counter...
        a.tick().await;
        assert!(a.is_leader());
        // ...so two more failures do not reach the demotion threshold.
        flaky.fail_extends.store(2, Ordering::SeqCst);
        a.tick().await;
        a.tick().await;
        assert!(a.is_leader());
    }

    #[tokio::test]
    async fn test_stop_releases_lease() {
        let transport = Arc::new(MemoryTransport::new());
        let a = elector(transport.clone(), "a");
        a.start();
        assert!(a.try_acquire().await);

        a.stop().await;
        assert!(!a.is_leader());
        assert_eq!(a.state(), ElectionState::Stopped);

        // Lease is gone; a successor acquires without waiting for TTL expiry.
        let b = elector(transport, "b");
        assert!(b.try_acquire().await);
    }
}
