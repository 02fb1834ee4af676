//! Standby activation manager.
//!
//! Promotes a standby instance to active leader on a failover signal. The
//! activation attempt is coalesced: concurrent callers share the outcome of
//! the single in-flight attempt, and the underlying lock acquisition runs
//! exactly once per attempt. The activating flags are reset on every exit
//! path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::election::LeaderElector;

pub type ActivationHook = Arc<dyn Fn() + Send + Sync>;

type InflightActivation = Shared<BoxFuture<'static, bool>>;

/// Mutex-coordinated standby promotion.
pub struct StandbyActivationManager {
    elector: Arc<LeaderElector>,
    activating: AtomicBool,
    inflight: Mutex<Option<InflightActivation>>,
    /// Invoked on successful activation, before the standby flag clears on
    /// the elector (used upstream to clear the deployment's standby marker).
    on_activation_success: SyncMutex<Option<ActivationHook>>,
}

impl StandbyActivationManager {
    pub fn new(elector: Arc<LeaderElector>) -> Self {
        Self {
            elector,
            activating: AtomicBool::new(false),
            inflight: Mutex::new(None),
            on_activation_success: SyncMutex::new(None),
        }
    }

    pub fn on_activation_success(&self, hook: ActivationHook) {
        *self.on_activation_success.lock() = Some(hook);
    }

    pub fn get_is_activating(&self) -> bool {
        self.activating.load(Ordering::SeqCst)
    }

    /// Attempt to promote this standby to active leader.
    ///
    /// Callers that arrive while an attempt is in flight await the same
    /// outcome; the slot clears when the attempt completes, so later calls
    /// start a fresh attempt.
    pub async fn activate_standby(self: &Arc<Self>) -> bool {
        if self.elector.is_leader() {
            info!("Standby activation requested but already leader");
            return true;
        }
        if !self.elector.is_standby() {
            debug!("Standby activation requested on a non-standby instance");
            return false;
        }
        if !self.elector.can_become_leader() {
            warn!("Standby activation requested but instance is ineligible for leadership");
            return false;
        }

        let attempt = {
            let mut slot = self.inflight.lock().await;
            match slot.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let this = self.clone();
                    let fut = async move { this.run_activation().await }.boxed().shared();
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };
        attempt.await
    }

    /// The single in-flight attempt. Flags are set manager-first then
    /// elector, and reset elector-first then manager on every exit path;
    /// the coalescing slot clears last.
    async fn run_activation(self: Arc<Self>) -> bool {
        self.activating.store(true, Ordering::SeqCst);
        self.elector.set_activating(true);

        // `try_acquire` absorbs transport errors into `false`, so the resets
        // below run on every path.
        let acquired = self.elector.try_acquire().await;

        if acquired {
            info!(
                instance_id = %self.elector.instance_id(),
                "Standby activated to leader"
            );
            let hook = self.on_activation_success.lock().clone();
            if let Some(hook) = hook {
                hook();
            }
            self.elector.set_standby(false);
        } else {
            warn!(
                instance_id = %self.elector.instance_id(),
                "Standby activation failed to acquire leadership"
            );
        }

        self.elector.set_activating(false);
        self.activating.store(false, Ordering::SeqCst);
        self.inflight.lock().await.take();
        acquired
    }
}
