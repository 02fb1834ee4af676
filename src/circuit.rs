//! Process-wide circuit breaker.
//!
//! When open, the detector stops publishing opportunities. Toggled manually
//! through the authenticated HTTP endpoints; state changes are also
//! published on `stream:circuit-breaker` by the caller.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Default)]
pub struct CircuitBreaker {
    open: AtomicBool,
    detail: Mutex<Option<BreakerDetail>>,
}

#[derive(Debug, Clone, Serialize)]
struct BreakerDetail {
    reason: String,
    opened_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub open: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<i64>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Returns false when the breaker was already open.
    pub fn open(&self, reason: impl Into<String>) -> bool {
        if self.open.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.detail.lock() = Some(BreakerDetail {
            reason: reason.into(),
            opened_at: Utc::now().timestamp_millis(),
        });
        true
    }

    /// Returns false when the breaker was already closed.
    pub fn close(&self) -> bool {
        if !self.open.swap(false, Ordering::SeqCst) {
            return false;
        }
        *self.detail.lock() = None;
        true
    }

    pub fn status(&self) -> BreakerStatus {
        let detail = self.detail.lock().clone();
        BreakerStatus {
            open: self.is_open(),
            reason: detail.as_ref().map(|d| d.reason.clone()),
            opened_at: detail.as_ref().map(|d| d.opened_at),
        }
    }
}
