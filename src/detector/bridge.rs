//! Bridge latency model.
//!
//! Keeps a rolling per-route history of observed bridge transfers and
//! predicts latency/cost for candidate routes. Sparse routes fall back to a
//! static conservative table. Every numeric output is finite; a route with
//! only failures reports zeroed metrics, never NaN or infinities.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use lazy_static::lazy_static;
use serde::Serialize;

use crate::util::ring::RingBuffer;

/// Ring capacity; once full the oldest batch is trimmed in one step so the
/// per-write cost stays O(1).
const HISTORY_CAPACITY: usize = 1_100;
const HISTORY_TRIM_TO: usize = 1_000;

/// Observations below this count use the conservative static estimate.
const MIN_SAMPLES_FOR_MODEL: usize = 10;
/// Sample count at which model confidence saturates.
const FULL_CONFIDENCE_SAMPLES: f64 = 50.0;
/// Ceiling on conservative-estimate confidence.
const CONSERVATIVE_MAX_CONFIDENCE: f64 = 0.3;

/// Fallback latency when a route has no static entry, in seconds.
const FALLBACK_LATENCY_SECS: f64 = 300.0;
/// Cost estimate for unseen routes: 10 bps of the transfer amount.
const FALLBACK_COST_RATE: f64 = 0.001;

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 3600);

lazy_static! {
    /// Static route table for conservative estimates, seconds.
    static ref CONSERVATIVE_ROUTES: HashMap<&'static str, f64> = {
        let mut m = HashMap::new();
        m.insert("ethereum-arbitrum-stargate", 180.0);
        m.insert("arbitrum-ethereum-stargate", 180.0);
        m.insert("ethereum-optimism-across", 120.0);
        m.insert("optimism-ethereum-across", 120.0);
        m
    };
}

/// Canonical `<source>-<target>-<bridge>` key.
pub fn bridge_key(source: &str, target: &str, bridge: &str) -> String {
    format!(
        "{}-{}-{}",
        source.to_lowercase(),
        target.to_lowercase(),
        bridge.to_lowercase()
    )
}

/// One completed (or failed) bridge transfer.
#[derive(Debug, Clone)]
pub struct BridgeOutcome {
    pub source_chain: String,
    pub target_chain: String,
    pub bridge: String,
    /// Observed latency in seconds; meaningless when `success` is false.
    pub latency: f64,
    pub cost: f64,
    pub success: bool,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
struct BridgeSample {
    latency: f64,
    cost: f64,
    success: bool,
    timestamp: i64,
}

/// Derived metrics over one route's history. All values finite.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeMetrics {
    pub sample_count: usize,
    pub success_rate: f64,
    pub avg_latency: f64,
    pub min_latency: f64,
    pub max_latency: f64,
    pub avg_cost: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Low,
    Medium,
    High,
}

impl Urgency {
    /// (latency weight, cost weight) for route scoring.
    fn weights(&self) -> (f64, f64) {
        match self {
            Urgency::Low => (0.3, 0.7),
            Urgency::Medium => (0.5, 0.5),
            Urgency::High => (0.8, 0.2),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgePrediction {
    pub bridge_key: String,
    pub estimated_latency_secs: f64,
    pub estimated_cost_usd: f64,
    pub confidence: f64,
    /// True when the estimate came from the static table rather than the
    /// learned model.
    pub conservative: bool,
}

/// Rolling per-route model.
pub struct BridgeLatencyModel {
    routes: HashMap<String, RingBuffer<BridgeSample>>,
}

impl Default for BridgeLatencyModel {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeLatencyModel {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    /// Record one transfer outcome, batch-trimming the route history once
    /// the ring fills.
    pub fn update_model(&mut self, outcome: &BridgeOutcome) {
        let key = bridge_key(&outcome.source_chain, &outcome.target_chain, &outcome.bridge);
        let ring = self
            .routes
            .entry(key)
            .or_insert_with(|| RingBuffer::with_capacity(HISTORY_CAPACITY));
        ring.push(BridgeSample {
            latency: outcome.latency,
            cost: outcome.cost,
            success: outcome.success,
            timestamp: outcome.timestamp,
        });
        if ring.len() >= HISTORY_CAPACITY {
            ring.drop_oldest(ring.len() - HISTORY_TRIM_TO);
        }
    }

    pub fn get_bridge_metrics(&self, key: &str) -> Option<BridgeMetrics> {
        let ring = self.routes.get(key)?;
        Some(compute_metrics(&ring.ordered()))
    }

    /// Predict latency for one route. Sparse histories use the conservative
    /// static table with capped confidence.
    pub fn predict_latency(&self, key: &str) -> BridgePrediction {
        let samples = self
            .routes
            .get(key)
            .map(|r| r.ordered())
            .unwrap_or_default();
        let metrics = compute_metrics(&samples);

        if metrics.sample_count < MIN_SAMPLES_FOR_MODEL {
            let latency = CONSERVATIVE_ROUTES
                .get(key)
                .copied()
                .unwrap_or(FALLBACK_LATENCY_SECS);
            let confidence = (metrics.sample_count as f64 / MIN_SAMPLES_FOR_MODEL as f64
                * CONSERVATIVE_MAX_CONFIDENCE)
                .max(0.1)
                .min(CONSERVATIVE_MAX_CONFIDENCE);
            return BridgePrediction {
                bridge_key: key.to_string(),
                estimated_latency_secs: latency,
                estimated_cost_usd: metrics.avg_cost,
                confidence,
                conservative: true,
            };
        }

        let successes: Vec<f64> = samples
            .iter()
            .filter(|s| s.success)
            .map(|s| s.latency)
            .collect();
        let avg = metrics.avg_latency;
        let variance = if successes.len() > 1 && avg > 0.0 {
            successes.iter().map(|l| (l - avg).powi(2)).sum::<f64>() / successes.len() as f64
        } else {
            0.0
        };
        let dispersion = if avg > 0.0 {
            (1.0 - variance / (avg * avg)).max(0.1)
        } else {
            0.1
        };
        let confidence =
            (metrics.sample_count as f64 / FULL_CONFIDENCE_SAMPLES).min(1.0) * dispersion;

        BridgePrediction {
            bridge_key: key.to_string(),
            estimated_latency_secs: avg,
            estimated_cost_usd: metrics.avg_cost,
            confidence: sanitize(confidence),
            conservative: false,
        }
    }

    /// Known bridge keys for a route, learned plus static.
    pub fn get_available_routes(&self, source: &str, target: &str) -> Vec<String> {
        let prefix = format!("{}-{}-", source.to_lowercase(), target.to_lowercase());
        let mut keys: Vec<String> = self
            .routes
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in CONSERVATIVE_ROUTES.keys() {
            if key.starts_with(&prefix) && !keys.iter().any(|k| k == key) {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        keys
    }

    /// Pick the best bridge for a route under an urgency weighting, or
    /// `None` when no route is known at all.
    pub fn predict_optimal_bridge(
        &self,
        source: &str,
        target: &str,
        amount_usd: f64,
        urgency: Urgency,
    ) -> Option<BridgePrediction> {
        let routes = self.get_available_routes(source, target);
        if routes.is_empty() {
            return None;
        }

        let mut predictions: Vec<BridgePrediction> = routes
            .iter()
            .map(|key| {
                let mut p = self.predict_latency(key);
                if p.estimated_cost_usd <= 0.0 {
                    p.estimated_cost_usd = (amount_usd * FALLBACK_COST_RATE).max(1.0);
                }
                p
            })
            .collect();

        let max_latency = predictions
            .iter()
            .map(|p| p.estimated_latency_secs)
            .fold(0.0_f64, f64::max)
            .max(f64::EPSILON);
        let max_cost = predictions
            .iter()
            .map(|p| p.estimated_cost_usd)
            .fold(0.0_f64, f64::max)
            .max(f64::EPSILON);

        let (latency_weight, cost_weight) = urgency.weights();
        predictions.sort_by(|a, b| {
            let score = |p: &BridgePrediction| {
                latency_weight * (p.estimated_latency_secs / max_latency)
                    + cost_weight * (p.estimated_cost_usd / max_cost)
            };
            score(a)
                .partial_cmp(&score(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        predictions.into_iter().next()
    }

    /// Drop samples older than the retention window and forget empty routes.
    pub fn cleanup(&mut self, retention: Duration) {
        let cutoff = Utc::now().timestamp_millis() - retention.as_millis() as i64;
        for ring in self.routes.values_mut() {
            ring.retain(|s| s.timestamp >= cutoff);
        }
        self.routes.retain(|_, ring| !ring.is_empty());
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

fn compute_metrics(samples: &[BridgeSample]) -> BridgeMetrics {
    let total = samples.len();
    let successes: Vec<&BridgeSample> = samples.iter().filter(|s| s.success).collect();

    if successes.is_empty() {
        return BridgeMetrics {
            sample_count: total,
            success_rate: 0.0,
            avg_latency: 0.0,
            min_latency: 0.0,
            max_latency: 0.0,
            avg_cost: 0.0,
        };
    }

    let n = successes.len() as f64;
    let avg_latency = successes.iter().map(|s| s.latency).sum::<f64>() / n;
    let min_latency = successes.iter().map(|s| s.latency).fold(f64::MAX, f64::min);
    let max_latency = successes.iter().map(|s| s.latency).fold(f64::MIN, f64::max);
    let avg_cost = successes.iter().map(|s| s.cost).sum::<f64>() / n;

    BridgeMetrics {
        sample_count: total,
        success_rate: n / total as f64,
        avg_latency: sanitize(avg_latency),
        min_latency: sanitize(min_latency),
        max_latency: sanitize(max_latency),
        avg_cost: sanitize(avg_cost),
    }
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}
