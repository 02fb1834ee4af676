//! ML prediction companion.
//!
//! The detector consumes predictions from an external model behind the
//! [`PricePredictor`] trait. Every call races a latency budget, and a
//! single-flight map keyed by (chain, pair) makes concurrent detection
//! cycles share one in-flight request. A timed-out or failed prediction is
//! "no signal" (`None`), never an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::debug;

use crate::models::PredictionResult;

#[async_trait]
pub trait PricePredictor: Send + Sync {
    async fn predict(&self, chain: &str, pair_key: &str) -> Result<PredictionResult>;
}

type InflightPrediction = Shared<BoxFuture<'static, Option<PredictionResult>>>;

/// Timeout-raced, single-flight prediction gateway.
pub struct PredictionManager {
    predictor: Arc<dyn PricePredictor>,
    max_latency: Duration,
    inflight: Mutex<HashMap<(String, String), InflightPrediction>>,
}

impl PredictionManager {
    pub fn new(predictor: Arc<dyn PricePredictor>, max_latency: Duration) -> Self {
        Self {
            predictor,
            max_latency,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch a prediction for (chain, pair), sharing any in-flight request
    /// for the same key. The in-flight entry is removed when the request
    /// settles, on every path.
    pub async fn predict(
        self: &Arc<Self>,
        chain: &str,
        pair_key: &str,
    ) -> Option<PredictionResult> {
        let key = (chain.to_string(), pair_key.to_string());
        let fut = {
            let mut inflight = self.inflight.lock();
            if let Some(existing) = inflight.get(&key) {
                existing.clone()
            } else {
                let this = self.clone();
                let fut_key = key.clone();
                let fut = async move {
                    let result = tokio::time::timeout(
                        this.max_latency,
                        this.predictor.predict(&fut_key.0, &fut_key.1),
                    )
                    .await;
                    // The losing timer is dropped with the race; nothing
                    // accumulates under load.
                    let out = match result {
                        Ok(Ok(prediction)) => Some(prediction),
                        Ok(Err(e)) => {
                            debug!(chain = %fut_key.0, pair = %fut_key.1, error = %e, "Prediction failed");
                            None
                        }
                        Err(_) => {
                            debug!(chain = %fut_key.0, pair = %fut_key.1, "Prediction timed out");
                            None
                        }
                    };
                    this.inflight.lock().remove(&fut_key);
                    out
                }
                .boxed()
                .shared();
                inflight.insert(key.clone(), fut.clone());
                fut
            }
        };
        fut.await
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().len()
    }
}
