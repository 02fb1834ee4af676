//! Composite confidence calculator.
//!
//! Composes a base spread score with an age penalty, optional ML alignment
//! adjustments, and whale-pressure adjustments, under a total-boost cap of
//! 1.5x the pre-boost value and a hard maximum. Pure and deterministic for
//! fixed inputs and a fixed clock value.

use crate::models::{PredictedDirection, PredictionResult, PriceUpdate, WhaleContext, WhaleSentiment};

/// ML predictions for the source and target chains of a candidate pair.
#[derive(Debug, Clone, Default)]
pub struct PairPrediction {
    pub source: Option<PredictionResult>,
    pub target: Option<PredictionResult>,
}

#[derive(Debug, Clone)]
pub struct ConfidenceConfig {
    pub max_confidence: f64,
    pub super_whale_threshold_usd: f64,
    pub significant_flow_threshold_usd: f64,
    pub whale_bullish_boost: f64,
    pub whale_bearish_penalty: f64,
    pub super_whale_boost: f64,
    pub ml_enabled: bool,
    pub ml_min_confidence: f64,
    pub ml_aligned_boost: f64,
    pub ml_opposed_penalty: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            max_confidence: 0.95,
            super_whale_threshold_usd: 500_000.0,
            significant_flow_threshold_usd: 100_000.0,
            whale_bullish_boost: 1.15,
            whale_bearish_penalty: 0.85,
            super_whale_boost: 1.25,
            ml_enabled: false,
            ml_min_confidence: 0.6,
            ml_aligned_boost: 1.15,
            ml_opposed_penalty: 0.9,
        }
    }
}

/// Cap on the combined ML + whale multiplier relative to the pre-boost value.
const TOTAL_BOOST_CAP: f64 = 1.5;
/// Multiplier applied when a significant net flow is present.
const SIGNIFICANT_FLOW_BOOST: f64 = 1.1;
/// Target-side boost when the source side already boosted.
const SECONDARY_ALIGNED_BOOST: f64 = 1.05;
/// Age decay per minute and its floor.
const AGE_DECAY_PER_MINUTE: f64 = 0.1;
const AGE_FLOOR: f64 = 0.1;

pub struct ConfidenceCalculator {
    config: ConfidenceConfig,
}

impl ConfidenceCalculator {
    pub fn new(config: ConfidenceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConfidenceConfig {
        &self.config
    }

    /// Score a buy-low/sell-high candidate in `[0, max_confidence]`.
    pub fn calculate(
        &self,
        low: &PriceUpdate,
        high: &PriceUpdate,
        whale: Option<&WhaleContext>,
        ml: Option<&PairPrediction>,
        now_ms: i64,
    ) -> f64 {
        if !low.price.is_finite()
            || !high.price.is_finite()
            || low.price <= 0.0
            || high.price <= 0.0
        {
            return 0.0;
        }

        let spread = (high.price / low.price - 1.0).min(0.5);
        let base = (spread * 2.0).clamp(0.0, 1.0);

        let age_minutes = ((now_ms - low.timestamp) as f64 / 60_000.0).max(0.0);
        let age_factor = (1.0 - age_minutes * AGE_DECAY_PER_MINUTE).max(AGE_FLOOR);
        let pre_boost = base * age_factor;

        let mut confidence = pre_boost;

        if self.config.ml_enabled {
            if let Some(ml) = ml {
                confidence = self.apply_ml(confidence, ml);
            }
        }
        if let Some(whale) = whale {
            confidence = self.apply_whale(confidence, whale);
        }

        // Adjustments never multiply the pre-boost score beyond the cap.
        if pre_boost > 0.0 && confidence / pre_boost > TOTAL_BOOST_CAP {
            confidence = pre_boost * TOTAL_BOOST_CAP;
        }

        confidence.clamp(0.0, self.config.max_confidence)
    }

    fn apply_ml(&self, mut confidence: f64, ml: &PairPrediction) -> f64 {
        let mut source_boosted = false;
        if let Some(source) = &ml.source {
            if source.confidence >= self.config.ml_min_confidence {
                match source.direction {
                    PredictedDirection::Up => {
                        confidence *= self.config.ml_aligned_boost;
                        source_boosted = true;
                    }
                    PredictedDirection::Down => confidence *= self.config.ml_opposed_penalty,
                    PredictedDirection::Sideways => {}
                }
            }
        }
        if let Some(target) = &ml.target {
            if target.confidence >= self.config.ml_min_confidence {
                match target.direction {
                    PredictedDirection::Up | PredictedDirection::Sideways => {
                        confidence *= if source_boosted {
                            SECONDARY_ALIGNED_BOOST
                        } else {
                            self.config.ml_aligned_boost
                        };
                    }
                    PredictedDirection::Down => confidence *= self.config.ml_opposed_penalty,
                }
            }
        }
        confidence
    }

    fn apply_whale(&self, mut confidence: f64, whale: &WhaleContext) -> f64 {
        match whale.sentiment {
            WhaleSentiment::Bullish => confidence *= self.config.whale_bullish_boost,
            WhaleSentiment::Bearish => confidence *= self.config.whale_bearish_penalty,
            WhaleSentiment::Neutral => {}
        }
        if whale.super_whale_count > 0 {
            confidence *= self.config.super_whale_boost;
        }
        if whale.net_flow_usd.abs() > self.config.significant_flow_threshold_usd {
            confidence *= SIGNIFICANT_FLOW_BOOST;
        }
        confidence
    }
}
