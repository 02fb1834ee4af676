//! Wire payloads shared across the platform.
//!
//! Every record that crosses the stream transport lives here. Payloads are
//! JSON with camelCase keys so chain workers in any language can produce
//! them; extra fields are tolerated on ingest.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Normalized price update produced by a chain worker for one (chain, DEX, pair).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceUpdate {
    pub chain: String,
    pub dex: String,
    pub pair_key: String,
    pub price: f64,
    #[serde(default)]
    pub reserve0: f64,
    #[serde(default)]
    pub reserve1: f64,
    #[serde(default)]
    pub block_number: u64,
    /// Milliseconds since epoch, worker clock.
    pub timestamp: i64,
    /// Worker-observed ingest latency in milliseconds.
    #[serde(default)]
    pub latency: f64,
}

/// Large on-chain transfer observed by a chain worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhaleTransaction {
    pub transaction_hash: String,
    pub address: String,
    /// Tolerant formats: `A/B`, `A_B`, `DEX_A_B`, or a bare symbol.
    pub token: String,
    #[serde(default)]
    pub amount: f64,
    pub usd_value: f64,
    /// `buy` or `sell`; anything else is treated as neutral.
    #[serde(default)]
    pub direction: String,
    #[serde(default)]
    pub dex: String,
    pub chain: String,
    pub timestamp: i64,
    #[serde(default)]
    pub impact: f64,
}

/// Whale pressure summary attached to opportunities detected on the fast path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhaleContext {
    pub token: String,
    pub net_flow_usd: f64,
    pub super_whale_count: u32,
    pub sentiment: WhaleSentiment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhaleSentiment {
    Bullish,
    Bearish,
    Neutral,
}

/// Cross-chain arbitrage opportunity emitted by the detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    pub id: String,
    #[serde(rename = "type")]
    pub opportunity_type: String,
    pub source_chain: String,
    pub target_chain: String,
    pub token_pair: String,
    pub buy_price: f64,
    pub sell_price: f64,
    pub expected_profit: f64,
    pub profit_percentage: f64,
    pub confidence: f64,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ml_supported: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub whale_context: Option<WhaleContext>,
}

/// Entry on the dead-letter stream. Replay requires `original_payload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqEntry {
    pub original_message_id: String,
    pub original_stream: String,
    #[serde(default)]
    pub opportunity_id: String,
    #[serde(default)]
    pub opportunity_type: String,
    /// Human-readable error, prefixed with a `[CODE]` bracket tag.
    pub error: String,
    pub timestamp: i64,
    pub service: String,
    pub instance_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_payload: Option<String>,
}

/// Bracket codes surfaced on DLQ entries so the supervisor can tally by class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DlqCode {
    ValMissingId,
    ValBadShape,
    ErrNoChain,
    ErrHandlerFatal,
    Unknown,
}

impl DlqCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DlqCode::ValMissingId => "VAL_MISSING_ID",
            DlqCode::ValBadShape => "VAL_BAD_SHAPE",
            DlqCode::ErrNoChain => "ERR_NO_CHAIN",
            DlqCode::ErrHandlerFatal => "ERR_HANDLER_FATAL",
            DlqCode::Unknown => "UNKNOWN",
        }
    }

    /// Format an error message with its bracket tag, e.g. `[VAL_BAD_SHAPE] ...`.
    pub fn tag(&self, message: &str) -> String {
        format!("[{}] {}", self.as_str(), message)
    }
}

/// Leadership lifecycle alert published on `stream:system-failover`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadershipAlert {
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: i64,
}

impl LeadershipAlert {
    pub fn new(kind: AlertKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            data: serde_json::Value::Null,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    LeaderAcquired,
    LeaderLost,
    LeaderDemotion,
    LeaderHeartbeatFailure,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::LeaderAcquired => "LEADER_ACQUIRED",
            AlertKind::LeaderLost => "LEADER_LOST",
            AlertKind::LeaderDemotion => "LEADER_DEMOTION",
            AlertKind::LeaderHeartbeatFailure => "LEADER_HEARTBEAT_FAILURE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Direction component of an ML price prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictedDirection {
    Up,
    Down,
    Sideways,
}

/// Prediction consumed (never produced) by the detector core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionResult {
    pub direction: PredictedDirection,
    pub confidence: f64,
    #[serde(default)]
    pub predicted_price: f64,
}

/// Normalize a token symbol: trim, uppercase, unwrap common wrapped forms so
/// the same asset matches across chains.
pub fn normalize_token(symbol: &str) -> String {
    let upper = symbol.trim().to_uppercase();
    match upper.as_str() {
        "WETH" => "ETH".to_string(),
        "WBTC" => "BTC".to_string(),
        "WMATIC" => "MATIC".to_string(),
        "WBNB" => "BNB".to_string(),
        "WAVAX" => "AVAX".to_string(),
        _ => upper,
    }
}

/// Canonical pair key `BASE/QUOTE` built from normalized symbols. Base/quote
/// order is preserved: price direction depends on it.
pub fn normalize_pair_key(base: &str, quote: &str) -> String {
    format!("{}/{}", normalize_token(base), normalize_token(quote))
}
