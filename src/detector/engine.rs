//! Cross-chain detection core.
//!
//! Consumes price updates and whale alerts, maintains the snapshot index,
//! and publishes arbitrage opportunities. The hot path rebuilds the indexed
//! snapshot (throttled by a dirty flag) and scans every pair priced on two
//! or more chains. Whale alerts take a rate-limited fast path restricted to
//! pairs containing the whale's token.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::circuit::CircuitBreaker;
use crate::detector::bridge::{BridgeLatencyModel, BridgeOutcome, Urgency, DEFAULT_RETENTION};
use crate::detector::confidence::{ConfidenceCalculator, ConfidenceConfig, PairPrediction};
use crate::detector::prediction::PredictionManager;
use crate::detector::snapshot::{IndexedSnapshot, PriceSnapshotIndex, SnapshotConfig};
use crate::models::{
    normalize_token, DlqCode, Opportunity, PriceUpdate, WhaleContext, WhaleSentiment,
    WhaleTransaction,
};
use crate::stream::consumer::{HandlerError, StreamHandler};
use crate::stream::{names, StreamEntry, StreamTransport, DEFAULT_MAXLEN};

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Opportunities below this confidence are dropped.
    pub confidence_threshold: f64,
    /// Notional used for profit estimation.
    pub trade_amount_usd: f64,
    /// Bridge cost assumed when no route model exists.
    pub default_bridge_cost_usd: f64,
    /// Rolling window for whale pressure summaries.
    pub whale_window: Duration,
    /// Minimum spacing between whale-triggered detection passes.
    pub whale_guard_cooldown: Duration,
    pub maxlen: usize,
    pub opportunity_type: String,
    pub confidence: ConfidenceConfig,
    pub snapshot: SnapshotConfig,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.1,
            trade_amount_usd: 10_000.0,
            default_bridge_cost_usd: 10.0,
            whale_window: Duration::from_secs(300),
            whale_guard_cooldown: Duration::from_secs(10),
            maxlen: DEFAULT_MAXLEN,
            opportunity_type: "cross_chain_arbitrage".to_string(),
            confidence: ConfidenceConfig::default(),
            snapshot: SnapshotConfig::default(),
        }
    }
}

impl DetectorConfig {
    /// Chain-specific minimum spread: Ethereum mainnet pays mainnet gas, so
    /// it needs a wider edge than the L2s and sidechains.
    pub fn min_spread_for(&self, chain: &str) -> f64 {
        match chain.to_lowercase().as_str() {
            "ethereum" | "eth" | "mainnet" => 0.005,
            _ => 0.002,
        }
    }

    /// Rough per-swap gas cost in USD by chain.
    pub fn gas_cost_for(&self, chain: &str) -> f64 {
        match chain.to_lowercase().as_str() {
            "ethereum" | "eth" | "mainnet" => 15.0,
            "polygon" => 0.1,
            "bsc" => 0.3,
            "arbitrum" | "optimism" | "base" => 0.5,
            _ => 1.0,
        }
    }
}

/// Default quote token assumed when a whale alert carries an empty or
/// unparseable token field.
fn default_quote_token(chain: &str) -> &'static str {
    match chain.to_lowercase().as_str() {
        "polygon" => "MATIC",
        "bsc" => "BNB",
        "avalanche" => "AVAX",
        _ => "ETH",
    }
}

/// Tolerant whale-token parsing: `A/B`, `A_B`, `DEX_A_B`, or a bare symbol.
/// Empty or malformed input falls back to the chain's default quote token.
pub fn parse_whale_token(raw: &str, chain: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        warn!(chain, "Whale alert with empty token; using chain default");
        return default_quote_token(chain).to_string();
    }
    let candidate = if trimmed.contains('/') {
        trimmed.split('/').next().unwrap_or_default()
    } else if trimmed.contains('_') {
        let parts: Vec<&str> = trimmed.split('_').filter(|p| !p.is_empty()).collect();
        match parts.len() {
            0 | 1 => parts.first().copied().unwrap_or_default(),
            2 => parts[0],
            // DEX-prefixed pair: the token is the middle part.
            _ => parts[1],
        }
    } else {
        trimmed
    };
    let token = normalize_token(candidate);
    if token.is_empty() {
        warn!(chain, raw, "Whale alert token unparseable; using chain default");
        return default_quote_token(chain).to_string();
    }
    token
}

/// Single-permit guard with a cooldown between whale-triggered passes.
pub struct WhaleGuard {
    cooldown: Duration,
    last: Mutex<Option<Instant>>,
}

impl WhaleGuard {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last: Mutex::new(None),
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut last = self.last.lock();
        match *last {
            Some(at) if at.elapsed() < self.cooldown => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

#[derive(Debug, Clone)]
struct WhaleEvent {
    timestamp: i64,
    signed_flow_usd: f64,
    is_super: bool,
}

#[derive(Debug, Default)]
pub struct DetectorStats {
    pub updates_processed: AtomicU64,
    pub swap_events: AtomicU64,
    pub detection_passes: AtomicU64,
    pub opportunities_published: AtomicU64,
    pub whale_events: AtomicU64,
    pub whale_guard_rejections: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectorStatsSnapshot {
    pub updates_processed: u64,
    pub swap_events: u64,
    pub detection_passes: u64,
    pub opportunities_published: u64,
    pub whale_events: u64,
    pub whale_guard_rejections: u64,
}

impl DetectorStats {
    pub fn snapshot(&self) -> DetectorStatsSnapshot {
        DetectorStatsSnapshot {
            updates_processed: self.updates_processed.load(Ordering::Relaxed),
            swap_events: self.swap_events.load(Ordering::Relaxed),
            detection_passes: self.detection_passes.load(Ordering::Relaxed),
            opportunities_published: self.opportunities_published.load(Ordering::Relaxed),
            whale_events: self.whale_events.load(Ordering::Relaxed),
            whale_guard_rejections: self.whale_guard_rejections.load(Ordering::Relaxed),
        }
    }
}

pub struct CrossChainDetector {
    transport: Arc<dyn StreamTransport>,
    config: DetectorConfig,
    confidence: ConfidenceCalculator,
    index: RwLock<PriceSnapshotIndex>,
    bridges: RwLock<BridgeLatencyModel>,
    predictions: Option<Arc<PredictionManager>>,
    breaker: Arc<CircuitBreaker>,
    whale_windows: RwLock<HashMap<String, VecDeque<WhaleEvent>>>,
    whale_guard: WhaleGuard,
    dirty: AtomicBool,
    stats: Arc<DetectorStats>,
}

impl CrossChainDetector {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        config: DetectorConfig,
        breaker: Arc<CircuitBreaker>,
        predictions: Option<Arc<PredictionManager>>,
    ) -> Self {
        Self {
            transport,
            confidence: ConfidenceCalculator::new(config.confidence.clone()),
            index: RwLock::new(PriceSnapshotIndex::new(config.snapshot.clone())),
            bridges: RwLock::new(BridgeLatencyModel::new()),
            predictions,
            breaker,
            whale_windows: RwLock::new(HashMap::new()),
            whale_guard: WhaleGuard::new(config.whale_guard_cooldown),
            dirty: AtomicBool::new(false),
            stats: Arc::new(DetectorStats::default()),
            config,
        }
    }

    pub fn stats(&self) -> Arc<DetectorStats> {
        self.stats.clone()
    }

    /// Hot path: fold the update into the index and run a detection pass.
    pub async fn handle_price_update(&self, update: &PriceUpdate) -> Result<usize> {
        self.stats.updates_processed.fetch_add(1, Ordering::Relaxed);
        self.index.write().handle_update(update);
        self.dirty.store(true, Ordering::SeqCst);
        self.run_detection(None).await
    }

    /// Whale fast path: record pressure, then (rate-limited) run a targeted
    /// pass over pairs containing the whale's token.
    pub async fn handle_whale_alert(&self, tx: &WhaleTransaction) -> Result<usize> {
        self.stats.whale_events.fetch_add(1, Ordering::Relaxed);
        let token = parse_whale_token(&tx.token, &tx.chain);
        self.record_whale_event(&token, tx);

        if !self.whale_guard.try_acquire() {
            self.stats
                .whale_guard_rejections
                .fetch_add(1, Ordering::Relaxed);
            debug!(token = %token, "Whale pass suppressed by guard cooldown");
            return Ok(0);
        }

        let net_flow = self
            .whale_summary(&token)
            .map(|w| w.net_flow_usd)
            .unwrap_or(0.0);
        let Some(label) = self.whale_significance(tx.usd_value, net_flow) else {
            return Ok(0);
        };
        info!(
            token = %token,
            usd_value = tx.usd_value,
            net_flow_usd = net_flow,
            chain = %tx.chain,
            "{} detected; running targeted detection",
            label
        );
        self.run_detection(Some(&token)).await
    }

    /// "Super whale" strictly by transaction size; "Significant whale
    /// activity" by aggregate net flow.
    fn whale_significance(&self, usd_value: f64, net_flow_usd: f64) -> Option<&'static str> {
        let cfg = &self.config.confidence;
        if usd_value >= cfg.super_whale_threshold_usd {
            Some("Super whale")
        } else if net_flow_usd.abs() > cfg.significant_flow_threshold_usd {
            Some("Significant whale activity")
        } else {
            None
        }
    }

    fn record_whale_event(&self, token: &str, tx: &WhaleTransaction) {
        let signed = match tx.direction.to_lowercase().as_str() {
            "sell" => -tx.usd_value,
            _ => tx.usd_value,
        };
        let event = WhaleEvent {
            timestamp: tx.timestamp,
            signed_flow_usd: signed,
            is_super: tx.usd_value >= self.config.confidence.super_whale_threshold_usd,
        };
        let cutoff = Utc::now().timestamp_millis() - self.config.whale_window.as_millis() as i64;
        let mut windows = self.whale_windows.write();
        let window = windows.entry(token.to_string()).or_default();
        window.push_back(event);
        while window
            .front()
            .map(|e| e.timestamp < cutoff)
            .unwrap_or(false)
        {
            window.pop_front();
        }
        // Tokens come off the wire, so a drained window must not leave its
        // key behind: arbitrary producer-chosen symbols would otherwise grow
        // the map without bound.
        if window.is_empty() {
            windows.remove(token);
        }
    }

    /// Aggregate whale pressure for a token over the rolling window.
    pub fn whale_summary(&self, token: &str) -> Option<WhaleContext> {
        let cutoff = Utc::now().timestamp_millis() - self.config.whale_window.as_millis() as i64;
        let windows = self.whale_windows.read();
        let window = windows.get(token)?;
        let live: Vec<&WhaleEvent> = window.iter().filter(|e| e.timestamp >= cutoff).collect();
        if live.is_empty() {
            return None;
        }
        let net_flow_usd: f64 = live.iter().map(|e| e.signed_flow_usd).sum();
        let super_whale_count = live.iter().filter(|e| e.is_super).count() as u32;
        let sentiment = if net_flow_usd > 0.0 {
            WhaleSentiment::Bullish
        } else if net_flow_usd < 0.0 {
            WhaleSentiment::Bearish
        } else {
            WhaleSentiment::Neutral
        };
        Some(WhaleContext {
            token: token.to_string(),
            net_flow_usd,
            super_whale_count,
            sentiment,
        })
    }

    /// Fold an observed bridge transfer into the latency model.
    pub fn record_bridge_outcome(&self, outcome: &BridgeOutcome) {
        self.bridges.write().update_model(outcome);
    }

    /// Periodic housekeeping: snapshot TTL eviction, bridge retention, and
    /// whale-window expiry. Tokens whose window has fully aged out are
    /// dropped from the map so one-off symbols do not accumulate.
    pub fn cleanup(&self) {
        self.index.write().cleanup();
        self.bridges.write().cleanup(DEFAULT_RETENTION);

        let cutoff = Utc::now().timestamp_millis() - self.config.whale_window.as_millis() as i64;
        let mut windows = self.whale_windows.write();
        for window in windows.values_mut() {
            while window
                .front()
                .map(|e| e.timestamp < cutoff)
                .unwrap_or(false)
            {
                window.pop_front();
            }
        }
        windows.retain(|_, window| !window.is_empty());
    }

    /// One detection pass. Without a token filter the pass is skipped unless
    /// new updates arrived since the last build; a filtered (whale) pass
    /// always runs. Returns the number of published opportunities.
    pub async fn run_detection(&self, token_filter: Option<&str>) -> Result<usize> {
        if token_filter.is_none() && !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(0);
        }
        let snapshot = self.index.read().build_snapshot();
        self.stats.detection_passes.fetch_add(1, Ordering::Relaxed);

        let now_ms = Utc::now().timestamp_millis();
        let mut published = 0;
        for pair in &snapshot.pairs {
            if let Some(token) = token_filter {
                if !IndexedSnapshot::pair_contains_token(pair, token) {
                    continue;
                }
            }
            let Some(points) = snapshot.by_token.get(pair) else {
                continue;
            };
            if let Some(opp) = self.evaluate_pair(pair, points, now_ms).await {
                if self.breaker.is_open() {
                    debug!(pair = %pair, "Circuit breaker open; dropping opportunity");
                    continue;
                }
                self.publish(&opp).await?;
                published += 1;
            }
        }
        Ok(published)
    }

    /// Score one pair: spread gate, net-profit gate, then confidence.
    async fn evaluate_pair(
        &self,
        pair: &str,
        points: &[PriceUpdate],
        now_ms: i64,
    ) -> Option<Opportunity> {
        let low = points.iter().min_by(|a, b| {
            a.price
                .partial_cmp(&b.price)
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        let high = points.iter().max_by(|a, b| {
            a.price
                .partial_cmp(&b.price)
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if low.chain == high.chain {
            return None;
        }

        let min_spread = self.config.min_spread_for(&low.chain);
        if high.price <= low.price * (1.0 + min_spread) {
            return None;
        }

        let amount = self.config.trade_amount_usd;
        let gross = amount * (high.price / low.price - 1.0);
        let bridge = self.bridges.read().predict_optimal_bridge(
            &low.chain,
            &high.chain,
            amount,
            Urgency::Medium,
        );
        let bridge_cost = bridge
            .as_ref()
            .map(|b| b.estimated_cost_usd)
            .unwrap_or(self.config.default_bridge_cost_usd);
        let net = gross
            - bridge_cost
            - self.config.gas_cost_for(&low.chain)
            - self.config.gas_cost_for(&high.chain);
        if net <= 0.0 {
            return None;
        }

        let ml = self.fetch_predictions(&low.chain, &high.chain, pair).await;
        let whale = pair
            .split('/')
            .find_map(|part| self.whale_summary(part));

        let confidence = self
            .confidence
            .calculate(low, high, whale.as_ref(), ml.as_ref(), now_ms);
        if confidence <= self.config.confidence_threshold {
            return None;
        }

        let ml_supported = ml
            .as_ref()
            .map(|p| p.source.is_some() || p.target.is_some())
            .filter(|&supported| supported);
        Some(Opportunity {
            id: format!("opp_{}", Uuid::new_v4()),
            opportunity_type: self.config.opportunity_type.clone(),
            source_chain: low.chain.clone(),
            target_chain: high.chain.clone(),
            token_pair: pair.to_string(),
            buy_price: low.price,
            sell_price: high.price,
            expected_profit: net,
            profit_percentage: net / amount * 100.0,
            confidence,
            timestamp: now_ms,
            ml_supported,
            whale_context: whale,
        })
    }

    async fn fetch_predictions(
        &self,
        source_chain: &str,
        target_chain: &str,
        pair: &str,
    ) -> Option<PairPrediction> {
        if !self.config.confidence.ml_enabled {
            return None;
        }
        let manager = self.predictions.as_ref()?;
        Some(PairPrediction {
            source: manager.predict(source_chain, pair).await,
            target: manager.predict(target_chain, pair).await,
        })
    }

    async fn publish(&self, opp: &Opportunity) -> Result<()> {
        let fields = vec![
            ("data".to_string(), serde_json::to_string(opp)?),
            ("opportunityId".to_string(), opp.id.clone()),
            ("opportunityType".to_string(), opp.opportunity_type.clone()),
        ];
        self.transport
            .append(names::OPPORTUNITIES, &fields, self.config.maxlen)
            .await?;
        self.stats
            .opportunities_published
            .fetch_add(1, Ordering::Relaxed);
        info!(
            id = %opp.id,
            pair = %opp.token_pair,
            source = %opp.source_chain,
            target = %opp.target_chain,
            confidence = opp.confidence,
            expected_profit = opp.expected_profit,
            "Opportunity published"
        );
        Ok(())
    }
}

/// Consumer handler for `stream:price-updates`.
pub struct PriceUpdateHandler {
    pub detector: Arc<CrossChainDetector>,
}

#[async_trait]
impl StreamHandler for PriceUpdateHandler {
    async fn handle(&self, entry: &StreamEntry) -> Result<(), HandlerError> {
        let update: PriceUpdate = entry
            .json_field("data")
            .map_err(|e| HandlerError::fatal(DlqCode::ValBadShape, e.to_string()))?;
        if update.chain.trim().is_empty() {
            return Err(HandlerError::fatal(
                DlqCode::ErrNoChain,
                "price update without a chain",
            ));
        }
        self.detector
            .handle_price_update(&update)
            .await
            .map_err(HandlerError::transient)?;
        Ok(())
    }
}

/// Consumer handler for `stream:whale-alerts`.
pub struct WhaleAlertHandler {
    pub detector: Arc<CrossChainDetector>,
}

#[async_trait]
impl StreamHandler for WhaleAlertHandler {
    async fn handle(&self, entry: &StreamEntry) -> Result<(), HandlerError> {
        let tx: WhaleTransaction = entry
            .json_field("data")
            .map_err(|e| HandlerError::fatal(DlqCode::ValBadShape, e.to_string()))?;
        if tx.chain.trim().is_empty() {
            return Err(HandlerError::fatal(
                DlqCode::ErrNoChain,
                "whale alert without a chain",
            ));
        }
        self.detector
            .handle_whale_alert(&tx)
            .await
            .map_err(HandlerError::transient)?;
        Ok(())
    }
}

/// Consumer handler for `stream:swap-events`: counted for volume visibility,
/// not price-relevant. The `minSwapSizeUsd` knob on the wire is accepted and
/// ignored.
pub struct SwapEventHandler {
    pub detector: Arc<CrossChainDetector>,
}

#[async_trait]
impl StreamHandler for SwapEventHandler {
    async fn handle(&self, entry: &StreamEntry) -> Result<(), HandlerError> {
        let event: serde_json::Value = entry
            .json_field("data")
            .map_err(|e| HandlerError::fatal(DlqCode::ValBadShape, e.to_string()))?;
        if event
            .get("chain")
            .and_then(|c| c.as_str())
            .map(|c| c.trim().is_empty())
            .unwrap_or(true)
        {
            return Err(HandlerError::fatal(
                DlqCode::ErrNoChain,
                "swap event without a chain",
            ));
        }
        self.detector
            .stats
            .swap_events
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::memory::MemoryTransport;

    fn update(chain: &str, pair: &str, price: f64) -> PriceUpdate {
        PriceUpdate {
            chain: chain.to_string(),
            dex: "uniswap-v3".to_string(),
            pair_key: pair.to_string(),
            price,
            reserve0: 1_000.0,
            reserve1: 1_000.0,
            block_number: 1,
            timestamp: Utc::now().timestamp_millis(),
            latency: 5.0,
        }
    }

    fn whale_tx(token: &str, chain: &str, usd: f64, direction: &str) -> WhaleTransaction {
        WhaleTransaction {
            transaction_hash: "0xabc".to_string(),
            address: "0xwhale".to_string(),
            token: token.to_string(),
            amount: 100.0,
            usd_value: usd,
            direction: direction.to_string(),
            dex: "uniswap-v3".to_string(),
            chain: chain.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            impact: 0.0,
        }
    }

    fn detector(transport: Arc<MemoryTransport>) -> CrossChainDetector {
        CrossChainDetector::new(
            transport,
            DetectorConfig::default(),
            Arc::new(CircuitBreaker::new()),
            None,
        )
    }

    #[test]
    fn test_parse_whale_token_formats() {
        assert_eq!(parse_whale_token("ETH/USDC", "ethereum"), "ETH");
        assert_eq!(parse_whale_token("weth_usdc", "ethereum"), "ETH");
        assert_eq!(parse_whale_token("UNISWAP_ARB_USDC", "arbitrum"), "ARB");
        assert_eq!(parse_whale_token("wbtc", "ethereum"), "BTC");
        assert_eq!(parse_whale_token("", "polygon"), "MATIC");
        assert_eq!(parse_whale_token("   ", "bsc"), "BNB");
        assert_eq!(parse_whale_token("__", "ethereum"), "ETH");
    }

    #[test]
    fn test_whale_significance_wording() {
        let t = Arc::new(MemoryTransport::new());
        let d = detector(t);
        // >= superWhaleThresholdUsd: strictly "Super whale".
        assert_eq!(d.whale_significance(600_000.0, 0.0), Some("Super whale"));
        assert_eq!(d.whale_significance(500_000.0, 0.0), Some("Super whale"));
        // Below the super threshold but with significant net flow.
        let label = d.whale_significance(50_000.0, 150_000.0).unwrap();
        assert_eq!(label, "Significant whale activity");
        assert!(!label.contains("Super whale"));
        // Neither.
        assert_eq!(d.whale_significance(50_000.0, 20_000.0), None);
    }

    #[test]
    fn test_whale_guard_cooldown() {
        let guard = WhaleGuard::new(Duration::from_secs(60));
        assert!(guard.try_acquire());
        assert!(!guard.try_acquire());

        let instant_guard = WhaleGuard::new(Duration::from_millis(0));
        assert!(instant_guard.try_acquire());
        assert!(instant_guard.try_acquire());
    }

    #[tokio::test]
    async fn test_detection_publishes_opportunity() {
        let t = Arc::new(MemoryTransport::new());
        let d = detector(t.clone());

        d.handle_price_update(&update("ethereum", "ETH/USDC", 2000.0))
            .await
            .unwrap();
        let published = d
            .handle_price_update(&update("arbitrum", "WETH/USDC", 2500.0))
            .await
            .unwrap();
        assert_eq!(published, 1);

        let entries = t.range(names::OPPORTUNITIES, "-", 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        let opp: Opportunity = entries[0].json_field("data").unwrap();
        assert_eq!(opp.source_chain, "ethereum");
        assert_eq!(opp.target_chain, "arbitrum");
        assert_eq!(opp.token_pair, "ETH/USDC");
        assert_eq!(opp.buy_price, 2000.0);
        assert_eq!(opp.sell_price, 2500.0);
        assert!(opp.expected_profit > 0.0);
        assert!(opp.confidence > 0.0 && opp.confidence <= 0.95);
        assert!(entries[0].field("opportunityId").is_some());
    }

    #[tokio::test]
    async fn test_spread_below_chain_minimum_is_dropped() {
        let t = Arc::new(MemoryTransport::new());
        let d = detector(t.clone());

        // 0.35% spread from an Ethereum buy side: below the 0.5% floor.
        d.handle_price_update(&update("ethereum", "ETH/USDC", 2000.0))
            .await
            .unwrap();
        let published = d
            .handle_price_update(&update("arbitrum", "ETH/USDC", 2007.0))
            .await
            .unwrap();
        assert_eq!(published, 0);
        assert_eq!(t.len(names::OPPORTUNITIES).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unprofitable_after_costs_is_dropped() {
        let t = Arc::new(MemoryTransport::new());
        let config = DetectorConfig {
            // Tiny notional: gross profit cannot cover bridge + gas.
            trade_amount_usd: 100.0,
            ..DetectorConfig::default()
        };
        let d = CrossChainDetector::new(
            t.clone(),
            config,
            Arc::new(CircuitBreaker::new()),
            None,
        );

        d.handle_price_update(&update("polygon", "MATIC/USDC", 1.0))
            .await
            .unwrap();
        let published = d
            .handle_price_update(&update("bsc", "MATIC/USDC", 1.05))
            .await
            .unwrap();
        assert_eq!(published, 0);
    }

    #[tokio::test]
    async fn test_circuit_breaker_blocks_publishing() {
        let t = Arc::new(MemoryTransport::new());
        let breaker = Arc::new(CircuitBreaker::new());
        let d = CrossChainDetector::new(
            t.clone(),
            DetectorConfig::default(),
            breaker.clone(),
            None,
        );
        breaker.open("manual halt");

        d.handle_price_update(&update("ethereum", "ETH/USDC", 2000.0))
            .await
            .unwrap();
        let published = d
            .handle_price_update(&update("arbitrum", "ETH/USDC", 2500.0))
            .await
            .unwrap();
        assert_eq!(published, 0);
        assert_eq!(t.len(names::OPPORTUNITIES).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_whale_pass_restricted_to_token_pairs() {
        let t = Arc::new(MemoryTransport::new());
        let d = detector(t.clone());

        // Two arbitrageable pairs; drain the price-driven passes first.
        d.handle_price_update(&update("ethereum", "ETH/USDC", 2000.0))
            .await
            .unwrap();
        d.handle_price_update(&update("arbitrum", "ETH/USDC", 2500.0))
            .await
            .unwrap();
        d.handle_price_update(&update("ethereum", "BTC/USDC", 60_000.0))
            .await
            .unwrap();
        d.handle_price_update(&update("arbitrum", "BTC/USDC", 70_000.0))
            .await
            .unwrap();
        let baseline = t.len(names::OPPORTUNITIES).await.unwrap();

        let published = d
            .handle_whale_alert(&whale_tx("ETH/USDC", "ethereum", 600_000.0, "buy"))
            .await
            .unwrap();
        assert_eq!(published, 1);

        let entries = t.range(names::OPPORTUNITIES, "-", 50).await.unwrap();
        let whale_opp: Opportunity = entries[baseline as usize].json_field("data").unwrap();
        assert_eq!(whale_opp.token_pair, "ETH/USDC");
        let ctx = whale_opp.whale_context.unwrap();
        assert_eq!(ctx.sentiment, WhaleSentiment::Bullish);
        assert_eq!(ctx.super_whale_count, 1);
    }

    #[tokio::test]
    async fn test_whale_guard_suppresses_back_to_back_passes() {
        let t = Arc::new(MemoryTransport::new());
        let d = detector(t.clone());
        d.handle_price_update(&update("ethereum", "ETH/USDC", 2000.0))
            .await
            .unwrap();
        d.handle_price_update(&update("arbitrum", "ETH/USDC", 2500.0))
            .await
            .unwrap();

        let first = d
            .handle_whale_alert(&whale_tx("ETH/USDC", "ethereum", 600_000.0, "buy"))
            .await
            .unwrap();
        assert_eq!(first, 1);
        let second = d
            .handle_whale_alert(&whale_tx("ETH/USDC", "ethereum", 700_000.0, "buy"))
            .await
            .unwrap();
        assert_eq!(second, 0);
        assert_eq!(d.stats.whale_guard_rejections.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_insignificant_whale_does_not_trigger_pass() {
        let t = Arc::new(MemoryTransport::new());
        let d = detector(t.clone());
        d.handle_price_update(&update("ethereum", "ETH/USDC", 2000.0))
            .await
            .unwrap();
        d.handle_price_update(&update("arbitrum", "ETH/USDC", 2500.0))
            .await
            .unwrap();

        let published = d
            .handle_whale_alert(&whale_tx("ETH/USDC", "ethereum", 10_000.0, "buy"))
            .await
            .unwrap();
        assert_eq!(published, 0);
        // The event still counts toward the rolling window.
        let summary = d.whale_summary("ETH").unwrap();
        assert_eq!(summary.net_flow_usd, 10_000.0);
    }

    #[tokio::test]
    async fn test_whale_window_nets_buys_and_sells() {
        let t = Arc::new(MemoryTransport::new());
        let d = detector(t);
        d.record_whale_event("ETH", &whale_tx("ETH", "ethereum", 300_000.0, "buy"));
        d.record_whale_event("ETH", &whale_tx("ETH", "ethereum", 500_000.0, "sell"));

        let summary = d.whale_summary("ETH").unwrap();
        assert_eq!(summary.net_flow_usd, -200_000.0);
        assert_eq!(summary.sentiment, WhaleSentiment::Bearish);
        assert_eq!(summary.super_whale_count, 1);
    }

    #[tokio::test]
    async fn test_stale_whale_event_does_not_leave_a_key_behind() {
        let t = Arc::new(MemoryTransport::new());
        let d = detector(t);
        let mut tx = whale_tx("JUNKCOIN", "ethereum", 10_000.0, "buy");
        tx.timestamp = Utc::now().timestamp_millis() - 3_600_000;

        d.record_whale_event("JUNKCOIN", &tx);
        // The event aged out on insert, so the window (and its key) is gone.
        assert!(d.whale_summary("JUNKCOIN").is_none());
        assert_eq!(d.whale_windows.read().len(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_sweeps_expired_whale_windows() {
        let t = Arc::new(MemoryTransport::new());
        let config = DetectorConfig {
            whale_window: Duration::from_millis(40),
            ..DetectorConfig::default()
        };
        let d = CrossChainDetector::new(t, config, Arc::new(CircuitBreaker::new()), None);

        d.record_whale_event("JUNK1", &whale_tx("JUNK1", "ethereum", 10_000.0, "buy"));
        d.record_whale_event("JUNK2", &whale_tx("JUNK2", "ethereum", 10_000.0, "sell"));
        assert_eq!(d.whale_windows.read().len(), 2);

        tokio::time::sleep(Duration::from_millis(60)).await;
        d.record_whale_event("ETH", &whale_tx("ETH", "ethereum", 10_000.0, "buy"));
        d.cleanup();

        // Only the still-live token survives the sweep.
        assert_eq!(d.whale_windows.read().len(), 1);
        assert!(d.whale_summary("ETH").is_some());
        assert!(d.whale_summary("JUNK1").is_none());
        assert!(d.whale_summary("JUNK2").is_none());
    }

    #[tokio::test]
    async fn test_dirty_flag_throttles_unfiltered_passes() {
        let t = Arc::new(MemoryTransport::new());
        let d = detector(t);
        d.handle_price_update(&update("ethereum", "ETH/USDC", 2000.0))
            .await
            .unwrap();
        let passes = d.stats.detection_passes.load(Ordering::Relaxed);
        // Nothing new arrived: the unfiltered pass is skipped.
        d.run_detection(None).await.unwrap();
        assert_eq!(d.stats.detection_passes.load(Ordering::Relaxed), passes);
    }

    #[tokio::test]
    async fn test_price_handler_classifies_missing_chain_as_fatal() {
        let t = Arc::new(MemoryTransport::new());
        let d = Arc::new(detector(t));
        let handler = PriceUpdateHandler {
            detector: d.clone(),
        };
        let entry = StreamEntry {
            id: "1-1".to_string(),
            fields: [(
                "data".to_string(),
                serde_json::to_string(&update("", "ETH/USDC", 2000.0)).unwrap(),
            )]
            .into_iter()
            .collect(),
        };
        match handler.handle(&entry).await {
            Err(HandlerError::Fatal { code, .. }) => assert_eq!(code, DlqCode::ErrNoChain),
            other => panic!("expected fatal error, got {:?}", other),
        }
    }
}
