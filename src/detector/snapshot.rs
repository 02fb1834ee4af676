//! Price snapshot index.
//!
//! Maps normalized token pairs to per-chain price points, bounded by a TTL
//! and a hard key cap with oldest-by-last-access eviction. Detection passes
//! work off immutable snapshot copies built on demand; a per-key ring buffer
//! keeps recent price history for the prediction companion.

use std::collections::HashMap;

use chrono::Utc;
use serde::Serialize;

use crate::models::{normalize_token, PriceUpdate};
use crate::util::ring::RingBuffer;

/// One historical price observation for the ML companion.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryPoint {
    pub price: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Keys untouched for this long are evicted on cleanup.
    pub entry_ttl_ms: i64,
    /// Hard cap on distinct (chain, pair) keys.
    pub max_keys: usize,
    /// Ring capacity of the per-key price history.
    pub history_capacity: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            entry_ttl_ms: 10 * 60 * 1_000,
            max_keys: 10_000,
            history_capacity: 100,
        }
    }
}

/// Immutable indexed view handed to detection passes. Superseded by the next
/// build; concurrent passes may each hold their own.
#[derive(Debug, Clone)]
pub struct IndexedSnapshot {
    /// Pairs present on at least two chains.
    pub pairs: Vec<String>,
    /// Pair -> price points ordered by chain name.
    pub by_token: HashMap<String, Vec<PriceUpdate>>,
    pub built_at: i64,
}

impl IndexedSnapshot {
    /// True when any `/`-separated part of the pair equals `token` exactly.
    /// Never substring matching: `ETH` must not match `WETHX/USDC`.
    pub fn pair_contains_token(pair: &str, token: &str) -> bool {
        pair.split('/').any(|part| part == token)
    }
}

/// Split a raw pair key on its separator (`/` or `_`) and normalize each
/// side. Unseparated keys normalize as a whole.
pub fn normalize_pair_string(raw: &str) -> String {
    let sep = if raw.contains('/') {
        '/'
    } else if raw.contains('_') {
        '_'
    } else {
        return normalize_token(raw);
    };
    raw.split(sep)
        .map(normalize_token)
        .collect::<Vec<_>>()
        .join("/")
}

/// In-memory index of the most recent price per (chain, pair).
pub struct PriceSnapshotIndex {
    config: SnapshotConfig,
    /// pair -> chain -> latest point. The most recent update wins.
    pairs: HashMap<String, HashMap<String, PriceUpdate>>,
    /// (chain, pair) -> last-access ms; drives TTL and cap eviction.
    touched: HashMap<(String, String), i64>,
    history: HashMap<(String, String), RingBuffer<HistoryPoint>>,
}

impl PriceSnapshotIndex {
    pub fn new(config: SnapshotConfig) -> Self {
        Self {
            config,
            pairs: HashMap::new(),
            touched: HashMap::new(),
            history: HashMap::new(),
        }
    }

    pub fn handle_update(&mut self, update: &PriceUpdate) {
        self.handle_update_at(update, Utc::now().timestamp_millis());
    }

    fn handle_update_at(&mut self, update: &PriceUpdate, now_ms: i64) {
        let pair = normalize_pair_string(&update.pair_key);
        let key = (update.chain.clone(), pair.clone());

        let mut point = update.clone();
        point.pair_key = pair.clone();
        self.pairs
            .entry(pair)
            .or_default()
            .insert(update.chain.clone(), point);
        self.touched.insert(key.clone(), now_ms);

        let capacity = self.config.history_capacity;
        self.history
            .entry(key)
            .or_insert_with(|| RingBuffer::with_capacity(capacity))
            .push(HistoryPoint {
                price: update.price,
                timestamp: update.timestamp,
            });

        self.enforce_key_cap();
    }

    /// Evict oldest-by-last-access keys while over the cap.
    fn enforce_key_cap(&mut self) {
        while self.touched.len() > self.config.max_keys {
            let oldest = self
                .touched
                .iter()
                .min_by_key(|(_, &at)| at)
                .map(|(k, _)| k.clone());
            let Some(key) = oldest else { break };
            self.remove_key(&key);
        }
    }

    fn remove_key(&mut self, key: &(String, String)) {
        self.touched.remove(key);
        self.history.remove(key);
        let (chain, pair) = key;
        if let Some(by_chain) = self.pairs.get_mut(pair) {
            by_chain.remove(chain);
            if by_chain.is_empty() {
                self.pairs.remove(pair);
            }
        }
    }

    /// Drop keys untouched for longer than the TTL.
    pub fn cleanup(&mut self) {
        self.cleanup_at(Utc::now().timestamp_millis());
    }

    fn cleanup_at(&mut self, now_ms: i64) {
        let expired: Vec<(String, String)> = self
            .touched
            .iter()
            .filter(|(_, &at)| now_ms - at > self.config.entry_ttl_ms)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.remove_key(&key);
        }
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
        self.touched.clear();
        self.history.clear();
    }

    pub fn key_count(&self) -> usize {
        self.touched.len()
    }

    /// Build an immutable view of every pair priced on at least two chains.
    pub fn build_snapshot(&self) -> IndexedSnapshot {
        let mut by_token = HashMap::new();
        let mut pairs = Vec::new();
        for (pair, by_chain) in &self.pairs {
            if by_chain.len() < 2 {
                continue;
            }
            let mut points: Vec<PriceUpdate> = by_chain.values().cloned().collect();
            points.sort_by(|a, b| a.chain.cmp(&b.chain));
            pairs.push(pair.clone());
            by_token.insert(pair.clone(), points);
        }
        pairs.sort();
        IndexedSnapshot {
            pairs,
            by_token,
            built_at: Utc::now().timestamp_millis(),
        }
    }

    /// Ordered (oldest-first) price history for one (chain, pair).
    pub fn price_history(&self, chain: &str, pair: &str) -> Vec<HistoryPoint> {
        self.history
            .get(&(chain.to_string(), pair.to_string()))
            .map(|ring| ring.ordered())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(chain: &str, pair: &str, price: f64) -> PriceUpdate {
        PriceUpdate {
            chain: chain.to_string(),
            dex: "uniswap-v3".to_string(),
            pair_key: pair.to_string(),
            price,
            reserve0: 0.0,
            reserve1: 0.0,
            block_number: 1,
            timestamp: Utc::now().timestamp_millis(),
            latency: 0.0,
        }
    }

    #[test]
    fn test_normalize_pair_string() {
        assert_eq!(normalize_pair_string("WETH/USDC"), "ETH/USDC");
        assert_eq!(normalize_pair_string("weth_usdc"), "ETH/USDC");
        assert_eq!(normalize_pair_string("WBTC"), "BTC");
    }

    #[test]
    fn test_latest_update_wins_per_chain() {
        let mut index = PriceSnapshotIndex::new(SnapshotConfig::default());
        index.handle_update(&update("ethereum", "ETH/USDC", 2500.0));
        index.handle_update(&update("ethereum", "ETH/USDC", 2510.0));
        index.handle_update(&update("arbitrum", "WETH/USDC", 2505.0));

        let snapshot = index.build_snapshot();
        assert_eq!(snapshot.pairs, vec!["ETH/USDC"]);
        let points = &snapshot.by_token["ETH/USDC"];
        assert_eq!(points.len(), 2);
        // Ordered by chain name: arbitrum, ethereum.
        assert_eq!(points[0].chain, "arbitrum");
        assert_eq!(points[1].price, 2510.0);
    }

    #[test]
    fn test_single_chain_pairs_excluded_from_snapshot() {
        let mut index = PriceSnapshotIndex::new(SnapshotConfig::default());
        index.handle_update(&update("ethereum", "ETH/USDC", 2500.0));
        let snapshot = index.build_snapshot();
        assert!(snapshot.pairs.is_empty());
    }

    #[test]
    fn test_ttl_cleanup_evicts_stale_keys() {
        let mut index = PriceSnapshotIndex::new(SnapshotConfig {
            entry_ttl_ms: 1_000,
            ..SnapshotConfig::default()
        });
        index.handle_update_at(&update("ethereum", "ETH/USDC", 2500.0), 1_000);
        index.handle_update_at(&update("arbitrum", "ETH/USDC", 2505.0), 5_000);

        index.cleanup_at(5_500);
        assert_eq!(index.key_count(), 1);
        // The surviving arbitrum point no longer has a counterpart.
        assert!(index.build_snapshot().pairs.is_empty());
    }

    #[test]
    fn test_key_cap_evicts_oldest_by_last_access() {
        let mut index = PriceSnapshotIndex::new(SnapshotConfig {
            max_keys: 2,
            ..SnapshotConfig::default()
        });
        index.handle_update_at(&update("ethereum", "ETH/USDC", 1.0), 1_000);
        index.handle_update_at(&update("ethereum", "BTC/USDC", 2.0), 2_000);
        index.handle_update_at(&update("ethereum", "ARB/USDC", 3.0), 3_000);

        assert_eq!(index.key_count(), 2);
        assert!(index
            .price_history("ethereum", "ETH/USDC")
            .is_empty());
        assert!(!index.price_history("ethereum", "ARB/USDC").is_empty());
    }

    #[test]
    fn test_history_ring_caps_and_orders() {
        let mut index = PriceSnapshotIndex::new(SnapshotConfig {
            history_capacity: 3,
            ..SnapshotConfig::default()
        });
        for i in 0..5 {
            index.handle_update(&update("ethereum", "ETH/USDC", 2500.0 + i as f64));
        }
        let history = index.price_history("ethereum", "ETH/USDC");
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].price, 2502.0);
        assert_eq!(history[2].price, 2504.0);
    }

    #[test]
    fn test_pair_contains_token_exact_parts_only() {
        assert!(IndexedSnapshot::pair_contains_token("ETH/USDC", "ETH"));
        assert!(IndexedSnapshot::pair_contains_token("ETH/USDC", "USDC"));
        assert!(!IndexedSnapshot::pair_contains_token("WETHX/USDC", "ETH"));
        assert!(!IndexedSnapshot::pair_contains_token("ETH/USDC", "USD"));
    }

    #[test]
    fn test_clear() {
        let mut index = PriceSnapshotIndex::new(SnapshotConfig::default());
        index.handle_update(&update("ethereum", "ETH/USDC", 2500.0));
        index.clear();
        assert_eq!(index.key_count(), 0);
        assert!(index.price_history("ethereum", "ETH/USDC").is_empty());
    }
}
