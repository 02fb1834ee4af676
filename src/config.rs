//! Environment-driven service configuration.
//!
//! One detector deployment handles one named partition (a subset of chains).
//! Missing `REDIS_URL` or an unknown partition id is a fatal startup error;
//! the binary logs with context and exits non-zero rather than defaulting
//! silently.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Result};

/// Per-chain external endpoints (adapters live outside this service; only
/// their presence matters for health reporting).
#[derive(Debug, Clone, Default)]
pub struct ChainEndpoints {
    pub rpc_url: Option<String>,
    pub ws_url: Option<String>,
}

impl ChainEndpoints {
    pub fn is_configured(&self) -> bool {
        self.rpc_url.is_some() || self.ws_url.is_some()
    }
}

/// A named subset of chains handled by one deployment.
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    pub id: String,
    pub chains: Vec<String>,
    pub failover_timeout: Duration,
}

/// Known partition presets. `PARTITION_CHAINS` may override the chain list.
pub fn partition_preset(id: &str) -> Option<PartitionConfig> {
    let (chains, failover_secs): (&[&str], u64) = match id {
        "asia-fast" => (&["bsc", "polygon"], 45),
        "l2-turbo" => (&["arbitrum", "optimism", "base"], 45),
        "eth-core" => (&["ethereum", "arbitrum"], 60),
        _ => return None,
    };
    Some(PartitionConfig {
        id: id.to_string(),
        chains: chains.iter().map(|c| c.to_string()).collect(),
        failover_timeout: Duration::from_secs(failover_secs),
    })
}

#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub instance_id: String,
    pub region_id: String,
    pub enable_cross_region_health: bool,
    pub health_check_port: u16,
    pub partition: PartitionConfig,
    pub chain_endpoints: HashMap<String, ChainEndpoints>,
    pub log_level: Option<String>,
    pub circuit_breaker_api_key: Option<String>,
    pub is_standby: bool,
    pub can_become_leader: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_map(&std::env::vars().collect())
    }

    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| vars.get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let Some(redis_url) = get("REDIS_URL") else {
            bail!("REDIS_URL is required: the stream transport has no default endpoint");
        };

        let partition_id = get("PARTITION_ID").unwrap_or_else(|| "l2-turbo".to_string());
        let Some(mut partition) = partition_preset(&partition_id) else {
            bail!(
                "unknown PARTITION_ID '{}' (known: asia-fast, l2-turbo, eth-core)",
                partition_id
            );
        };
        if let Some(chains) = get("PARTITION_CHAINS") {
            let overridden: Vec<String> = chains
                .split(',')
                .map(|c| c.trim().to_lowercase())
                .filter(|c| !c.is_empty())
                .collect();
            if overridden.is_empty() {
                bail!("PARTITION_CHAINS is set but names no chains");
            }
            partition.chains = overridden;
        }

        let mut chain_endpoints = HashMap::new();
        for chain in &partition.chains {
            let upper = chain.to_uppercase();
            chain_endpoints.insert(
                chain.clone(),
                ChainEndpoints {
                    rpc_url: get(&format!("{}_RPC_URL", upper)),
                    ws_url: get(&format!("{}_WS_URL", upper)),
                },
            );
        }

        let instance_id = get("INSTANCE_ID")
            .unwrap_or_else(|| format!("chainarb-{}", &uuid::Uuid::new_v4().to_string()[..8]));
        let health_check_port = match get("HEALTH_CHECK_PORT") {
            Some(raw) => raw
                .parse()
                .map_err(|_| anyhow::anyhow!("HEALTH_CHECK_PORT '{}' is not a port", raw))?,
            None => 8080,
        };

        Ok(Self {
            redis_url,
            instance_id,
            region_id: get("REGION_ID").unwrap_or_else(|| "primary".to_string()),
            enable_cross_region_health: get("ENABLE_CROSS_REGION_HEALTH")
                .map(|v| parse_bool(&v))
                .unwrap_or(false),
            health_check_port,
            partition,
            chain_endpoints,
            log_level: get("LOG_LEVEL"),
            circuit_breaker_api_key: get("CIRCUIT_BREAKER_API_KEY"),
            is_standby: get("STANDBY").map(|v| parse_bool(&v)).unwrap_or(false),
            can_become_leader: get("CAN_BECOME_LEADER")
                .map(|v| parse_bool(&v))
                .unwrap_or(true),
        })
    }

    /// True when none of the partition's chains has an endpoint configured;
    /// the service still runs but reports degraded.
    pub fn no_chain_endpoints(&self) -> bool {
        !self
            .chain_endpoints
            .values()
            .any(|e| e.is_configured())
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw, "1" | "true" | "TRUE" | "on" | "ON" | "yes" | "YES")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_vars() -> HashMap<String, String> {
        [("REDIS_URL", "redis://localhost:6379")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_map(&base_vars()).unwrap();
        assert_eq!(config.partition.id, "l2-turbo");
        assert_eq!(
            config.partition.chains,
            vec!["arbitrum", "optimism", "base"]
        );
        assert_eq!(config.partition.failover_timeout, Duration::from_secs(45));
        assert_eq!(config.health_check_port, 8080);
        assert!(!config.is_standby);
        assert!(config.can_become_leader);
        assert!(config.instance_id.starts_with("chainarb-"));
        assert!(config.no_chain_endpoints());
        assert!(!config.enable_cross_region_health);
    }

    #[test]
    fn test_cross_region_health_opt_in() {
        let mut vars = base_vars();
        vars.insert(
            "ENABLE_CROSS_REGION_HEALTH".to_string(),
            "true".to_string(),
        );
        let config = Config::from_map(&vars).unwrap();
        assert!(config.enable_cross_region_health);
    }

    #[test]
    fn test_missing_redis_url_is_fatal() {
        let err = Config::from_map(&HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("REDIS_URL"));
    }

    #[test]
    fn test_unknown_partition_is_fatal() {
        let mut vars = base_vars();
        vars.insert("PARTITION_ID".to_string(), "mars-base".to_string());
        let err = Config::from_map(&vars).unwrap_err();
        assert!(err.to_string().contains("mars-base"));
    }

    #[test]
    fn test_partition_chains_override() {
        let mut vars = base_vars();
        vars.insert("PARTITION_ID".to_string(), "asia-fast".to_string());
        vars.insert(
            "PARTITION_CHAINS".to_string(),
            "Polygon, bsc ,avalanche".to_string(),
        );
        let config = Config::from_map(&vars).unwrap();
        assert_eq!(config.partition.chains, vec!["polygon", "bsc", "avalanche"]);
        // Failover timeout still comes from the preset.
        assert_eq!(config.partition.failover_timeout, Duration::from_secs(45));
    }

    #[test]
    fn test_chain_endpoints_pickup() {
        let mut vars = base_vars();
        vars.insert("PARTITION_ID".to_string(), "eth-core".to_string());
        vars.insert(
            "ETHEREUM_RPC_URL".to_string(),
            "https://rpc.example".to_string(),
        );
        vars.insert(
            "ARBITRUM_WS_URL".to_string(),
            "wss://arb.example".to_string(),
        );
        let config = Config::from_map(&vars).unwrap();
        assert!(config.chain_endpoints["ethereum"].is_configured());
        assert!(config.chain_endpoints["arbitrum"].is_configured());
        assert!(!config.no_chain_endpoints());
    }

    #[test]
    fn test_standby_and_key_flags() {
        let mut vars = base_vars();
        vars.insert("STANDBY".to_string(), "true".to_string());
        vars.insert("CAN_BECOME_LEADER".to_string(), "false".to_string());
        vars.insert(
            "CIRCUIT_BREAKER_API_KEY".to_string(),
            "sekrit".to_string(),
        );
        let config = Config::from_map(&vars).unwrap();
        assert!(config.is_standby);
        assert!(!config.can_become_leader);
        assert_eq!(config.circuit_breaker_api_key.as_deref(), Some("sekrit"));
    }

    #[test]
    fn test_bad_port_is_fatal() {
        let mut vars = base_vars();
        vars.insert("HEALTH_CHECK_PORT".to_string(), "eighty".to_string());
        assert!(Config::from_map(&vars).is_err());
    }
}
