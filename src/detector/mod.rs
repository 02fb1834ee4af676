//! Cross-chain detection engine and its supporting models.

pub mod bridge;
pub mod confidence;
pub mod engine;
pub mod prediction;
pub mod snapshot;

pub use engine::{CrossChainDetector, DetectorConfig};
