//! Leadership election and standby activation.

pub mod election;
pub mod standby;

pub use election::{ElectionConfig, ElectionState, LeaderElector};
pub use standby::StandbyActivationManager;
