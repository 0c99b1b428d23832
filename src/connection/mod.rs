//! Connection management for the device's link to the remote store
//!
//! This module handles:
//! - Device registration
//! - Battery-aware heartbeats
//! - Linear-backoff reconnection with a bounded retry budget
//! - Running the command listener for each connected session

mod manager;

pub use lockagent_shared::state_machine::{ConnectionStatus, LinkState};
pub use manager::ConnectionManager;
