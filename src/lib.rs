//! Device agent for remotely managed screen-lock and kiosk devices
//!
//! The agent keeps one device registered with a remote document store,
//! executes operator commands against local actuators, reconciles pushed
//! configuration with local state and fires scheduled lock/unlock alarms.

pub mod agent;
pub mod analytics;
pub mod command;
pub mod config;
pub mod connection;
pub mod context;
pub mod device;
pub mod error;
pub mod persistence;
pub mod power;
pub mod reconcile;
pub mod schedule;
pub mod store;

#[cfg(test)]
mod testing;

pub use agent::DeviceAgent;
pub use config::AgentConfig;
pub use context::{ActuatorRequest, AgentChannels, AgentContext, AgentEvent};
pub use error::{AgentError, Result};
