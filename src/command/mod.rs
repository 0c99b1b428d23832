//! Command execution for the device agent
//!
//! This module handles:
//! - Receiving pending commands from the remote store
//! - De-duplicating deliveries within a connection session
//! - Dispatching to the per-action handlers
//! - Writing the acknowledgement back to the command document

mod controller;
mod dispatcher;
pub mod handlers;

pub use controller::LockController;
pub use dispatcher::{CommandDispatcher, CommandResult};
