//! Connection management for a real-time event channel
//!
//! This module handles:
//! - Connecting over the reliable transport first
//! - Upgrading to the persistent transport with a bounded attempt budget
//! - Reconnection with exponential backoff
//! - Passthrough of application events in both directions

mod config;
mod manager;
mod timers;

pub use config::ConnectionConfig;
pub use manager::{ConnectionEvent, ConnectionManager, LinkStatus};
