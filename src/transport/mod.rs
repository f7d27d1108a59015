//! Pluggable transports
//!
//! - `polling`: reliable request/response transport
//! - `tcp`: persistent stream transport

mod frames;
pub mod polling;
pub mod tcp;
pub mod traits;

pub use polling::PollingConnector;
pub use tcp::StreamConnector;
pub use traits::{Hello, Link, LinkSignal, TransportConnector};
