//! Switchback: a real-time connection manager that starts on a reliable
//! polling transport and upgrades to a persistent stream when it can.

pub mod connection;
pub mod network;
pub mod transport;

pub use connection::{ConnectionConfig, ConnectionEvent, ConnectionManager, LinkStatus};
pub use network::{connectivity_channel, Connectivity, ConnectivityReporter, NetworkStatus};
pub use switchback_shared::{
    state_machine::{ConnectionState, DisconnectReason},
    LinkError, TransportKind,
};
