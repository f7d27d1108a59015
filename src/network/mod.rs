//! Host connectivity reporting

mod monitor;

pub use monitor::{
    connectivity_channel, Connectivity, ConnectivityMonitor, ConnectivityReporter, NetworkStatus,
};
