//! Network Availability Monitor
//!
//! Watches host-reported connectivity and calls back when the network comes
//! back. It never connects anything itself; the callback decides.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

/// Value carried by the connectivity channel.
///
/// A watch channel keeps only the latest value, so an `Offline -> Online`
/// flap reported between two wakeups of a reader would look like no change
/// at all. `restores` counts every such edge so none is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStatus {
    pub connectivity: Connectivity,
    /// `Offline -> Online` edges reported so far
    pub restores: u64,
}

/// Host side of the connectivity channel
#[derive(Debug)]
pub struct ConnectivityReporter {
    tx: watch::Sender<NetworkStatus>,
}

impl ConnectivityReporter {
    /// Publish the current connectivity. Repeats of the same value are dropped.
    pub fn report(&self, connectivity: Connectivity) {
        self.tx.send_if_modified(|status| {
            if status.connectivity == connectivity {
                return false;
            }
            if connectivity == Connectivity::Online {
                status.restores += 1;
            }
            status.connectivity = connectivity;
            true
        });
    }

    pub fn current(&self) -> Connectivity {
        self.tx.borrow().connectivity
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }
}

/// Create a connectivity channel starting at `initial`
pub fn connectivity_channel(
    initial: Connectivity,
) -> (ConnectivityReporter, watch::Receiver<NetworkStatus>) {
    let (tx, rx) = watch::channel(NetworkStatus {
        connectivity: initial,
        restores: 0,
    });
    (ConnectivityReporter { tx }, rx)
}

/// Background task turning `Offline -> Online` edges into callbacks
#[derive(Debug)]
pub struct ConnectivityMonitor {
    task: JoinHandle<()>,
}

impl ConnectivityMonitor {
    /// Start watching. Edges reported before the call are not replayed.
    /// `on_restored` returns false once nobody is listening, which ends the
    /// task.
    pub fn spawn<F>(mut rx: watch::Receiver<NetworkStatus>, on_restored: F) -> Self
    where
        F: Fn() -> bool + Send + 'static,
    {
        let mut seen = rx.borrow_and_update().restores;
        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let status = *rx.borrow_and_update();
                debug!("connectivity now {:?}", status.connectivity);

                // Several edges merged into one wakeup still mean one retry
                if status.restores > seen {
                    seen = status.restores;
                    info!("network connectivity restored");
                    if !on_restored() {
                        break;
                    }
                }
            }
        });

        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
