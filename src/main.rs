use switchback::{
    connectivity_channel, Connectivity, ConnectionConfig, ConnectionEvent, ConnectionManager,
    ConnectivityReporter,
};
use tokio::io::{AsyncBufReadExt, BufReader};

use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_ENDPOINT: &str = "127.0.0.1:8080";

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let endpoint =
        std::env::var("SWITCHBACK_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.into());
    let config = ConnectionConfig::from_env();

    info!("Switchback client starting");
    info!("  endpoint: {}", endpoint);
    info!("  path: {}", config.path);
    info!(
        "  upgrade: delay={:?} confirm={:?} attempts={}",
        config.upgrade_delay, config.confirm_timeout, config.max_upgrade_attempts
    );

    let (reporter, connectivity) = connectivity_channel(Connectivity::Online);
    let mut conn = ConnectionManager::create(endpoint, config, connectivity);

    if let Err(e) = conn.connect() {
        error!("Failed to start connecting: {}", e);
        return;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    // Main event loop
    loop {
        tokio::select! {
            event = conn.recv() => match event {
                Some(ConnectionEvent::Connected { transport }) => {
                    info!("Connected via {}", transport);
                }
                Some(ConnectionEvent::Disconnected { reason }) => {
                    warn!("Disconnected: {}", reason);
                }
                Some(ConnectionEvent::Upgraded) => {
                    info!("Upgraded to persistent transport");
                }
                Some(ConnectionEvent::Degraded) => {
                    warn!("Staying on reliable transport for this session");
                }
                Some(ConnectionEvent::Received { event, payload }) => {
                    info!(
                        "<- {} ({} bytes): {}",
                        event,
                        payload.len(),
                        String::from_utf8_lossy(&payload)
                    );
                }
                None => {
                    error!("Connection manager closed");
                    break;
                }
            },

            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !handle_command(line.trim(), &conn, &reporter).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("stdin: {}", e);
                    break;
                }
            },
        }
    }

    conn.shutdown().await;
    info!("Switchback client stopped");
}

/// Returns false when the client should exit
async fn handle_command(
    line: &str,
    conn: &ConnectionManager,
    reporter: &ConnectivityReporter,
) -> bool {
    let mut parts = line.splitn(3, ' ');
    let command = parts.next().unwrap_or_default();

    let result = match command {
        "" => Ok(()),
        "send" => {
            let event = parts.next().unwrap_or("message").to_string();
            let payload = parts.next().unwrap_or_default().as_bytes().to_vec();
            conn.send(event, payload).await
        }
        "connect" => conn.connect(),
        "disconnect" => conn.disconnect(),
        "online" => {
            reporter.report(Connectivity::Online);
            Ok(())
        }
        "offline" => {
            reporter.report(Connectivity::Offline);
            Ok(())
        }
        "status" => {
            let status = conn.state();
            info!(
                "{:?} on {:?}, preference {}, {} failed upgrades{}",
                status.state,
                status.transport,
                status.preference,
                status.upgrade_failures,
                if status.degraded { " (degraded)" } else { "" }
            );
            Ok(())
        }
        "quit" | "exit" => return false,
        other => {
            warn!(
                "unknown command {:?} (send, connect, disconnect, online, offline, status, quit)",
                other
            );
            Ok(())
        }
    };

    if let Err(e) = result {
        warn!("{}: {}", command, e);
    } else {
        debug!("{} ok", command);
    }
    true
}
