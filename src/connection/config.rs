//! Connection configuration

use std::time::Duration;
use switchback_shared::{defaults, state_machine::UpgradePolicy};

/// Configuration for the connection manager
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Opaque credential attached to every handshake
    pub credential: Option<String>,
    /// Namespace path sent in the handshake
    pub path: String,
    /// Wait after a reliable connect before trying the persistent transport
    pub upgrade_delay: Duration,
    /// Budget for one upgrade attempt
    pub confirm_timeout: Duration,
    /// Failed upgrades tolerated before committing to the reliable transport
    pub max_upgrade_attempts: u32,
    /// Reconnection delay (initial)
    pub reconnect_delay: Duration,
    /// Maximum reconnection delay
    pub max_reconnect_delay: Duration,
    /// Connection timeout, per transport
    pub connect_timeout: Duration,
    /// Client ping interval on the persistent transport
    pub heartbeat_interval: Duration,
    /// Read timeout (should be > heartbeat interval)
    pub read_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            credential: None,
            path: defaults::PATH.into(),
            upgrade_delay: Duration::from_millis(defaults::UPGRADE_DELAY_MS),
            confirm_timeout: Duration::from_millis(defaults::UPGRADE_CONFIRM_TIMEOUT_MS),
            max_upgrade_attempts: defaults::MAX_UPGRADE_ATTEMPTS,
            reconnect_delay: Duration::from_millis(defaults::RECONNECT_DELAY_MS),
            max_reconnect_delay: Duration::from_millis(defaults::MAX_RECONNECT_DELAY_MS),
            connect_timeout: Duration::from_millis(defaults::CONNECT_TIMEOUT_MS),
            heartbeat_interval: Duration::from_millis(defaults::HEARTBEAT_INTERVAL_MS),
            read_timeout: Duration::from_millis(defaults::READ_TIMEOUT_MS),
        }
    }
}

impl ConnectionConfig {
    /// Defaults overridden by `SWITCHBACK_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    /// Values that fail to parse keep the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let millis = |key: &str| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
        };

        if let Some(credential) = lookup("SWITCHBACK_CREDENTIAL").filter(|v| !v.is_empty()) {
            config.credential = Some(credential);
        }
        if let Some(path) = lookup("SWITCHBACK_PATH").filter(|v| !v.is_empty()) {
            config.path = path;
        }
        if let Some(v) = millis("SWITCHBACK_UPGRADE_DELAY_MS") {
            config.upgrade_delay = v;
        }
        if let Some(v) = millis("SWITCHBACK_CONFIRM_TIMEOUT_MS") {
            config.confirm_timeout = v;
        }
        if let Some(v) = lookup("SWITCHBACK_MAX_UPGRADE_ATTEMPTS")
            .and_then(|v| v.trim().parse::<u32>().ok())
        {
            config.max_upgrade_attempts = v;
        }
        if let Some(v) = millis("SWITCHBACK_RECONNECT_DELAY_MS") {
            config.reconnect_delay = v;
        }
        if let Some(v) = millis("SWITCHBACK_MAX_RECONNECT_DELAY_MS") {
            config.max_reconnect_delay = v;
        }
        if let Some(v) = millis("SWITCHBACK_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = v;
        }
        if let Some(v) = millis("SWITCHBACK_HEARTBEAT_INTERVAL_MS") {
            config.heartbeat_interval = v;
        }
        if let Some(v) = millis("SWITCHBACK_READ_TIMEOUT_MS") {
            config.read_timeout = v;
        }

        config
    }

    /// The state machine's share of the configuration
    pub fn policy(&self) -> UpgradePolicy {
        UpgradePolicy {
            upgrade_delay: self.upgrade_delay,
            confirm_timeout: self.confirm_timeout,
            max_upgrade_attempts: self.max_upgrade_attempts,
            reconnect_delay: self.reconnect_delay,
            max_reconnect_delay: self.max_reconnect_delay.max(self.reconnect_delay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.credential, None);
        assert_eq!(config.path, "/realtime");
        assert_eq!(config.upgrade_delay, Duration::from_secs(1));
        assert_eq!(config.confirm_timeout, Duration::from_secs(5));
        assert_eq!(config.max_upgrade_attempts, 3);
        assert!(config.read_timeout > config.heartbeat_interval);
        assert_eq!(config.policy(), UpgradePolicy::default());
    }

    #[test]
    fn test_lookup_overrides() {
        let config = ConnectionConfig::from_lookup(lookup(&[
            ("SWITCHBACK_CREDENTIAL", "tok"),
            ("SWITCHBACK_PATH", "/chat"),
            ("SWITCHBACK_UPGRADE_DELAY_MS", "250"),
            ("SWITCHBACK_MAX_UPGRADE_ATTEMPTS", "0"),
            ("SWITCHBACK_READ_TIMEOUT_MS", " 30000 "),
        ]));

        assert_eq!(config.credential.as_deref(), Some("tok"));
        assert_eq!(config.path, "/chat");
        assert_eq!(config.upgrade_delay, Duration::from_millis(250));
        assert_eq!(config.max_upgrade_attempts, 0);
        assert_eq!(config.read_timeout, Duration::from_secs(30));
        assert_eq!(config.confirm_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_unparseable_values_keep_defaults() {
        let config = ConnectionConfig::from_lookup(lookup(&[
            ("SWITCHBACK_CONFIRM_TIMEOUT_MS", "soon"),
            ("SWITCHBACK_MAX_UPGRADE_ATTEMPTS", "-1"),
            ("SWITCHBACK_CREDENTIAL", ""),
        ]));
        assert_eq!(config, ConnectionConfig::default());
    }

    #[test]
    fn test_policy_ceiling_never_below_first_step() {
        let config = ConnectionConfig {
            reconnect_delay: Duration::from_secs(10),
            max_reconnect_delay: Duration::from_secs(2),
            ..Default::default()
        };
        assert_eq!(config.policy().backoff(1), Duration::from_secs(10));
    }
}
