use crate::error::{Error, Result};
use crate::types::ConflictPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Per-appliance configuration
///
/// Every tunable has a default, so the smallest useful document names a model
/// and one transport:
///
/// ```json
/// { "model": "ecam-espresso", "local": { "host": "192.168.1.40" } }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Profile model identifier
    pub model: String,
    /// Display name for logs
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub local: Option<LocalConfig>,
    #[serde(default)]
    pub cloud: Option<CloudConfig>,
    /// Try the cloud relay before the LAN socket
    #[serde(default)]
    pub prefer_cloud: bool,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub commands: DispatchConfig,
}

impl DeviceConfig {
    /// Configuration for a LAN-only appliance with default tunables
    pub fn local(model: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            name: None,
            local: Some(LocalConfig {
                host: host.into(),
                port: None,
                connect_timeout_ms: default_local_connect_timeout(),
            }),
            cloud: None,
            prefer_cloud: false,
            session: SessionConfig::default(),
            commands: DispatchConfig::default(),
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Reject settings that would make the session unusable
    pub fn validate(&self) -> Result<()> {
        if self.local.is_none() && self.cloud.is_none() {
            return Err(Error::Config(format!(
                "device '{}' has neither a local nor a cloud transport",
                self.display_name()
            )));
        }
        let session = &self.session;
        if session.keepalive_interval_ms == 0 {
            return Err(Error::Config("keepalive_interval_ms must be positive".into()));
        }
        if session.degraded_after == 0 || session.disconnect_after <= session.degraded_after {
            return Err(Error::Config(
                "disconnect_after must be greater than degraded_after, which must be positive".into(),
            ));
        }
        if session.reconnect.initial_delay_ms > session.reconnect.max_delay_ms {
            return Err(Error::Config("initial_delay_ms exceeds max_delay_ms".into()));
        }
        if self.commands.ack_timeout_ms == 0 {
            return Err(Error::Config("ack_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.model)
    }
}

/// Direct LAN socket to the appliance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    pub host: String,
    /// Falls back to the port declared in the profile
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_local_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl LocalConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Vendor cloud relay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    /// WebSocket endpoint, `wss://...`
    pub url: String,
    /// Appliance identifier known to the relay
    pub device_id: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_cloud_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl CloudConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Handshake, keepalive and reconnect tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_ms: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    /// Consecutive unanswered probes before the session is flagged degraded
    #[serde(default = "default_degraded_after")]
    pub degraded_after: u32,
    /// Consecutive unanswered probes before the session is dropped
    #[serde(default = "default_disconnect_after")]
    pub disconnect_after: u32,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl SessionConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: default_keepalive_interval(),
            handshake_timeout_ms: default_handshake_timeout(),
            degraded_after: default_degraded_after(),
            disconnect_after: default_disconnect_after(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Exponential backoff between connection attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Consecutive failed attempts before giving up. `None` retries forever.
    #[serde(default)]
    pub retry_budget: Option<u32>,
}

impl ReconnectConfig {
    /// Delay before retry number `attempt` (0-based): `initial * 2^attempt`, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(
            self.initial_delay_ms
                .saturating_mul(factor)
                .min(self.max_delay_ms),
        )
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            retry_budget: None,
        }
    }
}

/// Command acknowledgement and retry tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,
    /// Resends after the first attempt times out
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Policy used by `send_command`
    #[serde(default)]
    pub conflict: ConflictPolicy,
}

impl DispatchConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout(),
            max_retries: default_max_retries(),
            conflict: ConflictPolicy::default(),
        }
    }
}

fn default_local_connect_timeout() -> u64 {
    3000
}

fn default_cloud_connect_timeout() -> u64 {
    10000
}

fn default_keepalive_interval() -> u64 {
    5000
}

fn default_handshake_timeout() -> u64 {
    5000
}

fn default_degraded_after() -> u32 {
    2
}

fn default_disconnect_after() -> u32 {
    3
}

fn default_initial_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    60000
}

fn default_ack_timeout() -> u64 {
    3000
}

fn default_max_retries() -> u32 {
    2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_document_gets_defaults() {
        let config =
            DeviceConfig::from_json(r#"{ "model": "ecam-espresso", "local": { "host": "10.0.0.5" } }"#)
                .unwrap();
        assert_eq!(config.session.keepalive_interval_ms, 5000);
        assert_eq!(config.session.degraded_after, 2);
        assert_eq!(config.session.disconnect_after, 3);
        assert_eq!(config.session.reconnect.retry_budget, None);
        assert_eq!(config.commands.max_retries, 2);
        assert_eq!(config.commands.conflict, ConflictPolicy::Queue);
        assert_eq!(config.local.unwrap().connect_timeout_ms, 3000);
    }

    #[test]
    fn test_requires_a_transport() {
        let err = DeviceConfig::from_json(r#"{ "model": "ecam-espresso" }"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let reconnect = ReconnectConfig {
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            retry_budget: Some(5),
        };
        assert_eq!(reconnect.backoff(0), Duration::from_millis(100));
        assert_eq!(reconnect.backoff(1), Duration::from_millis(200));
        assert_eq!(reconnect.backoff(3), Duration::from_millis(800));
        assert_eq!(reconnect.backoff(4), Duration::from_millis(1000));
        assert_eq!(reconnect.backoff(80), Duration::from_millis(1000));
    }

    #[test]
    fn test_conflict_policy_parses() {
        let config = DeviceConfig::from_json(
            r#"{ "model": "m", "cloud": { "url": "wss://relay", "device_id": "d" },
                 "commands": { "conflict": "supersede" } }"#,
        )
        .unwrap();
        assert_eq!(config.commands.conflict, ConflictPolicy::Supersede);
        assert_eq!(config.commands.ack_timeout_ms, 3000);
    }
}
