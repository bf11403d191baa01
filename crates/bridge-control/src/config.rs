//! Bridge configuration

use serde::Deserialize;
use std::time::Duration;

/// Runtime settings for a [`Bridge`](crate::Bridge)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Address the agent listener binds to
    pub listen_addr: String,

    /// Strict mode: latest protocol only, timestamp window, HMAC and replay
    /// checks enforced, and no error flag sent on failed authentication
    pub secure_mode: bool,

    /// Require the user's IP to be registered before links are opened
    pub ip_verify: bool,

    /// Idle timeout handed to every tunnel/file multiplexer
    #[serde(with = "secs")]
    pub mux_idle_timeout: Duration,

    /// Bound on reads before the agent's credential is checked
    #[serde(with = "secs")]
    pub handshake_timeout: Duration,

    /// Bound on reads after the version echo, until a role is assigned
    #[serde(with = "secs")]
    pub auth_read_timeout: Duration,

    /// Timestamp window and replay-cache lifetime
    #[serde(with = "secs")]
    pub replay_ttl: Duration,

    #[serde(with = "secs")]
    pub liveness_interval: Duration,

    /// Consecutive failed liveness checks before eviction
    pub max_liveness_retries: u32,

    /// UDP rendezvous address sent to agents for P2P
    pub p2p_addr: Option<String>,

    /// Capacity of the open-task, close-client and secret queues
    pub queue_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8024".to_string(),
            secure_mode: false,
            ip_verify: false,
            mux_idle_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(5),
            auth_read_timeout: Duration::from_secs(5),
            replay_ttl: Duration::from_secs(30),
            liveness_interval: Duration::from_secs(5),
            max_liveness_retries: 3,
            p2p_addr: None,
            queue_capacity: 100,
        }
    }
}

impl BridgeConfig {
    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    pub fn with_secure_mode(mut self, secure_mode: bool) -> Self {
        self.secure_mode = secure_mode;
        self
    }

    pub fn with_ip_verify(mut self, ip_verify: bool) -> Self {
        self.ip_verify = ip_verify;
        self
    }

    pub fn with_p2p_addr(mut self, addr: impl Into<String>) -> Self {
        self.p2p_addr = Some(addr.into());
        self
    }
}

mod secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
