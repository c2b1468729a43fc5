use std::time::Duration;

use arsock_protocol::Result;
use serde::Deserialize;

pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 1000;

/// Transport security material, handed to the transport untouched.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SecurityKeys {
    pub public_key: Option<String>,
    pub secret_key: Option<String>,
    pub peer_public_key: Option<String>,
}

impl SecurityKeys {
    /// The three keys, only when every one of them is supplied.
    pub fn complete(&self) -> Option<(&str, &str, &str)> {
        match (&self.public_key, &self.secret_key, &self.peer_public_key) {
            (Some(public), Some(secret), Some(peer)) => {
                Some((public.as_str(), secret.as_str(), peer.as_str()))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub send_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
    pub security: Option<SecurityKeys>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        SocketConfig {
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            keepalive_interval_ms: DEFAULT_KEEPALIVE_INTERVAL_MS,
            security: None,
        }
    }
}

impl SocketConfig {
    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
}
