//! TOML dotfile configuration.
//!
//! Every section and key is optional:
//!
//! ```toml
//! [net]
//! timeout = 3000
//! retries = 3
//! iceServer = "stun:stun2.l.google.com:19302"
//! peerbook = "pb.terminal7.dev"
//!
//! [ui]
//! max_tabs = 3
//!
//! [peerbook]
//! email = "me@example.com"
//! peer_name = "laptop"
//! fingerprint = "..."
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::messenger::RetryPolicy;
use crate::signaling::RendezvousConfig;

pub const DEFAULT_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_ICE_SERVER: &str = "stun:stun2.l.google.com:19302";
pub const DEFAULT_PEERBOOK: &str = "pb.terminal7.dev";
pub const DEFAULT_MAX_TABS: usize = 3;
pub const DEFAULT_PEER_KIND: &str = "terminal7";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub net: NetConfig,
    pub ui: UiConfig,
    pub peerbook: PeerbookConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Milliseconds before an unacknowledged control message is resent.
    pub timeout: u64,
    pub retries: u32,
    #[serde(alias = "iceServer")]
    pub ice_server: String,
    pub peerbook: String,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT_MS,
            retries: DEFAULT_RETRIES,
            ice_server: DEFAULT_ICE_SERVER.to_string(),
            peerbook: DEFAULT_PEERBOOK.to_string(),
        }
    }
}

impl NetConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(self.timeout),
            retries: self.retries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub max_tabs: usize,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            max_tabs: DEFAULT_MAX_TABS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PeerbookConfig {
    pub email: Option<String>,
    pub peer_name: Option<String>,
    pub fingerprint: Option<String>,
    pub kind: String,
}

impl Default for PeerbookConfig {
    fn default() -> Self {
        Self {
            email: None,
            peer_name: None,
            fingerprint: None,
            kind: DEFAULT_PEER_KIND.to_string(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(text)?;
        config.normalize();
        Ok(config)
    }

    /// Applies `GANGWAY_*` overrides. Unparsable numbers are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(timeout) = lookup("GANGWAY_NET_TIMEOUT").and_then(|v| v.trim().parse().ok()) {
            self.net.timeout = timeout;
        }
        if let Some(retries) = lookup("GANGWAY_NET_RETRIES").and_then(|v| v.trim().parse().ok()) {
            self.net.retries = retries;
        }
        if let Some(ice_server) = lookup("GANGWAY_ICE_SERVER").filter(|v| !v.is_empty()) {
            self.net.ice_server = ice_server;
        }
        if let Some(peerbook) = lookup("GANGWAY_PEERBOOK").filter(|v| !v.is_empty()) {
            self.net.peerbook = peerbook;
        }
        self.normalize();
    }

    fn normalize(&mut self) {
        if self.net.timeout == 0 {
            self.net.timeout = DEFAULT_TIMEOUT_MS;
        }
        if self.net.retries == 0 {
            self.net.retries = DEFAULT_RETRIES;
        }
        if self.ui.max_tabs == 0 {
            self.ui.max_tabs = DEFAULT_MAX_TABS;
        }
    }

    /// Rendezvous identity, when an email and a fingerprint are configured.
    pub fn rendezvous(&self) -> Option<RendezvousConfig> {
        let email = self.peerbook.email.clone().filter(|e| !e.is_empty())?;
        let fingerprint = self.peerbook.fingerprint.clone().filter(|f| !f.is_empty())?;
        Some(RendezvousConfig {
            host: self.net.peerbook.clone(),
            fingerprint,
            name: self.peerbook.peer_name.clone().unwrap_or_else(|| "gangway".to_string()),
            kind: self.peerbook.kind.clone(),
            email,
        })
    }
}
