//! Link descriptor written at the head of every virtual stream

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transport a link carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnType {
    #[default]
    Tcp,
    Udp,
    File,
}

impl fmt::Display for ConnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnType::Tcp => write!(f, "tcp"),
            ConnType::Udp => write!(f, "udp"),
            ConnType::File => write!(f, "file"),
        }
    }
}

/// Per-link options forwarded to the agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LinkOptions {
    /// Dial timeout on the agent side, in seconds (0 = agent default)
    #[serde(default)]
    pub timeout_secs: u64,
}

/// A request to open one virtual stream toward `host` through an agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Link {
    pub conn_type: ConnType,
    pub host: String,
    #[serde(default)]
    pub crypt: bool,
    #[serde(default)]
    pub compress: bool,
    /// Dial `host` from the bridge itself instead of through the agent
    #[serde(default)]
    pub local_proxy: bool,
    /// Address of the user whose request produced this link
    #[serde(default)]
    pub remote_addr: String,
    #[serde(default)]
    pub option: LinkOptions,
}

impl Link {
    pub fn new(conn_type: ConnType, host: impl Into<String>) -> Self {
        Self {
            conn_type,
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn with_crypt(mut self, crypt: bool) -> Self {
        self.crypt = crypt;
        self
    }

    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_local_proxy(mut self, local_proxy: bool) -> Self {
        self.local_proxy = local_proxy;
        self
    }

    pub fn with_remote_addr(mut self, remote_addr: impl Into<String>) -> Self {
        self.remote_addr = remote_addr.into();
        self
    }
}
