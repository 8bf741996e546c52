//! Connection and polling configuration.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::DEFAULT_HISTORY_CAPACITY;

/// Environment variable holding the oven address for the CLI.
pub const ADDR_ENV: &str = "REFLOW_OVEN_ADDR";
pub const CONNECT_TIMEOUT_ENV: &str = "REFLOW_CONNECT_TIMEOUT_MS";
pub const POLL_INTERVAL_ENV: &str = "REFLOW_POLL_INTERVAL_MS";

const DEFAULT_HOST: &str = "192.168.1.100";
const DEFAULT_PORT: u16 = 8080;

/// Where the oven controller listens.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct OvenAddress {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("expected host:port, got {0:?}")]
    MissingPort(String),

    #[error("invalid port in {0:?}")]
    InvalidPort(String),

    #[error("empty host in {0:?}")]
    EmptyHost(String),
}

impl OvenAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Read from `REFLOW_OVEN_ADDR`, falling back to the default address.
    pub fn from_env() -> Result<Self, AddressError> {
        match env::var(ADDR_ENV) {
            Ok(value) => value.parse(),
            Err(_) => Ok(Self::default()),
        }
    }
}

impl Default for OvenAddress {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl FromStr for OvenAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressError::MissingPort(s.to_string()))?;
        // IPv6 literals come bracketed: [::1]:8080
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(AddressError::EmptyHost(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| AddressError::InvalidPort(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for OvenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Tunables for the device client and the engine.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upper bound on TCP connection establishment.
    pub connect_timeout: Duration,

    /// Delay between status polls.
    pub poll_interval: Duration,

    /// How long a poll waits for the device to answer `STATUS?` before
    /// giving up on that cycle.
    pub response_window: Duration,

    /// Longest inbound line accepted before the session is treated as
    /// faulted.
    pub max_line_length: usize,

    /// Samples kept in the temperature history.
    pub history_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            response_window: Duration::from_millis(500),
            max_line_length: 1024,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `REFLOW_CONNECT_TIMEOUT_MS` and
    /// `REFLOW_POLL_INTERVAL_MS` when set.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(ms) = lookup(CONNECT_TIMEOUT_ENV).and_then(|v| v.trim().parse().ok()) {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = lookup(POLL_INTERVAL_ENV).and_then(|v| v.trim().parse().ok()) {
            config.poll_interval = Duration::from_millis(ms);
        }
        config
    }
}
