//! Node configuration.
//!
//! This module loads configuration for a Lagrange node from environment
//! variables.
//!
//! # Environment Variables
//!
//! - `LAGRANGE_LISTEN_ADDRESS`: `host:port` for the TCP transport (default: `127.0.0.1:3200`)
//! - `LAGRANGE_EXISTING_NODE`: address of a running node to join (optional)
//! - `LAGRANGE_LATENCY_ZONE`: latency zone of this node (optional, probed on join)
//! - `LAGRANGE_REPLICATION_FACTOR`: members per replicated group (default: `3`)
//! - `LAGRANGE_RQLITE_URL`: rqlite HTTP endpoint (optional, embedded SQLite otherwise)
//! - `LAGRANGE_HOUSEKEEPING_MS`: housekeeping tick in milliseconds (default: `5000`)
//!
//! # Invariants
//!
//! - `replication_factor` is at least 1
//! - `messaging.housekeeping_interval` is non-zero

use std::time::Duration;

/// Tuning for the messaging layer and its message group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessagingConfig {
    /// Retransmissions before an unacknowledged message is dropped.
    pub max_resends: u32,
    /// Age after which an unacknowledged message is retransmitted.
    pub resend_age: Duration,
    /// Period of the message group's housekeeping tick.
    pub housekeeping_interval: Duration,
    /// How long [`send_rpc`](crate::messaging::MessagingLayer::send_rpc)
    /// waits for the reply.
    pub rpc_timeout: Duration,
}

impl MessagingConfig {
    pub const DEFAULT_MAX_RESENDS: u32 = 5;
    pub const DEFAULT_RESEND_AGE: Duration = Duration::from_millis(1000);
    pub const DEFAULT_HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(5000);
    pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            max_resends: Self::DEFAULT_MAX_RESENDS,
            resend_age: Self::DEFAULT_RESEND_AGE,
            housekeeping_interval: Self::DEFAULT_HOUSEKEEPING_INTERVAL,
            rpc_timeout: Self::DEFAULT_RPC_TIMEOUT,
        }
    }
}

/// Node configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub listen_address: String,
    pub existing_node: Option<String>,
    /// `None` lets a joining node pick the closest zone by ping.
    pub latency_zone: Option<String>,
    pub replication_factor: usize,
    pub rqlite_url: Option<String>,
    pub messaging: MessagingConfig,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl NodeConfig {
    pub const DEFAULT_LISTEN_ADDRESS: &'static str = "127.0.0.1:3200";
    pub const DEFAULT_LATENCY_ZONE: &'static str = "default";
    pub const DEFAULT_REPLICATION_FACTOR: usize = 3;

    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to a value that does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns the value of a
    /// variable if it is set. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let replication_factor = match get("LAGRANGE_REPLICATION_FACTOR") {
            Some(value) => match value.parse::<usize>() {
                Ok(n) if n >= 1 => n,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        name: "LAGRANGE_REPLICATION_FACTOR".to_string(),
                        message: format!("'{value}' is not a positive integer"),
                    });
                }
            },
            None => Self::DEFAULT_REPLICATION_FACTOR,
        };

        let housekeeping_interval = match get("LAGRANGE_HOUSEKEEPING_MS") {
            Some(value) => match value.parse::<u64>() {
                Ok(ms) if ms > 0 => Duration::from_millis(ms),
                _ => {
                    return Err(ConfigError::InvalidValue {
                        name: "LAGRANGE_HOUSEKEEPING_MS".to_string(),
                        message: format!("'{value}' is not a positive number of milliseconds"),
                    });
                }
            },
            None => MessagingConfig::DEFAULT_HOUSEKEEPING_INTERVAL,
        };

        let listen_address = get("LAGRANGE_LISTEN_ADDRESS")
            .unwrap_or_else(|| Self::DEFAULT_LISTEN_ADDRESS.to_string());
        if !listen_address.contains(':') {
            return Err(ConfigError::InvalidValue {
                name: "LAGRANGE_LISTEN_ADDRESS".to_string(),
                message: format!("'{listen_address}' is not a host:port pair"),
            });
        }

        Ok(Self {
            listen_address,
            existing_node: get("LAGRANGE_EXISTING_NODE"),
            latency_zone: get("LAGRANGE_LATENCY_ZONE"),
            replication_factor,
            rqlite_url: get("LAGRANGE_RQLITE_URL"),
            messaging: MessagingConfig {
                housekeeping_interval,
                ..MessagingConfig::default()
            },
        })
    }
}
