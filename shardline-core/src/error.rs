//! Error types for client operations

use std::io;
use thiserror::Error;

/// Result type for client operations
pub type RedisResult<T> = Result<T, RedisError>;

/// Error type shared by every layer of the client
#[derive(Error, Debug)]
pub enum RedisError {
    /// IO error during network operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Malformed framing or an unexpected type tag
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server returned an error reply
    #[error("Server error: {0}")]
    Server(String),

    /// MOVED redirect in cluster mode
    #[error("MOVED redirect: slot {slot} to {host}:{port}")]
    Moved {
        /// Slot number that was moved
        slot: u16,
        /// Target host
        host: String,
        /// Target port
        port: u16,
    },

    /// ASK redirect in cluster mode
    #[error("ASK redirect: slot {slot} to {host}:{port}")]
    Ask {
        /// Slot number for temporary redirect
        slot: u16,
        /// Target host
        host: String,
        /// Target port
        port: u16,
    },

    /// Connection refused, reset or closed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// Type conversion error
    #[error("Type conversion error: {0}")]
    Type(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Cluster routing error
    #[error("Cluster error: {0}")]
    Cluster(String),

    /// No node in the topology owns the slot
    #[error("No nodes found for slot {0}")]
    SlotNotCovered(u16),

    /// Every seed failed to report the cluster topology
    #[error("Failed to reload cluster configuration: {0}")]
    ReloadFailed(String),

    /// Sentinel resolution error
    #[error("Sentinel error: {0}")]
    Sentinel(String),

    /// Authentication error
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Pool error
    #[error("Pool error: {0}")]
    Pool(String),

    /// Aggregate subscription failure
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Unexpected response from server
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl RedisError {
    /// Parse a server error message to check for MOVED or ASK redirects
    pub fn parse_redirect(msg: &str) -> Option<Self> {
        // "MOVED 9916 10.90.6.213:6002" / "ASK 9916 10.90.6.213:6002"
        let (moved, rest) = if let Some(rest) = msg.strip_prefix("MOVED ") {
            (true, rest)
        } else if let Some(rest) = msg.strip_prefix("ASK ") {
            (false, rest)
        } else {
            return None;
        };

        let mut parts = rest.split_whitespace();
        let slot = parts.next()?.parse::<u16>().ok()?;
        let (host, port) = parts.next()?.rsplit_once(':')?;
        let port = port.parse::<u16>().ok()?;
        if parts.next().is_some() {
            return None;
        }

        let host = host.to_string();
        Some(if moved {
            RedisError::Moved { slot, host, port }
        } else {
            RedisError::Ask { slot, host, port }
        })
    }

    /// Turn a server error reply into the matching error
    pub fn from_reply(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        Self::parse_redirect(&msg).unwrap_or(RedisError::Server(msg))
    }

    /// Check if this error is a redirect (MOVED or ASK)
    pub fn is_redirect(&self) -> bool {
        matches!(self, RedisError::Moved { .. } | RedisError::Ask { .. })
    }

    /// Whether the peer could not be reached or went away.
    ///
    /// Seed and sentinel scans move on to the next candidate on these.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            RedisError::Io(_) | RedisError::Connection(_) | RedisError::Timeout
        )
    }

    /// Get the target address from a redirect error
    pub fn redirect_target(&self) -> Option<(String, u16)> {
        match self {
            RedisError::Moved { host, port, .. } | RedisError::Ask { host, port, .. } => {
                Some((host.clone(), *port))
            }
            _ => None,
        }
    }

    /// Get the slot number from a redirect error
    pub fn redirect_slot(&self) -> Option<u16> {
        match self {
            RedisError::Moved { slot, .. } | RedisError::Ask { slot, .. } => Some(*slot),
            _ => None,
        }
    }
}
