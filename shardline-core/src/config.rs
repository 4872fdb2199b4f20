//! Configuration types for connections, pools and clusters

use crate::types::Endpoint;
use std::time::Duration;

/// Configuration for connection pooling
#[derive(Debug, Clone, Default)]
pub struct PoolConfig {
    /// Upper bound on leased plus idle connections; `None` is unbounded.
    /// A pool treats zero as one.
    pub limit: Option<usize>,
}

impl PoolConfig {
    /// Pool holding at most `limit` connections
    #[must_use]
    pub const fn with_limit(limit: usize) -> Self {
        Self { limit: Some(limit) }
    }
}

/// Configuration for a single-node connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for establishing the TCP connection
    pub connect_timeout: Duration,

    /// Enable TCP keepalive
    pub tcp_keepalive: Option<Duration>,

    /// Disable Nagle's algorithm
    pub nodelay: bool,

    /// Pool configuration
    pub pool: PoolConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            tcp_keepalive: Some(Duration::from_secs(60)),
            nodelay: true,
            pool: PoolConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection timeout
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set or disable TCP keepalive
    #[must_use]
    pub const fn with_tcp_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.tcp_keepalive = keepalive;
        self
    }

    /// Toggle `TCP_NODELAY`
    #[must_use]
    pub const fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Set the pool configuration
    #[must_use]
    pub const fn with_pool_config(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Limit the number of pooled connections
    #[must_use]
    pub const fn with_pool_limit(mut self, limit: usize) -> Self {
        self.pool = PoolConfig::with_limit(limit);
        self
    }
}

/// Configuration for a cluster client
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Seed nodes queried for the topology, in order
    pub seeds: Vec<Endpoint>,

    /// Settings for every per-node connection
    pub connection: ConnectionConfig,

    /// Attempts for a command that keeps hitting MOVED/ASK
    pub max_attempts: usize,

    /// Capacity of the sharded subscription queue
    pub queue_capacity: usize,
}

impl ClusterConfig {
    /// Create a configuration for the given seeds
    pub fn new(seeds: impl IntoIterator<Item = Endpoint>) -> Self {
        Self {
            seeds: seeds.into_iter().collect(),
            connection: ConnectionConfig::default(),
            max_attempts: 3,
            queue_capacity: 64,
        }
    }

    /// Set the per-node connection settings
    #[must_use]
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Set the redirect attempt budget
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the sharded subscription queue capacity
    #[must_use]
    pub const fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}
