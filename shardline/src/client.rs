//! Single-node client
//!
//! [`Client`] is a cheap-to-clone handle over one connection [`Pool`]. Every
//! command leases a connection for its duration; execution contexts keep
//! their lease until they are closed.

use crate::connection::{Connector, TcpConnector};
use crate::pipeline::Pipeline;
use crate::pool::{Pool, PoolStatus, PooledConnection};
use crate::pubsub::Subscription;
use crate::transaction::Transaction;
use shardline_core::{
    config::{ConnectionConfig, PoolConfig},
    error::RedisResult,
    types::{Command, Endpoint, ToArg},
    value::RespValue,
};
use std::sync::Arc;

/// Client for a single server (or a sentinel-managed primary)
#[derive(Clone, Debug)]
pub struct Client {
    pool: Arc<Pool>,
}

impl Client {
    /// Client for `endpoint` over plain TCP
    ///
    /// No connection is opened until the first command.
    pub fn new(endpoint: Endpoint, config: ConnectionConfig) -> Self {
        let pool = config.pool.clone();
        Self::with_connector(Arc::new(TcpConnector::new(endpoint, config)), pool)
    }

    /// Client whose connections come from a custom connector
    pub fn with_connector(connector: Arc<dyn Connector>, pool: PoolConfig) -> Self {
        Self {
            pool: Pool::new(connector, pool),
        }
    }

    /// Lease a raw connection
    pub async fn acquire(&self) -> RedisResult<PooledConnection> {
        self.pool.acquire().await
    }

    /// Execute one command.
    ///
    /// Error replies are raised: redirects as `Moved`/`Ask`, anything else
    /// as `Server`.
    pub async fn call(&self, command: &Command) -> RedisResult<RespValue> {
        let mut lease = self.acquire().await?;
        let reply = lease.call(command).await;
        lease.release();
        reply
    }

    /// Start a pipeline on a dedicated connection
    pub async fn pipeline(&self) -> RedisResult<Pipeline> {
        Ok(Pipeline::new(self.acquire().await?))
    }

    /// Start a transaction; `MULTI` is issued on entry
    pub async fn transaction(&self) -> RedisResult<Transaction> {
        let mut transaction = Transaction::new(self.acquire().await?);
        transaction.multi()?;
        Ok(transaction)
    }

    /// Start an optimistic transaction watching `keys`.
    ///
    /// `WATCH` is sent immediately; `MULTI` follows with the first queued
    /// command, so values can be read with `call_sync` in between.
    pub async fn watch<I, K>(&self, keys: I) -> RedisResult<Transaction>
    where
        I: IntoIterator<Item = K>,
        K: ToArg,
    {
        let mut transaction = Transaction::new(self.acquire().await?);
        transaction.watch(keys).await?;
        Ok(transaction)
    }

    /// Subscribe to channels
    pub async fn subscribe<I, K>(&self, channels: I) -> RedisResult<Subscription>
    where
        I: IntoIterator<Item = K>,
        K: ToArg,
    {
        let mut subscription = Subscription::new(self.acquire().await?);
        subscription.subscribe(channels).await?;
        Ok(subscription)
    }

    /// Subscribe to channel patterns
    pub async fn psubscribe<I, K>(&self, patterns: I) -> RedisResult<Subscription>
    where
        I: IntoIterator<Item = K>,
        K: ToArg,
    {
        let mut subscription = Subscription::new(self.acquire().await?);
        subscription.psubscribe(patterns).await?;
        Ok(subscription)
    }

    /// Subscribe to sharded channels on this node
    pub async fn ssubscribe<I, K>(&self, channels: I) -> RedisResult<Subscription>
    where
        I: IntoIterator<Item = K>,
        K: ToArg,
    {
        let mut subscription = Subscription::new(self.acquire().await?);
        subscription.ssubscribe(channels).await?;
        Ok(subscription)
    }

    /// Current pool occupancy
    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Close the underlying pool. Every clone of this client is affected.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
