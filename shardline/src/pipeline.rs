//! Pipelining support
//!
//! A [`Pipeline`] writes commands without waiting for their replies and keeps
//! count of how many replies are still owed. Replies come back strictly in
//! the order the commands were written.
//!
//! # Examples
//!
//! ```no_run
//! use shardline::{Client, Command, ConnectionConfig, Endpoint};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(Endpoint::localhost(), ConnectionConfig::default());
//! let mut pipeline = client.pipeline().await?;
//!
//! pipeline.call(&Command::new("SET").arg("key1").arg("value1"));
//! pipeline.call(&Command::new("GET").arg("key1"));
//!
//! let results = pipeline.collect().await?;
//! pipeline.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::pool::PooledConnection;
use shardline_core::{
    error::{RedisError, RedisResult},
    types::Command,
    value::RespValue,
};

/// Batches commands on one leased connection
#[derive(Debug)]
pub struct Pipeline {
    lease: PooledConnection,
    outstanding: usize,
}

impl Pipeline {
    pub(crate) fn new(lease: PooledConnection) -> Self {
        Self {
            lease,
            outstanding: 0,
        }
    }

    /// Queue a command. Nothing is read; the write is sent with the next read.
    pub fn call(&mut self, command: &Command) {
        self.lease.write_request(command);
        self.outstanding += 1;
    }

    /// Send buffered commands without reading any reply
    pub async fn send(&mut self) -> RedisResult<()> {
        self.lease.flush().await
    }

    /// Read the next reply. Error replies are returned as data.
    pub async fn read_response(&mut self) -> RedisResult<RespValue> {
        if self.outstanding == 0 {
            return Err(RedisError::Protocol(
                "No more responses available".to_string(),
            ));
        }

        // Counted down first: a failed read leaves the count matching the wire.
        self.outstanding -= 1;
        self.lease.read_response().await
    }

    /// Read and drop replies until at most `count` remain outstanding
    pub async fn flush(&mut self, count: usize) -> RedisResult<()> {
        while self.outstanding > count {
            self.read_response().await?;
        }
        Ok(())
    }

    /// Read every outstanding reply, in command order
    pub async fn collect(&mut self) -> RedisResult<Vec<RespValue>> {
        let mut replies = Vec::with_capacity(self.outstanding);
        while self.outstanding > 0 {
            replies.push(self.read_response().await?);
        }
        Ok(replies)
    }

    /// Queue a command, drain earlier replies and return this command's
    /// reply. An error reply is raised.
    pub async fn call_sync(&mut self, command: &Command) -> RedisResult<RespValue> {
        self.call(command);
        self.flush(1).await?;
        match self.read_response().await? {
            RespValue::Error(msg) => Err(RedisError::from_reply(msg)),
            value => Ok(value),
        }
    }

    /// Replies still owed by the server
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Drain outstanding replies and return the connection to the pool.
    ///
    /// If draining fails the connection is discarded instead.
    pub async fn close(mut self) -> RedisResult<()> {
        self.flush(0).await?;
        self.lease.release();
        Ok(())
    }
}
