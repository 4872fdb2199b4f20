//! Transaction support
//!
//! A [`Transaction`] is a pipeline that wraps its commands in
//! `MULTI`/`EXEC`. Queued commands are only acknowledged with `QUEUED`; their
//! real replies arrive as the array returned by `EXEC`.
//!
//! A command that fails while executing does not abort the others: its slot
//! in the `EXEC` reply holds a [`RespValue::Error`] and every sibling command
//! still runs.
//!
//! # Examples
//!
//! ```no_run
//! use shardline::{Client, Command, ConnectionConfig, Endpoint};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(Endpoint::localhost(), ConnectionConfig::default());
//!
//! let mut transaction = client.watch(["balance"]).await?;
//! let balance = transaction
//!     .call_sync(&Command::new("GET").arg("balance"))
//!     .await?
//!     .as_int()
//!     .unwrap_or(0);
//! transaction.call(&Command::new("SET").arg("balance").arg(balance + 10));
//!
//! match transaction.execute().await? {
//!     Some(replies) => println!("committed: {:?}", replies),
//!     None => println!("balance changed concurrently"),
//! }
//! # Ok(())
//! # }
//! ```

use crate::pipeline::Pipeline;
use crate::pool::PooledConnection;
use shardline_core::{
    error::{RedisError, RedisResult},
    types::{Command, ToArg},
    value::RespValue,
};
use tracing::debug;

/// MULTI/EXEC block on one leased connection
#[derive(Debug)]
pub struct Transaction {
    pipeline: Pipeline,
    multi: bool,
}

impl Transaction {
    pub(crate) fn new(lease: PooledConnection) -> Self {
        Self {
            pipeline: Pipeline::new(lease),
            multi: false,
        }
    }

    /// Open the MULTI block. Its acknowledgement is read with `execute`.
    pub fn multi(&mut self) -> RedisResult<()> {
        if self.multi {
            return Err(RedisError::Protocol(
                "MULTI calls can not be nested".to_string(),
            ));
        }
        self.pipeline.call(&Command::new("MULTI"));
        self.multi = true;
        Ok(())
    }

    /// Watch keys for changes. Only allowed before `MULTI`.
    pub async fn watch<I, K>(&mut self, keys: I) -> RedisResult<()>
    where
        I: IntoIterator<Item = K>,
        K: ToArg,
    {
        if self.multi {
            return Err(RedisError::Protocol(
                "Cannot WATCH after MULTI".to_string(),
            ));
        }
        self.pipeline
            .call_sync(&Command::new("WATCH").args(keys))
            .await
            .map(drop)
    }

    /// Forget every watched key
    pub async fn unwatch(&mut self) -> RedisResult<()> {
        if self.multi {
            return Err(RedisError::Protocol(
                "Cannot UNWATCH after MULTI".to_string(),
            ));
        }
        self.pipeline
            .call_sync(&Command::new("UNWATCH"))
            .await
            .map(drop)
    }

    /// Queue a command, opening the MULTI block first if needed
    pub fn call(&mut self, command: &Command) {
        if !self.multi {
            self.pipeline.call(&Command::new("MULTI"));
            self.multi = true;
        }
        self.pipeline.call(command);
    }

    /// Run a command immediately and return its reply.
    ///
    /// Only valid before `MULTI`, typically to read watched keys.
    pub async fn call_sync(&mut self, command: &Command) -> RedisResult<RespValue> {
        if self.multi {
            return Err(RedisError::Protocol(
                "Cannot read replies inside MULTI".to_string(),
            ));
        }
        self.pipeline.call_sync(command).await
    }

    /// Whether `MULTI` has been issued
    pub fn in_multi(&self) -> bool {
        self.multi
    }

    /// Send `EXEC` and return the replies of the queued commands.
    ///
    /// `None` means a watched key changed and nothing was applied. Commands
    /// that failed while running are embedded as [`RespValue::Error`].
    pub async fn execute(mut self) -> RedisResult<Option<Vec<RespValue>>> {
        if !self.multi {
            self.multi()?;
        }
        self.pipeline.call(&Command::new("EXEC"));

        let mut rejected = Vec::new();
        while self.pipeline.outstanding() > 1 {
            if let RespValue::Error(msg) = self.pipeline.read_response().await? {
                debug!("Command rejected while queueing: {}", msg);
                rejected.push(msg);
            }
        }

        let reply = self.pipeline.read_response().await?;
        self.pipeline.close().await?;

        match reply {
            RespValue::Array(replies) => Ok(Some(replies)),
            RespValue::NullArray | RespValue::Null => Ok(None),
            RespValue::Error(msg) if rejected.is_empty() => Err(RedisError::from_reply(msg)),
            RespValue::Error(msg) => Err(RedisError::Server(format!(
                "{} ({})",
                msg,
                rejected.join("; ")
            ))),
            other => Err(RedisError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    /// Abandon the transaction.
    ///
    /// Sends `DISCARD` inside MULTI, or `UNWATCH` when MULTI was never sent.
    pub async fn discard(mut self) -> RedisResult<()> {
        let command = if self.multi { "DISCARD" } else { "UNWATCH" };
        self.pipeline.call_sync(&Command::new(command)).await?;
        self.pipeline.close().await
    }
}
