//! Async RESP2 client for standalone, clustered and sentinel-managed servers
//!
//! `shardline` speaks the RESP2 wire protocol over tokio. It offers:
//!
//! - A pooled single-node [`Client`] with pipelines, MULTI/EXEC
//!   transactions and pub/sub
//! - A [`ClusterClient`] that routes by hash slot and follows MOVED/ASK
//!   redirects by reloading the topology from `CLUSTER SHARDS`
//! - Sharded pub/sub fanned in from every owning node
//! - A [`SentinelClient`] that resolves the current primary on each new
//!   connection
//!
//! Commands are built with [`Command`] and executed with a generic `call`;
//! replies come back as [`RespValue`].
//!
//! # Quick Start
//!
//! ```no_run
//! use shardline::{Client, Command, ConnectionConfig, Endpoint};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new(Endpoint::localhost(), ConnectionConfig::default());
//!
//!     client.call(&Command::new("SET").arg("mykey").arg("myvalue")).await?;
//!     let value = client.call(&Command::new("GET").arg("mykey")).await?;
//!     println!("Value: {:?}", value.as_string()?);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::future_not_send)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::unused_async)]

pub mod client;
pub mod cluster;
pub mod cluster_subscription;
pub mod connection;
pub mod pipeline;
pub mod pool;
pub mod protocol;
pub mod pubsub;
pub mod sentinel;
pub mod transaction;

pub use client::Client;
pub use cluster::{slot_for, ClusterClient, ShardInfo, ShardMap};
pub use cluster_subscription::ClusterSubscription;
pub use connection::{Connection, Connector, TcpConnector};
pub use pipeline::Pipeline;
pub use pool::{Pool, PoolStatus, PooledConnection};
pub use pubsub::{Message, MessageKind, Subscription};
pub use sentinel::{SentinelClient, SentinelConfig, SentinelConnector, SentinelResolver};
pub use transaction::Transaction;

pub use shardline_core::{
    config::{ClusterConfig, ConnectionConfig, PoolConfig},
    error::{RedisError, RedisResult},
    types::{Command, Credentials, Endpoint, Health, Node, Role, SlotRange, ToArg},
    value::RespValue,
};
