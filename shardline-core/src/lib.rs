//! Core types and traits for the shardline client
//!
//! This crate provides the reply value, error, command and configuration
//! types shared by every layer of the `shardline` client.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod types;
pub mod value;

pub use config::{ClusterConfig, ConnectionConfig, PoolConfig};
pub use error::{RedisError, RedisResult};
pub use types::{Command, Credentials, Endpoint, Health, Node, Role, SlotRange, ToArg};
pub use value::RespValue;
