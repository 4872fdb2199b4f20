//! Pub/Sub support
//!
//! A [`Subscription`] owns one connection in subscriber mode. Channels and
//! patterns can be added or removed while listening; confirmations are
//! consumed internally and only published messages reach the caller.
//!
//! # Examples
//!
//! ```no_run
//! use shardline::{Client, ConnectionConfig, Endpoint};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(Endpoint::localhost(), ConnectionConfig::default());
//! let mut subscription = client.subscribe(["news", "updates"]).await?;
//!
//! while let Some(message) = subscription.listen().await? {
//!     println!("{:?} on {:?}", message.payload, message.channel);
//! }
//! # Ok(())
//! # }
//! ```

use crate::pool::PooledConnection;
use bytes::Bytes;
use futures_util::stream::{self, Stream};
use shardline_core::{
    error::{RedisError, RedisResult},
    types::{Command, ToArg},
    value::RespValue,
};
use std::collections::HashSet;
use tracing::debug;

/// Which subscription produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Plain channel subscription
    Message,
    /// Pattern subscription
    PMessage,
    /// Sharded channel subscription
    SMessage,
}

/// A message received from a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Subscription kind that delivered the message
    pub kind: MessageKind,
    /// The pattern that matched, for pattern subscriptions
    pub pattern: Option<Bytes>,
    /// The channel the message was published to
    pub channel: Bytes,
    /// The message payload
    pub payload: Bytes,
}

impl Message {
    /// Parse a push reply. Confirmations and other frames yield `None`.
    pub(crate) fn from_push(value: RespValue) -> RedisResult<Option<Self>> {
        let items = match value {
            RespValue::Array(items) => items,
            RespValue::Error(msg) => return Err(RedisError::from_reply(msg)),
            other => {
                return Err(RedisError::UnexpectedResponse(format!(
                    "Expected a push array, got {:?}",
                    other
                )))
            }
        };

        let mut parts = items.into_iter();
        let kind = match parts.next() {
            Some(kind) => kind.as_bytes()?,
            None => return Err(RedisError::UnexpectedResponse("Empty push array".to_string())),
        };

        let (kind, pattern) = match &kind[..] {
            b"message" => (MessageKind::Message, None),
            b"smessage" => (MessageKind::SMessage, None),
            b"pmessage" => (MessageKind::PMessage, Some(next_bytes(&mut parts)?)),
            _ => return Ok(None),
        };
        let channel = next_bytes(&mut parts)?;
        let payload = next_bytes(&mut parts)?;

        Ok(Some(Message {
            kind,
            pattern,
            channel,
            payload,
        }))
    }
}

fn next_bytes(parts: &mut impl Iterator<Item = RespValue>) -> RedisResult<Bytes> {
    parts
        .next()
        .ok_or_else(|| RedisError::UnexpectedResponse("Truncated push message".to_string()))?
        .as_bytes()
}

/// A connection in subscriber mode.
///
/// The connection is never returned to the pool: closing or dropping the
/// subscription discards it.
#[derive(Debug)]
pub struct Subscription {
    lease: PooledConnection,
    channels: HashSet<Bytes>,
    patterns: HashSet<Bytes>,
    shard_channels: HashSet<Bytes>,
}

impl Subscription {
    pub(crate) fn new(lease: PooledConnection) -> Self {
        Self {
            lease,
            channels: HashSet::new(),
            patterns: HashSet::new(),
            shard_channels: HashSet::new(),
        }
    }

    /// Subscribe to more channels
    pub async fn subscribe<I, K>(&mut self, channels: I) -> RedisResult<()>
    where
        I: IntoIterator<Item = K>,
        K: ToArg,
    {
        let channels = collect(channels);
        if channels.is_empty() {
            return Ok(());
        }
        self.send("SUBSCRIBE", &channels).await?;
        self.channels.extend(channels);
        Ok(())
    }

    /// Unsubscribe from channels; an empty list drops every channel
    pub async fn unsubscribe<I, K>(&mut self, channels: I) -> RedisResult<()>
    where
        I: IntoIterator<Item = K>,
        K: ToArg,
    {
        let channels = collect(channels);
        self.send("UNSUBSCRIBE", &channels).await?;
        forget(&mut self.channels, &channels);
        Ok(())
    }

    /// Subscribe to more channel patterns
    pub async fn psubscribe<I, K>(&mut self, patterns: I) -> RedisResult<()>
    where
        I: IntoIterator<Item = K>,
        K: ToArg,
    {
        let patterns = collect(patterns);
        if patterns.is_empty() {
            return Ok(());
        }
        self.send("PSUBSCRIBE", &patterns).await?;
        self.patterns.extend(patterns);
        Ok(())
    }

    /// Unsubscribe from patterns; an empty list drops every pattern
    pub async fn punsubscribe<I, K>(&mut self, patterns: I) -> RedisResult<()>
    where
        I: IntoIterator<Item = K>,
        K: ToArg,
    {
        let patterns = collect(patterns);
        self.send("PUNSUBSCRIBE", &patterns).await?;
        forget(&mut self.patterns, &patterns);
        Ok(())
    }

    /// Subscribe to more sharded channels.
    ///
    /// Every channel must be served by the node this connection talks to.
    pub async fn ssubscribe<I, K>(&mut self, channels: I) -> RedisResult<()>
    where
        I: IntoIterator<Item = K>,
        K: ToArg,
    {
        let channels = collect(channels);
        if channels.is_empty() {
            return Ok(());
        }
        self.send("SSUBSCRIBE", &channels).await?;
        self.shard_channels.extend(channels);
        Ok(())
    }

    /// Unsubscribe from sharded channels; an empty list drops all of them
    pub async fn sunsubscribe<I, K>(&mut self, channels: I) -> RedisResult<()>
    where
        I: IntoIterator<Item = K>,
        K: ToArg,
    {
        let channels = collect(channels);
        self.send("SUNSUBSCRIBE", &channels).await?;
        forget(&mut self.shard_channels, &channels);
        Ok(())
    }

    async fn send(&mut self, name: &str, targets: &[Bytes]) -> RedisResult<()> {
        debug!("{} {} target(s)", name, targets.len());
        self.lease.write_request(&Command::new(name).args(targets));
        self.lease.flush().await
    }

    /// Wait for the next published message.
    ///
    /// Returns `None` once the server closes the connection. Cancel-safe:
    /// a partially received message stays buffered for the next call.
    pub async fn listen(&mut self) -> RedisResult<Option<Message>> {
        loop {
            let value = match self.lease.read_response().await {
                Ok(value) => value,
                Err(RedisError::Connection(_)) if self.lease.is_closed() => return Ok(None),
                Err(e) => return Err(e),
            };
            if let Some(message) = Message::from_push(value)? {
                return Ok(Some(message));
            }
        }
    }

    /// Channels currently subscribed
    pub fn channels(&self) -> &HashSet<Bytes> {
        &self.channels
    }

    /// Patterns currently subscribed
    pub fn patterns(&self) -> &HashSet<Bytes> {
        &self.patterns
    }

    /// Sharded channels currently subscribed
    pub fn shard_channels(&self) -> &HashSet<Bytes> {
        &self.shard_channels
    }

    /// Turn the subscription into a stream of messages.
    ///
    /// The stream ends when the connection closes and after the first error.
    pub fn into_stream(self) -> impl Stream<Item = RedisResult<Message>> + Send {
        stream::unfold(Some(self), |state| async move {
            let mut subscription = state?;
            match subscription.listen().await {
                Ok(Some(message)) => Some((Ok(message), Some(subscription))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    /// Drop every subscription and discard the connection
    pub fn close(self) {
        self.lease.discard();
    }
}

fn collect<I, K>(targets: I) -> Vec<Bytes>
where
    I: IntoIterator<Item = K>,
    K: ToArg,
{
    targets.into_iter().map(|t| t.to_arg()).collect()
}

fn forget(tracked: &mut HashSet<Bytes>, targets: &[Bytes]) {
    if targets.is_empty() {
        tracked.clear();
    } else {
        for target in targets {
            tracked.remove(target);
        }
    }
}
