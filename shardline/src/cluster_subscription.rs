//! Sharded pub/sub across a cluster
//!
//! Sharded channels live on the primary owning their slot, so one logical
//! subscription may need a connection per node. [`ClusterSubscription`]
//! runs one listener task per node and fans their messages into a single
//! bounded queue. The listener tasks live in a [`JoinSet`]: closing or
//! dropping the aggregate aborts all of them, which discards every per-node
//! connection.

use crate::cluster::{slot_for, ClusterClient};
use crate::pubsub::{Message, Subscription};
use bytes::Bytes;
use shardline_core::{
    error::{RedisError, RedisResult},
    types::{Endpoint, Role, ToArg},
};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, warn};

enum Control {
    Subscribe(Vec<Bytes>),
    Unsubscribe(Vec<Bytes>),
}

struct Listener {
    control: mpsc::UnboundedSender<Control>,
    channels: HashSet<Bytes>,
}

/// Sharded subscription spanning every node that owns one of its channels
pub struct ClusterSubscription {
    cluster: ClusterClient,
    sender: mpsc::Sender<RedisResult<Message>>,
    receiver: mpsc::Receiver<RedisResult<Message>>,
    listeners: HashMap<Endpoint, Listener>,
    channels: HashMap<Bytes, Endpoint>,
    tasks: JoinSet<()>,
    failed: bool,
    closed: bool,
}

impl std::fmt::Debug for ClusterSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterSubscription")
            .field("channels", &self.channels.len())
            .field("shards", &self.listeners.len())
            .field("failed", &self.failed)
            .field("closed", &self.closed)
            .finish()
    }
}

impl ClusterSubscription {
    pub(crate) fn new(cluster: ClusterClient) -> Self {
        let (sender, receiver) = mpsc::channel(cluster.config().queue_capacity.max(1));
        Self {
            cluster,
            sender,
            receiver,
            listeners: HashMap::new(),
            channels: HashMap::new(),
            tasks: JoinSet::new(),
            failed: false,
            closed: false,
        }
    }

    fn ensure_open(&self) -> RedisResult<()> {
        if self.failed {
            return Err(RedisError::Subscription(
                "cluster subscription failed".to_string(),
            ));
        }
        if self.closed {
            return Err(RedisError::Subscription(
                "cluster subscription is closed".to_string(),
            ));
        }
        Ok(())
    }

    /// Subscribe to more sharded channels.
    ///
    /// Channels are grouped by owning primary; a node that already has a
    /// listener is told to extend its subscription, otherwise a new
    /// connection and listener are started.
    pub async fn subscribe<I, K>(&mut self, channels: I) -> RedisResult<()>
    where
        I: IntoIterator<Item = K>,
        K: ToArg,
    {
        self.ensure_open()?;
        while let Some(joined) = self.tasks.try_join_next() {
            self.check_exit(joined)?;
        }

        let mut by_node = HashMap::new();
        for channel in channels.into_iter().map(|c| c.to_arg()) {
            if self.channels.contains_key(&channel) {
                continue;
            }
            let (endpoint, client) = self.cluster.route(slot_for(&channel), Role::Master).await?;
            by_node
                .entry(endpoint)
                .or_insert_with(|| (client, Vec::new()))
                .1
                .push(channel);
        }

        for (endpoint, (client, channels)) in by_node {
            match self.listeners.get_mut(&endpoint) {
                Some(listener) => {
                    listener
                        .control
                        .send(Control::Subscribe(channels.clone()))
                        .map_err(|_| {
                            RedisError::Subscription(format!(
                                "listener for {} has stopped",
                                endpoint
                            ))
                        })?;
                    listener.channels.extend(channels.iter().cloned());
                }
                None => {
                    let subscription = client.ssubscribe(channels.iter()).await?;
                    let (control, commands) = mpsc::unbounded_channel();
                    debug!("Starting sharded listener on {}", endpoint);
                    self.tasks.spawn(run_listener(
                        endpoint.clone(),
                        subscription,
                        commands,
                        self.sender.clone(),
                    ));
                    self.listeners.insert(
                        endpoint.clone(),
                        Listener {
                            control,
                            channels: channels.iter().cloned().collect(),
                        },
                    );
                }
            }

            for channel in channels {
                self.channels.insert(channel, endpoint.clone());
            }
        }
        Ok(())
    }

    /// Unsubscribe from sharded channels.
    ///
    /// A node left without channels has its listener stopped and its
    /// connection discarded.
    pub fn unsubscribe<I, K>(&mut self, channels: I) -> RedisResult<()>
    where
        I: IntoIterator<Item = K>,
        K: ToArg,
    {
        self.ensure_open()?;

        let mut by_node: HashMap<Endpoint, Vec<Bytes>> = HashMap::new();
        for channel in channels.into_iter().map(|c| c.to_arg()) {
            if let Some(endpoint) = self.channels.remove(&channel) {
                by_node.entry(endpoint).or_default().push(channel);
            }
        }

        for (endpoint, channels) in by_node {
            let Some(listener) = self.listeners.get_mut(&endpoint) else {
                continue;
            };
            for channel in &channels {
                listener.channels.remove(channel);
            }

            if listener.channels.is_empty() {
                // Dropping the control sender stops the listener.
                debug!("Stopping sharded listener on {}", endpoint);
                self.listeners.remove(&endpoint);
            } else if listener.control.send(Control::Unsubscribe(channels)).is_err() {
                return Err(RedisError::Subscription(format!(
                    "listener for {} has stopped",
                    endpoint
                )));
            }
        }
        Ok(())
    }

    /// Wait for the next message from any node.
    ///
    /// Returns `None` after `close` or once no channel is subscribed and the
    /// queue is drained. A listener failure is returned once; every later
    /// call fails with `Subscription`. A listener task that dies without
    /// reporting counts as a failure too.
    pub async fn listen(&mut self) -> RedisResult<Option<Message>> {
        if self.failed {
            return Err(RedisError::Subscription(
                "cluster subscription failed".to_string(),
            ));
        }
        if self.closed {
            return Ok(None);
        }

        loop {
            let item = if self.listeners.is_empty() {
                match self.receiver.try_recv() {
                    Ok(item) => item,
                    Err(_) => return Ok(None),
                }
            } else {
                tokio::select! {
                    item = self.receiver.recv() => match item {
                        Some(item) => item,
                        None => return Ok(None),
                    },
                    Some(joined) = self.tasks.join_next() => {
                        self.check_exit(joined)?;
                        continue;
                    }
                }
            };

            return match item {
                Ok(message) => Ok(Some(message)),
                Err(e) => Err(self.fail(e)),
            };
        }
    }

    fn fail(&mut self, e: RedisError) -> RedisError {
        self.failed = true;
        self.listeners.clear();
        self.tasks.abort_all();
        e
    }

    // Listeners report their own failures through the queue; only a task
    // that never got the chance to (a panic) is handled here.
    fn check_exit(&mut self, joined: Result<(), JoinError>) -> RedisResult<()> {
        match joined {
            Err(e) if e.is_panic() => {
                warn!("Sharded listener task died: {}", e);
                Err(self.fail(RedisError::Subscription(format!(
                    "listener task failed: {}",
                    e
                ))))
            }
            _ => Ok(()),
        }
    }

    /// Subscribed channels
    pub fn channels(&self) -> impl Iterator<Item = &Bytes> + '_ {
        self.channels.keys()
    }

    /// Number of nodes with a live listener
    pub fn shard_count(&self) -> usize {
        self.listeners.len()
    }

    /// Stop every listener and close the queue
    pub async fn close(&mut self) {
        self.closed = true;
        self.listeners.clear();
        self.channels.clear();
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        self.receiver.close();
    }
}

enum Event {
    Control(Option<Control>),
    Message(RedisResult<Option<Message>>),
}

async fn run_listener(
    endpoint: Endpoint,
    mut subscription: Subscription,
    mut commands: mpsc::UnboundedReceiver<Control>,
    queue: mpsc::Sender<RedisResult<Message>>,
) {
    loop {
        let event = tokio::select! {
            command = commands.recv() => Event::Control(command),
            message = subscription.listen() => Event::Message(message),
        };

        let failure = match event {
            Event::Control(Some(Control::Subscribe(channels))) => {
                subscription.ssubscribe(channels).await.err()
            }
            Event::Control(Some(Control::Unsubscribe(channels))) => {
                subscription.sunsubscribe(channels).await.err()
            }
            Event::Control(None) => {
                debug!("Sharded listener on {} stopped", endpoint);
                subscription.close();
                return;
            }
            Event::Message(Ok(Some(message))) => {
                if queue.send(Ok(message)).await.is_err() {
                    // Aggregate is gone.
                    return;
                }
                None
            }
            Event::Message(Ok(None)) => Some(RedisError::Connection(format!(
                "Sharded subscription on {} closed by server",
                endpoint
            ))),
            Event::Message(Err(e)) => Some(e),
        };

        if let Some(e) = failure {
            warn!("Sharded listener on {} failed: {}", endpoint, e);
            let _ = queue.send(Err(e)).await;
            return;
        }
    }
}
