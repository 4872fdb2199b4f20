//! Cluster support
//!
//! This module provides:
//! - Slot calculation using CRC16, with hash tags
//! - A [`ShardMap`] parsed from `CLUSTER SHARDS`
//! - [`ClusterClient`], which routes commands by slot and reloads the map
//!   when a node answers with a MOVED or ASK redirect
//!
//! # Examples
//!
//! ```no_run
//! use shardline::{ClusterClient, ClusterConfig, Command, Endpoint};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cluster = ClusterClient::new(ClusterConfig::new([
//!     Endpoint::new("10.0.0.1", 7000),
//!     Endpoint::new("10.0.0.2", 7000),
//! ]));
//!
//! cluster.call(&Command::new("SET").arg("{user1000}.name").arg("ada")).await?;
//! let name = cluster.call(&Command::new("GET").arg("{user1000}.name")).await?;
//! # Ok(())
//! # }
//! ```

use crate::client::Client;
use crate::cluster_subscription::ClusterSubscription;
use crate::connection::Connector;
use crate::pipeline::Pipeline;
use crate::pubsub::Subscription;
use crate::transaction::Transaction;
use crc16::{State, XMODEM};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use serde::Serialize;
use shardline_core::{
    config::ClusterConfig,
    error::{RedisError, RedisResult},
    types::{Command, Endpoint, Health, Node, Role, SlotRange, ToArg},
    value::RespValue,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Total number of hash slots in a cluster
pub const CLUSTER_SLOTS: u16 = 16384;

/// Commands whose first argument is not a key
const KEYLESS_COMMANDS: &[&str] = &[
    "ACL", "BGREWRITEAOF", "BGSAVE", "CLIENT", "CLUSTER", "COMMAND", "CONFIG", "DBSIZE",
    "DEBUG", "ECHO", "FLUSHALL", "FLUSHDB", "FUNCTION", "INFO", "LASTSAVE", "LATENCY",
    "MEMORY", "MODULE", "PING", "RANDOMKEY", "SAVE", "SCRIPT", "SLOWLOG", "TIME", "WAIT",
];

/// The key `ClusterClient::call` routes `command` by, if any
pub fn routing_key(command: &Command) -> Option<&[u8]> {
    if KEYLESS_COMMANDS.iter().any(|name| command.is(name)) {
        return None;
    }
    command.key(1)
}

/// Calculate the hash slot for a key
///
/// If the key contains `{...}` with at least one byte inside, only that
/// part is hashed, so `{user1000}.following` and `{user1000}.followers`
/// share a slot.
pub fn slot_for(key: impl AsRef<[u8]>) -> u16 {
    State::<XMODEM>::calculate(extract_hash_tag(key.as_ref())) % CLUSTER_SLOTS
}

/// Extract the hash tag from a key, or the whole key when it has none
pub fn extract_hash_tag(key: &[u8]) -> &[u8] {
    if let Some(start) = key.iter().position(|&b| b == b'{') {
        if let Some(len) = key[start + 1..].iter().position(|&b| b == b'}') {
            if len > 0 {
                return &key[start + 1..start + 1 + len];
            }
        }
    }
    key
}

/// Group keys by the slot they hash to
pub fn slots_for<I, K>(keys: I) -> BTreeMap<u16, Vec<K>>
where
    I: IntoIterator<Item = K>,
    K: AsRef<[u8]>,
{
    let mut slots: BTreeMap<u16, Vec<K>> = BTreeMap::new();
    for key in keys {
        slots.entry(slot_for(&key)).or_default().push(key);
    }
    slots
}

/// Serializable view of one shard, for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct ShardInfo {
    /// Slots served by the shard
    pub range: SlotRange,
    /// Primary and replicas of the shard
    pub nodes: Vec<Node>,
}

/// Immutable slot → nodes map
#[derive(Debug, Clone, Default)]
pub struct ShardMap {
    shards: Vec<(SlotRange, Vec<Node>)>,
}

impl ShardMap {
    /// Build a map from slot ranges, rejecting overlapping ranges
    pub fn new(mut shards: Vec<(SlotRange, Vec<Node>)>) -> RedisResult<Self> {
        shards.sort_by_key(|(range, _)| *range);
        for pair in shards.windows(2) {
            let (prev, next) = (pair[0].0, pair[1].0);
            if prev.end >= next.start {
                return Err(RedisError::Protocol(format!(
                    "Overlapping slot ranges {}-{} and {}-{}",
                    prev.start, prev.end, next.start, next.end
                )));
            }
        }
        Ok(Self { shards })
    }

    /// Parse a `CLUSTER SHARDS` reply.
    ///
    /// Node endpoints are derived from `template`, so they inherit its
    /// credentials, database and TLS flag. With TLS the `tls-port` field is
    /// used instead of `port`.
    pub fn from_shards(reply: &RespValue, template: &Endpoint) -> RedisResult<Self> {
        let mut shards = Vec::new();

        for shard in reply.as_array()? {
            let fields = flat_map(shard)?;

            let nodes = match fields.get("nodes") {
                Some(nodes) => nodes
                    .as_array()?
                    .iter()
                    .map(|node| parse_node(node, template))
                    .collect::<RedisResult<Vec<_>>>()?,
                None => Vec::new(),
            };

            let slots = match fields.get("slots") {
                Some(slots) => slots.as_array()?,
                None => continue,
            };
            if slots.len() % 2 != 0 {
                return Err(RedisError::Protocol(format!(
                    "Odd number of slot bounds: {}",
                    slots.len()
                )));
            }
            for bounds in slots.chunks(2) {
                let range = SlotRange::new(parse_slot(&bounds[0])?, parse_slot(&bounds[1])?);
                if range.start > range.end {
                    return Err(RedisError::Protocol(format!(
                        "Inverted slot range {}-{}",
                        range.start, range.end
                    )));
                }
                shards.push((range, nodes.clone()));
            }
        }

        Self::new(shards)
    }

    /// Nodes serving `slot`
    pub fn find(&self, slot: u16) -> Option<&[Node]> {
        let idx = self.shards.partition_point(|(range, _)| range.end < slot);
        self.shards
            .get(idx)
            .filter(|(range, _)| range.contains(slot))
            .map(|(_, nodes)| nodes.as_slice())
    }

    /// Pick a random healthy node of `role` serving `slot`
    pub fn pick(&self, slot: u16, role: Role) -> RedisResult<&Node> {
        let nodes = self.find(slot).ok_or(RedisError::SlotNotCovered(slot))?;
        let candidates: Vec<&Node> = nodes
            .iter()
            .filter(|node| node.role == role && node.health != Health::Failed)
            .collect();
        candidates
            .choose(&mut rand::thread_rng())
            .copied()
            .ok_or(RedisError::SlotNotCovered(slot))
    }

    /// Covered slot ranges, in order
    pub fn ranges(&self) -> impl Iterator<Item = SlotRange> + '_ {
        self.shards.iter().map(|(range, _)| *range)
    }

    /// Number of slot ranges
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Whether no slot is covered
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Any healthy node of `role`
    pub fn random_node(&self, role: Role) -> Option<&Node> {
        let candidates: Vec<&Node> = self
            .shards
            .iter()
            .flat_map(|(_, nodes)| nodes)
            .filter(|node| node.role == role && node.health != Health::Failed)
            .collect();
        candidates.choose(&mut rand::thread_rng()).copied()
    }

    /// Copy of the map for diagnostics
    pub fn snapshot(&self) -> Vec<ShardInfo> {
        self.shards
            .iter()
            .map(|(range, nodes)| ShardInfo {
                range: *range,
                nodes: nodes.clone(),
            })
            .collect()
    }
}

fn flat_map(value: &RespValue) -> RedisResult<HashMap<String, &RespValue>> {
    let items = value.as_array()?;
    if items.len() % 2 != 0 {
        return Err(RedisError::Protocol(
            "Field list has an odd number of entries".to_string(),
        ));
    }
    let mut fields = HashMap::with_capacity(items.len() / 2);
    for pair in items.chunks(2) {
        fields.insert(pair[0].as_string()?, &pair[1]);
    }
    Ok(fields)
}

fn parse_slot(value: &RespValue) -> RedisResult<u16> {
    let slot = value.as_int()?;
    u16::try_from(slot)
        .ok()
        .filter(|&slot| slot < CLUSTER_SLOTS)
        .ok_or_else(|| RedisError::Protocol(format!("Slot {} out of range", slot)))
}

fn parse_node(value: &RespValue, template: &Endpoint) -> RedisResult<Node> {
    let fields = flat_map(value)?;
    let text = |name: &str| fields.get(name).and_then(|v| v.as_string().ok());

    let host = match text("endpoint") {
        Some(endpoint) if endpoint != "?" && !endpoint.is_empty() => endpoint,
        _ => text("ip").ok_or_else(|| {
            RedisError::Protocol("Shard node has neither endpoint nor ip".to_string())
        })?,
    };

    let port_field = if template.secure { "tls-port" } else { "port" };
    let port = fields
        .get(port_field)
        .ok_or_else(|| RedisError::Protocol(format!("Shard node is missing {}", port_field)))?
        .as_int()?;
    let port = u16::try_from(port)
        .map_err(|_| RedisError::Protocol(format!("Invalid port {}", port)))?;

    let role = text("role")
        .as_deref()
        .and_then(Role::parse)
        .ok_or_else(|| RedisError::Protocol("Shard node has no valid role".to_string()))?;

    Ok(Node {
        id: text("id").unwrap_or_default(),
        endpoint: template.with_address(host, port),
        role,
        health: text("health")
            .as_deref()
            .map(Health::parse)
            .unwrap_or(Health::Unknown),
    })
}

/// Builds the connector behind each per-node client
pub type ConnectorFactory = Arc<dyn Fn(&Endpoint) -> Arc<dyn Connector> + Send + Sync>;

struct Inner {
    config: ClusterConfig,
    topology: RwLock<Option<Arc<ShardMap>>>,
    clients: Mutex<HashMap<Endpoint, Client>>,
    // Serializes reloads so a burst of redirects triggers one CLUSTER SHARDS.
    reloading: tokio::sync::Mutex<()>,
    connector: Option<ConnectorFactory>,
}

/// Client for a sharded cluster.
///
/// Cheap to clone; clones share the topology and the per-node clients.
#[derive(Clone)]
pub struct ClusterClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient")
            .field("seeds", &self.inner.config.seeds)
            .field("shards", &self.inner.topology.read().as_ref().map(|m| m.len()))
            .finish()
    }
}

impl ClusterClient {
    /// Create a cluster client. The topology is loaded on first use.
    pub fn new(config: ClusterConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a cluster client whose node connections come from `factory`
    pub fn with_connector_factory(config: ClusterConfig, factory: ConnectorFactory) -> Self {
        Self::build(config, Some(factory))
    }

    fn build(config: ClusterConfig, connector: Option<ConnectorFactory>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                topology: RwLock::new(None),
                clients: Mutex::new(HashMap::new()),
                reloading: tokio::sync::Mutex::new(()),
                connector,
            }),
        }
    }

    /// The configuration this client was built with
    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    fn connect_client(&self, endpoint: &Endpoint) -> Client {
        match &self.inner.connector {
            Some(factory) => Client::with_connector(
                factory(endpoint),
                self.inner.config.connection.pool.clone(),
            ),
            None => Client::new(endpoint.clone(), self.inner.config.connection.clone()),
        }
    }

    fn client(&self, endpoint: &Endpoint) -> Client {
        self.inner
            .clients
            .lock()
            .entry(endpoint.clone())
            .or_insert_with(|| {
                debug!("Creating client for {}", endpoint);
                self.connect_client(endpoint)
            })
            .clone()
    }

    /// Fetch the topology from the seeds and replace the current map.
    ///
    /// Seeds are tried in order; unreachable ones are skipped. Cached
    /// per-node clients are dropped.
    pub async fn reload(&self) -> RedisResult<Arc<ShardMap>> {
        let _guard = self.inner.reloading.lock().await;
        self.load().await
    }

    // Reload unless another task already replaced `stale` while we waited.
    async fn refresh(&self, stale: Option<&Arc<ShardMap>>) -> RedisResult<Arc<ShardMap>> {
        let _guard = self.inner.reloading.lock().await;
        let current = self.inner.topology.read().clone();
        match (current, stale) {
            (Some(current), Some(stale)) if !Arc::ptr_eq(&current, stale) => Ok(current),
            (Some(current), None) => Ok(current),
            _ => self.load().await,
        }
    }

    async fn load(&self) -> RedisResult<Arc<ShardMap>> {
        let mut failures = Vec::new();

        for seed in &self.inner.config.seeds {
            let client = self.connect_client(seed);
            let reply = client.call(&Command::new("CLUSTER").arg("SHARDS")).await;
            client.close().await;

            let reply = match reply {
                Ok(reply) => reply,
                Err(e) if e.is_connectivity() => {
                    warn!("Seed {} unreachable: {}", seed, e);
                    failures.push(format!("{}: {}", seed, e));
                    continue;
                }
                Err(e) => return Err(e),
            };

            let map = Arc::new(ShardMap::from_shards(&reply, seed)?);
            info!(
                "Loaded cluster topology from {}: {} slot range(s)",
                seed,
                map.len()
            );
            *self.inner.topology.write() = Some(map.clone());
            self.inner.clients.lock().clear();
            return Ok(map);
        }

        Err(RedisError::ReloadFailed(if failures.is_empty() {
            "no seeds configured".to_string()
        } else {
            failures.join("; ")
        }))
    }

    /// The current map, loading it first if needed
    pub async fn topology(&self) -> RedisResult<Arc<ShardMap>> {
        let current = self.inner.topology.read().clone();
        match current {
            Some(map) => Ok(map),
            None => self.refresh(None).await,
        }
    }

    /// Copy of the current map, without loading it
    pub fn topology_snapshot(&self) -> Option<Vec<ShardInfo>> {
        self.inner.topology.read().as_ref().map(|map| map.snapshot())
    }

    pub(crate) async fn route(&self, slot: u16, role: Role) -> RedisResult<(Endpoint, Client)> {
        let topology = self.topology().await?;
        let endpoint = topology.pick(slot, role)?.endpoint.clone();
        let client = self.client(&endpoint);
        Ok((endpoint, client))
    }

    /// Client for a node of `role` serving `slot`
    pub async fn client_for(&self, slot: u16, role: Role) -> RedisResult<Client> {
        Ok(self.route(slot, role).await?.1)
    }

    /// Client for any node of `role`
    pub async fn any_client(&self, role: Role) -> RedisResult<Client> {
        let topology = self.topology().await?;
        let endpoint = topology
            .random_node(role)
            .map(|node| node.endpoint.clone())
            .ok_or_else(|| RedisError::Cluster(format!("No {:?} node available", role)))?;
        Ok(self.client(&endpoint))
    }

    /// Execute a command on the primary owning its first key.
    ///
    /// Commands without arguments and server commands such as `INFO`,
    /// `CONFIG` or `CLIENT` go to any primary. To reach a particular node use
    /// [`client_for`](Self::client_for) or [`any_client`](Self::any_client).
    pub async fn call(&self, command: &Command) -> RedisResult<RespValue> {
        match routing_key(command) {
            Some(key) => self.call_with_keys([key], Role::Master, command).await,
            None => self.any_client(Role::Master).await?.call(command).await,
        }
    }

    /// Execute a command whose keys all hash to one slot.
    ///
    /// A MOVED or ASK reply reloads the topology and retries, up to
    /// `max_attempts` tries in total.
    pub async fn call_with_keys<I, K>(
        &self,
        keys: I,
        role: Role,
        command: &Command,
    ) -> RedisResult<RespValue>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        let slots = slots_for(keys);
        if slots.len() > 1 {
            return Err(RedisError::Cluster("keys span multiple slots".to_string()));
        }
        let slot = match slots.keys().next() {
            Some(&slot) => slot,
            None => return self.any_client(role).await?.call(command).await,
        };

        let mut attempts = self.inner.config.max_attempts.max(1);
        loop {
            let topology = self.topology().await?;
            let endpoint = topology.pick(slot, role)?.endpoint.clone();

            match self.client(&endpoint).call(command).await {
                Err(e) if e.is_redirect() => {
                    attempts -= 1;
                    warn!(
                        "{} from {} ({} attempt(s) left)",
                        e, endpoint, attempts
                    );
                    if attempts == 0 {
                        return Err(e);
                    }
                    self.refresh(Some(&topology)).await?;
                }
                reply => return reply,
            }
        }
    }

    /// Pipeline on the primary owning `slot`
    pub async fn pipeline(&self, slot: u16) -> RedisResult<Pipeline> {
        self.client_for(slot, Role::Master).await?.pipeline().await
    }

    /// Transaction on the primary owning `slot`
    pub async fn transaction(&self, slot: u16) -> RedisResult<Transaction> {
        self.client_for(slot, Role::Master).await?.transaction().await
    }

    /// Subscribe to global channels through any primary
    pub async fn subscribe<I, K>(&self, channels: I) -> RedisResult<Subscription>
    where
        I: IntoIterator<Item = K>,
        K: ToArg,
    {
        self.any_client(Role::Master).await?.subscribe(channels).await
    }

    /// Subscribe to global channel patterns through any primary
    pub async fn psubscribe<I, K>(&self, patterns: I) -> RedisResult<Subscription>
    where
        I: IntoIterator<Item = K>,
        K: ToArg,
    {
        self.any_client(Role::Master).await?.psubscribe(patterns).await
    }

    /// Subscribe to sharded channels, fanning in from every owning node
    pub async fn ssubscribe<I, K>(&self, channels: I) -> RedisResult<ClusterSubscription>
    where
        I: IntoIterator<Item = K>,
        K: ToArg,
    {
        let mut subscription = ClusterSubscription::new(self.clone());
        subscription.subscribe(channels).await?;
        Ok(subscription)
    }

    /// Close every cached per-node client
    pub async fn close(&self) {
        let clients: Vec<Client> = self.inner.clients.lock().drain().map(|(_, c)| c).collect();
        for client in clients {
            client.close().await;
        }
    }
}
