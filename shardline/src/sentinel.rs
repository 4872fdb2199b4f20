//! Sentinel support for high availability
//!
//! Sentinels monitor a primary and its replicas and promote a replica when
//! the primary fails. [`SentinelConnector`] asks the sentinels for the
//! current address on every new connection, so a pool built on it follows a
//! failover as soon as old connections are replaced.
//!
//! # Examples
//!
//! ```no_run
//! use shardline::{Command, Endpoint, SentinelClient, SentinelConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SentinelConfig::new("mymaster")
//!     .add_sentinel(Endpoint::new("127.0.0.1", 26379))
//!     .add_sentinel(Endpoint::new("127.0.0.1", 26380))
//!     .with_endpoint_template(Endpoint::default().with_password("secret"));
//!
//! let client = SentinelClient::new(config)?;
//! client.call(&Command::new("SET").arg("key").arg("value")).await?;
//! # Ok(())
//! # }
//! ```

use crate::client::Client;
use crate::connection::{Connection, Connector, TcpConnector};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use shardline_core::{
    config::ConnectionConfig,
    error::{RedisError, RedisResult},
    types::{Command, Endpoint, Role},
    value::RespValue,
};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Master name used when none is configured
pub const DEFAULT_MASTER_NAME: &str = "mymaster";

/// Replica flags that make a replica unfit to serve reads
const UNHEALTHY_FLAGS: [&str; 3] = ["s_down", "o_down", "disconnected"];

/// Configuration for a sentinel-managed deployment
#[derive(Debug, Clone)]
pub struct SentinelConfig {
    /// Name the sentinels monitor the primary under
    pub master_name: String,
    /// Sentinels, tried in order
    pub sentinels: Vec<Endpoint>,
    /// Role of the nodes connections are opened to
    pub role: Role,
    /// Credentials, database and TLS flag for resolved endpoints
    pub endpoint_template: Option<Endpoint>,
    /// Settings for sentinel and data connections
    pub connection: ConnectionConfig,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MASTER_NAME)
    }
}

impl SentinelConfig {
    /// Create a configuration for the given master name
    #[must_use]
    pub fn new(master_name: impl Into<String>) -> Self {
        Self {
            master_name: master_name.into(),
            sentinels: Vec::new(),
            role: Role::Master,
            endpoint_template: None,
            connection: ConnectionConfig::default(),
        }
    }

    /// Add a sentinel
    #[must_use]
    pub fn add_sentinel(mut self, sentinel: Endpoint) -> Self {
        self.sentinels.push(sentinel);
        self
    }

    /// Replace the sentinel list
    #[must_use]
    pub fn with_sentinels(mut self, sentinels: impl IntoIterator<Item = Endpoint>) -> Self {
        self.sentinels = sentinels.into_iter().collect();
        self
    }

    /// Connect to replicas instead of the primary
    #[must_use]
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Set the template resolved endpoints are derived from
    #[must_use]
    pub fn with_endpoint_template(mut self, template: Endpoint) -> Self {
        self.endpoint_template = Some(template);
        self
    }

    /// Set the connection settings
    #[must_use]
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }
}

/// Primary state as reported by `SENTINEL MASTER`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterInfo {
    /// Master name
    pub name: String,
    /// Master host
    pub host: String,
    /// Master port
    pub port: u16,
    /// Master status flags
    pub flags: Vec<String>,
    /// Number of connected replicas
    pub num_slaves: u32,
    /// Number of other sentinels
    pub num_other_sentinels: u32,
    /// Quorum for failover
    pub quorum: u32,
}

impl MasterInfo {
    /// Parse the field map returned by `SENTINEL MASTER`
    pub fn from_map(fields: &HashMap<String, String>) -> RedisResult<Self> {
        let field = |name: &str| {
            fields
                .get(name)
                .ok_or_else(|| RedisError::Sentinel(format!("master info is missing '{}'", name)))
        };
        let number = |name: &str| -> u32 {
            fields
                .get(name)
                .and_then(|v| v.parse().ok())
                .unwrap_or_default()
        };

        let port = field("port")?;
        Ok(Self {
            name: field("name")?.clone(),
            host: field("ip")?.clone(),
            port: port
                .parse()
                .map_err(|_| RedisError::Sentinel(format!("invalid port '{}'", port)))?,
            flags: split_flags(fields.get("flags").map(String::as_str).unwrap_or_default()),
            num_slaves: number("num-slaves"),
            num_other_sentinels: number("num-other-sentinels"),
            quorum: number("quorum"),
        })
    }

    /// Check if master is down
    #[must_use]
    pub fn is_down(&self) -> bool {
        self.flags.iter().any(|f| f == "s_down" || f == "o_down")
    }

    /// Check if failover is in progress
    #[must_use]
    pub fn is_failover_in_progress(&self) -> bool {
        self.flags.iter().any(|f| f == "failover_in_progress")
    }

    /// Get master address
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn split_flags(flags: &str) -> Vec<String> {
    flags
        .split(',')
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect()
}

fn info_map(value: &RespValue) -> RedisResult<HashMap<String, String>> {
    let items = value.as_array()?;
    if items.len() % 2 != 0 {
        return Err(RedisError::Sentinel(
            "field list has an odd number of entries".to_string(),
        ));
    }
    let mut fields = HashMap::with_capacity(items.len() / 2);
    for pair in items.chunks(2) {
        fields.insert(pair[0].as_string()?, pair[1].as_string()?);
    }
    Ok(fields)
}

fn info_maps(value: &RespValue) -> RedisResult<Vec<HashMap<String, String>>> {
    value.as_array()?.iter().map(info_map).collect()
}

fn parse_port(port: &str) -> RedisResult<u16> {
    port.parse()
        .map_err(|_| RedisError::Sentinel(format!("invalid port '{}'", port)))
}

/// Parse a `GET-MASTER-ADDR-BY-NAME` reply; `None` when the name is unknown
fn parse_master_addr(reply: &RespValue, template: &Endpoint) -> RedisResult<Option<Endpoint>> {
    if reply.is_null() {
        return Ok(None);
    }
    match reply.as_array()? {
        [host, port] => Ok(Some(
            template.with_address(host.as_string()?, parse_port(&port.as_string()?)?),
        )),
        other => Err(RedisError::UnexpectedResponse(format!(
            "Expected [host, port], got {:?}",
            other
        ))),
    }
}

/// Pick a random healthy replica from a `SENTINEL SLAVES` reply
fn pick_replica(reply: &RespValue, template: &Endpoint) -> RedisResult<Option<Endpoint>> {
    let mut healthy = Vec::new();
    for replica in info_maps(reply)? {
        let flags = split_flags(replica.get("flags").map(String::as_str).unwrap_or_default());
        if flags.iter().any(|f| UNHEALTHY_FLAGS.contains(&f.as_str())) {
            continue;
        }
        let (Some(ip), Some(port)) = (replica.get("ip"), replica.get("port")) else {
            continue;
        };
        healthy.push(template.with_address(ip.clone(), parse_port(port)?));
    }
    Ok(healthy.choose(&mut rand::thread_rng()).cloned())
}

/// Resolves the current primary or a replica through the sentinels
pub struct SentinelResolver {
    config: SentinelConfig,
    template: Endpoint,
    clients: Mutex<HashMap<Endpoint, Client>>,
}

impl std::fmt::Debug for SentinelResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SentinelResolver")
            .field("master_name", &self.config.master_name)
            .field("sentinels", &self.config.sentinels)
            .finish()
    }
}

impl SentinelResolver {
    /// Create a resolver
    ///
    /// # Errors
    ///
    /// Returns an error if no sentinels are configured.
    pub fn new(config: SentinelConfig) -> RedisResult<Self> {
        if config.sentinels.is_empty() {
            return Err(RedisError::Config("No sentinels configured".to_string()));
        }
        let template = config.endpoint_template.clone().unwrap_or_default();
        Ok(Self {
            config,
            template,
            clients: Mutex::new(HashMap::new()),
        })
    }

    /// The configuration this resolver was built with
    pub fn config(&self) -> &SentinelConfig {
        &self.config
    }

    fn client(&self, sentinel: &Endpoint) -> Client {
        self.clients
            .lock()
            .entry(sentinel.clone())
            .or_insert_with(|| Client::new(sentinel.clone(), self.config.connection.clone()))
            .clone()
    }

    // Ask each sentinel in turn until `parse` yields a value. Unreachable
    // sentinels and `None` answers move on to the next one.
    async fn ask_each<T, F>(&self, command: &Command, what: &str, parse: F) -> RedisResult<T>
    where
        F: Fn(&RespValue) -> RedisResult<Option<T>>,
    {
        let mut answered = false;
        for sentinel in &self.config.sentinels {
            let reply = match self.client(sentinel).call(command).await {
                Ok(reply) => reply,
                Err(e) if e.is_connectivity() => {
                    warn!("Sentinel {} unreachable: {}", sentinel, e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            answered = true;
            match parse(&reply)? {
                Some(value) => {
                    debug!("Sentinel {} answered {}", sentinel, what);
                    return Ok(value);
                }
                None => debug!("Sentinel {} could not answer {}", sentinel, what),
            }
        }

        Err(RedisError::Sentinel(if answered {
            format!("could not resolve {} for '{}'", what, self.config.master_name)
        } else {
            format!("no sentinel reachable for '{}'", self.config.master_name)
        }))
    }

    /// Resolve the endpoint of the primary, or of a random healthy replica
    pub async fn resolve(&self, role: Role) -> RedisResult<Endpoint> {
        let name = self.config.master_name.as_str();
        let endpoint = match role {
            Role::Master => {
                let command = Command::from_args(["SENTINEL", "GET-MASTER-ADDR-BY-NAME", name]);
                self.ask_each(&command, "primary", |reply| {
                    parse_master_addr(reply, &self.template)
                })
                .await?
            }
            Role::Replica => {
                let command = Command::from_args(["SENTINEL", "SLAVES", name]);
                self.ask_each(&command, "replica", |reply| {
                    pick_replica(reply, &self.template)
                })
                .await?
            }
        };
        info!("Resolved {:?} for '{}' to {}", role, name, endpoint);
        Ok(endpoint)
    }

    /// State of every monitored primary
    pub async fn masters(&self) -> RedisResult<Vec<HashMap<String, String>>> {
        let command = Command::from_args(["SENTINEL", "MASTERS"]);
        self.ask_each(&command, "masters", |reply| info_maps(reply).map(Some))
            .await
    }

    /// State of one monitored primary
    pub async fn master(&self, name: &str) -> RedisResult<HashMap<String, String>> {
        let command = Command::from_args(["SENTINEL", "MASTER", name]);
        self.ask_each(&command, "master", |reply| info_map(reply).map(Some))
            .await
    }

    /// Parsed state of one monitored primary
    pub async fn master_info(&self, name: &str) -> RedisResult<MasterInfo> {
        MasterInfo::from_map(&self.master(name).await?)
    }

    /// Replicas of one monitored primary
    pub async fn slaves(&self, name: &str) -> RedisResult<Vec<HashMap<String, String>>> {
        let command = Command::from_args(["SENTINEL", "SLAVES", name]);
        self.ask_each(&command, "replicas", |reply| info_maps(reply).map(Some))
            .await
    }

    /// Force a failover of `name`
    pub async fn failover(&self, name: &str) -> RedisResult<RespValue> {
        let command = Command::from_args(["SENTINEL", "FAILOVER", name]);
        self.ask_each(&command, "failover", |reply| Ok(Some(reply.clone())))
            .await
    }

    /// Close every sentinel connection
    pub async fn close(&self) {
        let clients: Vec<Client> = self.clients.lock().drain().map(|(_, c)| c).collect();
        for client in clients {
            client.close().await;
        }
    }
}

/// Opens connections to whatever node the sentinels currently report
#[derive(Debug, Clone)]
pub struct SentinelConnector {
    resolver: Arc<SentinelResolver>,
    role: Role,
}

impl SentinelConnector {
    /// Connector for nodes of `role`
    pub fn new(resolver: Arc<SentinelResolver>, role: Role) -> Self {
        Self { resolver, role }
    }
}

#[async_trait]
impl Connector for SentinelConnector {
    async fn connect(&self) -> RedisResult<Connection> {
        let endpoint = self.resolver.resolve(self.role).await?;
        TcpConnector::open(&endpoint, &self.resolver.config.connection).await
    }
}

/// Client whose pool follows the sentinels' view of the deployment.
///
/// Dereferences to [`Client`]. Leases taken before a failover stay on the
/// old node until released; new connections go to the new one.
#[derive(Debug, Clone)]
pub struct SentinelClient {
    client: Client,
    resolver: Arc<SentinelResolver>,
}

impl SentinelClient {
    /// Create a client. No connection is opened until the first command.
    ///
    /// # Errors
    ///
    /// Returns an error if no sentinels are configured.
    pub fn new(config: SentinelConfig) -> RedisResult<Self> {
        let role = config.role;
        let pool = config.connection.pool.clone();
        let resolver = Arc::new(SentinelResolver::new(config)?);
        let connector = Arc::new(SentinelConnector::new(resolver.clone(), role));
        Ok(Self {
            client: Client::with_connector(connector, pool),
            resolver,
        })
    }

    /// The underlying client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// The resolver, for sentinel admin calls
    pub fn resolver(&self) -> &Arc<SentinelResolver> {
        &self.resolver
    }

    /// Close data and sentinel connections
    pub async fn close(&self) {
        self.client.close().await;
        self.resolver.close().await;
    }
}

impl Deref for SentinelClient {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.client
    }
}
