//! Common types used throughout the library

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default server port
pub const DEFAULT_PORT: u16 = 6379;

/// Represents a slot range in a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotRange {
    /// Start of the slot range (inclusive)
    pub start: u16,
    /// End of the slot range (inclusive)
    pub end: u16,
}

impl SlotRange {
    /// Create a new slot range
    #[must_use]
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Check if a slot is within this range
    #[must_use]
    pub const fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }
}

/// Role a node plays for its shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Primary that accepts writes
    Master,
    /// Read-only copy of a primary
    Replica,
}

impl Role {
    /// Parse the role names servers report (`master`, `primary`, `replica`, `slave`)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "master" | "primary" => Some(Role::Master),
            "replica" | "slave" => Some(Role::Replica),
            _ => None,
        }
    }
}

/// Health a cluster node reports for itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    /// Serving traffic
    Online,
    /// Marked failed by the cluster
    Failed,
    /// Still loading its dataset
    Loading,
    /// Missing or unrecognized health field
    Unknown,
}

impl Health {
    /// Parse a `CLUSTER SHARDS` health value
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "online" => Health::Online,
            "failed" | "fail" => Health::Failed,
            "loading" => Health::Loading,
            _ => Health::Unknown,
        }
    }
}

/// Username/password pair sent with `AUTH`
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credentials {
    /// ACL username; `None` authenticates as the default user
    pub username: Option<String>,
    /// Password
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Where and how to reach one server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or IP address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Connect over TLS (`rediss` scheme)
    pub secure: bool,
    /// Database index selected after connecting
    pub database: Option<u32>,
    /// Credentials sent during the handshake
    #[serde(skip)]
    pub credentials: Option<Credentials>,
}

impl Endpoint {
    /// Plain endpoint for `host:port`
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            secure: false,
            database: None,
            credentials: None,
        }
    }

    /// `localhost` on the default port
    pub fn localhost() -> Self {
        Self::new("localhost", DEFAULT_PORT)
    }

    /// Select this database after connecting
    #[must_use]
    pub fn with_database(mut self, database: u32) -> Self {
        self.database = Some(database);
        self
    }

    /// Authenticate with a password for the default user
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: None,
            password: password.into(),
        });
        self
    }

    /// Authenticate with an ACL user
    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: Some(username.into()),
            password: password.into(),
        });
        self
    }

    /// Mark the endpoint as TLS-secured
    #[must_use]
    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    /// Same options, different address.
    ///
    /// Used for endpoints discovered from a cluster or a sentinel.
    #[must_use]
    pub fn with_address(&self, host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..self.clone()
        }
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::localhost()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A node of a cluster shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node ID
    pub id: String,
    /// Address of the node
    pub endpoint: Endpoint,
    /// Primary or replica
    pub role: Role,
    /// Reported health
    pub health: Health,
}

/// Conversion into a single command argument
pub trait ToArg {
    /// Wire bytes of the argument
    fn to_arg(&self) -> Bytes;
}

impl ToArg for str {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for String {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for [u8] {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for Vec<u8> {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for Bytes {
    fn to_arg(&self) -> Bytes {
        self.clone()
    }
}

impl ToArg for f64 {
    fn to_arg(&self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

macro_rules! int_to_arg {
    ($($t:ty),*) => {
        $(impl ToArg for $t {
            fn to_arg(&self) -> Bytes {
                Bytes::from(self.to_string())
            }
        })*
    };
}

int_to_arg!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

impl<T: ToArg + ?Sized> ToArg for &T {
    fn to_arg(&self) -> Bytes {
        (**self).to_arg()
    }
}

/// A command: name first, then arguments, all as raw bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    /// Start a command with its name
    pub fn new(name: impl ToArg) -> Self {
        Self {
            args: vec![name.to_arg()],
        }
    }

    /// Build a command from a full argument vector
    pub fn from_args<I, A>(args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: ToArg,
    {
        Self {
            args: args.into_iter().map(|a| a.to_arg()).collect(),
        }
    }

    /// Append an argument
    #[must_use]
    pub fn arg(mut self, arg: impl ToArg) -> Self {
        self.args.push(arg.to_arg());
        self
    }

    /// Append several arguments
    #[must_use]
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: ToArg,
    {
        self.args.extend(args.into_iter().map(|a| a.to_arg()));
        self
    }

    /// Command name, as sent
    pub fn name(&self) -> &[u8] {
        self.args.first().map_or(&[][..], |a| &a[..])
    }

    /// Whether the name matches, ignoring ASCII case
    pub fn is(&self, name: &str) -> bool {
        self.name().eq_ignore_ascii_case(name.as_bytes())
    }

    /// Argument at `index`, where 0 is the command name
    pub fn key(&self, index: usize) -> Option<&[u8]> {
        self.args.get(index).map(|a| &a[..])
    }

    /// All arguments including the name
    pub fn parts(&self) -> &[Bytes] {
        &self.args
    }
}
