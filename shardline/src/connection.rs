//! Connection management
//!
//! This module wraps a duplex byte stream with the RESP codec, runs the
//! AUTH/SELECT handshake and defines the [`Connector`] seam the pool uses to
//! open new connections.

use crate::protocol::{FrameScan, RespDecoder, RespEncoder};
use async_trait::async_trait;
use bytes::BytesMut;
use shardline_core::{
    config::ConnectionConfig,
    error::{RedisError, RedisResult},
    types::{Command, Endpoint},
    value::RespValue,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Any duplex byte stream a [`Connection`] can run over.
///
/// Implemented for every tokio stream, so TLS streams or in-memory pipes can
/// be plugged in through a custom [`Connector`].
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// A framed connection to one server
pub struct Connection {
    stream: Box<dyn AsyncStream>,
    read_buffer: BytesMut,
    // progress through the reply at the front of `read_buffer`
    scan: FrameScan,
    write_buffer: BytesMut,
    // requests written whose replies were not read yet
    pending: usize,
    viable: bool,
    closed: bool,
    subscribed: bool,
    in_multi: bool,
    watching: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("viable", &self.viable)
            .field("closed", &self.closed)
            .field("pending", &self.pending)
            .field("buffered", &self.read_buffer.len())
            .finish()
    }
}

impl Connection {
    /// Wrap an already connected stream
    pub fn new<S: AsyncStream + 'static>(stream: S) -> Self {
        Self {
            stream: Box::new(stream),
            read_buffer: BytesMut::with_capacity(8192),
            scan: FrameScan::default(),
            write_buffer: BytesMut::with_capacity(1024),
            pending: 0,
            viable: true,
            closed: false,
            subscribed: false,
            in_multi: false,
            watching: false,
        }
    }

    /// Authenticate and select the database configured on the endpoint
    pub async fn handshake(&mut self, endpoint: &Endpoint) -> RedisResult<()> {
        if let Some(credentials) = &endpoint.credentials {
            debug!("Authenticating with {}", endpoint);
            let mut auth = Command::new("AUTH");
            if let Some(username) = &credentials.username {
                auth = auth.arg(username);
            }
            auth = auth.arg(&credentials.password);

            self.write_request(&auth);
            match self.read_response().await? {
                RespValue::SimpleString(ref s) if s == "OK" => {}
                RespValue::Error(e) => return Err(RedisError::Auth(e)),
                other => {
                    return Err(RedisError::Auth(format!(
                        "Unexpected authentication response: {:?}",
                        other
                    )))
                }
            }
        }

        if let Some(database) = endpoint.database.filter(|&db| db != 0) {
            debug!("Selecting database {} on {}", database, endpoint);
            let response = self.call(&Command::new("SELECT").arg(database)).await?;
            if !response.is_ok() {
                return Err(RedisError::UnexpectedResponse(format!("{:?}", response)));
            }
        }

        Ok(())
    }

    /// Buffer a request without touching the socket
    pub fn write_request(&mut self, command: &Command) {
        RespEncoder::encode_command(command, &mut self.write_buffer);
        self.pending += 1;

        if command.is("SUBSCRIBE") || command.is("PSUBSCRIBE") || command.is("SSUBSCRIBE") {
            // There is no way back out of subscriber mode.
            self.subscribed = true;
        } else if command.is("MULTI") {
            self.in_multi = true;
        } else if command.is("WATCH") {
            self.watching = true;
        } else if command.is("EXEC") || command.is("DISCARD") {
            self.in_multi = false;
            self.watching = false;
        } else if command.is("UNWATCH") {
            self.watching = false;
        }
    }

    /// Write out every buffered request
    pub async fn flush(&mut self) -> RedisResult<()> {
        if self.write_buffer.is_empty() {
            return Ok(());
        }

        // A write cut short leaves the stream desynchronized.
        let viable = std::mem::replace(&mut self.viable, false);
        self.stream.write_all(&self.write_buffer).await?;
        self.stream.flush().await?;
        self.write_buffer.clear();
        self.viable = viable;
        Ok(())
    }

    /// Flush pending requests, then read exactly one reply.
    ///
    /// Error replies are returned as [`RespValue::Error`]. The read is
    /// cancel-safe: partially received bytes stay buffered.
    pub async fn read_response(&mut self) -> RedisResult<RespValue> {
        self.flush().await?;

        let viable = std::mem::replace(&mut self.viable, false);
        let value = self.read_value().await?;
        self.viable = viable;
        self.pending = self.pending.saturating_sub(1);
        Ok(value)
    }

    async fn read_value(&mut self) -> RedisResult<RespValue> {
        loop {
            if let Some(len) = RespDecoder::check(&self.read_buffer, &mut self.scan)? {
                self.scan = FrameScan::default();
                let frame = self.read_buffer.split_to(len).freeze();
                return RespDecoder::parse(&frame);
            }

            let n = self.stream.read_buf(&mut self.read_buffer).await?;
            if n == 0 {
                self.closed = true;
                return Err(RedisError::Connection(
                    "Connection closed by server".to_string(),
                ));
            }
        }
    }

    /// Send one command and read its reply, raising error replies
    pub async fn call(&mut self, command: &Command) -> RedisResult<RespValue> {
        self.write_request(command);
        match self.read_response().await? {
            RespValue::Error(msg) => Err(RedisError::from_reply(msg)),
            value => Ok(value),
        }
    }

    /// Shut down the stream. The connection is unusable afterwards.
    pub async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.viable = false;
            let _ = self.stream.shutdown().await;
        }
    }

    /// Whether the last I/O completed without failure
    pub fn is_viable(&self) -> bool {
        self.viable
    }

    /// Whether the stream was closed locally or by the peer
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Requests sent or buffered whose replies were not read
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Whether the connection can go back into a pool.
    ///
    /// A connection with unread replies, an open MULTI or WATCH, or one that
    /// entered subscriber mode cannot be handed to another caller.
    pub fn reusable(&self) -> bool {
        self.viable
            && !self.closed
            && self.pending == 0
            && !self.subscribed
            && !self.in_multi
            && !self.watching
    }
}

/// Opens new connections for a pool.
///
/// Implementations perform the network connect plus any handshake. The pool
/// calls this once per new connection, so implementations that resolve the
/// target per call (see [`crate::sentinel::SentinelConnector`]) pick up
/// topology changes lazily.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open and handshake a new connection
    async fn connect(&self) -> RedisResult<Connection>;
}

/// Connects to a fixed endpoint over TCP
#[derive(Debug, Clone)]
pub struct TcpConnector {
    endpoint: Endpoint,
    config: ConnectionConfig,
}

impl TcpConnector {
    /// Create a connector for `endpoint`
    pub fn new(endpoint: Endpoint, config: ConnectionConfig) -> Self {
        Self { endpoint, config }
    }

    /// The endpoint this connector dials
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Connect to `endpoint` and run the handshake
    pub async fn open(endpoint: &Endpoint, config: &ConnectionConfig) -> RedisResult<Connection> {
        if endpoint.secure {
            return Err(RedisError::Config(format!(
                "{} requires TLS; supply a Connector that wraps the stream",
                endpoint
            )));
        }

        let addr = endpoint.address();
        debug!("Connecting to {}", addr);

        let stream = timeout(config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| RedisError::Timeout)?
            .map_err(|e| RedisError::Connection(format!("Failed to connect to {}: {}", addr, e)))?;

        stream.set_nodelay(config.nodelay)?;
        if let Some(keepalive) = config.tcp_keepalive {
            let socket = socket2::SockRef::from(&stream);
            socket
                .set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(keepalive))
                .map_err(|e| {
                    RedisError::Connection(format!("Failed to set TCP keepalive: {}", e))
                })?;
        }

        let mut conn = Connection::new(stream);
        conn.handshake(endpoint).await?;
        Ok(conn)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> RedisResult<Connection> {
        Self::open(&self.endpoint, &self.config).await
    }
}
