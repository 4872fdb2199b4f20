//! Connection pooling
//!
//! A [`Pool`] owns every connection to one upstream, bounded by an optional
//! limit. Callers get exclusive [`PooledConnection`] leases; viable
//! connections are recycled on release and broken ones are discarded.

use crate::connection::{Connection, Connector};
use parking_lot::Mutex;
use shardline_core::{
    config::PoolConfig,
    error::{RedisError, RedisResult},
};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Connections leased, idle or being opened
    pub active: usize,
    /// Idle connections ready for reuse
    pub available: usize,
    /// Configured limit
    pub limit: Option<usize>,
}

struct PoolState {
    available: VecDeque<Connection>,
    // leased + available + connecting
    active: usize,
    closed: bool,
}

/// A bounded pool of connections to one endpoint
pub struct Pool {
    connector: Arc<dyn Connector>,
    limit: Option<usize>,
    state: Mutex<PoolState>,
    released: Notify,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").field("status", &self.status()).finish()
    }
}

enum Step {
    Ready(Connection),
    Connect,
    Wait,
}

impl Pool {
    /// Create an empty pool. Connections are opened lazily.
    ///
    /// A limit of zero is raised to one.
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Arc<Self> {
        if config.limit == Some(0) {
            warn!("Pool limit of 0 would never lease a connection, using 1");
        }
        Arc::new(Self {
            connector,
            limit: config.limit.map(|limit| limit.max(1)),
            state: Mutex::new(PoolState {
                available: VecDeque::new(),
                active: 0,
                closed: false,
            }),
            released: Notify::new(),
        })
    }

    /// Lease a connection, opening one if under the limit or waiting for a
    /// release otherwise.
    ///
    /// A connector failure is returned to this caller only; the reserved
    /// capacity is freed and a waiter is woken to retry.
    pub async fn acquire(self: &Arc<Self>) -> RedisResult<PooledConnection> {
        loop {
            // Register before inspecting state so a release in between is not missed.
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let step = {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(RedisError::Pool("pool is closed".to_string()));
                }

                let mut step = Step::Wait;
                while let Some(conn) = state.available.pop_back() {
                    if conn.reusable() {
                        step = Step::Ready(conn);
                        break;
                    }
                    state.active -= 1;
                }

                if matches!(step, Step::Wait) && self.limit.map_or(true, |limit| state.active < limit) {
                    state.active += 1;
                    step = Step::Connect;
                }
                step
            };

            match step {
                Step::Ready(conn) => return Ok(PooledConnection::new(conn, self.clone())),
                Step::Connect => {
                    let reservation = Reservation { pool: self };
                    debug!("Opening pooled connection ({:?})", self.status());
                    let conn = self.connector.connect().await?;
                    reservation.keep();
                    return Ok(PooledConnection::new(conn, self.clone()));
                }
                Step::Wait => released.await,
            }
        }
    }

    /// Close the pool: idle connections are shut down and waiters fail.
    ///
    /// Outstanding leases keep their connection until they are returned, at
    /// which point it is closed rather than pooled.
    pub async fn close(&self) {
        let idle: Vec<Connection> = {
            let mut state = self.state.lock();
            state.closed = true;
            let idle: Vec<Connection> = state.available.drain(..).collect();
            state.active -= idle.len();
            idle
        };
        self.released.notify_waiters();

        debug!("Closing pool with {} idle connections", idle.len());
        for mut conn in idle {
            conn.close().await;
        }
    }

    /// Whether [`Pool::close`] was called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Current occupancy
    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        PoolStatus {
            active: state.active,
            available: state.available.len(),
            limit: self.limit,
        }
    }

    fn put_back(&self, conn: Connection) {
        {
            let mut state = self.state.lock();
            if conn.reusable() && !state.closed {
                state.available.push_back(conn);
            } else {
                state.active -= 1;
                drop(conn);
            }
        }
        self.released.notify_one();
    }

    fn free_slot(&self) {
        self.state.lock().active -= 1;
        self.released.notify_one();
    }
}

/// Frees a reserved slot unless the connect attempt succeeded.
struct Reservation<'a> {
    pool: &'a Pool,
}

impl Reservation<'_> {
    fn keep(self) {
        std::mem::forget(self);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.pool.free_slot();
    }
}

/// An exclusive lease on a pooled connection.
///
/// Dropping the lease releases it, the same as [`PooledConnection::release`].
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<Pool>,
}

impl PooledConnection {
    fn new(conn: Connection, pool: Arc<Pool>) -> Self {
        Self {
            conn: Some(conn),
            pool,
        }
    }

    /// Return the connection; it is pooled if still reusable.
    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn);
        }
    }

    /// Close the connection instead of pooling it
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn);
            self.pool.free_slot();
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("lease holds its connection until released")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("lease holds its connection until released")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish()
    }
}
