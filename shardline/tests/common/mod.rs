//! In-process fake server for integration tests
//!
//! Speaks enough of the protocol to exercise the client: strings, lists and
//! counters, MULTI/EXEC/WATCH, pub/sub (plain, pattern and sharded), a
//! `CLUSTER SHARDS` view with MOVED replies for slots owned elsewhere, and
//! the `SENTINEL` subcommands.

#![allow(dead_code)]

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use shardline::protocol::{RespDecoder, RespEncoder};
use shardline::{slot_for, Endpoint, RespValue};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fail the test instead of hanging
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("test timed out")
}

/// An endpoint nothing listens on
pub async fn dead_endpoint() -> Endpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    Endpoint::new("127.0.0.1", port)
}

pub fn endpoint(addr: SocketAddr) -> Endpoint {
    Endpoint::new("127.0.0.1", addr.port())
}

/// Slot ownership shared by every node of a fake cluster
#[derive(Clone, Default)]
pub struct Layout(Arc<Mutex<Vec<(u16, u16, SocketAddr)>>>);

impl Layout {
    pub fn set(&self, ranges: Vec<(u16, u16, SocketAddr)>) {
        *self.0.lock() = ranges;
    }

    pub fn owner(&self, slot: u16) -> Option<SocketAddr> {
        self.0
            .lock()
            .iter()
            .find(|(start, end, _)| (*start..=*end).contains(&slot))
            .map(|(_, _, addr)| *addr)
    }

    /// Hand one slot to another node
    pub fn move_slot(&self, slot: u16, to: SocketAddr) {
        let mut ranges = self.0.lock();
        let mut next = Vec::new();
        for &(start, end, addr) in ranges.iter() {
            if (start..=end).contains(&slot) {
                if start < slot {
                    next.push((start, slot - 1, addr));
                }
                if slot < end {
                    next.push((slot + 1, end, addr));
                }
            } else {
                next.push((start, end, addr));
            }
        }
        next.push((slot, slot, to));
        next.sort();
        *ranges = next;
    }
}

pub struct SentinelState {
    pub master_name: String,
    pub master: SocketAddr,
    pub replicas: Vec<(SocketAddr, String)>,
}

/// State a fake sentinel reports
#[derive(Clone)]
pub struct Sentinel(Arc<Mutex<SentinelState>>);

impl Sentinel {
    pub fn new(master_name: &str, master: SocketAddr) -> Self {
        Self(Arc::new(Mutex::new(SentinelState {
            master_name: master_name.to_string(),
            master,
            replicas: Vec::new(),
        })))
    }

    pub fn add_replica(&self, addr: SocketAddr, flags: &str) {
        self.0.lock().replicas.push((addr, flags.to_string()));
    }

    pub fn master(&self) -> SocketAddr {
        self.0.lock().master
    }
}

#[derive(Clone, Default)]
pub struct Options {
    pub password: Option<String>,
    pub layout: Option<Layout>,
    pub sentinel: Option<Sentinel>,
}

enum Entry {
    Str(Bytes),
    List(VecDeque<Bytes>),
}

#[derive(Default)]
struct Store {
    entries: HashMap<Bytes, Entry>,
    versions: HashMap<Bytes, u64>,
    clock: u64,
}

impl Store {
    fn touch(&mut self, key: &Bytes) {
        self.clock += 1;
        self.versions.insert(key.clone(), self.clock);
    }

    fn version(&self, key: &Bytes) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    Channel,
    Pattern,
    Shard,
}

struct Subscriber {
    conn: u64,
    kind: Kind,
    target: Bytes,
    tx: mpsc::UnboundedSender<RespValue>,
}

struct Session {
    id: u64,
    push: mpsc::UnboundedSender<RespValue>,
    authed: bool,
    multi: Option<Vec<Vec<Bytes>>>,
    dirty: bool,
    watched: Vec<(Bytes, u64)>,
}

struct Shared {
    addr: SocketAddr,
    options: Options,
    store: Mutex<Store>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_conn: AtomicU64,
    accepted: AtomicUsize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub struct FakeServer {
    shared: Arc<Shared>,
    accept: JoinHandle<()>,
}

impl FakeServer {
    pub async fn start(options: Options) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve_on(listener, options)
    }

    pub async fn standalone() -> Self {
        Self::start(Options::default()).await
    }

    /// Bind first, configure later: cluster layouts need every address
    pub async fn bind() -> TcpListener {
        TcpListener::bind("127.0.0.1:0").await.unwrap()
    }

    pub fn serve_on(listener: TcpListener, options: Options) -> Self {
        let shared = Arc::new(Shared {
            addr: listener.local_addr().unwrap(),
            options,
            store: Mutex::new(Store::default()),
            subscribers: Mutex::new(Vec::new()),
            next_conn: AtomicU64::new(1),
            accepted: AtomicUsize::new(0),
            tasks: Mutex::new(Vec::new()),
        });

        let accept = tokio::spawn({
            let shared = shared.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    shared.accepted.fetch_add(1, Ordering::SeqCst);
                    let task = tokio::spawn(serve(shared.clone(), stream));
                    shared.tasks.lock().push(task);
                }
            }
        });

        Self { shared, accept }
    }

    pub fn addr(&self) -> SocketAddr {
        self.shared.addr
    }

    pub fn endpoint(&self) -> Endpoint {
        endpoint(self.shared.addr)
    }

    /// Connections accepted so far
    pub fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Read a string key directly from the store
    pub fn get(&self, key: &str) -> Option<Bytes> {
        match self.shared.store.lock().entries.get(key.as_bytes()) {
            Some(Entry::Str(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Drop the listener and every open connection
    pub fn stop(&self) {
        self.accept.abort();
        for task in self.shared.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve(shared: Arc<Shared>, stream: TcpStream) {
    let id = shared.next_conn.fetch_add(1, Ordering::SeqCst);
    let (mut reader, mut writer) = stream.into_split();
    let (push, mut pushed) = mpsc::unbounded_channel();
    let mut session = Session {
        id,
        push,
        authed: shared.options.password.is_none(),
        multi: None,
        dirty: false,
        watched: Vec::new(),
    };
    let mut input = BytesMut::with_capacity(4096);
    let mut output = BytesMut::new();

    'conn: loop {
        loop {
            let (frame, consumed) = {
                let mut cursor = Cursor::new(&input[..]);
                match RespDecoder::decode(&mut cursor) {
                    Ok(Some(frame)) => (frame, cursor.position() as usize),
                    Ok(None) => break,
                    Err(_) => break 'conn,
                }
            };
            input.advance(consumed);

            let Some(args) = frame_args(frame) else {
                break 'conn;
            };
            for reply in shared.dispatch(&mut session, args) {
                RespEncoder::encode(&reply, &mut output);
            }
        }

        if !output.is_empty() {
            if writer.write_all(&output).await.is_err() {
                break;
            }
            output.clear();
        }

        tokio::select! {
            read = reader.read_buf(&mut input) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
            Some(message) = pushed.recv() => RespEncoder::encode(&message, &mut output),
        }
    }

    shared.subscribers.lock().retain(|s| s.conn != id);
}

fn frame_args(frame: RespValue) -> Option<Vec<Bytes>> {
    let RespValue::Array(items) = frame else {
        return None;
    };
    let args: Vec<Bytes> = items.iter().filter_map(|item| item.as_bytes().ok()).collect();
    (!args.is_empty() && args.len() == items.len()).then_some(args)
}

fn upper(arg: Option<&Bytes>) -> String {
    arg.map(|a| String::from_utf8_lossy(a).to_ascii_uppercase())
        .unwrap_or_default()
}

fn ok() -> RespValue {
    RespValue::SimpleString("OK".to_string())
}

fn err(msg: impl Into<String>) -> RespValue {
    RespValue::Error(msg.into())
}

fn bulk(value: impl AsRef<[u8]>) -> RespValue {
    RespValue::BulkString(Bytes::copy_from_slice(value.as_ref()))
}

fn wrongtype() -> RespValue {
    err("WRONGTYPE Operation against a key holding the wrong kind of value")
}

fn wrong_arity(name: &str) -> RespValue {
    err(format!(
        "ERR wrong number of arguments for '{}' command",
        name.to_ascii_lowercase()
    ))
}

const QUEUEABLE: &[&str] = &[
    "PING", "SELECT", "SET", "GET", "DEL", "INCR", "LPUSH", "LRANGE", "PUBLISH", "SPUBLISH",
];
const KEYED: &[&str] = &["SET", "GET", "DEL", "INCR", "LPUSH", "LRANGE", "SPUBLISH"];

fn glob(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some((b'*', rest)) => (0..=text.len()).any(|i| glob(rest, &text[i..])),
        Some((&c, rest)) => text.first() == Some(&c) && glob(rest, &text[1..]),
    }
}

impl Shared {
    fn dispatch(&self, session: &mut Session, args: Vec<Bytes>) -> Vec<RespValue> {
        let name = upper(args.first());

        if name == "AUTH" {
            let password = args.last().map(|p| String::from_utf8_lossy(p).to_string());
            return vec![if args.len() >= 2 && password == self.options.password {
                session.authed = true;
                ok()
            } else {
                err("WRONGPASS invalid username-password pair or user is disabled.")
            }];
        }
        if !session.authed {
            return vec![err("NOAUTH Authentication required.")];
        }

        if session.multi.is_some() && !matches!(name.as_str(), "EXEC" | "DISCARD" | "MULTI" | "WATCH")
        {
            if !QUEUEABLE.contains(&name.as_str()) {
                session.dirty = true;
                return vec![err(format!(
                    "ERR unknown command '{}'",
                    String::from_utf8_lossy(&args[0])
                ))];
            }
            if let Some(queued) = session.multi.as_mut() {
                queued.push(args);
            }
            return vec![RespValue::SimpleString("QUEUED".to_string())];
        }

        match name.as_str() {
            "MULTI" => vec![if session.multi.is_some() {
                err("ERR MULTI calls can not be nested")
            } else {
                session.multi = Some(Vec::new());
                ok()
            }],
            "EXEC" => {
                let Some(queued) = session.multi.take() else {
                    return vec![err("ERR EXEC without MULTI")];
                };
                let watched = std::mem::take(&mut session.watched);
                if std::mem::take(&mut session.dirty) {
                    return vec![err(
                        "EXECABORT Transaction discarded because of previous errors.",
                    )];
                }
                let changed = {
                    let store = self.store.lock();
                    watched.iter().any(|(key, version)| store.version(key) != *version)
                };
                if changed {
                    return vec![RespValue::NullArray];
                }
                vec![RespValue::Array(
                    queued.iter().map(|command| self.execute(command)).collect(),
                )]
            }
            "DISCARD" => vec![if session.multi.take().is_some() {
                session.watched.clear();
                session.dirty = false;
                ok()
            } else {
                err("ERR DISCARD without MULTI")
            }],
            "WATCH" => {
                if session.multi.is_some() {
                    return vec![err("ERR WATCH inside MULTI is not allowed")];
                }
                let store = self.store.lock();
                for key in &args[1..] {
                    session.watched.push((key.clone(), store.version(key)));
                }
                vec![ok()]
            }
            "UNWATCH" => {
                session.watched.clear();
                vec![ok()]
            }
            "SUBSCRIBE" => self.subscribe(session, Kind::Channel, "subscribe", &args[1..]),
            "PSUBSCRIBE" => self.subscribe(session, Kind::Pattern, "psubscribe", &args[1..]),
            "SSUBSCRIBE" => {
                if let Some(moved) = args[1..].iter().find_map(|ch| self.redirect(ch)) {
                    return vec![moved];
                }
                self.subscribe(session, Kind::Shard, "ssubscribe", &args[1..])
            }
            "UNSUBSCRIBE" => self.unsubscribe(session, Kind::Channel, "unsubscribe", &args[1..]),
            "PUNSUBSCRIBE" => self.unsubscribe(session, Kind::Pattern, "punsubscribe", &args[1..]),
            "SUNSUBSCRIBE" => self.unsubscribe(session, Kind::Shard, "sunsubscribe", &args[1..]),
            _ => vec![self.execute(&args)],
        }
    }

    fn redirect(&self, key: &[u8]) -> Option<RespValue> {
        let layout = self.options.layout.as_ref()?;
        let slot = slot_for(key);
        match layout.owner(slot) {
            Some(owner) if owner == self.addr => None,
            Some(owner) => Some(err(format!("MOVED {} {}", slot, owner))),
            None => Some(err("CLUSTERDOWN Hash slot not served")),
        }
    }

    fn execute(&self, args: &[Bytes]) -> RespValue {
        let name = upper(args.first());
        if KEYED.contains(&name.as_str()) {
            match args.get(1) {
                None => return wrong_arity(&name),
                Some(key) => {
                    if let Some(moved) = self.redirect(key) {
                        return moved;
                    }
                }
            }
        }

        let mut store = self.store.lock();
        match name.as_str() {
            "PING" => RespValue::SimpleString("PONG".to_string()),
            "SELECT" => ok(),
            "SET" => {
                if args.len() != 3 {
                    return wrong_arity(&name);
                }
                store.entries.insert(args[1].clone(), Entry::Str(args[2].clone()));
                store.touch(&args[1]);
                ok()
            }
            "GET" => match store.entries.get(&args[1]) {
                Some(Entry::Str(value)) => RespValue::BulkString(value.clone()),
                Some(Entry::List(_)) => wrongtype(),
                None => RespValue::Null,
            },
            "DEL" => {
                let mut removed = 0;
                for key in &args[1..] {
                    if store.entries.remove(key).is_some() {
                        store.touch(key);
                        removed += 1;
                    }
                }
                RespValue::Integer(removed)
            }
            "INCR" => {
                let current = match store.entries.get(&args[1]) {
                    None => 0,
                    Some(Entry::List(_)) => return wrongtype(),
                    Some(Entry::Str(value)) => match std::str::from_utf8(value)
                        .ok()
                        .and_then(|v| v.parse::<i64>().ok())
                    {
                        Some(n) => n,
                        None => return err("ERR value is not an integer or out of range"),
                    },
                };
                let next = current + 1;
                store
                    .entries
                    .insert(args[1].clone(), Entry::Str(Bytes::from(next.to_string())));
                store.touch(&args[1]);
                RespValue::Integer(next)
            }
            "LPUSH" => {
                if args.len() < 3 {
                    return wrong_arity(&name);
                }
                let len = match store
                    .entries
                    .entry(args[1].clone())
                    .or_insert_with(|| Entry::List(VecDeque::new()))
                {
                    Entry::List(list) => {
                        for value in &args[2..] {
                            list.push_front(value.clone());
                        }
                        list.len()
                    }
                    Entry::Str(_) => return wrongtype(),
                };
                store.touch(&args[1]);
                RespValue::Integer(len as i64)
            }
            "LRANGE" => {
                let bound = |i: usize| {
                    args.get(i)
                        .and_then(|a| std::str::from_utf8(a).ok())
                        .and_then(|a| a.parse::<i64>().ok())
                };
                let (Some(start), Some(stop)) = (bound(2), bound(3)) else {
                    return err("ERR value is not an integer or out of range");
                };
                match store.entries.get(&args[1]) {
                    None => RespValue::Array(Vec::new()),
                    Some(Entry::Str(_)) => wrongtype(),
                    Some(Entry::List(list)) => {
                        let len = list.len() as i64;
                        let norm = |i: i64| if i < 0 { (len + i).max(0) } else { i };
                        let (start, stop) = (norm(start), norm(stop).min(len - 1));
                        if start > stop {
                            return RespValue::Array(Vec::new());
                        }
                        RespValue::Array(
                            list.iter()
                                .skip(start as usize)
                                .take((stop - start + 1) as usize)
                                .map(|v| RespValue::BulkString(v.clone()))
                                .collect(),
                        )
                    }
                }
            }
            "PUBLISH" | "SPUBLISH" if args.len() != 3 => wrong_arity(&name),
            "PUBLISH" => {
                drop(store);
                self.publish(Kind::Channel, &args[1], &args[2])
            }
            "SPUBLISH" => {
                drop(store);
                self.publish(Kind::Shard, &args[1], &args[2])
            }
            "CLUSTER" => match (&self.options.layout, upper(args.get(1)).as_str()) {
                (Some(layout), "SHARDS") => shards(layout),
                _ => err("ERR This instance has cluster support disabled"),
            },
            "SENTINEL" => match &self.options.sentinel {
                Some(sentinel) => sentinel_command(sentinel, args),
                None => err("ERR unknown command 'SENTINEL'"),
            },
            _ => err(format!(
                "ERR unknown command '{}'",
                String::from_utf8_lossy(&args[0])
            )),
        }
    }

    fn subscribe(
        &self,
        session: &Session,
        kind: Kind,
        reply: &str,
        targets: &[Bytes],
    ) -> Vec<RespValue> {
        let mut subscribers = self.subscribers.lock();
        let mut replies = Vec::new();
        for target in targets {
            let known = subscribers
                .iter()
                .any(|s| s.conn == session.id && s.kind == kind && s.target == *target);
            if !known {
                subscribers.push(Subscriber {
                    conn: session.id,
                    kind,
                    target: target.clone(),
                    tx: session.push.clone(),
                });
            }
            let count = subscribers.iter().filter(|s| s.conn == session.id).count();
            replies.push(RespValue::Array(vec![
                bulk(reply),
                RespValue::BulkString(target.clone()),
                RespValue::Integer(count as i64),
            ]));
        }
        replies
    }

    fn unsubscribe(
        &self,
        session: &Session,
        kind: Kind,
        reply: &str,
        targets: &[Bytes],
    ) -> Vec<RespValue> {
        let mut subscribers = self.subscribers.lock();
        let targets: Vec<Bytes> = if targets.is_empty() {
            subscribers
                .iter()
                .filter(|s| s.conn == session.id && s.kind == kind)
                .map(|s| s.target.clone())
                .collect()
        } else {
            targets.to_vec()
        };

        let mut replies = Vec::new();
        for target in targets {
            subscribers.retain(|s| !(s.conn == session.id && s.kind == kind && s.target == target));
            let count = subscribers.iter().filter(|s| s.conn == session.id).count();
            replies.push(RespValue::Array(vec![
                bulk(reply),
                RespValue::BulkString(target),
                RespValue::Integer(count as i64),
            ]));
        }
        replies
    }

    fn publish(&self, kind: Kind, channel: &Bytes, payload: &Bytes) -> RespValue {
        let subscribers = self.subscribers.lock();
        let mut delivered = 0;
        for subscriber in subscribers.iter() {
            let message = match (subscriber.kind, kind) {
                (Kind::Channel, Kind::Channel) if subscriber.target == *channel => vec![
                    bulk("message"),
                    RespValue::BulkString(channel.clone()),
                    RespValue::BulkString(payload.clone()),
                ],
                (Kind::Pattern, Kind::Channel) if glob(&subscriber.target, channel) => vec![
                    bulk("pmessage"),
                    RespValue::BulkString(subscriber.target.clone()),
                    RespValue::BulkString(channel.clone()),
                    RespValue::BulkString(payload.clone()),
                ],
                (Kind::Shard, Kind::Shard) if subscriber.target == *channel => vec![
                    bulk("smessage"),
                    RespValue::BulkString(channel.clone()),
                    RespValue::BulkString(payload.clone()),
                ],
                _ => continue,
            };
            if subscriber.tx.send(RespValue::Array(message)).is_ok() {
                delivered += 1;
            }
        }
        RespValue::Integer(delivered)
    }
}

fn shards(layout: &Layout) -> RespValue {
    let ranges = layout.0.lock().clone();
    let mut nodes: Vec<(SocketAddr, Vec<RespValue>)> = Vec::new();
    for (start, end, addr) in ranges {
        let idx = match nodes.iter().position(|(node, _)| *node == addr) {
            Some(idx) => idx,
            None => {
                nodes.push((addr, Vec::new()));
                nodes.len() - 1
            }
        };
        nodes[idx].1.push(RespValue::Integer(start as i64));
        nodes[idx].1.push(RespValue::Integer(end as i64));
    }

    RespValue::Array(
        nodes
            .into_iter()
            .map(|(addr, slots)| {
                RespValue::Array(vec![
                    bulk("slots"),
                    RespValue::Array(slots),
                    bulk("nodes"),
                    RespValue::Array(vec![RespValue::Array(vec![
                        bulk("id"),
                        bulk(format!("node-{}", addr.port())),
                        bulk("port"),
                        RespValue::Integer(addr.port() as i64),
                        bulk("ip"),
                        bulk(addr.ip().to_string()),
                        bulk("endpoint"),
                        bulk(addr.ip().to_string()),
                        bulk("role"),
                        bulk("master"),
                        bulk("replication-offset"),
                        RespValue::Integer(0),
                        bulk("health"),
                        bulk("online"),
                    ])]),
                ])
            })
            .collect(),
    )
}

fn flat(pairs: Vec<(&str, String)>) -> RespValue {
    RespValue::Array(
        pairs
            .into_iter()
            .flat_map(|(k, v)| [bulk(k), bulk(v)])
            .collect(),
    )
}

fn sentinel_command(sentinel: &Sentinel, args: &[Bytes]) -> RespValue {
    let mut state = sentinel.0.lock();
    let known = args
        .get(2)
        .map_or(false, |name| name[..] == *state.master_name.as_bytes());
    let master = |state: &SentinelState| {
        flat(vec![
            ("name", state.master_name.clone()),
            ("ip", state.master.ip().to_string()),
            ("port", state.master.port().to_string()),
            ("flags", "master".to_string()),
            ("num-slaves", state.replicas.len().to_string()),
            ("num-other-sentinels", "0".to_string()),
            ("quorum", "1".to_string()),
        ])
    };

    match upper(args.get(1)).as_str() {
        "GET-MASTER-ADDR-BY-NAME" if known => RespValue::Array(vec![
            bulk(state.master.ip().to_string()),
            bulk(state.master.port().to_string()),
        ]),
        "GET-MASTER-ADDR-BY-NAME" => RespValue::NullArray,
        "MASTERS" => RespValue::Array(vec![master(&*state)]),
        "MASTER" if known => master(&*state),
        "SLAVES" | "REPLICAS" if known => RespValue::Array(
            state
                .replicas
                .iter()
                .map(|(addr, flags)| {
                    flat(vec![
                        ("name", addr.to_string()),
                        ("ip", addr.ip().to_string()),
                        ("port", addr.port().to_string()),
                        ("flags", flags.clone()),
                    ])
                })
                .collect(),
        ),
        "FAILOVER" if known => {
            if state.replicas.is_empty() {
                return err("NOGOODSLAVE No suitable replica to promote");
            }
            let (promoted, _) = state.replicas.remove(0);
            let demoted = std::mem::replace(&mut state.master, promoted);
            state.replicas.push((demoted, "slave".to_string()));
            ok()
        }
        "MASTER" | "SLAVES" | "REPLICAS" | "FAILOVER" => {
            err("ERR No such master with that name")
        }
        _ => err("ERR Unknown sentinel subcommand"),
    }
}
