//! Line-protocol front-end and sharded timeline registry.
//!
//! The wire format is one record per line over TCP:
//!
//! ```text
//! KEY COUNT TIME\n
//! ```
//!
//! Records dispatch to [`Timeline::put`] on the shard that owns `KEY`. Each
//! shard is a worker task exclusively owning the timelines whose keys hash
//! to it, so the single-writer discipline a timeline requires is structural:
//! every operation on one timeline runs on its owning shard, serialized by
//! the shard's command channel. Parallelism comes from spreading keys across
//! shards, never from concurrency within one timeline.
//!
//! Shutdown closes the listener, drains in-flight connections and shard
//! queues, and flushes every open timeline.

use std::collections::hash_map::{DefaultHasher, Entry};
use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::AsyncBufReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::error::{Result, TallyError};
use crate::timeline::{Count, DiffResult, GetResult, SummaryResult, Time, Timeline};

/// Default listen address.
pub const DEFAULT_ADDR: &str = "0.0.0.0:2003";

/// Default bucket resolution in time units.
pub const DEFAULT_RESOLUTION: u64 = 10;

/// Default per-shard command queue depth.
pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

/// Longest accepted key, in bytes.
pub const MAX_KEY_LEN: usize = 256;

/// How long shutdown waits for open connections before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Configuration for the ingest server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address for the line protocol.
    pub addr: String,
    /// Root directory; each key stores its timeline in a subdirectory.
    pub data_dir: PathBuf,
    /// Bucket resolution for every timeline, fixed at creation.
    pub resolution: u64,
    /// Number of shard worker tasks.
    pub shards: usize,
    /// Command queue depth per shard.
    pub queue_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            data_dir: PathBuf::from("./tally-data"),
            resolution: DEFAULT_RESOLUTION,
            shards: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl ServerConfig {
    /// Sets the listen address.
    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    /// Sets the data directory.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Sets the bucket resolution.
    pub fn with_resolution(mut self, resolution: u64) -> Self {
        self.resolution = resolution;
        self
    }

    /// Sets the shard count.
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards.max(1);
        self
    }
}

/// A parsed `KEY COUNT TIME` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Timeline key.
    pub key: String,
    /// Count to accumulate.
    pub count: Count,
    /// Wall-clock time of the count.
    pub time: Time,
}

/// Parses one protocol line; returns `None` for anything malformed.
pub fn parse_line(line: &str) -> Option<Record> {
    let mut fields = line.split_whitespace();
    let key = fields.next()?;
    let count = fields.next()?.parse().ok()?;
    let time = fields.next()?.parse().ok()?;
    if fields.next().is_some() {
        return None;
    }
    if !valid_key(key) {
        return None;
    }
    Some(Record {
        key: key.to_string(),
        count,
        time,
    })
}

/// Keys name directories, so only a conservative charset is accepted.
fn valid_key(key: &str) -> bool {
    if key.is_empty() || key.len() > MAX_KEY_LEN || key == "." || key == ".." {
        return false;
    }
    key.bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b':' | b'-'))
}

enum Command {
    Put {
        key: String,
        time: Time,
        count: Count,
    },
    Get {
        key: String,
        time: Time,
        reply: oneshot::Sender<Result<Option<GetResult>>>,
    },
    Diff {
        key: String,
        from: Time,
        to: Time,
        reply: oneshot::Sender<Result<Option<DiffResult>>>,
    },
    Summary {
        key: String,
        reply: oneshot::Sender<Result<Option<SummaryResult>>>,
    },
}

/// The sharded registry of timelines.
///
/// Must be opened from within a Tokio runtime; `open` spawns one worker
/// task per shard.
pub struct Db {
    shards: Vec<mpsc::Sender<Command>>,
    workers: Vec<JoinHandle<()>>,
}

impl Db {
    /// Validates the data directory and spawns the shard workers.
    pub fn open(config: &ServerConfig) -> Result<Db> {
        fs::create_dir_all(&config.data_dir)?;
        if !config.data_dir.is_dir() {
            return Err(TallyError::NotADirectory(config.data_dir.clone()));
        }

        let existing = fs::read_dir(&config.data_dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .count();
        info!(
            data_dir = %config.data_dir.display(),
            timelines = existing,
            "opened timeline registry"
        );

        let shard_count = config.shards.max(1);
        let mut shards = Vec::with_capacity(shard_count);
        let mut workers = Vec::with_capacity(shard_count);
        for shard in 0..shard_count {
            let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
            let worker = shard_worker(shard, config.data_dir.clone(), config.resolution, rx);
            shards.push(tx);
            workers.push(tokio::spawn(worker));
        }

        Ok(Db { shards, workers })
    }

    /// Returns a cheap handle for submitting commands.
    pub fn client(&self) -> DbClient {
        DbClient {
            shards: self.shards.clone(),
        }
    }

    /// Drains every shard queue, flushes all open timelines, and waits for
    /// the workers to stop. Outstanding [`DbClient`]s must be dropped first
    /// or the drain never finishes.
    pub async fn shutdown(mut self) {
        self.shards.clear();
        for worker in self.workers.drain(..) {
            if let Err(err) = worker.await {
                warn!(%err, "shard worker panicked");
            }
        }
    }
}

/// A cloneable handle onto the shard channels.
#[derive(Clone)]
pub struct DbClient {
    shards: Vec<mpsc::Sender<Command>>,
}

impl DbClient {
    fn shard_of(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    async fn send(&self, key: &str, command: Command) -> Result<()> {
        self.shards[self.shard_of(key)]
            .send(command)
            .await
            .map_err(|_| TallyError::Shutdown)
    }

    /// Queues a count for the key's timeline. Fire-and-forget: rejections
    /// and per-record failures are logged on the owning shard.
    pub async fn put(&self, key: String, time: Time, count: Count) {
        let shard = self.shard_of(&key);
        if self.shards[shard]
            .send(Command::Put { key, time, count })
            .await
            .is_err()
        {
            warn!("shard channel closed; dropping record");
        }
    }

    /// Resolves a time against the key's timeline; `None` when no timeline
    /// exists for the key.
    pub async fn get(&self, key: &str, time: Time) -> Result<Option<GetResult>> {
        let (reply, rx) = oneshot::channel();
        self.send(
            key,
            Command::Get {
                key: key.to_string(),
                time,
                reply,
            },
        )
        .await?;
        rx.await.map_err(|_| TallyError::Shutdown)?
    }

    /// Range statistics over `[from, to]` on the key's timeline.
    pub async fn diff(&self, key: &str, from: Time, to: Time) -> Result<Option<DiffResult>> {
        let (reply, rx) = oneshot::channel();
        self.send(
            key,
            Command::Diff {
                key: key.to_string(),
                from,
                to,
                reply,
            },
        )
        .await?;
        rx.await.map_err(|_| TallyError::Shutdown)?
    }

    /// Whole-timeline statistics for the key.
    pub async fn summary(&self, key: &str) -> Result<Option<SummaryResult>> {
        let (reply, rx) = oneshot::channel();
        self.send(
            key,
            Command::Summary {
                key: key.to_string(),
                reply,
            },
        )
        .await?;
        rx.await.map_err(|_| TallyError::Shutdown)?
    }
}

async fn shard_worker(
    shard: usize,
    data_dir: PathBuf,
    resolution: u64,
    mut rx: mpsc::Receiver<Command>,
) {
    let mut timelines: HashMap<String, Timeline> = HashMap::new();

    while let Some(command) = rx.recv().await {
        match command {
            Command::Put { key, time, count } => {
                match open_timeline(&mut timelines, &data_dir, resolution, &key) {
                    Ok(timeline) => match timeline.put(time, count) {
                        Ok(true) => {}
                        Ok(false) => debug!(%key, time, "refused out-of-window put"),
                        Err(err) => {
                            warn!(%key, %err, "put failed; closing timeline");
                            timelines.remove(&key);
                        }
                    },
                    Err(err) => warn!(%key, %err, "failed to open timeline"),
                }
            }
            Command::Get { key, time, reply } => {
                let result = existing_timeline(&mut timelines, &data_dir, resolution, &key)
                    .map(|timeline| timeline.map(|t| t.get(time, 0)));
                let _ = reply.send(result);
            }
            Command::Diff {
                key,
                from,
                to,
                reply,
            } => {
                let result = existing_timeline(&mut timelines, &data_dir, resolution, &key)
                    .map(|timeline| timeline.map(|t| t.diff(from, to, 0)));
                let _ = reply.send(result);
            }
            Command::Summary { key, reply } => {
                let result = existing_timeline(&mut timelines, &data_dir, resolution, &key)
                    .map(|timeline| timeline.map(|t| t.summary()));
                let _ = reply.send(result);
            }
        }
    }

    for (key, timeline) in &timelines {
        if let Err(err) = timeline.flush() {
            warn!(%key, %err, "flush failed during shutdown");
        }
    }
    debug!(shard, timelines = timelines.len(), "shard worker stopped");
}

/// Opens the key's timeline, creating its directory on first use.
fn open_timeline<'a>(
    timelines: &'a mut HashMap<String, Timeline>,
    data_dir: &std::path::Path,
    resolution: u64,
    key: &str,
) -> Result<&'a mut Timeline> {
    match timelines.entry(key.to_string()) {
        Entry::Occupied(entry) => Ok(entry.into_mut()),
        Entry::Vacant(entry) => {
            let timeline = Timeline::from_directory(data_dir.join(key), resolution)?;
            Ok(entry.insert(timeline))
        }
    }
}

/// Opens the key's timeline only when it already exists on disk.
fn existing_timeline<'a>(
    timelines: &'a mut HashMap<String, Timeline>,
    data_dir: &std::path::Path,
    resolution: u64,
    key: &str,
) -> Result<Option<&'a mut Timeline>> {
    if !timelines.contains_key(key) {
        let path = data_dir.join(key);
        if !path.is_dir() {
            return Ok(None);
        }
        let timeline = Timeline::from_directory(path, resolution)?;
        timelines.insert(key.to_string(), timeline);
    }
    Ok(timelines.get_mut(key))
}

/// The bound ingest server, ready to run.
pub struct Server {
    listener: TcpListener,
    db: Db,
    config: ServerConfig,
}

impl Server {
    /// Opens the registry and binds the listen socket.
    pub async fn bind(config: ServerConfig) -> Result<Server> {
        let listener = TcpListener::bind(&config.addr).await?;
        let db = Db::open(&config)?;
        Ok(Server {
            listener,
            db,
            config,
        })
    }

    /// The address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs until SIGINT or SIGTERM, then shuts down gracefully.
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Runs until `shutdown` resolves, then drains connections and shard
    /// queues and flushes every open timeline.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let Server {
            listener,
            db,
            config,
        } = self;
        let client = db.client();

        info!(
            addr = %listener.local_addr()?,
            shards = config.shards,
            resolution = config.resolution,
            "listening"
        );

        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        let db = client.clone();
                        connections.spawn(async move {
                            if let Err(err) = handle_connection(stream, peer, db).await {
                                debug!(%peer, %err, "connection ended with error");
                            }
                        });
                    }
                    Err(err) => warn!(%err, "accept failed"),
                },
                _ = &mut shutdown => break,
            }
        }

        drop(listener);
        info!("draining connections");
        let drain = async {
            while connections.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("shutdown grace elapsed; aborting open connections");
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }

        drop(client);
        db.shutdown().await;
        info!("shut down cleanly");
        Ok(())
    }
}

/// Reads protocol lines until EOF, dispatching each valid record.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    db: DbClient,
) -> std::io::Result<()> {
    let mut lines = tokio::io::BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(&line) {
            Some(record) => db.put(record.key, record.time, record.count).await,
            None => warn!(%peer, line = %line.escape_default(), "ignoring malformed record"),
        }
    }
    Ok(())
}

/// Resolves on SIGINT or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(%err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(%err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
