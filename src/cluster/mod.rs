//! Connection manager for the key-value cluster.
//!
//! One `ClusterManager` is shared per process. The first `get_client` call
//! discovers the slot map from a seed node; callers that arrive while that is
//! in flight await the same shared attempt. Node connections are opened
//! lazily on first use. Node faults mark the manager degraded and schedule a
//! background reconnect with capped exponential backoff; redirections and
//! read-only replica errors refresh the slot map immediately instead.

mod topology;

pub use topology::{AddressRemap, SLOT_COUNT, SlotRange, Topology, key_slot};

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use redis::aio::MultiplexedConnection;
use redis::{ErrorKind, RedisError, RedisResult};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ClusterConfig;
use crate::error::{ConnectionError, TrackerError, TrackerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// What to do after a command failed on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Stale slot map: refresh now and retry once.
    RefreshTopology,
    /// Node unreachable: degrade and reconnect in the background.
    NodeFault,
    /// Command-level error, nothing to recover.
    Surface,
}

pub fn classify(err: &RedisError) -> Recovery {
    match err.kind() {
        ErrorKind::Moved | ErrorKind::Ask | ErrorKind::ReadOnly => Recovery::RefreshTopology,
        ErrorKind::IoError | ErrorKind::ClusterDown | ErrorKind::TryAgain => Recovery::NodeFault,
        _ if err.is_io_error() || err.is_connection_dropped() => Recovery::NodeFault,
        _ => Recovery::Surface,
    }
}

/// `min(base * 2^(attempt-1), cap)`; `attempt` starts at 1.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

/// Produces a fresh slot map. The seam exists so the lifecycle can run
/// against something other than a live cluster.
pub trait TopologySource: Send + Sync {
    fn discover(&self) -> BoxFuture<'static, Result<Topology, String>>;
}

/// Discovers the slot map by asking each seed node in turn for `CLUSTER NODES`.
pub struct SeedDiscovery {
    config: ClusterConfig,
    remap: AddressRemap,
}

impl SeedDiscovery {
    pub fn new(config: ClusterConfig) -> Self {
        let remap = AddressRemap::new(config.remap.clone());
        Self { config, remap }
    }
}

impl TopologySource for SeedDiscovery {
    fn discover(&self) -> BoxFuture<'static, Result<Topology, String>> {
        let config = self.config.clone();
        let remap = self.remap.clone();
        Box::pin(async move {
            let mut errors = Vec::new();
            for seed in config.nodes.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
                match discover_from(&config, seed, &remap).await {
                    Ok(topology) => return Ok(topology),
                    Err(err) => {
                        debug!(node = %seed, error = %err, "seed node unavailable");
                        errors.push(format!("{seed}: {err}"));
                    }
                }
            }
            Err(errors.join("; "))
        })
    }
}

async fn discover_from(
    config: &ClusterConfig,
    seed: &str,
    remap: &AddressRemap,
) -> RedisResult<Topology> {
    let addr = remap.apply(seed);
    let mut conn = open_connection(config, &addr, false).await?;
    let reply: RedisResult<String> = redis::cmd("CLUSTER").arg("NODES").query_async(&mut conn).await;
    seed_topology(reply, seed, &addr, remap)
}

/// Interpret a seed's `CLUSTER NODES` reply. `seed` is the address as the
/// cluster knows it and fills in the seed's own empty host; `addr` is the
/// remapped address actually dialled.
fn seed_topology(
    reply: RedisResult<String>,
    seed: &str,
    addr: &str,
    remap: &AddressRemap,
) -> RedisResult<Topology> {
    match reply {
        Ok(text) => Topology::from_cluster_nodes(&text, seed, remap)
            .map_err(|e| RedisError::from((ErrorKind::TypeError, "bad CLUSTER NODES reply", e))),
        Err(err) if err.to_string().to_lowercase().contains("cluster support disabled") => {
            info!(node = %addr, "cluster mode disabled, using standalone topology");
            Ok(Topology::standalone(addr.to_string()))
        }
        Err(err) => Err(err),
    }
}

fn connection_url(config: &ClusterConfig, addr: &str) -> RedisResult<url::Url> {
    let invalid = || {
        RedisError::from((
            ErrorKind::InvalidClientConfig,
            "invalid node address",
            addr.to_string(),
        ))
    };
    let mut url = url::Url::parse(&format!("redis://{addr}")).map_err(|_| invalid())?;
    if let Some(username) = &config.username {
        url.set_username(username).map_err(|_| invalid())?;
    }
    if let Some(password) = &config.password {
        url.set_password(Some(password)).map_err(|_| invalid())?;
    }
    Ok(url)
}

async fn open_connection(
    config: &ClusterConfig,
    addr: &str,
    readonly: bool,
) -> RedisResult<MultiplexedConnection> {
    let client = redis::Client::open(connection_url(config, addr)?.as_str())?;
    let mut conn = match tokio::time::timeout(
        config.connect_timeout(),
        client.get_multiplexed_async_connection(),
    )
    .await
    {
        Ok(conn) => conn?,
        Err(_) => return Err(RedisError::from((ErrorKind::IoError, "connect timed out"))),
    };
    if readonly {
        let _: () = redis::cmd("READONLY").query_async(&mut conn).await?;
    }
    Ok(conn)
}

type ConnectOutcome = Result<Arc<Topology>, ConnectionError>;
type PendingConnect = Shared<BoxFuture<'static, ConnectOutcome>>;

struct Lifecycle {
    state: ConnectionState,
    topology: Option<Arc<Topology>>,
    pending: Option<PendingConnect>,
    last_failure: Option<(Instant, ConnectionError)>,
    reconnect_scheduled: bool,
    reconnect_attempts: u32,
}

struct Inner {
    config: ClusterConfig,
    source: Arc<dyn TopologySource>,
    lifecycle: Mutex<Lifecycle>,
    /// Lazily opened node connections keyed by (address, read-only).
    nodes: Mutex<HashMap<(String, bool), MultiplexedConnection>>,
    replica_cursor: AtomicUsize,
}

/// Process-wide handle to the cluster. Cheap to clone.
#[derive(Clone)]
pub struct ClusterManager {
    inner: Arc<Inner>,
}

impl ClusterManager {
    pub fn new(config: ClusterConfig) -> Self {
        let source = Arc::new(SeedDiscovery::new(config.clone()));
        Self::with_source(config, source)
    }

    pub fn with_source(config: ClusterConfig, source: Arc<dyn TopologySource>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                source,
                lifecycle: Mutex::new(Lifecycle {
                    state: ConnectionState::Disconnected,
                    topology: None,
                    pending: None,
                    last_failure: None,
                    reconnect_scheduled: false,
                    reconnect_attempts: 0,
                }),
                nodes: Mutex::new(HashMap::new()),
                replica_cursor: AtomicUsize::new(0),
            }),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.inner
            .lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn node_cache(&self) -> MutexGuard<'_, HashMap<(String, bool), MultiplexedConnection>> {
        self.inner
            .nodes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Upper bound on one node round trip.
    pub fn command_timeout(&self) -> Duration {
        self.inner.config.connect_timeout()
    }

    /// Return a routed client, connecting first if needed.
    ///
    /// Concurrent callers share one connect attempt. After an attempt has
    /// exhausted its retries, calls fail fast for `backoff_cap` before a new
    /// attempt is allowed.
    pub async fn get_client(&self) -> Result<ClusterHandle, ConnectionError> {
        let pending = {
            let mut lc = self.lifecycle();
            if let Some(topology) = &lc.topology {
                return Ok(self.handle(topology.clone()));
            }
            match &lc.pending {
                Some(pending) => pending.clone(),
                None => {
                    if let Some((failed_at, err)) = &lc.last_failure {
                        if failed_at.elapsed() < self.inner.config.backoff_cap() {
                            return Err(err.clone());
                        }
                    }
                    lc.state = ConnectionState::Connecting;
                    let attempt = self.clone().connect_with_retry().boxed().shared();
                    lc.pending = Some(attempt.clone());
                    attempt
                }
            }
        };
        pending.await.map(|topology| self.handle(topology))
    }

    fn handle(&self, topology: Arc<Topology>) -> ClusterHandle {
        ClusterHandle {
            manager: self.clone(),
            topology,
        }
    }

    async fn connect_with_retry(self) -> ConnectOutcome {
        let max_attempts = self.inner.config.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            match self.inner.source.discover().await {
                Ok(topology) => {
                    let topology = Arc::new(topology);
                    info!(
                        attempt,
                        nodes = topology.nodes().len(),
                        ranges = topology.ranges.len(),
                        "cluster connected"
                    );
                    let mut lc = self.lifecycle();
                    lc.state = ConnectionState::Ready;
                    lc.topology = Some(topology.clone());
                    lc.pending = None;
                    lc.last_failure = None;
                    lc.reconnect_attempts = 0;
                    return Ok(topology);
                }
                Err(reason) => {
                    warn!(attempt, max_attempts, error = %reason, "cluster handshake failed");
                    last_error = reason;
                    if attempt < max_attempts {
                        let delay = backoff_delay(
                            self.inner.config.backoff_base(),
                            self.inner.config.backoff_cap(),
                            attempt,
                        );
                        debug!(backoff_ms = delay.as_millis() as u64, "retrying cluster handshake");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        let err = ConnectionError {
            attempts: max_attempts,
            reason: last_error,
        };
        let mut lc = self.lifecycle();
        lc.state = ConnectionState::Disconnected;
        lc.pending = None;
        lc.last_failure = Some((Instant::now(), err.clone()));
        Err(err)
    }

    /// Inspect a failed command and update lifecycle state accordingly.
    pub fn report_error(&self, addr: &str, err: &RedisError) -> Recovery {
        let recovery = classify(err);
        match recovery {
            Recovery::NodeFault => {
                warn!(node = %addr, error = %err, "cluster node fault");
                self.forget_node(addr);
                self.mark_degraded();
                self.schedule_reconnect();
            }
            Recovery::RefreshTopology => {
                debug!(node = %addr, error = %err, "stale slot map");
            }
            Recovery::Surface => {}
        }
        recovery
    }

    fn forget_node(&self, addr: &str) {
        self.node_cache().retain(|(node, _), _| node != addr);
    }

    fn mark_degraded(&self) {
        let mut lc = self.lifecycle();
        if lc.state == ConnectionState::Ready {
            lc.state = ConnectionState::Degraded;
        }
    }

    fn schedule_reconnect(&self) {
        let delay = {
            let mut lc = self.lifecycle();
            if lc.topology.is_none()
                || lc.reconnect_scheduled
                || lc.reconnect_attempts >= self.inner.config.max_attempts
            {
                return;
            }
            lc.reconnect_scheduled = true;
            lc.reconnect_attempts += 1;
            backoff_delay(
                self.inner.config.backoff_base(),
                self.inner.config.backoff_cap(),
                lc.reconnect_attempts,
            )
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.lifecycle().reconnect_scheduled = false;
            return;
        };
        let manager = self.clone();
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let outcome = manager.inner.source.discover().await;
            let retry = {
                let mut lc = manager.lifecycle();
                lc.reconnect_scheduled = false;
                match outcome {
                    Ok(topology) => {
                        info!(attempt = lc.reconnect_attempts, "cluster recovered");
                        lc.topology = Some(Arc::new(topology));
                        lc.state = ConnectionState::Ready;
                        lc.reconnect_attempts = 0;
                        false
                    }
                    Err(reason) if lc.reconnect_attempts >= manager.inner.config.max_attempts => {
                        warn!(attempts = lc.reconnect_attempts, error = %reason, "cluster reconnect budget exhausted");
                        lc.state = ConnectionState::Disconnected;
                        lc.topology = None;
                        lc.last_failure = Some((
                            Instant::now(),
                            ConnectionError {
                                attempts: lc.reconnect_attempts,
                                reason,
                            },
                        ));
                        lc.reconnect_attempts = 0;
                        false
                    }
                    Err(reason) => {
                        warn!(attempt = lc.reconnect_attempts, error = %reason, "cluster reconnect failed");
                        true
                    }
                }
            };
            if retry {
                manager.schedule_reconnect();
            }
        });
    }

    async fn refresh_topology(&self) -> TrackerResult<Arc<Topology>> {
        match self.inner.source.discover().await {
            Ok(topology) => {
                let topology = Arc::new(topology);
                let mut lc = self.lifecycle();
                lc.topology = Some(topology.clone());
                lc.state = ConnectionState::Ready;
                lc.reconnect_attempts = 0;
                debug!(ranges = topology.ranges.len(), "slot map refreshed");
                Ok(topology)
            }
            Err(reason) => {
                self.mark_degraded();
                self.schedule_reconnect();
                Err(ConnectionError {
                    attempts: 1,
                    reason,
                }
                .into())
            }
        }
    }

    async fn node_connection(&self, addr: &str, readonly: bool) -> TrackerResult<MultiplexedConnection> {
        let cache_key = (addr.to_string(), readonly);
        let cached = self.node_cache().get(&cache_key).cloned();
        if let Some(conn) = cached {
            return Ok(conn);
        }
        match open_connection(&self.inner.config, addr, readonly).await {
            Ok(conn) => {
                debug!(node = %addr, readonly, "opened node connection");
                self.node_cache().insert(cache_key, conn.clone());
                Ok(conn)
            }
            Err(err) => {
                self.report_error(addr, &err);
                Err(err.into())
            }
        }
    }
}

/// A slot-map snapshot plus the manager it came from.
#[derive(Clone)]
pub struct ClusterHandle {
    manager: ClusterManager,
    topology: Arc<Topology>,
}

impl ClusterHandle {
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    fn route(&self, topology: &Topology, key: &str, access: Access) -> TrackerResult<(String, bool)> {
        let range = topology.range_for(key_slot(key)).ok_or_else(|| {
            TrackerError::Redis(RedisError::from((
                ErrorKind::ClusterDown,
                "hash slot not served",
                key.to_string(),
            )))
        })?;
        if access == Access::Read
            && self.manager.inner.config.read_from_replicas
            && !range.replicas.is_empty()
        {
            // Rotate over replicas and the primary.
            let pick = self.manager.inner.replica_cursor.fetch_add(1, Ordering::Relaxed)
                % (range.replicas.len() + 1);
            if let Some(replica) = range.replicas.get(pick) {
                return Ok((replica.clone(), true));
            }
        }
        Ok((range.primary.clone(), false))
    }

    /// Run `op` on the node owning `key`. A redirection or read-only reply
    /// refreshes the slot map and retries once.
    pub async fn run<T, F, Fut>(&self, key: &str, access: Access, op: F) -> TrackerResult<T>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        self.run_with(
            key,
            access,
            |addr, readonly| {
                let manager = self.manager.clone();
                async move { manager.node_connection(&addr, readonly).await }
            },
            op,
        )
        .await
    }

    async fn run_with<C, T, Conn, ConnFut, F, Fut>(
        &self,
        key: &str,
        access: Access,
        connect: Conn,
        op: F,
    ) -> TrackerResult<T>
    where
        Conn: Fn(String, bool) -> ConnFut,
        ConnFut: Future<Output = TrackerResult<C>>,
        F: Fn(C) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let mut topology = self.topology.clone();
        let mut refreshed = false;
        loop {
            let (addr, readonly) = self.route(&topology, key, access)?;
            let conn = connect(addr.clone(), readonly).await?;
            let err = match op(conn).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let recovery = self.manager.report_error(&addr, &err);
            if recovery == Recovery::RefreshTopology && !refreshed {
                refreshed = true;
                topology = self.manager.refresh_topology().await?;
                continue;
            }
            return Err(err.into());
        }
    }

    /// `PING` one node and return the round-trip time.
    pub async fn ping_node(&self, addr: &str) -> TrackerResult<Duration> {
        let mut conn = self.manager.node_connection(addr, false).await?;
        let started = Instant::now();
        let result: RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        match result {
            Ok(_) => Ok(started.elapsed()),
            Err(err) => {
                self.manager.report_error(addr, &err);
                Err(err.into())
            }
        }
    }
}
