//! The Client Facade (§4.J): hybrid REST/socket routing, login orchestration,
//! and the single operation surface every collaborator (query builder,
//! metrics exporter, CLI codegen) calls into.
//!
//! `RouterClient` is a thin `Arc<ClientInner>` handle, the same shape the
//! teacher uses for its cheaply-cloned `DbHandle`/`SessionHandle` wrappers:
//! cloning a facade shares the underlying connection, breaker, rate limiter,
//! cache, and mirror registry rather than standing up a second connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::breaker::CircuitBreaker;
use crate::cache::ReadCache;
use crate::command::Params;
use crate::config::{AliasResolver, Config, NoopAliasResolver, Protocol};
use crate::error::{Error, Result};
use crate::mirror::{LiveMirror, MirrorKey};
use crate::parser::RouterRow;
use crate::queue::{Action, OfflineQueue};
use crate::ratelimit::RateLimiter;
use crate::router::{RouterCore, StreamHandle};
pub use crate::router::StreamTarget;
use crate::subscription::{ForeignReader, Subscription, SubscriptionOptions};
use crate::transport::rest::{IdempotentRecovery, RestTransport, RECOVERY_MARKER};
use crate::transport::socket::SocketTransport;

/// Nominal throughput and burst allowance handed to the facade's [`RateLimiter`].
/// Not exposed on [`Config`] — callers wanting a different stability envelope
/// compose their own core types directly rather than tuning this facade.
const NOMINAL_RATE: f64 = 20.0;
const BURST: f64 = 20.0;

/// Connection lifecycle, observed via [`RouterClient::connection_state`] or
/// streamed with [`RouterClient::watch_connection_state`] — the same
/// `watch`-channel-of-state shape the teacher uses for its `ConnectionState`
/// broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Ready,
    Disconnecting,
    Disconnected,
}

/// Options governing one [`RouterClient::write`] call.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub idempotent: bool,
    /// Field to recover by on a detected duplicate, default `"name"`.
    pub idempotency_key: Option<String>,
    /// Opt-in to offline deferral (§4.H): "a command marked persistent
    /// bypasses dispatch and appends [to the offline queue] when the
    /// underlying connection reports not-connected". A write that does not
    /// set this always fails with [`Error::ConnectionLost`] while
    /// disconnected, rather than being silently queued.
    pub persistent: bool,
}

/// What a write resolved to: either the applied rows, or confirmation that
/// it was appended to the offline queue instead of dispatched (§4.H, §6).
#[derive(Debug, Clone)]
pub enum WriteOutcome {
    Applied(Vec<RouterRow>),
    QueuedOffline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Rest,
    Socket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Print,
    Add,
    Set,
    Remove,
    Other,
}

/// Split a command path into its menu and verb, e.g. `/ip/address/add` ->
/// (`/ip/address`, Add). Paths with no recognized suffix are left whole and
/// classified `Other` (§4.C's catch-all row).
fn classify(path: &str) -> (String, Verb) {
    for (suffix, verb) in [
        ("/print", Verb::Print),
        ("/add", Verb::Add),
        ("/set", Verb::Set),
        ("/remove", Verb::Remove),
    ] {
        if let Some(menu) = path.strip_suffix(suffix) {
            return (menu.to_owned(), verb);
        }
    }
    (path.to_owned(), Verb::Other)
}

/// The subset of [`classify`] that the offline queue understands: only
/// add/set/remove are deferrable (§4.H's Deferred Task `action` field has no
/// `Other` variant).
fn classify_action(path: &str) -> Option<(String, Action)> {
    if let Some(menu) = path.strip_suffix("/add") {
        return Some((menu.to_owned(), Action::Add));
    }
    if let Some(menu) = path.strip_suffix("/set") {
        return Some((menu.to_owned(), Action::Set));
    }
    if let Some(menu) = path.strip_suffix("/remove") {
        return Some((menu.to_owned(), Action::Remove));
    }
    None
}

struct Transports {
    rest: Option<RestTransport>,
    command_core: Option<RouterCore>,
    stream_core: Option<RouterCore>,
}

/// Establish the transports the connect sequence needs (§4.J steps 1-3),
/// run under the facade's circuit breaker by the caller.
async fn establish(config: &Config, rate_limiter: &Arc<RateLimiter>) -> Result<Transports> {
    match config.protocol {
        Protocol::Rest => {
            let rest = RestTransport::new(&config.host, config.rest_port, &config.user, &config.password)?;
            rest.probe().await?;
            info!(host = %config.host, "client facade: REST transport ready");

            let stream_core = if let Some(stream_port) = config.socket_stream_port {
                let socket =
                    SocketTransport::connect(&config.host, stream_port, config.tls, config.handshake_timeout)
                        .await?;
                let core = RouterCore::new(socket, rate_limiter.clone());
                core.login(&config.user, &config.password).await?;
                info!(host = %config.host, port = stream_port, "client facade: hybrid follow-stream socket ready");
                Some(core)
            } else {
                None
            };
            Ok(Transports { rest: Some(rest), command_core: None, stream_core })
        }
        Protocol::Socket => {
            let socket =
                SocketTransport::connect(&config.host, config.port, config.tls, config.handshake_timeout).await?;
            let core = RouterCore::new(socket, rate_limiter.clone());
            core.login(&config.user, &config.password).await?;
            info!(host = %config.host, "client facade: socket transport ready");
            Ok(Transports { rest: None, command_core: Some(core), stream_core: None })
        }
    }
}

/// The connected facade's private state. Held behind `Arc` so
/// [`LiveMirror`] can keep a [`std::sync::Weak`] back-reference without
/// creating a reference cycle (§9).
pub(crate) struct ClientInner {
    config: Config,
    rest: Option<RestTransport>,
    command_core: Option<Arc<RouterCore>>,
    /// Socket channel reserved for follow-mode streams in hybrid mode
    /// (`protocol = rest` with `socket_stream_port` configured).
    stream_core: Option<Arc<RouterCore>>,
    breaker: CircuitBreaker,
    rate_limiter: Arc<RateLimiter>,
    rate_limiter_tick: tokio::task::JoinHandle<()>,
    cache: ReadCache,
    queue: OfflineQueue,
    mirrors: Mutex<HashMap<MirrorKey, Arc<LiveMirror>>>,
    alias_resolver: Box<dyn AliasResolver + Send + Sync>,
    state_tx: watch::Sender<ConnectionState>,
}

impl ClientInner {
    fn resolve_path<'a>(&'a self, path: &'a str) -> &'a str {
        self.alias_resolver.resolve(path)
    }

    fn route_for_command(&self) -> Route {
        match self.config.protocol {
            Protocol::Rest => Route::Rest,
            Protocol::Socket => Route::Socket,
        }
    }

    fn rest(&self) -> Result<&RestTransport> {
        self.rest
            .as_ref()
            .ok_or_else(|| Error::Config("REST transport not configured".into()))
    }

    fn command_core(&self) -> Result<&Arc<RouterCore>> {
        self.command_core
            .as_ref()
            .ok_or_else(|| Error::Config("socket transport not configured".into()))
    }

    fn stream_core(&self) -> Result<&Arc<RouterCore>> {
        self.stream_core.as_ref().ok_or_else(|| {
            Error::Protocol("follow-mode streams are unavailable without a socket channel".into())
        })
    }

    async fn dispatch_read(&self, path: &str, params: &Params) -> Result<Vec<RouterRow>> {
        match self.route_for_command() {
            Route::Rest => {
                let (menu, _) = classify(path);
                let start = std::time::Instant::now();
                let result = self.rest()?.print(&menu, params).await;
                self.rate_limiter.submit_feedback(start.elapsed());
                result
            }
            // The socket route's own `!done`/`!trap` dispatch already feeds
            // the rate limiter (§4.I), so no separate measurement here.
            Route::Socket => Ok(self.command_core()?.submit_request(path, params).await?.rows),
        }
    }

    /// One-shot read used both by [`crate::client::RouterClient::read`] and
    /// by the join stage of a snapshot subscription (via [`ForeignReader`]).
    pub(crate) async fn read_collection(&self, path: &str, params: Params) -> Result<Vec<RouterRow>> {
        let resolved = self.resolve_path(path).to_owned();
        let cache_key = params.canonicalize();
        if let Some(rows) = self.cache.get(&self.config.host, &resolved, &cache_key) {
            return Ok(rows);
        }
        let rows = self
            .breaker
            .execute(|| async {
                self.rate_limiter.acquire().await;
                self.dispatch_read(&resolved, &params).await
            })
            .await?;
        self.cache.put(&self.config.host, &resolved, &cache_key, rows.clone());
        Ok(rows)
    }

    async fn recover_duplicate(&self, menu: &str, key: &str, value: &str) -> Result<RouterRow> {
        match self.route_for_command() {
            Route::Rest => {
                self.rest()?
                    .recover_duplicate(menu, &IdempotentRecovery { key: key.to_owned(), value: value.to_owned() })
                    .await
            }
            Route::Socket => {
                let core = self.command_core()?;
                let params = Params::new().query(format!("{key}={value}"));
                let mut outcome = core.submit_request(&format!("{menu}/print"), &params).await?;
                match outcome.rows.first_mut() {
                    Some(row) => {
                        row.insert(RECOVERY_MARKER.to_owned(), Value::Bool(true));
                        Ok(row.clone())
                    }
                    None => Err(Error::IdempotencyLost(value.to_owned())),
                }
            }
        }
    }

    async fn dispatch_write(&self, path: &str, params: Params, opts: &WriteOptions) -> Result<Vec<RouterRow>> {
        let (menu, verb) = classify(path);
        let attempt = match self.route_for_command() {
            Route::Rest => {
                let rest = self.rest()?;
                let start = std::time::Instant::now();
                let result = match verb {
                    Verb::Add => rest.add(&menu, &params).await,
                    Verb::Set => {
                        let mut p = params.clone();
                        let id = p
                            .take_id()
                            .ok_or_else(|| Error::Protocol("set requires .id".into()))?;
                        rest.set(&menu, &id, &p).await
                    }
                    Verb::Remove => {
                        let id = params
                            .attributes
                            .get(".id")
                            .cloned()
                            .ok_or_else(|| Error::Protocol("remove requires .id".into()))?;
                        rest.remove(&menu, &id).await
                    }
                    Verb::Print => rest.print(&menu, &params).await,
                    Verb::Other => rest.command(&menu, &params).await,
                };
                self.rate_limiter.submit_feedback(start.elapsed());
                result
            }
            Route::Socket => self
                .command_core()?
                .submit_request(path, &params)
                .await
                .map(|outcome| outcome.rows),
        };

        match attempt {
            Ok(rows) => {
                self.cache.invalidate_prefix(&self.config.host, &menu);
                Ok(rows)
            }
            Err(e) if opts.idempotent && e.is_duplicate() => {
                let key = opts.idempotency_key.as_deref().unwrap_or("name").to_owned();
                let value = params.attributes.get(&key).cloned().unwrap_or_default();
                let row = self.recover_duplicate(&menu, &key, &value).await?;
                self.cache.invalidate_prefix(&self.config.host, &menu);
                Ok(vec![row])
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn start_follow(
        &self,
        path: &str,
        query: Option<&str>,
        proplist: &[String],
        row_tx: mpsc::UnboundedSender<RouterRow>,
    ) -> Result<StreamHandle> {
        let mut words = vec![path.to_owned()];
        words.push(format!("=.proplist={}", proplist.join(",")));
        words.push("=follow=".to_owned());
        if let Some(q) = query {
            words.push(format!("?{q}"));
        }
        let core = match self.config.protocol {
            Protocol::Socket => self.command_core()?,
            Protocol::Rest => self.stream_core()?,
        };
        core.submit_stream(StreamTarget::Sentence(words), row_tx).await
    }

    pub(crate) async fn cancel_follow(&self, tag: &str) -> Result<()> {
        let core = match self.config.protocol {
            Protocol::Socket => self.command_core()?,
            Protocol::Rest => self.stream_core()?,
        };
        core.cancel_stream(tag).await
    }

    pub(crate) fn detach_mirror(&self, key: &MirrorKey) {
        self.mirrors.lock().unwrap().remove(key);
    }

    fn get_or_create_mirror(self: &Arc<Self>, key: MirrorKey, fields: Vec<String>) -> Arc<LiveMirror> {
        let mut mirrors = self.mirrors.lock().unwrap();
        mirrors
            .entry(key.clone())
            .or_insert_with(|| LiveMirror::new(key, fields, Arc::downgrade(self)))
            .clone()
    }
}

#[async_trait::async_trait]
impl ForeignReader for ClientInner {
    async fn read_once(&self, path: &str) -> Result<Vec<RouterRow>> {
        self.read_collection(path, Params::new()).await
    }
}

/// The connected facade handle. Cheaply `Clone`-able; every clone shares the
/// same connection, caches, and mirror registry.
#[derive(Clone)]
pub struct RouterClient {
    pub(crate) inner: Arc<ClientInner>,
}

impl RouterClient {
    /// Connect with the default no-op alias resolver.
    pub async fn connect(config: Config) -> Result<Self> {
        Self::connect_with(config, Box::new(NoopAliasResolver)).await
    }

    /// Connect, supplying a schema/version alias resolver in place of the
    /// default no-op stub (§4.T).
    pub async fn connect_with(
        config: Config,
        alias_resolver: Box<dyn AliasResolver + Send + Sync>,
    ) -> Result<Self> {
        let config = config.resolve()?;
        let breaker = CircuitBreaker::with_defaults();
        let rate_limiter = Arc::new(RateLimiter::new(NOMINAL_RATE, BURST));
        let rate_limiter_tick = rate_limiter.spawn_tick();
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Connecting);

        info!(host = %config.host, protocol = ?config.protocol, "client facade: connecting");
        let transports = breaker.execute(|| establish(&config, &rate_limiter)).await?;

        // Step 4: invoke the alias resolver once so a real implementation
        // gets the chance to load whatever state it needs before traffic
        // starts flowing through it on every subsequent path translation.
        let _ = alias_resolver.resolve("/system/resource");
        let _ = state_tx.send(ConnectionState::Ready);
        info!(host = %config.host, "client facade: ready");

        let inner = Arc::new(ClientInner {
            config,
            rest: transports.rest,
            command_core: transports.command_core.map(Arc::new),
            stream_core: transports.stream_core.map(Arc::new),
            breaker,
            rate_limiter,
            rate_limiter_tick,
            cache: ReadCache::new(),
            queue: OfflineQueue::new(),
            mirrors: Mutex::new(HashMap::new()),
            alias_resolver,
            state_tx,
        });
        Ok(Self { inner })
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Mark the facade disconnected. Actual transport teardown happens when
    /// the last clone of this facade (and any mirror/subscription still
    /// holding a strong/weak reference) is dropped — the underlying
    /// `RouterCore`/`SocketTransport` types already abort their own tasks on
    /// `Drop`.
    pub async fn close(&self) {
        let _ = self.inner.state_tx.send(ConnectionState::Disconnecting);
        self.inner.rate_limiter_tick.abort();
        let _ = self.inner.state_tx.send(ConnectionState::Disconnected);
        info!(host = %self.inner.config.host, "client facade: closed");
    }

    pub async fn read(&self, path: &str, params: Params) -> Result<Vec<RouterRow>> {
        self.inner.read_collection(path, params).await
    }

    /// Write path (§4.J): `breaker.execute(rate_limiter.acquire(); dispatch())`.
    /// While disconnected, add/set/remove commands marked [`WriteOptions::persistent`]
    /// are appended to the offline queue instead of failing outright;
    /// everything else (including a deferrable command that did not opt in)
    /// fails with [`Error::ConnectionLost`] (§4.H).
    pub async fn write(&self, path: &str, params: Params, opts: WriteOptions) -> Result<WriteOutcome> {
        let resolved = self.inner.resolve_path(path).to_owned();

        if self.connection_state() != ConnectionState::Ready {
            return match (opts.persistent, classify_action(&resolved)) {
                (true, Some((menu, action))) => {
                    self.inner.queue.enqueue(menu, action, params.attributes.clone());
                    Ok(WriteOutcome::QueuedOffline)
                }
                _ => Err(Error::ConnectionLost),
            };
        }

        let rows = self
            .inner
            .breaker
            .execute(|| async {
                self.inner.rate_limiter.acquire().await;
                self.inner.dispatch_write(&resolved, params, &opts).await
            })
            .await?;
        Ok(WriteOutcome::Applied(rows))
    }

    /// Re-submit every queued deferred task in enqueue order. Best-effort:
    /// a failed task is logged and dropped, it does not block the rest of
    /// the drain (§4.H).
    pub async fn drain_offline_queue(&self) {
        let inner = self.inner.clone();
        self.inner
            .queue
            .drain(|task| {
                let inner = inner.clone();
                async move {
                    let verb = match task.action {
                        Action::Add => "/add",
                        Action::Set => "/set",
                        Action::Remove => "/remove",
                    };
                    let path = format!("{}{verb}", task.path);
                    let params = Params { attributes: task.params, queries: Vec::new() };
                    if let Err(e) = inner.dispatch_write(&path, params, &WriteOptions::default()).await {
                        tracing::warn!(error = %e, %path, "offline queue: drain failed for task");
                    }
                }
            })
            .await;
    }

    pub fn offline_queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Open a follow-mode stream (§4.I/§4.J). Unavailable when `protocol =
    /// rest` without a configured `socket_stream_port`.
    pub async fn stream(
        &self,
        target: StreamTarget,
        row_tx: mpsc::UnboundedSender<RouterRow>,
    ) -> Result<StreamHandle> {
        let core = match self.inner.config.protocol {
            Protocol::Socket => self.inner.command_core()?,
            Protocol::Rest => self.inner.stream_core()?,
        };
        core.submit_stream(target, row_tx).await
    }

    pub async fn cancel_stream(&self, tag: &str) -> Result<()> {
        self.inner.cancel_follow(tag).await
    }

    /// Address a collection by menu path, for use with `.subscribe` (§4.K/§4.L).
    pub fn collection(&self, path: &str) -> CollectionHandle {
        CollectionHandle {
            client: self.clone(),
            path: self.inner.resolve_path(path).to_owned(),
            query: None,
            fields: Vec::new(),
        }
    }

    pub fn command(&self, path: impl Into<String>) -> CommandBuilder<'_> {
        CommandBuilder { client: self, path: path.into() }
    }

    pub fn transaction(&self) -> Transaction<'_> {
        Transaction { client: self, ops: Vec::new(), mode: TransactionMode::Sequential }
    }

    /// Raw JSON dump of a collection read — the collaborator that actually
    /// formats Prometheus text lives outside the core (§1); this exposes
    /// the read surface it would build on.
    pub async fn get_metrics(&self, path: &str, _spec: &str) -> Result<String> {
        let rows = self.read(path, Params::new()).await?;
        serde_json::to_string(&rows).map_err(|e| Error::Protocol(format!("serializing metrics rows: {e}")))
    }
}

/// A menu-path-scoped handle to a [`LiveMirror`], created via
/// [`RouterClient::collection`].
pub struct CollectionHandle {
    client: RouterClient,
    path: String,
    query: Option<String>,
    fields: Vec<String>,
}

impl CollectionHandle {
    #[must_use]
    pub fn query(mut self, predicate: impl Into<String>) -> Self {
        self.query = Some(predicate.into());
        self
    }

    #[must_use]
    pub fn fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|s| (*s).to_owned()).collect();
        self
    }

    pub async fn subscribe(&self, opts: SubscriptionOptions) -> Result<Subscription> {
        let key = MirrorKey { path: self.path.clone(), query: self.query.clone() };
        let mirror = self.client.inner.get_or_create_mirror(key, self.fields.clone());
        let reader: Arc<dyn ForeignReader> = self.client.inner.clone();
        mirror.subscribe(opts, Some(reader)).await
    }
}

/// Thin marker for the out-of-scope fluent query-builder collaborator (§1,
/// §6) — enough surface for callers to compile against without the core
/// implementing the DSL itself.
pub struct CommandBuilder<'a> {
    client: &'a RouterClient,
    path: String,
}

impl CommandBuilder<'_> {
    pub async fn write(&self, params: Params, opts: WriteOptions) -> Result<WriteOutcome> {
        self.client.write(&self.path, params, opts).await
    }

    pub async fn read(&self, params: Params) -> Result<Vec<RouterRow>> {
        self.client.read(&self.path, params).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionMode {
    Sequential,
    Parallel,
}

/// A batch of writes executed either sequentially (stop on first error) or
/// concurrently (§6).
pub struct Transaction<'a> {
    client: &'a RouterClient,
    ops: Vec<(String, Params, WriteOptions)>,
    mode: TransactionMode,
}

impl<'a> Transaction<'a> {
    #[must_use]
    pub fn sequential(mut self) -> Self {
        self.mode = TransactionMode::Sequential;
        self
    }

    #[must_use]
    pub fn parallel(mut self) -> Self {
        self.mode = TransactionMode::Parallel;
        self
    }

    #[must_use]
    pub fn add(mut self, path: impl Into<String>, params: Params, opts: WriteOptions) -> Self {
        self.ops.push((path.into(), params, opts));
        self
    }

    pub async fn execute(self) -> Result<Vec<WriteOutcome>> {
        match self.mode {
            TransactionMode::Sequential => {
                let mut results = Vec::with_capacity(self.ops.len());
                for (path, params, opts) in self.ops {
                    results.push(self.client.write(&path, params, opts).await?);
                }
                Ok(results)
            }
            TransactionMode::Parallel => {
                let client = self.client;
                let futures = self
                    .ops
                    .into_iter()
                    .map(|(path, params, opts)| async move { client.write(&path, params, opts).await });
                futures_util::future::try_join_all(futures).await
            }
        }
    }
}

/// A facade with no live transports, for exercising the offline-queue and
/// scheduling logic in this crate's own tests without a real router.
#[cfg(test)]
pub(crate) fn test_client(protocol: Protocol) -> RouterClient {
    let config = Config { host: "10.0.0.1".into(), protocol, ..Config::default() };
    let rate_limiter = Arc::new(RateLimiter::new(20.0, 20.0));
    let rate_limiter_tick = rate_limiter.spawn_tick();
    let (state_tx, _rx) = watch::channel(ConnectionState::Connecting);
    let inner = Arc::new(ClientInner {
        config,
        rest: None,
        command_core: None,
        stream_core: None,
        breaker: CircuitBreaker::with_defaults(),
        rate_limiter,
        rate_limiter_tick,
        cache: ReadCache::new(),
        queue: OfflineQueue::new(),
        mirrors: Mutex::new(HashMap::new()),
        alias_resolver: Box::new(NoopAliasResolver),
        state_tx,
    });
    RouterClient { inner }
}
