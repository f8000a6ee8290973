//! Node lifecycle and the user-facing [`NodeHandle`].

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use rn_domain::config::{ConfigSeverity, NodeConfig};
use rn_domain::names::{self, Resolver};
use rn_domain::{Error, Result};
use rn_protocol::msg::Clock;
use rn_protocol::{RosMessage, RosService, Time};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::clock::ClockSource;
use crate::master::{RegistryClient, SystemState};
use crate::params::ParamCache;
use crate::rpc::{HttpRpcTransport, RpcTransport};
use crate::services::{
    ServiceClient, ServiceEntry, ServiceHandler, ServiceManager, ServiceServer, TypedService,
};
use crate::slave::{self, SlaveApi};
use crate::tcpros::{self, TransportContext};
use crate::topics::{Publisher, Subscriber, TopicManager};
use crate::types::{AdvertiseOptions, ConnectReport, ServiceClientOptions, SubscribeOptions};

// ── process-unique node names ───────────────────────────────────────

fn active_names() -> &'static Mutex<HashSet<String>> {
    static ACTIVE: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    ACTIVE.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Holds a node name for the lifetime of the node.
struct NameGuard(String);

impl NameGuard {
    fn claim(name: &str) -> Result<Self> {
        if !active_names().lock().insert(name.to_owned()) {
            return Err(Error::DuplicateNodeName(name.to_owned()));
        }
        Ok(Self(name.to_owned()))
    }
}

impl Drop for NameGuard {
    fn drop(&mut self) {
        active_names().lock().remove(&self.0);
    }
}

// ── lifecycle ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Running,
    ShuttingDown,
    Down,
}

impl Lifecycle {
    fn is_up(self) -> bool {
        self != Lifecycle::Down
    }
}

/// Everything needed to start a node; assembled by [`NodeBuilder`](crate::NodeBuilder).
pub(crate) struct StartParams {
    pub name: String,
    pub config: NodeConfig,
    pub bind_host: String,
    pub rpc: Option<Arc<dyn RpcTransport>>,
    pub parent: Option<CancellationToken>,
}

struct NodeInner {
    name: String,
    config: NodeConfig,
    master: Arc<RegistryClient>,
    topics: Arc<TopicManager>,
    services: Arc<ServiceManager>,
    params: Arc<ParamCache>,
    clock: Arc<ClockSource>,
    connect_report: ConnectReport,
    cancel: CancellationToken,
    shutdown_requested: CancellationToken,
    lifecycle: watch::Sender<Lifecycle>,
    name_guard: Mutex<Option<NameGuard>>,
    clock_subscriber: Mutex<Option<Subscriber>>,
}

impl NodeInner {
    /// True until shutdown has completed.
    fn ok(&self) -> bool {
        self.lifecycle.borrow().is_up() && !self.cancel.is_cancelled()
    }

    /// New publications, subscriptions and services are refused as soon as
    /// shutdown starts.
    fn accepting(&self) -> bool {
        *self.lifecycle.borrow() == Lifecycle::Running && !self.cancel.is_cancelled()
    }

    /// Idempotent: the first caller does the work, concurrent callers wait
    /// for it to finish.
    async fn shutdown(&self) {
        let first = self.lifecycle.send_if_modified(|state| {
            if *state == Lifecycle::Running {
                *state = Lifecycle::ShuttingDown;
                true
            } else {
                false
            }
        });
        if !first {
            let mut rx = self.lifecycle.subscribe();
            let _ = rx.wait_for(|s| *s == Lifecycle::Down).await;
            return;
        }

        tracing::info!(node = %self.name, "node shutting down");
        let clock_subscriber = self.clock_subscriber.lock().take();
        if let Some(sub) = clock_subscriber {
            sub.shutdown().await;
        }
        self.topics.shutdown().await;
        self.services.shutdown().await;
        for key in self.params.take_subscriptions() {
            if let Err(e) = self.master.unsubscribe_param(&key).await {
                tracing::debug!(key = %key, error = %e, "failed to unsubscribe parameter");
            }
        }

        self.cancel.cancel();
        self.name_guard.lock().take();
        self.lifecycle.send_replace(Lifecycle::Down);
        tracing::info!(node = %self.name, "node shut down");
    }
}

impl Drop for NodeInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Node
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A running member of the graph.
///
/// Created with [`NodeBuilder`](crate::NodeBuilder).  Work happens through
/// [`NodeHandle`]s; the node stays up until [`shutdown`](Self::shutdown)
/// is called, the registry requests it, or every handle is dropped.
pub struct Node {
    inner: Arc<NodeInner>,
    root: NodeHandle,
}

impl Node {
    pub(crate) async fn start(params: StartParams) -> Result<Self> {
        let StartParams {
            name,
            config,
            bind_host,
            rpc,
            parent,
        } = params;

        let problems: Vec<String> = config
            .validate()
            .into_iter()
            .filter(|e| matches!(e.severity, ConfigSeverity::Error))
            .map(|e| e.to_string())
            .collect();
        if !problems.is_empty() {
            return Err(Error::Config(problems.join("; ")));
        }

        // ── identity ─────────────────────────────────────────────────
        let name = node_name(&name, &config)?;
        let resolver = Resolver::new(&config.namespace, &name, &config.remappings)?;
        let name_guard = NameGuard::claim(&name)?;

        let cancel = parent.map(|p| p.child_token()).unwrap_or_default();
        let rpc: Arc<dyn RpcTransport> = match rpc {
            Some(rpc) => rpc,
            None => Arc::new(HttpRpcTransport::new(config.registry.attempt_timeout())?),
        };

        // ── listeners ────────────────────────────────────────────────
        let data_listener = TcpListener::bind((bind_host.as_str(), 0)).await?;
        let data_port = data_listener.local_addr()?.port();
        let slave_listener = TcpListener::bind((bind_host.as_str(), 0)).await?;
        let slave_uri = format!(
            "http://{}:{}/",
            config.hostname,
            slave_listener.local_addr()?.port()
        );

        let master = Arc::new(RegistryClient::new(
            rpc.clone(),
            config.master_uri.clone(),
            name.clone(),
            slave_uri.clone(),
            config.registry.clone(),
        ));
        let ctx = Arc::new(TransportContext::new(
            name.clone(),
            master.clone(),
            rpc,
            config.transport.clone(),
            config.hostname.clone(),
            data_port,
            cancel.clone(),
        ));
        let topics = Arc::new(TopicManager::new(ctx.clone()));
        let services = Arc::new(ServiceManager::new(ctx.clone()));
        let params = Arc::new(ParamCache::new());
        let shutdown_requested = CancellationToken::new();

        tokio::spawn(tcpros::serve(
            data_listener,
            ctx,
            topics.clone(),
            services.clone(),
        ));

        let api = Arc::new(SlaveApi::new(
            name.clone(),
            config.master_uri.clone(),
            config.hostname.clone(),
            data_port,
            topics.clone(),
            services.clone(),
            params.clone(),
            shutdown_requested.clone(),
        ));
        let (ready_tx, ready_rx) = watch::channel(false);
        slave::spawn(slave_listener, api, cancel.clone(), ready_tx);

        // ── registry ─────────────────────────────────────────────────
        let connect_report = match master.connect(&ready_rx, &cancel).await {
            Ok(report) => report,
            Err(e) => {
                cancel.cancel();
                return Err(e);
            }
        };

        let clock = match master.get_param("/use_sim_time").await {
            Ok(value) => ClockSource::from_use_sim_time(Some(&value)),
            Err(Error::ParamNotSet(_)) => ClockSource::wall(),
            Err(e) => {
                tracing::error!(error = %e, "could not read /use_sim_time");
                cancel.cancel();
                return Err(e);
            }
        };
        let clock = Arc::new(clock);

        let (lifecycle, _) = watch::channel(Lifecycle::Running);
        let inner = Arc::new(NodeInner {
            name: name.clone(),
            config,
            master,
            topics,
            services,
            params,
            clock: clock.clone(),
            connect_report,
            cancel: cancel.clone(),
            shutdown_requested: shutdown_requested.clone(),
            lifecycle,
            name_guard: Mutex::new(Some(name_guard)),
            clock_subscriber: Mutex::new(None),
        });
        let root = NodeHandle {
            inner: inner.clone(),
            resolver,
        };

        if clock.is_simulated() {
            let sim = clock.clone();
            let sub = root
                .subscribe("/clock", SubscribeOptions::default().queue_size(1), move |msg: Clock| {
                    sim.update(msg.clock)
                })
                .await;
            match sub {
                Ok(sub) => *inner.clock_subscriber.lock() = Some(sub),
                Err(e) => {
                    inner.shutdown().await;
                    return Err(e);
                }
            }
        }

        spawn_shutdown_watch(Arc::downgrade(&inner), shutdown_requested, cancel);

        tracing::info!(
            node = %name,
            slave_uri = %slave_uri,
            data_port,
            simulated_time = clock.is_simulated(),
            "node started"
        );
        Ok(Self { inner, root })
    }

    /// A handle in the node's own namespace.
    pub fn handle(&self) -> NodeHandle {
        self.root.clone()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// URI of this node's slave API.
    pub fn slave_uri(&self) -> &str {
        self.inner.master.caller_api()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn connect_report(&self) -> ConnectReport {
        self.inner.connect_report
    }

    pub fn ok(&self) -> bool {
        self.inner.ok()
    }

    pub async fn shutdown(&self) {
        self.inner.shutdown().await
    }

    /// Resolves once the registry (or another node) asks this node to shut
    /// down through the slave API.  The shutdown itself runs regardless.
    pub fn shutdown_requested(&self) -> impl Future<Output = ()> + Send + 'static {
        let token = self.inner.shutdown_requested.clone();
        async move { token.cancelled().await }
    }
}

/// Full node name: global as given, relative joined to the namespace,
/// with a random suffix when anonymous.
fn node_name(base: &str, config: &NodeConfig) -> Result<String> {
    names::validate(base)?;
    if names::is_private(base) {
        return Err(Error::InvalidName {
            name: base.to_owned(),
            reason: "node names cannot be private".into(),
        });
    }
    let mut name = if names::is_global(base) {
        names::canonicalize(base)
    } else {
        let ns = if names::is_global(&config.namespace) {
            config.namespace.clone()
        } else {
            names::join("/", &config.namespace)
        };
        names::join(&ns, base)
    };
    if config.anonymous {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        name = format!("{name}_{}", &suffix[..16]);
    }
    names::validate(&name)?;
    Ok(name)
}

fn spawn_shutdown_watch(
    inner: Weak<NodeInner>,
    requested: CancellationToken,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = requested.cancelled() => {
                if let Some(inner) = inner.upgrade() {
                    inner.shutdown().await;
                }
            }
            _ = cancel.cancelled() => {}
        }
    });
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// NodeHandle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Cheap-to-clone access to a node, scoped to a namespace.
///
/// Every name passed to a handle is resolved (relative names against the
/// handle's namespace, `~name` under the node name) and remapped before use.
#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<NodeInner>,
    resolver: Resolver,
}

impl NodeHandle {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn namespace(&self) -> &str {
        self.resolver.namespace()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &RegistryClient {
        &self.inner.master
    }

    pub fn resolve_name(&self, name: &str) -> Result<String> {
        self.resolver.resolve(name)
    }

    /// A handle for a child namespace (relative or global).
    pub fn sub_handle(&self, namespace: &str) -> Result<NodeHandle> {
        Ok(NodeHandle {
            inner: self.inner.clone(),
            resolver: self.resolver.child(namespace)?,
        })
    }

    pub fn ok(&self) -> bool {
        self.inner.ok()
    }

    pub async fn shutdown(&self) {
        self.inner.shutdown().await
    }

    pub fn now(&self) -> Time {
        self.inner.clock.now()
    }

    pub fn clock(&self) -> &ClockSource {
        &self.inner.clock
    }

    fn ensure_ok(&self) -> Result<()> {
        if self.inner.accepting() {
            Ok(())
        } else {
            Err(Error::Shutdown)
        }
    }

    // ── topics ──────────────────────────────────────────────────────

    pub async fn advertise<M: RosMessage>(
        &self,
        topic: &str,
        opts: AdvertiseOptions,
    ) -> Result<Publisher<M>> {
        self.ensure_ok()?;
        let topic = self.resolve_name(topic)?;
        Publisher::start(self.inner.topics.clone(), &topic, &opts).await
    }

    /// Subscribe with a callback run on a dedicated task, one message at a
    /// time, in arrival order.
    pub async fn subscribe<M, F>(
        &self,
        topic: &str,
        opts: SubscribeOptions,
        callback: F,
    ) -> Result<Subscriber>
    where
        M: RosMessage,
        F: Fn(M) + Send + Sync + 'static,
    {
        self.ensure_ok()?;
        let topic = self.resolve_name(topic)?;
        Subscriber::start(self.inner.topics.clone(), &topic, &opts, callback).await
    }

    // ── services ────────────────────────────────────────────────────

    pub async fn advertise_service<S, F, Fut>(&self, name: &str, handler: F) -> Result<ServiceServer>
    where
        S: RosService,
        F: Fn(S::Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<S::Response, String>> + Send + 'static,
    {
        self.advertise_service_with::<S>(name, Arc::new(TypedService::<S, F>::new(handler)))
            .await
    }

    /// Advertise a service whose schema is `S` but whose requests are
    /// handled as raw bytes.
    pub async fn advertise_service_with<S: RosService>(
        &self,
        name: &str,
        handler: Arc<dyn ServiceHandler>,
    ) -> Result<ServiceServer> {
        self.ensure_ok()?;
        let name = self.resolve_name(name)?;
        let entry = ServiceEntry::new(
            &name,
            S::service_type(),
            S::md5sum(),
            S::Request::msg_type(),
            S::Response::msg_type(),
            handler,
        );
        self.inner.services.advertise(entry).await?;
        Ok(ServiceServer::new(name, self.inner.services.clone()))
    }

    pub fn service_client<S: RosService>(
        &self,
        name: &str,
        opts: ServiceClientOptions,
    ) -> Result<ServiceClient<S>> {
        self.ensure_ok()?;
        let name = self.resolve_name(name)?;
        Ok(ServiceClient::new(
            name,
            self.inner.services.context().clone(),
            opts,
            self.inner.config.registry.poll_interval(),
        ))
    }

    // ── parameters ──────────────────────────────────────────────────

    pub async fn get_param(&self, key: &str) -> Result<serde_json::Value> {
        let key = self.resolve_name(key)?;
        self.inner.master.get_param(&key).await
    }

    /// Served from the local cache once subscribed; the registry pushes
    /// invalidations through `paramUpdate`.
    pub async fn get_param_cached(&self, key: &str) -> Result<serde_json::Value> {
        let key = self.resolve_name(key)?;
        if let Some(value) = self.inner.params.get(&key) {
            return Ok(value);
        }
        // An update that lands while the fetch is in flight keeps the
        // fetched value out of the cache.
        let pending = self.inner.params.begin(&key);
        let mut value = self.inner.master.subscribe_param(&key).await?;
        if value.as_object().is_some_and(|m| m.is_empty()) {
            // subscribeParam answers {} for unset keys too.
            value = match self.inner.master.get_param(&key).await {
                Ok(value) => value,
                Err(e) => {
                    if let Err(unsub) = self.inner.master.unsubscribe_param(&key).await {
                        tracing::warn!(key = %key, error = %unsub, "failed to unsubscribe parameter");
                    }
                    return Err(e);
                }
            };
        }
        if !pending.finish(value.clone()) {
            tracing::debug!(key = %key, "parameter changed during fetch; not cached");
        }
        Ok(value)
    }

    pub async fn set_param(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let key = self.resolve_name(key)?;
        self.inner.master.set_param(&key, value).await
    }

    pub async fn delete_param(&self, key: &str) -> Result<()> {
        let key = self.resolve_name(key)?;
        self.inner.master.delete_param(&key).await
    }

    pub async fn has_param(&self, key: &str) -> Result<bool> {
        let key = self.resolve_name(key)?;
        self.inner.master.has_param(&key).await
    }

    /// Search upward from this handle's namespace for `key`.
    pub async fn search_param(&self, key: &str) -> Result<Option<String>> {
        self.inner.master.search_param(key).await
    }

    pub async fn get_param_names(&self) -> Result<Vec<String>> {
        self.inner.master.get_param_names().await
    }

    // ── registry queries ────────────────────────────────────────────

    pub async fn get_published_topics(&self, subgraph: &str) -> Result<Vec<(String, String)>> {
        self.inner.master.get_published_topics(subgraph).await
    }

    pub async fn get_topic_types(&self) -> Result<Vec<(String, String)>> {
        self.inner.master.get_topic_types().await
    }

    pub async fn get_system_state(&self) -> Result<SystemState> {
        self.inner.master.get_system_state().await
    }
}
