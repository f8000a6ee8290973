//! Builder pattern for starting a [`Node`].

use std::sync::Arc;
use std::time::Duration;

use rn_domain::config::NodeConfig;
use rn_domain::Result;
use tokio_util::sync::CancellationToken;

use crate::node::{Node, StartParams};
use crate::rpc::RpcTransport;

/// Fluent builder for [`Node`].
///
/// Starts from [`NodeConfig::from_env`]; explicit setters win over the
/// environment.
///
/// # Example
///
/// ```rust,no_run
/// # use rn_node::NodeBuilder;
/// # async fn run() -> rn_domain::Result<()> {
/// let node = NodeBuilder::new("talker")
///     .master_uri("http://localhost:11311/")
///     .hostname("127.0.0.1")
///     .max_wait(std::time::Duration::from_secs(10))
///     .start()
///     .await?;
/// # node.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct NodeBuilder {
    pub(crate) name: String,
    pub(crate) config: NodeConfig,
    pub(crate) bind_host: String,
    pub(crate) rpc: Option<Arc<dyn RpcTransport>>,
    pub(crate) cancel: Option<CancellationToken>,
}

impl NodeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: NodeConfig::from_env(),
            bind_host: "0.0.0.0".into(),
            rpc: None,
            cancel: None,
        }
    }

    /// Replace the whole configuration, environment overlay included.
    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    // ── Identity ─────────────────────────────────────────────────────

    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        self.config.namespace = ns.into();
        self
    }

    /// Append a random suffix to the node name.
    pub fn anonymous(mut self, anonymous: bool) -> Self {
        self.config.anonymous = anonymous;
        self
    }

    /// Remap `from` to `to`; both are resolved against the node namespace.
    pub fn remap(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.config.remappings.insert(from.into(), to.into());
        self
    }

    pub fn on_the_fly_messages(mut self, enabled: bool) -> Self {
        self.config.on_the_fly_messages = enabled;
        self
    }

    // ── Network ──────────────────────────────────────────────────────

    pub fn master_uri(mut self, uri: impl Into<String>) -> Self {
        self.config.master_uri = uri.into();
        self
    }

    /// Host name advertised to peers.
    pub fn hostname(mut self, host: impl Into<String>) -> Self {
        self.config.hostname = host.into();
        self
    }

    /// Local address the listeners bind to (default `0.0.0.0`).
    pub fn bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    /// Total time the initial registry connect may take.
    pub fn max_wait(mut self, d: Duration) -> Self {
        self.config.registry.max_wait_ms = i64::try_from(d.as_millis()).unwrap_or(i64::MAX);
        self
    }

    /// Keep retrying the registry until it answers or the node is cancelled.
    pub fn wait_forever(mut self) -> Self {
        self.config.registry.max_wait_ms = -1;
        self
    }

    pub fn poll_interval(mut self, d: Duration) -> Self {
        self.config.registry.poll_interval_ms = d.as_millis() as u64;
        self
    }

    // ── Wire limits ──────────────────────────────────────────────────

    pub fn max_frame_bytes(mut self, n: usize) -> Self {
        self.config.transport.max_frame_bytes = n;
        self
    }

    pub fn default_queue_size(mut self, n: usize) -> Self {
        self.config.transport.default_queue_size = n;
        self
    }

    // ── Plumbing ─────────────────────────────────────────────────────

    /// Cancelling this token shuts the node's background tasks down.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Replace the HTTP transport used for registry and slave RPCs.
    pub fn rpc_transport(mut self, rpc: Arc<dyn RpcTransport>) -> Self {
        self.rpc = Some(rpc);
        self
    }

    /// Validate, bind, register with the registry and start serving.
    pub async fn start(self) -> Result<Node> {
        Node::start(StartParams {
            name: self.name,
            config: self.config,
            bind_host: self.bind_host,
            rpc: self.rpc,
            parent: self.cancel,
        })
        .await
    }
}
