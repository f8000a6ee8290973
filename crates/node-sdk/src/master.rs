//! Client of the registry (master) XML-RPC API.

use std::sync::Arc;

use rn_domain::config::RegistryConfig;
use rn_domain::{Error, Result};
use rn_protocol::xmlrpc::{split_status, Value, STATUS_SUCCESS};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::reconnect::{LogThrottle, RetryPolicy};
use crate::rpc::{is_unreachable, RpcTransport};
use crate::types::ConnectReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationKind {
    Publisher,
    Subscriber,
    Service,
}

/// Snapshot returned by `getSystemState`: each entry pairs a topic or
/// service name with the nodes providing or consuming it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemState {
    pub publishers: Vec<(String, Vec<String>)>,
    pub subscribers: Vec<(String, Vec<String>)>,
    pub services: Vec<(String, Vec<String>)>,
}

/// Talks to the registry on behalf of one node.
///
/// Every call carries the node's caller id and is bounded by the configured
/// attempt timeout.  An unreachable registry is [`Error::RegistryUnavailable`];
/// a reachable registry answering with a non-success code is
/// [`Error::Registry`], whatever payload came with it.
pub struct RegistryClient {
    transport: Arc<dyn RpcTransport>,
    master_uri: String,
    caller_id: String,
    caller_api: String,
    config: RegistryConfig,
}

impl RegistryClient {
    pub fn new(
        transport: Arc<dyn RpcTransport>,
        master_uri: impl Into<String>,
        caller_id: impl Into<String>,
        caller_api: impl Into<String>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            transport,
            master_uri: master_uri.into(),
            caller_id: caller_id.into(),
            caller_api: caller_api.into(),
            config,
        }
    }

    pub fn master_uri(&self) -> &str {
        &self.master_uri
    }

    pub fn caller_id(&self) -> &str {
        &self.caller_id
    }

    /// URI of this node's slave API.
    pub fn caller_api(&self) -> &str {
        &self.caller_api
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Initial connect
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Probe the registry until it answers and the local slave server is
    /// ready, retrying at the configured poll interval within `max_wait`.
    ///
    /// Warnings about an unreachable registry are throttled to one per
    /// `warn_interval`.  Cancelling `cancel` aborts the wait with
    /// [`Error::Shutdown`].
    pub async fn connect(
        &self,
        slave_ready: &watch::Receiver<bool>,
        cancel: &CancellationToken,
    ) -> Result<ConnectReport> {
        let policy = RetryPolicy::from_config(&self.config);
        let mut throttle = LogThrottle::new(self.config.warn_interval());
        let mut report = ConnectReport::default();
        let started = Instant::now();

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Shutdown);
            }
            report.attempts += 1;

            let failure = match self.get_uri().await {
                Ok(_) if *slave_ready.borrow() => {
                    tracing::info!(
                        master_uri = %self.master_uri,
                        attempts = report.attempts,
                        "connected to registry"
                    );
                    return Ok(report);
                }
                Ok(_) => {
                    tracing::debug!(
                        master_uri = %self.master_uri,
                        "registry reachable, waiting for slave server"
                    );
                    Error::RegistrationTimeout(started.elapsed())
                }
                Err(e) => {
                    if let Some(suppressed) = throttle.check(Instant::now()) {
                        report.warnings += 1;
                        tracing::warn!(
                            master_uri = %self.master_uri,
                            attempt = report.attempts,
                            suppressed,
                            error = %e,
                            "registry unreachable, retrying"
                        );
                    }
                    e
                }
            };

            let Some(delay) = policy.next_delay(started.elapsed()) else {
                tracing::error!(
                    master_uri = %self.master_uri,
                    attempts = report.attempts,
                    error = %failure,
                    "giving up on registry connect"
                );
                return Err(failure);
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(Error::Shutdown),
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Registration
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Register a publication, subscription or service.
    ///
    /// For topics `schema` is the message type and `local_address` the slave
    /// URI; the result lists the current peers (subscriber slave URIs for a
    /// publisher, publisher slave URIs for a subscriber).  For services
    /// `local_address` is the `rosrpc://` endpoint and the result is empty.
    pub async fn register(
        &self,
        kind: RegistrationKind,
        name: &str,
        schema: &str,
        local_address: &str,
    ) -> Result<Vec<String>> {
        let (method, params) = match kind {
            RegistrationKind::Publisher => (
                "registerPublisher",
                vec![name.into(), schema.into(), local_address.into()],
            ),
            RegistrationKind::Subscriber => (
                "registerSubscriber",
                vec![name.into(), schema.into(), local_address.into()],
            ),
            RegistrationKind::Service => (
                "registerService",
                vec![
                    name.into(),
                    local_address.into(),
                    self.caller_api.as_str().into(),
                ],
            ),
        };
        let payload = self.call_ok(method, params).await?;
        match kind {
            RegistrationKind::Service => Ok(Vec::new()),
            _ => payload
                .as_string_list()
                .ok_or_else(|| Error::Rpc(format!("{method}: peer list is not a string array"))),
        }
    }

    /// Returns how many registrations were removed (0 if none existed).
    pub async fn unregister(
        &self,
        kind: RegistrationKind,
        name: &str,
        local_address: &str,
    ) -> Result<i32> {
        let method = match kind {
            RegistrationKind::Publisher => "unregisterPublisher",
            RegistrationKind::Subscriber => "unregisterSubscriber",
            RegistrationKind::Service => "unregisterService",
        };
        let payload = self
            .call_ok(method, vec![name.into(), local_address.into()])
            .await?;
        Ok(payload.as_i32().unwrap_or(0))
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Lookup
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn get_uri(&self) -> Result<String> {
        let payload = self.call_ok("getUri", Vec::new()).await?;
        payload
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| Error::Rpc("getUri: payload is not a string".into()))
    }

    /// Slave URI of a node, `None` if the registry does not know it.
    pub async fn lookup_node(&self, name: &str) -> Result<Option<String>> {
        self.lookup("lookupNode", name).await
    }

    /// `rosrpc://host:port` of a service, `None` if nobody provides it.
    pub async fn lookup_service(&self, name: &str) -> Result<Option<String>> {
        self.lookup("lookupService", name).await
    }

    async fn lookup(&self, method: &str, name: &str) -> Result<Option<String>> {
        let (code, _, payload) = self.execute(method, vec![name.into()]).await?;
        if code != STATUS_SUCCESS {
            return Ok(None);
        }
        Ok(payload
            .as_str()
            .filter(|s| !s.is_empty())
            .map(str::to_owned))
    }

    pub async fn get_published_topics(&self, subgraph: &str) -> Result<Vec<(String, String)>> {
        let payload = self
            .call_ok("getPublishedTopics", vec![subgraph.into()])
            .await?;
        string_pairs(&payload)
    }

    pub async fn get_topic_types(&self) -> Result<Vec<(String, String)>> {
        let payload = self.call_ok("getTopicTypes", Vec::new()).await?;
        string_pairs(&payload)
    }

    pub async fn get_system_state(&self) -> Result<SystemState> {
        let payload = self.call_ok("getSystemState", Vec::new()).await?;
        let sections = payload
            .as_array()
            .filter(|s| s.len() == 3)
            .ok_or_else(|| Error::Rpc("getSystemState: expected three sections".into()))?;
        Ok(SystemState {
            publishers: name_lists(&sections[0])?,
            subscribers: name_lists(&sections[1])?,
            services: name_lists(&sections[2])?,
        })
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Parameters
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// A missing key is [`Error::ParamNotSet`].
    pub async fn get_param(&self, key: &str) -> Result<serde_json::Value> {
        let (code, _, payload) = self.execute("getParam", vec![key.into()]).await?;
        if code != STATUS_SUCCESS {
            return Err(Error::ParamNotSet(key.to_owned()));
        }
        Ok(payload.to_json())
    }

    pub async fn set_param(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        self.call_ok("setParam", vec![key.into(), Value::from_json(value)])
            .await
            .map(drop)
    }

    pub async fn delete_param(&self, key: &str) -> Result<()> {
        let (code, _, _) = self.execute("deleteParam", vec![key.into()]).await?;
        if code != STATUS_SUCCESS {
            return Err(Error::ParamNotSet(key.to_owned()));
        }
        Ok(())
    }

    pub async fn has_param(&self, key: &str) -> Result<bool> {
        let payload = self.call_ok("hasParam", vec![key.into()]).await?;
        Ok(payload.as_bool().unwrap_or(false))
    }

    /// Closest matching key searching upward from the caller's namespace.
    pub async fn search_param(&self, key: &str) -> Result<Option<String>> {
        let (code, _, payload) = self.execute("searchParam", vec![key.into()]).await?;
        if code != STATUS_SUCCESS {
            return Ok(None);
        }
        Ok(payload
            .as_str()
            .filter(|s| !s.is_empty())
            .map(str::to_owned))
    }

    pub async fn get_param_names(&self) -> Result<Vec<String>> {
        let payload = self.call_ok("getParamNames", Vec::new()).await?;
        payload
            .as_string_list()
            .ok_or_else(|| Error::Rpc("getParamNames: payload is not a string array".into()))
    }

    /// Subscribe to updates of `key` and return its current value.  An unset
    /// key comes back as an empty object.
    pub async fn subscribe_param(&self, key: &str) -> Result<serde_json::Value> {
        let payload = self
            .call_ok(
                "subscribeParam",
                vec![self.caller_api.as_str().into(), key.into()],
            )
            .await?;
        Ok(payload.to_json())
    }

    pub async fn unsubscribe_param(&self, key: &str) -> Result<()> {
        self.call_ok(
            "unsubscribeParam",
            vec![self.caller_api.as_str().into(), key.into()],
        )
        .await
        .map(drop)
    }

    // ── plumbing ────────────────────────────────────────────────────

    async fn execute(&self, method: &str, params: Vec<Value>) -> Result<(i32, String, Value)> {
        let mut full = Vec::with_capacity(params.len() + 1);
        full.push(Value::from(self.caller_id.as_str()));
        full.extend(params);

        let attempt = tokio::time::timeout(
            self.config.attempt_timeout(),
            self.transport.call(&self.master_uri, method, full),
        )
        .await;
        let value = match attempt {
            Ok(Ok(value)) => value,
            Ok(Err(e)) if is_unreachable(&e) => return Err(self.unavailable(e.to_string())),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(self.unavailable(format!(
                    "{method} timed out after {:?}",
                    self.config.attempt_timeout()
                )))
            }
        };
        split_status(value)
    }

    async fn call_ok(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let (code, message, payload) = self.execute(method, params).await?;
        if code != STATUS_SUCCESS {
            return Err(Error::Registry { code, message });
        }
        Ok(payload)
    }

    fn unavailable(&self, reason: String) -> Error {
        Error::RegistryUnavailable {
            uri: self.master_uri.clone(),
            reason,
        }
    }
}

fn string_pairs(value: &Value) -> Result<Vec<(String, String)>> {
    let rows = value
        .as_array()
        .ok_or_else(|| Error::Rpc("expected an array of pairs".into()))?;
    rows.iter()
        .map(|row| match row.as_array() {
            Some([a, b]) => match (a.as_str(), b.as_str()) {
                (Some(a), Some(b)) => Ok((a.to_owned(), b.to_owned())),
                _ => Err(Error::Rpc("pair members must be strings".into())),
            },
            _ => Err(Error::Rpc("expected a two-element pair".into())),
        })
        .collect()
}

fn name_lists(value: &Value) -> Result<Vec<(String, Vec<String>)>> {
    let rows = value
        .as_array()
        .ok_or_else(|| Error::Rpc("expected an array of [name, [nodes]]".into()))?;
    rows.iter()
        .map(|row| match row.as_array() {
            Some([name, nodes]) => Ok((
                name.as_str().unwrap_or_default().to_owned(),
                nodes.as_string_list().unwrap_or_default(),
            )),
            _ => Err(Error::Rpc("expected [name, [nodes]]".into())),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rn_domain::config::RegistryConfig;
    use rn_protocol::xmlrpc::status_response;

    use super::*;

    /// Answers from a script; an exhausted script keeps refusing.
    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<Value>>>,
        calls: Mutex<Vec<(String, Vec<Value>)>>,
    }

    impl ScriptedTransport {
        fn push_ok(&self, code: i32, payload: Value) {
            self.script
                .lock()
                .push_back(Ok(status_response(code, "", payload)));
        }

        fn push_refused(&self, n: usize) {
            for _ in 0..n {
                self.script.lock().push_back(Err(refused()));
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    fn refused() -> Error {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ))
    }

    #[async_trait]
    impl RpcTransport for ScriptedTransport {
        async fn call(&self, _uri: &str, method: &str, params: Vec<Value>) -> Result<Value> {
            self.calls.lock().push((method.to_owned(), params));
            self.script.lock().pop_front().unwrap_or_else(|| Err(refused()))
        }
    }

    fn client(transport: Arc<ScriptedTransport>, config: RegistryConfig) -> RegistryClient {
        RegistryClient::new(
            transport,
            "http://registry:11311/",
            "/talker",
            "http://talker:4000/",
            config,
        )
    }

    fn ready() -> watch::Receiver<bool> {
        watch::channel(true).1
    }

    #[tokio::test(start_paused = true)]
    async fn connect_retries_until_registry_appears() {
        let transport = Arc::new(ScriptedTransport::default());
        // Down for five minutes at the 500 ms poll interval.
        transport.push_refused(600);
        transport.push_ok(1, "http://registry:11311/".into());

        let c = client(transport.clone(), RegistryConfig::default());
        let report = c.connect(&ready(), &CancellationToken::new()).await.unwrap();

        assert_eq!(report.attempts, 601);
        assert_eq!(transport.call_count(), 601);
        // 600 failures over ~300 s: one warning per 60 s window.
        assert!(report.warnings >= 5 && report.warnings <= 6, "{report:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn connect_with_zero_wait_tries_once() {
        let transport = Arc::new(ScriptedTransport::default());
        let config = RegistryConfig {
            max_wait_ms: 0,
            ..RegistryConfig::default()
        };
        let c = client(transport.clone(), config);
        let err = c
            .connect(&ready(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RegistryUnavailable { .. }));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_gives_up_after_max_wait() {
        let transport = Arc::new(ScriptedTransport::default());
        let config = RegistryConfig {
            max_wait_ms: 2000,
            ..RegistryConfig::default()
        };
        let c = client(transport.clone(), config);
        let started = Instant::now();
        let err = c
            .connect(&ready(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RegistryUnavailable { .. }));
        assert_eq!(started.elapsed(), Duration::from_millis(2000));
        assert_eq!(transport.call_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_times_out_when_slave_never_ready() {
        let transport = Arc::new(ScriptedTransport::default());
        for _ in 0..10 {
            transport.push_ok(1, "http://registry:11311/".into());
        }
        let config = RegistryConfig {
            max_wait_ms: 1000,
            ..RegistryConfig::default()
        };
        let (_tx, rx) = watch::channel(false);
        let err = client(transport, config)
            .connect(&rx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RegistrationTimeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_cancelled_by_shutdown() {
        let transport = Arc::new(ScriptedTransport::default());
        let c = client(transport, RegistryConfig::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            trigger.cancel();
        });
        let err = c.connect(&ready(), &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }

    #[tokio::test]
    async fn negative_status_is_failure_regardless_of_payload() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push_ok(-1, Value::Array(vec!["http://sub:1/".into()]));
        let c = client(transport, RegistryConfig::default());
        let err = c
            .register(RegistrationKind::Publisher, "/chatter", "std_msgs/String", "http://talker:4000/")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Registry { code: -1, .. }));
    }

    #[tokio::test]
    async fn register_returns_peers_and_sends_caller_id() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push_ok(1, Value::Array(vec!["http://pub:1/".into()]));
        let c = client(transport.clone(), RegistryConfig::default());
        let peers = c
            .register(RegistrationKind::Subscriber, "/chatter", "std_msgs/String", c.caller_api())
            .await
            .unwrap();
        assert_eq!(peers, vec!["http://pub:1/".to_owned()]);

        let calls = transport.calls.lock();
        let (method, params) = &calls[0];
        assert_eq!(method, "registerSubscriber");
        assert_eq!(params[0].as_str(), Some("/talker"));
        assert_eq!(params[3].as_str(), Some("http://talker:4000/"));
    }

    #[tokio::test]
    async fn missing_param_and_unknown_service() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push_ok(-1, 0.into());
        transport.push_ok(-1, "".into());
        let c = client(transport, RegistryConfig::default());
        assert!(matches!(
            c.get_param("/missing").await,
            Err(Error::ParamNotSet(_))
        ));
        assert_eq!(c.lookup_service("/nobody").await.unwrap(), None);
    }

    #[tokio::test]
    async fn system_state_sections() {
        let transport = Arc::new(ScriptedTransport::default());
        let section = |name: &str, node: &str| {
            Value::Array(vec![Value::Array(vec![
                name.into(),
                Value::Array(vec![node.into()]),
            ])])
        };
        transport.push_ok(
            1,
            Value::Array(vec![
                section("/chatter", "/talker"),
                section("/chatter", "/listener"),
                section("/add", "/adder"),
            ]),
        );
        let state = client(transport, RegistryConfig::default())
            .get_system_state()
            .await
            .unwrap();
        assert_eq!(state.publishers, vec![("/chatter".into(), vec!["/talker".into()])]);
        assert_eq!(state.services[0].0, "/add");
    }
}
