//! In-process registry for tests and local experiments.
//!
//! Implements the registry side of the XML-RPC API (registration, lookup,
//! graph state and the parameter tree) and pushes `publisherUpdate` and
//! `paramUpdate` callbacks to node slave APIs.  State lives in memory and
//! disappears with the registry.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use parking_lot::Mutex;
use rn_domain::names;
use rn_domain::Result;
use rn_protocol::xmlrpc::{
    split_status, status_response, MethodCall, MethodResponse, Value, STATUS_ERROR,
    STATUS_FAILURE, STATUS_SUCCESS,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::rpc::{HttpRpcTransport, RpcTransport};
use crate::slave::{FAULT_MALFORMED, FAULT_NO_METHOD};

const REGISTRY_ID: &str = "/master";

/// A registry served on `127.0.0.1` with an ephemeral port.
///
/// ```rust,no_run
/// # async fn run() -> rn_domain::Result<()> {
/// let registry = rn_node::testing::InProcessRegistry::start().await?;
/// let node = rn_node::NodeBuilder::new("probe")
///     .master_uri(registry.uri())
///     .hostname("127.0.0.1")
///     .start()
///     .await?;
/// # node.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct InProcessRegistry {
    uri: String,
    state: Arc<RegistryState>,
    cancel: CancellationToken,
}

impl InProcessRegistry {
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        Self::serve(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve(listener: TcpListener) -> Result<Self> {
        let addr = listener.local_addr()?;
        let uri = format!("http://{addr}/");
        let cancel = CancellationToken::new();
        let rpc: Arc<dyn RpcTransport> = Arc::new(HttpRpcTransport::new(Duration::from_secs(2))?);

        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RegistryState {
            uri: uri.clone(),
            graph: Mutex::new(Graph::default()),
            pushes: push_tx,
        });
        tokio::spawn(push_loop(rpc.clone(), state.clone(), push_rx, cancel.clone()));

        let app = Router::new()
            .route("/", post(handle))
            .route("/RPC2", post(handle))
            .with_state(state.clone());
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
            {
                tracing::warn!(error = %e, "in-process registry stopped");
            }
        });
        tracing::info!(uri = %uri, "in-process registry listening");

        Ok(Self { uri, state, cancel })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Slave API URI the registry has on record for `node`.
    pub fn node_api(&self, node: &str) -> Option<String> {
        self.state.graph.lock().nodes.get(node).cloned()
    }

    /// Topics with at least one registered publisher.
    pub fn published_topics(&self) -> Vec<String> {
        self.state.graph.lock().publishers.keys().cloned().collect()
    }

    /// Ask `node` to shut down through its slave API.
    pub async fn shutdown_node(&self, node: &str, reason: &str) -> anyhow::Result<()> {
        let api = self
            .node_api(node)
            .with_context(|| format!("unknown node {node}"))?;
        let rpc = HttpRpcTransport::new(Duration::from_secs(2))?;
        notify(&rpc, &api, "shutdown", vec![REGISTRY_ID.into(), reason.into()]).await
    }

    /// Stop serving.  Nodes still connected see the registry as unreachable.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for InProcessRegistry {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Graph state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct Graph {
    /// caller_id → slave API URI
    nodes: BTreeMap<String, String>,
    publishers: BTreeMap<String, BTreeSet<String>>,
    subscribers: BTreeMap<String, BTreeSet<String>>,
    topic_types: BTreeMap<String, String>,
    /// service → (provider caller_id, rosrpc URI)
    services: BTreeMap<String, (String, String)>,
    params: serde_json::Map<String, serde_json::Value>,
    /// key → slave API URIs subscribed to it
    param_subscribers: BTreeMap<String, BTreeSet<String>>,
}

impl Graph {
    fn apis<'a>(&'a self, ids: impl IntoIterator<Item = &'a String>) -> Vec<String> {
        ids.into_iter()
            .filter_map(|id| self.nodes.get(id).cloned())
            .collect()
    }

    fn publisher_apis(&self, topic: &str) -> Vec<String> {
        self.publishers
            .get(topic)
            .map(|ids| self.apis(ids))
            .unwrap_or_default()
    }

    fn subscriber_apis(&self, topic: &str) -> Vec<String> {
        self.subscribers
            .get(topic)
            .map(|ids| self.apis(ids))
            .unwrap_or_default()
    }

    // ── parameter tree ──────────────────────────────────────────────

    fn param(&self, key: &str) -> Option<serde_json::Value> {
        let mut node = &self.params;
        let segments = segments(key);
        let Some((last, path)) = segments.split_last() else {
            return Some(serde_json::Value::Object(self.params.clone()));
        };
        for segment in path {
            node = node.get(*segment)?.as_object()?;
        }
        node.get(*last).cloned()
    }

    fn set_param(&mut self, key: &str, value: serde_json::Value) {
        let segments = segments(key);
        let Some((last, path)) = segments.split_last() else {
            if let serde_json::Value::Object(map) = value {
                self.params = map;
            }
            return;
        };
        let mut node = &mut self.params;
        for segment in path {
            let entry = node
                .entry(segment.to_string())
                .or_insert_with(|| serde_json::Value::Object(Default::default()));
            if !entry.is_object() {
                *entry = serde_json::Value::Object(Default::default());
            }
            let serde_json::Value::Object(map) = entry else {
                return;
            };
            node = map;
        }
        node.insert(last.to_string(), value);
    }

    fn delete_param(&mut self, key: &str) -> bool {
        let segments = segments(key);
        let Some((last, path)) = segments.split_last() else {
            self.params.clear();
            return true;
        };
        let mut node = &mut self.params;
        for segment in path {
            match node.get_mut(*segment) {
                Some(serde_json::Value::Object(map)) => node = map,
                _ => return false,
            }
        }
        node.remove(*last).is_some()
    }

    fn param_names(&self) -> Vec<String> {
        fn walk(prefix: &str, map: &serde_json::Map<String, serde_json::Value>, out: &mut Vec<String>) {
            for (key, value) in map {
                let name = names::join(prefix, key);
                match value {
                    serde_json::Value::Object(child) if !child.is_empty() => walk(&name, child, out),
                    _ => out.push(name),
                }
            }
        }
        let mut out = Vec::new();
        walk("/", &self.params, &mut out);
        out
    }

    /// Closest match for `key` walking up from the caller's namespace.
    fn search_param(&self, caller_id: &str, key: &str) -> Option<String> {
        if names::is_global(key) {
            return self.param(key).map(|_| names::canonicalize(key));
        }
        let key = key.trim_start_matches('~');
        let head = key.split('/').next().unwrap_or(key);
        let mut ns = names::parent(caller_id);
        loop {
            if self.param(&names::join(&ns, head)).is_some() {
                return Some(names::join(&ns, key));
            }
            if ns == "/" {
                return None;
            }
            ns = names::parent(&ns);
        }
    }
}

fn segments(key: &str) -> Vec<&str> {
    key.split('/').filter(|s| !s.is_empty()).collect()
}

fn related(a: &str, b: &str) -> bool {
    let below = |child: &str, parent: &str| {
        parent == "/"
            || child
                .strip_prefix(parent)
                .is_some_and(|rest| rest.starts_with('/'))
    };
    a == b || below(a, b) || below(b, a)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RPC dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum Push {
    /// Send the current publisher list of `topic` to `api`.
    Publishers { api: String, topic: String },
    Param { api: String, key: String, value: Value },
}

struct RegistryState {
    uri: String,
    graph: Mutex<Graph>,
    pushes: mpsc::UnboundedSender<Push>,
}

async fn handle(State(state): State<Arc<RegistryState>>, body: String) -> impl IntoResponse {
    let response = match MethodCall::parse(&body) {
        Ok(call) => state.dispatch(call),
        Err(e) => MethodResponse::Fault {
            code: FAULT_MALFORMED,
            message: e.to_string(),
        },
    };
    ([(CONTENT_TYPE, "text/xml")], response.to_xml())
}

impl RegistryState {
    fn dispatch(&self, call: MethodCall) -> MethodResponse {
        let p = &call.params;
        let s = |i: usize| p.get(i).and_then(Value::as_str).map(str::to_owned);
        let Some(caller_id) = s(0) else {
            return MethodResponse::Success(bad_params("caller_id first"));
        };
        tracing::debug!(method = %call.method, caller_id = %caller_id, "registry call");

        let value = match call.method.as_str() {
            "getUri" => ok(self.uri.as_str().into()),
            "registerPublisher" | "registerSubscriber" => match (s(1), s(2), s(3)) {
                (Some(topic), Some(msg_type), Some(api)) => {
                    self.register_topic(&call.method, caller_id, topic, msg_type, api)
                }
                _ => bad_params("(caller_id, topic, type, caller_api)"),
            },
            "unregisterPublisher" | "unregisterSubscriber" => match (s(1), s(2)) {
                (Some(topic), Some(api)) => {
                    self.unregister_topic(&call.method, &caller_id, &topic, &api)
                }
                _ => bad_params("(caller_id, topic, caller_api)"),
            },
            "registerService" => match (s(1), s(2), s(3)) {
                (Some(service), Some(service_api), Some(api)) => {
                    let mut graph = self.graph.lock();
                    graph.nodes.insert(caller_id.clone(), api);
                    graph.services.insert(service, (caller_id, service_api));
                    ok(Value::Int(1))
                }
                _ => bad_params("(caller_id, service, service_api, caller_api)"),
            },
            "unregisterService" => match (s(1), s(2)) {
                (Some(service), Some(service_api)) => {
                    let mut graph = self.graph.lock();
                    let owned = graph
                        .services
                        .get(&service)
                        .is_some_and(|(_, uri)| *uri == service_api);
                    if owned {
                        graph.services.remove(&service);
                    }
                    ok(Value::Int(i32::from(owned)))
                }
                _ => bad_params("(caller_id, service, service_api)"),
            },
            "lookupNode" => match s(1) {
                Some(node) => match self.graph.lock().nodes.get(&node) {
                    Some(api) => ok(api.as_str().into()),
                    None => status_response(STATUS_ERROR, format!("unknown node {node}"), "".into()),
                },
                None => bad_params("(caller_id, node)"),
            },
            "lookupService" => match s(1) {
                Some(service) => match self.graph.lock().services.get(&service) {
                    Some((_, uri)) => ok(uri.as_str().into()),
                    None => status_response(
                        STATUS_ERROR,
                        format!("no provider for {service}"),
                        "".into(),
                    ),
                },
                None => bad_params("(caller_id, service)"),
            },
            "getPublishedTopics" => {
                let subgraph = s(1).unwrap_or_default();
                let graph = self.graph.lock();
                let rows = graph
                    .publishers
                    .keys()
                    .filter(|topic| subgraph.is_empty() || related(topic, &subgraph))
                    .map(|topic| {
                        let ty = graph.topic_types.get(topic).cloned().unwrap_or_default();
                        Value::Array(vec![topic.as_str().into(), ty.into()])
                    })
                    .collect();
                ok(Value::Array(rows))
            }
            "getTopicTypes" => {
                let graph = self.graph.lock();
                let rows = graph
                    .topic_types
                    .iter()
                    .map(|(t, ty)| Value::Array(vec![t.as_str().into(), ty.as_str().into()]))
                    .collect();
                ok(Value::Array(rows))
            }
            "getSystemState" => {
                let graph = self.graph.lock();
                let section = |map: &BTreeMap<String, BTreeSet<String>>| {
                    Value::Array(
                        map.iter()
                            .map(|(name, ids)| {
                                Value::Array(vec![
                                    name.as_str().into(),
                                    ids.iter().cloned().collect::<Vec<String>>().into(),
                                ])
                            })
                            .collect(),
                    )
                };
                let services = Value::Array(
                    graph
                        .services
                        .iter()
                        .map(|(name, (id, _))| {
                            Value::Array(vec![name.as_str().into(), vec![id.clone()].into()])
                        })
                        .collect(),
                );
                ok(Value::Array(vec![
                    section(&graph.publishers),
                    section(&graph.subscribers),
                    services,
                ]))
            }
            "getParam" => match s(1) {
                Some(key) => match self.graph.lock().param(&key) {
                    Some(value) => ok(Value::from_json(&value)),
                    None => status_response(STATUS_ERROR, format!("parameter {key} is not set"), Value::Int(0)),
                },
                None => bad_params("(caller_id, key)"),
            },
            "setParam" => match (s(1), p.get(2)) {
                (Some(key), Some(value)) => {
                    self.set_param(&key, value.to_json());
                    ok(Value::Int(0))
                }
                _ => bad_params("(caller_id, key, value)"),
            },
            "deleteParam" => match s(1) {
                Some(key) => {
                    if self.delete_param(&key) {
                        ok(Value::Int(0))
                    } else {
                        status_response(STATUS_ERROR, format!("parameter {key} is not set"), Value::Int(0))
                    }
                }
                None => bad_params("(caller_id, key)"),
            },
            "hasParam" => match s(1) {
                Some(key) => ok(Value::Bool(self.graph.lock().param(&key).is_some())),
                None => bad_params("(caller_id, key)"),
            },
            "searchParam" => match s(1) {
                Some(key) => match self.graph.lock().search_param(&caller_id, &key) {
                    Some(found) => ok(found.into()),
                    None => status_response(STATUS_ERROR, format!("no match for {key}"), "".into()),
                },
                None => bad_params("(caller_id, key)"),
            },
            "getParamNames" => ok(self.graph.lock().param_names().into()),
            "subscribeParam" => match (s(1), s(2)) {
                (Some(api), Some(key)) => {
                    let key = names::canonicalize(&key);
                    let mut graph = self.graph.lock();
                    graph.nodes.entry(caller_id).or_insert_with(|| api.clone());
                    graph.param_subscribers.entry(key.clone()).or_default().insert(api);
                    let value = graph
                        .param(&key)
                        .map(|v| Value::from_json(&v))
                        .unwrap_or_else(|| Value::Struct(BTreeMap::new()));
                    ok(value)
                }
                _ => bad_params("(caller_id, caller_api, key)"),
            },
            "unsubscribeParam" => match (s(1), s(2)) {
                (Some(api), Some(key)) => {
                    let key = names::canonicalize(&key);
                    let mut graph = self.graph.lock();
                    let removed = graph
                        .param_subscribers
                        .get_mut(&key)
                        .is_some_and(|apis| apis.remove(&api));
                    ok(Value::Int(i32::from(removed)))
                }
                _ => bad_params("(caller_id, caller_api, key)"),
            },
            other => {
                return MethodResponse::Fault {
                    code: FAULT_NO_METHOD,
                    message: format!("unknown method {other}"),
                }
            }
        };
        MethodResponse::Success(value)
    }

    fn register_topic(
        &self,
        method: &str,
        caller_id: String,
        topic: String,
        msg_type: String,
        api: String,
    ) -> Value {
        let mut graph = self.graph.lock();
        graph.nodes.insert(caller_id.clone(), api);
        if method == "registerPublisher" {
            graph.publishers.entry(topic.clone()).or_default().insert(caller_id);
            if msg_type != "*" {
                graph.topic_types.insert(topic.clone(), msg_type);
            }
            let subscribers = graph.subscriber_apis(&topic);
            for api in &subscribers {
                self.push(Push::Publishers {
                    api: api.clone(),
                    topic: topic.clone(),
                });
            }
            ok(subscribers.into())
        } else {
            graph.subscribers.entry(topic.clone()).or_default().insert(caller_id);
            if msg_type != "*" {
                graph.topic_types.entry(topic.clone()).or_insert(msg_type);
            }
            ok(graph.publisher_apis(&topic).into())
        }
    }

    fn unregister_topic(&self, method: &str, caller_id: &str, topic: &str, api: &str) -> Value {
        let mut graph = self.graph.lock();
        if graph.nodes.get(caller_id).map(String::as_str) != Some(api) {
            return status_response(STATUS_SUCCESS, "not registered", Value::Int(0));
        }
        let publisher = method == "unregisterPublisher";
        let map = if publisher {
            &mut graph.publishers
        } else {
            &mut graph.subscribers
        };
        let removed = map.get_mut(topic).is_some_and(|ids| ids.remove(caller_id));
        if map.get(topic).is_some_and(BTreeSet::is_empty) {
            map.remove(topic);
        }
        if removed && publisher {
            for api in graph.subscriber_apis(topic) {
                self.push(Push::Publishers {
                    api,
                    topic: topic.to_owned(),
                });
            }
        }
        ok(Value::Int(i32::from(removed)))
    }

    fn set_param(&self, key: &str, value: serde_json::Value) {
        let key = names::canonicalize(key);
        let mut graph = self.graph.lock();
        graph.set_param(&key, value);
        self.push_param_updates(&graph, &key);
    }

    fn delete_param(&self, key: &str) -> bool {
        let key = names::canonicalize(key);
        let mut graph = self.graph.lock();
        let removed = graph.delete_param(&key);
        if removed {
            self.push_param_updates(&graph, &key);
        }
        removed
    }

    fn push_param_updates(&self, graph: &Graph, key: &str) {
        for (subscribed, apis) in &graph.param_subscribers {
            if !related(subscribed, key) {
                continue;
            }
            let value = graph
                .param(subscribed)
                .map(|v| Value::from_json(&v))
                .unwrap_or_else(|| Value::Struct(BTreeMap::new()));
            for api in apis {
                self.push(Push::Param {
                    api: api.clone(),
                    key: subscribed.clone(),
                    value: value.clone(),
                });
            }
        }
    }

    fn push(&self, push: Push) {
        let _ = self.pushes.send(push);
    }
}

fn ok(payload: Value) -> Value {
    status_response(STATUS_SUCCESS, "", payload)
}

fn bad_params(signature: &str) -> Value {
    status_response(STATUS_FAILURE, format!("bad parameters, expected {signature}"), Value::Int(0))
}

// ── callbacks to nodes ──────────────────────────────────────────────

/// Delivers pushes one at a time so a node sees updates in order.
async fn push_loop(
    rpc: Arc<dyn RpcTransport>,
    state: Arc<RegistryState>,
    mut rx: mpsc::UnboundedReceiver<Push>,
    cancel: CancellationToken,
) {
    loop {
        let push = tokio::select! {
            _ = cancel.cancelled() => break,
            push = rx.recv() => match push {
                Some(push) => push,
                None => break,
            },
        };
        let (api, method, params) = match push {
            Push::Publishers { api, topic } => {
                let publishers = state.graph.lock().publisher_apis(&topic);
                (
                    api,
                    "publisherUpdate",
                    vec![REGISTRY_ID.into(), topic.into(), publishers.into()],
                )
            }
            Push::Param { api, key, value } => (
                api,
                "paramUpdate",
                vec![REGISTRY_ID.into(), key.into(), value],
            ),
        };
        if let Err(e) = notify(rpc.as_ref(), &api, method, params).await {
            tracing::debug!(api = %api, method, error = %e, "registry callback failed");
        }
    }
}

async fn notify(
    rpc: &dyn RpcTransport,
    api: &str,
    method: &str,
    params: Vec<Value>,
) -> anyhow::Result<()> {
    let reply = rpc
        .call(api, method, params)
        .await
        .with_context(|| format!("{method} to {api}"))?;
    let (code, message, _) = split_status(reply)?;
    anyhow::ensure!(code == STATUS_SUCCESS, "{method} rejected by {api}: {message}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn param_tree_set_get_delete() {
        let mut graph = Graph::default();
        graph.set_param("/robot/arm/gain", json!(2.5));
        graph.set_param("/robot/name", json!("r2"));
        assert_eq!(graph.param("/robot/arm/gain"), Some(json!(2.5)));
        assert_eq!(
            graph.param("/robot/arm"),
            Some(json!({ "gain": 2.5 }))
        );
        assert_eq!(
            graph.param_names(),
            vec!["/robot/arm/gain".to_owned(), "/robot/name".to_owned()]
        );

        assert!(graph.delete_param("/robot/arm"));
        assert!(graph.param("/robot/arm/gain").is_none());
        assert!(!graph.delete_param("/robot/arm"));
    }

    #[test]
    fn overwriting_a_leaf_with_a_subtree() {
        let mut graph = Graph::default();
        graph.set_param("/a", json!(1));
        graph.set_param("/a/b", json!(2));
        assert_eq!(graph.param("/a"), Some(json!({ "b": 2 })));
    }

    #[test]
    fn search_walks_up_namespaces() {
        let mut graph = Graph::default();
        graph.set_param("/robot/rate", json!(10));
        graph.set_param("/rate", json!(1));
        assert_eq!(
            graph.search_param("/robot/arm/driver", "rate"),
            Some("/robot/rate".to_owned())
        );
        assert_eq!(graph.search_param("/other/node", "rate"), Some("/rate".to_owned()));
        assert_eq!(graph.search_param("/node", "missing"), None);
    }

    #[test]
    fn relatedness_covers_ancestors_and_descendants() {
        assert!(related("/a/b", "/a"));
        assert!(related("/a", "/a/b"));
        assert!(related("/a", "/a"));
        assert!(!related("/ab", "/a"));
    }

    #[tokio::test]
    async fn unknown_method_is_a_fault() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let state = RegistryState {
            uri: "http://127.0.0.1:1/".into(),
            graph: Mutex::new(Graph::default()),
            pushes: tx,
        };
        let response = state.dispatch(MethodCall::new("frobnicate", vec!["/n".into()]));
        assert!(matches!(
            response,
            MethodResponse::Fault { code, .. } if code == FAULT_NO_METHOD
        ));
    }
}
