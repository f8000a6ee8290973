//! The node's slave XML-RPC server: the API the registry and peer nodes
//! call into (publisher updates, topic requests, parameter pushes,
//! shutdown requests and introspection).

use std::sync::Arc;

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use rn_domain::Result;
use rn_protocol::xmlrpc::{
    status_response, MethodCall, MethodResponse, Value, STATUS_ERROR, STATUS_FAILURE,
    STATUS_SUCCESS,
};
use rn_protocol::TCPROS;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::params::ParamCache;
use crate::services::ServiceManager;
use crate::topics::TopicManager;

/// XML-RPC fault code for a request body that is not a method call.
pub const FAULT_MALFORMED: i32 = -32700;
/// XML-RPC fault code for a method this node does not implement.
pub const FAULT_NO_METHOD: i32 = -32601;

pub struct SlaveApi {
    caller_id: String,
    master_uri: String,
    tcpros_host: String,
    tcpros_port: u16,
    topics: Arc<TopicManager>,
    services: Arc<ServiceManager>,
    params: Arc<ParamCache>,
    shutdown_requested: CancellationToken,
}

impl SlaveApi {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        caller_id: String,
        master_uri: String,
        tcpros_host: String,
        tcpros_port: u16,
        topics: Arc<TopicManager>,
        services: Arc<ServiceManager>,
        params: Arc<ParamCache>,
        shutdown_requested: CancellationToken,
    ) -> Self {
        Self {
            caller_id,
            master_uri,
            tcpros_host,
            tcpros_port,
            topics,
            services,
            params,
            shutdown_requested,
        }
    }

    /// Parse and dispatch one request body.
    pub fn handle_xml(&self, body: &str) -> MethodResponse {
        match MethodCall::parse(body) {
            Ok(call) => self.dispatch(call),
            Err(e) => {
                tracing::debug!(error = %e, "malformed slave API request");
                MethodResponse::Fault {
                    code: FAULT_MALFORMED,
                    message: e.to_string(),
                }
            }
        }
    }

    pub fn dispatch(&self, call: MethodCall) -> MethodResponse {
        let p = &call.params;
        let triple = match call.method.as_str() {
            "getBusStats" => {
                let (publish, subscribe) = self.topics.bus_stats();
                ok(Value::Array(vec![
                    Value::Array(publish),
                    Value::Array(subscribe),
                    Value::Array(self.services.bus_stats()),
                ]))
            }
            "getBusInfo" => ok(Value::Array(self.topics.bus_info())),
            "getMasterUri" => ok(self.master_uri.as_str().into()),
            "getPid" => ok(Value::Int(std::process::id() as i32)),
            "getSubscriptions" => ok(pairs(self.topics.subscriptions())),
            "getPublications" => ok(pairs(self.topics.publications())),
            "shutdown" | "requestShutdown" => {
                let caller = str_at(p, 0).unwrap_or("?");
                let reason = str_at(p, 1).unwrap_or_default();
                tracing::warn!(
                    caller,
                    reason,
                    "shutdown requested through slave API"
                );
                self.shutdown_requested.cancel();
                ok(Value::Int(0))
            }
            "paramUpdate" => match str_at(p, 1) {
                Some(key) => {
                    tracing::debug!(key, "parameter updated");
                    self.params.invalidate(key);
                    ok(Value::Int(0))
                }
                None => bad_params("paramUpdate(caller_id, key, value)"),
            },
            "publisherUpdate" => match (str_at(p, 1), p.get(2).and_then(Value::as_string_list)) {
                (Some(topic), Some(publishers)) => {
                    tracing::debug!(topic, publishers = publishers.len(), "publisher update");
                    if self.topics.publisher_update(topic, publishers) {
                        ok(Value::Int(0))
                    } else {
                        status_response(STATUS_FAILURE, format!("not subscribed to {topic}"), Value::Int(0))
                    }
                }
                _ => bad_params("publisherUpdate(caller_id, topic, publishers[])"),
            },
            "requestTopic" => match (str_at(p, 1), p.get(2).and_then(Value::as_array)) {
                (Some(topic), Some(protocols)) => self.request_topic(topic, protocols),
                _ => bad_params("requestTopic(caller_id, topic, protocols[])"),
            },
            other => {
                return MethodResponse::Fault {
                    code: FAULT_NO_METHOD,
                    message: format!("method {other:?} not supported"),
                }
            }
        };
        MethodResponse::Success(triple)
    }

    fn request_topic(&self, topic: &str, protocols: &[Value]) -> Value {
        if !self.topics.is_publishing(topic) {
            return status_response(
                STATUS_FAILURE,
                format!("{} is not a publisher of {topic}", self.caller_id),
                Value::Array(Vec::new()),
            );
        }
        let offers_tcpros = protocols.iter().any(|proto| {
            proto
                .as_array()
                .and_then(|fields| fields.first())
                .and_then(Value::as_str)
                == Some(TCPROS)
        });
        if !offers_tcpros {
            return status_response(
                STATUS_FAILURE,
                "no supported protocol (only TCPROS)",
                Value::Array(Vec::new()),
            );
        }
        status_response(
            STATUS_SUCCESS,
            format!("ready on {}:{}", self.tcpros_host, self.tcpros_port),
            Value::Array(vec![
                TCPROS.into(),
                self.tcpros_host.as_str().into(),
                Value::Int(i32::from(self.tcpros_port)),
            ]),
        )
    }
}

fn ok(payload: Value) -> Value {
    status_response(STATUS_SUCCESS, "", payload)
}

fn bad_params(signature: &str) -> Value {
    status_response(STATUS_ERROR, format!("bad parameters, expected {signature}"), Value::Int(0))
}

fn str_at(params: &[Value], idx: usize) -> Option<&str> {
    params.get(idx).and_then(Value::as_str)
}

fn pairs(rows: Vec<(String, String)>) -> Value {
    Value::Array(
        rows.into_iter()
            .map(|(a, b)| Value::Array(vec![a.into(), b.into()]))
            .collect(),
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn router(api: Arc<SlaveApi>) -> Router {
    Router::new()
        .route("/", post(rpc))
        .route("/RPC2", post(rpc))
        .with_state(api)
}

async fn rpc(State(api): State<Arc<SlaveApi>>, body: String) -> impl IntoResponse {
    let response = api.handle_xml(&body);
    ([(CONTENT_TYPE, "text/xml")], response.to_xml())
}

/// Serve the slave API on an already-bound listener until `cancel` fires.
/// `ready` flips to `true` once the server is accepting.
pub(crate) fn spawn(
    listener: TcpListener,
    api: Arc<SlaveApi>,
    cancel: CancellationToken,
    ready: watch::Sender<bool>,
) -> tokio::task::JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let app = router(api);
        let _ = ready.send(true);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        tracing::debug!("slave API server stopped");
        Ok(())
    })
}
