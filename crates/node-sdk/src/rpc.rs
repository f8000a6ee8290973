//! XML-RPC transport used for both the registry API and peer slave APIs.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use rn_domain::{Error, Result};
use rn_protocol::xmlrpc::{MethodCall, MethodResponse, Value};

/// Carries one XML-RPC call to an endpoint and returns its response value.
///
/// Transport-level failures surface as [`Error::Io`] (unreachable peer) or
/// [`Error::Timeout`]; malformed responses and faults as [`Error::Rpc`].
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    async fn call(&self, uri: &str, method: &str, params: Vec<Value>) -> Result<Value>;
}

/// HTTP POST transport backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpRpcTransport {
    http: reqwest::Client,
}

impl HttpRpcTransport {
    /// `timeout` bounds each whole request, connect included.
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| Error::Config(format!("http client: {e}")))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl RpcTransport for HttpRpcTransport {
    async fn call(&self, uri: &str, method: &str, params: Vec<Value>) -> Result<Value> {
        let body = MethodCall::new(method, params).to_xml();
        let resp = self
            .http
            .post(uri)
            .header(reqwest::header::CONTENT_TYPE, "text/xml")
            .body(body)
            .send()
            .await
            .map_err(|e| transport_error(uri, e))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| transport_error(uri, e))?;
        if !status.is_success() {
            return Err(Error::Rpc(format!("{uri} answered HTTP {status}")));
        }
        MethodResponse::parse(&text)?.into_result()
    }
}

fn transport_error(uri: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("{uri}: {e}"))
    } else if e.is_connect() {
        Error::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("{uri}: {e}"),
        ))
    } else {
        Error::Io(io::Error::new(io::ErrorKind::Other, format!("{uri}: {e}")))
    }
}

/// Whether the error means the endpoint could not be reached at all.
pub(crate) fn is_unreachable(e: &Error) -> bool {
    matches!(e, Error::Io(_) | Error::Timeout(_))
}
