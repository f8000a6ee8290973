//! Typed service client.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use rn_domain::{Error, Result};
use rn_protocol::header::schema_matches;
use rn_protocol::{ConnectionHeader, RosMessage, RosService, ServiceClientCodec};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::codec::Framed;

use crate::tcpros::{connect, parse_rosrpc_uri, read_header, write_header, TransportContext};
use crate::types::ServiceClientOptions;

type ServiceConn = Framed<TcpStream, ServiceClientCodec>;

/// Calls one service.
///
/// The provider's address is looked up once and reused until a connection
/// to it is refused, which forces a fresh lookup.  A failed lookup is
/// [`Error::ServiceUnavailable`] and no socket is opened.
pub struct ServiceClient<S> {
    name: String,
    ctx: Arc<TransportContext>,
    opts: ServiceClientOptions,
    poll_interval: Duration,
    address: parking_lot::Mutex<Option<(String, u16)>>,
    conn: tokio::sync::Mutex<Option<ServiceConn>>,
    _marker: PhantomData<fn(S)>,
}

impl<S: RosService> ServiceClient<S> {
    pub(crate) fn new(
        name: String,
        ctx: Arc<TransportContext>,
        opts: ServiceClientOptions,
        poll_interval: Duration,
    ) -> Self {
        Self {
            name,
            ctx,
            opts,
            poll_interval,
            address: parking_lot::Mutex::new(None),
            conn: tokio::sync::Mutex::new(None),
            _marker: PhantomData,
        }
    }

    pub fn service(&self) -> &str {
        &self.name
    }

    /// Call without a deadline.
    pub async fn call(&self, request: &S::Request) -> Result<S::Response> {
        if self.ctx.cancel.is_cancelled() {
            return Err(Error::Shutdown);
        }
        let payload = Bytes::from(request.to_bytes());

        if !self.opts.persistent {
            let mut conn = self.open(false).await?;
            return exchange::<S>(&mut conn, payload).await;
        }

        // Taken out of the slot so a call abandoned mid-exchange drops it.
        let mut slot = self.conn.lock().await;
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => self.open(false).await?,
        };
        let result = exchange::<S>(&mut conn, payload).await;
        if result.is_ok() {
            *slot = Some(conn);
        }
        result
    }

    /// Call with a deadline; exceeding it is [`Error::Timeout`].
    pub async fn call_with_timeout(
        &self,
        request: &S::Request,
        deadline: Duration,
    ) -> Result<S::Response> {
        match tokio::time::timeout(deadline, self.call(request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "{} did not answer within {deadline:?}",
                self.name
            ))),
        }
    }

    /// Whether a provider is registered and accepts a probe handshake.
    pub async fn exists(&self) -> bool {
        self.open(true).await.is_ok()
    }

    /// Poll the registry (at its poll interval) until the service is listed
    /// and answers a probe.  `None` waits indefinitely.
    pub async fn wait_for_service(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match self.open(true).await {
                Ok(_) => return Ok(()),
                Err(Error::Shutdown) => return Err(Error::Shutdown),
                Err(e) => tracing::trace!(service = %self.name, error = %e, "service not ready"),
            }
            if deadline.is_some_and(|d| Instant::now() + self.poll_interval > d) {
                return Err(Error::Timeout(format!("service {} never appeared", self.name)));
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.ctx.cancel.cancelled() => return Err(Error::Shutdown),
            }
        }
    }

    async fn open(&self, probe: bool) -> Result<ServiceConn> {
        let cached = self.address.lock().clone();
        let (address, was_cached) = match cached {
            Some(a) => (a, true),
            None => (self.lookup().await?, false),
        };
        match self.handshake(&address, probe).await {
            Err(e) if e.is_connection_refused() => {
                *self.address.lock() = None;
                if !was_cached {
                    return Err(Error::ServiceUnavailable(format!("{}: {e}", self.name)));
                }
                tracing::debug!(service = %self.name, "cached provider refused, looking up again");
                let fresh = self.lookup().await?;
                self.handshake(&fresh, probe).await.map_err(|e| {
                    if e.is_connection_refused() {
                        *self.address.lock() = None;
                        Error::ServiceUnavailable(format!("{}: {e}", self.name))
                    } else {
                        e
                    }
                })
            }
            other => other,
        }
    }

    async fn lookup(&self) -> Result<(String, u16)> {
        let uri = match self.ctx.master.lookup_service(&self.name).await {
            Ok(Some(uri)) => uri,
            Ok(None) => {
                return Err(Error::ServiceUnavailable(format!(
                    "no provider registered for {}",
                    self.name
                )))
            }
            Err(e) => {
                return Err(Error::ServiceUnavailable(format!(
                    "lookup of {} failed: {e}",
                    self.name
                )))
            }
        };
        let address = parse_rosrpc_uri(&uri)?;
        *self.address.lock() = Some(address.clone());
        Ok(address)
    }

    async fn handshake(&self, address: &(String, u16), probe: bool) -> Result<ServiceConn> {
        let stream = connect((address.0.as_str(), address.1), self.ctx.handshake_timeout()).await?;
        stream.set_nodelay(true)?;
        let mut framed = self.ctx.framed(stream);

        let mut header = ConnectionHeader::new()
            .with("callerid", self.ctx.caller_id.as_str())
            .with("service", self.name.as_str())
            .with("md5sum", S::md5sum())
            .with("type", S::service_type())
            .with("persistent", if self.opts.persistent { "1" } else { "0" });
        if probe {
            header.set("probe", "1");
        }
        write_header(&mut framed, &header).await?;

        let reply = read_header(&mut framed, self.ctx.handshake_timeout()).await?;
        if let Some(reason) = reply.rejection() {
            return Err(Error::HandshakeMismatch(reason.to_owned()));
        }
        if let Some(theirs) = reply.get("md5sum") {
            if !schema_matches(&S::md5sum(), theirs) {
                return Err(Error::HandshakeMismatch(format!(
                    "{} serves md5sum {theirs}, expected {}",
                    self.name,
                    S::md5sum()
                )));
            }
        }
        let max = self.ctx.config.max_frame_bytes;
        Ok(framed.map_codec(|_| ServiceClientCodec::new(max)))
    }
}

async fn exchange<S: RosService>(conn: &mut ServiceConn, payload: Bytes) -> Result<S::Response> {
    conn.send(payload).await?;
    match conn.next().await {
        None => Err(Error::ProtocolViolation(
            "service connection closed before reply".into(),
        )),
        Some(Err(e)) => Err(e),
        Some(Ok(reply)) if reply.ok => S::Response::from_bytes(&reply.payload),
        Some(Ok(reply)) => Err(Error::ServiceCallFailed(reply.error_text())),
    }
}
