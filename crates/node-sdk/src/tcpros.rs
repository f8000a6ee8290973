//! The node's TCP data-plane listener and the connection-header exchange
//! shared by topics and services.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use rn_domain::config::TransportConfig;
use rn_domain::{Error, Result};
use rn_protocol::{ConnectionHeader, FrameCodec};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::master::RegistryClient;
use crate::rpc::RpcTransport;
use crate::services::ServiceManager;
use crate::topics::TopicManager;

pub(crate) type FrameStream = Framed<TcpStream, FrameCodec>;

/// State every topic and service connection needs.
pub(crate) struct TransportContext {
    pub caller_id: String,
    pub master: Arc<RegistryClient>,
    pub rpc: Arc<dyn RpcTransport>,
    pub config: TransportConfig,
    /// Address advertised to peers for the data-plane listener.
    pub host: String,
    pub port: u16,
    /// Parent of every connection task; cancelled at node shutdown.
    pub cancel: CancellationToken,
    next_connection_id: AtomicU64,
}

impl TransportContext {
    pub fn new(
        caller_id: String,
        master: Arc<RegistryClient>,
        rpc: Arc<dyn RpcTransport>,
        config: TransportConfig,
        host: String,
        port: u16,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            caller_id,
            master,
            rpc,
            config,
            host,
            port,
            cancel,
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn framed(&self, stream: TcpStream) -> FrameStream {
        Framed::new(stream, FrameCodec::new(self.config.max_frame_bytes))
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.config.handshake_timeout()
    }

    /// `rosrpc://host:port` under which this node's services are reachable.
    pub fn service_uri(&self) -> String {
        format!("rosrpc://{}:{}", self.host, self.port)
    }
}

// ── header exchange ─────────────────────────────────────────────────

pub(crate) async fn write_header(framed: &mut FrameStream, header: &ConnectionHeader) -> Result<()> {
    framed.send(Bytes::from(header.encode())).await
}

/// Read the peer's header; the peer closing first is a protocol violation.
pub(crate) async fn read_header(framed: &mut FrameStream, timeout: Duration) -> Result<ConnectionHeader> {
    match tokio::time::timeout(timeout, framed.next()).await {
        Err(_) => Err(Error::Timeout(format!(
            "no connection header within {timeout:?}"
        ))),
        Ok(None) => Err(Error::ProtocolViolation(
            "connection closed before header".into(),
        )),
        Ok(Some(frame)) => ConnectionHeader::decode(&frame?),
    }
}

/// Send a rejection header, ignoring write failures.
pub(crate) async fn reject(framed: &mut FrameStream, reason: &str) {
    if let Err(e) = write_header(framed, &ConnectionHeader::error(reason)).await {
        tracing::debug!(error = %e, "failed to send rejection header");
    }
}

pub(crate) async fn connect(addr: (&str, u16), timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(stream) => Ok(stream?),
        Err(_) => Err(Error::Timeout(format!(
            "connect to {}:{} took longer than {timeout:?}",
            addr.0, addr.1
        ))),
    }
}

// ── listener ────────────────────────────────────────────────────────

/// Accept inbound connections until `ctx.cancel` fires, routing each by its
/// header: `topic` to the publication, `service` to the service server.
pub(crate) async fn serve(
    listener: TcpListener,
    ctx: Arc<TransportContext>,
    topics: Arc<TopicManager>,
    services: Arc<ServiceManager>,
) {
    loop {
        let accepted = tokio::select! {
            a = listener.accept() => a,
            _ = ctx.cancel.cancelled() => break,
        };
        match accepted {
            Ok((stream, peer)) => {
                let ctx = ctx.clone();
                let topics = topics.clone();
                let services = services.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_inbound(stream, peer, &ctx, &topics, &services).await {
                        match e {
                            Error::HandshakeMismatch(_) => {
                                tracing::warn!(peer = %peer, error = %e, "rejected inbound connection")
                            }
                            _ => tracing::debug!(peer = %peer, error = %e, "inbound connection ended"),
                        }
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
    tracing::debug!(port = ctx.port, "data-plane listener stopped");
}

async fn handle_inbound(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: &Arc<TransportContext>,
    topics: &Arc<TopicManager>,
    services: &Arc<ServiceManager>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut framed = ctx.framed(stream);
    let header = read_header(&mut framed, ctx.handshake_timeout()).await?;

    if header.get("topic").is_some() {
        topics.accept_subscriber(header, framed, peer).await
    } else if header.get("service").is_some() {
        services.accept(header, framed, peer).await
    } else {
        reject(&mut framed, "header names neither a topic nor a service").await;
        Err(Error::ProtocolViolation(
            "header names neither a topic nor a service".into(),
        ))
    }
}

/// Split `rosrpc://host:port[/]` into host and port.
pub(crate) fn parse_rosrpc_uri(uri: &str) -> Result<(String, u16)> {
    let bad = || Error::ProtocolViolation(format!("invalid service URI {uri:?}"));
    let rest = uri.strip_prefix("rosrpc://").ok_or_else(bad)?;
    let rest = rest.trim_end_matches('/');
    let (host, port) = rest.rsplit_once(':').ok_or_else(bad)?;
    if host.is_empty() {
        return Err(bad());
    }
    let port = port.parse::<u16>().map_err(|_| bad())?;
    Ok((host.to_owned(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rosrpc_uri_parsing() {
        assert_eq!(
            parse_rosrpc_uri("rosrpc://robot-1:45123").unwrap(),
            ("robot-1".to_owned(), 45123)
        );
        assert_eq!(
            parse_rosrpc_uri("rosrpc://10.0.0.2:80/").unwrap(),
            ("10.0.0.2".to_owned(), 80)
        );
        assert!(parse_rosrpc_uri("http://host:1").is_err());
        assert!(parse_rosrpc_uri("rosrpc://host").is_err());
        assert!(parse_rosrpc_uri("rosrpc://:12").is_err());
        assert!(parse_rosrpc_uri("rosrpc://host:70000").is_err());
    }

    #[tokio::test]
    async fn header_read_times_out_on_silent_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(server, FrameCodec::new(1024));
        let err = read_header(&mut framed, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn header_exchange_over_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let mut framed = Framed::new(stream, FrameCodec::new(1024));
            let header = ConnectionHeader::new().with("topic", "/chatter");
            write_header(&mut framed, &header).await.unwrap();
        });
        let (server, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(server, FrameCodec::new(1024));
        let header = read_header(&mut framed, Duration::from_secs(5)).await.unwrap();
        assert_eq!(header.get("topic"), Some("/chatter"));
        client.await.unwrap();
    }
}
