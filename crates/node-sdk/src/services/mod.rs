//! Service transport: the per-node service server and typed clients.

mod client;
mod handler;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{FutureExt, SinkExt, StreamExt};
use parking_lot::Mutex;
use rn_domain::{Error, Result};
use rn_protocol::header::schema_matches;
use rn_protocol::xmlrpc::Value;
use rn_protocol::{ConnectionHeader, ServiceReply, ServiceServerCodec};

use crate::master::RegistrationKind;
use crate::tcpros::{reject, write_header, FrameStream, TransportContext};

pub use client::ServiceClient;
pub use handler::{ServiceContext, ServiceHandler};
pub(crate) use handler::TypedService;

/// Schema and handler of one advertised service.
pub(crate) struct ServiceEntry {
    pub name: String,
    pub srv_type: String,
    pub md5sum: String,
    pub request_type: String,
    pub response_type: String,
    pub handler: Arc<dyn ServiceHandler>,
    requests: AtomicU64,
}

impl ServiceEntry {
    pub fn new(
        name: &str,
        srv_type: String,
        md5sum: String,
        request_type: String,
        response_type: String,
        handler: Arc<dyn ServiceHandler>,
    ) -> Self {
        Self {
            name: name.to_owned(),
            srv_type,
            md5sum,
            request_type,
            response_type,
            handler,
            requests: AtomicU64::new(0),
        }
    }
}

/// Serves every service this node advertises on the shared listener.
pub struct ServiceManager {
    ctx: Arc<TransportContext>,
    services: Mutex<HashMap<String, Arc<ServiceEntry>>>,
}

impl ServiceManager {
    pub(crate) fn new(ctx: Arc<TransportContext>) -> Self {
        Self {
            ctx,
            services: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn context(&self) -> &Arc<TransportContext> {
        &self.ctx
    }

    /// Register a service locally and with the registry.  A name may only be
    /// advertised once per node.
    pub(crate) async fn advertise(&self, entry: ServiceEntry) -> Result<()> {
        let name = entry.name.clone();
        {
            let mut services = self.services.lock();
            if services.contains_key(&name) {
                return Err(Error::Config(format!("service {name} is already advertised")));
            }
            services.insert(name.clone(), Arc::new(entry));
        }

        let uri = self.ctx.service_uri();
        if let Err(e) = self
            .ctx
            .master
            .register(RegistrationKind::Service, &name, "", &uri)
            .await
        {
            self.services.lock().remove(&name);
            return Err(e);
        }
        tracing::info!(service = %name, uri = %uri, "advertised service");
        Ok(())
    }

    pub(crate) async fn unadvertise(&self, name: &str) {
        if self.services.lock().remove(name).is_none() {
            return;
        }
        if let Err(e) = self
            .ctx
            .master
            .unregister(RegistrationKind::Service, name, &self.ctx.service_uri())
            .await
        {
            tracing::warn!(service = %name, error = %e, "failed to unregister service");
        }
    }

    /// Serve one inbound service connection: handshake, then one request
    /// (or many, if the client asked for a persistent connection).
    pub(crate) async fn accept(
        &self,
        header: ConnectionHeader,
        mut framed: FrameStream,
        peer: SocketAddr,
    ) -> Result<()> {
        let name = header.require("service")?.to_owned();
        let caller_id = header.get("callerid").unwrap_or("unknown").to_owned();
        let entry = self.services.lock().get(&name).cloned();
        let Some(entry) = entry else {
            let reason = format!("{} does not provide {name}", self.ctx.caller_id);
            reject(&mut framed, &reason).await;
            return Err(Error::HandshakeMismatch(reason));
        };
        let md5sum = header.get("md5sum").unwrap_or("*");
        if !schema_matches(&entry.md5sum, md5sum) {
            let reason = format!(
                "{name} expects md5sum {} but {caller_id} sent {md5sum}",
                entry.md5sum
            );
            reject(&mut framed, &reason).await;
            return Err(Error::HandshakeMismatch(reason));
        }

        let reply = ConnectionHeader::new()
            .with("callerid", self.ctx.caller_id.as_str())
            .with("md5sum", entry.md5sum.as_str())
            .with("type", entry.srv_type.as_str())
            .with("request_type", entry.request_type.as_str())
            .with("response_type", entry.response_type.as_str());
        write_header(&mut framed, &reply).await?;
        if header.flag("probe") {
            return Ok(());
        }

        let persistent = header.flag("persistent");
        let max = self.ctx.config.max_frame_bytes;
        let mut framed = framed.map_codec(|_| ServiceServerCodec::new(max));
        tracing::debug!(service = %name, caller = %caller_id, peer = %peer, persistent, "service client connected");

        loop {
            let request = tokio::select! {
                r = framed.next() => r,
                _ = self.ctx.cancel.cancelled() => break,
            };
            let request = match request {
                None => break,
                Some(r) => r?.freeze(),
            };

            let ctx = ServiceContext {
                service: name.clone(),
                caller_id: caller_id.clone(),
            };
            let mut reply = match AssertUnwindSafe(entry.handler.call(ctx, request))
                .catch_unwind()
                .await
            {
                Ok(Ok(response)) => ServiceReply::success(response),
                Ok(Err(message)) => ServiceReply::failure(message),
                Err(_panic) => {
                    tracing::error!(service = %name, caller = %caller_id, "service handler panicked");
                    ServiceReply::failure("service handler panicked")
                }
            };
            if reply.payload.len() > max {
                reply = ServiceReply::failure(format!(
                    "response of {} bytes exceeds maximum {max}",
                    reply.payload.len()
                ));
            }
            entry.requests.fetch_add(1, Ordering::Relaxed);
            framed.send(reply).await?;

            if !persistent {
                break;
            }
        }
        Ok(())
    }

    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// `getBusStats` service entries: `[name, requestCount]`.
    pub(crate) fn bus_stats(&self) -> Vec<Value> {
        self.services
            .lock()
            .values()
            .map(|e| {
                let n = e.requests.load(Ordering::Relaxed).min(i32::MAX as u64) as i32;
                Value::Array(vec![e.name.as_str().into(), Value::Int(n)])
            })
            .collect()
    }

    pub(crate) async fn shutdown(&self) {
        let names: Vec<String> = self.services.lock().keys().cloned().collect();
        for name in names {
            self.unadvertise(&name).await;
        }
    }
}

/// Keeps a service advertised; dropping it (or `shutdown`) withdraws it.
pub struct ServiceServer {
    name: String,
    manager: Option<Arc<ServiceManager>>,
}

impl ServiceServer {
    pub(crate) fn new(name: String, manager: Arc<ServiceManager>) -> Self {
        Self {
            name,
            manager: Some(manager),
        }
    }

    pub fn service(&self) -> &str {
        &self.name
    }

    pub async fn shutdown(mut self) {
        if let Some(manager) = self.manager.take() {
            manager.unadvertise(&self.name).await;
        }
    }
}

impl Drop for ServiceServer {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.take() {
            let name = std::mem::take(&mut self.name);
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move { manager.unadvertise(&name).await });
            }
        }
    }
}
