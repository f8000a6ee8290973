//! Service handlers: the untyped trait the transport dispatches to, and the
//! typed adapter `NodeHandle::advertise_service` wraps closures in.

use std::future::Future;
use std::marker::PhantomData;

use bytes::Bytes;
use rn_protocol::{RosMessage, RosService};

/// Context passed to every service invocation.
#[derive(Clone, Debug)]
pub struct ServiceContext {
    /// Resolved service name.
    pub service: String,
    /// Caller id the client sent in its connection header.
    pub caller_id: String,
}

/// Handles raw service requests.
///
/// `Ok` carries the serialized response; `Err` carries the failure text
/// returned to the client with status byte `0`.
///
/// # Example
///
/// ```rust,no_run
/// use rn_node::{ServiceContext, ServiceHandler};
///
/// struct Echo;
///
/// #[async_trait::async_trait]
/// impl ServiceHandler for Echo {
///     async fn call(&self, _ctx: ServiceContext, request: bytes::Bytes) -> Result<Vec<u8>, String> {
///         Ok(request.to_vec())
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait ServiceHandler: Send + Sync + 'static {
    async fn call(&self, ctx: ServiceContext, request: Bytes) -> Result<Vec<u8>, String>;
}

/// Adapts `Fn(S::Request) -> Future<Output = Result<S::Response, String>>`.
pub(crate) struct TypedService<S, F> {
    f: F,
    _marker: PhantomData<fn(S)>,
}

impl<S, F> TypedService<S, F> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait::async_trait]
impl<S, F, Fut> ServiceHandler for TypedService<S, F>
where
    S: RosService,
    F: Fn(S::Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<S::Response, String>> + Send + 'static,
{
    async fn call(&self, _ctx: ServiceContext, request: Bytes) -> Result<Vec<u8>, String> {
        let request = S::Request::from_bytes(&request).map_err(|e| e.to_string())?;
        let response = (self.f)(request).await?;
        Ok(response.to_bytes())
    }
}
