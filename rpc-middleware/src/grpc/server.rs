//! Server instance and the glue between tonic handlers and the chain.
//!
//! Service implementations route each unary method through [`Server::unary`]:
//!
//! ```ignore
//! async fn say_hello(&self, request: Request<HelloRequest>) -> Result<Response<HelloReply>, tonic::Status> {
//!     self.rpc.unary("/helloworld.Greeter/SayHello", request, |ctx, req| async move {
//!         Ok(HelloReply { message: format!("hello {}", req.name) })
//!     }).await
//! }
//! ```

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;

use super::bridge::ServerBridge;
use super::context::CallContext;
use super::error::{from_call_error, to_wire};
use super::interceptors::{
    CallResult, Interceptor, InterceptorChain, Invoker, Payload, Recovery, UnaryRequest, check_bound,
};
use super::observer::ServerObserver;
use super::status::{BusinessCode, Status};
use crate::config::{CallConfig, ServerSettings};
use crate::error::{ConfigError, RpcError};
use crate::observability::MetricsRegistry;

/// Builder for [`Server`].
pub struct ServerBuilder {
    settings: ServerSettings,
    interceptors: Vec<Arc<dyn Interceptor>>,
    registry: Option<Arc<MetricsRegistry>>,
}

impl ServerBuilder {
    /// Register one user interceptor; it runs after logging and before the
    /// bridge, in registration order.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Result<Self, RpcError> {
        check_bound(self.interceptors.len() + 1)?;
        self.interceptors.push(interceptor);
        Ok(self)
    }

    pub fn interceptors(
        mut self,
        interceptors: impl IntoIterator<Item = Arc<dyn Interceptor>>,
    ) -> Result<Self, RpcError> {
        for interceptor in interceptors {
            self = self.interceptor(interceptor)?;
        }
        Ok(self)
    }

    pub fn registry(mut self, registry: Arc<MetricsRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<Server, RpcError> {
        let ServerSettings { call, addr, tags } = self.settings;
        call.validate()?;
        let registry = match self.registry {
            Some(registry) => registry,
            None => Arc::new(MetricsRegistry::new()?),
        };

        let mut interceptors: Vec<Arc<dyn Interceptor>> =
            Vec::with_capacity(self.interceptors.len() + 3);
        interceptors.push(Arc::new(Recovery));
        interceptors.push(Arc::new(ServerObserver::new(registry.clone())));
        interceptors.extend(self.interceptors);
        interceptors.push(Arc::new(ServerBridge::new(tags)));

        Ok(Server {
            config: RwLock::new(Arc::new(call)),
            addr,
            chain: InterceptorChain::new(interceptors),
            registry,
        })
    }
}

/// A server instance. The chain is fixed at construction; only the call
/// configuration can change afterwards.
pub struct Server {
    config: RwLock<Arc<CallConfig>>,
    addr: String,
    chain: InterceptorChain,
    registry: Arc<MetricsRegistry>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.addr)
            .field("config", &self.config())
            .field("chain", &self.chain)
            .finish()
    }
}

impl Server {
    pub fn builder(settings: ServerSettings) -> ServerBuilder {
        ServerBuilder {
            settings,
            interceptors: Vec::new(),
            registry: None,
        }
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> Arc<CallConfig> {
        self.config.read().clone()
    }

    /// Replace the configuration. Calls in flight keep their snapshot.
    pub fn set_config(&self, config: CallConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let config = Arc::new(config);
        *self.config.write() = config;
        Ok(())
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    pub fn chain(&self) -> &InterceptorChain {
        &self.chain
    }

    /// Listen address from the settings the server was built with.
    pub fn addr(&self) -> Result<SocketAddr, RpcError> {
        self.addr.parse().map_err(|source| RpcError::InvalidAddr {
            addr: self.addr.clone(),
            source,
        })
    }

    /// A tonic server builder carrying the current keepalive and timeout
    /// settings. Add services and serve on [`Server::addr`].
    pub fn transport(&self) -> tonic::transport::Server {
        let config = self.config();
        tonic::transport::Server::builder()
            .http2_keepalive_interval(Some(config.keep_alive_interval))
            .http2_keepalive_timeout(Some(config.keep_alive_timeout))
            .timeout(config.timeout)
    }

    /// Run a decoded call through the chain with a custom terminal invoker.
    pub async fn handle(
        &self,
        ctx: CallContext,
        body: Payload,
        invoker: &dyn Invoker,
    ) -> Result<Payload, Status> {
        self.chain
            .call(UnaryRequest::new(ctx, body), invoker)
            .await
            .map_err(from_call_error)
    }

    /// Serve one unary call with `handler`, translating failures to the wire.
    pub async fn unary<Req, Resp, F, Fut>(
        &self,
        method: &str,
        request: tonic::Request<Req>,
        handler: F,
    ) -> Result<tonic::Response<Resp>, tonic::Status>
    where
        Req: prost::Message + 'static,
        Resp: prost::Message + 'static,
        F: Fn(CallContext, Req) -> Fut + Send + Sync,
        Fut: Future<Output = Result<Resp, Status>> + Send,
    {
        let ctx = CallContext::incoming(
            method,
            self.config(),
            request.metadata(),
            request.remote_addr(),
        );
        let invoker = HandlerInvoker::new(handler);

        let reply = self
            .handle(ctx, Payload::loggable(request.into_inner()), &invoker)
            .await
            .map_err(|status| to_wire(&status))?;
        reply.downcast::<Resp>().map(tonic::Response::new).map_err(|_| {
            to_wire(&Status::with_message(
                BusinessCode::ServerErr,
                "unexpected reply type",
            ))
        })
    }
}

type HandlerFuture<'h, Resp> = BoxFuture<'h, Result<Resp, Status>>;

/// Terminal invoker calling a typed service handler.
pub struct HandlerInvoker<'h, Req, Resp> {
    handler: Box<dyn Fn(CallContext, Req) -> HandlerFuture<'h, Resp> + Send + Sync + 'h>,
}

impl<'h, Req, Resp> HandlerInvoker<'h, Req, Resp> {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'h,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'h,
    {
        Self {
            handler: Box::new(move |ctx, req| handler(ctx, req).boxed()),
        }
    }
}

#[async_trait]
impl<'h, Req, Resp> Invoker for HandlerInvoker<'h, Req, Resp>
where
    Req: prost::Message + 'static,
    Resp: prost::Message + 'static,
{
    async fn invoke(&self, request: UnaryRequest) -> CallResult {
        let UnaryRequest { ctx, body } = request;
        let message = body.downcast::<Req>().map_err(|_| {
            Status::with_message(BusinessCode::RequestErr, "unexpected request type")
        })?;
        let reply = (self.handler)(ctx, message).await?;
        Ok(Payload::loggable(reply))
    }
}
