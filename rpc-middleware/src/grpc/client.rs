//! Client instance: hot-swappable configuration plus a fixed interceptor list.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use http::uri::PathAndQuery;
use parking_lot::RwLock;
use tokio::time::Instant;
use tonic::codec::ProstCodec;
use tonic::transport::{Channel, Endpoint};

use super::bridge::ClientBridge;
use super::context::{CallOptions, MAX_GRPC_TIMEOUT, guarded};
use super::error::{CallError, from_call_error};
use super::interceptors::{
    CallResult, Interceptor, InterceptorChain, Invoker, Payload, Recovery, UnaryRequest, check_bound,
};
use super::observer::ClientObserver;
use super::status::{BusinessCode, Status};
use crate::config::{CallConfig, Subscription};
use crate::error::{ConfigError, RpcError};
use crate::observability::{MetricsRegistry, TracePropagator, W3cPropagator};

type EndpointOption = Box<dyn Fn(Endpoint) -> Endpoint + Send + Sync>;

/// Builder for [`Client`]. Interceptors can only be registered here.
pub struct ClientBuilder {
    config: CallConfig,
    interceptors: Vec<Arc<dyn Interceptor>>,
    registry: Option<Arc<MetricsRegistry>>,
    propagator: Arc<dyn TracePropagator>,
    endpoint_options: Vec<EndpointOption>,
}

impl ClientBuilder {
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

    pub fn propagator(mut self, propagator: Arc<dyn TracePropagator>) -> Self {
        self.propagator = propagator;
        self
    }

    /// Transport-level option applied to every endpoint this client dials.
    pub fn endpoint_option(
        mut self,
        option: impl Fn(Endpoint) -> Endpoint + Send + Sync + 'static,
    ) -> Self {
        self.endpoint_options.push(Box::new(option));
        self
    }

    pub fn build(self) -> Result<Client, RpcError> {
        self.config.validate()?;
        let registry = match self.registry {
            Some(registry) => registry,
            None => Arc::new(MetricsRegistry::new()?),
        };
        Ok(Client {
            config: RwLock::new(Arc::new(self.config)),
            interceptors: self.interceptors,
            registry,
            propagator: self.propagator,
            endpoint_options: self.endpoint_options,
        })
    }
}

/// A client instance. Create it once per target and caller identity and share
/// it behind an `Arc`.
pub struct Client {
    config: RwLock<Arc<CallConfig>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    registry: Arc<MetricsRegistry>,
    propagator: Arc<dyn TracePropagator>,
    endpoint_options: Vec<EndpointOption>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config())
            .field("interceptors", &self.interceptors.len())
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn builder(config: CallConfig) -> ClientBuilder {
        ClientBuilder {
            config,
            interceptors: Vec::new(),
            registry: None,
            propagator: Arc::new(W3cPropagator),
            endpoint_options: Vec::new(),
        }
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> Arc<CallConfig> {
        self.config.read().clone()
    }

    /// Replace the configuration. Calls already started keep their snapshot.
    pub fn set_config(&self, config: CallConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let config = Arc::new(config);
        *self.config.write() = config;
        Ok(())
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    /// The full chain for a connection made on behalf of `callers`.
    pub fn chain(&self, callers: Vec<String>) -> InterceptorChain {
        let mut interceptors: Vec<Arc<dyn Interceptor>> =
            Vec::with_capacity(self.interceptors.len() + 3);
        interceptors.push(Arc::new(Recovery));
        interceptors.push(Arc::new(ClientObserver::new(self.registry.clone())));
        interceptors.extend(self.interceptors.iter().cloned());
        // the bridge must stay last
        interceptors.push(Arc::new(ClientBridge::new(callers, self.propagator.clone())));
        InterceptorChain::new(interceptors)
    }

    /// Endpoint for `target` with the current dial and keepalive settings.
    pub fn endpoint(&self, target: &str) -> Result<Endpoint, RpcError> {
        let config = self.config();
        let uri = if target.contains("://") {
            target.to_string()
        } else {
            format!("http://{target}")
        };
        let mut endpoint = Endpoint::from_shared(uri)
            .map_err(|source| RpcError::InvalidTarget {
                target: target.to_string(),
                source,
            })?
            .http2_keep_alive_interval(config.keep_alive_interval)
            .keep_alive_timeout(config.keep_alive_timeout)
            .keep_alive_while_idle(config.permit_without_stream);
        if !config.dial.is_zero() {
            endpoint = endpoint.connect_timeout(config.dial);
        }
        for option in &self.endpoint_options {
            endpoint = option(endpoint);
        }
        Ok(endpoint)
    }

    /// Connect to `target`. Blocks until connected unless `nonBlock` is set;
    /// the wait is bounded by the `dial` timeout.
    pub async fn dial(self: &Arc<Self>, target: &str, callers: Vec<String>) -> Result<Conn, RpcError> {
        let config = self.config();
        let endpoint = self.endpoint(target)?;

        let channel = if config.non_block {
            endpoint.connect_lazy()
        } else {
            let connect = endpoint.connect();
            let connected = if config.dial.is_zero() {
                connect.await
            } else {
                tokio::time::timeout(config.dial, connect)
                    .await
                    .map_err(|_| RpcError::DialTimeout(target.to_string()))?
            };
            connected.map_err(|source| {
                tracing::error!(target, error = %source, "rpc client dial failed");
                RpcError::Dial {
                    target: target.to_string(),
                    source,
                }
            })?
        };

        Ok(Conn {
            channel,
            chain: self.chain(callers),
            client: self.clone(),
            target: target.to_string(),
            _subscription: None,
        })
    }
}

/// A dialed connection with its interceptor chain.
#[derive(Clone)]
pub struct Conn {
    channel: Channel,
    chain: InterceptorChain,
    client: Arc<Client>,
    target: String,
    _subscription: Option<Arc<Subscription>>,
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("target", &self.target)
            .field("chain", &self.chain)
            .finish_non_exhaustive()
    }
}

impl Conn {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// The client instance whose configuration this connection follows.
    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// Keep `subscription` alive for as long as any clone of this connection.
    pub fn with_subscription(mut self, subscription: Subscription) -> Self {
        self._subscription = Some(Arc::new(subscription));
        self
    }

    /// Run a call through the chain with a custom terminal invoker.
    pub async fn call(
        &self,
        method: &str,
        body: Payload,
        options: CallOptions,
        invoker: &dyn Invoker,
    ) -> Result<Payload, Status> {
        let mut ctx = options.into_context(method, self.client.config());
        ctx.peer = Some(self.target.clone());
        self.chain
            .call(UnaryRequest::new(ctx, body), invoker)
            .await
            .map_err(from_call_error)
    }

    /// Typed unary call over this connection's channel.
    pub async fn unary<Req, Resp>(
        &self,
        method: &str,
        request: Req,
        options: CallOptions,
    ) -> Result<Resp, Status>
    where
        Req: prost::Message + 'static,
        Resp: prost::Message + Default + 'static,
    {
        let invoker = TonicInvoker::<Req, Resp>::new(self.channel.clone());
        let reply = self
            .call(method, Payload::loggable(request), options, &invoker)
            .await?;
        reply.downcast::<Resp>().map_err(|_| {
            Status::with_message(BusinessCode::ServerErr, "unexpected reply type")
        })
    }
}

/// Terminal invoker sending prost messages over a tonic channel.
pub struct TonicInvoker<Req, Resp> {
    channel: Channel,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> TonicInvoker<Req, Resp> {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            _types: PhantomData,
        }
    }
}

#[async_trait]
impl<Req, Resp> Invoker for TonicInvoker<Req, Resp>
where
    Req: prost::Message + 'static,
    Resp: prost::Message + Default + 'static,
{
    async fn invoke(&self, request: UnaryRequest) -> CallResult {
        let UnaryRequest { ctx, body } = request;
        let message = body.downcast::<Req>().map_err(|_| {
            Status::with_message(BusinessCode::RequestErr, "unexpected request type")
        })?;
        let path = PathAndQuery::try_from(ctx.method.as_str()).map_err(|_| {
            Status::with_message(BusinessCode::MethodNotAllowed, format!("invalid method {}", ctx.method))
        })?;

        let mut request = tonic::Request::new(message);
        ctx.outgoing.write_to(request.metadata_mut());
        if let Some(deadline) = ctx.deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            request.set_timeout(remaining.min(MAX_GRPC_TIMEOUT));
        }

        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        let call = async move {
            grpc.ready()
                .await
                .map_err(|e| tonic::Status::unavailable(format!("Service was not ready: {e}")))?;
            grpc.unary(request, path, ProstCodec::<Req, Resp>::default())
                .await
        };

        match guarded(ctx.deadline, &ctx.cancel, call).await? {
            Ok(response) => Ok(Payload::loggable(response.into_inner())),
            Err(status) => Err(CallError::Transport(status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> CallConfig {
        CallConfig {
            timeout: Duration::from_secs(1),
            keep_alive_interval: Duration::from_secs(60),
            keep_alive_timeout: Duration::from_secs(20),
            non_block: true,
            ..Default::default()
        }
    }

    struct Noop;

    #[async_trait]
    impl Interceptor for Noop {
        async fn intercept(
            &self,
            request: UnaryRequest,
            next: super::super::interceptors::Next<'_>,
        ) -> CallResult {
            next.run(request).await
        }
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let result = Client::builder(CallConfig::default()).build();
        assert!(matches!(
            result,
            Err(RpcError::Config(ConfigError::NonPositive("timeout")))
        ));
    }

    #[test]
    fn test_interceptor_bound_at_registration() {
        let mut builder = Client::builder(config());
        for _ in 0..super::super::interceptors::MAX_INTERCEPTORS {
            builder = builder.interceptor(Arc::new(Noop)).unwrap();
        }
        assert!(matches!(
            builder.interceptor(Arc::new(Noop)),
            Err(RpcError::Chain(_))
        ));
    }

    #[test]
    fn test_chain_layout() {
        let client = Client::builder(config())
            .interceptor(Arc::new(Noop))
            .unwrap()
            .build()
            .unwrap();
        // recovery, observer, user, bridge
        assert_eq!(client.chain(vec!["svc".into()]).len(), 4);
    }

    #[test]
    fn test_set_config_swaps_snapshot() {
        let client = Client::builder(config()).build().unwrap();
        let before = client.config();

        let mut updated = config();
        updated.timeout = Duration::from_secs(5);
        client.set_config(updated).unwrap();

        assert_eq!(before.timeout, Duration::from_secs(1));
        assert_eq!(client.config().timeout, Duration::from_secs(5));
        assert!(client.set_config(CallConfig::default()).is_err());
        assert_eq!(client.config().timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_non_blocking_dial_is_lazy() {
        let client = Arc::new(Client::builder(config()).build().unwrap());
        let conn = client.dial("127.0.0.1:1", vec!["svc".into()]).await.unwrap();
        assert_eq!(conn.target(), "127.0.0.1:1");
    }

    #[tokio::test]
    async fn test_blocking_dial_reports_failure() {
        let mut blocking = config();
        blocking.non_block = false;
        blocking.dial = Duration::from_secs(2);
        let client = Arc::new(Client::builder(blocking).build().unwrap());

        let err = client.dial("127.0.0.1:1", Vec::new()).await.unwrap_err();
        assert!(matches!(
            err,
            RpcError::Dial { .. } | RpcError::DialTimeout(_)
        ));
    }

    #[tokio::test]
    async fn test_unary_over_unreachable_channel() {
        let client = Arc::new(Client::builder(config()).build().unwrap());
        let conn = client.dial("127.0.0.1:1", vec!["svc".into()]).await.unwrap();

        let status = conn
            .unary::<prost_types::Duration, prost_types::Duration>(
                "/test.Svc/Call",
                prost_types::Duration::default(),
                CallOptions::default(),
            )
            .await
            .unwrap_err();
        // connection failures surface as Unavailable on the wire
        assert!(matches!(
            status.code(),
            BusinessCode::ServiceUnavailable | BusinessCode::ServerErr
        ));
    }
}
