//! Process-level wiring of config source, metrics and instances.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::config::{ConfigSource, ConfigWatcher, EngineSettings, Reloadable, Subscription};
use crate::error::{ConfigError, RpcError};
use crate::grpc::client::{Client, Conn};
use crate::grpc::interceptors::Interceptor;
use crate::grpc::server::Server;
use crate::observability::{MetricsRegistry, start_metrics_server};

/// Binds a system identity to a config source and a metrics registry, and
/// hands out config-driven servers and connections.
pub struct Engine {
    system_id: String,
    source: Arc<dyn ConfigSource>,
    registry: Arc<MetricsRegistry>,
    metrics_addr: String,
    monitor: OnceCell<SocketAddr>,
    /// Server subscriptions live as long as the engine.
    servers: Mutex<Vec<Subscription>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("system_id", &self.system_id)
            .field("metrics_addr", &self.metrics_addr)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(
        system_id: impl Into<String>,
        source: Arc<dyn ConfigSource>,
        registry: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            system_id: system_id.into(),
            source,
            registry,
            metrics_addr: "0.0.0.0:7070".to_string(),
            monitor: OnceCell::new(),
            servers: Mutex::new(Vec::new()),
        }
    }

    /// Engine from bootstrap settings with a fresh metrics registry.
    pub fn from_settings(
        settings: &EngineSettings,
        source: Arc<dyn ConfigSource>,
    ) -> Result<Self, RpcError> {
        let registry = Arc::new(MetricsRegistry::new()?);
        Ok(Self::new(settings.system_id.clone(), source, registry)
            .with_metrics_addr(settings.metrics_addr.clone()))
    }

    pub fn with_metrics_addr(mut self, addr: impl Into<String>) -> Self {
        self.metrics_addr = addr.into();
        self
    }

    pub fn system_id(&self) -> &str {
        &self.system_id
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    /// Config path of a server: `/system/{app}/{group}/{path}`.
    pub fn server_path(app: &str, group: &str, path: &str) -> String {
        format!("/system/{app}/{group}/{path}")
    }

    /// Config path of the client for a target system.
    pub fn client_path(system_id: &str) -> String {
        format!("/system/base/rpc/{system_id}")
    }

    /// Subscribe a watcher to `path` and require the first notification to
    /// activate it. A watcher that fails to activate is unsubscribed.
    fn watch<T: Reloadable>(
        &self,
        path: String,
        interceptors: Vec<Arc<dyn Interceptor>>,
    ) -> Result<(Arc<ConfigWatcher<T>>, Subscription), RpcError> {
        let watcher = Arc::new(ConfigWatcher::<T>::new(
            path.clone(),
            interceptors,
            self.registry.clone(),
        ));
        let id = self.source.subscribe(&[path.clone()], watcher.clone())?;
        let subscription = Subscription::new(self.source.clone(), id);

        if watcher.instance().is_none() {
            drop(subscription);
            let err = watcher
                .take_startup_error()
                .unwrap_or(ConfigError::Inactive(path));
            return Err(err.into());
        }
        Ok((watcher, subscription))
    }

    /// Config-driven server for `/system/{app}/{group}/{path}`. With
    /// `monitor` set, also serves the metrics endpoint.
    pub async fn server(
        &self,
        app: &str,
        group: &str,
        path: &str,
        monitor: bool,
        interceptors: Vec<Arc<dyn Interceptor>>,
    ) -> Result<Arc<Server>, RpcError> {
        let (watcher, subscription) =
            self.watch::<Server>(Self::server_path(app, group, path), interceptors)?;
        let server = watcher
            .instance()
            .ok_or_else(|| ConfigError::Inactive(watcher.path().to_string()))?;
        if monitor {
            self.monitor().await?;
        }
        self.servers.lock().push(subscription);
        Ok(server)
    }

    /// Connection to `system_id` using the client config published for it.
    /// Outgoing calls carry this engine's system id as caller. The connection
    /// follows config changes until its last clone is dropped.
    pub async fn client_conn(
        &self,
        system_id: &str,
        interceptors: Vec<Arc<dyn Interceptor>>,
    ) -> Result<Conn, RpcError> {
        let (watcher, subscription) =
            self.watch::<Client>(Self::client_path(system_id), interceptors)?;
        let inactive = || ConfigError::Inactive(watcher.path().to_string());
        let client = watcher.instance().ok_or_else(inactive)?;
        let settings = watcher.settings().ok_or_else(inactive)?;
        let conn = client
            .dial(&settings.target, vec![self.system_id.clone()])
            .await?;
        Ok(conn.with_subscription(subscription))
    }

    /// Start the metrics endpoint once; later calls return the same address.
    pub async fn monitor(&self) -> Result<SocketAddr, RpcError> {
        let addr = self
            .monitor
            .get_or_try_init(|| async {
                let addr: SocketAddr =
                    self.metrics_addr
                        .parse()
                        .map_err(|source| RpcError::InvalidAddr {
                            addr: self.metrics_addr.clone(),
                            source,
                        })?;
                start_metrics_server(self.registry.clone(), addr).await?;
                Ok::<_, RpcError>(addr)
            })
            .await?;
        Ok(*addr)
    }
}
