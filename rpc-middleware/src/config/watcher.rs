//! Configuration subscription and hot reload.
//!
//! A [`ConfigWatcher`] builds its instance from the first notification and
//! swaps the instance's configuration on every later one. A bad first
//! payload is fatal; a bad later payload is rejected and the previous
//! configuration stays in effect.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;

use super::call::{CallConfig, ClientSettings, ServerSettings};
use crate::error::{ConfigError, RpcError};
use crate::grpc::client::Client;
use crate::grpc::interceptors::Interceptor;
use crate::grpc::server::Server;
use crate::observability::MetricsRegistry;

/// Receives path to payload snapshots from a [`ConfigSource`].
pub trait ConfigListener: Send + Sync {
    fn changed(&self, data: &HashMap<String, String>);
}

/// Identifies one subscription within its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// A hierarchical configuration store.
///
/// Implementations must notify a listener at least once right after
/// subscription and again whenever one of its paths changes, until the
/// subscription is removed.
pub trait ConfigSource: Send + Sync {
    fn subscribe(
        &self,
        paths: &[String],
        listener: Arc<dyn ConfigListener>,
    ) -> Result<SubscriptionId, ConfigError>;

    /// Stop notifying the listener registered under `id`.
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Removes its subscription from the source when dropped.
pub struct Subscription {
    source: Arc<dyn ConfigSource>,
    id: SubscriptionId,
}

impl Subscription {
    pub fn new(source: Arc<dyn ConfigSource>, id: SubscriptionId) -> Self {
        Self { source, id }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.source.unsubscribe(self.id);
    }
}

struct Subscriber {
    id: SubscriptionId,
    paths: Vec<String>,
    listener: Arc<dyn ConfigListener>,
}

#[derive(Default)]
struct MemoryState {
    values: HashMap<String, String>,
    subscribers: Vec<Subscriber>,
    next_id: u64,
}

impl MemoryState {
    fn snapshot(&self, paths: &[String]) -> HashMap<String, String> {
        paths
            .iter()
            .filter_map(|path| {
                self.values
                    .get(path)
                    .map(|payload| (path.clone(), payload.clone()))
            })
            .collect()
    }
}

/// In-process [`ConfigSource`].
#[derive(Default)]
pub struct MemorySource {
    state: Mutex<MemoryState>,
}

impl fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemorySource")
            .field("paths", &state.values.keys().collect::<Vec<_>>())
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `payload` at `path` and notify every subscriber of that path.
    pub fn set(&self, path: impl Into<String>, payload: impl Into<String>) {
        let path = path.into();
        self.state.lock().values.insert(path.clone(), payload.into());
        self.notify(&path);
    }

    /// Delete `path` and notify its subscribers.
    pub fn remove(&self, path: &str) {
        self.state.lock().values.remove(path);
        self.notify(path);
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.state.lock().values.get(path).cloned()
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    fn notify(&self, path: &str) {
        // listeners run without the lock held
        let pending: Vec<_> = {
            let state = self.state.lock();
            state
                .subscribers
                .iter()
                .filter(|sub| sub.paths.iter().any(|p| p == path))
                .map(|sub| (sub.listener.clone(), state.snapshot(&sub.paths)))
                .collect()
        };
        for (listener, data) in pending {
            listener.changed(&data);
        }
    }
}

impl ConfigSource for MemorySource {
    fn subscribe(
        &self,
        paths: &[String],
        listener: Arc<dyn ConfigListener>,
    ) -> Result<SubscriptionId, ConfigError> {
        let (id, data) = {
            let mut state = self.state.lock();
            let id = SubscriptionId(state.next_id);
            state.next_id += 1;
            state.subscribers.push(Subscriber {
                id,
                paths: paths.to_vec(),
                listener: listener.clone(),
            });
            (id, state.snapshot(paths))
        };
        listener.changed(&data);
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.state.lock().subscribers.retain(|sub| sub.id != id);
    }
}

/// An instance whose configuration can be replaced while it serves calls.
pub trait Reloadable: Send + Sync + Sized + 'static {
    type Settings: DeserializeOwned + AsRef<CallConfig> + Send + Sync + 'static;

    /// Build the instance from its first configuration.
    fn activate(
        settings: &Self::Settings,
        interceptors: Vec<Arc<dyn Interceptor>>,
        registry: Arc<MetricsRegistry>,
    ) -> Result<Self, RpcError>;

    /// Swap in a later configuration.
    fn reload(&self, settings: &Self::Settings) -> Result<(), ConfigError>;
}

impl Reloadable for Client {
    type Settings = ClientSettings;

    fn activate(
        settings: &ClientSettings,
        interceptors: Vec<Arc<dyn Interceptor>>,
        registry: Arc<MetricsRegistry>,
    ) -> Result<Self, RpcError> {
        Client::builder(settings.call.clone())
            .interceptors(interceptors)?
            .registry(registry)
            .build()
    }

    fn reload(&self, settings: &ClientSettings) -> Result<(), ConfigError> {
        self.set_config(settings.call.clone())
    }
}

impl Reloadable for Server {
    type Settings = ServerSettings;

    fn activate(
        settings: &ServerSettings,
        interceptors: Vec<Arc<dyn Interceptor>>,
        registry: Arc<MetricsRegistry>,
    ) -> Result<Self, RpcError> {
        Server::builder(settings.clone())
            .interceptors(interceptors)?
            .registry(registry)
            .build()
    }

    fn reload(&self, settings: &ServerSettings) -> Result<(), ConfigError> {
        self.set_config(settings.call.clone())
    }
}

/// Result of applying one notification.
#[derive(Debug)]
pub enum Outcome {
    /// The instance was built from the first valid configuration.
    Activated,
    /// A later configuration replaced the previous one.
    Updated,
    /// A later configuration was invalid; the previous one is kept.
    Rejected(ConfigError),
}

struct Active<T: Reloadable> {
    instance: Arc<T>,
    settings: Arc<T::Settings>,
}

/// Owns the lifecycle of one [`Reloadable`] instance bound to one path.
pub struct ConfigWatcher<T: Reloadable> {
    path: String,
    interceptors: Vec<Arc<dyn Interceptor>>,
    registry: Arc<MetricsRegistry>,
    active: Mutex<Option<Active<T>>>,
    startup_error: Mutex<Option<ConfigError>>,
}

impl<T: Reloadable> fmt::Debug for ConfigWatcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigWatcher")
            .field("path", &self.path)
            .field("active", &self.active.lock().is_some())
            .finish()
    }
}

impl<T: Reloadable> ConfigWatcher<T> {
    pub fn new(
        path: impl Into<String>,
        interceptors: Vec<Arc<dyn Interceptor>>,
        registry: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            path: path.into(),
            interceptors,
            registry,
            active: Mutex::new(None),
            startup_error: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The instance, once the first valid configuration arrived.
    pub fn instance(&self) -> Option<Arc<T>> {
        self.active.lock().as_ref().map(|active| active.instance.clone())
    }

    /// The last configuration that was accepted.
    pub fn settings(&self) -> Option<Arc<T::Settings>> {
        self.active.lock().as_ref().map(|active| active.settings.clone())
    }

    /// The error that kept the first notification from activating, if any.
    pub fn take_startup_error(&self) -> Option<ConfigError> {
        self.startup_error.lock().take()
    }

    fn decode(&self, data: &HashMap<String, String>) -> Result<T::Settings, ConfigError> {
        let payload = data
            .get(&self.path)
            .ok_or_else(|| ConfigError::MissingPath(self.path.clone()))?;
        let settings: T::Settings =
            serde_json::from_str(payload).map_err(|source| ConfigError::Decode {
                path: self.path.clone(),
                source,
            })?;
        settings.as_ref().validate()?;
        Ok(settings)
    }

    /// Apply one notification from the config source.
    pub fn apply(&self, data: &HashMap<String, String>) -> Result<Outcome, ConfigError> {
        // held for the whole apply so notifications never interleave
        let mut active = self.active.lock();
        let decoded = self.decode(data);

        let Some(current) = active.as_mut() else {
            let settings = decoded?;
            let instance = T::activate(&settings, self.interceptors.clone(), self.registry.clone())
                .map_err(|err| ConfigError::Fatal {
                    path: self.path.clone(),
                    source: Box::new(err),
                })?;
            *active = Some(Active {
                instance: Arc::new(instance),
                settings: Arc::new(settings),
            });
            tracing::info!(path = %self.path, "rpc instance activated");
            return Ok(Outcome::Activated);
        };

        let applied = decoded.and_then(|settings| {
            current.instance.reload(&settings)?;
            Ok(settings)
        });
        match applied {
            Ok(settings) => {
                current.settings = Arc::new(settings);
                tracing::info!(path = %self.path, "rpc config updated");
                Ok(Outcome::Updated)
            }
            Err(err) => {
                tracing::warn!(path = %self.path, error = %err, "rpc config update rejected");
                Ok(Outcome::Rejected(err))
            }
        }
    }
}

impl<T: Reloadable> ConfigListener for ConfigWatcher<T> {
    fn changed(&self, data: &HashMap<String, String>) {
        if let Err(err) = self.apply(data) {
            tracing::error!(path = %self.path, error = %err, "rpc config activation failed");
            *self.startup_error.lock() = Some(err);
        }
    }
}
