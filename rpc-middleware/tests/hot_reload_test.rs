//! Config-driven instances picking up published changes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ECHO_METHOD, EchoReply, EchoRequest, Journal, Reply, client_payload, registry};
use parking_lot::Mutex;
use rpc_middleware::async_trait::async_trait;
use rpc_middleware::config::{ConfigSource, ConfigWatcher, MemorySource, Outcome};
use rpc_middleware::grpc::{CallOptions, CallResult, Client, Conn, Invoker, Payload, UnaryRequest};
use rpc_middleware::{ConfigError, Engine, RpcError};
use tokio::sync::oneshot;

/// Parks the call in the invoker until released, then reports the config
/// snapshot the call carries.
struct Parked {
    entered: Mutex<Option<oneshot::Sender<()>>>,
    release: Mutex<Option<oneshot::Receiver<()>>>,
}

#[async_trait]
impl Invoker for Parked {
    async fn invoke(&self, request: UnaryRequest) -> CallResult {
        if let Some(entered) = self.entered.lock().take() {
            let _ = entered.send(());
        }
        let release = self.release.lock().take();
        if let Some(release) = release {
            let _ = release.await;
        }
        Ok(Payload::loggable(EchoReply {
            message: format!("{}ms", request.ctx.config.timeout.as_millis()),
            caller: String::new(),
            remaining_ms: request
                .ctx
                .remaining()
                .map(|remaining| remaining.as_millis() as u64)
                .unwrap_or_default(),
        }))
    }
}

async fn remaining_ms(conn: &Conn) -> u64 {
    conn.call(
        ECHO_METHOD,
        Payload::loggable(EchoRequest::default()),
        CallOptions::default(),
        &Reply {
            journal: Journal::default(),
        },
    )
    .await
    .unwrap()
    .downcast::<EchoReply>()
    .unwrap()
    .remaining_ms
}

#[tokio::test(start_paused = true)]
async fn test_calls_after_swap_use_new_timeout() {
    let source = Arc::new(MemorySource::new());
    let path = Engine::client_path("ledger");
    source.set(path.clone(), client_payload("1s"));

    let engine = Engine::new("billing", source.clone(), registry());
    let conn = engine.client_conn("ledger", Vec::new()).await.unwrap();
    assert_eq!(remaining_ms(&conn).await, 1000);

    // malformed update keeps the previous config
    source.set(path.clone(), "{\"timeout\": ");
    assert_eq!(remaining_ms(&conn).await, 1000);

    // non-positive timeout is rejected the same way
    source.set(path.clone(), client_payload("0s"));
    assert_eq!(remaining_ms(&conn).await, 1000);

    source.set(path, client_payload("3s"));
    assert_eq!(remaining_ms(&conn).await, 3000);
}

#[tokio::test]
async fn test_oversized_config_timeout_still_serves_calls() {
    let source = Arc::new(MemorySource::new());
    let path = Engine::client_path("ledger");
    source.set(path.clone(), client_payload("1s"));

    let engine = Engine::new("billing", source.clone(), registry());
    let conn = engine.client_conn("ledger", Vec::new()).await.unwrap();

    source.set(path, client_payload("500000000000years"));
    assert!(conn.client().config().timeout > Duration::from_secs(1));
    // the timeout is out of the clock's range, so the call runs unbounded
    assert_eq!(remaining_ms(&conn).await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_call_in_flight_keeps_config_it_started_with() {
    let source = Arc::new(MemorySource::new());
    let path = Engine::client_path("ledger");
    source.set(path.clone(), client_payload("1s"));

    let engine = Engine::new("billing", source.clone(), registry());
    let conn = engine.client_conn("ledger", Vec::new()).await.unwrap();

    let (entered_tx, entered_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel();
    let parked = Parked {
        entered: Mutex::new(Some(entered_tx)),
        release: Mutex::new(Some(release_rx)),
    };

    let call = conn.call(
        ECHO_METHOD,
        Payload::loggable(EchoRequest::default()),
        CallOptions::default(),
        &parked,
    );
    let swap = async {
        entered_rx.await.unwrap();
        source.set(path.clone(), client_payload("3s"));
        assert_eq!(conn.client().config().timeout, Duration::from_secs(3));
        release_tx.send(()).unwrap();
    };
    let (reply, ()) = tokio::join!(call, swap);

    let reply = reply.unwrap().downcast::<EchoReply>().unwrap();
    assert_eq!(reply.message, "1000ms");
    assert_eq!(reply.remaining_ms, 1000);

    // the next call starts after the swap
    assert_eq!(remaining_ms(&conn).await, 3000);
}

#[tokio::test]
async fn test_watcher_outcomes() {
    let source = MemorySource::new();
    let path = Engine::client_path("ledger");
    let watcher: Arc<ConfigWatcher<Client>> =
        Arc::new(ConfigWatcher::new(path.clone(), Vec::new(), registry()));

    source.set(path.clone(), client_payload("1s"));
    source.subscribe(&[path.clone()], watcher.clone()).unwrap();
    let client = watcher.instance().unwrap();

    let mut data = std::collections::HashMap::new();
    data.insert(path.clone(), "[]".to_string());
    assert!(matches!(
        watcher.apply(&data),
        Ok(Outcome::Rejected(ConfigError::Decode { .. }))
    ));

    data.insert(path.clone(), client_payload("2s"));
    assert!(matches!(watcher.apply(&data), Ok(Outcome::Updated)));
    assert_eq!(client.config().timeout, Duration::from_secs(2));

    data.clear();
    assert!(matches!(
        watcher.apply(&data),
        Ok(Outcome::Rejected(ConfigError::MissingPath(_)))
    ));
    assert_eq!(client.config().timeout, Duration::from_secs(2));
}

#[tokio::test]
async fn test_engine_start_is_fatal_on_bad_first_payload() {
    let source = Arc::new(MemorySource::new());
    source.set(Engine::client_path("ledger"), "not json");

    let err = Engine::new("billing", source, registry())
        .client_conn("ledger", Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Config(ConfigError::Decode { .. })));
}
