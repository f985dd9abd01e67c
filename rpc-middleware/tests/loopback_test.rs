//! Client and server chains joined in-process over the wire encoding.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    ECHO_METHOD, EchoReply, EchoRequest, Loopback, call_config, conn, registry, server_settings,
};
use rpc_middleware::grpc::{BusinessCode, CallOptions, Client, Payload, Server, Status};

async fn setup(client_timeout: Duration, server_timeout: Duration) -> (rpc_middleware::Conn, Loopback) {
    let registry = registry();
    let server = Server::builder(server_settings(server_timeout))
        .registry(registry.clone())
        .build()
        .unwrap();
    let client = Client::builder(call_config(client_timeout))
        .registry(registry)
        .build()
        .unwrap();
    (
        conn(client, "billing").await,
        Loopback {
            server: Arc::new(server),
        },
    )
}

async fn say(
    conn: &rpc_middleware::Conn,
    loopback: &Loopback,
    message: &str,
) -> Result<EchoReply, Status> {
    conn.call(
        ECHO_METHOD,
        Payload::loggable(EchoRequest {
            message: message.to_string(),
        }),
        CallOptions::default(),
        loopback,
    )
    .await
    .map(|reply| reply.downcast::<EchoReply>().unwrap())
}

#[tokio::test(start_paused = true)]
async fn test_server_sees_caller_and_client_deadline() {
    let (conn, loopback) = setup(Duration::from_secs(2), Duration::from_secs(10)).await;

    let reply = say(&conn, &loopback, "hello").await.unwrap();
    assert_eq!(reply.message, "hello");
    assert_eq!(reply.caller, "billing");
    assert!(reply.remaining_ms <= 2000);
}

#[tokio::test(start_paused = true)]
async fn test_server_timeout_tighter_than_client() {
    let (conn, loopback) = setup(Duration::from_secs(10), Duration::from_millis(500)).await;

    let reply = say(&conn, &loopback, "hello").await.unwrap();
    assert!(reply.remaining_ms <= 500);
}

#[tokio::test]
async fn test_business_status_survives_the_hop() {
    let (conn, loopback) = setup(Duration::from_secs(2), Duration::from_secs(2)).await;

    let status = say(&conn, &loopback, "missing").await.unwrap_err();
    assert_eq!(status.code(), BusinessCode::NothingFound);
    assert_eq!(status.message(), "no such user");
}

#[tokio::test(start_paused = true)]
async fn test_slow_handler_hits_deadline() {
    let (conn, loopback) = setup(Duration::from_secs(10), Duration::from_secs(1)).await;

    let status = say(&conn, &loopback, "slow").await.unwrap_err();
    assert_eq!(status.code(), BusinessCode::Deadline);
}

#[tokio::test]
async fn test_inherited_options_keep_deadline_and_callers() {
    let ctx = {
        let mut ctx = rpc_middleware::CallContext::new(
            ECHO_METHOD,
            Arc::new(call_config(Duration::from_secs(1))),
        );
        ctx.callers = vec!["gateway".to_string()];
        ctx.deadline = Some(tokio::time::Instant::now() + Duration::from_millis(300));
        ctx
    };

    let options = CallOptions::inherit(&ctx);
    assert_eq!(options.callers, vec!["gateway".to_string()]);
    assert_eq!(options.deadline, ctx.deadline);

    ctx.cancel.cancel();
    assert!(options.cancel.unwrap().is_cancelled());
}
