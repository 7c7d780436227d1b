//! End-to-end tests through the public client, server and client joined by
//! an in-memory pipe.

use std::sync::Arc;

use bytes::Bytes;
use ccrpc::{Client, Message, RpcError, RpcStream, Server};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .try_init();
}

async fn echo(msg: Message) -> Result<Bytes, RpcError> {
    Ok(msg.data)
}

async fn boom(_msg: Message) -> Result<Bytes, RpcError> {
    panic!("boom");
}

async fn kaput(_msg: Message) -> Result<Bytes, RpcError> {
    Err(RpcError::handler("kaput"))
}

async fn count(_msg: Message, stream: Arc<RpcStream>) -> Result<(), RpcError> {
    for value in [&b"1"[..], b"2", b"3"] {
        stream.send(Bytes::copy_from_slice(value)).await?;
    }
    Ok(())
}

async fn relay(_msg: Message, stream: Arc<RpcStream>) -> Result<(), RpcError> {
    while let Some(frame) = stream.recv().await {
        stream.send(frame.data).await?;
    }
    Ok(())
}

async fn fail_midway(_msg: Message, stream: Arc<RpcStream>) -> Result<(), RpcError> {
    stream.send(Bytes::from_static(b"x")).await?;
    Err(RpcError::handler("kaput"))
}

fn test_server() -> Arc<Server> {
    let mut server = Server::new();
    server.handle("echo", echo);
    server.handle("boom", boom);
    server.handle("kaput", kaput);
    server.handle_stream("count", count);
    server.handle_stream("relay", relay);
    server.handle_stream("fail", fail_midway);
    Arc::new(server)
}

async fn connected_client() -> Client {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    tokio::spawn(test_server().serve_connection(server_io));
    Client::handshake(client_io).await.unwrap()
}

#[tokio::test]
async fn echo_round_trips() {
    init_tracing();
    let client = connected_client().await;
    let reply = client.call("echo", &b"hello"[..]).await.unwrap();
    assert_eq!(&reply[..], b"hello");
}

#[tokio::test]
async fn ping_answers() {
    init_tracing();
    let client = connected_client().await;
    client.ping().await.unwrap();
}

#[tokio::test]
async fn unknown_command_surfaces_the_sentinel() {
    init_tracing();
    let client = connected_client().await;
    match client.call("nope", Bytes::new()).await {
        Err(RpcError::Remote(text)) => assert_eq!(text, "command not found"),
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn handler_error_text_travels_back() {
    init_tracing();
    let client = connected_client().await;
    match client.call("kaput", Bytes::new()).await {
        Err(RpcError::Remote(text)) => assert_eq!(text, "kaput"),
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn handler_panic_becomes_an_error_reply() {
    init_tracing();
    let client = connected_client().await;
    match client.call("boom", Bytes::new()).await {
        Err(RpcError::Remote(text)) => assert_eq!(text, "handler panic"),
        other => panic!("expected remote error, got {other:?}"),
    }
    // The session survives a panicking handler.
    let reply = client.call("echo", &b"still here"[..]).await.unwrap();
    assert_eq!(&reply[..], b"still here");
}

#[tokio::test]
async fn concurrent_calls_multiplex_one_connection() {
    init_tracing();
    let client = Arc::new(connected_client().await);

    let mut tasks = Vec::new();
    for i in 0..10u32 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let payload = format!("payload-{i}");
            let reply = client.call("echo", payload.clone().into_bytes()).await?;
            assert_eq!(&reply[..], payload.as_bytes());
            Ok::<_, RpcError>(())
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn server_streaming_in_order() {
    init_tracing();
    let client = connected_client().await;
    let mut stream = client.call_stream("count", Bytes::new()).await.unwrap();

    for expected in [&b"1"[..], b"2", b"3"] {
        let item = stream.next().await.unwrap().unwrap();
        assert_eq!(&item[..], expected);
    }
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn stream_error_is_terminal() {
    init_tracing();
    let client = connected_client().await;
    let mut stream = client.call_stream("fail", Bytes::new()).await.unwrap();

    let item = stream.next().await.unwrap().unwrap();
    assert_eq!(&item[..], b"x");
    match stream.next().await {
        Some(Err(RpcError::Remote(text))) => assert_eq!(text, "kaput"),
        other => panic!("expected terminal error, got {other:?}"),
    }
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn client_frames_feed_the_handler_input() {
    init_tracing();
    let client = connected_client().await;
    let stream = client.call_stream("relay", Bytes::new()).await.unwrap();

    stream.send(&b"a"[..]).await.unwrap();
    stream.send(&b"b"[..]).await.unwrap();
    stream.close(None).await.unwrap();

    let mut stream = stream;
    for expected in [&b"a"[..], b"b"] {
        let item = stream.next().await.unwrap().unwrap();
        assert_eq!(&item[..], expected);
    }
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn serves_real_tcp_connections() {
    init_tracing();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(test_server().serve(listener));

    let client = Client::connect(addr).await.unwrap();
    let reply = client.call("echo", &b"over tcp"[..]).await.unwrap();
    assert_eq!(&reply[..], b"over tcp");
    client.ping().await.unwrap();
}

#[tokio::test]
async fn closed_client_fails_fast() {
    init_tracing();
    let client = connected_client().await;
    client.close();
    assert!(client.call("echo", Bytes::new()).await.is_err());
}
