// tests/protocol.rs

//! Protocol and connection behavior over real loopback sockets.

mod common;

use common::NullClient;
use dispatchd::net::server::accept_loop;
use dispatchd::{AuthPolicy, Connection, Error, Router};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

struct EchoState;

async fn handle_echo(
    _state: Arc<EchoState>,
    data: Option<Value>,
    _conn: Arc<Connection>,
) -> dispatchd::Result<Value> {
    Ok(data.unwrap_or(Value::Null))
}

async fn handle_boom(
    _state: Arc<EchoState>,
    _data: Option<Value>,
    _conn: Arc<Connection>,
) -> dispatchd::Result<Value> {
    Err(Error::Validation("boom".to_string()))
}

async fn handle_hangup(
    _state: Arc<EchoState>,
    _data: Option<Value>,
    conn: Arc<Connection>,
) -> dispatchd::Result<Value> {
    conn.close();
    Ok(json!("never delivered"))
}

async fn start_server(auth: AuthPolicy) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router: Arc<Router<EchoState>> = Arc::new(
        Router::new(Arc::new(EchoState))
            .route("echo", handle_echo)
            .route("boom", handle_boom)
            .route("hangup", handle_hangup),
    );
    tokio::spawn(accept_loop(listener, auth, router));
    addr
}

async fn client(addr: SocketAddr) -> Arc<Connection> {
    Connection::connect(&addr.to_string(), Arc::new(NullClient), None).await.unwrap()
}

/// Write one raw frame and return nothing; frames are JSON + EOT.
async fn write_raw(stream: &mut TcpStream, frame: &[u8]) {
    stream.write_all(frame).await.unwrap();
    stream.write_u8(0x04).await.unwrap();
}

/// Read bytes up to the next EOT separator.
async fn read_raw(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut frame = Vec::new();
    loop {
        let fut = stream.read_u8();
        match tokio::time::timeout(Duration::from_secs(2), fut).await {
            Ok(Ok(0x04)) => return Some(frame),
            Ok(Ok(byte)) => frame.push(byte),
            _ => return None,
        }
    }
}

#[tokio::test]
async fn test_concurrent_requests_correlate_by_payload() {
    let addr = start_server(AuthPolicy::default()).await;
    let conn = client(addr).await;

    let (a, b, c) = tokio::join!(
        conn.send_request("echo", Some(json!({ "k": 1 }))),
        conn.send_request("echo", Some(json!({ "k": 2 }))),
        conn.send_request("echo", Some(json!({ "k": 3 }))),
    );
    assert_eq!(a.unwrap().data.unwrap(), json!({ "k": 1 }));
    assert_eq!(b.unwrap().data.unwrap(), json!({ "k": 2 }));
    assert_eq!(c.unwrap().data.unwrap(), json!({ "k": 3 }));
}

#[tokio::test]
async fn test_response_carries_request_no() {
    let addr = start_server(AuthPolicy::default()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    write_raw(&mut stream, br#"[0,{"no":123456,"type":"echo","data":"hi"}]"#).await;
    let frame = read_raw(&mut stream).await.expect("a response should arrive");
    let value: Value = serde_json::from_slice(&frame).unwrap();
    assert_eq!(value[0], json!(1), "reply must be a response frame");
    assert_eq!(value[1]["no"], json!(123456));
    assert_eq!(value[1]["data"], json!("hi"));
}

#[tokio::test]
async fn test_unknown_request_type() {
    let addr = start_server(AuthPolicy::default()).await;
    let conn = client(addr).await;

    let response = conn.send_request("frobnicate", None).await.unwrap();
    assert_eq!(response.error.unwrap(), "unknown request type: 'frobnicate'");
}

#[tokio::test]
async fn test_handler_errors_become_error_responses() {
    let addr = start_server(AuthPolicy::default()).await;
    let conn = client(addr).await;

    let response = conn.send_request("boom", None).await.unwrap();
    assert_eq!(response.error.unwrap(), "boom");
    assert!(response.data.is_none());

    // The connection survives a failed request.
    let response = conn.send_request("echo", Some(json!(7))).await.unwrap();
    assert_eq!(response.data.unwrap(), json!(7));
}

#[tokio::test]
async fn test_ping_pong() {
    let addr = start_server(AuthPolicy::default()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    write_raw(&mut stream, b"[2]").await;
    let frame = read_raw(&mut stream).await.expect("a pong should arrive");
    assert_eq!(frame, b"[3]");
}

#[tokio::test]
async fn test_malformed_frame_gets_no_zero_error_and_connection_survives() {
    let addr = start_server(AuthPolicy::default()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    write_raw(&mut stream, b"{not json").await;
    let frame = read_raw(&mut stream).await.expect("an error response should arrive");
    let value: Value = serde_json::from_slice(&frame).unwrap();
    assert_eq!(value[0], json!(1));
    assert_eq!(value[1]["no"], json!(0), "the sender's no is unrecoverable");
    assert!(value[1]["error"].as_str().unwrap().contains("malformed JSON frame"));

    // Later well-formed frames still work.
    write_raw(&mut stream, b"[2]").await;
    assert_eq!(read_raw(&mut stream).await.unwrap(), b"[3]");
}

#[tokio::test]
async fn test_password_required_without_localhost_bypass() {
    let auth = AuthPolicy { password: Some("p".to_string()), allow_localhost: false };
    let addr = start_server(auth).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    write_raw(&mut stream, br#"[0,{"no":5,"type":"echo","data":1}]"#).await;
    let frame = read_raw(&mut stream).await.expect("an error response should arrive");
    let value: Value = serde_json::from_slice(&frame).unwrap();
    assert_eq!(value[1]["no"], json!(5));
    assert_eq!(value[1]["error"], json!("invalid password"));

    // The server closes the connection after rejecting.
    let mut rest = Vec::new();
    let read = tokio::time::timeout(
        Duration::from_secs(2),
        stream.read_to_end(&mut rest),
    )
    .await;
    assert!(matches!(read, Ok(Ok(0))), "connection should be closed, got {read:?}");
}

#[tokio::test]
async fn test_password_match_authorizes_the_connection() {
    let auth = AuthPolicy { password: Some("p".to_string()), allow_localhost: false };
    let addr = start_server(auth).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    write_raw(&mut stream, br#"[0,{"no":6,"type":"echo","data":1,"password":"p"}]"#).await;
    let frame = read_raw(&mut stream).await.unwrap();
    let value: Value = serde_json::from_slice(&frame).unwrap();
    assert_eq!(value[1]["data"], json!(1), "the authorizing request itself is served");

    // Follow-up requests need no password.
    write_raw(&mut stream, br#"[0,{"no":7,"type":"echo","data":2}]"#).await;
    let frame = read_raw(&mut stream).await.unwrap();
    let value: Value = serde_json::from_slice(&frame).unwrap();
    assert_eq!(value[1]["data"], json!(2));
}

#[tokio::test]
async fn test_localhost_bypass_skips_the_password() {
    let auth = AuthPolicy { password: Some("p".to_string()), allow_localhost: true };
    let addr = start_server(auth).await;
    let conn = client(addr).await;

    let response = conn.send_request("echo", Some(json!("hello"))).await.unwrap();
    assert_eq!(response.data.unwrap(), json!("hello"));
}

#[tokio::test]
async fn test_close_fails_outstanding_requests_with_socket_closed() {
    let addr = start_server(AuthPolicy::default()).await;
    let conn = client(addr).await;

    let err = conn.send_request("hangup", None).await.unwrap_err();
    assert!(matches!(err, Error::SocketClosed), "got {err:?}");

    // And the connection reports closed for later callers too.
    conn.closed().await;
    let err = conn.send_request("echo", None).await.unwrap_err();
    assert!(matches!(err, Error::SocketClosed));
}
