//! End-to-end tests of the accept/decode/dispatch loop.
//!
//! Every test runs the real main loop on a background thread and talks to
//! it over the private socket. The loop mutates process-global signal
//! dispositions on entry, so all tests here are serialized.

mod common;

use std::path::Path;
use std::time::Duration;

use passenger_handler::{HandlerOptions, SocketKind, connect};
use serial_test::serial;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const DEADLINE: Duration = Duration::from_secs(5);

#[tokio::test]
#[serial]
async fn serves_one_request_and_counts_it() {
    let (handler, _owner_write) = common::start_handler(HandlerOptions::new(), Duration::ZERO);

    let response = common::send_request(
        &handler,
        &[("REQUEST_METHOD", b"GET"), ("PATH_INFO", b"/")],
        b"",
    )
    .await;
    assert_eq!(response, common::OK_RESPONSE);
    assert!(response.ends_with(b"ok"));

    assert!(common::wait_until(DEADLINE, || handler.processed_requests() == 1));
    assert!(handler.iterations() >= 1);

    handler.cleanup();
    if handler.socket_kind() == SocketKind::Filesystem {
        assert!(!Path::new(handler.socket_name()).exists());
    }
}

#[tokio::test]
#[serial]
async fn request_body_reaches_the_application() {
    let (handler, _owner_write) = common::start_handler(HandlerOptions::new(), Duration::ZERO);

    let response = common::send_request(
        &handler,
        &[
            ("REQUEST_METHOD", b"POST"),
            ("PATH_INFO", b"/submit"),
            ("HTTP_CONTENT_LENGTH", b"11"),
        ],
        b"hello=world",
    )
    .await;
    assert_eq!(response, common::OK_RESPONSE);

    handler.cleanup();
}

#[tokio::test]
#[serial]
async fn oversized_header_aborts_the_connection_but_not_the_loop() {
    let (handler, _owner_write) = common::start_handler(HandlerOptions::new(), Duration::ZERO);

    // 0x00020001 == 131073, one byte past the metadata limit.
    let mut stream = connect(handler.socket_name(), handler.socket_kind())
        .await
        .unwrap();
    stream.write_all(&[0x00, 0x02, 0x00, 0x01]).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    assert!(response.is_empty(), "no response bytes on a malformed request");

    // The aborted request still crosses the iteration boundary.
    assert!(common::wait_until(DEADLINE, || handler.processed_requests() == 1));

    // The loop keeps serving.
    let response = common::send_request(
        &handler,
        &[("REQUEST_METHOD", b"GET"), ("PATH_INFO", b"/")],
        b"",
    )
    .await;
    assert_eq!(response, common::OK_RESPONSE);
    assert!(common::wait_until(DEADLINE, || handler.processed_requests() == 2));

    handler.cleanup();
}

#[tokio::test]
#[serial]
async fn memory_ceiling_drains_the_loop() {
    // Any real process exceeds a one-byte ceiling after the first request.
    let options = HandlerOptions::new().with_memory_limit(1);
    let (handler, _owner_write) = common::start_handler(options, Duration::ZERO);

    let response = common::send_request(
        &handler,
        &[("REQUEST_METHOD", b"GET"), ("PATH_INFO", b"/")],
        b"",
    )
    .await;
    assert_eq!(response, common::OK_RESPONSE);

    assert!(common::wait_until(DEADLINE, || !handler.is_running()));
    assert_eq!(handler.processed_requests(), 1);

    handler.cleanup();
}

#[tokio::test]
#[serial]
async fn cleanup_is_idempotent() {
    let (handler, _owner_write) = common::start_handler(HandlerOptions::new(), Duration::ZERO);
    let socket_name = handler.socket_name().to_owned();

    handler.cleanup();
    handler.cleanup();

    assert!(!handler.is_running());
    assert_eq!(handler.socket_name(), socket_name);
    if handler.socket_kind() == SocketKind::Filesystem {
        assert!(!Path::new(&socket_name).exists());
    }
}
