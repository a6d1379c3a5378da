//! Shared harness for request-handler integration tests.
//!
//! Each test owns an isolated handler: a fresh owner pipe, a fresh private
//! socket, and the loop running on its own background thread. Tests that
//! raise real signals are serialized by the callers with `serial_test`.

#![allow(dead_code)]

use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use passenger_handler::{
    Application, BodyStream, ClientStream, HandlerOptions, RequestHandler, RequestHeaders,
    connect, write_request,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// The fixed response [`EchoApplication`] writes, scenario-style.
pub const OK_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";

/// Test application: drains the declared body, optionally lingers, then
/// writes [`OK_RESPONSE`].
pub struct EchoApplication {
    pub delay: Duration,
}

#[async_trait]
impl Application for EchoApplication {
    async fn handle(
        &self,
        _headers: &RequestHeaders,
        body: &mut BodyStream,
        client: &mut ClientStream,
    ) -> std::io::Result<()> {
        let mut sink = Vec::new();
        body.read_to_end(&mut sink).await?;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        client.write_all(OK_RESPONSE).await
    }
}

/// Creates an owner pipe and a handler around [`EchoApplication`], with
/// the main loop already running on a background thread.
///
/// Returns the handler and the owner pipe's write end; dropping the write
/// end simulates parent death.
pub fn start_handler(
    options: HandlerOptions,
    delay: Duration,
) -> (Arc<RequestHandler<EchoApplication>>, OwnedFd) {
    let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC).expect("failed to create owner pipe");
    let handler = Arc::new(
        RequestHandler::new(read_end, EchoApplication { delay }, options)
            .expect("failed to create request handler"),
    );
    handler
        .start_main_loop_thread()
        .expect("failed to start main loop thread");
    (handler, write_end)
}

/// Sends one framed request to a running handler and reads the complete
/// response.
pub async fn send_request<A: Application>(
    handler: &RequestHandler<A>,
    headers: &[(&str, &[u8])],
    body: &[u8],
) -> Vec<u8> {
    let mut stream = connect(handler.socket_name(), handler.socket_kind())
        .await
        .expect("failed to connect to handler socket");
    write_request(&mut stream, headers, body)
        .await
        .expect("failed to send request");
    let mut response = Vec::new();
    stream
        .read_to_end(&mut response)
        .await
        .expect("failed to read response");
    response
}

/// Polls `predicate` until it holds or `deadline` elapses.
pub fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    predicate()
}
