//! passenger-worker - single-tenant application worker.
//!
//! Embeds one [`RequestHandler`] around a trivial application. The parent
//! process hands over the read end of the owner pipe as an inherited file
//! descriptor and reads the private socket name back from this process's
//! standard output; everything else is plain environment configuration.

use std::env;
use std::io::Write;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use passenger_handler::{
    Application, BodyStream, ClientStream, HandlerOptions, RequestHandler, RequestHeaders,
    passenger_header,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();

    let config = WorkerConfig::from_env()?;
    info!(
        owner_pipe_fd = config.owner_pipe_fd,
        memory_limit = config.memory_limit,
        "starting passenger-worker"
    );

    // The parent keeps the write end; this process owns the read end from
    // here on.
    let owner_pipe = unsafe { OwnedFd::from_raw_fd(config.owner_pipe_fd) };
    let options = HandlerOptions::new().with_memory_limit(config.memory_limit);
    let handler = Arc::new(
        RequestHandler::new(owner_pipe, PingApplication, options)
            .context("failed to create request handler")?,
    );

    // Out-of-band socket-name disclosure: the spawning process reads these
    // two lines from stdout before routing any requests.
    println!("socket_name = {}", handler.socket_name());
    println!("socket_kind = {}", handler.socket_kind());
    std::io::stdout().flush().context("failed to flush stdout")?;

    handler.main_loop().await.context("main loop failed")?;
    info!(
        processed_requests = handler.processed_requests(),
        "worker finished"
    );
    handler.cleanup();
    Ok(())
}

struct WorkerConfig {
    owner_pipe_fd: RawFd,
    memory_limit: u64,
}

impl WorkerConfig {
    fn from_env() -> Result<Self> {
        let owner_pipe_fd = match env::var("PASSENGER_OWNER_PIPE_FD") {
            Ok(value) if !value.trim().is_empty() => value
                .trim()
                .parse()
                .context("failed to parse PASSENGER_OWNER_PIPE_FD")?,
            _ => 0,
        };
        if owner_pipe_fd < 0 {
            bail!("PASSENGER_OWNER_PIPE_FD must be a valid file descriptor");
        }

        let memory_limit = match env::var("PASSENGER_MEMORY_LIMIT") {
            Ok(value) if !value.trim().is_empty() => value
                .trim()
                .parse()
                .context("failed to parse PASSENGER_MEMORY_LIMIT")?,
            _ => 0,
        };

        Ok(Self {
            owner_pipe_fd,
            memory_limit,
        })
    }
}

/// Minimal application demonstrating the callback contract: reads the
/// declared body, answers 200 with the handler identification header.
struct PingApplication;

#[async_trait]
impl Application for PingApplication {
    async fn handle(
        &self,
        headers: &RequestHeaders,
        body: &mut BodyStream,
        client: &mut ClientStream,
    ) -> std::io::Result<()> {
        let mut request_body = Vec::new();
        body.read_to_end(&mut request_body).await?;

        let text = format!(
            "pong: {} {} ({} body bytes)\n",
            headers.get_str("REQUEST_METHOD").unwrap_or_default(),
            headers.get_str("PATH_INFO").unwrap_or_default(),
            request_body.len()
        );
        let response = format!(
            "HTTP/1.1 200 OK\r\n\
             Status: 200 OK\r\n\
             Content-Type: text/plain\r\n\
             Content-Length: {}\r\n\
             X-Powered-By: {}\r\n\
             \r\n\
             {}",
            text.len(),
            passenger_header(),
            text
        );
        client.write_all(response.as_bytes()).await
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
