//! Application callback contract.
//!
//! The main loop treats the web application as an opaque callable: one
//! decoded request in, one response streamed out. Framework adapters (a
//! full-stack framework, a minimal web-app protocol, a Python-style
//! protocol) implement [`Application`] and nothing else of this crate.

use std::io;
use std::path::Path;

use async_trait::async_trait;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

use crate::frame::{RequestBody, RequestHeaders};

/// The connection half the application streams its response into.
pub type ClientStream = OwnedWriteHalf;

/// The forward-only request body stream handed to the application.
pub type BodyStream = RequestBody<OwnedReadHalf>;

/// One web application embedded in a worker.
///
/// # Contract
///
/// - `handle` must write a complete response to `client` and return; the
///   loop owns closing the connection, the application must not.
/// - The request body may be read from `body`; it is forward-only and
///   capped at the declared `CONTENT_LENGTH`.
/// - `headers` already satisfies the `CONTENT_LENGTH` mirror rule.
/// - An error return abandons the request; the loop logs it and keeps
///   serving.
#[async_trait]
pub trait Application: Send + Sync + 'static {
    /// Serves one request.
    async fn handle(
        &self,
        headers: &RequestHeaders,
        body: &mut BodyStream,
        client: &mut ClientStream,
    ) -> io::Result<()>;
}

/// Marker file that switches the identification string to the Enterprise
/// flavor, looked up beside the running executable.
const ENTERPRISE_MARKER: &str = "enterprisey.txt";

/// The identification string applications emit in `X-Powered-By`.
#[must_use]
pub fn passenger_header() -> String {
    let base = format!(
        "Phusion Passenger (mod_rails/mod_rack) {}",
        env!("CARGO_PKG_VERSION")
    );
    if enterprise_marker_present() {
        format!("{base}, Enterprise Edition")
    } else {
        base
    }
}

fn enterprise_marker_present() -> bool {
    std::env::current_exe()
        .ok()
        .as_deref()
        .and_then(Path::parent)
        .map_or(false, |dir| dir.join(ENTERPRISE_MARKER).exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_names_the_product_and_version() {
        let header = passenger_header();
        assert!(header.starts_with("Phusion Passenger (mod_rails/mod_rack) "));
        assert!(header.contains(env!("CARGO_PKG_VERSION")));
    }
}
