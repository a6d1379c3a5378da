//! Framed request codec.
//!
//! One request per connection, CGI-style:
//!
//! ```text
//! +---------------------------+---------------------------+----------+
//! | Length (4 bytes, BE)      | Metadata                  | Body     |
//! +---------------------------+---------------------------+----------+
//!
//! metadata := (name NUL value NUL)*      no embedded NULs
//! ```
//!
//! The metadata block is a flat sequence of NUL-separated strings paired
//! into names and values; an odd trailing element is discarded. The body is
//! not framed: it is streamed from the same connection, its length fixed by
//! the `CONTENT_LENGTH` header.
//!
//! # Security Considerations
//!
//! - The length prefix is validated against [`MAX_HEADER_SIZE`] before any
//!   allocation happens.
//! - The decoder never trusts the client to terminate the metadata block;
//!   a short read is an I/O error for that one request.

use std::borrow::Cow;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, Take};

use crate::error::{HandlerError, Result};

/// Hard upper bound on the metadata block, in bytes.
pub const MAX_HEADER_SIZE: usize = 131_072;

/// Header name the handler synthesizes before dispatch.
pub const CONTENT_LENGTH: &str = "CONTENT_LENGTH";

/// Header name the web server forwards from the HTTP request.
pub const HTTP_CONTENT_LENGTH: &str = "HTTP_CONTENT_LENGTH";

/// Decoded request metadata: header name (ASCII) to header value (bytes).
///
/// The map always reflects the `CONTENT_LENGTH` mirror rule: after
/// decoding, `CONTENT_LENGTH` equals `HTTP_CONTENT_LENGTH` whenever the
/// latter is present, and is absent otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHeaders {
    map: HashMap<String, Bytes>,
}

impl RequestHeaders {
    /// Looks up a header value by exact name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.map.get(name).map(|value| value.as_ref())
    }

    /// Looks up a header value and renders it as text, lossily.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<Cow<'_, str>> {
        self.map.get(name).map(|value| String::from_utf8_lossy(value))
    }

    /// The declared body length, if `CONTENT_LENGTH` is present and parses
    /// as a decimal integer.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.get_str(CONTENT_LENGTH)?.trim().parse().ok()
    }

    /// Inserts a header, replacing any previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Bytes>) {
        self.map.insert(name.into(), value.into());
    }

    /// Removes a header, returning its previous value.
    pub fn remove(&mut self, name: &str) -> Option<Bytes> {
        self.map.remove(name)
    }

    /// Number of headers in the map.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterates over all name/value pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.map.iter().map(|(name, value)| (name.as_str(), value.as_ref()))
    }

    /// Applies the mirror rule: `CONTENT_LENGTH` is overwritten with
    /// `HTTP_CONTENT_LENGTH`, or removed when the latter is absent.
    fn mirror_content_length(&mut self) {
        match self.map.get(HTTP_CONTENT_LENGTH).cloned() {
            Some(value) => {
                self.map.insert(CONTENT_LENGTH.to_owned(), value);
            }
            None => {
                self.map.remove(CONTENT_LENGTH);
            }
        }
    }
}

/// Reads one framed request's metadata from `reader`.
///
/// Returns `Ok(None)` on immediate end-of-stream (the graceful end of the
/// connection, no request pending). After a successful decode the reader is
/// positioned at the first body byte.
///
/// # Errors
///
/// - [`HandlerError::MetadataTooLarge`] when the length prefix exceeds
///   [`MAX_HEADER_SIZE`]; the caller aborts the connection.
/// - [`HandlerError::Io`] on a short read inside the frame.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<RequestHeaders>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let length = u32::from_be_bytes(prefix);
    if length as usize > MAX_HEADER_SIZE {
        return Err(HandlerError::MetadataTooLarge(length));
    }

    let mut block = vec![0u8; length as usize];
    reader.read_exact(&mut block).await?;
    Ok(Some(parse_metadata(Bytes::from(block))))
}

/// Splits the metadata block on NULs and pairs consecutive elements.
fn parse_metadata(block: Bytes) -> RequestHeaders {
    let mut elements = Vec::new();
    let mut start = 0;
    for (index, byte) in block.iter().enumerate() {
        if *byte == 0 {
            elements.push(block.slice(start..index));
            start = index + 1;
        }
    }
    if start < block.len() {
        // Unterminated trailing element; kept so the odd-element rule below
        // can discard it.
        elements.push(block.slice(start..));
    }

    let mut headers = RequestHeaders::default();
    for pair in elements.chunks_exact(2) {
        let name = String::from_utf8_lossy(&pair[0]).into_owned();
        headers.map.insert(name, pair[1].clone());
    }
    headers.mirror_content_length();
    headers
}

/// Encodes one request frame: the web-server half of the wire protocol.
///
/// Writes the length prefix, the NUL-separated metadata block and the raw
/// body to `writer`.
///
/// # Errors
///
/// - [`HandlerError::InvalidMetadata`] when a name or value contains a NUL.
/// - [`HandlerError::MetadataTooLarge`] when the encoded block would exceed
///   [`MAX_HEADER_SIZE`].
/// - [`HandlerError::Io`] on write failures.
pub async fn write_request<W>(
    writer: &mut W,
    headers: &[(&str, &[u8])],
    body: &[u8],
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut block = BytesMut::new();
    for (name, value) in headers {
        if name.as_bytes().contains(&0) || value.contains(&0) {
            return Err(HandlerError::InvalidMetadata((*name).to_owned()));
        }
        block.put_slice(name.as_bytes());
        block.put_u8(0);
        block.put_slice(value);
        block.put_u8(0);
    }
    if block.len() > MAX_HEADER_SIZE {
        return Err(HandlerError::MetadataTooLarge(block.len() as u32));
    }

    writer.write_all(&(block.len() as u32).to_be_bytes()).await?;
    writer.write_all(&block).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Forward-only request body stream.
///
/// Wraps the connection's read half, capped at the declared
/// `CONTENT_LENGTH` (absent or unparseable means an empty body). There is
/// deliberately no seek surface: frameworks that probe for rewind support
/// must degrade to streaming reads.
#[derive(Debug)]
pub struct RequestBody<R> {
    inner: Take<R>,
}

impl<R: AsyncRead + Unpin> RequestBody<R> {
    /// Caps `reader` at the body length declared by `headers`.
    #[must_use]
    pub fn new(reader: R, headers: &RequestHeaders) -> Self {
        Self {
            inner: reader.take(headers.content_length().unwrap_or(0)),
        }
    }

    /// Bytes of declared body remaining.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.inner.limit()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for RequestBody<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}
