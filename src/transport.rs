//! Transport facade: owns the framer, the local/remote path,
//! and exposes blocking-style chunk read/write plus the path-binding
//! handshake.

use bytes::{Bytes, BytesMut};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::chunk::{Chunk, ContFlag};
use crate::codec::{Framer, FramerEvent};
use crate::error::{ChunkParseError, MsrpTransactionError};
use crate::logging::TrafficLogger;
use crate::uri::Uri;

/// A threshold above which `Byte-Range`'s `end` is emitted as `*` (unknown)
/// rather than a concrete number.
pub const LARGE_MESSAGE_THRESHOLD: u64 = 2048;

/// Default `max_size` for [`ChunkTransport::read_chunk`].
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Path-matching mode for [`check_incoming_send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathMatch {
    /// Full list equality of To-Path/From-Path.
    Strict,
    /// draft-ietf-simple-msrp-sessmatch: only the first hop's session id.
    Sessmatch,
}

/// Enough addressing information to build an outgoing request without
/// access to the live [`ChunkTransport`].
#[derive(Debug, Clone)]
pub struct Addressing {
    pub local_uri: Uri,
    pub local_path: Vec<Uri>,
    pub to_path: Vec<Uri>,
}

impl Addressing {
    /// This endpoint's own path, suitable for a REPORT's `From-Path`.
    pub fn full_local_path(&self) -> Vec<Uri> {
        let mut path = self.local_path.clone();
        path.push(self.local_uri.clone());
        path
    }
}

/// Builds a request chunk addressed per `addressing`.
pub fn build_request(addressing: &Addressing, method: &str) -> Chunk {
    let mut chunk = Chunk::request(random_hex_id(64), method);
    chunk.add_header(
        "To-Path",
        &crate::header::HeaderValue::UriList(addressing.to_path.clone()),
    );
    chunk.add_header(
        "From-Path",
        &crate::header::HeaderValue::UriList(vec![addressing.local_uri.clone()]),
    );
    chunk
}

/// Builds a SEND request addressed per `addressing`.
/// `contflag` is `$` when `data` fills the message completely, `+`
/// otherwise; `end` is emitted as unknown (`*`) once `length` exceeds
/// [`LARGE_MESSAGE_THRESHOLD`].
pub fn build_send_request(
    addressing: &Addressing,
    message_id: Option<String>,
    data: Bytes,
    start: u64,
    end: Option<u64>,
    length: Option<u64>,
) -> Chunk {
    let mut chunk = build_request(addressing, "SEND");
    let end = end.unwrap_or(start - 1 + data.len() as u64);
    let length = length.unwrap_or(start - 1 + data.len() as u64);
    let contflag = if end == length { ContFlag::Complete } else { ContFlag::Continued };

    let reported_end = if length <= LARGE_MESSAGE_THRESHOLD { Some(end) } else { None };
    chunk.add_header(
        "Byte-Range",
        &crate::header::HeaderValue::ByteRange(crate::header::ByteRange {
            start,
            end: reported_end,
            total: Some(length),
        }),
    );
    let message_id = message_id.unwrap_or_else(|| random_hex_id(64));
    chunk.add_header("Message-ID", &crate::header::HeaderValue::Opaque(message_id));
    chunk.data = data;
    chunk.contflag = contflag;
    chunk
}

fn random_hex_id(bits: usize) -> String {
    let bytes = bits / 8;
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Generic over any ordered byte-stream transport — a plain `TcpStream` or
/// a TLS-wrapped one both satisfy this bound (the TCP/TLS
/// transport itself is an external collaborator; only its byte-stream
/// contract is consumed here).
pub struct ChunkTransport<S> {
    stream: S,
    framer: Framer,
    read_buf: BytesMut,
    write_buf: BytesMut,
    pub local_uri: Uri,
    pub local_path: Vec<Uri>,
    pub remote_uri: Option<Uri>,
    pub remote_path: Vec<Uri>,
    pub use_sessmatch: bool,
    pub logger: std::sync::Arc<dyn TrafficLogger>,
}

impl<S> ChunkTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, local_uri: Uri, logger: std::sync::Arc<dyn TrafficLogger>) -> Self {
        Self {
            stream,
            framer: Framer::new(),
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            local_uri,
            local_path: Vec::new(),
            remote_uri: None,
            remote_path: Vec::new(),
            use_sessmatch: false,
            logger,
        }
    }

    pub fn set_local_path(&mut self, path: Vec<Uri>) {
        self.local_path = path;
    }

    /// Suitable to put into a SIP INVITE's `a=path` attribute.
    pub fn full_local_path(&self) -> Vec<Uri> {
        let mut path = self.local_path.clone();
        path.push(self.local_uri.clone());
        path
    }

    pub fn full_remote_path(&self) -> Vec<Uri> {
        let mut path = self.remote_path.clone();
        if let Some(uri) = &self.remote_uri {
            path.push(uri.clone());
        }
        path
    }

    fn set_full_remote_path(&mut self, mut full_remote_path: Vec<Uri>) {
        self.remote_uri = full_remote_path.pop();
        self.remote_path = full_remote_path;
    }

    /// A snapshot of this connection's addressing, cheap to clone and hand
    /// to a task that doesn't otherwise touch the live transport — the
    /// session engine builds outgoing chunks from this rather than
    /// reaching back into the I/O task.
    pub fn addressing(&self) -> Addressing {
        Addressing {
            local_uri: self.local_uri.clone(),
            local_path: self.local_path.clone(),
            to_path: {
                let mut path = self.local_path.clone();
                path.extend(self.remote_path.clone());
                if let Some(remote) = &self.remote_uri {
                    path.push(remote.clone());
                }
                path
            },
        }
    }

    /// Builds a request chunk with a fresh 64-bit hex transaction id and
    /// the standard `To-Path`/`From-Path` pair.
    pub fn make_request(&self, method: &str) -> Chunk {
        build_request(&self.addressing(), method)
    }

    /// Builds a SEND request. `contflag` is `$` when `data`
    /// fills the message completely, `+` otherwise; `end` is emitted as
    /// unknown (`*`) once `length` exceeds [`LARGE_MESSAGE_THRESHOLD`].
    pub fn make_send_request(
        &self,
        message_id: Option<String>,
        data: Bytes,
        start: u64,
        end: Option<u64>,
        length: Option<u64>,
    ) -> Chunk {
        build_send_request(&self.addressing(), message_id, data, start, end, length)
    }

    pub async fn write_chunk(&mut self, chunk: Chunk) -> std::io::Result<()> {
        write_chunk_to(&mut self.stream, &mut self.write_buf, &self.logger, chunk).await
    }

    /// Assembles one chunk from the framer's event stream, concatenating
    /// payload writes into a contiguous buffer. Any protocol
    /// violation drops the connection and returns [`ChunkParseError`].
    ///
    /// Not cancel-safe: dropping this future mid-chunk discards whatever
    /// payload it had already assembled, desynchronizing the next call
    /// from the framer's position. [`ChunkTransport::split`] gives the
    /// session engine a reader that isn't subject to that (it owns its
    /// own uncancellable read loop feeding a channel).
    pub async fn read_chunk(&mut self, max_size: usize) -> Result<Chunk, ChunkParseError> {
        read_chunk_from(&mut self.stream, &mut self.framer, &mut self.read_buf, &self.logger, max_size).await
    }

    /// Splits this transport into an owned reader/writer pair driven by
    /// independent halves of the same stream, so the session engine can
    /// read and write concurrently without a shared lock.
    pub fn split(self) -> (ChunkReader<tokio::io::ReadHalf<S>>, ChunkWriter<tokio::io::WriteHalf<S>>) {
        let (read_half, write_half) = tokio::io::split(self.stream);
        (
            ChunkReader {
                read_half,
                framer: self.framer,
                read_buf: self.read_buf,
                logger: self.logger.clone(),
            },
            ChunkWriter { write_half, write_buf: self.write_buf, logger: self.logger },
        )
    }

    /// Active side of the path-binding handshake: send an empty SEND,
    /// wait for `200`, tolerating a peer that also thinks it's active and
    /// sends its own empty SEND in the interim.
    pub async fn bind(&mut self, full_remote_path: Vec<Uri>) -> Result<(), MsrpTransactionError> {
        self.set_full_remote_path(full_remote_path);
        let chunk = self.make_send_request(None, Bytes::new(), 1, Some(0), Some(0));
        self.write_chunk(chunk)
            .await
            .map_err(|_| MsrpTransactionError::new(481, "No such session"))?;

        loop {
            let chunk = self
                .read_chunk(DEFAULT_MAX_CHUNK_SIZE)
                .await
                .map_err(|_| MsrpTransactionError::new(481, "No such session"))?;
            if chunk.is_request() {
                if chunk.method() == Some("SEND") && chunk.data.is_empty() {
                    let response = make_response_chunk(&chunk, 200, Some("OK".to_string()));
                    if let Some(response) = response {
                        let _ = self.write_chunk(response).await;
                    }
                    continue;
                }
                return Err(MsrpTransactionError::new(
                    481,
                    format!("Chunk received while binding session: {}", chunk.first_line_text()),
                ));
            } else if chunk.code() != Some(200) {
                return Err(MsrpTransactionError::new(481, "Cannot bind session"));
            } else {
                return Ok(());
            }
        }
    }

    /// Passive side of the path-binding handshake: read one chunk,
    /// validate it, respond, and re-inject any payload it carried so the
    /// session reader sees it as an ordinary SEND.
    pub async fn accept_binding(
        &mut self,
        full_remote_path: Vec<Uri>,
    ) -> Result<Option<Chunk>, ChunkParseError> {
        self.set_full_remote_path(full_remote_path);
        let chunk = self.read_chunk(DEFAULT_MAX_CHUNK_SIZE).await?;
        let (code, comment) = match self.check_incoming_send(&chunk, PathMatch::Strict) {
            None => (200u16, "OK".to_string()),
            Some(err) => (err.code, err.comment.unwrap_or_default()),
        };
        if let Some(response) = make_response_chunk(&chunk, code, Some(comment)) {
            self.write_chunk(response).await.map_err(ChunkParseError::from_io)?;
        }
        if chunk.has_header("Content-Type") || chunk.size() > 0 {
            Ok(Some(chunk))
        } else {
            Ok(None)
        }
    }

    /// Builds a REPORT for `original`, routed back along its `From-Path`.
    /// `None` if `original` is missing `From-Path` (shouldn't happen for a
    /// chunk that already passed [`ChunkTransport::check_incoming_send`]).
    pub fn make_report(&self, original: &Chunk, code: u16, comment: Option<String>) -> Option<Chunk> {
        make_report(&self.addressing(), original, code, comment)
    }

    /// Validates the `To-Path`/`From-Path` of an incoming SEND against this
    /// connection's expected identity.
    pub fn check_incoming_send(&self, chunk: &Chunk, mode: PathMatch) -> Option<MsrpTransactionError> {
        check_incoming_send(&self.addressing(), chunk, mode)
    }
}

/// Builds a REPORT for `original`, routed back along its `From-Path`.
/// `None` if `original` is missing `From-Path` (shouldn't happen for a
/// chunk that already passed [`check_incoming_send`]).
pub fn make_report(
    addressing: &Addressing,
    original: &Chunk,
    code: u16,
    comment: Option<String>,
) -> Option<Chunk> {
    let to_path = original.from_path()?;
    let mut chunk = Chunk::request(random_hex_id(64), "REPORT");
    chunk.add_header("To-Path", &crate::header::HeaderValue::UriList(to_path));
    chunk.add_header(
        "From-Path",
        &crate::header::HeaderValue::UriList(addressing.full_local_path()),
    );
    if let Some(message_id) = original.message_id() {
        chunk.add_header("Message-ID", &crate::header::HeaderValue::Opaque(message_id));
    }
    let range = original.byte_range();
    let start = range.as_ref().map(|r| r.start).unwrap_or(1);
    let total = range.and_then(|r| r.total);
    let end = start.saturating_sub(1) + original.size() as u64;
    chunk.add_header(
        "Byte-Range",
        &crate::header::HeaderValue::ByteRange(crate::header::ByteRange {
            start,
            end: Some(end),
            total,
        }),
    );
    chunk.add_header(
        "Status",
        &crate::header::HeaderValue::Status(crate::header::Status { code, comment }),
    );
    Some(chunk)
}

/// Validates the `To-Path`/`From-Path` of an incoming SEND against the
/// connection's expected identity.
pub fn check_incoming_send(
    addressing: &Addressing,
    chunk: &Chunk,
    mode: PathMatch,
) -> Option<MsrpTransactionError> {
    let to_path = match chunk.to_path() {
        Some(p) => p,
        None => return Some(MsrpTransactionError::new(400, "To-Path header missing")),
    };
    let from_path = match chunk.from_path() {
        Some(p) => p,
        None => return Some(MsrpTransactionError::new(400, "From-Path header missing")),
    };

    let expected_to = vec![addressing.local_uri.clone()];
    let expected_from = &addressing.to_path;

    match mode {
        PathMatch::Sessmatch => {
            if to_path.first().map(|u| &u.session_id) != expected_to.first().map(|u| &u.session_id) {
                return Some(MsrpTransactionError::new(481, "Invalid To-Path"));
            }
            if from_path.first().map(|u| &u.session_id) != expected_from.first().map(|u| &u.session_id) {
                return Some(MsrpTransactionError::new(481, "Invalid From-Path"));
            }
        }
        PathMatch::Strict => {
            if to_path != expected_to {
                return Some(MsrpTransactionError::new(481, "Invalid To-Path"));
            }
            if from_path != *expected_from {
                return Some(MsrpTransactionError::new(481, "Invalid From-Path"));
            }
        }
    }
    None
}

impl ChunkParseError {
    fn from_io(_: std::io::Error) -> Self {
        ChunkParseError::UnexpectedEvent("write failed".to_string())
    }
}

fn unexpected(event: &FramerEvent) -> ChunkParseError {
    ChunkParseError::UnexpectedEvent(format!("{:?}", std::mem::discriminant(event)))
}

async fn write_chunk_to<W: AsyncWrite + Unpin>(
    write_half: &mut W,
    write_buf: &mut BytesMut,
    logger: &std::sync::Arc<dyn TrafficLogger>,
    mut chunk: Chunk,
) -> std::io::Result<()> {
    write_buf.clear();
    write_buf.extend_from_slice(&chunk.encode());
    write_half.write_all(write_buf).await?;
    logger.sent_chunk(&chunk);
    Ok(())
}

async fn next_event_from<R: AsyncRead + Unpin>(
    read_half: &mut R,
    framer: &mut Framer,
    read_buf: &mut BytesMut,
    logger: &std::sync::Arc<dyn TrafficLogger>,
) -> Result<FramerEvent, ChunkParseError> {
    loop {
        if let Some(event) = framer.decode_from(read_buf) {
            if let FramerEvent::Illegal(bytes) = &event {
                logger.received_illegal_data(bytes);
                continue;
            }
            return Ok(event);
        }
        let mut buf = [0u8; 8192];
        let n = read_half
            .read(&mut buf)
            .await
            .map_err(|_| ChunkParseError::UnexpectedEvent("connection error".to_string()))?;
        if n == 0 {
            return Err(ChunkParseError::UnexpectedEvent("connection closed".to_string()));
        }
        read_buf.extend_from_slice(&buf[..n]);
    }
}

async fn read_chunk_from<R: AsyncRead + Unpin>(
    read_half: &mut R,
    framer: &mut Framer,
    read_buf: &mut BytesMut,
    logger: &std::sync::Arc<dyn TrafficLogger>,
    max_size: usize,
) -> Result<Chunk, ChunkParseError> {
    let event = next_event_from(read_half, framer, read_buf, logger).await?;
    let mut chunk = match event {
        FramerEvent::DataStart(chunk) => chunk,
        other => return Err(unexpected(&other)),
    };

    let mut data = BytesMut::new();
    loop {
        match next_event_from(read_half, framer, read_buf, logger).await? {
            FramerEvent::DataWrite(bytes) => {
                data.extend_from_slice(&bytes);
                if data.len() > max_size {
                    return Err(ChunkParseError::TooLarge(max_size));
                }
            }
            FramerEvent::DataFinalWrite(bytes) => {
                data.extend_from_slice(&bytes);
                if data.len() > max_size {
                    return Err(ChunkParseError::TooLarge(max_size));
                }
                match next_event_from(read_half, framer, read_buf, logger).await? {
                    FramerEvent::DataEnd(flag) => {
                        chunk.data = data.freeze();
                        chunk.contflag = flag;
                        logger.received_chunk(&chunk);
                        return Ok(chunk);
                    }
                    other => return Err(unexpected(&other)),
                }
            }
            FramerEvent::DataEnd(flag) => {
                chunk.data = data.freeze();
                chunk.contflag = flag;
                logger.received_chunk(&chunk);
                return Ok(chunk);
            }
            other => return Err(unexpected(&other)),
        }
    }
}

/// The read half of a [`ChunkTransport::split`] pair. Its
/// [`read_chunk`](ChunkReader::read_chunk) is meant to be driven by a loop
/// that runs to completion rather than raced inside `select!` — see
/// [`crate::session`].
pub struct ChunkReader<R> {
    read_half: R,
    framer: Framer,
    read_buf: BytesMut,
    logger: std::sync::Arc<dyn TrafficLogger>,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    pub async fn read_chunk(&mut self, max_size: usize) -> Result<Chunk, ChunkParseError> {
        read_chunk_from(&mut self.read_half, &mut self.framer, &mut self.read_buf, &self.logger, max_size).await
    }
}

/// The write half of a [`ChunkTransport::split`] pair.
pub struct ChunkWriter<W> {
    write_half: W,
    write_buf: BytesMut,
    logger: std::sync::Arc<dyn TrafficLogger>,
}

impl<W: AsyncWrite + Unpin> ChunkWriter<W> {
    pub async fn write_chunk(&mut self, chunk: Chunk) -> std::io::Result<()> {
        write_chunk_to(&mut self.write_half, &mut self.write_buf, &self.logger, chunk).await
    }
}

/// Constructs a response to `chunk` per RFC 4975 §7.2.
/// Suppressed per the Failure-Report rules; `None` means "don't send one".
pub fn make_response_chunk(chunk: &Chunk, code: u16, comment: Option<String>) -> Option<Chunk> {
    use crate::header::{FailureReport, HeaderValue};

    if chunk.failure_report() == FailureReport::No {
        return None;
    }
    if chunk.failure_report() == FailureReport::Partial && code == 200 {
        return None;
    }
    let to_path_src = chunk.from_path()?;
    let from_path_src = chunk.to_path()?;

    let to_path = if chunk.method() == Some("SEND") {
        vec![to_path_src.into_iter().next()?]
    } else {
        to_path_src
    };
    let from_path = vec![from_path_src.into_iter().next()?];

    let mut response = Chunk::response(chunk.transaction_id(), code, comment);
    response.add_header("To-Path", &HeaderValue::UriList(to_path));
    response.add_header("From-Path", &HeaderValue::UriList(from_path));
    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_request_byte_range_numeric_under_threshold() {
        let local = Uri::parse("msrp://a.example;tcp").unwrap();
        let logger: std::sync::Arc<dyn TrafficLogger> = std::sync::Arc::new(crate::logging::NoopLogger);
        let transport = test_transport(local, logger);
        let chunk = transport.make_send_request(None, Bytes::from_static(b"hello"), 1, None, None);
        let range = chunk.byte_range().unwrap();
        assert_eq!(range.end, Some(5));
        assert_eq!(chunk.contflag, ContFlag::Complete);
    }

    #[test]
    fn send_request_byte_range_unknown_over_threshold() {
        let local = Uri::parse("msrp://a.example;tcp").unwrap();
        let logger: std::sync::Arc<dyn TrafficLogger> = std::sync::Arc::new(crate::logging::NoopLogger);
        let transport = test_transport(local, logger);
        let big = vec![0u8; 3000];
        let chunk = transport.make_send_request(None, Bytes::from(big), 1, None, None);
        let range = chunk.byte_range().unwrap();
        assert_eq!(range.end, None);
    }

    fn test_transport(
        local: Uri,
        logger: std::sync::Arc<dyn TrafficLogger>,
    ) -> ChunkTransport<tokio::io::DuplexStream> {
        let (a, _b) = tokio::io::duplex(1024);
        ChunkTransport::new(a, local, logger)
    }

    #[test]
    fn make_response_suppressed_on_failure_report_no() {
        use crate::header::HeaderValue;
        let mut chunk = Chunk::request("abcd", "SEND");
        chunk.add_header("To-Path", &HeaderValue::UriList(vec![Uri::parse("msrp://b.example;tcp").unwrap()]));
        chunk.add_header("From-Path", &HeaderValue::UriList(vec![Uri::parse("msrp://a.example;tcp").unwrap()]));
        chunk.add_header("Failure-Report", &HeaderValue::FailureReport(crate::header::FailureReport::No));
        assert!(make_response_chunk(&chunk, 200, Some("OK".to_string())).is_none());
    }

    #[test]
    fn make_response_suppressed_on_partial_with_200() {
        use crate::header::HeaderValue;
        let mut chunk = Chunk::request("abcd", "SEND");
        chunk.add_header("To-Path", &HeaderValue::UriList(vec![Uri::parse("msrp://b.example;tcp").unwrap()]));
        chunk.add_header("From-Path", &HeaderValue::UriList(vec![Uri::parse("msrp://a.example;tcp").unwrap()]));
        chunk.add_header(
            "Failure-Report",
            &HeaderValue::FailureReport(crate::header::FailureReport::Partial),
        );
        assert!(make_response_chunk(&chunk, 200, Some("OK".to_string())).is_none());
        assert!(make_response_chunk(&chunk, 400, Some("Bad".to_string())).is_some());
    }

    #[test]
    fn make_report_routes_back_along_from_path() {
        use crate::header::HeaderValue;
        let local = Uri::parse("msrp://a.example;tcp").unwrap();
        let logger: std::sync::Arc<dyn TrafficLogger> = std::sync::Arc::new(crate::logging::NoopLogger);
        let transport = test_transport(local.clone(), logger);

        let mut original = Chunk::request("abcd", "SEND");
        let sender = Uri::parse("msrp://b.example;tcp").unwrap();
        original.add_header("To-Path", &HeaderValue::UriList(vec![local]));
        original.add_header("From-Path", &HeaderValue::UriList(vec![sender.clone()]));
        original.add_header("Message-ID", &HeaderValue::Opaque("m1".to_string()));
        original.data = Bytes::from_static(b"hello");

        let report = transport.make_report(&original, 200, Some("OK".to_string())).unwrap();
        assert_eq!(report.method(), Some("REPORT"));
        assert_eq!(report.to_path().unwrap(), vec![sender]);
        assert_eq!(report.message_id().as_deref(), Some("m1"));
        assert_eq!(report.status().unwrap().code, 200);
    }

    #[test]
    fn make_response_to_path_for_send_is_first_from_hop() {
        use crate::header::HeaderValue;
        let mut chunk = Chunk::request("abcd", "SEND");
        let from1 = Uri::parse("msrp://a.example;tcp").unwrap();
        let from2 = Uri::parse("msrp://relay.example;tcp").unwrap();
        chunk.add_header("To-Path", &HeaderValue::UriList(vec![Uri::parse("msrp://b.example;tcp").unwrap()]));
        chunk.add_header("From-Path", &HeaderValue::UriList(vec![from1.clone(), from2]));
        let response = make_response_chunk(&chunk, 200, Some("OK".to_string())).unwrap();
        assert_eq!(response.to_path().unwrap(), vec![from1]);
    }
}
