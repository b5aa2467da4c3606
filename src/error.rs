//! Error taxonomy.

use thiserror::Error;

/// A malformed MSRP URI.
#[derive(Debug, Error)]
pub enum UriParseError {
    #[error("URI does not match the MSRP URI grammar: {0:?}")]
    Malformed(String),
    #[error("invalid URI scheme {0:?} (expected msrp or msrps)")]
    InvalidScheme(String),
    #[error("invalid URI transport {0:?} (only 'tcp' is accepted)")]
    InvalidTransport(String),
    #[error("cannot parse URI parameters: {0:?}")]
    InvalidParameters(String),
}

/// A header value that doesn't match its kind's grammar.
#[derive(Debug, Error)]
#[error("error parsing {header} header: {reason}")]
pub struct HeaderParsingError {
    pub header: String,
    pub reason: String,
}

impl HeaderParsingError {
    pub fn new(header: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { header: header.into(), reason: reason.into() }
    }
}

/// The framer or transport facade could not make sense of the byte stream
/// ("Framer event sequence inconsistent, oversize chunk, bad
/// continuation flag"). Always drops the connection.
#[derive(Debug, Error)]
pub enum ChunkParseError {
    #[error("chunk exceeded max_size ({0} bytes)")]
    TooLarge(usize),
    #[error("unexpected framer event sequence: {0}")]
    UnexpectedEvent(String),
    #[error("invalid continuation flag: {0:?}")]
    InvalidContinuation(String),
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),
    #[error(transparent)]
    Header(#[from] HeaderParsingError),
}

/// A request/response-level MSRP error: either a peer responded with a
/// non-2xx, or local validation synthesized a non-200.
#[derive(Debug, Error, Clone)]
#[error("{code} {}", comment.as_deref().unwrap_or(""))]
pub struct MsrpTransactionError {
    pub code: u16,
    pub comment: Option<String>,
}

impl MsrpTransactionError {
    pub fn new(code: u16, comment: impl Into<String>) -> Self {
        Self { code, comment: Some(comment.into()) }
    }

    pub fn bad_request() -> Self {
        Self::new(400, "Bad request")
    }

    pub fn no_such_session() -> Self {
        Self::new(481, "No such session")
    }

    pub fn bad_content_type() -> Self {
        Self::new(415, "Unsupported media type")
    }

    pub fn timed_out() -> Self {
        Self::new(408, "Timed out while waiting for transaction response")
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

/// Raised when `send_chunk` is called outside the `Connected` state.
#[derive(Debug, Error)]
#[error("cannot send chunk because the session is {0}")]
pub struct MsrpSessionError(pub String);

/// Top-level error type aggregating every failure mode the crate surfaces.
#[derive(Debug, Error)]
pub enum MsrpError {
    #[error(transparent)]
    Uri(#[from] UriParseError),
    #[error(transparent)]
    Header(#[from] HeaderParsingError),
    #[error(transparent)]
    ChunkParse(#[from] ChunkParseError),
    #[error(transparent)]
    Transaction(#[from] MsrpTransactionError),
    #[error(transparent)]
    Session(#[from] MsrpSessionError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
