//! Chunk model and wire encoding.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;

use crate::error::{ChunkParseError, HeaderParsingError};
use crate::header::{self, FailureReport, HeaderValue, SuccessReport};
use crate::uri::Uri;

/// The byte that terminates a chunk's end-line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContFlag {
    /// `$` — chunk is complete.
    Complete,
    /// `+` — more of this message follows in a later chunk.
    Continued,
    /// `#` — the message was aborted.
    Aborted,
}

impl ContFlag {
    pub fn as_char(&self) -> char {
        match self {
            Self::Complete => '$',
            Self::Continued => '+',
            Self::Aborted => '#',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '$' => Some(Self::Complete),
            '+' => Some(Self::Continued),
            '#' => Some(Self::Aborted),
            _ => None,
        }
    }
}

impl fmt::Display for ContFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Either a request method or a response code+optional comment
/// (a chunk carries exactly one of these).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirstLine {
    Request { method: String },
    Response { code: u16, comment: Option<String> },
}

/// One header, keeping its wire text; decoding happens on demand via
/// `Chunk::header_value`, a lazy dual representation that avoids the
/// runtime cost of caching both forms up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawHeader {
    pub name: String,
    pub encoded: String,
}

/// An MSRP protocol unit.
///
/// `method`/`code`/`comment` are set once at construction; there is no
/// setter for them, so immutability is structural rather than runtime
/// enforced. `transaction_id`, `data`, and `contflag` remain
/// mutable.
#[derive(Debug, Clone)]
pub struct Chunk {
    transaction_id: String,
    first_line: FirstLine,
    headers: HashMap<String, RawHeader>,
    header_order: Vec<String>,
    pub data: Bytes,
    pub contflag: ContFlag,
    encoded_header_cache: Option<String>,
}

impl Chunk {
    /// `transaction_id` must match `[A-Za-z0-9][A-Za-z0-9.+%=-]{3,31}`;
    /// this is enforced by the framer on parse, not here, to keep
    /// construction infallible for the common embedder-builds-it case.
    pub fn request(transaction_id: impl Into<String>, method: impl Into<String>) -> Self {
        Self::new(transaction_id, FirstLine::Request { method: method.into() })
    }

    pub fn response(transaction_id: impl Into<String>, code: u16, comment: Option<String>) -> Self {
        Self::new(transaction_id, FirstLine::Response { code, comment })
    }

    fn new(transaction_id: impl Into<String>, first_line: FirstLine) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            first_line,
            headers: HashMap::new(),
            header_order: Vec::new(),
            data: Bytes::new(),
            contflag: ContFlag::Complete,
            encoded_header_cache: None,
        }
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn set_transaction_id(&mut self, id: impl Into<String>) {
        self.transaction_id = id.into();
        self.encoded_header_cache = None;
    }

    pub fn method(&self) -> Option<&str> {
        match &self.first_line {
            FirstLine::Request { method } => Some(method),
            FirstLine::Response { .. } => None,
        }
    }

    pub fn code(&self) -> Option<u16> {
        match &self.first_line {
            FirstLine::Response { code, .. } => Some(*code),
            FirstLine::Request { .. } => None,
        }
    }

    pub fn comment(&self) -> Option<&str> {
        match &self.first_line {
            FirstLine::Response { comment, .. } => comment.as_deref(),
            FirstLine::Request { .. } => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.first_line, FirstLine::Request { .. })
    }

    pub fn first_line_text(&self) -> String {
        match &self.first_line {
            FirstLine::Request { method } => format!("MSRP {} {}", self.transaction_id, method),
            FirstLine::Response { code, comment: Some(c) } => {
                format!("MSRP {} {:03} {}", self.transaction_id, code, c)
            }
            FirstLine::Response { code, comment: None } => {
                format!("MSRP {} {:03}", self.transaction_id, code)
            }
        }
    }

    /// Adds or replaces a header, storing its already-encoded wire text.
    pub fn add_header_text(&mut self, name: impl Into<String>, encoded: impl Into<String>) {
        let name = name.into();
        if !self.headers.contains_key(&name) {
            self.header_order.push(name.clone());
        }
        self.headers.insert(name.clone(), RawHeader { name, encoded: encoded.into() });
        self.encoded_header_cache = None;
    }

    /// Adds or replaces a header from a typed value.
    pub fn add_header(&mut self, name: impl Into<String>, value: &HeaderValue) {
        self.add_header_text(name, header::encode(value));
    }

    pub fn remove_header(&mut self, name: &str) {
        if self.headers.remove(name).is_some() {
            self.header_order.retain(|n| n != name);
            self.encoded_header_cache = None;
        }
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(name)
    }

    pub fn header_text(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|h| h.encoded.as_str())
    }

    pub fn header_names(&self) -> impl Iterator<Item = &str> {
        self.header_order.iter().map(String::as_str)
    }

    /// Decodes a single header's value, failing with
    /// [`HeaderParsingError`] on a grammar violation.
    pub fn header_value(&self, name: &str) -> Option<Result<HeaderValue, HeaderParsingError>> {
        self.headers.get(name).map(|h| header::decode(name, &h.encoded))
    }

    fn uri_list_header(&self, name: &str) -> Option<Vec<Uri>> {
        match self.header_value(name)?.ok()? {
            HeaderValue::UriList(uris) => Some(uris),
            _ => None,
        }
    }

    pub fn to_path(&self) -> Option<Vec<Uri>> {
        self.uri_list_header("To-Path")
    }

    pub fn from_path(&self) -> Option<Vec<Uri>> {
        self.uri_list_header("From-Path")
    }

    pub fn content_type(&self) -> Option<String> {
        match self.header_value("Content-Type")?.ok()? {
            HeaderValue::Opaque(s) => Some(s),
            _ => None,
        }
    }

    pub fn message_id(&self) -> Option<String> {
        match self.header_value("Message-ID")?.ok()? {
            HeaderValue::Opaque(s) => Some(s),
            _ => None,
        }
    }

    pub fn byte_range(&self) -> Option<header::ByteRange> {
        match self.header_value("Byte-Range")?.ok()? {
            HeaderValue::ByteRange(r) => Some(r),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<header::Status> {
        match self.header_value("Status")?.ok()? {
            HeaderValue::Status(s) => Some(s),
            _ => None,
        }
    }

    /// Defaults to `Yes` when the header is absent.
    pub fn failure_report(&self) -> FailureReport {
        match self.header_value("Failure-Report") {
            Some(Ok(HeaderValue::FailureReport(v))) => v,
            _ => FailureReport::Yes,
        }
    }

    /// Defaults to `No` when the header is absent.
    pub fn success_report(&self) -> SuccessReport {
        match self.header_value("Success-Report") {
            Some(Ok(HeaderValue::SuccessReport(v))) => v,
            _ => SuccessReport::No,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Asserts presence of `To-Path`/`From-Path` and forces decoding of
    /// every header, surfacing any grammar violation.
    pub fn verify_headers(&self) -> Result<(), ChunkParseError> {
        if !self.has_header("To-Path") {
            return Err(ChunkParseError::MissingHeader("To-Path"));
        }
        if !self.has_header("From-Path") {
            return Err(ChunkParseError::MissingHeader("From-Path"));
        }
        for name in self.header_names() {
            if let Some(result) = self.header_value(name) {
                result?;
            }
        }
        Ok(())
    }

    /// The header block, sorted by canonical precedence level, cached
    /// until the next mutation.
    pub fn encoded_header(&mut self) -> &str {
        if self.encoded_header_cache.is_none() {
            let mut names: Vec<&String> = self.header_order.iter().collect();
            names.sort_by_key(|n| header::precedence_level(n));
            let mut lines = vec![self.first_line_text()];
            for name in names {
                let h = &self.headers[name];
                lines.push(format!("{}: {}", h.name, h.encoded));
            }
            if self.has_header("Content-Type") {
                lines.push(String::new());
            }
            self.encoded_header_cache = Some(lines.join("\r\n"));
        }
        self.encoded_header_cache.as_deref().unwrap()
    }

    pub fn encoded_footer(&self) -> String {
        format!("\r\n-------{}{}\r\n", self.transaction_id, self.contflag)
    }

    /// Serializes the full chunk: header block, payload, end-line.
    pub fn encode(&mut self) -> Bytes {
        let header = self.encoded_header().to_string();
        let footer = self.encoded_footer();
        let mut out = Vec::with_capacity(header.len() + self.data.len() + footer.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.data);
        out.extend_from_slice(footer.as_bytes());
        Bytes::from(out)
    }
}

impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        self.first_line_text() == other.first_line_text()
            && self.data == other.data
            && self.contflag == other.contflag
            && self.headers == other.headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_places_blank_line_only_with_content_type() {
        let mut chunk = Chunk::request("abcd", "SEND");
        chunk.add_header_text("To-Path", "msrp://a.example;tcp");
        chunk.add_header_text("From-Path", "msrp://b.example;tcp");
        let encoded = String::from_utf8(chunk.encode().to_vec()).unwrap();
        assert!(!encoded.contains("\r\n\r\n-------"));

        chunk.add_header_text("Content-Type", "text/plain");
        chunk.data = Bytes::from_static(b"hi");
        let encoded = String::from_utf8(chunk.encode().to_vec()).unwrap();
        assert!(encoded.contains("Content-Type: text/plain\r\n\r\nhi"));
    }

    #[test]
    fn header_order_matches_precedence() {
        let mut chunk = Chunk::request("abcd", "SEND");
        chunk.add_header_text("Content-Type", "text/plain");
        chunk.add_header_text("To-Path", "msrp://a.example;tcp");
        chunk.add_header_text("From-Path", "msrp://b.example;tcp");
        let header = chunk.encoded_header().to_string();
        let to_pos = header.find("To-Path").unwrap();
        let from_pos = header.find("From-Path").unwrap();
        let ct_pos = header.find("Content-Type").unwrap();
        assert!(to_pos < from_pos);
        assert!(from_pos < ct_pos);
    }

    #[test]
    fn verify_headers_requires_to_and_from_path() {
        let chunk = Chunk::request("abcd", "SEND");
        assert!(chunk.verify_headers().is_err());
    }

    #[test]
    fn verify_headers_surfaces_grammar_violation() {
        let mut chunk = Chunk::request("abcd", "SEND");
        chunk.add_header_text("To-Path", "msrp://a.example;tcp");
        chunk.add_header_text("From-Path", "msrp://b.example;tcp");
        chunk.add_header_text("Byte-Range", "not-a-range");
        assert!(chunk.verify_headers().is_err());
    }

    #[test]
    fn defaults_for_success_and_failure_report() {
        let chunk = Chunk::request("abcd", "SEND");
        assert_eq!(chunk.success_report(), SuccessReport::No);
        assert_eq!(chunk.failure_report(), FailureReport::Yes);
    }

    #[test]
    fn cache_invalidates_on_mutation() {
        let mut chunk = Chunk::request("abcd", "SEND");
        chunk.add_header_text("To-Path", "msrp://a.example;tcp");
        let _ = chunk.encoded_header().to_string();
        chunk.add_header_text("From-Path", "msrp://b.example;tcp");
        assert!(chunk.encoded_header().contains("From-Path"));
    }

    #[test]
    fn equality_is_structural() {
        let mut a = Chunk::request("abcd", "SEND");
        a.add_header_text("To-Path", "msrp://a.example;tcp");
        let mut b = Chunk::request("abcd", "SEND");
        b.add_header_text("To-Path", "msrp://a.example;tcp");
        assert_eq!(a, b);
        b.set_transaction_id("efgh");
        assert_ne!(a, b);
    }
}
