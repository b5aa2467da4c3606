//! Header value codec and the canonical header ordering used when
//! serializing a chunk.

use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::HeaderParsingError;
use crate::uri::Uri;

lazy_static! {
    static ref BYTE_RANGE_RE: Regex = Regex::new(r"^(\d+)-(\*|\d+)/(\*|\d+)").unwrap();
    static ref CONTENT_DISPOSITION_RE: Regex = Regex::new(r#"(\w+)=("[^"]+"|[^";]+)"#).unwrap();
    static ref PARAMETER_LIST_RE: Regex = Regex::new(r#"(\w+)=("[^"]+"|[^",]+)"#).unwrap();
}

/// `start-end/total`, with `end`/`total` possibly `*` ("unknown").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
    pub total: Option<u64>,
}

impl ByteRange {
    pub fn decode(text: &str) -> Result<Self, String> {
        let caps = BYTE_RANGE_RE
            .captures(text)
            .ok_or_else(|| format!("invalid byte range value: {:?}", text))?;
        let start = caps[1].parse().map_err(|_| "invalid start".to_string())?;
        let end = if &caps[2] == "*" {
            None
        } else {
            Some(caps[2].parse().map_err(|_| "invalid end".to_string())?)
        };
        let total = if &caps[3] == "*" {
            None
        } else {
            Some(caps[3].parse().map_err(|_| "invalid total".to_string())?)
        };
        Ok(Self { start, end, total })
    }

    pub fn encode(&self) -> String {
        format!(
            "{}-{}/{}",
            self.start,
            self.end.map(|v| v.to_string()).unwrap_or_else(|| "*".to_string()),
            self.total.map(|v| v.to_string()).unwrap_or_else(|| "*".to_string()),
        )
    }
}

/// `000 NNN[ comment]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    pub comment: Option<String>,
}

impl Status {
    pub fn decode(text: &str) -> Result<Self, String> {
        let (namespace, rest) = text.split_once(' ').ok_or_else(|| format!("invalid status value: {:?}", text))?;
        if namespace != "000" {
            return Err(format!("invalid status value: {:?}", text));
        }
        let (code, comment) = match rest.split_once(' ') {
            Some((code, comment)) => (code, Some(comment.to_string())),
            None => (rest, None),
        };
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("invalid status code: {:?}", code));
        }
        Ok(Self { code: code.parse().unwrap(), comment })
    }

    pub fn encode(&self) -> String {
        match &self.comment {
            Some(comment) => format!("000 {:03} {}", self.code, comment),
            None => format!("000 {:03}", self.code),
        }
    }
}

/// `disposition; k="v"; k2="v2"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDisposition {
    pub disposition: String,
    pub parameters: Vec<(String, String)>,
}

impl ContentDisposition {
    pub fn decode(text: &str) -> Result<Self, String> {
        let (disposition, rest) = text.split_once(';').unwrap_or((text, ""));
        if disposition.is_empty() {
            return Err(format!("invalid content disposition: {:?}", text));
        }
        let parameters = CONTENT_DISPOSITION_RE
            .captures_iter(rest)
            .map(|c| (c[1].to_string(), c[2].trim_matches('"').to_string()))
            .collect();
        Ok(Self { disposition: disposition.to_string(), parameters })
    }

    pub fn encode(&self) -> String {
        let mut parts = vec![self.disposition.clone()];
        parts.extend(self.parameters.iter().map(|(k, v)| format!("{}=\"{}\"", k, v)));
        parts.join("; ")
    }
}

/// `k="v", k2="v2"` (Authentication-Info).
pub fn decode_parameter_list(text: &str) -> Vec<(String, String)> {
    PARAMETER_LIST_RE
        .captures_iter(text)
        .map(|c| (c[1].to_string(), c[2].trim_matches('"').to_string()))
        .collect()
}

pub fn encode_parameter_list(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `Digest k="v", k2="v2"` (WWW-Authenticate, Authorization).
pub fn decode_digest(text: &str) -> Result<Vec<(String, String)>, String> {
    let rest = text
        .strip_prefix("Digest ")
        .ok_or_else(|| "invalid Digest header value".to_string())?;
    Ok(decode_parameter_list(rest))
}

pub fn encode_digest(params: &[(String, String)]) -> String {
    format!("Digest {}", encode_parameter_list(params))
}

/// `Success-Report` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessReport {
    Yes,
    No,
}

impl SuccessReport {
    pub fn decode(text: &str) -> Result<Self, String> {
        match text {
            "yes" => Ok(Self::Yes),
            "no" => Ok(Self::No),
            other => Err(format!("invalid value: {:?}", other)),
        }
    }

    pub fn encode(&self) -> &'static str {
        match self {
            Self::Yes => "yes",
            Self::No => "no",
        }
    }
}

/// `Failure-Report` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReport {
    Yes,
    No,
    Partial,
}

impl FailureReport {
    pub fn decode(text: &str) -> Result<Self, String> {
        match text {
            "yes" => Ok(Self::Yes),
            "no" => Ok(Self::No),
            "partial" => Ok(Self::Partial),
            other => Err(format!("invalid value: {:?}", other)),
        }
    }

    pub fn encode(&self) -> &'static str {
        match self {
            Self::Yes => "yes",
            Self::No => "no",
            Self::Partial => "partial",
        }
    }
}

/// The closed set of header value kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Opaque(String),
    Utf8(String),
    UriList(Vec<Uri>),
    Integer(i64),
    SuccessReport(SuccessReport),
    FailureReport(FailureReport),
    ByteRange(ByteRange),
    Status(Status),
    ContentDisposition(ContentDisposition),
    ParameterList(Vec<(String, String)>),
    Digest(Vec<(String, String)>),
}

/// Which kind of value a given header name carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    Opaque,
    Utf8,
    UriList,
    Integer,
    SuccessReport,
    FailureReport,
    ByteRange,
    Status,
    ContentDisposition,
    ParameterList,
    Digest,
}

/// Maps a header name to its kind. Unknown `Content-*` names and unknown
/// names in general both default to opaque string carriage.
pub fn kind_for_name(name: &str) -> HeaderKind {
    match name {
        "To-Path" | "From-Path" | "Use-Path" => HeaderKind::UriList,
        "Use-Nickname" => HeaderKind::Utf8,
        "Expires" | "Min-Expires" | "Max-Expires" => HeaderKind::Integer,
        "Success-Report" => HeaderKind::SuccessReport,
        "Failure-Report" => HeaderKind::FailureReport,
        "Byte-Range" => HeaderKind::ByteRange,
        "Status" => HeaderKind::Status,
        "Content-Disposition" => HeaderKind::ContentDisposition,
        "Authentication-Info" => HeaderKind::ParameterList,
        "WWW-Authenticate" | "Authorization" => HeaderKind::Digest,
        _ => HeaderKind::Opaque,
    }
}

/// Decodes `text` according to `name`'s kind.
pub fn decode(name: &str, text: &str) -> Result<HeaderValue, HeaderParsingError> {
    let err = |reason: String| HeaderParsingError::new(name, reason);
    Ok(match kind_for_name(name) {
        HeaderKind::Opaque => HeaderValue::Opaque(text.to_string()),
        HeaderKind::Utf8 => HeaderValue::Utf8(text.to_string()),
        HeaderKind::UriList => {
            let mut uris = Vec::new();
            for part in text.split(' ') {
                uris.push(Uri::parse(part).map_err(|e| err(e.to_string()))?);
            }
            if uris.is_empty() {
                return Err(err("URI list must be non-empty".to_string()));
            }
            HeaderValue::UriList(uris)
        }
        HeaderKind::Integer => {
            HeaderValue::Integer(text.parse().map_err(|_| err(format!("invalid integer: {:?}", text)))?)
        }
        HeaderKind::SuccessReport => HeaderValue::SuccessReport(SuccessReport::decode(text).map_err(err)?),
        HeaderKind::FailureReport => HeaderValue::FailureReport(FailureReport::decode(text).map_err(err)?),
        HeaderKind::ByteRange => HeaderValue::ByteRange(ByteRange::decode(text).map_err(err)?),
        HeaderKind::Status => HeaderValue::Status(Status::decode(text).map_err(err)?),
        HeaderKind::ContentDisposition => {
            HeaderValue::ContentDisposition(ContentDisposition::decode(text).map_err(err)?)
        }
        HeaderKind::ParameterList => HeaderValue::ParameterList(decode_parameter_list(text)),
        HeaderKind::Digest => HeaderValue::Digest(decode_digest(text).map_err(err)?),
    })
}

/// Encodes a decoded value back to its wire text form.
pub fn encode(value: &HeaderValue) -> String {
    match value {
        HeaderValue::Opaque(s) | HeaderValue::Utf8(s) => s.clone(),
        HeaderValue::UriList(uris) => uris.iter().map(|u| u.to_string()).collect::<Vec<_>>().join(" "),
        HeaderValue::Integer(i) => i.to_string(),
        HeaderValue::SuccessReport(v) => v.encode().to_string(),
        HeaderValue::FailureReport(v) => v.encode().to_string(),
        HeaderValue::ByteRange(v) => v.encode(),
        HeaderValue::Status(v) => v.encode(),
        HeaderValue::ContentDisposition(v) => v.encode(),
        HeaderValue::ParameterList(v) => encode_parameter_list(v),
        HeaderValue::Digest(v) => encode_digest(v),
    }
}

/// Canonical serialization precedence level for a header name:
/// `To-Path` (0) < `From-Path` (1) < the level-2 block < level-3 (Content-ID/
/// Description/Disposition) < `Content-Type` (4). Ties within a level are
/// unspecified.
pub fn precedence_level(name: &str) -> u8 {
    match name {
        "To-Path" => 0,
        "From-Path" => 1,
        "Content-Type" => 4,
        "Content-ID" | "Content-Description" | "Content-Disposition" => 3,
        _ if name.starts_with("Content-") => 3,
        _ => 2,
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", encode(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_range_roundtrip_numeric() {
        let v = ByteRange { start: 1, end: Some(10), total: Some(100) };
        assert_eq!(ByteRange::decode(&v.encode()).unwrap(), v);
    }

    #[test]
    fn byte_range_roundtrip_unknown() {
        let v = ByteRange { start: 1, end: None, total: None };
        assert_eq!(v.encode(), "1-*/*");
        assert_eq!(ByteRange::decode("1-*/*").unwrap(), v);
    }

    #[test]
    fn status_roundtrip_no_comment() {
        let v = Status { code: 999, comment: None };
        assert_eq!(v.encode(), "000 999");
        assert_eq!(Status::decode("000 999").unwrap(), v);
    }

    #[test]
    fn status_roundtrip_with_comment() {
        let v = Status { code: 200, comment: Some("OK".to_string()) };
        assert_eq!(Status::decode(&v.encode()).unwrap(), v);
    }

    #[test]
    fn status_rejects_bad_namespace() {
        assert!(Status::decode("001 200").is_err());
    }

    #[test]
    fn status_rejects_non_three_digit_code() {
        assert!(Status::decode("000 42").is_err());
    }

    #[test]
    fn content_disposition_roundtrip() {
        let parameters = vec![("filename".to_string(), "a.txt".to_string())];
        let v = ContentDisposition { disposition: "render".to_string(), parameters };
        let decoded = ContentDisposition::decode(&v.encode()).unwrap();
        assert_eq!(decoded, v);
    }

    #[test]
    fn content_disposition_roundtrip_preserves_parameter_order() {
        let parameters = vec![
            ("filename".to_string(), "a.txt".to_string()),
            ("size".to_string(), "3".to_string()),
            ("creation-date".to_string(), "today".to_string()),
        ];
        let v = ContentDisposition { disposition: "render".to_string(), parameters };
        assert_eq!(v.encode(), "render; filename=\"a.txt\"; size=\"3\"; creation-date=\"today\"");
        let decoded = ContentDisposition::decode(&v.encode()).unwrap();
        assert_eq!(decoded, v);
    }

    #[test]
    fn digest_requires_prefix() {
        assert!(decode_digest("nonce=\"abc\"").is_err());
        let params = decode_digest("Digest nonce=\"abc\"").unwrap();
        assert_eq!(params.iter().find(|(k, _)| k == "nonce").map(|(_, v)| v.as_str()), Some("abc"));
    }

    #[test]
    fn uri_list_decodes_space_separated() {
        let value = decode("To-Path", "msrp://a.example;tcp msrp://b.example;tcp").unwrap();
        match value {
            HeaderValue::UriList(uris) => assert_eq!(uris.len(), 2),
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn unknown_header_defaults_to_opaque() {
        assert_eq!(kind_for_name("Keep-Alive"), HeaderKind::Opaque);
        assert_eq!(kind_for_name("Content-Whatever"), HeaderKind::Opaque);
    }

    #[test]
    fn precedence_levels_are_ordered() {
        assert_eq!(precedence_level("To-Path"), 0);
        assert_eq!(precedence_level("From-Path"), 1);
        assert_eq!(precedence_level("Status"), 2);
        assert_eq!(precedence_level("Use-Nickname"), 2);
        assert_eq!(precedence_level("Content-ID"), 3);
        assert_eq!(precedence_level("Content-Type"), 4);
        assert_eq!(precedence_level("X-Unknown"), 2);
    }

    #[test]
    fn decode_encode_roundtrip_for_every_kind() {
        let cases = [
            ("Message-ID", "abc123"),
            ("Expires", "30"),
            ("Success-Report", "yes"),
            ("Failure-Report", "partial"),
            ("Byte-Range", "1-10/100"),
            ("Status", "000 200 OK"),
            ("Content-Disposition", "render; filename=\"a.txt\""),
            ("Authentication-Info", "nextnonce=\"abc\""),
            ("WWW-Authenticate", "Digest realm=\"x\""),
        ];
        for (name, text) in cases {
            let value = decode(name, text).unwrap();
            assert_eq!(encode(&value), text, "roundtrip failed for {}", name);
        }
    }
}
