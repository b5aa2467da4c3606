//! MSRP URI model and parser (RFC 4975 §6.1).

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use lazy_static::lazy_static;
use rand::RngCore;
use regex::Regex;

use crate::error::UriParseError;

/// Default MSRP port.
pub const DEFAULT_PORT: u16 = 2855;

lazy_static! {
    static ref URI_RE: Regex = Regex::new(
        r"^(?P<scheme>.*?)://(((?P<user>.*?)@)?(?P<host>.*?)(:(?P<port>[0-9]+?))?)(/(?P<session_id>.*?))?;(?P<transport>.*?)(;(?P<parameters>.*))?$"
    ).unwrap();
}

/// An MSRP or MSRPS URI.
///
/// Equality and hashing only consider `(use_tls, host, port, session_id,
/// transport)`, with `host`/`transport` case-folded — `user`, `parameters`,
/// and `credentials` are carried but never compared (RFC 4975 §6.1).
#[derive(Debug, Clone)]
pub struct Uri {
    pub use_tls: bool,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub session_id: String,
    pub transport: String,
    pub parameters: HashMap<String, String>,
    /// Opaque credential handle for the embedder's TLS stack (the X.509
    /// credential source is an external collaborator). Never compared or
    /// serialized on the wire.
    pub credentials: Option<String>,
}

impl Uri {
    /// Builds a URI with an auto-generated 80-bit lowercase-hex session id,
    /// `tcp` transport, and no parameters — the common case for a local
    /// endpoint identity.
    pub fn new(host: impl Into<String>, use_tls: bool, port: Option<u16>) -> Self {
        Self {
            use_tls,
            user: None,
            host: host.into(),
            port,
            session_id: generate_session_id(),
            transport: "tcp".to_string(),
            parameters: HashMap::new(),
            credentials: None,
        }
    }

    pub fn scheme(&self) -> &'static str {
        if self.use_tls {
            "msrps"
        } else {
            "msrp"
        }
    }

    /// Effective port: `self.port` or the MSRP default.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    /// Parses a URI per the MSRP URI grammar.
    pub fn parse(value: &str) -> Result<Self, UriParseError> {
        let caps = URI_RE
            .captures(value)
            .ok_or_else(|| UriParseError::Malformed(value.to_string()))?;

        let scheme = &caps["scheme"];
        let use_tls = match scheme {
            "msrp" => false,
            "msrps" => true,
            other => return Err(UriParseError::InvalidScheme(other.to_string())),
        };

        let transport = caps["transport"].to_string();
        if transport != "tcp" {
            return Err(UriParseError::InvalidTransport(transport));
        }

        let user = caps.name("user").map(|m| m.as_str().to_string());
        let host = caps["host"].to_string();
        let port = match caps.name("port") {
            Some(m) => Some(
                m.as_str()
                    .parse::<u16>()
                    .map_err(|_| UriParseError::Malformed(value.to_string()))?,
            ),
            None => None,
        };
        let session_id = caps
            .name("session_id")
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(generate_session_id);

        let parameters = match caps.name("parameters") {
            Some(m) => parse_parameters(m.as_str())?,
            None => HashMap::new(),
        };

        Ok(Self {
            use_tls,
            user,
            host,
            port,
            session_id,
            transport,
            parameters,
            credentials: None,
        })
    }
}

fn parse_parameters(raw: &str) -> Result<HashMap<String, String>, UriParseError> {
    let mut out = HashMap::new();
    for pair in raw.split(';') {
        let mut parts = pair.splitn(2, '=');
        let key = parts.next().unwrap_or("");
        let value = parts
            .next()
            .ok_or_else(|| UriParseError::InvalidParameters(raw.to_string()))?;
        out.insert(key.to_string(), value.to_string());
    }
    Ok(out)
}

fn generate_session_id() -> String {
    // 80 random bits, lowercase hex.
    let mut bytes = [0u8; 10];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme())?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        if !self.session_id.is_empty() {
            write!(f, "/{}", self.session_id)?;
        }
        write!(f, ";{}", self.transport)?;
        for (name, value) in &self.parameters {
            write!(f, ";{}={}", name, value)?;
        }
        Ok(())
    }
}

impl PartialEq for Uri {
    fn eq(&self, other: &Self) -> bool {
        self.use_tls == other.use_tls
            && self.host.to_lowercase() == other.host.to_lowercase()
            && self.effective_port() == other.effective_port()
            && self.session_id == other.session_id
            && self.transport.to_lowercase() == other.transport.to_lowercase()
    }
}

impl Eq for Uri {}

impl Hash for Uri {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.use_tls.hash(state);
        self.host.to_lowercase().hash(state);
        self.effective_port().hash(state);
        self.session_id.hash(state);
        self.transport.to_lowercase().hash(state);
    }
}
