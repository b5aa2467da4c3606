//! Session configuration, `serde`-derived so an embedder can load it from
//! JSON/TOML alongside the rest of its settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_accept_types() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_response_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_keepalive_interval() -> Duration {
    Duration::from_secs(60)
}

/// Tunables for a [`crate::session::Session`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// MIME types accepted in an incoming SEND's `Content-Type`; `"*"`
    /// accepts anything, `"text/*"` matches on the type prefix.
    pub accept_types: Vec<String>,
    /// Whether the session synthesizes REPORT chunks on the peer's
    /// behalf per the Success-Report/Failure-Report rules.
    pub automatic_reports: bool,
    /// Use the sessmatch (draft-ietf-simple-msrp-sessmatch) relaxed
    /// To-Path/From-Path check instead of full-list equality.
    pub use_sessmatch: bool,
    #[serde(with = "duration_secs")]
    pub response_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub shutdown_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            accept_types: default_accept_types(),
            automatic_reports: default_true(),
            use_sessmatch: false,
            response_timeout: default_response_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
            keepalive_interval: default_keepalive_interval(),
        }
    }
}

impl SessionConfig {
    /// True if `content_type` is accepted by `self.accept_types`.
    pub fn accepts_content_type(&self, content_type: &str) -> bool {
        for pattern in &self.accept_types {
            if pattern == "*" {
                return true;
            }
            if let Some(prefix) = pattern.strip_suffix("/*") {
                if content_type.starts_with(prefix) && content_type[prefix.len()..].starts_with('/') {
                    return true;
                }
            } else if pattern == content_type {
                return true;
            }
        }
        false
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_permissive() {
        let config = SessionConfig::default();
        assert_eq!(config.accept_types, vec!["*".to_string()]);
        assert!(config.automatic_reports);
        assert!(!config.use_sessmatch);
        assert_eq!(config.response_timeout, Duration::from_secs(30));
        assert_eq!(config.keepalive_interval, Duration::from_secs(60));
    }

    #[test]
    fn accepts_content_type_wildcard_prefix() {
        let mut config = SessionConfig::default();
        config.accept_types = vec!["text/*".to_string()];
        assert!(config.accepts_content_type("text/plain"));
        assert!(!config.accepts_content_type("image/png"));
    }

    #[test]
    fn json_roundtrip() {
        let config = SessionConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.accept_types, config.accept_types);
    }
}
