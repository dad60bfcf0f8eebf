//! Remote configuration
//!
//! All options live in one explicit struct, deserializable from TOML with
//! per-field defaults, and validated exactly once at construction. Invalid
//! configuration fails synchronously; nothing downstream re-checks option
//! types.

use serde::{Deserialize, Serialize};

use crate::errors::RemoteError;

/// Endpoint description for one server connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEndpoint {
    /// Websocket URL, `ws://` or `wss://`.
    pub url: String,

    /// Designate this server as the primary for routing.
    #[serde(default)]
    pub primary: bool,
}

/// Main configuration for a [`crate::Remote`] instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Whether connected servers are trusted with secrets.
    #[serde(default)]
    pub trusted: bool,

    /// Log full message payloads at debug level.
    #[serde(default)]
    pub trace: bool,

    /// Accept servers that only hold partial ledger history.
    #[serde(default = "default_true")]
    pub allow_partial_history: bool,

    /// Track account sequence numbers locally.
    #[serde(default = "default_true")]
    pub local_sequence: bool,

    /// Compute fees locally from connected servers' estimates.
    #[serde(default = "default_true")]
    pub local_fee: bool,

    /// Sign locally; secrets never leave the process.
    #[serde(default = "default_true")]
    pub local_signing: bool,

    /// Request malleability-resistant signatures via the canonical flag.
    #[serde(default = "default_true")]
    pub canonical_signing: bool,

    /// Multiplier applied to server fee estimates.
    #[serde(default = "default_fee_cushion")]
    pub fee_cushion: f64,

    /// Hard ceiling on any transaction fee, in drops.
    #[serde(default = "default_max_fee")]
    pub max_fee: u64,

    /// Maximum submission attempts before a transaction fails.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Submission timeout in milliseconds.
    #[serde(default = "default_submission_timeout")]
    pub submission_timeout_ms: u64,

    /// Resubmit automatically on ledger advance.
    #[serde(default = "default_true")]
    pub automatic_resubmission: bool,

    /// Ledgers beyond the current index granted to a transaction before it
    /// expires (absorbs close-time latency).
    #[serde(default = "default_last_ledger_offset")]
    pub last_ledger_offset: u32,

    /// Servers to connect to.
    #[serde(default)]
    pub servers: Vec<ServerEndpoint>,

    /// Soft cap on event subscribers; 0 means unlimited.
    #[serde(default)]
    pub max_listeners: usize,
}

fn default_true() -> bool {
    true
}
fn default_fee_cushion() -> f64 {
    1.2
}
fn default_max_fee() -> u64 {
    1_000_000
}
fn default_max_attempts() -> u32 {
    10
}
fn default_submission_timeout() -> u64 {
    20_000
}
fn default_last_ledger_offset() -> u32 {
    3
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            trusted: false,
            trace: false,
            allow_partial_history: true,
            local_sequence: true,
            local_fee: true,
            local_signing: true,
            canonical_signing: true,
            fee_cushion: default_fee_cushion(),
            max_fee: default_max_fee(),
            max_attempts: default_max_attempts(),
            submission_timeout_ms: default_submission_timeout(),
            automatic_resubmission: true,
            last_ledger_offset: default_last_ledger_offset(),
            servers: Vec::new(),
            max_listeners: 0,
        }
    }
}

impl RemoteConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self, RemoteError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RemoteError::Config(format!("cannot read {path}: {e}")))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, RemoteError> {
        let config: RemoteConfig =
            toml::from_str(content).map_err(|e| RemoteError::Config(e.to_string()))?;
        config.validated()
    }

    /// Validate ranges and normalize implied options. Local signing implies
    /// local sequence and fee tracking.
    pub fn validated(mut self) -> Result<Self, RemoteError> {
        if !self.fee_cushion.is_finite() || self.fee_cushion < 1.0 {
            return Err(RemoteError::Config(format!(
                "fee_cushion must be >= 1.0, got {}",
                self.fee_cushion
            )));
        }
        if self.max_fee == 0 {
            return Err(RemoteError::Config("max_fee must be positive".into()));
        }
        if self.max_attempts == 0 {
            return Err(RemoteError::Config("max_attempts must be positive".into()));
        }
        for endpoint in &self.servers {
            validate_ws_url(&endpoint.url)?;
        }
        if self.servers.iter().filter(|s| s.primary).count() > 1 {
            return Err(RemoteError::Config(
                "at most one server may be marked primary".into(),
            ));
        }
        if self.local_signing {
            self.local_sequence = true;
            self.local_fee = true;
        }
        Ok(self)
    }
}

pub(crate) fn validate_ws_url(url: &str) -> Result<(), RemoteError> {
    let rest = url
        .strip_prefix("ws://")
        .or_else(|| url.strip_prefix("wss://"))
        .ok_or_else(|| {
            RemoteError::Config(format!("server url must be ws:// or wss://, got {url}"))
        })?;
    let host = rest.split('/').next().unwrap_or("");
    if host.is_empty() {
        return Err(RemoteError::Config(format!("server url missing host: {url}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config = RemoteConfig::from_toml_str("").unwrap();
        assert!(!config.trusted);
        assert!(config.local_signing);
        assert!(config.canonical_signing);
        assert_eq!(config.fee_cushion, 1.2);
        assert_eq!(config.max_fee, 1_000_000);
        assert_eq!(config.last_ledger_offset, 3);
        assert_eq!(config.max_listeners, 0);
        assert!(config.servers.is_empty());
    }

    #[test]
    fn toml_round_trip_with_servers() {
        let toml = r#"
            trusted = true
            fee_cushion = 1.5

            [[servers]]
            url = "wss://s1.example.net:443"
            primary = true

            [[servers]]
            url = "wss://s2.example.net:443"
        "#;
        let config = RemoteConfig::from_toml_str(toml).unwrap();
        assert!(config.trusted);
        assert_eq!(config.servers.len(), 2);
        assert!(config.servers[0].primary);
        assert!(!config.servers[1].primary);
    }

    #[test]
    fn invalid_url_scheme_fails_synchronously() {
        let config = RemoteConfig {
            servers: vec![ServerEndpoint {
                url: "http://example.net".into(),
                primary: false,
            }],
            ..RemoteConfig::default()
        };
        assert!(matches!(config.validated(), Err(RemoteError::Config(_))));
    }

    #[test]
    fn fee_cushion_below_one_rejected() {
        let config = RemoteConfig {
            fee_cushion: 0.5,
            ..RemoteConfig::default()
        };
        assert!(config.validated().is_err());
    }

    #[test]
    fn two_primaries_rejected() {
        let endpoint = |url: &str| ServerEndpoint {
            url: url.into(),
            primary: true,
        };
        let config = RemoteConfig {
            servers: vec![endpoint("ws://a:1"), endpoint("ws://b:1")],
            ..RemoteConfig::default()
        };
        assert!(config.validated().is_err());
    }

    #[test]
    fn local_signing_implies_sequence_and_fee() {
        let toml = r#"
            local_signing = true
            local_sequence = false
            local_fee = false
        "#;
        let config = RemoteConfig::from_toml_str(toml).unwrap();
        assert!(config.local_sequence);
        assert!(config.local_fee);
    }
}
