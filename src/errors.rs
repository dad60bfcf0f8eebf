//! Error taxonomy for the remote runtime
//!
//! Construction-time problems surface synchronously as `RemoteError::Config`.
//! Runtime failures travel back through the owning request or transaction
//! channel and are never panicked across a task boundary.

use serde_json::Value;
use thiserror::Error;

/// Top-level error type for everything the runtime can report.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// Malformed inbound message shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No usable server for the operation.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Constructor option validation failure, raised synchronously.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transaction preparation failure (TEJ code).
    #[error(transparent)]
    Prep(#[from] PrepError),

    /// A failure reported by the server, passed through unchanged.
    #[error("remote error: {error}")]
    NetworkResult {
        error: String,
        error_code: Option<i64>,
        error_message: Option<String>,
        /// The full response message as received.
        remote: Value,
    },
}

impl RemoteError {
    /// Build a `NetworkResult` from a raw error response message.
    pub(crate) fn from_response(message: Value) -> Self {
        let error = message
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("remoteError")
            .to_string();
        let error_code = message.get("error_code").and_then(Value::as_i64);
        let error_message = message
            .get("error_message")
            .and_then(Value::as_str)
            .map(str::to_string);
        RemoteError::NetworkResult {
            error,
            error_code,
            error_message,
            remote: message,
        }
    }

    /// Whether a retry at a higher layer could plausibly succeed.
    ///
    /// Retry policy itself belongs to callers; the router never retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Connection(e) => e.is_retryable(),
            RemoteError::NetworkResult { .. } => true,
            RemoteError::Protocol(_) | RemoteError::Config(_) | RemoteError::Prep(_) => false,
        }
    }
}

/// Routing-layer failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("no servers configured")]
    NoServers,

    #[error("not connected")]
    NotConnected,

    #[error("unknown server: {0}")]
    UnknownServer(String),

    /// The request future was explicitly cancelled.
    #[error("request aborted")]
    Aborted,
}

impl ConnectionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectionError::NotConnected)
    }
}

/// Transaction preparation errors. The wire names follow the engine's
/// local-error convention (`tej` prefix, never sent to a server).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PrepError {
    #[error("tejSecretUnknown: missing secret for account")]
    SecretUnknown,

    #[error("tejServerUntrusted: attempt to give secret to untrusted server")]
    ServerUntrusted,

    #[error("tejSecretInvalid: invalid secret")]
    SecretInvalid,

    #[error("tejUnconnected: fee requires connected server")]
    Unconnected,

    #[error("tejMaxFeeExceeded: max fee exceeded")]
    MaxFeeExceeded,

    #[error("tejInvalidFlag: flag does not exist")]
    InvalidFlag,

    #[error("tejAbort: transaction aborted")]
    Abort,
}

impl PrepError {
    /// The stable local-error code string.
    pub fn code(&self) -> &'static str {
        match self {
            PrepError::SecretUnknown => "tejSecretUnknown",
            PrepError::ServerUntrusted => "tejServerUntrusted",
            PrepError::SecretInvalid => "tejSecretInvalid",
            PrepError::Unconnected => "tejUnconnected",
            PrepError::MaxFeeExceeded => "tejMaxFeeExceeded",
            PrepError::InvalidFlag => "tejInvalidFlag",
            PrepError::Abort => "tejAbort",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn network_result_passes_server_fields_through() {
        let msg = json!({
            "error": "actNotFound",
            "error_code": 19,
            "error_message": "Account not found.",
            "id": 4,
        });
        match RemoteError::from_response(msg.clone()) {
            RemoteError::NetworkResult {
                error,
                error_code,
                error_message,
                remote,
            } => {
                assert_eq!(error, "actNotFound");
                assert_eq!(error_code, Some(19));
                assert_eq!(error_message.as_deref(), Some("Account not found."));
                assert_eq!(remote, msg);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn prep_codes_are_stable() {
        assert_eq!(PrepError::SecretUnknown.code(), "tejSecretUnknown");
        assert_eq!(PrepError::MaxFeeExceeded.code(), "tejMaxFeeExceeded");
        assert_eq!(PrepError::Abort.code(), "tejAbort");
    }

    #[test]
    fn retryability_classification() {
        assert!(RemoteError::from(ConnectionError::NotConnected).is_retryable());
        assert!(!RemoteError::from(ConnectionError::NoServers).is_retryable());
        assert!(!RemoteError::Config("bad".into()).is_retryable());
        assert!(!RemoteError::from(PrepError::MaxFeeExceeded).is_retryable());
    }
}
