//! Error types for the Gemini client

use std::time::Duration;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Reason the local rate limiter refused or timed out a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetBlockedReason {
    /// The request alone exceeds the whole window budget; waiting can never help.
    OverBudget,
    /// The current window has no room left for the requested tokens.
    BudgetFull,
    /// All permits for the concurrency key are in use.
    NoPermit,
    /// A blocking wait for a permit hit its deadline.
    PermitTimeout,
}

impl std::fmt::Display for BudgetBlockedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BudgetBlockedReason::OverBudget => "over_budget",
            BudgetBlockedReason::BudgetFull => "budget_full",
            BudgetBlockedReason::NoPermit => "no_permit",
            BudgetBlockedReason::PermitTimeout => "permit_timeout",
        };
        write!(f, "{s}")
    }
}

/// SSE stream failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorKind {
    /// No chunk arrived within the subscriber receive timeout.
    Timeout,
    /// A `data:` frame was not valid JSON.
    Parse,
    /// The server closed the connection before completion.
    UpstreamClosed,
    /// The stream request could not be established.
    Connect,
}

impl std::fmt::Display for StreamErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StreamErrorKind::Timeout => "timeout",
            StreamErrorKind::Parse => "parse",
            StreamErrorKind::UpstreamClosed => "upstream_closed",
            StreamErrorKind::Connect => "connect",
        };
        write!(f, "{s}")
    }
}

/// Live (WebSocket) session failure classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveErrorKind {
    /// The server rejected the setup frame, or never acknowledged it.
    SetupFailed,
    /// The transport closed with the given code and reason.
    Closed { code: u16, reason: String },
    /// The server sent a frame the protocol does not allow in this state.
    ProtocolViolation,
}

impl std::fmt::Display for LiveErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LiveErrorKind::SetupFailed => write!(f, "setup_failed"),
            LiveErrorKind::Closed { code, reason } => write!(f, "closed({code}: {reason})"),
            LiveErrorKind::ProtocolViolation => write!(f, "protocol_violation"),
        }
    }
}

/// Main error type for the SDK
#[derive(Error, Debug)]
pub enum Error {
    /// No usable credential, token exchange failed, or JWT signing failed
    #[error("auth error ({source_kind}): {message}")]
    Auth {
        /// Which credential source was being resolved
        source_kind: String,
        /// What went wrong
        message: String,
    },

    /// Transport-level HTTP failure (DNS, TCP, TLS, timeout)
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-2xx response from the server, body preserved untouched
    #[error("HTTP {status}: {message}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Parsed `error.message` when the body carried one, else the status text
        message: String,
        /// Raw response body
        body: String,
    },

    /// Server-side 429 with an honored `RetryInfo.retryDelay`
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// How long the server asked us to back off
        retry_after: Duration,
        /// Quota metric from the 429 details, when present
        quota_metric: Option<String>,
        /// Quota id from the 429 details, when present
        quota_id: Option<String>,
    },

    /// The local rate limiter refused the request
    #[error("budget blocked ({reason})")]
    Budget {
        /// Why the limiter refused
        reason: BudgetBlockedReason,
        /// When retrying could succeed, if known
        retry_after: Option<Duration>,
    },

    /// SSE stream failure
    #[error("stream error ({kind}) on attempt {attempt}: {message}")]
    Stream {
        /// Failure classification
        kind: StreamErrorKind,
        /// Which connection attempt failed (1-based)
        attempt: u32,
        /// Human-readable detail
        message: String,
    },

    /// Live session failure
    #[error("live session error ({kind})")]
    Live {
        /// Failure classification
        kind: LiveErrorKind,
    },

    /// A tool handler raised or returned an error
    #[error("tool error for call {call_id}: {message}")]
    Tool {
        /// Id of the function call that failed
        call_id: String,
        /// Captured handler error
        message: String,
    },

    /// The tool-calling orchestrator exhausted its turn limit
    #[error("turn limit of {limit} exceeded")]
    TurnLimitExceeded {
        /// The limit that was hit
        limit: u32,
    },

    /// Pre-flight shape/validation failure on caller input
    #[error("invalid input: {0}")]
    Validation(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A blocking operation hit its deadline
    #[error("request timeout")]
    Timeout,
}

impl Error {
    /// Create a new auth error
    pub fn auth(source_kind: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Auth {
            source_kind: source_kind.into(),
            message: message.into(),
        }
    }

    /// Create an HTTP error from a status and raw body, pulling `error.message`
    /// out of the body when the server sent the standard error envelope.
    pub fn http(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| {
                v.get("error")?
                    .get("message")?
                    .as_str()
                    .map(|s| s.to_string())
            })
            .unwrap_or_else(|| format!("status {status}"));
        Error::Http {
            status,
            message,
            body,
        }
    }

    /// Create a rate-limited error without quota details
    pub fn rate_limited(retry_after: Duration) -> Self {
        Error::RateLimited {
            retry_after,
            quota_metric: None,
            quota_id: None,
        }
    }

    /// Create a budget-blocked error
    pub fn budget(reason: BudgetBlockedReason, retry_after: Option<Duration>) -> Self {
        Error::Budget {
            reason,
            retry_after,
        }
    }

    /// Create a new stream error
    pub fn stream(kind: StreamErrorKind, attempt: u32, message: impl Into<String>) -> Self {
        Error::Stream {
            kind,
            attempt,
            message: message.into(),
        }
    }

    /// Create a new live session error
    pub fn live(kind: LiveErrorKind) -> Self {
        Error::Live { kind }
    }

    /// Create a new tool error
    pub fn tool(call_id: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            call_id: call_id.into(),
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a timeout error
    pub fn timeout() -> Self {
        Error::Timeout
    }

    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Http { status, .. } => Some(*status),
            Error::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Whether a retry could plausibly succeed.
    ///
    /// Rate-limit and 5xx/transport failures are transient; validation, auth,
    /// and 4xx failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::RateLimited { .. } => true,
            Error::Transport(_) => true,
            Error::Timeout => true,
            Error::Http { status, .. } => *status >= 500,
            Error::Stream { kind, .. } => matches!(
                kind,
                StreamErrorKind::Connect | StreamErrorKind::UpstreamClosed
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_auth() {
        let err = Error::auth("key_file", "file not found");
        assert!(matches!(err, Error::Auth { .. }));
        assert_eq!(err.to_string(), "auth error (key_file): file not found");
    }

    #[test]
    fn test_error_http_parses_envelope() {
        let body =
            r#"{"error":{"code":400,"message":"Invalid argument","status":"INVALID_ARGUMENT"}}"#;
        let err = Error::http(400, body);
        match &err {
            Error::Http {
                status, message, ..
            } => {
                assert_eq!(*status, 400);
                assert_eq!(message, "Invalid argument");
            }
            other => panic!("expected Http, got {other:?}"),
        }
        assert_eq!(err.status(), Some(400));
    }

    #[test]
    fn test_error_http_opaque_body() {
        let err = Error::http(502, "<html>bad gateway</html>");
        match &err {
            Error::Http { message, body, .. } => {
                assert_eq!(message, "status 502");
                assert!(body.contains("bad gateway"));
            }
            other => panic!("expected Http, got {other:?}"),
        }
    }

    #[test]
    fn test_error_budget_display() {
        let err = Error::budget(BudgetBlockedReason::OverBudget, None);
        assert_eq!(err.to_string(), "budget blocked (over_budget)");
    }

    #[test]
    fn test_error_stream() {
        let err = Error::stream(StreamErrorKind::Parse, 1, "bad chunk");
        assert!(matches!(
            err,
            Error::Stream {
                kind: StreamErrorKind::Parse,
                ..
            }
        ));
        assert_eq!(
            err.to_string(),
            "stream error (parse) on attempt 1: bad chunk"
        );
    }

    #[test]
    fn test_error_live_closed() {
        let err = Error::live(LiveErrorKind::Closed {
            code: 1008,
            reason: "policy".to_string(),
        });
        assert_eq!(err.to_string(), "live session error (closed(1008: policy))");
    }

    #[test]
    fn test_error_tool() {
        let err = Error::tool("call-1", "boom");
        assert_eq!(err.to_string(), "tool error for call call-1: boom");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::timeout().is_retryable());
        assert!(Error::rate_limited(Duration::from_secs(2)).is_retryable());
        assert!(Error::http(503, "").is_retryable());
        assert!(!Error::http(400, "").is_retryable());
        assert!(!Error::validation("bad").is_retryable());
        assert!(!Error::auth("adc", "no file").is_retryable());
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_result_type_alias() {
        fn _returns_result() -> Result<i32> {
            Ok(42)
        }

        fn _returns_error() -> Result<i32> {
            Err(Error::timeout())
        }
    }
}
