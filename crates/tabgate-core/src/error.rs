//! Gateway error taxonomy.
//!
//! Every user-visible failure in the core maps to exactly one [`ErrorKind`].
//! The stream coordinator is the only component that turns these into the
//! persisted error field; everything else just constructs and propagates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Categories of gateway failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing credentials, provider config, or model descriptor
    Setup,
    /// Credential validation probe denied by the provider
    Auth,
    /// Non-OK HTTP status on the streaming call
    Request,
    /// Network fault, broken connection, body read failure
    Transport,
    /// Malformed SSE or JSON on a stream line
    Parse,
    /// In-band error event sent by the provider mid-stream
    ProviderStream,
    /// User-initiated cancellation; a terminal state, not a failure
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Setup => "setup",
            ErrorKind::Auth => "auth",
            ErrorKind::Request => "request",
            ErrorKind::Transport => "transport",
            ErrorKind::Parse => "parse",
            ErrorKind::ProviderStream => "provider_stream",
            ErrorKind::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// Structured gateway error with kind and user-facing message.
#[derive(Debug, Clone)]
pub struct GatewayError {
    /// Error category
    pub kind: ErrorKind,
    /// One-line summary suitable for display
    pub message: String,
}

impl GatewayError {
    /// Creates a new gateway error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates a setup error with the standard user-facing prefix.
    pub fn setup(message: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::Setup,
            format!("API Request Setup Error: {message}"),
        )
    }

    /// Creates a request error carrying an already-extracted HTTP message.
    pub fn request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Request, message)
    }

    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for GatewayError {}

/// Result type for gateway operations.
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ProviderStream).unwrap();
        assert_eq!(json, r#""provider_stream""#);
    }

    #[test]
    fn test_setup_error_prefix() {
        let err = GatewayError::setup("no credentials for openai");
        assert_eq!(
            err.message,
            "API Request Setup Error: no credentials for openai"
        );
        assert_eq!(err.kind, ErrorKind::Setup);
    }
}
