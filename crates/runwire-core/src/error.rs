//! Error types for the runwire client.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A shared error type for the entire runwire client.
///
/// Transport- and auth-level failures are surfaced through this type.
/// Data-level anomalies (malformed, duplicate or late events) are never
/// errors; the reducer absorbs them and reports an `ApplyOutcome` instead.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientError {
    /// No bearer credential is available
    #[error("Authentication required")]
    AuthRequired,

    /// The credential was rejected or has expired
    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    /// Connection drop, timeout or other transport failure
    #[error("Transport error: {message}")]
    Transport { message: String, retryable: bool },

    /// Retry budget exhausted while (re)connecting
    #[error("Connection failed after {attempts} attempts")]
    ConnectionFailed { attempts: u32 },

    /// A send or run start was attempted while another is in flight
    #[error("Another operation is still running for session '{session_id}', try again when it completes")]
    ConcurrentOperationRejected { session_id: String },

    /// Non-success HTTP response
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Entity not found error with type information
    #[error("Entity not found: {entity_type} '{id}'")]
    NotFound { entity_type: String, id: String },

    /// Serialization/deserialization error
    #[error("Serialization error: {format} - {message}")]
    Serialization {
        format: String, // "TOML", "JSON", etc.
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClientError {
    // ============================================================================
    // Constructor helpers
    // ============================================================================

    /// Creates a retryable transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a transport error that must not be retried
    pub fn fatal_transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a NotFound error
    pub fn not_found(entity_type: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.to_string(),
            id: id.into(),
        }
    }

    /// Creates a ConcurrentOperationRejected error
    pub fn busy(session_id: impl Into<String>) -> Self {
        Self::ConcurrentOperationRejected {
            session_id: session_id.into(),
        }
    }

    /// Creates a Config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Creates an Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Maps an HTTP status and body to the message shown to the user.
    pub fn from_status(status: u16, details: impl Into<String>) -> Self {
        let details = details.into();
        match status {
            401 => Self::AuthExpired("Authentication failed. Please sign in again.".into()),
            403 => Self::AuthExpired("Access denied. Please check your permissions.".into()),
            _ => {
                let message = match status {
                    400 if details.is_empty() => {
                        "Bad Request: Invalid request format or parameters".to_string()
                    }
                    400 => format!("Bad Request: {details}"),
                    404 => "Chat not found. Please create a new chat.".to_string(),
                    429 => "Rate limit exceeded. Please wait a moment and try again.".to_string(),
                    500 if details.is_empty() => {
                        "Server error: The AI service is temporarily unavailable.".to_string()
                    }
                    500 => format!("Server error: {details}"),
                    502..=504 => {
                        "AI service is temporarily unavailable. Please try again in a moment."
                            .to_string()
                    }
                    _ => details,
                };
                Self::Http { status, message }
            }
        }
    }

    // ============================================================================
    // Type checking methods
    // ============================================================================

    /// Check if this is an authentication error (absent or rejected credential)
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthRequired | Self::AuthExpired(_))
    }

    /// Check if the operation may succeed when retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } => *retryable,
            Self::ConcurrentOperationRejected { .. } => true,
            Self::Http { status, .. } => matches!(status, 429 | 500 | 502 | 503 | 504),
            _ => false,
        }
    }

    /// Check if this error ends the current operation for good
    pub fn is_terminal(&self) -> bool {
        self.is_auth() || matches!(self, Self::ConnectionFailed { .. })
    }

    /// Check if this is a NotFound error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

// ============================================================================
// From implementations for automatic conversion
// ============================================================================

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(format!("{} (kind: {:?})", err, err.kind()))
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            format: "JSON".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for ClientError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization {
            format: "TOML".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for ClientError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

/// A type alias for `Result<T, ClientError>`.
pub type Result<T> = std::result::Result<T, ClientError>;
