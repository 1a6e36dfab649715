//! Error types for the call core
//!
//! Only problems detected *before* anything is put on the wire are errors.
//! Everything that happens once an INVITE is in flight (rejection, timeout,
//! transport failure, cancellation) is reported as a [`CallOutcome`](crate::CallOutcome).

use thiserror::Error;

use crate::transport::TransportError;

/// Result type for call-core operations
pub type CallResult<T> = Result<T, CallError>;

/// Errors that can occur while preparing an outbound call
#[derive(Debug, Error)]
pub enum CallError {
    /// Endpoint with an empty host or a port outside 1-65535
    #[error("Invalid endpoint: {message}")]
    InvalidEndpoint { message: String },

    /// Header that cannot be put on the wire
    #[error("Invalid header: {message}")]
    InvalidHeader { message: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Transport could not be set up
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl CallError {
    /// Create an invalid endpoint error
    pub fn invalid_endpoint(message: impl Into<String>) -> Self {
        Self::InvalidEndpoint {
            message: message.into(),
        }
    }

    /// Create an invalid header error
    pub fn invalid_header(message: impl Into<String>) -> Self {
        Self::InvalidHeader {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}
