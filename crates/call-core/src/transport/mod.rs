//! Transport seam
//!
//! The call core never touches sockets. It hands an [`OutboundRequest`] to a
//! [`DialogTransport`] and reads responses from the returned
//! [`ResponseStream`]. Framing, address resolution and ACK generation live
//! behind this trait.
//!
//! Two implementations ship with the crate:
//!
//! - [`UdpTransport`]: plain SIP over UDP with Contact/Via rewriting
//! - [`ScriptedTransport`]: in-memory peer replaying a script, for tests and demos

pub mod message;
pub mod scripted;
pub mod udp;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::dialog::DialogInfo;
use crate::request::{Method, OutboundRequest};
use crate::response::SipResponse;

pub use scripted::{ScriptStep, ScriptedTransport, SentRequest};
pub use udp::UdpTransport;

/// Responses (or delivery failures) for one INVITE, in arrival order
pub type ResponseStream = mpsc::Receiver<Result<SipResponse, TransportError>>;

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors raised by a transport
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Socket level failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Destination could not be resolved
    #[error("Failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    /// Received bytes are not a SIP message
    #[error("Parse error: {0}")]
    Parse(String),

    /// Request could not be assembled into a SIP message
    #[error("Failed to encode {method}: {reason}")]
    Encode { method: String, reason: String },

    /// Transport was closed
    #[error("Transport closed")]
    Closed,

    /// Request could not be sent
    #[error("Failed to send {method}: {reason}")]
    Send { method: String, reason: String },
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// Underlying signalling transport consumed by the dialog controller
#[async_trait]
pub trait DialogTransport: Send + Sync {
    /// Send a dialog-initiating request and return its response stream
    ///
    /// The stream ends after the final response, or earlier on failure.
    async fn send(&self, request: &OutboundRequest) -> TransportResult<ResponseStream>;

    /// Send a request inside an established dialog (BYE)
    async fn send_in_dialog(&self, dialog: &DialogInfo, method: Method) -> TransportResult<()>;

    /// Abandon a pending INVITE that has no final response yet
    async fn cancel(&self, _request: &OutboundRequest) -> TransportResult<()> {
        Ok(())
    }
}
