//! Result of one call attempt

use std::fmt;

use serde::{Deserialize, Serialize};

/// How a call attempt resolved
///
/// Every attempt resolves to exactly one of these. Rejections, timeouts and
/// transport failures are expected results, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallOutcome {
    /// Final 2xx received before the deadline
    Connected { status: u16, reason: String },
    /// Final non-2xx received before the deadline
    Rejected { status: u16, reason: String },
    /// No final response before the deadline
    TimedOut,
    /// The transport failed to send or deliver responses
    TransportError { cause: String },
    /// The caller's stop signal fired before a final response
    Cancelled,
}

impl CallOutcome {
    pub fn is_connected(&self) -> bool {
        matches!(self, CallOutcome::Connected { .. })
    }

    /// Status code of the final response, if one was received
    pub fn status(&self) -> Option<u16> {
        match self {
            CallOutcome::Connected { status, .. } | CallOutcome::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether a retry could plausibly succeed
    ///
    /// Transport failures and timeouts are worth retrying; an explicit
    /// rejection or a caller stop is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            CallOutcome::TransportError { .. } | CallOutcome::TimedOut => true,
            CallOutcome::Rejected { status, .. } => matches!(status, 408 | 480 | 500 | 503 | 504),
            CallOutcome::Connected { .. } | CallOutcome::Cancelled => false,
        }
    }
}

impl fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallOutcome::Connected { status, reason } => write!(f, "connected ({} {})", status, reason),
            CallOutcome::Rejected { status, reason } => write!(f, "rejected ({} {})", status, reason),
            CallOutcome::TimedOut => f.write_str("timed out"),
            CallOutcome::TransportError { cause } => write!(f, "transport error: {}", cause),
            CallOutcome::Cancelled => f.write_str("cancelled"),
        }
    }
}
