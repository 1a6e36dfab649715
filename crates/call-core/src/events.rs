//! Call events and the response observer seam
//!
//! Two side channels leave the controller:
//!
//! - [`ResponseObserver`]: a caller-supplied callback invoked once per
//!   received response, in arrival order. Its failures are reported, never
//!   propagated.
//! - [`CallEvent`]: lifecycle notifications published on a broadcast
//!   channel. Nobody is required to listen.
//!
//! # Examples
//!
//! ```rust
//! use async_trait::async_trait;
//! use sipdial_call_core::{ObserverError, ResponseObserver, SipResponse};
//!
//! struct AnsweredLogger;
//!
//! #[async_trait]
//! impl ResponseObserver for AnsweredLogger {
//!     async fn on_response(&self, response: &SipResponse) -> Result<(), ObserverError> {
//!         if response.status() == 200 {
//!             println!("call answered: {}", response.reason());
//!         }
//!         Ok(())
//!     }
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::dialog::DialogState;
use crate::outcome::CallOutcome;
use crate::response::SipResponse;

/// Capacity of the lifecycle event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Error returned by a [`ResponseObserver`]
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ObserverError {
    pub message: String,
}

impl ObserverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Callback invoked for every response received while dialing
///
/// Implementations should return quickly: a call is bounded by the attempt
/// deadline and abandoned when it runs over.
#[async_trait]
pub trait ResponseObserver: Send + Sync {
    async fn on_response(&self, response: &SipResponse) -> Result<(), ObserverError>;
}

/// Observer that forwards every response into an mpsc sink
///
/// A closed or full sink is an observer failure like any other.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sink: mpsc::Sender<SipResponse>,
}

impl ChannelObserver {
    pub fn new(sink: mpsc::Sender<SipResponse>) -> Self {
        Self { sink }
    }

    /// Observer plus the receiving half of a fresh channel
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SipResponse>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl ResponseObserver for ChannelObserver {
    async fn on_response(&self, response: &SipResponse) -> Result<(), ObserverError> {
        self.sink
            .try_send(response.clone())
            .map_err(|e| ObserverError::new(format!("response sink unavailable: {}", e)))
    }
}

/// Lifecycle events published by the controller and the session
#[derive(Debug, Clone, Serialize)]
pub enum CallEvent {
    /// Dialog state machine moved
    StateChanged {
        call_id: String,
        previous: DialogState,
        current: DialogState,
        timestamp: DateTime<Utc>,
    },

    /// Any response received while dialing
    ResponseReceived {
        call_id: String,
        status: u16,
        reason: String,
    },

    /// Final 2xx received; the dialog is up
    Connected {
        call_id: String,
        status: u16,
        reason: String,
    },

    /// The observer failed or panicked on a response
    ObserverFailed {
        call_id: String,
        status: u16,
        error: String,
    },

    /// BYE or CANCEL could not be delivered
    TeardownFailed {
        call_id: String,
        method: String,
        error: String,
    },

    /// The attempt resolved
    CallEnded {
        call_id: String,
        outcome: CallOutcome,
    },
}

impl CallEvent {
    /// Call-ID the event belongs to
    pub fn call_id(&self) -> &str {
        match self {
            CallEvent::StateChanged { call_id, .. }
            | CallEvent::ResponseReceived { call_id, .. }
            | CallEvent::Connected { call_id, .. }
            | CallEvent::ObserverFailed { call_id, .. }
            | CallEvent::TeardownFailed { call_id, .. }
            | CallEvent::CallEnded { call_id, .. } => call_id,
        }
    }
}

/// Fresh event channel with the default capacity
pub fn event_channel() -> (broadcast::Sender<CallEvent>, broadcast::Receiver<CallEvent>) {
    broadcast::channel(DEFAULT_EVENT_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_observer_forwards_in_order() {
        let (observer, mut rx) = ChannelObserver::channel(4);

        observer.on_response(&SipResponse::new(180, "Ringing")).await.unwrap();
        observer.on_response(&SipResponse::new(200, "OK")).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().status(), 180);
        assert_eq!(rx.recv().await.unwrap().status(), 200);
    }

    #[tokio::test]
    async fn test_channel_observer_reports_closed_sink() {
        let (observer, rx) = ChannelObserver::channel(1);
        drop(rx);

        let err = observer.on_response(&SipResponse::new(200, "OK")).await.unwrap_err();
        assert!(err.message.contains("sink"));
    }
}
