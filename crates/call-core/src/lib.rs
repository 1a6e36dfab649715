//! # sipdial call core
//!
//! Lifecycle controller for a single outbound SIP call: build an INVITE
//! with an asserted caller identity, wait a bounded time for the dialog to
//! come up, and guarantee the BYE on the way out.
//!
//! ## Layers
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ CallSession        place, hold, hang up      │
//! ├──────────────────────────────────────────────┤
//! │ DialogController   deadline, stop, outcome   │
//! │ ResponseClassifier observer + 1xx/2xx/other  │
//! │ DialogHandle       exactly-once BYE          │
//! ├──────────────────────────────────────────────┤
//! │ RequestBuilder     INVITE + identity headers │
//! ├──────────────────────────────────────────────┤
//! │ DialogTransport    UdpTransport / Scripted   │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sipdial_call_core::{CallIdentity, CallOutcome, CallSession, Endpoint, ScriptedTransport};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(ScriptedTransport::answering());
//! let local = Endpoint::host_port("127.0.0.1", 5081)?;
//! let target = Endpoint::new("bob", "127.0.0.1", 5080)?;
//!
//! let mut session = CallSession::new(transport.clone()).with_hold_duration(Duration::ZERO);
//! let outcome = session
//!     .run(&target, &local, &CallIdentity::new("Alice", "1000"), Duration::from_secs(5))
//!     .await?;
//!
//! assert!(matches!(outcome, CallOutcome::Connected { status: 200, .. }));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dialog;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod outcome;
pub mod request;
pub mod response;
pub mod session;
pub mod transport;

pub use config::{
    CallConfig, CallSettings, TransportConfig, TransportProtocol, DEFAULT_CALL_TIMEOUT, DEFAULT_CANCEL_LINGER,
    DEFAULT_HOLD_DURATION, DEFAULT_USER_AGENT,
};
pub use dialog::{DialAttempt, DialogController, DialogHandle, DialogInfo, DialogState, Termination};
pub use endpoint::{Endpoint, DEFAULT_SIP_PORT};
pub use error::{CallError, CallResult};
pub use events::{event_channel, CallEvent, ChannelObserver, ObserverError, ResponseObserver};
pub use outcome::CallOutcome;
pub use request::{CallIdentity, FromIdentity, Header, IdentityHeaders, Method, OutboundRequest, RequestBuilder};
pub use response::{classify, ResponseClass, ResponseClassifier, SipResponse};
pub use session::CallSession;
pub use transport::{
    DialogTransport, ResponseStream, ScriptStep, ScriptedTransport, SentRequest, TransportError, TransportResult,
    UdpTransport,
};
