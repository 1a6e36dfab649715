//! Call-and-return façade
//!
//! [`CallSession::run`] places one call, keeps it up for the hold duration
//! (or until the stop signal fires) and always hangs up before returning.
//!
//! ```text
//! run() ──► RequestBuilder ──► DialogController::place ──┬─► Ended(outcome) ─────────────► outcome
//!                                                        └─► Established(handle)
//!                                                              │ hold / stop
//!                                                              ▼
//!                                                           handle.close() (BYE) ─────────► Connected
//! ```
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sipdial_call_core::{CallIdentity, CallSession, Endpoint, TransportConfig, UdpTransport};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = UdpTransport::bind(&TransportConfig::new("100.73.40.116", 5081)).await?;
//! let local = transport.advertised_endpoint().clone();
//! let target = Endpoint::new("08821670000", "100.81.118.20", 5080)?;
//! let identity = CallIdentity::new("Empresa XYZ", "4833800000");
//!
//! let mut session = CallSession::new(Arc::new(transport))
//!     .with_hold_duration(Duration::from_secs(30));
//! let outcome = session.run(&target, &local, &identity, Duration::from_secs(60)).await?;
//! println!("call finished: {}", outcome);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use crate::config::{CallConfig, DEFAULT_HOLD_DURATION};
use crate::dialog::{DialAttempt, DialogController};
use crate::endpoint::Endpoint;
use crate::error::CallResult;
use crate::events::{event_channel, CallEvent, ResponseObserver};
use crate::outcome::CallOutcome;
use crate::request::{CallIdentity, RequestBuilder};
use crate::response::ResponseClassifier;
use crate::transport::DialogTransport;

/// Places one call at a time over a transport
///
/// `run` borrows the session mutably, so a session never has more than one
/// attempt in flight. Concurrent calls need independent sessions.
pub struct CallSession {
    transport: Arc<dyn DialogTransport>,
    observer: Option<Arc<dyn ResponseObserver>>,
    events: broadcast::Sender<CallEvent>,
    hold: Duration,
    stop: CancellationToken,
}

impl CallSession {
    /// Session with the default hold duration and a fresh stop token
    pub fn new(transport: Arc<dyn DialogTransport>) -> Self {
        let (events, _) = event_channel();
        Self {
            transport,
            observer: None,
            events,
            hold: DEFAULT_HOLD_DURATION,
            stop: CancellationToken::new(),
        }
    }

    /// Observer invoked for every response while dialing
    pub fn with_observer(mut self, observer: Arc<dyn ResponseObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// How long an answered call is kept up before the BYE
    pub fn with_hold_duration(mut self, hold: Duration) -> Self {
        self.hold = hold;
        self
    }

    /// Tie the session to an owning context's cancellation
    pub fn with_stop_token(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    pub fn hold_duration(&self) -> Duration {
        self.hold
    }

    /// Token that stops the session: cancels a pending INVITE or hangs up an
    /// answered call. Stopping is permanent for this session.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Lifecycle events of every attempt made through this session
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Place a call and return its outcome
    ///
    /// Only request construction can fail (`InvalidEndpoint`,
    /// `InvalidHeader`), and it fails before anything is sent. Every other
    /// result is a [`CallOutcome`]. A `Connected` call has been hung up by
    /// the time this returns; if the future is dropped while the call is
    /// up, the dialog handle sends the BYE on drop.
    pub async fn run(
        &mut self,
        target: &Endpoint,
        local: &Endpoint,
        identity: &CallIdentity,
        timeout: Duration,
    ) -> CallResult<CallOutcome> {
        self.run_with_hold(target, local, identity, timeout, self.hold).await
    }

    async fn run_with_hold(
        &mut self,
        target: &Endpoint,
        local: &Endpoint,
        identity: &CallIdentity,
        timeout: Duration,
        hold: Duration,
    ) -> CallResult<CallOutcome> {
        let request = RequestBuilder::from_identity(target, local, identity)?;
        let span = info_span!("outbound_call", call_id = %request.call_id(), target = %target);

        async {
            let mut classifier = ResponseClassifier::new(self.events.clone());
            if let Some(observer) = &self.observer {
                classifier = classifier.with_observer(observer.clone());
            }
            let controller = DialogController::new(self.transport.clone(), classifier, self.events.clone());

            let handle = match controller.place(request, timeout, &self.stop).await {
                DialAttempt::Established(handle) => handle,
                DialAttempt::Ended(outcome) => return Ok(outcome),
            };

            info!(hold_ms = hold.as_millis() as u64, "Keeping call up");
            tokio::select! {
                _ = tokio::time::sleep(hold) => debug!("Hold duration elapsed"),
                _ = self.stop.cancelled() => info!("Stop requested; hanging up"),
            }

            let outcome = handle.outcome().clone();
            let termination = handle.close().await;
            info!(?termination, %outcome, "Call terminated");

            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    /// Run the call described by a configuration
    ///
    /// The From identity uses `local`, normally the transport's advertised
    /// endpoint. The configured hold replaces the session's hold duration for
    /// this call.
    pub async fn run_config(&mut self, config: &CallConfig, local: &Endpoint) -> CallResult<CallOutcome> {
        config.validate()?;
        let identity = config.call.identity();
        self.run_with_hold(
            &config.call.target,
            local,
            &identity,
            config.call.timeout(),
            config.call.hold(),
        )
        .await
    }
}

impl fmt::Debug for CallSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSession")
            .field("hold", &self.hold)
            .field("has_observer", &self.observer.is_some())
            .field("stopped", &self.stop.is_cancelled())
            .finish()
    }
}
