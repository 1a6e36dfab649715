//! Deadline-bounded dialog establishment
//!
//! One [`DialogController`] drives one INVITE. The send, the deadline, the
//! caller's stop signal and the response stream all race inside a single
//! loop, so the state machine has exactly one writer. Priority when several
//! are ready in the same poll: stop signal, then deadline, then responses.
//! The response observer runs inside the same race, so a stuck observer
//! cannot hold off the stop signal. When the loop exits the response stream is dropped and anything that
//! arrives later is discarded by the transport.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handle::{DialogHandle, DialogInfo, TEARDOWN_SEND_TIMEOUT};
use super::state::{DialogState, DialogStateCell};
use crate::events::CallEvent;
use crate::outcome::CallOutcome;
use crate::request::{Method, OutboundRequest};
use crate::response::{ResponseClass, ResponseClassifier, SipResponse};
use crate::transport::DialogTransport;

/// Result of [`DialogController::place`]
#[derive(Debug)]
pub enum DialAttempt {
    /// 2xx received; the handle owns the dialog and its BYE
    Established(DialogHandle),
    /// The attempt ended without a dialog
    Ended(CallOutcome),
}

impl DialAttempt {
    pub fn outcome(&self) -> &CallOutcome {
        match self {
            DialAttempt::Established(handle) => handle.outcome(),
            DialAttempt::Ended(outcome) => outcome,
        }
    }

    pub fn into_handle(self) -> Option<DialogHandle> {
        match self {
            DialAttempt::Established(handle) => Some(handle),
            DialAttempt::Ended(_) => None,
        }
    }
}

/// Drives one outbound dialog from `Idle` to a terminal outcome
pub struct DialogController {
    transport: Arc<dyn DialogTransport>,
    classifier: ResponseClassifier,
    events: broadcast::Sender<CallEvent>,
}

impl DialogController {
    pub fn new(
        transport: Arc<dyn DialogTransport>,
        classifier: ResponseClassifier,
        events: broadcast::Sender<CallEvent>,
    ) -> Self {
        Self {
            transport,
            classifier,
            events,
        }
    }

    /// Send `request` and wait at most `timeout` for a final response
    ///
    /// Consumes the controller: one controller, one attempt. The deadline
    /// covers the send itself. If `stop` is already cancelled nothing is
    /// sent. On `TimedOut` or `Cancelled` a best-effort CANCEL is issued for
    /// the pending INVITE; no BYE is ever sent from here.
    pub async fn place(
        self,
        request: OutboundRequest,
        timeout: Duration,
        stop: &CancellationToken,
    ) -> DialAttempt {
        let call_id = request.call_id().to_string();
        let state = Arc::new(DialogStateCell::new(call_id.clone(), self.events.clone()));
        let deadline = Instant::now() + timeout;

        if stop.is_cancelled() {
            info!(call_id = %call_id, "Stop requested before the INVITE was sent");
            state.transition(DialogState::Dialing);
            return self.fail(&state, &request, CallOutcome::Cancelled, false).await;
        }

        state.transition(DialogState::Dialing);
        info!(
            call_id = %call_id,
            target = %request.target(),
            timeout_ms = timeout.as_millis() as u64,
            "Placing call"
        );

        let mut responses = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                return self.fail(&state, &request, CallOutcome::Cancelled, true).await;
            }
            _ = tokio::time::sleep_until(deadline) => {
                return self.fail(&state, &request, CallOutcome::TimedOut, true).await;
            }
            sent = self.transport.send(&request) => match sent {
                Ok(stream) => stream,
                Err(e) => {
                    let outcome = CallOutcome::TransportError { cause: e.to_string() };
                    return self.fail(&state, &request, outcome, false).await;
                }
            },
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    return self.fail(&state, &request, CallOutcome::Cancelled, true).await;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return self.fail(&state, &request, CallOutcome::TimedOut, true).await;
                }
                next = responses.recv() => next,
            };

            let response = match next {
                Some(Ok(response)) => response,
                Some(Err(e)) => {
                    let outcome = CallOutcome::TransportError { cause: e.to_string() };
                    return self.fail(&state, &request, outcome, false).await;
                }
                None => {
                    let outcome = CallOutcome::TransportError {
                        cause: "response stream closed before a final response".to_string(),
                    };
                    return self.fail(&state, &request, outcome, false).await;
                }
            };

            let class = tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    return self.stop_during_observer(&state, &request, &response).await;
                }
                class = self.classifier.observe(&call_id, &response, deadline) => class,
            };

            match class {
                ResponseClass::Interim => {
                    debug!(call_id = %call_id, status = response.status(), "Provisional response");
                }
                ResponseClass::Success => return self.establish(state, &request, &response),
                ResponseClass::Failure => {
                    let outcome = CallOutcome::Rejected {
                        status: response.status(),
                        reason: response.reason().to_string(),
                    };
                    return self.fail(&state, &request, outcome, false).await;
                }
            }
        }
    }

    fn establish(self, state: Arc<DialogStateCell>, request: &OutboundRequest, response: &SipResponse) -> DialAttempt {
        let info = DialogInfo::from_success(request, response);
        state.transition(DialogState::Established);

        info!(
            call_id = %info.call_id,
            status = response.status(),
            reason = response.reason(),
            "Call answered"
        );

        let outcome = CallOutcome::Connected {
            status: response.status(),
            reason: response.reason().to_string(),
        };
        let _ = self.events.send(CallEvent::Connected {
            call_id: info.call_id.clone(),
            status: response.status(),
            reason: response.reason().to_string(),
        });

        DialAttempt::Established(DialogHandle::new(info, outcome, state, self.transport, self.events))
    }

    async fn fail(
        &self,
        state: &DialogStateCell,
        request: &OutboundRequest,
        outcome: CallOutcome,
        cancel_pending: bool,
    ) -> DialAttempt {
        state.transition(DialogState::Failed);

        if cancel_pending {
            self.cancel_pending(request).await;
        }

        info!(call_id = request.call_id(), %outcome, "Call attempt ended without a dialog");
        let _ = self.events.send(CallEvent::CallEnded {
            call_id: request.call_id().to_string(),
            outcome: outcome.clone(),
        });

        DialAttempt::Ended(outcome)
    }

    // The peer may already consider a 2xx dialog up; hang it up before
    // reporting Cancelled.
    async fn stop_during_observer(
        &self,
        state: &DialogStateCell,
        request: &OutboundRequest,
        response: &SipResponse,
    ) -> DialAttempt {
        if response.class() != ResponseClass::Success {
            return self.fail(state, request, CallOutcome::Cancelled, true).await;
        }

        info!(call_id = request.call_id(), "Stop requested while handling the answer; hanging up");
        let info = DialogInfo::from_success(request, response);
        let result = tokio::time::timeout(TEARDOWN_SEND_TIMEOUT, self.transport.send_in_dialog(&info, Method::Bye)).await;
        let error = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some("timed out handing BYE to the transport".to_string()),
        };
        if let Some(error) = error {
            warn!(call_id = request.call_id(), %error, "Failed to hang up answered call");
            let _ = self.events.send(CallEvent::TeardownFailed {
                call_id: request.call_id().to_string(),
                method: Method::Bye.to_string(),
                error,
            });
        }

        self.fail(state, request, CallOutcome::Cancelled, false).await
    }

    async fn cancel_pending(&self, request: &OutboundRequest) {
        let result = tokio::time::timeout(TEARDOWN_SEND_TIMEOUT, self.transport.cancel(request)).await;
        let error = match result {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "timed out handing CANCEL to the transport".to_string(),
        };

        warn!(call_id = request.call_id(), %error, "Failed to cancel pending INVITE");
        let _ = self.events.send(CallEvent::TeardownFailed {
            call_id: request.call_id().to_string(),
            method: Method::Cancel.to_string(),
            error,
        });
    }
}
