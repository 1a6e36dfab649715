//! Established dialog handle
//!
//! A [`DialogHandle`] exists only for a dialog that reached `Established`.
//! It is a scoped guard: the BYE goes out exactly once, either through
//! [`DialogHandle::terminate`]/[`DialogHandle::close`] or, if the owner
//! drops the handle without closing it (early return, panic, task abort),
//! from a task spawned by `Drop`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::state::{DialogState, DialogStateCell};
use crate::endpoint::Endpoint;
use crate::events::CallEvent;
use crate::outcome::CallOutcome;
use crate::request::{Method, OutboundRequest};
use crate::response::{name_addr_tag, SipResponse};
use crate::transport::DialogTransport;

/// Upper bound on handing a BYE or CANCEL to the transport
pub(crate) const TEARDOWN_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Dialog identity learned from the 2xx response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogInfo {
    /// Call-ID shared by every request in the dialog
    pub call_id: String,
    /// From header value, with the local tag
    pub from: String,
    /// To header value, with the remote tag when the peer sent one
    pub to: String,
    /// Where in-dialog requests go: the 2xx Contact, else the original target
    pub remote_target: Endpoint,
    /// CSeq number of the INVITE
    pub invite_cseq: u32,
}

impl DialogInfo {
    /// Build the dialog identity from the INVITE and its 2xx
    pub fn from_success(request: &OutboundRequest, response: &SipResponse) -> Self {
        Self {
            call_id: request.call_id().to_string(),
            from: request.from_header(),
            to: response
                .header("To")
                .map(str::to_string)
                .unwrap_or_else(|| request.to_header()),
            remote_target: response.contact().unwrap_or_else(|| request.target().clone()),
            invite_cseq: request.cseq(),
        }
    }

    pub fn local_tag(&self) -> Option<String> {
        name_addr_tag(&self.from)
    }

    pub fn remote_tag(&self) -> Option<String> {
        name_addr_tag(&self.to)
    }
}

/// What a call to [`DialogHandle::terminate`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// This call sent the BYE
    Sent,
    /// This call tried to send the BYE and the transport failed; the dialog is closed locally
    SendFailed,
    /// The dialog was already terminating or closed; nothing sent
    AlreadyClosed,
}

/// Handle to an established outbound dialog
pub struct DialogHandle {
    info: DialogInfo,
    outcome: CallOutcome,
    state: Arc<DialogStateCell>,
    transport: Arc<dyn DialogTransport>,
    events: broadcast::Sender<CallEvent>,
}

impl DialogHandle {
    pub(crate) fn new(
        info: DialogInfo,
        outcome: CallOutcome,
        state: Arc<DialogStateCell>,
        transport: Arc<dyn DialogTransport>,
        events: broadcast::Sender<CallEvent>,
    ) -> Self {
        Self {
            info,
            outcome,
            state,
            transport,
            events,
        }
    }

    pub fn info(&self) -> &DialogInfo {
        &self.info
    }

    pub fn call_id(&self) -> &str {
        &self.info.call_id
    }

    /// The `Connected` outcome that established this dialog
    pub fn outcome(&self) -> &CallOutcome {
        &self.outcome
    }

    pub fn state(&self) -> DialogState {
        self.state.get()
    }

    /// Send the BYE, once
    ///
    /// Best-effort: a delivery failure is logged and the dialog still ends
    /// up `Closed`. Calling this again, concurrently or later, is a no-op.
    pub async fn terminate(&self) -> Termination {
        if !self.state.transition(DialogState::Terminating) {
            return Termination::AlreadyClosed;
        }

        send_bye(
            self.transport.as_ref(),
            &self.info,
            &self.outcome,
            &self.state,
            &self.events,
        )
        .await
    }

    /// Terminate if still up, then release the handle
    pub async fn close(self) -> Termination {
        self.terminate().await
    }
}

impl Drop for DialogHandle {
    fn drop(&mut self) {
        match self.state.get() {
            DialogState::Established => {
                if !self.state.transition(DialogState::Terminating) {
                    return;
                }

                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        warn!(call_id = %self.info.call_id, "Dialog handle dropped while established; sending BYE");
                        let transport = self.transport.clone();
                        let info = self.info.clone();
                        let outcome = self.outcome.clone();
                        let state = self.state.clone();
                        let events = self.events.clone();
                        runtime.spawn(async move {
                            send_bye(transport.as_ref(), &info, &outcome, &state, &events).await;
                        });
                    }
                    Err(_) => {
                        warn!(call_id = %self.info.call_id, "Dialog handle dropped outside a runtime; BYE not sent");
                        finish(&self.info, &self.outcome, &self.state, &self.events);
                    }
                }
            }
            // A terminate() future was dropped mid-send; the BYE may already
            // be on the wire, so never send a second one.
            DialogState::Terminating => finish(&self.info, &self.outcome, &self.state, &self.events),
            _ => {}
        }
    }
}

impl fmt::Debug for DialogHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialogHandle")
            .field("info", &self.info)
            .field("state", &self.state.get())
            .finish()
    }
}

async fn send_bye(
    transport: &dyn DialogTransport,
    info: &DialogInfo,
    outcome: &CallOutcome,
    state: &DialogStateCell,
    events: &broadcast::Sender<CallEvent>,
) -> Termination {
    let result = tokio::time::timeout(TEARDOWN_SEND_TIMEOUT, transport.send_in_dialog(info, Method::Bye)).await;

    let error = match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some("timed out handing BYE to the transport".to_string()),
    };

    let termination = match error {
        None => {
            info!(call_id = %info.call_id, target = %info.remote_target, "BYE sent");
            Termination::Sent
        }
        Some(error) => {
            warn!(call_id = %info.call_id, %error, "Failed to send BYE; closing dialog locally");
            let _ = events.send(CallEvent::TeardownFailed {
                call_id: info.call_id.clone(),
                method: Method::Bye.to_string(),
                error,
            });
            Termination::SendFailed
        }
    };

    finish(info, outcome, state, events);
    termination
}

fn finish(
    info: &DialogInfo,
    outcome: &CallOutcome,
    state: &DialogStateCell,
    events: &broadcast::Sender<CallEvent>,
) {
    if state.transition(DialogState::Closed) {
        let _ = events.send(CallEvent::CallEnded {
            call_id: info.call_id.clone(),
            outcome: outcome.clone(),
        });
    }
}
