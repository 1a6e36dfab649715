//! In-memory transport that replays a script
//!
//! Every INVITE handed to a [`ScriptedTransport`] gets the same scripted
//! answer: a list of responses, failures or a stream close, each due a
//! fixed delay after the send. Everything sent is recorded so tests can
//! count BYEs and CANCELs. Pairs well with `#[tokio::test(start_paused = true)]`.
//!
//! ```rust
//! use std::time::Duration;
//! use sipdial_call_core::{ScriptStep, ScriptedTransport};
//!
//! // 180 right away, 200 two seconds after the INVITE
//! let transport = ScriptedTransport::new(vec![
//!     ScriptStep::respond(Duration::ZERO, 180, "Ringing"),
//!     ScriptStep::respond(Duration::from_secs(2), 200, "OK"),
//! ]);
//! # drop(transport);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::dialog::DialogInfo;
use crate::request::{Method, OutboundRequest};
use crate::response::SipResponse;

use super::{DialogTransport, ResponseStream, TransportError, TransportResult};

/// Tag the scripted peer puts on its To header
pub const SCRIPTED_REMOTE_TAG: &str = "scripted";

/// One scripted event, due `after` the INVITE was sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    Respond { after: Duration, status: u16, reason: String },
    Fail { after: Duration, cause: TransportError },
    /// End the response stream
    Close { after: Duration },
}

impl ScriptStep {
    pub fn respond(after: Duration, status: u16, reason: impl Into<String>) -> Self {
        ScriptStep::Respond {
            after,
            status,
            reason: reason.into(),
        }
    }

    pub fn fail(after: Duration, cause: TransportError) -> Self {
        ScriptStep::Fail { after, cause }
    }

    pub fn close(after: Duration) -> Self {
        ScriptStep::Close { after }
    }

    pub fn after(&self) -> Duration {
        match self {
            ScriptStep::Respond { after, .. } | ScriptStep::Fail { after, .. } | ScriptStep::Close { after } => *after,
        }
    }
}

/// A request the transport was asked to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRequest {
    pub method: Method,
    pub call_id: String,
    pub at: Instant,
}

/// Scripted peer for tests and demos
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: Vec<ScriptStep>,
    send_delay: Duration,
    send_failure: Option<TransportError>,
    bye_failure: Option<TransportError>,
    sent: Mutex<Vec<SentRequest>>,
    discarded: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<ScriptStep>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    /// Peer that never answers
    pub fn silent() -> Self {
        Self::default()
    }

    /// Peer that answers `200 OK` immediately
    pub fn answering() -> Self {
        Self::new(vec![ScriptStep::respond(Duration::ZERO, 200, "OK")])
    }

    /// Take `delay` to hand each INVITE over
    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }

    /// Fail every INVITE send with `error`
    pub fn with_send_failure(mut self, error: TransportError) -> Self {
        self.send_failure = Some(error);
        self
    }

    /// Fail every BYE with `error`
    pub fn with_bye_failure(mut self, error: TransportError) -> Self {
        self.bye_failure = Some(error);
        self
    }

    /// Everything sent so far, in order
    pub fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().clone()
    }

    pub fn count(&self, method: Method) -> usize {
        self.sent.lock().iter().filter(|r| r.method == method).count()
    }

    /// Scripted responses nobody was listening for anymore
    pub fn discarded(&self) -> usize {
        self.discarded.load(Ordering::SeqCst)
    }

    fn record(&self, method: Method, call_id: &str) {
        self.sent.lock().push(SentRequest {
            method,
            call_id: call_id.to_string(),
            at: Instant::now(),
        });
    }
}

fn scripted_response(request: &OutboundRequest, status: u16, reason: &str) -> SipResponse {
    let to = if status > 100 {
        format!("{};tag={}", request.to_header(), SCRIPTED_REMOTE_TAG)
    } else {
        request.to_header()
    };

    let response = SipResponse::new(status, reason)
        .with_header("Call-ID", request.call_id())
        .with_header("From", request.from_header())
        .with_header("To", to)
        .with_header("CSeq", format!("{} {}", request.cseq(), Method::Invite));

    if (200..300).contains(&status) {
        response.with_header("Contact", format!("<{}>", request.target()))
    } else {
        response
    }
}

#[async_trait]
impl DialogTransport for ScriptedTransport {
    async fn send(&self, request: &OutboundRequest) -> TransportResult<ResponseStream> {
        if !self.send_delay.is_zero() {
            tokio::time::sleep(self.send_delay).await;
        }
        self.record(Method::Invite, request.call_id());

        if let Some(error) = &self.send_failure {
            return Err(error.clone());
        }

        let sent_at = Instant::now();
        let script = self.script.clone();
        let request = request.clone();
        let discarded = self.discarded.clone();
        let (tx, rx) = mpsc::channel(script.len().max(1));

        tokio::spawn(async move {
            for step in script {
                tokio::time::sleep_until(sent_at + step.after()).await;
                let item = match step {
                    ScriptStep::Respond { status, reason, .. } => Ok(scripted_response(&request, status, &reason)),
                    ScriptStep::Fail { cause, .. } => Err(cause),
                    ScriptStep::Close { .. } => return,
                };
                if tx.send(item).await.is_err() {
                    debug!(call_id = request.call_id(), "Scripted response discarded");
                    discarded.fetch_add(1, Ordering::SeqCst);
                }
            }
            // Keep the stream open like a peer that stopped talking
            tx.closed().await;
        });

        Ok(rx)
    }

    async fn send_in_dialog(&self, dialog: &DialogInfo, method: Method) -> TransportResult<()> {
        self.record(method, &dialog.call_id);
        match (&self.bye_failure, method) {
            (Some(error), Method::Bye) => Err(error.clone()),
            _ => Ok(()),
        }
    }

    async fn cancel(&self, request: &OutboundRequest) -> TransportResult<()> {
        self.record(Method::Cancel, request.call_id());
        Ok(())
    }
}
