//! Responses and their classification
//!
//! [`ResponseClassifier`] sits between the transport's response stream and
//! the dialog state machine. For every response it first notifies the
//! caller's observer (isolated: errors, panics and overruns are logged and
//! published, never propagated) and then tells the controller which kind
//! of transition, if any, the response triggers.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;

use futures::FutureExt;
use rvoip_sip_core::types::address::Address;
use rvoip_sip_core::types::cseq::CSeq;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::endpoint::Endpoint;
use crate::events::{CallEvent, ResponseObserver};
use crate::request::Header;

/// A SIP response as delivered by the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SipResponse {
    status: u16,
    reason: String,
    headers: Vec<Header>,
}

impl SipResponse {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            headers: Vec::new(),
        }
    }

    /// Append a header without validation; responses come off the wire as-is
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// First value of a header, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|h| h.is(name)).map(|h| h.value.as_str())
    }

    pub fn class(&self) -> ResponseClass {
        classify(self.status)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }

    /// Tag parameter of the To header
    pub fn to_tag(&self) -> Option<String> {
        self.header("To").and_then(name_addr_tag)
    }

    /// Contact URI as an endpoint, if present and parseable
    pub fn contact(&self) -> Option<Endpoint> {
        let address = Address::from_str(self.header("Contact")?).ok()?;
        Endpoint::try_from(&address.uri).ok()
    }

    /// CSeq number and method
    pub fn cseq(&self) -> Option<(u32, String)> {
        let cseq = CSeq::from_str(self.header("CSeq")?).ok()?;
        Some((cseq.seq, cseq.method.to_string()))
    }
}

impl fmt::Display for SipResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status, self.reason)
    }
}

/// `tag` parameter of a name-addr header value such as From or To
pub(crate) fn name_addr_tag(value: &str) -> Option<String> {
    let address = Address::from_str(value).ok()?;
    address.tag().map(str::to_string)
}

/// What a response means for the dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseClass {
    /// 1xx: provisional, no state change
    Interim,
    /// 2xx: dialog established
    Success,
    /// Everything else: definitive failure
    Failure,
}

impl ResponseClass {
    pub fn is_final(&self) -> bool {
        !matches!(self, ResponseClass::Interim)
    }
}

/// Map a status code to its class
///
/// 3xx-6xx are redirect/error ranges. Codes outside 100-699 are malformed
/// and treated as definitive failures so a broken peer cannot keep the
/// attempt dialing forever.
pub fn classify(status: u16) -> ResponseClass {
    match status {
        100..=199 => ResponseClass::Interim,
        200..=299 => ResponseClass::Success,
        _ => ResponseClass::Failure,
    }
}

/// Classifies responses and notifies the caller's observer
#[derive(Clone)]
pub struct ResponseClassifier {
    observer: Option<Arc<dyn ResponseObserver>>,
    events: broadcast::Sender<CallEvent>,
}

impl ResponseClassifier {
    pub fn new(events: broadcast::Sender<CallEvent>) -> Self {
        Self {
            observer: None,
            events,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ResponseObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn has_observer(&self) -> bool {
        self.observer.is_some()
    }

    /// Notify the observer, then classify
    ///
    /// The observer runs before the caller acts on the returned class and is
    /// cut off at `deadline`.
    pub async fn observe(&self, call_id: &str, response: &SipResponse, deadline: Instant) -> ResponseClass {
        let class = response.class();
        debug!(call_id, status = response.status(), ?class, "Response received");

        let _ = self.events.send(CallEvent::ResponseReceived {
            call_id: call_id.to_string(),
            status: response.status(),
            reason: response.reason().to_string(),
        });

        if let Some(observer) = &self.observer {
            let guarded = AssertUnwindSafe(observer.on_response(response)).catch_unwind();
            let failure = match tokio::time::timeout_at(deadline, guarded).await {
                Ok(Ok(Ok(()))) => None,
                Ok(Ok(Err(e))) => Some(e.to_string()),
                Ok(Err(panic)) => Some(format!("observer panicked: {}", panic_message(&panic))),
                Err(_) => Some("observer did not return before the deadline".to_string()),
            };

            if let Some(error) = failure {
                warn!(call_id, status = response.status(), %error, "Response observer failed; continuing");
                let _ = self.events.send(CallEvent::ObserverFailed {
                    call_id: call_id.to_string(),
                    status: response.status(),
                    error,
                });
            }
        }

        class
    }
}

impl fmt::Debug for ResponseClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseClassifier")
            .field("has_observer", &self.observer.is_some())
            .finish()
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{event_channel, ObserverError};
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::time::Duration;
    use tracing_test::traced_test;

    struct FailingObserver;

    #[async_trait]
    impl ResponseObserver for FailingObserver {
        async fn on_response(&self, _response: &SipResponse) -> Result<(), ObserverError> {
            Err(ObserverError::new("disk full"))
        }
    }

    struct PanickingObserver;

    #[async_trait]
    impl ResponseObserver for PanickingObserver {
        async fn on_response(&self, _response: &SipResponse) -> Result<(), ObserverError> {
            panic!("observer exploded");
        }
    }

    struct StuckObserver;

    #[async_trait]
    impl ResponseObserver for StuckObserver {
        async fn on_response(&self, _response: &SipResponse) -> Result<(), ObserverError> {
            futures::future::pending::<()>().await;
            Ok(())
        }
    }

    #[test]
    fn test_classify_ranges() {
        assert_eq!(classify(100), ResponseClass::Interim);
        assert_eq!(classify(183), ResponseClass::Interim);
        assert_eq!(classify(200), ResponseClass::Success);
        assert_eq!(classify(202), ResponseClass::Success);
        assert_eq!(classify(302), ResponseClass::Failure);
        assert_eq!(classify(486), ResponseClass::Failure);
        assert_eq!(classify(603), ResponseClass::Failure);
        assert_eq!(classify(0), ResponseClass::Failure);
        assert_eq!(classify(99), ResponseClass::Failure);
        assert_eq!(classify(700), ResponseClass::Failure);
    }

    proptest! {
        #[test]
        fn prop_only_2xx_is_success(status in 0u16..1000) {
            prop_assert_eq!(classify(status) == ResponseClass::Success, (200..300).contains(&status));
        }

        #[test]
        fn prop_only_1xx_is_not_final(status in 0u16..1000) {
            prop_assert_eq!(!classify(status).is_final(), (100..200).contains(&status));
        }
    }

    #[test]
    fn test_response_header_helpers() {
        let response = SipResponse::new(200, "OK")
            .with_header("call-id", "abc@host")
            .with_header("To", "<sip:bob@example.com:5080>;tag=remote-1")
            .with_header("Contact", "<sip:bob@10.0.0.9:5090;transport=udp>")
            .with_header("CSeq", "1 INVITE");

        assert_eq!(response.call_id(), Some("abc@host"));
        assert_eq!(response.to_tag().as_deref(), Some("remote-1"));
        assert_eq!(response.contact().unwrap().socket_string(), "10.0.0.9:5090");
        assert_eq!(response.cseq(), Some((1, "INVITE".to_string())));
    }

    #[test]
    fn test_to_tag_ignores_uri_parameters() {
        let response = SipResponse::new(200, "OK").with_header("To", "<sip:bob@example.com;tag=inside>");
        assert_eq!(response.to_tag(), None);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_observer_error_is_logged_not_propagated() {
        let (events, mut rx) = event_channel();
        let classifier = ResponseClassifier::new(events).with_observer(Arc::new(FailingObserver));

        let deadline = Instant::now() + Duration::from_secs(5);
        let class = classifier.observe("call-1", &SipResponse::new(200, "OK"), deadline).await;

        assert_eq!(class, ResponseClass::Success);
        assert!(logs_contain("Response observer failed"));

        let mut saw_failure = false;
        while let Ok(event) = rx.try_recv() {
            if let CallEvent::ObserverFailed { error, status, .. } = event {
                assert_eq!(status, 200);
                assert!(error.contains("disk full"));
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn test_observer_panic_is_contained() {
        let (events, _rx) = event_channel();
        let classifier = ResponseClassifier::new(events).with_observer(Arc::new(PanickingObserver));

        let deadline = Instant::now() + Duration::from_secs(5);
        let class = classifier.observe("call-1", &SipResponse::new(486, "Busy Here"), deadline).await;

        assert_eq!(class, ResponseClass::Failure);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_observer_is_cut_off_at_deadline() {
        let (events, _rx) = event_channel();
        let classifier = ResponseClassifier::new(events).with_observer(Arc::new(StuckObserver));

        let start = Instant::now();
        let deadline = start + Duration::from_secs(3);
        let class = classifier.observe("call-1", &SipResponse::new(180, "Ringing"), deadline).await;

        assert_eq!(class, ResponseClass::Interim);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }
}
