//! End-to-end call lifecycle against a scripted peer
//!
//! All tests run on paused time, so a 30 second hold costs nothing and
//! elapsed times are exact up to timer granularity.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use sipdial_call_core::{
    event_channel, CallConfig, CallError, CallEvent, CallIdentity, CallOutcome, CallSession, CallSettings,
    ChannelObserver, DialAttempt, DialogController, DialogState, Endpoint, Method, ObserverError, RequestBuilder,
    ResponseClassifier, ResponseObserver, ScriptStep, ScriptedTransport, SipResponse, Termination, TransportConfig,
    TransportError,
};

/// Fails on every response
struct FailingObserver;

#[async_trait]
impl ResponseObserver for FailingObserver {
    async fn on_response(&self, _response: &SipResponse) -> Result<(), ObserverError> {
        Err(ObserverError::new("database unavailable"))
    }
}

/// Panics on every response
struct PanickingObserver;

#[async_trait]
impl ResponseObserver for PanickingObserver {
    async fn on_response(&self, _response: &SipResponse) -> Result<(), ObserverError> {
        panic!("observer bug");
    }
}

/// Never returns
struct StuckObserver;

#[async_trait]
impl ResponseObserver for StuckObserver {
    async fn on_response(&self, _response: &SipResponse) -> Result<(), ObserverError> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

fn target() -> Endpoint {
    Endpoint::new("08821670000", "100.81.118.20", 5080).unwrap()
}

fn local() -> Endpoint {
    Endpoint::host_port("100.73.40.116", 5081).unwrap()
}

fn identity() -> CallIdentity {
    CallIdentity::new("Empresa XYZ", "4833800000")
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

fn assert_elapsed(start: Instant, expected: Duration) {
    let elapsed = start.elapsed();
    assert!(
        elapsed >= expected && elapsed < expected + Duration::from_millis(50),
        "expected ~{:?}, got {:?}",
        expected,
        elapsed
    );
}

#[tokio::test(start_paused = true)]
async fn test_answered_call_holds_then_hangs_up_once() {
    let transport = Arc::new(ScriptedTransport::answering());
    let mut session = CallSession::new(transport.clone()).with_hold_duration(secs(30));

    let start = Instant::now();
    let outcome = session.run(&target(), &local(), &identity(), secs(60)).await.unwrap();

    assert_eq!(
        outcome,
        CallOutcome::Connected {
            status: 200,
            reason: "OK".to_string()
        }
    );
    assert_elapsed(start, secs(30));
    assert_eq!(transport.count(Method::Invite), 1);
    assert_eq!(transport.count(Method::Bye), 1);
    assert_eq!(transport.count(Method::Cancel), 0);

    let sent = transport.sent();
    assert_eq!(sent[0].call_id, sent[1].call_id);
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_times_out_without_bye() {
    let transport = Arc::new(ScriptedTransport::silent());
    let mut session = CallSession::new(transport.clone());

    let start = Instant::now();
    let outcome = session.run(&target(), &local(), &identity(), secs(5)).await.unwrap();

    assert_eq!(outcome, CallOutcome::TimedOut);
    assert_elapsed(start, secs(5));
    assert_eq!(transport.count(Method::Bye), 0);
    assert_eq!(transport.count(Method::Cancel), 1);
}

#[tokio::test(start_paused = true)]
async fn test_busy_peer_is_rejected_at_its_own_pace() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        ScriptStep::respond(Duration::ZERO, 180, "Ringing"),
        ScriptStep::respond(secs(2), 486, "Busy Here"),
    ]));
    let mut session = CallSession::new(transport.clone());

    let start = Instant::now();
    let outcome = session.run(&target(), &local(), &identity(), secs(60)).await.unwrap();

    assert_eq!(
        outcome,
        CallOutcome::Rejected {
            status: 486,
            reason: "Busy Here".to_string()
        }
    );
    assert_elapsed(start, secs(2));
    assert_eq!(transport.count(Method::Bye), 0);
    assert_eq!(transport.count(Method::Cancel), 0);
}

#[tokio::test(start_paused = true)]
async fn test_late_answer_does_not_resurrect_timed_out_call() {
    let transport = Arc::new(ScriptedTransport::new(vec![ScriptStep::respond(secs(10), 200, "OK")]));
    let mut session = CallSession::new(transport.clone());
    let mut events = session.subscribe();

    let outcome = session.run(&target(), &local(), &identity(), secs(5)).await.unwrap();
    assert_eq!(outcome, CallOutcome::TimedOut);

    // Let the 200 arrive with nobody listening
    tokio::time::sleep(secs(10)).await;

    assert_eq!(transport.discarded(), 1);
    assert_eq!(transport.count(Method::Bye), 0);

    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, CallEvent::Connected { .. }), "unexpected {:?}", event);
    }
}

#[tokio::test(start_paused = true)]
async fn test_slow_send_counts_against_the_deadline() {
    let transport = Arc::new(ScriptedTransport::answering().with_send_delay(secs(10)));
    let mut session = CallSession::new(transport.clone());

    let start = Instant::now();
    let outcome = session.run(&target(), &local(), &identity(), secs(5)).await.unwrap();

    assert_eq!(outcome, CallOutcome::TimedOut);
    assert_elapsed(start, secs(5));
    assert_eq!(transport.count(Method::Bye), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_terminate_sends_one_bye() {
    let transport = Arc::new(ScriptedTransport::answering());
    let (events, _rx) = event_channel();
    let controller = DialogController::new(transport.clone(), ResponseClassifier::new(events.clone()), events);
    let request = RequestBuilder::from_identity(&target(), &local(), &identity()).unwrap();

    let handle = match controller.place(request, secs(5), &CancellationToken::new()).await {
        DialAttempt::Established(handle) => handle,
        DialAttempt::Ended(outcome) => panic!("call not established: {}", outcome),
    };
    assert_eq!(handle.state(), DialogState::Established);

    let (a, b) = tokio::join!(handle.terminate(), handle.terminate());
    let mut results = [a, b];
    results.sort_by_key(|t| *t == Termination::Sent);
    assert_eq!(results, [Termination::AlreadyClosed, Termination::Sent]);

    assert_eq!(handle.terminate().await, Termination::AlreadyClosed);
    assert_eq!(handle.state(), DialogState::Closed);
    assert_eq!(transport.count(Method::Bye), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_hold_hangs_up_early() {
    let transport = Arc::new(ScriptedTransport::answering());
    let mut session = CallSession::new(transport.clone()).with_hold_duration(secs(30));
    let stop = session.stop_token();

    tokio::spawn(async move {
        tokio::time::sleep(secs(3)).await;
        stop.cancel();
    });

    let start = Instant::now();
    let outcome = session.run(&target(), &local(), &identity(), secs(60)).await.unwrap();

    assert!(outcome.is_connected());
    assert_elapsed(start, secs(3));
    assert_eq!(transport.count(Method::Bye), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_while_dialing_cancels_the_invite() {
    let transport = Arc::new(ScriptedTransport::silent());
    let mut session = CallSession::new(transport.clone());
    let stop = session.stop_token();

    tokio::spawn(async move {
        tokio::time::sleep(secs(1)).await;
        stop.cancel();
    });

    let start = Instant::now();
    let outcome = session.run(&target(), &local(), &identity(), secs(60)).await.unwrap();

    assert_eq!(outcome, CallOutcome::Cancelled);
    assert_elapsed(start, secs(1));
    assert_eq!(transport.count(Method::Invite), 1);
    assert_eq!(transport.count(Method::Cancel), 1);
    assert_eq!(transport.count(Method::Bye), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_before_run_sends_nothing() {
    let transport = Arc::new(ScriptedTransport::answering());
    let mut session = CallSession::new(transport.clone());
    session.stop();

    let outcome = session.run(&target(), &local(), &identity(), secs(60)).await.unwrap();

    assert_eq!(outcome, CallOutcome::Cancelled);
    assert!(transport.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transport_failures_become_outcomes() {
    let refused = TransportError::Send {
        method: "INVITE".to_string(),
        reason: "connection refused".to_string(),
    };
    let scripts = vec![
        ScriptedTransport::silent().with_send_failure(refused.clone()),
        ScriptedTransport::new(vec![ScriptStep::fail(secs(1), refused)]),
        ScriptedTransport::new(vec![
            ScriptStep::respond(Duration::ZERO, 100, "Trying"),
            ScriptStep::close(secs(1)),
        ]),
    ];

    for transport in scripts {
        let transport = Arc::new(transport);
        let mut session = CallSession::new(transport.clone());

        let outcome = session.run(&target(), &local(), &identity(), secs(60)).await.unwrap();

        assert!(
            matches!(outcome, CallOutcome::TransportError { .. }),
            "unexpected outcome {:?}",
            outcome
        );
        assert!(outcome.is_retryable());
        assert_eq!(transport.count(Method::Bye), 0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_dropped_handle_still_sends_bye() {
    let transport = Arc::new(ScriptedTransport::answering());
    let (events, mut rx) = event_channel();
    let controller = DialogController::new(transport.clone(), ResponseClassifier::new(events.clone()), events);
    let request = RequestBuilder::from_identity(&target(), &local(), &identity()).unwrap();

    let attempt = controller.place(request, secs(5), &CancellationToken::new()).await;
    let call_id = attempt.into_handle().map(|h| h.call_id().to_string()).unwrap();

    // The handle was dropped inside map(); give the spawned BYE a chance to run
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(transport.count(Method::Bye), 1);

    let mut ended = false;
    while let Ok(event) = rx.try_recv() {
        if let CallEvent::CallEnded { call_id: id, outcome } = event {
            assert_eq!(id, call_id);
            assert!(outcome.is_connected());
            ended = true;
        }
    }
    assert!(ended);
}

#[tokio::test(start_paused = true)]
async fn test_bye_failure_is_reported_not_raised() {
    let transport = Arc::new(ScriptedTransport::answering().with_bye_failure(TransportError::Closed));
    let mut session = CallSession::new(transport.clone()).with_hold_duration(Duration::ZERO);
    let mut events = session.subscribe();

    let outcome = session.run(&target(), &local(), &identity(), secs(60)).await.unwrap();
    assert!(outcome.is_connected());
    assert_eq!(transport.count(Method::Bye), 1);

    let mut teardown_failed = false;
    let mut closed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            CallEvent::TeardownFailed { method, .. } => {
                assert_eq!(method, "BYE");
                teardown_failed = true;
            }
            CallEvent::StateChanged {
                current: DialogState::Closed,
                ..
            } => closed = true,
            _ => {}
        }
    }
    assert!(teardown_failed);
    assert!(closed);
}

#[tokio::test(start_paused = true)]
async fn test_observer_sees_every_response_in_order() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        ScriptStep::respond(Duration::ZERO, 100, "Trying"),
        ScriptStep::respond(Duration::from_millis(500), 180, "Ringing"),
        ScriptStep::respond(secs(1), 183, "Session Progress"),
        ScriptStep::respond(secs(2), 200, "OK"),
    ]));
    let (observer, mut responses) = ChannelObserver::channel(8);
    let mut session = CallSession::new(transport)
        .with_observer(Arc::new(observer))
        .with_hold_duration(Duration::ZERO);

    let outcome = session.run(&target(), &local(), &identity(), secs(60)).await.unwrap();
    assert!(outcome.is_connected());

    let mut seen = Vec::new();
    while let Ok(response) = responses.try_recv() {
        seen.push(response.status());
    }
    assert_eq!(seen, vec![100, 180, 183, 200]);
}

#[tokio::test(start_paused = true)]
async fn test_lifecycle_events_in_order() {
    let transport = Arc::new(ScriptedTransport::answering());
    let mut session = CallSession::new(transport).with_hold_duration(Duration::ZERO);
    let mut events = session.subscribe();

    session.run(&target(), &local(), &identity(), secs(60)).await.unwrap();

    let mut states = Vec::new();
    let mut saw_connected_after_established = false;
    while let Ok(event) = events.try_recv() {
        match event {
            CallEvent::StateChanged { current, .. } => states.push(current),
            CallEvent::Connected { status, .. } => {
                assert_eq!(status, 200);
                saw_connected_after_established = states.last() == Some(&DialogState::Established);
            }
            _ => {}
        }
    }

    assert_eq!(
        states,
        vec![
            DialogState::Dialing,
            DialogState::Established,
            DialogState::Terminating,
            DialogState::Closed
        ]
    );
    assert!(saw_connected_after_established);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_identity_fails_before_sending() {
    let transport = Arc::new(ScriptedTransport::answering());
    let mut session = CallSession::new(transport.clone());

    let err = session
        .run(&target(), &local(), &CallIdentity::new("Nobody", ""), secs(60))
        .await
        .unwrap_err();

    assert!(matches!(err, CallError::InvalidEndpoint { .. }));
    assert!(transport.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_sequential_calls_get_fresh_dialogs() {
    let transport = Arc::new(ScriptedTransport::answering());
    let mut session = CallSession::new(transport.clone()).with_hold_duration(Duration::ZERO);

    for _ in 0..2 {
        let outcome = session.run(&target(), &local(), &identity(), secs(60)).await.unwrap();
        assert!(outcome.is_connected());
    }

    let invites: Vec<_> = transport
        .sent()
        .into_iter()
        .filter(|r| r.method == Method::Invite)
        .map(|r| r.call_id)
        .collect();
    assert_eq!(invites.len(), 2);
    assert_ne!(invites[0], invites[1]);
    assert_eq!(transport.count(Method::Bye), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failing_observers_do_not_change_the_outcome() {
    let observers: Vec<Arc<dyn ResponseObserver>> = vec![Arc::new(FailingObserver), Arc::new(PanickingObserver)];

    for observer in observers {
        let transport = Arc::new(ScriptedTransport::answering());
        let mut session = CallSession::new(transport.clone())
            .with_observer(observer)
            .with_hold_duration(Duration::ZERO);
        let mut events = session.subscribe();

        let outcome = session.run(&target(), &local(), &identity(), secs(60)).await.unwrap();

        assert!(outcome.is_connected(), "unexpected outcome {:?}", outcome);
        assert_eq!(transport.count(Method::Bye), 1);

        let mut observer_failed = false;
        while let Ok(event) = events.try_recv() {
            if let CallEvent::ObserverFailed { status, .. } = event {
                assert_eq!(status, 200);
                observer_failed = true;
            }
        }
        assert!(observer_failed);
    }
}

#[tokio::test(start_paused = true)]
async fn test_stop_interrupts_a_stuck_observer_while_ringing() {
    let transport = Arc::new(ScriptedTransport::new(vec![ScriptStep::respond(
        Duration::ZERO,
        180,
        "Ringing",
    )]));
    let mut session = CallSession::new(transport.clone()).with_observer(Arc::new(StuckObserver));
    let stop = session.stop_token();

    tokio::spawn(async move {
        tokio::time::sleep(secs(1)).await;
        stop.cancel();
    });

    let start = Instant::now();
    let outcome = session.run(&target(), &local(), &identity(), secs(60)).await.unwrap();

    assert_eq!(outcome, CallOutcome::Cancelled);
    assert_elapsed(start, secs(1));
    assert_eq!(transport.count(Method::Cancel), 1);
    assert_eq!(transport.count(Method::Bye), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_observer_on_answer_hangs_up() {
    let transport = Arc::new(ScriptedTransport::answering());
    let mut session = CallSession::new(transport.clone()).with_observer(Arc::new(StuckObserver));
    let stop = session.stop_token();

    tokio::spawn(async move {
        tokio::time::sleep(secs(1)).await;
        stop.cancel();
    });

    let start = Instant::now();
    let outcome = session.run(&target(), &local(), &identity(), secs(60)).await.unwrap();

    assert_eq!(outcome, CallOutcome::Cancelled);
    assert_elapsed(start, secs(1));
    assert_eq!(transport.count(Method::Bye), 1);
    assert_eq!(transport.count(Method::Cancel), 0);
}

fn config(call: CallSettings) -> CallConfig {
    CallConfig::new(TransportConfig::new("100.73.40.116", 5081), call)
}

#[tokio::test(start_paused = true)]
async fn test_run_config_applies_configured_hold() {
    let transport = Arc::new(ScriptedTransport::answering());
    let mut session = CallSession::new(transport.clone());
    let config = config(CallSettings::new(target(), "Empresa XYZ", "4833800000").with_hold(secs(2)));

    let start = Instant::now();
    let outcome = session.run_config(&config, &local()).await.unwrap();

    assert!(outcome.is_connected());
    assert_elapsed(start, secs(2));
    assert_eq!(transport.count(Method::Bye), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sub_second_timeout_from_config() {
    let transport = Arc::new(ScriptedTransport::silent());
    let mut session = CallSession::new(transport.clone());
    let config = config(
        CallSettings::new(target(), "Empresa XYZ", "4833800000").with_timeout(Duration::from_millis(500)),
    );

    let start = Instant::now();
    let outcome = session.run_config(&config, &local()).await.unwrap();

    assert_eq!(outcome, CallOutcome::TimedOut);
    assert_elapsed(start, Duration::from_millis(500));
    assert_eq!(transport.count(Method::Cancel), 1);
}
