//! Integration tests for call lifecycle operations
//!
//! Drives the bridge the way a platform would: application commands go out
//! through the recording native layer, and the test plays the platform by
//! calling the `on_*` adapters.

use std::sync::Arc;

use rvoip_callbridge_core::native::NativeCall;
use rvoip_callbridge_core::{
    AudioRoute, BridgeConfig, BridgeError, CallBridge, CallId, CallRequest, CallState, Capabilities,
    ConnectionOutcome, ConnectionRequest, DisconnectReason, EventAction, ForegroundSettings, RecordingTelephony,
};
use serial_test::serial;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("rvoip_callbridge_core=debug")
        .with_test_writer()
        .try_init();
}

fn bridge_with(config: BridgeConfig) -> (CallBridge, Arc<RecordingTelephony>) {
    init_tracing();
    let native = Arc::new(RecordingTelephony::new());
    let bridge = CallBridge::new(config, native.clone()).expect("Failed to build bridge");
    (bridge, native)
}

fn pending_actions(bridge: &CallBridge) -> Vec<EventAction> {
    bridge.pending_events().iter().map(|event| event.action).collect()
}

/// Play the platform accepting an incoming call for `id`
async fn ring(bridge: &CallBridge, id: &str, number: &str) -> CallId {
    let call_id = CallId::from(id);
    let outcome = bridge
        .on_create_incoming_connection(ConnectionRequest::new(call_id.clone(), number).with_display_name("Alice"))
        .await
        .expect("Incoming connection failed");
    assert!(outcome.is_created());
    call_id
}

#[tokio::test]
#[serial]
async fn test_incoming_call_answered() {
    let (bridge, native) = bridge_with(BridgeConfig::default());
    let request = CallRequest {
        call_id: CallId::from("c1"),
        number: "+15551234".to_string(),
        display_name: "Alice".to_string(),
        payload: None,
    };

    assert!(bridge.display_incoming_call("c1", "+15551234", "Alice").await.unwrap());
    assert_eq!(native.calls(), vec![NativeCall::AddIncomingCall(request.clone())]);

    let outcome = bridge
        .on_create_incoming_connection(ConnectionRequest::from(&request))
        .await
        .unwrap();
    let session = outcome.session().expect("session created");
    assert_eq!(session.state, CallState::Ringing);
    assert_eq!(session.address.number, "+15551234");

    let call_id = CallId::from("c1");
    assert!(bridge.answer_incoming_call(&call_id).await.unwrap());
    assert_eq!(bridge.get_session(&call_id).await.unwrap().state, CallState::Active);
    assert_eq!(native.count(|call| matches!(call, NativeCall::Answer(_))), 1);

    assert_eq!(
        pending_actions(&bridge),
        vec![
            EventAction::CallDisplayRequested,
            EventAction::PerformAnswer,
            EventAction::AudioSessionActivated,
        ]
    );
    let answered = &bridge.pending_events()[1];
    assert_eq!(answered.call_id(), Some(call_id));
    assert_eq!(answered.attribute("handle"), Some("+15551234"));
}

#[tokio::test]
#[serial]
async fn test_address_schema_is_split() {
    let (bridge, _native) = bridge_with(BridgeConfig::default());
    let call_id = ring(&bridge, "c1", "sip:12345").await;

    let session = bridge.get_session(&call_id).await.unwrap();
    assert_eq!(session.address.schema.as_deref(), Some("sip"));
    assert_eq!(session.address.number, "12345");

    bridge.on_silence(&call_id).await;
    let event = bridge.pending_events().pop().unwrap();
    assert_eq!(event.action, EventAction::SilenceIncomingCall);
    assert_eq!(event.attribute("schema"), Some("sip"));
    assert_eq!(event.attribute("handle"), Some("12345"));
}

#[tokio::test]
#[serial]
async fn test_end_all_calls_stops_presentation_once() {
    let config = BridgeConfig::new().with_foreground(ForegroundSettings::new("calls", "Calls"));
    let (bridge, native) = bridge_with(config);
    ring(&bridge, "c1", "+15551234").await;
    ring(&bridge, "c2", "+15555678").await;
    assert!(bridge.is_presenting().await);
    bridge.clear_pending_events();
    native.clear();

    assert_eq!(bridge.end_all_calls().await.unwrap(), 2);
    assert!(bridge.sessions().await.is_empty());
    assert_eq!(native.foreground_stops(), 1);
    assert_eq!(
        native.count(|call| matches!(call, NativeCall::Disconnect(_, DisconnectReason::Local))),
        2
    );
    assert_eq!(pending_actions(&bridge), vec![EventAction::PerformEnd, EventAction::PerformEnd]);

    assert_eq!(bridge.end_all_calls().await.unwrap(), 0);
    assert_eq!(native.foreground_stops(), 1);
}

#[tokio::test]
#[serial]
async fn test_unknown_call_commands_are_noops() {
    let (bridge, native) = bridge_with(BridgeConfig::default());
    let ghost = CallId::from("ghost");

    assert!(!bridge.end_call(&ghost).await.unwrap());
    assert!(!bridge.answer_incoming_call(&ghost).await.unwrap());
    assert!(!bridge.set_on_hold(&ghost, true).await.unwrap());
    assert!(!bridge.set_muted(&ghost, true).await.unwrap());
    assert!(!bridge.send_dtmf(&ghost, "1").await.unwrap());
    assert!(!bridge.set_audio_route(&ghost, "Speaker").await.unwrap());
    assert!(!bridge.update_display(&ghost, "Bob", "sip:200").await.unwrap());
    assert!(!bridge.set_connection_state(&ghost, CallState::Active).await.unwrap());
    assert!(!bridge.on_disconnect(&ghost).await.unwrap());
    assert!(native.calls().is_empty());
    assert!(bridge.pending_events().is_empty());
}

#[tokio::test]
#[serial]
async fn test_double_disconnect_is_idempotent() {
    let (bridge, _native) = bridge_with(BridgeConfig::default());
    let call_id = ring(&bridge, "c1", "+15551234").await;

    assert!(bridge.on_disconnect(&call_id).await.unwrap());
    assert!(!bridge.on_disconnect(&call_id).await.unwrap());
    assert!(bridge.get_session(&call_id).await.is_none());
    assert_eq!(pending_actions(&bridge), vec![EventAction::PerformEnd]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_concurrent_hangups_end_call_once() {
    let (bridge, _native) = bridge_with(BridgeConfig::default());

    for round in 0..50 {
        let call_id = ring(&bridge, &format!("race-{}", round), "+15551234").await;
        bridge.clear_pending_events();

        let remote = {
            let bridge = bridge.clone();
            let call_id = call_id.clone();
            tokio::spawn(async move { bridge.on_disconnect(&call_id).await })
        };
        let aborted = {
            let bridge = bridge.clone();
            let call_id = call_id.clone();
            tokio::spawn(async move { bridge.on_abort(&call_id).await })
        };
        let local = bridge.on_reject(&call_id).await.expect("local hangup must not fail");
        let remote = remote.await.unwrap().expect("remote hangup must not fail");
        let aborted = aborted.await.unwrap().expect("abort must not fail");

        assert_eq!([local, remote, aborted].iter().filter(|ended| **ended).count(), 1);
        assert_eq!(pending_actions(&bridge), vec![EventAction::PerformEnd]);
        assert!(bridge.get_session(&call_id).await.is_none());
    }
}

#[tokio::test]
#[serial]
async fn test_unsupported_platform_short_circuits() {
    let (bridge, native) = bridge_with(BridgeConfig::default());
    native.set_supported(false);

    assert!(!bridge.setup().await.unwrap());
    assert!(!bridge.display_incoming_call("c1", "+15551234", "Alice").await.unwrap());
    assert!(!bridge.start_call("c2", "+15555678", "Bob").await.unwrap());
    assert_eq!(bridge.end_all_calls().await.unwrap(), 0);
    assert!(native.calls().is_empty());
}

#[tokio::test]
#[serial]
async fn test_malformed_and_duplicate_requests() {
    let (bridge, _native) = bridge_with(BridgeConfig::default());

    let outcome = bridge
        .on_create_incoming_connection(ConnectionRequest::default())
        .await
        .unwrap();
    match outcome {
        ConnectionOutcome::Failed { reason, error } => {
            assert_eq!(reason, DisconnectReason::Failed);
            assert!(matches!(error, BridgeError::MalformedRequest { .. }));
        }
        ConnectionOutcome::Created(_) => panic!("request without address must fail"),
    }
    assert!(bridge.sessions().await.is_empty());

    ring(&bridge, "c1", "+15551234").await;
    let duplicate = bridge
        .on_create_incoming_connection(ConnectionRequest::new("c1", "+15559999"))
        .await
        .unwrap();
    assert!(matches!(
        duplicate,
        ConnectionOutcome::Failed { error: BridgeError::CallAlreadyExists { .. }, .. }
    ));
    assert_eq!(bridge.sessions().await.len(), 1);
}

#[tokio::test]
#[serial]
async fn test_incoming_connection_failure_publishes_one_event() {
    let (bridge, _native) = bridge_with(BridgeConfig::default());
    let request = ConnectionRequest::new("c1", "tel:+15551234").with_display_name("Alice");

    bridge.on_create_incoming_connection_failed(&request);

    let events = bridge.pending_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].action, EventAction::IncomingConnectionFailed);
    assert_eq!(events[0].attribute("handle"), Some("+15551234"));
    assert_eq!(events[0].attribute("schema"), Some("tel"));
}

#[tokio::test]
#[serial]
async fn test_hold_mute_and_dtmf() {
    let (bridge, native) = bridge_with(BridgeConfig::default());
    let call_id = ring(&bridge, "c1", "+15551234").await;
    bridge.answer_incoming_call(&call_id).await.unwrap();
    bridge.clear_pending_events();

    assert!(bridge.set_on_hold(&call_id, true).await.unwrap());
    assert_eq!(bridge.get_session(&call_id).await.unwrap().state, CallState::Holding);
    assert!(!bridge.set_on_hold(&call_id, true).await.unwrap(), "already held");
    assert!(bridge.set_on_hold(&call_id, false).await.unwrap());
    assert_eq!(bridge.get_session(&call_id).await.unwrap().state, CallState::Active);

    assert!(bridge.set_muted(&call_id, true).await.unwrap());
    assert!(bridge.get_session(&call_id).await.unwrap().muted);

    let err = bridge.send_dtmf(&call_id, "x").await.unwrap_err();
    assert!(matches!(err, BridgeError::InvalidDtmf { .. }));
    assert!(bridge.send_dtmf(&call_id, "5").await.unwrap());
    assert_eq!(native.count(|call| matches!(call, NativeCall::PlayDtmf(_, '5'))), 1);

    let events = bridge.pending_events();
    let summary: Vec<(EventAction, Option<&str>)> = events
        .iter()
        .map(|event| {
            let value = event
                .attribute("hold")
                .or_else(|| event.attribute("muted"))
                .or_else(|| event.attribute("digits"));
            (event.action, value)
        })
        .collect();
    assert_eq!(
        summary,
        vec![
            (EventAction::ToggleHold, Some("true")),
            (EventAction::ToggleHold, Some("false")),
            (EventAction::ToggleMute, Some("true")),
            (EventAction::DtmfPerformed, Some("5")),
        ]
    );
}

#[tokio::test]
#[serial]
async fn test_audio_route_rejection() {
    let (bridge, native) = bridge_with(BridgeConfig::default());
    let call_id = ring(&bridge, "c1", "+15551234").await;

    assert!(bridge.set_audio_route(&call_id, "Bluetooth").await.unwrap());
    assert_eq!(
        native.calls().last(),
        Some(&NativeCall::SetAudioRoute(call_id.clone(), AudioRoute::Bluetooth))
    );

    native.fail_operation("set_audio_route");
    let rejection = bridge.set_audio_route(&call_id, "Speaker").await.unwrap_err();
    assert_eq!(rejection.code, "SetAudioRoute");
    assert!(rejection.message.contains("simulated failure"));
}

#[tokio::test]
#[serial]
async fn test_audio_state_change_reports_route() {
    let (bridge, _native) = bridge_with(BridgeConfig::default());
    let call_id = ring(&bridge, "c1", "+15551234").await;

    assert!(bridge
        .on_audio_state_changed(&call_id, AudioRoute::WiredHeadset, false)
        .await
        .unwrap());
    assert!(!bridge
        .on_audio_state_changed(&call_id, AudioRoute::WiredHeadset, false)
        .await
        .unwrap());

    let event = bridge.pending_events().pop().unwrap();
    assert_eq!(event.action, EventAction::AudioRouteChanged);
    assert_eq!(event.attribute("output"), Some("Headset"));
}

#[tokio::test]
#[serial]
async fn test_conference_resumes_held_calls() {
    let (bridge, native) = bridge_with(BridgeConfig::default());
    let first = ring(&bridge, "c1", "+15551234").await;
    let second = ring(&bridge, "c2", "+15555678").await;
    for call_id in [&first, &second] {
        bridge.answer_incoming_call(call_id).await.unwrap();
        bridge.set_on_hold(call_id, true).await.unwrap();
    }
    native.clear();

    assert!(bridge.on_conference(&first, &second).await.unwrap());
    for call_id in [&first, &second] {
        assert_eq!(bridge.get_session(call_id).await.unwrap().state, CallState::Active);
    }
    assert_eq!(native.count(|call| matches!(call, NativeCall::Unhold(_))), 2);
    assert_eq!(
        native.calls().last(),
        Some(&NativeCall::CreateConference(vec![first.clone(), second.clone()]))
    );
    assert_eq!(bridge.stats().await.conferences, 1);

    assert!(!bridge.on_conference(&first, &CallId::from("ghost")).await.unwrap());
}

#[tokio::test]
#[serial]
async fn test_connection_state_follows_table() {
    let (bridge, _native) = bridge_with(BridgeConfig::default());
    bridge.confirm_reachable();
    bridge.set_available(true);

    let outcome = bridge
        .on_create_outgoing_connection(ConnectionRequest::new("c2", "+15555678"))
        .await
        .unwrap();
    assert_eq!(outcome.session().unwrap().state, CallState::Dialing);
    let call_id = CallId::from("c2");

    assert!(!bridge.set_connection_state(&call_id, CallState::Dialing).await.unwrap());
    assert!(!bridge.set_connection_state(&call_id, CallState::Ringing).await.unwrap());
    assert!(bridge.set_current_call_active(&call_id).await.unwrap());
    assert_eq!(bridge.get_session(&call_id).await.unwrap().state, CallState::Active);
    assert!(bridge.set_connection_state(&call_id, CallState::Holding).await.unwrap());
    assert!(bridge.get_session(&call_id).await.unwrap().capabilities.contains(Capabilities::HOLD));
}

#[tokio::test]
#[serial]
async fn test_end_call_and_report_end_call() {
    let (bridge, native) = bridge_with(BridgeConfig::default());
    let first = ring(&bridge, "c1", "+15551234").await;
    let second = ring(&bridge, "c2", "+15555678").await;

    assert!(bridge.end_call(&first).await.unwrap());
    assert!(bridge.report_end_call(&second, DisconnectReason::Remote).await.unwrap());
    assert!(bridge.sessions().await.is_empty());

    assert_eq!(pending_actions(&bridge), vec![EventAction::PerformEnd]);
    assert_eq!(bridge.pending_events()[0].call_id(), Some(first.clone()));
    assert!(native
        .calls()
        .contains(&NativeCall::Disconnect(second, DisconnectReason::Remote)));
}

#[tokio::test]
#[serial]
async fn test_reject_ringing_call() {
    let (bridge, native) = bridge_with(BridgeConfig::default());
    let call_id = ring(&bridge, "c1", "+15551234").await;

    assert!(bridge.reject_call(&call_id).await.unwrap());
    assert!(bridge.get_session(&call_id).await.is_none());
    assert_eq!(native.count(|call| matches!(call, NativeCall::Reject(_))), 1);
    assert_eq!(pending_actions(&bridge), vec![EventAction::PerformEnd]);
}

#[tokio::test]
#[serial]
async fn test_outgoing_number_last_writer_wins() {
    let (bridge, _native) = bridge_with(BridgeConfig::default().with_multiple_calls(false));
    bridge.confirm_reachable();
    bridge.set_available(true);

    let outcome = bridge
        .on_create_outgoing_connection(
            ConnectionRequest::new("c2", "sip:200")
                .with_extras_number("100")
                .with_display_name("Bob"),
        )
        .await
        .unwrap();

    let session = outcome.session().unwrap();
    assert_eq!(session.address.number, "200");
    assert_eq!(session.display_name, "Bob");
    assert!(session.add_call_disabled);
    assert!(bridge.has_outgoing_call());

    assert_eq!(
        pending_actions(&bridge),
        vec![EventAction::StartCallRequested, EventAction::AudioSessionActivated]
    );
    assert_eq!(bridge.pending_events()[0].attribute("handle"), Some("200"));

    bridge.end_call(&CallId::from("c2")).await.unwrap();
    assert!(!bridge.has_outgoing_call());
}

#[tokio::test]
#[serial]
async fn test_outgoing_fails_when_unavailable() {
    let (bridge, _native) = bridge_with(BridgeConfig::default());
    bridge.confirm_reachable();
    bridge.set_available(false);

    let outcome = bridge
        .on_create_outgoing_connection(ConnectionRequest::new("c2", "+15555678"))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        ConnectionOutcome::Failed { reason: DisconnectReason::Local, .. }
    ));
    assert!(bridge.sessions().await.is_empty());
    assert!(!bridge.has_outgoing_call());
}

#[tokio::test]
#[serial]
async fn test_rejected_outgoing_request_leaves_no_outgoing_call() {
    let (bridge, _native) = bridge_with(BridgeConfig::default());
    bridge.set_available(true);

    let mut request = ConnectionRequest::new("c2", "+15555678");
    request.address = None;
    let outcome = bridge.on_create_outgoing_connection(request).await.unwrap();
    assert!(matches!(
        outcome,
        ConnectionOutcome::Failed { error: BridgeError::MalformedRequest { .. }, .. }
    ));
    assert!(!bridge.has_outgoing_call());

    ring(&bridge, "c1", "+15551234").await;
    let duplicate = bridge
        .on_create_outgoing_connection(ConnectionRequest::new("c1", "+15555678"))
        .await
        .unwrap();
    assert!(!duplicate.is_created());
    assert!(!bridge.has_outgoing_call());
    assert!(bridge.pending_events().iter().all(|e| e.action != EventAction::StartCallRequested));
}

#[tokio::test]
#[serial]
async fn test_outgoing_from_background_wakes_application() {
    let (bridge, native) = bridge_with(BridgeConfig::default());
    native.set_app_in_foreground(false);
    bridge.set_available(true);

    let outcome = bridge
        .on_create_outgoing_connection(ConnectionRequest::new("c2", "+15555678").with_display_name("Bob"))
        .await
        .unwrap();
    assert!(outcome.is_created());

    let wakes = native.wake_requests();
    assert_eq!(wakes.len(), 1);
    assert_eq!(wakes[0].call_id, CallId::from("c2"));
    assert_eq!(wakes[0].display_name, "Bob");
    assert_eq!(pending_actions(&bridge)[0], EventAction::WakeApplication);
}
