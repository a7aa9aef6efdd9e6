//! Integration tests for the reachability protocol
//!
//! Timers run on tokio's paused clock, so every deadline is deterministic.

use std::sync::Arc;
use std::time::Duration;

use rvoip_callbridge_core::native::NativeCall;
use rvoip_callbridge_core::{
    BridgeConfig, CallBridge, CallId, CallState, ConnectionRequest, DisconnectReason, EventAction, RecordingTelephony,
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

fn outgoing_config() -> BridgeConfig {
    BridgeConfig::new().with_reachability_check_delay(Duration::from_millis(2000))
}

async fn place(bridge: &CallBridge, id: &str) {
    let outcome = bridge
        .on_create_outgoing_connection(ConnectionRequest::new(id, "+15555678").with_display_name("Bob"))
        .await
        .expect("Outgoing connection failed");
    assert!(outcome.is_created());
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_confirmation_before_deadline_suppresses_wake() {
    let (bridge, native) = bridge_with(outgoing_config());
    place(&bridge, "c2").await;

    let ticket = bridge.reachability().pending_ticket().expect("ticket armed");
    assert_eq!(ticket.call_id(), &CallId::from("c2"));
    assert_eq!(bridge.pending_events()[0].action, EventAction::CheckReachability);

    tokio::time::sleep(Duration::from_millis(500)).await;
    bridge.confirm_reachable();

    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert!(native.wake_requests().is_empty());
    assert_eq!(bridge.reachability().fallback_wakes(), 0);
    assert!(bridge.reachability().pending_ticket().is_none());

    // The fallback never touches the call
    assert_eq!(
        bridge.get_session(&CallId::from("c2")).await.unwrap().state,
        CallState::Dialing
    );
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_deadline_without_confirmation_wakes_once() {
    let (bridge, native) = bridge_with(outgoing_config());
    place(&bridge, "c2").await;

    tokio::time::sleep(Duration::from_millis(1999)).await;
    assert!(native.wake_requests().is_empty());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let wakes = native.wake_requests();
    assert_eq!(wakes.len(), 1);
    assert_eq!(wakes[0].call_id, CallId::from("c2"));
    assert_eq!(wakes[0].display_name, "Bob");

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(native.wake_requests().len(), 1);
    assert!(bridge.get_session(&CallId::from("c2")).await.is_some());
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_superseding_ticket_fires_at_most_once() {
    let (bridge, native) = bridge_with(outgoing_config());
    place(&bridge, "c3").await;
    tokio::time::sleep(Duration::from_millis(1000)).await;
    place(&bridge, "c4").await;

    tokio::time::sleep(Duration::from_millis(5000)).await;
    let wakes = native.wake_requests();
    assert_eq!(wakes.len(), 1);
    assert_eq!(wakes[0].call_id, CallId::from("c4"));
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_initialized_application_skips_check() {
    let (bridge, native) = bridge_with(outgoing_config());
    bridge.set_available(true);
    place(&bridge, "c2").await;

    assert!(bridge.reachability().pending_ticket().is_none());
    tokio::time::sleep(Duration::from_millis(3000)).await;
    assert!(native.wake_requests().is_empty());
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_background_wake_clears_ticket() {
    let (bridge, native) = bridge_with(outgoing_config());
    native.set_app_in_foreground(false);
    place(&bridge, "c2").await;

    assert_eq!(native.wake_requests().len(), 1);
    assert!(bridge.reachability().pending_ticket().is_none());

    tokio::time::sleep(Duration::from_millis(3000)).await;
    assert_eq!(native.wake_requests().len(), 1, "fallback must not wake a second time");
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_unreachable_incoming_call_is_disconnected() {
    let config = BridgeConfig::new().with_incoming_reachability_timeout(Duration::from_millis(3000));
    let (bridge, native) = bridge_with(config);
    let call_id = CallId::from("c5");
    bridge
        .on_create_incoming_connection(ConnectionRequest::new(call_id.clone(), "+15551234"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(3100)).await;
    assert!(bridge.get_session(&call_id).await.is_none());
    assert!(native
        .calls()
        .contains(&NativeCall::Disconnect(call_id.clone(), DisconnectReason::Local)));
    let ended: Vec<_> = bridge
        .pending_events()
        .into_iter()
        .filter(|event| event.action == EventAction::PerformEnd)
        .collect();
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].call_id(), Some(call_id));
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_incoming_timer_discarded_after_answer() {
    let config = BridgeConfig::new().with_incoming_reachability_timeout(Duration::from_millis(3000));
    let (bridge, _native) = bridge_with(config);
    let call_id = CallId::from("c6");
    bridge
        .on_create_incoming_connection(ConnectionRequest::new(call_id.clone(), "+15551234"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1000)).await;
    bridge.answer_incoming_call(&call_id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(5000)).await;
    assert_eq!(bridge.get_session(&call_id).await.unwrap().state, CallState::Active);
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_incoming_timer_respects_reachable_application() {
    let config = BridgeConfig::new().with_incoming_reachability_timeout(Duration::from_millis(3000));
    let (bridge, _native) = bridge_with(config);
    let call_id = CallId::from("c7");
    bridge
        .on_create_incoming_connection(ConnectionRequest::new(call_id.clone(), "+15551234"))
        .await
        .unwrap();
    bridge.confirm_reachable();

    tokio::time::sleep(Duration::from_millis(5000)).await;
    assert_eq!(bridge.get_session(&call_id).await.unwrap().state, CallState::Ringing);
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_incoming_timer_after_hangup_is_discarded() {
    let config = BridgeConfig::new().with_incoming_reachability_timeout(Duration::from_millis(3000));
    let (bridge, native) = bridge_with(config);
    let call_id = CallId::from("c8");
    bridge
        .on_create_incoming_connection(ConnectionRequest::new(call_id.clone(), "+15551234"))
        .await
        .unwrap();
    bridge.on_disconnect(&call_id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(5000)).await;
    assert_eq!(native.count(|call| matches!(call, NativeCall::Disconnect(..))), 0);
    assert_eq!(
        bridge
            .pending_events()
            .iter()
            .filter(|event| event.action == EventAction::PerformEnd)
            .count(),
        1
    );
}
