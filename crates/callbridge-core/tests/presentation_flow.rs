//! Integration tests for the foreground presentation
//!
//! Covers the single-presentation rule, the audio-route toggle action
//! round trip through the service entry point, and plugin resolution.

use std::sync::Arc;

use rvoip_callbridge_core::native::NativeCall;
use rvoip_callbridge_core::presentation::RendererResult;
use rvoip_callbridge_core::{
    AudioRoute, BridgeConfig, BridgeError, BridgeResult, CallBridge, CallId, CallSession, ConnectionRequest,
    EventAction, ForegroundSettings, MinimalPresentation, Presentation, PresentationRegistry, PresentationRenderer,
    RecordingTelephony, ServiceCommand,
};
use serial_test::serial;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("rvoip_callbridge_core=debug")
        .with_test_writer()
        .try_init();
}

fn foreground() -> ForegroundSettings {
    ForegroundSettings::new("calls", "Calls")
        .with_title("On a call")
        .with_deeplink_scheme("acme")
}

fn presenting_bridge() -> (CallBridge, Arc<RecordingTelephony>) {
    init_tracing();
    let native = Arc::new(RecordingTelephony::new());
    let config = BridgeConfig::new().with_foreground(foreground());
    let bridge = CallBridge::new(config, native.clone()).expect("Failed to build bridge");
    (bridge, native)
}

async fn ring(bridge: &CallBridge, id: &str, name: &str) -> CallId {
    let call_id = CallId::from(id);
    bridge
        .on_create_incoming_connection(ConnectionRequest::new(call_id.clone(), "+15551234").with_display_name(name))
        .await
        .expect("Incoming connection failed");
    call_id
}

fn latest(native: &RecordingTelephony) -> Presentation {
    native.presentations().pop().expect("no presentation started")
}

/// Layout that shows the remote number under the caller's name
struct DetailedLayout;

impl PresentationRenderer for DetailedLayout {
    fn name(&self) -> &str {
        "detailed"
    }

    fn render(&self, session: &CallSession, settings: &ForegroundSettings) -> BridgeResult<Presentation> {
        let mut presentation = MinimalPresentation.render(session, settings)?;
        presentation.layout = self.name().to_string();
        presentation.text = format!("{}\n{}", session.display_name, session.address.number);
        Ok(presentation)
    }
}

#[tokio::test]
#[serial]
async fn test_presentation_reflects_session() {
    let (bridge, native) = presenting_bridge();
    let call_id = ring(&bridge, "c1", "Alice").await;

    let presentation = latest(&native);
    assert_eq!(presentation.call_id, call_id);
    assert_eq!(presentation.title, "On a call");
    assert_eq!(presentation.text, "Alice");
    assert_eq!(presentation.content_link.as_deref(), Some("acme://return-to-app?callUUID=c1"));
    assert!(!presentation.muted);

    bridge.answer_incoming_call(&call_id).await.unwrap();
    bridge.set_muted(&call_id, true).await.unwrap();
    assert!(latest(&native).muted);
}

#[tokio::test]
#[serial]
async fn test_audio_route_toggle_round_trip() {
    let (bridge, native) = presenting_bridge();
    let call_id = ring(&bridge, "c1", "Alice").await;
    bridge.answer_incoming_call(&call_id).await.unwrap();

    let toggle = latest(&native).toggle_route_action().cloned().unwrap();
    assert_eq!(toggle.label, "Speaker on");
    assert!(bridge.handle_service_command(toggle.command).await.unwrap());

    assert_eq!(
        native
            .calls()
            .iter()
            .filter(|call| matches!(call, NativeCall::SetAudioRoute(..)))
            .last(),
        Some(&NativeCall::SetAudioRoute(call_id.clone(), AudioRoute::Speaker))
    );
    let rendered = latest(&native);
    assert_eq!(rendered.audio_route, AudioRoute::Speaker);
    let toggle = rendered.toggle_route_action().cloned().unwrap();
    assert_eq!(toggle.label, "Speaker off");

    assert!(bridge.handle_service_command(toggle.command).await.unwrap());
    let rendered = latest(&native);
    assert_eq!(rendered.audio_route, AudioRoute::Earpiece);
    assert_eq!(rendered.toggle_route_action().unwrap().label, "Speaker on");
    assert_eq!(bridge.get_session(&call_id).await.unwrap().audio_route, AudioRoute::Earpiece);
}

#[tokio::test]
#[serial]
async fn test_end_call_action_dismisses_presentation() {
    let (bridge, native) = presenting_bridge();
    let call_id = ring(&bridge, "c1", "Alice").await;

    let end = latest(&native)
        .actions
        .into_iter()
        .find(|action| action.label == "End call")
        .unwrap();
    assert!(bridge.handle_service_command(end.command).await.unwrap());

    assert!(bridge.get_session(&call_id).await.is_none());
    assert!(!bridge.is_presenting().await);
    assert_eq!(native.foreground_stops(), 1);
    assert_eq!(bridge.pending_events().last().unwrap().action, EventAction::PerformEnd);
}

#[tokio::test]
#[serial]
async fn test_presentation_follows_remaining_call() {
    let (bridge, native) = presenting_bridge();
    let first = ring(&bridge, "c1", "Alice").await;
    let second = ring(&bridge, "c2", "Bob").await;
    assert_eq!(latest(&native).call_id, second);

    bridge.end_call(&second).await.unwrap();
    assert!(bridge.is_presenting().await);
    assert_eq!(latest(&native).call_id, first);
    assert_eq!(native.live_presentations().len(), 1);

    bridge.end_call(&first).await.unwrap();
    assert!(!bridge.is_presenting().await);
    assert!(native.live_presentations().is_empty());
}

#[tokio::test]
#[serial]
async fn test_every_started_presentation_is_stopped() {
    let (bridge, native) = presenting_bridge();
    let first = ring(&bridge, "c1", "Alice").await;
    ring(&bridge, "c2", "Bob").await;
    assert_eq!(native.live_presentations().len(), 1);

    bridge.answer_incoming_call(&first).await.unwrap();
    bridge.set_muted(&first, true).await.unwrap();
    assert_eq!(native.live_presentations().len(), 1);

    assert_eq!(bridge.end_all_calls().await.unwrap(), 2);
    assert!(native.presentations().len() >= 4);
    assert!(native.live_presentations().is_empty());
    assert_eq!(native.foreground_stops(), native.presentations().len());
}

#[tokio::test]
#[serial]
async fn test_call_in_progress_command_rerenders() {
    let (bridge, native) = presenting_bridge();
    let call_id = ring(&bridge, "c1", "Alice").await;
    let before = native.presentations().len();

    assert!(bridge
        .handle_service_command(ServiceCommand::CallInProgress { call_id })
        .await
        .unwrap());
    assert_eq!(native.presentations().len(), before + 1);

    assert!(!bridge
        .handle_service_command(ServiceCommand::CallInProgress {
            call_id: CallId::from("ghost")
        })
        .await
        .unwrap());
}

#[tokio::test]
#[serial]
async fn test_without_foreground_settings_nothing_is_presented() {
    init_tracing();
    let native = Arc::new(RecordingTelephony::new());
    let bridge = CallBridge::new(BridgeConfig::new(), native.clone()).unwrap();
    let call_id = ring(&bridge, "c1", "Alice").await;
    bridge.answer_incoming_call(&call_id).await.unwrap();
    bridge.end_call(&call_id).await.unwrap();

    assert!(native.presentations().is_empty());
    assert_eq!(native.foreground_stops(), 0);
}

#[tokio::test]
#[serial]
async fn test_registered_plugin_renders() {
    init_tracing();
    let native = Arc::new(RecordingTelephony::new());
    let plugins = Arc::new(PresentationRegistry::new());
    plugins.register("detailed", |_: &ForegroundSettings| -> RendererResult { Ok(Arc::new(DetailedLayout)) });

    let config = BridgeConfig::new()
        .with_foreground(foreground())
        .with_presentation_plugin("detailed");
    let bridge = CallBridge::with_plugins(config, native.clone(), plugins).unwrap();
    ring(&bridge, "c1", "Alice").await;

    let presentation = latest(&native);
    assert_eq!(presentation.layout, "detailed");
    assert_eq!(presentation.text, "Alice\n+15551234");
}

#[tokio::test]
#[serial]
async fn test_missing_plugin_fails_loudly() {
    init_tracing();
    let native = Arc::new(RecordingTelephony::new());
    let config = BridgeConfig::new()
        .with_foreground(foreground())
        .with_presentation_plugin("com.acme.RichCallLayout");
    let bridge = CallBridge::new(config, native.clone()).unwrap();

    let err = bridge
        .on_create_incoming_connection(ConnectionRequest::new("c1", "+15551234"))
        .await
        .unwrap_err();
    match &err {
        BridgeError::PluginResolutionFailed { plugin, .. } => assert_eq!(plugin, "com.acme.RichCallLayout"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.to_string().contains("com.acme.RichCallLayout"));
    assert!(!err.is_recoverable());
    assert!(native.presentations().is_empty());
}
