//! # rvoip-callbridge-core
//!
//! Bridge between an application's call-handling logic and a platform's
//! native telephony subsystem.
//!
//! The native side creates connections, reports hold, mute, audio-route
//! changes and hangups, and runs the ongoing-call presentation. The
//! application side issues commands (answer, end, mute, route audio) and
//! consumes an ordered stream of events. The bridge sits in between:
//!
//! - every live call is a [`CallSession`] in a [`SessionRegistry`], moved
//!   through a fixed transition table by the [`StateMachine`]
//! - outbound events go through the [`EventBridge`], which buffers them
//!   until the application attaches a listener
//! - the [`ReachabilityCoordinator`] wakes a suspended application for an
//!   outgoing call it has not confirmed
//! - the [`PresentationCoordinator`] keeps one foreground presentation in
//!   step with the most recent live session
//!
//! [`CallBridge`] ties these together and is the only type most hosts use.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use rvoip_callbridge_core::{
//!     BridgeConfig, CallBridge, CallId, CallState, ConnectionRequest, EventAction,
//!     RecordingTelephony,
//! };
//!
//! # tokio_test::block_on(async {
//! let native = Arc::new(RecordingTelephony::new());
//! let bridge = CallBridge::new(BridgeConfig::default(), native.clone()).unwrap();
//! bridge.setup().await.unwrap();
//!
//! // The platform reports a new incoming connection
//! let call_id = CallId::from("c1");
//! bridge
//!     .on_create_incoming_connection(ConnectionRequest::new(call_id.clone(), "sip:12345"))
//!     .await
//!     .unwrap();
//! assert_eq!(bridge.get_session(&call_id).await.unwrap().state, CallState::Ringing);
//!
//! // The user answers; the event waits until the application listens
//! bridge.answer_incoming_call(&call_id).await.unwrap();
//! let mut events = bridge.subscribe();
//! bridge.start_observing();
//! assert_eq!(events.recv().await.unwrap().action, EventAction::PerformAnswer);
//! # });
//! ```

pub mod bridge;
pub mod call;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod native;
pub mod presentation;
pub mod reachability;
pub mod registry;
pub mod state_machine;

pub use bridge::CallBridge;
pub use call::{
    AudioRoute, CallDirection, CallId, CallSession, CallState, CallStats, Capabilities, DisconnectReason,
    RemoteAddress,
};
pub use config::{AccountDescriptor, BridgeConfig, ForegroundSettings};
pub use error::{BridgeError, BridgeResult, CommandRejection};
pub use logging::LogSettings;
pub use events::{BridgeEvent, EventAction, EventAttributes, EventBridge};
pub use native::{CallRequest, ConnectionOutcome, ConnectionRequest, NativeTelephony, RecordingTelephony, WakeRequest};
pub use presentation::{
    MinimalPresentation, Presentation, PresentationCoordinator, PresentationRegistry, PresentationRenderer,
    ServiceCommand,
};
pub use reachability::ReachabilityCoordinator;
pub use registry::SessionRegistry;
pub use state_machine::{CallEvent, StateMachine};

/// Callbridge-core version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
