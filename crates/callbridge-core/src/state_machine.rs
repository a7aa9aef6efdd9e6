//! Call Session State Machine
//!
//! Pure transition logic for a single call. The table is kept free of any
//! native or async types so it can be checked in isolation; the
//! [`CallBridge`](crate::bridge::CallBridge) applies the resulting state
//! under the registry lock and performs the side effects.
//!
//! ```text
//!   Initializing --incoming--> Ringing --answer--> Active <--unhold-- Holding
//!   Initializing --outgoing--> Dialing --native active--> Active --hold--> Holding
//!   Ringing --reject--> Disconnected
//!   Ringing/Dialing --hold--> Holding
//!   any live state --disconnect | native failure--> Disconnected
//! ```
//!
//! `Disconnected` is terminal: every event applied to it is rejected.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::call::{CallId, CallState};
use crate::error::{BridgeError, BridgeResult};

/// Typed events driving a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallEvent {
    /// Native subsystem created an incoming connection
    IncomingRequested,
    /// Native subsystem created an outgoing connection
    OutgoingRequested,
    /// Incoming call answered
    Answer,
    /// Incoming call rejected
    Reject,
    /// Remote side connected an outgoing call
    NativeActive,
    Hold,
    Unhold,
    /// Local or remote hangup
    Disconnect,
    /// Native connection failed or was aborted
    NativeFailure,
}

impl CallEvent {
    pub const ALL: [CallEvent; 9] = [
        CallEvent::IncomingRequested,
        CallEvent::OutgoingRequested,
        CallEvent::Answer,
        CallEvent::Reject,
        CallEvent::NativeActive,
        CallEvent::Hold,
        CallEvent::Unhold,
        CallEvent::Disconnect,
        CallEvent::NativeFailure,
    ];
}

impl fmt::Display for CallEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallEvent::IncomingRequested => "incoming_requested",
            CallEvent::OutgoingRequested => "outgoing_requested",
            CallEvent::Answer => "answer",
            CallEvent::Reject => "reject",
            CallEvent::NativeActive => "native_active",
            CallEvent::Hold => "hold",
            CallEvent::Unhold => "unhold",
            CallEvent::Disconnect => "disconnect",
            CallEvent::NativeFailure => "native_failure",
        };
        f.write_str(name)
    }
}

/// Transition table for call sessions
#[derive(Debug, Clone, Copy, Default)]
pub struct StateMachine;

impl StateMachine {
    /// Target state for `event` in `current`, if the edge exists
    pub fn target(current: CallState, event: CallEvent) -> Option<CallState> {
        use CallEvent::*;
        use CallState::*;

        match (current, event) {
            (Disconnected, _) => None,

            (Initializing, IncomingRequested) => Some(Ringing),
            (Initializing, OutgoingRequested) => Some(Dialing),

            (Ringing, Answer) => Some(Active),
            (Ringing, Reject) => Some(Disconnected),
            (Dialing, NativeActive) => Some(Active),

            (Active | Ringing | Dialing, Hold) => Some(Holding),
            (Holding, Unhold) => Some(Active),

            (_, Disconnect | NativeFailure) => Some(Disconnected),

            _ => None,
        }
    }

    /// Next state for a session, or [`BridgeError::InvalidTransition`]
    pub fn next_state(call_id: &CallId, current: CallState, event: CallEvent) -> BridgeResult<CallState> {
        Self::target(current, event).ok_or_else(|| BridgeError::InvalidTransition {
            call_id: call_id.clone(),
            from: current,
            event: event.to_string(),
        })
    }

    /// Event that moves `current` to `requested`, used when the application
    /// or the native layer asks for a state directly.
    ///
    /// Returns `None` when no single table edge leads there. Requests for
    /// `Disconnected` are not mapped; hangups go through the disconnect path.
    pub fn event_for_target(current: CallState, requested: CallState) -> Option<CallEvent> {
        use CallState::*;

        match (current, requested) {
            (Dialing, Active) => Some(CallEvent::NativeActive),
            (Ringing, Active) => Some(CallEvent::Answer),
            (Holding, Active) => Some(CallEvent::Unhold),
            (Active | Ringing | Dialing, Holding) => Some(CallEvent::Hold),
            (Initializing, Ringing) => Some(CallEvent::IncomingRequested),
            (Initializing, Dialing) => Some(CallEvent::OutgoingRequested),
            _ => None,
        }
    }
}
