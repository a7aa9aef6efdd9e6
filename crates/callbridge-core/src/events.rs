//! Event Bridge
//!
//! Outbound delivery of call events to the application layer.
//!
//! # Delivery model
//!
//! Delivery is best-effort broadcast with listener-gated buffering. While
//! an application listener is attached, [`EventBridge::publish`] sends the
//! event on a `tokio::sync::broadcast` channel straight away. While no
//! listener is attached, or when the send finds no live receiver, the event
//! is appended to a FIFO pending queue instead.
//!
//! Native callbacks routinely fire before the application has registered a
//! listener (cold start, or a process woken only to answer a call). The
//! pending queue keeps the first events of such a call.
//!
//! [`EventBridge::start_observing`] attaches the listener and flushes the
//! queue in enqueue order. A flush never overruns the broadcast channel's
//! capacity: whatever does not fit stays queued and later publishes line up
//! behind it, so a slow receiver sees every event in order instead of a
//! lag error. The listener flag and the queue share one lock:
//! a publish racing an attach lands either in the queue before the snapshot
//! or on the channel after the flush, never both and never neither.
//!
//! # Usage
//!
//! ```rust
//! # use rvoip_callbridge_core::events::{EventBridge, EventAction};
//! # use std::collections::BTreeMap;
//! # tokio_test::block_on(async {
//! let bridge = EventBridge::new(16);
//! bridge.publish(EventAction::CheckReachability, BTreeMap::new());
//! assert_eq!(bridge.pending_len(), 1);
//!
//! let mut rx = bridge.subscribe();
//! assert_eq!(bridge.start_observing(), 1);
//! let event = rx.recv().await.unwrap();
//! assert_eq!(event.action, EventAction::CheckReachability);
//! # });
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, trace, warn};

use crate::call::{keys, CallId};
use crate::error::BridgeError;

/// Outbound event actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventAction {
    /// An incoming call was handed to the native subsystem
    CallDisplayRequested,
    /// The user answered
    PerformAnswer,
    /// The call ended
    PerformEnd,
    ToggleHold,
    ToggleMute,
    DtmfPerformed,
    AudioSessionActivated,
    /// Ask the application whether it is alive
    CheckReachability,
    /// Self-managed incoming call needs its own UI
    ShowIncomingCallUi,
    IncomingConnectionFailed,
    AudioRouteChanged,
    /// The application process is being woken for a call
    WakeApplication,
    /// An outgoing connection was created
    StartCallRequested,
    /// The user silenced the ringer
    SilenceIncomingCall,
}

impl EventAction {
    /// Wire name of the action
    pub fn as_str(&self) -> &'static str {
        match self {
            EventAction::CallDisplayRequested => "call-display-requested",
            EventAction::PerformAnswer => "perform-answer",
            EventAction::PerformEnd => "perform-end",
            EventAction::ToggleHold => "toggle-hold",
            EventAction::ToggleMute => "toggle-mute",
            EventAction::DtmfPerformed => "dtmf-performed",
            EventAction::AudioSessionActivated => "audio-session-activated",
            EventAction::CheckReachability => "check-reachability",
            EventAction::ShowIncomingCallUi => "show-incoming-call-ui",
            EventAction::IncomingConnectionFailed => "incoming-connection-failed",
            EventAction::AudioRouteChanged => "audio-route-changed",
            EventAction::WakeApplication => "wake-application",
            EventAction::StartCallRequested => "start-call-requested",
            EventAction::SilenceIncomingCall => "silence-incoming-call",
        }
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event attributes, ordered for stable serialization
pub type EventAttributes = BTreeMap<String, String>;

/// An outbound event, pending or delivered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeEvent {
    pub action: EventAction,
    pub attributes: EventAttributes,
    pub created_at: DateTime<Utc>,
}

impl BridgeEvent {
    pub fn new(action: EventAction, attributes: EventAttributes) -> Self {
        Self {
            action,
            attributes,
            created_at: Utc::now(),
        }
    }

    /// The call this event is about, if any
    pub fn call_id(&self) -> Option<CallId> {
        self.attributes.get(keys::CALL_UUID).map(|id| CallId::from(id.as_str()))
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

#[derive(Debug, Default)]
struct BridgeState {
    has_listener: bool,
    pending: VecDeque<BridgeEvent>,
}

/// Outbound event router with pending-event buffering
#[derive(Debug)]
pub struct EventBridge {
    state: Mutex<BridgeState>,
    event_tx: broadcast::Sender<BridgeEvent>,
    capacity: usize,
}

impl EventBridge {
    /// Create a bridge whose broadcast channel holds `capacity` events
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (event_tx, _) = broadcast::channel(capacity);
        Self {
            state: Mutex::new(BridgeState::default()),
            event_tx,
            capacity,
        }
    }

    /// Publish an event: deliver now if a listener is attached, else buffer.
    ///
    /// Events still queued from an earlier flush go out first.
    pub fn publish(&self, action: EventAction, attributes: EventAttributes) {
        let mut state = self.state.lock();
        state.pending.push_back(BridgeEvent::new(action, attributes));

        if !state.has_listener {
            debug!(action = %action, pending = state.pending.len(), "No listener attached, buffering event");
            return;
        }

        let (delivered, orphaned) = self.drain(&mut state);
        if orphaned {
            debug!(action = %action, pending = state.pending.len(), "No live receiver, buffering event");
        } else if state.pending.is_empty() {
            trace!(action = %action, delivered, "Event delivered");
        } else {
            debug!(action = %action, pending = state.pending.len(), "Channel full, event queued");
        }
    }

    /// Subscribe a receiver to the delivery channel.
    ///
    /// Subscribing alone does not attach the listener; call
    /// [`start_observing`](Self::start_observing) once the receiver is ready.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.event_tx.subscribe()
    }

    /// Stream adapter over a fresh subscription
    pub fn subscribe_stream(&self) -> BroadcastStream<BridgeEvent> {
        BroadcastStream::new(self.event_tx.subscribe())
    }

    /// Attach the listener and flush pending events in enqueue order.
    ///
    /// Returns the number of events delivered. The flush never sends more
    /// than the channel has room for; the rest stay queued, in order, and go
    /// out on the next publish or the next call to this method, once the
    /// receiver has caught up. If no receiver is live the remaining events
    /// stay queued and the listener is marked detached again.
    pub fn start_observing(&self) -> usize {
        let mut state = self.state.lock();
        state.has_listener = true;
        let total = state.pending.len();
        debug!(count = total, "Listener attached, flushing pending events");

        let (delivered, orphaned) = self.drain(&mut state);
        if orphaned {
            warn!(
                delivered,
                remaining = state.pending.len(),
                "Listener has no live receiver, keeping remaining events pending"
            );
            state.has_listener = false;
        } else if delivered < total {
            debug!(
                delivered,
                remaining = state.pending.len(),
                "Channel full, keeping remaining events pending"
            );
        }

        delivered
    }

    /// Send queued events oldest first while the channel has room.
    ///
    /// Returns the number sent and whether a send found no live receiver.
    /// A broadcast send into a full channel would evict the oldest unread
    /// event, so sending stops at capacity.
    fn drain(&self, state: &mut BridgeState) -> (usize, bool) {
        let mut delivered = 0;
        while self.event_tx.len() < self.capacity {
            let Some(event) = state.pending.pop_front() else {
                break;
            };
            if let Err(broadcast::error::SendError(event)) = self.event_tx.send(event) {
                let failure = BridgeError::DeliveryFailed {
                    action: event.action.to_string(),
                };
                trace!(error = %failure, "Requeueing event");
                state.pending.push_front(event);
                return (delivered, true);
            }
            delivered += 1;
        }
        (delivered, false)
    }

    /// Detach the listener; subsequent events are buffered
    pub fn stop_observing(&self) {
        self.state.lock().has_listener = false;
        debug!("Listener detached");
    }

    pub fn has_listener(&self) -> bool {
        self.state.lock().has_listener
    }

    /// Snapshot of the pending queue, oldest first
    pub fn pending_events(&self) -> Vec<BridgeEvent> {
        self.state.lock().pending.iter().cloned().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Drop every pending event
    pub fn clear_pending(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.pending.len();
        state.pending.clear();
        dropped
    }
}

/// Attribute map builder for call-scoped events
pub fn call_attributes(call_id: &CallId) -> EventAttributes {
    let mut attrs = EventAttributes::new();
    attrs.insert(keys::CALL_UUID.to_string(), call_id.to_string());
    attrs
}
