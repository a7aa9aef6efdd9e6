//! Native callback adapters
//!
//! The native subsystem reports connection creation and user-initiated
//! changes through these functions. They drive the state machine, publish
//! the matching application events and keep the presentation current.

use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use crate::call::{
    keys, AudioRoute, CallDirection, CallId, CallSession, CallState, Capabilities, DisconnectReason, NewSession,
    RemoteAddress,
};
use crate::error::{BridgeError, BridgeResult};
use crate::events::{EventAction, EventAttributes};
use crate::native::{ConnectionOutcome, ConnectionRequest, WakeRequest};
use crate::state_machine::CallEvent;

use super::CallBridge;

impl CallBridge {
    /// Capabilities granted to every new connection
    fn base_capabilities(&self) -> Capabilities {
        let mut capabilities = Capabilities::MUTE | Capabilities::HOLD;
        if self.inner.config.self_managed() {
            capabilities.insert(Capabilities::SELF_MANAGED);
        }
        capabilities
    }

    /// Register a session for a creation request and move it out of
    /// `Initializing` with `event`.
    async fn register_connection(
        &self,
        call_id: CallId,
        attrs: NewSession,
        event: CallEvent,
    ) -> BridgeResult<CallSession> {
        self.inner.registry.create(call_id.clone(), attrs).await?;
        self.apply_event(&call_id, event).await
    }

    /// The platform created an incoming connection.
    ///
    /// A request without an address yields [`ConnectionOutcome::Failed`]
    /// and registers nothing. A presentation failure is returned as an
    /// error after the session has been registered.
    pub async fn on_create_incoming_connection(&self, request: ConnectionRequest) -> BridgeResult<ConnectionOutcome> {
        let Some(raw_address) = request.address.as_deref().filter(|a| !a.is_empty()) else {
            warn!(call_id = ?request.call_id, "Incoming connection request without address");
            return Ok(ConnectionOutcome::Failed {
                reason: DisconnectReason::Failed,
                error: BridgeError::malformed_request("incoming connection request has no address"),
            });
        };

        let call_id = request.call_id.clone().unwrap_or_default();
        let address = RemoteAddress::parse(raw_address);
        let display_name = request.display_name.clone().unwrap_or_else(|| address.number.clone());

        let attrs = NewSession {
            direction: CallDirection::Incoming,
            address,
            display_name,
            capabilities: self.base_capabilities(),
            add_call_disabled: !self.can_make_multiple_calls(),
            extras: request.extras,
        };

        let session = match self.register_connection(call_id, attrs, CallEvent::IncomingRequested).await {
            Ok(session) => session,
            Err(error) => {
                return Ok(ConnectionOutcome::Failed {
                    reason: DisconnectReason::Failed,
                    error,
                })
            }
        };
        info!(
            call_id = %session.id,
            number = %session.address.number,
            reachable = self.inner.reachability.is_reachable(),
            "Incoming connection created"
        );

        self.arm_incoming_timer(&session.id);
        self.present(&session).await?;
        Ok(ConnectionOutcome::Created(session))
    }

    /// The platform created an outgoing connection.
    ///
    /// Wakes the application when it is not in the foreground, and starts a
    /// reachability check when it has not initialized yet. When the
    /// application is in the foreground, reachable but unavailable, a failed
    /// connection is returned instead.
    pub async fn on_create_outgoing_connection(&self, request: ConnectionRequest) -> BridgeResult<ConnectionOutcome> {
        let Some(raw_address) = request.address.as_deref().filter(|a| !a.is_empty()) else {
            warn!(call_id = ?request.call_id, "Outgoing connection request without address");
            return Ok(ConnectionOutcome::Failed {
                reason: DisconnectReason::Failed,
                error: BridgeError::malformed_request("outgoing connection request has no address"),
            });
        };

        let call_id = request.call_id.clone().unwrap_or_default();
        let address = RemoteAddress::parse(raw_address);
        let display_name = request.display_name.clone().unwrap_or_default();
        let wake = WakeRequest {
            call_id: call_id.clone(),
            number: address.number.clone(),
            display_name: display_name.clone(),
        };

        let reachability = &self.inner.reachability;
        if !reachability.is_initialized() && !reachability.is_reachable() {
            reachability.check_reachability(wake.clone());
        }

        if !self.inner.native.is_app_in_foreground() {
            debug!(call_id = %call_id, "Application in background, waking it");
            if let Err(e) = reachability.wake_application(wake).await {
                warn!(call_id = %call_id, error = %e, "Wake-up failed");
            }
        } else if !reachability.is_available() && reachability.is_reachable() {
            info!(call_id = %call_id, "Application not available, failing outgoing connection");
            return Ok(ConnectionOutcome::Failed {
                reason: DisconnectReason::Local,
                error: BridgeError::unsupported("application is not available for outgoing calls"),
            });
        }

        let recorded = request
            .extras_number
            .as_deref()
            .map(RemoteAddress::parse)
            .unwrap_or_else(|| address.clone());
        let attrs = NewSession {
            direction: CallDirection::Outgoing,
            address: recorded.clone(),
            display_name: display_name.clone(),
            capabilities: self.base_capabilities(),
            add_call_disabled: !self.can_make_multiple_calls(),
            extras: request.extras,
        };
        if !self.can_make_multiple_calls() {
            debug!(call_id = %call_id, "Multiple calls disabled for this connection");
        }

        let session = match self.register_connection(call_id.clone(), attrs, CallEvent::OutgoingRequested).await {
            Ok(session) => session,
            Err(error) => {
                return Ok(ConnectionOutcome::Failed {
                    reason: DisconnectReason::Failed,
                    error,
                })
            }
        };
        self.inner.has_outgoing_call.store(true, Ordering::SeqCst);

        // The address the platform dialled wins over the number recorded
        // when the call was requested.
        let session = if recorded.number != address.number {
            debug!(call_id = %call_id, recorded = %recorded.number, dialled = %address.number, "Outgoing number changed");
            self.inner
                .registry
                .with_session_mut(&call_id, |session| {
                    session.update_identity(address, display_name);
                    session.clone()
                })
                .await?
        } else {
            session
        };
        info!(call_id = %call_id, number = %session.address.number, "Outgoing connection created");

        self.present(&session).await?;
        let attrs = session.event_attributes();
        self.inner.events.publish(EventAction::StartCallRequested, attrs.clone());
        self.inner.events.publish(EventAction::AudioSessionActivated, attrs);
        Ok(ConnectionOutcome::Created(session))
    }

    /// The platform could not create an incoming connection.
    ///
    /// Publishes a single `incoming-connection-failed` event.
    pub fn on_create_incoming_connection_failed(&self, request: &ConnectionRequest) {
        let mut attrs = request.extras.clone();
        if let Some(call_id) = &request.call_id {
            attrs.insert(keys::CALL_UUID.to_string(), call_id.to_string());
        }
        if let Some(raw) = &request.address {
            let address = RemoteAddress::parse(raw);
            attrs.insert(keys::HANDLE.to_string(), address.number);
            if let Some(schema) = address.schema {
                attrs.insert(keys::SCHEMA.to_string(), schema);
            }
        }
        if let Some(name) = &request.display_name {
            attrs.insert(keys::NAME.to_string(), name.clone());
        }

        warn!(call_id = ?request.call_id, "Incoming connection failed");
        self.inner.events.publish(EventAction::IncomingConnectionFailed, attrs);
    }

    pub async fn on_answer(&self, call_id: &CallId) -> BridgeResult<bool> {
        let Some(session) = self.try_apply_event(call_id, CallEvent::Answer).await else {
            return Ok(false);
        };
        self.cancel_incoming_timer(call_id);

        let attrs = session.event_attributes();
        self.inner.events.publish(EventAction::PerformAnswer, attrs.clone());
        self.inner.events.publish(EventAction::AudioSessionActivated, attrs);
        info!(call_id = %call_id, "Call answered");

        self.present(&session).await?;
        Ok(true)
    }

    /// Rejects a ringing call; a call in any other state is disconnected
    pub async fn on_reject(&self, call_id: &CallId) -> BridgeResult<bool> {
        self.terminate_session(call_id, CallEvent::Reject, true).await
    }

    pub async fn on_disconnect(&self, call_id: &CallId) -> BridgeResult<bool> {
        self.terminate_session(call_id, CallEvent::Disconnect, true).await
    }

    /// The native connection failed or was aborted
    pub async fn on_abort(&self, call_id: &CallId) -> BridgeResult<bool> {
        self.terminate_session(call_id, CallEvent::NativeFailure, true).await
    }

    pub async fn on_hold(&self, call_id: &CallId) -> BridgeResult<bool> {
        self.hold_changed(call_id, true).await
    }

    pub async fn on_unhold(&self, call_id: &CallId) -> BridgeResult<bool> {
        self.hold_changed(call_id, false).await
    }

    async fn hold_changed(&self, call_id: &CallId, hold: bool) -> BridgeResult<bool> {
        let event = if hold { CallEvent::Hold } else { CallEvent::Unhold };
        let Some(session) = self.try_apply_event(call_id, event).await else {
            return Ok(false);
        };

        let mut attrs = session.event_attributes();
        attrs.insert(keys::HOLD.to_string(), hold.to_string());
        self.inner.events.publish(EventAction::ToggleHold, attrs);

        self.present(&session).await?;
        Ok(true)
    }

    /// The remote side connected an outgoing call
    pub async fn on_native_active(&self, call_id: &CallId) -> BridgeResult<bool> {
        let Some(session) = self.try_apply_event(call_id, CallEvent::NativeActive).await else {
            return Ok(false);
        };
        info!(call_id = %call_id, "Outgoing call connected");
        self.present(&session).await?;
        Ok(true)
    }

    pub async fn on_play_dtmf(&self, call_id: &CallId, digit: char) -> BridgeResult<bool> {
        let Some(session) = self.lookup(call_id, "play_dtmf").await else {
            return Ok(false);
        };
        let mut attrs = session.event_attributes();
        attrs.insert(keys::DIGITS.to_string(), digit.to_string());
        self.inner.events.publish(EventAction::DtmfPerformed, attrs);
        Ok(true)
    }

    /// The platform changed the audio route or the mute state of a call
    pub async fn on_audio_state_changed(&self, call_id: &CallId, route: AudioRoute, muted: bool) -> BridgeResult<bool> {
        let updated = self
            .inner
            .registry
            .with_session_mut(call_id, |session| {
                let route_changed = session.audio_route != route;
                let mute_changed = session.muted != muted;
                session.audio_route = route;
                session.muted = muted;
                (session.clone(), route_changed, mute_changed)
            })
            .await;
        let Ok((session, route_changed, mute_changed)) = updated else {
            warn!(call_id = %call_id, "Audio state change for unknown call");
            return Ok(false);
        };

        if route_changed {
            let mut attrs = session.event_attributes();
            attrs.insert(keys::OUTPUT.to_string(), route.as_str().to_string());
            self.inner.events.publish(EventAction::AudioRouteChanged, attrs);
        }
        if mute_changed {
            let mut attrs = session.event_attributes();
            attrs.insert(keys::MUTED.to_string(), muted.to_string());
            self.inner.events.publish(EventAction::ToggleMute, attrs);
        }
        if route_changed || mute_changed {
            self.present(&session).await?;
        }
        Ok(route_changed || mute_changed)
    }

    /// A self-managed incoming call needs the application's own UI
    pub async fn on_show_incoming_call_ui(&self, call_id: &CallId) -> bool {
        self.publish_for_call(call_id, EventAction::ShowIncomingCallUi).await
    }

    /// The user silenced the ringer
    pub async fn on_silence(&self, call_id: &CallId) -> bool {
        self.publish_for_call(call_id, EventAction::SilenceIncomingCall).await
    }

    async fn publish_for_call(&self, call_id: &CallId, action: EventAction) -> bool {
        let attrs: EventAttributes = match self.inner.registry.get(call_id).await {
            Ok(session) => session.event_attributes(),
            Err(_) => {
                warn!(call_id = %call_id, action = %action, "Ignored, no session for call");
                return false;
            }
        };
        self.inner.events.publish(action, attrs);
        true
    }

    /// The platform merged two calls into a conference.
    ///
    /// Held members are resumed first, then the two sessions are grouped and
    /// the native subsystem is told about the conference.
    pub async fn on_conference(&self, first: &CallId, second: &CallId) -> BridgeResult<bool> {
        let mut members = Vec::with_capacity(2);
        for call_id in [first, second] {
            match self.lookup(call_id, "conference").await {
                Some(session) => members.push(session),
                None => return Ok(false),
            }
        }

        for session in &members {
            if session.state == CallState::Holding {
                self.inner.native.unhold(&session.id).await?;
                self.hold_changed(&session.id, false).await?;
            }
        }

        let conference_id = self.inner.registry.group(first, second).await?;
        self.inner
            .native
            .create_conference(&[first.clone(), second.clone()])
            .await?;

        info!(conference_id = %conference_id, first = %first, second = %second, "Conference created");
        Ok(true)
    }
}
