//! Application commands
//!
//! Every command resolves the call in the registry first. An unknown call id
//! is logged at warn level and the command resolves to `Ok(false)`; on a
//! platform without native telephony every command resolves to `Ok(false)`
//! without touching the native layer.

use tracing::{debug, info, warn};

use crate::call::{keys, AudioRoute, CallId, CallState, Capabilities, DisconnectReason, RemoteAddress};
use crate::error::{BridgeError, BridgeResult, CommandRejection};
use crate::events::{EventAction, EventAttributes};
use crate::native::CallRequest;
use crate::state_machine::{CallEvent, StateMachine};

use super::CallBridge;

/// Characters accepted as a DTMF tone
const DTMF_DIGITS: &str = "0123456789ABCD*#";

impl CallBridge {
    /// Hand an incoming call to the native subsystem.
    ///
    /// The platform answers with
    /// [`on_create_incoming_connection`](Self::on_create_incoming_connection).
    pub async fn display_incoming_call(
        &self,
        call_id: impl Into<CallId>,
        number: &str,
        display_name: &str,
    ) -> BridgeResult<bool> {
        self.display_incoming_call_with_payload(CallRequest {
            call_id: call_id.into(),
            number: number.to_string(),
            display_name: display_name.to_string(),
            payload: None,
        })
        .await
    }

    /// Like [`display_incoming_call`](Self::display_incoming_call), echoing
    /// `payload` back in `call-display-requested`
    pub async fn display_incoming_call_with_payload(&self, request: CallRequest) -> BridgeResult<bool> {
        if !self.is_supported() {
            return Ok(false);
        }
        self.inner.native.add_incoming_call(&request).await?;

        let mut attrs = EventAttributes::new();
        attrs.insert(keys::CALL_UUID.to_string(), request.call_id.to_string());
        attrs.insert(keys::HANDLE.to_string(), request.number.clone());
        attrs.insert(keys::NAME.to_string(), request.display_name.clone());
        if let Some(payload) = &request.payload {
            attrs.insert(keys::PAYLOAD.to_string(), payload.clone());
        }
        self.inner.events.publish(EventAction::CallDisplayRequested, attrs);

        info!(call_id = %request.call_id, number = %request.number, "Incoming call displayed");
        Ok(true)
    }

    /// Ask the native subsystem to place an outgoing call.
    ///
    /// The platform answers with
    /// [`on_create_outgoing_connection`](Self::on_create_outgoing_connection).
    pub async fn start_call(&self, call_id: impl Into<CallId>, number: &str, display_name: &str) -> BridgeResult<bool> {
        if !self.is_supported() {
            return Ok(false);
        }
        let request = CallRequest {
            call_id: call_id.into(),
            number: number.to_string(),
            display_name: display_name.to_string(),
            payload: None,
        };
        self.inner.native.place_call(&request).await?;
        info!(call_id = %request.call_id, number = %request.number, "Outgoing call requested");
        Ok(true)
    }

    pub async fn answer_incoming_call(&self, call_id: &CallId) -> BridgeResult<bool> {
        if !self.is_supported() || self.lookup(call_id, "answer").await.is_none() {
            return Ok(false);
        }
        self.inner.native.answer(call_id).await?;
        self.on_answer(call_id).await
    }

    pub async fn reject_call(&self, call_id: &CallId) -> BridgeResult<bool> {
        if !self.is_supported() || self.lookup(call_id, "reject").await.is_none() {
            return Ok(false);
        }
        self.inner.native.reject(call_id).await?;
        self.on_reject(call_id).await
    }

    /// Hang up locally; publishes `perform-end`
    pub async fn end_call(&self, call_id: &CallId) -> BridgeResult<bool> {
        if !self.is_supported() || self.lookup(call_id, "end_call").await.is_none() {
            return Ok(false);
        }
        self.inner.native.disconnect(call_id, DisconnectReason::Local).await?;
        self.terminate_session(call_id, CallEvent::Disconnect, true).await
    }

    /// End every live call and stop the presentation once.
    ///
    /// Returns the number of calls ended.
    pub async fn end_all_calls(&self) -> BridgeResult<usize> {
        if !self.is_supported() {
            return Ok(0);
        }

        for call_id in self.inner.registry.ids().await {
            if let Err(e) = self.inner.native.disconnect(&call_id, DisconnectReason::Local).await {
                warn!(call_id = %call_id, error = %e, "Native disconnect failed, ending session anyway");
            }
        }

        let ended = self.inner.registry.clear().await;
        for session in &ended {
            self.cancel_incoming_timer(&session.id);
            self.inner
                .events
                .publish(EventAction::PerformEnd, session.event_attributes());
        }
        self.inner
            .has_outgoing_call
            .store(false, std::sync::atomic::Ordering::SeqCst);

        self.inner.presentation.stop().await?;
        info!(count = ended.len(), "All calls ended");
        Ok(ended.len())
    }

    /// Report that a call ended for `reason`; no `perform-end` is published
    pub async fn report_end_call(&self, call_id: &CallId, reason: DisconnectReason) -> BridgeResult<bool> {
        if !self.is_supported() || self.lookup(call_id, "report_end_call").await.is_none() {
            return Ok(false);
        }
        self.inner.native.disconnect(call_id, reason).await?;
        debug!(call_id = %call_id, reason = ?reason, "Call end reported");
        self.terminate_session(call_id, CallEvent::Disconnect, false).await
    }

    pub async fn set_on_hold(&self, call_id: &CallId, hold: bool) -> BridgeResult<bool> {
        if !self.is_supported() {
            return Ok(false);
        }
        let Some(session) = self.lookup(call_id, "set_on_hold").await else {
            return Ok(false);
        };

        let event = if hold { CallEvent::Hold } else { CallEvent::Unhold };
        if StateMachine::target(session.state, event).is_none() {
            warn!(call_id = %call_id, state = ?session.state, hold, "Hold change not allowed in current state");
            return Ok(false);
        }

        if hold {
            self.inner.native.hold(call_id).await?;
            self.on_hold(call_id).await
        } else {
            self.inner.native.unhold(call_id).await?;
            self.on_unhold(call_id).await
        }
    }

    pub async fn set_muted(&self, call_id: &CallId, muted: bool) -> BridgeResult<bool> {
        if !self.is_supported() || self.lookup(call_id, "set_muted").await.is_none() {
            return Ok(false);
        }
        self.inner.native.set_muted(call_id, muted).await?;

        let session = self
            .inner
            .registry
            .with_session_mut(call_id, |session| {
                session.muted = muted;
                session.clone()
            })
            .await?;

        let mut attrs = session.event_attributes();
        attrs.insert(keys::MUTED.to_string(), muted.to_string());
        self.inner.events.publish(EventAction::ToggleMute, attrs);

        self.present(&session).await?;
        Ok(true)
    }

    /// Switch the audio output of a call.
    ///
    /// `route` is a platform route name: `"Bluetooth"`, `"Headset"`,
    /// `"Speaker"`; anything else selects the earpiece. A native failure
    /// rejects with code `SetAudioRoute`.
    pub async fn set_audio_route(&self, call_id: &CallId, route: &str) -> Result<bool, CommandRejection> {
        let route: AudioRoute = route.parse().unwrap_or_default();
        self.route_audio(call_id, route)
            .await
            .map_err(|e| e.reject("SetAudioRoute"))
    }

    /// Switch between speaker and earpiece
    pub async fn toggle_audio_route_speaker(&self, call_id: &CallId, speaker: bool) -> Result<bool, CommandRejection> {
        let route = if speaker { AudioRoute::Speaker } else { AudioRoute::Earpiece };
        self.route_audio(call_id, route)
            .await
            .map_err(|e| e.reject("SetAudioRoute"))
    }

    pub(crate) async fn route_audio(&self, call_id: &CallId, route: AudioRoute) -> BridgeResult<bool> {
        if !self.is_supported() || self.lookup(call_id, "set_audio_route").await.is_none() {
            return Ok(false);
        }
        self.inner.native.set_audio_route(call_id, route).await?;

        let session = self
            .inner
            .registry
            .with_session_mut(call_id, |session| {
                session.audio_route = route;
                session.clone()
            })
            .await?;
        debug!(call_id = %call_id, route = %route, "Audio route set");

        if matches!(route, AudioRoute::Speaker | AudioRoute::Earpiece) {
            self.present(&session).await?;
        }
        Ok(true)
    }

    /// Play a DTMF tone; only the first character of `digits` is sent
    pub async fn send_dtmf(&self, call_id: &CallId, digits: &str) -> BridgeResult<bool> {
        if !self.is_supported() || self.lookup(call_id, "send_dtmf").await.is_none() {
            return Ok(false);
        }
        let digit = match digits.chars().next() {
            Some(c) if DTMF_DIGITS.contains(c.to_ascii_uppercase()) => c.to_ascii_uppercase(),
            _ => {
                return Err(BridgeError::InvalidDtmf {
                    digit: digits.to_string(),
                })
            }
        };

        self.inner.native.play_dtmf(call_id, digit).await?;
        self.on_play_dtmf(call_id, digit).await
    }

    /// Update the caller name and address shown by the platform
    pub async fn update_display(&self, call_id: &CallId, display_name: &str, uri: &str) -> BridgeResult<bool> {
        if !self.is_supported() || self.lookup(call_id, "update_display").await.is_none() {
            return Ok(false);
        }
        self.inner.native.update_display(call_id, display_name, uri).await?;

        let address = RemoteAddress::parse(uri);
        let session = self
            .inner
            .registry
            .with_session_mut(call_id, |session| {
                session.update_identity(address, display_name);
                session.clone()
            })
            .await?;
        self.present(&session).await?;
        Ok(true)
    }

    /// Move a call to `state` along a transition-table edge.
    ///
    /// Requesting the current state, or a state with no single edge from
    /// the current one, is a no-op. Hangups go through
    /// [`end_call`](Self::end_call) or [`report_end_call`](Self::report_end_call).
    pub async fn set_connection_state(&self, call_id: &CallId, state: CallState) -> BridgeResult<bool> {
        if !self.is_supported() {
            return Ok(false);
        }
        let Some(session) = self.lookup(call_id, "set_connection_state").await else {
            return Ok(false);
        };
        if session.state == state {
            debug!(call_id = %call_id, state = ?state, "Already in requested state");
            return Ok(false);
        }
        let Some(event) = StateMachine::event_for_target(session.state, state) else {
            warn!(call_id = %call_id, from = ?session.state, to = ?state, "No transition to requested state");
            return Ok(false);
        };

        let Some(session) = self.try_apply_event(call_id, event).await else {
            return Ok(false);
        };
        if event == CallEvent::Answer {
            self.cancel_incoming_timer(call_id);
        }
        self.present(&session).await?;
        Ok(true)
    }

    /// Add the hold capability and make the call active
    pub async fn set_current_call_active(&self, call_id: &CallId) -> BridgeResult<bool> {
        if !self.is_supported() {
            return Ok(false);
        }
        let Some(session) = self
            .inner
            .registry
            .with_session_mut(call_id, |session| {
                session.capabilities.insert(Capabilities::HOLD);
                session.clone()
            })
            .await
            .ok()
        else {
            warn!(call_id = %call_id, operation = "set_current_call_active", "Ignored, no session for call");
            return Ok(false);
        };

        if session.state == CallState::Active {
            return Ok(true);
        }
        self.set_connection_state(call_id, CallState::Active).await
    }
}
