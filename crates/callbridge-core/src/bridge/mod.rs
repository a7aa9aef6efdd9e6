//! Call bridge context
//!
//! [`CallBridge`] owns everything the bridge needs at runtime: the session
//! registry, the event bridge, the reachability coordinator, the foreground
//! presentation coordinator and the native telephony handle. It is cheap to
//! clone and every clone shares the same state, so native callbacks,
//! application commands and timers can each hold one.
//!
//! The operations are split by direction:
//!
//! - [`commands`] - application commands (answer, end, mute, route audio)
//! - [`adapters`] - native subsystem callbacks (`on_*`)
//! - [`service`] - the foreground service entry point for presentation actions
//!
//! ```text
//! application ──commands──▶ ┌────────────┐ ──NativeTelephony──▶ platform
//!                           │ CallBridge │
//! application ◀──events──── └────────────┘ ◀──────on_*───────── platform
//! ```
//!
//! Commands apply their own effects (state, events, presentation) after the
//! native request succeeds. The platform reports only changes it initiated
//! itself through the `on_*` adapters.

pub mod adapters;
pub mod commands;
pub mod service;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

use crate::call::{CallId, CallSession, CallState, CallStats, DisconnectReason};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::events::{BridgeEvent, EventAction, EventBridge};
use crate::native::NativeTelephony;
use crate::presentation::{PresentationCoordinator, PresentationRegistry};
use crate::reachability::ReachabilityCoordinator;
use crate::registry::SessionRegistry;
use crate::state_machine::{CallEvent, StateMachine};

pub(crate) struct BridgeInner {
    pub(crate) config: BridgeConfig,
    pub(crate) registry: SessionRegistry,
    pub(crate) events: Arc<EventBridge>,
    pub(crate) reachability: Arc<ReachabilityCoordinator>,
    pub(crate) presentation: PresentationCoordinator,
    pub(crate) native: Arc<dyn NativeTelephony>,
    pub(crate) has_outgoing_call: AtomicBool,
    pub(crate) can_make_multiple_calls: AtomicBool,
    /// Incoming-call reachability timers keyed by call
    pub(crate) incoming_timers: Mutex<HashMap<CallId, JoinHandle<()>>>,
}

/// Bridge between application call logic and the native telephony subsystem
#[derive(Clone)]
pub struct CallBridge {
    pub(crate) inner: Arc<BridgeInner>,
}

impl std::fmt::Debug for CallBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallBridge")
            .field("account", &self.inner.config.account.id)
            .field("has_outgoing_call", &self.has_outgoing_call())
            .finish()
    }
}

impl CallBridge {
    /// Build a bridge with no presentation plugins registered
    pub fn new(config: BridgeConfig, native: Arc<dyn NativeTelephony>) -> BridgeResult<Self> {
        Self::with_plugins(config, native, Arc::new(PresentationRegistry::new()))
    }

    /// Build a bridge resolving presentation plugins from `plugins`
    pub fn with_plugins(
        config: BridgeConfig,
        native: Arc<dyn NativeTelephony>,
        plugins: Arc<PresentationRegistry>,
    ) -> BridgeResult<Self> {
        config.validate()?;
        if let Some(logging) = &config.logging {
            crate::logging::install(logging, &config.account.id)?;
        }

        let events = Arc::new(EventBridge::new(config.event_channel_capacity));
        let reachability =
            ReachabilityCoordinator::new(events.clone(), native.clone(), config.reachability_check_delay());
        let presentation = PresentationCoordinator::new(
            config.foreground.clone(),
            config.presentation_plugin.clone(),
            plugins,
            native.clone(),
        );

        info!(
            account = %config.account.id,
            self_managed = config.self_managed(),
            presentation = presentation.is_configured(),
            "Call bridge created"
        );

        Ok(Self {
            inner: Arc::new(BridgeInner {
                can_make_multiple_calls: AtomicBool::new(config.allow_multiple_calls),
                config,
                registry: SessionRegistry::new(),
                events,
                reachability,
                presentation,
                native,
                has_outgoing_call: AtomicBool::new(false),
                incoming_timers: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Whether the native subsystem exists on this platform
    pub fn is_supported(&self) -> bool {
        self.inner.native.is_supported()
    }

    /// Register the account with the native subsystem.
    ///
    /// Returns `Ok(false)` without doing anything on unsupported platforms.
    pub async fn setup(&self) -> BridgeResult<bool> {
        if !self.is_supported() {
            info!("Native telephony not supported, setup skipped");
            return Ok(false);
        }
        self.inner.native.register_account(&self.inner.config.account).await?;
        info!(account = %self.inner.config.account.id, "Call bridge set up");
        Ok(true)
    }

    /// Cancel timers, stop the presentation and detach the listener.
    ///
    /// Live sessions are left registered.
    pub async fn shutdown(&self) -> BridgeResult<()> {
        let timers: Vec<_> = self.inner.incoming_timers.lock().drain().collect();
        for (_, timer) in timers {
            timer.abort();
        }
        self.inner.reachability.shutdown();
        self.inner.presentation.stop().await?;
        self.inner.events.stop_observing();
        info!("Call bridge shut down");
        Ok(())
    }

    // Liveness flags

    /// Application confirmed it is alive
    pub fn confirm_reachable(&self) {
        self.inner.reachability.confirm_reachable();
    }

    pub fn set_available(&self, available: bool) {
        self.inner.reachability.set_available(available);
    }

    pub fn set_can_make_multiple_calls(&self, allow: bool) {
        debug!(allow, "Multiple calls toggled");
        self.inner.can_make_multiple_calls.store(allow, Ordering::SeqCst);
    }

    pub fn can_make_multiple_calls(&self) -> bool {
        self.inner.can_make_multiple_calls.load(Ordering::SeqCst)
    }

    /// Whether an outgoing connection is live
    pub fn has_outgoing_call(&self) -> bool {
        self.inner.has_outgoing_call.load(Ordering::SeqCst)
    }

    pub fn reachability(&self) -> &ReachabilityCoordinator {
        &self.inner.reachability
    }

    // Event delivery

    /// Attach the application listener and flush buffered events
    pub fn start_observing(&self) -> usize {
        self.inner.events.start_observing()
    }

    pub fn stop_observing(&self) {
        self.inner.events.stop_observing();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.inner.events.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<BridgeEvent> {
        self.inner.events.subscribe_stream()
    }

    /// Events still waiting for a listener, oldest first
    pub fn pending_events(&self) -> Vec<BridgeEvent> {
        self.inner.events.pending_events()
    }

    pub fn clear_pending_events(&self) -> usize {
        self.inner.events.clear_pending()
    }

    // Session queries

    pub async fn get_session(&self, call_id: &CallId) -> Option<CallSession> {
        self.inner.registry.get(call_id).await.ok()
    }

    pub async fn sessions(&self) -> Vec<CallSession> {
        self.inner.registry.list().await
    }

    pub async fn stats(&self) -> CallStats {
        self.inner.registry.stats().await
    }

    /// Whether a foreground presentation is running
    pub async fn is_presenting(&self) -> bool {
        self.inner.presentation.is_presenting().await
    }

    // Internal helpers shared by commands and adapters

    /// Drive `call_id` through `event` under the registry lock.
    ///
    /// Returns the updated session. Unknown ids and invalid transitions are
    /// returned as errors for the caller to downgrade.
    pub(crate) async fn apply_event(&self, call_id: &CallId, event: CallEvent) -> BridgeResult<CallSession> {
        let session = self
            .inner
            .registry
            .with_session_mut(call_id, |session| {
                let next = StateMachine::next_state(call_id, session.state, event)?;
                debug!(call_id = %call_id, from = ?session.state, to = ?next, event = %event, "Call state transition");
                session.state = next;
                Ok::<_, BridgeError>(session.clone())
            })
            .await??;
        Ok(session)
    }

    /// Like [`apply_event`](Self::apply_event) but logs and swallows unknown
    /// ids and invalid transitions.
    pub(crate) async fn try_apply_event(&self, call_id: &CallId, event: CallEvent) -> Option<CallSession> {
        match self.apply_event(call_id, event).await {
            Ok(session) => Some(session),
            Err(BridgeError::CallNotFound { .. }) => {
                warn!(call_id = %call_id, event = %event, "Ignored, no session for call");
                None
            }
            Err(e) => {
                warn!(call_id = %call_id, error = %e, "Ignored event");
                None
            }
        }
    }

    /// Look a session up, logging a warning when it does not exist
    pub(crate) async fn lookup(&self, call_id: &CallId, operation: &str) -> Option<CallSession> {
        match self.inner.registry.get(call_id).await {
            Ok(session) => Some(session),
            Err(_) => {
                warn!(call_id = %call_id, operation, "Ignored, no session for call");
                None
            }
        }
    }

    /// Push the session's current state to the foreground presentation
    pub(crate) async fn present(&self, session: &CallSession) -> BridgeResult<()> {
        self.inner.presentation.on_session_state_changed(session).await.map_err(|e| {
            error!(call_id = %session.id, error = %e, "Foreground presentation failed");
            e
        })
    }

    /// Re-render the presentation for `call_id` if it still exists
    pub(crate) async fn refresh_presentation(&self, call_id: &CallId) -> BridgeResult<()> {
        match self.inner.registry.get(call_id).await {
            Ok(session) => self.present(&session).await,
            Err(_) => Ok(()),
        }
    }

    /// Move a session to `Disconnected`, remove it and clean up after it.
    ///
    /// The transition and the removal happen under one registry lock, so a
    /// concurrent second hangup finds no session. Returns `Ok(false)` for an
    /// unknown or already ended call. A reject that races with an answer
    /// ends the call as a disconnect. `perform-end` is published only when
    /// `publish_end` is set.
    pub(crate) async fn terminate_session(
        &self,
        call_id: &CallId,
        event: CallEvent,
        publish_end: bool,
    ) -> BridgeResult<bool> {
        let taken = self
            .inner
            .registry
            .remove_with(call_id, |session| {
                let event = match event {
                    CallEvent::Reject if session.state != CallState::Ringing => CallEvent::Disconnect,
                    other => other,
                };
                let next = StateMachine::next_state(call_id, session.state, event)?;
                debug!(call_id = %call_id, from = ?session.state, to = ?next, event = %event, "Call state transition");
                session.state = next;
                Ok::<_, BridgeError>(())
            })
            .await;

        let session = match taken {
            Some(Ok(session)) => session,
            None => {
                warn!(call_id = %call_id, event = %event, "Ignored, no session for call");
                return Ok(false);
            }
            Some(Err(BridgeError::InvalidTransition { from: CallState::Disconnected, .. })) => {
                debug!(call_id = %call_id, event = %event, "Ignored, call already ended");
                return Ok(false);
            }
            Some(Err(e)) => return Err(e),
        };

        self.cancel_incoming_timer(call_id);
        self.inner.has_outgoing_call.store(false, Ordering::SeqCst);

        if publish_end {
            self.inner
                .events
                .publish(EventAction::PerformEnd, session.event_attributes());
        }
        info!(call_id = %call_id, event = %event, "Call ended");

        self.after_session_removed().await?;
        Ok(true)
    }

    /// Stop the presentation once the last session is gone, otherwise show
    /// the most recent live session.
    pub(crate) async fn after_session_removed(&self) -> BridgeResult<()> {
        let remaining = self.inner.registry.list().await;
        let latest = remaining
            .iter()
            .filter(|session| session.state != CallState::Disconnected)
            .max_by_key(|session| session.started_at);

        match latest {
            Some(session) => self.present(session).await,
            None => {
                self.inner.presentation.stop().await?;
                Ok(())
            }
        }
    }

    /// Arm the incoming-call reachability timer for `call_id`
    pub(crate) fn arm_incoming_timer(&self, call_id: &CallId) {
        let Some(timeout) = self.inner.config.incoming_reachability_timeout() else {
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        let id = call_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                CallBridge { inner }.on_incoming_deadline(&id).await;
            }
        });

        debug!(call_id = %call_id, timeout_ms = timeout.as_millis() as u64, "Incoming reachability timer armed");
        if let Some(previous) = self.inner.incoming_timers.lock().insert(call_id.clone(), timer) {
            previous.abort();
        }
    }

    pub(crate) fn cancel_incoming_timer(&self, call_id: &CallId) {
        if let Some(timer) = self.inner.incoming_timers.lock().remove(call_id) {
            timer.abort();
        }
    }

    async fn on_incoming_deadline(&self, call_id: &CallId) {
        self.inner.incoming_timers.lock().remove(call_id);

        if self.inner.reachability.is_reachable() {
            debug!(call_id = %call_id, "Incoming timer fired, application reachable");
            return;
        }
        let Ok(session) = self.inner.registry.get(call_id).await else {
            debug!(call_id = %call_id, "Incoming timer fired after call ended, discarding");
            return;
        };
        if session.state != CallState::Ringing {
            debug!(call_id = %call_id, state = ?session.state, "Incoming timer fired after answer, discarding");
            return;
        }

        warn!(call_id = %call_id, "Application not reachable for incoming call, disconnecting");
        if let Err(e) = self.inner.native.disconnect(call_id, DisconnectReason::Local).await {
            warn!(call_id = %call_id, error = %e, "Native disconnect failed");
        }
        if let Err(e) = self.terminate_session(call_id, CallEvent::Disconnect, true).await {
            warn!(call_id = %call_id, error = %e, "Failed to disconnect unreachable incoming call");
        }
    }
}
