//! Reachability Coordinator
//!
//! When the native subsystem creates an outgoing connection before the
//! application has initialized, the application process may be suspended.
//! The coordinator asks the application whether it is alive
//! (`check-reachability`) and, if no confirmation arrives before the
//! deadline, wakes the process for the pending call.
//!
//! Each check issues a ticket tagged with a monotonically increasing
//! generation. A later check, a confirmation, or a direct wake-up for the
//! same call supersedes the ticket; a timer whose generation no longer
//! matches is discarded when it fires. The fallback never disconnects.
//!
//! The liveness flags (`initialized`, `available`, `reachable`) live here,
//! owned by the bridge context instead of process globals.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::call::{keys, CallId};
use crate::error::BridgeResult;
use crate::events::{call_attributes, EventAction, EventAttributes, EventBridge};
use crate::native::{NativeTelephony, WakeRequest};

/// Outstanding outgoing-call reachability check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReachabilityTicket {
    pub request: WakeRequest,
    pub generation: u64,
    pub deadline: Instant,
}

impl ReachabilityTicket {
    pub fn call_id(&self) -> &CallId {
        &self.request.call_id
    }
}

#[derive(Debug, Default)]
struct ReachabilityState {
    generation: u64,
    ticket: Option<ReachabilityTicket>,
    timer: Option<JoinHandle<()>>,
    initialized: bool,
    available: bool,
    reachable: bool,
    fallback_wakes: usize,
}

impl ReachabilityState {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Outgoing-call reachability protocol and application liveness flags
pub struct ReachabilityCoordinator {
    state: Mutex<ReachabilityState>,
    events: Arc<EventBridge>,
    native: Arc<dyn NativeTelephony>,
    delay: Duration,
}

impl std::fmt::Debug for ReachabilityCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReachabilityCoordinator")
            .field("state", &*self.state.lock())
            .field("delay", &self.delay)
            .finish()
    }
}

impl ReachabilityCoordinator {
    pub fn new(events: Arc<EventBridge>, native: Arc<dyn NativeTelephony>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ReachabilityState::default()),
            events,
            native,
            delay,
        })
    }

    /// Issue a reachability check for a pending outgoing call.
    ///
    /// Supersedes any earlier ticket. Returns the new ticket's generation.
    pub fn check_reachability(self: &Arc<Self>, request: WakeRequest) -> u64 {
        let generation = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.cancel_timer();
            state.ticket = Some(ReachabilityTicket {
                request: request.clone(),
                generation: state.generation,
                deadline: Instant::now() + self.delay,
            });
            state.generation
        };

        info!(call_id = %request.call_id, generation, delay_ms = self.delay.as_millis() as u64, "Checking application reachability");
        self.events
            .publish(EventAction::CheckReachability, wake_attributes(&request));

        let coordinator: Weak<Self> = Arc::downgrade(self);
        let delay = self.delay;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(coordinator) = coordinator.upgrade() {
                coordinator.on_deadline(generation).await;
            }
        });

        let mut state = self.state.lock();
        if state.generation == generation {
            state.timer = Some(timer);
        } else {
            // Superseded while the timer was being spawned
            timer.abort();
        }
        generation
    }

    async fn on_deadline(&self, generation: u64) {
        let request = {
            let mut state = self.state.lock();
            match state.ticket.as_ref() {
                Some(ticket) if ticket.generation == generation => {}
                _ => {
                    debug!(generation, "Stale reachability timer, discarding");
                    return;
                }
            }
            state.timer = None;
            state.fallback_wakes += 1;
            state.ticket.take().map(|ticket| ticket.request)
        };

        if let Some(request) = request {
            warn!(call_id = %request.call_id, generation, "Application not reachable, forcing wake-up");
            if let Err(e) = self.perform_wake(&request).await {
                warn!(call_id = %request.call_id, error = %e, "Fallback wake-up failed");
            }
        }
    }

    /// Application confirmed it is alive: suppresses any pending fallback
    pub fn confirm_reachable(&self) {
        let mut state = self.state.lock();
        state.reachable = true;
        state.generation += 1;
        state.cancel_timer();
        if let Some(ticket) = state.ticket.take() {
            debug!(call_id = %ticket.call_id(), "Reachability confirmed, ticket cleared");
        }
        info!("Application reachable");
    }

    /// Wake the application directly for a call.
    ///
    /// Clears a pending ticket for the same call so the fallback does not
    /// wake the application a second time.
    pub async fn wake_application(&self, request: WakeRequest) -> BridgeResult<()> {
        {
            let mut state = self.state.lock();
            let same_call = state
                .ticket
                .as_ref()
                .is_some_and(|ticket| ticket.request.call_id == request.call_id);
            if same_call {
                state.ticket = None;
                state.generation += 1;
                state.cancel_timer();
            }
        }
        info!(call_id = %request.call_id, "Waking application");
        self.perform_wake(&request).await
    }

    async fn perform_wake(&self, request: &WakeRequest) -> BridgeResult<()> {
        self.events
            .publish(EventAction::WakeApplication, wake_attributes(request));
        self.native.wake_application(request).await
    }

    /// Cancel any pending check
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.cancel_timer();
        state.ticket = None;
    }

    pub fn pending_ticket(&self) -> Option<ReachabilityTicket> {
        self.state.lock().ticket.clone()
    }

    /// Number of wake-ups performed by the fallback timer
    pub fn fallback_wakes(&self) -> usize {
        self.state.lock().fallback_wakes
    }

    pub fn is_reachable(&self) -> bool {
        self.state.lock().reachable
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    pub fn is_available(&self) -> bool {
        self.state.lock().available
    }

    /// Setting available also marks the application initialized
    pub fn set_available(&self, available: bool) {
        let mut state = self.state.lock();
        if available {
            state.initialized = true;
        }
        state.available = available;
        debug!(available, "Application availability changed");
    }
}

fn wake_attributes(request: &WakeRequest) -> EventAttributes {
    let mut attrs = call_attributes(&request.call_id);
    attrs.insert(keys::HANDLE.to_string(), request.number.clone());
    attrs.insert(keys::NAME.to_string(), request.display_name.clone());
    attrs
}
