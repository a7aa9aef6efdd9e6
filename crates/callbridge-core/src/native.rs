//! Native telephony seam
//!
//! [`NativeTelephony`] is everything the bridge asks of the platform: place,
//! accept, reject, hold and disconnect connections, route audio, run the
//! foreground presentation and wake the application process. The opposite
//! direction, platform callbacks into the bridge, are the `on_*` adapter
//! functions on [`CallBridge`](crate::bridge::CallBridge).
//!
//! [`RecordingTelephony`] is an in-memory implementation that records every
//! call; it backs the crate's tests and is useful when embedding the bridge
//! in a host without a native subsystem.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::call::{AudioRoute, CallId, CallSession, DisconnectReason};
use crate::config::AccountDescriptor;
use crate::error::{BridgeError, BridgeResult};
use crate::presentation::{Presentation, PresentationHandle};

/// Application request to show or place a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRequest {
    pub call_id: CallId,
    pub number: String,
    pub display_name: String,
    /// Opaque payload echoed back in `call-display-requested`
    pub payload: Option<String>,
}

/// Connection request as delivered by the native subsystem
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    /// Call id carried in the request extras
    pub call_id: Option<CallId>,
    /// Raw address, possibly with a schema prefix (`sip:12345`)
    pub address: Option<String>,
    pub display_name: Option<String>,
    /// Number recorded in the request extras by an earlier code path
    pub extras_number: Option<String>,
    /// Remaining extras, forwarded to the session
    pub extras: BTreeMap<String, String>,
}

impl ConnectionRequest {
    pub fn new(call_id: impl Into<CallId>, address: impl Into<String>) -> Self {
        Self {
            call_id: Some(call_id.into()),
            address: Some(address.into()),
            ..Default::default()
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_extras_number(mut self, number: impl Into<String>) -> Self {
        self.extras_number = Some(number.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }
}

impl From<&CallRequest> for ConnectionRequest {
    fn from(request: &CallRequest) -> Self {
        let mut connection = ConnectionRequest::new(request.call_id.clone(), request.number.clone())
            .with_display_name(request.display_name.clone())
            .with_extras_number(request.number.clone());
        if let Some(payload) = &request.payload {
            connection = connection.with_extra(crate::call::keys::PAYLOAD, payload.clone());
        }
        connection
    }
}

/// Result of a native connection creation callback
#[derive(Debug, Clone)]
pub enum ConnectionOutcome {
    /// Session created and registered
    Created(CallSession),
    /// Failed connection handed back to the platform; nothing was registered
    Failed {
        reason: DisconnectReason,
        error: BridgeError,
    },
}

impl ConnectionOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, ConnectionOutcome::Created(_))
    }

    pub fn session(&self) -> Option<&CallSession> {
        match self {
            ConnectionOutcome::Created(session) => Some(session),
            ConnectionOutcome::Failed { .. } => None,
        }
    }
}

/// Request to wake the application process for a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeRequest {
    pub call_id: CallId,
    pub number: String,
    pub display_name: String,
}

/// Calls the bridge issues to the native telephony subsystem
#[async_trait]
pub trait NativeTelephony: Send + Sync {
    /// Whether the running platform provides the native subsystem at all
    fn is_supported(&self) -> bool;

    /// Whether the application UI is currently in the foreground
    fn is_app_in_foreground(&self) -> bool;

    async fn register_account(&self, account: &AccountDescriptor) -> BridgeResult<()>;

    /// Hand an incoming call to the platform; it answers with
    /// `on_create_incoming_connection`
    async fn add_incoming_call(&self, request: &CallRequest) -> BridgeResult<()>;

    /// Place an outgoing call; the platform answers with
    /// `on_create_outgoing_connection`
    async fn place_call(&self, request: &CallRequest) -> BridgeResult<()>;

    async fn answer(&self, call_id: &CallId) -> BridgeResult<()>;

    async fn reject(&self, call_id: &CallId) -> BridgeResult<()>;

    async fn hold(&self, call_id: &CallId) -> BridgeResult<()>;

    async fn unhold(&self, call_id: &CallId) -> BridgeResult<()>;

    async fn disconnect(&self, call_id: &CallId, reason: DisconnectReason) -> BridgeResult<()>;

    async fn set_audio_route(&self, call_id: &CallId, route: AudioRoute) -> BridgeResult<()>;

    async fn set_muted(&self, call_id: &CallId, muted: bool) -> BridgeResult<()>;

    async fn play_dtmf(&self, call_id: &CallId, digit: char) -> BridgeResult<()>;

    async fn update_display(&self, call_id: &CallId, display_name: &str, uri: &str) -> BridgeResult<()>;

    async fn create_conference(&self, members: &[CallId]) -> BridgeResult<()>;

    /// Start or replace the foreground presentation
    async fn start_foreground(&self, presentation: &Presentation) -> BridgeResult<PresentationHandle>;

    async fn stop_foreground(&self, handle: PresentationHandle) -> BridgeResult<()>;

    /// Start the application process in the background for a call
    async fn wake_application(&self, request: &WakeRequest) -> BridgeResult<()>;
}

/// One recorded native call
#[derive(Debug, Clone, PartialEq)]
pub enum NativeCall {
    RegisterAccount(String),
    AddIncomingCall(CallRequest),
    PlaceCall(CallRequest),
    Answer(CallId),
    Reject(CallId),
    Hold(CallId),
    Unhold(CallId),
    Disconnect(CallId, DisconnectReason),
    SetAudioRoute(CallId, AudioRoute),
    SetMuted(CallId, bool),
    PlayDtmf(CallId, char),
    UpdateDisplay(CallId, String, String),
    CreateConference(Vec<CallId>),
    StartForeground(PresentationHandle, Presentation),
    StopForeground(PresentationHandle),
    WakeApplication(WakeRequest),
}

/// In-memory [`NativeTelephony`] that records every call
#[derive(Debug)]
pub struct RecordingTelephony {
    supported: AtomicBool,
    foreground: AtomicBool,
    next_handle: AtomicU64,
    failing: Mutex<HashSet<&'static str>>,
    calls: Mutex<Vec<NativeCall>>,
}

impl Default for RecordingTelephony {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingTelephony {
    /// A supported platform with the application in the foreground
    pub fn new() -> Self {
        Self {
            supported: AtomicBool::new(true),
            foreground: AtomicBool::new(true),
            next_handle: AtomicU64::new(1),
            failing: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_supported(&self, supported: bool) {
        self.supported.store(supported, Ordering::SeqCst);
    }

    pub fn set_app_in_foreground(&self, foreground: bool) {
        self.foreground.store(foreground, Ordering::SeqCst);
    }

    /// Make every later call to `operation` fail
    pub fn fail_operation(&self, operation: &'static str) {
        self.failing.lock().insert(operation);
    }

    pub fn calls(&self) -> Vec<NativeCall> {
        self.calls.lock().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    /// Count recorded calls matching `predicate`
    pub fn count(&self, predicate: impl Fn(&NativeCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| predicate(call)).count()
    }

    pub fn wake_requests(&self) -> Vec<WakeRequest> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                NativeCall::WakeApplication(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn presentations(&self) -> Vec<Presentation> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                NativeCall::StartForeground(_, presentation) => Some(presentation.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn foreground_stops(&self) -> usize {
        self.count(|call| matches!(call, NativeCall::StopForeground(_)))
    }

    /// Presentations started and not yet stopped, in start order
    pub fn live_presentations(&self) -> Vec<PresentationHandle> {
        let calls = self.calls.lock();
        let stopped: HashSet<PresentationHandle> = calls
            .iter()
            .filter_map(|call| match call {
                NativeCall::StopForeground(handle) => Some(*handle),
                _ => None,
            })
            .collect();
        calls
            .iter()
            .filter_map(|call| match call {
                NativeCall::StartForeground(handle, _) if !stopped.contains(handle) => Some(*handle),
                _ => None,
            })
            .collect()
    }

    fn record(&self, operation: &'static str, call: NativeCall) -> BridgeResult<()> {
        if self.failing.lock().contains(operation) {
            return Err(BridgeError::native_error(operation, "simulated failure"));
        }
        self.calls.lock().push(call);
        Ok(())
    }
}

#[async_trait]
impl NativeTelephony for RecordingTelephony {
    fn is_supported(&self) -> bool {
        self.supported.load(Ordering::SeqCst)
    }

    fn is_app_in_foreground(&self) -> bool {
        self.foreground.load(Ordering::SeqCst)
    }

    async fn register_account(&self, account: &AccountDescriptor) -> BridgeResult<()> {
        self.record("register_account", NativeCall::RegisterAccount(account.id.clone()))
    }

    async fn add_incoming_call(&self, request: &CallRequest) -> BridgeResult<()> {
        self.record("add_incoming_call", NativeCall::AddIncomingCall(request.clone()))
    }

    async fn place_call(&self, request: &CallRequest) -> BridgeResult<()> {
        self.record("place_call", NativeCall::PlaceCall(request.clone()))
    }

    async fn answer(&self, call_id: &CallId) -> BridgeResult<()> {
        self.record("answer", NativeCall::Answer(call_id.clone()))
    }

    async fn reject(&self, call_id: &CallId) -> BridgeResult<()> {
        self.record("reject", NativeCall::Reject(call_id.clone()))
    }

    async fn hold(&self, call_id: &CallId) -> BridgeResult<()> {
        self.record("hold", NativeCall::Hold(call_id.clone()))
    }

    async fn unhold(&self, call_id: &CallId) -> BridgeResult<()> {
        self.record("unhold", NativeCall::Unhold(call_id.clone()))
    }

    async fn disconnect(&self, call_id: &CallId, reason: DisconnectReason) -> BridgeResult<()> {
        self.record("disconnect", NativeCall::Disconnect(call_id.clone(), reason))
    }

    async fn set_audio_route(&self, call_id: &CallId, route: AudioRoute) -> BridgeResult<()> {
        self.record("set_audio_route", NativeCall::SetAudioRoute(call_id.clone(), route))
    }

    async fn set_muted(&self, call_id: &CallId, muted: bool) -> BridgeResult<()> {
        self.record("set_muted", NativeCall::SetMuted(call_id.clone(), muted))
    }

    async fn play_dtmf(&self, call_id: &CallId, digit: char) -> BridgeResult<()> {
        self.record("play_dtmf", NativeCall::PlayDtmf(call_id.clone(), digit))
    }

    async fn update_display(&self, call_id: &CallId, display_name: &str, uri: &str) -> BridgeResult<()> {
        self.record(
            "update_display",
            NativeCall::UpdateDisplay(call_id.clone(), display_name.to_string(), uri.to_string()),
        )
    }

    async fn create_conference(&self, members: &[CallId]) -> BridgeResult<()> {
        self.record("create_conference", NativeCall::CreateConference(members.to_vec()))
    }

    async fn start_foreground(&self, presentation: &Presentation) -> BridgeResult<PresentationHandle> {
        let handle = PresentationHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.record(
            "start_foreground",
            NativeCall::StartForeground(handle, presentation.clone()),
        )?;
        Ok(handle)
    }

    async fn stop_foreground(&self, handle: PresentationHandle) -> BridgeResult<()> {
        self.record("stop_foreground", NativeCall::StopForeground(handle))
    }

    async fn wake_application(&self, request: &WakeRequest) -> BridgeResult<()> {
        self.record("wake_application", NativeCall::WakeApplication(request.clone()))
    }
}
