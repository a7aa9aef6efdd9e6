//! Call session types
//!
//! This module provides the per-call record tracked by the
//! [`SessionRegistry`](crate::registry::SessionRegistry) and the small value
//! types it is built from. Nothing here talks to the native subsystem.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a call
///
/// Assigned by the application for outgoing calls and taken from the native
/// request for incoming calls. Usually a UUID string, but any opaque string
/// is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
    /// Generate a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CallId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<Uuid> for CallId {
    fn from(value: Uuid) -> Self {
        Self(value.to_string())
    }
}

/// Current state of a call session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// Session created, native connection not yet ringing or dialing
    Initializing,
    /// Incoming call waiting for the user
    Ringing,
    /// Outgoing call placed, remote not yet connected
    Dialing,
    /// Call connected
    Active,
    /// Call on hold
    Holding,
    /// Call ended; terminal
    Disconnected,
}

impl CallState {
    /// Check if the call is connected
    pub fn is_active(&self) -> bool {
        matches!(self, CallState::Active)
    }

    /// Check if the call is in the terminal state
    pub fn is_terminated(&self) -> bool {
        matches!(self, CallState::Disconnected)
    }

    /// Check if the call is still in progress
    pub fn is_in_progress(&self) -> bool {
        !self.is_terminated()
    }
}

/// Direction of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    /// Placed by the application
    Outgoing,
    /// Received from the native subsystem
    Incoming,
}

/// Audio output route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AudioRoute {
    #[default]
    Earpiece,
    Speaker,
    Bluetooth,
    WiredHeadset,
}

impl AudioRoute {
    /// Name reported to the application in `audio-route-changed`
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioRoute::Earpiece => "Phone",
            AudioRoute::Speaker => "Speaker",
            AudioRoute::Bluetooth => "Bluetooth",
            AudioRoute::WiredHeadset => "Headset",
        }
    }

    /// Route the presentation toggle switches to
    pub fn toggled(&self) -> Self {
        match self {
            AudioRoute::Earpiece => AudioRoute::Speaker,
            _ => AudioRoute::Earpiece,
        }
    }
}

impl fmt::Display for AudioRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioRoute {
    type Err = std::convert::Infallible;

    /// Unknown names fall back to the earpiece, the platform's
    /// "wired or earpiece" route.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Bluetooth" => AudioRoute::Bluetooth,
            "Headset" => AudioRoute::WiredHeadset,
            "Speaker" => AudioRoute::Speaker,
            _ => AudioRoute::Earpiece,
        })
    }
}

/// Connection capability bit-set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);
    pub const MUTE: Capabilities = Capabilities(0b001);
    pub const HOLD: Capabilities = Capabilities(0b010);
    pub const SELF_MANAGED: Capabilities = Capabilities(0b100);

    pub fn contains(&self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Capabilities) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Capabilities) {
        self.0 &= !other.0;
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Capabilities) -> Capabilities {
        Capabilities(self.0 | rhs.0)
    }
}

/// Remote party address split into number and optional schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAddress {
    pub number: String,
    pub schema: Option<String>,
}

impl RemoteAddress {
    /// Split a raw address at its first `:`.
    ///
    /// `"sip:12345"` becomes schema `sip` and number `12345`; an address
    /// without a colon is all number.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((schema, number)) => Self {
                number: number.to_string(),
                schema: Some(schema.to_string()),
            },
            None => Self {
                number: raw.to_string(),
                schema: None,
            },
        }
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}:{}", schema, self.number),
            None => f.write_str(&self.number),
        }
    }
}

/// Why a call was disconnected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// Ended locally by the user or application
    Local,
    /// Ended by the remote party
    Remote,
    /// Rejected before answer
    Rejected,
    /// Not answered in time
    Missed,
    /// Answered on another device
    AnsweredElsewhere,
    /// Declined on another device
    DeclinedElsewhere,
    /// Failed
    Failed,
}

/// Attribute keys shared by sessions and outbound events
pub mod keys {
    pub const CALL_UUID: &str = "callUUID";
    pub const HANDLE: &str = "handle";
    pub const NAME: &str = "name";
    pub const SCHEMA: &str = "schema";
    pub const PAYLOAD: &str = "payload";
    pub const HOLD: &str = "hold";
    pub const MUTED: &str = "muted";
    pub const DIGITS: &str = "digits";
    pub const OUTPUT: &str = "output";
}

/// Attributes used to create a session
#[derive(Debug, Clone)]
pub struct NewSession {
    pub direction: CallDirection,
    pub address: RemoteAddress,
    pub display_name: String,
    pub capabilities: Capabilities,
    pub add_call_disabled: bool,
    pub extras: BTreeMap<String, String>,
}

/// In-memory record of one call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    /// Unique call identifier
    pub id: CallId,
    /// Direction of the call
    pub direction: CallDirection,
    /// Current state
    pub state: CallState,
    /// Remote party address
    pub address: RemoteAddress,
    /// Human-readable caller or callee label
    pub display_name: String,
    /// Current output route
    pub audio_route: AudioRoute,
    pub muted: bool,
    pub capabilities: Capabilities,
    /// Set when adding a further call is disallowed for this connection
    pub add_call_disabled: bool,
    /// Other live sessions this one may be merged with
    pub conference_peers: HashSet<CallId>,
    /// When the session was created
    pub started_at: DateTime<Utc>,
    /// Attributes forwarded in outbound events
    pub extras: BTreeMap<String, String>,
}

impl CallSession {
    pub fn new(id: CallId, attrs: NewSession) -> Self {
        Self {
            id,
            direction: attrs.direction,
            state: CallState::Initializing,
            address: attrs.address,
            display_name: attrs.display_name,
            audio_route: AudioRoute::default(),
            muted: false,
            capabilities: attrs.capabilities,
            add_call_disabled: attrs.add_call_disabled,
            conference_peers: HashSet::new(),
            started_at: Utc::now(),
            extras: attrs.extras,
        }
    }

    /// Time since the session was created
    pub fn elapsed(&self) -> Duration {
        Utc::now() - self.started_at
    }

    pub fn is_self_managed(&self) -> bool {
        self.capabilities.contains(Capabilities::SELF_MANAGED)
    }

    /// Overwrite number and name, last writer wins
    pub fn update_identity(&mut self, address: RemoteAddress, display_name: impl Into<String>) {
        self.display_name = display_name.into();
        self.extras.insert(keys::HANDLE.to_string(), address.number.clone());
        self.extras.insert(keys::NAME.to_string(), self.display_name.clone());
        match &address.schema {
            Some(schema) => {
                self.extras.insert(keys::SCHEMA.to_string(), schema.clone());
            }
            None => {
                self.extras.remove(keys::SCHEMA);
            }
        }
        self.address = address;
    }

    /// Attributes for an outbound event about this call: the forwarded
    /// extras overlaid with the session's id, number and name
    pub fn event_attributes(&self) -> BTreeMap<String, String> {
        let mut attrs = self.extras.clone();
        if let Some(schema) = &self.address.schema {
            attrs.insert(keys::SCHEMA.to_string(), schema.clone());
        }
        attrs.insert(keys::CALL_UUID.to_string(), self.id.to_string());
        attrs.insert(keys::HANDLE.to_string(), self.address.number.clone());
        attrs.insert(keys::NAME.to_string(), self.display_name.clone());
        attrs
    }
}

/// Statistics about current calls
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallStats {
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub ringing_sessions: usize,
    pub held_sessions: usize,
    pub conferences: usize,
}
