//! Error types and handling for the callbridge-core library
//!
//! This module defines every error the bridge can produce and the policy
//! for surfacing them to callers.
//!
//! # Error Categories
//!
//! - **Call Errors** - unknown ids, duplicate ids, transitions the state
//!   machine does not allow
//! - **Request Errors** - native creation requests without an address
//! - **Platform Errors** - native subsystem unavailable or failing
//! - **Presentation Errors** - the configured renderer plugin cannot be
//!   resolved or instantiated
//! - **Delivery Errors** - no application listener could receive an event
//!
//! # Propagation Policy
//!
//! Most errors never reach the application. Commands that reference an
//! unknown call log a warning and resolve to `Ok(false)`, and failed event
//! deliveries are buffered by the [`EventBridge`](crate::events::EventBridge).
//! Only commands with a direct application-observable result (such as
//! setting the audio route) reject, and they do so with a
//! [`CommandRejection`] carrying a short machine-readable code:
//!
//! ```rust
//! use rvoip_callbridge_core::{BridgeError, CallId};
//!
//! let err = BridgeError::native_error("set_audio_route", "route not available");
//! let rejection = err.reject("SetAudioRoute");
//! assert_eq!(rejection.code, "SetAudioRoute");
//! assert!(rejection.message.contains("route not available"));
//! ```
//!
//! ## Error Categories Helper
//!
//! Use the `category()` method to group errors for logging:
//!
//! ```rust
//! # use rvoip_callbridge_core::{BridgeError, CallId};
//! let err = BridgeError::CallNotFound { call_id: CallId::from("c1") };
//! assert_eq!(err.category(), "call");
//! assert!(!err.is_recoverable());
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::call::{CallId, CallState};

/// Result type alias for callbridge-core operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Error types for bridge operations
#[derive(Error, Debug, Clone)]
pub enum BridgeError {
    /// Call related errors
    #[error("Call not found: {call_id}")]
    CallNotFound { call_id: CallId },

    #[error("Call already exists: {call_id}")]
    CallAlreadyExists { call_id: CallId },

    #[error("Invalid transition for call {call_id}: {event} is not allowed in state {from:?}")]
    InvalidTransition {
        call_id: CallId,
        from: CallState,
        event: String,
    },

    #[error("Invalid DTMF digit: {digit:?}")]
    InvalidDtmf { digit: String },

    /// Native request errors
    #[error("Malformed connection request: {reason}")]
    MalformedRequest { reason: String },

    /// Platform errors
    #[error("Native telephony unsupported: {reason}")]
    Unsupported { reason: String },

    #[error("Native operation {operation} failed: {reason}")]
    NativeError { operation: String, reason: String },

    /// Presentation errors
    #[error("Presentation plugin '{plugin}' could not be resolved: {reason}")]
    PluginResolutionFailed { plugin: String, reason: String },

    /// Event delivery errors
    #[error("No listener received event {action}")]
    DeliveryFailed { action: String },

    /// Configuration errors
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfiguration { field: String, reason: String },

    /// Generic errors
    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl BridgeError {
    /// Create a malformed request error
    pub fn malformed_request(reason: impl Into<String>) -> Self {
        Self::MalformedRequest { reason: reason.into() }
    }

    /// Create an unsupported platform error
    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::Unsupported { reason: reason.into() }
    }

    /// Create a native operation error
    pub fn native_error(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NativeError {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a plugin resolution error
    pub fn plugin_resolution_failed(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PluginResolutionFailed {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal_error(reason: impl Into<String>) -> Self {
        Self::InternalError { message: reason.into() }
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors are the ones the bridge handles locally: failed
    /// deliveries are buffered and native failures may succeed on the next
    /// command.
    pub fn is_recoverable(&self) -> bool {
        match self {
            BridgeError::DeliveryFailed { .. } | BridgeError::NativeError { .. } => true,

            BridgeError::PluginResolutionFailed { .. }
            | BridgeError::InvalidConfiguration { .. }
            | BridgeError::Unsupported { .. }
            | BridgeError::CallAlreadyExists { .. } => false,

            _ => false,
        }
    }

    /// Check if error is call-related
    pub fn is_call_error(&self) -> bool {
        matches!(
            self,
            BridgeError::CallNotFound { .. }
                | BridgeError::CallAlreadyExists { .. }
                | BridgeError::InvalidTransition { .. }
                | BridgeError::InvalidDtmf { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            BridgeError::CallNotFound { .. }
            | BridgeError::CallAlreadyExists { .. }
            | BridgeError::InvalidTransition { .. }
            | BridgeError::InvalidDtmf { .. } => "call",

            BridgeError::MalformedRequest { .. } => "request",

            BridgeError::Unsupported { .. } | BridgeError::NativeError { .. } => "platform",

            BridgeError::PluginResolutionFailed { .. } => "presentation",

            BridgeError::DeliveryFailed { .. } => "delivery",

            BridgeError::InvalidConfiguration { .. } => "configuration",

            BridgeError::InternalError { .. } => "system",
        }
    }

    /// Convert into a promise-style rejection with the given code
    pub fn reject(&self, code: impl Into<String>) -> CommandRejection {
        CommandRejection {
            code: code.into(),
            message: self.to_string(),
        }
    }
}

/// Promise-style rejection returned to the application
///
/// Only commands with a directly observable result reject; the code is a
/// short stable identifier (`"SetAudioRoute"`), the message is free text.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct CommandRejection {
    pub code: String,
    pub message: String,
}
