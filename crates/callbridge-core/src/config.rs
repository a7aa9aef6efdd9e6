//! Bridge configuration
//!
//! [`BridgeConfig`] is the setup options blob handed to the bridge. It can be
//! built with the `with_*` builders or parsed from JSON with
//! [`BridgeConfig::from_json`], and is checked by [`BridgeConfig::validate`]
//! before the bridge accepts it. Durations are stored as milliseconds so the
//! serialized form matches what the application layer sends.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};
use crate::logging::LogSettings;

/// Default delay before the outgoing-call reachability fallback fires
pub const DEFAULT_REACHABILITY_CHECK_DELAY_MS: u64 = 2000;

/// Default deep link scheme for the return-to-app action
pub const DEFAULT_DEEPLINK_SCHEME: &str = "callbridge";

/// Native account every connection is created under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountDescriptor {
    /// Account identifier registered with the native subsystem
    pub id: String,
    /// Label shown by the platform
    pub label: String,
    /// Connections created under a self-managed account are self-managed
    pub self_managed: bool,
}

impl Default for AccountDescriptor {
    fn default() -> Self {
        Self {
            id: "callbridge".to_string(),
            label: "CallBridge".to_string(),
            self_managed: false,
        }
    }
}

/// Settings for the in-call foreground presentation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForegroundSettings {
    /// Notification channel id; required
    pub channel_id: String,
    pub channel_name: String,
    pub notification_title: String,
    /// Small icon resource name
    pub notification_icon: Option<String>,
    /// Scheme used by the return-to-app deep link
    #[serde(default = "default_deeplink_scheme")]
    pub deeplink_scheme: String,
}

fn default_deeplink_scheme() -> String {
    DEFAULT_DEEPLINK_SCHEME.to_string()
}

impl ForegroundSettings {
    pub fn new(channel_id: impl Into<String>, channel_name: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            channel_name: channel_name.into(),
            notification_title: "Call in progress".to_string(),
            notification_icon: None,
            deeplink_scheme: default_deeplink_scheme(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.notification_title = title.into();
        self
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.notification_icon = Some(icon.into());
        self
    }

    pub fn with_deeplink_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.deeplink_scheme = scheme.into();
        self
    }
}

/// Configuration blob for the bridge
///
/// Read once when the bridge is built and treated as an immutable snapshot
/// afterwards. Runtime toggles (availability, multiple-calls) live on the
/// bridge itself and only take their initial value from here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Account descriptor registered at setup
    pub account: AccountDescriptor,
    /// Incoming calls are disconnected if the application has not confirmed
    /// reachability within this window. `None` disables the check.
    pub incoming_reachability_timeout_ms: Option<u64>,
    /// Delay before the outgoing-call wake-up fallback
    pub reachability_check_delay_ms: u64,
    /// Whether further calls may be added while one is live
    pub allow_multiple_calls: bool,
    /// Registered name of the rich presentation plugin
    pub presentation_plugin: Option<String>,
    /// Foreground presentation settings; `None` disables presentation
    pub foreground: Option<ForegroundSettings>,
    /// Capacity of the outbound event channel
    pub event_channel_capacity: usize,
    /// Subscriber installed when the bridge is built; `None` leaves logging
    /// to the host
    pub logging: Option<LogSettings>,
}

impl BridgeConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self {
            account: AccountDescriptor::default(),
            incoming_reachability_timeout_ms: None,
            reachability_check_delay_ms: DEFAULT_REACHABILITY_CHECK_DELAY_MS,
            allow_multiple_calls: true,
            presentation_plugin: None,
            foreground: None,
            event_channel_capacity: 256,
            logging: None,
        }
    }

    /// Parse a JSON configuration blob
    pub fn from_json(json: &str) -> BridgeResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| BridgeError::invalid_configuration("blob", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Install a subscriber with these settings when the bridge is built
    pub fn with_logging(mut self, settings: LogSettings) -> Self {
        self.logging = Some(settings);
        self
    }

    /// Set the account descriptor
    pub fn with_account(mut self, account: AccountDescriptor) -> Self {
        self.account = account;
        self
    }

    /// Mark the account self-managed
    pub fn with_self_managed(mut self, self_managed: bool) -> Self {
        self.account.self_managed = self_managed;
        self
    }

    /// Set the incoming-call reachability timeout
    pub fn with_incoming_reachability_timeout(mut self, timeout: Duration) -> Self {
        self.incoming_reachability_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Set the outgoing-call fallback delay
    pub fn with_reachability_check_delay(mut self, delay: Duration) -> Self {
        self.reachability_check_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_multiple_calls(mut self, allow: bool) -> Self {
        self.allow_multiple_calls = allow;
        self
    }

    /// Select a registered presentation plugin by name
    pub fn with_presentation_plugin(mut self, name: impl Into<String>) -> Self {
        self.presentation_plugin = Some(name.into());
        self
    }

    pub fn with_foreground(mut self, settings: ForegroundSettings) -> Self {
        self.foreground = Some(settings);
        self
    }

    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    pub fn self_managed(&self) -> bool {
        self.account.self_managed
    }

    pub fn incoming_reachability_timeout(&self) -> Option<Duration> {
        self.incoming_reachability_timeout_ms.map(Duration::from_millis)
    }

    pub fn reachability_check_delay(&self) -> Duration {
        Duration::from_millis(self.reachability_check_delay_ms)
    }

    /// Check the configuration for values the bridge cannot run with
    pub fn validate(&self) -> BridgeResult<()> {
        if self.account.id.trim().is_empty() {
            return Err(BridgeError::invalid_configuration("account.id", "must not be empty"));
        }
        if self.event_channel_capacity == 0 {
            return Err(BridgeError::invalid_configuration(
                "event_channel_capacity",
                "must be greater than zero",
            ));
        }
        if let Some(foreground) = &self.foreground {
            if foreground.channel_id.trim().is_empty() {
                return Err(BridgeError::invalid_configuration(
                    "foreground.channel_id",
                    "must not be empty",
                ));
            }
        }
        if let Some(logging) = &self.logging {
            logging.level()?;
        }
        if let Some(plugin) = &self.presentation_plugin {
            if plugin.trim().is_empty() {
                return Err(BridgeError::invalid_configuration(
                    "presentation_plugin",
                    "must not be empty when set",
                ));
            }
        }
        Ok(())
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new()
    }
}
