//! Subscriber installation driven by the bridge configuration
//!
//! The bridge only emits `tracing` events. A host that does not install its
//! own subscriber can put a `logging` section in the configuration blob and
//! [`CallBridge::new`](crate::CallBridge::new) installs one from it. A host
//! subscriber that is already in place always wins.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{BridgeError, BridgeResult};

/// `logging` section of the configuration blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Level for this crate's targets, e.g. `"debug"`. `RUST_LOG` directives
    /// are applied on top.
    pub level: String,
    /// One JSON object per line on stdout
    pub json: bool,
    /// Source file and line on every record
    pub file_info: bool,
    /// Record span enter and exit, useful when following one call id
    pub spans: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file_info: false,
            spans: false,
        }
    }
}

impl LogSettings {
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Default::default()
        }
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    pub fn with_spans(mut self) -> Self {
        self.spans = true;
        self
    }

    /// Parsed level; fails on anything `tracing` does not know
    pub fn level(&self) -> BridgeResult<Level> {
        parse_log_level(&self.level)
    }

    fn filter(&self) -> BridgeResult<EnvFilter> {
        let directive = format!("{}={}", env!("CARGO_CRATE_NAME"), self.level()?.as_str().to_ascii_lowercase())
            .parse()
            .map_err(|e| BridgeError::invalid_configuration("logging.level", format!("{e}")))?;
        Ok(EnvFilter::from_default_env().add_directive(directive))
    }
}

/// Install a global subscriber for the bridge.
///
/// Returns `Ok(false)` when another subscriber is already installed; that
/// one keeps receiving the bridge's events. An unparseable level is an
/// [`BridgeError::InvalidConfiguration`].
pub fn install(settings: &LogSettings, account_id: &str) -> BridgeResult<bool> {
    let span_events = if settings.spans { FmtSpan::ACTIVE } else { FmtSpan::NONE };
    let builder = fmt::Subscriber::builder()
        .with_env_filter(settings.filter()?)
        .with_span_events(span_events)
        .with_file(settings.file_info)
        .with_line_number(settings.file_info);

    let installed = if settings.json {
        builder.with_writer(std::io::stdout).json().try_init()
    } else {
        builder.try_init()
    };

    match installed {
        Ok(()) => {
            info!(account = %account_id, version = crate::VERSION, level = %settings.level, "Call bridge logging installed");
            Ok(true)
        }
        Err(e) => {
            debug!(error = %e, "Keeping the existing subscriber");
            Ok(false)
        }
    }
}

/// Parse a log level name, case-insensitively
pub fn parse_log_level(level: &str) -> BridgeResult<Level> {
    Level::from_str(level.trim())
        .map_err(|_| BridgeError::invalid_configuration("logging.level", format!("unknown log level: {level}")))
}
