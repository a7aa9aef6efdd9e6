//! Foreground Presentation Coordinator
//!
//! While a call is live the platform requires an always-visible "ongoing
//! call" affordance. This module renders it from session state and keeps at
//! most one native presentation alive per process.
//!
//! # Renderers
//!
//! Rendering goes through the [`PresentationRenderer`] trait. The default is
//! [`MinimalPresentation`]; a richer layout is a plugin registered once at
//! startup in a [`PresentationRegistry`] under a name, and selected by the
//! `presentation_plugin` configuration value:
//!
//! ```rust
//! use std::sync::Arc;
//! use rvoip_callbridge_core::ForegroundSettings;
//! use rvoip_callbridge_core::presentation::{
//!     MinimalPresentation, PresentationRegistry, RendererResult,
//! };
//!
//! let registry = PresentationRegistry::new();
//! registry.register("compact", |_settings: &ForegroundSettings| -> RendererResult {
//!     Ok(Arc::new(MinimalPresentation))
//! });
//! assert!(registry.contains("compact"));
//! ```
//!
//! A name with no registered factory, or a factory that fails, is reported
//! as [`BridgeError::PluginResolutionFailed`] when the first presentation is
//! started. The coordinator never falls back silently to the minimal layout.
//!
//! # Actions
//!
//! Presentation actions carry a [`ServiceCommand`] instead of mutating the
//! session. The host routes a tapped action back into
//! [`CallBridge::handle_service_command`](crate::bridge::CallBridge::handle_service_command),
//! which may run in a different execution context from the renderer.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::call::{keys, AudioRoute, CallId, CallSession};
use crate::config::ForegroundSettings;
use crate::error::{BridgeError, BridgeResult};
use crate::native::NativeTelephony;

/// Handle of a running native presentation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PresentationHandle(pub u64);

/// Command sent back to the service entry point by a presentation action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceCommand {
    /// Re-render the presentation for a call
    CallInProgress { call_id: CallId },
    /// Switch the call's audio route, then re-render
    ToggleAudioRoute { call_id: CallId, target: AudioRoute },
    /// End the call and dismiss the presentation
    EndCall { call_id: Option<CallId> },
}

/// Button on the presentation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationAction {
    pub label: String,
    pub command: ServiceCommand,
}

/// Rendered foreground presentation content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presentation {
    pub call_id: CallId,
    pub channel_id: String,
    /// Name of the renderer that produced this presentation
    pub layout: String,
    pub title: String,
    pub text: String,
    pub icon: Option<String>,
    pub elapsed_secs: i64,
    pub muted: bool,
    pub audio_route: AudioRoute,
    /// Opened when the presentation body is tapped
    pub content_link: Option<String>,
    pub actions: Vec<PresentationAction>,
}

impl Presentation {
    /// Action whose command toggles the audio route, if present
    pub fn toggle_route_action(&self) -> Option<&PresentationAction> {
        self.actions
            .iter()
            .find(|action| matches!(action.command, ServiceCommand::ToggleAudioRoute { .. }))
    }
}

/// Return-to-app deep link: `scheme://path?key=value&...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deeplink {
    scheme: String,
    path: String,
    params: BTreeMap<String, String>,
}

impl Deeplink {
    pub fn new(scheme: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            path: path.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Build the link, percent-encoding parameter values
    pub fn to_url(&self) -> BridgeResult<Url> {
        let mut url = Url::parse(&format!("{}://{}", self.scheme, self.path))
            .map_err(|e| BridgeError::invalid_configuration("deeplink_scheme", e.to_string()))?;
        if !self.params.is_empty() {
            let mut query = url.query_pairs_mut();
            for (key, value) in &self.params {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }
}

/// Renders a session into presentation content
pub trait PresentationRenderer: Send + Sync {
    /// Layout name reported in [`Presentation::layout`]
    fn name(&self) -> &str;

    fn render(&self, session: &CallSession, settings: &ForegroundSettings) -> BridgeResult<Presentation>;
}

/// Default presentation: title, caller, end-call and speaker toggle
#[derive(Debug, Clone, Copy, Default)]
pub struct MinimalPresentation;

impl PresentationRenderer for MinimalPresentation {
    fn name(&self) -> &str {
        "minimal"
    }

    fn render(&self, session: &CallSession, settings: &ForegroundSettings) -> BridgeResult<Presentation> {
        let text = if session.display_name.is_empty() {
            session.address.number.clone()
        } else {
            session.display_name.clone()
        };

        let speaker_label = if session.audio_route == AudioRoute::Earpiece {
            "Speaker on"
        } else {
            "Speaker off"
        };

        let link = Deeplink::new(&settings.deeplink_scheme, "return-to-app")
            .with_param(keys::CALL_UUID, session.id.to_string())
            .to_url()?;

        Ok(Presentation {
            call_id: session.id.clone(),
            channel_id: settings.channel_id.clone(),
            layout: self.name().to_string(),
            title: settings.notification_title.clone(),
            text,
            icon: settings.notification_icon.clone(),
            elapsed_secs: session.elapsed().num_seconds(),
            muted: session.muted,
            audio_route: session.audio_route,
            content_link: Some(link.to_string()),
            actions: vec![
                PresentationAction {
                    label: "End call".to_string(),
                    command: ServiceCommand::EndCall {
                        call_id: Some(session.id.clone()),
                    },
                },
                PresentationAction {
                    label: speaker_label.to_string(),
                    command: ServiceCommand::ToggleAudioRoute {
                        call_id: session.id.clone(),
                        target: session.audio_route.toggled(),
                    },
                },
            ],
        })
    }
}

/// Result of instantiating a renderer plugin
pub type RendererResult = BridgeResult<Arc<dyn PresentationRenderer>>;

/// Creates a renderer from the foreground settings
pub trait PresentationFactory: Send + Sync {
    fn create(&self, settings: &ForegroundSettings) -> RendererResult;
}

impl<F> PresentationFactory for F
where
    F: Fn(&ForegroundSettings) -> RendererResult + Send + Sync,
{
    fn create(&self, settings: &ForegroundSettings) -> RendererResult {
        self(settings)
    }
}

/// Named presentation plugins, registered once at startup
#[derive(Default)]
pub struct PresentationRegistry {
    factories: DashMap<String, Arc<dyn PresentationFactory>>,
}

impl fmt::Debug for PresentationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresentationRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}

impl PresentationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`, replacing any earlier one
    pub fn register(&self, name: impl Into<String>, factory: impl PresentationFactory + 'static) {
        let name = name.into();
        if self.factories.insert(name.clone(), Arc::new(factory)).is_some() {
            warn!(plugin = %name, "Presentation plugin replaced");
        } else {
            debug!(plugin = %name, "Presentation plugin registered");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Instantiate the plugin registered under `name`
    pub fn resolve(&self, name: &str, settings: &ForegroundSettings) -> RendererResult {
        let factory = self
            .factories
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                BridgeError::plugin_resolution_failed(
                    name,
                    format!("no factory registered (known plugins: {:?})", self.names()),
                )
            })?;

        factory.create(settings).map_err(|e| match e {
            BridgeError::PluginResolutionFailed { .. } => e,
            other => BridgeError::plugin_resolution_failed(name, format!("factory failed: {}", other)),
        })
    }
}

#[derive(Debug, Clone)]
struct ActivePresentation {
    handle: PresentationHandle,
    call_id: CallId,
}

/// Keeps the single foreground presentation in step with session state
pub struct PresentationCoordinator {
    settings: Option<ForegroundSettings>,
    plugin: Option<String>,
    plugins: Arc<PresentationRegistry>,
    renderer: parking_lot::Mutex<Option<Arc<dyn PresentationRenderer>>>,
    native: Arc<dyn NativeTelephony>,
    current: Mutex<Option<ActivePresentation>>,
}

impl fmt::Debug for PresentationCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresentationCoordinator")
            .field("settings", &self.settings)
            .field("plugin", &self.plugin)
            .finish()
    }
}

impl PresentationCoordinator {
    pub fn new(
        settings: Option<ForegroundSettings>,
        plugin: Option<String>,
        plugins: Arc<PresentationRegistry>,
        native: Arc<dyn NativeTelephony>,
    ) -> Self {
        Self {
            settings,
            plugin,
            plugins,
            renderer: parking_lot::Mutex::new(None),
            native,
            current: Mutex::new(None),
        }
    }

    /// Whether foreground settings were configured
    pub fn is_configured(&self) -> bool {
        self.settings.is_some()
    }

    /// Resolve the renderer once and cache it
    fn renderer(&self, settings: &ForegroundSettings) -> RendererResult {
        let mut cached = self.renderer.lock();
        if let Some(renderer) = cached.as_ref() {
            return Ok(renderer.clone());
        }
        let renderer: Arc<dyn PresentationRenderer> = match &self.plugin {
            Some(name) => self.plugins.resolve(name, settings)?,
            None => Arc::new(MinimalPresentation),
        };
        info!(layout = renderer.name(), "Presentation renderer resolved");
        *cached = Some(renderer.clone());
        Ok(renderer)
    }

    /// Render `session` and start or replace the foreground presentation.
    ///
    /// Disconnected sessions are ignored; stopping is explicit via
    /// [`stop`](Self::stop).
    pub async fn on_session_state_changed(&self, session: &CallSession) -> BridgeResult<()> {
        let Some(settings) = &self.settings else {
            debug!(call_id = %session.id, "Foreground presentation not configured, skipping");
            return Ok(());
        };
        if session.state.is_terminated() {
            return Ok(());
        }

        let renderer = self.renderer(settings)?;
        let presentation = renderer.render(session, settings)?;

        let mut current = self.current.lock().await;
        let handle = self.native.start_foreground(&presentation).await?;
        let previous = current.replace(ActivePresentation {
            handle,
            call_id: session.id.clone(),
        });
        if let Some(previous) = previous.filter(|previous| previous.handle != handle) {
            debug!(
                previous = ?previous.handle,
                current = ?handle,
                "Foreground presentation superseded"
            );
            // The new presentation is already up; a stale one that will not
            // stop must not fail the update.
            if let Err(e) = self.native.stop_foreground(previous.handle).await {
                warn!(handle = ?previous.handle, error = %e, "Failed to stop superseded presentation");
            }
        }
        debug!(call_id = %session.id, state = ?session.state, "Foreground presentation updated");
        Ok(())
    }

    /// Stop the current presentation. Returns `false` if none was running.
    pub async fn stop(&self) -> BridgeResult<bool> {
        let mut current = self.current.lock().await;
        match current.take() {
            Some(active) => {
                self.native.stop_foreground(active.handle).await?;
                info!(call_id = %active.call_id, "Foreground presentation stopped");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn is_presenting(&self) -> bool {
        self.current.lock().await.is_some()
    }

    /// Call the current presentation reflects
    pub async fn presented_call(&self) -> Option<CallId> {
        self.current.lock().await.as_ref().map(|active| active.call_id.clone())
    }
}
