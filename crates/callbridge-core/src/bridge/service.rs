//! Foreground service entry point
//!
//! Presentation actions carry a [`ServiceCommand`]. The host delivers a
//! tapped action here, possibly from a different execution context than the
//! one that rendered it.

use tracing::{debug, info};

use crate::call::AudioRoute;
use crate::error::BridgeResult;
use crate::presentation::ServiceCommand;

use super::CallBridge;

impl CallBridge {
    /// Apply a command from a presentation action.
    ///
    /// Returns `Ok(false)` when the command referenced an unknown call.
    pub async fn handle_service_command(&self, command: ServiceCommand) -> BridgeResult<bool> {
        debug!(?command, "Service command received");
        match command {
            ServiceCommand::CallInProgress { call_id } => {
                if self.lookup(&call_id, "call_in_progress").await.is_none() {
                    return Ok(false);
                }
                self.refresh_presentation(&call_id).await?;
                Ok(true)
            }
            ServiceCommand::ToggleAudioRoute { call_id, target } => {
                let changed = self.route_audio(&call_id, target).await?;
                // route_audio only re-renders for speaker and earpiece
                if changed && !matches!(target, AudioRoute::Speaker | AudioRoute::Earpiece) {
                    self.refresh_presentation(&call_id).await?;
                }
                Ok(changed)
            }
            ServiceCommand::EndCall { call_id } => {
                let ended = match &call_id {
                    Some(call_id) => self.end_call(call_id).await?,
                    None => false,
                };
                if self.inner.presentation.stop().await? {
                    info!(call_id = ?call_id, "Presentation dismissed by end-call action");
                }
                Ok(ended)
            }
        }
    }
}
