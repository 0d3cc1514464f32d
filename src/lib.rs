pub mod ai;
pub mod config;
pub mod protocol;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod upload;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::ai::{GeminiModel, GenerativeModel};
use crate::config::RelaySettings;
use crate::server::AppState;
use crate::telemetry::ServiceTelemetry;
use crate::upload::UploadStore;

/// Wires settings, the model client and upload storage into a servable relay.
pub struct Relay {
    settings: RelaySettings,
    state: AppState,
}

impl Relay {
    /// Build a relay backed by the Gemini API.
    pub fn from_settings(settings: RelaySettings, telemetry: Option<ServiceTelemetry>) -> Self {
        let mut model = GeminiModel::from_settings(&settings.model);
        if let Some(telemetry) = telemetry {
            model = model.with_telemetry(telemetry);
        }
        if !model.has_api_key() {
            warn!(
                env = %settings.model.api_key_env,
                "No model API key configured; chat requests will fail until it is set"
            );
        }
        Self::with_model(settings, Arc::new(model))
    }

    /// Build a relay around an arbitrary model implementation.
    pub fn with_model(settings: RelaySettings, model: Arc<dyn GenerativeModel>) -> Self {
        let uploads = UploadStore::new(settings.upload.clone());
        let state = AppState::new(model, uploads);
        Self { settings, state }
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        server::router(self.state.clone(), self.settings.static_dir.as_deref())
    }

    /// Bind the configured address and serve until ctrl-c.
    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = self.settings.listen_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind relay listener at {addr}"))?;
        info!(
            addr = %addr,
            model = %self.settings.model.model,
            upload_dir = %self.settings.upload.dir.display(),
            "Starting imagechat relay"
        );
        server::serve(listener, self.router()).await
    }
}
