//! HTTP and WebSocket surface of the relay.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{
        DefaultBodyLimit, Multipart, State,
        multipart::MultipartError,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::ai::GenerativeModel;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::session::{SessionHandler, SessionRegistry, SharedSession};
use crate::upload::{StoredUpload, UploadRejection, UploadStore};

const UPLOAD_FIELD: &str = "image";
const STORE_FAILURE: &str = "Error processing uploaded file.";

#[derive(Clone)]
pub struct AppState {
    sessions: Arc<SessionRegistry>,
    handler: SessionHandler,
    uploads: UploadStore,
}

impl AppState {
    pub fn new(model: Arc<dyn GenerativeModel>, uploads: UploadStore) -> Self {
        Self {
            sessions: Arc::new(SessionRegistry::new()),
            handler: SessionHandler::new(model, uploads.clone()),
            uploads,
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<UploadRejection> for ApiError {
    fn from(rejection: UploadRejection) -> Self {
        ApiError::bad_request(rejection.to_string())
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            UploadRejection::TooLarge.into()
        } else {
            ApiError::bad_request(err.body_text())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, self.message).into_response()
    }
}

/// Build the relay router. Files under `static_dir` are served for any unmatched path.
///
/// The route body limit covers the whole form; the image field itself is held
/// to `max_bytes` while it is read.
pub fn router(state: AppState, static_dir: Option<&Path>) -> Router {
    let body_limit = state.uploads.max_bytes().saturating_mul(2);
    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .route(
            "/upload",
            post(upload_handler).layer(DefaultBodyLimit::max(body_limit)),
        )
        .with_state(state);

    let router = match static_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router,
    };
    router.layer(TraceLayer::new_for_http())
}

/// Serve `app` until ctrl-c.
pub async fn serve(listener: TcpListener, app: Router) -> Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Relay server terminated unexpectedly")
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received; stopping relay");
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let model = state.handler.model();
    Json(json!({
        "status": "ok",
        "model": model.model_name(),
        "has_api_key": model.has_credentials(),
        "active_sessions": state.sessions.len(),
        "upload_dir": state.uploads.dir().to_string_lossy(),
        "metrics": model.metrics(),
    }))
}

async fn upload_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<StoredUpload>, ApiError> {
    while let Some(mut field) = multipart.next_field().await? {
        if field.name() != Some(UPLOAD_FIELD) {
            debug!(field = ?field.name(), "Skipping unexpected multipart field");
            continue;
        }

        let extension = state.uploads.check_file_name(field.file_name())?;
        let declared_mime = field.content_type().map(str::to_string);

        let mut data = Vec::new();
        while let Some(chunk) = field.chunk().await? {
            state.uploads.check_size(data.len() + chunk.len())?;
            data.extend_from_slice(&chunk);
        }

        let uploads = state.uploads.clone();
        let stored = task::spawn_blocking(move || {
            uploads.store(&data, &extension, declared_mime.as_deref())
        })
        .await
        .map_err(|err| {
            error!(?err, "blocking task panicked");
            ApiError::internal(STORE_FAILURE)
        })?
        .map_err(|err| {
            error!(error = %err, "Failed to store uploaded file");
            ApiError::internal(STORE_FAILURE)
        })?;

        info!(path = %stored.path, mime = %stored.mime_type, "Accepted upload");
        return Ok(Json(stored));
    }

    Err(UploadRejection::MissingFile.into())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_connection(socket, state))
}

async fn run_connection(mut socket: WebSocket, state: AppState) {
    let (id, session) = state.sessions.open();
    info!(connection = %id, "Client connected");

    while let Some(frame) = socket.recv().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                debug!(connection = %id, "Ignoring binary frame");
                continue;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!(connection = %id, error = %err, "WebSocket receive failed");
                break;
            }
        };

        let reply = handle_frame(&state, &session, &text).await;
        let payload = match reply.to_json() {
            Ok(payload) => payload,
            Err(err) => {
                error!(connection = %id, error = %err, "Failed to encode reply");
                continue;
            }
        };
        if let Err(err) = socket.send(Message::Text(payload)).await {
            warn!(connection = %id, error = %err, "WebSocket send failed");
            break;
        }
    }

    let opened_at = session.lock().await.opened_at();
    state.sessions.close(id);
    let connected_secs = (Utc::now() - opened_at).num_seconds();
    info!(connection = %id, connected_secs, "Client disconnected");
}

/// Decode one text frame and run it against the session.
async fn handle_frame(state: &AppState, session: &SharedSession, text: &str) -> ServerEvent {
    let event = match ClientEvent::parse(text) {
        Ok(event) => event,
        Err(err) => {
            warn!(error = %err, "Rejected malformed client event");
            return ServerEvent::Error(format!("Unrecognized event: {err}"));
        }
    };
    let mut session = session.lock().await;
    state.handler.handle(&mut session, event).await
}
