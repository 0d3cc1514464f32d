use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ai::{ChatTurn, ContentPart, Conversation, GenerativeModel};
use crate::protocol::{ClientEvent, ServerEvent, UploadEvent};
use crate::upload::UploadStore;

const MESSAGE_FAILURE: &str = "An error occurred while processing your message.";
const IMAGE_FAILURE_PREFIX: &str = "An error occurred while processing the image: ";
const MISSING_PATH: &str = "File path is missing";

/// Conversation state of one connection.
#[derive(Debug, Clone, Default)]
pub enum ConversationState {
    #[default]
    NoConversation,
    HasConversation(Conversation),
}

/// Per-connection record, alive from connect to disconnect.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    opened_at: DateTime<Utc>,
    state: ConversationState,
}

impl Session {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            opened_at: Utc::now(),
            state: ConversationState::NoConversation,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn conversation(&self) -> Option<&Conversation> {
        match &self.state {
            ConversationState::HasConversation(conversation) => Some(conversation),
            ConversationState::NoConversation => None,
        }
    }

    fn replace_conversation(&mut self, conversation: Conversation) -> bool {
        let replaced = matches!(self.state, ConversationState::HasConversation(_));
        self.state = ConversationState::HasConversation(conversation);
        replaced
    }
}

pub type SharedSession = Arc<AsyncMutex<Session>>;

/// Live sessions keyed by connection id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, SharedSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection and return its id and session.
    pub fn open(&self) -> (Uuid, SharedSession) {
        let id = Uuid::new_v4();
        let session = Arc::new(AsyncMutex::new(Session::new(id)));
        self.lock().insert(id, Arc::clone(&session));
        (id, session)
    }

    /// Drop the session for `id`. Returns false when it was already gone.
    pub fn close(&self, id: Uuid) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, SharedSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Routes socket events for a session to the model.
#[derive(Clone)]
pub struct SessionHandler {
    model: Arc<dyn GenerativeModel>,
    uploads: UploadStore,
}

impl SessionHandler {
    pub fn new(model: Arc<dyn GenerativeModel>, uploads: UploadStore) -> Self {
        Self { model, uploads }
    }

    pub fn model(&self) -> &Arc<dyn GenerativeModel> {
        &self.model
    }

    pub async fn handle(&self, session: &mut Session, event: ClientEvent) -> ServerEvent {
        match event {
            ClientEvent::Message(text) => self.handle_message(session, text).await,
            ClientEvent::Upload(upload) => self.handle_upload(session, upload).await,
        }
    }

    /// Start or continue a text conversation.
    pub async fn handle_message(&self, session: &mut Session, text: String) -> ServerEvent {
        let connection = session.id;
        let model = Arc::clone(&self.model);

        let outcome = match session.state.clone() {
            ConversationState::NoConversation => {
                info!(connection = %connection, "Starting new chat from message");
                run_blocking(move || {
                    let prompt = vec![ContentPart::text(text)];
                    let reply = model.generate_content(&prompt)?;
                    let conversation =
                        model.start_chat(vec![ChatTurn::user(prompt), ChatTurn::model(&reply)]);
                    Ok((reply, conversation))
                })
                .await
            }
            ConversationState::HasConversation(mut conversation) => {
                debug!(
                    connection = %connection,
                    turns = conversation.history().len(),
                    "Continuing existing chat"
                );
                run_blocking(move || {
                    let reply = model.send_message(&mut conversation, &text)?;
                    Ok((reply, conversation))
                })
                .await
            }
        };

        match outcome {
            Ok((reply, conversation)) => {
                session.state = ConversationState::HasConversation(conversation);
                info!(connection = %connection, reply_chars = reply.chars().count(), "Model replied");
                ServerEvent::Message(reply)
            }
            Err(err) => {
                error!(connection = %connection, error = %err, "Error processing message");
                ServerEvent::Error(MESSAGE_FAILURE.into())
            }
        }
    }

    /// Start a new conversation from an uploaded image, replacing any current one.
    pub async fn handle_upload(&self, session: &mut Session, event: UploadEvent) -> ServerEvent {
        let connection = session.id;
        let Some(raw_path) = event.path.filter(|path| !path.trim().is_empty()) else {
            warn!(connection = %connection, "Upload event without a file path");
            return ServerEvent::Error(MISSING_PATH.into());
        };

        let uploads = self.uploads.clone();
        let lookup = raw_path.clone();
        let path = match run_blocking(move || uploads.locate(&lookup)).await {
            Ok(path) => path,
            Err(err) => {
                warn!(connection = %connection, path = %raw_path, error = %err, "Upload path rejected");
                return ServerEvent::Error(err.to_string());
            }
        };

        info!(
            connection = %connection,
            path = %path.display(),
            mime = event.mime_type.as_deref().unwrap_or("unknown"),
            "Starting new chat from image"
        );

        let model = Arc::clone(&self.model);
        let uploads = self.uploads.clone();
        let prompt = event.initial_prompt;
        let declared_mime = event.mime_type;
        let outcome = run_blocking(move || {
            let image = uploads.load_for_prompt(&path, declared_mime.as_deref())?;
            let mut parts = Vec::with_capacity(2);
            if !prompt.trim().is_empty() {
                parts.push(ContentPart::text(prompt));
            }
            parts.push(ContentPart::inline_data(image.mime_type, image.data));

            let reply = model.generate_content(&parts)?;
            let conversation =
                model.start_chat(vec![ChatTurn::user(parts), ChatTurn::model(&reply)]);
            Ok((reply, conversation))
        })
        .await;

        match outcome {
            Ok((reply, conversation)) => {
                if session.replace_conversation(conversation) {
                    info!(connection = %connection, "Discarded previous conversation");
                }
                info!(connection = %connection, reply_chars = reply.chars().count(), "Model replied to image");
                ServerEvent::Message(reply)
            }
            Err(err) => {
                error!(connection = %connection, error = %err, "Error processing image");
                ServerEvent::Error(format!("{IMAGE_FAILURE_PREFIX}{err:#}"))
            }
        }
    }
}

async fn run_blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(work)
        .await
        .context("Blocking worker did not complete")?
}
