//! Chat session
//!
//! The UI-facing surface: one session per open chat view. It owns the hub
//! connection, the message batcher and a cleanup registry, and tears all of
//! them down exactly once when closed or dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::IgnoredAny;
use supportdesk_shared::{AssistantRequest, Message, OutgoingMessage, Sender, UserId};
use time::OffsetDateTime;
use tokio::sync::watch;
use uuid::Uuid;

use crate::api_client::{
    ApiClient, ApiClientConfig, AssistantClient, AttachmentUploader, FileUpload, HistorySource,
    IdentityStore, StaticIdentity,
};
use crate::batching::{BatchConfig, MessageBatcher};
use crate::cleanup::CleanupRegistry;
use crate::config::RealtimeConfig;
use crate::error::{ChatError, ChatResult};
use crate::hub::{
    ConnectionState, HubConnection, HubError, ReceiveMessage, WebSocketTransport,
    SEND_MESSAGE_METHOD,
};

/// External collaborators of a session
#[derive(Clone)]
pub struct ChatServices {
    pub history: Arc<dyn HistorySource>,
    pub uploader: Arc<dyn AttachmentUploader>,
    pub assistant: Arc<dyn AssistantClient>,
    pub identity: Arc<dyn IdentityStore>,
}

impl ChatServices {
    /// Route every HTTP collaborator through one API client
    pub fn from_api(api: ApiClient, identity: Arc<dyn IdentityStore>) -> Self {
        let api = Arc::new(api);
        Self {
            history: api.clone(),
            uploader: api.clone(),
            assistant: api,
            identity,
        }
    }
}

/// One live chat surface
pub struct ChatSession {
    id: Uuid,
    hub: HubConnection,
    batcher: Arc<MessageBatcher>,
    services: ChatServices,
    cleanup: CleanupRegistry,
    activated: AtomicBool,
    closed: AtomicBool,
}

impl ChatSession {
    pub fn new(hub: HubConnection, services: ChatServices, batch: BatchConfig) -> Self {
        let session = Self {
            id: Uuid::new_v4(),
            hub,
            batcher: Arc::new(MessageBatcher::new(batch)),
            services,
            cleanup: CleanupRegistry::new(),
            activated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };

        let hub = session.hub.clone();
        session.cleanup.add(move || hub.dispose());
        session
    }

    /// Wire a session against the real API and hub
    pub fn from_config(config: &RealtimeConfig) -> ChatResult<Self> {
        let api = ApiClient::new(ApiClientConfig::from_realtime(config))?;
        let identity = Arc::new(StaticIdentity::new(config.user_id.clone()));

        let hub = HubConnection::new(
            config.hub_url()?,
            Arc::new(WebSocketTransport::new(config.api_token.clone())),
            config.reconnect_policy(),
        );

        Ok(Self::new(
            hub,
            ChatServices::from_api(api, identity),
            config.batch_config(),
        ))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn hub(&self) -> &HubConnection {
        &self.hub
    }

    fn ensure_open(&self) -> ChatResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChatError::Closed);
        }
        Ok(())
    }

    fn current_user(&self) -> ChatResult<UserId> {
        self.services
            .identity
            .current_user_id()
            .ok_or(ChatError::NotAuthenticated)
    }

    /// Start listening and load the stored history
    ///
    /// Live messages are subscribed before history is fetched so nothing that
    /// arrives in between is lost. The hub connects in the background: a hub
    /// that is slow or unreachable never holds up history, and a failure shows
    /// up in [`ChatSession::connection_error`]. Calling this again does nothing.
    pub async fn activate(&self) -> ChatResult<()> {
        self.ensure_open()?;
        if self.activated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let batcher = Arc::downgrade(&self.batcher);
        let subscription = self.hub.on::<ReceiveMessage, _>(move |event| {
            if let Some(batcher) = batcher.upgrade() {
                batcher.add_message(Message::from(event.0.clone()));
            }
        });
        self.cleanup.add(move || subscription.unsubscribe());

        let sweeper = self.batcher.spawn_sweeper();
        self.cleanup.add(move || sweeper.abort());

        let hub = self.hub.clone();
        let session_id = self.id;
        let connect = tokio::spawn(async move {
            if let Err(e) = hub.start().await {
                tracing::warn!(session_id = %session_id, error = %e, "Hub unavailable at activation");
            }
        });
        self.cleanup.add(move || connect.abort());

        tracing::info!(session_id = %self.id, "Chat session activated");

        match self.services.identity.current_user_id() {
            Some(user) => {
                self.batcher
                    .load_more_messages(self.services.history.as_ref(), &user)
                    .await?;
            }
            None => {
                tracing::debug!(session_id = %self.id, "No signed-in user - skipping history");
            }
        }
        Ok(())
    }

    /// Send a message, uploading its attachments first
    ///
    /// Identity and content are checked before anything touches the network.
    /// A known broken connection fails fast instead of waiting on the hub. If
    /// any upload fails the message is not sent.
    pub async fn send_message(&self, content: &str, attachments: Vec<FileUpload>) -> ChatResult<()> {
        self.ensure_open()?;
        let user = self.current_user()?;

        if content.trim().is_empty() && attachments.is_empty() {
            return Err(ChatError::Validation(
                "message needs content or at least one attachment".to_string(),
            ));
        }

        if let Some(error) = self.hub.connection_error() {
            tracing::debug!(session_id = %self.id, error = %error, "Send refused - connection unavailable");
            return Err(ChatError::ConnectionUnavailable(error));
        }

        let mut uploaded = Vec::with_capacity(attachments.len());
        for file in &attachments {
            match self.services.uploader.upload(file).await {
                Ok(attachment) => uploaded.push(attachment),
                Err(source) => {
                    tracing::warn!(
                        session_id = %self.id,
                        name = %file.name,
                        error = %source,
                        "Attachment upload failed - message not sent"
                    );
                    return Err(ChatError::Upload {
                        name: file.name.clone(),
                        source,
                    });
                }
            }
        }

        let outgoing = OutgoingMessage {
            content: content.to_string(),
            sender: Sender::User,
            timestamp: OffsetDateTime::now_utc(),
            attachments: uploaded,
        };
        let payload = serde_json::to_value(&outgoing).map_err(HubError::from)?;

        self.hub
            .invoke::<IgnoredAny>(SEND_MESSAGE_METHOD, vec![payload])
            .await?;

        tracing::info!(
            session_id = %self.id,
            user_id = %user,
            attachments = outgoing.attachments.len(),
            "Chat message sent"
        );
        Ok(())
    }

    /// Retry the hub after a failure; clears the connection error on success
    pub async fn reconnect(&self) -> ChatResult<()> {
        self.ensure_open()?;
        self.hub.start().await?;
        Ok(())
    }

    /// Fetch the next page of older history
    pub async fn load_more_messages(&self) -> ChatResult<usize> {
        self.ensure_open()?;
        let user = self.current_user()?;
        Ok(self
            .batcher
            .load_more_messages(self.services.history.as_ref(), &user)
            .await?)
    }

    pub fn clear_messages(&self) {
        self.batcher.clear_messages();
    }

    pub fn mark_read(&self, id: &str) -> bool {
        self.batcher.mark_read(id)
    }

    /// Ask the AI assistant; its answer joins the conversation
    pub async fn ask_assistant(&self, prompt: &str) -> ChatResult<Message> {
        self.ensure_open()?;
        let user = self.current_user()?;
        if prompt.trim().is_empty() {
            return Err(ChatError::Validation("prompt is empty".to_string()));
        }

        let response = self
            .services
            .assistant
            .ask(&AssistantRequest {
                user_id: user,
                prompt: prompt.to_string(),
            })
            .await?;

        let message = Message::new(
            Sender::Automated,
            Some(response.response),
            OffsetDateTime::now_utc(),
        );
        self.batcher.add_message(message.clone());
        Ok(message)
    }

    /// Published messages in display order
    pub fn messages(&self) -> Arc<[Message]> {
        self.batcher.messages()
    }

    pub fn subscribe_messages(&self) -> watch::Receiver<Arc<[Message]>> {
        self.batcher.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        self.batcher.is_loading()
    }

    pub fn has_more(&self) -> bool {
        self.batcher.has_more()
    }

    pub fn connection_error(&self) -> Option<String> {
        self.hub.connection_error()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.hub.state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.hub.watch_state()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tear everything down; later calls do nothing
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cleanup.run_all();
        tracing::info!(session_id = %self.id, "Chat session closed");
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("id", &self.id)
            .field("hub", &self.hub)
            .field("closed", &self.is_closed())
            .finish()
    }
}
