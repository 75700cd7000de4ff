use crate::api::{ChatClient, ChatOutcome, ChunkStream};
use crate::errors::{AppError, AppResult};
use crate::models::{
    ChatMessage, Conversation, ConversationWithMessages, Message, ModelInfo, Role,
};
use crate::storage::StorageManager;
use serde::Serialize;

const TITLE_WORDS: usize = 5;

/// Builds a conversation title from the opening message: its first five
/// whitespace-separated words followed by an ellipsis.
pub fn derive_title(message: &str) -> String {
    let words: Vec<&str> = message.split_whitespace().take(TITLE_WORDS).collect();
    format!("{}...", words.join(" "))
}

/// Rejects missing or blank message text. The text is kept as submitted.
pub fn validate_message(message: Option<String>) -> AppResult<String> {
    match message {
        Some(text) if !text.trim().is_empty() => Ok(text),
        _ => Err(AppError::validation("Message is required")),
    }
}

// The reply slot the event stream is filling: an empty assistant message.
fn is_placeholder(message: &Message, message_id: i64) -> bool {
    message.id == message_id && message.role == Role::Assistant && message.content.is_empty()
}

/// Result of a synchronous send.
#[derive(Serialize, Debug, PartialEq)]
pub struct SendOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Returned when a streamed reply has been set up; the browser opens the
/// event stream and later finalizes `message_id`.
#[derive(Debug)]
pub struct StreamStart {
    pub message_id: i64,
    pub conversation: ConversationWithMessages,
}

/// Conversation flows: persists turns and asks the completion API for replies.
#[derive(Clone)]
pub struct ChatService {
    storage: StorageManager,
    client: ChatClient,
}

impl ChatService {
    pub fn new(storage: StorageManager, client: ChatClient) -> Self {
        Self { storage, client }
    }

    pub fn models(&self) -> &'static [ModelInfo] {
        self.client.models()
    }

    pub async fn list_conversations(&self) -> AppResult<Vec<Conversation>> {
        Ok(self.storage.list_conversations().await?)
    }

    pub async fn get_conversation(&self, id: i64) -> AppResult<ConversationWithMessages> {
        self.storage
            .get_conversation(id)
            .await?
            .ok_or_else(|| AppError::not_found("Conversation not found"))
    }

    pub async fn delete_conversation(&self, id: i64) -> AppResult<()> {
        if !self.storage.delete_conversation(id).await? {
            return Err(AppError::not_found("Conversation not found"));
        }
        log::info!("Deleted conversation {}", id);
        Ok(())
    }

    /// Creates a conversation from its first message and asks for a reply.
    /// An upstream failure leaves the conversation without an assistant turn.
    pub async fn start_conversation(&self, message: Option<String>) -> AppResult<Conversation> {
        let text = validate_message(message)?;
        let conversation = self.storage.create_conversation(&derive_title(&text)).await?;

        let user_message = ChatMessage::user(text);
        self.storage.add_message(conversation.id, &user_message).await?;

        match self.client.chat(&[user_message], None).await {
            ChatOutcome::Success(reply) => {
                self.storage
                    .add_message(conversation.id, &ChatMessage::assistant(reply))
                    .await?;
            }
            ChatOutcome::Failure { error } => {
                log::warn!("No reply for new conversation {}: {}", conversation.id, error);
            }
        }
        Ok(conversation)
    }

    /// Appends a user turn and a synchronous reply using the whole history.
    pub async fn send_message(
        &self,
        conversation_id: i64,
        message: Option<String>,
    ) -> AppResult<SendOutcome> {
        let history = self.append_user_message(conversation_id, message).await?;

        match self.client.chat(&history.history(), None).await {
            ChatOutcome::Success(reply) => {
                self.storage
                    .add_message(conversation_id, &ChatMessage::assistant(reply))
                    .await?;
                Ok(SendOutcome { success: true, error: None })
            }
            ChatOutcome::Failure { error } => Ok(SendOutcome {
                success: false,
                error: Some(error),
            }),
        }
    }

    /// Appends a user turn and an empty assistant placeholder that the
    /// browser fills in once it has streamed the reply.
    pub async fn send_message_streaming(
        &self,
        conversation_id: i64,
        message: Option<String>,
    ) -> AppResult<StreamStart> {
        let history = self.append_user_message(conversation_id, message).await?;

        match self.client.stream_chat(&history.history(), None).await {
            // Only a reachability check: dropping the stream aborts that upstream request.
            ChatOutcome::Success(_check) => {}
            ChatOutcome::Failure { error } => return Err(AppError::Upstream(error)),
        }

        let placeholder = self
            .storage
            .add_message(conversation_id, &ChatMessage::assistant(""))
            .await?;
        let conversation = self.get_conversation(conversation_id).await?;
        log::info!(
            "Created placeholder message {} in conversation {}",
            placeholder.id,
            conversation_id
        );

        Ok(StreamStart { message_id: placeholder.id, conversation })
    }

    /// Opens an upstream stream for the reply stored in `message_id`. Only an
    /// empty assistant placeholder is left out of the context; any other id
    /// gets the full history.
    pub async fn stream_reply(
        &self,
        conversation_id: i64,
        message_id: i64,
    ) -> AppResult<ChunkStream> {
        let conversation = self.get_conversation(conversation_id).await?;
        let history: Vec<ChatMessage> = conversation
            .messages
            .iter()
            .filter(|m| !is_placeholder(m, message_id))
            .map(ChatMessage::from)
            .collect();

        match self.client.stream_chat(&history, None).await {
            ChatOutcome::Success(stream) => Ok(stream),
            ChatOutcome::Failure { error } => {
                log::error!(
                    "Could not start stream for conversation {}: {}",
                    conversation_id,
                    error
                );
                Err(AppError::Upstream("Failed to get streaming response".to_string()))
            }
        }
    }

    /// Stores the text the browser assembled from a streamed reply.
    pub async fn finalize_message(
        &self,
        conversation_id: i64,
        message_id: i64,
        content: Option<&str>,
    ) -> AppResult<()> {
        let content = match content {
            Some(text) if !text.is_empty() => text,
            _ => return Err(AppError::validation("Invalid content")),
        };

        let belongs = self
            .storage
            .get_message(message_id)
            .await?
            .is_some_and(|m| m.conversation_id == conversation_id && m.role == Role::Assistant);
        if !belongs || !self.storage.update_message(message_id, content).await? {
            return Err(AppError::not_found("Message not found"));
        }
        Ok(())
    }

    async fn append_user_message(
        &self,
        conversation_id: i64,
        message: Option<String>,
    ) -> AppResult<ConversationWithMessages> {
        let text = validate_message(message)?;
        // Checked up front so a missing conversation is a 404 rather than a
        // foreign key failure.
        self.get_conversation(conversation_id).await?;

        self.storage
            .add_message(conversation_id, &ChatMessage::user(text))
            .await?;
        self.get_conversation(conversation_id).await
    }
}
