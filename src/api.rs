use crate::models::{default_model, ChatMessage, ModelInfo, AVAILABLE_MODELS};
use anyhow::{Context, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{future, Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;

/// Sampling temperature sent with every completion request.
pub const TEMPERATURE: f64 = 0.7;

// Alias for the stream type we'll return
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatCompletionChunk>> + Send>>;

// Trait defining the interface for LLM API providers
#[async_trait]
pub trait LLMApiProvider: Send + Sync {
    // Returns the text of the first choice, or an empty string if there is none.
    async fn send_chat_request(&self, model: &str, messages: &[ChatMessage]) -> Result<String>;

    // Returns a stream of partial-response chunks.
    async fn send_chat_stream_request(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<ChunkStream>;
}

// --- OpenAI Compatible Provider Implementation ---

#[derive(Serialize, Debug)]
struct OpenAIRequestBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f64,
    stream: bool,
}

// Response structure for non-streaming completions
#[derive(Deserialize, Debug)]
struct OpenAIResponse {
    #[serde(default)]
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize, Debug)]
struct OpenAIChoice {
    message: Option<OpenAIResponseMessage>,
}

#[derive(Deserialize, Debug)]
struct OpenAIResponseMessage {
    content: Option<String>,
}

/// One partial response from a streaming completion. Relayed to the
/// browser as-is, so it serializes back to the upstream shape.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>, // Null until the last chunk
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ChunkDelta {
    // Role might appear in the first chunk
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ChatCompletionChunk {
    /// Text carried by the first choice of this chunk, if any.
    pub fn delta_content(&self) -> Option<&str> {
        self.choices.first().and_then(|c| c.delta.content.as_deref())
    }
}

#[derive(Debug, PartialEq)]
enum StreamEvent {
    Chunk(ChatCompletionChunk),
    Skip,
    Done,
}

// Classifies the data field of one upstream SSE event.
fn parse_stream_event(data: &str) -> Result<StreamEvent> {
    let data = data.trim();
    if data.is_empty() {
        return Ok(StreamEvent::Skip);
    }
    if data == "[DONE]" {
        log::info!("Stream finished with [DONE]");
        return Ok(StreamEvent::Done);
    }

    let value: serde_json::Value = serde_json::from_str(data)
        .with_context(|| format!("Failed to parse stream chunk as JSON: {}", data))?;
    if value.get("type").and_then(|t| t.as_str()) == Some("ping") {
        log::debug!("Received stream ping event, skipping.");
        return Ok(StreamEvent::Skip);
    }
    // Errors raised after the response has started arrive as an event.
    if let Some(error) = value.get("error") {
        return Err(anyhow::anyhow!("Upstream stream error: {}", error));
    }

    let chunk = serde_json::from_value(value)
        .with_context(|| format!("Parsed as JSON but not a valid completion chunk: {}", data))?;
    Ok(StreamEvent::Chunk(chunk))
}

pub struct OpenAICompatibleProvider {
    client: Client,
    api_url: String,
    api_key: String,
}

impl OpenAICompatibleProvider {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_url: api_url.into(),
            api_key: api_key.into(),
        }
    }

    async fn post_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        stream: bool,
    ) -> Result<reqwest::Response> {
        let request_body = OpenAIRequestBody {
            model,
            messages,
            temperature: TEMPERATURE,
            stream,
        };
        let request_url = format!("{}/chat/completions", self.api_url.trim_end_matches('/'));
        log::info!(
            "Sending {} request to {} using model {} ({} messages)",
            if stream { "stream" } else { "chat" },
            request_url,
            model,
            messages.len()
        );

        let response = self
            .client
            .post(&request_url)
            .bearer_auth(&self.api_key)
            .json(&request_body)
            .send()
            .await
            .context("Failed to send request to chat completion API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "<Failed to read error body>".to_string());
            return Err(anyhow::anyhow!(
                "API request failed with status {}: {}",
                status,
                error_body
            ));
        }
        Ok(response)
    }
}

#[async_trait]
impl LLMApiProvider for OpenAICompatibleProvider {
    async fn send_chat_request(&self, model: &str, messages: &[ChatMessage]) -> Result<String> {
        let response = self.post_completion(model, messages, false).await?;
        let body: OpenAIResponse = response
            .json()
            .await
            .context("Failed to decode chat completion response")?;

        Ok(body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .unwrap_or_default())
    }

    async fn send_chat_stream_request(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<ChunkStream> {
        let response = self.post_completion(model, messages, true).await?;

        let chunk_stream = response
            .bytes_stream()
            .eventsource()
            .map(|event_result| -> Result<StreamEvent> {
                let event = event_result.context("Error reading stream event")?;
                parse_stream_event(&event.data)
            })
            .take_while(|event| future::ready(!matches!(event, Ok(StreamEvent::Done))))
            .filter_map(|event| async move {
                match event {
                    Ok(StreamEvent::Chunk(chunk)) => Some(Ok(chunk)),
                    Ok(_) => None,
                    Err(e) => {
                        log::error!("Error processing stream chunk: {:?}", e);
                        Some(Err(e))
                    }
                }
            });

        Ok(Box::pin(chunk_stream))
    }
}

// --- Chat Client ---

/// Outcome of a call to the completion API. Failures carry a readable
/// message and are never raised as errors.
pub enum ChatOutcome<T> {
    Success(T),
    Failure { error: String },
}

impl<T> ChatOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, ChatOutcome::Success(_))
    }

    fn from_result(result: Result<T>, operation: &str) -> Self {
        match result {
            Ok(value) => ChatOutcome::Success(value),
            Err(e) => {
                log::error!("Error in {}: {:?}", operation, e);
                ChatOutcome::Failure { error: format!("{:#}", e) }
            }
        }
    }
}

/// Shared handle to the completion API, created once at startup and
/// passed to request handlers through application state.
#[derive(Clone)]
pub struct ChatClient {
    provider: Arc<dyn LLMApiProvider>,
}

impl ChatClient {
    pub fn new(provider: Arc<dyn LLMApiProvider>) -> Self {
        Self { provider }
    }

    pub fn models(&self) -> &'static [ModelInfo] {
        AVAILABLE_MODELS
    }

    pub async fn chat(&self, history: &[ChatMessage], model: Option<&str>) -> ChatOutcome<String> {
        let model = model.unwrap_or(default_model().id);
        let result = self.provider.send_chat_request(model, history).await;
        ChatOutcome::from_result(result, "chat")
    }

    pub async fn stream_chat(
        &self,
        history: &[ChatMessage],
        model: Option<&str>,
    ) -> ChatOutcome<ChunkStream> {
        let model = model.unwrap_or(default_model().id);
        let result = self.provider.send_chat_stream_request(model, history).await;
        ChatOutcome::from_result(result, "stream_chat")
    }
}
