// Browser-facing HTTP handlers

use crate::chat::SendOutcome;
use crate::errors::{AppError, AppResult};
use crate::models::{Conversation, ConversationWithMessages, ModelInfo};
use crate::state::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Redirect;
use axum::routing::{get, post, put};
use axum::{Form, Json, Router};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};

/// Form body shared by every message submission.
#[derive(Deserialize, Debug)]
pub struct MessageForm {
    pub message: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(list_conversations))
        .route("/models", get(list_models))
        .route("/new", post(create_conversation))
        .route("/convo/:id", get(get_conversation).delete(delete_conversation))
        .route("/convo/:id/message", post(send_message))
        .route("/convo/:id/message/stream", post(send_message_stream))
        .route("/convo/:id/message/:message_id", put(finalize_message))
        .route("/convo/:id/stream/:message_id", get(stream_events))
        .with_state(state)
}

async fn list_conversations(State(state): State<AppState>) -> AppResult<Json<Vec<Conversation>>> {
    log::info!("Listing conversations");
    Ok(Json(state.chat.list_conversations().await?))
}

async fn list_models(State(state): State<AppState>) -> Json<&'static [ModelInfo]> {
    Json(state.chat.models())
}

async fn create_conversation(
    State(state): State<AppState>,
    Form(form): Form<MessageForm>,
) -> AppResult<Redirect> {
    let conversation = state.chat.start_conversation(form.message).await?;
    Ok(Redirect::to(&format!("/convo/{}", conversation.id)))
}

async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<ConversationWithMessages>> {
    Ok(Json(state.chat.get_conversation(id).await?))
}

async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<StatusCode> {
    state.chat.delete_conversation(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Form(form): Form<MessageForm>,
) -> AppResult<Json<SendOutcome>> {
    log::info!("Sending message to conversation {}", id);
    Ok(Json(state.chat.send_message(id, form.message).await?))
}

async fn send_message_stream(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Form(form): Form<MessageForm>,
) -> AppResult<Json<Value>> {
    log::info!("Starting streamed reply in conversation {}", id);
    let start = state.chat.send_message_streaming(id, form.message).await?;
    Ok(Json(json!({
        "success": true,
        "messageId": start.message_id,
        "stream": true,
        "conversation": start.conversation,
    })))
}

async fn finalize_message(
    State(state): State<AppState>,
    Path((id, message_id)): Path<(i64, i64)>,
    payload: Result<Json<Value>, JsonRejection>,
) -> AppResult<StatusCode> {
    let Json(body) = payload.map_err(|e| AppError::validation(format!("Invalid content: {}", e)))?;
    let content = body.get("content").and_then(Value::as_str);
    state.chat.finalize_message(id, message_id, content).await?;
    Ok(StatusCode::NO_CONTENT)
}

// Logs how a relay ended. Dropping the relay stream (browser disconnect)
// also drops the upstream stream, which aborts the upstream request.
struct RelayLog {
    conversation_id: i64,
    message_id: i64,
    chunks: usize,
    finished: bool,
}

impl Drop for RelayLog {
    fn drop(&mut self) {
        if self.finished {
            log::info!(
                "Relayed {} chunks for message {} in conversation {}",
                self.chunks,
                self.message_id,
                self.conversation_id
            );
        } else {
            log::warn!(
                "Relay for message {} in conversation {} stopped after {} chunks; upstream dropped",
                self.message_id,
                self.conversation_id,
                self.chunks
            );
        }
    }
}

async fn stream_events(
    State(state): State<AppState>,
    Path((id, message_id)): Path<(i64, i64)>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, anyhow::Error>>>> {
    let mut upstream = state.chat.stream_reply(id, message_id).await?;

    let events = async_stream::stream! {
        let mut relay = RelayLog { conversation_id: id, message_id, chunks: 0, finished: false };
        while let Some(item) = upstream.next().await {
            let event = item.and_then(|chunk| {
                relay.chunks += 1;
                Event::default().json_data(&chunk).map_err(anyhow::Error::from)
            });
            let failed = event.is_err();
            if let Err(e) = &event {
                log::error!("Error in stream for conversation {}: {:?}", id, e);
            }
            yield event;
            if failed {
                return;
            }
        }
        relay.finished = true;
        yield Ok(Event::default().data("[DONE]"));
    };

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
