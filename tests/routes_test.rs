// Drives the HTTP router end to end against an in-memory store and a
// scripted completion provider.

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use convochat_lib::api::{
    ChatClient, ChatCompletionChunk, ChunkChoice, ChunkDelta, ChunkStream, LLMApiProvider,
};
use convochat_lib::models::{ChatMessage, Role};
use convochat_lib::routes::router;
use convochat_lib::state::AppState;
use convochat_lib::storage::StorageManager;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

struct ScriptedProvider {
    fail: bool,
    pieces: Vec<&'static str>,
    // Error item yielded after the pieces, as if the upstream broke off.
    mid_stream_error: Option<&'static str>,
}

fn chunk(content: &str) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: "chunk-1".to_string(),
        object: "chat.completion.chunk".to_string(),
        created: 1,
        model: "test-model".to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta {
                role: None,
                content: Some(content.to_string()),
            },
            finish_reason: None,
        }],
    }
}

#[async_trait]
impl LLMApiProvider for ScriptedProvider {
    async fn send_chat_request(
        &self,
        _model: &str,
        messages: &[ChatMessage],
    ) -> anyhow::Result<String> {
        if self.fail {
            anyhow::bail!("upstream down");
        }
        Ok(format!("echo: {}", messages.last().map(|m| m.content.as_str()).unwrap_or("")))
    }

    async fn send_chat_stream_request(
        &self,
        _model: &str,
        _messages: &[ChatMessage],
    ) -> anyhow::Result<ChunkStream> {
        if self.fail {
            anyhow::bail!("upstream down");
        }
        let mut chunks: Vec<anyhow::Result<ChatCompletionChunk>> =
            self.pieces.iter().map(|p| Ok(chunk(p))).collect();
        if let Some(error) = self.mid_stream_error {
            chunks.push(Err(anyhow::anyhow!(error)));
        }
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

struct TestApp {
    router: Router,
    storage: StorageManager,
}

async fn spawn_app(fail: bool) -> TestApp {
    spawn_app_with(ScriptedProvider {
        fail,
        pieces: vec!["Full", " reply"],
        mid_stream_error: None,
    })
    .await
}

async fn spawn_app_with(provider: ScriptedProvider) -> TestApp {
    let storage = StorageManager::in_memory().await.unwrap();
    let provider = Arc::new(provider);
    let state = AppState::new(storage.clone(), ChatClient::new(provider));
    TestApp {
        router: router(state),
        storage,
    }
}

fn form(method: Method, uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn json_request(method: Method, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty(method: Method, uri: &str) -> Request<Body> {
    Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
}

async fn send(
    app: &TestApp,
    request: Request<Body>,
) -> (StatusCode, axum::http::HeaderMap, String) {
    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn new_conversation(app: &TestApp, message: &str) -> i64 {
    let body = format!("message={}", message.replace(' ', "+"));
    let (status, headers, _) = send(app, form(Method::POST, "/new", &body)).await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    let location = headers[header::LOCATION].to_str().unwrap();
    location.trim_start_matches("/convo/").parse().unwrap()
}

#[tokio::test]
async fn new_conversation_redirects_and_stores_reply() {
    let app = spawn_app(false).await;
    let id = new_conversation(&app, "Hello there how are you today").await;

    let (status, _, body) = send(&app, empty(Method::GET, &format!("/convo/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    let convo: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(convo["title"], "Hello there how are you...");
    assert_eq!(convo["messages"][0]["role"], "user");
    assert_eq!(convo["messages"][0]["content"], "Hello there how are you today");
    assert_eq!(convo["messages"][1]["role"], "assistant");
    assert_eq!(convo["messages"][1]["content"], "echo: Hello there how are you today");

    let (_, _, list) = send(&app, empty(Method::GET, "/")).await;
    let list: Value = serde_json::from_str(&list).unwrap();
    assert_eq!(list.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn blank_message_is_rejected_without_writes() {
    let app = spawn_app(false).await;
    let (status, _, body) = send(&app, form(Method::POST, "/new", "message=+++")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("Message is required"));

    let (status, _, _) = send(&app, form(Method::POST, "/new", "other=1")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(app.storage.list_conversations().await.unwrap().is_empty());

    let id = new_conversation(&app, "hi").await;
    let uri = format!("/convo/{}/message", id);
    let (status, _, _) = send(&app, form(Method::POST, &uri, "message=")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(app.storage.get_messages(id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn unknown_conversation_is_404() {
    let app = spawn_app(false).await;
    let (status, _, _) = send(&app, empty(Method::GET, "/convo/12345")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(&app, form(Method::POST, "/convo/12345/message", "message=hi")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(&app, empty(Method::GET, "/convo/12345/stream/1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn sync_send_reports_success_and_failure() {
    let app = spawn_app(false).await;
    let id = new_conversation(&app, "first").await;
    let (status, _, body) =
        send(&app, form(Method::POST, &format!("/convo/{}/message", id), "message=second")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!({ "success": true }));
    assert_eq!(app.storage.get_messages(id).await.unwrap().len(), 4);

    let failing = spawn_app(true).await;
    let id = failing.storage.create_conversation("t...").await.unwrap().id;
    let uri = format!("/convo/{}/message", id);
    let (status, _, body) = send(&failing, form(Method::POST, &uri, "message=hello")).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("upstream down"));
    let messages = failing.storage.get_messages(id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::User);
}

#[tokio::test]
async fn streaming_round_trip() {
    let app = spawn_app(false).await;
    let id = new_conversation(&app, "first").await;

    let (status, _, body) = send(
        &app,
        form(Method::POST, &format!("/convo/{}/message/stream", id), "message=more+please"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let start: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(start["success"], true);
    assert_eq!(start["stream"], true);
    let message_id = start["messageId"].as_i64().unwrap();
    let last = start["conversation"]["messages"].as_array().unwrap().last().unwrap().clone();
    assert_eq!(last["id"].as_i64().unwrap(), message_id);
    assert_eq!(last["content"], "");

    let (status, headers, events) =
        send(&app, empty(Method::GET, &format!("/convo/{}/stream/{}", id, message_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers[header::CONTENT_TYPE].to_str().unwrap().starts_with("text/event-stream"));

    let data: Vec<&str> = events
        .split("\n\n")
        .filter_map(|event| event.strip_prefix("data: "))
        .collect();
    assert_eq!(data.len(), 3);
    assert_eq!(data[2], "[DONE]");
    let assembled: String = data[..2]
        .iter()
        .map(|d| {
            let chunk: ChatCompletionChunk = serde_json::from_str(d).unwrap();
            chunk.delta_content().unwrap_or_default().to_string()
        })
        .collect();
    assert_eq!(assembled, "Full reply");

    let (status, _, _) = send(
        &app,
        json_request(
            Method::PUT,
            &format!("/convo/{}/message/{}", id, message_id),
            &json!({ "content": assembled }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let stored = app.storage.get_message(message_id).await.unwrap().unwrap();
    assert_eq!(stored.content, "Full reply");
    assert_eq!(stored.role, Role::Assistant);
}

#[tokio::test]
async fn finalize_validates_content() {
    let app = spawn_app(false).await;
    let id = new_conversation(&app, "first").await;
    let message_id = app.storage.get_messages(id).await.unwrap()[1].id;
    let uri = format!("/convo/{}/message/{}", id, message_id);

    for body in [json!({}), json!({ "content": 42 }), json!({ "content": "" })] {
        let (status, _, _) = send(&app, json_request(Method::PUT, &uri, &body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "body {}", body);
    }

    let (status, _, _) = send(&app, form(Method::PUT, &uri, "content=plain")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = send(
        &app,
        json_request(
            Method::PUT,
            &format!("/convo/{}/message/999", id),
            &json!({ "content": "x" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stream_endpoints_fail_when_upstream_is_down() {
    let app = spawn_app(true).await;
    let id = app.storage.create_conversation("t...").await.unwrap().id;

    let (status, _, body) = send(
        &app,
        form(Method::POST, &format!("/convo/{}/message/stream", id), "message=hi"),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap()["success"], false);
    assert_eq!(app.storage.get_messages(id).await.unwrap().len(), 1);

    let (status, _, _) = send(&app, empty(Method::GET, &format!("/convo/{}/stream/1", id))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn relay_error_aborts_the_event_stream() {
    let app = spawn_app_with(ScriptedProvider {
        fail: false,
        pieces: vec!["partial"],
        mid_stream_error: Some("connection reset mid-stream"),
    })
    .await;
    let id = new_conversation(&app, "first").await;
    let placeholder = app
        .storage
        .add_message(id, &ChatMessage::assistant(""))
        .await
        .unwrap();

    let uri = format!("/convo/{}/stream/{}", id, placeholder.id);
    let response = app.router.clone().oneshot(empty(Method::GET, &uri)).await.unwrap();
    // Headers are already out by the time the upstream fails.
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body().into_data_stream();
    let mut received = String::new();
    let mut failure = None;
    while let Some(frame) = body.next().await {
        match frame {
            Ok(bytes) => received.push_str(std::str::from_utf8(&bytes).unwrap()),
            Err(e) => {
                failure = Some(e.to_string());
                break;
            }
        }
    }

    let failure = failure.expect("body should end with an error");
    assert!(failure.contains("connection reset mid-stream"), "{}", failure);
    assert!(received.contains("partial"));
    assert!(!received.contains("[DONE]"));

    // Nothing was finalized; the placeholder is still empty.
    let stored = app.storage.get_message(placeholder.id).await.unwrap().unwrap();
    assert_eq!(stored.content, "");
}

#[tokio::test]
async fn delete_removes_conversation_and_messages() {
    let app = spawn_app(false).await;
    let id = new_conversation(&app, "short lived").await;

    let (status, _, _) = send(&app, empty(Method::DELETE, &format!("/convo/{}", id))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(app.storage.get_conversation(id).await.unwrap().is_none());
    assert!(app.storage.get_messages(id).await.unwrap().is_empty());

    let (status, _, _) = send(&app, empty(Method::DELETE, &format!("/convo/{}", id))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn models_lists_static_registry() {
    let app = spawn_app(false).await;
    let (status, _, body) = send(&app, empty(Method::GET, "/models")).await;
    assert_eq!(status, StatusCode::OK);
    let models: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(models[0]["id"], "google/gemini-2.0-flash-exp:free");
    assert_eq!(models[0]["maxOutput"], 8192);
}
