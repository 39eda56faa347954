use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use capgraph_core::config::AppConfig;
use capgraph_core::mocks::ScriptedProvider;
use capgraph_core::types::{ChatMessage, ToolCall};
use capgraph_gateway::{AppContext, ChatService, GatewayServer, StreamingResponder, DONE_SENTINEL};
use capgraph_skills::{builtin_modules, CapabilityRegistry, GREETING_TEXT as GREETING};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

async fn app(provider: Arc<ScriptedProvider>) -> Router {
    let config = AppConfig::default();
    let registry = Arc::new(CapabilityRegistry::new(builtin_modules()));
    let mut ctx = AppContext::from_config(&config, provider, registry).unwrap();
    ctx.streaming = StreamingResponder::new(Duration::ZERO);
    let service = Arc::new(ChatService::new(ctx).await.unwrap());
    GatewayServer::new(config.server, service).build_router()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = app(Arc::new(ScriptedProvider::texts(&[]))).await;

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_capabilities_endpoint() {
    let app = app(Arc::new(ScriptedProvider::texts(&[]))).await;

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/v1/capabilities").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let names: Vec<&str> = json["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|d| d["name"].as_str())
        .collect();
    assert!(names.contains(&"greet"));
    assert!(names.contains(&"human_approval"));

    let response = app
        .oneshot(post_json("/v1/capabilities/reload", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "reloaded");
    assert_eq!(json["capabilities"].as_u64().unwrap() as usize, names.len());
}

#[tokio::test]
async fn test_chat_completion_envelope() {
    let provider = Arc::new(ScriptedProvider::texts(&[r#"{"next_tool": "greet"}"#]));
    let app = app(provider).await;

    let response = app
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({"model": "test-model", "messages": [{"role": "user", "content": "hello"}]}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["object"], "chat.completion");
    assert_eq!(json["model"], "test-model");
    assert_eq!(json["choices"][0]["message"]["role"], "assistant");
    assert_eq!(json["choices"][0]["message"]["content"], GREETING);
    assert_eq!(json["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn test_chat_completion_stream() {
    let provider = Arc::new(ScriptedProvider::texts(&[r#"{"next_tool": "greet"}"#]));
    let app = app(provider).await;

    let response = app
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({"stream": true, "messages": [{"role": "user", "content": "hi"}]}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    let payloads: Vec<&str> = text
        .lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .collect();

    assert_eq!(payloads.last(), Some(&DONE_SENTINEL));
    let frames: Vec<Value> = payloads[..payloads.len() - 1]
        .iter()
        .map(|p| serde_json::from_str(p).unwrap())
        .collect();

    let words = GREETING.split_whitespace().count();
    assert_eq!(frames.len(), words + 1);
    assert!(frames.iter().all(|f| f["object"] == "chat.completion.chunk"));
    assert_eq!(frames[words]["choices"][0]["finish_reason"], "stop");
    assert!(frames[..words]
        .iter()
        .all(|f| f["choices"][0]["finish_reason"].is_null()));
}

#[tokio::test]
async fn test_client_tool_call_is_returned() {
    let provider = Arc::new(ScriptedProvider::new(vec![ChatMessage::assistant_tool_calls(vec![
        ToolCall::new("call_9", "get_weather", r#"{"city":"Lima"}"#),
    ])]));
    let app = app(provider.clone()).await;

    let response = app
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({
                "messages": [{"role": "user", "content": "weather in Lima"}],
                "tools": [{"type": "function", "function": {"name": "get_weather", "parameters": {"type": "object"}}}],
                "tool_choice": {"type": "function", "function": {"name": "get_weather"}}
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["choices"][0]["finish_reason"], "tool_calls");
    assert_eq!(
        json["choices"][0]["message"]["tool_calls"][0]["function"]["name"],
        "get_weather"
    );
    assert_eq!(provider.call_count(), 1);
}

#[tokio::test]
async fn test_unknown_forced_tool_is_bad_request() {
    let app = app(Arc::new(ScriptedProvider::texts(&[]))).await;

    let response = app
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({
                "messages": [{"role": "user", "content": "hi"}],
                "tool_choice": {"type": "function", "function": {"name": "does_not_exist"}}
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn test_failed_turn_is_server_error() {
    let provider = Arc::new(ScriptedProvider::texts(&["not json at all"]));
    let app = app(provider).await;

    let response = app
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({"messages": [{"role": "user", "content": "hi"}]}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = body_json(response).await;
    assert_eq!(json["error"]["type"], "turn_failed");
    assert!(json["error"]["message"].as_str().unwrap().contains("Router"));
}
