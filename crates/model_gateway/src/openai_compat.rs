//! OpenAI-compatible completion provider.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use capgraph_core::{
    traits::{CompletionProvider, CompletionRequest, ResponseFormat},
    types::{ChatMessage, Role, ToolCall, ToolChoice, ToolSchema},
    Error, Result,
};

use crate::config::OpenAiCompatConfig;

/// Completion provider for any OpenAI-compatible `/chat/completions` API.
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    config: OpenAiCompatConfig,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "<[ToolSchema]>::is_empty")]
    tools: &'a [ToolSchema],
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'a ToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
}

// Providers send `null` for absent tool calls, which a plain Vec rejects.
#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

impl OpenAiCompatProvider {
    pub fn new(config: OpenAiCompatConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::configuration(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &OpenAiCompatConfig {
        &self.config
    }

    fn build_request<'a>(&'a self, request: &'a CompletionRequest) -> WireRequest<'a> {
        let model = request
            .model
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.config.default_model);

        WireRequest {
            model,
            messages: &request.messages,
            tools: &request.tools,
            tool_choice: if request.tools.is_empty() {
                None
            } else {
                request.tool_choice.as_ref()
            },
            response_format: match request.response_format {
                ResponseFormat::JsonObject => Some(json!({"type": "json_object"})),
                ResponseFormat::Text => None,
            },
            temperature: request.temperature,
        }
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<ChatMessage> {
        let body = self.build_request(&request);
        tracing::debug!(
            model = %body.model,
            messages = body.messages.len(),
            tools = body.tools.len(),
            "Sending completion request"
        );

        let mut http = self.client.post(self.config.endpoint()).json(&body);
        if let Some(key) = self.config.bearer() {
            http = http.bearer_auth(key);
        }

        let response = http
            .send()
            .await
            .map_err(|e| Error::provider(format!("completion request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::provider(format!("provider returned {}: {}", status, text)));
        }

        let parsed: WireResponse = response
            .json()
            .await
            .map_err(|e| Error::provider(format!("malformed completion response: {}", e)))?;

        let message = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::provider("completion response had no choices"))?
            .message;

        Ok(ChatMessage {
            role: Role::Assistant,
            content: message.content,
            tool_calls: message.tool_calls.unwrap_or_default(),
            tool_call_id: None,
            name: None,
        })
    }
}
