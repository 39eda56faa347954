//! Chat-completion envelopes and paced chunk streams.

use futures::Stream;
use std::time::Duration;

use capgraph_core::{
    config::StreamingConfig,
    types::{ChatCompletionResponse, ChatMessage, Choice, ChunkChoice, ChunkFrame, Delta, Role},
};

pub const FINISH_STOP: &str = "stop";
pub const FINISH_TOOL_CALLS: &str = "tool_calls";

/// Sentinel written after the last frame on the SSE wire.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Turns a final assistant message into a completion envelope or a chunk sequence.
#[derive(Debug, Clone)]
pub struct StreamingResponder {
    pacing: Duration,
}

impl StreamingResponder {
    pub fn new(pacing: Duration) -> Self {
        Self { pacing }
    }

    pub fn from_config(config: &StreamingConfig) -> Self {
        Self::new(Duration::from_millis(config.pacing_ms))
    }

    /// Single `chat.completion` object.
    pub fn envelope(&self, model: &str, message: ChatMessage) -> ChatCompletionResponse {
        let finish_reason = finish_reason(&message).to_string();
        ChatCompletionResponse {
            id: completion_id(),
            object: "chat.completion".into(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![Choice {
                index: 0,
                message: ChatMessage {
                    role: Role::Assistant,
                    ..message
                },
                finish_reason,
            }],
        }
    }

    /// Every frame for a message, terminal frame last.
    ///
    /// Text is split on whitespace into one frame per word. Tool calls are sent
    /// whole in a single frame.
    pub fn frames(&self, model: &str, message: &ChatMessage) -> Vec<ChunkFrame> {
        let id = completion_id();
        let created = chrono::Utc::now().timestamp();
        let frame = |delta: Delta, finish_reason: Option<&str>| ChunkFrame {
            id: id.clone(),
            object: "chat.completion.chunk".into(),
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.map(str::to_string),
            }],
        };

        let mut frames = Vec::new();
        if message.has_tool_calls() {
            frames.push(frame(
                Delta {
                    role: Some(Role::Assistant),
                    content: message.content.clone().filter(|c| !c.is_empty()),
                    tool_calls: message.tool_calls.clone(),
                },
                None,
            ));
        } else {
            for (i, word) in message.text().split_whitespace().enumerate() {
                let delta = if i == 0 {
                    Delta {
                        role: Some(Role::Assistant),
                        content: Some(word.to_string()),
                        ..Default::default()
                    }
                } else {
                    Delta {
                        content: Some(format!(" {}", word)),
                        ..Default::default()
                    }
                };
                frames.push(frame(delta, None));
            }
        }

        frames.push(frame(Delta::default(), Some(finish_reason(message))));
        frames
    }

    /// Frames as a paced stream. Dropping the stream stops emission.
    pub fn stream(&self, model: &str, message: &ChatMessage) -> impl Stream<Item = ChunkFrame> + Send + 'static {
        let frames = self.frames(model, message);
        let pacing = self.pacing;
        async_stream::stream! {
            for frame in frames {
                let terminal = frame.is_terminal();
                yield frame;
                if !terminal && !pacing.is_zero() {
                    tokio::time::sleep(pacing).await;
                }
            }
        }
    }
}

impl Default for StreamingResponder {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

fn finish_reason(message: &ChatMessage) -> &'static str {
    if message.has_tool_calls() {
        FINISH_TOOL_CALLS
    } else {
        FINISH_STOP
    }
}

fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4())
}
