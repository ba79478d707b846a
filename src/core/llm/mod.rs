pub mod mock;
pub mod openai;

use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

/// One entry in a provider conversation. `tool_calls` is set on assistant
/// messages that request tool execution; `tool_call_id`/`name` on the
/// tool-role messages that answer them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            tool_calls: Some(calls),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn tool_result(call_id: &str, tool_name: &str, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(call_id.to_string()),
            name: Some(tool_name.to_string()),
        }
    }
}

/// A tool invocation requested by the model. Arguments stay a raw JSON string
/// until they cross the tool boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolSchema {
    /// Fallback schema for tools the runner cannot describe.
    pub fn opaque(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            parameters: serde_json::json!({ "type": "object" }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub cached_input_tokens: u64,
    pub uncached_input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.cached_input_tokens += other.cached_input_tokens;
        self.uncached_input_tokens += other.uncached_input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0 && self.input_tokens == 0 && self.output_tokens == 0
    }
}

/// One event in a provider's streaming response. `Error` is immediately
/// terminal for the round; `Done` is the only other terminal marker.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    TextDelta(String),
    Message(String),
    ToolCall(ToolCall),
    Usage(TokenUsage),
    Error(String),
    Done,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSchema>,
}

pub type ProviderStream = Pin<Box<dyn Stream<Item = ProviderEvent> + Send>>;

/// Streaming model backend. The engine treats this as an opaque capability:
/// anything that yields a finite, ordered event sequence qualifies.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn stream_chat(&self, req: ChatRequest) -> Result<ProviderStream>;
}

fn estimate_tokens_from_chars(char_count: usize) -> u64 {
    (char_count as u64).div_ceil(4)
}

/// Char-based usage estimate for providers that report none.
pub fn estimate_usage(messages: &[ChatMessage], response_text: &str) -> TokenUsage {
    let input_chars: usize = messages.iter().map(|m| m.content.chars().count()).sum();
    let output_chars = response_text.chars().count();
    let input_tokens = estimate_tokens_from_chars(input_chars);
    let output_tokens = estimate_tokens_from_chars(output_chars);
    TokenUsage {
        input_tokens,
        cached_input_tokens: 0,
        uncached_input_tokens: input_tokens,
        output_tokens,
        total_tokens: input_tokens + output_tokens,
    }
}
