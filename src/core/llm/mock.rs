//! Scripted provider for tests and dry runs: replays canned event sequences,
//! one script per streaming call, and records every request it sees.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::Mutex;

use super::{ChatProvider, ChatRequest, ProviderEvent, ProviderStream, TokenUsage, ToolCall};

pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Vec<ProviderEvent>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue the event sequence for the next streaming call.
    pub async fn push_script(&self, events: Vec<ProviderEvent>) {
        self.scripts.lock().await.push_back(events);
    }

    /// Queue a plain text response, streamed as one delta per word.
    pub async fn push_text(&self, text: &str) {
        let mut events: Vec<ProviderEvent> = Vec::new();
        for (i, word) in text.split(' ').enumerate() {
            let chunk = if i == 0 {
                word.to_string()
            } else {
                format!(" {}", word)
            };
            events.push(ProviderEvent::TextDelta(chunk));
        }
        events.push(ProviderEvent::Usage(TokenUsage {
            input_tokens: 8,
            cached_input_tokens: 0,
            uncached_input_tokens: 8,
            output_tokens: 4,
            total_tokens: 12,
        }));
        events.push(ProviderEvent::Done);
        self.push_script(events).await;
    }

    /// Queue a response that requests a single tool call.
    pub async fn push_tool_call(&self, call_id: &str, name: &str, arguments: &str) {
        self.push_script(vec![
            ProviderEvent::ToolCall(ToolCall {
                id: call_id.to_string(),
                name: name.to_string(),
                arguments: arguments.to_string(),
            }),
            ProviderEvent::Done,
        ])
        .await;
    }

    /// Queue a terminal provider error.
    pub async fn push_error(&self, message: &str) {
        self.push_script(vec![ProviderEvent::Error(message.to_string())])
            .await;
    }

    /// Requests observed so far, in call order.
    pub async fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().await.clone()
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn stream_chat(&self, req: ChatRequest) -> Result<ProviderStream> {
        self.requests.lock().await.push(req);
        let events = self
            .scripts
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| vec![ProviderEvent::Error("script exhausted".to_string())]);
        Ok(Box::pin(tokio_stream::iter(events)))
    }
}
