//! OpenAI-compatible chat-completions adapter with SSE streaming. Works
//! against api.openai.com and any server speaking the same wire format.

use std::collections::BTreeMap;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{
    ChatProvider, ChatRequest, ProviderEvent, ProviderStream, TokenUsage, ToolCall, ToolSchema,
};

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Serialize)]
struct WireToolCall<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    call_type: &'static str,
    function: WireFunctionCall<'a>,
}

#[derive(Serialize)]
struct WireFunctionCall<'a> {
    name: &'a str,
    arguments: &'a str,
}

#[derive(Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: &'a ToolSchema,
}

#[derive(Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    #[serde(default)]
    delta: WireDelta,
}

#[derive(Deserialize, Default)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireDeltaToolCall>>,
}

#[derive(Deserialize)]
struct WireDeltaToolCall {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireDeltaFunction>,
}

#[derive(Deserialize)]
struct WireDeltaFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<WirePromptDetails>,
}

#[derive(Deserialize)]
struct WirePromptDetails {
    #[serde(default)]
    cached_tokens: u64,
}

impl WireUsage {
    fn into_usage(self) -> TokenUsage {
        let cached = self
            .prompt_tokens_details
            .map(|d| d.cached_tokens)
            .unwrap_or(0);
        TokenUsage {
            input_tokens: self.prompt_tokens,
            cached_input_tokens: cached,
            uncached_input_tokens: self.prompt_tokens.saturating_sub(cached),
            output_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
        }
    }
}

#[derive(Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

pub struct OpenAiCompatProvider {
    base_url: String,
    api_key: String,
    client: Client,
}

impl OpenAiCompatProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            client: Client::new(),
        }
    }

    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new("https://api.openai.com/v1/chat/completions", api_key)
    }
}

/// Parse one SSE `data:` payload into provider events, stitching fragmented
/// tool-call deltas into `pending` by index.
fn chunk_events(payload: &str, pending: &mut BTreeMap<u32, PendingCall>) -> Vec<ProviderEvent> {
    let chunk: WireChunk = match serde_json::from_str(payload) {
        Ok(c) => c,
        Err(e) => return vec![ProviderEvent::Error(format!("bad stream chunk: {}", e))],
    };

    let mut events = Vec::new();
    for choice in chunk.choices {
        if let Some(text) = choice.delta.content
            && !text.is_empty()
        {
            events.push(ProviderEvent::TextDelta(text));
        }
        for frag in choice.delta.tool_calls.unwrap_or_default() {
            let slot = pending.entry(frag.index).or_default();
            if let Some(id) = frag.id {
                slot.id = id;
            }
            if let Some(function) = frag.function {
                if let Some(name) = function.name {
                    slot.name = name;
                }
                if let Some(args) = function.arguments {
                    slot.arguments.push_str(&args);
                }
            }
        }
    }
    if let Some(usage) = chunk.usage {
        events.push(ProviderEvent::Usage(usage.into_usage()));
    }
    events
}

fn flush_pending(pending: &mut BTreeMap<u32, PendingCall>) -> Vec<ProviderEvent> {
    std::mem::take(pending)
        .into_values()
        .filter(|c| !c.name.is_empty())
        .map(|c| {
            ProviderEvent::ToolCall(ToolCall {
                id: c.id,
                name: c.name,
                arguments: if c.arguments.is_empty() {
                    "{}".to_string()
                } else {
                    c.arguments
                },
            })
        })
        .collect()
}

#[async_trait]
impl ChatProvider for OpenAiCompatProvider {
    async fn stream_chat(&self, req: ChatRequest) -> Result<ProviderStream> {
        let messages: Vec<WireMessage> = req
            .messages
            .iter()
            .map(|m| WireMessage {
                role: &m.role,
                content: &m.content,
                tool_calls: m.tool_calls.as_ref().map(|calls| {
                    calls
                        .iter()
                        .map(|c| WireToolCall {
                            id: &c.id,
                            call_type: "function",
                            function: WireFunctionCall {
                                name: &c.name,
                                arguments: &c.arguments,
                            },
                        })
                        .collect()
                }),
                tool_call_id: m.tool_call_id.as_deref(),
                name: m.name.as_deref(),
            })
            .collect();
        let tools: Vec<WireTool> = req
            .tools
            .iter()
            .map(|schema| WireTool {
                tool_type: "function",
                function: schema,
            })
            .collect();

        let wire = WireRequest {
            model: &req.model,
            messages,
            tools,
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
        };

        let res = self
            .client
            .post(&self.base_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&wire)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(anyhow!(
                "provider API error ({}): {}",
                res.status(),
                res.text().await.unwrap_or_default()
            ));
        }

        let mut body = res.bytes_stream();
        let stream = async_stream::stream! {
            let mut buffer: Vec<u8> = Vec::new();
            let mut pending: BTreeMap<u32, PendingCall> = BTreeMap::new();

            'outer: while let Some(next) = body.next().await {
                let bytes: bytes::Bytes = match next {
                    Ok(b) => b,
                    Err(e) => {
                        yield ProviderEvent::Error(format!("stream transport error: {}", e));
                        return;
                    }
                };
                buffer.extend_from_slice(&bytes);

                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim();
                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload == "[DONE]" {
                        break 'outer;
                    }
                    for event in chunk_events(payload, &mut pending) {
                        let terminal = matches!(event, ProviderEvent::Error(_));
                        yield event;
                        if terminal {
                            return;
                        }
                    }
                }
            }

            for event in flush_pending(&mut pending) {
                yield event;
            }
            yield ProviderEvent::Done;
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_events_emits_text_delta() {
        let mut pending = BTreeMap::new();
        let events = chunk_events(
            r#"{"choices":[{"delta":{"content":"Hello"}}]}"#,
            &mut pending,
        );
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ProviderEvent::TextDelta(t) if t == "Hello"));
    }

    #[test]
    fn fragmented_tool_call_is_stitched_by_index() {
        let mut pending = BTreeMap::new();
        chunk_events(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_9","function":{"name":"search","arguments":"{\"q\":"}}]}}]}"#,
            &mut pending,
        );
        chunk_events(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"rust\"}"}}]}}]}"#,
            &mut pending,
        );
        let events = flush_pending(&mut pending);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ProviderEvent::ToolCall(call) => {
                assert_eq!(call.id, "call_9");
                assert_eq!(call.name, "search");
                assert_eq!(call.arguments, r#"{"q":"rust"}"#);
            }
            _ => panic!("expected tool call"),
        }
    }

    #[test]
    fn usage_chunk_maps_cached_tokens() {
        let mut pending = BTreeMap::new();
        let events = chunk_events(
            r#"{"choices":[],"usage":{"prompt_tokens":100,"completion_tokens":20,"total_tokens":120,"prompt_tokens_details":{"cached_tokens":60}}}"#,
            &mut pending,
        );
        match &events[0] {
            ProviderEvent::Usage(usage) => {
                assert_eq!(usage.input_tokens, 100);
                assert_eq!(usage.cached_input_tokens, 60);
                assert_eq!(usage.uncached_input_tokens, 40);
                assert_eq!(usage.output_tokens, 20);
            }
            _ => panic!("expected usage event"),
        }
    }

    #[test]
    fn malformed_chunk_becomes_error_event() {
        let mut pending = BTreeMap::new();
        let events = chunk_events("{not json", &mut pending);
        assert!(matches!(&events[0], ProviderEvent::Error(_)));
    }

    #[test]
    fn nameless_pending_calls_are_dropped_on_flush() {
        let mut pending = BTreeMap::new();
        chunk_events(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":2,"id":"call_x"}]}}]}"#,
            &mut pending,
        );
        assert!(flush_pending(&mut pending).is_empty());
    }
}
