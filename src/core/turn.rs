//! Turn state machine: one logical turn against the model provider, possibly
//! spanning several tool-calling rounds, producing a deterministic ordered
//! event sequence. Tool calls within a round run serially in receipt order;
//! later calls may depend on context assembled by earlier ones.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::info;

use super::cancel::CancelToken;
use super::llm::{
    ChatMessage, ChatProvider, ChatRequest, ProviderEvent, TokenUsage, ToolCall, ToolSchema,
    estimate_usage,
};
use super::tools::{ToolContext, ToolRunner, wire_result};

pub const NOTE_ROUND_CAP: &str = "tool round limit reached";
pub const NOTE_NO_RUNNER: &str = "tool calls ignored: no tool runner available";

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub model: String,
    pub system_prompt: String,
    pub history: Vec<ChatMessage>,
    pub user_message: ChatMessage,
    pub tools: Vec<ToolSchema>,
    /// Cap on tool-calling rounds; the turn opens at most this many
    /// streaming calls after the first.
    pub max_rounds: usize,
}

#[derive(Debug, Clone)]
pub enum TurnEvent {
    AssistantDelta {
        text: String,
    },
    ToolCall {
        call: ToolCall,
    },
    ToolResult {
        call_id: String,
        name: String,
        output: String,
    },
    Usage {
        usage: TokenUsage,
    },
    AssistantMessage {
        text: String,
        usage: TokenUsage,
        note: Option<String>,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone)]
pub enum TurnOutcome {
    Completed { text: String, usage: TokenUsage },
    Failed { error: String },
    Canceled,
}

async fn emit(tx: &mpsc::Sender<TurnEvent>, event: TurnEvent) {
    let _ = tx.send(event).await;
}

async fn finish(
    tx: &mpsc::Sender<TurnEvent>,
    messages: &[ChatMessage],
    text: String,
    total_usage: TokenUsage,
    note: Option<&str>,
) -> TurnOutcome {
    let usage = if total_usage.is_empty() {
        estimate_usage(messages, &text)
    } else {
        total_usage
    };
    emit(
        tx,
        TurnEvent::AssistantMessage {
            text: text.clone(),
            usage,
            note: note.map(|n| n.to_string()),
        },
    )
    .await;
    TurnOutcome::Completed { text, usage }
}

/// Drive one turn to termination. Exactly one of {assistant message +
/// `Completed`, error event + `Failed`, `Canceled`} ends it. The sender is
/// taken by value so the consumer's channel closes when the turn returns.
pub async fn run_turn(
    provider: &dyn ChatProvider,
    runner: Option<&dyn ToolRunner>,
    tool_ctx: &ToolContext,
    cancel: &CancelToken,
    req: TurnRequest,
    tx: mpsc::Sender<TurnEvent>,
) -> TurnOutcome {
    let mut messages: Vec<ChatMessage> = Vec::with_capacity(req.history.len() + 2);
    messages.push(ChatMessage::text("system", &req.system_prompt));
    messages.extend(req.history.iter().cloned());
    messages.push(req.user_message.clone());

    let mut total_usage = TokenUsage::default();
    let mut round: usize = 0;

    loop {
        let chat_req = ChatRequest {
            model: req.model.clone(),
            messages: messages.clone(),
            tools: req.tools.clone(),
        };
        let mut stream = match provider.stream_chat(chat_req).await {
            Ok(stream) => stream,
            Err(e) => {
                let message = format!("provider request failed: {}", e);
                emit(&tx, TurnEvent::Error { message: message.clone() }).await;
                return TurnOutcome::Failed { error: message };
            }
        };

        let mut round_text = String::new();
        let mut pending_calls: Vec<ToolCall> = Vec::new();

        while let Some(event) = stream.next().await {
            match event {
                ProviderEvent::TextDelta(text) => {
                    round_text.push_str(&text);
                    emit(&tx, TurnEvent::AssistantDelta { text }).await;
                }
                ProviderEvent::Message(text) => {
                    // A completed message is authoritative for the round.
                    if !text.is_empty() {
                        round_text = text;
                    }
                }
                ProviderEvent::ToolCall(call) => {
                    emit(&tx, TurnEvent::ToolCall { call: call.clone() }).await;
                    pending_calls.push(call);
                }
                ProviderEvent::Usage(usage) => {
                    total_usage.add(&usage);
                    emit(&tx, TurnEvent::Usage { usage }).await;
                }
                ProviderEvent::Error(message) => {
                    emit(&tx, TurnEvent::Error { message: message.clone() }).await;
                    return TurnOutcome::Failed { error: message };
                }
                ProviderEvent::Done => break,
            }
        }

        if pending_calls.is_empty() {
            return finish(&tx, &messages, round_text, total_usage, None).await;
        }

        let Some(runner) = runner else {
            // Cannot proceed further; surface the accumulated text as a
            // best-effort final message.
            return finish(&tx, &messages, round_text, total_usage, Some(NOTE_NO_RUNNER)).await;
        };

        if round >= req.max_rounds {
            info!(
                "turn hit round cap at {} with {} tool calls pending",
                round,
                pending_calls.len()
            );
            return finish(&tx, &messages, String::new(), total_usage, Some(NOTE_ROUND_CAP))
                .await;
        }

        messages.push(ChatMessage::assistant_with_calls(
            round_text.clone(),
            pending_calls.clone(),
        ));
        for call in &pending_calls {
            let output = wire_result(runner.run(call, tool_ctx).await);
            emit(
                &tx,
                TurnEvent::ToolResult {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    output: output.clone(),
                },
            )
            .await;
            messages.push(ChatMessage::tool_result(&call.id, &call.name, output));
        }
        round += 1;

        if cancel.is_canceled().await {
            info!("turn canceled between tool rounds (round {})", round);
            return TurnOutcome::Canceled;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::core::cancel::CancelRegistry;
    use crate::core::llm::mock::ScriptedProvider;
    use crate::core::tools::ToolError;

    struct LookupRunner;

    #[async_trait]
    impl ToolRunner for LookupRunner {
        async fn run(
            &self,
            call: &ToolCall,
            _ctx: &ToolContext,
        ) -> Result<serde_json::Value, ToolError> {
            match call.name.as_str() {
                "lookup" => Ok(json!({ "value": 42 })),
                other => Err(ToolError::Unknown(other.to_string())),
            }
        }
    }

    fn request(max_rounds: usize) -> TurnRequest {
        TurnRequest {
            model: "test-model".to_string(),
            system_prompt: "You are a test agent.".to_string(),
            history: Vec::new(),
            user_message: ChatMessage::text("user", "hi"),
            tools: Vec::new(),
            max_rounds,
        }
    }

    fn tool_ctx() -> ToolContext {
        ToolContext {
            job_id: "job-1".to_string(),
            user_id: "user-1".to_string(),
            agent_id: "agent-1".to_string(),
        }
    }

    fn token(registry: &Arc<CancelRegistry>) -> CancelToken {
        CancelToken::new(registry.clone(), "job-1")
    }

    async fn drive(
        provider: &ScriptedProvider,
        runner: Option<&dyn ToolRunner>,
        cancel: &CancelToken,
        req: TurnRequest,
    ) -> (TurnOutcome, Vec<TurnEvent>) {
        let (tx, mut rx) = mpsc::channel(256);
        let outcome = run_turn(provider, runner, &tool_ctx(), cancel, req, tx).await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (outcome, events)
    }

    #[tokio::test]
    async fn plain_text_turn_completes_with_one_assistant_message() {
        let provider = ScriptedProvider::new();
        provider.push_text("hello there").await;
        let registry = Arc::new(CancelRegistry::new());

        let (outcome, events) = drive(&provider, None, &token(&registry), request(3)).await;

        match outcome {
            TurnOutcome::Completed { text, usage } => {
                assert_eq!(text, "hello there");
                assert_eq!(usage.total_tokens, 12);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        let deltas = events
            .iter()
            .filter(|e| matches!(e, TurnEvent::AssistantDelta { .. }))
            .count();
        assert_eq!(deltas, 2);
        let finals: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, TurnEvent::AssistantMessage { .. }))
            .collect();
        assert_eq!(finals.len(), 1);
    }

    #[tokio::test]
    async fn provider_error_fails_turn_without_assistant_message() {
        let provider = ScriptedProvider::new();
        provider.push_error("backend unavailable").await;
        let registry = Arc::new(CancelRegistry::new());

        let (outcome, events) = drive(&provider, None, &token(&registry), request(3)).await;

        assert!(matches!(outcome, TurnOutcome::Failed { .. }));
        assert!(events.iter().any(|e| matches!(e, TurnEvent::Error { .. })));
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, TurnEvent::AssistantMessage { .. }))
        );
    }

    #[tokio::test]
    async fn tool_call_round_feeds_result_back_into_next_round() {
        let provider = ScriptedProvider::new();
        provider
            .push_tool_call("call_1", "lookup", r#"{"key":"answer"}"#)
            .await;
        provider.push_text("the answer is 42").await;
        let registry = Arc::new(CancelRegistry::new());
        let runner = LookupRunner;

        let (outcome, events) =
            drive(&provider, Some(&runner), &token(&registry), request(3)).await;

        assert!(matches!(outcome, TurnOutcome::Completed { .. }));
        let mut kinds = Vec::new();
        for event in &events {
            match event {
                TurnEvent::ToolCall { .. } => kinds.push("tool_call"),
                TurnEvent::ToolResult { output, .. } => {
                    assert!(output.contains("\"ok\":true"));
                    kinds.push("tool_result");
                }
                TurnEvent::AssistantMessage { .. } => kinds.push("assistant_message"),
                _ => {}
            }
        }
        assert_eq!(kinds, vec!["tool_call", "tool_result", "assistant_message"]);

        // The second streaming call must carry the assistant tool-call turn
        // and the tool-role result.
        let requests = provider.requests().await;
        assert_eq!(requests.len(), 2);
        let second = &requests[1].messages;
        let assistant = second
            .iter()
            .find(|m| m.role == "assistant" && m.tool_calls.is_some())
            .expect("assistant tool-call message");
        assert_eq!(assistant.tool_calls.as_ref().unwrap()[0].name, "lookup");
        let tool_msg = second
            .iter()
            .find(|m| m.role == "tool")
            .expect("tool result message");
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_1"));
        assert!(tool_msg.content.contains("\"value\":42"));
    }

    #[tokio::test]
    async fn tool_rejection_is_fed_back_not_fatal() {
        let provider = ScriptedProvider::new();
        provider
            .push_tool_call("call_1", "forbidden_tool", "{}")
            .await;
        provider.push_text("I could not use that tool").await;
        let registry = Arc::new(CancelRegistry::new());
        let runner = LookupRunner;

        let (outcome, events) =
            drive(&provider, Some(&runner), &token(&registry), request(3)).await;

        assert!(matches!(outcome, TurnOutcome::Completed { .. }));
        let result = events
            .iter()
            .find_map(|e| match e {
                TurnEvent::ToolResult { output, .. } => Some(output.clone()),
                _ => None,
            })
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&result).unwrap();
        assert_eq!(parsed["ok"], false);
        assert_eq!(parsed["detail"], "unknown_tool");
    }

    #[tokio::test]
    async fn missing_runner_yields_best_effort_message() {
        let provider = ScriptedProvider::new();
        provider.push_script(vec![
            ProviderEvent::TextDelta("partial thought".to_string()),
            ProviderEvent::ToolCall(ToolCall {
                id: "call_1".to_string(),
                name: "lookup".to_string(),
                arguments: "{}".to_string(),
            }),
            ProviderEvent::Done,
        ])
        .await;
        let registry = Arc::new(CancelRegistry::new());

        let (outcome, events) = drive(&provider, None, &token(&registry), request(3)).await;

        match outcome {
            TurnOutcome::Completed { text, .. } => assert_eq!(text, "partial thought"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        let note = events.iter().find_map(|e| match e {
            TurnEvent::AssistantMessage { note, .. } => note.clone(),
            _ => None,
        });
        assert_eq!(note.as_deref(), Some(NOTE_NO_RUNNER));
    }

    #[tokio::test]
    async fn round_cap_terminates_with_empty_message_and_note() {
        let provider = ScriptedProvider::new();
        // Every round requests another tool call; cap is 1 round.
        provider.push_tool_call("call_1", "lookup", "{}").await;
        provider.push_tool_call("call_2", "lookup", "{}").await;
        let registry = Arc::new(CancelRegistry::new());
        let runner = LookupRunner;

        let (outcome, events) =
            drive(&provider, Some(&runner), &token(&registry), request(1)).await;

        match outcome {
            TurnOutcome::Completed { text, .. } => assert!(text.is_empty()),
            other => panic!("unexpected outcome: {:?}", other),
        }
        let note = events.iter().find_map(|e| match e {
            TurnEvent::AssistantMessage { note, .. } => note.clone(),
            _ => None,
        });
        assert_eq!(note.as_deref(), Some(NOTE_ROUND_CAP));
        // Exactly one tool execution happened before the cap.
        let results = events
            .iter()
            .filter(|e| matches!(e, TurnEvent::ToolResult { .. }))
            .count();
        assert_eq!(results, 1);
        assert_eq!(provider.requests().await.len(), 2);
    }

    #[tokio::test]
    async fn cancellation_between_rounds_stops_the_turn() {
        let provider = ScriptedProvider::new();
        provider.push_tool_call("call_1", "lookup", "{}").await;
        provider.push_text("never reached").await;
        let registry = Arc::new(CancelRegistry::new());
        registry.request("job-1", Duration::from_secs(60)).await;
        let runner = LookupRunner;

        let (outcome, events) =
            drive(&provider, Some(&runner), &token(&registry), request(3)).await;

        assert!(matches!(outcome, TurnOutcome::Canceled));
        // The first round's tool still ran; no final message was emitted.
        assert!(
            events
                .iter()
                .any(|e| matches!(e, TurnEvent::ToolResult { .. }))
        );
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, TurnEvent::AssistantMessage { .. }))
        );
        assert_eq!(provider.requests().await.len(), 1);
    }
}
