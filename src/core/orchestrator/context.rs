//! Context assembly for a job: session history since the agent's context
//! reset, deterministic compaction when the history outgrows the character
//! ceiling, and attribution wrapping for group-triggered jobs.

use anyhow::{Context as _, Result};
use regex::Regex;
use serde::Deserialize;

use crate::config::EngineConfig;
use crate::core::llm::ChatMessage;
use crate::core::store::Store;
use crate::core::store::types::MessageRecord;
use crate::core::tools::policy::AgentSnapshot;

/// Job input payload. Free-form JSON at the boundary, parsed into the two
/// trigger shapes the engine understands.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobInput {
    /// A direct user message.
    UserMessage { text: String },
    /// A group-chat trigger: the instruction addressed to this agent plus
    /// the other participants' lines for context.
    Group {
        instruction: String,
        #[serde(default)]
        messages: Vec<GroupLine>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupLine {
    pub author: String,
    pub text: String,
}

pub fn parse_input(input_json: &str) -> Result<JobInput> {
    serde_json::from_str(input_json).context("unrecognized job input payload")
}

#[derive(Debug)]
pub struct AssembledContext {
    pub history: Vec<ChatMessage>,
    pub user_message: ChatMessage,
}

fn record_to_chat(record: &MessageRecord) -> ChatMessage {
    match record.role.as_str() {
        "tool" => ChatMessage::tool_result(
            record.tool_call_id.as_deref().unwrap_or_default(),
            record.tool_name.as_deref().unwrap_or_default(),
            record.content.clone(),
        ),
        role => ChatMessage::text(role, record.content.clone()),
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}

/// Deterministic digest of older history: recent user intents, recent
/// assistant outputs, and keyword-flagged lines. No model call involved, so
/// re-running over the same messages yields the same text.
pub fn summarize_messages(
    prior_summary: Option<&str>,
    messages: &[MessageRecord],
    max_chars: usize,
) -> String {
    let flag_re = Regex::new(r"(?i)\b(error|fail(?:ed|ure)?|todo|fixme|blocked|broken)\b").unwrap();

    let mut out = String::new();
    out.push_str(&format!(
        "Compacted digest of {} earlier messages.\n",
        messages.len()
    ));

    if let Some(prior) = prior_summary {
        out.push_str("Earlier digest:\n");
        out.push_str(&clip(prior, 600));
        out.push('\n');
    }

    let user_intents: Vec<&MessageRecord> = messages
        .iter()
        .filter(|m| m.role == "user")
        .rev()
        .take(5)
        .collect();
    if !user_intents.is_empty() {
        out.push_str("Recent user intents:\n");
        for msg in user_intents.iter().rev() {
            out.push_str(&format!("- {}\n", clip(&msg.content, 200)));
        }
    }

    let assistant_replies: Vec<&MessageRecord> = messages
        .iter()
        .filter(|m| m.role == "assistant")
        .rev()
        .take(3)
        .collect();
    if !assistant_replies.is_empty() {
        out.push_str("Recent assistant replies:\n");
        for msg in assistant_replies.iter().rev() {
            out.push_str(&format!("- {}\n", clip(&msg.content, 200)));
        }
    }

    let mut flagged = Vec::new();
    for msg in messages {
        for line in msg.content.lines() {
            if flag_re.is_match(line) {
                flagged.push(clip(line.trim(), 160));
                if flagged.len() >= 8 {
                    break;
                }
            }
        }
        if flagged.len() >= 8 {
            break;
        }
    }
    if !flagged.is_empty() {
        out.push_str("Flagged lines:\n");
        for line in &flagged {
            out.push_str(&format!("- {}\n", line));
        }
    }

    clip(&out, max_chars)
}

/// Split history so the tail stays within `budget` characters, preferring
/// the most recent messages. Always keeps at least the newest message.
fn split_for_budget(messages: &[MessageRecord], budget: usize) -> usize {
    let mut acc = 0usize;
    let mut split = messages.len();
    for (idx, msg) in messages.iter().enumerate().rev() {
        let len = msg.content.chars().count();
        if acc + len > budget {
            break;
        }
        acc += len;
        split = idx;
    }
    if split == messages.len() && !messages.is_empty() {
        split = messages.len() - 1;
    }
    split
}

pub async fn assemble(
    store: &Store,
    config: &EngineConfig,
    agent: &AgentSnapshot,
    session_id: Option<&str>,
    input: &JobInput,
) -> Result<AssembledContext> {
    let mut history: Vec<ChatMessage> = Vec::new();

    if let Some(session_id) = session_id {
        let prior_summary = store.get_session_summary(session_id).await?;
        let watermark = prior_summary.as_ref().map(|s| s.up_to_message_id).unwrap_or(0);
        let messages = store
            .list_messages(session_id, watermark, agent.context_reset_at.as_deref())
            .await?;

        let total_chars: usize = messages.iter().map(|m| m.content.chars().count()).sum();

        let (summary_text, tail) = if total_chars > config.context_char_ceiling {
            let split = split_for_budget(&messages, config.recent_tail_budget());
            let older = &messages[..split];
            let tail = messages[split..].to_vec();
            if older.is_empty() {
                (prior_summary.map(|s| s.content), tail)
            } else {
                let digest = summarize_messages(
                    prior_summary.as_ref().map(|s| s.content.as_str()),
                    older,
                    config.summary_max_chars,
                );
                let up_to = older.last().map(|m| m.id).unwrap_or(watermark);
                store
                    .replace_session_summary(session_id, up_to, &digest)
                    .await?;
                (Some(digest), tail)
            }
        } else {
            (prior_summary.map(|s| s.content), messages)
        };

        if let Some(summary) = summary_text {
            history.push(ChatMessage::text(
                "system",
                format!("Summary of earlier conversation:\n{}", summary),
            ));
        }
        for record in &tail {
            history.push(record_to_chat(record));
        }
    }

    // Other participants' lines arrive as attributed system entries, so the
    // model can tell "someone else said this" from "this is my instruction".
    if let JobInput::Group { messages, .. } = input {
        for line in messages {
            history.push(ChatMessage::text(
                "system",
                format!("[group message from {}] {}", line.author, line.text),
            ));
        }
    }

    let user_text = match input {
        JobInput::UserMessage { text } => text.clone(),
        JobInput::Group { instruction, .. } => instruction.clone(),
    };

    Ok(AssembledContext {
        history,
        user_message: ChatMessage::text("user", user_text),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::tools::policy::{AgentRole, AgentSnapshot};

    fn snapshot() -> AgentSnapshot {
        AgentSnapshot {
            id: "agent-1".to_string(),
            project_id: "proj-1".to_string(),
            name: "scout".to_string(),
            role: AgentRole::Worker,
            model: "test-model".to_string(),
            system_prompt: "You are a test agent.".to_string(),
            sleeping: false,
            granted_tools: Vec::new(),
            equipped_skills: Vec::new(),
            group_ids: Vec::new(),
            session_count: 1,
            context_reset_at: None,
        }
    }

    fn small_config() -> EngineConfig {
        EngineConfig {
            context_char_ceiling: 400,
            summary_max_chars: 2_000,
            ..EngineConfig::default()
        }
    }

    async fn test_store() -> Arc<Store> {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("engine.db")).await.unwrap();
        std::mem::forget(dir);
        Arc::new(store)
    }

    async fn seed_session(store: &Store, session_id: &str, count: usize, chars_each: usize) {
        store.ensure_session(session_id, "agent-1").await.unwrap();
        for i in 0..count {
            let role = if i % 2 == 0 { "user" } else { "assistant" };
            let content = format!("{:02} {}", i, "x".repeat(chars_each.saturating_sub(3)));
            store
                .append_message(session_id, role, &content, None, None, None)
                .await
                .unwrap();
        }
    }

    #[test]
    fn parse_input_understands_both_shapes() {
        let user = parse_input(r#"{"type":"user_message","text":"hi"}"#).unwrap();
        assert!(matches!(user, JobInput::UserMessage { .. }));

        let group = parse_input(
            r#"{"type":"group","instruction":"summarize","messages":[{"author":"ana","text":"hello"}]}"#,
        )
        .unwrap();
        match group {
            JobInput::Group { messages, .. } => assert_eq!(messages.len(), 1),
            _ => panic!("expected group input"),
        }

        assert!(parse_input(r#"{"kind":"nope"}"#).is_err());
    }

    #[test]
    fn summary_is_deterministic_and_flags_keywords() {
        let messages: Vec<MessageRecord> = vec![
            MessageRecord {
                id: 1,
                session_id: "s".to_string(),
                role: "user".to_string(),
                content: "please deploy the service".to_string(),
                tool_name: None,
                tool_call_id: None,
                input_tokens: None,
                cached_input_tokens: None,
                uncached_input_tokens: None,
                output_tokens: None,
                total_tokens: None,
                created_at: "t1".to_string(),
            },
            MessageRecord {
                id: 2,
                session_id: "s".to_string(),
                role: "assistant".to_string(),
                content: "deploy FAILED: connection refused\nTODO retry with backoff".to_string(),
                tool_name: None,
                tool_call_id: None,
                input_tokens: None,
                cached_input_tokens: None,
                uncached_input_tokens: None,
                output_tokens: None,
                total_tokens: None,
                created_at: "t2".to_string(),
            },
        ];
        let first = summarize_messages(None, &messages, 2_000);
        let second = summarize_messages(None, &messages, 2_000);
        assert_eq!(first, second);
        assert!(first.contains("please deploy the service"));
        assert!(first.contains("Flagged lines:"));
        assert!(first.contains("FAILED"));
        assert!(first.contains("TODO retry"));
    }

    #[tokio::test]
    async fn short_history_is_passed_through_verbatim() {
        let store = test_store().await;
        seed_session(&store, "sess-1", 4, 20).await;

        let input = JobInput::UserMessage {
            text: "next".to_string(),
        };
        let assembled = assemble(&store, &small_config(), &snapshot(), Some("sess-1"), &input)
            .await
            .unwrap();

        assert_eq!(assembled.history.len(), 4);
        assert!(store.get_session_summary("sess-1").await.unwrap().is_none());
        assert_eq!(assembled.user_message.content, "next");
    }

    #[tokio::test]
    async fn overflow_produces_one_summary_with_correct_watermark() {
        let store = test_store().await;
        // 10 messages * 100 chars = 1000 > ceiling 400; tail budget 40
        // keeps exactly the newest message.
        seed_session(&store, "sess-1", 10, 100).await;

        let input = JobInput::UserMessage {
            text: "next".to_string(),
        };
        let config = small_config();
        let assembled = assemble(&store, &config, &snapshot(), Some("sess-1"), &input)
            .await
            .unwrap();

        let summary = store
            .get_session_summary("sess-1")
            .await
            .unwrap()
            .expect("summary written");
        // Tail holds only the newest message (id 10); everything up to id 9
        // was compacted.
        assert_eq!(summary.up_to_message_id, 9);

        // history = summary system message + tail.
        assert_eq!(assembled.history.len(), 2);
        assert_eq!(assembled.history[0].role, "system");
        assert!(assembled.history[0].content.contains("Summary of earlier"));

        // Re-running without new messages leaves the summary untouched.
        let before = summary.content.clone();
        let reassembled = assemble(&store, &config, &snapshot(), Some("sess-1"), &input)
            .await
            .unwrap();
        let after = store
            .get_session_summary("sess-1")
            .await
            .unwrap()
            .expect("summary still present");
        assert_eq!(after.content, before);
        assert_eq!(after.up_to_message_id, 9);
        // The stored summary is still offered to the model.
        assert!(reassembled.history[0].content.contains("Summary of earlier"));
    }

    #[tokio::test]
    async fn context_reset_hides_older_messages_without_deleting() {
        let store = test_store().await;
        seed_session(&store, "sess-1", 3, 20).await;

        let reset_at = crate::core::store::now_ts();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        store
            .append_message("sess-1", "user", "after the reset", None, None, None)
            .await
            .unwrap();

        let mut agent = snapshot();
        agent.context_reset_at = Some(reset_at);

        let input = JobInput::UserMessage {
            text: "next".to_string(),
        };
        let assembled = assemble(&store, &small_config(), &agent, Some("sess-1"), &input)
            .await
            .unwrap();
        assert_eq!(assembled.history.len(), 1);
        assert_eq!(assembled.history[0].content, "after the reset");
    }

    #[tokio::test]
    async fn group_lines_are_wrapped_as_attributed_system_entries() {
        let store = test_store().await;
        let input = JobInput::Group {
            instruction: "reply to the thread".to_string(),
            messages: vec![
                GroupLine {
                    author: "ana".to_string(),
                    text: "shipping friday?".to_string(),
                },
                GroupLine {
                    author: "bo".to_string(),
                    text: "needs review first".to_string(),
                },
            ],
        };
        let assembled = assemble(&store, &small_config(), &snapshot(), None, &input)
            .await
            .unwrap();
        assert_eq!(assembled.history.len(), 2);
        assert!(assembled.history.iter().all(|m| m.role == "system"));
        assert!(assembled.history[0].content.contains("[group message from ana]"));
        assert_eq!(assembled.user_message.content, "reply to the thread");
    }
}
