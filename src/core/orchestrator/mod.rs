//! Job orchestrator: turns one dequeued job into turn-state-machine input,
//! supervises the turn, and persists everything. Every event is durably
//! appended before it is published, and cancellation is polled at exactly
//! two checkpoints (pre-start here, between tool rounds inside the turn).

pub mod context;

use anyhow::Result;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::EngineState;
use super::cancel::CancelToken;
use super::events::EventType;
use super::store::types::{JobRecord, JobStatus};
use super::tools::policy::resolve_tools;
use super::tools::{SandboxedRunner, ToolContext, ToolRunner};
use super::turn::{self, TurnEvent, TurnOutcome, TurnRequest};
use std::sync::Arc;

/// Terminal failure that is the job's own fault (bad config, sleeping agent,
/// unparsable input): resolve the job and write a diagnostic instead of
/// bubbling an error into the queue's retry policy, where a retry could not
/// change the outcome.
async fn fail_job(
    state: &EngineState,
    job_id: &str,
    agent_id: Option<&str>,
    kind: &str,
    message: String,
) -> Result<()> {
    warn!("job {} failed: {}", job_id, message);
    state
        .events
        .emit(job_id, EventType::Error, json!({ "message": message }))
        .await?;
    state
        .store
        .mark_job_finished(job_id, JobStatus::Failed, None, Some(&message))
        .await?;
    state
        .store
        .add_diagnostic(Some(job_id), agent_id, kind, &message)
        .await?;
    state
        .events
        .emit(job_id, EventType::RunFinished, json!({ "status": "failed" }))
        .await?;
    state.events.close_channel(job_id).await;
    Ok(())
}

fn turn_event_payload(event: &TurnEvent) -> (EventType, serde_json::Value) {
    match event {
        TurnEvent::AssistantDelta { text } => {
            (EventType::AssistantDelta, json!({ "text": text }))
        }
        TurnEvent::ToolCall { call } => (
            EventType::ToolCall,
            json!({ "id": call.id, "name": call.name, "arguments": call.arguments }),
        ),
        TurnEvent::ToolResult {
            call_id,
            name,
            output,
        } => (
            EventType::ToolResult,
            json!({ "id": call_id, "name": name, "output": output }),
        ),
        TurnEvent::Usage { usage } => (
            EventType::Usage,
            serde_json::to_value(usage).unwrap_or(serde_json::Value::Null),
        ),
        TurnEvent::AssistantMessage { text, usage, note } => (
            EventType::AssistantMessage,
            json!({
                "text": text,
                "usage": serde_json::to_value(usage).unwrap_or(serde_json::Value::Null),
                "note": note,
            }),
        ),
        TurnEvent::Error { message } => (EventType::Error, json!({ "message": message })),
    }
}

/// Process one dequeued job to a terminal state. An `Err` here means the
/// engine itself could not make progress (storage failure); the queue
/// retries those with backoff.
pub async fn process_job(state: &EngineState, job_id: &str, user_id: &str) -> Result<()> {
    let Some(job) = state.store.get_job(job_id).await? else {
        warn!("queue message for unknown job {}", job_id);
        state
            .store
            .add_diagnostic(Some(job_id), None, "missing_job", "job row not found")
            .await?;
        return Ok(());
    };

    // Terminal jobs are never re-executed; redelivery is a no-op.
    if job.status().map(JobStatus::is_terminal).unwrap_or(false) {
        return Ok(());
    }

    // Checkpoint 1: a cancel requested before start wins without running
    // anything.
    if state.cancels.is_canceled(job_id).await {
        info!("job {} canceled before start", job_id);
        state
            .events
            .emit(job_id, EventType::Status, json!({ "status": "canceled" }))
            .await?;
        state
            .store
            .mark_job_finished(job_id, JobStatus::Canceled, None, None)
            .await?;
        state
            .events
            .emit(job_id, EventType::RunFinished, json!({ "status": "canceled" }))
            .await?;
        state.cancels.clear(job_id).await;
        state.events.close_channel(job_id).await;
        return Ok(());
    }

    let Some(agent) = state.store.get_agent(&job.agent_id).await? else {
        return fail_job(
            state,
            job_id,
            Some(&job.agent_id),
            "missing_agent",
            format!("agent '{}' not found", job.agent_id),
        )
        .await;
    };
    let session_count = state.store.count_sessions_for_agent(&agent.id).await?;
    let snapshot = agent.snapshot(session_count);

    // Sleeping agents never execute.
    if snapshot.sleeping {
        return fail_job(
            state,
            job_id,
            Some(&agent.id),
            "sleeping_agent",
            format!("agent '{}' is sleeping", agent.id),
        )
        .await;
    }

    let input = match context::parse_input(&job.input_json) {
        Ok(input) => input,
        Err(e) => {
            return fail_job(
                state,
                job_id,
                Some(&agent.id),
                "bad_input",
                format!("invalid job input: {}", e),
            )
            .await;
        }
    };

    if let Some(session_id) = &job.session_id {
        state.store.ensure_session(session_id, &agent.id).await?;
    }

    state.store.mark_job_running(job_id).await?;
    state
        .events
        .emit(
            job_id,
            EventType::RunStarted,
            json!({
                "jobId": job.id,
                "agentId": agent.id,
                "sessionId": job.session_id,
            }),
        )
        .await?;

    // Recomputed per job from the live snapshot; role changes apply on the
    // next run without any cache to invalidate.
    let allowed = resolve_tools(&snapshot);
    let sandbox: Option<Arc<SandboxedRunner>> = state
        .tools
        .as_ref()
        .map(|tools| Arc::new(SandboxedRunner::new(tools.clone(), allowed)));
    let tool_schemas = sandbox.as_ref().map(|s| s.schemas()).unwrap_or_default();

    let assembled = match context::assemble(
        &state.store,
        &state.config,
        &snapshot,
        job.session_id.as_deref(),
        &input,
    )
    .await
    {
        Ok(assembled) => assembled,
        Err(e) => {
            return fail_job(
                state,
                job_id,
                Some(&agent.id),
                "context_assembly",
                format!("context assembly failed: {}", e),
            )
            .await;
        }
    };

    let model = if snapshot.model.is_empty() {
        state.config.model.clone()
    } else {
        snapshot.model.clone()
    };
    let request = TurnRequest {
        model,
        system_prompt: snapshot.system_prompt.clone(),
        history: assembled.history,
        user_message: assembled.user_message,
        tools: tool_schemas,
        max_rounds: state.config.max_tool_rounds,
    };
    let tool_ctx = ToolContext {
        job_id: job_id.to_string(),
        user_id: user_id.to_string(),
        agent_id: agent.id.clone(),
    };
    let cancel = CancelToken::new(state.cancels.clone(), job_id);

    let (tx, mut rx) = mpsc::channel::<TurnEvent>(64);
    let runner_ref: Option<&dyn ToolRunner> =
        sandbox.as_deref().map(|s| s as &dyn ToolRunner);
    let turn_future = turn::run_turn(
        state.provider.as_ref(),
        runner_ref,
        &tool_ctx,
        &cancel,
        request,
        tx,
    );

    // Persist-then-publish for every event, in turn order. On a storage
    // failure the receiver closes so the turn can wind down, and the error
    // propagates to the queue.
    let persist_future = async {
        let mut result: Result<()> = Ok(());
        while let Some(event) = rx.recv().await {
            let (event_type, payload) = turn_event_payload(&event);
            if let Err(e) = state.events.emit(job_id, event_type, payload).await {
                result = Err(e);
                rx.close();
            }
        }
        result
    };

    let (outcome, persisted) = tokio::join!(turn_future, persist_future);
    persisted?;

    finalize(state, &job, outcome).await
}

async fn finalize(state: &EngineState, job: &JobRecord, outcome: TurnOutcome) -> Result<()> {
    let job_id = job.id.as_str();
    match outcome {
        TurnOutcome::Completed { text, usage } => {
            if let Some(session_id) = &job.session_id {
                state
                    .store
                    .append_message(session_id, "assistant", &text, None, None, Some(&usage))
                    .await?;
                state.store.touch_session(session_id).await?;
            }
            let output = json!({
                "text": text,
                "usage": serde_json::to_value(usage)?,
            })
            .to_string();
            state
                .store
                .mark_job_finished(job_id, JobStatus::Succeeded, Some(&output), None)
                .await?;
            state
                .events
                .emit(job_id, EventType::RunFinished, json!({ "status": "succeeded" }))
                .await?;
            info!("job {} succeeded", job_id);
        }
        TurnOutcome::Failed { error } => {
            state
                .store
                .mark_job_finished(job_id, JobStatus::Failed, None, Some(&error))
                .await?;
            state
                .store
                .add_diagnostic(Some(job_id), Some(&job.agent_id), "turn_failed", &error)
                .await?;
            state
                .events
                .emit(
                    job_id,
                    EventType::RunFinished,
                    json!({ "status": "failed", "error": error }),
                )
                .await?;
            info!("job {} failed", job_id);
        }
        TurnOutcome::Canceled => {
            state
                .events
                .emit(job_id, EventType::Status, json!({ "status": "canceled" }))
                .await?;
            state
                .store
                .mark_job_finished(job_id, JobStatus::Canceled, None, None)
                .await?;
            state
                .events
                .emit(job_id, EventType::RunFinished, json!({ "status": "canceled" }))
                .await?;
            info!("job {} canceled", job_id);
        }
    }

    state.cancels.clear(job_id).await;
    state.events.close_channel(job_id).await;
    Ok(())
}
