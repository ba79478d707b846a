//! The closed set of routine actions. Each is safe to retry at the log
//! level: failures are recorded in RoutineLog, never retried automatically.
//! Anything outside the set yields a `rejected` outcome so misconfiguration
//! stays visible instead of silently no-op-ing.

use anyhow::{Result, anyhow, bail};
use chrono::{SecondsFormat, Utc};
use serde_json::json;
use tracing::info;

use crate::core::orchestrator::context::summarize_messages;
use crate::core::queue::{JobKind, JobQueue};
use crate::core::store::Store;
use crate::core::store::types::{AgentRecord, RoutineOutcome, RoutineRecord};

pub const DOC_KIND_REFLECTION: &str = "reflection";
pub const DOC_KIND_REPORT: &str = "report";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutineAction {
    Sleep,
    Wake,
    EquipSkill,
    UnequipSkill,
    Reflect,
    PruneDocuments,
    SupervisorReport,
    GuardianTriage,
    ChainReport,
}

impl RoutineAction {
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "sleep" => Some(RoutineAction::Sleep),
            "wake" => Some(RoutineAction::Wake),
            "equip_skill" => Some(RoutineAction::EquipSkill),
            "unequip_skill" => Some(RoutineAction::UnequipSkill),
            "reflect" => Some(RoutineAction::Reflect),
            "prune_documents" => Some(RoutineAction::PruneDocuments),
            "supervisor_report" => Some(RoutineAction::SupervisorReport),
            "guardian_triage" => Some(RoutineAction::GuardianTriage),
            "chain_report" => Some(RoutineAction::ChainReport),
            _ => None,
        }
    }
}

fn hours_ago(hours: i64) -> String {
    (Utc::now() - chrono::Duration::hours(hours)).to_rfc3339_opts(SecondsFormat::Millis, true)
}

async fn require_agent(store: &Store, agent_id: &str) -> Result<AgentRecord> {
    store
        .get_agent(agent_id)
        .await?
        .ok_or_else(|| anyhow!("agent '{}' not found", agent_id))
}

/// Run one fired routine. Returns the outcome and an operator-facing message
/// for the RoutineLog row.
pub async fn execute(
    store: &Store,
    queue: &JobQueue,
    routine: &RoutineRecord,
) -> (RoutineOutcome, Option<String>) {
    let Some(action) = RoutineAction::from_str(&routine.action) else {
        return (
            RoutineOutcome::Rejected,
            Some(format!("unknown action '{}'", routine.action)),
        );
    };
    let payload: serde_json::Value =
        serde_json::from_str(&routine.payload_json).unwrap_or_else(|_| json!({}));

    match run_action(store, queue, routine, action, &payload).await {
        Ok(message) => (RoutineOutcome::Ok, message),
        Err(e) => (RoutineOutcome::Error, Some(e.to_string())),
    }
}

async fn run_action(
    store: &Store,
    queue: &JobQueue,
    routine: &RoutineRecord,
    action: RoutineAction,
    payload: &serde_json::Value,
) -> Result<Option<String>> {
    let agent_id = routine.agent_id.as_str();
    match action {
        RoutineAction::Sleep => {
            if !store.set_agent_sleeping(agent_id, true).await? {
                bail!("agent '{}' not found", agent_id);
            }
            let mut message = "agent put to sleep".to_string();
            if payload["reset_context"].as_bool().unwrap_or(false) {
                store
                    .set_agent_context_reset(agent_id, &hours_ago(0))
                    .await?;
                message.push_str(", context reset");
            }
            Ok(Some(message))
        }
        RoutineAction::Wake => {
            if !store.set_agent_sleeping(agent_id, false).await? {
                bail!("agent '{}' not found", agent_id);
            }
            let mut message = "agent woken".to_string();
            if payload["reset_context"].as_bool().unwrap_or(false) {
                store
                    .set_agent_context_reset(agent_id, &hours_ago(0))
                    .await?;
                message.push_str(", context reset");
            }
            Ok(Some(message))
        }
        RoutineAction::EquipSkill => {
            let skill = payload["skill"]
                .as_str()
                .ok_or_else(|| anyhow!("equip_skill requires a 'skill' payload field"))?;
            store.equip_skill(agent_id, skill).await?;
            Ok(Some(format!("equipped '{}'", skill)))
        }
        RoutineAction::UnequipSkill => {
            let skill = payload["skill"]
                .as_str()
                .ok_or_else(|| anyhow!("unequip_skill requires a 'skill' payload field"))?;
            store.unequip_skill(agent_id, skill).await?;
            Ok(Some(format!("unequipped '{}'", skill)))
        }
        RoutineAction::Reflect => {
            let messages = store.list_recent_messages_for_agent(agent_id, 50).await?;
            if messages.is_empty() {
                return Ok(Some("no history to reflect on".to_string()));
            }
            let digest = summarize_messages(None, &messages, 2_000);
            let title = format!("Reflection over {} recent messages", messages.len());
            let doc = store
                .add_document(agent_id, DOC_KIND_REFLECTION, &title, &digest, None)
                .await?;
            store.equip_skill(agent_id, &doc.id).await?;
            info!("reflection {} written for agent {}", doc.id, agent_id);
            Ok(Some(format!("reflection {} written and equipped", doc.id)))
        }
        RoutineAction::PruneDocuments => {
            let min_rating = payload["min_rating"].as_i64().unwrap_or(2);
            let kind = payload["kind"].as_str().unwrap_or(DOC_KIND_REFLECTION);
            let pruned = store
                .prune_documents_below(agent_id, kind, min_rating)
                .await?;
            Ok(Some(format!(
                "pruned {} '{}' documents below rating {}",
                pruned, kind, min_rating
            )))
        }
        RoutineAction::SupervisorReport => {
            let agent = require_agent(store, agent_id).await?;
            let jobs = store
                .list_project_jobs_since(&agent.project_id, &hours_ago(24), 200)
                .await?;
            let mut succeeded = 0usize;
            let mut failed = 0usize;
            let mut canceled = 0usize;
            let mut open = 0usize;
            for job in &jobs {
                match job.status.as_str() {
                    "succeeded" => succeeded += 1,
                    "failed" => failed += 1,
                    "canceled" => canceled += 1,
                    _ => open += 1,
                }
            }
            let content = format!(
                "Daily report for project {}.\nJobs in the last 24h: {} total, {} succeeded, {} failed, {} canceled, {} open.",
                agent.project_id,
                jobs.len(),
                succeeded,
                failed,
                canceled,
                open
            );
            let doc = store
                .add_document(agent_id, DOC_KIND_REPORT, "Supervisor daily report", &content, None)
                .await?;
            Ok(Some(format!("report {} delivered", doc.id)))
        }
        RoutineAction::GuardianTriage => {
            let agent = require_agent(store, agent_id).await?;
            let diagnostics = store.list_diagnostics_since(&hours_ago(24)).await?;
            if diagnostics.is_empty() {
                return Ok(Some("no diagnostics to triage".to_string()));
            }
            let mut lines = Vec::new();
            for diag in diagnostics.iter().take(10) {
                lines.push(format!(
                    "- [{}] job={} {}",
                    diag.kind,
                    diag.job_id.as_deref().unwrap_or("-"),
                    diag.detail
                ));
            }
            let input = json!({
                "type": "user_message",
                "text": format!(
                    "Triage the following {} failure diagnostics from the last 24 hours and propose remediation steps:\n{}",
                    diagnostics.len(),
                    lines.join("\n")
                ),
            })
            .to_string();
            let job = store
                .create_job(&agent.project_id, &agent.id, None, &input)
                .await?;
            queue.enqueue(&job.id, "scheduler", JobKind::Interactive).await?;
            info!("guardian triage enqueued remediation job {}", job.id);
            Ok(Some(format!("remediation job {} enqueued", job.id)))
        }
        RoutineAction::ChainReport => {
            let agent = require_agent(store, agent_id).await?;
            let recipient = payload["recipient"]
                .as_str()
                .ok_or_else(|| anyhow!("chain_report requires a 'recipient' payload field"))?;
            require_agent(store, recipient).await?;
            let jobs = store
                .list_agent_jobs_since(agent_id, &hours_ago(24), 50)
                .await?;
            let mut lines = vec![format!(
                "Status report from {} ({} jobs in the last 24h):",
                agent.name,
                jobs.len()
            )];
            for job in jobs.iter().take(10) {
                lines.push(format!(
                    "- {} [{}] {}",
                    job.id,
                    job.status,
                    job.error.as_deref().unwrap_or("ok")
                ));
            }
            let doc = store
                .add_document(
                    recipient,
                    DOC_KIND_REPORT,
                    &format!("Status report from {}", agent.name),
                    &lines.join("\n"),
                    None,
                )
                .await?;
            Ok(Some(format!("report {} delivered to {}", doc.id, recipient)))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::tools::policy::AgentRole;

    async fn test_store() -> Arc<Store> {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("engine.db")).await.unwrap();
        std::mem::forget(dir);
        Arc::new(store)
    }

    fn agent(id: &str) -> AgentRecord {
        AgentRecord {
            id: id.to_string(),
            project_id: "proj-1".to_string(),
            name: id.to_string(),
            role: AgentRole::Worker,
            model: "test-model".to_string(),
            system_prompt: "prompt".to_string(),
            sleeping: false,
            granted_tools: Vec::new(),
            equipped_skills: Vec::new(),
            group_ids: Vec::new(),
            context_reset_at: None,
            created_at: String::new(),
        }
    }

    fn routine(agent_id: &str, action: &str, payload: serde_json::Value) -> RoutineRecord {
        RoutineRecord {
            id: "routine-1".to_string(),
            agent_id: agent_id.to_string(),
            name: "test".to_string(),
            cron: "* * * * *".to_string(),
            timezone: "UTC".to_string(),
            action: action.to_string(),
            enabled: true,
            payload_json: payload.to_string(),
            created_at: String::new(),
        }
    }

    #[tokio::test]
    async fn unknown_action_is_rejected_not_errored() {
        let store = test_store().await;
        let queue = JobQueue::new(store.clone());
        let (outcome, message) =
            execute(&store, &queue, &routine("agent-1", "explode", json!({}))).await;
        assert_eq!(outcome, RoutineOutcome::Rejected);
        assert!(message.unwrap().contains("unknown action"));
    }

    #[tokio::test]
    async fn sleep_and_wake_toggle_agent_state() {
        let store = test_store().await;
        let queue = JobQueue::new(store.clone());
        store.upsert_agent(&agent("agent-1")).await.unwrap();

        let (outcome, _) = execute(
            &store,
            &queue,
            &routine("agent-1", "sleep", json!({ "reset_context": true })),
        )
        .await;
        assert_eq!(outcome, RoutineOutcome::Ok);
        let asleep = store.get_agent("agent-1").await.unwrap().unwrap();
        assert!(asleep.sleeping);
        assert!(asleep.context_reset_at.is_some());

        let (outcome, _) = execute(&store, &queue, &routine("agent-1", "wake", json!({}))).await;
        assert_eq!(outcome, RoutineOutcome::Ok);
        assert!(!store.get_agent("agent-1").await.unwrap().unwrap().sleeping);
    }

    #[tokio::test]
    async fn sleep_on_missing_agent_is_an_error_outcome() {
        let store = test_store().await;
        let queue = JobQueue::new(store.clone());
        let (outcome, message) =
            execute(&store, &queue, &routine("ghost", "sleep", json!({}))).await;
        assert_eq!(outcome, RoutineOutcome::Error);
        assert!(message.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn reflect_writes_and_equips_a_document() {
        let store = test_store().await;
        let queue = JobQueue::new(store.clone());
        store.upsert_agent(&agent("agent-1")).await.unwrap();
        store.ensure_session("sess-1", "agent-1").await.unwrap();
        store
            .append_message("sess-1", "user", "investigate the failed deploy", None, None, None)
            .await
            .unwrap();

        let (outcome, _) = execute(&store, &queue, &routine("agent-1", "reflect", json!({}))).await;
        assert_eq!(outcome, RoutineOutcome::Ok);

        let docs = store
            .list_documents("agent-1", DOC_KIND_REFLECTION, 10)
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert!(docs[0].content.contains("investigate the failed deploy"));

        let equipped = store.get_agent("agent-1").await.unwrap().unwrap().equipped_skills;
        assert_eq!(equipped, vec![docs[0].id.clone()]);
    }

    #[tokio::test]
    async fn prune_removes_only_low_rated_documents() {
        let store = test_store().await;
        let queue = JobQueue::new(store.clone());
        store.upsert_agent(&agent("agent-1")).await.unwrap();
        let low = store
            .add_document("agent-1", DOC_KIND_REFLECTION, "low", "old noise", Some(1))
            .await
            .unwrap();
        store
            .add_document("agent-1", DOC_KIND_REFLECTION, "high", "keeper", Some(5))
            .await
            .unwrap();
        store
            .add_document("agent-1", DOC_KIND_REFLECTION, "unrated", "fresh", None)
            .await
            .unwrap();

        let (outcome, message) = execute(
            &store,
            &queue,
            &routine("agent-1", "prune_documents", json!({ "min_rating": 3 })),
        )
        .await;
        assert_eq!(outcome, RoutineOutcome::Ok);
        assert!(message.unwrap().contains("pruned 1"));

        let remaining = store
            .list_documents("agent-1", DOC_KIND_REFLECTION, 10)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|d| d.id != low.id));
    }

    #[tokio::test]
    async fn guardian_triage_enqueues_a_remediation_job() {
        let store = test_store().await;
        let queue = JobQueue::new(store.clone());
        store.upsert_agent(&agent("guardian-1")).await.unwrap();
        store
            .add_diagnostic(Some("job-x"), None, "turn_failed", "provider exploded")
            .await
            .unwrap();

        let (outcome, message) = execute(
            &store,
            &queue,
            &routine("guardian-1", "guardian_triage", json!({})),
        )
        .await;
        assert_eq!(outcome, RoutineOutcome::Ok);
        assert!(message.unwrap().contains("enqueued"));

        let msg = store
            .claim_queue_message("interactive")
            .await
            .unwrap()
            .expect("remediation job enqueued through the shared queue");
        assert_eq!(msg.user_id, "scheduler");
        let job = store.get_job(&msg.job_id).await.unwrap().unwrap();
        assert_eq!(job.agent_id, "guardian-1");
        assert!(job.input_json.contains("provider exploded"));
    }

    #[tokio::test]
    async fn guardian_triage_without_diagnostics_is_a_quiet_ok() {
        let store = test_store().await;
        let queue = JobQueue::new(store.clone());
        store.upsert_agent(&agent("guardian-1")).await.unwrap();
        let (outcome, message) = execute(
            &store,
            &queue,
            &routine("guardian-1", "guardian_triage", json!({})),
        )
        .await;
        assert_eq!(outcome, RoutineOutcome::Ok);
        assert!(message.unwrap().contains("no diagnostics"));
        assert!(store.claim_queue_message("interactive").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn chain_report_delivers_to_the_recipient() {
        let store = test_store().await;
        let queue = JobQueue::new(store.clone());
        store.upsert_agent(&agent("worker-1")).await.unwrap();
        store.upsert_agent(&agent("lead-1")).await.unwrap();
        let job = store
            .create_job("proj-1", "worker-1", None, r#"{"type":"user_message","text":"hi"}"#)
            .await
            .unwrap();
        store
            .mark_job_running(&job.id)
            .await
            .unwrap();

        let (outcome, _) = execute(
            &store,
            &queue,
            &routine("worker-1", "chain_report", json!({ "recipient": "lead-1" })),
        )
        .await;
        assert_eq!(outcome, RoutineOutcome::Ok);

        let docs = store.list_documents("lead-1", DOC_KIND_REPORT, 10).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert!(docs[0].title.contains("worker-1"));
        assert!(docs[0].content.contains(&job.id));
    }

    #[tokio::test]
    async fn chain_report_without_recipient_errors() {
        let store = test_store().await;
        let queue = JobQueue::new(store.clone());
        store.upsert_agent(&agent("worker-1")).await.unwrap();
        let (outcome, message) = execute(
            &store,
            &queue,
            &routine("worker-1", "chain_report", json!({})),
        )
        .await;
        assert_eq!(outcome, RoutineOutcome::Error);
        assert!(message.unwrap().contains("recipient"));
    }
}
