use serde::{Deserialize, Serialize};

use crate::core::tools::policy::{AgentRole, AgentSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            "canceled" => Some(JobStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutineOutcome {
    Ok,
    Rejected,
    Error,
}

impl RoutineOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RoutineOutcome::Ok => "ok",
            RoutineOutcome::Rejected => "rejected",
            RoutineOutcome::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub project_id: String,
    pub agent_id: String,
    pub session_id: Option<String>,
    pub status: String,
    pub input_json: String,
    pub output_json: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

impl JobRecord {
    pub fn status(&self) -> Option<JobStatus> {
        JobStatus::from_status(&self.status)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobEventRecord {
    pub job_id: String,
    pub seq: i64,
    pub event_type: String,
    pub payload_json: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    pub id: i64,
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub tool_name: Option<String>,
    pub tool_call_id: Option<String>,
    pub input_tokens: Option<i64>,
    pub cached_input_tokens: Option<i64>,
    pub uncached_input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummaryRecord {
    pub session_id: String,
    pub up_to_message_id: i64,
    pub content: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub role: AgentRole,
    pub model: String,
    pub system_prompt: String,
    pub sleeping: bool,
    pub granted_tools: Vec<String>,
    pub equipped_skills: Vec<String>,
    pub group_ids: Vec<String>,
    pub context_reset_at: Option<String>,
    pub created_at: String,
}

impl AgentRecord {
    /// Point-in-time snapshot for the sandbox policy. `session_count` comes
    /// from a separate query since it is derived, not stored.
    pub fn snapshot(&self, session_count: u64) -> AgentSnapshot {
        AgentSnapshot {
            id: self.id.clone(),
            project_id: self.project_id.clone(),
            name: self.name.clone(),
            role: self.role,
            model: self.model.clone(),
            system_prompt: self.system_prompt.clone(),
            sleeping: self.sleeping,
            granted_tools: self.granted_tools.clone(),
            equipped_skills: self.equipped_skills.clone(),
            group_ids: self.group_ids.clone(),
            session_count,
            context_reset_at: self.context_reset_at.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutineRecord {
    pub id: String,
    pub agent_id: String,
    pub name: String,
    pub cron: String,
    pub timezone: String,
    pub action: String,
    pub enabled: bool,
    pub payload_json: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutineLogRecord {
    pub id: i64,
    pub routine_id: String,
    pub agent_id: String,
    pub action: String,
    pub status: String,
    pub message: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentRecord {
    pub id: String,
    pub agent_id: String,
    pub kind: String,
    pub title: String,
    pub content: String,
    pub rating: Option<i64>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticRecord {
    pub id: i64,
    pub job_id: Option<String>,
    pub agent_id: Option<String>,
    pub kind: String,
    pub detail: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueMessageRecord {
    pub id: i64,
    pub job_id: String,
    pub user_id: String,
    pub kind: String,
    pub attempts: i64,
    pub next_attempt_at: String,
    pub status: String,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_round_trips() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Canceled,
        ] {
            assert_eq!(JobStatus::from_status(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::from_status("paused"), None);
    }

    #[test]
    fn terminal_statuses_are_marked() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
    }
}
