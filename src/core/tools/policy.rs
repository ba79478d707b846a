//! Per-job tool sandbox policy: a pure function of a point-in-time agent
//! snapshot, recomputed on every run so role changes take effect on the next
//! job without any cache invalidation.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Worker,
    GroupOwner,
    ProjectLead,
    Supervisor,
    Guardian,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Worker => "worker",
            AgentRole::GroupOwner => "group_owner",
            AgentRole::ProjectLead => "project_lead",
            AgentRole::Supervisor => "supervisor",
            AgentRole::Guardian => "guardian",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "worker" => Some(AgentRole::Worker),
            "group_owner" => Some(AgentRole::GroupOwner),
            "project_lead" => Some(AgentRole::ProjectLead),
            "supervisor" => Some(AgentRole::Supervisor),
            "guardian" => Some(AgentRole::Guardian),
            _ => None,
        }
    }
}

/// Point-in-time view of an agent, assembled at job start.
#[derive(Debug, Clone)]
pub struct AgentSnapshot {
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
    pub session_count: u64,
    pub context_reset_at: Option<String>,
}

const GROUP_TOOLS: &[&str] = &["group_send_message", "group_list_members"];
const SKILL_TOOLS: &[&str] = &["file_inspect", "restricted_shell"];
const MEMORY_TOOLS: &[&str] = &["session_search", "session_recall"];
const SUPERVISOR_TOOLS: &[&str] = &["agent_dispatch", "send_mail"];
const GUARDIAN_TOOLS: &[&str] = &["log_query", "apply_patch"];
const PROJECT_LEAD_TOOLS: &[&str] = &["send_mail", "log_query"];

fn in_any_group(agent: &AgentSnapshot) -> bool {
    !agent.group_ids.is_empty()
}

fn has_equipped_skills(agent: &AgentSnapshot) -> bool {
    !agent.equipped_skills.is_empty()
}

fn has_sessions(agent: &AgentSnapshot) -> bool {
    agent.session_count > 0
}

fn role_tools(role: AgentRole) -> &'static [&'static str] {
    match role {
        AgentRole::Supervisor => SUPERVISOR_TOOLS,
        AgentRole::Guardian => GUARDIAN_TOOLS,
        AgentRole::ProjectLead => PROJECT_LEAD_TOOLS,
        AgentRole::Worker | AgentRole::GroupOwner => &[],
    }
}

/// Resolve the tool set a job may call: the agent's explicit grants unioned
/// with the mandatory tools its current state implies.
pub fn resolve_tools(agent: &AgentSnapshot) -> BTreeSet<String> {
    let mut tools: BTreeSet<String> = agent.granted_tools.iter().cloned().collect();

    if in_any_group(agent) {
        tools.extend(GROUP_TOOLS.iter().map(|t| t.to_string()));
    }
    if has_equipped_skills(agent) {
        tools.extend(SKILL_TOOLS.iter().map(|t| t.to_string()));
    }
    if has_sessions(agent) {
        tools.extend(MEMORY_TOOLS.iter().map(|t| t.to_string()));
    }
    tools.extend(role_tools(agent.role).iter().map(|t| t.to_string()));

    tools
}
