use anyhow::{Result, anyhow};
use rusqlite::{Row, params};

use super::types::AgentRecord;
use super::{Store, now_ts};
use crate::core::tools::policy::AgentRole;

fn agent_from_row(row: &Row) -> rusqlite::Result<(AgentRecord, String, String, String)> {
    let role_str: String = row.get(3)?;
    let role = AgentRole::from_str(&role_str).unwrap_or(AgentRole::Worker);
    let granted_json: String = row.get(7)?;
    let skills_json: String = row.get(8)?;
    let groups_json: String = row.get(9)?;
    Ok((
        AgentRecord {
            id: row.get(0)?,
            project_id: row.get(1)?,
            name: row.get(2)?,
            role,
            model: row.get(4)?,
            system_prompt: row.get(5)?,
            sleeping: row.get::<_, i64>(6)? != 0,
            granted_tools: Vec::new(),
            equipped_skills: Vec::new(),
            group_ids: Vec::new(),
            context_reset_at: row.get(10)?,
            created_at: row.get(11)?,
        },
        granted_json,
        skills_json,
        groups_json,
    ))
}

fn parse_list(json: &str) -> Vec<String> {
    serde_json::from_str(json).unwrap_or_default()
}

fn finish_agent(parts: (AgentRecord, String, String, String)) -> AgentRecord {
    let (mut rec, granted, skills, groups) = parts;
    rec.granted_tools = parse_list(&granted);
    rec.equipped_skills = parse_list(&skills);
    rec.group_ids = parse_list(&groups);
    rec
}

const AGENT_COLUMNS: &str = "id, project_id, name, role, model, system_prompt, sleeping, granted_tools_json, equipped_skills_json, group_ids_json, context_reset_at, created_at";

impl Store {
    pub async fn upsert_agent(&self, agent: &AgentRecord) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT OR REPLACE INTO agents
             (id, project_id, name, role, model, system_prompt, sleeping, granted_tools_json, equipped_skills_json, group_ids_json, context_reset_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                agent.id,
                agent.project_id,
                agent.name,
                agent.role.as_str(),
                agent.model,
                agent.system_prompt,
                agent.sleeping as i64,
                serde_json::to_string(&agent.granted_tools)?,
                serde_json::to_string(&agent.equipped_skills)?,
                serde_json::to_string(&agent.group_ids)?,
                agent.context_reset_at,
                if agent.created_at.is_empty() {
                    now_ts()
                } else {
                    agent.created_at.clone()
                },
            ],
        )?;
        Ok(())
    }

    pub async fn get_agent(&self, id: &str) -> Result<Option<AgentRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM agents WHERE id = ?1 LIMIT 1",
            AGENT_COLUMNS
        ))?;
        let mut rows = stmt.query(params![id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(finish_agent(agent_from_row(row)?)))
        } else {
            Ok(None)
        }
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM agents ORDER BY created_at ASC",
            AGENT_COLUMNS
        ))?;
        let rows = stmt.query_map([], agent_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(finish_agent(row?));
        }
        Ok(out)
    }

    pub async fn set_agent_sleeping(&self, id: &str, sleeping: bool) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE agents SET sleeping = ?1 WHERE id = ?2",
            params![sleeping as i64, id],
        )?;
        Ok(rows > 0)
    }

    /// Move the agent's context cutoff forward; history before it is ignored
    /// during context assembly without being deleted.
    pub async fn set_agent_context_reset(&self, id: &str, at: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE agents SET context_reset_at = ?1 WHERE id = ?2",
            params![at, id],
        )?;
        Ok(rows > 0)
    }

    pub async fn equip_skill(&self, id: &str, skill: &str) -> Result<()> {
        self.mutate_skill_list(id, |skills| {
            if !skills.iter().any(|s| s == skill) {
                skills.push(skill.to_string());
            }
        })
        .await
    }

    pub async fn unequip_skill(&self, id: &str, skill: &str) -> Result<()> {
        self.mutate_skill_list(id, |skills| skills.retain(|s| s != skill))
            .await
    }

    async fn mutate_skill_list<F>(&self, id: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<String>),
    {
        let db = self.db.lock().await;
        let json: String = db
            .query_row(
                "SELECT equipped_skills_json FROM agents WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .map_err(|_| anyhow!("agent '{}' not found", id))?;
        let mut skills: Vec<String> = serde_json::from_str(&json).unwrap_or_default();
        mutate(&mut skills);
        db.execute(
            "UPDATE agents SET equipped_skills_json = ?1 WHERE id = ?2",
            params![serde_json::to_string(&skills)?, id],
        )?;
        Ok(())
    }
}
