use anyhow::Result;
use rusqlite::{Row, params};

use super::types::{MessageRecord, SessionSummaryRecord};
use super::{Store, now_ts};
use crate::core::llm::TokenUsage;

fn message_from_row(row: &Row) -> rusqlite::Result<MessageRecord> {
    Ok(MessageRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        tool_name: row.get(4)?,
        tool_call_id: row.get(5)?,
        input_tokens: row.get(6)?,
        cached_input_tokens: row.get(7)?,
        uncached_input_tokens: row.get(8)?,
        output_tokens: row.get(9)?,
        total_tokens: row.get(10)?,
        created_at: row.get(11)?,
    })
}

const MESSAGE_COLUMNS: &str = "id, session_id, role, content, tool_name, tool_call_id, input_tokens, cached_input_tokens, uncached_input_tokens, output_tokens, total_tokens, created_at";

impl Store {
    pub async fn ensure_session(&self, id: &str, agent_id: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT OR IGNORE INTO sessions (id, agent_id, updated_at) VALUES (?1, ?2, ?3)",
            params![id, agent_id, now_ts()],
        )?;
        Ok(())
    }

    /// Bump the session's freshness timestamp.
    pub async fn touch_session(&self, id: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
            params![now_ts(), id],
        )?;
        Ok(())
    }

    pub async fn count_sessions_for_agent(&self, agent_id: &str) -> Result<u64> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM sessions WHERE agent_id = ?1",
            params![agent_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Anyone may write user turns; the orchestrator writes assistant turns
    /// with usage and tool linkage. Rows are immutable once inserted.
    #[allow(clippy::too_many_arguments)]
    pub async fn append_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        tool_name: Option<&str>,
        tool_call_id: Option<&str>,
        usage: Option<&TokenUsage>,
    ) -> Result<i64> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO messages
             (session_id, role, content, tool_name, tool_call_id, input_tokens, cached_input_tokens, uncached_input_tokens, output_tokens, total_tokens, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                session_id,
                role,
                content,
                tool_name,
                tool_call_id,
                usage.map(|u| u.input_tokens as i64),
                usage.map(|u| u.cached_input_tokens as i64),
                usage.map(|u| u.uncached_input_tokens as i64),
                usage.map(|u| u.output_tokens as i64),
                usage.map(|u| u.total_tokens as i64),
                now_ts(),
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    /// Session history after an id watermark and an optional timestamp
    /// cutoff (the agent's context reset), oldest first.
    pub async fn list_messages(
        &self,
        session_id: &str,
        after_id: i64,
        since: Option<&str>,
    ) -> Result<Vec<MessageRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM messages
             WHERE session_id = ?1 AND id > ?2 AND (?3 IS NULL OR created_at > ?3)
             ORDER BY id ASC",
            MESSAGE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![session_id, after_id, since], message_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Most recent messages across all of an agent's sessions, oldest first.
    pub async fn list_recent_messages_for_agent(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM (
                 SELECT m.* FROM messages m
                 JOIN sessions s ON s.id = m.session_id
                 WHERE s.agent_id = ?1
                 ORDER BY m.id DESC LIMIT ?2
             ) ORDER BY id ASC",
            MESSAGE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![agent_id, limit as i64], message_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn get_session_summary(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionSummaryRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT session_id, up_to_message_id, content, updated_at
             FROM session_summaries WHERE session_id = ?1 LIMIT 1",
        )?;
        let mut rows = stmt.query(params![session_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(SessionSummaryRecord {
                session_id: row.get(0)?,
                up_to_message_id: row.get(1)?,
                content: row.get(2)?,
                updated_at: row.get(3)?,
            }))
        } else {
            Ok(None)
        }
    }

    /// Replace the session's summary wholesale. At most one live summary per
    /// session, by primary key.
    pub async fn replace_session_summary(
        &self,
        session_id: &str,
        up_to_message_id: i64,
        content: &str,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT OR REPLACE INTO session_summaries (session_id, up_to_message_id, content, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, up_to_message_id, content, now_ts()],
        )?;
        Ok(())
    }
}
