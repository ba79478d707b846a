use anyhow::Result;
use rusqlite::{Row, params};

use super::types::{RoutineLogRecord, RoutineOutcome, RoutineRecord};
use super::{Store, now_ts};

fn routine_from_row(row: &Row) -> rusqlite::Result<RoutineRecord> {
    Ok(RoutineRecord {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        name: row.get(2)?,
        cron: row.get(3)?,
        timezone: row.get(4)?,
        action: row.get(5)?,
        enabled: row.get::<_, i64>(6)? != 0,
        payload_json: row.get(7)?,
        created_at: row.get(8)?,
    })
}

const ROUTINE_COLUMNS: &str = "id, agent_id, name, cron, timezone, action, enabled, payload_json, created_at";

impl Store {
    /// Insert or replace by the (agent_id, name) unique key.
    pub async fn upsert_routine(&self, routine: &RoutineRecord) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO routines (id, agent_id, name, cron, timezone, action, enabled, payload_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (agent_id, name) DO UPDATE SET
               cron = excluded.cron,
               timezone = excluded.timezone,
               action = excluded.action,
               enabled = excluded.enabled,
               payload_json = excluded.payload_json",
            params![
                routine.id,
                routine.agent_id,
                routine.name,
                routine.cron,
                routine.timezone,
                routine.action,
                routine.enabled as i64,
                routine.payload_json,
                if routine.created_at.is_empty() {
                    now_ts()
                } else {
                    routine.created_at.clone()
                },
            ],
        )?;
        Ok(())
    }

    pub async fn list_enabled_routines(&self) -> Result<Vec<RoutineRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM routines WHERE enabled = 1 ORDER BY created_at ASC",
            ROUTINE_COLUMNS
        ))?;
        let rows = stmt.query_map([], routine_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn routine_exists(&self, agent_id: &str, name: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM routines WHERE agent_id = ?1 AND name = ?2",
            params![agent_id, name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub async fn add_routine_log(
        &self,
        routine_id: &str,
        agent_id: &str,
        action: &str,
        status: RoutineOutcome,
        message: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO routine_logs (routine_id, agent_id, action, status, message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![routine_id, agent_id, action, status.as_str(), message, now_ts()],
        )?;
        Ok(())
    }

    pub async fn list_routine_logs(
        &self,
        routine_id: &str,
        limit: usize,
    ) -> Result<Vec<RoutineLogRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, routine_id, agent_id, action, status, message, created_at
             FROM routine_logs WHERE routine_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![routine_id, limit as i64], |row| {
            Ok(RoutineLogRecord {
                id: row.get(0)?,
                routine_id: row.get(1)?,
                agent_id: row.get(2)?,
                action: row.get(3)?,
                status: row.get(4)?,
                message: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn count_routine_logs(&self, routine_id: &str) -> Result<i64> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM routine_logs WHERE routine_id = ?1",
            params![routine_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Conditional set-if-not-exists with expiry pruning. Returns true only
    /// for the caller that created the key, so a routine fires at most once
    /// per local minute no matter how many ticks overlap it.
    pub async fn try_acquire_sched_lock(&self, key: &str, expires_at: &str) -> Result<bool> {
        let db = self.db.lock().await;
        db.execute(
            "DELETE FROM sched_locks WHERE expires_at <= ?1",
            params![now_ts()],
        )?;
        let rows = db.execute(
            "INSERT OR IGNORE INTO sched_locks (key, expires_at) VALUES (?1, ?2)",
            params![key, expires_at],
        )?;
        Ok(rows > 0)
    }
}
