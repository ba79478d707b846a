use anyhow::Result;
use rusqlite::{Row, params};

use super::types::{DiagnosticRecord, JobEventRecord, JobRecord, JobStatus, QueueMessageRecord};
use super::{Store, now_ts};

fn job_from_row(row: &Row) -> rusqlite::Result<JobRecord> {
    Ok(JobRecord {
        id: row.get(0)?,
        project_id: row.get(1)?,
        agent_id: row.get(2)?,
        session_id: row.get(3)?,
        status: row.get(4)?,
        input_json: row.get(5)?,
        output_json: row.get(6)?,
        error: row.get(7)?,
        created_at: row.get(8)?,
        started_at: row.get(9)?,
        finished_at: row.get(10)?,
    })
}

const JOB_COLUMNS: &str = "id, project_id, agent_id, session_id, status, input_json, output_json, error, created_at, started_at, finished_at";

impl Store {
    pub async fn create_job(
        &self,
        project_id: &str,
        agent_id: &str,
        session_id: Option<&str>,
        input_json: &str,
    ) -> Result<JobRecord> {
        let id = uuid::Uuid::new_v4().to_string();
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO jobs (id, project_id, agent_id, session_id, status, input_json, created_at)
             VALUES (?1, ?2, ?3, ?4, 'queued', ?5, ?6)",
            params![id, project_id, agent_id, session_id, input_json, now_ts()],
        )?;
        let rec = db.query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
            params![id],
            job_from_row,
        )?;
        Ok(rec)
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM jobs WHERE id = ?1 LIMIT 1",
            JOB_COLUMNS
        ))?;
        let mut rows = stmt.query(params![id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(job_from_row(row)?))
        } else {
            Ok(None)
        }
    }

    /// Move a queued job to running. Returns false when the job was not in
    /// `queued` (already running or terminal), so redelivery cannot restart it.
    pub async fn mark_job_running(&self, id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE jobs SET status = 'running', started_at = ?1 WHERE id = ?2 AND status = 'queued'",
            params![now_ts(), id],
        )?;
        Ok(rows > 0)
    }

    /// Move a job to a terminal status. The status guard keeps transitions
    /// monotonic: a job already terminal is never rewritten.
    pub async fn mark_job_finished(
        &self,
        id: &str,
        status: JobStatus,
        output_json: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool> {
        debug_assert!(status.is_terminal());
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE jobs
             SET status = ?1, output_json = COALESCE(?2, output_json), error = COALESCE(?3, error), finished_at = ?4
             WHERE id = ?5 AND status IN ('queued', 'running')",
            params![status.as_str(), output_json, error, now_ts(), id],
        )?;
        Ok(rows > 0)
    }

    /// Append one event with the next sequence number for the job. Seq
    /// assignment and insert happen under the same connection lock, so the
    /// per-job sequence is gap-free and strictly increasing.
    pub async fn append_job_event(
        &self,
        job_id: &str,
        event_type: &str,
        payload_json: &str,
    ) -> Result<JobEventRecord> {
        let db = self.db.lock().await;
        let seq: i64 = db.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM job_events WHERE job_id = ?1",
            params![job_id],
            |row| row.get(0),
        )?;
        let created_at = now_ts();
        db.execute(
            "INSERT INTO job_events (job_id, seq, event_type, payload_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![job_id, seq, event_type, payload_json, created_at],
        )?;
        Ok(JobEventRecord {
            job_id: job_id.to_string(),
            seq,
            event_type: event_type.to_string(),
            payload_json: payload_json.to_string(),
            created_at,
        })
    }

    pub async fn list_job_events(&self, job_id: &str, after_seq: i64) -> Result<Vec<JobEventRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT job_id, seq, event_type, payload_json, created_at
             FROM job_events WHERE job_id = ?1 AND seq > ?2 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![job_id, after_seq], |row| {
            Ok(JobEventRecord {
                job_id: row.get(0)?,
                seq: row.get(1)?,
                event_type: row.get(2)?,
                payload_json: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Jobs finished after `since` for one project, newest first. Feeds the
    /// report-composing routine actions.
    pub async fn list_project_jobs_since(
        &self,
        project_id: &str,
        since: &str,
        limit: usize,
    ) -> Result<Vec<JobRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM jobs WHERE project_id = ?1 AND created_at >= ?2 ORDER BY created_at DESC LIMIT ?3",
            JOB_COLUMNS
        ))?;
        let rows = stmt.query_map(params![project_id, since, limit as i64], job_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn list_agent_jobs_since(
        &self,
        agent_id: &str,
        since: &str,
        limit: usize,
    ) -> Result<Vec<JobRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM jobs WHERE agent_id = ?1 AND created_at >= ?2 ORDER BY created_at DESC LIMIT ?3",
            JOB_COLUMNS
        ))?;
        let rows = stmt.query_map(params![agent_id, since, limit as i64], job_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn add_diagnostic(
        &self,
        job_id: Option<&str>,
        agent_id: Option<&str>,
        kind: &str,
        detail: &str,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO diagnostics (job_id, agent_id, kind, detail, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![job_id, agent_id, kind, detail, now_ts()],
        )?;
        Ok(())
    }

    pub async fn list_diagnostics_since(&self, since: &str) -> Result<Vec<DiagnosticRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, job_id, agent_id, kind, detail, created_at
             FROM diagnostics WHERE created_at >= ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![since], |row| {
            Ok(DiagnosticRecord {
                id: row.get(0)?,
                job_id: row.get(1)?,
                agent_id: row.get(2)?,
                kind: row.get(3)?,
                detail: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ── Queue ──

    pub async fn enqueue_queue_message(
        &self,
        job_id: &str,
        user_id: &str,
        kind: &str,
    ) -> Result<i64> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO queue_messages (job_id, user_id, kind, next_attempt_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![job_id, user_id, kind, now_ts(), now_ts()],
        )?;
        Ok(db.last_insert_rowid())
    }

    /// Claim the oldest due pending message of a kind, marking it inflight.
    /// Select and update run under the same connection lock.
    pub async fn claim_queue_message(&self, kind: &str) -> Result<Option<QueueMessageRecord>> {
        let db = self.db.lock().await;
        let now = now_ts();
        let mut stmt = db.prepare(
            "SELECT id, job_id, user_id, kind, attempts, next_attempt_at, status, last_error
             FROM queue_messages
             WHERE status = 'pending' AND kind = ?1 AND next_attempt_at <= ?2
             ORDER BY next_attempt_at ASC, id ASC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![kind, now])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let rec = QueueMessageRecord {
            id: row.get(0)?,
            job_id: row.get(1)?,
            user_id: row.get(2)?,
            kind: row.get(3)?,
            attempts: row.get(4)?,
            next_attempt_at: row.get(5)?,
            status: row.get(6)?,
            last_error: row.get(7)?,
        };
        drop(rows);
        drop(stmt);
        db.execute(
            "UPDATE queue_messages SET status = 'inflight' WHERE id = ?1",
            params![rec.id],
        )?;
        Ok(Some(rec))
    }

    pub async fn complete_queue_message(&self, id: i64) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE queue_messages SET status = 'done' WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub async fn retry_queue_message(
        &self,
        id: i64,
        attempts: i64,
        next_attempt_at: &str,
        error: &str,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE queue_messages
             SET status = 'pending', attempts = ?1, next_attempt_at = ?2, last_error = ?3
             WHERE id = ?4",
            params![attempts, next_attempt_at, error, id],
        )?;
        Ok(())
    }

    pub async fn dead_letter_queue_message(&self, id: i64, attempts: i64, error: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE queue_messages SET status = 'dead', attempts = ?1, last_error = ?2 WHERE id = ?3",
            params![attempts, error, id],
        )?;
        Ok(())
    }

    pub async fn get_queue_message(&self, id: i64) -> Result<Option<QueueMessageRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, job_id, user_id, kind, attempts, next_attempt_at, status, last_error
             FROM queue_messages WHERE id = ?1 LIMIT 1",
        )?;
        let mut rows = stmt.query(params![id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(QueueMessageRecord {
                id: row.get(0)?,
                job_id: row.get(1)?,
                user_id: row.get(2)?,
                kind: row.get(3)?,
                attempts: row.get(4)?,
                next_attempt_at: row.get(5)?,
                status: row.get(6)?,
                last_error: row.get(7)?,
            }))
        } else {
            Ok(None)
        }
    }
}
