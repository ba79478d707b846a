use anyhow::Result;
use rusqlite::params;

use super::types::DocumentRecord;
use super::{Store, now_ts};

impl Store {
    pub async fn add_document(
        &self,
        agent_id: &str,
        kind: &str,
        title: &str,
        content: &str,
        rating: Option<i64>,
    ) -> Result<DocumentRecord> {
        let id = uuid::Uuid::new_v4().to_string();
        let created_at = now_ts();
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO documents (id, agent_id, kind, title, content, rating, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![id, agent_id, kind, title, content, rating, created_at],
        )?;
        Ok(DocumentRecord {
            id,
            agent_id: agent_id.to_string(),
            kind: kind.to_string(),
            title: title.to_string(),
            content: content.to_string(),
            rating,
            created_at,
        })
    }

    pub async fn list_documents(
        &self,
        agent_id: &str,
        kind: &str,
        limit: usize,
    ) -> Result<Vec<DocumentRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, agent_id, kind, title, content, rating, created_at
             FROM documents WHERE agent_id = ?1 AND kind = ?2
             ORDER BY created_at DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![agent_id, kind, limit as i64], |row| {
            Ok(DocumentRecord {
                id: row.get(0)?,
                agent_id: row.get(1)?,
                kind: row.get(2)?,
                title: row.get(3)?,
                content: row.get(4)?,
                rating: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn rate_document(&self, id: &str, rating: i64) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE documents SET rating = ?1 WHERE id = ?2",
            params![rating, id],
        )?;
        Ok(rows > 0)
    }

    /// Delete rated documents below the threshold. Unrated documents are
    /// never pruned.
    pub async fn prune_documents_below(
        &self,
        agent_id: &str,
        kind: &str,
        min_rating: i64,
    ) -> Result<usize> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "DELETE FROM documents
             WHERE agent_id = ?1 AND kind = ?2 AND rating IS NOT NULL AND rating < ?3",
            params![agent_id, kind, min_rating],
        )?;
        Ok(rows)
    }
}
