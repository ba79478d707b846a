//! Cooperative cancellation. A cancel request sets a per-job flag with its
//! own expiry; the orchestrator polls it at exactly two checkpoints (before
//! starting a job, and between tool-calling rounds). A streaming provider
//! call in flight is never interrupted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

pub struct CancelRegistry {
    entries: Mutex<HashMap<String, Instant>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Flag a job for cancellation. The flag expires after `ttl` so stale
    /// requests for long-dead jobs do not accumulate.
    pub async fn request(&self, job_id: &str, ttl: Duration) {
        let mut entries = self.entries.lock().await;
        entries.insert(job_id.to_string(), Instant::now() + ttl);
    }

    pub async fn is_canceled(&self, job_id: &str) -> bool {
        let mut entries = self.entries.lock().await;
        entries.retain(|_, expiry| *expiry > Instant::now());
        entries.contains_key(job_id)
    }

    pub async fn clear(&self, job_id: &str) {
        self.entries.lock().await.remove(job_id);
    }
}

impl Default for CancelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Type-visible handle for one job's flag, passed down the call chain so the
/// checkpoints are explicit rather than conventions.
#[derive(Clone)]
pub struct CancelToken {
    registry: Arc<CancelRegistry>,
    job_id: String,
}

impl CancelToken {
    pub fn new(registry: Arc<CancelRegistry>, job_id: impl Into<String>) -> Self {
        Self {
            registry,
            job_id: job_id.into(),
        }
    }

    pub async fn is_canceled(&self) -> bool {
        self.registry.is_canceled(&self.job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_sets_and_clear_unsets() {
        let registry = CancelRegistry::new();
        assert!(!registry.is_canceled("job-1").await);
        registry.request("job-1", Duration::from_secs(60)).await;
        assert!(registry.is_canceled("job-1").await);
        assert!(!registry.is_canceled("job-2").await);
        registry.clear("job-1").await;
        assert!(!registry.is_canceled("job-1").await);
    }

    #[tokio::test]
    async fn expired_flags_are_pruned() {
        let registry = CancelRegistry::new();
        registry.request("job-1", Duration::from_millis(1)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!registry.is_canceled("job-1").await);
    }

    #[tokio::test]
    async fn token_observes_the_registry() {
        let registry = Arc::new(CancelRegistry::new());
        let token = CancelToken::new(registry.clone(), "job-1");
        assert!(!token.is_canceled().await);
        registry.request("job-1", Duration::from_secs(60)).await;
        assert!(token.is_canceled().await);
    }
}
