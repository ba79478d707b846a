//! Durable job queue and worker pools. A queue message is `{jobId, userId}`;
//! all other job state lives on the Job row. Orchestrator-thrown errors are
//! retried with exponential backoff and jitter, then dead-lettered with a
//! diagnostic.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use rand::Rng;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::orchestrator;
use super::store::Store;
use super::EngineState;

/// Interactive jobs and slower batch-ingestion jobs pull from separate
/// pools so one cannot starve the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Interactive,
    Batch,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Interactive => "interactive",
            JobKind::Batch => "batch",
        }
    }
}

pub struct JobQueue {
    store: Arc<Store>,
    notify: Notify,
}

impl JobQueue {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            notify: Notify::new(),
        }
    }

    pub async fn enqueue(&self, job_id: &str, user_id: &str, kind: JobKind) -> Result<()> {
        self.store
            .enqueue_queue_message(job_id, user_id, kind.as_str())
            .await?;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn wait_for_work(&self) {
        self.notify.notified().await;
    }
}

/// Backoff for attempt N (1-based): base * 2^(N-1), with ±25% jitter.
fn backoff_delay(base_ms: u64, attempts: i64) -> Duration {
    let exp = (attempts - 1).clamp(0, 16) as u32;
    let base = base_ms.saturating_mul(1u64 << exp);
    let jittered = base * rand::thread_rng().gen_range(750..=1250) / 1000;
    Duration::from_millis(jittered)
}

fn ts_after(delay: Duration) -> String {
    (Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64))
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Spawn `count` workers pulling `kind` messages until shutdown.
pub fn spawn_workers(
    state: EngineState,
    kind: JobKind,
    count: usize,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|idx| {
            let state = state.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                worker_loop(state, kind, idx, shutdown).await;
            })
        })
        .collect()
}

async fn worker_loop(state: EngineState, kind: JobKind, idx: usize, shutdown: CancellationToken) {
    info!("{} worker {} started", kind.as_str(), idx);
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let claimed = match state.store.claim_queue_message(kind.as_str()).await {
            Ok(claimed) => claimed,
            Err(e) => {
                error!("{} worker {}: claim failed: {}", kind.as_str(), idx, e);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let Some(msg) = claimed else {
            tokio::select! {
                _ = state.queue.wait_for_work() => {}
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                _ = shutdown.cancelled() => break,
            }
            continue;
        };

        match orchestrator::process_job(&state, &msg.job_id, &msg.user_id).await {
            Ok(()) => {
                if let Err(e) = state.store.complete_queue_message(msg.id).await {
                    error!("failed to ack queue message {}: {}", msg.id, e);
                }
            }
            Err(e) => {
                let attempts = msg.attempts + 1;
                let err_text = e.to_string();
                if attempts >= state.config.queue_max_attempts as i64 {
                    warn!(
                        "job {} dead-lettered after {} attempts: {}",
                        msg.job_id, attempts, err_text
                    );
                    let _ = state
                        .store
                        .dead_letter_queue_message(msg.id, attempts, &err_text)
                        .await;
                    let _ = state
                        .store
                        .add_diagnostic(
                            Some(&msg.job_id),
                            None,
                            "queue_dead_letter",
                            &format!("gave up after {} attempts: {}", attempts, err_text),
                        )
                        .await;
                } else {
                    let delay = backoff_delay(state.config.queue_backoff_base_ms, attempts);
                    warn!(
                        "job {} attempt {} failed, retrying in {:?}: {}",
                        msg.job_id, attempts, delay, err_text
                    );
                    let _ = state
                        .store
                        .retry_queue_message(msg.id, attempts, &ts_after(delay), &err_text)
                        .await;
                }
            }
        }
    }
    info!("{} worker {} stopped", kind.as_str(), idx);
}
