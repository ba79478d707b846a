//! Routine scheduler: a standalone ticking process that fires per-agent
//! scheduled actions, independent of job arrival. In-process re-entrancy is
//! guarded by a running flag; duplicate suppression across replicas is the
//! idempotence lock keyed by (routine, local minute), not mutual exclusion.

pub mod actions;
pub mod cron;
pub mod lock;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::queue::JobQueue;
use super::store::Store;
use super::store::types::RoutineRecord;
use cron::{CronExpr, LocalStamp};
use lock::IdempotenceStore;

const MIN_TICK: Duration = Duration::from_secs(5);
const LOCK_TTL: Duration = Duration::from_secs(3_600);

pub const DEFAULT_REFLECTION_ROUTINE: &str = "daily-reflection";

pub struct RoutineScheduler {
    store: Arc<Store>,
    queue: Arc<JobQueue>,
    locks: Arc<dyn IdempotenceStore>,
    tick_interval: Duration,
    running: AtomicBool,
}

impl RoutineScheduler {
    pub fn new(
        store: Arc<Store>,
        queue: Arc<JobQueue>,
        locks: Arc<dyn IdempotenceStore>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            locks,
            tick_interval: tick_interval.max(MIN_TICK),
            running: AtomicBool::new(false),
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!("routine scheduler ticking every {:?}", self.tick_interval);
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick_at(Utc::now()).await {
                        warn!("scheduler tick failed: {}", e);
                    }
                }
            }
        }
        info!("routine scheduler stopped");
    }

    /// One tick against an explicit instant. Re-entrant calls while a tick
    /// is in flight return immediately.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.tick_inner(now).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn tick_inner(&self, now: DateTime<Utc>) -> Result<()> {
        let routines = self.store.list_enabled_routines().await?;
        for routine in routines {
            // A broken routine (bad zone, bad expression, failing action
            // lookup) must not take the rest of the tick down with it.
            if let Err(e) = self.check_routine(&routine, now).await {
                warn!(
                    "routine '{}' ({}) skipped this tick: {}",
                    routine.name, routine.id, e
                );
            }
        }
        Ok(())
    }

    async fn check_routine(&self, routine: &RoutineRecord, now: DateTime<Utc>) -> Result<()> {
        let tz: chrono_tz::Tz = routine
            .timezone
            .parse()
            .map_err(|e| anyhow!("invalid time zone '{}': {}", routine.timezone, e))?;
        let expr = CronExpr::parse(&routine.cron)?;

        let stamp = LocalStamp::from_datetime(&now.with_timezone(&tz));
        if !expr.matches(&stamp) {
            return Ok(());
        }

        // At most one fire per routine per local minute, across ticks and
        // across scheduler replicas.
        let key = format!("{}:{}", routine.id, stamp.minute_key());
        if !self.locks.try_acquire(&key, LOCK_TTL).await? {
            return Ok(());
        }

        let (outcome, message) = actions::execute(&self.store, &self.queue, routine).await;
        info!(
            "routine '{}' fired action '{}': {}",
            routine.name,
            routine.action,
            outcome.as_str()
        );
        self.store
            .add_routine_log(
                &routine.id,
                &routine.agent_id,
                &routine.action,
                outcome,
                message.as_deref(),
            )
            .await?;
        Ok(())
    }
}

/// Auto-provision the default daily reflection routine for agents that do
/// not already carry one. Returns how many were created.
pub async fn seed_default_routines(store: &Store) -> Result<usize> {
    let mut created = 0;
    for agent in store.list_agents().await? {
        if store
            .routine_exists(&agent.id, DEFAULT_REFLECTION_ROUTINE)
            .await?
        {
            continue;
        }
        store
            .upsert_routine(&RoutineRecord {
                id: uuid::Uuid::new_v4().to_string(),
                agent_id: agent.id.clone(),
                name: DEFAULT_REFLECTION_ROUTINE.to_string(),
                cron: "15 3 * * *".to_string(),
                timezone: "UTC".to_string(),
                action: "reflect".to_string(),
                enabled: true,
                payload_json: "{}".to_string(),
                created_at: String::new(),
            })
            .await?;
        created += 1;
    }
    if created > 0 {
        info!("seeded {} default reflection routines", created);
    }
    Ok(created)
}
