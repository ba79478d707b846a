use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stagehand::config::EngineConfig;
use stagehand::core::EngineState;
use stagehand::core::llm::openai::OpenAiCompatProvider;
use stagehand::core::queue::{JobKind, spawn_workers};
use stagehand::core::scheduler::lock::SqliteLockStore;
use stagehand::core::scheduler::{RoutineScheduler, seed_default_routines};
use stagehand::core::store::Store;
use stagehand::logging;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let config = EngineConfig::load()?;
    tokio::fs::create_dir_all(&config.data_dir).await?;
    let store = Arc::new(Store::open(config.data_dir.join("engine.db")).await?);

    let base_url = std::env::var("STAGEHAND_PROVIDER_BASE_URL")
        .unwrap_or_else(|_| "https://api.openai.com/v1/chat/completions".to_string());
    let api_key = std::env::var("STAGEHAND_API_KEY").unwrap_or_default();
    if api_key.is_empty() {
        warn!("STAGEHAND_API_KEY is not set; provider calls will be rejected upstream");
    }
    let provider = Arc::new(OpenAiCompatProvider::new(base_url, api_key));

    // Tool implementations are host-supplied through the library surface;
    // the bare daemon runs agents without them.
    let state = EngineState::new(config.clone(), store.clone(), provider, None);

    seed_default_routines(&store).await?;

    let shutdown = CancellationToken::new();

    let mut handles = Vec::new();
    handles.extend(spawn_workers(
        state.clone(),
        JobKind::Interactive,
        config.interactive_workers,
        shutdown.clone(),
    ));
    handles.extend(spawn_workers(
        state.clone(),
        JobKind::Batch,
        config.batch_workers,
        shutdown.clone(),
    ));

    let scheduler = Arc::new(RoutineScheduler::new(
        store.clone(),
        state.queue.clone(),
        Arc::new(SqliteLockStore::new(store.clone())),
        Duration::from_secs(config.scheduler_tick_secs),
    ));
    {
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            scheduler.run(shutdown).await;
        }));
    }

    info!(
        "stagehand running: {} interactive + {} batch workers",
        config.interactive_workers, config.batch_workers
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown.cancel();
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}
