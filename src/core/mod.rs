pub mod cancel;
pub mod events;
pub mod llm;
pub mod orchestrator;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod tools;
pub mod turn;

use std::sync::Arc;

use crate::config::EngineConfig;
use cancel::CancelRegistry;
use events::EventLog;
use llm::ChatProvider;
use queue::JobQueue;
use store::Store;
use tools::ToolRunner;

/// Shared handles threaded through workers, the orchestrator, and the
/// scheduler. Cheap to clone; everything mutable lives behind the store or
/// its own lock.
#[derive(Clone)]
pub struct EngineState {
    pub config: EngineConfig,
    pub store: Arc<Store>,
    pub events: Arc<EventLog>,
    pub provider: Arc<dyn ChatProvider>,
    /// Host-supplied tool implementations. `None` runs agents without tools;
    /// tool calls then degrade to best-effort final messages.
    pub tools: Option<Arc<dyn ToolRunner>>,
    pub cancels: Arc<CancelRegistry>,
    pub queue: Arc<JobQueue>,
}

impl EngineState {
    pub fn new(
        config: EngineConfig,
        store: Arc<Store>,
        provider: Arc<dyn ChatProvider>,
        tools: Option<Arc<dyn ToolRunner>>,
    ) -> Self {
        let events = Arc::new(EventLog::new(store.clone()));
        let queue = Arc::new(JobQueue::new(store.clone()));
        Self {
            config,
            store,
            events,
            provider,
            tools,
            cancels: Arc::new(CancelRegistry::new()),
            queue,
        }
    }
}
