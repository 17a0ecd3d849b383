use std::collections::HashMap;
use std::sync::Arc;

use crate::services::{jobs::JobQueryService, ledger::LedgerRegistry, queue::Queue};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<Queue>,
    pub jobs: JobQueryService,
    pub ledgers: Arc<LedgerRegistry>,
    /// API key to tenant id.
    pub api_keys: Arc<HashMap<String, String>>,
}

impl AppState {
    pub fn new(
        queue: Arc<Queue>,
        ledgers: Arc<LedgerRegistry>,
        api_keys: HashMap<String, String>,
    ) -> Self {
        Self {
            jobs: JobQueryService::new(queue.clone()),
            queue,
            ledgers,
            api_keys: Arc::new(api_keys),
        }
    }
}
