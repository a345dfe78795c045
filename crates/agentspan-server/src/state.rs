use std::sync::Arc;

use agentspan_store::{JobQueue, JobStore};

/// Shared handler state. Workers hold their own handles to the same store
/// and queue.
pub struct AppState {
    pub store: JobStore,
    pub queue: Arc<JobQueue>,
}

impl AppState {
    pub fn new(store: JobStore, queue: Arc<JobQueue>) -> Self {
        Self { store, queue }
    }
}
