use crate::ingest::IngestStats;
use crate::query::QueryEngine;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub engine: QueryEngine,
    pub stats: Arc<IngestStats>,
}
