mod dedup;
mod ingestor;
mod rollup;
mod state;


pub use dedup::should_compact;
pub use ingestor::IngestOutcome;
pub use rollup::HourAccumulator;

use crate::db::Store;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;

/// Dedup Ingest Writer plus the optional Online Rollup Engine.
///
/// Cloning shares the stores, the rollup accumulators and the counters.
#[derive(Clone)]
pub struct Ingestor {
    raw: Store,
    summaries: Option<Store>,
    state: Arc<Mutex<state::RollupState>>,
    stats: Arc<IngestStats>,
    retention: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct IngestStats {
    pub stream_connected: AtomicBool,
    pub readings_ingested: AtomicU64,
    pub readings_compacted: AtomicU64,
    pub summaries_flushed: AtomicU64,
    pub last_error: StdMutex<Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestStatsSnapshot {
    pub stream_connected: bool,
    pub readings_ingested: u64,
    pub readings_compacted: u64,
    pub summaries_flushed: u64,
    pub last_error: Option<String>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_stream_connected(&self, connected: bool) {
        self.stream_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl ToString) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.to_string());
        }
    }

    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            stream_connected: self.stream_connected.load(Ordering::Relaxed),
            readings_ingested: self.readings_ingested.load(Ordering::Relaxed),
            readings_compacted: self.readings_compacted.load(Ordering::Relaxed),
            summaries_flushed: self.summaries_flushed.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
        }
    }
}
