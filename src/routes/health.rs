use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use crate::state::AppState;

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub stream_connected: bool,
    pub readings_ingested: u64,
    pub summaries_flushed: u64,
    pub last_error: Option<String>,
}

pub(crate) async fn healthz_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let snapshot = state.stats.snapshot();
    Json(HealthResponse {
        status: "ok",
        stream_connected: snapshot.stream_connected,
        readings_ingested: snapshot.readings_ingested,
        summaries_flushed: snapshot.summaries_flushed,
        last_error: snapshot.last_error,
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/healthz", get(healthz_handler))
}
