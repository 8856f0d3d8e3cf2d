use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;

use crate::collector::BufferSnapshot;
use crate::error::AppResult;
use crate::query::BufferParams;
use crate::state::AppState;

pub(crate) async fn buffer_handler(
    State(state): State<AppState>,
    Query(params): Query<BufferParams>,
) -> AppResult<Json<BufferSnapshot>> {
    let (start, end) = params.window(Utc::now().timestamp())?;
    Ok(Json(state.engine.buffer(start, end).await?))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/buffer.json", get(buffer_handler))
}
