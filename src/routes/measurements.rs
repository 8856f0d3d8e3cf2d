use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};

use crate::error::AppResult;
use crate::query::{MatrixResponse, QueryParams, QueryRequest};
use crate::state::AppState;

pub(crate) async fn measurements_handler(
    State(state): State<AppState>,
    Query(params): Query<QueryParams>,
) -> AppResult<Json<MatrixResponse>> {
    let request = QueryRequest::parse(&params)?;
    Ok(Json(state.engine.measurements(&request).await?))
}

/// Live hourly summaries stitched with the historical archive.
pub(crate) async fn summaries_handler(
    State(state): State<AppState>,
    Query(params): Query<QueryParams>,
) -> AppResult<Json<MatrixResponse>> {
    let request = QueryRequest::parse(&params)?;
    Ok(Json(state.engine.summaries(&request).await?))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/measurements.json", get(measurements_handler))
        .route("/summaries.json", get(summaries_handler))
}
