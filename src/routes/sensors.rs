use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use crate::error::AppResult;
use crate::state::AppState;

#[derive(Debug, Clone, serde::Serialize)]
pub struct SensorResponse {
    pub sensor: String,
    pub last_seen_at: i64,
}

pub(crate) async fn list_sensors(State(state): State<AppState>) -> AppResult<Json<Vec<SensorResponse>>> {
    let sensors = state.engine.sensors().await?;
    Ok(Json(
        sensors
            .into_iter()
            .map(|row| SensorResponse {
                sensor: row.sensor,
                last_seen_at: row.last_seen_at,
            })
            .collect(),
    ))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/sensors.json", get(list_sensors))
}
