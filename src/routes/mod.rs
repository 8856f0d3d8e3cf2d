pub mod buffer;
pub mod health;
pub mod measurements;
pub mod sensors;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(measurements::router())
        .merge(sensors::router())
        .merge(buffer::router())
        .with_state(state)
}

/// Serves the query API until `cancel` fires.
pub async fn serve(listener: TcpListener, state: AppState, cancel: CancellationToken) -> Result<()> {
    let addr = listener.local_addr().ok();
    tracing::info!(addr = ?addr, "query api listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("query api server failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_store;
    use crate::history::HistoricalArchive;
    use crate::ingest::IngestStats;
    use crate::query::QueryEngine;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn app(dir: &tempfile::TempDir) -> (Router, AppState) {
        let raw = temp_store(dir, "raw.db").await;
        let summaries = temp_store(dir, "summaries.db").await;
        let engine = QueryEngine::new(raw.clone(), summaries, Arc::new(HistoricalArchive::new()));
        engine.prepare().await.unwrap();
        sqlx::query("INSERT INTO measurement_temperature VALUES (1000, '010203040506', 21.0)")
            .execute(raw.pool())
            .await
            .unwrap();
        sqlx::query("INSERT INTO sensor VALUES ('010203040506', 1000)")
            .execute(raw.pool())
            .await
            .unwrap();
        let state = AppState {
            engine,
            stats: Arc::new(IngestStats::new()),
        };
        (router(state.clone()), state)
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn measurements_returns_a_matrix() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(&dir).await;
        let (status, body) = get(
            app,
            "/measurements.json?start=0&end=3600&measurementType=temperature",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["sensors"], serde_json::json!(["010203040506"]));
        assert_eq!(json["data"], serde_json::json!([[960], [21.0]]));
        assert_eq!(json["summaries"], Value::Bool(false));
    }

    #[tokio::test]
    async fn rejects_identifiers_outside_the_allow_list() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(&dir).await;
        let (status, _) = get(
            app.clone(),
            "/summaries.json?start=0&end=3600&measurementType=temperature%3BDROP",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = get(app, "/measurements.json?start=10&end=5&measurementType=humidity").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn summaries_are_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(&dir).await;
        let (status, body) = get(app, "/summaries.json?start=0&end=86400&measurementType=pressure").await;
        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["summaries"], Value::Bool(true));
        assert_eq!(json["data"], serde_json::json!([[]]));
    }

    #[tokio::test]
    async fn sensors_buffer_and_health() {
        let dir = tempfile::tempdir().unwrap();
        let (app, state) = app(&dir).await;
        state.stats.set_stream_connected(true);

        let (status, body) = get(app.clone(), "/sensors.json").await;
        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!([{"sensor": "010203040506", "last_seen_at": 1000}])
        );

        let (status, body) = get(app.clone(), "/buffer.json?start=0&end=2000").await;
        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["010203040506"][0]["temperature"], serde_json::json!(21.0));
        assert_eq!(json["010203040506"][0]["humidity"], Value::Null);

        let (status, body) = get(app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["stream_connected"], Value::Bool(true));
    }
}
