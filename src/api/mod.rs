//! REST API for detector monitoring.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;

use crate::engine::aggregate::AggregateStatsSnapshot;
use crate::engine::batch::BatchStatsSnapshot;
use crate::engine::{AggregateStats, BatchStats};
use crate::fanout::{LaneStats, LaneStatsSnapshot};
use crate::gateway::{UdpStats, UdpStatsSnapshot};

/// API state shared across handlers
pub struct ApiState {
    pub lanes: Vec<(&'static str, Arc<LaneStats>)>,
    pub aggregate: Arc<AggregateStats>,
    pub batch: Arc<BatchStats>,
    pub gateway: Arc<UdpStats>,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub git_hash: &'static str,
    pub build_time: &'static str,
    /// Last observed depth per engine queue
    pub queue_depth: BTreeMap<&'static str, u64>,
}

/// Statistics response
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub gateway: UdpStatsSnapshot,
    pub queues: BTreeMap<&'static str, LaneStatsSnapshot>,
    pub aggregate: AggregateStatsSnapshot,
    pub per_packet: BatchStatsSnapshot,
}

async fn health_handler(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    let queue_depth = state
        .lanes
        .iter()
        .map(|(engine, stats)| (*engine, stats.snapshot().depth))
        .collect();

    Json(HealthResponse {
        status: "ok".to_string(),
        version: crate::VERSION.to_string(),
        git_hash: crate::build_info::GIT_HASH,
        build_time: crate::build_info::BUILD_TIME,
        queue_depth,
    })
}

async fn stats_handler(State(state): State<Arc<ApiState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        gateway: state.gateway.snapshot(),
        queues: state
            .lanes
            .iter()
            .map(|(engine, stats)| (*engine, stats.snapshot()))
            .collect(),
        aggregate: state.aggregate.snapshot(),
        per_packet: state.batch.snapshot(),
    })
}

/// Prometheus text exposition
async fn metrics_handler() -> impl IntoResponse {
    (StatusCode::OK, crate::metrics::gather())
}

/// Create the API router
pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Start the API server
pub async fn run_server(addr: &str, state: Arc<ApiState>) -> Result<(), std::io::Error> {
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "API server started");

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::atomic::Ordering;
    use tower::ServiceExt;

    fn create_test_state() -> Arc<ApiState> {
        let aggregate = Arc::new(AggregateStats::default());
        aggregate.windows_scored.store(4, Ordering::Relaxed);
        let lane = Arc::new(LaneStats::default());
        lane.depth.store(7, Ordering::Relaxed);

        Arc::new(ApiState {
            lanes: vec![("aggregate", lane), ("per_packet", Arc::new(LaneStats::default()))],
            aggregate,
            batch: Arc::new(BatchStats::default()),
            gateway: Arc::new(UdpStats::default()),
        })
    }

    async fn get_body(uri: &str) -> (StatusCode, String) {
        let response = create_router(create_test_state())
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (status, body) = get_body("/health").await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], crate::VERSION);
        assert_eq!(json["build_time"], crate::build_info::BUILD_TIME);
        assert!(json["git_hash"].is_string());
        assert_eq!(json["queue_depth"]["aggregate"], 7);
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        let (status, body) = get_body("/stats").await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["aggregate"]["windows_scored"], 4);
        assert_eq!(json["per_packet"]["batches"], 0);
        assert!(json["queues"]["per_packet"].is_object());
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        crate::metrics::init();
        crate::metrics::record_window("abnormal");
        let (status, body) = get_body("/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("scada_ids_windows_scored_total"));
    }
}
