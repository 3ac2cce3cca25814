//! API サーバー実装
//!
//! ヘルスチェックや Prometheus 形式のメトリクスを提供する HTTP API サーバー

use anyhow::Result;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use crate::registry::Registry;
use crate::statistics::ServerStatistics;

/// API サーバーの共有状態
#[derive(Clone)]
pub struct ApiState {
    pub statistics: Arc<ServerStatistics>,
    /// アウトバウンドプールが無効の場合は None
    pub registry: Option<Arc<Registry>>,
}

/// ヘルスチェックレスポンス
#[derive(Serialize)]
struct HealthCheckResponse {
    status: &'static str,
}

/// GET /healthcheck
async fn healthcheck() -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse { status: "SERVING" })
}

/// GET /metrics
///
/// Prometheus 形式でメトリクスを返す
async fn metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let devices_online = state
        .registry
        .as_ref()
        .map(|r| r.online_count())
        .unwrap_or(0);
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.statistics.to_prometheus(devices_online),
    )
}

/// API サーバーを起動
pub async fn run(listen: SocketAddr, state: ApiState) -> Result<()> {
    let app = Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/metrics", get(metrics))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!("API server listening on {}", listen);

    axum::serve(listener, app).await?;

    Ok(())
}
