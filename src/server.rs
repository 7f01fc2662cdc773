//! HTTP公開 (axum)
//!
//! - `GET /water/daily` 日別使用量（キャッシュ優先）
//! - `GET /water/latest` 最新1件
//! - `POST /water/refresh` 強制再取得
//! - `GET /health`

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tower::ServiceExt;
use tracing::{error, info};

use crate::cache::epoch_seconds;
use crate::config::ServerConfig;
use crate::error::UsageError;
use crate::service::{SnapshotRequest, UsageService, UsageSnapshot};
use crate::table::Record;

#[derive(Clone)]
struct AppState {
    service: UsageService,
    date_column: Option<String>,
}

/// エラー応答本文
#[derive(Debug, Serialize)]
struct ApiErrorResponse {
    cached: bool,
    error: String,
    stage: &'static str,
    code: &'static str,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    body: ApiErrorResponse,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            body: ApiErrorResponse {
                cached: false,
                error: message.into(),
                stage: "latest",
                code: "NOT_FOUND",
            },
        }
    }
}

impl From<UsageError> for ApiError {
    fn from(err: UsageError) -> Self {
        let (status, code) = if err.is_upstream() {
            (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR")
        } else {
            (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
        };
        error!(stage = err.stage(), error = %err, status = status.as_u16(), "Request failed");

        Self {
            status,
            body: ApiErrorResponse {
                cached: false,
                error: err.to_string(),
                stage: err.stage(),
                code,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct LatestResponse<'a> {
    cached: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stale: bool,
    #[serde(with = "epoch_seconds")]
    fetched_at: DateTime<Utc>,
    date_column: Option<&'a str>,
    record: &'a Record,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// ルーター構築
pub fn build_router(service: UsageService, date_column: Option<String>) -> Router {
    Router::new()
        .route("/water/daily", get(daily))
        .route("/water/latest", get(latest))
        .route("/water/refresh", post(refresh))
        .route("/health", get(health))
        .with_state(AppState {
            service,
            date_column,
        })
}

async fn snapshot(state: &AppState, request: SnapshotRequest) -> ApiResult<UsageSnapshot> {
    Ok(state.service.clone().oneshot(request).await?)
}

async fn daily(State(state): State<AppState>) -> ApiResult<Json<UsageSnapshot>> {
    snapshot(&state, SnapshotRequest::current()).await.map(Json)
}

async fn refresh(State(state): State<AppState>) -> ApiResult<Json<UsageSnapshot>> {
    snapshot(&state, SnapshotRequest::refresh()).await.map(Json)
}

async fn latest(State(state): State<AppState>) -> ApiResult<Response> {
    let snapshot = snapshot(&state, SnapshotRequest::current()).await?;
    let latest = snapshot
        .latest(state.date_column.as_deref())
        .ok_or_else(|| ApiError::not_found("使用量データがありません"))?;

    let body = LatestResponse {
        cached: snapshot.cached,
        stale: snapshot.stale,
        fetched_at: snapshot.fetched_at,
        date_column: latest.date_column,
        record: latest.record,
    };
    Ok(Json(body).into_response())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// サーバー起動（Ctrl-C で終了）
pub async fn serve(config: &ServerConfig, router: Router) -> Result<(), UsageError> {
    let addr: SocketAddr = format!("{}:{}", config.bind_address, config.port)
        .parse()
        .map_err(|e| UsageError::Configuration(format!("不正な待ち受けアドレス: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| UsageError::Internal(format!("{}: {}", addr, e)))?;
    info!("Water usage API listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down...");
        })
        .await
        .map_err(|e| UsageError::Internal(format!("サーバーエラー: {}", e)))
}
