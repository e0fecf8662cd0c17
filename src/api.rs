use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use tokio::{net::TcpListener, sync::watch};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    clients::health::HealthChecker,
    errors::PublishError,
    models::{
        health::HealthStatus,
        message::{NotificationRequest, PublishReceipt},
        response::ApiResponse,
    },
    publisher::Publisher,
};

pub struct AppState {
    publisher: Publisher,
    health_checker: HealthChecker,
}

impl AppState {
    pub fn new(publisher: Publisher, health_checker: HealthChecker) -> Self {
        Self {
            publisher,
            health_checker,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/notifications", post(publish_notification))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_api_server(
    port: u16,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!(address = %addr, "API server started");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_checker.check_all().await;

    let status_code = match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn publish_notification(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NotificationRequest>,
) -> (StatusCode, Json<ApiResponse<PublishReceipt>>) {
    match state.publisher.publish_default(request).await {
        Ok(receipt) => (
            StatusCode::ACCEPTED,
            Json(ApiResponse::success(
                receipt,
                "Notification queued".to_string(),
            )),
        ),
        Err(PublishError::Validation(e)) => (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error(
                e.to_string(),
                "Invalid notification request".to_string(),
            )),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::error(
                e.to_string(),
                "Notification could not be queued".to_string(),
            )),
        ),
    }
}
