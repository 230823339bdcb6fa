use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use mingle_shared::{HealthCheck, HealthResponse, HealthStatus};

use crate::registry::ListenerStatus;
use crate::store::{Collection, RemoteStore};
use crate::AppState;

/// Probes the store, the session listeners and, when publishing, RabbitMQ.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    let mut checks = Vec::with_capacity(3);

    checks.push(match state.store.query(Collection::Profiles, &[]).await {
        Ok(_) => HealthCheck::new("store", HealthStatus::Healthy),
        Err(e) => HealthCheck::new("store", HealthStatus::Unhealthy).with_message(e.to_string()),
    });

    let listeners = state.session.listener_status();
    let failed: Vec<&str> = listeners
        .iter()
        .filter(|l| matches!(l.status, ListenerStatus::Failed(_)))
        .map(|l| l.topic.as_str())
        .collect();
    checks.push(if !state.session.is_active() {
        HealthCheck::new("session", HealthStatus::Degraded).with_message("no active session")
    } else if failed.is_empty() {
        HealthCheck::new("session", HealthStatus::Healthy)
    } else {
        HealthCheck::new("session", HealthStatus::Degraded)
            .with_message(format!("failed listeners: {}", failed.join(",")))
    });

    if let Some(rabbitmq) = &state.rabbitmq {
        checks.push(if rabbitmq.is_connected() {
            HealthCheck::new("rabbitmq", HealthStatus::Healthy)
        } else {
            HealthCheck::new("rabbitmq", HealthStatus::Unhealthy).with_message("channel closed")
        });
    }

    let response = HealthResponse::healthy("mingle-matching", env!("CARGO_PKG_VERSION"))
        .with_checks(checks);

    let status = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status, Json(response)).into_response()
}

/// Returns Prometheus metrics.
pub async fn metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}
