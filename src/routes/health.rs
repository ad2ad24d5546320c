use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::time::Instant;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub queue: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: &'static str,
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<u64>,
}

impl ComponentHealth {
    fn ok(started: Instant) -> Self {
        Self {
            status: "ok",
            latency_ms: Some(started.elapsed().as_millis() as u64),
            depth: None,
        }
    }

    fn error() -> Self {
        Self {
            status: "error",
            latency_ms: None,
            depth: None,
        }
    }
}

/// GET /health: database and queue reachability plus current queue depth.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let db_start = Instant::now();
    let database = match sqlx::query("SELECT 1").execute(&state.db).await {
        Ok(_) => ComponentHealth::ok(db_start),
        Err(e) => {
            tracing::warn!(error = %e, "Database health check failed");
            ComponentHealth::error()
        }
    };

    let queue_start = Instant::now();
    let queue = match state.queue.health_check().await {
        Ok(()) => ComponentHealth {
            depth: state.queue.depth().await.ok(),
            ..ComponentHealth::ok(queue_start)
        },
        Err(e) => {
            tracing::warn!(error = %e, "Queue health check failed");
            ComponentHealth::error()
        }
    };

    let healthy = database.status == "ok" && queue.status == "ok";
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: if healthy { "ok" } else { "degraded" },
            version: env!("CARGO_PKG_VERSION"),
            checks: HealthChecks { database, queue },
        }),
    )
}
