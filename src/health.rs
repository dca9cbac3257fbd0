//! Health check handlers.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::state::AppState;

/// Liveness response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status, always `"healthy"` once the process is up.
    pub status: String,
    /// Service name, from configuration.
    pub service: String,
    /// Crate version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Readiness response with dependency status.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadinessResponse {
    /// Whether every checked dependency is healthy.
    pub ready: bool,
    /// Service name, from configuration.
    pub service: String,
    /// Per-dependency status.
    pub dependencies: HashMap<String, DependencyStatus>,
}

/// A single dependency's health.
#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    /// Whether the dependency responded successfully.
    pub healthy: bool,
    /// Optional detail, surfaced to operators rather than clients.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Liveness probe: always `200 OK` once the process is accepting requests.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "healthy".to_string(),
        service: state.config().service.name.clone(),
        version: Some(env!("CARGO_PKG_VERSION").to_string()),
    };

    (StatusCode::OK, Json(response))
}

/// Readiness probe: `200 OK` only if the Cache Facade's backend responds,
/// `503` otherwise.
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let mut dependencies = HashMap::new();

    let cache_healthy = state.cache().ping().await.is_ok();
    dependencies.insert(
        "cache".to_string(),
        DependencyStatus {
            healthy: cache_healthy,
            message: Some(if cache_healthy {
                "Connected".to_string()
            } else {
                "Unreachable".to_string()
            }),
        },
    );

    let response = ReadinessResponse {
        ready: cache_healthy,
        service: state.config().service.name.clone(),
        dependencies,
    };

    let status = if cache_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response() {
        let response = HealthResponse {
            status: "healthy".to_string(),
            service: "test-service".to_string(),
            version: Some("1.0.0".to_string()),
        };

        assert_eq!(response.status, "healthy");
        assert_eq!(response.service, "test-service");
    }

    #[test]
    fn test_dependency_status() {
        let status = DependencyStatus {
            healthy: true,
            message: Some("OK".to_string()),
        };

        assert!(status.healthy);
        assert_eq!(status.message, Some("OK".to_string()));
    }
}
