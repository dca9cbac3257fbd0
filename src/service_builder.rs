//! Service builder: wires configuration, application state, the batteries
//! -included health/readiness endpoints and the common middleware stack
//! around caller-supplied routes.
//!
//! ## Example
//!
//! ```rust,ignore
//! use zerv_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let routes = Router::new().route("/authorize", post(authorize));
//!
//!     let service = ServiceBuilder::new()
//!         .with_routes(routes)
//!         .build()
//!         .await?;
//!
//!     service.serve().await
//! }
//! ```

use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use tower_http::{
    catch_panic::CatchPanicLayer,
    compression::CompressionLayer,
    cors::CorsLayer,
    limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

use crate::config::Config;
use crate::error::Result;
use crate::middleware::{request_id_layer, request_id_propagation_layer, sensitive_headers_layer};
use crate::state::AppState;

/// Builds a [`Service`] from caller-supplied routes plus configuration.
///
/// `/health` and `/ready` are always present; everything else comes from
/// [`Self::with_routes`].
pub struct ServiceBuilder {
    config: Option<Config>,
    routes: Option<Router<AppState>>,
}

impl ServiceBuilder {
    /// Starts a builder with no routes and no explicit configuration.
    pub fn new() -> Self {
        Self {
            config: None,
            routes: None,
        }
    }

    /// Overrides the configuration that would otherwise come from
    /// [`Config::load`].
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Adds the application's own routes, merged with `/health`/`/ready`.
    pub fn with_routes(mut self, routes: Router<AppState>) -> Self {
        self.routes = Some(routes);
        self
    }

    /// Loads configuration (if not overridden), builds [`AppState`], and
    /// assembles the final router with the middleware stack applied.
    pub async fn build(self) -> Result<Service> {
        let config = match self.config {
            Some(config) => config,
            None => Config::load().unwrap_or_else(|e| {
                tracing::warn!("failed to load configuration, using defaults: {}", e);
                Config::default()
            }),
        };

        let state = AppState::new(config.clone()).await?;

        let health_routes = Router::new()
            .route("/health", get(crate::health::health))
            .route("/ready", get(crate::health::readiness));

        let app = health_routes
            .merge(self.routes.unwrap_or_default())
            .with_state(state);

        let app = apply_middleware(app, &config);

        let listener_addr = SocketAddr::from(([0, 0, 0, 0], config.service.port));

        Ok(Service {
            config,
            listener_addr,
            app,
        })
    }
}

impl Default for ServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies the common middleware stack (CORS, compression, timeout, body
/// limit, tracing, request tracking, panic recovery) according to
/// `config.middleware`. Layers are applied in reverse order, so the
/// outermost `.layer()` call here runs first on an incoming request.
fn apply_middleware(app: Router, config: &Config) -> Router {
    let body_limit = config.middleware.body_limit_mb * 1024 * 1024;
    let mut app = app;

    let cors_layer = match config.middleware.cors_mode.as_str() {
        "permissive" => CorsLayer::permissive(),
        "restrictive" | "disabled" => CorsLayer::new(),
        other => {
            tracing::warn!("unknown CORS mode '{}', defaulting to permissive", other);
            CorsLayer::permissive()
        }
    };
    app = app.layer(cors_layer);

    if config.middleware.compression {
        app = app.layer(CompressionLayer::new());
    }

    app = app.layer(TimeoutLayer::with_status_code(
        http::StatusCode::REQUEST_TIMEOUT,
        std::time::Duration::from_secs(config.service.timeout_secs),
    ));

    app = app.layer(RequestBodyLimitLayer::new(body_limit));

    app = app.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().include_headers(true))
            .on_response(DefaultOnResponse::new().include_headers(true)),
    );

    if config.middleware.request_tracking.mask_sensitive_headers {
        app = app.layer(sensitive_headers_layer());
    }
    if config.middleware.request_tracking.propagate_headers {
        app = app.layer(request_id_propagation_layer());
    }
    if config.middleware.request_tracking.request_id_enabled {
        app = app.layer(request_id_layer());
    }

    if config.middleware.catch_panic {
        app = app.layer(CatchPanicLayer::new());
    }

    app
}

/// A fully assembled application, ready to accept connections.
pub struct Service {
    config: Config,
    listener_addr: SocketAddr,
    app: Router,
}

impl Service {
    /// The configuration the service was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Binds the configured address and serves until a shutdown signal
    /// arrives, then returns once in-flight requests finish.
    pub async fn serve(self) -> Result<()> {
        tracing::info!(
            "starting {} on {}",
            self.config.service.name,
            self.listener_addr
        );

        let listener = tokio::net::TcpListener::bind(&self.listener_addr).await?;

        tracing::info!("listening on {}", self.listener_addr);

        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        tracing::info!("server shutdown complete");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, starting graceful shutdown"),
        _ = terminate => tracing::info!("received SIGTERM, starting graceful shutdown"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        let mut config = Config::default();
        config.service.name = "zerv-core-test".to_string();
        config.auth.secret = "test-secret-at-least-this-long".to_string();
        config.service.port = 0;
        config
    }

    #[tokio::test]
    async fn builds_with_health_routes_and_no_explicit_routes() {
        let service = ServiceBuilder::new().with_config(config()).build().await.unwrap();
        assert_eq!(service.config().service.name, "zerv-core-test");
    }
}
