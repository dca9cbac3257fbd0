//! # zerv-core
//!
//! Core of a realtime, multi-tenant, clustered application server: socket
//! authentication, session lifecycle, a revoked-token store, RPC dispatch
//! and nested transactions.
//!
//! The HTTP framework, socket transport, cluster key/value store client,
//! token-signing library, RPC payload codec and storage layer are all
//! external collaborators — this crate owns the domain logic that sits
//! between them.
//!
//! ## Example
//!
//! ```rust,no_run
//! use zerv_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let routes = Router::new().route("/authorize", post(authorize));
//!
//!     let service = ServiceBuilder::new()
//!         .with_config(config)
//!         .with_routes(routes)
//!         .build()
//!         .await?;
//!
//!     service.serve().await
//! }
//! ```

pub mod activity;
pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod ids;
pub mod longtimeout;
pub mod middleware;
pub mod observability;
pub mod responses;
pub mod revocation;
pub mod rpc;
pub mod service_builder;
pub mod session;
pub mod state;
pub mod token;
pub mod transaction;
pub mod websocket;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{AuthConfig, Config, MiddlewareConfig, RedisConfig};
    pub use crate::error::{Error, ErrorResponse, Result};
    pub use crate::health::{health, readiness};
    pub use crate::http::{
        authorize, http_authorize, register, AuthorizeProvider, AuthorizeProviderState,
        AuthorizedUser, AuthorizeRequest, AuthorizeResponse, GrantType,
    };
    pub use crate::ids::{ConnectionId as TypedConnectionId, MakeTypedRequestId, RequestId, RequestIdError, ServerId, SessionId};
    pub use crate::middleware::{
        request_id_layer, request_id_propagation_layer, sensitive_headers_layer,
        RequestTrackingConfig, PROPAGATE_HEADERS, SENSITIVE_HEADERS,
    };
    pub use crate::observability::init_tracing;
    pub use crate::responses::{Accepted, Conflict, Created, FieldError, NoContent, Success, ValidationError};
    pub use crate::service_builder::{Service, ServiceBuilder};
    pub use crate::state::AppState;
    pub use crate::token::{TokenClaims, TokenCodec};
    pub use crate::cache::CacheFacade;

    pub use crate::activity::{ActivityGuard, ActivityTracker};
    pub use crate::longtimeout::{schedule, schedule_async, LongTimeoutHandle};
    pub use crate::revocation::RevocationStore;
    pub use crate::rpc::{CallerContext, RpcContext, RpcDispatcher, RpcRequest, RpcResponse};
    pub use crate::session::SessionManager;
    pub use crate::transaction::Transaction;
    pub use crate::websocket::{
        AuthOutcome, ConnectionId, ConnectionState, SocketAuthenticator, WebSocketConfig,
        WebSocketConnection, WebSocketUpgrade,
    };

    pub use axum::{
        extract::{Path, Query, State},
        http::{HeaderMap, HeaderValue, StatusCode},
        response::{IntoResponse, Json, Response},
        routing::{delete, get, patch, post, put},
        Extension, Router,
    };

    pub use serde::{Deserialize, Serialize};
    pub use tracing::{debug, error, info, instrument, trace, warn, Level, Span};
    pub use tokio;
    pub use async_trait::async_trait;
    pub use thiserror::Error;
    pub use anyhow::{self, Context as AnyhowContext};
    pub use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
    pub use uuid::Uuid;
    pub use futures::{future, stream, Future, Stream, StreamExt, TryFutureExt, TryStreamExt};
    pub use http::{Method, Uri};
}
