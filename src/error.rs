//! Error types and HTTP/socket/RPC wire-shape projections.
//!
//! [`Error`] is the single error type threaded through every component.
//! Because the same failure can be reported over three different wires
//! (a plain HTTP JSON body, a socket `unauthorized` event, or an RPC
//! response envelope), this module keeps one canonical `code()` per variant
//! and three small projection methods rather than three parallel error
//! enums.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The crate-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration failed to load or validate.
    #[error("configuration error: {0}")]
    Config(Box<figment::Error>),

    /// A cluster key/value store (Redis) operation failed.
    #[cfg(feature = "cache")]
    #[error("cluster store error: {0}")]
    Redis(Box<redis::RedisError>),

    /// Token signing or verification failed at the library level.
    #[error("token error: {0}")]
    Jwt(Box<jsonwebtoken::errors::Error>),

    /// Axum/http construction error.
    #[error("http error: {0}")]
    Http(Box<axum::http::Error>),

    /// I/O failure (local cache persistence, config file discovery, ...).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// `POST /authorize` was given a secret that does not match.
    #[error("invalid secret")]
    InvalidSecret,

    /// A presented token failed structural or signature validation.
    #[error("invalid token")]
    InvalidToken,

    /// A presented token's `jti` is in the Revoked-Token Store.
    #[error("revoked token")]
    RevokedToken,

    /// A token was valid but does not carry the privilege the caller needs.
    #[error("unauthorized token")]
    UnauthorizedToken,

    /// An operation targeted a user other than the authenticated one.
    #[error("wrong user")]
    WrongUser,

    /// The `origin`/tenant named in a request is not known to this server.
    #[error("unknown tenant")]
    UnknownTenant,

    /// No Local session exists for `origin` and the inactivity window lapsed,
    /// or no session could be found at all.
    #[error("inactive session timeout or session not found")]
    InactiveSessionOrNotFound,

    /// `maxActiveDuration` was lowered below the session's elapsed duration.
    #[error("active session duration decreased below elapsed duration")]
    ActiveSessionDurationDecreased,

    /// A resource referenced by the caller no longer exists.
    #[error("no longer valid")]
    NoLongerValid,

    /// An RPC handler was called but did not return a promise/future value.
    #[error("transaction execution not returning a promise")]
    TransactionExecutionNotReturningAPromise,

    /// An inner (nested) transaction's future was created but never awaited.
    #[error("inner transaction not awaited")]
    InnerTransactionNotAwaited,

    /// An inner transaction rolled back and the rollback propagated upward.
    #[error("inner transaction rolled back")]
    InnerTransactionRolledBack,

    /// A nested transaction requirement of `mustBeNew` was given a parent.
    #[error("parent transaction not provided")]
    ParentTransactionNotProvided,

    /// A nested transaction requirement forbids a parent but one was given.
    #[error("parent transaction may not be provided")]
    ParentTransactionMayNotBeProvided,

    /// A transaction's `requirement` field held an unrecognized value.
    #[error("unknown transaction requirement")]
    TransactionRequirementUnknown,

    /// A transaction was rolled back, either explicitly or via an `onCommit`
    /// hook throwing.
    #[error("transaction rolled back")]
    RollBack,

    /// Payload failed schema/shape validation.
    #[error("incorrect data format: {0}")]
    BadRequest(String),

    /// Caller is not authenticated.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The RPC Dispatcher is paused for a graceful shutdown and rejects new
    /// calls.
    #[error("server unavailable")]
    ServerUnavailable,

    /// An RPC method name has no registered route.
    #[error("unknown RPC method: {0}")]
    UnknownMethod(String),

    /// Conflicting state (e.g. duplicate registration).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Generic validation failure outside the named error kinds above.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// `findUserByCredentials` rejected the presented username/password.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Feature not supported in this build/configuration.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// An unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// Catch-all for errors that don't fit another variant.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The stable wire code for this error, matching the names used across
    /// the HTTP, socket and RPC surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            #[cfg(feature = "cache")]
            Error::Redis(_) => "SERVER_UNAVAILABLE",
            Error::Jwt(_) => "invalid_token",
            Error::Http(_) => "SERVER_ERROR",
            Error::Io(_) => "SERVER_ERROR",
            Error::InvalidSecret => "invalid_secret",
            Error::InvalidToken => "invalid_token",
            Error::RevokedToken => "revoked_token",
            Error::UnauthorizedToken => "unauthorized_token",
            Error::WrongUser => "wrong_user",
            Error::UnknownTenant => "unknown_tenant",
            Error::InactiveSessionOrNotFound => "inactive_session_timeout_or_session_not_found",
            Error::ActiveSessionDurationDecreased => "active_session_duration_decreased",
            Error::NoLongerValid => "no_longer_valid",
            Error::TransactionExecutionNotReturningAPromise => {
                "TRANSACTION_EXECUTION_NOT_RETURNING_A_PROMISE"
            }
            Error::InnerTransactionNotAwaited => "INNER_TRANSACTION_NOT_AWAITED",
            Error::InnerTransactionRolledBack => "INNER_TRANSACTION_ROLLED_BACK",
            Error::ParentTransactionNotProvided => "PARENT_TRANSACTION_NOT_PROVIDED",
            Error::ParentTransactionMayNotBeProvided => "PARENT_TRANSACTION_MAY_NOT_BE_PROVIDED",
            Error::TransactionRequirementUnknown => "TRANSACTION_REQUIREMENT_UNKNOWN",
            Error::RollBack => "ROLL_BACK",
            Error::BadRequest(_) => "INVALID_TYPE",
            Error::Unauthorized(_) => "UNAUTHORIZED",
            Error::ServerUnavailable => "SERVER_UNAVAILABLE",
            Error::UnknownMethod(_) => "API-UNKNOWN",
            Error::Conflict(_) => "CONFLICT",
            Error::ValidationError(_) => "USER_INVALID",
            Error::InvalidCredentials(_) => "USER_INVALID",
            Error::NotSupported(_) => "NOT_SUPPORTED",
            Error::Internal(_) => "SERVER_ERROR",
            Error::Other(_) => "unknown",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::InvalidSecret
            | Error::InvalidToken
            | Error::RevokedToken
            | Error::UnauthorizedToken
            | Error::WrongUser
            | Error::Unauthorized(_)
            | Error::InvalidCredentials(_)
            | Error::Jwt(_) => StatusCode::UNAUTHORIZED,
            Error::UnknownTenant | Error::InactiveSessionOrNotFound | Error::NoLongerValid => {
                StatusCode::NOT_FOUND
            }
            Error::UnknownMethod(_) => StatusCode::NOT_FOUND,
            Error::ServerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Error::BadRequest(_) | Error::ValidationError(_) => StatusCode::BAD_REQUEST,
            Error::Conflict(_) | Error::ActiveSessionDurationDecreased => StatusCode::CONFLICT,
            Error::NotSupported(_) => StatusCode::NOT_IMPLEMENTED,
            Error::TransactionExecutionNotReturningAPromise
            | Error::InnerTransactionNotAwaited
            | Error::InnerTransactionRolledBack
            | Error::ParentTransactionNotProvided
            | Error::ParentTransactionMayNotBeProvided
            | Error::TransactionRequirementUnknown
            | Error::RollBack => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Projection for the socket transport's `unauthorized` event, shaped
    /// `{ message, data: { code, type } }`.
    pub fn to_socket_unauthorized(&self) -> serde_json::Value {
        serde_json::json!({
            "message": self.to_string(),
            "data": {
                "code": self.code(),
                "type": "UnauthorizedError",
            }
        })
    }

    /// Projection for an RPC response envelope's error slot, shaped
    /// `{ code, data }`.
    pub fn to_rpc_error(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.code(),
            "data": self.to_string(),
        })
    }
}

/// HTTP JSON error body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable message.
    pub error: String,
    /// Stable machine-readable code, see [`Error::code`].
    pub code: String,
    /// HTTP status code, duplicated in the body for clients that don't
    /// inspect status lines.
    pub status: u16,
}

impl ErrorResponse {
    /// Builds an error response from a message and code.
    pub fn new(error: impl Into<String>, code: impl Into<String>, status: u16) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
            status,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if matches!(status, StatusCode::INTERNAL_SERVER_ERROR) {
            tracing::error!(error = %self, code = self.code(), "request failed");
        } else {
            tracing::debug!(error = %self, code = self.code(), "request rejected");
        }

        let body = ErrorResponse::new(self.to_string(), self.code(), status.as_u16());
        (status, Json(body)).into_response()
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

#[cfg(feature = "cache")]
impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Redis(Box::new(err))
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Error::Jwt(Box::new(err))
    }
}

impl From<axum::http::Error> for Error {
    fn from(err: axum::http::Error) -> Self {
        Error::Http(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_wire_contract() {
        assert_eq!(Error::InvalidSecret.code(), "invalid_secret");
        assert_eq!(Error::RevokedToken.code(), "revoked_token");
        assert_eq!(
            Error::InactiveSessionOrNotFound.code(),
            "inactive_session_timeout_or_session_not_found"
        );
        assert_eq!(
            Error::TransactionExecutionNotReturningAPromise.code(),
            "TRANSACTION_EXECUTION_NOT_RETURNING_A_PROMISE"
        );
        assert_eq!(Error::RollBack.code(), "ROLL_BACK");
    }

    #[test]
    fn socket_projection_has_code_and_type() {
        let payload = Error::UnauthorizedToken.to_socket_unauthorized();
        assert_eq!(payload["data"]["code"], "unauthorized_token");
        assert_eq!(payload["data"]["type"], "UnauthorizedError");
    }

    #[test]
    fn rpc_projection_has_code_and_data() {
        let payload = Error::UnknownMethod("foo.bar".into()).to_rpc_error();
        assert_eq!(payload["code"], "API-UNKNOWN");
        assert!(payload["data"].as_str().unwrap().contains("foo.bar"));
    }

    #[test]
    fn unauthorized_errors_map_to_401() {
        assert_eq!(Error::InvalidToken.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(Error::WrongUser.status(), StatusCode::UNAUTHORIZED);
    }
}
