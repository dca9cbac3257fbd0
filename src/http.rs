//! HTTP Authorization Endpoint.
//!
//! `POST /authorize` and `POST /register` mint short-lived authorization-code
//! tokens on top of application-supplied credential checking; the actual
//! user store is an external collaborator, reached through
//! [`AuthorizeProvider`].

use async_trait::async_trait;
use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::state::AppState;

/// A user resolved by [`AuthorizeProvider`], ready to have a token minted
/// for it.
#[derive(Debug, Clone)]
pub struct AuthorizedUser {
    /// The subject id carried as the token's `id` claim.
    pub id: String,
    /// Additional claims merged into the signed payload (`tenantId`,
    /// `firstName`, ...).
    pub claims: Map<String, Value>,
}

/// The credential-checking, registration and URL-shaping hooks the spec
/// leaves to the application. The storage layer behind an implementation is
/// an external collaborator; this trait is the seam.
#[async_trait]
pub trait AuthorizeProvider: Send + Sync {
    /// Resolves `username`/`password` to a user, or fails with the error
    /// the wire contract should surface (conventionally
    /// [`Error::InvalidCredentials`]).
    async fn find_user_by_credentials(&self, username: &str, password: &str) -> Result<AuthorizedUser>;

    /// Registers a new user from an arbitrary request body.
    async fn register(&self, body: Value) -> Result<AuthorizedUser>;

    /// Optional hook run after a successful login, before the response is
    /// built.
    async fn on_login(&self, _user: &AuthorizedUser) -> Result<()> {
        Ok(())
    }

    /// Builds the `url` field of a `rest` grant's response.
    fn rest_url(&self, _token: &str, _user: &AuthorizedUser) -> Option<String> {
        None
    }

    /// Builds the `url` field of a `login` grant's response.
    fn app_url(&self, _token: &str, _user: &AuthorizedUser) -> Option<String> {
        None
    }
}

/// `grant_type` values accepted by `POST /authorize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantType {
    /// Browser-app login; response `url` comes from `app_url`.
    Login,
    /// REST-client login; response `url` comes from `rest_url`.
    Rest,
}

impl FromStr for GrantType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "login" => Ok(Self::Login),
            "rest" => Ok(Self::Rest),
            other => Err(Error::BadRequest(format!("unknown grant_type '{}'", other))),
        }
    }
}

/// `POST /authorize` request body.
#[derive(Debug, Deserialize)]
pub struct AuthorizeRequest {
    /// Username to look up.
    pub username: String,
    /// Password to verify.
    pub password: String,
    /// Either `"login"` or `"rest"`.
    pub grant_type: String,
}

/// `POST /authorize` and `POST /register` success response.
#[derive(Debug, Serialize)]
pub struct AuthorizeResponse {
    /// Epoch milliseconds the authorization code was issued.
    pub issued_at: i64,
    /// The signed authorization-code token (`jti == 0`).
    pub access_token: String,
    /// Where the client should redirect next, if the provider supplied one.
    pub url: Option<String>,
}

/// `POST /authorize`.
pub async fn authorize(
    State(state): State<Arc<dyn AuthorizeProviderState>>,
    Json(body): Json<AuthorizeRequest>,
) -> Result<Json<AuthorizeResponse>> {
    let grant_type = GrantType::from_str(&body.grant_type)?;

    let user = state
        .provider()
        .find_user_by_credentials(&body.username, &body.password)
        .await?;

    state.provider().on_login(&user).await?;

    let app_state = state.app_state();
    let (token, _claims) = app_state
        .tokens()
        .sign_code(&user.id, app_state.config().auth.code_expires_in_secs, user.claims.clone())?;

    let url = match grant_type {
        GrantType::Login => state.provider().app_url(&token, &user),
        GrantType::Rest => state.provider().rest_url(&token, &user),
    };

    Ok(Json(AuthorizeResponse {
        issued_at: chrono::Utc::now().timestamp_millis(),
        access_token: token,
        url,
    }))
}

/// `POST /register`.
pub async fn register(
    State(state): State<Arc<dyn AuthorizeProviderState>>,
    Json(body): Json<Value>,
) -> Result<Json<AuthorizeResponse>> {
    let user = state.provider().register(body).await?;

    let app_state = state.app_state();
    let (token, _claims) = app_state
        .tokens()
        .sign_code(&user.id, app_state.config().auth.code_expires_in_secs, user.claims.clone())?;

    Ok(Json(AuthorizeResponse {
        issued_at: chrono::Utc::now().timestamp_millis(),
        access_token: token,
        url: state.provider().rest_url(&token, &user),
    }))
}

/// State exposing both the [`AppState`] (for signing) and the application's
/// [`AuthorizeProvider`] to the `/authorize` and `/register` handlers.
pub trait AuthorizeProviderState: Send + Sync {
    /// The application-supplied credential/registration hooks.
    fn provider(&self) -> &dyn AuthorizeProvider;
    /// The shared application state, for token signing.
    fn app_state(&self) -> &AppState;
}

/// The `httpAuthorize` middleware contract: verifies an `access-token`
/// header, refusing revoked or invalid tokens.
pub async fn http_authorize(state: &AppState, token: &str) -> Result<crate::token::TokenClaims> {
    if state.revocation().is_revoked(token).await? {
        return Err(Error::RevokedToken);
    }
    state.tokens().verify(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::Mutex;

    struct StaticProvider {
        credentials: Mutex<(String, String)>,
    }

    #[async_trait]
    impl AuthorizeProvider for StaticProvider {
        async fn find_user_by_credentials(&self, username: &str, password: &str) -> Result<AuthorizedUser> {
            let (expected_user, expected_pass) = self.credentials.lock().unwrap().clone();
            if username == expected_user && password == expected_pass {
                Ok(AuthorizedUser {
                    id: username.to_string(),
                    claims: Map::new(),
                })
            } else {
                Err(Error::InvalidCredentials("bad credentials".to_string()))
            }
        }

        async fn register(&self, body: Value) -> Result<AuthorizedUser> {
            let id = body
                .get("username")
                .and_then(Value::as_str)
                .unwrap_or("anonymous")
                .to_string();
            Ok(AuthorizedUser {
                id,
                claims: Map::new(),
            })
        }

        fn rest_url(&self, _token: &str, _user: &AuthorizedUser) -> Option<String> {
            Some("restServer/".to_string())
        }
    }

    struct TestState {
        app: AppState,
        provider: StaticProvider,
    }

    impl AuthorizeProviderState for TestState {
        fn provider(&self) -> &dyn AuthorizeProvider {
            &self.provider
        }
        fn app_state(&self) -> &AppState {
            &self.app
        }
    }

    async fn test_state() -> Arc<TestState> {
        let mut config = Config::default();
        config.auth.secret = "test-secret-at-least-this-long".to_string();
        config.auth.code_expires_in_secs = 20;
        let app = AppState::new(config).await.unwrap();
        Arc::new(TestState {
            app,
            provider: StaticProvider {
                credentials: Mutex::new(("jose".to_string(), "Pa123".to_string())),
            },
        })
    }

    #[tokio::test]
    async fn successful_rest_grant_issues_short_lived_code_with_url() {
        let state: Arc<dyn AuthorizeProviderState> = test_state().await;
        let response = authorize(
            State(state.clone()),
            Json(AuthorizeRequest {
                username: "jose".to_string(),
                password: "Pa123".to_string(),
                grant_type: "rest".to_string(),
            }),
        )
        .await
        .unwrap();

        assert_eq!(response.url.as_deref(), Some("restServer/"));
        let claims = state.app_state().tokens().verify(&response.access_token).unwrap();
        assert_eq!(claims.exp - claims.iat, 20);
        assert_eq!(claims.jti, 0);
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let state: Arc<dyn AuthorizeProviderState> = test_state().await;
        let result = authorize(
            State(state),
            Json(AuthorizeRequest {
                username: "jose".to_string(),
                password: "wrong".to_string(),
                grant_type: "rest".to_string(),
            }),
        )
        .await;

        assert!(matches!(result, Err(Error::InvalidCredentials(_))));
    }

    #[tokio::test]
    async fn unknown_grant_type_is_rejected() {
        let state: Arc<dyn AuthorizeProviderState> = test_state().await;
        let result = authorize(
            State(state),
            Json(AuthorizeRequest {
                username: "jose".to_string(),
                password: "Pa123".to_string(),
                grant_type: "unknown".to_string(),
            }),
        )
        .await;

        assert!(matches!(result, Err(Error::BadRequest(_))));
        assert_eq!(result.unwrap_err().code(), "INVALID_TYPE");
    }
}
