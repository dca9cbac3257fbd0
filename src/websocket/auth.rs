//! Socket authentication state machine.
//!
//! One [`ConnectionState`] per socket, held inside [`SocketAuthenticator`].
//! States: `Unauth → Active → Closed`, with every `authenticate` call while
//! `Active` re-entering through [`SocketAuthenticator::authenticate`] to
//! refresh the token in place (the wire contract has no separate
//! "refreshing" state visible to callers, only the transition).
//!
//! This module knows nothing about the actual socket transport: reading
//! frames, writing frames, and the authenticate-or-die timer are the
//! transport layer's job. What it owns is the transition logic — given a
//! presented token and origin, decide whether the connection becomes
//! authenticated, rejected, or left to a concurrent in-flight attempt.

use dashmap::DashMap;
use serde_json::Map;
use std::sync::Arc;

use crate::cache::CacheFacade;
use crate::config::AuthConfig;
use crate::error::{Error, Result};
use crate::revocation::RevocationStore;
use crate::session::SessionManager;
use crate::token::{TokenClaims, TokenCodec};
use crate::websocket::handler::ConnectionId;

/// Per-socket authentication state.
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    user_id: Option<String>,
    origin: Option<String>,
    token: Option<String>,
    payload: Option<TokenClaims>,
}

impl ConnectionState {
    /// The authenticated user id, once known.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// The origin this socket settled on, once `initNewConnection` completes.
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// The current bearer token for this socket.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

/// A successful `authenticate` transition, returned to the transport layer
/// to act on: send `authenticated(token)` to the socket, and deliver
/// `unauthorized{code:"wrong_user"}` to `peers_to_reject` before closing
/// them.
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    /// The token the client should now use.
    pub token: String,
    /// The claims carried by `token`.
    pub claims: TokenClaims,
    /// Other connections at the same origin to reject, because they
    /// authenticated as a different user (`initNewConnection`'s sibling
    /// check). Empty on a `maintainConnection` transition.
    pub peers_to_reject: Vec<ConnectionId>,
    /// The previous token to revoke and whose exp to pass to
    /// [`RevocationStore::revoke`], once the client acknowledges
    /// `authenticated`. `None` if this connection reused its token
    /// verbatim (a fresh connection authenticating with a `jti >= 1`
    /// token).
    pub revoke_on_ack: Option<(String, i64)>,
}

/// Owns live per-connection authentication state plus the components the
/// state machine consults: the Token Verifier/Signer, the Revoked-Token
/// Store, and the User-Session Manager.
#[derive(Clone)]
pub struct SocketAuthenticator {
    connections: Arc<DashMap<ConnectionId, ConnectionState>>,
    tokens: TokenCodec,
    revocation: RevocationStore,
    sessions: SessionManager,
    config: AuthConfig,
}

impl SocketAuthenticator {
    /// Builds an authenticator over a shared `sessions` manager and `cache`
    /// (the latter backing the revocation store).
    pub fn new(config: AuthConfig, cache: Arc<CacheFacade>, sessions: SessionManager) -> Self {
        let tokens = TokenCodec::new(&config.secret);
        Self {
            connections: Arc::new(DashMap::new()),
            tokens,
            revocation: RevocationStore::new(cache),
            sessions,
            config,
        }
    }

    /// Registers a freshly-connected, unauthenticated socket. The caller is
    /// responsible for arming an `auth_timeout()`-bounded timer that
    /// disconnects the socket with `unauthorized` if `authenticate` never
    /// arrives.
    pub fn connect(&self, connection_id: ConnectionId) {
        self.connections
            .insert(connection_id, ConnectionState::default());
    }

    /// The authenticate-or-die window callers should enforce after
    /// [`Self::connect`].
    pub fn auth_timeout(&self) -> std::time::Duration {
        self.config.auth_timeout()
    }

    /// `authenticate{token, origin?}`. Verifies `token`, checks revocation,
    /// then dispatches to `initNewConnection` or `maintainConnection`
    /// depending on whether this socket has already settled on a user.
    ///
    /// Returns `Ok(None)` for the one silent no-op case the wire contract
    /// calls out explicitly: a `maintainConnection` transition arriving
    /// while this socket's `initNewConnection` is still in flight (`origin`
    /// not yet set). Nothing is sent to the client in that case.
    pub async fn authenticate(
        &self,
        connection_id: ConnectionId,
        token: &str,
        origin: Option<&str>,
    ) -> Result<Option<AuthOutcome>> {
        if self.revocation.is_revoked(token).await? {
            return Err(Error::RevokedToken);
        }
        let claims = self.tokens.verify(token)?;

        let known_user_id = self
            .connections
            .get(&connection_id)
            .and_then(|s| s.user_id.clone());

        match known_user_id {
            None => self
                .init_new_connection(connection_id, token, claims, origin)
                .await
                .map(Some),
            Some(ref existing) if existing == &claims.id => {
                self.maintain_connection(connection_id, claims).await
            }
            Some(_) => Err(Error::UnauthorizedToken),
        }
    }

    async fn init_new_connection(
        &self,
        connection_id: ConnectionId,
        token: &str,
        claims: TokenClaims,
        origin: Option<&str>,
    ) -> Result<AuthOutcome> {
        let tenant_id = tenant_id_of(&claims)?;

        let peers_to_reject: Vec<ConnectionId> = if let Some(origin) = origin {
            self.connections
                .iter()
                .filter(|e| {
                    *e.key() != connection_id
                        && e.origin.as_deref() == Some(origin)
                        && e.user_id.as_deref().is_some_and(|u| u != claims.id)
                })
                .map(|e| *e.key())
                .collect()
        } else {
            Vec::new()
        };

        let is_fresh_auth_code = claims.is_auth_code();

        let (new_token, new_claims, revoke_on_ack) = if is_fresh_auth_code {
            let old_exp = claims.exp;
            let (t, c) = self.refresh_token(claims, tenant_id.as_deref()).await?;
            (t, c, Some((token.to_string(), old_exp)))
        } else {
            let origin_key = origin.unwrap_or(token);
            self.sessions.validate_active(origin_key).await?;
            (token.to_string(), claims, None)
        };

        let origin_key = origin
            .map(str::to_string)
            .unwrap_or_else(|| new_token.clone());

        if is_fresh_auth_code {
            // A fresh login opens (or refreshes) the Cluster Session that
            // fixes this origin's absolute deadline and arms its auto-logout
            // timer.
            let max_mins = self.tenant_max_active_seconds(tenant_id.as_deref()) / 60;
            self.sessions
                .open_cluster_session(&origin_key, &new_claims.id, max_mins)
                .await?;
        }

        self.connections.insert(
            connection_id,
            ConnectionState {
                user_id: Some(new_claims.id.clone()),
                origin: Some(origin_key),
                token: Some(new_token.clone()),
                payload: Some(new_claims.clone()),
            },
        );

        Ok(AuthOutcome {
            token: new_token,
            claims: new_claims,
            peers_to_reject,
            revoke_on_ack,
        })
    }

    async fn maintain_connection(
        &self,
        connection_id: ConnectionId,
        claims: TokenClaims,
    ) -> Result<Option<AuthOutcome>> {
        let origin = {
            let state = self.connections.get(&connection_id);
            match state.and_then(|s| s.origin.clone()) {
                // An initNewConnection is still in flight on this socket;
                // a concurrent refresh defers silently.
                None => return Ok(None),
                Some(origin) => origin,
            }
        };

        self.sessions
            .validate_active(&origin)
            .await
            .map_err(|_| Error::InactiveSessionOrNotFound)?;

        let tenant_id = tenant_id_of(&claims)?;
        let (new_token, new_claims) = self.refresh_token(claims, tenant_id.as_deref()).await?;

        if let Some(mut state) = self.connections.get_mut(&connection_id) {
            state.token = Some(new_token.clone());
            state.payload = Some(new_claims.clone());
        }

        for mut entry in self.connections.iter_mut() {
            if *entry.key() != connection_id && entry.origin.as_deref() == Some(origin.as_str()) {
                entry.token = Some(new_token.clone());
                entry.payload = Some(new_claims.clone());
            }
        }

        Ok(Some(AuthOutcome {
            token: new_token,
            claims: new_claims,
            peers_to_reject: Vec::new(),
            revoke_on_ack: None,
        }))
    }

    async fn refresh_token(
        &self,
        claims: TokenClaims,
        tenant_id: Option<&str>,
    ) -> Result<(String, TokenClaims)> {
        let tenant_max_secs = self.tenant_max_active_seconds(tenant_id);
        let jti = claims.jti + 1;
        let dur_secs = self.config.token_refresh_interval_in_mins * 60;
        let existing_window = claims.exp - claims.iat;
        let now = chrono::Utc::now().timestamp();

        let expires_in_secs = if existing_window != tenant_max_secs {
            tenant_max_secs
        } else {
            claims.exp - now
        };

        if now + expires_in_secs < now {
            return Err(Error::ActiveSessionDurationDecreased);
        }
        if expires_in_secs <= 0 {
            return Err(Error::ActiveSessionDurationDecreased);
        }

        self.tokens
            .sign(&claims.id, jti, expires_in_secs, dur_secs, claims.extra)
    }

    fn tenant_max_active_seconds(&self, tenant_id: Option<&str>) -> i64 {
        let mins = tenant_id
            .and_then(|id| self.sessions.tenant_maximum_active_session_timeout_in_mins(id))
            .unwrap_or(self.config.tenant_session_timeout_default_mins);
        mins * 60
    }

    /// `ack` to `authenticated(newToken)`: revokes the previous token (if
    /// distinct) and attaches/refreshes the Local Session via the
    /// User-Session Manager.
    pub async fn on_authenticated_ack(
        &self,
        connection_id: ConnectionId,
        server_id: crate::ids::ServerId,
        outcome: &AuthOutcome,
    ) -> Result<()> {
        if let Some((old_token, old_exp)) = &outcome.revoke_on_ack {
            if old_token != &outcome.token {
                self.revocation
                    .revoke(old_token, *old_exp, self.config.token_refresh_interval_in_mins)
                    .await?;
            }
        }

        if let Some(state) = self.connections.get(&connection_id) {
            if let Some(origin) = &state.origin {
                self.sessions.attach_connection(
                    origin,
                    server_id,
                    &outcome.claims.id,
                    connection_id,
                );
            }
        }
        Ok(())
    }

    /// `logout(token?)`: no-op if this socket never settled on an origin.
    pub async fn logout(&self, connection_id: ConnectionId) -> Result<Option<String>> {
        let origin = self
            .connections
            .get(&connection_id)
            .and_then(|s| s.origin.clone());

        if let Some(origin) = &origin {
            self.sessions.close(origin).await?;
        }
        Ok(origin)
    }

    /// `disconnect`: detaches the connection from its Local Session (if
    /// any) and forgets its authentication state.
    pub fn disconnect(&self, connection_id: ConnectionId) {
        if let Some((_, state)) = self.connections.remove(&connection_id) {
            if let Some(origin) = state.origin {
                self.sessions.detach_connection(&origin, connection_id);
            }
        }
    }

    /// Reads the current state for `connection_id`, if tracked.
    pub fn state_of(&self, connection_id: ConnectionId) -> Option<ConnectionState> {
        self.connections.get(&connection_id).map(|e| e.clone())
    }

    /// The underlying session manager, for callers that need direct
    /// access (e.g. to schedule the inactive-local-session sweep).
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }
}

fn tenant_id_of(claims: &TokenClaims) -> Result<Option<String>> {
    match claims.extra.get("tenantId").and_then(|v| v.as_str()) {
        Some(id) if !id.is_empty() => Ok(Some(id.to_string())),
        Some(_) => Err(Error::UnknownTenant),
        None => Ok(None),
    }
}

#[allow(dead_code)]
fn empty_extra() -> Map<String, serde_json::Value> {
    Map::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ServerId;

    fn authenticator() -> SocketAuthenticator {
        let config = AuthConfig {
            secret: "test-secret-at-least-this-long".to_string(),
            code_expires_in_secs: 5,
            token_refresh_interval_in_mins: 1440,
            auth_timeout_ms: 5000,
            inactive_local_user_session_timeout_in_mins: 5,
            tenant_session_timeout_default_mins: 60,
            max_http_buffer_size: 100 * 1024 * 1024,
        };
        let cache = Arc::new(CacheFacade::local());
        let sessions = SessionManager::new(cache.clone(), ServerId::new());
        SocketAuthenticator::new(config, cache, sessions)
    }

    fn codec(auth: &SocketAuthenticator) -> TokenCodec {
        TokenCodec::new(&auth.config.secret)
    }

    #[tokio::test]
    async fn first_time_auth_code_is_refreshed_and_old_token_flagged_for_revocation() {
        let auth = authenticator();
        let (code, _) = codec(&auth).sign_code("user-1", 5, Map::new()).unwrap();
        let conn = ConnectionId::new();
        auth.connect(conn);

        let outcome = auth.authenticate(conn, &code, Some("origin-1")).await.unwrap().unwrap();
        assert_eq!(outcome.claims.jti, 1);
        assert!(outcome.revoke_on_ack.is_some());
        assert_ne!(outcome.token, code);
    }

    #[tokio::test]
    async fn known_user_reauthenticating_with_mismatched_id_is_rejected() {
        let auth = authenticator();
        let (code_a, _) = codec(&auth).sign_code("user-a", 5, Map::new()).unwrap();
        let (code_b, _) = codec(&auth).sign_code("user-b", 5, Map::new()).unwrap();
        let conn = ConnectionId::new();
        auth.connect(conn);
        auth.authenticate(conn, &code_a, Some("origin-1")).await.unwrap();

        let result = auth.authenticate(conn, &code_b, Some("origin-1")).await;
        assert!(matches!(result, Err(Error::UnauthorizedToken)));
    }

    #[tokio::test]
    async fn revoked_token_is_rejected() {
        let auth = authenticator();
        let (code, claims) = codec(&auth).sign_code("user-1", 5, Map::new()).unwrap();
        auth.revocation.revoke(&code, claims.exp, 1440).await.unwrap();

        let conn = ConnectionId::new();
        auth.connect(conn);
        let result = auth.authenticate(conn, &code, None).await;
        assert!(matches!(result, Err(Error::RevokedToken)));
    }

    #[tokio::test]
    async fn sibling_with_different_user_at_same_origin_is_flagged_for_rejection() {
        let auth = authenticator();
        let (code_a, _) = codec(&auth).sign_code("user-a", 5, Map::new()).unwrap();
        let conn_a = ConnectionId::new();
        auth.connect(conn_a);
        let outcome = auth.authenticate(conn_a, &code_a, Some("origin-1")).await.unwrap().unwrap();
        auth.on_authenticated_ack(conn_a, ServerId::new(), &outcome)
            .await
            .unwrap();

        let (code_b, _) = codec(&auth).sign_code("user-b", 5, Map::new()).unwrap();
        let conn_b = ConnectionId::new();
        auth.connect(conn_b);
        let outcome_b = auth.authenticate(conn_b, &code_b, Some("origin-1")).await.unwrap().unwrap();

        assert_eq!(outcome_b.peers_to_reject, vec![conn_a]);
    }

    #[tokio::test]
    async fn reconnecting_with_refreshed_token_requires_active_cluster_session() {
        let auth = authenticator();
        let (refreshed, _) = codec(&auth).sign("user-1", 1, 3600, 1440 * 60, Map::new()).unwrap();
        let conn = ConnectionId::new();
        auth.connect(conn);

        let result = auth.authenticate(conn, &refreshed, Some("origin-1")).await;
        assert!(matches!(result, Err(Error::InactiveSessionOrNotFound)));
    }

    #[tokio::test]
    async fn disconnect_clears_tracked_state() {
        let auth = authenticator();
        let (code, _) = codec(&auth).sign_code("user-1", 5, Map::new()).unwrap();
        let conn = ConnectionId::new();
        auth.connect(conn);
        auth.authenticate(conn, &code, Some("origin-1")).await.unwrap().unwrap();

        auth.disconnect(conn);
        assert!(auth.state_of(conn).is_none());
    }
}
