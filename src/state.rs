//! Application state: the per-process set of domain components every HTTP
//! handler and socket connection shares.

use std::sync::Arc;

use crate::activity::ActivityTracker;
use crate::cache::CacheFacade;
use crate::config::Config;
use crate::error::Result;
use crate::ids::ServerId;
use crate::revocation::RevocationStore;
use crate::rpc::RpcDispatcher;
use crate::session::SessionManager;
use crate::token::TokenCodec;
use crate::websocket::SocketAuthenticator;

/// Shared application state.
///
/// One instance is built at startup and cloned (cheaply — every field is an
/// `Arc` or itself cheap to clone) into every handler and socket task.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    cache: Arc<CacheFacade>,
    tokens: TokenCodec,
    revocation: RevocationStore,
    sessions: SessionManager,
    activity: ActivityTracker,
    rpc: RpcDispatcher,
    socket_auth: SocketAuthenticator,
    server_id: ServerId,
}

impl AppState {
    /// Assembles application state from `config`, selecting the Cluster
    /// cache backend when `config.cluster_cache_enabled()` and falling back
    /// to Local otherwise.
    pub async fn new(config: Config) -> Result<Self> {
        let cache = Arc::new(if config.cluster_cache_enabled() {
            let redis_config = config
                .redis
                .as_ref()
                .expect("cluster_cache_enabled() implies redis is Some");
            CacheFacade::cluster(redis_config).await?
        } else {
            CacheFacade::local()
        });

        let server_id = ServerId::new();
        let tokens = TokenCodec::new(&config.auth.secret);
        let revocation = RevocationStore::new(cache.clone());
        let sessions = SessionManager::new(cache.clone(), server_id);
        let activity = ActivityTracker::new();
        let rpc = RpcDispatcher::new(activity.clone());
        let socket_auth =
            SocketAuthenticator::new(config.auth.clone(), cache.clone(), sessions.clone());

        Ok(Self {
            config: Arc::new(config),
            cache,
            tokens,
            revocation,
            sessions,
            activity,
            rpc,
            socket_auth,
            server_id,
        })
    }

    /// The loaded configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The Key/Value Cache Facade.
    pub fn cache(&self) -> &Arc<CacheFacade> {
        &self.cache
    }

    /// The Token Verifier/Signer.
    pub fn tokens(&self) -> &TokenCodec {
        &self.tokens
    }

    /// The Revoked-Token Store.
    pub fn revocation(&self) -> &RevocationStore {
        &self.revocation
    }

    /// The User-Session Manager.
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// The in-flight Activity Tracker, shared with [`Self::rpc`].
    pub fn activity(&self) -> &ActivityTracker {
        &self.activity
    }

    /// The RPC Dispatcher.
    pub fn rpc(&self) -> &RpcDispatcher {
        &self.rpc
    }

    /// The socket authentication state machine.
    pub fn socket_auth(&self) -> &SocketAuthenticator {
        &self.socket_auth
    }

    /// This instance's id, attached to Local Sessions it owns.
    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    /// Begins a graceful shutdown: stop accepting new activity, then wait
    /// up to `drain_timeout` for in-flight RPC calls and transactions to
    /// finish.
    pub async fn pause_and_drain(&self, drain_timeout: std::time::Duration) -> bool {
        self.activity.pause();
        self.activity.drain(drain_timeout).await
    }
}
