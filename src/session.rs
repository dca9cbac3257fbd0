//! User-Session Manager.
//!
//! Session state is split across two tiers:
//!
//! - **Local sessions** live only on the server instance a socket is
//!   connected to: which connections belong to `origin`, when it was last
//!   active. Cheap to touch on every inbound frame; gone if the instance
//!   restarts or the connection drops and nothing replaces it before the
//!   inactivity window lapses.
//! - **Cluster sessions** are the shared source of truth for "is `origin`
//!   still within its allowed active duration", written to the
//!   [`CacheFacade`] under `SESSION_<origin>` so every instance in the
//!   cluster agrees on it regardless of which one a given socket landed on.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use uuid::Uuid;

use crate::cache::CacheFacade;
use crate::error::{Error, Result};
use crate::ids::{ConnectionId, ServerId};
use crate::longtimeout::{self, LongTimeoutHandle};

/// Callback invoked when a Local session is destroyed (logout, inactivity
/// sweep, or explicit close), registered via
/// [`SessionManager::on_local_user_session_destroy`].
pub type DestroyCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

fn cluster_key(origin: &str) -> String {
    format!("SESSION_{}", origin)
}

/// Local, per-instance view of a session.
#[derive(Debug, Clone)]
pub struct LocalSession {
    /// Tenant/connection origin this session is keyed by.
    pub origin: String,
    /// Authenticated user id.
    pub user_id: String,
    /// The server instance currently hosting this session's connections.
    pub server_id: ServerId,
    /// Every socket connection currently attached to this session.
    pub connections: HashSet<ConnectionId>,
    /// Last time any activity was observed for this session.
    pub last_activity: Instant,
}

impl LocalSession {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Cluster-wide, cache-backed view of a session: the single fact every
/// server instance consults to decide whether `origin` is still allowed to
/// be active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSession {
    /// Tenant/connection origin this session is keyed by.
    pub origin: String,
    /// Authenticated user id.
    pub user_id: String,
    /// Unix seconds the session was first created.
    pub created_at: i64,
    /// Maximum total minutes this session may remain active before it must
    /// be re-authenticated.
    pub max_active_duration_mins: i64,
}

impl ClusterSession {
    fn elapsed_mins(&self, now: i64) -> i64 {
        ((now - self.created_at).max(0)) / 60
    }
}

/// Owns both session tiers and enforces the invariants relating them.
#[derive(Clone)]
pub struct SessionManager {
    local: Arc<DashMap<String, LocalSession>>,
    cache: Arc<CacheFacade>,
    server_id: ServerId,
    tenant_max_active_mins: Arc<DashMap<String, i64>>,
    destroy_callbacks: Arc<DashMap<Uuid, DestroyCallback>>,
    destroy_callback_seq: Arc<AtomicU64>,
    auto_logout: Arc<DashMap<String, LongTimeoutHandle>>,
}

impl SessionManager {
    /// Builds a manager backed by `cache` for the cluster tier, identifying
    /// this instance as `server_id` for `getServerInstanceId`.
    pub fn new(cache: Arc<CacheFacade>, server_id: ServerId) -> Self {
        Self {
            local: Arc::new(DashMap::new()),
            cache,
            server_id,
            tenant_max_active_mins: Arc::new(DashMap::new()),
            destroy_callbacks: Arc::new(DashMap::new()),
            destroy_callback_seq: Arc::new(AtomicU64::new(0)),
            auto_logout: Arc::new(DashMap::new()),
        }
    }

    /// This server instance's id, as reported to peers via the cluster
    /// store.
    pub fn server_instance_id(&self) -> ServerId {
        self.server_id
    }

    /// Overrides the maximum active session duration for `tenant_id`,
    /// superseding [`crate::config::AuthConfig::tenant_session_timeout_default_mins`]
    /// for that tenant only.
    pub fn set_tenant_maximum_active_session_timeout(&self, tenant_id: &str, mins: i64) {
        self.tenant_max_active_mins.insert(tenant_id.to_string(), mins);
    }

    /// The tenant-specific override set via
    /// [`Self::set_tenant_maximum_active_session_timeout`], if any.
    pub fn tenant_maximum_active_session_timeout_in_mins(&self, tenant_id: &str) -> Option<i64> {
        self.tenant_max_active_mins.get(tenant_id).map(|v| *v)
    }

    /// Registers a callback invoked with `(origin, user_id)` whenever a
    /// Local session is destroyed (explicit `logout`/[`Self::close`], or
    /// the inactivity sweep). Returns an unsubscribe closure.
    pub fn on_local_user_session_destroy<F>(&self, callback: F) -> impl FnOnce() + '_
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        let id = Uuid::from_u64_pair(
            self.destroy_callback_seq.fetch_add(1, Ordering::SeqCst),
            0,
        );
        self.destroy_callbacks.insert(id, Arc::new(callback));
        move || {
            self.destroy_callbacks.remove(&id);
        }
    }

    fn fire_destroy_callbacks(&self, origin: &str, user_id: &str) {
        for entry in self.destroy_callbacks.iter() {
            (entry.value())(origin, user_id);
        }
    }

    /// Arms this session's auto-logout: `origin` is force-closed once
    /// `remaining_secs` elapses. Any handle already armed for `origin` is
    /// cancelled first, so the chain never has two timers racing.
    ///
    /// `remaining_secs <= 0` logs the session out immediately instead of
    /// scheduling, matching a Cluster session whose deadline has already
    /// passed by the time it's (re)read.
    fn arm_auto_logout(&self, origin: &str, remaining_secs: i64) {
        if let Some((_, handle)) = self.auto_logout.remove(origin) {
            handle.cancel();
        }

        if remaining_secs <= 0 {
            let manager = self.clone();
            let origin = origin.to_string();
            tokio::spawn(async move {
                let _ = manager.close(&origin).await;
            });
            return;
        }

        let manager = self.clone();
        let origin_owned = origin.to_string();
        let handle = longtimeout::schedule_async(
            Duration::from_secs(remaining_secs as u64),
            None,
            move || {
                let manager = manager.clone();
                let origin = origin_owned.clone();
                async move {
                    let _ = manager.close(&origin).await;
                }
            },
        );
        self.auto_logout.insert(origin.to_string(), handle);
    }

    /// Cancels and removes any auto-logout timer armed for `origin`,
    /// without touching either session tier.
    fn clear_auto_logout(&self, origin: &str) {
        if let Some((_, handle)) = self.auto_logout.remove(origin) {
            handle.cancel();
        }
    }

    /// Whether `user_id` has at least one Local session on this instance.
    /// Answers "is this the instance currently hosting `user_id`" directly
    /// (true means locally owned), rather than the inverted test the
    /// membership check could naively be written as.
    pub fn is_local_user_session(&self, user_id: &str) -> bool {
        self.local.iter().any(|e| e.user_id == user_id)
    }

    /// Number of Local sessions (distinct origins) currently attributed to
    /// `user_id` on this instance.
    pub fn count_local_sessions_by_user_id(&self, user_id: &str) -> usize {
        self.local.iter().filter(|e| e.user_id == user_id).count()
    }

    /// Every Local session currently attributed to `user_id` on this
    /// instance.
    pub fn get_local_user_sessions(&self, user_id: &str) -> Vec<LocalSession> {
        self.local
            .iter()
            .filter(|e| e.user_id == user_id)
            .map(|e| e.clone())
            .collect()
    }

    /// Attaches `connection_id` to the Local session for `origin`, creating
    /// it if absent.
    pub fn attach_connection(
        &self,
        origin: &str,
        server_id: ServerId,
        user_id: &str,
        connection_id: ConnectionId,
    ) {
        let mut entry = self
            .local
            .entry(origin.to_string())
            .or_insert_with(|| LocalSession {
                origin: origin.to_string(),
                user_id: user_id.to_string(),
                server_id,
                connections: HashSet::new(),
                last_activity: Instant::now(),
            });
        entry.connections.insert(connection_id);
        entry.touch();
    }

    /// Detaches `connection_id` from `origin`'s Local session. The session
    /// itself is left in place (possibly with zero connections) until the
    /// inactivity sweep reclaims it, so a quick reconnect doesn't lose
    /// last-activity bookkeeping.
    pub fn detach_connection(&self, origin: &str, connection_id: ConnectionId) {
        if let Some(mut session) = self.local.get_mut(origin) {
            session.connections.remove(&connection_id);
        }
    }

    /// Records activity on `origin`'s Local session, resetting its
    /// inactivity clock. No-op if no Local session exists.
    pub fn touch(&self, origin: &str) {
        if let Some(mut session) = self.local.get_mut(origin) {
            session.touch();
        }
    }

    /// Reads the current Local session for `origin`, if any.
    pub fn local_session(&self, origin: &str) -> Option<LocalSession> {
        self.local.get(origin).map(|e| e.clone())
    }

    /// Removes every Local session idle for longer than `inactive_after`
    /// with no attached connections. Returns the origins removed.
    pub fn sweep_inactive_local(&self, inactive_after: Duration) -> Vec<String> {
        let now = Instant::now();
        let dead: Vec<(String, String)> = self
            .local
            .iter()
            .filter(|e| {
                e.connections.is_empty() && now.duration_since(e.last_activity) >= inactive_after
            })
            .map(|e| (e.key().clone(), e.user_id.clone()))
            .collect();

        for (origin, user_id) in &dead {
            self.local.remove(origin);
            self.fire_destroy_callbacks(origin, user_id);
        }
        dead.into_iter().map(|(origin, _)| origin).collect()
    }

    /// Runs [`Self::sweep_inactive_local`] on a fixed interval until the
    /// returned task is aborted. Intended to be spawned once at startup.
    pub fn spawn_local_sweep(&self, inactive_after: Duration, interval: Duration) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                sleep(interval).await;
                let removed = manager.sweep_inactive_local(inactive_after);
                if !removed.is_empty() {
                    tracing::debug!(count = removed.len(), "swept inactive local sessions");
                }
            }
        })
    }

    /// Creates the Cluster session for `origin` if none exists, or
    /// validates `max_active_duration_mins` against the existing one.
    ///
    /// Per the wire contract, lowering `maxActiveDuration` below the
    /// session's already-elapsed duration is rejected rather than silently
    /// truncating an in-progress session.
    pub async fn open_cluster_session(
        &self,
        origin: &str,
        user_id: &str,
        max_active_duration_mins: i64,
    ) -> Result<ClusterSession> {
        let key = cluster_key(origin);
        let now = chrono::Utc::now().timestamp();

        if let Some(existing) = self.cluster_session(origin).await? {
            if existing.user_id == user_id {
                if max_active_duration_mins < existing.elapsed_mins(now) {
                    return Err(Error::ActiveSessionDurationDecreased);
                }
                let refreshed = ClusterSession {
                    max_active_duration_mins,
                    ..existing
                };
                self.write_cluster_session(&key, &refreshed).await?;
                return Ok(refreshed);
            }
            // A different user now owns this origin; the cluster entry is
            // overwritten rather than merged (invariant I2).
        }

        let session = ClusterSession {
            origin: origin.to_string(),
            user_id: user_id.to_string(),
            created_at: now,
            max_active_duration_mins,
        };
        self.write_cluster_session(&key, &session).await?;
        // Rearmed only on first create; a refresh of an existing session
        // (above) leaves its original deadline's timer untouched.
        self.arm_auto_logout(origin, max_active_duration_mins * 60);
        Ok(session)
    }

    async fn write_cluster_session(&self, key: &str, session: &ClusterSession) -> Result<()> {
        let encoded = serde_json::to_string(session)
            .map_err(|e| Error::Internal(format!("failed to encode cluster session: {}", e)))?;
        let ttl = Duration::from_secs((session.max_active_duration_mins.max(1) * 60) as u64);
        self.cache.setex(key, &encoded, ttl).await
    }

    /// Reads the Cluster session for `origin`, if any and unexpired.
    pub async fn cluster_session(&self, origin: &str) -> Result<Option<ClusterSession>> {
        let raw = self.cache.get(&cluster_key(origin)).await?;
        match raw {
            Some(raw) => {
                let session: ClusterSession = serde_json::from_str(&raw).map_err(|e| {
                    Error::Internal(format!("failed to decode cluster session: {}", e))
                })?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    /// Whether `origin` is still within its allowed active duration
    /// according to the Cluster session. Returns
    /// [`Error::InactiveSessionOrNotFound`] if no Cluster session exists.
    pub async fn validate_active(&self, origin: &str) -> Result<()> {
        let session = self
            .cluster_session(origin)
            .await?
            .ok_or(Error::InactiveSessionOrNotFound)?;
        let now = chrono::Utc::now().timestamp();
        if session.elapsed_mins(now) > session.max_active_duration_mins {
            return Err(Error::InactiveSessionOrNotFound);
        }
        Ok(())
    }

    /// Ends the session for `origin` on both tiers, notifying any
    /// registered destroy callbacks.
    pub async fn close(&self, origin: &str) -> Result<()> {
        self.clear_auto_logout(origin);
        if let Some((_, session)) = self.local.remove(origin) {
            self.fire_destroy_callbacks(origin, &session.user_id);
        }
        self.cache.delete(&cluster_key(origin)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(CacheFacade::local()), ServerId::new())
    }

    #[test]
    fn attach_then_detach_connection() {
        let manager = manager();
        let server_id = ServerId::new();
        let conn = ConnectionId::new();
        manager.attach_connection("origin-1", server_id, "user-1", conn);
        let session = manager.local_session("origin-1").unwrap();
        assert!(session.connections.contains(&conn));

        manager.detach_connection("origin-1", conn);
        let session = manager.local_session("origin-1").unwrap();
        assert!(session.connections.is_empty());
    }

    #[test]
    fn sweep_only_removes_idle_disconnected_sessions() {
        let manager = manager();
        let server_id = ServerId::new();
        manager.attach_connection("idle", server_id, "user-1", ConnectionId::new());
        manager.detach_connection("idle", ConnectionId::new());

        let conn = ConnectionId::new();
        manager.attach_connection("busy", server_id, "user-2", conn);

        let removed = manager.sweep_inactive_local(Duration::from_secs(0));
        assert!(removed.contains(&"idle".to_string()));
        assert!(!removed.contains(&"busy".to_string()));
    }

    #[tokio::test]
    async fn open_cluster_session_then_validate() {
        let manager = manager();
        manager
            .open_cluster_session("origin-1", "user-1", 60)
            .await
            .unwrap();
        manager.validate_active("origin-1").await.unwrap();
    }

    #[tokio::test]
    async fn validate_missing_session_is_inactive() {
        let manager = manager();
        assert!(matches!(
            manager.validate_active("missing").await,
            Err(Error::InactiveSessionOrNotFound)
        ));
    }

    #[tokio::test]
    async fn decreasing_max_active_duration_below_elapsed_is_rejected() {
        let manager = manager();
        let key = cluster_key("origin-1");
        let stale = ClusterSession {
            origin: "origin-1".to_string(),
            user_id: "user-1".to_string(),
            created_at: chrono::Utc::now().timestamp() - 120,
            max_active_duration_mins: 60,
        };
        manager.write_cluster_session(&key, &stale).await.unwrap();

        let result = manager.open_cluster_session("origin-1", "user-1", 1).await;
        assert!(matches!(
            result,
            Err(Error::ActiveSessionDurationDecreased)
        ));
    }

    #[tokio::test]
    async fn close_removes_both_tiers() {
        let manager = manager();
        manager.attach_connection("origin-1", ServerId::new(), "user-1", ConnectionId::new());
        manager
            .open_cluster_session("origin-1", "user-1", 60)
            .await
            .unwrap();

        manager.close("origin-1").await.unwrap();

        assert!(manager.local_session("origin-1").is_none());
        assert!(manager.cluster_session("origin-1").await.unwrap().is_none());
    }

    #[test]
    fn is_local_user_session_reflects_membership_directly() {
        let manager = manager();
        assert!(!manager.is_local_user_session("user-1"));

        manager.attach_connection("origin-1", ServerId::new(), "user-1", ConnectionId::new());
        assert!(manager.is_local_user_session("user-1"));
        assert!(!manager.is_local_user_session("user-2"));
    }

    #[test]
    fn counts_and_lists_sessions_by_user_id() {
        let manager = manager();
        manager.attach_connection("origin-1", ServerId::new(), "user-1", ConnectionId::new());
        manager.attach_connection("origin-2", ServerId::new(), "user-1", ConnectionId::new());
        manager.attach_connection("origin-3", ServerId::new(), "user-2", ConnectionId::new());

        assert_eq!(manager.count_local_sessions_by_user_id("user-1"), 2);
        assert_eq!(manager.get_local_user_sessions("user-1").len(), 2);
        assert_eq!(manager.count_local_sessions_by_user_id("user-2"), 1);
    }

    #[test]
    fn tenant_override_beats_no_override() {
        let manager = manager();
        assert!(manager
            .tenant_maximum_active_session_timeout_in_mins("tenant-1")
            .is_none());

        manager.set_tenant_maximum_active_session_timeout("tenant-1", 30);
        assert_eq!(
            manager.tenant_maximum_active_session_timeout_in_mins("tenant-1"),
            Some(30)
        );
    }

    #[test]
    fn destroy_callback_fires_on_close_and_stops_after_unsubscribe() {
        use std::sync::atomic::{AtomicUsize, Ordering as AOrdering};
        let manager = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let unsubscribe = manager.on_local_user_session_destroy(move |_origin, _user_id| {
            calls_clone.fetch_add(1, AOrdering::SeqCst);
        });

        manager.attach_connection("origin-1", ServerId::new(), "user-1", ConnectionId::new());
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(manager.close("origin-1")).unwrap();
        assert_eq!(calls.load(AOrdering::SeqCst), 1);

        unsubscribe();
        manager.attach_connection("origin-2", ServerId::new(), "user-1", ConnectionId::new());
        rt.block_on(manager.close("origin-2")).unwrap();
        assert_eq!(calls.load(AOrdering::SeqCst), 1);
    }
}
