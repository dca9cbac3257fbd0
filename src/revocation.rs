//! Revoked-Token Store.
//!
//! A thin, single-purpose wrapper over the [`CacheFacade`]: revoking a token
//! stores a marker under `REVOK_TOK_<token>` with a TTL, checking revocation
//! is a single existence lookup. No independent storage of its own — it
//! rides whichever backend ([`CacheFacade::Local`] or
//! [`CacheFacade::Cluster`]) the server was started with, so a revocation
//! recorded on one instance is visible cluster-wide exactly when the
//! Cluster backend is.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::CacheFacade;
use crate::error::Result;

const KEY_PREFIX: &str = "REVOK_TOK_";

fn revocation_key(token: &str) -> String {
    format!("{}{}", KEY_PREFIX, token)
}

/// Records and checks revoked tokens.
#[derive(Clone)]
pub struct RevocationStore {
    cache: Arc<CacheFacade>,
}

impl RevocationStore {
    /// Builds a store backed by `cache`.
    pub fn new(cache: Arc<CacheFacade>) -> Self {
        Self { cache }
    }

    /// Marks `token` as revoked until `exp` (unix seconds), or a no-op if
    /// `exp` has already passed. The TTL is clamped to at least one minute
    /// and at least `refresh_interval_mins * 1.05`, so a revocation always
    /// outlives the refresh cadence even under clock skew between
    /// instances.
    pub async fn revoke(&self, token: &str, exp: i64, refresh_interval_mins: i64) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        if exp <= now {
            return Ok(());
        }

        let remaining_mins = ((exp - now) as f64 / 60.0).ceil() as i64;
        let floor_mins = ((refresh_interval_mins as f64) * 1.05).ceil() as i64;
        let ttl_mins = remaining_mins.max(floor_mins).max(1);
        let ttl = Duration::from_secs((ttl_mins * 60) as u64);
        self.cache.setex(&revocation_key(token), "true", ttl).await
    }

    /// Whether `token` has been revoked and the entry hasn't expired.
    pub async fn is_revoked(&self, token: &str) -> Result<bool> {
        self.cache.exists(&revocation_key(token)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> RevocationStore {
        RevocationStore::new(Arc::new(CacheFacade::local()))
    }

    #[tokio::test]
    async fn revoking_a_token_makes_it_revoked() {
        let store = store();
        let exp = chrono::Utc::now().timestamp() + 300;
        assert!(!store.is_revoked("tok-1").await.unwrap());
        store.revoke("tok-1", exp, 1440).await.unwrap();
        assert!(store.is_revoked("tok-1").await.unwrap());
    }

    #[tokio::test]
    async fn already_expired_token_is_not_stored() {
        let store = store();
        let exp = chrono::Utc::now().timestamp() - 10;
        store.revoke("tok-2", exp, 1440).await.unwrap();
        assert!(!store.is_revoked("tok-2").await.unwrap());
    }

    #[tokio::test]
    async fn distinct_tokens_are_independent() {
        let store = store();
        let exp = chrono::Utc::now().timestamp() + 60;
        store.revoke("tok-a", exp, 1440).await.unwrap();
        assert!(store.is_revoked("tok-a").await.unwrap());
        assert!(!store.is_revoked("tok-b").await.unwrap());
    }
}
