use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lexlead_store::AccountGrant;
use tokio::sync::RwLock;

/// TTL cache in front of the authoritative `lexlead_accounts` role lookup.
/// A TTL of zero or a zero entry cap disables caching entirely; a stale
/// hit is bounded by the TTL, and sign-out invalidates eagerly.
#[derive(Clone)]
pub struct PermissionCache {
    cache: Arc<RwLock<HashMap<String, CachedGrant>>>,
    max_entries: usize,
    ttl: Duration,
}

#[derive(Clone)]
struct CachedGrant {
    grant: AccountGrant,
    expires_at: Instant,
}

impl PermissionCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            max_entries,
            ttl,
        }
    }

    pub fn enabled(&self) -> bool {
        self.max_entries > 0 && self.ttl > Duration::ZERO
    }

    pub async fn get(&self, account_id: &str) -> Option<AccountGrant> {
        if !self.enabled() {
            return None;
        }

        let now = Instant::now();
        let cache = self.cache.read().await;
        cache
            .get(account_id)
            .and_then(|entry| (entry.expires_at > now).then(|| entry.grant))
    }

    pub async fn put(&self, account_id: &str, grant: AccountGrant) {
        if !self.enabled() {
            return;
        }

        let now = Instant::now();
        let expires_at = now + self.ttl;
        let mut cache = self.cache.write().await;

        cache.retain(|_, entry| entry.expires_at > now);
        cache.insert(account_id.to_string(), CachedGrant { grant, expires_at });

        if cache.len() <= self.max_entries {
            return;
        }

        let mut overflow = cache.len() - self.max_entries;
        let keys = cache.keys().cloned().collect::<Vec<_>>();
        for k in keys {
            if overflow == 0 {
                break;
            }
            if cache.remove(&k).is_some() {
                overflow -= 1;
            }
        }
    }

    pub async fn invalidate(&self, account_id: &str) {
        let mut cache = self.cache.write().await;
        cache.remove(account_id);
    }
}
