use async_trait::async_trait;
use duochat_storage::{Storage, StorageError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

/// Seam over the external friendship store so the gate is testable
/// without a database.
#[async_trait]
pub trait FriendshipStore: Send + Sync {
    async fn are_friends(&self, user_a: &str, user_b: &str) -> Result<bool, StorageError>;
}

#[async_trait]
impl FriendshipStore for Storage {
    async fn are_friends(&self, user_a: &str, user_b: &str) -> Result<bool, StorageError> {
        Storage::are_friends(self, user_a, user_b).await
    }
}

struct CacheSlot {
    permitted: bool,
    cached_at: Instant,
}

/// Pure query over the friendship store: may these two users exchange
/// messages and calls. Verdicts are cached per normalized pair; store
/// errors are never cached and always deny.
pub struct FriendshipGate {
    store: Arc<dyn FriendshipStore>,
    cache: Mutex<HashMap<(String, String), CacheSlot>>,
    cache_ttl: Duration,
    call_timeout: Duration,
}

impl FriendshipGate {
    pub fn new(store: Arc<dyn FriendshipStore>, cache_ttl: Duration, call_timeout: Duration) -> Self {
        FriendshipGate {
            store,
            cache: Mutex::new(HashMap::new()),
            cache_ttl,
            call_timeout,
        }
    }

    /// Fails closed: a store error or timeout comes back as `Err` and the
    /// caller must surface an explicit error to the requester rather than
    /// silently dropping the request.
    pub async fn can_exchange(&self, user_a: &str, user_b: &str) -> Result<bool, StorageError> {
        let key = pair_key(user_a, user_b);
        {
            let cache = self.cache.lock().await;
            if let Some(slot) = cache.get(&key) {
                if slot.cached_at.elapsed() < self.cache_ttl {
                    return Ok(slot.permitted);
                }
            }
        }
        let verdict = match timeout(self.call_timeout, self.store.are_friends(user_a, user_b)).await
        {
            Ok(result) => result?,
            Err(_) => {
                debug!(a = user_a, b = user_b, "friendship lookup timed out");
                return Err(StorageError::Timeout);
            }
        };
        let mut cache = self.cache.lock().await;
        cache.insert(
            key,
            CacheSlot {
                permitted: verdict,
                cached_at: Instant::now(),
            },
        );
        Ok(verdict)
    }
}

fn pair_key(user_a: &str, user_b: &str) -> (String, String) {
    if user_a <= user_b {
        (user_a.to_string(), user_b.to_string())
    } else {
        (user_b.to_string(), user_a.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubStore {
        verdict: Result<bool, ()>,
        lookups: AtomicUsize,
    }

    impl StubStore {
        fn permitting(permitted: bool) -> Arc<Self> {
            Arc::new(StubStore {
                verdict: Ok(permitted),
                lookups: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(StubStore {
                verdict: Err(()),
                lookups: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl FriendshipStore for StubStore {
        async fn are_friends(&self, _a: &str, _b: &str) -> Result<bool, StorageError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.verdict.map_err(|_| StorageError::Postgres)
        }
    }

    fn gate(store: Arc<StubStore>, ttl: Duration) -> FriendshipGate {
        FriendshipGate::new(store, ttl, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn verdicts_are_cached_per_pair() {
        let store = StubStore::permitting(true);
        let gate = gate(Arc::clone(&store), Duration::from_secs(60));
        assert!(gate.can_exchange("1", "2").await.unwrap());
        // Reversed order hits the same normalized cache key.
        assert!(gate.can_exchange("2", "1").await.unwrap());
        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_cache_entries_are_refreshed() {
        let store = StubStore::permitting(false);
        let gate = gate(Arc::clone(&store), Duration::from_secs(0));
        assert!(!gate.can_exchange("1", "2").await.unwrap());
        assert!(!gate.can_exchange("1", "2").await.unwrap());
        assert_eq!(store.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn store_errors_fail_closed_and_are_not_cached() {
        let store = StubStore::failing();
        let gate = gate(Arc::clone(&store), Duration::from_secs(60));
        assert!(gate.can_exchange("1", "2").await.is_err());
        assert!(gate.can_exchange("1", "2").await.is_err());
        assert_eq!(store.lookups.load(Ordering::SeqCst), 2);
    }
}
