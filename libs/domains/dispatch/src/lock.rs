//! Distributed locks over the document store.
//!
//! One document per lock key. Acquisition is a single store transaction
//! that either writes a fresh lease or aborts because a live one exists;
//! an expired lease is stolen in place rather than deleted first, so
//! there is no window where two workers both see the key free.
//!
//! Lock errors are fail-closed. A worker that cannot talk to the lock
//! backend must not assume it holds the lock.

use crate::collections;
use crate::error::{DispatchError, DispatchResult};
use crate::models::{to_doc, LockRecord};
use chrono::{DateTime, Duration, Utc};
use docstore::{DocumentStore, TxnDecision, TxnOutcome};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn DocumentStore>,
}

impl LockManager {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Try to take the lock. Returns `false` when another worker holds
    /// a live lease.
    pub async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> DispatchResult<bool> {
        let record = LockRecord {
            key: key.to_string(),
            acquired_at: now,
            expires_at: now + ttl,
            ttl_secs: ttl.num_seconds().max(0) as u64,
        };

        let outcome = self
            .store
            .transact(
                collections::LOCKS,
                key,
                Box::new(|current| {
                    let live = current
                        .and_then(|doc| serde_json::from_value::<LockRecord>(doc.clone()).ok())
                        .is_some_and(|existing| existing.expires_at > now);
                    if live {
                        TxnDecision::Abort
                    } else {
                        TxnDecision::Write(to_doc(&record))
                    }
                }),
            )
            .await
            .map_err(|err| DispatchError::LockBackend {
                key: key.to_string(),
                detail: err.to_string(),
            })?;

        Ok(outcome == TxnOutcome::Committed)
    }

    /// Release the lock by deleting its document.
    pub async fn release(&self, key: &str) -> DispatchResult<()> {
        self.store
            .delete(collections::LOCKS, key)
            .await
            .map_err(|err| DispatchError::LockBackend {
                key: key.to_string(),
                detail: err.to_string(),
            })
    }

    /// Run `work` under the lock, releasing it afterwards whether the
    /// work succeeded or failed. A failed release is logged and left to
    /// lease expiry.
    pub async fn run_with_lock<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        now: DateTime<Utc>,
        work: F,
    ) -> DispatchResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DispatchResult<T>>,
    {
        if !self.acquire(key, ttl, now).await? {
            return Err(DispatchError::LockConflict {
                key: key.to_string(),
            });
        }
        debug!(key, "Lock acquired");

        let result = work().await;

        if let Err(err) = self.release(key).await {
            warn!(key, error = %err, "Failed to release lock; lease will expire");
        } else {
            debug!(key, "Lock released");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use docstore::testing::UnavailableStore;
    use docstore::MemoryStore;

    fn manager() -> (LockManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (LockManager::new(store.clone()), store)
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 28, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_second_acquire_is_refused() {
        let (locks, _) = manager();
        let now = noon();
        assert!(locks.acquire("queue", Duration::seconds(120), now).await.unwrap());
        assert!(!locks.acquire("queue", Duration::seconds(120), now).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_is_stolen() {
        let (locks, _) = manager();
        let now = noon();
        assert!(locks.acquire("queue", Duration::seconds(120), now).await.unwrap());

        let later = now + Duration::seconds(121);
        assert!(locks.acquire("queue", Duration::seconds(120), later).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_frees_the_key() {
        let (locks, _) = manager();
        let now = noon();
        assert!(locks.acquire("queue", Duration::seconds(120), now).await.unwrap());
        locks.release("queue").await.unwrap();
        assert!(locks.acquire("queue", Duration::seconds(120), now).await.unwrap());
    }

    #[tokio::test]
    async fn test_backend_outage_is_not_a_conflict() {
        let locks = LockManager::new(Arc::new(UnavailableStore::new()));
        let err = locks
            .acquire("queue", Duration::seconds(120), noon())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::LockBackend { .. }));
    }

    #[tokio::test]
    async fn test_run_with_lock_releases_after_failure() {
        let (locks, _) = manager();
        let now = noon();

        let result: DispatchResult<()> = locks
            .run_with_lock("queue", Duration::seconds(120), now, || async {
                Err(DispatchError::Internal("work blew up".to_string()))
            })
            .await;
        assert!(result.is_err());

        // The failed run released the lock.
        assert!(locks.acquire("queue", Duration::seconds(120), now).await.unwrap());
    }

    #[tokio::test]
    async fn test_run_with_lock_conflict() {
        let (locks, _) = manager();
        let now = noon();
        assert!(locks.acquire("queue", Duration::seconds(120), now).await.unwrap());

        let result = locks
            .run_with_lock("queue", Duration::seconds(120), now, || async { Ok(42) })
            .await;
        assert!(matches!(result, Err(DispatchError::LockConflict { .. })));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_admits_exactly_one() {
        let (locks, _) = manager();
        let now = noon();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let locks = locks.clone();
            handles.push(tokio::spawn(async move {
                locks.acquire("queue", Duration::seconds(120), now).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
