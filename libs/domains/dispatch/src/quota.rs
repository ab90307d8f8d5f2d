//! Per-provider daily quota tracking.
//!
//! Usage documents are keyed by provider id and carry the UTC day they
//! cover. The rollover to a new day happens lazily inside a store
//! transaction the first time a provider is touched on that day, so
//! there is no midnight cron to miss.
//!
//! Quota errors are fail-closed: if usage cannot be read or written the
//! error propagates and the provider is not considered sendable.

use crate::collections;
use crate::error::DispatchResult;
use crate::models::{to_doc, Provider, ProviderUsage};
use chrono::{DateTime, Utc};
use docstore::{DocumentStore, TxnDecision};
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct QuotaTracker {
    store: Arc<dyn DocumentStore>,
}

impl QuotaTracker {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// The UTC day key a usage document is scoped to.
    pub fn day_key(now: DateTime<Utc>) -> String {
        now.format("%Y-%m-%d").to_string()
    }

    /// Sends consumed by this provider today, rolling the usage document
    /// over to a fresh day if it is stale.
    pub async fn used_today(&self, provider_id: &str, now: DateTime<Utc>) -> DispatchResult<i64> {
        let today = Self::day_key(now);
        let mut used = 0i64;
        self.store
            .transact(
                collections::PROVIDER_USAGE,
                provider_id,
                Box::new(|current| {
                    match parse_usage(current) {
                        Some(usage) if usage.date == today => {
                            used = usage.used_today;
                            TxnDecision::Skip
                        }
                        // Missing, stale or unreadable: start the day at zero.
                        _ => {
                            used = 0;
                            TxnDecision::Write(to_doc(&ProviderUsage::fresh(&today)))
                        }
                    }
                }),
            )
            .await?;
        Ok(used)
    }

    /// Remaining quota for today, never negative.
    pub async fn remaining(&self, provider: &Provider, now: DateTime<Utc>) -> DispatchResult<i64> {
        let used = self.used_today(&provider.id, now).await?;
        Ok((provider.daily_quota - used).max(0))
    }

    /// Record one successful send. Returns the new used count.
    ///
    /// Only called after a delivery was accepted, so the increment must
    /// not be lost: callers retry this and escalate loudly on failure.
    pub async fn record_send(&self, provider_id: &str, now: DateTime<Utc>) -> DispatchResult<i64> {
        let today = Self::day_key(now);
        let mut used = 0i64;
        self.store
            .transact(
                collections::PROVIDER_USAGE,
                provider_id,
                Box::new(|current| {
                    let mut usage = match parse_usage(current) {
                        Some(usage) if usage.date == today => usage,
                        _ => ProviderUsage::fresh(&today),
                    };
                    usage.used_today += 1;
                    usage.consecutive_failures = 0;
                    usage.last_success_at = Some(now);
                    usage.last_increment_at = Some(now);
                    used = usage.used_today;
                    TxnDecision::Write(to_doc(&usage))
                }),
            )
            .await?;
        info!(provider = provider_id, used_today = used, "Recorded send against daily quota");
        Ok(used)
    }

    /// Record a failed attempt. Bookkeeping only; quota is not consumed
    /// by failures.
    pub async fn note_failure(&self, provider_id: &str, now: DateTime<Utc>) -> DispatchResult<()> {
        let today = Self::day_key(now);
        self.store
            .transact(
                collections::PROVIDER_USAGE,
                provider_id,
                Box::new(|current| {
                    let mut usage = match parse_usage(current) {
                        Some(usage) if usage.date == today => usage,
                        _ => ProviderUsage::fresh(&today),
                    };
                    usage.consecutive_failures += 1;
                    usage.last_failure_at = Some(now);
                    TxnDecision::Write(to_doc(&usage))
                }),
            )
            .await?;
        Ok(())
    }
}

fn parse_usage(current: Option<&docstore::Document>) -> Option<ProviderUsage> {
    current.and_then(|doc| serde_json::from_value(doc.clone()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProviderStatus;
    use chrono::{Duration, TimeZone};
    use docstore::testing::UnavailableStore;
    use docstore::MemoryStore;

    fn provider(quota: i64) -> Provider {
        Provider {
            id: "primary".to_string(),
            name: "Primary".to_string(),
            service_id: "svc_1".to_string(),
            template_id: "tpl_1".to_string(),
            public_key: "pk".to_string(),
            private_key: "sk".to_string(),
            status: ProviderStatus::Active,
            daily_quota: quota,
            priority: 1,
            is_default: true,
            updated_at: Utc::now(),
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 28, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_used_today_starts_at_zero() {
        let tracker = QuotaTracker::new(Arc::new(MemoryStore::new()));
        assert_eq!(tracker.used_today("primary", noon()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_record_send_increments() {
        let tracker = QuotaTracker::new(Arc::new(MemoryStore::new()));
        let now = noon();

        assert_eq!(tracker.record_send("primary", now).await.unwrap(), 1);
        assert_eq!(tracker.record_send("primary", now).await.unwrap(), 2);
        assert_eq!(tracker.used_today("primary", now).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_record_sends_lose_no_increments() {
        let tracker = QuotaTracker::new(Arc::new(MemoryStore::new()));
        let now = noon();

        let mut handles = Vec::new();
        for _ in 0..40 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                tracker.record_send("primary", now).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(tracker.used_today("primary", now).await.unwrap(), 40);
    }

    #[tokio::test]
    async fn test_day_rollover_resets_usage() {
        let tracker = QuotaTracker::new(Arc::new(MemoryStore::new()));
        let today = noon();
        let tomorrow = today + Duration::days(1);

        tracker.record_send("primary", today).await.unwrap();
        tracker.record_send("primary", today).await.unwrap();

        assert_eq!(tracker.used_today("primary", tomorrow).await.unwrap(), 0);
        // First send of the new day starts the counter over.
        assert_eq!(tracker.record_send("primary", tomorrow).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remaining_never_negative() {
        let tracker = QuotaTracker::new(Arc::new(MemoryStore::new()));
        let now = noon();
        let p = provider(1);

        tracker.record_send(&p.id, now).await.unwrap();
        tracker.record_send(&p.id, now).await.unwrap();

        assert_eq!(tracker.remaining(&p, now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failures_do_not_consume_quota() {
        let tracker = QuotaTracker::new(Arc::new(MemoryStore::new()));
        let now = noon();

        tracker.note_failure("primary", now).await.unwrap();
        tracker.note_failure("primary", now).await.unwrap();

        assert_eq!(tracker.used_today("primary", now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let store = Arc::new(MemoryStore::new());
        let tracker = QuotaTracker::new(store.clone());
        let now = noon();

        tracker.note_failure("primary", now).await.unwrap();
        tracker.record_send("primary", now).await.unwrap();

        let doc = store
            .get(collections::PROVIDER_USAGE, "primary")
            .await
            .unwrap()
            .unwrap();
        let usage: ProviderUsage = serde_json::from_value(doc).unwrap();
        assert_eq!(usage.consecutive_failures, 0);
        assert_eq!(usage.used_today, 1);
    }

    #[tokio::test]
    async fn test_quota_is_fail_closed() {
        let tracker = QuotaTracker::new(Arc::new(UnavailableStore::new()));
        assert!(tracker.used_today("primary", noon()).await.is_err());
        assert!(tracker.record_send("primary", noon()).await.is_err());
    }
}
