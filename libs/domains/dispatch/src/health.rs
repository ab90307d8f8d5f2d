//! Periodic self-repair.
//!
//! Finds state that only goes wrong when a worker dies mid-flight or a
//! transition write is lost: jobs stuck in processing past their lease,
//! circuits stuck open far beyond any sane cooldown, and stale usage
//! documents from previous days. Each sweep fixes what it can and
//! reports what it saw.

use crate::collections;
use crate::error::DispatchResult;
use crate::models::{to_doc, CircuitState, CircuitStatus, DisasterStatus, JobStatus, MailJob};
use crate::quota::QuotaTracker;
use chrono::{DateTime, Duration, Utc};
use core_config::dispatch::DispatchTuning;
use docstore::{DocumentStore, Query, TxnDecision};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// An open circuit older than this gets forced half-open.
    pub breaker_max_open: Duration,
}

impl From<&DispatchTuning> for HealthConfig {
    fn from(tuning: &DispatchTuning) -> Self {
        Self {
            breaker_max_open: Duration::seconds(tuning.breaker_max_open_secs as i64),
        }
    }
}

/// What one health sweep found and repaired.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub pending_jobs: u64,
    pub processing_jobs: u64,
    pub disaster_pending: u64,
    /// Jobs returned to pending after their lease expired.
    pub reclaimed_jobs: u64,
    /// Circuits forced half-open after being open too long.
    pub circuits_forced: u64,
    /// Usage documents still carrying a previous day.
    pub stale_usage_docs: u64,
}

#[derive(Clone)]
pub struct HealthCheck {
    store: Arc<dyn DocumentStore>,
    config: HealthConfig,
}

impl HealthCheck {
    pub fn new(store: Arc<dyn DocumentStore>, config: HealthConfig) -> Self {
        Self { store, config }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> DispatchResult<HealthReport> {
        let mut report = HealthReport {
            reclaimed_jobs: self.reclaim_stuck_jobs(now).await?,
            circuits_forced: self.force_stuck_circuits(now).await?,
            stale_usage_docs: self.count_stale_usage(now).await?,
            ..HealthReport::default()
        };

        report.pending_jobs = self.count_jobs(JobStatus::Pending).await?;
        report.processing_jobs = self.count_jobs(JobStatus::Processing).await?;
        report.disaster_pending = self
            .store
            .query(
                collections::DISASTER_BANK,
                Query::new().filter_eq("status", DisasterStatus::PendingRecovery.as_str()),
            )
            .await?
            .len() as u64;

        info!(
            pending = report.pending_jobs,
            processing = report.processing_jobs,
            disaster_pending = report.disaster_pending,
            reclaimed = report.reclaimed_jobs,
            circuits_forced = report.circuits_forced,
            stale_usage = report.stale_usage_docs,
            "Health sweep complete"
        );
        Ok(report)
    }

    /// Return processing jobs with expired leases to pending. Attempts
    /// already consumed stay consumed, so a crash-looping job still
    /// reaches its ceiling.
    async fn reclaim_stuck_jobs(&self, now: DateTime<Utc>) -> DispatchResult<u64> {
        let stuck = self
            .store
            .query(
                collections::MAIL_JOBS,
                Query::new()
                    .filter_eq("status", JobStatus::Processing.as_str())
                    .filter_lte("lease_expires_at", now.timestamp_millis()),
            )
            .await?;

        let mut reclaimed = 0;
        for record in stuck {
            let mut did_reclaim = false;
            let result = self
                .store
                .transact(
                    collections::MAIL_JOBS,
                    &record.id,
                    Box::new(|current| {
                        let job: Option<MailJob> =
                            current.and_then(|doc| serde_json::from_value(doc.clone()).ok());
                        match job {
                            Some(mut job)
                                if job.status == JobStatus::Processing
                                    && job.lease_expires_at.is_some_and(|t| t <= now) =>
                            {
                                job.status = JobStatus::Pending;
                                job.lease_expires_at = None;
                                did_reclaim = true;
                                TxnDecision::Write(to_doc(&job))
                            }
                            _ => TxnDecision::Skip,
                        }
                    }),
                )
                .await;
            match result {
                Ok(_) if did_reclaim => {
                    warn!(job = %record.id, "Reclaimed job from dead worker");
                    reclaimed += 1;
                }
                Ok(_) => {}
                Err(err) => error!(job = %record.id, error = %err, "Failed to reclaim job"),
            }
        }
        Ok(reclaimed)
    }

    /// Force circuits that have been open past the maximum into
    /// half-open so the next send probes the provider again.
    async fn force_stuck_circuits(&self, now: DateTime<Utc>) -> DispatchResult<u64> {
        let open = self
            .store
            .query(
                collections::CIRCUIT_STATES,
                Query::new().filter_eq("status", CircuitStatus::Open.as_str()),
            )
            .await?;

        let max_open = self.config.breaker_max_open;
        let mut forced = 0;
        for record in open {
            let mut did_force = false;
            let result = self
                .store
                .transact(
                    collections::CIRCUIT_STATES,
                    &record.id,
                    Box::new(|current| {
                        let state: Option<CircuitState> =
                            current.and_then(|doc| serde_json::from_value(doc.clone()).ok());
                        match state {
                            Some(state)
                                if state.status == CircuitStatus::Open
                                    && state
                                        .last_failure_at
                                        .is_some_and(|t| now - t > max_open) =>
                            {
                                did_force = true;
                                TxnDecision::Write(to_doc(&CircuitState {
                                    status: CircuitStatus::HalfOpen,
                                    failure_count: state.failure_count,
                                    last_failure_at: state.last_failure_at,
                                    next_try_at: None,
                                }))
                            }
                            _ => TxnDecision::Skip,
                        }
                    }),
                )
                .await;
            match result {
                Ok(_) if did_force => {
                    warn!(provider = %record.id, "Circuit stuck open too long, forced half-open");
                    forced += 1;
                }
                Ok(_) => {}
                Err(err) => {
                    error!(provider = %record.id, error = %err, "Failed to force circuit half-open")
                }
            }
        }
        Ok(forced)
    }

    /// Stale usage documents are only counted; they roll over lazily the
    /// next time their provider is considered for a send.
    async fn count_stale_usage(&self, now: DateTime<Utc>) -> DispatchResult<u64> {
        let today = QuotaTracker::day_key(now);
        let usage = self
            .store
            .query(collections::PROVIDER_USAGE, Query::new())
            .await?;
        Ok(usage
            .iter()
            .filter(|record| {
                record.doc.get("date").and_then(|v| v.as_str()) != Some(today.as_str())
            })
            .count() as u64)
    }

    async fn count_jobs(&self, status: JobStatus) -> DispatchResult<u64> {
        let records = self
            .store
            .query(
                collections::MAIL_JOBS,
                Query::new().filter_eq("status", status.as_str()),
            )
            .await?;
        Ok(records.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use docstore::MemoryStore;
    use serde_json::json;

    fn check(store: Arc<MemoryStore>) -> HealthCheck {
        HealthCheck::new(
            store,
            HealthConfig {
                breaker_max_open: Duration::seconds(3600),
            },
        )
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 28, 12, 0, 0).unwrap()
    }

    fn job_doc(id: &str, status: &str, lease_ms: Option<i64>) -> docstore::Document {
        json!({
            "id": id,
            "kind": "event_reminder",
            "to_email": "guest@example.com",
            "to_name": "Guest",
            "subject": "Hi",
            "body_template": "Hi",
            "variables": {},
            "status": status,
            "scheduled_time": noon().timestamp_millis() - 60_000,
            "attempts": 2,
            "max_attempts": 5,
            "lease_expires_at": lease_ms,
            "idempotency_key": id,
            "created_at": noon().timestamp_millis() - 120_000,
        })
    }

    #[tokio::test]
    async fn test_reclaims_expired_leases_only() {
        let store = Arc::new(MemoryStore::new());
        let now = noon();
        let expired = now.timestamp_millis() - 1_000;
        let live = now.timestamp_millis() + 60_000;
        store
            .set(collections::MAIL_JOBS, "dead", job_doc("dead", "processing", Some(expired)))
            .await
            .unwrap();
        store
            .set(collections::MAIL_JOBS, "alive", job_doc("alive", "processing", Some(live)))
            .await
            .unwrap();

        let report = check(store.clone()).run(now).await.unwrap();
        assert_eq!(report.reclaimed_jobs, 1);

        let dead: MailJob = serde_json::from_value(
            store.get(collections::MAIL_JOBS, "dead").await.unwrap().unwrap(),
        )
        .unwrap();
        assert_eq!(dead.status, JobStatus::Pending);
        assert_eq!(dead.attempts, 2);
        assert!(dead.lease_expires_at.is_none());

        let alive: MailJob = serde_json::from_value(
            store.get(collections::MAIL_JOBS, "alive").await.unwrap().unwrap(),
        )
        .unwrap();
        assert_eq!(alive.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_forces_circuits_stuck_open() {
        let store = Arc::new(MemoryStore::new());
        let now = noon();
        let old_failure = now - Duration::seconds(7200);
        store
            .set(
                collections::CIRCUIT_STATES,
                "primary",
                to_doc(&CircuitState {
                    status: CircuitStatus::Open,
                    failure_count: 9,
                    last_failure_at: Some(old_failure),
                    next_try_at: Some(old_failure + Duration::seconds(120)),
                }),
            )
            .await
            .unwrap();
        // Recently opened circuit stays as-is.
        store
            .set(
                collections::CIRCUIT_STATES,
                "secondary",
                to_doc(&CircuitState {
                    status: CircuitStatus::Open,
                    failure_count: 5,
                    last_failure_at: Some(now - Duration::seconds(60)),
                    next_try_at: Some(now + Duration::seconds(60)),
                }),
            )
            .await
            .unwrap();

        let report = check(store.clone()).run(now).await.unwrap();
        assert_eq!(report.circuits_forced, 1);

        let primary: CircuitState = serde_json::from_value(
            store
                .get(collections::CIRCUIT_STATES, "primary")
                .await
                .unwrap()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(primary.status, CircuitStatus::HalfOpen);
    }

    #[tokio::test]
    async fn test_counts_stale_usage_and_queue_depth() {
        let store = Arc::new(MemoryStore::new());
        let now = noon();
        store
            .set(
                collections::PROVIDER_USAGE,
                "primary",
                json!({"date": "2026-02-27", "used_today": 40}),
            )
            .await
            .unwrap();
        store
            .set(
                collections::PROVIDER_USAGE,
                "backup",
                json!({"date": "2026-02-28", "used_today": 3}),
            )
            .await
            .unwrap();
        store
            .set(collections::MAIL_JOBS, "j1", job_doc("j1", "pending", None))
            .await
            .unwrap();

        let report = check(store).run(now).await.unwrap();
        assert_eq!(report.stale_usage_docs, 1);
        assert_eq!(report.pending_jobs, 1);
        assert_eq!(report.processing_jobs, 0);
    }
}
