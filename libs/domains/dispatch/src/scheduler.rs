//! Idempotent mail job queue.
//!
//! Jobs are enqueued with a caller-supplied idempotency key and drained
//! in scheduled order. Every state transition goes through a store
//! transaction keyed by the job id, so concurrent drains can overlap a
//! batch without double-sending: only the worker whose claim commits
//! runs the job.

use crate::collections;
use crate::disaster::DisasterBank;
use crate::error::{DispatchError, DispatchResult};
use crate::metrics;
use crate::models::{to_doc, JobStatus, MailJob, NewJob};
use crate::registry::ProviderRegistry;
use crate::sender::SmartSender;
use crate::templates::TemplateEngine;
use crate::transport::OutboundEmail;
use crate::flags;
use chrono::{DateTime, Duration, Utc};
use core_config::dispatch::DispatchTuning;
use docstore::{DocumentStore, Query, TxnDecision, TxnOutcome};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub batch_size: usize,
    pub max_attempts: u32,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub claim_lease: Duration,
    /// Jobs overdue by more than this are expired instead of sent.
    pub late_window: Duration,
}

impl From<&DispatchTuning> for SchedulerConfig {
    fn from(tuning: &DispatchTuning) -> Self {
        Self {
            batch_size: tuning.queue_batch_size,
            max_attempts: tuning.max_attempts,
            retry_base: Duration::seconds(tuning.retry_base_secs as i64),
            retry_cap: Duration::seconds(tuning.retry_cap_secs as i64),
            claim_lease: Duration::seconds(tuning.claim_lease_secs as i64),
            late_window: Duration::seconds(tuning.late_window_secs as i64),
        }
    }
}

/// Outcome of one queue drain.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct QueueReport {
    /// Jobs this drain claimed.
    pub processed: u64,
    pub succeeded: u64,
    /// Attempts that failed, including expirations and escalations.
    pub failed: u64,
}

/// Exponential retry delay for the given 1-based failure count.
pub fn retry_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    let factor = 2i64.saturating_pow(exp);
    let delay_ms = base.num_milliseconds().saturating_mul(factor);
    Duration::milliseconds(delay_ms.min(cap.num_milliseconds()))
}

#[derive(Clone)]
pub struct MailScheduler {
    store: Arc<dyn DocumentStore>,
    registry: ProviderRegistry,
    sender: SmartSender,
    templates: Arc<TemplateEngine>,
    disaster: DisasterBank,
    config: SchedulerConfig,
}

impl MailScheduler {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        registry: ProviderRegistry,
        sender: SmartSender,
        templates: Arc<TemplateEngine>,
        disaster: DisasterBank,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            sender,
            templates,
            disaster,
            config,
        }
    }

    /// Enqueue a job, deduplicating on the idempotency key.
    ///
    /// Refused outright when no provider is configured and available:
    /// accepting work that can never send only hides the outage.
    pub async fn enqueue(&self, new: NewJob, now: DateTime<Utc>) -> DispatchResult<MailJob> {
        self.registry.candidates(now).await?;

        let job = MailJob::from_new(&new, self.config.max_attempts, now);
        let mut existing: Option<MailJob> = None;
        let outcome = self
            .store
            .transact(
                collections::MAIL_JOBS,
                &job.id,
                Box::new(|current| match current {
                    Some(doc) => {
                        existing = serde_json::from_value(doc.clone()).ok();
                        TxnDecision::Skip
                    }
                    None => TxnDecision::Write(to_doc(&job)),
                }),
            )
            .await?;

        match outcome {
            TxnOutcome::Committed => {
                info!(job = %job.id, kind = %job.kind, scheduled = %job.scheduled_time, "Job enqueued");
                metrics::queue_job("enqueued");
                Ok(job)
            }
            _ => {
                info!(job = %job.id, "Enqueue deduplicated onto existing job");
                metrics::queue_job("deduplicated");
                Ok(existing.unwrap_or(job))
            }
        }
    }

    /// Cancel a job that has not started processing. Returns whether
    /// the cancellation took effect.
    pub async fn cancel(&self, job_id: &str) -> DispatchResult<bool> {
        let outcome = self
            .store
            .transact(
                collections::MAIL_JOBS,
                job_id,
                Box::new(|current| {
                    let job: Option<MailJob> =
                        current.and_then(|doc| serde_json::from_value(doc.clone()).ok());
                    match job {
                        Some(mut job) if job.status == JobStatus::Pending => {
                            job.status = JobStatus::Cancelled;
                            TxnDecision::Write(to_doc(&job))
                        }
                        _ => TxnDecision::Skip,
                    }
                }),
            )
            .await?;
        Ok(outcome == TxnOutcome::Committed)
    }

    /// Drain due jobs once.
    pub async fn process_queue(&self, now: DateTime<Utc>) -> DispatchResult<QueueReport> {
        if flags::system_suspended(self.store.as_ref()).await? {
            info!("Dispatch suspended, skipping queue drain");
            return Ok(QueueReport::default());
        }

        let due = self
            .store
            .query(
                collections::MAIL_JOBS,
                Query::new()
                    .filter_eq("status", JobStatus::Pending.as_str())
                    .filter_lte("scheduled_time", now.timestamp_millis())
                    .order_by_asc("scheduled_time")
                    .limit(self.config.batch_size),
            )
            .await?;

        let mut report = QueueReport::default();
        for record in due {
            // A claim that does not commit means another worker won the
            // job, or it moved on; either way it is not ours.
            let job = match self.claim(&record.id, now).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(err) => {
                    // The job stays pending and is retried next drain.
                    error!(job = %record.id, error = %err, "Failed to claim job");
                    continue;
                }
            };

            report.processed += 1;
            if self.run_claimed(&job, now).await {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }
        }

        info!(
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            "Queue drain complete"
        );
        Ok(report)
    }

    /// Atomically move one pending job to processing under a lease.
    async fn claim(&self, job_id: &str, now: DateTime<Utc>) -> DispatchResult<Option<MailJob>> {
        let lease = self.config.claim_lease;
        let mut claimed: Option<MailJob> = None;
        self.store
            .transact(
                collections::MAIL_JOBS,
                job_id,
                Box::new(|current| {
                    let job: Option<MailJob> =
                        current.and_then(|doc| serde_json::from_value(doc.clone()).ok());
                    match job {
                        Some(mut job)
                            if job.status == JobStatus::Pending && job.scheduled_time <= now =>
                        {
                            job.status = JobStatus::Processing;
                            job.lease_expires_at = Some(now + lease);
                            job.last_attempt_at = Some(now);
                            let doc = to_doc(&job);
                            claimed = Some(job);
                            TxnDecision::Write(doc)
                        }
                        _ => TxnDecision::Skip,
                    }
                }),
            )
            .await?;
        Ok(claimed)
    }

    /// Run one claimed job to a terminal or rescheduled state.
    /// Returns whether the mail went out.
    async fn run_claimed(&self, job: &MailJob, now: DateTime<Utc>) -> bool {
        if now - job.scheduled_time > self.config.late_window {
            let patch = serde_json::json!({
                "status": JobStatus::ExpiredLate,
                "processed_at": now.timestamp_millis(),
                "lease_expires_at": null,
                "failure_reason": "missed its window; not sent",
            });
            if let Err(err) = self.store.merge(collections::MAIL_JOBS, &job.id, patch).await {
                error!(job = %job.id, error = %err, "Failed to expire late job");
            } else {
                warn!(job = %job.id, scheduled = %job.scheduled_time, "Job expired, too late to send");
                metrics::queue_job("expired_late");
            }
            return false;
        }

        let body = match self.templates.render(&job.body_template, &job.variables) {
            Ok(body) => body,
            Err(err) => {
                // Permanent: retrying a malformed payload cannot help.
                self.settle_failure(job, &err, now).await;
                return false;
            }
        };

        let email = OutboundEmail {
            to_email: job.to_email.clone(),
            to_name: job.to_name.clone(),
            subject: job.subject.clone(),
            html_body: body,
            variables: job.variables.clone(),
        };

        match self.sender.send(&email, now).await {
            Ok(outcome) => {
                let patch = serde_json::json!({
                    "status": JobStatus::Sent,
                    "attempts": job.attempts + 1,
                    "processed_at": now.timestamp_millis(),
                    "lease_expires_at": null,
                    "provider_used": outcome.provider_id,
                    "failure_reason": null,
                });
                if let Err(err) = self.store.merge(collections::MAIL_JOBS, &job.id, patch).await {
                    // The mail is out; the stale record self-heals when
                    // the claim is never re-runnable past max attempts.
                    error!(job = %job.id, error = %err, "Sent but failed to persist terminal state");
                }
                metrics::queue_job("sent");
                true
            }
            Err(err) => {
                self.settle_failure(job, &err, now).await;
                false
            }
        }
    }

    /// Reschedule with backoff, or escalate once attempts are spent.
    /// Permanent errors skip the retry ladder entirely.
    async fn settle_failure(&self, job: &MailJob, err: &DispatchError, now: DateTime<Utc>) {
        let attempts = job.attempts + 1;
        let spent = attempts >= job.max_attempts || !err.is_retryable();

        if !spent {
            let delay = retry_delay(self.config.retry_base, self.config.retry_cap, attempts);
            let next = now + delay;
            let patch = serde_json::json!({
                "status": JobStatus::Pending,
                "attempts": attempts,
                "scheduled_time": next.timestamp_millis(),
                "lease_expires_at": null,
                "failure_reason": err.to_string(),
            });
            if let Err(merge_err) = self.store.merge(collections::MAIL_JOBS, &job.id, patch).await {
                error!(job = %job.id, error = %merge_err, "Failed to reschedule job");
                return;
            }
            warn!(
                job = %job.id,
                attempts,
                max_attempts = job.max_attempts,
                retry_at = %next,
                error = %err,
                "Attempt failed, rescheduled with backoff"
            );
            metrics::queue_job("rescheduled");
            return;
        }

        match self.disaster.capture(job, attempts, &err.to_string(), now).await {
            Ok(_) => {
                let patch = serde_json::json!({
                    "status": JobStatus::DisasterEscalated,
                    "attempts": attempts,
                    "lease_expires_at": null,
                    "processed_at": now.timestamp_millis(),
                    "failure_reason": err.to_string(),
                });
                if let Err(merge_err) =
                    self.store.merge(collections::MAIL_JOBS, &job.id, patch).await
                {
                    error!(job = %job.id, error = %merge_err, "Failed to mark job escalated");
                }
                error!(job = %job.id, attempts, error = %err, "Retry budget spent, escalated to disaster bank");
                metrics::queue_job("escalated");
            }
            Err(capture_err) => {
                // Cannot park it for recovery; fail terminally rather
                // than retry past the attempt ceiling.
                let patch = serde_json::json!({
                    "status": JobStatus::Failed,
                    "attempts": attempts,
                    "lease_expires_at": null,
                    "processed_at": now.timestamp_millis(),
                    "failure_reason": err.to_string(),
                });
                if let Err(merge_err) =
                    self.store.merge(collections::MAIL_JOBS, &job.id, patch).await
                {
                    error!(job = %job.id, error = %merge_err, "Failed to mark job failed");
                }
                error!(
                    job = %job.id,
                    error = %capture_err,
                    "Disaster capture unavailable, job marked failed"
                );
                metrics::queue_job("failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let base = Duration::seconds(60);
        let cap = Duration::seconds(3600);

        assert_eq!(retry_delay(base, cap, 1), Duration::seconds(60));
        assert_eq!(retry_delay(base, cap, 2), Duration::seconds(120));
        assert_eq!(retry_delay(base, cap, 3), Duration::seconds(240));
        assert_eq!(retry_delay(base, cap, 4), Duration::seconds(480));
        // Capped from here on.
        assert_eq!(retry_delay(base, cap, 8), Duration::seconds(3600));
        assert_eq!(retry_delay(base, cap, 40), Duration::seconds(3600));
    }

    #[test]
    fn test_retry_delay_is_strictly_positive() {
        let delay = retry_delay(Duration::seconds(60), Duration::seconds(3600), 1);
        assert!(delay > Duration::zero());
    }
}
