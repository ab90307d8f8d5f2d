//! Disaster bank: last-resort recovery for jobs that spent their
//! normal retry budget.
//!
//! Entries are keyed by job id, so escalating the same job twice can
//! only ever produce one entry. Recovery runs on a slower backoff
//! ladder than the queue and gives up for good after its own ceiling,
//! leaving a terminal `disaster_failed` record for the operator.

use crate::collections;
use crate::error::{DispatchError, DispatchResult};
use crate::metrics;
use crate::models::{to_doc, DisasterEntry, DisasterStatus, JobStatus, MailJob};
use crate::scheduler::retry_delay;
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
pub struct DisasterConfig {
    pub max_recovery_attempts: u32,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub lease: Duration,
}

impl From<&DispatchTuning> for DisasterConfig {
    fn from(tuning: &DispatchTuning) -> Self {
        Self {
            max_recovery_attempts: tuning.disaster_max_recovery_attempts,
            retry_base: Duration::seconds(tuning.disaster_retry_base_secs as i64),
            retry_cap: Duration::seconds(tuning.disaster_retry_cap_secs as i64),
            lease: Duration::seconds(tuning.disaster_lease_secs as i64),
        }
    }
}

/// Outcome of one recovery sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Entries this sweep claimed and attempted.
    pub attempted: u64,
    pub recovered: u64,
    pub failed: u64,
}

#[derive(Clone)]
pub struct DisasterBank {
    store: Arc<dyn DocumentStore>,
    config: DisasterConfig,
}

impl DisasterBank {
    pub fn new(store: Arc<dyn DocumentStore>, config: DisasterConfig) -> Self {
        Self { store, config }
    }

    /// Park a job for out-of-band recovery. Idempotent on the job id:
    /// a second capture of the same job leaves the first entry intact.
    pub async fn capture(
        &self,
        job: &MailJob,
        attempts: u32,
        reason: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<DisasterEntry> {
        let entry = DisasterEntry {
            id: job.id.clone(),
            job_id: job.id.clone(),
            status: DisasterStatus::PendingRecovery,
            activation_reason: reason.to_string(),
            failure_chain: vec![reason.to_string()],
            original_attempts: attempts,
            recovery_attempts: 0,
            captured_at: now,
            last_recovery_at: None,
            recovered_at: None,
            recovery_provider_used: None,
            lease_expires_at: None,
        };

        let mut existing: Option<DisasterEntry> = None;
        let outcome = self
            .store
            .transact(
                collections::DISASTER_BANK,
                &entry.id,
                Box::new(|current| match current {
                    Some(doc) => {
                        existing = serde_json::from_value(doc.clone()).ok();
                        TxnDecision::Skip
                    }
                    None => TxnDecision::Write(to_doc(&entry)),
                }),
            )
            .await?;

        if outcome == TxnOutcome::Committed {
            warn!(job = %job.id, reason, "Job captured into disaster bank");
            metrics::disaster_entry("captured");
            Ok(entry)
        } else {
            Ok(existing.unwrap_or(entry))
        }
    }

    /// Sweep the bank once, attempting recovery for every entry that is
    /// due. `sender` and `templates` come from the caller so the bank
    /// shares the exact send path (and provider filters) the queue uses.
    pub async fn process(
        &self,
        sender: &SmartSender,
        templates: &TemplateEngine,
        now: DateTime<Utc>,
    ) -> DispatchResult<RecoveryReport> {
        if flags::system_suspended(self.store.as_ref()).await? {
            info!("Dispatch suspended, skipping disaster recovery");
            return Ok(RecoveryReport::default());
        }

        let pending = self
            .store
            .query(
                collections::DISASTER_BANK,
                Query::new()
                    .filter_eq("status", DisasterStatus::PendingRecovery.as_str())
                    .order_by_asc("captured_at"),
            )
            .await?;
        let stuck = self
            .store
            .query(
                collections::DISASTER_BANK,
                Query::new()
                    .filter_eq("status", DisasterStatus::Recovering.as_str())
                    .filter_lte("lease_expires_at", now.timestamp_millis()),
            )
            .await?;

        let mut report = RecoveryReport::default();
        for record in pending.into_iter().chain(stuck) {
            let entry = match self.claim(&record.id, now).await {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(err) => {
                    error!(entry = %record.id, error = %err, "Failed to claim disaster entry");
                    continue;
                }
            };

            report.attempted += 1;
            if self.recover_one(&entry, sender, templates, now).await {
                report.recovered += 1;
            } else {
                report.failed += 1;
            }
        }

        info!(
            attempted = report.attempted,
            recovered = report.recovered,
            failed = report.failed,
            "Disaster recovery sweep complete"
        );
        Ok(report)
    }

    /// Claim one entry under a lease if its backoff window has elapsed.
    async fn claim(&self, entry_id: &str, now: DateTime<Utc>) -> DispatchResult<Option<DisasterEntry>> {
        let base = self.config.retry_base;
        let cap = self.config.retry_cap;
        let lease = self.config.lease;
        let mut claimed: Option<DisasterEntry> = None;

        self.store
            .transact(
                collections::DISASTER_BANK,
                entry_id,
                Box::new(|current| {
                    let entry: Option<DisasterEntry> =
                        current.and_then(|doc| serde_json::from_value(doc.clone()).ok());
                    let Some(mut entry) = entry else {
                        return TxnDecision::Skip;
                    };

                    let claimable = match entry.status {
                        DisasterStatus::PendingRecovery => true,
                        DisasterStatus::Recovering => {
                            entry.lease_expires_at.is_some_and(|t| t <= now)
                        }
                        _ => false,
                    };
                    if !claimable {
                        return TxnDecision::Skip;
                    }

                    // Entries wait out their own, slower backoff ladder.
                    let due = entry.last_recovery_at.map_or(true, |last| {
                        last + retry_delay(base, cap, entry.recovery_attempts.max(1)) <= now
                    });
                    if !due {
                        return TxnDecision::Skip;
                    }

                    entry.status = DisasterStatus::Recovering;
                    entry.lease_expires_at = Some(now + lease);
                    let doc = to_doc(&entry);
                    claimed = Some(entry);
                    TxnDecision::Write(doc)
                }),
            )
            .await?;
        Ok(claimed)
    }

    /// One recovery attempt for a claimed entry.
    async fn recover_one(
        &self,
        entry: &DisasterEntry,
        sender: &SmartSender,
        templates: &TemplateEngine,
        now: DateTime<Utc>,
    ) -> bool {
        let job = match self.load_job(&entry.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                self.settle(entry, Err("original job document is missing".to_string()), now, false)
                    .await;
                return false;
            }
            Err(err) => {
                self.settle(entry, Err(err.to_string()), now, true).await;
                return false;
            }
        };

        let email = match templates.render(&job.body_template, &job.variables) {
            Ok(body) => OutboundEmail {
                to_email: job.to_email.clone(),
                to_name: job.to_name.clone(),
                subject: job.subject.clone(),
                html_body: body,
                variables: job.variables.clone(),
            },
            Err(err) => {
                // Malformed payload cannot recover; terminal.
                self.settle(entry, Err(err.to_string()), now, false).await;
                return false;
            }
        };

        match sender.send(&email, now).await {
            Ok(outcome) => {
                self.settle(entry, Ok(outcome.provider_id.clone()), now, false).await;
                let patch = serde_json::json!({
                    "status": JobStatus::Sent,
                    "provider_used": outcome.provider_id,
                    "processed_at": now.timestamp_millis(),
                    "failure_reason": null,
                });
                if let Err(err) = self
                    .store
                    .merge(collections::MAIL_JOBS, &entry.job_id, patch)
                    .await
                {
                    error!(job = %entry.job_id, error = %err, "Recovered but failed to update job record");
                }
                true
            }
            Err(err) => {
                self.settle(entry, Err(err.to_string()), now, true).await;
                false
            }
        }
    }

    /// Persist the outcome of a recovery attempt. `retryable` controls
    /// whether a failure goes back to pending or straight to terminal.
    async fn settle(
        &self,
        entry: &DisasterEntry,
        result: Result<String, String>,
        now: DateTime<Utc>,
        retryable: bool,
    ) {
        let ceiling = self.config.max_recovery_attempts;
        let patch = match result {
            Ok(provider_id) => {
                info!(job = %entry.job_id, provider = %provider_id, "Disaster entry recovered");
                metrics::disaster_entry("recovered");
                serde_json::json!({
                    "status": DisasterStatus::Recovered,
                    "recovered_at": now.timestamp_millis(),
                    "recovery_provider_used": provider_id,
                    "recovery_attempts": entry.recovery_attempts + 1,
                    "last_recovery_at": now.timestamp_millis(),
                    "lease_expires_at": null,
                })
            }
            Err(reason) => {
                let recovery_attempts = entry.recovery_attempts + 1;
                let terminal = !retryable || recovery_attempts >= ceiling;
                let mut chain = entry.failure_chain.clone();
                chain.push(reason.clone());

                if terminal {
                    error!(
                        job = %entry.job_id,
                        recovery_attempts,
                        reason,
                        "Disaster recovery exhausted, entry is terminal"
                    );
                    metrics::disaster_entry("terminal");
                } else {
                    warn!(job = %entry.job_id, recovery_attempts, reason, "Recovery attempt failed");
                    metrics::disaster_entry("retry");
                }
                serde_json::json!({
                    "status": if terminal {
                        DisasterStatus::DisasterFailed
                    } else {
                        DisasterStatus::PendingRecovery
                    },
                    "recovery_attempts": recovery_attempts,
                    "last_recovery_at": now.timestamp_millis(),
                    "failure_chain": chain,
                    "lease_expires_at": null,
                })
            }
        };

        if let Err(err) = self
            .store
            .merge(collections::DISASTER_BANK, &entry.id, patch)
            .await
        {
            // Lease expiry will make the entry claimable again.
            error!(entry = %entry.id, error = %err, "Failed to persist recovery outcome");
        }
    }

    async fn load_job(&self, job_id: &str) -> DispatchResult<Option<MailJob>> {
        let doc = self.store.get(collections::MAIL_JOBS, job_id).await?;
        match doc {
            Some(doc) => Ok(Some(serde_json::from_value(doc).map_err(|err| {
                DispatchError::Internal(format!("malformed job document: {err}"))
            })?)),
            None => Ok(None),
        }
    }
}
