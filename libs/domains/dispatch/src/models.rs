//! Persistent data model for the dispatch core.
//!
//! Every struct here maps 1:1 onto a document in the store. Timestamps
//! are persisted as unix milliseconds so the store's range filters can
//! compare them numerically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Namespace for deriving deterministic job ids from idempotency keys.
const JOB_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x8f, 0x2a, 0x11, 0xd4, 0x5c, 0x3e, 0x4b, 0x9a, 0x8d, 0x01, 0x6f, 0xe2, 0x9b, 0x44, 0x7c, 0x15,
]);

/// Serialize a plain model struct into a store document.
///
/// These structs only contain JSON-representable fields, so serialization
/// cannot fail at runtime; the `Null` fallback would be rejected by the
/// store as an invalid document rather than silently written.
pub(crate) fn to_doc<T: Serialize>(value: &T) -> docstore::Document {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// Operational state of a mail provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Active,
    Disabled,
    Error,
}

impl ProviderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderStatus::Active => "active",
            ProviderStatus::Disabled => "disabled",
            ProviderStatus::Error => "error",
        }
    }
}

impl fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A configured mail provider account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub name: String,
    pub service_id: String,
    pub template_id: String,
    pub public_key: String,
    pub private_key: String,
    pub status: ProviderStatus,
    /// Maximum sends per UTC day.
    pub daily_quota: i64,
    /// Lower numbers are tried first.
    pub priority: i32,
    #[serde(default)]
    pub is_default: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

/// Per-provider usage bookkeeping for the current UTC day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderUsage {
    /// UTC day this document covers, `YYYY-MM-DD`.
    pub date: String,
    pub used_today: i64,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_increment_at: Option<DateTime<Utc>>,
}

impl ProviderUsage {
    /// A zeroed usage document for the given UTC day.
    pub fn fresh(date: impl Into<String>) -> Self {
        Self {
            date: date.into(),
            used_today: 0,
            consecutive_failures: 0,
            last_success_at: None,
            last_failure_at: None,
            last_increment_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// Circuit breaker position for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitStatus::Closed => "closed",
            CircuitStatus::Open => "open",
            CircuitStatus::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted circuit state. A provider with no document is `Closed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitState {
    pub status: CircuitStatus,
    pub failure_count: u32,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_failure_at: Option<DateTime<Utc>>,
    /// When an `Open` circuit next admits a probe.
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub next_try_at: Option<DateTime<Utc>>,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self {
            status: CircuitStatus::Closed,
            failure_count: 0,
            last_failure_at: None,
            next_try_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Mail jobs
// ---------------------------------------------------------------------------

/// What kind of mail a job carries. Purely informational for routing
/// and observability; all kinds flow through the same pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    EventReminder,
    InviteFollowUp,
    Manual,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::EventReminder => "event_reminder",
            JobKind::InviteFollowUp => "invite_follow_up",
            JobKind::Manual => "manual",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a queued mail job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    ExpiredLate,
    Cancelled,
    DisasterEscalated,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Sent => "sent",
            JobStatus::Failed => "failed",
            JobStatus::ExpiredLate => "expired_late",
            JobStatus::Cancelled => "cancelled",
            JobStatus::DisasterEscalated => "disaster_escalated",
        }
    }

    /// Terminal states are never picked up by the queue drain again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Sent
                | JobStatus::Failed
                | JobStatus::ExpiredLate
                | JobStatus::Cancelled
                | JobStatus::DisasterEscalated
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A scheduled send request, before it is persisted.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: JobKind,
    pub to_email: String,
    pub to_name: String,
    pub subject: String,
    pub body_template: String,
    pub variables: BTreeMap<String, String>,
    pub scheduled_time: DateTime<Utc>,
    /// Caller-supplied deduplication key; two enqueues with the same key
    /// resolve to the same job.
    pub idempotency_key: String,
}

impl NewJob {
    /// Deterministic job id derived from the idempotency key.
    pub fn job_id(&self) -> String {
        Uuid::new_v5(&JOB_ID_NAMESPACE, self.idempotency_key.as_bytes()).to_string()
    }
}

/// A persisted mail job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailJob {
    pub id: String,
    pub kind: JobKind,
    pub to_email: String,
    pub to_name: String,
    pub subject: String,
    pub body_template: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    pub status: JobStatus,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub scheduled_time: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Set while a worker holds the job; an expired lease means the
    /// worker died mid-flight and the job can be reclaimed.
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub provider_used: Option<String>,
    pub idempotency_key: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub processed_at: Option<DateTime<Utc>>,
}

impl MailJob {
    /// Build the persisted form of a new job.
    pub fn from_new(new: &NewJob, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: new.job_id(),
            kind: new.kind,
            to_email: new.to_email.clone(),
            to_name: new.to_name.clone(),
            subject: new.subject.clone(),
            body_template: new.body_template.clone(),
            variables: new.variables.clone(),
            status: JobStatus::Pending,
            scheduled_time: new.scheduled_time,
            attempts: 0,
            max_attempts,
            lease_expires_at: None,
            last_attempt_at: None,
            failure_reason: None,
            provider_used: None,
            idempotency_key: new.idempotency_key.clone(),
            created_at: now,
            processed_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Disaster bank
// ---------------------------------------------------------------------------

/// Recovery state of a disaster bank entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisasterStatus {
    PendingRecovery,
    Recovering,
    Recovered,
    DisasterFailed,
}

impl DisasterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisasterStatus::PendingRecovery => "pending_recovery",
            DisasterStatus::Recovering => "recovering",
            DisasterStatus::Recovered => "recovered",
            DisasterStatus::DisasterFailed => "disaster_failed",
        }
    }
}

impl fmt::Display for DisasterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A job that exhausted its normal retry budget, parked for slower
/// out-of-band recovery. Keyed by the job id so a job can only ever
/// have one entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisasterEntry {
    pub id: String,
    pub job_id: String,
    pub status: DisasterStatus,
    /// Last failure reason at the time of escalation.
    pub activation_reason: String,
    /// One entry per failed recovery attempt, oldest first.
    #[serde(default)]
    pub failure_chain: Vec<String>,
    /// Attempts consumed in the normal queue before escalation.
    pub original_attempts: u32,
    pub recovery_attempts: u32,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub captured_at: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_recovery_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub recovered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recovery_provider_used: Option<String>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub lease_expires_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

/// A held distributed lock. Expired records are stealable in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub key: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub acquired_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
    pub ttl_secs: u64,
}
