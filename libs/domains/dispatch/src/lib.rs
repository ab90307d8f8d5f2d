//! Mail dispatch domain.
//!
//! Everything between "this mail should go out at 9:00" and a provider
//! accepting it:
//!
//! ```text
//!   enqueue ──> mail_jobs ──> process_queue ──┬─> SmartSender ──> provider A
//!                   ^                         │        │            provider B (failover)
//!                   │   reschedule w/ backoff │        │
//!                   └─────────────────────────┘        ├─> CircuitBreaker (per provider)
//!                                                      └─> QuotaTracker   (per provider, per day)
//!   exhausted jobs ──> disaster bank ──> slow recovery sweeps
//!   dead workers   ──> health check  ──> lease reclaim / circuit repair
//! ```
//!
//! All coordination state lives in the document store, so any number of
//! workers can run the same loops concurrently; transactions on single
//! documents (claims, locks, counters) keep them from stepping on each
//! other.

pub mod breaker;
pub mod disaster;
pub mod error;
pub mod flags;
pub mod health;
pub mod lock;
pub mod metrics;
pub mod models;
pub mod quota;
pub mod registry;
pub mod scheduler;
pub mod sender;
pub mod templates;
pub mod transport;

pub use breaker::{BreakerConfig, CircuitBreaker};
pub use disaster::{DisasterBank, DisasterConfig, RecoveryReport};
pub use error::{DispatchError, DispatchResult};
pub use health::{HealthCheck, HealthConfig, HealthReport};
pub use lock::LockManager;
pub use models::{
    CircuitState, CircuitStatus, DisasterEntry, DisasterStatus, JobKind, JobStatus, MailJob,
    NewJob, Provider, ProviderStatus, ProviderUsage,
};
pub use quota::QuotaTracker;
pub use registry::{ProviderCache, ProviderRegistry, ProviderSeed};
pub use scheduler::{MailScheduler, QueueReport, SchedulerConfig};
pub use sender::{SendOutcome, SmartSender};
pub use templates::TemplateEngine;
pub use transport::{
    DeliveryReceipt, HttpTransport, HttpTransportConfig, MailTransport, OutboundEmail,
};

/// Store collections the dispatch core owns.
pub mod collections {
    pub const PROVIDERS: &str = "providers";
    pub const PROVIDER_USAGE: &str = "provider_usage";
    pub const CIRCUIT_STATES: &str = "circuit_states";
    pub const MAIL_JOBS: &str = "mail_jobs";
    pub const DISASTER_BANK: &str = "disaster_bank";
    pub const LOCKS: &str = "locks";
    pub const OPS_FLAGS: &str = "ops_flags";
}

/// Lock keys used by the periodic loops.
pub mod lock_keys {
    /// Held for the duration of one queue drain.
    pub const QUEUE_DRAIN: &str = "queue_drain";
    /// Held for the duration of one disaster recovery sweep.
    pub const DISASTER_SWEEP: &str = "disaster_sweep";
    /// Held for the duration of one health sweep.
    pub const HEALTH_SWEEP: &str = "health_sweep";
}
