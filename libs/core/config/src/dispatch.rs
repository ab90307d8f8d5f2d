//! Tuning knobs for the mail dispatch core.
//!
//! Every value has a production-safe default and can be overridden through
//! environment variables, so deployments can tune without a rebuild.

use crate::{env_parse_or, ConfigError, FromEnv};

/// Tuning for provider health, sending, and the scheduled-job loop.
///
/// Defaults:
/// - breaker: 5 consecutive failures open the circuit for 120s
/// - send: 8s hard timeout per transport attempt
/// - queue: batches of 450 due jobs, 5 attempts, backoff 60s doubling up to 1h
/// - claim lease: 120s before the health check reclaims a stuck job
/// - late window: jobs more than 24h overdue are expired, not sent
#[derive(Debug, Clone)]
pub struct DispatchTuning {
    /// Consecutive failures before a provider's circuit opens.
    pub breaker_failure_threshold: u32,
    /// Seconds an open circuit blocks before allowing a half-open probe.
    pub breaker_cooldown_secs: u64,
    /// Seconds after which the health check forces a stuck-open circuit half-open.
    pub breaker_max_open_secs: u64,
    /// Hard timeout per transport attempt, in seconds.
    pub send_timeout_secs: u64,
    /// Provider cache time-to-live, in seconds.
    pub provider_cache_ttl_secs: u64,
    /// Maximum due jobs drained per `process_queue` invocation.
    pub queue_batch_size: usize,
    /// Default attempt ceiling for new jobs.
    pub max_attempts: u32,
    /// Base retry delay in seconds (doubled per attempt).
    pub retry_base_secs: u64,
    /// Retry delay cap in seconds.
    pub retry_cap_secs: u64,
    /// Seconds a claimed job holds its processing lease.
    pub claim_lease_secs: u64,
    /// Jobs overdue by more than this many seconds are marked expired_late.
    pub late_window_secs: u64,
    /// Recovery attempt ceiling before a disaster entry is terminal.
    pub disaster_max_recovery_attempts: u32,
    /// Base recovery delay in seconds (doubled per recovery attempt).
    pub disaster_retry_base_secs: u64,
    /// Recovery delay cap in seconds.
    pub disaster_retry_cap_secs: u64,
    /// Seconds a recovering disaster entry holds its lease.
    pub disaster_lease_secs: u64,
}

impl Default for DispatchTuning {
    fn default() -> Self {
        Self {
            breaker_failure_threshold: 5,
            breaker_cooldown_secs: 120,
            breaker_max_open_secs: 3600,
            send_timeout_secs: 8,
            provider_cache_ttl_secs: 30,
            queue_batch_size: 450,
            max_attempts: 5,
            retry_base_secs: 60,
            retry_cap_secs: 3600,
            claim_lease_secs: 120,
            late_window_secs: 86_400,
            disaster_max_recovery_attempts: 5,
            disaster_retry_base_secs: 300,
            disaster_retry_cap_secs: 21_600,
            disaster_lease_secs: 300,
        }
    }
}

impl FromEnv for DispatchTuning {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            breaker_failure_threshold: env_parse_or(
                "DISPATCH_BREAKER_FAILURE_THRESHOLD",
                defaults.breaker_failure_threshold,
            ),
            breaker_cooldown_secs: env_parse_or(
                "DISPATCH_BREAKER_COOLDOWN_SECS",
                defaults.breaker_cooldown_secs,
            ),
            breaker_max_open_secs: env_parse_or(
                "DISPATCH_BREAKER_MAX_OPEN_SECS",
                defaults.breaker_max_open_secs,
            ),
            send_timeout_secs: env_parse_or("DISPATCH_SEND_TIMEOUT_SECS", defaults.send_timeout_secs),
            provider_cache_ttl_secs: env_parse_or(
                "DISPATCH_PROVIDER_CACHE_TTL_SECS",
                defaults.provider_cache_ttl_secs,
            ),
            queue_batch_size: env_parse_or("DISPATCH_QUEUE_BATCH_SIZE", defaults.queue_batch_size),
            max_attempts: env_parse_or("DISPATCH_MAX_ATTEMPTS", defaults.max_attempts),
            retry_base_secs: env_parse_or("DISPATCH_RETRY_BASE_SECS", defaults.retry_base_secs),
            retry_cap_secs: env_parse_or("DISPATCH_RETRY_CAP_SECS", defaults.retry_cap_secs),
            claim_lease_secs: env_parse_or("DISPATCH_CLAIM_LEASE_SECS", defaults.claim_lease_secs),
            late_window_secs: env_parse_or("DISPATCH_LATE_WINDOW_SECS", defaults.late_window_secs),
            disaster_max_recovery_attempts: env_parse_or(
                "DISPATCH_DISASTER_MAX_RECOVERY_ATTEMPTS",
                defaults.disaster_max_recovery_attempts,
            ),
            disaster_retry_base_secs: env_parse_or(
                "DISPATCH_DISASTER_RETRY_BASE_SECS",
                defaults.disaster_retry_base_secs,
            ),
            disaster_retry_cap_secs: env_parse_or(
                "DISPATCH_DISASTER_RETRY_CAP_SECS",
                defaults.disaster_retry_cap_secs,
            ),
            disaster_lease_secs: env_parse_or(
                "DISPATCH_DISASTER_LEASE_SECS",
                defaults.disaster_lease_secs,
            ),
        })
    }
}
