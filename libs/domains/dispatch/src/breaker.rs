//! Per-provider circuit breaker.
//!
//! State lives in the store so every worker sees the same circuit:
//!
//! ```text
//!   CLOSED --(threshold consecutive failures)--> OPEN
//!   OPEN   --(cooldown elapsed, next check)----> HALF_OPEN
//!   HALF_OPEN --(success)--> CLOSED
//!   HALF_OPEN --(failure)--> OPEN (cooldown re-armed)
//! ```
//!
//! Breaker reads and writes are fail-open: a store outage must degrade
//! to "no circuit protection", never to "no sends at all". That is the
//! opposite policy from quota and locks, which fail closed.

use crate::collections;
use crate::error::DispatchResult;
use crate::models::{to_doc, CircuitState, CircuitStatus, ProviderStatus};
use chrono::{DateTime, Duration, Utc};
use core_config::dispatch::DispatchTuning;
use docstore::{DocumentStore, TxnDecision};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl From<&DispatchTuning> for BreakerConfig {
    fn from(tuning: &DispatchTuning) -> Self {
        Self {
            failure_threshold: tuning.breaker_failure_threshold,
            cooldown: Duration::seconds(tuning.breaker_cooldown_secs as i64),
        }
    }
}

#[derive(Clone)]
pub struct CircuitBreaker {
    store: Arc<dyn DocumentStore>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn DocumentStore>, config: BreakerConfig) -> Self {
        Self { store, config }
    }

    /// Whether the provider may be attempted right now.
    ///
    /// An open circuit whose cooldown has elapsed transitions to
    /// half-open here, admitting this caller as the probe. Concurrent
    /// callers may both see the window and both probe; the extra probe
    /// is harmless.
    pub async fn check(&self, provider_id: &str, now: DateTime<Utc>) -> bool {
        let state = match self.state(provider_id).await {
            Ok(state) => state,
            Err(err) => {
                warn!(provider = provider_id, error = %err, "Breaker state unreadable, failing open");
                return true;
            }
        };

        match state.status {
            CircuitStatus::Closed | CircuitStatus::HalfOpen => true,
            CircuitStatus::Open => {
                let cooldown_over = state.next_try_at.is_none_or(|t| now >= t);
                if !cooldown_over {
                    return false;
                }
                let half_open = CircuitState {
                    status: CircuitStatus::HalfOpen,
                    failure_count: state.failure_count,
                    last_failure_at: state.last_failure_at,
                    next_try_at: None,
                };
                if let Err(err) = self.write_state(provider_id, &half_open).await {
                    warn!(provider = provider_id, error = %err, "Failed to persist half-open transition");
                } else {
                    info!(provider = provider_id, "Circuit half-open, admitting probe");
                    crate::metrics::circuit_transition(provider_id, "half_open");
                }
                true
            }
        }
    }

    /// Record a delivery accepted through this provider.
    ///
    /// Closes the circuit and flips a provider that was in `error`
    /// status back to `active`. Never fails: the send already happened.
    pub async fn on_success(&self, provider_id: &str, now: DateTime<Utc>) {
        let recovered = matches!(
            self.state(provider_id).await,
            Ok(CircuitState {
                status: CircuitStatus::Open | CircuitStatus::HalfOpen,
                ..
            })
        );

        if let Err(err) = self.write_state(provider_id, &CircuitState::default()).await {
            warn!(provider = provider_id, error = %err, "Failed to persist circuit close");
            return;
        }
        if recovered {
            info!(provider = provider_id, "Circuit CLOSED, provider recovered");
            crate::metrics::circuit_transition(provider_id, "closed");
            self.set_provider_status(provider_id, ProviderStatus::Active, now)
                .await;
        }
    }

    /// Record a failed delivery attempt.
    ///
    /// A half-open probe failure re-opens immediately; a closed circuit
    /// opens once the consecutive failure count reaches the threshold.
    pub async fn on_failure(&self, provider_id: &str, now: DateTime<Utc>) {
        let threshold = self.config.failure_threshold;
        let cooldown = self.config.cooldown;
        let mut opened = false;

        let result = self
            .store
            .transact(
                collections::CIRCUIT_STATES,
                provider_id,
                Box::new(|current| {
                    let state = parse_state(current);
                    let failure_count = state.failure_count + 1;
                    let next = if state.status == CircuitStatus::HalfOpen
                        || failure_count >= threshold
                    {
                        opened = true;
                        CircuitState {
                            status: CircuitStatus::Open,
                            failure_count,
                            last_failure_at: Some(now),
                            next_try_at: Some(now + cooldown),
                        }
                    } else {
                        CircuitState {
                            status: CircuitStatus::Closed,
                            failure_count,
                            last_failure_at: Some(now),
                            next_try_at: None,
                        }
                    };
                    TxnDecision::Write(to_doc(&next))
                }),
            )
            .await;

        if let Err(err) = result {
            warn!(provider = provider_id, error = %err, "Failed to persist circuit failure");
            return;
        }
        if opened {
            warn!(
                provider = provider_id,
                threshold, "Circuit OPENED, provider sidelined"
            );
            crate::metrics::circuit_transition(provider_id, "open");
            self.set_provider_status(provider_id, ProviderStatus::Error, now)
                .await;
        }
    }

    /// Current persisted state; a missing document reads as closed.
    pub async fn state(&self, provider_id: &str) -> DispatchResult<CircuitState> {
        let doc = self
            .store
            .get(collections::CIRCUIT_STATES, provider_id)
            .await?;
        Ok(parse_state(doc.as_ref()))
    }

    async fn write_state(&self, provider_id: &str, state: &CircuitState) -> DispatchResult<()> {
        self.store
            .set(collections::CIRCUIT_STATES, provider_id, to_doc(state))
            .await?;
        Ok(())
    }

    /// Keep the provider document's coarse status in step with the
    /// circuit. Best effort; the breaker state is authoritative.
    async fn set_provider_status(&self, provider_id: &str, status: ProviderStatus, now: DateTime<Utc>) {
        let patch = json!({
            "status": status,
            "updated_at": now.timestamp_millis(),
        });
        if let Err(err) = self
            .store
            .merge(collections::PROVIDERS, provider_id, patch)
            .await
        {
            warn!(provider = provider_id, error = %err, "Failed to update provider status");
        }
    }
}

fn parse_state(current: Option<&docstore::Document>) -> CircuitState {
    current
        .and_then(|doc| serde_json::from_value(doc.clone()).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use docstore::testing::UnavailableStore;
    use docstore::MemoryStore;

    fn breaker(store: Arc<dyn DocumentStore>) -> CircuitBreaker {
        CircuitBreaker::new(
            store,
            BreakerConfig {
                failure_threshold: 3,
                cooldown: Duration::seconds(120),
            },
        )
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 28, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_starts_closed() {
        let b = breaker(Arc::new(MemoryStore::new()));
        assert!(b.check("primary", noon()).await);
        let state = b.state("primary").await.unwrap();
        assert_eq!(state.status, CircuitStatus::Closed);
    }

    #[tokio::test]
    async fn test_opens_at_threshold() {
        let b = breaker(Arc::new(MemoryStore::new()));
        let now = noon();

        b.on_failure("primary", now).await;
        b.on_failure("primary", now).await;
        assert!(b.check("primary", now).await);

        b.on_failure("primary", now).await;
        assert!(!b.check("primary", now).await);

        let state = b.state("primary").await.unwrap();
        assert_eq!(state.status, CircuitStatus::Open);
        assert_eq!(state.failure_count, 3);
        assert_eq!(state.next_try_at, Some(now + Duration::seconds(120)));
    }

    #[tokio::test]
    async fn test_open_circuit_flips_provider_to_error() {
        let store = Arc::new(MemoryStore::new());
        store
            .set(
                collections::PROVIDERS,
                "primary",
                json!({"status": "active"}),
            )
            .await
            .unwrap();
        let b = breaker(store.clone());
        let now = noon();

        for _ in 0..3 {
            b.on_failure("primary", now).await;
        }

        let doc = store
            .get(collections::PROVIDERS, "primary")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.get("status").and_then(|v| v.as_str()), Some("error"));
    }

    #[tokio::test]
    async fn test_half_open_after_cooldown() {
        let b = breaker(Arc::new(MemoryStore::new()));
        let now = noon();
        for _ in 0..3 {
            b.on_failure("primary", now).await;
        }

        assert!(!b.check("primary", now + Duration::seconds(119)).await);
        assert!(b.check("primary", now + Duration::seconds(120)).await);

        let state = b.state("primary").await.unwrap();
        assert_eq!(state.status, CircuitStatus::HalfOpen);
    }

    #[tokio::test]
    async fn test_probe_success_closes_and_restores_provider() {
        let store = Arc::new(MemoryStore::new());
        store
            .set(
                collections::PROVIDERS,
                "primary",
                json!({"status": "active"}),
            )
            .await
            .unwrap();
        let b = breaker(store.clone());
        let now = noon();
        for _ in 0..3 {
            b.on_failure("primary", now).await;
        }
        let later = now + Duration::seconds(121);
        assert!(b.check("primary", later).await);

        b.on_success("primary", later).await;

        let state = b.state("primary").await.unwrap();
        assert_eq!(state.status, CircuitStatus::Closed);
        assert_eq!(state.failure_count, 0);

        let doc = store
            .get(collections::PROVIDERS, "primary")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.get("status").and_then(|v| v.as_str()), Some("active"));
    }

    #[tokio::test]
    async fn test_probe_failure_reopens_with_fresh_cooldown() {
        let b = breaker(Arc::new(MemoryStore::new()));
        let now = noon();
        for _ in 0..3 {
            b.on_failure("primary", now).await;
        }
        let probe_time = now + Duration::seconds(150);
        assert!(b.check("primary", probe_time).await);

        // Single probe failure re-opens, no fresh threshold count needed.
        b.on_failure("primary", probe_time).await;

        let state = b.state("primary").await.unwrap();
        assert_eq!(state.status, CircuitStatus::Open);
        assert_eq!(state.next_try_at, Some(probe_time + Duration::seconds(120)));
        assert!(!b.check("primary", probe_time + Duration::seconds(1)).await);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let b = breaker(Arc::new(MemoryStore::new()));
        let now = noon();

        b.on_failure("primary", now).await;
        b.on_failure("primary", now).await;
        b.on_success("primary", now).await;
        b.on_failure("primary", now).await;
        b.on_failure("primary", now).await;

        // Two failures after the reset: still closed with threshold 3.
        assert!(b.check("primary", now).await);
    }

    #[tokio::test]
    async fn test_fails_open_when_store_unavailable() {
        let b = breaker(Arc::new(UnavailableStore::new()));
        assert!(b.check("primary", noon()).await);
        // Recording must not panic or error either.
        b.on_failure("primary", noon()).await;
        b.on_success("primary", noon()).await;
    }
}
