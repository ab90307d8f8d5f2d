//! Failover sender.
//!
//! Walks the eligible providers in order and returns on the first
//! accepted delivery. Each attempt runs under a hard deadline so one
//! hung provider cannot stall the whole chain; a timeout counts as a
//! failure for that provider's circuit, exactly like a refusal.

use crate::breaker::CircuitBreaker;
use crate::error::{DispatchError, DispatchResult};
use crate::metrics;
use crate::quota::QuotaTracker;
use crate::registry::ProviderRegistry;
use crate::transport::{MailTransport, OutboundEmail};
use chrono::{DateTime, Utc};
use core_config::dispatch::DispatchTuning;
use docstore::retry::{retry_with_backoff, RetryConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Result of a successful dispatch.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    /// Provider that accepted the mail.
    pub provider_id: String,
    pub message_id: Option<String>,
    /// Providers tried, including the successful one.
    pub attempts: u32,
}

#[derive(Clone)]
pub struct SmartSender {
    registry: ProviderRegistry,
    breaker: CircuitBreaker,
    quota: QuotaTracker,
    transport: Arc<dyn MailTransport>,
    attempt_timeout: Duration,
}

impl SmartSender {
    pub fn new(
        registry: ProviderRegistry,
        breaker: CircuitBreaker,
        quota: QuotaTracker,
        transport: Arc<dyn MailTransport>,
        tuning: &DispatchTuning,
    ) -> Self {
        Self {
            registry,
            breaker,
            quota,
            transport,
            attempt_timeout: Duration::from_secs(tuning.send_timeout_secs),
        }
    }

    /// Send one email, failing over across providers.
    ///
    /// At most one provider ever accepts the mail: the loop returns on
    /// the first success, so a mail is never handed to two providers.
    /// `now` anchors every quota and circuit decision for this send.
    pub async fn send(
        &self,
        email: &OutboundEmail,
        now: DateTime<Utc>,
    ) -> DispatchResult<SendOutcome> {
        let candidates = self.registry.candidates(now).await?;

        let mut attempts = 0u32;
        let mut last_error: Option<DispatchError> = None;

        for provider in candidates {
            attempts += 1;
            let started = Instant::now();
            let attempt = tokio::time::timeout(
                self.attempt_timeout,
                self.transport.deliver(&provider, email),
            )
            .await;
            let elapsed = started.elapsed();

            let err = match attempt {
                Ok(Ok(receipt)) => {
                    self.breaker.on_success(&provider.id, now).await;
                    self.settle_quota(&provider.id, now).await;
                    metrics::send_attempt(&provider.id, "success", elapsed);
                    info!(
                        provider = %provider.id,
                        attempts,
                        duration_ms = elapsed.as_millis() as u64,
                        "Mail accepted"
                    );
                    return Ok(SendOutcome {
                        provider_id: provider.id,
                        message_id: receipt.message_id,
                        attempts,
                    });
                }
                Ok(Err(err)) => err,
                Err(_) => DispatchError::TransportTimeout {
                    provider: provider.id.clone(),
                    timeout_ms: self.attempt_timeout.as_millis() as u64,
                },
            };

            let outcome = match &err {
                DispatchError::TransportTimeout { .. } => "timeout",
                _ => "failure",
            };
            metrics::send_attempt(&provider.id, outcome, elapsed);
            warn!(provider = %provider.id, error = %err, "Send attempt failed, trying next provider");

            self.breaker.on_failure(&provider.id, now).await;
            if let Err(note_err) = self.quota.note_failure(&provider.id, now).await {
                warn!(provider = %provider.id, error = %note_err, "Failed to record failure bookkeeping");
            }
            last_error = Some(err);
        }

        metrics::failover_exhausted();
        let last = last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "no attempt was made".to_string());
        Err(DispatchError::AllProvidersFailed { last })
    }

    /// Persist the quota increment for a delivery that already happened.
    ///
    /// The mail is out, so this cannot fail the send. The increment is
    /// retried; if it still cannot be written the discrepancy is logged
    /// loudly and counted, never dropped silently.
    async fn settle_quota(&self, provider_id: &str, now: DateTime<Utc>) {
        let result = retry_with_backoff(
            || self.quota.record_send(provider_id, now),
            RetryConfig::new().with_initial_delay(50).with_max_delay(500),
        )
        .await;
        if let Err(err) = result {
            metrics::quota_persist_failure(provider_id);
            error!(
                provider = provider_id,
                error = %err,
                "Quota increment lost after retries; usage undercounts by one"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::models::{Provider, ProviderStatus};
    use crate::registry::ProviderCache;
    use crate::transport::DeliveryReceipt;
    use async_trait::async_trait;
    use docstore::{DocumentStore, MemoryStore};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Scripted transport: pops one result per attempt, per provider order.
    struct ScriptedTransport {
        script: Mutex<Vec<Result<DeliveryReceipt, String>>>,
        calls: AtomicU32,
        providers_seen: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<DeliveryReceipt, String>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: AtomicU32::new(0),
                providers_seen: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MailTransport for ScriptedTransport {
        async fn deliver(
            &self,
            provider: &Provider,
            _email: &OutboundEmail,
        ) -> DispatchResult<DeliveryReceipt> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.providers_seen
                .lock()
                .unwrap()
                .push(provider.id.clone());
            let next = self.script.lock().unwrap().remove(0);
            next.map_err(|detail| DispatchError::TransportError {
                provider: provider.id.clone(),
                status: Some(500),
                detail,
            })
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn provider(id: &str, priority: i32) -> Provider {
        Provider {
            id: id.to_string(),
            name: id.to_uppercase(),
            service_id: format!("svc_{id}"),
            template_id: format!("tpl_{id}"),
            public_key: "pk".to_string(),
            private_key: "sk".to_string(),
            status: ProviderStatus::Active,
            daily_quota: 100,
            priority,
            is_default: priority == 1,
            updated_at: Utc::now(),
        }
    }

    fn noon() -> DateTime<Utc> {
        chrono::TimeZone::with_ymd_and_hms(&Utc, 2026, 2, 28, 12, 0, 0).unwrap()
    }

    fn email() -> OutboundEmail {
        OutboundEmail {
            to_email: "guest@example.com".to_string(),
            to_name: "Guest".to_string(),
            subject: "Hello".to_string(),
            html_body: "<p>Hi</p>".to_string(),
            variables: BTreeMap::new(),
        }
    }

    async fn harness(
        providers: Vec<Provider>,
        transport: Arc<ScriptedTransport>,
    ) -> (SmartSender, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn DocumentStore> = store.clone();
        let quota = QuotaTracker::new(dyn_store.clone());
        let breaker = CircuitBreaker::new(
            dyn_store.clone(),
            BreakerConfig {
                failure_threshold: 5,
                cooldown: chrono::Duration::seconds(120),
            },
        );
        let registry = ProviderRegistry::new(
            dyn_store.clone(),
            quota.clone(),
            breaker.clone(),
            Arc::new(ProviderCache::new(Duration::from_secs(0))),
        );
        for p in providers {
            registry.upsert(&p).await.unwrap();
        }
        let sender = SmartSender::new(
            registry,
            breaker,
            quota,
            transport,
            &DispatchTuning::default(),
        );
        (sender, store)
    }

    #[tokio::test]
    async fn test_first_provider_success_stops_the_chain() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(DeliveryReceipt {
            message_id: Some("m-1".to_string()),
        })]));
        let (sender, _store) =
            harness(vec![provider("alpha", 1), provider("bravo", 2)], transport.clone()).await;

        let outcome = sender.send(&email(), noon()).await.unwrap();
        assert_eq!(outcome.provider_id, "alpha");
        assert_eq!(outcome.attempts, 1);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_failover_to_second_provider() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err("503 from upstream".to_string()),
            Ok(DeliveryReceipt { message_id: None }),
        ]));
        let (sender, _store) =
            harness(vec![provider("alpha", 1), provider("bravo", 2)], transport.clone()).await;

        let outcome = sender.send(&email(), noon()).await.unwrap();
        assert_eq!(outcome.provider_id, "bravo");
        assert_eq!(outcome.attempts, 2);
        assert_eq!(
            *transport.providers_seen.lock().unwrap(),
            vec!["alpha".to_string(), "bravo".to_string()]
        );
    }

    #[tokio::test]
    async fn test_all_providers_failed() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err("boom alpha".to_string()),
            Err("boom bravo".to_string()),
        ]));
        let (sender, _store) =
            harness(vec![provider("alpha", 1), provider("bravo", 2)], transport).await;

        let err = sender.send(&email(), noon()).await.unwrap_err();
        match err {
            DispatchError::AllProvidersFailed { last } => {
                assert!(last.contains("boom bravo"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_success_consumes_quota_only_on_winner() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err("boom".to_string()),
            Ok(DeliveryReceipt { message_id: None }),
        ]));
        let (sender, store) =
            harness(vec![provider("alpha", 1), provider("bravo", 2)], transport).await;

        sender.send(&email(), noon()).await.unwrap();

        let quota = QuotaTracker::new(store as Arc<dyn DocumentStore>);
        let now = noon();
        assert_eq!(quota.used_today("alpha", now).await.unwrap(), 0);
        assert_eq!(quota.used_today("bravo", now).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_no_providers_is_an_error_without_attempts() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let (sender, _store) = harness(vec![], transport.clone()).await;

        let err = sender.send(&email(), noon()).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoProvidersAvailable));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_failures_feed_the_breaker() {
        let transport = Arc::new(ScriptedTransport::new(
            (0..5).map(|i| Err(format!("boom {i}"))).collect(),
        ));
        let (sender, store) = harness(vec![provider("alpha", 1)], transport).await;

        // Five sends, each failing the single provider once.
        for _ in 0..5 {
            let _ = sender.send(&email(), noon()).await;
        }

        let breaker = CircuitBreaker::new(
            store as Arc<dyn DocumentStore>,
            BreakerConfig {
                failure_threshold: 5,
                cooldown: chrono::Duration::seconds(120),
            },
        );
        let state = breaker.state("alpha").await.unwrap();
        assert_eq!(state.status, crate::models::CircuitStatus::Open);
    }
}
