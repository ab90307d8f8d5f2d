//! Provider registry: configuration, caching and candidate selection.
//!
//! Candidate selection is where the health and quota filters meet: a
//! provider is sendable only if it is not disabled, its circuit admits
//! traffic right now, and it has daily quota left. Candidates are
//! ordered by `(priority, id)` so every worker walks providers in the
//! same deterministic order.

use crate::breaker::CircuitBreaker;
use crate::collections;
use crate::error::{DispatchError, DispatchResult};
use crate::models::{to_doc, Provider, ProviderStatus};
use crate::quota::QuotaTracker;
use chrono::{DateTime, Utc};
use core_config::{env_or_default, ConfigError};
use docstore::{DocumentStore, Query};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Provider definition accepted from the `MAIL_PROVIDERS` environment
/// variable, a JSON array of these objects.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSeed {
    pub id: String,
    pub name: String,
    pub service_id: String,
    pub template_id: String,
    pub public_key: String,
    pub private_key: String,
    pub daily_quota: i64,
    pub priority: i32,
    #[serde(default)]
    pub is_default: bool,
}

impl ProviderSeed {
    /// Parse seeds from the environment. An absent or empty variable
    /// yields no seeds, which is valid for stores populated elsewhere.
    pub fn from_env() -> Result<Vec<ProviderSeed>, ConfigError> {
        let raw = env_or_default("MAIL_PROVIDERS", "");
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw).map_err(|err| ConfigError::ParseError {
            key: "MAIL_PROVIDERS".to_string(),
            details: err.to_string(),
        })
    }

    fn into_provider(self, now: DateTime<Utc>) -> Provider {
        Provider {
            id: self.id,
            name: self.name,
            service_id: self.service_id,
            template_id: self.template_id,
            public_key: self.public_key,
            private_key: self.private_key,
            status: ProviderStatus::Active,
            daily_quota: self.daily_quota,
            priority: self.priority,
            is_default: self.is_default,
            updated_at: now,
        }
    }
}

/// Short-lived cache of the provider list. Circuit and quota checks are
/// never cached; only the configuration documents are.
pub struct ProviderCache {
    ttl: Duration,
    slot: RwLock<Option<(Instant, Vec<Provider>)>>,
}

impl ProviderCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: RwLock::new(None),
        }
    }

    pub async fn get(&self) -> Option<Vec<Provider>> {
        let slot = self.slot.read().await;
        match slot.as_ref() {
            Some((stored_at, providers)) if stored_at.elapsed() < self.ttl => {
                Some(providers.clone())
            }
            _ => None,
        }
    }

    pub async fn put(&self, providers: Vec<Provider>) {
        *self.slot.write().await = Some((Instant::now(), providers));
    }

    pub async fn invalidate(&self) {
        *self.slot.write().await = None;
    }
}

#[derive(Clone)]
pub struct ProviderRegistry {
    store: Arc<dyn DocumentStore>,
    quota: QuotaTracker,
    breaker: CircuitBreaker,
    cache: Arc<ProviderCache>,
}

impl ProviderRegistry {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        quota: QuotaTracker,
        breaker: CircuitBreaker,
        cache: Arc<ProviderCache>,
    ) -> Self {
        Self {
            store,
            quota,
            breaker,
            cache,
        }
    }

    /// All configured providers, sorted `(priority, id)`, via the cache.
    pub async fn all(&self) -> DispatchResult<Vec<Provider>> {
        if let Some(cached) = self.cache.get().await {
            return Ok(cached);
        }
        let records = self
            .store
            .query(collections::PROVIDERS, Query::new())
            .await?;
        let mut providers = Vec::with_capacity(records.len());
        for record in records {
            match serde_json::from_value::<Provider>(record.doc) {
                Ok(provider) => providers.push(provider),
                Err(err) => {
                    warn!(provider = %record.id, error = %err, "Skipping malformed provider document");
                }
            }
        }
        providers.sort_by(|a, b| (a.priority, &a.id).cmp(&(b.priority, &b.id)));
        self.cache.put(providers.clone()).await;
        Ok(providers)
    }

    /// Providers eligible for a send right now, in failover order.
    ///
    /// Disabled providers are excluded outright. Providers in `error`
    /// status stay eligible exactly while their circuit admits a
    /// half-open probe; the breaker gate covers both cases.
    pub async fn candidates(&self, now: DateTime<Utc>) -> DispatchResult<Vec<Provider>> {
        let mut eligible = Vec::new();
        for provider in self.all().await? {
            if provider.status == ProviderStatus::Disabled {
                continue;
            }
            if !self.breaker.check(&provider.id, now).await {
                debug!(provider = %provider.id, "Skipping provider, circuit open");
                continue;
            }
            let remaining = self.quota.remaining(&provider, now).await?;
            if remaining <= 0 {
                debug!(provider = %provider.id, "Skipping provider, daily quota exhausted");
                continue;
            }
            eligible.push(provider);
        }
        if eligible.is_empty() {
            return Err(DispatchError::NoProvidersAvailable);
        }
        Ok(eligible)
    }

    /// Create or replace a provider document.
    pub async fn upsert(&self, provider: &Provider) -> DispatchResult<()> {
        self.store
            .set(collections::PROVIDERS, &provider.id, to_doc(provider))
            .await?;
        self.cache.invalidate().await;
        info!(provider = %provider.id, "Provider configuration updated");
        Ok(())
    }

    /// Insert seeds that do not already exist. Existing documents are
    /// left untouched so runtime state (status flips) survives restarts.
    /// Returns the number of providers created.
    pub async fn seed(&self, seeds: Vec<ProviderSeed>, now: DateTime<Utc>) -> DispatchResult<usize> {
        let mut created = 0;
        for seed in seeds {
            let existing = self.store.get(collections::PROVIDERS, &seed.id).await?;
            if existing.is_some() {
                continue;
            }
            let id = seed.id.clone();
            let provider = seed.into_provider(now);
            self.store
                .set(collections::PROVIDERS, &id, to_doc(&provider))
                .await?;
            created += 1;
        }
        if created > 0 {
            self.cache.invalidate().await;
            info!(created, "Seeded providers from environment");
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use chrono::TimeZone;
    use docstore::MemoryStore;

    fn provider(id: &str, priority: i32, quota: i64, status: ProviderStatus) -> Provider {
        Provider {
            id: id.to_string(),
            name: id.to_uppercase(),
            service_id: format!("svc_{id}"),
            template_id: format!("tpl_{id}"),
            public_key: "pk".to_string(),
            private_key: "sk".to_string(),
            status,
            daily_quota: quota,
            priority,
            is_default: priority == 1,
            updated_at: Utc::now(),
        }
    }

    fn registry(store: Arc<MemoryStore>, cache_ttl: Duration) -> ProviderRegistry {
        let store: Arc<dyn DocumentStore> = store;
        let quota = QuotaTracker::new(store.clone());
        let breaker = CircuitBreaker::new(
            store.clone(),
            BreakerConfig {
                failure_threshold: 3,
                cooldown: chrono::Duration::seconds(120),
            },
        );
        ProviderRegistry::new(store, quota, breaker, Arc::new(ProviderCache::new(cache_ttl)))
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 28, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_candidates_ordered_by_priority_then_id() {
        let store = Arc::new(MemoryStore::new());
        let reg = registry(store.clone(), Duration::from_secs(0));
        for p in [
            provider("charlie", 2, 100, ProviderStatus::Active),
            provider("alpha", 1, 100, ProviderStatus::Active),
            provider("bravo", 2, 100, ProviderStatus::Active),
        ] {
            reg.upsert(&p).await.unwrap();
        }

        let candidates = reg.candidates(noon()).await.unwrap();
        let ids: Vec<&str> = candidates.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "bravo", "charlie"]);
    }

    #[tokio::test]
    async fn test_disabled_and_exhausted_providers_excluded() {
        let store = Arc::new(MemoryStore::new());
        let reg = registry(store.clone(), Duration::from_secs(0));
        reg.upsert(&provider("alpha", 1, 100, ProviderStatus::Disabled))
            .await
            .unwrap();
        reg.upsert(&provider("bravo", 2, 1, ProviderStatus::Active))
            .await
            .unwrap();

        let now = noon();
        let quota = QuotaTracker::new(store.clone() as Arc<dyn DocumentStore>);
        quota.record_send("bravo", now).await.unwrap();

        let result = reg.candidates(now).await;
        assert!(matches!(result, Err(DispatchError::NoProvidersAvailable)));
    }

    #[tokio::test]
    async fn test_open_circuit_excludes_provider() {
        let store = Arc::new(MemoryStore::new());
        let reg = registry(store.clone(), Duration::from_secs(0));
        reg.upsert(&provider("alpha", 1, 100, ProviderStatus::Active))
            .await
            .unwrap();
        reg.upsert(&provider("bravo", 2, 100, ProviderStatus::Active))
            .await
            .unwrap();

        let now = noon();
        let breaker = CircuitBreaker::new(
            store.clone() as Arc<dyn DocumentStore>,
            BreakerConfig {
                failure_threshold: 3,
                cooldown: chrono::Duration::seconds(120),
            },
        );
        for _ in 0..3 {
            breaker.on_failure("alpha", now).await;
        }

        let candidates = reg.candidates(now).await.unwrap();
        let ids: Vec<&str> = candidates.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["bravo"]);
    }

    #[tokio::test]
    async fn test_cache_serves_stale_until_invalidated() {
        let store = Arc::new(MemoryStore::new());
        let reg = registry(store.clone(), Duration::from_secs(60));
        reg.upsert(&provider("alpha", 1, 100, ProviderStatus::Active))
            .await
            .unwrap();
        assert_eq!(reg.all().await.unwrap().len(), 1);

        // Write behind the registry's back; the cache still serves one.
        store
            .set(
                collections::PROVIDERS,
                "bravo",
                to_doc(&provider("bravo", 2, 100, ProviderStatus::Active)),
            )
            .await
            .unwrap();
        assert_eq!(reg.all().await.unwrap().len(), 1);

        reg.cache.invalidate().await;
        assert_eq!(reg.all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_seed_skips_existing_providers() {
        let store = Arc::new(MemoryStore::new());
        let reg = registry(store.clone(), Duration::from_secs(0));
        let mut existing = provider("alpha", 1, 100, ProviderStatus::Disabled);
        existing.daily_quota = 7;
        reg.upsert(&existing).await.unwrap();

        let seeds = vec![
            ProviderSeed {
                id: "alpha".to_string(),
                name: "Alpha".to_string(),
                service_id: "svc_a".to_string(),
                template_id: "tpl_a".to_string(),
                public_key: "pk".to_string(),
                private_key: "sk".to_string(),
                daily_quota: 500,
                priority: 1,
                is_default: true,
            },
            ProviderSeed {
                id: "bravo".to_string(),
                name: "Bravo".to_string(),
                service_id: "svc_b".to_string(),
                template_id: "tpl_b".to_string(),
                public_key: "pk".to_string(),
                private_key: "sk".to_string(),
                daily_quota: 300,
                priority: 2,
                is_default: false,
            },
        ];
        assert_eq!(reg.seed(seeds, noon()).await.unwrap(), 1);

        // The pre-existing document kept its runtime state.
        let doc = store
            .get(collections::PROVIDERS, "alpha")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.get("daily_quota").and_then(|v| v.as_i64()), Some(7));
        assert_eq!(doc.get("status").and_then(|v| v.as_str()), Some("disabled"));
    }

    #[test]
    fn test_seed_parsing() {
        let seeds: Vec<ProviderSeed> = serde_json::from_str(
            r#"[{"id":"alpha","name":"Alpha","service_id":"s","template_id":"t",
                 "public_key":"pk","private_key":"sk","daily_quota":200,"priority":1}]"#,
        )
        .unwrap();
        assert_eq!(seeds.len(), 1);
        assert!(!seeds[0].is_default);
    }
}
