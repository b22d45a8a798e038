//! Provider registry — lifecycle coordination for the adapter fleet.
//!
//! Adapters are registered as factories and only constructed when an
//! enabled provider is started, so a disabled backend costs nothing.
//! Lookups are synchronous; only the fan-out operations (`start_all`,
//! `stop_all`, `health_all`) are async, and each isolates per-provider
//! failures so one broken backend never takes down the rest.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use serde::Deserialize;
use tokio::task::JoinSet;

use crate::error::AdapterError;
use crate::providers::{HealthReport, ProviderAdapter};

/// Fan-out health checks slower than this are logged.
const SLOW_HEALTH_MS: u128 = 3_000;

/// Per-provider registry configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    pub enabled: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Deferred adapter construction; invoked at most once, on first start.
pub type AdapterFactory = Box<dyn Fn() -> Arc<dyn ProviderAdapter> + Send + Sync>;

struct Entry {
    config: ProviderConfig,
    factory: AdapterFactory,
    /// Set once the factory has run and `start` succeeded.
    adapter: Option<Arc<dyn ProviderAdapter>>,
}

/// The adapter fleet. Cloneable; clones share state.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    entries: Arc<RwLock<HashMap<String, Arc<Mutex<Entry>>>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under a unique id. Duplicate ids are rejected.
    pub fn register(
        &self,
        id: &str,
        config: ProviderConfig,
        factory: AdapterFactory,
    ) -> Result<(), AdapterError> {
        let mut entries = self.entries.write().unwrap();
        if entries.contains_key(id) {
            return Err(AdapterError::Validation(format!(
                "provider '{}' already registered",
                id
            )));
        }
        entries.insert(
            id.to_string(),
            Arc::new(Mutex::new(Entry {
                config,
                factory,
                adapter: None,
            })),
        );
        tracing::info!("[Registry] Registered provider '{}'", id);
        Ok(())
    }

    /// Fetch a started adapter by id.
    pub fn get(&self, id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        let entries = self.entries.read().unwrap();
        let adapter = entries.get(id)?.lock().unwrap().adapter.clone();
        adapter
    }

    /// Ids of all registered providers, started or not.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.read().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        let entries = self.entries.read().unwrap();
        entries
            .get(id)
            .map(|e| e.lock().unwrap().config.enabled)
            .unwrap_or(false)
    }

    /// Start every enabled provider concurrently.
    ///
    /// Failures are isolated per provider and logged; the call only errors
    /// when not a single provider started.
    pub async fn start_all(&self) -> Result<(), AdapterError> {
        // Construct adapters for enabled entries that have none yet.
        let to_start: Vec<(String, Arc<dyn ProviderAdapter>)> = {
            let entries = self.entries.read().unwrap();
            entries
                .iter()
                .filter_map(|(id, entry)| {
                    let mut entry = entry.lock().unwrap();
                    if !entry.config.enabled {
                        tracing::info!("[Registry] Provider '{}' disabled, skipping", id);
                        return None;
                    }
                    if entry.adapter.is_none() {
                        entry.adapter = Some((entry.factory)());
                    }
                    Some((id.clone(), entry.adapter.clone().unwrap()))
                })
                .collect()
        };

        if to_start.is_empty() {
            return Ok(());
        }
        let total = to_start.len();

        let mut tasks = JoinSet::new();
        for (id, adapter) in to_start {
            tasks.spawn(async move {
                let result = adapter.start().await;
                (id, result)
            });
        }

        let mut started = 0usize;
        while let Some(joined) = tasks.join_next().await {
            let Ok((id, result)) = joined else { continue };
            match result {
                Ok(()) => {
                    started += 1;
                    tracing::info!("[Registry] Provider '{}' started", id);
                }
                Err(e) => {
                    tracing::error!("[Registry] Provider '{}' failed to start: {}", id, e);
                    // A failed start leaves no half-started adapter behind.
                    if let Some(entry) = self.entries.read().unwrap().get(&id) {
                        entry.lock().unwrap().adapter = None;
                    }
                }
            }
        }

        if started == 0 {
            return Err(AdapterError::Transport(format!(
                "all {} enabled provider(s) failed to start",
                total
            )));
        }
        tracing::info!("[Registry] Started {}/{} provider(s)", started, total);
        Ok(())
    }

    /// Stop every started provider. Best effort: stop failures are logged,
    /// never propagated, and the adapter reference is dropped regardless.
    pub async fn stop_all(&self) {
        let to_stop: Vec<(String, Arc<dyn ProviderAdapter>)> = {
            let entries = self.entries.read().unwrap();
            entries
                .iter()
                .filter_map(|(id, entry)| {
                    entry
                        .lock()
                        .unwrap()
                        .adapter
                        .take()
                        .map(|a| (id.clone(), a))
                })
                .collect()
        };

        let mut tasks = JoinSet::new();
        for (id, adapter) in to_stop {
            tasks.spawn(async move {
                if let Err(e) = adapter.stop().await {
                    tracing::warn!("[Registry] Provider '{}' failed to stop: {}", id, e);
                } else {
                    tracing::info!("[Registry] Provider '{}' stopped", id);
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Health of every registered provider, concurrently.
    ///
    /// Every registered id appears in the result: never-started providers
    /// report disabled, and a check that errors reports unhealthy with the
    /// error message instead of being dropped.
    pub async fn health_all(&self) -> HashMap<String, HealthReport> {
        let mut reports: HashMap<String, HealthReport> = HashMap::new();
        let mut to_check: Vec<(String, Arc<dyn ProviderAdapter>)> = Vec::new();
        {
            let entries = self.entries.read().unwrap();
            for (id, entry) in entries.iter() {
                match entry.lock().unwrap().adapter.clone() {
                    Some(adapter) => to_check.push((id.clone(), adapter)),
                    None => {
                        reports.insert(id.clone(), HealthReport::disabled());
                    }
                }
            }
        }

        // Seed every checked id so a panicking check still reports.
        for (id, _) in &to_check {
            reports.insert(id.clone(), HealthReport::unhealthy("health check panicked"));
        }

        let mut tasks = JoinSet::new();
        for (id, adapter) in to_check {
            tasks.spawn(async move {
                let started = Instant::now();
                let result = adapter.health().await;
                let elapsed = started.elapsed();
                let report = match result {
                    Ok(report) => report,
                    Err(e) => HealthReport::unhealthy(&e.to_string())
                        .with_latency(elapsed.as_millis() as u64),
                };
                (id, report, elapsed)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let Ok((id, report, elapsed)) = joined else {
                continue;
            };
            if elapsed.as_millis() > SLOW_HEALTH_MS {
                tracing::warn!(
                    "[Registry] Health check for '{}' took {}ms",
                    id,
                    elapsed.as_millis()
                );
            }
            reports.insert(id, report);
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{Capabilities, NormalizedEvent, NormalizedSession, SessionFilters};
    use crate::providers::{
        EventCallback, HealthState, PromptInput, PromptOptions, ProviderKind, SessionPage,
        Subscription,
    };
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockAdapter {
        id: String,
        fail_start: bool,
    }

    #[async_trait]
    impl ProviderAdapter for MockAdapter {
        fn id(&self) -> &str {
            &self.id
        }
        fn kind(&self) -> ProviderKind {
            ProviderKind::Codex
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }
        async fn start(&self) -> Result<(), AdapterError> {
            if self.fail_start {
                Err(AdapterError::Transport("spawn failed".into()))
            } else {
                Ok(())
            }
        }
        async fn stop(&self) -> Result<(), AdapterError> {
            Ok(())
        }
        async fn health(&self) -> Result<HealthReport, AdapterError> {
            Ok(HealthReport::healthy())
        }
        async fn list_sessions(
            &self,
            _cursor: Option<String>,
            _filters: Option<SessionFilters>,
        ) -> Result<SessionPage, AdapterError> {
            Ok(SessionPage {
                sessions: Vec::new(),
                next_cursor: None,
            })
        }
        async fn open_session(&self, id: &str) -> Result<NormalizedSession, AdapterError> {
            Ok(NormalizedSession::new("mock", id))
        }
        async fn send_prompt(
            &self,
            _session_id: &str,
            _input: PromptInput,
            _options: Option<PromptOptions>,
        ) -> Result<(), AdapterError> {
            Ok(())
        }
        async fn subscribe(
            &self,
            session_id: &str,
            _callback: EventCallback,
        ) -> Result<Subscription, AdapterError> {
            Ok(Subscription {
                provider_id: self.id.clone(),
                session_id: session_id.to_string(),
                token: 0,
            })
        }
        async fn unsubscribe(&self, _subscription: &Subscription) -> Result<(), AdapterError> {
            Ok(())
        }
        fn normalize_event(&self, _raw: &Value) -> Option<NormalizedEvent> {
            None
        }
    }

    fn mock_factory(id: &str, fail_start: bool) -> AdapterFactory {
        let id = id.to_string();
        Box::new(move || {
            Arc::new(MockAdapter {
                id: id.clone(),
                fail_start,
            })
        })
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let registry = ProviderRegistry::new();
        registry
            .register("codex", ProviderConfig::default(), mock_factory("codex", false))
            .unwrap();
        let err = registry
            .register("codex", ProviderConfig::default(), mock_factory("codex", false))
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
        assert_eq!(registry.list(), vec!["codex"]);
    }

    #[tokio::test]
    async fn test_disabled_factory_is_never_invoked() {
        let invoked = Arc::new(AtomicUsize::new(0));
        let registry = ProviderRegistry::new();
        let counter = invoked.clone();
        registry
            .register(
                "off",
                ProviderConfig { enabled: false },
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Arc::new(MockAdapter {
                        id: "off".into(),
                        fail_start: false,
                    })
                }),
            )
            .unwrap();
        registry
            .register("on", ProviderConfig::default(), mock_factory("on", false))
            .unwrap();

        registry.start_all().await.unwrap();
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert!(registry.get("off").is_none());
        assert!(registry.get("on").is_some());
        assert!(!registry.is_enabled("off"));
    }

    #[tokio::test]
    async fn test_start_isolates_failures_and_clears_failed_adapters() {
        let registry = ProviderRegistry::new();
        registry
            .register("good", ProviderConfig::default(), mock_factory("good", false))
            .unwrap();
        registry
            .register("bad", ProviderConfig::default(), mock_factory("bad", true))
            .unwrap();

        registry.start_all().await.unwrap();
        assert!(registry.get("good").is_some());
        assert!(registry.get("bad").is_none());
    }

    #[tokio::test]
    async fn test_start_errs_only_when_nothing_starts() {
        let registry = ProviderRegistry::new();
        registry
            .register("bad", ProviderConfig::default(), mock_factory("bad", true))
            .unwrap();
        assert!(registry.start_all().await.is_err());
    }

    #[tokio::test]
    async fn test_health_all_covers_every_registered_id() {
        let registry = ProviderRegistry::new();
        registry
            .register("up", ProviderConfig::default(), mock_factory("up", false))
            .unwrap();
        registry
            .register("never", ProviderConfig { enabled: false }, mock_factory("never", false))
            .unwrap();
        registry.start_all().await.unwrap();

        let reports = registry.health_all().await;
        assert_eq!(reports.len(), 2);
        assert_eq!(reports["up"].status, HealthState::Healthy);
        assert_eq!(reports["never"].status, HealthState::Disabled);
    }

    #[tokio::test]
    async fn test_stop_all_drops_adapter_refs() {
        let registry = ProviderRegistry::new();
        registry
            .register("p", ProviderConfig::default(), mock_factory("p", false))
            .unwrap();
        registry.start_all().await.unwrap();
        assert!(registry.get("p").is_some());

        registry.stop_all().await;
        assert!(registry.get("p").is_none());
    }
}
