//! The method registry and its dispatch pipeline.
//!
//! Dispatch order is fixed: validate → rate limit → circuit → cache →
//! invoke (with deadline) → record. Handlers never see a request their
//! configuration would reject, and every outcome lands in the metrics
//! registry.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::cache::ResultCache;
use crate::circuit::{CircuitBreaker, CircuitState};
use crate::error::{RegistryError, RegistryResult};
use crate::handler::{Handler, MethodConfig, Persister, RequestContext};
use crate::metrics::MetricsRegistry;
use crate::rate_limit::RateLimiter;

/// Default cap on cached responses across all methods.
const RESULT_CACHE_CAPACITY: u64 = 10_000;

/// Default TTL for cached responses when a method enables caching without
/// the registry-wide default being overridden.
const RESULT_CACHE_TTL: Duration = Duration::from_secs(30);

struct Registration {
    config: MethodConfig,
    handler: Arc<dyn Handler>,
    limiter: Option<RateLimiter>,
    circuit: Option<CircuitBreaker>,
}

/// Handler table keyed by dotted method name.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    methods: DashMap<String, Arc<Registration>>,
    cache: ResultCache,
    metrics: MetricsRegistry,
    persister: Option<Arc<dyn Persister>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_persister(None)
    }

    pub fn with_persister(persister: Option<Arc<dyn Persister>>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                methods: DashMap::new(),
                cache: ResultCache::new(RESULT_CACHE_CAPACITY, RESULT_CACHE_TTL),
                metrics: MetricsRegistry::new(),
                persister,
            }),
        }
    }

    /// Register a handler under a dotted method name. Re-registering a name
    /// replaces the previous entry.
    pub fn register(
        &self,
        method: impl Into<String>,
        config: MethodConfig,
        handler: Arc<dyn Handler>,
    ) {
        let method = method.into();
        debug!(method = %method, "handler registered");

        let limiter = config.rate_limit.map(RateLimiter::new);
        let circuit = config.circuit.map(CircuitBreaker::new);
        self.inner.methods.insert(
            method,
            Arc::new(Registration {
                config,
                handler,
                limiter,
                circuit,
            }),
        );
    }

    /// Dispatch one call through the full pipeline.
    #[instrument(skip(self, params, ctx), fields(client_id = %ctx.client_id))]
    pub async fn dispatch(
        &self,
        method: &str,
        params: Value,
        ctx: RequestContext,
    ) -> RegistryResult<Value> {
        let registration = self
            .inner
            .methods
            .get(method)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| RegistryError::MethodNotFound {
                method: method.to_string(),
            })?;

        let metrics = self.inner.metrics.method(method);
        metrics
            .invocations
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        // 1. Validate.
        if let Some(validator) = &registration.config.validator {
            validator(&params).map_err(|reason| {
                metrics
                    .errors
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                RegistryError::InvalidParams {
                    method: method.to_string(),
                    reason,
                }
            })?;
        }

        // 2. Rate limit (per client).
        if let Some(limiter) = &registration.limiter {
            if !limiter.try_acquire(&ctx.client_id) {
                metrics
                    .rate_limited
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return Err(RegistryError::RateLimited {
                    method: method.to_string(),
                });
            }
        }

        // 3. Circuit.
        if let Some(circuit) = &registration.circuit {
            if !circuit.allow() {
                return Err(RegistryError::CircuitOpen {
                    method: method.to_string(),
                });
            }
        }

        // 4. Cache.
        let cache_key = registration.config.cache.as_ref().map(|rule| {
            ResultCache::fingerprint(method, &params, &rule.key_fields)
        });
        if let Some(key) = &cache_key {
            if let Some(hit) = self.inner.cache.get(key).await {
                metrics
                    .cache_hits
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return Ok(hit);
            }
        }

        // 5. Invoke with the effective deadline: the tighter of the method
        // timeout and the transport deadline.
        let budget = match (registration.config.timeout, ctx.remaining()) {
            (Some(t), Some(r)) => Some(t.min(r)),
            (Some(t), None) => Some(t),
            (None, Some(r)) => Some(r),
            (None, None) => None,
        };

        let started = tokio::time::Instant::now();
        let result = match budget {
            Some(budget) => {
                match tokio::time::timeout(budget, registration.handler.call(params, ctx)).await {
                    Ok(result) => result,
                    Err(_) => Err(RegistryError::Timeout {
                        method: method.to_string(),
                        ms: budget.as_millis() as u64,
                    }),
                }
            }
            None => registration.handler.call(params, ctx).await,
        };
        let elapsed = started.elapsed();

        // 6. Record.
        match result {
            Ok(value) => {
                metrics.record_latency(elapsed);
                if let Some(circuit) = &registration.circuit {
                    circuit.record_success();
                }
                if let Some(key) = cache_key {
                    self.inner.cache.insert(key, value.clone()).await;
                }
                if registration.config.persist {
                    if let Some(persister) = &self.inner.persister {
                        if let Err(err) = persister.persist(method, &value).await {
                            warn!(method = %method, error = %err, "sink mirror failed");
                        }
                    }
                }
                Ok(value)
            }
            Err(err) => {
                metrics
                    .errors
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                if let Some(circuit) = &registration.circuit {
                    circuit.record_failure();
                }
                Err(err)
            }
        }
    }

    /// All registered method names, sorted.
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.methods.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.inner.methods.contains_key(method)
    }

    /// Circuit state per method that has a breaker configured.
    pub fn circuit_states(&self) -> Vec<(String, CircuitState)> {
        self.inner
            .methods
            .iter()
            .filter_map(|e| {
                e.value()
                    .circuit
                    .as_ref()
                    .map(|c| (e.key().clone(), c.state()))
            })
            .collect()
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.inner.metrics
    }

    pub fn cache(&self) -> &ResultCache {
        &self.inner.cache
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::FnHandler;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn echo_handler() -> Arc<FnHandler> {
        FnHandler::new(|params, _ctx| async move { Ok(json!({ "echo": params })) })
    }

    #[tokio::test]
    async fn unknown_method_rejected() {
        let registry = Registry::new();
        let err = registry
            .dispatch("no.such", json!({}), RequestContext::new("c1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::MethodNotFound { .. }));
    }

    #[tokio::test]
    async fn validation_runs_before_handler() {
        let registry = Registry::new();
        registry.register(
            "task.create",
            MethodConfig::new().require_fields(&["text"]),
            echo_handler(),
        );

        let err = registry
            .dispatch("task.create", json!({}), RequestContext::new("c1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidParams { .. }));

        let ok = registry
            .dispatch(
                "task.create",
                json!({"text": "hi"}),
                RequestContext::new("c1"),
            )
            .await
            .unwrap();
        assert_eq!(ok["echo"]["text"], "hi");
    }

    #[tokio::test]
    async fn rate_limit_rejects_burst() {
        let registry = Registry::new();
        registry.register(
            "system.heartbeat",
            MethodConfig::new().rate_limit(2, 0.001),
            echo_handler(),
        );

        let ctx = || RequestContext::new("w1");
        assert!(registry.dispatch("system.heartbeat", json!({}), ctx()).await.is_ok());
        assert!(registry.dispatch("system.heartbeat", json!({}), ctx()).await.is_ok());
        let err = registry
            .dispatch("system.heartbeat", json!({}), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::RateLimited { .. }));

        // A different client is unaffected.
        assert!(
            registry
                .dispatch("system.heartbeat", json!({}), RequestContext::new("w2"))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn circuit_trips_and_rejects() {
        let registry = Registry::new();
        registry.register(
            "swarm.decompose",
            MethodConfig::new().circuit(2, Duration::from_secs(60)),
            FnHandler::new(|_params, _ctx| async move {
                Err::<Value, _>(RegistryError::Internal("provider down".into()))
            }),
        );

        let ctx = || RequestContext::new("c1");
        for _ in 0..2 {
            let err = registry
                .dispatch("swarm.decompose", json!({}), ctx())
                .await
                .unwrap_err();
            assert!(matches!(err, RegistryError::Internal(_)));
        }

        // Third call is rejected without reaching the handler.
        let err = registry
            .dispatch("swarm.decompose", json!({}), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn cache_serves_repeat_calls() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let registry = Registry::new();
        registry.register(
            "docs.get",
            MethodConfig::new().cache(Duration::from_secs(60), &["name"]),
            FnHandler::new(move |params, _ctx| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({ "doc": params["name"] }))
                }
            }),
        );

        let ctx = || RequestContext::new("c1");
        let a = registry
            .dispatch("docs.get", json!({"name": "protocol"}), ctx())
            .await
            .unwrap();
        let b = registry
            .dispatch("docs.get", json!({"name": "protocol"}), ctx())
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Different key field misses.
        registry
            .dispatch("docs.get", json!({"name": "other"}), ctx())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn timeout_is_enforced() {
        let registry = Registry::new();
        registry.register(
            "slow.method",
            MethodConfig::new().timeout(Duration::from_millis(20)),
            FnHandler::new(|_params, _ctx| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!({}))
            }),
        );

        let err = registry
            .dispatch("slow.method", json!({}), RequestContext::new("c1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Timeout { .. }));
    }

    #[tokio::test]
    async fn metrics_record_outcomes() {
        let registry = Registry::new();
        registry.register("ok.method", MethodConfig::new(), echo_handler());
        registry.register(
            "bad.method",
            MethodConfig::new(),
            FnHandler::new(|_p, _c| async move {
                Err::<Value, _>(RegistryError::Internal("boom".into()))
            }),
        );

        let ctx = || RequestContext::new("c1");
        registry.dispatch("ok.method", json!({}), ctx()).await.unwrap();
        let _ = registry.dispatch("bad.method", json!({}), ctx()).await;

        let snap = registry.metrics().snapshot();
        assert_eq!(snap["ok.method"]["invocations"], 1);
        assert_eq!(snap["ok.method"]["errors"], 0);
        assert_eq!(snap["bad.method"]["errors"], 1);
    }
}
