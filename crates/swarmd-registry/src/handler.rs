//! Handler trait, per-request context, and the declarative method
//! configuration attached at registration.
//!
//! Handlers are plain async functions over `(params, context)`; every
//! cross-cutting concern — rate limiting, caching, timeouts, circuit
//! breaking, sink mirroring — is configuration the registry applies around
//! them, never logic inside them.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::RegistryResult;

// ---------------------------------------------------------------------------
// Request context
// ---------------------------------------------------------------------------

/// Per-request context threaded through dispatch into handlers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Stable id of the calling client/session; the rate-limit key.
    pub client_id: String,
    /// Absolute deadline for this request, if the transport set one.
    pub deadline: Option<tokio::time::Instant>,
}

impl RequestContext {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, timeout: Duration) -> Self {
        self.deadline = Some(tokio::time::Instant::now() + timeout);
        self
    }

    /// Time remaining until the deadline, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(tokio::time::Instant::now()))
    }
}

// ---------------------------------------------------------------------------
// Handler trait
// ---------------------------------------------------------------------------

/// A registered method implementation.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, params: Value, ctx: RequestContext) -> RegistryResult<Value>;
}

type BoxedHandlerFn = Box<
    dyn Fn(Value, RequestContext) -> Pin<Box<dyn Future<Output = RegistryResult<Value>> + Send>>
        + Send
        + Sync,
>;

/// Adapter so plain async closures register without a trait impl.
pub struct FnHandler {
    f: BoxedHandlerFn,
}

impl FnHandler {
    pub fn new<F, Fut>(f: F) -> Arc<Self>
    where
        F: Fn(Value, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RegistryResult<Value>> + Send + 'static,
    {
        Arc::new(Self {
            f: Box::new(move |params, ctx| Box::pin(f(params, ctx))),
        })
    }
}

#[async_trait]
impl Handler for FnHandler {
    async fn call(&self, params: Value, ctx: RequestContext) -> RegistryResult<Value> {
        (self.f)(params, ctx).await
    }
}

// ---------------------------------------------------------------------------
// Method configuration
// ---------------------------------------------------------------------------

/// Per-client token bucket rule.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitRule {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

/// Result cache rule: responses are cached by a fingerprint of the selected
/// param fields (all params when `key_fields` is empty).
#[derive(Debug, Clone)]
pub struct CacheRule {
    pub ttl: Duration,
    pub key_fields: Vec<String>,
}

/// Circuit breaker rule.
#[derive(Debug, Clone, Copy)]
pub struct CircuitRule {
    /// Consecutive failures before the circuit trips.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a half-open probe.
    pub trip_for: Duration,
}

/// Validation callback applied before any other pipeline stage.
pub type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Declarative instrumentation attached to a handler at registration.
#[derive(Clone, Default)]
pub struct MethodConfig {
    pub rate_limit: Option<RateLimitRule>,
    pub cache: Option<CacheRule>,
    pub timeout: Option<Duration>,
    pub circuit: Option<CircuitRule>,
    /// Mirror success results to the relational sink.
    pub persist: bool,
    pub validator: Option<Validator>,
}

impl MethodConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rate_limit(mut self, capacity: u32, refill_per_sec: f64) -> Self {
        self.rate_limit = Some(RateLimitRule {
            capacity,
            refill_per_sec,
        });
        self
    }

    pub fn cache(mut self, ttl: Duration, key_fields: &[&str]) -> Self {
        self.cache = Some(CacheRule {
            ttl,
            key_fields: key_fields.iter().map(|f| f.to_string()).collect(),
        });
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn circuit(mut self, failure_threshold: u32, trip_for: Duration) -> Self {
        self.circuit = Some(CircuitRule {
            failure_threshold,
            trip_for,
        });
        self
    }

    pub fn persist(mut self) -> Self {
        self.persist = true;
        self
    }

    /// Require the listed top-level params fields to be present.
    pub fn require_fields(mut self, fields: &'static [&'static str]) -> Self {
        self.validator = Some(Arc::new(move |params: &Value| {
            for field in fields {
                if params.get(field).is_none() {
                    return Err(format!("missing required field: {field}"));
                }
            }
            Ok(())
        }));
        self
    }

    pub fn validate_with(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }
}

/// Mirrors success results of `persist`-flagged methods to the sink.
#[async_trait]
pub trait Persister: Send + Sync {
    async fn persist(&self, method: &str, result: &Value) -> Result<(), String>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
