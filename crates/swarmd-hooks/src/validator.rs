//! Hook validation with caching and an audit trail.
//!
//! Every pre-tool decision is cached briefly (hashed on the full
//! `(tool, params)` payload) so repeated identical invocations skip the
//! policy walk; cache misses run the policy and append the decision to the
//! audit stream. Rejection reasons are also written at a stable per-session
//! key for UI display. Post-tool passes results through unchanged unless a
//! transformer is registered.

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::debug;

use swarmd_store::{AUDIT_STREAM, Store};

use crate::error::HookResult;
use crate::policy::{Decision, HookPolicy};

/// TTL for cached decisions. Short: policies are cheap and the cache only
/// exists to absorb identical bursts.
const DECISION_CACHE_TTL: Duration = Duration::from_secs(10);

/// Bound on cached decisions.
const DECISION_CACHE_CAPACITY: u64 = 4_096;

/// Post-tool result transformer (redaction, trimming, …).
pub type PostTransform = Arc<dyn Fn(&str, Value) -> Value + Send + Sync>;

/// Validates tool invocations coming from specialist workers.
#[derive(Clone)]
pub struct HookValidator {
    policy: Arc<HookPolicy>,
    cache: moka::sync::Cache<String, Decision>,
    store: Store,
    post_transforms: Arc<Vec<PostTransform>>,
}

impl HookValidator {
    pub fn new(store: Store) -> HookResult<Self> {
        Ok(Self {
            policy: Arc::new(HookPolicy::new()?),
            cache: moka::sync::Cache::builder()
                .max_capacity(DECISION_CACHE_CAPACITY)
                .time_to_live(DECISION_CACHE_TTL)
                .build(),
            store,
            post_transforms: Arc::new(Vec::new()),
        })
    }

    /// Register a post-tool transformer. Transformers run in registration
    /// order.
    pub fn with_post_transform(mut self, transform: PostTransform) -> Self {
        let mut transforms = (*self.post_transforms).clone();
        transforms.push(transform);
        self.post_transforms = Arc::new(transforms);
        self
    }

    /// Evaluate the pre-tool policy, serving identical payloads from cache.
    pub fn pre_tool(
        &self,
        session_id: &str,
        tool: &str,
        params: &Value,
        now: DateTime<Utc>,
    ) -> Decision {
        let key = fingerprint(tool, params);

        if let Some(cached) = self.cache.get(&key) {
            debug!(tool, "hook decision served from cache");
            self.store.run(|ks| ks.incr_counter("hook_cache_hits", 1));
            return cached;
        }

        let decision = self.policy.evaluate(tool, params);

        self.store.run(|ks| {
            ks.incr_counter("hook_validations", 1);
            if !decision.allow {
                ks.incr_counter("hook_rejections", 1);
                // Stable key so the dashboard can show the latest rejection
                // without replaying the audit stream.
                ks.set_value(
                    &format!("hooks:last_rejection:{session_id}"),
                    json!({
                        "tool": tool,
                        "reason": decision.reason,
                        "timestamp": now,
                    }),
                );
            }
            ks.emit(
                AUDIT_STREAM,
                "hook.audit",
                json!({
                    "session_id": session_id,
                    "tool": tool,
                    "allow": decision.allow,
                    "reason": decision.reason,
                    "warnings": decision.warnings,
                }),
                now,
            );
        });

        self.cache.insert(key, decision.clone());
        decision
    }

    /// Post-tool: pass the result through the registered transformers
    /// (unchanged when none are registered).
    pub fn post_tool(&self, tool: &str, result: Value) -> Value {
        self.post_transforms
            .iter()
            .fold(result, |acc, transform| transform(tool, acc))
    }

    /// Prompt guard: always allows, annotating suspicious content.
    pub fn user_prompt(&self, prompt: &str) -> Decision {
        let mut warnings = Vec::new();
        let lowered = prompt.to_lowercase();
        for marker in ["ignore previous instructions", "disregard your rules"] {
            if lowered.contains(marker) {
                warnings.push(format!("possible prompt injection: `{marker}`"));
            }
        }
        Decision {
            allow: true,
            reason: None,
            modified: None,
            warnings,
        }
    }

    /// Validate a todo-list write: an array of entries with `content`, and
    /// a sane `status` when present.
    pub fn todo_write(&self, todos: &Value) -> Result<usize, String> {
        let Some(items) = todos.as_array() else {
            return Err("todos must be an array".to_string());
        };
        for (index, item) in items.iter().enumerate() {
            if item.get("content").and_then(Value::as_str).is_none() {
                return Err(format!("todo[{index}] is missing `content`"));
            }
            if let Some(status) = item.get("status").and_then(Value::as_str) {
                if !matches!(status, "pending" | "in_progress" | "completed") {
                    return Err(format!("todo[{index}] has unknown status `{status}`"));
                }
            }
        }
        Ok(items.len())
    }

    /// The most recent rejection recorded for a session, if any.
    pub fn last_rejection(&self, session_id: &str) -> Option<Value> {
        self.store
            .run(|ks| ks.value(&format!("hooks:last_rejection:{session_id}")).cloned())
    }
}

/// Stable fingerprint over the full `(tool, params)` payload.
fn fingerprint(tool: &str, params: &Value) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    tool.hash(&mut hasher);
    params.to_string().hash(&mut hasher);
    format!("{tool}:{:016x}", hasher.finish())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
