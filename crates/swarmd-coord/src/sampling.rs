//! Sampling provider client.
//!
//! The LLM provider behind `POST /decompose`, `/context`, `/resolve`,
//! `/synthesize` (plus `GET /health` and `/stats`) is treated as untrusted
//! for structure: every response is deserialized against the phase's typed
//! schema, and a schema failure surfaces as
//! [`CoordError::SamplingSchemaInvalid`] so the caller can take the
//! deterministic fallback path. Requests are retried with exponential
//! backoff plus jitter up to a configured attempts bound.

use std::time::Duration;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use swarmd_store::{DecompositionPlan, Proposal, SpecialistView};

use crate::error::{CoordError, CoordResult};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SamplingConfig {
    /// Provider base URL, e.g. `http://localhost:8600`.
    pub base_url: Url,
    /// Overall deadline per HTTP attempt.
    pub request_timeout: Duration,
    /// Attempts bound (first try included).
    pub max_attempts: u32,
    /// Base backoff; attempt `n` waits `base * 2^n` plus jitter.
    pub backoff_base: Duration,
}

impl SamplingConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            request_timeout: Duration::from_secs(30),
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
        }
    }
}

// ---------------------------------------------------------------------------
// Phase payloads
// ---------------------------------------------------------------------------

/// Prompt context for project decomposition.
#[derive(Debug, Clone, Serialize)]
pub struct DecomposeRequest {
    pub task_id: String,
    pub text: String,
    pub priority: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraints: Option<serde_json::Value>,
    /// Snapshot of the live specialist pool so the provider sizes subtasks
    /// to real capacity.
    pub specialists: Vec<PoolEntry>,
    /// Fully rendered decomposition prompt.
    pub prompt: String,
}

/// One pool member as shown to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolEntry {
    pub id: String,
    pub kind: String,
    pub capabilities: Vec<String>,
    pub current_load: u32,
    pub max_load: u32,
}

impl PoolEntry {
    pub fn from_view(kind: &str, view: &SpecialistView) -> Self {
        Self {
            id: view.id.clone(),
            kind: kind.to_string(),
            capabilities: view.capabilities.iter().cloned().collect(),
            current_load: view.current_load,
            max_load: view.max_load,
        }
    }
}

/// Prompt context for a per-subtask execution brief.
#[derive(Debug, Clone, Serialize)]
pub struct ContextRequest {
    pub subtask_id: String,
    pub parent_task_id: String,
    pub specialist: String,
    pub description: String,
    /// Outputs of already-completed sibling subtasks.
    pub completed_work: Vec<CompletedWork>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletedWork {
    pub subtask_id: String,
    pub specialist: String,
    pub output: String,
}

/// The provider's execution brief for one subtask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextBrief {
    pub scope: String,
    #[serde(default)]
    pub mandatory_readings: Vec<String>,
    #[serde(default)]
    pub architecture_constraints: Vec<String>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub related_work: Vec<String>,
}

/// Prompt context for conflict arbitration.
#[derive(Debug, Clone, Serialize)]
pub struct ResolveRequest {
    pub conflict_id: String,
    pub task_id: String,
    pub subtask_id: String,
    pub solutions: Vec<Proposal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

/// The provider's arbitration choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionChoice {
    /// Instance whose proposal wins.
    pub chosen_instance_id: String,
    pub reasoning: String,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

/// Prompt context for final synthesis.
#[derive(Debug, Clone, Serialize)]
pub struct SynthesizeRequest {
    pub task_id: String,
    pub text: String,
    pub completed_subtasks: Vec<CompletedWork>,
}

/// Integration verdict for a fully-completed parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStatus {
    ReadyForIntegration,
    RequiresFixes,
    Integrated,
}

/// The provider's synthesis output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisReport {
    pub status: IntegrationStatus,
    #[serde(default)]
    pub integration_steps: Vec<String>,
    #[serde(default)]
    pub next_actions: Vec<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client for the sampling provider.
#[derive(Clone)]
pub struct SamplingClient {
    config: SamplingConfig,
    http: reqwest::Client,
}

impl SamplingClient {
    pub fn new(config: SamplingConfig) -> CoordResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| CoordError::SamplingRequestFailed {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { config, http })
    }

    pub async fn decompose(&self, request: &DecomposeRequest) -> CoordResult<DecompositionPlan> {
        self.post_with_retry("decompose", request).await
    }

    pub async fn context(&self, request: &ContextRequest) -> CoordResult<ContextBrief> {
        self.post_with_retry("context", request).await
    }

    pub async fn resolve(&self, request: &ResolveRequest) -> CoordResult<ResolutionChoice> {
        self.post_with_retry("resolve", request).await
    }

    pub async fn synthesize(&self, request: &SynthesizeRequest) -> CoordResult<SynthesisReport> {
        self.post_with_retry("synthesize", request).await
    }

    /// Provider liveness; never retries.
    pub async fn health(&self) -> bool {
        let Ok(url) = self.config.base_url.join("health") else {
            return false;
        };
        match self.http.get(url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Provider-side statistics, passed through opaquely.
    pub async fn stats(&self) -> CoordResult<serde_json::Value> {
        let url = self.join("stats")?;
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| CoordError::SamplingRequestFailed {
                reason: e.to_string(),
            })?;
        resp.json().await.map_err(|e| CoordError::SamplingSchemaInvalid {
            reason: e.to_string(),
        })
    }

    // -- Internals -----------------------------------------------------------

    fn join(&self, path: &str) -> CoordResult<Url> {
        self.config
            .base_url
            .join(path)
            .map_err(|e| CoordError::SamplingRequestFailed {
                reason: format!("bad provider url: {e}"),
            })
    }

    async fn post_with_retry<Req, Resp>(&self, path: &str, request: &Req) -> CoordResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = self.join(path)?;
        let mut last_error = String::new();

        for attempt in 0..self.config.max_attempts {
            if attempt > 0 {
                let delay = backoff_delay(self.config.backoff_base, attempt);
                debug!(path, attempt, ?delay, "sampling retry backoff");
                tokio::time::sleep(delay).await;
            }

            match self.post_once(url.clone(), request).await {
                Ok(resp) => return Ok(resp),
                // A schema failure is not transient: retrying the same
                // prompt yields the same malformed shape often enough that
                // the caller's fallback is the better spend.
                Err(CoordError::SamplingSchemaInvalid { reason }) => {
                    warn!(path, %reason, "sampling response failed schema validation");
                    return Err(CoordError::SamplingSchemaInvalid { reason });
                }
                Err(err) => {
                    last_error = err.to_string();
                    warn!(path, attempt, error = %last_error, "sampling attempt failed");
                }
            }
        }

        Err(CoordError::SamplingExhausted {
            attempts: self.config.max_attempts,
            last_error,
        })
    }

    async fn post_once<Req, Resp>(&self, url: Url, request: &Req) -> CoordResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let resp = self
            .http
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| CoordError::SamplingRequestFailed {
                reason: e.to_string(),
            })?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| CoordError::SamplingRequestFailed {
                reason: format!("failed to read body: {e}"),
            })?;

        if !status.is_success() {
            return Err(CoordError::SamplingRequestFailed {
                reason: format!("provider returned {status}: {body}"),
            });
        }

        serde_json::from_str(&body).map_err(|e| CoordError::SamplingSchemaInvalid {
            reason: format!("{e} (body: {})", truncate(&body, 200)),
        })
    }
}

/// Exponential backoff with uniform jitter in `[0, base)`.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let jitter_ms = rand::rng().random_range(0..base.as_millis().max(1) as u64);
    exp + Duration::from_millis(jitter_ms)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
