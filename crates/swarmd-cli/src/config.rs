//! Environment configuration.
//!
//! Every runtime knob lives in an environment variable with a sensible
//! default, so a bare `swarmd serve` works on a laptop and a container
//! image configures itself from its manifest. Rate-limit and resilience
//! defaults are centralized here rather than scattered per handler.

use std::time::Duration;

use anyhow::{Context, Result};
use url::Url;

/// Resolved configuration for one swarmd process.
#[derive(Debug, Clone)]
pub struct SwarmdConfig {
    /// `SWARMD_BIND` — listen address for `/rpc` and `/ws`.
    pub bind: String,
    /// `SWARMD_SINK_PATH` — SQLite archive path; `:memory:` for ephemeral.
    pub sink_path: String,
    /// `SWARMD_SAMPLING_URL` — sampling provider base URL.
    pub sampling_url: Url,
    /// `SWARMD_SAMPLING_TIMEOUT_SECS` — per-attempt provider deadline.
    pub sampling_timeout: Duration,
    /// `SWARMD_SAMPLING_ATTEMPTS` — provider retry bound.
    pub sampling_attempts: u32,
    /// `SWARMD_HEARTBEAT_TIMEOUT_SECS` — heartbeat age before OFFLINE.
    pub offline_after: Duration,
    /// `SWARMD_SWEEP_INTERVAL_SECS` — failure-sweeper cadence.
    pub sweep_interval: Duration,
    /// `SWARMD_EVICT_AFTER_SECS` — how long OFFLINE records linger.
    pub evict_after: Duration,
    /// `SWARMD_DEFAULT_MAX_LOAD` — default worker capacity.
    pub default_max_load: u32,
    /// `SWARMD_STREAM_CAP` — per-stream event retention.
    pub stream_cap: usize,
    /// `SWARMD_FLUSH_TOKEN` — guard for `system.flush`; flush disabled when
    /// unset.
    pub flush_token: Option<String>,
    /// `SWARMD_LOG_JSON` — emit JSON log lines instead of human format.
    pub log_json: bool,
}

impl SwarmdConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration from an arbitrary lookup (tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let sampling_url = lookup("SWARMD_SAMPLING_URL")
            .unwrap_or_else(|| "http://127.0.0.1:8600/".to_string());

        Ok(Self {
            bind: lookup("SWARMD_BIND").unwrap_or_else(|| "127.0.0.1:8500".to_string()),
            sink_path: lookup("SWARMD_SINK_PATH")
                .unwrap_or_else(|| "swarmd-sink.db".to_string()),
            sampling_url: Url::parse(&sampling_url)
                .with_context(|| format!("invalid SWARMD_SAMPLING_URL: {sampling_url}"))?,
            sampling_timeout: secs(&lookup, "SWARMD_SAMPLING_TIMEOUT_SECS", 30)?,
            sampling_attempts: int(&lookup, "SWARMD_SAMPLING_ATTEMPTS", 3)?,
            offline_after: secs(&lookup, "SWARMD_HEARTBEAT_TIMEOUT_SECS", 30)?,
            sweep_interval: secs(&lookup, "SWARMD_SWEEP_INTERVAL_SECS", 2)?,
            evict_after: secs(&lookup, "SWARMD_EVICT_AFTER_SECS", 300)?,
            default_max_load: int(&lookup, "SWARMD_DEFAULT_MAX_LOAD", 3)?,
            stream_cap: int(&lookup, "SWARMD_STREAM_CAP", 10_000)?,
            flush_token: lookup("SWARMD_FLUSH_TOKEN").filter(|t| !t.is_empty()),
            log_json: lookup("SWARMD_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }
}

fn secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_secs(int(lookup, key, default)?))
}

fn int<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr + Copy,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("invalid {key}: {raw}")),
        None => Ok(default),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
