//! Chain data gateway: provider-agnostic access to upstream chain APIs.
//!
//! Any upstream indexer (mempool.space, UniSat, ...) implements
//! [`ChainGateway`]. The orchestrator and the chain tip tracker call the
//! gateway; the gateway never caches, never retries, and never sees the
//! layers above it. Every failure leaves this module as an [`UpstreamError`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{UpstreamConfig, UpstreamKind};

pub mod mempool;
pub mod unisat;

#[cfg(test)]
pub mod mock;

/// Fallback text used when a failure carries no message of its own.
pub const UNKNOWN_ERROR: &str = "unknown error";

/// Fee rate in sat/vB.
pub type FeeRate = u64;

/// Height of the chain tip.
pub type BlockHeight = u64;

// ── Core Types ──────────────────────────────────────────────────────

/// Snapshot of network fee tiers at a point in time.
///
/// Never mutated after a fetch; the next fetch produces a new summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSummary {
    pub fast: FeeRate,
    pub medium: FeeRate,
    pub slow: FeeRate,
    #[serde(default)]
    pub minimum: Option<FeeRate>,
    pub fetched_at: DateTime<Utc>,
}

impl FeeSummary {
    #[cfg(test)]
    pub fn new(fast: FeeRate, medium: FeeRate, slow: FeeRate) -> Self {
        Self { fast, medium, slow, minimum: None, fetched_at: Utc::now() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamErrorKind {
    /// Connection refused, DNS failure, TLS failure, reset mid-body.
    Transport,
    Timeout,
    /// Non-2xx HTTP status.
    Status,
    /// The upstream answered 2xx with an application-level error code.
    Rejected,
    /// Body could not be decoded into the expected shape.
    Malformed,
}

impl fmt::Display for UpstreamErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::Status => "status",
            Self::Rejected => "rejected",
            Self::Malformed => "malformed",
        };
        f.write_str(s)
    }
}

/// The single failure kind surfaced by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct UpstreamError {
    pub kind: UpstreamErrorKind,
    pub message: String,
}

impl UpstreamError {
    pub fn new(kind: UpstreamErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message_or_unknown(message.into()) }
    }

    /// Build from an arbitrary cause, keeping only its human-readable text.
    pub fn from_cause(kind: UpstreamErrorKind, cause: &dyn std::error::Error) -> Self {
        Self::new(kind, cause.to_string())
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::Malformed, message)
    }

    pub fn status(status: u16, body: &str) -> Self {
        let snippet = body.trim();
        let snippet = &snippet[..floor_char_boundary(snippet, 200)];
        let message = if snippet.is_empty() {
            format!("upstream returned HTTP {}", status)
        } else {
            format!("upstream returned HTTP {}: {}", status, snippet)
        };
        Self::new(UpstreamErrorKind::Status, message)
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            UpstreamErrorKind::Timeout
        } else if e.is_decode() {
            UpstreamErrorKind::Malformed
        } else if e.is_status() {
            UpstreamErrorKind::Status
        } else {
            UpstreamErrorKind::Transport
        };
        Self::from_cause(kind, &e)
    }
}

impl From<serde_json::Error> for UpstreamError {
    fn from(e: serde_json::Error) -> Self {
        Self::from_cause(UpstreamErrorKind::Malformed, &e)
    }
}

fn message_or_unknown(message: String) -> String {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        UNKNOWN_ERROR.to_string()
    } else {
        trimmed.to_string()
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    let mut idx = max;
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

// ── Gateway Trait ───────────────────────────────────────────────────

/// Read-only access to an upstream chain API.
///
/// Implementations must not retry and must not cache: a failure is
/// returned to the caller as soon as it happens.
#[async_trait]
pub trait ChainGateway: Send + Sync {
    /// Unique upstream identifier (e.g., "mempool", "unisat").
    fn provider_id(&self) -> &str;

    async fn fee_summary(&self) -> Result<FeeSummary, UpstreamError>;

    async fn latest_block_height(&self) -> Result<BlockHeight, UpstreamError>;
}

/// Build the configured upstream gateway.
pub fn from_config(config: &UpstreamConfig) -> Result<Arc<dyn ChainGateway>> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .user_agent(concat!("feewatch/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    let gateway: Arc<dyn ChainGateway> = match config.kind {
        UpstreamKind::Mempool => Arc::new(mempool::MempoolGateway::new(
            client,
            config.base_url.as_deref().unwrap_or(mempool::DEFAULT_BASE_URL),
        )),
        UpstreamKind::Unisat => Arc::new(unisat::UnisatGateway::new(
            client,
            config.base_url.as_deref().unwrap_or(unisat::DEFAULT_BASE_URL),
            config.api_key.clone(),
        )),
    };
    Ok(gateway)
}

/// GET `url` and return the body, mapping every failure to [`UpstreamError`].
pub(crate) async fn get_text(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
) -> Result<String, UpstreamError> {
    let mut req = client.get(url);
    if let Some(key) = bearer {
        req = req.bearer_auth(key);
    }
    let resp = req.send().await?;
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(UpstreamError::status(status.as_u16(), &body));
    }
    Ok(body)
}

/// Convert a wire fee value (possibly fractional) to a whole sat/vB rate.
pub(crate) fn whole_rate(value: f64) -> Result<FeeRate, UpstreamError> {
    if !value.is_finite() || value < 0.0 {
        return Err(UpstreamError::malformed(format!("invalid fee rate {}", value)));
    }
    Ok(value.ceil() as FeeRate)
}
