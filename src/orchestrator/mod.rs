//! Fee recommendation orchestrator: collapses a multi-tier fee summary into
//! one recommended rate and serves it fail-soft.
//!
//! `recommended_fee()` never fails. A fresh cached rate is served without
//! I/O; otherwise the gateway is asked, and if it fails the last known good
//! rate is served, or the configured fallback when nothing has ever been
//! fetched. A cached rate older than `max_staleness` is no longer served.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::cache::{Claim, Outcome, SharedCell, Ticket};
use crate::config::Config;
use crate::gateway::{ChainGateway, FeeRate, FeeSummary, UpstreamError};
use crate::poller::PollSource;

/// Which tier (or combination) of the summary becomes the recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeePolicy {
    Fast,
    Medium,
    Slow,
    /// The upstream's minimum relay rate, or `slow` when it reports none.
    Minimum,
    /// Rounded mean of `fast` and `medium`.
    Blend,
}

impl FeePolicy {
    /// Always at least 1 sat/vB.
    pub fn select(self, summary: &FeeSummary) -> FeeRate {
        let rate = match self {
            Self::Fast => summary.fast,
            Self::Medium => summary.medium,
            Self::Slow => summary.slow,
            Self::Minimum => summary.minimum.unwrap_or(summary.slow),
            Self::Blend => (summary.fast + summary.medium + 1) / 2,
        };
        rate.max(1)
    }
}

#[derive(Debug, Clone)]
pub struct FeeSettings {
    pub policy: FeePolicy,
    pub fallback_rate: FeeRate,
    pub freshness: Duration,
    pub max_staleness: Duration,
    /// Age after which a served rate is flagged stale.
    pub stale_after: Duration,
}

impl FeeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            policy: config.fee.policy,
            fallback_rate: config.fee.fallback_rate,
            freshness: Duration::from_secs(config.fee.freshness_secs),
            max_staleness: Duration::from_secs(config.fee.max_staleness_secs),
            stale_after: config.fee_interval() * config.stale_after_cycles.max(1),
        }
    }
}

impl Default for FeeSettings {
    fn default() -> Self {
        Self {
            policy: FeePolicy::Medium,
            fallback_rate: 5,
            freshness: Duration::from_secs(15),
            max_staleness: Duration::from_secs(600),
            stale_after: Duration::from_secs(45),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeSource {
    /// Fetched during this call.
    Live,
    /// Served from the cache.
    Cached,
    /// Nothing has been fetched yet.
    Fallback,
    /// The cached rate outlived `max_staleness`; the fallback was served.
    Expired,
}

/// What a consumer receives: a copy, never a reference into the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeeQuote {
    pub fee_rate: FeeRate,
    pub source: FeeSource,
    pub fetched_at: Option<DateTime<Utc>>,
    pub age_secs: Option<u64>,
    pub stale: bool,
}

pub struct FeeOrchestrator {
    gateway: Arc<dyn ChainGateway>,
    settings: FeeSettings,
    cell: SharedCell<FeeRate>,
}

impl FeeOrchestrator {
    pub fn new(gateway: Arc<dyn ChainGateway>, settings: FeeSettings) -> Self {
        Self { gateway, settings, cell: SharedCell::new() }
    }

    /// The recommended rate. Never fails.
    ///
    /// A read that finds a fetch already in flight, whether a poll or
    /// another read, waits for that fetch instead of starting its own.
    pub async fn recommended_fee(&self) -> FeeQuote {
        let (fresh, held_seq) = {
            let cell = self.cell.lock();
            let fresh = cell.fresh(self.settings.freshness).is_some();
            (fresh, cell.current().map(|c| c.seq))
        };
        if fresh {
            return self.quote(FeeSource::Cached);
        }

        match self.cell.claim() {
            Claim::Lead(ticket) => match self.run(ticket).await {
                Ok(Outcome::Applied) => self.quote(FeeSource::Live),
                Ok(_) => self.quote(FeeSource::Cached),
                Err(e) => {
                    warn!(
                        provider = self.gateway.provider_id(),
                        kind = %e.kind,
                        "Fee refresh failed, serving last known good: {}",
                        e
                    );
                    self.quote(FeeSource::Cached)
                }
            },
            Claim::Follow(pending) => {
                self.cell.settled(pending).await;
                let updated = self.cell.lock().current().map(|c| c.seq) != held_seq;
                self.quote(if updated { FeeSource::Live } else { FeeSource::Cached })
            }
        }
    }

    /// The current quote without touching the network.
    pub fn cached_fee(&self) -> FeeQuote {
        self.quote(FeeSource::Cached)
    }

    /// Fetch, derive, and cache a new rate for a ticket from `claim()`.
    async fn run(&self, ticket: Ticket) -> Result<Outcome, UpstreamError> {
        let lease = self.cell.lease(ticket);
        let result = self
            .gateway
            .fee_summary()
            .await
            .map(|summary| self.settings.policy.select(&summary));

        let outcome = lease.settle(|cell, t| cell.complete(t, result.clone()));
        match (&result, outcome) {
            (Ok(rate), Outcome::Applied) => {
                debug!(fee_rate = rate, seq = ticket.seq(), "Recommended fee updated");
            }
            (Ok(rate), Outcome::Retired) => {
                debug!(fee_rate = rate, seq = ticket.seq(), "Fee result dropped, polling was deactivated");
            }
            _ => {}
        }
        result.map(|_| outcome)
    }

    fn quote(&self, source: FeeSource) -> FeeQuote {
        let cell = self.cell.lock();
        let Some(cached) = cell.current() else {
            return self.fallback(FeeSource::Fallback);
        };

        let age = cached.age();
        if age > self.settings.max_staleness {
            return self.fallback(FeeSource::Expired);
        }

        FeeQuote {
            fee_rate: cached.value,
            source,
            fetched_at: Some(cached.fetched_at_utc),
            age_secs: Some(age.as_secs()),
            stale: age > self.settings.stale_after,
        }
    }

    fn fallback(&self, source: FeeSource) -> FeeQuote {
        FeeQuote {
            fee_rate: self.settings.fallback_rate,
            source,
            fetched_at: None,
            age_secs: None,
            stale: source == FeeSource::Expired,
        }
    }
}

#[async_trait]
impl PollSource for FeeOrchestrator {
    type Value = FeeRate;

    fn target(&self) -> &'static str {
        "fee"
    }

    fn cell(&self) -> &SharedCell<FeeRate> {
        &self.cell
    }

    async fn fetch(&self, ticket: Ticket) -> Result<Outcome, UpstreamError> {
        self.run(ticket).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::ScriptedGateway;

    fn no_freshness() -> FeeSettings {
        FeeSettings { freshness: Duration::ZERO, ..FeeSettings::default() }
    }

    fn orchestrator(gateway: &Arc<ScriptedGateway>, settings: FeeSettings) -> FeeOrchestrator {
        FeeOrchestrator::new(Arc::clone(gateway) as Arc<dyn ChainGateway>, settings)
    }

    #[test]
    fn test_policy_selection() {
        let summary = FeeSummary::new(20, 10, 3);
        assert_eq!(FeePolicy::Fast.select(&summary), 20);
        assert_eq!(FeePolicy::Medium.select(&summary), 10);
        assert_eq!(FeePolicy::Slow.select(&summary), 3);
        assert_eq!(FeePolicy::Minimum.select(&summary), 3);
        assert_eq!(FeePolicy::Blend.select(&summary), 15);

        let summary = FeeSummary { minimum: Some(1), ..FeeSummary::new(7, 4, 2) };
        assert_eq!(FeePolicy::Minimum.select(&summary), 1);
        assert_eq!(FeePolicy::Blend.select(&summary), 6);
    }

    #[test]
    fn test_policy_never_zero() {
        let summary = FeeSummary::new(0, 0, 0);
        assert_eq!(FeePolicy::Medium.select(&summary), 1);
    }

    #[tokio::test]
    async fn test_fresh_session_unreachable_returns_fallback() {
        let gateway = Arc::new(ScriptedGateway::new());
        let orch = orchestrator(&gateway, no_freshness());

        let quote = orch.recommended_fee().await;
        assert_eq!(quote.fee_rate, 5);
        assert_eq!(quote.source, FeeSource::Fallback);
        assert_eq!(gateway.fee_calls(), 1);
    }

    #[tokio::test]
    async fn test_medium_then_failure_keeps_last_good() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_fees(20, 10, 3);
        gateway.push_fee_error("connection reset");
        let orch = orchestrator(&gateway, no_freshness());

        let first = orch.recommended_fee().await;
        assert_eq!(first.fee_rate, 10);
        assert_eq!(first.source, FeeSource::Live);

        let second = orch.recommended_fee().await;
        assert_eq!(second.fee_rate, 10);
        assert_eq!(second.source, FeeSource::Cached);
        assert_eq!(gateway.fee_calls(), 2);
    }

    #[tokio::test]
    async fn test_failures_never_regress_to_older_value() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_fees(30, 12, 4);
        gateway.push_fee_error("timeout");
        gateway.push_fees(40, 18, 6);
        gateway.push_fee_error("timeout");
        let orch = orchestrator(&gateway, no_freshness());

        let rates: Vec<FeeRate> = {
            let mut out = Vec::new();
            for _ in 0..6 {
                out.push(orch.recommended_fee().await.fee_rate);
            }
            out
        };
        assert_eq!(rates, vec![12, 12, 18, 18, 18, 18]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_freshness_window_skips_gateway() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_fees(20, 10, 3);
        let orch = orchestrator(&gateway, FeeSettings::default());

        orch.recommended_fee().await;
        let quote = orch.recommended_fee().await;
        assert_eq!(quote.source, FeeSource::Cached);
        assert_eq!(gateway.fee_calls(), 1);

        tokio::time::advance(Duration::from_secs(16)).await;
        let quote = orch.recommended_fee().await;
        assert_eq!(quote.source, FeeSource::Live);
        assert_eq!(gateway.fee_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_flag_then_expiry() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_fees(20, 10, 3);
        gateway.push_fee_error("unreachable");
        let orch = orchestrator(&gateway, no_freshness());

        assert_eq!(orch.recommended_fee().await.fee_rate, 10);

        tokio::time::advance(Duration::from_secs(60)).await;
        let quote = orch.recommended_fee().await;
        assert_eq!(quote.fee_rate, 10);
        assert!(quote.stale);

        tokio::time::advance(Duration::from_secs(600)).await;
        let quote = orch.recommended_fee().await;
        assert_eq!(quote.fee_rate, 5);
        assert_eq!(quote.source, FeeSource::Expired);
        assert!(quote.stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_reads_share_one_fetch() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_fees(20, 10, 3);
        gateway.set_delay(Duration::from_secs(5));
        let orch = Arc::new(orchestrator(&gateway, FeeSettings::default()));

        let readers: Vec<_> = (0..5)
            .map(|_| {
                let orch = Arc::clone(&orch);
                tokio::spawn(async move { orch.recommended_fee().await })
            })
            .collect();
        for reader in readers {
            let quote = reader.await.unwrap();
            assert_eq!(quote.fee_rate, 10);
            assert_eq!(quote.source, FeeSource::Live);
        }
        assert_eq!(gateway.fee_calls(), 1);
        assert_eq!(gateway.max_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_of_failed_fetch_gets_last_good() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_fees(20, 10, 3);
        gateway.push_fee_error_after(Duration::from_secs(5), "timeout");
        let orch = Arc::new(orchestrator(&gateway, no_freshness()));
        assert_eq!(orch.recommended_fee().await.fee_rate, 10);

        let leader = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.recommended_fee().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        let follower = orch.recommended_fee().await;

        assert_eq!(follower.fee_rate, 10);
        assert_eq!(follower.source, FeeSource::Cached);
        assert_eq!(leader.await.unwrap().fee_rate, 10);
        assert_eq!(gateway.fee_calls(), 2);
    }
}
