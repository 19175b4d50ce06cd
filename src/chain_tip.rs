//! Chain tip tracker: cached block height with a monotonicity check.
//!
//! Heights only move forward. When the upstream reports a lower tip than
//! the one already held, the held height is kept and the observation is
//! surfaced as a [`HeightRegression`] on subsequent readings until the tip
//! is confirmed again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::cache::{Claim, Outcome, SharedCell, Ticket};
use crate::config::Config;
use crate::gateway::{BlockHeight, ChainGateway, UpstreamError, UNKNOWN_ERROR};
use crate::poller::PollSource;

#[derive(Debug, Clone)]
pub struct HeightSettings {
    pub freshness: Duration,
    pub stale_after: Duration,
}

impl HeightSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            freshness: Duration::from_secs(config.block_height.freshness_secs),
            stale_after: config.height_interval() * config.stale_after_cycles.max(1),
        }
    }
}

impl Default for HeightSettings {
    fn default() -> Self {
        Self { freshness: Duration::from_secs(10), stale_after: Duration::from_secs(30) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeightRegression {
    pub observed: BlockHeight,
    pub held: BlockHeight,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeightReading {
    pub height: BlockHeight,
    pub fetched_at: DateTime<Utc>,
    pub age_secs: u64,
    pub stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regression: Option<HeightRegression>,
}

pub struct ChainTip {
    gateway: Arc<dyn ChainGateway>,
    settings: HeightSettings,
    cell: SharedCell<BlockHeight>,
    regression: Mutex<Option<HeightRegression>>,
    regressions_total: AtomicU64,
}

impl ChainTip {
    pub fn new(gateway: Arc<dyn ChainGateway>, settings: HeightSettings) -> Self {
        Self {
            gateway,
            settings,
            cell: SharedCell::new(),
            regression: Mutex::new(None),
            regressions_total: AtomicU64::new(0),
        }
    }

    fn regression(&self) -> MutexGuard<'_, Option<HeightRegression>> {
        self.regression.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serve a fresh cached height, else fetch. Failures are returned to the
    /// caller rather than papered over. A read that finds a fetch in flight
    /// waits for it and reports its result.
    pub async fn latest_block_height(&self) -> Result<HeightReading, UpstreamError> {
        let fresh = self.cell.lock().fresh(self.settings.freshness).is_some();
        if !fresh {
            match self.cell.claim() {
                Claim::Lead(ticket) => {
                    self.run(ticket).await?;
                }
                Claim::Follow(pending) => {
                    if self.cell.settled(pending).await == Some(Outcome::Failed) {
                        let err = self.cell.lock().last_error().cloned();
                        return Err(err.unwrap_or_else(|| UpstreamError::malformed(UNKNOWN_ERROR)));
                    }
                }
            }
        }
        self.reading()
            .ok_or_else(|| UpstreamError::malformed("no block height observed"))
    }

    /// Fetch the tip for a ticket from `claim()` and fold it into the cache.
    async fn run(&self, ticket: Ticket) -> Result<Outcome, UpstreamError> {
        let lease = self.cell.lease(ticket);
        let observed = match self.gateway.latest_block_height().await {
            Ok(h) => h,
            Err(e) => {
                lease.settle(|cell, t| cell.complete(t, Err(e.clone())));
                return Err(e);
            }
        };

        let outcome = lease.settle(|cell, t| {
            let held = cell.current().map(|c| c.value);
            match held {
                Some(held) if observed < held && cell.accepts(t) => {
                    *self.regression() = Some(HeightRegression {
                        observed,
                        held,
                        detected_at: Utc::now(),
                    });
                    cell.reject(t)
                }
                _ => {
                    let outcome = cell.complete(t, Ok(observed));
                    if outcome == Outcome::Applied {
                        *self.regression() = None;
                    }
                    outcome
                }
            }
        });

        match outcome {
            Outcome::Applied => debug!(height = observed, "Block height updated"),
            Outcome::Rejected => {
                self.regressions_total.fetch_add(1, Ordering::Relaxed);
                warn!(
                    provider = self.gateway.provider_id(),
                    observed = observed,
                    "Upstream block height went backwards, keeping held tip"
                );
            }
            Outcome::Retired => {
                debug!(height = observed, "Height result dropped, polling was deactivated");
            }
            _ => {}
        }
        Ok(outcome)
    }

    /// The cached reading without touching the network.
    pub fn reading(&self) -> Option<HeightReading> {
        let (height, fetched_at, age) = {
            let cell = self.cell.lock();
            let cached = cell.current()?;
            (cached.value, cached.fetched_at_utc, cached.age())
        };
        Some(HeightReading {
            height,
            fetched_at,
            age_secs: age.as_secs(),
            stale: age > self.settings.stale_after,
            regression: self.regression().clone(),
        })
    }

    pub fn regressions_total(&self) -> u64 {
        self.regressions_total.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PollSource for ChainTip {
    type Value = BlockHeight;

    fn target(&self) -> &'static str {
        "block_height"
    }

    fn cell(&self) -> &SharedCell<BlockHeight> {
        &self.cell
    }

    async fn fetch(&self, ticket: Ticket) -> Result<Outcome, UpstreamError> {
        self.run(ticket).await
    }

    fn anomaly(&self) -> Option<String> {
        self.regression()
            .as_ref()
            .map(|r| format!("block height went backwards: observed {}, held {}", r.observed, r.held))
    }
}
