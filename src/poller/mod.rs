//! Polling adapter: drives a [`PollSource`] on a fixed interval and
//! republishes its latest value to subscribers.
//!
//! Lifecycle per pollable value: `Idle -> Polling -> Idle`.
//! - `activate()` arms exactly one timer; further calls are no-ops.
//! - Each tick issues a fetch unless one is already in flight, so a slow
//!   upstream never stacks requests. Skipped ticks count as missed cycles.
//! - `deactivate()` cancels the timer and tears down the poll state. A fetch
//!   still in flight may finish, but its result is dropped.
//!
//! The poller keeps no cache of its own. [`PollState`] is read from the
//! source's [`SharedCell`], and while active the poller republishes on every
//! change to that cell, including fetches started by direct reads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Duration;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::cache::{Claim, Outcome, SharedCell, Ticket};
use crate::gateway::UpstreamError;

pub mod scheduler;

use scheduler::TaskHandle;

/// Something the poller can re-invoke.
#[async_trait]
pub trait PollSource: Send + Sync + 'static {
    type Value: Clone + Serialize + Send + Sync + 'static;

    /// Short name used in logs and RPC (e.g., "fee").
    fn target(&self) -> &'static str;

    /// The one cache for this value, shared with direct reads.
    fn cell(&self) -> &SharedCell<Self::Value>;

    /// Fetch for a ticket issued by `cell().claim()` and settle it.
    async fn fetch(&self, ticket: Ticket) -> Result<Outcome, UpstreamError>;

    /// Something wrong with the held value that is not a fetch failure.
    fn anomaly(&self) -> Option<String> {
        None
    }
}

/// Published snapshot of one pollable value.
#[derive(Debug, Clone, Serialize)]
pub struct PollState<T> {
    pub target: &'static str,
    pub active: bool,
    pub interval_secs: u64,
    pub value: Option<T>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub in_flight: bool,
    pub consecutive_failures: u32,
    pub missed_cycles: u32,
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anomaly: Option<String>,
}

impl<T> PollState<T> {
    fn idle(target: &'static str, interval: Duration) -> Self {
        Self {
            target,
            active: false,
            interval_secs: interval.as_secs(),
            value: None,
            fetched_at: None,
            last_attempt_at: None,
            in_flight: false,
            consecutive_failures: 0,
            missed_cycles: 0,
            last_error: None,
            anomaly: None,
        }
    }

    /// A value is held but `max_missed` cycles have passed without refreshing it.
    pub fn is_stale(&self, max_missed: u32) -> bool {
        self.value.is_some() && self.missed_cycles >= max_missed
    }
}

/// What one activation owns. Dropping it stops both tasks.
struct Activation {
    timer: TaskHandle,
    _follow: DropGuard,
}

struct Shared<S: PollSource> {
    source: Arc<S>,
    interval: Duration,
    active: AtomicBool,
    /// Serializes activate/deactivate.
    activation: Mutex<Option<Activation>>,
    /// Serializes building and sending a state.
    publishing: Mutex<()>,
    state_tx: watch::Sender<PollState<S::Value>>,
}

pub struct Poller<S: PollSource> {
    shared: Arc<Shared<S>>,
}

impl<S: PollSource> Clone for Poller<S> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<S: PollSource> Poller<S> {
    pub fn new(source: Arc<S>, interval: Duration) -> Self {
        let (state_tx, _) = watch::channel(PollState::idle(source.target(), interval));

        Self {
            shared: Arc::new(Shared {
                source,
                interval,
                active: AtomicBool::new(false),
                activation: Mutex::new(None),
                publishing: Mutex::new(()),
                state_tx,
            }),
        }
    }

    pub fn target(&self) -> &'static str {
        self.shared.source.target()
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Start polling. Returns `false` if already polling.
    pub fn activate(&self) -> bool {
        let mut slot = self.shared.lock_activation();
        if slot.is_some() {
            return false;
        }

        self.shared.active.store(true, Ordering::SeqCst);
        let weak: Weak<Shared<S>> = Arc::downgrade(&self.shared);
        let timer = scheduler::schedule(self.shared.interval, move || {
            if let Some(shared) = weak.upgrade() {
                shared.issue_fetch();
            }
        });
        *slot = Some(Activation { timer, _follow: self.shared.follow_source() });
        drop(slot);

        info!(
            pollable = self.target(),
            interval_secs = self.shared.interval.as_secs(),
            "Polling activated"
        );
        self.shared.publish();
        true
    }

    /// Stop polling and discard the poll state. Returns `false` if idle.
    pub fn deactivate(&self) -> bool {
        let mut slot = self.shared.lock_activation();
        let Some(activation) = slot.take() else {
            return false;
        };
        activation.timer.cancel();
        drop(activation);
        self.shared.active.store(false, Ordering::SeqCst);
        self.shared.source.cell().retire();
        drop(slot);

        info!(pollable = self.target(), "Polling deactivated");
        self.shared.publish();
        true
    }

    /// On-demand fetch outside the tick schedule. Coalesces with a fetch
    /// already in flight; does nothing while idle.
    pub fn refetch(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        self.shared.issue_fetch()
    }

    pub fn state(&self) -> PollState<S::Value> {
        self.shared.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PollState<S::Value>> {
        self.shared.state_tx.subscribe()
    }
}

impl<S: PollSource> Shared<S> {
    fn lock_activation(&self) -> MutexGuard<'_, Option<Activation>> {
        self.activation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Republish whenever the source's cell changes, until the guard drops.
    fn follow_source(self: &Arc<Self>) -> DropGuard {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let weak = Arc::downgrade(self);
        let mut changes = self.source.cell().changes();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let Some(shared) = weak.upgrade() else { break };
                        shared.publish();
                    }
                }
            }
        });
        token.drop_guard()
    }

    /// Returns `true` if a fetch was issued.
    fn issue_fetch(self: &Arc<Self>) -> bool {
        let cell = self.source.cell();
        let ticket = match cell.claim() {
            Claim::Lead(ticket) => ticket,
            Claim::Follow(_) => {
                cell.note_missed();
                debug!(pollable = self.source.target(), "Fetch still in flight, skipping cycle");
                self.publish();
                return false;
            }
        };
        self.publish();

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let target = shared.source.target();
            match shared.source.fetch(ticket).await {
                Ok(Outcome::Retired) => {
                    debug!(pollable = target, "Dropping result fetched before deactivation");
                }
                Ok(Outcome::Rejected) => {
                    debug!(pollable = target, seq = ticket.seq(), "Poll result rejected by source");
                }
                Ok(_) => {}
                Err(e) if shared.active.load(Ordering::SeqCst) => {
                    warn!(pollable = target, error = %e, "Poll fetch failed, keeping last value");
                }
                Err(_) => {}
            }
            shared.publish();
        });
        true
    }

    fn publish(&self) {
        let _publishing = self.publishing.lock().unwrap_or_else(PoisonError::into_inner);
        let state = if self.active.load(Ordering::SeqCst) {
            self.snapshot()
        } else {
            PollState::idle(self.source.target(), self.interval)
        };
        self.state_tx.send_replace(state);
    }

    fn snapshot(&self) -> PollState<S::Value> {
        let mut state = {
            let cell = self.source.cell().lock();
            PollState {
                target: self.source.target(),
                active: true,
                interval_secs: self.interval.as_secs(),
                value: cell.current().map(|c| c.value.clone()),
                fetched_at: cell.current().map(|c| c.fetched_at_utc),
                last_attempt_at: cell.last_attempt_utc(),
                in_flight: cell.in_flight(),
                consecutive_failures: cell.consecutive_failures(),
                missed_cycles: cell.missed_cycles(),
                last_error: cell.last_error().map(|e| e.message.clone()),
                anomaly: None,
            }
        };
        state.anomaly = self.source.anomaly();
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_tip::{ChainTip, HeightSettings};
    use crate::gateway::mock::ScriptedGateway;
    use crate::gateway::ChainGateway;
    use crate::orchestrator::{FeeOrchestrator, FeeSettings};
    use tokio::time::sleep;

    const TEN_SECS: Duration = Duration::from_secs(10);

    fn height_poller(gateway: &Arc<ScriptedGateway>) -> Poller<ChainTip> {
        let tip = ChainTip::new(Arc::clone(gateway) as Arc<dyn ChainGateway>, HeightSettings::default());
        Poller::new(Arc::new(tip), TEN_SECS)
    }

    #[tokio::test(start_paused = true)]
    async fn test_activation_fetches_immediately() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_height(800_000);
        let poller = height_poller(&gateway);

        assert!(poller.activate());
        sleep(Duration::from_secs(1)).await;

        let state = poller.state();
        assert!(state.active);
        assert_eq!(state.value, Some(800_000));
        assert_eq!(gateway.height_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_poller_does_no_work() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_height(1);
        let poller = height_poller(&gateway);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(gateway.height_calls(), 0);
        assert!(!poller.refetch());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deactivate_stops_all_fetches() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_height(10);
        let poller = height_poller(&gateway);

        poller.activate();
        sleep(Duration::from_secs(25)).await;
        assert!(poller.deactivate());
        let calls = gateway.height_calls();
        assert_eq!(calls, 3);

        sleep(Duration::from_secs(100)).await;
        assert_eq!(gateway.height_calls(), calls);

        let state = poller.state();
        assert!(!state.active);
        assert_eq!(state.value, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activate_is_idempotent() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_height(10);
        let poller = height_poller(&gateway);

        assert!(poller.activate());
        assert!(!poller.activate());
        assert!(!poller.clone().activate());
        sleep(Duration::from_secs(25)).await;

        // One timer: t = 0, 10, 20
        assert_eq!(gateway.height_calls(), 3);

        assert!(poller.deactivate());
        assert!(!poller.deactivate());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_fetch_never_overlaps() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_height(10);
        gateway.set_delay(Duration::from_secs(35));
        let poller = height_poller(&gateway);

        poller.activate();
        sleep(Duration::from_secs(45)).await;

        // Issued at t = 0 (done at 35), ticks at 10/20/30 skipped, reissued at 40.
        assert_eq!(gateway.height_calls(), 2);
        assert_eq!(gateway.max_in_flight(), 1);
        let state = poller.state();
        assert!(state.in_flight);
        assert_eq!(state.value, Some(10));
        assert_eq!(state.missed_cycles, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_ticks_count_as_missed() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_height(10);
        gateway.set_delay(Duration::from_secs(35));
        let poller = height_poller(&gateway);

        poller.activate();
        sleep(Duration::from_secs(32)).await;
        let state = poller.state();
        assert_eq!(state.missed_cycles, 3);
        assert!(state.in_flight);
        assert!(!state.is_stale(3), "nothing held yet");
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_in_flight_at_deactivation_is_dropped() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_height(10);
        gateway.set_delay(Duration::from_secs(5));
        let poller = height_poller(&gateway);

        poller.activate();
        sleep(Duration::from_secs(1)).await;
        poller.deactivate();
        sleep(Duration::from_secs(10)).await;

        assert_eq!(gateway.height_calls(), 1);
        assert_eq!(poller.state().value, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_keep_last_value() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_fees(20, 10, 3);
        gateway.push_fee_error("upstream unreachable");
        let orch = FeeOrchestrator::new(
            Arc::clone(&gateway) as Arc<dyn ChainGateway>,
            FeeSettings::default(),
        );
        let poller = Poller::new(Arc::new(orch), Duration::from_secs(15));

        poller.activate();
        sleep(Duration::from_secs(50)).await;

        let state = poller.state();
        assert_eq!(state.value, Some(10));
        assert_eq!(state.consecutive_failures, 3);
        assert_eq!(state.last_error.as_deref(), Some("upstream unreachable"));
        assert!(state.is_stale(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refetch_coalesces_with_in_flight() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_height(10);
        gateway.set_delay(Duration::from_secs(3));
        let poller = height_poller(&gateway);

        poller.activate();
        sleep(Duration::from_secs(1)).await;
        assert!(!poller.refetch());

        sleep(Duration::from_secs(3)).await;
        assert!(poller.refetch());
        sleep(Duration::from_secs(4)).await;
        assert_eq!(gateway.height_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_see_updates() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_height(123);
        let poller = height_poller(&gateway);
        let mut rx = poller.subscribe();

        poller.activate();
        loop {
            rx.changed().await.unwrap();
            if rx.borrow().value.is_some() {
                break;
            }
        }
        assert_eq!(rx.borrow().value, Some(123));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_poller_cancels_timer() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_height(1);
        let poller = height_poller(&gateway);
        poller.activate();
        sleep(Duration::from_secs(1)).await;
        drop(poller);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(gateway.height_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_reads_reach_subscribers() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_fees(20, 10, 3);
        gateway.push_fees(60, 30, 9);
        let settings = FeeSettings { freshness: Duration::ZERO, ..FeeSettings::default() };
        let orch = Arc::new(FeeOrchestrator::new(Arc::clone(&gateway) as Arc<dyn ChainGateway>, settings));
        let poller = Poller::new(Arc::clone(&orch), Duration::from_secs(15));

        poller.activate();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(poller.state().value, Some(10));

        let quote = orch.recommended_fee().await;
        assert_eq!(quote.fee_rate, 30);
        sleep(Duration::from_secs(1)).await;

        let state = poller.state();
        assert_eq!(state.value, Some(30));
        assert_eq!(state.fetched_at, quote.fetched_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_and_read_share_one_fetch() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_fees(20, 10, 3);
        gateway.set_delay(Duration::from_secs(5));
        let orch = Arc::new(FeeOrchestrator::new(
            Arc::clone(&gateway) as Arc<dyn ChainGateway>,
            FeeSettings::default(),
        ));
        let poller = Poller::new(Arc::clone(&orch), Duration::from_secs(15));

        poller.activate();
        sleep(Duration::from_secs(1)).await;
        assert!(poller.state().in_flight);

        let quote = orch.recommended_fee().await;
        assert_eq!(quote.fee_rate, 10);
        assert_eq!(gateway.fee_calls(), 1);
        assert_eq!(gateway.max_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_height_regression_is_not_a_fresh_success() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_height(500);
        gateway.push_height(498);
        let tip = Arc::new(ChainTip::new(Arc::clone(&gateway) as Arc<dyn ChainGateway>, HeightSettings::default()));
        let poller = Poller::new(Arc::clone(&tip), TEN_SECS);

        poller.activate();
        sleep(Duration::from_secs(1)).await;
        let first = poller.state();
        assert_eq!(first.value, Some(500));
        assert!(first.anomaly.is_none());

        sleep(TEN_SECS).await;
        let state = poller.state();
        assert_eq!(state.value, Some(500));
        assert_eq!(state.fetched_at, first.fetched_at);
        assert_eq!(state.missed_cycles, 1);
        let anomaly = state.anomaly.expect("regression surfaced");
        assert!(anomaly.contains("observed 498"));
        assert_eq!(tip.regressions_total(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_result_from_previous_activation_never_lands() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_height_after(Duration::from_secs(30), 10);
        gateway.push_height_after(Duration::from_secs(1), 20);
        let tip = Arc::new(ChainTip::new(Arc::clone(&gateway) as Arc<dyn ChainGateway>, HeightSettings::default()));
        let poller = Poller::new(Arc::clone(&tip), TEN_SECS);

        poller.activate();
        sleep(Duration::from_secs(1)).await;
        poller.deactivate();
        sleep(Duration::from_secs(1)).await;
        poller.activate();

        // The first fetch holds the slot until t = 30; ticks at 2, 12, 22 skip.
        sleep(Duration::from_secs(29)).await;
        assert!(tip.reading().is_none());
        let state = poller.state();
        assert_eq!(state.value, None);
        assert_eq!(state.missed_cycles, 3);

        // Tick at 32 fetches again and lands at 33.
        sleep(Duration::from_secs(3)).await;
        assert_eq!(poller.state().value, Some(20));
        assert_eq!(gateway.height_calls(), 2);
        assert_eq!(gateway.max_in_flight(), 1);
    }
}

