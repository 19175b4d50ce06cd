//! Sequenced value cell: last-known-good cache with ordered completions.
//!
//! Every fetch is issued a [`Ticket`] carrying a monotonically increasing
//! sequence number and the cell's current epoch. A completion is applied
//! only if no later-issued fetch has already landed, and only if the epoch
//! has not moved on (see [`SequencedCell::retire`]). Failures never clear
//! the cached value.
//!
//! [`SharedCell`] wraps the cell for the owner of a pollable value. It
//! hands out the single fetch slot: one caller leads, everyone else who
//! arrives while that fetch is in flight follows it and waits for it to
//! settle. The lock is never held across an await.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

use crate::gateway::UpstreamError;

/// Receipt for an issued fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    seq: u64,
    epoch: u64,
}

impl Ticket {
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// A successfully fetched value.
#[derive(Debug, Clone)]
pub struct Cached<T> {
    pub value: T,
    pub seq: u64,
    pub fetched_at: Instant,
    pub fetched_at_utc: DateTime<Utc>,
}

impl<T> Cached<T> {
    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The value is now the cached value.
    Applied,
    /// The fetch failed; the previous value is kept.
    Failed,
    /// A later-issued fetch already landed; this completion was dropped.
    Superseded,
    /// The cell was retired after this fetch was issued.
    Retired,
    /// The owner rejected the observation; it counts as a missed cycle.
    Rejected,
    /// The fetch was abandoned before it produced anything.
    Discarded,
}

#[derive(Debug)]
pub struct SequencedCell<T> {
    current: Option<Cached<T>>,
    next_seq: u64,
    epoch: u64,
    in_flight: Option<u64>,
    last_settled: Option<(u64, Outcome)>,
    consecutive_failures: u32,
    missed_cycles: u32,
    last_error: Option<UpstreamError>,
    last_attempt_utc: Option<DateTime<Utc>>,
}

impl<T: Clone> SequencedCell<T> {
    pub fn new() -> Self {
        Self {
            current: None,
            next_seq: 1,
            epoch: 0,
            in_flight: None,
            last_settled: None,
            consecutive_failures: 0,
            missed_cycles: 0,
            last_error: None,
            last_attempt_utc: None,
        }
    }

    fn issue(&mut self) -> Ticket {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.last_attempt_utc = Some(Utc::now());
        Ticket { seq, epoch: self.epoch }
    }

    /// Issue a ticket only if no fetch is in flight.
    pub fn try_issue(&mut self) -> Option<Ticket> {
        if self.in_flight.is_some() {
            return None;
        }
        let ticket = self.issue();
        self.in_flight = Some(ticket.seq);
        Some(ticket)
    }

    /// Whether a completion for `ticket` would still be looked at.
    pub fn accepts(&self, ticket: Ticket) -> bool {
        ticket.epoch == self.epoch
    }

    pub fn complete(&mut self, ticket: Ticket, result: Result<T, UpstreamError>) -> Outcome {
        if !self.accepts(ticket) {
            return self.finish(ticket, Outcome::Retired);
        }

        let newest = self.current.as_ref().map(|c| c.seq).unwrap_or(0);
        if ticket.seq < newest {
            return self.finish(ticket, Outcome::Superseded);
        }

        let outcome = match result {
            Ok(value) => {
                self.current = Some(Cached {
                    value,
                    seq: ticket.seq,
                    fetched_at: Instant::now(),
                    fetched_at_utc: Utc::now(),
                });
                self.consecutive_failures = 0;
                self.missed_cycles = 0;
                self.last_error = None;
                Outcome::Applied
            }
            Err(e) => {
                self.consecutive_failures += 1;
                self.missed_cycles += 1;
                self.last_error = Some(e);
                Outcome::Failed
            }
        };
        self.finish(ticket, outcome)
    }

    /// Close a ticket whose observation the owner refused to cache.
    pub fn reject(&mut self, ticket: Ticket) -> Outcome {
        if !self.accepts(ticket) {
            return self.finish(ticket, Outcome::Retired);
        }
        self.missed_cycles += 1;
        self.finish(ticket, Outcome::Rejected)
    }

    /// Close out a ticket without touching the cached value.
    pub fn discard(&mut self, ticket: Ticket) -> Outcome {
        if !self.accepts(ticket) {
            return self.finish(ticket, Outcome::Retired);
        }
        self.finish(ticket, Outcome::Discarded)
    }

    fn finish(&mut self, ticket: Ticket, outcome: Outcome) -> Outcome {
        if self.in_flight == Some(ticket.seq) {
            self.in_flight = None;
        }
        self.last_settled = Some((ticket.seq, outcome));
        outcome
    }

    /// Orphan every outstanding ticket and reset the poll counters. The
    /// cached value survives. A fetch still in flight keeps the slot until
    /// it lands, so a new fetch never overlaps it.
    pub fn retire(&mut self) {
        self.epoch += 1;
        self.consecutive_failures = 0;
        self.missed_cycles = 0;
        self.last_error = None;
    }

    /// A poll cycle passed without a fetch being issued.
    pub fn note_missed(&mut self) {
        self.missed_cycles += 1;
    }

    pub fn current(&self) -> Option<&Cached<T>> {
        self.current.as_ref()
    }

    /// The cached value if it is younger than `window`.
    pub fn fresh(&self, window: Duration) -> Option<&Cached<T>> {
        self.current.as_ref().filter(|c| c.age() < window)
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// How the fetch with sequence number `seq` settled, if it was the last to.
    pub fn outcome_of(&self, seq: u64) -> Option<Outcome> {
        self.last_settled.filter(|(s, _)| *s == seq).map(|(_, o)| o)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn missed_cycles(&self) -> u32 {
        self.missed_cycles
    }

    pub fn last_error(&self) -> Option<&UpstreamError> {
        self.last_error.as_ref()
    }

    pub fn last_attempt_utc(&self) -> Option<DateTime<Utc>> {
        self.last_attempt_utc
    }
}

impl<T: Clone> Default for SequencedCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ── Shared Cell ─────────────────────────────────────────────────────

/// Result of asking for the fetch slot.
pub enum Claim {
    /// The caller owns the slot and must settle the ticket.
    Lead(Ticket),
    /// A fetch is already in flight.
    Follow(Pending),
}

/// Handle on someone else's in-flight fetch.
pub struct Pending {
    seq: u64,
    changes: watch::Receiver<u64>,
}

/// A [`SequencedCell`] with one fetch slot and change notifications.
pub struct SharedCell<T> {
    inner: Mutex<SequencedCell<T>>,
    changes: watch::Sender<u64>,
}

impl<T: Clone> SharedCell<T> {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self { inner: Mutex::new(SequencedCell::new()), changes }
    }

    pub fn lock(&self) -> MutexGuard<'_, SequencedCell<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fires on every state change: issue, settle, missed cycle, retire.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn notify(&self) {
        self.changes.send_modify(|n| *n = n.wrapping_add(1));
    }

    pub fn claim(&self) -> Claim {
        let claim = {
            let mut cell = self.lock();
            match cell.try_issue() {
                Some(ticket) => Claim::Lead(ticket),
                None => Claim::Follow(Pending {
                    seq: cell.in_flight.unwrap_or_default(),
                    changes: self.changes.subscribe(),
                }),
            }
        };
        if matches!(claim, Claim::Lead(_)) {
            self.notify();
        }
        claim
    }

    /// Guard a ticket across an await. Dropping the lease unsettled
    /// discards the ticket, so a cancelled fetch never holds the slot.
    pub fn lease(&self, ticket: Ticket) -> Lease<'_, T> {
        Lease { cell: self, ticket: Some(ticket) }
    }

    fn settle_with(&self, ticket: Ticket, f: impl FnOnce(&mut SequencedCell<T>, Ticket) -> Outcome) -> Outcome {
        let outcome = f(&mut self.lock(), ticket);
        self.notify();
        outcome
    }

    /// Wait for a followed fetch to land. `None` if its outcome was
    /// overwritten by a later fetch before the waiter looked.
    pub async fn settled(&self, mut pending: Pending) -> Option<Outcome> {
        loop {
            {
                let cell = self.lock();
                if cell.in_flight != Some(pending.seq) {
                    return cell.outcome_of(pending.seq);
                }
            }
            if pending.changes.changed().await.is_err() {
                return None;
            }
        }
    }

    pub fn note_missed(&self) {
        self.lock().note_missed();
        self.notify();
    }

    pub fn retire(&self) {
        self.lock().retire();
        self.notify();
    }
}

impl<T: Clone> Default for SharedCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// An issued ticket that has not been settled yet.
pub struct Lease<'a, T: Clone> {
    cell: &'a SharedCell<T>,
    ticket: Option<Ticket>,
}

impl<T: Clone> Lease<'_, T> {
    /// Settle under the cell lock, then wake followers and subscribers.
    pub fn settle(mut self, f: impl FnOnce(&mut SequencedCell<T>, Ticket) -> Outcome) -> Outcome {
        match self.ticket.take() {
            Some(ticket) => self.cell.settle_with(ticket, f),
            None => Outcome::Discarded,
        }
    }
}

impl<T: Clone> Drop for Lease<'_, T> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.cell.settle_with(ticket, |cell, t| cell.discard(t));
        }
    }
}
