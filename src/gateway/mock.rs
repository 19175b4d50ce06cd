//! Scripted gateway for tests. Responses are popped in order; once a script
//! runs dry the last configured answer repeats.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::*;

struct Step<T> {
    result: Result<T, UpstreamError>,
    /// Overrides the gateway-wide delay for this answer.
    delay: Option<Duration>,
}

impl<T: Clone> Clone for Step<T> {
    fn clone(&self) -> Self {
        Self { result: self.result.clone(), delay: self.delay }
    }
}

pub struct ScriptedGateway {
    fees: Mutex<VecDeque<Step<FeeSummary>>>,
    heights: Mutex<VecDeque<Step<BlockHeight>>>,
    delay: Mutex<Option<Duration>>,
    fee_calls: AtomicUsize,
    height_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self {
            fees: Mutex::new(VecDeque::new()),
            heights: Mutex::new(VecDeque::new()),
            delay: Mutex::new(None),
            fee_calls: AtomicUsize::new(0),
            height_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn push_fees(&self, fast: FeeRate, medium: FeeRate, slow: FeeRate) {
        let result = Ok(FeeSummary::new(fast, medium, slow));
        self.fees.lock().unwrap().push_back(Step { result, delay: None });
    }

    pub fn push_fee_error(&self, message: &str) {
        let result = Err(unreachable_error(message));
        self.fees.lock().unwrap().push_back(Step { result, delay: None });
    }

    pub fn push_fee_error_after(&self, delay: Duration, message: &str) {
        let result = Err(unreachable_error(message));
        self.fees.lock().unwrap().push_back(Step { result, delay: Some(delay) });
    }

    pub fn push_height(&self, height: BlockHeight) {
        self.heights.lock().unwrap().push_back(Step { result: Ok(height), delay: None });
    }

    pub fn push_height_after(&self, delay: Duration, height: BlockHeight) {
        self.heights.lock().unwrap().push_back(Step { result: Ok(height), delay: Some(delay) });
    }

    pub fn push_height_error(&self, message: &str) {
        let result = Err(unreachable_error(message));
        self.heights.lock().unwrap().push_back(Step { result, delay: None });
    }

    /// Make every subsequent call without its own delay sleep before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn fee_calls(&self) -> usize {
        self.fee_calls.load(Ordering::SeqCst)
    }

    pub fn height_calls(&self) -> usize {
        self.height_calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn answer<T: Clone>(&self, script: &Mutex<VecDeque<Step<T>>>) -> Result<T, UpstreamError> {
        let step = {
            let mut q = script.lock().unwrap();
            if q.len() > 1 { q.pop_front() } else { q.front().cloned() }
        };
        let Some(step) = step else {
            return Err(unreachable_error("upstream unreachable"));
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = step.delay.or(*self.delay.lock().unwrap());
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        step.result
    }
}

fn unreachable_error(message: &str) -> UpstreamError {
    UpstreamError::new(UpstreamErrorKind::Transport, message)
}

#[async_trait]
impl ChainGateway for ScriptedGateway {
    fn provider_id(&self) -> &str { "scripted" }

    async fn fee_summary(&self) -> Result<FeeSummary, UpstreamError> {
        self.fee_calls.fetch_add(1, Ordering::SeqCst);
        self.answer(&self.fees).await
    }

    async fn latest_block_height(&self) -> Result<BlockHeight, UpstreamError> {
        self.height_calls.fetch_add(1, Ordering::SeqCst);
        self.answer(&self.heights).await
    }
}
