use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, sleep, Instant};
use tracing::{debug, info};

use crate::config::Stage;

/// How often a blocked `acquire` re-reads the rate, and how often the stage
/// controller advances it.
const TICK: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Open-loop request pacer.
///
/// A continuous token bucket with capacity one: tokens accrue at the current
/// rate, a worker takes a whole token per request, and a blocked worker
/// sleeps for the exact remaining deficit (capped at one tick so dynamic rate
/// changes are picked up). The rate can be changed at any time without
/// resetting accrued tokens, which keeps stage boundaries lossless.
#[derive(Debug)]
pub struct RateScheduler {
    rate_bits: AtomicU64,
    state: Mutex<BucketState>,
}

impl RateScheduler {
    /// Scheduler locked to a fixed rate in requests per second.
    pub fn fixed(rate: f64) -> Self {
        Self::with_rate(rate)
    }

    /// Scheduler for staged profiles, starting at a nominal 1 req/s until the
    /// controller takes over.
    pub fn staged() -> Self {
        Self::with_rate(1.0)
    }

    fn with_rate(rate: f64) -> Self {
        Self {
            rate_bits: AtomicU64::new(rate.max(0.0).to_bits()),
            state: Mutex::new(BucketState {
                // Full bucket, so the first request is not delayed.
                tokens: 1.0,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Acquire))
    }

    pub fn set_rate(&self, rate: f64) {
        self.rate_bits.store(rate.max(0.0).to_bits(), Ordering::Release);
    }

    /// Block until a token is available. Returns false when the run is
    /// cancelled.
    pub async fn acquire(&self, cancel: &mut watch::Receiver<bool>) -> bool {
        loop {
            if *cancel.borrow() {
                return false;
            }
            let wait = {
                let mut state = self.lock_state();
                let now = Instant::now();
                let rate = self.rate();
                if rate > 0.0 {
                    let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                    state.tokens = (state.tokens + elapsed * rate).min(1.0);
                    state.last_refill = now;
                    if state.tokens >= 1.0 {
                        state.tokens -= 1.0;
                        return true;
                    }
                    Duration::from_secs_f64(((1.0 - state.tokens) / rate).min(TICK.as_secs_f64()))
                } else {
                    // A zero rate halts traffic. Keep the refill clock
                    // current so the idle period earns no tokens, but spend
                    // any token accrued before the halt.
                    state.last_refill = now;
                    if state.tokens >= 1.0 {
                        state.tokens -= 1.0;
                        return true;
                    }
                    TICK
                }
            };
            tokio::select! {
                _ = sleep(wait) => {}
                _ = cancel.wait_for(|cancelled| *cancelled) => return false,
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stage controller. Within each stage the rate is updated every tick by
    /// linear interpolation from the rate at stage entry towards the stage
    /// target, and pinned to the target at the stage boundary.
    pub async fn run_stages(&self, stages: Vec<Stage>, mut cancel: watch::Receiver<bool>) {
        for (index, stage) in stages.iter().enumerate() {
            let start_rate = self.rate();
            let target = stage.target_rate as f64;
            info!(
                stage = index,
                from = start_rate,
                to = target,
                duration_secs = stage.duration.as_secs_f64(),
                "entering load stage"
            );
            if stage.duration.is_zero() {
                self.set_rate(target);
                continue;
            }

            let entered = Instant::now();
            let mut ticker = interval(TICK);
            loop {
                tokio::select! {
                    _ = cancel.wait_for(|cancelled| *cancelled) => return,
                    _ = ticker.tick() => {}
                }
                let elapsed = entered.elapsed();
                if elapsed >= stage.duration {
                    break;
                }
                let progress = elapsed.as_secs_f64() / stage.duration.as_secs_f64();
                self.set_rate(start_rate + (target - start_rate) * progress);
            }
            self.set_rate(target);
            debug!(stage = index, rate = target, "stage complete");
        }
    }
}
