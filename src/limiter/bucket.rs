use std::{sync::Mutex, time::Duration};

use tokio::{
    sync::{Mutex as FairMutex, Notify},
    time::{sleep, Instant},
};

/// A token bucket with a rate which can change at any time.
///
/// Holds at most one second's worth of tokens (and at least one), and starts full. Waiters are
/// served in FIFO order.
#[derive(Debug)]
pub(crate) struct TokenBucket {
    state: Mutex<BucketState>,
    /// Held by the waiter at the front of the queue.
    queue: FairMutex<()>,
    rate_changed: Notify,
}

#[derive(Debug)]
struct BucketState {
    /// Tokens per second.
    rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Tolerates rounding when time has advanced by exactly one token's worth.
    const EPSILON: f64 = 1e-9;

    pub(crate) fn new(rate: f64) -> Self {
        let rate = sanitise(rate);
        Self {
            state: Mutex::new(BucketState {
                rate,
                tokens: capacity(rate),
                last_refill: Instant::now(),
            }),
            queue: FairMutex::new(()),
            rate_changed: Notify::new(),
        }
    }

    pub(crate) fn rate(&self) -> f64 {
        self.state.lock().expect("bucket lock poisoned").rate
    }

    pub(crate) fn set_rate(&self, rate: f64) {
        {
            let mut state = self.state.lock().expect("bucket lock poisoned");
            state.refill(Instant::now());
            state.rate = sanitise(rate);
            state.tokens = state.tokens.min(capacity(state.rate));
        }
        self.rate_changed.notify_waiters();
    }

    /// Wait for a token and take it.
    ///
    /// Cancel-safe: dropping the future gives up the place in the queue without taking a token.
    pub(crate) async fn acquire(&self) {
        let _front_of_queue = self.queue.lock().await;

        loop {
            // Register interest before checking, so a rate change in between isn't missed.
            let rate_changed = self.rate_changed.notified();

            let wait = {
                let mut state = self.state.lock().expect("bucket lock poisoned");
                state.refill(Instant::now());

                if state.tokens >= 1. - Self::EPSILON {
                    state.tokens = (state.tokens - 1.).max(0.);
                    return;
                }

                // Too far off to represent means nothing will arrive before a rate change.
                (state.rate > 0.)
                    .then(|| Duration::try_from_secs_f64((1. - state.tokens) / state.rate).ok())
                    .flatten()
            };

            match wait {
                Some(wait) => {
                    tokio::select! {
                        _ = sleep(wait) => {}
                        _ = rate_changed => {}
                    }
                }
                // Nothing will arrive until the rate goes up.
                None => rate_changed.await,
            }
        }
    }
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(capacity(self.rate));
        self.last_refill = now;
    }
}

fn capacity(rate: f64) -> f64 {
    rate.max(1.)
}

fn sanitise(rate: f64) -> f64 {
    if rate.is_finite() && rate > 0. {
        rate
    } else {
        0.
    }
}
