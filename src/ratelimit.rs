//! Latency-adaptive token bucket.
//!
//! Tokens refill on a 100 ms tick; `submit_feedback` feeds measured
//! round-trip latency into a rolling window that governs the refill rate.
//! Latency is a leading indicator of router-CPU distress, so the limiter
//! throttles ahead of outright failures rather than merely capping request
//! count.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::interval;
use tracing::debug;

const MIN_RATE: f64 = 2.0;
const WARN_LATENCY: Duration = Duration::from_millis(200);
const CRITICAL_LATENCY: Duration = Duration::from_millis(500);
const HISTORY_SIZE: usize = 10;
const TICK: Duration = Duration::from_millis(100);

struct Inner {
    tokens: f64,
    max_tokens: f64,
    current_rate: f64,
    waiters: VecDeque<oneshot::Sender<()>>,
    latency_history: VecDeque<Duration>,
}

/// An adaptive token bucket shared by every submitter on a connection.
pub struct RateLimiter {
    nominal_rate: f64,
    inner: Mutex<Inner>,
}

impl RateLimiter {
    pub fn new(nominal_rate: f64, burst: f64) -> Self {
        Self {
            nominal_rate,
            inner: Mutex::new(Inner {
                tokens: burst,
                max_tokens: burst,
                current_rate: nominal_rate,
                waiters: VecDeque::new(),
                latency_history: VecDeque::with_capacity(HISTORY_SIZE),
            }),
        }
    }

    /// Spawn the background refill tick. The returned task runs until the
    /// limiter itself is dropped (detected via a weak reference would add
    /// complexity the core doesn't need; callers abort the task on facade
    /// close instead).
    pub fn spawn_tick(self: &std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = interval(TICK);
            loop {
                tick.tick().await;
                this.refill_and_drain();
            }
        })
    }

    fn refill_and_drain(&self) {
        let mut inner = self.inner.lock().unwrap();
        let add = inner.current_rate / 10.0;
        inner.tokens = (inner.tokens + add).min(inner.max_tokens);
        while inner.tokens >= 1.0 {
            let Some(waiter) = inner.waiters.pop_front() else {
                break;
            };
            inner.tokens -= 1.0;
            let _ = waiter.send(());
        }
    }

    /// Acquire a token, waiting if none are immediately available.
    pub async fn acquire(&self) {
        let rx = {
            let mut inner = self.inner.lock().unwrap();
            if inner.tokens >= 1.0 {
                inner.tokens -= 1.0;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                inner.waiters.push_back(tx);
                Some(rx)
            }
        };
        if let Some(rx) = rx {
            let _ = rx.await;
        }
    }

    /// Feed a measured round-trip latency sample into the rolling window.
    /// Once the window has at least 5 samples, the mean governs the refill
    /// rate per the three-band policy documented on this module.
    pub fn submit_feedback(&self, rtt: Duration) {
        let mut inner = self.inner.lock().unwrap();
        if inner.latency_history.len() == HISTORY_SIZE {
            inner.latency_history.pop_front();
        }
        inner.latency_history.push_back(rtt);
        if inner.latency_history.len() < 5 {
            return;
        }
        let mean = inner.latency_history.iter().sum::<Duration>() / inner.latency_history.len() as u32;
        if mean > CRITICAL_LATENCY {
            inner.current_rate = MIN_RATE;
            inner.tokens = 0.0;
            debug!(?mean, "rate limiter: critical latency, collapsing to min rate");
        } else if mean > WARN_LATENCY {
            inner.current_rate = (self.nominal_rate / 2.0).max(MIN_RATE);
            debug!(?mean, rate = inner.current_rate, "rate limiter: warn latency band");
        } else {
            inner.current_rate = (inner.current_rate + 5.0).min(self.nominal_rate);
            debug!(?mean, rate = inner.current_rate, "rate limiter: recovering");
        }
    }

    #[cfg(test)]
    pub(crate) fn current_rate(&self) -> f64 {
        self.inner.lock().unwrap().current_rate
    }

    #[cfg(test)]
    pub(crate) fn tokens(&self) -> f64 {
        self.inner.lock().unwrap().tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    #[tokio::test(start_paused = true)]
    async fn steady_state_grants_no_more_than_nominal_rate_plus_burst() {
        let limiter = Arc::new(RateLimiter::new(10.0, 10.0));
        let _tick = limiter.spawn_tick();

        let mut granted = 0u32;
        let window = StdDuration::from_secs(10);
        let deadline = tokio::time::Instant::now() + window;
        while tokio::time::Instant::now() < deadline {
            limiter.acquire().await;
            granted += 1;
            tokio::time::advance(StdDuration::from_millis(1)).await;
        }
        let max_allowed = 10.0 * window.as_secs_f64() + 10.0;
        assert!(
            f64::from(granted) <= max_allowed + 1.0,
            "granted {granted} exceeds bound {max_allowed}"
        );
    }

    #[test]
    fn critical_latency_collapses_rate_and_zeroes_tokens() {
        let limiter = RateLimiter::new(20.0, 20.0);
        for _ in 0..5 {
            limiter.submit_feedback(Duration::from_millis(600));
        }
        assert_eq!(limiter.current_rate(), MIN_RATE);
        assert_eq!(limiter.tokens(), 0.0);
    }

    #[test]
    fn warn_band_halves_nominal_rate() {
        let limiter = RateLimiter::new(20.0, 20.0);
        for _ in 0..5 {
            limiter.submit_feedback(Duration::from_millis(300));
        }
        assert_eq!(limiter.current_rate(), 10.0);
    }

    #[test]
    fn healthy_latency_recovers_additively_towards_nominal() {
        let limiter = RateLimiter::new(20.0, 20.0);
        for _ in 0..5 {
            limiter.submit_feedback(Duration::from_millis(600));
        }
        assert_eq!(limiter.current_rate(), MIN_RATE);
        // The window holds HISTORY_SIZE samples; the five 600 ms samples
        // above must be pushed out before the mean reflects only healthy
        // latency, so feed a full window's worth rather than just 5.
        for _ in 0..HISTORY_SIZE {
            limiter.submit_feedback(Duration::from_millis(10));
        }
        assert_eq!(limiter.current_rate(), 20.0);
    }

    #[test]
    fn fewer_than_five_samples_does_not_change_rate() {
        let limiter = RateLimiter::new(20.0, 20.0);
        limiter.submit_feedback(Duration::from_millis(900));
        limiter.submit_feedback(Duration::from_millis(900));
        assert_eq!(limiter.current_rate(), 20.0);
    }
}
