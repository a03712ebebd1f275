//! Inter-request throttling
//!
//! The throttle computes the delay the scheduling loop sleeps between
//! launching task cycles. It runs in one of three mutually exclusive
//! modes selected at construction:
//!
//! - **rate-capped**: adapts the delay so the observed request rate
//!   converges toward a target `max_rps`
//! - **custom**: delegates the delay to a caller-supplied function over
//!   the rolling [`ThrottleState`]
//! - **fixed**: keeps the delay at a minimal constant
//!
//! Reading the delay via [`Throttle::sleep`] advances the rolling state;
//! it is not an idempotent getter.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::ThrottleConfig;

/// Minimal delay used when no explicit sleep is configured, in seconds.
const MIN_SLEEP: f64 = 0.0001;

/// Custom delay function over the rolling throttle state.
pub type ThrottleFn = Box<dyn Fn(&ThrottleState) -> f64 + Send + Sync>;

/// Rolling timing statistics, mutated only by [`Throttle::calculate`].
#[derive(Debug, Clone, Serialize)]
pub struct ThrottleState {
    /// Number of `calculate` calls so far
    pub iterations: u64,
    /// Current inter-request delay, in seconds
    pub sleep: f64,
    /// Observed time between requests minus the slept delay, in seconds
    pub delta: f64,
    /// Current observed requests per second
    pub rps: f64,
    /// Target maximum requests per second, if rate-capped
    pub max_rps: Option<f64>,
    /// Time since the throttle was constructed, in seconds
    pub time_running: f64,
}

impl ThrottleState {
    fn new(sleep: Option<f64>, max_rps: Option<f64>) -> Self {
        let initial = if max_rps.is_some() {
            sleep.unwrap_or(MIN_SLEEP)
        } else {
            MIN_SLEEP
        };
        Self {
            iterations: 0,
            sleep: initial,
            delta: sleep.unwrap_or(MIN_SLEEP),
            rps: 0.0,
            max_rps,
            time_running: 0.0,
        }
    }
}

/// Delay state machine for the scheduling loop.
pub struct Throttle {
    custom: Option<ThrottleFn>,
    time_started: Instant,
    time_last_modified: Option<Instant>,
    state: ThrottleState,
}

impl Throttle {
    /// Build a throttle from configuration: rate-capped when `max_rps`
    /// is set, fixed otherwise.
    pub fn new(config: &ThrottleConfig) -> Self {
        Self {
            custom: None,
            time_started: Instant::now(),
            time_last_modified: None,
            state: ThrottleState::new(config.sleep, config.max_rps),
        }
    }

    /// Build a throttle in custom-function mode. The function receives
    /// the rolling state and returns the next delay in seconds.
    pub fn with_fn(sleep: Option<f64>, f: ThrottleFn) -> Self {
        Self {
            custom: Some(f),
            time_started: Instant::now(),
            time_last_modified: None,
            state: ThrottleState::new(sleep, None),
        }
    }

    /// Advance the rolling state by one iteration.
    ///
    /// The first call has no previous timestamp and only bumps the
    /// iteration counter and running time.
    pub fn calculate(&mut self) {
        let now = Instant::now();
        self.state.iterations += 1;

        let diff = self
            .time_last_modified
            .map(|last| (now - last).as_secs_f64());

        if let Some(diff) = diff {
            if diff > 0.0 {
                self.state.rps = 1.0 / diff;
            }
            self.state.delta = diff - self.state.sleep;
        }

        self.time_last_modified = Some(now);
        self.state.time_running = (now - self.time_started).as_secs_f64();

        let diff = match diff {
            Some(d) if d > 0.0 => d,
            _ => return,
        };

        if let Some(max_rps) = self.state.max_rps {
            let sleep = if self.state.sleep > 0.0 {
                self.state.sleep
            } else {
                MIN_SLEEP
            };
            self.state.sleep = (1.0 / (diff / sleep)) / max_rps;
            return;
        }

        if let Some(f) = &self.custom {
            self.state.sleep = f(&self.state);
        }
    }

    /// Advance the state and return the current delay.
    pub fn sleep(&mut self) -> Duration {
        self.calculate();
        Duration::from_secs_f64(self.state.sleep.max(0.0))
    }

    /// Read-only view of the rolling state.
    pub fn state(&self) -> &ThrottleState {
        &self.state
    }

    /// Snapshot of the rolling state for reporting.
    pub fn snapshot(&self) -> ThrottleState {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThrottleConfig;

    fn rate_capped(max_rps: f64) -> Throttle {
        Throttle::new(&ThrottleConfig {
            sleep: None,
            max_rps: Some(max_rps),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_call_only_bumps_counters() {
        let mut throttle = rate_capped(10.0);
        let delay = throttle.sleep();
        assert_eq!(throttle.state().iterations, 1);
        assert!(delay <= Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_mode_keeps_minimal_delay() {
        let mut throttle = Throttle::new(&ThrottleConfig::default());
        for _ in 0..5 {
            let delay = throttle.sleep();
            assert_eq!(delay, Duration::from_secs_f64(MIN_SLEEP));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(throttle.state().iterations, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_fn_drives_delay() {
        let mut throttle = Throttle::with_fn(None, Box::new(|state| 0.01 * state.iterations as f64));
        // First call has no elapsed diff, so the custom fn is not consulted yet.
        throttle.sleep();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let delay = throttle.sleep();
        assert_eq!(delay, Duration::from_secs_f64(0.02));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let delay = throttle.sleep();
        assert_eq!(delay, Duration::from_secs_f64(0.03));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_capped_convergence() {
        // Simulate a crawl loop doing ~1ms of work per cycle under a
        // 10 rps cap over 10 seconds of (paused) time: the number of
        // cycles should converge toward max_rps * elapsed.
        let mut throttle = rate_capped(10.0);
        let start = Instant::now();
        let mut cycles = 0u64;
        while (Instant::now() - start) < Duration::from_secs(10) {
            let delay = throttle.sleep();
            tokio::time::sleep(delay + Duration::from_millis(1)).await;
            cycles += 1;
        }
        assert!(
            (80..=130).contains(&cycles),
            "expected ~100 cycles at 10 rps over 10s, got {cycles}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_tracks_rps_and_running_time() {
        let mut throttle = rate_capped(5.0);
        throttle.sleep();
        tokio::time::sleep(Duration::from_millis(200)).await;
        throttle.sleep();
        let state = throttle.state();
        assert!((state.rps - 5.0).abs() < 0.5);
        assert!(state.time_running >= 0.2);
        assert_eq!(state.max_rps, Some(5.0));
    }
}
