//! Exponential backoff with jitter and an overall time budget

use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Produces growing, randomized delays until the elapsed budget is spent
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    /// First delay before randomization
    pub initial_interval: Duration,
    /// Growth factor applied after every delay
    pub multiplier: f64,
    /// Delays are drawn from `interval * (1 ± randomization_factor)`
    pub randomization_factor: f64,
    /// Ceiling for the un-randomized interval
    pub max_interval: Duration,
    /// Total time after which no further delay is handed out
    pub max_elapsed: Option<Duration>,
    current: Duration,
    started: Instant,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.5,
            randomization_factor: 0.5,
            max_interval: Duration::from_secs(60),
            max_elapsed: Some(Duration::from_secs(15 * 60)),
            current: Duration::from_millis(500),
            started: Instant::now(),
        }
    }
}

impl ExponentialBackoff {
    /// Default growth and jitter with a custom first delay and budget
    pub fn new(initial_interval: Duration, max_elapsed: Option<Duration>) -> Self {
        Self {
            initial_interval,
            max_elapsed,
            current: initial_interval,
            ..Self::default()
        }
    }

    pub fn with_max_elapsed(max_elapsed: Duration) -> Self {
        Self {
            max_elapsed: Some(max_elapsed),
            ..Self::default()
        }
    }

    /// Restart from the initial interval with a fresh budget
    pub fn reset(&mut self) {
        self.current = self.initial_interval;
        self.started = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Next delay, or `None` once sleeping it would overrun the budget
    pub fn next_backoff(&mut self) -> Option<Duration> {
        let delay = randomize(self.current, self.randomization_factor);
        if let Some(max_elapsed) = self.max_elapsed {
            if self.elapsed() + delay > max_elapsed {
                return None;
            }
        }

        let grown = self.current.as_secs_f64() * self.multiplier;
        self.current = if grown >= self.max_interval.as_secs_f64() {
            self.max_interval
        } else {
            Duration::from_secs_f64(grown)
        };

        Some(delay)
    }
}

fn randomize(interval: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return interval;
    }
    let secs = interval.as_secs_f64();
    let delta = factor * secs;
    let low = (secs - delta).max(0.0);
    let high = secs + delta;
    Duration::from_secs_f64(rand::thread_rng().gen_range(low..=high))
}
