//! Exponential backoff with jitter for the client's reconnect loop.
//!
//! Reference values: initial interval 500 ms, multiplier 1.5, max interval
//! 60 s, max elapsed time 15 minutes, with a bounded jitter applied to every
//! computed interval.

use std::time::{Duration, Instant};

use rand::Rng;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    pub max_elapsed_time: Duration,
    /// Jitter fraction applied symmetrically around the computed interval,
    /// e.g. `0.2` means ±20%.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.5,
            max_interval: Duration::from_secs(60),
            max_elapsed_time: Duration::from_secs(15 * 60),
            jitter: 0.2,
        }
    }
}

/// Tracks the current interval and elapsed time across reconnect attempts.
pub struct Backoff {
    config: BackoffConfig,
    current_interval: Duration,
    started_at: Instant,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let current_interval = config.initial_interval;
        Backoff {
            config,
            current_interval,
            started_at: Instant::now(),
        }
    }

    /// The next interval to sleep for, with jitter applied, or `None` if
    /// `max_elapsed_time` has already been exceeded.
    pub fn next_interval(&mut self) -> Option<Duration> {
        if self.started_at.elapsed() >= self.config.max_elapsed_time {
            return None;
        }

        let jittered = apply_jitter(self.current_interval, self.config.jitter);

        let next_raw = self.current_interval.mul_f64(self.config.multiplier);
        self.current_interval = next_raw.min(self.config.max_interval);

        Some(jittered)
    }

    /// Reset the sequence after a successful connection.
    pub fn reset(&mut self) {
        self.current_interval = self.config.initial_interval;
        self.started_at = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

fn apply_jitter(interval: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return interval;
    }
    let mut rng = rand::thread_rng();
    let factor = 1.0 + rng.gen_range(-jitter..=jitter);
    interval.mul_f64(factor.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_grows_by_multiplier_up_to_the_cap() {
        let config = BackoffConfig {
            jitter: 0.0,
            ..BackoffConfig::default()
        };
        let mut backoff = Backoff::new(config);

        let first = backoff.next_interval().unwrap();
        assert_eq!(first, Duration::from_millis(500));

        let second = backoff.next_interval().unwrap();
        assert_eq!(second, Duration::from_millis(750));

        let third = backoff.next_interval().unwrap();
        assert_eq!(third, Duration::from_millis(1125));
    }

    #[test]
    fn interval_is_capped_at_max_interval() {
        let config = BackoffConfig {
            jitter: 0.0,
            initial_interval: Duration::from_secs(50),
            max_interval: Duration::from_secs(60),
            ..BackoffConfig::default()
        };
        let mut backoff = Backoff::new(config);
        backoff.next_interval();
        let second = backoff.next_interval().unwrap();
        assert_eq!(second, Duration::from_secs(60));
    }

    #[test]
    fn reset_restarts_from_initial_interval() {
        let config = BackoffConfig {
            jitter: 0.0,
            ..BackoffConfig::default()
        };
        let mut backoff = Backoff::new(config.clone());
        backoff.next_interval();
        backoff.next_interval();
        backoff.reset();
        let after_reset = backoff.next_interval().unwrap();
        assert_eq!(after_reset, config.initial_interval);
    }

    #[test]
    fn gives_up_once_max_elapsed_time_is_exceeded() {
        let config = BackoffConfig {
            max_elapsed_time: Duration::from_millis(0),
            ..BackoffConfig::default()
        };
        let mut backoff = Backoff::new(config);
        std::thread::sleep(Duration::from_millis(5));
        assert!(backoff.next_interval().is_none());
    }
}
