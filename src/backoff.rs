use std::time::Duration;

use rand::Rng;

/// Exponential backoff with random jitter, shared by gateway reconnect
/// logic and the HTTP retry loop.
///
/// Yields `base^0, base^1, ...` seconds (each plus up to `jitter` seconds
/// of uniform noise) and stops once the undecorated value reaches
/// `maximum`. Callers treat the end of the iterator as "give up".
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: f64,
    maximum: f64,
    jitter: f64,
    increment: u32,
}

impl ExponentialBackoff {
    pub fn new(base: f64, maximum: f64, jitter: f64) -> Self {
        Self {
            base,
            maximum,
            jitter,
            increment: 0,
        }
    }

    /// Restart the sequence from the first delay.
    pub fn reset(&mut self) {
        self.increment = 0;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(2.0, 64.0, 1.0)
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let value = self.base.powi(self.increment as i32);
        if value >= self.maximum {
            return None;
        }
        self.increment += 1;

        let jitter = rand::thread_rng().gen_range(0.0..=self.jitter.max(f64::EPSILON));
        Some(Duration::from_secs_f64(value + jitter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_increase_up_to_cap() {
        let mut backoff = ExponentialBackoff::new(2.0, 64.0, 0.0);
        let delays: Vec<f64> = (&mut backoff).map(|d| d.as_secs_f64()).collect();
        assert_eq!(delays, vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0]);
        assert!(backoff.next().is_none(), "sequence must stay exhausted");
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let mut backoff = ExponentialBackoff::new(2.0, 64.0, 1.0);
        let first = backoff.next().unwrap().as_secs_f64();
        assert!((1.0..=2.0).contains(&first), "got {first}");
        let second = backoff.next().unwrap().as_secs_f64();
        assert!((2.0..=3.0).contains(&second), "got {second}");
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = ExponentialBackoff::new(2.0, 8.0, 0.0);
        while backoff.next().is_some() {}
        backoff.reset();
        assert_eq!(backoff.next().unwrap(), Duration::from_secs(1));
    }
}
