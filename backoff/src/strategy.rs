use std::time::Duration;

use rand::Rng;

/// Exponential cool-off sequence: `initial * factor^(n-1)`, capped at
/// `cap`, with optional jitter.
///
/// The iterator is infinite; bounding the number of attempts is the job of
/// [`crate::RetryBudget`], not the strategy.
///
/// # Example
/// ```
/// use backoff::strategy::ExponentialBackoff;
/// use std::time::Duration;
///
/// let mut delays = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(20));
/// assert_eq!(delays.next(), Some(Duration::from_secs(1)));
/// assert_eq!(delays.next(), Some(Duration::from_secs(2)));
/// assert_eq!(delays.next(), Some(Duration::from_secs(4)));
/// ```
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// The first cool-off delay.
    initial: Duration,
    /// Upper bound applied to every delay.
    cap: Duration,
    /// Multiplier applied for each further attempt.
    factor: f64,
    /// Randomization factor in `[0.0, 1.0]`; `0.0` disables jitter.
    jitter: f64,
    attempt: u32,
}

impl ExponentialBackoff {
    /// A doubling backoff between `initial` and `cap`, without jitter.
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            initial,
            cap,
            factor: 2.0,
            jitter: 0.0,
            attempt: 0,
        }
    }

    /// Overrides the growth factor.
    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Enables jitter; each delay is scaled by a random factor in
    /// `[1 - jitter, 1 + jitter]` before capping.
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Restarts the sequence from the initial delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        // attempt is >= 1 here, the iterator increments before calling.
        let base_ms = (self.initial.as_millis() as f64) * self.factor.powi((attempt - 1) as i32);

        if self.jitter == 0.0 {
            return Duration::from_millis(base_ms as u64).min(self.cap);
        }

        let scale: f64 = rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        Duration::from_millis((base_ms * scale) as u64).min(self.cap)
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);
        Some(self.delay_for(self.attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        let mut delays = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(20));
        let observed: Vec<_> = (0..6).map(|_| delays.next().unwrap().as_secs()).collect();
        assert_eq!(observed, vec![1, 2, 4, 8, 16, 20]);
        // stays at the cap forever
        assert_eq!(delays.next(), Some(Duration::from_secs(20)));
    }

    #[test]
    fn custom_factor() {
        let mut delays = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(60))
            .factor(3.0);
        assert_eq!(delays.next(), Some(Duration::from_millis(100)));
        assert_eq!(delays.next(), Some(Duration::from_millis(300)));
        assert_eq!(delays.next(), Some(Duration::from_millis(900)));
    }

    #[test]
    fn jitter_stays_in_range() {
        let mut delays = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(60))
            .jitter(0.5);
        let first = delays.next().unwrap();
        assert!(first >= Duration::from_millis(50));
        assert!(first <= Duration::from_millis(150));
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let mut delays = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(20));
        delays.next();
        delays.next();
        delays.reset();
        assert_eq!(delays.next(), Some(Duration::from_secs(1)));
    }
}
