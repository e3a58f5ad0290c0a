use rand::Rng;
use std::time::Duration;

const JITTER: f64 = 0.2;

/// Exponential reconnect delay: doubles per consecutive failure, capped at
/// `max`, with ±20% jitter that never exceeds the cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Backoff {
            initial,
            max,
            current: initial,
        }
    }

    pub fn from_secs(initial: u64, max: u64) -> Self {
        Self::new(Duration::from_secs(initial), Duration::from_secs(max))
    }

    /// Delay before the next reconnect attempt.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);

        let factor = rand::thread_rng().gen_range(1.0 - JITTER..=1.0 + JITTER);
        base.mul_f64(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Un-jittered delay the next call to [`Backoff::next_delay`] is based on.
    #[cfg(test)]
    pub fn current(&self) -> Duration {
        self.current
    }
}
