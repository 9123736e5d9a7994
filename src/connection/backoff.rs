// ABOUTME: Reconnect delay generators
// ABOUTME: Fixed delays for the basic policy, capped doubling with jitter for exponential

use crate::config::ReconnectPolicy;
use rand::Rng;
use std::time::Duration;

const FACTOR: f64 = 2.0;

/// Delay generator for one reconnect episode
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Same delay every time
    Fixed(Duration),
    /// Capped doubling delay
    Exponential(ExponentialBackoff),
}

impl Backoff {
    /// Fresh generator for `policy`
    pub fn new(policy: &ReconnectPolicy) -> Self {
        match policy {
            ReconnectPolicy::Basic { delay, .. } => Backoff::Fixed(*delay),
            ReconnectPolicy::Exponential {
                initial_delay,
                max_delay,
                randomization_factor,
                ..
            } => Backoff::Exponential(ExponentialBackoff::new(
                *initial_delay,
                *max_delay,
                *randomization_factor,
            )),
        }
    }

    /// Delay before the next try
    pub fn next_delay(&mut self) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential(backoff) => backoff.next_delay(),
        }
    }
}

/// Doubling delay capped at `max`, jittered after capping
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    max: f64,
    randomization_factor: f64,
    next: f64,
}

impl ExponentialBackoff {
    /// Start at `initial`
    pub fn new(initial: Duration, max: Duration, randomization_factor: f64) -> Self {
        Self {
            max: max.as_millis() as f64,
            randomization_factor: randomization_factor.clamp(0.0, 1.0),
            next: initial.as_millis() as f64,
        }
    }

    /// Delay before the next try
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next.min(self.max);
        self.next = delay * FACTOR;

        let jitter = if self.randomization_factor > 0.0 {
            rand::thread_rng().gen::<f64>() * self.randomization_factor
        } else {
            0.0
        };

        Duration::from_millis((delay * (1.0 + jitter)).round() as u64)
    }
}
