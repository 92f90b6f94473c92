use std::time::Duration;

use rand::Rng;

/// Serializable form of a restart policy, as found in the engine config and in the
/// `restart.strategy` job property.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "param")]
pub enum RestartStrategy {
    NoRestart,
    FixedDelay {
        max_attempts: u32,
        delay_ms: u64,
    },
    ExponentialBackoff {
        max_attempts: u32,
        initial_ms: u64,
        max_ms: u64,
        multiplier: f64,
    },
}

impl RestartStrategy {
    pub fn create_policy(&self) -> Box<dyn RestartPolicy> {
        match self {
            RestartStrategy::NoRestart => Box::new(NoRestart),
            RestartStrategy::FixedDelay {
                max_attempts,
                delay_ms,
            } => Box::new(FixedDelayRestart::new(
                *max_attempts,
                Duration::from_millis(*delay_ms),
            )),
            RestartStrategy::ExponentialBackoff {
                max_attempts,
                initial_ms,
                max_ms,
                multiplier,
            } => Box::new(ExponentialBackoffRestart::new(
                *max_attempts,
                Duration::from_millis(*initial_ms),
                Duration::from_millis(*max_ms),
                *multiplier,
            )),
        }
    }
}

impl Default for RestartStrategy {
    fn default() -> Self {
        RestartStrategy::NoRestart
    }
}

/// Decides whether a failed pipeline is restarted and how long to wait before.
pub trait RestartPolicy: Send {
    /// `attempt` is 1 for the first restart of a pipeline. `None` gives up.
    fn next_delay(&mut self, attempt: u32) -> Option<Duration>;
}

#[derive(Clone, Debug)]
pub struct NoRestart;

impl RestartPolicy for NoRestart {
    fn next_delay(&mut self, _attempt: u32) -> Option<Duration> {
        None
    }
}

#[derive(Clone, Debug)]
pub struct FixedDelayRestart {
    max_attempts: u32,
    delay: Duration,
}

impl FixedDelayRestart {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        FixedDelayRestart {
            max_attempts,
            delay,
        }
    }
}

impl RestartPolicy for FixedDelayRestart {
    fn next_delay(&mut self, attempt: u32) -> Option<Duration> {
        if attempt > self.max_attempts {
            None
        } else {
            Some(self.delay)
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExponentialBackoffRestart {
    max_attempts: u32,
    initial: Duration,
    max: Duration,
    multiplier: f64,
    /// fraction of the delay added or removed at random
    jitter: f64,
}

impl ExponentialBackoffRestart {
    pub fn new(max_attempts: u32, initial: Duration, max: Duration, multiplier: f64) -> Self {
        ExponentialBackoffRestart {
            max_attempts,
            initial,
            max,
            multiplier: multiplier.max(1.0),
            jitter: 0.1,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.max(0.0).min(1.0);
        self
    }
}

impl RestartPolicy for ExponentialBackoffRestart {
    fn next_delay(&mut self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }

        let exp = self.multiplier.powi(attempt as i32 - 1);
        let base = (self.initial.as_millis() as f64 * exp).min(self.max.as_millis() as f64);
        let delay = if self.jitter > 0.0 {
            let spread = base * self.jitter;
            rand::thread_rng().gen_range((base - spread)..=(base + spread))
        } else {
            base
        };
        let delay = delay.max(0.0).min(self.max.as_millis() as f64);
        Some(Duration::from_millis(delay as u64))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::runtime::coordinator::restart::{
        ExponentialBackoffRestart, RestartPolicy, RestartStrategy,
    };

    #[test]
    pub fn fixed_delay_test() {
        let mut policy = RestartStrategy::FixedDelay {
            max_attempts: 2,
            delay_ms: 10,
        }
        .create_policy();
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(10)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(10)));
        assert_eq!(policy.next_delay(3), None);

        assert_eq!(RestartStrategy::NoRestart.create_policy().next_delay(1), None);
    }

    #[test]
    pub fn exponential_backoff_test() {
        let mut policy = ExponentialBackoffRestart::new(
            4,
            Duration::from_millis(100),
            Duration::from_millis(300),
            2.0,
        )
        .with_jitter(0.0);
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_millis(300)));
        assert_eq!(policy.next_delay(5), None);

        let mut jittered = ExponentialBackoffRestart::new(
            3,
            Duration::from_millis(1000),
            Duration::from_millis(10000),
            2.0,
        );
        for _ in 0..20 {
            let d = jittered.next_delay(2).unwrap();
            assert!(d >= Duration::from_millis(1800) && d <= Duration::from_millis(2200));
        }
    }

    #[test]
    pub fn serde_test() {
        let strategy = RestartStrategy::FixedDelay {
            max_attempts: 3,
            delay_ms: 1000,
        };
        let json = serde_json::to_string(&strategy).unwrap();
        assert_eq!(
            json,
            r#"{"type":"FixedDelay","param":{"max_attempts":3,"delay_ms":1000}}"#
        );
        let back: RestartStrategy = serde_json::from_str(json.as_str()).unwrap();
        assert_eq!(back, strategy);
    }
}
