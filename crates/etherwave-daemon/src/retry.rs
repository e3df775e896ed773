use std::time::Duration;

/// What to do after a playback failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

/// Stateless backoff policy for playback retries.  Linear curve: the delay
/// before the 1-indexed attempt N is `base_delay * N`.  (The icon cache uses
/// its own exponential curve; backoff shapes are per subsystem.)
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_retries: u32,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_retries,
        }
    }

    pub fn from_config(config: &etherwave_proto::config::RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            config.max_retries,
        )
    }

    /// `attempt` is 1-indexed: pass 1 after the first failure.
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        if attempt == 0 || attempt > self.max_retries {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry {
                delay: self.base_delay * attempt,
            }
        }
    }
}
