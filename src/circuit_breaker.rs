// Circuit breaker over discovery passes. A pass counts as a failure only when the
// upstream could not be reached for any window.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    state: State,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Closed { failures: u32 },
    Open { opened_at: Instant },
    HalfOpen,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            state: State::Closed { failures: 0 },
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed { .. })
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, State::Open { .. })
    }

    // Open moves to HalfOpen once the cooldown has passed; the next pass is the probe.
    pub fn should_allow_call(&mut self) -> bool {
        match self.state {
            State::Closed { .. } | State::HalfOpen => true,
            State::Open { opened_at } => {
                if opened_at.elapsed() >= self.cooldown {
                    info!("upstream cooldown over, probing");
                    self.state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn success(&mut self) {
        match self.state {
            State::HalfOpen => {
                info!("upstream probe succeeded, breaker closed");
                self.state = State::Closed { failures: 0 };
            }
            State::Closed { failures } if failures > 0 => {
                self.state = State::Closed { failures: 0 };
            }
            _ => {}
        }
    }

    pub fn fail(&mut self) {
        match &mut self.state {
            State::Closed { failures } => {
                *failures += 1;
                if *failures >= self.failure_threshold {
                    warn!(
                        failures = *failures,
                        cooldown_secs = self.cooldown.as_secs(),
                        "upstream unreachable, breaker opened"
                    );
                    self.state = State::Open {
                        opened_at: Instant::now(),
                    };
                }
            }
            State::HalfOpen => {
                warn!("upstream probe failed, breaker reopened");
                self.state = State::Open {
                    opened_at: Instant::now(),
                };
            }
            State::Open { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let mut cb = CircuitBreaker::new(3, Duration::from_secs(10));

        cb.fail();
        cb.fail();
        assert!(cb.is_closed());
        assert!(cb.should_allow_call());

        cb.fail();
        assert!(cb.is_open());
        assert!(!cb.should_allow_call());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let mut cb = CircuitBreaker::new(2, Duration::from_secs(10));
        cb.fail();
        cb.success();
        cb.fail();
        assert!(cb.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe() {
        let mut cb = CircuitBreaker::new(1, Duration::from_secs(10));
        cb.fail();
        assert!(!cb.should_allow_call());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cb.should_allow_call());
        assert!(!cb.is_open());

        // failed probe reopens for a full cooldown
        cb.fail();
        assert!(cb.is_open());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!cb.should_allow_call());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cb.should_allow_call());
        cb.success();
        assert!(cb.is_closed());
    }
}
