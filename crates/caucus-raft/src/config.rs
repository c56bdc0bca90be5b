//! Timing configuration (heartbeat rate, election and pulse windows).

use crate::error::{RaftError, Result};
use std::time::Duration;

/// Raft timing configuration.
///
/// The heartbeat interval must stay below the smallest pulse window, otherwise
/// healthy followers would start spurious elections between beats.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Interval between leader heartbeats.
    ///
    /// Default: 100ms
    pub heartbeat_interval: Duration,

    /// Minimum election timeout (candidate waits this long before deciding
    /// the election round is over).
    ///
    /// Randomized between [min, max] to break split votes.
    ///
    /// Default: 150ms
    pub election_timeout_min: Duration,

    /// Maximum election timeout.
    ///
    /// Default: 300ms
    pub election_timeout_max: Duration,

    /// Minimum pulse window (follower failure-detection).
    ///
    /// If a follower sees no leader contact within its window, it becomes a
    /// candidate. Randomized between [min, max].
    ///
    /// Default: 150ms
    pub pulse_window_min: Duration,

    /// Maximum pulse window.
    ///
    /// Default: 300ms
    pub pulse_window_max: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(100),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            pulse_window_min: Duration::from_millis(150),
            pulse_window_max: Duration::from_millis(300),
        }
    }
}

impl RaftConfig {
    /// Validate the configuration invariants.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval >= self.pulse_window_min {
            return Err(RaftError::InvalidConfig {
                reason: format!(
                    "heartbeat_interval ({:?}) must be < pulse_window_min ({:?})",
                    self.heartbeat_interval, self.pulse_window_min
                ),
            });
        }

        if self.election_timeout_min > self.election_timeout_max {
            return Err(RaftError::InvalidConfig {
                reason: format!(
                    "election_timeout_min ({:?}) must be <= election_timeout_max ({:?})",
                    self.election_timeout_min, self.election_timeout_max
                ),
            });
        }

        if self.pulse_window_min > self.pulse_window_max {
            return Err(RaftError::InvalidConfig {
                reason: format!(
                    "pulse_window_min ({:?}) must be <= pulse_window_max ({:?})",
                    self.pulse_window_min, self.pulse_window_max
                ),
            });
        }

        Ok(())
    }

    /// Draw a randomized election timeout in [min, max].
    pub fn random_election_timeout(&self) -> Duration {
        random_between(self.election_timeout_min, self.election_timeout_max)
    }

    /// Draw a randomized pulse window in [min, max].
    pub fn random_pulse_window(&self) -> Duration {
        random_between(self.pulse_window_min, self.pulse_window_max)
    }
}

fn random_between(min: Duration, max: Duration) -> Duration {
    use rand::Rng;
    let min_ms = min.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
}
