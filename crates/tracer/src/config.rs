use std::time::Duration;
use thiserror::Error;

use crate::MergerConfig;

/// Errors in a capture session configuration
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be non-zero")]
    Zero(&'static str),
}

/// Tuning of the drain loop, supplied once at session start
#[derive(Debug, Clone, PartialEq)]
pub struct TracerConfig {
    /// Longest the driver blocks waiting for readiness
    pub poll_timeout: Duration,

    /// Time without progress after which a source stops holding back the watermark
    pub stall_timeout: Duration,

    /// How far behind the clock an idle, fully drained source is assumed to be
    pub idle_slack: Duration,

    /// Records consumed from one source per round
    pub batch_cap: usize,

    /// Capacity of the queue between the driver and the sink consumer
    pub sink_queue: usize,

    /// Whether a stalled source counts toward the watermark again once it reports
    pub rejoin_stalled: bool,
}

impl Default for TracerConfig {
    fn default() -> Self {
        TracerConfig {
            poll_timeout: Duration::from_millis(10),
            stall_timeout: Duration::from_secs(1),
            idle_slack: Duration::from_millis(5),
            batch_cap: 4096,
            sink_queue: 64 * 1024,
            rejoin_stalled: true,
        }
    }
}

impl TracerConfig {
    /// Checks the values the drain loop cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_timeout.is_zero() {
            return Err(ConfigError::Zero("poll timeout"));
        }
        if self.stall_timeout.is_zero() {
            return Err(ConfigError::Zero("stall timeout"));
        }
        if self.batch_cap == 0 {
            return Err(ConfigError::Zero("batch cap"));
        }
        if self.sink_queue == 0 {
            return Err(ConfigError::Zero("sink queue"));
        }
        Ok(())
    }

    pub fn merger_config(&self) -> MergerConfig {
        MergerConfig {
            stall_timeout_ns: duration_ns(self.stall_timeout),
            idle_slack_ns: duration_ns(self.idle_slack),
            rejoin_stalled: self.rejoin_stalled,
        }
    }
}

fn duration_ns(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        let config = TracerConfig::default();
        assert_eq!(config.validate(), Ok(()));

        let merger = config.merger_config();
        assert_eq!(merger.stall_timeout_ns, 1_000_000_000);
        assert_eq!(merger.idle_slack_ns, 5_000_000);
        assert!(merger.rejoin_stalled);
    }

    #[rstest]
    #[case(TracerConfig { poll_timeout: Duration::ZERO, ..TracerConfig::default() }, "poll timeout")]
    #[case(TracerConfig { stall_timeout: Duration::ZERO, ..TracerConfig::default() }, "stall timeout")]
    #[case(TracerConfig { batch_cap: 0, ..TracerConfig::default() }, "batch cap")]
    #[case(TracerConfig { sink_queue: 0, ..TracerConfig::default() }, "sink queue")]
    fn test_zero_values_are_rejected(#[case] config: TracerConfig, #[case] field: &'static str) {
        assert_eq!(config.validate(), Err(ConfigError::Zero(field)));
    }

    #[test]
    fn test_zero_idle_slack_is_allowed() {
        let config = TracerConfig {
            idle_slack: Duration::ZERO,
            ..TracerConfig::default()
        };
        assert_eq!(config.validate(), Ok(()));
    }
}
