use std::time::Duration;

use ts::clock::PKT_SIZE;

use crate::stuffing::StuffingConfig;
use crate::{PipelineError, Result};

/// Default pipeline buffer size in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024 * 1024;
/// Default bitrate re-evaluation interval.
pub const DEFAULT_BITRATE_ADJUST: Duration = Duration::from_secs(5);
/// Default flush threshold in offline mode.
pub const DEFAULT_MAX_FLUSH_OFFLINE: usize = 10_000;
/// Default flush threshold in realtime mode.
pub const DEFAULT_MAX_FLUSH_REALTIME: usize = 1_000;
/// Default input batch cap in realtime mode (offline is unbounded).
pub const DEFAULT_MAX_INPUT_REALTIME: usize = 1_000;

/// Realtime processing tri-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Realtime {
    /// Decide from the defaults (offline).
    #[default]
    Auto,
    On,
    Off,
}

/// Static pipeline options, built once before start.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Name used in logs.
    pub name: String,
    /// Total in-flight window in bytes.
    pub buffer_size: usize,
    /// Packets a stage may hold back before releasing downstream
    /// (0 = realtime-dependent default).
    pub max_flush_packets: usize,
    /// Packets read from the input per call (0 = realtime-dependent default).
    pub max_input_packets: usize,
    /// Fixed TS bitrate override in b/s (0 = discover).
    pub bitrate: u64,
    /// Period of bitrate re-evaluation.
    pub bitrate_adjust_interval: Duration,
    /// Input stuffing configuration.
    pub stuffing: StuffingConfig,
    pub realtime: Realtime,
    /// Refuse joint-termination registrations.
    pub ignore_joint_termination: bool,
    /// Run the resource monitor thread.
    pub monitor: bool,
    pub monitor_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            name: "tsp".to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_flush_packets: 0,
            max_input_packets: 0,
            bitrate: 0,
            bitrate_adjust_interval: DEFAULT_BITRATE_ADJUST,
            stuffing: StuffingConfig::default(),
            realtime: Realtime::Auto,
            ignore_joint_termination: false,
            monitor: false,
            monitor_interval: Duration::from_secs(10),
        }
    }
}

impl PipelineConfig {
    pub fn is_realtime(&self) -> bool {
        matches!(self.realtime, Realtime::On)
    }

    /// Effective flush threshold in packets.
    pub fn effective_max_flush(&self) -> usize {
        if self.max_flush_packets != 0 {
            self.max_flush_packets
        } else if self.is_realtime() {
            DEFAULT_MAX_FLUSH_REALTIME
        } else {
            DEFAULT_MAX_FLUSH_OFFLINE
        }
    }

    /// Effective input batch size in packets.
    pub fn effective_max_input(&self) -> usize {
        if self.max_input_packets != 0 {
            self.max_input_packets
        } else if self.is_realtime() {
            DEFAULT_MAX_INPUT_REALTIME
        } else {
            // Offline: bounded by the flush threshold
            self.effective_max_flush()
        }
    }

    /// Total buffer capacity in packets.
    pub fn buffer_packets(&self) -> usize {
        (self.buffer_size / PKT_SIZE).max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_packets() < self.effective_max_flush() {
            return Err(PipelineError::Config(format!(
                "buffer of {} packets is smaller than the flush threshold of {}",
                self.buffer_packets(),
                self.effective_max_flush()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_realtime_defaults() {
        let mut config = PipelineConfig::default();
        assert_eq!(config.effective_max_flush(), DEFAULT_MAX_FLUSH_OFFLINE);
        config.realtime = Realtime::On;
        assert_eq!(config.effective_max_flush(), DEFAULT_MAX_FLUSH_REALTIME);
        assert_eq!(config.effective_max_input(), DEFAULT_MAX_INPUT_REALTIME);
    }

    #[test]
    fn test_tiny_buffer_rejected() {
        let config = PipelineConfig {
            buffer_size: 100 * PKT_SIZE,
            max_flush_packets: 500,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
