//! Plain-values configuration for the sampling pipeline.
//!
//! Owned by the CLI layer in `main.rs`; the pipeline only consumes the
//! resolved values.

use std::time::Duration;

use anyhow::{bail, Result};

use crate::taskstats::TargetKind;

/// Default sampling period.
pub const DEFAULT_PERIOD_MS: u64 = 1000;

/// Default query worker count.
pub const DEFAULT_WORKERS: usize = 10;

/// How each sample is rendered by the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line structured block per sample, for interactive display.
    Block {
        /// Human-readable units (ms, dates) instead of raw counters.
        human_units: bool,
    },
    /// One tab-separated line per sample, for file output.
    Tsv,
}

/// Resolved monitoring configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether queries address a process id or a thread-group id.
    pub kind: TargetKind,
    /// The id to monitor.
    pub target_id: u32,
    /// Sampling period.
    pub period: Duration,
    /// Number of query workers.
    pub workers: usize,
    /// Sample queue capacity.
    pub queue_capacity: usize,
    /// Render mode for the sink.
    pub format: OutputFormat,
}

impl Config {
    /// Configuration with default sizing for the given target.
    pub fn new(kind: TargetKind, target_id: u32) -> Self {
        Self {
            kind,
            target_id,
            period: Duration::from_millis(DEFAULT_PERIOD_MS),
            workers: DEFAULT_WORKERS,
            queue_capacity: crate::queue::DEFAULT_CAPACITY,
            format: OutputFormat::Block { human_units: true },
        }
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.target_id == 0 {
            bail!("target id must be non-zero");
        }
        if self.period.is_zero() {
            bail!("sampling period must be > 0");
        }
        if self.workers == 0 {
            bail!("worker count must be > 0");
        }
        if self.queue_capacity == 0 {
            bail!("queue capacity must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = Config::new(TargetKind::Pid, 1234);
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.period, Duration::from_millis(1000));
        assert_eq!(cfg.workers, 10);
        assert_eq!(cfg.queue_capacity, 1000);
    }

    #[test]
    fn test_validate_rejects_nonsense() {
        let mut cfg = Config::new(TargetKind::Pid, 0);
        assert!(cfg.validate().is_err());

        cfg.target_id = 1;
        cfg.period = Duration::ZERO;
        assert!(cfg.validate().is_err());

        cfg.period = Duration::from_millis(10);
        cfg.workers = 0;
        assert!(cfg.validate().is_err());

        cfg.workers = 1;
        cfg.queue_capacity = 0;
        assert!(cfg.validate().is_err());
    }
}
