//! Configuration for the send-side bandwidth estimator.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Knobs for the congestion detector. Defaults are documented per field;
/// they are deliberately stable so that deployments tuning a single knob
/// from a config file are not surprised by releases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CongestionDetectorConfig {
    /// Queuing delay at or above which a packet group is classified JQR
    /// (operating congested). Default: 25 ms.
    pub jqr_min_delay: Duration,
    /// Queuing delay at or below which a packet group is classified DQR
    /// (operating uncongested). Must be below `jqr_min_delay`; the gap
    /// between the two is the hysteresis band. Default: 5 ms.
    pub dqr_max_delay: Duration,
    /// Groups smaller than this are classified Indeterminate, and once a
    /// group holds this many packets any send pause closes it.
    /// Default: 20.
    pub min_packets_per_group: u32,
    /// A group never spans more than this much send time. Default: 150 ms.
    pub max_group_duration: Duration,
    /// A send-time gap above this always starts a new group.
    /// Default: 25 ms.
    pub group_gap_threshold: Duration,
    /// Consecutive JQR groups before leaving `None` for `EarlyWarning`.
    /// Default: 2.
    pub early_warning_groups: u32,
    /// Consecutive JQR groups (counted from the start of the run) before
    /// `EarlyWarning` escalates to `Congested`. Default: 4.
    pub congested_groups: u32,
    /// Consecutive DQR groups before a congested state drops into its
    /// hangover. Default: 2.
    pub recover_groups: u32,
    /// Consecutive DQR groups before a hangover state releases downwards.
    /// Default: 4.
    pub hangover_release_groups: u32,
    /// Consecutive DQR groups after which the propagated queuing delay is
    /// reset to zero outright. Default: 8.
    pub dqr_reset_run: u32,
    /// Closed packet groups retained for inspection. Default: 32.
    pub history_capacity: usize,
}

impl Default for CongestionDetectorConfig {
    fn default() -> Self {
        Self {
            jqr_min_delay: Duration::from_millis(25),
            dqr_max_delay: Duration::from_millis(5),
            min_packets_per_group: 20,
            max_group_duration: Duration::from_millis(150),
            group_gap_threshold: Duration::from_millis(25),
            early_warning_groups: 2,
            congested_groups: 4,
            recover_groups: 2,
            hangover_release_groups: 4,
            dqr_reset_run: 8,
            history_capacity: 32,
        }
    }
}

impl CongestionDetectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dqr_max_delay >= self.jqr_min_delay {
            return Err(Error::ErrInvalidDetectorConfig(format!(
                "dqr_max_delay ({:?}) must be below jqr_min_delay ({:?})",
                self.dqr_max_delay, self.jqr_min_delay
            )));
        }
        if self.min_packets_per_group == 0 {
            return Err(Error::ErrInvalidDetectorConfig(
                "min_packets_per_group must be at least 1".into(),
            ));
        }
        if self.max_group_duration.is_zero() || self.group_gap_threshold.is_zero() {
            return Err(Error::ErrInvalidDetectorConfig(
                "group durations must be positive".into(),
            ));
        }
        if self.early_warning_groups == 0 || self.recover_groups == 0 || self.dqr_reset_run == 0 {
            return Err(Error::ErrInvalidDetectorConfig(
                "group-count thresholds must be at least 1".into(),
            ));
        }
        if self.congested_groups <= self.early_warning_groups {
            return Err(Error::ErrInvalidDetectorConfig(format!(
                "congested_groups ({}) must exceed early_warning_groups ({})",
                self.congested_groups, self.early_warning_groups
            )));
        }
        // Below 2, a recovery could take longer than the documented
        // recover + hangover_release bound.
        if self.hangover_release_groups < 2 {
            return Err(Error::ErrInvalidDetectorConfig(
                "hangover_release_groups must be at least 2".into(),
            ));
        }
        if self.history_capacity == 0 {
            return Err(Error::ErrInvalidDetectorConfig(
                "history_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration of the send-side bandwidth estimator facade.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendSideBweConfig {
    pub congestion_detector: CongestionDetectorConfig,
}

impl SendSideBweConfig {
    pub fn validate(&self) -> Result<()> {
        self.congestion_detector.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(SendSideBweConfig::default().validate().is_ok());
    }

    #[test]
    fn test_inverted_band_rejected() {
        let config = CongestionDetectorConfig {
            jqr_min_delay: Duration::from_millis(5),
            dqr_max_delay: Duration::from_millis(25),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_equal_band_rejected() {
        let config = CongestionDetectorConfig {
            jqr_min_delay: Duration::from_millis(10),
            dqr_max_delay: Duration::from_millis(10),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_counts_rejected() {
        for mutate in [
            |c: &mut CongestionDetectorConfig| c.min_packets_per_group = 0,
            |c: &mut CongestionDetectorConfig| c.early_warning_groups = 0,
            |c: &mut CongestionDetectorConfig| c.recover_groups = 0,
            |c: &mut CongestionDetectorConfig| c.dqr_reset_run = 0,
            |c: &mut CongestionDetectorConfig| c.history_capacity = 0,
            |c: &mut CongestionDetectorConfig| c.hangover_release_groups = 1,
        ] {
            let mut config = CongestionDetectorConfig::default();
            mutate(&mut config);
            assert!(config.validate().is_err(), "{config:?} should be rejected");
        }
    }

    #[test]
    fn test_serde_round_trip() {
        let config = SendSideBweConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: SendSideBweConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn test_serde_partial_override() {
        let json = r#"{"congestion_detector": {"early_warning_groups": 3}}"#;
        let config: SendSideBweConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.congestion_detector.early_warning_groups, 3);
        // Everything else keeps its default.
        assert_eq!(
            config.congestion_detector.congested_groups,
            CongestionDetectorConfig::default().congested_groups
        );
    }
}
