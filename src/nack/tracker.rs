//! Windowed repeated-NACK ratio tracking.
//!
//! A first-time NACK often means an isolated loss; a repeated NACK (for a
//! sequence number already NACK'd) means the retransmission is being lost
//! too, which is a much stronger hint of forward-path congestion. The
//! tracker watches the ratio of repeated NACKs to forwarded packets over a
//! window that arms itself on the first repeated NACK, so it locks onto the
//! onset of a burst instead of diluting it across idle time.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration of one NACK tracker window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NackTrackerConfig {
    /// Minimum age of an active window before it may trigger.
    pub window_min_duration: Duration,
    /// Maximum age of a window; beyond this the next `add` starts over.
    pub window_max_duration: Duration,
    /// The trigger fires on ratios strictly above this.
    pub ratio_threshold: f64,
}

impl NackTrackerConfig {
    /// Preset for probe streams: a short, sensitive window.
    pub fn probe() -> Self {
        Self {
            window_min_duration: Duration::from_millis(500),
            window_max_duration: Duration::from_secs(1),
            ratio_threshold: 0.04,
        }
    }

    /// Preset for regular media streams: slower and more tolerant.
    pub fn non_probe() -> Self {
        Self {
            window_min_duration: Duration::from_secs(2),
            window_max_duration: Duration::from_secs(3),
            ratio_threshold: 0.08,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_max_duration.is_zero() {
            return Err(Error::ErrInvalidNackTrackerConfig(
                "window_max_duration must be positive".into(),
            ));
        }
        if self.window_min_duration > self.window_max_duration {
            return Err(Error::ErrInvalidNackTrackerConfig(format!(
                "window_min_duration ({:?}) must not exceed window_max_duration ({:?})",
                self.window_min_duration, self.window_max_duration
            )));
        }
        if !self.ratio_threshold.is_finite() || !(0.0..=1.0).contains(&self.ratio_threshold) {
            return Err(Error::ErrInvalidNackTrackerConfig(format!(
                "ratio_threshold ({}) must be within [0, 1]",
                self.ratio_threshold
            )));
        }
        Ok(())
    }
}

impl Default for NackTrackerConfig {
    fn default() -> Self {
        Self::non_probe()
    }
}

/// Per-stream repeated-NACK ratio monitor.
///
/// # Concurrency
///
/// Single-writer discipline: [`NackTracker::add`] takes `&mut self` and is
/// the only state change; reads are side-effect-free. The caller supplies
/// `now` on every call, so tests drive the window with fabricated instants.
pub struct NackTracker {
    name: String,
    config: NackTrackerConfig,

    window_start: Option<Instant>,
    packets: u32,
    repeated_nacks: u32,
}

impl NackTracker {
    /// Build a tracker for the stream identified by `name`, failing on
    /// inconsistent configuration.
    pub fn new(name: impl Into<String>, config: NackTrackerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            window_start: None,
            packets: 0,
            repeated_nacks: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Account one batch of forwarded packets and the repeated NACKs seen
    /// for them.
    pub fn add(&mut self, now: Instant, packets: u32, repeated_nacks: u32) {
        if let Some(start) = self.window_start {
            if now.saturating_duration_since(start) > self.config.window_max_duration {
                // The window aged out; fall back to dormant before looking
                // at this batch.
                self.window_start = None;
                self.packets = 0;
                self.repeated_nacks = 0;
            }
        }

        // Arm the window only when repeated NACKs start happening, locking
        // onto the onset of a burst: either the NACKs keep adding up (a
        // congestion sign) or it was an isolated loss and the window ages
        // out.
        if self.repeated_nacks == 0 && repeated_nacks != 0 {
            self.window_start = Some(now);
        }

        if self.window_start.is_some() {
            self.packets = self.packets.saturating_add(packets);
            self.repeated_nacks = self.repeated_nacks.saturating_add(repeated_nacks);
        }
    }

    /// Repeated-NACK ratio of the active window, clamped to `[0, 1]`.
    pub fn ratio(&self) -> f64 {
        if self.packets == 0 {
            return 0.0;
        }
        (f64::from(self.repeated_nacks) / f64::from(self.packets)).min(1.0)
    }

    /// Whether the window is old enough and its ratio high enough to signal
    /// congestion-symptomatic loss.
    pub fn is_triggered(&self, now: Instant) -> bool {
        match self.window_start {
            Some(start) => {
                now.saturating_duration_since(start) > self.config.window_min_duration
                    && self.ratio() > self.config.ratio_threshold
            }
            None => false,
        }
    }
}

impl fmt::Display for NackTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "name: {}", self.name)?;
        if self.window_start.is_some() {
            write!(f, ", window: active")?;
        } else {
            write!(f, ", window: dormant")?;
        }
        write!(
            f,
            ", packets: {}, repeated nacks: {}, ratio: {:.2}",
            self.packets,
            self.repeated_nacks,
            self.ratio()
        )
    }
}
