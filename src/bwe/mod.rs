//! Send-side bandwidth estimation.
//!
//! Transport-wide feedback pairs every sent packet with its remote arrival
//! time. From those pairs the congestion detector derives per-group delta
//! one-way delay, accumulates it into a propagated queuing delay, and
//! classifies groups into queuing regions (JQR congested, DQR uncongested,
//! with a hysteresis band in between). Runs of classified groups drive a
//! five-state machine whose hangover states keep the signal from flapping:
//!
//! ```text
//! None -> EarlyWarning -> Congested
//!           |    ^           |
//!           v    |           v
//! EarlyWarningHangover <- CongestedHangover
//! ```
//!
//! The [`SendSideBwe`] facade owns the detector and fans transitions out to
//! subscribers; the stream allocator reacts to them elsewhere.

use std::fmt;

use serde::{Deserialize, Serialize};

mod config;
mod congestion_detector;
mod packet_group;
mod packet_tracker;
mod send_side;

pub use config::{CongestionDetectorConfig, SendSideBweConfig};
pub use congestion_detector::CongestionStateChange;
pub use packet_group::{GroupScalars, QueuingRegion};
pub use send_side::{SendSideBwe, SubscriptionId};

/// Discrete congestion verdict over the forward path.
///
/// Ordered by severity, but transitions follow the detector's state
/// machine, never the ordering. The hangover states are cooldowns after a
/// downward transition so a brief improvement cannot flap the signal.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CongestionState {
    #[default]
    None,
    EarlyWarningHangover,
    EarlyWarning,
    CongestedHangover,
    Congested,
}

impl fmt::Display for CongestionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CongestionState::None => write!(f, "none"),
            CongestionState::EarlyWarning => write!(f, "early_warning"),
            CongestionState::EarlyWarningHangover => write!(f, "early_warning_hangover"),
            CongestionState::Congested => write!(f, "congested"),
            CongestionState::CongestedHangover => write!(f, "congested_hangover"),
        }
    }
}
