//! Forward-path loss signaling from repeated NACKs.

mod tracker;

pub use tracker::{NackTracker, NackTrackerConfig};
