//! Congestion signaling core for a Selective Forwarding Unit.
//!
//! Two subsystems turn raw transport telemetry into stable, hysteresis-
//! smoothed congestion signals for the SFU's stream allocator:
//!
//! - [`SendSideBwe`]: a send-side congestion detector driven by
//!   transport-wide feedback (per-packet remote arrival times). It groups
//!   acknowledged packets, tracks a propagated queuing delay, and
//!   classifies the channel into discrete [`CongestionState`]s, notifying
//!   subscribers on every transition.
//! - [`NackTracker`]: a per-stream, windowed repeated-NACK ratio monitor
//!   signaling forward-path loss symptomatic of congestion.
//!
//! Both are passive, single-writer objects: methods run on whichever task
//! calls them, time is supplied by the caller, and nothing blocks. The
//! surrounding SFU (forwarding, signaling, allocation policy) lives
//! elsewhere; it feeds [`PacketSent`] records and [`FeedbackReport`]s in
//! and reads congestion state out.
//!
//! # Example
//!
//! ```ignore
//! use rtc_bwe::{SendSideBwe, SendSideBweConfig};
//! use std::time::Instant;
//!
//! let mut bwe = SendSideBwe::new(SendSideBweConfig::default())?;
//! bwe.subscribe(|change| {
//!     log::info!("congestion: {} -> {}", change.from, change.to);
//! });
//!
//! // On every forwarded packet:
//! bwe.on_packet_sent(packet_sent);
//! // On every TWCC feedback packet:
//! let report = rtc_bwe::FeedbackReport::from_transport_cc(&tcc, epoch);
//! bwe.on_feedback(Instant::now(), &report);
//! ```

#![warn(rust_2018_idioms)]

pub mod bwe;
pub mod error;
pub mod feedback;
pub mod nack;

pub use bwe::{
    CongestionDetectorConfig, CongestionState, CongestionStateChange, GroupScalars, QueuingRegion,
    SendSideBwe, SendSideBweConfig, SubscriptionId,
};
pub use error::{Error, Result};
pub use feedback::{FeedbackEntry, FeedbackReport, PacketSent};
pub use nack::{NackTracker, NackTrackerConfig};
