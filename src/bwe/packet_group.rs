//! Feedback packet groups and queuing-region classification.
//!
//! Packets whose feedback has arrived are aggregated into groups so that
//! single-packet jitter does not drive the detector. Each closed group
//! yields one delta one-way-delay sample and one queuing-region verdict.

use std::fmt;
use std::time::Instant;

use super::config::CongestionDetectorConfig;
use super::packet_tracker::{PacketFate, PacketRecord};

/// Queuing region a closed packet group operated in.
///
/// `Jqr` (join queuing region) means the channel queued the group's packets,
/// `Dqr` (disjoint queuing region) means it did not. Groups falling inside
/// the hysteresis band between the two thresholds, and groups too small to
/// judge, are `Indeterminate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuingRegion {
    Jqr,
    Dqr,
    Indeterminate,
}

impl fmt::Display for QueuingRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueuingRegion::Jqr => write!(f, "jqr"),
            QueuingRegion::Dqr => write!(f, "dqr"),
            QueuingRegion::Indeterminate => write!(f, "indeterminate"),
        }
    }
}

/// Aggregate scalars of a closed packet group.
///
/// Signed durations are integer microseconds: receive spans go negative
/// under reordering and delta one-way delay is negative whenever the queue
/// drains, neither of which fits an unsigned `Duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupScalars {
    /// Send span: last send time minus first send time.
    pub send_span_us: i64,
    /// Receive span over received packets: last arrival minus first arrival.
    pub recv_span_us: i64,
    /// `recv_span_us - send_span_us`.
    pub delta_owd_us: i64,
    /// Propagated queuing delay at group entry plus this group's delta,
    /// clamped at zero.
    pub queuing_delay_us: i64,
    pub num_packets: u32,
    pub num_lost: u32,
    pub num_probe_packets: u32,
    pub num_bytes: u64,
    pub region: QueuingRegion,
}

impl fmt::Display for GroupScalars {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "packets: {} (lost: {}, probe: {}), bytes: {}, send span: {}us, recv span: {}us, delta owd: {}us, queuing delay: {}us, region: {}",
            self.num_packets,
            self.num_lost,
            self.num_probe_packets,
            self.num_bytes,
            self.send_span_us,
            self.recv_span_us,
            self.delta_owd_us,
            self.queuing_delay_us,
            self.region,
        )
    }
}

/// An open packet group accumulating records in sequence order.
///
/// A group is closed exactly once, by [`PacketGroup::close`], when the next
/// record starts a new group or the detector decides the span is exhausted;
/// after that its scalars never change.
pub(crate) struct PacketGroup {
    first_send: Instant,
    last_send: Instant,
    /// Arrival of the first received packet, in sequence order.
    first_recv: Option<Instant>,
    /// Arrival of the last received packet, in sequence order. May precede
    /// `first_recv` under reordering.
    last_recv: Option<Instant>,
    num_packets: u32,
    num_lost: u32,
    num_probe_packets: u32,
    num_bytes: u64,
}

impl PacketGroup {
    pub(crate) fn new(record: &PacketRecord) -> Self {
        let mut group = Self {
            first_send: record.send_time,
            last_send: record.send_time,
            first_recv: None,
            last_recv: None,
            num_packets: 0,
            num_lost: 0,
            num_probe_packets: 0,
            num_bytes: 0,
        };
        group.push(record);
        group
    }

    /// Whether `next_send` must open a new group instead of joining this one.
    pub(crate) fn starts_new_group(
        &self,
        config: &CongestionDetectorConfig,
        next_send: Instant,
    ) -> bool {
        let gap = next_send.saturating_duration_since(self.last_send);
        if gap > config.group_gap_threshold {
            return true;
        }
        if next_send.saturating_duration_since(self.first_send) > config.max_group_duration {
            return true;
        }
        // Once the group is large enough, any send pause ends it.
        self.num_packets >= config.min_packets_per_group && !gap.is_zero()
    }

    pub(crate) fn push(&mut self, record: &PacketRecord) {
        self.last_send = record.send_time;
        self.num_packets += 1;
        self.num_bytes += u64::from(record.size_bytes);
        if record.is_probe {
            self.num_probe_packets += 1;
        }
        match record.fate {
            PacketFate::Received(arrival) => {
                if self.first_recv.is_none() {
                    self.first_recv = Some(arrival);
                }
                self.last_recv = Some(arrival);
            }
            PacketFate::Lost => self.num_lost += 1,
            // The detector only feeds resolved records into groups.
            PacketFate::Pending => {}
        }
    }

    /// Close the group: derive its scalars and classify its queuing region.
    pub(crate) fn close(
        self,
        config: &CongestionDetectorConfig,
        propagated_queuing_delay_us: i64,
    ) -> GroupScalars {
        let send_span_us = micros_between(self.first_send, self.last_send);
        let recv_span_us = match (self.first_recv, self.last_recv) {
            (Some(first), Some(last)) => micros_between(first, last),
            _ => 0,
        };
        let delta_owd_us = recv_span_us - send_span_us;
        let queuing_delay_us = (propagated_queuing_delay_us + delta_owd_us).max(0);

        let region = if self.num_packets < config.min_packets_per_group {
            QueuingRegion::Indeterminate
        } else if queuing_delay_us >= config.jqr_min_delay.as_micros() as i64 {
            QueuingRegion::Jqr
        } else if queuing_delay_us <= config.dqr_max_delay.as_micros() as i64 {
            QueuingRegion::Dqr
        } else {
            QueuingRegion::Indeterminate
        };

        GroupScalars {
            send_span_us,
            recv_span_us,
            delta_owd_us,
            queuing_delay_us,
            num_packets: self.num_packets,
            num_lost: self.num_lost,
            num_probe_packets: self.num_probe_packets,
            num_bytes: self.num_bytes,
            region,
        }
    }
}

/// Signed microseconds from `a` to `b`.
fn micros_between(a: Instant, b: Instant) -> i64 {
    if b >= a {
        b.duration_since(a).as_micros() as i64
    } else {
        -(a.duration_since(b).as_micros() as i64)
    }
}
