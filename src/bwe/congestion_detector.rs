//! Delay-based congestion detection over transport-wide feedback.
//!
//! Based on a simplified form of the JitterPath approach
//! (<https://homepage.iis.sinica.edu.tw/papers/lcs/2114-F.pdf>): per-packet
//! delta one-way delay, derived from paired send and arrival timestamps, is
//! aggregated per packet group and accumulated into a propagated queuing
//! delay. Each group is then classified as operating in the join queuing
//! region (JQR, congested) or the disjoint queuing region (DQR,
//! uncongested), with a hysteresis band of indeterminate groups in between,
//! and runs of classified groups drive the congestion state machine.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, warn};

use super::config::CongestionDetectorConfig;
use super::packet_group::{GroupScalars, PacketGroup, QueuingRegion};
use super::packet_tracker::{PacketFate, PacketRecord, PacketRecordMap, SequenceUnwrapper};
use super::CongestionState;
use crate::feedback::{FeedbackReport, PacketSent};

/// Minimum spacing between warnings about malformed feedback.
const WARN_INTERVAL: Duration = Duration::from_secs(1);

/// Notification emitted on every congestion state transition.
///
/// Carries values only, never references into the detector, so subscribers
/// are free to keep or forward it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CongestionStateChange {
    /// When the transition was observed (the feedback ingestion time).
    pub at: Instant,
    pub from: CongestionState,
    pub to: CongestionState,
    /// Propagated queuing delay after the group that caused the transition.
    pub propagated_queuing_delay: Duration,
    /// Scalars of the group that caused the transition.
    pub group: GroupScalars,
}

/// Rate limiter for malformed-feedback warnings.
struct WarnThrottle {
    last: Option<Instant>,
    suppressed: u32,
}

impl WarnThrottle {
    fn new() -> Self {
        Self {
            last: None,
            suppressed: 0,
        }
    }

    fn unknown_sequence(&mut self, now: Instant, sequence_number: u16) {
        let due = self
            .last
            .is_none_or(|last| now.saturating_duration_since(last) >= WARN_INTERVAL);
        if due {
            warn!(
                "dropping feedback for unknown sequence number {sequence_number} ({} more suppressed)",
                self.suppressed
            );
            self.last = Some(now);
            self.suppressed = 0;
        } else {
            self.suppressed += 1;
        }
    }
}

/// Congestion detector: sliding window of packet groups, propagated queuing
/// delay, and the congestion state machine.
pub(crate) struct CongestionDetector {
    config: CongestionDetectorConfig,

    unwrapper: SequenceUnwrapper,
    packets: PacketRecordMap,

    /// First sequence number not yet assigned to any group.
    next_group_sequence_number: i64,
    open_group: Option<PacketGroup>,

    /// Highest sequence number covered by any feedback so far.
    feedback_watermark: i64,

    propagated_queuing_delay_us: i64,
    /// Length of the trailing run of JQR groups (not reset by
    /// indeterminate groups).
    jqr_streak: u32,
    /// Length of the trailing run of DQR groups (not reset by
    /// indeterminate groups).
    dqr_streak: u32,
    state: CongestionState,

    history: VecDeque<GroupScalars>,
    warn_throttle: WarnThrottle,
}

impl CongestionDetector {
    pub(crate) fn new(config: CongestionDetectorConfig) -> Self {
        Self {
            config,
            unwrapper: SequenceUnwrapper::new(),
            packets: PacketRecordMap::new(),
            next_group_sequence_number: 0,
            open_group: None,
            feedback_watermark: i64::MIN,
            propagated_queuing_delay_us: 0,
            jqr_streak: 0,
            dqr_streak: 0,
            state: CongestionState::None,
            history: VecDeque::new(),
            warn_throttle: WarnThrottle::new(),
        }
    }

    pub(crate) fn congestion_state(&self) -> CongestionState {
        self.state
    }

    pub(crate) fn propagated_queuing_delay(&self) -> Duration {
        Duration::from_micros(self.propagated_queuing_delay_us as u64)
    }

    pub(crate) fn recent_groups(&self) -> impl Iterator<Item = &GroupScalars> {
        self.history.iter()
    }

    pub(crate) fn on_packet_sent(&mut self, packet: PacketSent) {
        let first = self.packets.is_empty();
        let sequence_number = self.unwrapper.unwrap(packet.sequence_number);
        self.packets.insert(
            sequence_number,
            PacketRecord::new(packet.send_time, packet.size_bytes, packet.is_probe),
        );
        if first {
            self.next_group_sequence_number = self.packets.begin_sequence_number();
        }
    }

    /// Apply one feedback report: merge per-packet fates, then close and
    /// classify any groups the new information completes. Returns the state
    /// transitions this report caused, oldest first.
    pub(crate) fn on_feedback(
        &mut self,
        now: Instant,
        report: &FeedbackReport,
    ) -> Vec<CongestionStateChange> {
        for entry in &report.entries {
            let sequence_number = self.packets.unwrap_near(entry.sequence_number);
            if sequence_number < self.next_group_sequence_number {
                // Already grouped (or evicted): a retransmitted or stale
                // report. Merging is idempotent, so there is nothing to do.
                continue;
            }
            match self.packets.get_mut(sequence_number) {
                Some(record) => {
                    if record.fate == PacketFate::Pending {
                        record.fate = match entry.arrival {
                            Some(arrival) => PacketFate::Received(arrival),
                            None => PacketFate::Lost,
                        };
                    }
                    if sequence_number > self.feedback_watermark {
                        self.feedback_watermark = sequence_number;
                    }
                }
                None => self.warn_throttle.unknown_sequence(now, entry.sequence_number),
            }
        }

        let mut transitions = Vec::new();
        self.advance_groups(now, &mut transitions);
        transitions
    }

    /// Walk resolved records in sequence order, assigning them to groups
    /// and closing a group whenever the next record starts a new one.
    fn advance_groups(&mut self, now: Instant, out: &mut Vec<CongestionStateChange>) {
        loop {
            let sequence_number = self
                .next_group_sequence_number
                .max(self.packets.begin_sequence_number());
            if sequence_number >= self.packets.end_sequence_number() {
                break;
            }
            let Some(record) = self.packets.get(sequence_number) else {
                // A hole in the send window (should not happen with a
                // monotonic sender); skip it.
                self.next_group_sequence_number = sequence_number + 1;
                continue;
            };
            if record.fate == PacketFate::Pending {
                break;
            }

            match self.open_group.take() {
                None => self.open_group = Some(PacketGroup::new(&record)),
                Some(mut group) => {
                    if group.starts_new_group(&self.config, record.send_time) {
                        self.close_group(now, group, out);
                        self.open_group = Some(PacketGroup::new(&record));
                    } else {
                        group.push(&record);
                        self.open_group = Some(group);
                    }
                }
            }
            self.next_group_sequence_number = sequence_number + 1;
        }

        // Grouped records are never looked at again.
        self.packets.erase_to(self.next_group_sequence_number);
    }

    fn close_group(
        &mut self,
        now: Instant,
        group: PacketGroup,
        out: &mut Vec<CongestionStateChange>,
    ) {
        let scalars = group.close(&self.config, self.propagated_queuing_delay_us);

        self.propagated_queuing_delay_us =
            (self.propagated_queuing_delay_us + scalars.delta_owd_us).max(0);

        match scalars.region {
            QueuingRegion::Jqr => {
                self.jqr_streak += 1;
                self.dqr_streak = 0;
            }
            QueuingRegion::Dqr => {
                self.dqr_streak += 1;
                self.jqr_streak = 0;
                if self.dqr_streak >= self.config.dqr_reset_run {
                    // A sustained uncongested run: whatever delay we were
                    // still propagating is noise, not queue.
                    self.propagated_queuing_delay_us = 0;
                }
            }
            QueuingRegion::Indeterminate => {}
        }

        debug!(
            "closed packet group: {scalars}, propagated queuing delay: {}us",
            self.propagated_queuing_delay_us
        );

        if let Some(next) = self.next_state(scalars.region) {
            let change = CongestionStateChange {
                at: now,
                from: self.state,
                to: next,
                propagated_queuing_delay: self.propagated_queuing_delay(),
                group: scalars,
            };
            debug!("congestion state transition: {} -> {}", change.from, change.to);
            self.state = next;
            out.push(change);
        }

        self.history.push_back(scalars);
        while self.history.len() > self.config.history_capacity {
            self.history.pop_front();
        }
    }

    /// The state machine table, evaluated once per closed group.
    fn next_state(&self, region: QueuingRegion) -> Option<CongestionState> {
        use CongestionState as S;

        let config = &self.config;
        match self.state {
            S::None => (self.jqr_streak >= config.early_warning_groups).then_some(S::EarlyWarning),
            S::EarlyWarning => {
                if self.jqr_streak >= config.congested_groups {
                    Some(S::Congested)
                } else if self.dqr_streak >= config.recover_groups {
                    Some(S::EarlyWarningHangover)
                } else {
                    None
                }
            }
            S::EarlyWarningHangover => {
                if region == QueuingRegion::Jqr {
                    // Any JQR during the hangover flips straight back.
                    Some(S::EarlyWarning)
                } else if self.dqr_streak >= config.hangover_release_groups {
                    Some(S::None)
                } else {
                    None
                }
            }
            S::Congested => {
                (self.dqr_streak >= config.recover_groups).then_some(S::CongestedHangover)
            }
            S::CongestedHangover => {
                if region == QueuingRegion::Jqr {
                    Some(S::Congested)
                } else if self.dqr_streak >= config.hangover_release_groups {
                    Some(S::EarlyWarningHangover)
                } else {
                    None
                }
            }
        }
    }
}
