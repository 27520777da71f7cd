//! Send-side bandwidth estimator facade.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use log::warn;

use super::config::SendSideBweConfig;
use super::congestion_detector::{CongestionDetector, CongestionStateChange};
use super::packet_group::GroupScalars;
use super::CongestionState;
use crate::error::Result;
use crate::feedback::{FeedbackReport, PacketSent};

/// Handle returned by [`SendSideBwe::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type StateChangeHandler = Box<dyn FnMut(&CongestionStateChange) + Send>;

/// Send-side bandwidth estimator: owns a congestion detector and fans its
/// state transitions out to subscribers.
///
/// # Concurrency
///
/// Single-writer discipline: every mutating method takes `&mut self`, so
/// serialization is enforced by the borrow checker and no internal locking
/// exists. Callers sharing an instance across tasks must wrap it themselves
/// (the SFU's per-session event loop owns it in practice).
///
/// Subscribers run synchronously on the [`SendSideBwe::on_feedback`] call;
/// a handler must not re-enter the facade.
pub struct SendSideBwe {
    detector: CongestionDetector,
    subscribers: Vec<(SubscriptionId, StateChangeHandler)>,
    next_subscription: u64,
    stopped: bool,
}

impl SendSideBwe {
    /// Build an estimator, failing on inconsistent configuration.
    pub fn new(config: SendSideBweConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            detector: CongestionDetector::new(config.congestion_detector),
            subscribers: Vec::new(),
            next_subscription: 0,
            stopped: false,
        })
    }

    /// Record a packet emitted by the forwarder.
    pub fn on_packet_sent(&mut self, packet: PacketSent) {
        if self.stopped {
            return;
        }
        self.detector.on_packet_sent(packet);
    }

    /// Ingest one transport feedback report. Any state transitions it
    /// causes are delivered to subscribers before this returns.
    pub fn on_feedback(&mut self, now: Instant, report: &FeedbackReport) {
        if self.stopped {
            return;
        }
        for change in self.detector.on_feedback(now, report) {
            self.notify(&change);
        }
    }

    /// Register a state-transition handler. Handlers registered after
    /// [`SendSideBwe::stop`] are never invoked.
    pub fn subscribe(
        &mut self,
        handler: impl FnMut(&CongestionStateChange) + Send + 'static,
    ) -> SubscriptionId {
        if self.stopped {
            // Dead handle: the estimator never notifies again.
            return SubscriptionId(self.next_subscription);
        }
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers.push((id, Box::new(handler)));
        id
    }

    /// Remove a previously registered handler. Returns whether it was
    /// still registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    pub fn congestion_state(&self) -> CongestionState {
        self.detector.congestion_state()
    }

    pub fn propagated_queuing_delay(&self) -> Duration {
        self.detector.propagated_queuing_delay()
    }

    /// Recently closed packet groups, oldest first.
    pub fn recent_groups(&self) -> Vec<GroupScalars> {
        self.detector.recent_groups().copied().collect()
    }

    /// Stop the estimator. Idempotent; afterwards every operation returns
    /// immediately without mutating state and no notification ever fires
    /// again.
    pub fn stop(&mut self) {
        self.stopped = true;
        self.subscribers.clear();
    }

    fn notify(&mut self, change: &CongestionStateChange) {
        for (id, handler) in &mut self.subscribers {
            // A faulty handler must not take down feedback processing or
            // starve the remaining subscribers.
            if catch_unwind(AssertUnwindSafe(|| handler(change))).is_err() {
                warn!("congestion state subscriber {id:?} panicked, continuing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::FeedbackEntry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn two_packet_group(
        bwe: &mut SendSideBwe,
        base: Instant,
        start_seq: u16,
        send_offset_ms: u64,
        owd_ms: u64,
    ) -> FeedbackReport {
        let mut entries = Vec::new();
        for i in 0..2u16 {
            let send_time = base + Duration::from_millis(send_offset_ms + u64::from(i));
            bwe.on_packet_sent(PacketSent {
                sequence_number: start_seq + i,
                send_time,
                size_bytes: 1200,
                is_probe: false,
            });
            entries.push(FeedbackEntry {
                sequence_number: start_seq + i,
                arrival: Some(send_time + Duration::from_millis(100 + owd_ms * u64::from(i))),
            });
        }
        FeedbackReport { entries }
    }

    fn small_group_config() -> SendSideBweConfig {
        SendSideBweConfig {
            congestion_detector: crate::bwe::CongestionDetectorConfig {
                min_packets_per_group: 2,
                early_warning_groups: 1,
                congested_groups: 2,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_invalid_config_refused() {
        let mut config = SendSideBweConfig::default();
        config.congestion_detector.dqr_max_delay = config.congestion_detector.jqr_min_delay;
        assert!(SendSideBwe::new(config).is_err());
    }

    #[test]
    fn test_subscribers_notified_and_unsubscribed() {
        let mut bwe = SendSideBwe::new(small_group_config()).unwrap();
        let base = Instant::now();

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let id = bwe.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        // Two strongly delayed groups: the second close crosses into
        // EarlyWarning and then Congested.
        let report = two_packet_group(&mut bwe, base, 0, 0, 40);
        bwe.on_feedback(base + Duration::from_millis(200), &report);
        let report = two_packet_group(&mut bwe, base, 2, 60, 40);
        bwe.on_feedback(base + Duration::from_millis(300), &report);
        let report = two_packet_group(&mut bwe, base, 4, 120, 40);
        bwe.on_feedback(base + Duration::from_millis(400), &report);

        assert!(count.load(Ordering::SeqCst) >= 1);
        assert_ne!(bwe.congestion_state(), CongestionState::None);

        assert!(bwe.unsubscribe(id));
        assert!(!bwe.unsubscribe(id));

        let seen = count.load(Ordering::SeqCst);
        let report = two_packet_group(&mut bwe, base, 6, 180, 40);
        bwe.on_feedback(base + Duration::from_millis(500), &report);
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn test_panicking_subscriber_does_not_starve_others() {
        let mut bwe = SendSideBwe::new(small_group_config()).unwrap();
        let base = Instant::now();

        bwe.subscribe(|_| panic!("boom"));
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        bwe.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        let report = two_packet_group(&mut bwe, base, 0, 0, 40);
        bwe.on_feedback(base + Duration::from_millis(200), &report);
        let report = two_packet_group(&mut bwe, base, 2, 60, 40);
        bwe.on_feedback(base + Duration::from_millis(300), &report);

        assert!(count.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_stop_is_idempotent_and_silences() {
        let mut bwe = SendSideBwe::new(small_group_config()).unwrap();
        let base = Instant::now();

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        bwe.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        bwe.stop();
        bwe.stop();

        let report = two_packet_group(&mut bwe, base, 0, 0, 40);
        bwe.on_feedback(base + Duration::from_millis(200), &report);
        let report = two_packet_group(&mut bwe, base, 2, 60, 40);
        bwe.on_feedback(base + Duration::from_millis(300), &report);

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(bwe.congestion_state(), CongestionState::None);
        assert!(bwe.recent_groups().is_empty());
    }
}
