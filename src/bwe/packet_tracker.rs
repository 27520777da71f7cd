//! Sent-packet bookkeeping for the congestion detector.
//!
//! Sent packets are recorded in a circular buffer indexed by unwrapped
//! transport-wide sequence number, mirroring the arrival-time map used on
//! the feedback-building side of TWCC:
//! <https://source.chromium.org/chromium/chromium/src/+/refs/heads/main:third_party/webrtc/modules/remote_bitrate_estimator/packet_arrival_map.h>

use std::time::Instant;

const MIN_CAPACITY: usize = 128;
const MAX_TRACKED_PACKETS: i64 = 1 << 15;

/// Sequence number unwrapper to handle 16-bit wraparound.
pub(crate) struct SequenceUnwrapper {
    last_unwrapped: Option<i64>,
}

impl SequenceUnwrapper {
    pub(crate) fn new() -> Self {
        Self {
            last_unwrapped: None,
        }
    }

    /// Map a wrapped sequence number onto a monotonically increasing i64,
    /// picking the candidate closest to the previously seen value.
    pub(crate) fn unwrap(&mut self, sequence_number: u16) -> i64 {
        let unwrapped = match self.last_unwrapped {
            None => i64::from(sequence_number),
            Some(last) => last + wrap_distance(sequence_number, last),
        };
        self.last_unwrapped = Some(unwrapped);
        unwrapped
    }
}

/// Signed distance from `reference`'s wrapped value to `sequence_number`,
/// normalized into `[-0x8000, 0x7FFF]`.
fn wrap_distance(sequence_number: u16, reference: i64) -> i64 {
    let mut diff = i64::from(sequence_number) - (reference & 0xFFFF);
    if diff > 0x8000 {
        diff -= 0x10000;
    } else if diff < -0x8000 {
        diff += 0x10000;
    }
    diff
}

/// What feedback has told us about a sent packet so far.
///
/// Fate is written at most once: the first acknowledgment (or loss report)
/// wins and later reports about the same packet are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PacketFate {
    /// No feedback covering this packet yet.
    Pending,
    /// Reported received at the given remote arrival time.
    Received(Instant),
    /// Covered by feedback but not received.
    Lost,
}

/// Send-side record of one packet awaiting (or holding) feedback.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PacketRecord {
    pub(crate) send_time: Instant,
    pub(crate) size_bytes: u32,
    pub(crate) is_probe: bool,
    pub(crate) fate: PacketFate,
}

impl PacketRecord {
    pub(crate) fn new(send_time: Instant, size_bytes: u32, is_probe: bool) -> Self {
        Self {
            send_time,
            size_bytes,
            is_probe,
            fate: PacketFate::Pending,
        }
    }
}

/// Circular buffer of sent-packet records, indexed by unwrapped sequence
/// number. Capacity is always a power of two; the window is capped at
/// `MAX_TRACKED_PACKETS` and old entries are evicted as the sender moves on.
pub(crate) struct PacketRecordMap {
    records: Vec<Option<PacketRecord>>,
    /// First valid sequence number (inclusive).
    begin_sequence_number: i64,
    /// First sequence number after the valid range (exclusive).
    end_sequence_number: i64,
}

impl PacketRecordMap {
    pub(crate) fn new() -> Self {
        Self {
            records: Vec::new(),
            begin_sequence_number: 0,
            end_sequence_number: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty() || self.begin_sequence_number == self.end_sequence_number
    }

    pub(crate) fn begin_sequence_number(&self) -> i64 {
        self.begin_sequence_number
    }

    pub(crate) fn end_sequence_number(&self) -> i64 {
        self.end_sequence_number
    }

    /// Record a newly sent packet.
    pub(crate) fn insert(&mut self, sequence_number: i64, record: PacketRecord) {
        if self.records.is_empty() {
            // First packet
            self.reallocate(MIN_CAPACITY);
            self.begin_sequence_number = sequence_number;
            self.end_sequence_number = sequence_number + 1;
            let idx = self.index(sequence_number);
            self.records[idx] = Some(record);
            return;
        }

        if sequence_number >= self.begin_sequence_number
            && sequence_number < self.end_sequence_number
        {
            // Within the buffer. Sender sequence numbers are assigned
            // monotonically, so an occupied slot means a stale duplicate.
            let idx = self.index(sequence_number);
            if self.records[idx].is_none() {
                self.records[idx] = Some(record);
            }
            return;
        }

        if sequence_number < self.begin_sequence_number {
            // Before the window: already evicted, nothing useful to keep.
            return;
        }

        // The packet goes after the buffer.
        let new_end_sequence_number = sequence_number + 1;

        if new_end_sequence_number >= self.end_sequence_number + MAX_TRACKED_PACKETS {
            // The jump is so large that every tracked packet falls out of
            // the window.
            self.begin_sequence_number = sequence_number;
            self.end_sequence_number = new_end_sequence_number;
            let idx = self.index(sequence_number);
            self.records[idx] = Some(record);
            return;
        }

        if self.begin_sequence_number < new_end_sequence_number - MAX_TRACKED_PACKETS {
            // Evict the oldest entries to stay within the cap.
            self.begin_sequence_number = new_end_sequence_number - MAX_TRACKED_PACKETS;
        }

        self.adjust_to_size((new_end_sequence_number - self.begin_sequence_number) as usize);

        // Clear any gap between the previous end and this packet.
        let end = self.end_sequence_number;
        self.clear_range(end, sequence_number);
        self.end_sequence_number = new_end_sequence_number;
        let idx = self.index(sequence_number);
        self.records[idx] = Some(record);
    }

    pub(crate) fn get(&self, sequence_number: i64) -> Option<PacketRecord> {
        if sequence_number < self.begin_sequence_number
            || sequence_number >= self.end_sequence_number
        {
            return None;
        }
        self.records[self.index(sequence_number)]
    }

    pub(crate) fn get_mut(&mut self, sequence_number: i64) -> Option<&mut PacketRecord> {
        if sequence_number < self.begin_sequence_number
            || sequence_number >= self.end_sequence_number
        {
            return None;
        }
        let idx = self.index(sequence_number);
        self.records[idx].as_mut()
    }

    /// Re-unwrap a feedback sequence number against the current window,
    /// picking the candidate closest to the newest sent packet. Using the
    /// live window instead of a second unwrapper keeps send and feedback
    /// paths from drifting apart.
    pub(crate) fn unwrap_near(&self, sequence_number: u16) -> i64 {
        if self.is_empty() {
            return i64::from(sequence_number);
        }
        let reference = self.end_sequence_number - 1;
        reference + wrap_distance(sequence_number, reference)
    }

    /// Drop all records before `sequence_number`.
    pub(crate) fn erase_to(&mut self, sequence_number: i64) {
        if sequence_number < self.begin_sequence_number {
            return;
        }
        if sequence_number >= self.end_sequence_number {
            self.begin_sequence_number = self.end_sequence_number;
            return;
        }
        self.begin_sequence_number = sequence_number;
        self.adjust_to_size((self.end_sequence_number - self.begin_sequence_number) as usize);
    }

    fn clear_range(&mut self, start_inclusive: i64, end_exclusive: i64) {
        for sn in start_inclusive..end_exclusive {
            let idx = self.index(sn);
            self.records[idx] = None;
        }
    }

    fn index(&self, sequence_number: i64) -> usize {
        // Capacity is a power of two, so masking beats modulo and also
        // handles negative sequence numbers.
        (sequence_number & (self.capacity() as i64 - 1)) as usize
    }

    fn adjust_to_size(&mut self, new_size: usize) {
        if new_size > self.capacity() {
            let mut new_capacity = self.capacity();
            while new_capacity < new_size {
                new_capacity *= 2;
            }
            self.reallocate(new_capacity);
        }
        if self.capacity() > MIN_CAPACITY.max(new_size * 4) {
            let mut new_capacity = self.capacity();
            while new_capacity >= 2 * new_size.max(MIN_CAPACITY) {
                new_capacity /= 2;
            }
            self.reallocate(new_capacity);
        }
    }

    fn capacity(&self) -> usize {
        self.records.len()
    }

    fn reallocate(&mut self, new_capacity: usize) {
        let mut new_buffer: Vec<Option<PacketRecord>> = vec![None; new_capacity];
        for sn in self.begin_sequence_number..self.end_sequence_number {
            new_buffer[(sn & (new_capacity as i64 - 1)) as usize] = self.get(sn);
        }
        self.records = new_buffer;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(offset_ms: u64) -> PacketRecord {
        PacketRecord::new(base() + Duration::from_millis(offset_ms), 1200, false)
    }

    fn base() -> Instant {
        // A fixed-enough anchor; only offsets matter.
        Instant::now()
    }

    #[test]
    fn test_sequence_unwrapper() {
        let mut unwrapper = SequenceUnwrapper::new();

        assert_eq!(unwrapper.unwrap(0), 0);
        assert_eq!(unwrapper.unwrap(1), 1);
        assert_eq!(unwrapper.unwrap(100), 100);

        let mut unwrapper = SequenceUnwrapper::new();
        assert_eq!(unwrapper.unwrap(65534), 65534);
        assert_eq!(unwrapper.unwrap(65535), 65535);
        assert_eq!(unwrapper.unwrap(0), 65536);
        assert_eq!(unwrapper.unwrap(1), 65537);
    }

    #[test]
    fn test_sequence_unwrapper_reordering() {
        let mut unwrapper = SequenceUnwrapper::new();
        assert_eq!(unwrapper.unwrap(10), 10);
        assert_eq!(unwrapper.unwrap(9), 9);
        assert_eq!(unwrapper.unwrap(11), 11);
    }

    #[test]
    fn test_map_basic() {
        let mut map = PacketRecordMap::new();
        assert!(map.is_empty());

        map.insert(0, record(0));
        assert!(!map.is_empty());
        assert!(map.get(0).is_some());
        assert!(map.get(1).is_none());
        assert_eq!(map.begin_sequence_number(), 0);
        assert_eq!(map.end_sequence_number(), 1);
    }

    #[test]
    fn test_map_sequential_and_gap() {
        let mut map = PacketRecordMap::new();
        for i in 0..10 {
            map.insert(i, record(i as u64));
        }
        map.insert(15, record(15));

        for i in 0..10 {
            assert!(map.get(i).is_some());
        }
        for i in 10..15 {
            assert!(map.get(i).is_none(), "gap slot {i} should be empty");
        }
        assert!(map.get(15).is_some());
        assert_eq!(map.end_sequence_number(), 16);
    }

    #[test]
    fn test_map_fate_written_once() {
        let mut map = PacketRecordMap::new();
        map.insert(3, record(0));

        let arrival = base() + Duration::from_millis(40);
        let rec = map.get_mut(3).unwrap();
        assert_eq!(rec.fate, PacketFate::Pending);
        rec.fate = PacketFate::Received(arrival);

        // A duplicate acknowledgment must not overwrite the first one.
        let rec = map.get_mut(3).unwrap();
        if rec.fate == PacketFate::Pending {
            rec.fate = PacketFate::Lost;
        }
        assert_eq!(map.get(3).unwrap().fate, PacketFate::Received(arrival));
    }

    #[test]
    fn test_map_before_window_ignored() {
        let mut map = PacketRecordMap::new();
        map.insert(100, record(0));
        map.insert(50, record(1));
        assert!(map.get(50).is_none());
        assert_eq!(map.begin_sequence_number(), 100);
    }

    #[test]
    fn test_map_erase_to() {
        let mut map = PacketRecordMap::new();
        for i in 0..10 {
            map.insert(i, record(i as u64));
        }

        map.erase_to(5);
        assert!(map.get(4).is_none());
        assert!(map.get(5).is_some());
        assert_eq!(map.begin_sequence_number(), 5);

        map.erase_to(100);
        assert!(map.is_empty());
    }

    #[test]
    fn test_map_window_cap() {
        let mut map = PacketRecordMap::new();
        map.insert(0, record(0));
        map.insert(MAX_TRACKED_PACKETS + 10, record(1));

        // The old packet fell out of the capped window.
        assert!(map.get(0).is_none());
        assert!(map.get(MAX_TRACKED_PACKETS + 10).is_some());
    }

    #[test]
    fn test_map_unwrap_near() {
        let mut map = PacketRecordMap::new();
        // Simulate a sender that has wrapped once: unwrapped 65536 + n.
        for i in 0..4i64 {
            map.insert(65534 + i, record(i as u64));
        }

        // Wrapped feedback values resolve near the window end (65537).
        assert_eq!(map.unwrap_near(65534), 65534);
        assert_eq!(map.unwrap_near(65535), 65535);
        assert_eq!(map.unwrap_near(0), 65536);
        assert_eq!(map.unwrap_near(1), 65537);
        // A value just ahead of the newest packet stays ahead.
        assert_eq!(map.unwrap_near(2), 65538);
    }

    #[test]
    fn test_map_grow_and_shrink() {
        let mut map = PacketRecordMap::new();
        for i in 0..1000 {
            map.insert(i, record(i as u64));
        }
        assert!(map.capacity() >= 1000);

        map.erase_to(995);
        assert!(map.capacity() <= MIN_CAPACITY.max(4 * 5));
        for i in 995..1000 {
            assert!(map.get(i).is_some());
        }
    }
}
