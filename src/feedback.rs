//! In-memory transport feedback contract.
//!
//! The congestion detector consumes feedback as a flat list of
//! `(sequence number, arrival)` entries covering a contiguous run of
//! transport-wide sequence numbers. How those entries reach the SFU is not
//! this crate's concern; for the common case of TWCC feedback,
//! [`FeedbackReport::from_transport_cc`] converts a parsed RTCP
//! `TransportLayerCc` packet into the in-memory form.

use std::time::{Duration, Instant};

use rtcp::transport_feedbacks::transport_layer_cc::{
    PacketStatusChunk, SymbolTypeTcc, TransportLayerCc,
};

/// TWCC reference time is expressed in multiples of 64 ms.
const REFERENCE_TIME_UNIT_US: i64 = 64_000;

/// Send-side record of one forwarded packet, captured when the forwarder
/// emits it. The transport-wide sequence number has already been assigned
/// by the forwarder at this point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketSent {
    /// Transport-wide sequence number (16 bit, wraps).
    pub sequence_number: u16,
    /// Monotonic send timestamp supplied by the caller.
    pub send_time: Instant,
    /// Size on the wire, header included.
    pub size_bytes: u32,
    /// Whether the packet belongs to a bandwidth probe cluster.
    pub is_probe: bool,
}

/// One feedback entry: a sequence number the remote endpoint reported on.
///
/// `arrival == None` means the packet was reported lost. Packets reported
/// received without timing information are treated the same way, as they
/// cannot contribute to delay measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackEntry {
    pub sequence_number: u16,
    pub arrival: Option<Instant>,
}

/// A feedback report: per-sequence-number arrival information covering a
/// contiguous run of transport-wide sequence numbers, in transport order.
///
/// The highest covered sequence number is the report's implicit watermark:
/// every covered packet without an arrival has been observed as lost by the
/// remote endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedbackReport {
    pub entries: Vec<FeedbackEntry>,
}

impl FeedbackReport {
    /// Convert a parsed TWCC feedback packet into the in-memory contract.
    ///
    /// `epoch` anchors the feedback's reference time: arrival instants are
    /// computed as `epoch + reference_time + cumulative deltas`. The caller
    /// must use the same epoch for every report of a transport so that
    /// arrival times are mutually comparable; absolute alignment with local
    /// send times is irrelevant because the detector only looks at deltas.
    pub fn from_transport_cc(tcc: &TransportLayerCc, epoch: Instant) -> Self {
        let mut entries = Vec::with_capacity(tcc.packet_status_count as usize);
        let mut deltas = tcc.recv_deltas.iter();
        let mut sequence_number = tcc.base_sequence_number;
        let mut arrival_us = i64::from(tcc.reference_time) * REFERENCE_TIME_UNIT_US;

        'chunks: for chunk in &tcc.packet_chunks {
            for symbol in chunk_symbols(chunk) {
                if entries.len() >= tcc.packet_status_count as usize {
                    // Status vector chunks are padded up to their capacity;
                    // the trailing symbols carry no packets.
                    break 'chunks;
                }
                let arrival = match symbol {
                    SymbolTypeTcc::PacketReceivedSmallDelta
                    | SymbolTypeTcc::PacketReceivedLargeDelta => match deltas.next() {
                        Some(recv_delta) => {
                            arrival_us += recv_delta.delta;
                            Some(instant_at(epoch, arrival_us))
                        }
                        // Truncated feedback: status says received but the
                        // delta list ran out. No timing, treat as lost.
                        None => None,
                    },
                    SymbolTypeTcc::PacketReceivedWithoutDelta => None,
                    SymbolTypeTcc::PacketNotReceived => None,
                };
                entries.push(FeedbackEntry {
                    sequence_number,
                    arrival,
                });
                sequence_number = sequence_number.wrapping_add(1);
            }
        }

        FeedbackReport { entries }
    }

    /// Highest sequence number covered by this report, if any.
    pub fn watermark(&self) -> Option<u16> {
        self.entries.last().map(|e| e.sequence_number)
    }
}

fn chunk_symbols(chunk: &PacketStatusChunk) -> Vec<SymbolTypeTcc> {
    match chunk {
        PacketStatusChunk::RunLengthChunk(rlc) => {
            vec![rlc.packet_status_symbol; rlc.run_length as usize]
        }
        PacketStatusChunk::StatusVectorChunk(svc) => svc.symbol_list.clone(),
    }
}

/// Offset `epoch` by a signed number of microseconds.
fn instant_at(epoch: Instant, offset_us: i64) -> Instant {
    if offset_us >= 0 {
        epoch + Duration::from_micros(offset_us as u64)
    } else {
        epoch
            .checked_sub(Duration::from_micros(offset_us.unsigned_abs()))
            .unwrap_or(epoch)
    }
}
