use std::{
    collections::{BTreeMap, VecDeque},
    mem,
    time::Instant,
};

use rustc_hash::FxHashSet;

use crate::{
    connection::assembler::Assembler, crypto::Keys, frame, range_set::RangeSet, StreamId,
    MAX_PACKET_NUMBER,
};

/// State tied to one packet number space
pub(super) struct PacketSpace {
    /// Packet protection keys for this space's level, once installed
    pub(super) crypto: Option<Keys>,
    pub(super) dedup: Dedup,
    /// Highest received packet number
    pub(super) rx_packet: u64,
    /// Arrival time of the packet bearing `rx_packet`
    pub(super) rx_packet_time: Option<Instant>,

    /// Control frames waiting to be (re)sent
    pub(super) pending: Retransmits,
    pub(super) pending_acks: PendingAcks,

    /// The packet number of the next packet that will be sent
    pub(super) next_packet_number: u64,
    /// The largest packet number the remote peer acknowledged in an ACK frame
    pub(super) largest_acked_packet: Option<u64>,
    /// Transmitted but not acked
    pub(super) sent_packets: BTreeMap<u64, SentPacket>,

    /// Incoming cryptographic handshake stream
    pub(super) crypto_stream: Assembler,
    /// Current offset of the outgoing cryptographic handshake stream
    pub(super) crypto_offset: u64,

    /// The time the most recently sent ack-eliciting packet was sent
    pub(super) time_of_last_ack_eliciting_packet: Option<Instant>,
    /// When the earliest sent packet will be deemed lost by time threshold
    pub(super) loss_time: Option<Instant>,
    /// Number of tail loss probes to send
    pub(super) loss_probes: u32,
    pub(super) ping_pending: bool,
    /// Congestion-controlled bytes currently in flight in this space
    pub(super) in_flight: u64,

    /// Receive timestamps awaiting transmission in an extended ACK, oldest
    /// first; only populated when the extension is negotiated
    pub(super) recv_timestamps: VecDeque<(u64, Instant)>,
}

impl PacketSpace {
    pub(super) fn new() -> Self {
        Self {
            crypto: None,
            dedup: Dedup::new(),
            rx_packet: 0,
            rx_packet_time: None,

            pending: Retransmits::default(),
            pending_acks: PendingAcks::default(),

            next_packet_number: 0,
            largest_acked_packet: None,
            sent_packets: BTreeMap::new(),

            crypto_stream: Assembler::new(),
            crypto_offset: 0,

            time_of_last_ack_eliciting_packet: None,
            loss_time: None,
            loss_probes: 0,
            ping_pending: false,
            in_flight: 0,

            recv_timestamps: VecDeque::new(),
        }
    }

    /// Allocate the next packet number; strictly monotonic per space
    pub(super) fn get_tx_number(&mut self) -> u64 {
        assert!(
            self.next_packet_number < MAX_PACKET_NUMBER,
            "packet number space exhausted"
        );
        let x = self.next_packet_number;
        self.next_packet_number += 1;
        x
    }

    pub(super) fn can_send(&self) -> SendableFrames {
        SendableFrames {
            acks: self.pending_acks.can_send(),
            other: !self.pending.is_empty() || self.ping_pending || self.loss_probes > 0,
        }
    }

    /// Record a receive timestamp for the extension, bounded by `cap`
    pub(super) fn record_recv_timestamp(&mut self, packet: u64, now: Instant, cap: u64) {
        if cap == 0 {
            return;
        }
        while self.recv_timestamps.len() as u64 >= cap {
            self.recv_timestamps.pop_front();
        }
        self.recv_timestamps.push_back((packet, now));
    }

    /// Tear the space down when it is dropped, yielding what was in flight so
    /// the congestion controller can be credited
    pub(super) fn discard(&mut self) -> u64 {
        self.crypto = None;
        self.sent_packets.clear();
        self.pending = Retransmits::default();
        self.pending_acks = PendingAcks::default();
        self.loss_time = None;
        self.loss_probes = 0;
        self.time_of_last_ack_eliciting_packet = None;
        mem::take(&mut self.in_flight)
    }
}

/// A packet sent and not yet acknowledged
///
/// Packets declared lost stay in the table, flagged, until an ack or a purge
/// retires them; spurious-loss acks are thereby still attributable.
pub(super) struct SentPacket {
    pub(super) time_sent: Instant,
    /// Protection level the packet was sealed at
    pub(super) level: crate::packet::EncryptionLevel,
    /// UDP payload bytes this packet contributed
    pub(super) size: u16,
    pub(super) ack_eliciting: bool,
    /// Whether this packet counts against the congestion window
    pub(super) in_flight: bool,
    /// Loss detection gave up on this packet and requeued its frames
    pub(super) declared_lost: bool,
    /// The ack ranges this packet itself carried; used to prune
    /// `pending_acks` when the packet is acknowledged
    pub(super) acks: RangeSet,
    /// Control frames to re-queue if this packet is lost
    pub(super) retransmits: Retransmits,
    /// Stream data this packet carried
    pub(super) stream_frames: frame::StreamMetaVec,
    /// Ties together the original transmission and its clones so
    /// retransmission accounting counts them once
    pub(super) clone_group: Option<u64>,
}

/// Control frames waiting for a transmission slot
///
/// Stream payload is pulled straight from the stream manager instead, and
/// acks are generated from `PendingAcks`.
#[derive(Default)]
pub(super) struct Retransmits {
    pub(super) max_data: bool,
    pub(super) max_uni_stream_id: bool,
    pub(super) max_bi_stream_id: bool,
    pub(super) reset_stream: Vec<frame::ResetStream>,
    pub(super) stop_sending: Vec<frame::StopSending>,
    pub(super) max_stream_data: FxHashSet<StreamId>,
    pub(super) crypto: VecDeque<frame::Crypto>,
    pub(super) handshake_done: bool,
    pub(super) knobs: Vec<frame::Knob>,
    pub(super) path_response: Option<u64>,
}

impl Retransmits {
    pub(super) fn is_empty(&self) -> bool {
        !self.max_data
            && !self.max_uni_stream_id
            && !self.max_bi_stream_id
            && self.reset_stream.is_empty()
            && self.stop_sending.is_empty()
            && self.max_stream_data.is_empty()
            && self.crypto.is_empty()
            && !self.handshake_done
            && self.knobs.is_empty()
            && self.path_response.is_none()
    }
}

impl ::std::ops::BitOrAssign for Retransmits {
    fn bitor_assign(&mut self, rhs: Self) {
        // Queue retransmits ahead of new data for CRYPTO frames to reduce
        // in-stream head-of-line blocking
        self.max_data |= rhs.max_data;
        self.max_uni_stream_id |= rhs.max_uni_stream_id;
        self.max_bi_stream_id |= rhs.max_bi_stream_id;
        self.reset_stream.extend_from_slice(&rhs.reset_stream);
        self.stop_sending.extend_from_slice(&rhs.stop_sending);
        self.max_stream_data.extend(&rhs.max_stream_data);
        for crypto in rhs.crypto.into_iter().rev() {
            self.crypto.push_front(crypto);
        }
        self.handshake_done |= rhs.handshake_done;
        self.knobs.extend(rhs.knobs);
        self.path_response = self.path_response.or(rhs.path_response);
    }
}

/// Ack state for received packets in one space
#[derive(Default)]
pub(super) struct PendingAcks {
    /// Packet numbers to acknowledge
    pub(super) ranges: RangeSet,
    /// Whether an ack-eliciting packet arrived since the last ACK we sent
    ack_required: bool,
    /// Arrival time of the largest packet in `ranges`
    pub(super) largest_recv_time: Option<Instant>,
}

impl PendingAcks {
    pub(super) fn on_packet_received(&mut self, packet: u64, now: Instant, ack_eliciting: bool) {
        self.ranges.insert_one(packet);
        if ack_eliciting {
            self.ack_required = true;
        }
        if Some(packet) == self.ranges.max() {
            self.largest_recv_time = Some(now);
        }
    }

    pub(super) fn can_send(&self) -> bool {
        self.ack_required && !self.ranges.is_empty()
    }

    pub(super) fn acks_sent(&mut self) {
        self.ack_required = false;
    }

    /// Stop acknowledging ranges the peer has seen us acknowledge
    pub(super) fn subtract(&mut self, acked: &RangeSet) {
        for range in acked.iter() {
            self.ranges.remove(range);
        }
    }
}

/// Whether a space has anything worth putting in a packet
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(super) struct SendableFrames {
    pub(super) acks: bool,
    pub(super) other: bool,
}

impl SendableFrames {
    pub(super) fn is_empty(&self) -> bool {
        !self.acks && !self.other
    }
}

/// Sliding-window duplicate suppression for received packet numbers
///
/// Tracks the 128 packet numbers below the highest seen; anything older is
/// conservatively treated as a duplicate.
pub(super) struct Dedup {
    window: u128,
    /// Lowest packet number higher than everything the window covers
    next: u64,
}

const WINDOW_SIZE: u64 = 128;

impl Dedup {
    pub(super) fn new() -> Self {
        Self { window: 0, next: 0 }
    }

    /// Highest packet number authenticated so far
    fn highest(&self) -> u64 {
        self.next.wrapping_sub(1)
    }

    /// Record a packet number; returns whether it was already present
    pub(super) fn insert(&mut self, packet: u64) -> bool {
        if let Some(diff) = packet.checked_sub(self.next) {
            // Right of the window: slide it so bit 0 is the new packet
            let shift = diff + 1;
            self.window = if shift < WINDOW_SIZE {
                (self.window << shift) | 1
            } else {
                1
            };
            self.next = packet + 1;
            false
        } else if self.highest() - packet < WINDOW_SIZE {
            // Within the window
            let bit = self.highest() - packet;
            let mask = 1 << bit;
            let duplicate = self.window & mask != 0;
            self.window |= mask;
            duplicate
        } else {
            // Left of the window: assume duplicate
            true
        }
    }
}
