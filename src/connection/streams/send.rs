use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use thiserror::Error;
use tracing::trace;

use crate::{frame::StreamMeta, range_set::RangeSet, transport_error::TransportError, VarInt};

/// Send-half states
///
/// The "Invalid" state of the state machine (the send half of a stream this
/// endpoint can only receive on) is represented by the half's absence.
///
/// ```text
/// Open ─────────────────────────────┐
///   │                               │ local reset
///   │ all bytes through FIN acked   v
///   └────────────────> Closed <─ ResetSent
///                  reset acked and all bytes
///                  below the smallest acked
///                  reliable size acked
/// ```
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum SendState {
    Open,
    ResetSent,
    Closed,
}

/// A chunk's payload: either bytes we buffered, or a metadata-only record of
/// data living in an application-owned store
#[derive(Debug, Clone)]
pub(super) enum ChunkData {
    Buf(Bytes),
    Meta { len: u64 },
}

impl ChunkData {
    pub(super) fn len(&self) -> u64 {
        match *self {
            Self::Buf(ref data) => data.len() as u64,
            Self::Meta { len } => len,
        }
    }

    fn is_meta(&self) -> bool {
        matches!(*self, Self::Meta { .. })
    }

    /// Split off the first `at` bytes
    fn split_to(&mut self, at: u64) -> Self {
        match *self {
            Self::Buf(ref mut data) => Self::Buf(data.split_to(at as usize)),
            Self::Meta { ref mut len } => {
                *len -= at;
                Self::Meta { len: at }
            }
        }
    }

    /// Drop everything past the first `len` bytes
    fn truncate(&mut self, len: u64) {
        match *self {
            Self::Buf(ref mut data) => data.truncate(len as usize),
            Self::Meta { len: ref mut l } => *l = (*l).min(len),
        }
    }
}

/// A chunk that has been packetized and awaits acknowledgment
#[derive(Debug, Clone)]
pub(super) struct SentChunk {
    pub(super) offset: u64,
    pub(super) data: ChunkData,
    pub(super) fin: bool,
}

/// The send half of a stream
pub(super) struct Send {
    pub(super) state: SendState,
    /// Peer-advertised flow control credit for this stream
    pub(super) max_data: u64,
    /// Bytes accepted from the application
    pub(super) write_offset: u64,
    /// Next new-data offset to packetize
    pub(super) sent_offset: u64,
    /// Application data waiting for first transmission, offset-ordered
    pending: VecDeque<ChunkData>,
    /// Chunks declared lost, resent ahead of new data
    lost: VecDeque<SentChunk>,
    /// In-flight chunks by offset: the byte-buffer and metadata-only
    /// retransmission stores, distinguished by the chunk's tag
    retransmission: BTreeMap<u64, SentChunk>,
    /// Offset intervals the peer has acknowledged
    pub(super) acked: RangeSet,
    /// Set once the application writes with `fin`
    pub(super) final_offset: Option<u64>,
    fin_acked: bool,
    /// Whether a FIN-bearing frame still needs to be transmitted
    fin_pending: bool,
    /// Error code sent to the peer in a reset; write-once
    pub(super) app_error_to_peer: Option<VarInt>,
    /// Reliable size carried on the most recent RESET_STREAM_AT; never grows
    pub(super) reliable_size_to_peer: Option<u64>,
    /// Smallest reliable size the peer has acknowledged a reset for
    pub(super) min_reliable_size_acked: Option<u64>,
    /// The reason the peer wants us to stop, if STOP_SENDING was received
    pub(super) stop_reason: Option<VarInt>,
    /// Whether this stream is registered with the scheduler
    pub(super) scheduled: bool,
}

impl Send {
    pub(super) fn new(max_data: u64) -> Self {
        Self {
            state: SendState::Open,
            max_data,
            write_offset: 0,
            sent_offset: 0,
            pending: VecDeque::new(),
            lost: VecDeque::new(),
            retransmission: BTreeMap::new(),
            acked: RangeSet::new(),
            final_offset: None,
            fin_acked: false,
            fin_pending: false,
            app_error_to_peer: None,
            reliable_size_to_peer: None,
            min_reliable_size_acked: None,
            stop_reason: None,
            scheduled: false,
        }
    }

    /// Queue application bytes, limited by stream credit and `conn_budget`
    pub(super) fn write(
        &mut self,
        data: &mut Bytes,
        fin: bool,
        conn_budget: u64,
    ) -> Result<usize, WriteError> {
        self.check_writable()?;
        let budget = (self.max_data - self.write_offset).min(conn_budget);
        if budget == 0 && !data.is_empty() {
            return Err(WriteError::Blocked);
        }
        let len = (data.len() as u64).min(budget) as usize;
        if len > 0 {
            self.pending.push_back(ChunkData::Buf(data.split_to(len)));
            self.write_offset += len as u64;
        }
        if fin && data.is_empty() {
            self.final_offset = Some(self.write_offset);
            self.fin_pending = true;
        }
        Ok(len)
    }

    /// Queue a metadata-only chunk whose bytes live in an application-owned
    /// store
    pub(super) fn write_meta(
        &mut self,
        len: u64,
        fin: bool,
        conn_budget: u64,
    ) -> Result<u64, WriteError> {
        self.check_writable()?;
        let budget = (self.max_data - self.write_offset).min(conn_budget);
        if budget == 0 && len > 0 {
            return Err(WriteError::Blocked);
        }
        let accepted = len.min(budget);
        if accepted > 0 {
            self.pending.push_back(ChunkData::Meta { len: accepted });
            self.write_offset += accepted;
        }
        if fin && accepted == len {
            self.final_offset = Some(self.write_offset);
            self.fin_pending = true;
        }
        Ok(accepted)
    }

    fn check_writable(&self) -> Result<(), WriteError> {
        match self.state {
            SendState::Open => {}
            SendState::ResetSent | SendState::Closed => return Err(WriteError::Closed),
        }
        if self.final_offset.is_some() {
            return Err(WriteError::Closed);
        }
        if let Some(error_code) = self.stop_reason {
            return Err(WriteError::Stopped(error_code));
        }
        Ok(())
    }

    /// Signal the end of the stream without further data
    pub(super) fn finish(&mut self) -> Result<(), FinishError> {
        if let Some(error_code) = self.stop_reason {
            return Err(FinishError::Stopped(error_code));
        }
        if self.state != SendState::Open || self.final_offset.is_some() {
            return Err(FinishError::Closed);
        }
        self.final_offset = Some(self.write_offset);
        self.fin_pending = true;
        Ok(())
    }

    /// Whether there is anything to put in a STREAM frame right now
    pub(super) fn has_sendable_data(&self) -> bool {
        match self.state {
            SendState::Closed => false,
            SendState::Open => {
                !self.lost.is_empty() || !self.pending.is_empty() || self.fin_pending
            }
            // After a reset only the reliable prefix is still owed
            SendState::ResetSent => !self.lost.is_empty() || !self.pending.is_empty(),
        }
    }

    /// Pull the next chunk for transmission, at most `max_len` bytes
    ///
    /// The returned metadata describes the frame; the payload is returned for
    /// buffered chunks and absent for metadata-only chunks.
    pub(super) fn poll_transmit(&mut self, max_len: u64) -> Option<(SentChunk, Option<Bytes>)> {
        debug_assert!(max_len > 0);
        // Lost data first, to bound head-of-line blocking
        if let Some(mut chunk) = self.lost.pop_front() {
            if chunk.data.len() > max_len {
                let head = chunk.data.split_to(max_len);
                self.lost.push_front(SentChunk {
                    offset: chunk.offset + max_len,
                    data: std::mem::replace(&mut chunk.data, head),
                    fin: chunk.fin,
                });
                chunk.fin = false;
            }
            self.retransmission.insert(chunk.offset, chunk.clone());
            let payload = match chunk.data {
                ChunkData::Buf(ref data) => Some(data.clone()),
                ChunkData::Meta { .. } => None,
            };
            return Some((chunk, payload));
        }
        // Then new data. After a reset, `trim_to_reliable` has already
        // narrowed `pending` to the reliable prefix.
        if let Some(mut data) = self.pending.pop_front() {
            if data.len() > max_len {
                let head = data.split_to(max_len);
                self.pending.push_front(data);
                data = head;
            }
            let offset = self.sent_offset;
            self.sent_offset += data.len();
            let fin = self.state == SendState::Open
                && self.final_offset == Some(self.sent_offset)
                && self.pending.is_empty();
            if fin {
                self.fin_pending = false;
            }
            let chunk = SentChunk { offset, data, fin };
            self.retransmission.insert(offset, chunk.clone());
            let payload = match chunk.data {
                ChunkData::Buf(ref data) => Some(data.clone()),
                ChunkData::Meta { .. } => None,
            };
            return Some((chunk, payload));
        }
        // An empty FIN-only frame
        if self.state == SendState::Open
            && self.fin_pending
            && self.sent_offset == self.final_offset.unwrap_or(u64::MAX)
        {
            self.fin_pending = false;
            let chunk = SentChunk {
                offset: self.sent_offset,
                data: ChunkData::Buf(Bytes::new()),
                fin: true,
            };
            self.retransmission.insert(chunk.offset, chunk.clone());
            return Some((chunk, Some(Bytes::new())));
        }
        None
    }

    /// Process the acknowledgment of a previously sent STREAM frame
    ///
    /// Returns whether the half transitioned to `Closed`. Applying the same
    /// ack twice is harmless: the second application finds no matching
    /// retransmission entry and the acked-interval insert is idempotent.
    pub(super) fn ack(&mut self, meta: &StreamMeta) -> Result<bool, TransportError> {
        match self.state {
            SendState::Open | SendState::ResetSent => {}
            SendState::Closed => return Ok(false),
        }
        if let Some(chunk) = self.retransmission.get(&meta.offsets.start) {
            if chunk.data.is_meta() == meta.from_meta
                && chunk.data.len() == meta.offsets.end - meta.offsets.start
            {
                self.retransmission.remove(&meta.offsets.start);
            }
        }
        if meta.offsets.end > meta.offsets.start {
            self.acked.insert(meta.offsets.clone());
        }
        if meta.fin {
            self.fin_acked = true;
        }
        Ok(self.check_fully_delivered())
    }

    /// Process the acknowledgment of a previously sent RESET_STREAM[_AT]
    pub(super) fn on_reset_acked(
        &mut self,
        reliable_size: Option<u64>,
    ) -> Result<bool, TransportError> {
        match self.state {
            SendState::ResetSent => {
                // A non-reliable reset counts as a reliable size of zero
                let acked = reliable_size.unwrap_or(0);
                self.min_reliable_size_acked = Some(match self.min_reliable_size_acked {
                    Some(existing) => existing.min(acked),
                    None => acked,
                });
                Ok(self.check_fully_delivered())
            }
            SendState::Closed => Ok(false),
            SendState::Open => Err(TransportError::STREAM_STATE_ERROR(
                "RESET_STREAM ack for a stream that was never reset",
            )),
        }
    }

    fn check_fully_delivered(&mut self) -> bool {
        let all_reliable_delivered = match self.min_reliable_size_acked {
            Some(0) => true,
            Some(n) => self.acked.covers_through(n - 1),
            None => false,
        };
        let all_till_fin = self.fin_acked
            && match self.final_offset {
                Some(0) => true,
                Some(n) => self.acked.covers_through(n - 1),
                None => false,
            };
        if all_till_fin || all_reliable_delivered {
            if self.state != SendState::Closed {
                trace!("send half closed");
                self.state = SendState::Closed;
                self.pending.clear();
                self.lost.clear();
                self.retransmission.clear();
                return true;
            }
        }
        false
    }

    /// Reset the stream towards the peer
    ///
    /// Error-code and reliable-size constraints are programming contracts,
    /// not wire conditions, hence the panics. Re-resetting from `ResetSent`
    /// with a smaller reliable size is how an application walks the
    /// guaranteed prefix down.
    pub(super) fn reset(
        &mut self,
        error_code: VarInt,
        reliable_size: Option<u64>,
    ) -> Option<ResetFrame> {
        match self.state {
            SendState::Open | SendState::ResetSent => {}
            SendState::Closed => return None,
        }
        if let Some(prev) = self.app_error_to_peer {
            assert_eq!(
                prev, error_code,
                "cannot change the application error code in a reset"
            );
        }
        if let (Some(new), Some(prev)) = (reliable_size, self.reliable_size_to_peer) {
            assert!(new <= prev, "it is illegal to increase the reliable size");
        }
        self.app_error_to_peer = Some(error_code);
        self.reliable_size_to_peer = reliable_size;
        self.trim_to_reliable(reliable_size.unwrap_or(0));
        self.fin_pending = false;
        self.state = SendState::ResetSent;
        Some(ResetFrame {
            error_code,
            final_size: self.write_offset,
            reliable_size,
        })
    }

    /// Handle STOP_SENDING
    ///
    /// Returns true if the stream was stopped due to this frame, false if it
    /// had been stopped before.
    pub(super) fn try_stop(&mut self, error_code: VarInt) -> bool {
        if self.stop_reason.is_none() {
            self.stop_reason = Some(error_code);
            true
        } else {
            false
        }
    }

    /// A previously sent chunk was declared lost; requeue it unless the
    /// stream's group policy forgoes retransmission
    ///
    /// Returns whether the loss may have completed delivery (policy path).
    pub(super) fn on_chunk_lost(&mut self, meta: &StreamMeta, retransmit: bool) -> bool {
        let chunk = match self.retransmission.remove(&meta.offsets.start) {
            Some(x) => x,
            None => return false,
        };
        if self.state == SendState::ResetSent {
            // Only the reliable prefix is still owed to the peer
            let reliable = self.reliable_size_to_peer.unwrap_or(0);
            if chunk.offset >= reliable {
                return false;
            }
        }
        if retransmit {
            // Keep the lost queue offset-ordered for readable retransmits
            let at = self
                .lost
                .iter()
                .position(|c| c.offset > chunk.offset)
                .unwrap_or(self.lost.len());
            self.lost.insert(at, chunk);
            false
        } else {
            // Delivery abandoned by policy: account it as done so closure
            // can still be reached
            if meta.offsets.end > meta.offsets.start {
                self.acked.insert(meta.offsets.clone());
            }
            if meta.fin {
                self.fin_acked = true;
            }
            self.check_fully_delivered()
        }
    }

    /// Stream-level credit made available by a MAX_STREAM_DATA frame
    ///
    /// Returns whether the stream was unblocked.
    pub(super) fn increase_max_data(&mut self, offset: u64) -> bool {
        if offset <= self.max_data || self.state != SendState::Open {
            return false;
        }
        let was_blocked = self.write_offset == self.max_data;
        self.max_data = offset;
        was_blocked
    }

    /// Bytes the application could write right now, before connection-level
    /// limits
    pub(super) fn stream_budget(&self) -> u64 {
        self.max_data - self.write_offset
    }

    /// Drop buffered data the peer is no longer owed after a reset
    ///
    /// Unsent data below the reliable size is retained: the guaranteed
    /// prefix must still reach the peer even if it was never transmitted.
    fn trim_to_reliable(&mut self, reliable_size: u64) {
        let mut offset = self.sent_offset;
        let mut kept = VecDeque::new();
        while let Some(mut data) = self.pending.pop_front() {
            if offset >= reliable_size {
                break;
            }
            let keep = (reliable_size - offset).min(data.len());
            offset += keep;
            data.truncate(keep);
            kept.push_back(data);
        }
        self.pending = kept;

        self.lost.retain(|c| c.offset < reliable_size);
        if let Some(last) = self.lost.back_mut() {
            let end = last.offset + last.data.len();
            if end > reliable_size {
                last.data.truncate(reliable_size - last.offset);
                last.fin = false;
            }
        }
        let above: Vec<u64> = self
            .retransmission
            .range(reliable_size..)
            .map(|(&o, _)| o)
            .collect();
        for offset in above {
            self.retransmission.remove(&offset);
        }
    }

    pub(super) fn is_writable(&self) -> bool {
        self.state == SendState::Open
            && self.final_offset.is_none()
            && self.stop_reason.is_none()
            && self.stream_budget() > 0
    }
}

/// The reset frame parameters to enqueue after a local reset
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(super) struct ResetFrame {
    pub(super) error_code: VarInt,
    pub(super) final_size: u64,
    pub(super) reliable_size: Option<u64>,
}

/// Errors triggered while writing to a send stream
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum WriteError {
    /// The peer is not able to accept additional data, or the connection is
    /// congested
    #[error("unable to accept further writes")]
    Blocked,
    /// The peer is no longer accepting data on this stream
    ///
    /// Carries an application-defined error code.
    #[error("stopped by peer: code {0}")]
    Stopped(VarInt),
    /// The stream was finished, reset, or fully delivered
    #[error("stream closed")]
    Closed,
    /// This endpoint cannot send on the stream (receive-only direction)
    #[error("stream not writable by this endpoint")]
    NotSendable,
    /// The stream has not been opened
    #[error("unknown stream")]
    UnknownStream,
    /// The connection is closed or draining
    #[error("connection closed")]
    ConnectionClosed,
}

/// Reasons why attempting to finish a stream might fail
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum FinishError {
    /// The peer is no longer accepting data on this stream
    #[error("stopped by peer: code {0}")]
    Stopped(VarInt),
    /// The stream was already finished or reset
    #[error("stream closed")]
    Closed,
}
