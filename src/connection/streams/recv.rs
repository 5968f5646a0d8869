use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    connection::{
        assembler::Assembler,
        flow_control::{RecvWindow, ShouldTransmit},
    },
    frame,
    transport_error::TransportError,
    VarInt,
};

/// Receive-half states
///
/// The "Invalid" state (the receive half of a stream this endpoint can only
/// send on) is represented by the half's absence. A reset whose reliable
/// prefix has not fully arrived keeps the half in `Open` until it does.
///
/// ```text
/// Open ──────────────────────────────> Closed
///       all bytes through FIN, or a
///       reset with its reliable prefix,
///       received
/// ```
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum RecvState {
    Open,
    Closed,
}

/// The receive half of a stream
pub(super) struct Recv {
    pub(super) state: RecvState,
    pub(super) assembler: Assembler,
    /// Stream-level flow control window
    pub(super) flow: RecvWindow,
    /// Where the next peek resumes; never behind the read cursor
    peek_cursor: u64,
    /// Final size, once established by a FIN or a reset
    pub(super) final_size: Option<u64>,
    /// Reliable prefix from RESET_STREAM_AT; zero for a plain reset
    pub(super) reliable_size_from_peer: Option<u64>,
    /// Application error code from a peer reset
    reset_error: Option<VarInt>,
    /// Whether the reset error has been surfaced through `read`
    reset_delivered: bool,
    /// Whether EOF has been surfaced through `read`
    eof_delivered: bool,
    /// We sent STOP_SENDING; only size information matters now
    pub(super) stopped: bool,
    pub(super) read_paused: bool,
    pub(super) peek_paused: bool,
}

impl Recv {
    pub(super) fn new(window: u64, auto_tune: bool) -> Self {
        Self {
            state: RecvState::Open,
            assembler: Assembler::new(),
            flow: RecvWindow::new(window, auto_tune),
            peek_cursor: 0,
            final_size: None,
            reliable_size_from_peer: None,
            reset_error: None,
            reset_delivered: false,
            eof_delivered: false,
            stopped: false,
            read_paused: false,
            peek_paused: false,
        }
    }

    /// Buffer a received STREAM frame
    ///
    /// Returns how many previously unseen bytes it contributed (for
    /// connection-level flow control) and whether new data became readable.
    pub(super) fn ingest(
        &mut self,
        frame: frame::Stream,
    ) -> Result<(u64, bool), TransportError> {
        match self.state {
            RecvState::Closed => {
                trace!("discarding data for closed receive half");
                return Ok((0, false));
            }
            RecvState::Open => {}
        }
        let end = frame.offset + frame.data.len() as u64;
        if end > VarInt::MAX.into_inner() {
            return Err(TransportError::FLOW_CONTROL_ERROR(
                "maximum stream offset too large",
            ));
        }

        if let Some(final_size) = self.final_size {
            if end > final_size || (frame.fin && end != final_size) {
                debug!(end, final_size, "final size error");
                return Err(TransportError::FINAL_SIZE_ERROR(""));
            }
        }
        if frame.fin {
            if self.assembler.bytes_read() > end || self.flow.highest_recv() > end {
                return Err(TransportError::FINAL_SIZE_ERROR(
                    "lower than high water mark",
                ));
            }
            self.final_size = Some(end);
        }

        let new_bytes = self.flow.record_recv(end)?;

        let readable_before = self.has_readable_data();
        if self.stopped {
            // Stopped streams only need to know how much data there was
            self.assembler.set_bytes_read(end);
        } else {
            self.assembler.insert(frame.offset, frame.data);
        }

        self.maybe_close();
        Ok((new_bytes, !readable_before && self.has_readable_data()))
    }

    /// Apply a peer reset
    ///
    /// Returns newly credited flow control bytes, or `None` if the reset was
    /// redundant.
    pub(super) fn on_reset(
        &mut self,
        rst: &frame::ResetStream,
    ) -> Result<Option<u64>, TransportError> {
        let final_size: u64 = rst.final_size.into_inner();
        // Consistency first, regardless of state
        if let Some(known) = self.final_size {
            if known != final_size {
                return Err(TransportError::FINAL_SIZE_ERROR("inconsistent value"));
            }
        } else if self.flow.highest_recv() > final_size {
            return Err(TransportError::FINAL_SIZE_ERROR(
                "lower than high water mark",
            ));
        }
        let new_bytes = self.flow.record_recv(final_size)?;
        if self.state == RecvState::Closed || self.reset_error.is_some() {
            return Ok(None);
        }
        self.final_size = Some(final_size);
        self.reset_error = Some(rst.error_code);
        let reliable = rst.reliable_size.map_or(0, VarInt::into_inner);
        self.reliable_size_from_peer = Some(reliable);
        if reliable <= self.assembler.bytes_read() {
            // Nothing more is owed to the application
            self.assembler.clear();
        } else {
            // Data past the guaranteed prefix may never arrive
            self.assembler.truncate(reliable);
        }
        self.maybe_close();
        Ok(Some(new_bytes))
    }

    /// Ordered read of up to `max_len` bytes
    pub(super) fn read(&mut self, max_len: usize) -> Result<Option<Bytes>, ReadError> {
        if self.stopped || (self.eof_delivered && self.reset_error.is_none()) {
            return Err(ReadError::Closed);
        }
        if let Some(limit) = self.read_limit() {
            let budget = limit.saturating_sub(self.assembler.bytes_read());
            if budget == 0 {
                return self.read_blocked();
            }
            if let Some(chunk) = self.assembler.read(max_len.min(budget as usize)) {
                self.peek_cursor = self.peek_cursor.max(self.assembler.bytes_read());
                return Ok(Some(chunk));
            }
        } else if let Some(chunk) = self.assembler.read(max_len) {
            self.peek_cursor = self.peek_cursor.max(self.assembler.bytes_read());
            return Ok(Some(chunk));
        }
        self.read_blocked()
    }

    fn read_blocked(&mut self) -> Result<Option<Bytes>, ReadError> {
        if let Some(error_code) = self.reset_error {
            let reliable = self.reliable_size_from_peer.unwrap_or(0);
            if self.assembler.bytes_read() >= reliable {
                if self.reset_delivered {
                    return Err(ReadError::Closed);
                }
                self.reset_delivered = true;
                return Err(ReadError::Reset(error_code));
            }
            return Err(ReadError::Blocked);
        }
        if let Some(final_size) = self.final_size {
            if self.assembler.bytes_read() == final_size {
                self.eof_delivered = true;
                return Ok(None);
            }
        }
        Err(ReadError::Blocked)
    }

    /// The offset past which `read` must not deliver data
    fn read_limit(&self) -> Option<u64> {
        self.reset_error?;
        Some(self.reliable_size_from_peer.unwrap_or(0))
    }

    /// Copy readable data at the peek cursor without consuming it
    pub(super) fn peek(&mut self, max_len: usize) -> Result<Option<(u64, Bytes)>, ReadError> {
        if self.stopped {
            return Err(ReadError::Closed);
        }
        self.peek_cursor = self.peek_cursor.max(self.assembler.bytes_read());
        if let Some(limit) = self.read_limit() {
            if self.peek_cursor >= limit {
                return Ok(None);
            }
        }
        match self.assembler.peek(self.peek_cursor, max_len) {
            Some(chunk) => {
                let offset = self.peek_cursor;
                self.peek_cursor += chunk.len() as u64;
                Ok(Some((offset, chunk)))
            }
            None => Ok(None),
        }
    }

    /// Rewind the peek cursor to the read cursor
    pub(super) fn rewind_peek(&mut self) {
        self.peek_cursor = self.assembler.bytes_read();
    }

    /// Discard `amount` readable bytes
    pub(super) fn consume(&mut self, amount: u64) -> Result<(), ConsumeError> {
        if self.stopped {
            return Err(ConsumeError::Closed);
        }
        let available = self.assembler.contiguous_end() - self.assembler.bytes_read();
        if amount > available {
            return Err(ConsumeError::OutOfRange { available });
        }
        self.assembler
            .set_bytes_read(self.assembler.bytes_read() + amount);
        self.peek_cursor = self.peek_cursor.max(self.assembler.bytes_read());
        Ok(())
    }

    /// Offset-checked consume: `offset` must equal the current read offset
    pub(super) fn consume_at(&mut self, offset: u64, amount: u64) -> Result<(), ConsumeError> {
        let expected = self.assembler.bytes_read();
        if offset != expected {
            return Err(ConsumeError::WrongOffset { expected });
        }
        self.consume(amount)
    }

    /// The application is no longer interested; returns the flow control
    /// credit to release at the connection level
    pub(super) fn stop(&mut self) -> u64 {
        debug_assert!(!self.stopped);
        self.stopped = true;
        self.assembler.clear();
        let credit = self.flow.highest_recv() - self.assembler.bytes_read();
        self.assembler.set_bytes_read(self.flow.highest_recv());
        credit
    }

    /// Account an application read against flow control
    pub(super) fn flow_on_consumed(
        &mut self,
        n: u64,
        now: Instant,
        rtt: Option<Duration>,
    ) -> ShouldTransmit {
        self.flow.on_consumed(n, now, rtt)
    }

    pub(super) fn has_readable_data(&self) -> bool {
        if self.stopped {
            return false;
        }
        let contiguous = self.assembler.contiguous_end() - self.assembler.bytes_read();
        match self.read_limit() {
            Some(limit) => contiguous > 0 && self.assembler.bytes_read() < limit,
            None => contiguous > 0,
        }
    }

    /// Whether `read` would return something other than `Blocked`:
    /// data, EOF, or a reset
    pub(super) fn is_readable(&self) -> bool {
        if self.stopped {
            return false;
        }
        if self.has_readable_data() {
            return true;
        }
        if let Some(reliable) = self.reliable_size_from_peer {
            if self.reset_error.is_some()
                && !self.reset_delivered
                && self.assembler.bytes_read() >= reliable
            {
                return true;
            }
        }
        if let Some(final_size) = self.final_size {
            if self.reset_error.is_none()
                && !self.eof_delivered
                && self.assembler.bytes_read() == final_size
            {
                return true;
            }
        }
        false
    }

    /// No more data is expected from the peer
    pub(super) fn is_finished(&self) -> bool {
        self.state == RecvState::Closed
    }

    /// Whether the application has observed everything this half will ever
    /// produce, so the stream may be retired
    pub(super) fn is_retired(&self) -> bool {
        self.state == RecvState::Closed
            && (self.stopped || self.eof_delivered || self.reset_delivered)
    }

    fn maybe_close(&mut self) {
        if self.state == RecvState::Closed {
            return;
        }
        let all_received = match self.final_size {
            Some(0) => true,
            Some(n) => self.stopped || self.assembler.received_through(n - 1),
            None => false,
        };
        let reliable_received = match self.reliable_size_from_peer {
            Some(0) => true,
            Some(n) => self.assembler.received_through(n - 1),
            None => false,
        };
        if all_received || reliable_received {
            trace!("receive half closed");
            self.state = RecvState::Closed;
        }
    }
}

/// Errors triggered when reading from a recv stream
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ReadError {
    /// No more data is currently available on this stream
    #[error("blocked")]
    Blocked,
    /// The peer abandoned transmitting data on this stream
    ///
    /// Carries an application-defined error code.
    #[error("reset by peer: code {0}")]
    Reset(VarInt),
    /// The stream has already been stopped, finished, or reset
    #[error("stream closed")]
    Closed,
    /// This endpoint cannot read from the stream (send-only direction)
    #[error("stream not readable by this endpoint")]
    NotReadable,
    /// The stream has not been opened
    #[error("unknown stream")]
    UnknownStream,
    /// The connection is closed or draining
    #[error("connection closed")]
    ConnectionClosed,
}

/// Errors from `consume` and its offset-checked variant
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ConsumeError {
    /// The supplied offset does not match the current read offset
    #[error("wrong offset; expected {expected}")]
    WrongOffset {
        /// The offset the next consume must start at
        expected: u64,
    },
    /// Fewer contiguous bytes are available than requested
    #[error("only {available} bytes available")]
    OutOfRange {
        /// Contiguous bytes currently available
        available: u64,
    },
    /// The stream has already been stopped, finished, or reset
    #[error("stream closed")]
    Closed,
    /// The stream has not been opened
    #[error("unknown stream")]
    UnknownStream,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn stream_frame(offset: u64, data: &'static [u8], fin: bool) -> frame::Stream {
        frame::Stream {
            id: crate::StreamId::new(crate::Side::Server, crate::Dir::Bi, 0),
            offset,
            fin,
            data: Bytes::from_static(data),
        }
    }

    fn reset_frame(final_size: u32, reliable: Option<u32>) -> frame::ResetStream {
        frame::ResetStream {
            id: crate::StreamId::new(crate::Side::Server, crate::Dir::Bi, 0),
            error_code: VarInt::from_u32(42),
            final_size: VarInt::from_u32(final_size),
            reliable_size: reliable.map(VarInt::from_u32),
        }
    }

    #[test]
    fn fin_then_eof() {
        let mut recv = Recv::new(1000, false);
        let (new_bytes, readable) = recv.ingest(stream_frame(0, b"hello", true)).unwrap();
        assert_eq!(new_bytes, 5);
        assert!(readable);
        assert!(recv.is_finished());
        assert_eq!(&recv.read(100).unwrap().unwrap()[..], b"hello");
        assert_eq!(recv.read(100).unwrap(), None);
        // EOF is delivered once
        assert_matches!(recv.read(100), Err(ReadError::Closed));
    }

    #[test]
    fn flow_control_enforced() {
        let mut recv = Recv::new(4, false);
        assert!(recv.ingest(stream_frame(0, b"hello", false)).is_err());
    }

    #[test]
    fn final_size_consistency() {
        let mut recv = Recv::new(1000, false);
        recv.ingest(stream_frame(0, b"abc", true)).unwrap();
        // Data past the final size
        assert!(recv.ingest(stream_frame(3, b"d", false)).is_err());
        // Mismatched reset final size
        assert!(recv.on_reset(&reset_frame(7, None)).is_err());
    }

    #[test]
    fn plain_reset_discards_and_reports() {
        let mut recv = Recv::new(1000, false);
        recv.ingest(stream_frame(0, b"abc", false)).unwrap();
        let credited = recv.on_reset(&reset_frame(10, None)).unwrap();
        assert_eq!(credited, Some(7));
        assert!(recv.is_finished());
        assert_matches!(recv.read(100), Err(ReadError::Reset(code)) if code == VarInt::from_u32(42));
        assert_matches!(recv.read(100), Err(ReadError::Closed));
    }

    #[test]
    fn redundant_reset_ignored() {
        let mut recv = Recv::new(1000, false);
        recv.on_reset(&reset_frame(5, None)).unwrap();
        assert_eq!(recv.on_reset(&reset_frame(5, None)).unwrap(), None);
    }

    #[test]
    fn reliable_reset_delivers_prefix() {
        let mut recv = Recv::new(1000, false);
        recv.ingest(stream_frame(0, b"abcd", false)).unwrap();
        recv.on_reset(&reset_frame(100, Some(6))).unwrap();
        // Reliable prefix incomplete: stream not yet closed, reads blocked
        // after the buffered data
        assert!(!recv.is_finished());
        assert_eq!(&recv.read(100).unwrap().unwrap()[..], b"abcd");
        assert_matches!(recv.read(100), Err(ReadError::Blocked));
        // The guaranteed tail arrives
        recv.ingest(stream_frame(4, b"ef", false)).unwrap();
        assert!(recv.is_finished());
        assert_eq!(&recv.read(100).unwrap().unwrap()[..], b"ef");
        assert_matches!(recv.read(100), Err(ReadError::Reset(_)));
    }

    #[test]
    fn reliable_reset_truncates_excess() {
        let mut recv = Recv::new(1000, false);
        recv.ingest(stream_frame(0, b"abcdefgh", false)).unwrap();
        recv.on_reset(&reset_frame(100, Some(4))).unwrap();
        assert_eq!(&recv.read(100).unwrap().unwrap()[..], b"abcd");
        assert_matches!(recv.read(100), Err(ReadError::Reset(_)));
    }

    #[test]
    fn peek_and_consume() {
        let mut recv = Recv::new(1000, false);
        recv.ingest(stream_frame(0, b"abcdef", false)).unwrap();
        let (offset, chunk) = recv.peek(3).unwrap().unwrap();
        assert_eq!((offset, &chunk[..]), (0, &b"abc"[..]));
        let (offset, chunk) = recv.peek(100).unwrap().unwrap();
        assert_eq!((offset, &chunk[..]), (3, &b"def"[..]));
        assert_eq!(recv.peek(100).unwrap(), None);
        recv.rewind_peek();
        let (offset, _) = recv.peek(1).unwrap().unwrap();
        assert_eq!(offset, 0);

        recv.consume(4).unwrap();
        assert_eq!(&recv.read(100).unwrap().unwrap()[..], b"ef");
    }

    #[test]
    fn consume_at_checks_offset() {
        let mut recv = Recv::new(1000, false);
        recv.ingest(stream_frame(0, b"abcdef", false)).unwrap();
        recv.consume_at(0, 2).unwrap();
        assert_matches!(
            recv.consume_at(0, 2),
            Err(ConsumeError::WrongOffset { expected: 2 })
        );
        recv.consume_at(2, 2).unwrap();
        assert_matches!(
            recv.consume(100),
            Err(ConsumeError::OutOfRange { available: 2 })
        );
    }

    #[test]
    fn stop_releases_credit() {
        let mut recv = Recv::new(1000, false);
        recv.ingest(stream_frame(0, b"abcdef", false)).unwrap();
        recv.consume(2).unwrap();
        assert_eq!(recv.stop(), 4);
        assert_matches!(recv.read(100), Err(ReadError::Closed));
        // Subsequent data only updates size accounting
        let (new_bytes, readable) = recv.ingest(stream_frame(6, b"gh", false)).unwrap();
        assert_eq!(new_bytes, 2);
        assert!(!readable);
    }
}
