use std::{collections::VecDeque, time::Instant};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, trace};

use crate::{frame, transport_error::TransportError};

/// An unreliable datagram delivered by the peer
#[derive(Debug, Clone)]
pub struct ReceivedDatagram {
    /// When the datagram's packet arrived
    pub receive_time: Instant,
    /// Payload
    pub data: Bytes,
}

/// Bounded FIFOs of datagram payloads in each direction
///
/// Both queues drop the newest payload on overflow: for receive this sheds
/// load the application isn't keeping up with, and for send it avoids
/// transmitting stale real-time payloads at the expense of fresh ones the
/// application has already superseded.
#[derive(Default)]
pub(super) struct DatagramState {
    recv_buffered: usize,
    incoming: VecDeque<ReceivedDatagram>,
    outgoing: VecDeque<frame::Datagram>,
    outgoing_total: usize,
    pub(super) recv_dropped: u64,
    pub(super) send_dropped: u64,
}

impl DatagramState {
    /// Handle a received DATAGRAM frame
    ///
    /// Returns whether the queue went from empty to non-empty, in which case
    /// the application should be woken.
    pub(super) fn received(
        &mut self,
        datagram: frame::Datagram,
        window: Option<usize>,
        now: Instant,
    ) -> Result<bool, TransportError> {
        let window = window.ok_or_else(|| {
            TransportError::PROTOCOL_VIOLATION("unexpected DATAGRAM frame")
        })?;

        if datagram.data.len() > window {
            return Err(TransportError::PROTOCOL_VIOLATION("oversized datagram"));
        }

        if self.recv_buffered + datagram.data.len() > window {
            debug!(len = datagram.data.len(), "receive buffer full, dropping datagram");
            self.recv_dropped += 1;
            return Ok(false);
        }

        let was_empty = self.recv_buffered == 0;
        self.recv_buffered += datagram.data.len();
        self.incoming.push_back(ReceivedDatagram {
            receive_time: now,
            data: datagram.data,
        });
        Ok(was_empty)
    }

    /// Queue an outgoing datagram, dropping it if the send buffer is full
    ///
    /// Returns whether the payload was accepted.
    pub(super) fn queue_send(&mut self, data: Bytes, buffer_limit: usize) -> bool {
        if self.outgoing_total + data.len() > buffer_limit {
            trace!(len = data.len(), "send buffer full, dropping datagram");
            self.send_dropped += 1;
            return false;
        }
        self.outgoing_total += data.len();
        self.outgoing.push_back(frame::Datagram { data });
        true
    }

    /// Encode the head of the send queue into `buf` if it fits under
    /// `max_size`
    pub(super) fn write(&mut self, buf: &mut Vec<u8>, max_size: usize) -> bool {
        let datagram = match self.outgoing.pop_front() {
            Some(x) => x,
            None => return false,
        };

        if buf.len() + datagram.size(true) > max_size {
            self.outgoing.push_front(datagram);
            return false;
        }

        self.outgoing_total -= datagram.data.len();
        datagram.encode(true, buf);
        true
    }

    pub(super) fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Pop up to `at_most` received datagrams; zero means all
    pub(super) fn recv(&mut self, at_most: usize) -> Vec<ReceivedDatagram> {
        let take = if at_most == 0 {
            self.incoming.len()
        } else {
            at_most.min(self.incoming.len())
        };
        let mut out = Vec::with_capacity(take);
        for _ in 0..take {
            let datagram = self.incoming.pop_front().unwrap();
            self.recv_buffered -= datagram.data.len();
            out.push(datagram);
        }
        out
    }
}

/// Errors that can arise when sending a datagram
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum SendDatagramError {
    /// The peer does not support receiving datagram frames
    #[error("datagrams not supported by peer")]
    UnsupportedByPeer,
    /// Datagram support is disabled locally
    #[error("datagram support disabled")]
    Disabled,
    /// The datagram is larger than the connection can currently accommodate
    #[error("datagram too large")]
    TooLarge,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(len: usize) -> frame::Datagram {
        frame::Datagram {
            data: Bytes::from(vec![0x5a; len]),
        }
    }

    #[test]
    fn recv_requires_negotiation() {
        let mut state = DatagramState::default();
        assert!(state.received(datagram(8), None, Instant::now()).is_err());
    }

    #[test]
    fn recv_drops_newest_on_overflow() {
        let mut state = DatagramState::default();
        let now = Instant::now();
        assert_eq!(state.received(datagram(60), Some(100), now), Ok(true));
        assert_eq!(state.received(datagram(30), Some(100), now), Ok(false));
        // Overflows the 100-byte window: this newest datagram is the casualty
        assert_eq!(state.received(datagram(30), Some(100), now), Ok(false));
        assert_eq!(state.recv_dropped, 1);
        let got = state.recv(0);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].data.len(), 60);
        assert_eq!(got[1].data.len(), 30);
    }

    #[test]
    fn recv_at_most() {
        let mut state = DatagramState::default();
        let now = Instant::now();
        for _ in 0..4 {
            state.received(datagram(10), Some(1000), now).unwrap();
        }
        assert_eq!(state.recv(3).len(), 3);
        assert_eq!(state.recv(0).len(), 1);
        assert!(state.recv(0).is_empty());
    }

    #[test]
    fn send_drops_newest_on_overflow() {
        let mut state = DatagramState::default();
        assert!(state.queue_send(Bytes::from(vec![1; 50]), 64));
        assert!(!state.queue_send(Bytes::from(vec![2; 50]), 64));
        assert_eq!(state.send_dropped, 1);
        let mut buf = Vec::new();
        assert!(state.write(&mut buf, 1200));
        assert!(!state.write(&mut buf, 1200));
    }

    #[test]
    fn write_defers_when_no_room() {
        let mut state = DatagramState::default();
        state.queue_send(Bytes::from(vec![1; 100]), 1000);
        let mut buf = Vec::new();
        assert!(!state.write(&mut buf, 50));
        // Still queued
        assert!(state.has_outgoing());
        assert!(state.write(&mut buf, 200));
    }
}
