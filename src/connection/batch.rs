use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tracing::trace;

/// An ancillary message attached to a sendmsg call, e.g. a mark or a TOS
/// value; interpretation is the socket layer's business
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SocketCmsg {
    /// cmsg_level
    pub level: i32,
    /// cmsg_type
    pub ty: i32,
    /// Value payload
    pub value: u64,
}

/// One UDP payload ready for the wire
#[derive(Debug, Clone)]
pub struct Transmit {
    /// Encrypted packet bytes
    pub payload: Bytes,
    /// Ancillary data for this payload's sendmsg call, if any
    pub cmsgs: Option<Arc<Vec<SocketCmsg>>>,
}

/// Transmits batches of UDP payloads, typically via sendmmsg or GSO
///
/// A call sends a prefix of `batch`: the return value is how many payloads
/// went out. Returning `Err` means nothing was sent.
pub trait BatchWriter: Send {
    /// Attempt to transmit every payload in `batch` in one operation
    fn send(&mut self, batch: &[Transmit]) -> Result<usize, BatchError>;
}

/// Errors surfaced by the egress batch path
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum BatchError {
    /// The socket reported a fatal error; no payloads were sent
    #[error("socket send failed: {0}")]
    Send(String),
    /// The writer transmitted only a prefix of the batch
    ///
    /// The unsent packets were already recorded as outstanding when they were
    /// handed to the batch; loss detection recovers their frames, so they are
    /// neither reordered nor resent here.
    #[error("partial batch send: {sent} of {attempted}")]
    Partial {
        /// Payloads transmitted
        sent: usize,
        /// Payloads handed to the writer
        attempted: usize,
    },
}

/// Accumulates outgoing packets and flushes them in batches
///
/// `batch_size` semantics: `1` disables batching entirely, `n > 1` flushes
/// automatically once `n` payloads are buffered, and a negative value
/// accumulates without bound until an explicit [`flush`](Self::flush) (tests
/// drive that mode).
pub struct IoBatch<W> {
    writer: W,
    buffer: Vec<Transmit>,
    batch_size: Option<usize>,
    pkts_sent: u64,
    bytes_sent: u64,
}

impl<W: BatchWriter> IoBatch<W> {
    pub fn new(writer: W, batch_size: isize) -> Self {
        Self {
            writer,
            buffer: Vec::new(),
            batch_size: usize::try_from(batch_size).ok().filter(|&n| n != 0),
            pkts_sent: 0,
            bytes_sent: 0,
        }
    }

    /// Accept a payload for transmission, flushing if the batch is full
    ///
    /// Returns `true` if the payload was accepted.
    pub fn write(&mut self, transmit: Transmit) -> Result<bool, BatchError> {
        self.buffer.push(transmit);
        if let Some(n) = self.batch_size {
            if self.buffer.len() >= n {
                self.flush()?;
            }
        }
        Ok(true)
    }

    /// Drain the buffer to the socket
    pub fn flush(&mut self) -> Result<(), BatchError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let attempted = self.buffer.len();
        let result = self.writer.send(&self.buffer);
        match result {
            Ok(sent) => {
                for transmit in self.buffer.drain(..sent) {
                    self.pkts_sent += 1;
                    self.bytes_sent += transmit.payload.len() as u64;
                }
                if sent < attempted {
                    trace!(sent, attempted, "partial batch send");
                    // The remainder is already booked as outstanding by the
                    // engine; surface the shortfall and let loss detection
                    // recover the frames
                    self.buffer.clear();
                    return Err(BatchError::Partial { sent, attempted });
                }
                Ok(())
            }
            Err(e) => {
                self.buffer.clear();
                Err(e)
            }
        }
    }

    /// Total packets transmitted over the life of this batch
    pub fn pkts_sent(&self) -> u64 {
        self.pkts_sent
    }

    /// Total bytes transmitted over the life of this batch
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Access the underlying writer
    pub fn writer(&self) -> &W {
        &self.writer
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Records every send; can be limited to a fixed number of payloads per
    /// call to exercise partial sends
    #[derive(Default)]
    pub(crate) struct RecordingWriter {
        pub(crate) calls: Vec<Vec<Transmit>>,
        pub(crate) per_call_limit: Option<usize>,
        pub(crate) fail_next: bool,
    }

    impl BatchWriter for RecordingWriter {
        fn send(&mut self, batch: &[Transmit]) -> Result<usize, BatchError> {
            if self.fail_next {
                self.fail_next = false;
                return Err(BatchError::Send("connection refused".into()));
            }
            let sent = match self.per_call_limit {
                Some(limit) => batch.len().min(limit),
                None => batch.len(),
            };
            self.calls.push(batch[..sent].to_vec());
            Ok(sent)
        }
    }
}
