//! Sans-IO state machine for the connection core of a QUIC transport endpoint.
//!
//! This crate contains no networking code. The [`Connection`] type consumes
//! incoming UDP datagrams, produces outgoing packets through a pluggable
//! batch writer, and reports deadlines for the timers it needs; the embedding
//! event loop owns the sockets and the clock and calls back in when either
//! fires. Cryptography is likewise behind a seam: a [`crypto::Session`]
//! drives the handshake and hands over packet protection keys as the
//! connection advances through encryption levels.
//!
//! The result is a connection engine that can be driven deterministically in
//! tests and embedded under any reactor.

use std::{fmt, ops};

mod coding;
use coding::Codec;
mod range_set;
#[cfg(test)]
mod test_util;
mod varint;

pub use varint::{VarInt, VarIntBoundsExceeded};

mod config;
pub use config::TransportConfig;

mod connection;
pub use connection::{
    BatchError, BatchWriter, ByteEventKind, ConnectError, Connection, ConnectionError,
    ConsumeError, Event, FinishError, IoBatch, KnobError, OpenError, PingResult, ReadError,
    ReceivedDatagram, RetransmissionPolicy, RttEstimator, SendDatagramError, SocketCmsg,
    StreamEvent, Transmit, WriteError,
};

pub mod congestion;
pub mod crypto;

mod frame;
pub use frame::{ApplicationClose, ConnectionClose};

mod packet;
pub use packet::{ConnectionId, EncryptionLevel, SpaceId};

mod transport_error;
pub use transport_error::{Code as TransportErrorCode, TransportError};

mod transport_parameters;
pub use transport_parameters::{CachedServerParameters, ServerParameters, TransportParameterId};

/// The QUIC protocol version implemented, plus the aliases some deployments
/// negotiate for it
pub const SUPPORTED_VERSIONS: &[u32] = &[0x0000_0001, 0xff00_001d, 0x5146_0001];

/// Whether a version is QUIC v1 or one of its negotiated aliases
pub(crate) fn is_v1_like(version: u32) -> bool {
    SUPPORTED_VERSIONS.contains(&version)
}

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl Side {
    #[inline]
    pub(crate) fn is_client(self) -> bool {
        self == Side::Client
    }
}

impl ops::Not for Side {
    type Output = Self;
    fn not(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

/// Whether a stream communicates data in both directions or only from the initiator
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Dir {
    /// Data flows in both directions
    Bi = 0,
    /// Data flows only from the stream's initiator
    Uni = 1,
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::Bi => "bidirectional",
            Self::Uni => "unidirectional",
        })
    }
}

/// Identifier for a stream within a particular connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(u64);

impl StreamId {
    pub(crate) fn new(initiator: Side, dir: Dir, index: u64) -> Self {
        Self(index << 2 | (dir as u64) << 1 | initiator as u64)
    }

    /// Which side of a connection initiated the stream
    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    /// Which directions data flows in
    pub fn dir(self) -> Dir {
        if self.0 & 0x2 == 0 {
            Dir::Bi
        } else {
            Dir::Uni
        }
    }

    /// Distinguishes streams of the same initiator and directionality
    pub fn index(self) -> u64 {
        self.0 >> 2
    }

    /// Whether this endpoint may send application data on the stream
    pub(crate) fn sendable_by(self, side: Side) -> bool {
        self.dir() == Dir::Bi || self.initiator() == side
    }

    /// Whether this endpoint may receive application data on the stream
    pub(crate) fn receivable_by(self, side: Side) -> bool {
        self.dir() == Dir::Bi || self.initiator() != side
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let initiator = match self.initiator() {
            Side::Client => "client",
            Side::Server => "server",
        };
        write!(f, "{} {} stream {}", initiator, self.dir(), self.index())
    }
}

impl From<StreamId> for VarInt {
    fn from(x: StreamId) -> Self {
        unsafe { Self::from_u64_unchecked(x.0) }
    }
}

impl From<VarInt> for StreamId {
    fn from(v: VarInt) -> Self {
        Self(v.into_inner())
    }
}

impl coding::Codec for StreamId {
    fn decode<B: bytes::Buf>(buf: &mut B) -> coding::Result<Self> {
        VarInt::decode(buf).map(|x| Self(x.into_inner()))
    }
    fn encode<B: bytes::BufMut>(&self, buf: &mut B) {
        VarInt::from(*self).encode(buf);
    }
}

/// Identifier for a group of streams sharing a retransmission policy
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamGroupId(u64);

impl StreamGroupId {
    pub(crate) fn new(initiator: Side, dir: Dir, index: u64) -> Self {
        Self(index << 2 | (dir as u64) << 1 | initiator as u64)
    }

    pub(crate) fn dir(self) -> Dir {
        if self.0 & 0x2 == 0 {
            Dir::Bi
        } else {
            Dir::Uni
        }
    }
}

impl From<StreamGroupId> for VarInt {
    fn from(x: StreamGroupId) -> Self {
        unsafe { Self::from_u64_unchecked(x.0) }
    }
}

impl fmt::Display for StreamGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream group {}", self.0 >> 2)
    }
}

//
// Useful internal constants
//

/// The maximum connection ID length in QUIC v1
pub(crate) const MAX_CID_SIZE: usize = 20;
/// Initial packets from clients must be padded to at least this size
pub(crate) const MIN_INITIAL_SIZE: u16 = 1200;
/// Assumed-safe UDP payload size before the peer tells us otherwise
pub(crate) const DEFAULT_UDP_PAYLOAD_SIZE: u16 = 1252;
/// Smallest max_udp_payload_size a peer may advertise
pub(crate) const MIN_UDP_PAYLOAD_SIZE: u16 = 1200;
pub(crate) const RESET_TOKEN_SIZE: usize = 16;
/// The largest packet number: 2^62 - 1
pub(crate) const MAX_PACKET_NUMBER: u64 = (1 << 62) - 1;
/// Maximum number of streams of a kind that may exist, per QUIC v1
pub(crate) const MAX_STREAM_COUNT: u64 = 1 << 60;
/// Smallest interval we bother scheduling a timer for
pub(crate) const TIMER_GRANULARITY: std::time::Duration = std::time::Duration::from_millis(1);
/// Largest exponent a peer may use to scale its ack delays
pub(crate) const MAX_ACK_DELAY_EXPONENT: u64 = 20;
/// Worst-case per-packet overhead a DATAGRAM frame's payload must fit under
pub(crate) const DATAGRAM_OVERHEAD: u64 = 40;
