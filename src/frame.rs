use std::{fmt, mem, ops::Range};

use bytes::{Buf, BufMut, Bytes};
use tinyvec::TinyVec;

use crate::{
    coding::{self, BufExt, BufMutExt, Codec, UnexpectedEnd},
    packet::ConnectionId,
    range_set::RangeSet,
    transport_error::{Code, TransportError},
    Dir, StreamId, VarInt, MAX_CID_SIZE, RESET_TOKEN_SIZE,
};

/// A QUIC frame type identifier
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct FrameType(u64);

impl FrameType {
    fn stream(self) -> Option<StreamInfo> {
        if STREAM_TYS.contains(&self.0) {
            Some(StreamInfo(self.0 as u8))
        } else {
            None
        }
    }

    fn datagram(self) -> Option<DatagramInfo> {
        if DATAGRAM_TYS.contains(&self.0) {
            Some(DatagramInfo(self.0 as u8))
        } else {
            None
        }
    }
}

impl coding::Codec for FrameType {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        Ok(Self(buf.get_var()?))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write_var(self.0);
    }
}

pub(crate) trait FrameStruct {
    /// Smallest number of bytes this type of frame is guaranteed to fit within
    const SIZE_BOUND: usize;
}

macro_rules! frame_types {
    {$($name:ident = $val:expr,)*} => {
        impl FrameType {
            $(pub(crate) const $name: FrameType = FrameType($val);)*
        }

        impl fmt::Debug for FrameType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    _ => write!(f, "Type({:08x})", self.0)
                }
            }
        }

        impl fmt::Display for FrameType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    x if STREAM_TYS.contains(&x) => f.write_str("STREAM"),
                    x if DATAGRAM_TYS.contains(&x) => f.write_str("DATAGRAM"),
                    _ => write!(f, "<unknown {:08x}>", self.0),
                }
            }
        }
    }
}

frame_types! {
    PADDING = 0x00,
    PING = 0x01,
    ACK = 0x02,
    ACK_ECN = 0x03,
    RESET_STREAM = 0x04,
    STOP_SENDING = 0x05,
    CRYPTO = 0x06,
    NEW_TOKEN = 0x07,
    MAX_DATA = 0x10,
    MAX_STREAM_DATA = 0x11,
    MAX_STREAMS_BIDI = 0x12,
    MAX_STREAMS_UNI = 0x13,
    DATA_BLOCKED = 0x14,
    STREAM_DATA_BLOCKED = 0x15,
    STREAMS_BLOCKED_BIDI = 0x16,
    STREAMS_BLOCKED_UNI = 0x17,
    NEW_CONNECTION_ID = 0x18,
    RETIRE_CONNECTION_ID = 0x19,
    PATH_CHALLENGE = 0x1a,
    PATH_RESPONSE = 0x1b,
    CONNECTION_CLOSE = 0x1c,
    APPLICATION_CLOSE = 0x1d,
    HANDSHAKE_DONE = 0x1e,
    // draft-ietf-quic-reliable-stream-reset
    RESET_STREAM_AT = 0x24,
    // RFC 9221
    DATAGRAM = 0x30,
    DATAGRAM_LEN = 0x31,
    // Negotiated extension: ACK carrying receive timestamps
    ACK_RECEIVE_TIMESTAMPS = 0xb1,
    // Negotiated extension: out-of-band tuning knobs
    KNOB = 0x1550,
}

const STREAM_TYS: Range<u64> = 0x08..0x10;
const DATAGRAM_TYS: Range<u64> = 0x30..0x32;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct StreamInfo(u8);

impl StreamInfo {
    fn fin(self) -> bool {
        self.0 & 0x01 != 0
    }
    fn len(self) -> bool {
        self.0 & 0x02 != 0
    }
    fn off(self) -> bool {
        self.0 & 0x04 != 0
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct DatagramInfo(u8);

impl DatagramInfo {
    fn len(self) -> bool {
        self.0 & 0x01 != 0
    }
}

/// A decoded QUIC frame
#[derive(Debug)]
pub(crate) enum Frame {
    Padding,
    Ping,
    Ack(Ack),
    ResetStream(ResetStream),
    StopSending(StopSending),
    Crypto(Crypto),
    NewToken { token: Bytes },
    Stream(Stream),
    MaxData(VarInt),
    MaxStreamData { id: StreamId, offset: u64 },
    MaxStreams { dir: Dir, count: u64 },
    DataBlocked { offset: u64 },
    StreamDataBlocked { id: StreamId, offset: u64 },
    StreamsBlocked { dir: Dir, limit: u64 },
    NewConnectionId(NewConnectionId),
    RetireConnectionId { sequence: u64 },
    PathChallenge(u64),
    PathResponse(u64),
    Close(Close),
    HandshakeDone,
    Datagram(Datagram),
    Knob(Knob),
}

impl Frame {
    pub(crate) fn ty(&self) -> FrameType {
        use Frame::*;
        match *self {
            Padding => FrameType::PADDING,
            Ping => FrameType::PING,
            Ack(_) => FrameType::ACK,
            ResetStream(ref x) => match x.reliable_size {
                Some(_) => FrameType::RESET_STREAM_AT,
                None => FrameType::RESET_STREAM,
            },
            StopSending(_) => FrameType::STOP_SENDING,
            Crypto(_) => FrameType::CRYPTO,
            NewToken { .. } => FrameType::NEW_TOKEN,
            Stream(_) => FrameType(0x08),
            MaxData(_) => FrameType::MAX_DATA,
            MaxStreamData { .. } => FrameType::MAX_STREAM_DATA,
            MaxStreams { dir: Dir::Bi, .. } => FrameType::MAX_STREAMS_BIDI,
            MaxStreams { dir: Dir::Uni, .. } => FrameType::MAX_STREAMS_UNI,
            DataBlocked { .. } => FrameType::DATA_BLOCKED,
            StreamDataBlocked { .. } => FrameType::STREAM_DATA_BLOCKED,
            StreamsBlocked { dir: Dir::Bi, .. } => FrameType::STREAMS_BLOCKED_BIDI,
            StreamsBlocked { dir: Dir::Uni, .. } => FrameType::STREAMS_BLOCKED_UNI,
            NewConnectionId(_) => FrameType::NEW_CONNECTION_ID,
            RetireConnectionId { .. } => FrameType::RETIRE_CONNECTION_ID,
            PathChallenge(_) => FrameType::PATH_CHALLENGE,
            PathResponse(_) => FrameType::PATH_RESPONSE,
            Close(self::Close::Connection(_)) => FrameType::CONNECTION_CLOSE,
            Close(self::Close::Application(_)) => FrameType::APPLICATION_CLOSE,
            HandshakeDone => FrameType::HANDSHAKE_DONE,
            Datagram(_) => FrameType::DATAGRAM,
            Knob(_) => FrameType::KNOB,
        }
    }

    /// Whether a packet containing only this frame elicits an acknowledgment
    pub(crate) fn is_ack_eliciting(&self) -> bool {
        !matches!(*self, Self::Padding | Self::Ack(_) | Self::Close(_))
    }
}

/// An acknowledgment of one or more packet number ranges
#[derive(Clone, Eq, PartialEq)]
pub(crate) struct Ack {
    pub largest: u64,
    pub delay: u64,
    /// Encoded ack range section, walked lazily by `iter()`
    pub additional: Bytes,
    pub ecn: Option<EcnCounts>,
    /// Receive-timestamp section, present iff the extension was negotiated
    pub timestamps: Option<Bytes>,
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ranges = self.iter().collect::<Vec<_>>();
        f.debug_struct("Ack")
            .field("largest", &self.largest)
            .field("delay", &self.delay)
            .field("ranges", &ranges)
            .finish()
    }
}

impl Ack {
    pub(crate) fn encode<W: BufMut>(
        delay: u64,
        ranges: &RangeSet,
        ecn: Option<&EcnCounts>,
        timestamps: Option<&[u8]>,
        buf: &mut W,
    ) {
        debug_assert!(!ranges.is_empty(), "ACKs must contain at least one range");
        let ty = if timestamps.is_some() {
            FrameType::ACK_RECEIVE_TIMESTAMPS
        } else if ecn.is_some() {
            FrameType::ACK_ECN
        } else {
            FrameType::ACK
        };
        ty.encode(buf);
        let mut rest = ranges.iter().rev();
        let first = rest.next().unwrap();
        let largest = first.end - 1;
        let first_size = first.end - first.start;
        buf.write_var(largest);
        buf.write_var(delay);
        buf.write_var(ranges.len() as u64 - 1);
        buf.write_var(first_size - 1);
        let mut prev = first.start;
        for block in rest {
            let size = block.end - block.start;
            buf.write_var(prev - block.end - 1);
            buf.write_var(size - 1);
            prev = block.start;
        }
        if let Some(x) = ecn {
            x.encode(buf)
        }
        if let Some(ts) = timestamps {
            buf.write_var(ts.len() as u64);
            buf.put_slice(ts);
        }
    }

    pub(crate) fn iter(&self) -> AckIter<'_> {
        AckIter {
            largest: self.largest,
            data: &self.additional[..],
            first: true,
        }
    }
}

/// Walks the gap/length pairs of an encoded ack range section
pub(crate) struct AckIter<'a> {
    largest: u64,
    data: &'a [u8],
    first: bool,
}

impl Iterator for AckIter<'_> {
    type Item = Range<u64>;
    fn next(&mut self) -> Option<Range<u64>> {
        if !self.data.has_remaining() {
            return None;
        }
        if !self.first {
            let gap = self.data.get_var().ok()?;
            self.largest = self.largest.checked_sub(gap + 2)?;
        }
        self.first = false;
        let size = self.data.get_var().ok()?;
        let smallest = self.largest.checked_sub(size)?;
        let range = smallest..self.largest + 1;
        self.largest = smallest;
        Some(range)
    }
}

/// ECN counts carried in an ACK_ECN frame; parsed for framing correctness,
/// not acted upon
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub(crate) struct EcnCounts {
    pub ect0: u64,
    pub ect1: u64,
    pub ce: u64,
}

impl EcnCounts {
    fn encode<W: BufMut>(&self, out: &mut W) {
        out.write_var(self.ect0);
        out.write_var(self.ect1);
        out.write_var(self.ce);
    }
}

/// RESET_STREAM or, when `reliable_size` is set, RESET_STREAM_AT
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct ResetStream {
    pub id: StreamId,
    pub error_code: VarInt,
    pub final_size: VarInt,
    pub reliable_size: Option<VarInt>,
}

impl FrameStruct for ResetStream {
    const SIZE_BOUND: usize = 1 + 8 + 8 + 8 + 8;
}

impl ResetStream {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        match self.reliable_size {
            Some(_) => FrameType::RESET_STREAM_AT.encode(out),
            None => FrameType::RESET_STREAM.encode(out),
        }
        out.write(self.id);
        out.write(self.error_code);
        out.write(self.final_size);
        if let Some(reliable_size) = self.reliable_size {
            out.write(reliable_size);
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct StopSending {
    pub id: StreamId,
    pub error_code: VarInt,
}

impl FrameStruct for StopSending {
    const SIZE_BOUND: usize = 1 + 8 + 8;
}

impl StopSending {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        FrameType::STOP_SENDING.encode(out);
        out.write(self.id);
        out.write(self.error_code);
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Crypto {
    pub offset: u64,
    pub data: Bytes,
}

impl Crypto {
    pub(crate) const SIZE_BOUND: usize = 17;

    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        FrameType::CRYPTO.encode(out);
        out.write_var(self.offset);
        out.write_var(self.data.len() as u64);
        out.put_slice(&self.data);
    }
}

/// Application data carried in a STREAM frame
#[derive(Debug, Clone)]
pub(crate) struct Stream {
    pub id: StreamId,
    pub offset: u64,
    pub fin: bool,
    pub data: Bytes,
}

impl FrameStruct for Stream {
    const SIZE_BOUND: usize = 1 + 8 + 8 + 8;
}

/// Metadata from a STREAM frame, retained for ack/loss bookkeeping
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct StreamMeta {
    pub id: StreamId,
    pub offsets: Range<u64>,
    pub fin: bool,
    /// Whether the payload lives in an application-owned store rather than
    /// the stream's retransmission buffer
    pub from_meta: bool,
}

// Required by TinyVec
impl Default for StreamMeta {
    fn default() -> Self {
        Self {
            id: StreamId::from(VarInt::from_u32(0)),
            offsets: 0..0,
            fin: false,
            from_meta: false,
        }
    }
}

impl StreamMeta {
    pub(crate) fn encode<W: BufMut>(&self, length: bool, out: &mut W) {
        let mut ty = 0x08;
        if self.offsets.start != 0 {
            ty |= 0x04;
        }
        if length {
            ty |= 0x02;
        }
        if self.fin {
            ty |= 0x01;
        }
        out.write_var(ty);
        out.write(self.id);
        if self.offsets.start != 0 {
            out.write_var(self.offsets.start);
        }
        if length {
            out.write_var(self.offsets.end - self.offsets.start);
        }
    }
}

pub(crate) type StreamMetaVec = TinyVec<[StreamMeta; 2]>;

#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct NewConnectionId {
    pub sequence: u64,
    pub retire_prior_to: u64,
    pub id: ConnectionId,
    pub reset_token: [u8; RESET_TOKEN_SIZE],
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum Close {
    Connection(ConnectionClose),
    Application(ApplicationClose),
}

impl Close {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W, max_len: usize) {
        match *self {
            Self::Connection(ref x) => x.encode(out, max_len),
            Self::Application(ref x) => x.encode(out, max_len),
        }
    }
}

impl From<TransportError> for Close {
    fn from(x: TransportError) -> Self {
        Self::Connection(x.into())
    }
}

impl From<ConnectionClose> for Close {
    fn from(x: ConnectionClose) -> Self {
        Self::Connection(x)
    }
}

impl From<ApplicationClose> for Close {
    fn from(x: ApplicationClose) -> Self {
        Self::Application(x)
    }
}

/// Reason given by the transport for closing the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionClose {
    /// Class of error as encoded in the specification
    pub error_code: Code,
    /// Type of frame that caused the close
    pub frame_type: Option<FrameType>,
    /// Human-readable reason for the close
    pub reason: Bytes,
}

impl fmt::Display for ConnectionClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error_code.fmt(f)?;
        if !self.reason.is_empty() {
            f.write_str(": ")?;
            f.write_str(&String::from_utf8_lossy(&self.reason))?;
        }
        Ok(())
    }
}

impl From<TransportError> for ConnectionClose {
    fn from(x: TransportError) -> Self {
        Self {
            error_code: x.code,
            frame_type: x.frame,
            reason: x.reason.into(),
        }
    }
}

impl ConnectionClose {
    fn encode<W: BufMut>(&self, out: &mut W, max_len: usize) {
        FrameType::CONNECTION_CLOSE.encode(out);
        out.write(self.error_code);
        let ty = self.frame_type.map_or(0, |x| x.0);
        out.write_var(ty);
        let max_len = max_len
            .saturating_sub(4 + VarInt::from_u64(ty).unwrap().size() + VarInt::MAX_SIZE);
        let actual_len = self.reason.len().min(max_len);
        out.write_var(actual_len as u64);
        out.put_slice(&self.reason[0..actual_len]);
    }
}

/// Reason given by an application for closing the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationClose {
    /// Application-specific reason code
    pub error_code: VarInt,
    /// Human-readable reason for the close
    pub reason: Bytes,
}

impl fmt::Display for ApplicationClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.reason.is_empty() {
            f.write_str(&String::from_utf8_lossy(&self.reason))?;
            f.write_str(" (code ")?;
            self.error_code.fmt(f)?;
            f.write_str(")")?;
        } else {
            self.error_code.fmt(f)?;
        }
        Ok(())
    }
}

impl ApplicationClose {
    fn encode<W: BufMut>(&self, out: &mut W, max_len: usize) {
        FrameType::APPLICATION_CLOSE.encode(out);
        out.write(self.error_code);
        let max_len = max_len.saturating_sub(3 + VarInt::MAX_SIZE);
        let actual_len = self.reason.len().min(max_len);
        out.write_var(actual_len as u64);
        out.put_slice(&self.reason[0..actual_len]);
    }
}

/// An unreliable datagram
#[derive(Debug, Clone)]
pub(crate) struct Datagram {
    /// Payload
    pub data: Bytes,
}

impl FrameStruct for Datagram {
    const SIZE_BOUND: usize = 1 + 8;
}

impl Datagram {
    pub(crate) fn encode(&self, length: bool, out: &mut Vec<u8>) {
        out.write_var(0x30 | u64::from(length));
        if length {
            out.write_var(self.data.len() as u64);
        }
        out.put_slice(&self.data);
    }

    pub(crate) fn size(&self, length: bool) -> usize {
        1 + if length {
            VarInt::from_u64(self.data.len() as u64).unwrap().size()
        } else {
            0
        } + self.data.len()
    }
}

/// A tuning knob pushed by the peer, identified by (space, id)
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct Knob {
    pub space: u64,
    pub id: u64,
    pub payload: Bytes,
}

impl FrameStruct for Knob {
    const SIZE_BOUND: usize = 4 + 8 + 8 + 8;
}

impl Knob {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        FrameType::KNOB.encode(out);
        out.write_var(self.space);
        out.write_var(self.id);
        out.write_var(self.payload.len() as u64);
        out.put_slice(&self.payload);
    }
}

/// Errors encountered while walking a packet's frames
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct IterErr {
    ty: FrameType,
    reason: &'static str,
}

impl From<IterErr> for TransportError {
    fn from(err: IterErr) -> Self {
        let mut te = Self::FRAME_ENCODING_ERROR(err.reason);
        te.frame = Some(err.ty);
        te
    }
}

/// Decodes frames from a packet's plaintext payload
pub(crate) struct Iter {
    bytes: Bytes,
}

impl Iter {
    pub(crate) fn new(payload: Bytes) -> Result<Self, TransportError> {
        if payload.is_empty() {
            // "An endpoint MUST treat receipt of a packet containing no
            // frames as a connection error of type PROTOCOL_VIOLATION."
            return Err(TransportError::PROTOCOL_VIOLATION(
                "packet payload is empty",
            ));
        }
        Ok(Self { bytes: payload })
    }

    fn take_len(&mut self) -> Result<Bytes, UnexpectedEnd> {
        let len = self.bytes.get_var()?;
        if len > self.bytes.remaining() as u64 {
            return Err(UnexpectedEnd);
        }
        Ok(self.bytes.split_to(len as usize))
    }

    fn try_next(&mut self) -> Result<Frame, IterErr> {
        let ty = self
            .bytes
            .get::<FrameType>()
            .map_err(|_| IterErr {
                ty: FrameType::PADDING,
                reason: "out of data",
            })?;
        let err = |reason| IterErr { ty, reason };
        let unexpected_end = |_: UnexpectedEnd| IterErr {
            ty,
            reason: "unexpected end of packet",
        };
        Ok(match ty {
            FrameType::PADDING => Frame::Padding,
            FrameType::PING => Frame::Ping,
            FrameType::ACK | FrameType::ACK_ECN | FrameType::ACK_RECEIVE_TIMESTAMPS => {
                let largest = self.bytes.get_var().map_err(unexpected_end)?;
                let delay = self.bytes.get_var().map_err(unexpected_end)?;
                let extra = self.bytes.get_var().map_err(unexpected_end)?;
                // Validate the range section and find its length without
                // copying; `Ack::iter` re-walks it lazily.
                let mut scratch = self.bytes.clone();
                let first_size = (&mut scratch).get_var().map_err(unexpected_end)?;
                if first_size > largest {
                    return Err(err("ACK range exceeds largest acknowledged"));
                }
                let mut smallest = largest - first_size;
                for _ in 0..extra {
                    let gap = (&mut scratch).get_var().map_err(unexpected_end)?;
                    let size = (&mut scratch).get_var().map_err(unexpected_end)?;
                    smallest = smallest
                        .checked_sub(gap + 2)
                        .and_then(|x| x.checked_sub(size))
                        .ok_or(err("ACK range underflow"))?;
                }
                let len = self.bytes.remaining() - scratch.remaining();
                let additional = self.bytes.split_to(len);
                let ecn = if ty == FrameType::ACK_ECN {
                    Some(EcnCounts {
                        ect0: self.bytes.get_var().map_err(unexpected_end)?,
                        ect1: self.bytes.get_var().map_err(unexpected_end)?,
                        ce: self.bytes.get_var().map_err(unexpected_end)?,
                    })
                } else {
                    None
                };
                let timestamps = if ty == FrameType::ACK_RECEIVE_TIMESTAMPS {
                    Some(self.take_len().map_err(unexpected_end)?)
                } else {
                    None
                };
                Frame::Ack(Ack {
                    largest,
                    delay,
                    additional,
                    ecn,
                    timestamps,
                })
            }
            FrameType::RESET_STREAM | FrameType::RESET_STREAM_AT => {
                Frame::ResetStream(ResetStream {
                    id: self.bytes.get().map_err(unexpected_end)?,
                    error_code: self.bytes.get().map_err(unexpected_end)?,
                    final_size: self.bytes.get().map_err(unexpected_end)?,
                    reliable_size: if ty == FrameType::RESET_STREAM_AT {
                        Some(self.bytes.get().map_err(unexpected_end)?)
                    } else {
                        None
                    },
                })
            }
            FrameType::STOP_SENDING => Frame::StopSending(StopSending {
                id: self.bytes.get().map_err(unexpected_end)?,
                error_code: self.bytes.get().map_err(unexpected_end)?,
            }),
            FrameType::CRYPTO => Frame::Crypto(Crypto {
                offset: self.bytes.get_var().map_err(unexpected_end)?,
                data: self.take_len().map_err(unexpected_end)?,
            }),
            FrameType::NEW_TOKEN => Frame::NewToken {
                token: self.take_len().map_err(unexpected_end)?,
            },
            FrameType::MAX_DATA => Frame::MaxData(self.bytes.get().map_err(unexpected_end)?),
            FrameType::MAX_STREAM_DATA => Frame::MaxStreamData {
                id: self.bytes.get().map_err(unexpected_end)?,
                offset: self.bytes.get_var().map_err(unexpected_end)?,
            },
            FrameType::MAX_STREAMS_BIDI => Frame::MaxStreams {
                dir: Dir::Bi,
                count: self.bytes.get_var().map_err(unexpected_end)?,
            },
            FrameType::MAX_STREAMS_UNI => Frame::MaxStreams {
                dir: Dir::Uni,
                count: self.bytes.get_var().map_err(unexpected_end)?,
            },
            FrameType::DATA_BLOCKED => Frame::DataBlocked {
                offset: self.bytes.get_var().map_err(unexpected_end)?,
            },
            FrameType::STREAM_DATA_BLOCKED => Frame::StreamDataBlocked {
                id: self.bytes.get().map_err(unexpected_end)?,
                offset: self.bytes.get_var().map_err(unexpected_end)?,
            },
            FrameType::STREAMS_BLOCKED_BIDI => Frame::StreamsBlocked {
                dir: Dir::Bi,
                limit: self.bytes.get_var().map_err(unexpected_end)?,
            },
            FrameType::STREAMS_BLOCKED_UNI => Frame::StreamsBlocked {
                dir: Dir::Uni,
                limit: self.bytes.get_var().map_err(unexpected_end)?,
            },
            FrameType::NEW_CONNECTION_ID => {
                let sequence = self.bytes.get_var().map_err(unexpected_end)?;
                let retire_prior_to = self.bytes.get_var().map_err(unexpected_end)?;
                if retire_prior_to > sequence {
                    return Err(err("retire_prior_to exceeds sequence"));
                }
                let length = self.bytes.get::<u8>().map_err(unexpected_end)? as usize;
                if length > MAX_CID_SIZE || length == 0 {
                    return Err(err("connection ID length out of bounds"));
                }
                if self.bytes.remaining() < length {
                    return Err(unexpected_end(UnexpectedEnd));
                }
                let mut stage = [0; MAX_CID_SIZE];
                self.bytes.copy_to_slice(&mut stage[0..length]);
                let id = ConnectionId::new(&stage[..length]);
                if self.bytes.remaining() < RESET_TOKEN_SIZE {
                    return Err(unexpected_end(UnexpectedEnd));
                }
                let mut reset_token = [0; RESET_TOKEN_SIZE];
                self.bytes.copy_to_slice(&mut reset_token);
                Frame::NewConnectionId(NewConnectionId {
                    sequence,
                    retire_prior_to,
                    id,
                    reset_token,
                })
            }
            FrameType::RETIRE_CONNECTION_ID => Frame::RetireConnectionId {
                sequence: self.bytes.get_var().map_err(unexpected_end)?,
            },
            FrameType::PATH_CHALLENGE => {
                Frame::PathChallenge(self.bytes.get().map_err(unexpected_end)?)
            }
            FrameType::PATH_RESPONSE => {
                Frame::PathResponse(self.bytes.get().map_err(unexpected_end)?)
            }
            FrameType::CONNECTION_CLOSE => Frame::Close(Close::Connection(ConnectionClose {
                error_code: self.bytes.get().map_err(unexpected_end)?,
                frame_type: {
                    let x = self.bytes.get_var().map_err(unexpected_end)?;
                    if x == 0 {
                        None
                    } else {
                        Some(FrameType(x))
                    }
                },
                reason: self.take_len().map_err(unexpected_end)?,
            })),
            FrameType::APPLICATION_CLOSE => Frame::Close(Close::Application(ApplicationClose {
                error_code: self.bytes.get().map_err(unexpected_end)?,
                reason: self.take_len().map_err(unexpected_end)?,
            })),
            FrameType::HANDSHAKE_DONE => Frame::HandshakeDone,
            FrameType::KNOB => Frame::Knob(Knob {
                space: self.bytes.get_var().map_err(unexpected_end)?,
                id: self.bytes.get_var().map_err(unexpected_end)?,
                payload: self.take_len().map_err(unexpected_end)?,
            }),
            _ => {
                if let Some(s) = ty.stream() {
                    Frame::Stream(Stream {
                        id: self.bytes.get().map_err(unexpected_end)?,
                        offset: if s.off() {
                            self.bytes.get_var().map_err(unexpected_end)?
                        } else {
                            0
                        },
                        fin: s.fin(),
                        data: if s.len() {
                            self.take_len().map_err(unexpected_end)?
                        } else {
                            mem::take(&mut self.bytes)
                        },
                    })
                } else if let Some(d) = ty.datagram() {
                    Frame::Datagram(Datagram {
                        data: if d.len() {
                            self.take_len().map_err(unexpected_end)?
                        } else {
                            mem::take(&mut self.bytes)
                        },
                    })
                } else {
                    return Err(err("unknown frame type"));
                }
            }
        })
    }
}

impl Iterator for Iter {
    type Item = Result<Frame, IterErr>;
    fn next(&mut self) -> Option<Self::Item> {
        if !self.bytes.has_remaining() {
            return None;
        }
        match self.try_next() {
            Ok(x) => Some(Ok(x)),
            Err(e) => {
                // Corrupt frame, stop parsing the rest of the packet
                self.bytes = Bytes::new();
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn frames(buf: Vec<u8>) -> Vec<Frame> {
        Iter::new(Bytes::from(buf))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn ack_roundtrip() {
        let mut ranges = RangeSet::new();
        ranges.insert(0..3);
        ranges.insert(5..6);
        ranges.insert(10..12);
        let mut buf = Vec::new();
        Ack::encode(7, &ranges, None, None, &mut buf);
        let decoded = frames(buf);
        assert_eq!(decoded.len(), 1);
        match decoded[0] {
            Frame::Ack(ref ack) => {
                assert_eq!(ack.largest, 11);
                assert_eq!(ack.delay, 7);
                let mut actual = RangeSet::new();
                for range in ack.iter() {
                    actual.insert(range);
                }
                assert_eq!(actual, ranges);
            }
            ref x => panic!("unexpected frame {x:?}"),
        }
    }

    #[test]
    fn reset_stream_at_roundtrip() {
        let frame = ResetStream {
            id: StreamId::new(crate::Side::Client, Dir::Bi, 3),
            error_code: VarInt::from_u32(17),
            final_size: VarInt::from_u32(1000),
            reliable_size: Some(VarInt::from_u32(50)),
        };
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        assert_matches!(
            frames(buf)[0],
            Frame::ResetStream(ResetStream {
                reliable_size: Some(x),
                ..
            }) if x == VarInt::from_u32(50)
        );
    }

    #[test]
    fn knob_roundtrip() {
        let frame = Knob {
            space: 0xface,
            id: 2,
            payload: Bytes::from_static(b"\x01"),
        };
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        assert_matches!(frames(buf)[0], Frame::Knob(ref k) if k.space == 0xface && k.id == 2);
    }

    #[test]
    fn stream_implicit_length() {
        let mut buf = Vec::new();
        buf.write_var(0x08 | 0x04); // offset bit, no length bit
        StreamId::new(crate::Side::Server, Dir::Uni, 1).encode(&mut buf);
        buf.write_var(42);
        buf.extend_from_slice(b"hello");
        match &frames(buf)[0] {
            Frame::Stream(s) => {
                assert_eq!(s.offset, 42);
                assert_eq!(&s.data[..], b"hello");
                assert!(!s.fin);
            }
            x => panic!("unexpected frame {x:?}"),
        }
    }

    #[test]
    fn malformed_ack_rejected() {
        let mut buf = Vec::new();
        FrameType::ACK.encode(&mut buf);
        buf.write_var(5); // largest
        buf.write_var(0); // delay
        buf.write_var(0); // extra range count
        buf.write_var(10); // first range larger than largest
        let result: Result<Vec<_>, _> = Iter::new(Bytes::from(buf)).unwrap().collect();
        assert!(result.is_err());
    }

    #[test]
    fn empty_payload_rejected() {
        assert!(Iter::new(Bytes::new()).is_err());
    }
}
