use std::{fmt, ops::Deref};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::{Rng, RngCore};

use crate::{
    coding::{self, BufExt, BufMutExt},
    MAX_CID_SIZE,
};

/// Protocol-level identifier for a connection.
///
/// Mainly useful for identifying this connection's packets on the wire, but
/// the original destination CID also seeds the initial packet protection keys.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId {
    /// length of CID
    len: u8,
    /// CID in byte array
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    /// Construct cid from byte array
    pub fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= MAX_CID_SIZE);
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    /// Generate a random cid of `len` bytes
    pub fn random<R: Rng>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut res = Self {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        rng.fill_bytes(&mut res.bytes[..len]);
        res
    }

    pub(crate) fn encode_long<W: BufMut>(&self, buf: &mut W) {
        buf.put_u8(self.len);
        buf.put_slice(self);
    }

    pub(crate) fn decode_long<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        let len = buf.get::<u8>()? as usize;
        if len > MAX_CID_SIZE || buf.remaining() < len {
            return Err(coding::UnexpectedEnd);
        }
        let mut stage = [0; MAX_CID_SIZE];
        buf.copy_to_slice(&mut stage[..len]);
        Ok(Self::new(&stage[..len]))
    }
}

impl Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[0..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.bytes[0..self.len as usize].fmt(f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Packet number space identifiers
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum SpaceId {
    /// Unprotected packets, used to bootstrap the handshake
    Initial = 0,
    /// Packets protected by handshake keys
    Handshake = 1,
    /// Application data space, protected by 0-RTT or 1-RTT keys
    Data = 2,
}

impl SpaceId {
    pub(crate) fn iter() -> impl DoubleEndedIterator<Item = Self> {
        [Self::Initial, Self::Handshake, Self::Data].iter().cloned()
    }
}

/// The protection level a packet was (or will be) sealed at
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EncryptionLevel {
    /// Keys derived from the original destination connection ID
    Initial,
    /// Client early data keys
    ZeroRtt,
    /// Keys available once the TLS handshake keys are negotiated
    Handshake,
    /// Full application data protection
    OneRtt,
}

impl EncryptionLevel {
    /// The packet number space packets at this level are numbered in
    pub fn space(self) -> SpaceId {
        match self {
            Self::Initial => SpaceId::Initial,
            Self::Handshake => SpaceId::Handshake,
            Self::ZeroRtt | Self::OneRtt => SpaceId::Data,
        }
    }
}

/// Long header packet types
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum LongType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

impl LongType {
    fn from_bits(b: u8) -> Self {
        match (b & 0x30) >> 4 {
            0 => Self::Initial,
            1 => Self::ZeroRtt,
            2 => Self::Handshake,
            3 => Self::Retry,
            _ => unreachable!(),
        }
    }

    fn to_bits(self) -> u8 {
        let x = match self {
            Self::Initial => 0,
            Self::ZeroRtt => 1,
            Self::Handshake => 2,
            Self::Retry => 3,
        };
        x << 4
    }
}

/// Decoded packet header, before packet number recovery
#[derive(Debug, Clone)]
pub(crate) enum Header {
    Initial {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token: Bytes,
        version: u32,
    },
    Long {
        ty: LongType,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        version: u32,
    },
    Retry {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        version: u32,
    },
    Short {
        dst_cid: ConnectionId,
        key_phase: bool,
    },
}

impl Header {
    pub(crate) fn level(&self) -> EncryptionLevel {
        use Header::*;
        match *self {
            Initial { .. } => EncryptionLevel::Initial,
            Long {
                ty: LongType::ZeroRtt,
                ..
            } => EncryptionLevel::ZeroRtt,
            Long { .. } | Retry { .. } => EncryptionLevel::Handshake,
            Short { .. } => EncryptionLevel::OneRtt,
        }
    }

    pub(crate) fn dst_cid(&self) -> &ConnectionId {
        use Header::*;
        match *self {
            Initial { ref dst_cid, .. }
            | Long { ref dst_cid, .. }
            | Retry { ref dst_cid, .. }
            | Short { ref dst_cid, .. } => dst_cid,
        }
    }

    pub(crate) fn src_cid(&self) -> Option<&ConnectionId> {
        use Header::*;
        match *self {
            Initial { ref src_cid, .. } | Long { ref src_cid, .. } | Retry { ref src_cid, .. } => {
                Some(src_cid)
            }
            Short { .. } => None,
        }
    }

    pub(crate) fn is_retry(&self) -> bool {
        matches!(*self, Self::Retry { .. })
    }
}

/// A packet number, encoded to the minimum length that remains unambiguous
/// given the receiver's expected next packet number
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum PacketNumber {
    U8(u8),
    U16(u16),
    U24(u32),
    U32(u32),
}

impl PacketNumber {
    pub(crate) fn new(n: u64, largest_acked: u64) -> Self {
        // From Appendix A of the spec:
        // The sender MUST use a packet number size able to represent more than
        // twice as large a range than the difference between the largest
        // acknowledged packet and packet number being sent.
        let range = (n - largest_acked) * 2;
        if range < 1 << 8 {
            Self::U8(n as u8)
        } else if range < 1 << 16 {
            Self::U16(n as u16)
        } else if range < 1 << 24 {
            Self::U24(n as u32)
        } else if range < 1 << 32 {
            Self::U32(n as u32)
        } else {
            panic!("packet number too large to encode")
        }
    }

    pub(crate) fn len(self) -> usize {
        use PacketNumber::*;
        match self {
            U8(_) => 1,
            U16(_) => 2,
            U24(_) => 3,
            U32(_) => 4,
        }
    }

    pub(crate) fn encode<W: BufMut>(self, w: &mut W) {
        use PacketNumber::*;
        match self {
            U8(x) => w.write(x),
            U16(x) => w.write(x),
            U24(x) => w.put_uint(u64::from(x), 3),
            U32(x) => w.write(x),
        }
    }

    pub(crate) fn decode<R: Buf>(len: usize, r: &mut R) -> coding::Result<Self> {
        use PacketNumber::*;
        if r.remaining() < len {
            return Err(coding::UnexpectedEnd);
        }
        Ok(match len {
            1 => U8(r.get_u8()),
            2 => U16(r.get_u16()),
            3 => U24(r.get_uint(3) as u32),
            4 => U32(r.get_u32()),
            _ => unreachable!("illegal packet number length"),
        })
    }

    /// Recover the full packet number given the expected next value
    pub(crate) fn expand(self, expected: u64) -> u64 {
        use PacketNumber::*;
        let truncated = match self {
            U8(x) => u64::from(x),
            U16(x) => u64::from(x),
            U24(x) => u64::from(x),
            U32(x) => u64::from(x),
        };
        let nbits = self.len() as u64 * 8;
        let win = 1 << nbits;
        let hwin = win / 2;
        let mask = win - 1;
        // The incoming packet number should be greater than expected - hwin and less than or equal
        // to expected + hwin
        //
        // This means we can't just strip the trailing bits from expected and add the truncated
        // because that might yield a value outside the window.
        let candidate = (expected & !mask) | truncated;
        if expected.checked_sub(hwin).map_or(false, |x| candidate <= x) {
            candidate + win
        } else if candidate > expected + hwin && candidate >= win {
            candidate - win
        } else {
            candidate
        }
    }
}

/// Reasons a datagram (or one packet inside it) could not be parsed
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum HeaderError {
    /// The buffer ended inside a header field
    Truncated,
    /// A version this endpoint does not speak
    UnsupportedVersion,
    /// Header flags or lengths out of range
    Malformed,
}

/// One coalesced packet split out of a UDP datagram, header parsed but packet
/// number still protected
#[derive(Debug)]
pub(crate) struct PartialDecode {
    pub(crate) header: Header,
    /// Length of the header through the end of the packet-number-less prefix
    pub(crate) header_len: usize,
    /// Complete packet: header plus protected payload
    pub(crate) data: BytesMut,
}

impl PartialDecode {
    /// Split the first packet off `datagram`, returning it and any coalesced
    /// remainder
    pub(crate) fn new(
        mut datagram: BytesMut,
        local_cid_len: usize,
    ) -> Result<(Self, Option<BytesMut>), HeaderError> {
        let buf = &datagram[..];
        if buf.is_empty() {
            return Err(HeaderError::Truncated);
        }
        let first = buf[0];
        if first & 0x80 != 0 {
            Self::new_long(datagram)
        } else {
            // Short headers extend to the end of the datagram; nothing can be
            // coalesced after them.
            if buf.len() < 1 + local_cid_len {
                return Err(HeaderError::Truncated);
            }
            let dst_cid = ConnectionId::new(&buf[1..1 + local_cid_len]);
            let key_phase = first & 0x04 != 0;
            let header_len = 1 + local_cid_len;
            let data = datagram;
            Ok((
                Self {
                    header: Header::Short { dst_cid, key_phase },
                    header_len,
                    data,
                },
                None,
            ))
        }
    }

    fn new_long(mut datagram: BytesMut) -> Result<(Self, Option<BytesMut>), HeaderError> {
        let mut buf = &datagram[..];
        let total = buf.len();
        let first = BufExt::get::<u8>(&mut buf).map_err(|_| HeaderError::Truncated)?;
        let version = BufExt::get::<u32>(&mut buf).map_err(|_| HeaderError::Truncated)?;
        if !crate::is_v1_like(version) {
            return Err(HeaderError::UnsupportedVersion);
        }
        let dst_cid = ConnectionId::decode_long(&mut buf).map_err(|_| HeaderError::Truncated)?;
        let src_cid = ConnectionId::decode_long(&mut buf).map_err(|_| HeaderError::Truncated)?;
        let ty = LongType::from_bits(first);
        match ty {
            LongType::Retry => {
                // Retry packets consume the rest of the datagram; the
                // integrity tag is validated by the crypto seam.
                let header_len = total - buf.remaining();
                let data = datagram;
                Ok((
                    Self {
                        header: Header::Retry {
                            dst_cid,
                            src_cid,
                            version,
                        },
                        header_len,
                        data,
                    },
                    None,
                ))
            }
            LongType::Initial => {
                let token_len = buf.get_var().map_err(|_| HeaderError::Malformed)?;
                if token_len > buf.remaining() as u64 {
                    return Err(HeaderError::Truncated);
                }
                let token_start = total - buf.remaining();
                buf.advance(token_len as usize);
                let token_end = total - buf.remaining();
                let len = buf.get_var().map_err(|_| HeaderError::Malformed)?;
                if len > buf.remaining() as u64 {
                    return Err(HeaderError::Truncated);
                }
                let header_len = total - buf.remaining();
                let packet_end = header_len + len as usize;
                let token = Bytes::copy_from_slice(&datagram[token_start..token_end]);
                let data = datagram.split_to(packet_end);
                let rest = if datagram.is_empty() {
                    None
                } else {
                    Some(datagram)
                };
                Ok((
                    Self {
                        header: Header::Initial {
                            dst_cid,
                            src_cid,
                            token,
                            version,
                        },
                        header_len,
                        data,
                    },
                    rest,
                ))
            }
            LongType::Handshake | LongType::ZeroRtt => {
                let len = buf.get_var().map_err(|_| HeaderError::Malformed)?;
                if len > buf.remaining() as u64 {
                    return Err(HeaderError::Truncated);
                }
                let header_len = total - buf.remaining();
                let packet_end = header_len + len as usize;
                let data = datagram.split_to(packet_end);
                let rest = if datagram.is_empty() {
                    None
                } else {
                    Some(datagram)
                };
                Ok((
                    Self {
                        header: Header::Long {
                            ty,
                            dst_cid,
                            src_cid,
                            version,
                        },
                        header_len,
                        data,
                    },
                    rest,
                ))
            }
        }
    }
}

/// Writes a long or short header for an outgoing packet, leaving the length
/// field of long headers to be patched once the payload size is known
pub(crate) struct HeaderBuilder;

impl HeaderBuilder {
    /// Returns (pn_offset, length_field_offset)
    pub(crate) fn encode(
        level: EncryptionLevel,
        dst_cid: &ConnectionId,
        src_cid: &ConnectionId,
        version: u32,
        token: &[u8],
        number: PacketNumber,
        key_phase: bool,
        buf: &mut Vec<u8>,
    ) -> (usize, Option<usize>) {
        use EncryptionLevel::*;
        match level {
            OneRtt => {
                let mut first = 0x40 | (number.len() as u8 - 1);
                if key_phase {
                    first |= 0x04;
                }
                buf.put_u8(first);
                buf.put_slice(dst_cid);
                let pn_offset = buf.len();
                number.encode(buf);
                (pn_offset, None)
            }
            Initial | ZeroRtt | Handshake => {
                let ty = match level {
                    Initial => LongType::Initial,
                    ZeroRtt => LongType::ZeroRtt,
                    Handshake => LongType::Handshake,
                    OneRtt => unreachable!(),
                };
                let first = 0x80 | 0x40 | ty.to_bits() | (number.len() as u8 - 1);
                buf.put_u8(first);
                buf.write(version);
                dst_cid.encode_long(buf);
                src_cid.encode_long(buf);
                if let Initial = level {
                    buf.write_var(token.len() as u64);
                    buf.put_slice(token);
                }
                let len_offset = buf.len();
                // Two-byte varint placeholder, patched in `finish_packet`
                buf.put_u16(0b01 << 14);
                let pn_offset = buf.len();
                number.encode(buf);
                (pn_offset, Some(len_offset))
            }
        }
    }

    /// Patch a long header's length field: packet number plus payload plus tag
    pub(crate) fn patch_length(buf: &mut [u8], len_offset: usize, pn_offset: usize) {
        let len = buf.len() - pn_offset;
        debug_assert!(len < (1 << 14), "packet too large for two-byte length");
        buf[len_offset] = 0b0100_0000 | (len >> 8) as u8;
        buf[len_offset + 1] = len as u8;
    }
}
