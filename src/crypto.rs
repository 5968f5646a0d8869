//! Traits abstracting the cryptographic protocol driving a connection
//!
//! The connection engine never touches TLS record internals or AEAD
//! primitives directly. A [`Session`] feeds on CRYPTO stream bytes and hands
//! back packet protection keys as the handshake advances; [`PacketKey`] and
//! [`HeaderKey`] seal and open individual packets. Implementations are
//! expected to wrap a real TLS 1.3 stack; tests use scripted stand-ins.

use std::fmt;

use bytes::BytesMut;

use crate::{
    packet::{ConnectionId, EncryptionLevel},
    transport_error::TransportError,
    transport_parameters::ServerParameters,
    Side,
};

/// A cryptographic session driving the handshake for one connection
pub trait Session: Send {
    /// Create the packet protection keys for Initial packets, derived from
    /// `dst_cid`
    fn initial_keys(&self, dst_cid: &ConnectionId, side: Side) -> Keys;

    /// Feed `data` received in a CRYPTO frame at `level` into the handshake
    ///
    /// Implementations buffer partial records internally.
    fn read_handshake(
        &mut self,
        level: EncryptionLevel,
        data: &[u8],
    ) -> Result<(), TransportError>;

    /// Append handshake bytes to transmit at the current write level
    ///
    /// Returns new keys when the handshake has advanced a level; the caller
    /// tracks write levels by counting key changes.
    fn write_handshake(&mut self, buf: &mut Vec<u8>) -> Option<KeyChange>;

    /// Whether the handshake has completed from the crypto layer's view
    fn is_handshaking(&self) -> bool;

    /// The peer's transport parameters, once its first flight has arrived
    fn peer_params(&self) -> Result<Option<ServerParameters>, TransportError>;

    /// 0-RTT packet protection keys, if resumption state permits early data
    fn early_keys(&self) -> Option<DirectionalKeys>;

    /// Whether the peer accepted the 0-RTT data this session offered
    ///
    /// `None` until the handshake has progressed far enough to know.
    fn early_data_accepted(&self) -> Option<bool>;

    /// Derive the successor 1-RTT write key from the current write secret
    fn next_1rtt_write_key(&mut self) -> Box<dyn PacketKey>;

    /// Derive the successor 1-RTT read key from the current read secret
    fn next_1rtt_read_key(&mut self) -> Box<dyn PacketKey>;

    /// Verify the integrity tag of a Retry packet against the connection's
    /// original destination CID
    fn is_valid_retry(&self, orig_dst_cid: &ConnectionId, header: &[u8], payload: &[u8]) -> bool;
}

/// A key change yielded by [`Session::write_handshake`]
pub enum KeyChange {
    /// Handshake keys are ready
    Handshake {
        /// The new keys
        keys: Keys,
    },
    /// 1-RTT keys are ready
    OneRtt {
        /// The new keys
        keys: Keys,
    },
}

impl fmt::Debug for KeyChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handshake { .. } => f.debug_struct("Handshake").finish_non_exhaustive(),
            Self::OneRtt { .. } => f.debug_struct("OneRtt").finish_non_exhaustive(),
        }
    }
}

/// A complete set of keys for a certain encryption level
pub struct Keys {
    /// Header protection keys
    pub header: KeyPair<Box<dyn HeaderKey>>,
    /// Packet protection keys
    pub packet: KeyPair<Box<dyn PacketKey>>,
}

/// A pair of keys for bidirectional communication
pub struct KeyPair<T> {
    /// Key for encrypting data
    pub local: T,
    /// Key for decrypting data
    pub remote: T,
}

/// Keys for one direction only, as installed for 0-RTT writes
pub struct DirectionalKeys {
    /// Header protection key
    pub header: Box<dyn HeaderKey>,
    /// Packet protection key
    pub packet: Box<dyn PacketKey>,
}

impl fmt::Debug for DirectionalKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectionalKeys").finish_non_exhaustive()
    }
}

/// Keys used to protect packet headers
pub trait HeaderKey: Send {
    /// Decrypt the given packet's header
    fn decrypt(&self, pn_offset: usize, packet: &mut [u8]);
    /// Encrypt the given packet's header
    fn encrypt(&self, pn_offset: usize, packet: &mut [u8]);
    /// The sample size used for this key's algorithm
    fn sample_size(&self) -> usize;
}

/// Keys used to protect packet payloads
pub trait PacketKey: Send {
    /// Encrypt the packet payload with the given packet number
    ///
    /// `buf` contains the header followed by the plaintext payload, with
    /// `tag_len` spare bytes at the end for the tag.
    fn encrypt(&self, packet: u64, buf: &mut [u8], header_len: usize);
    /// Decrypt the packet payload with the given packet number
    fn decrypt(
        &self,
        packet: u64,
        header: &[u8],
        payload: &mut BytesMut,
    ) -> Result<(), CryptoError>;
    /// The length of the AEAD tag appended to packets on encryption
    fn tag_len(&self) -> usize;
}

/// Generic crypto errors
///
/// Deliberately opaque: decrypt failures cause the offending packet to be
/// dropped, never surfaced to the peer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CryptoError;

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted crypto for driving the engine deterministically in tests

    use super::*;

    /// Appends/expects an all-zero 16 byte "tag"; no actual protection
    pub(crate) struct NullPacketKey;

    impl PacketKey for NullPacketKey {
        fn encrypt(&self, _packet: u64, buf: &mut [u8], _header_len: usize) {
            let len = buf.len();
            buf[len - 16..].fill(0);
        }

        fn decrypt(
            &self,
            _packet: u64,
            _header: &[u8],
            payload: &mut BytesMut,
        ) -> Result<(), CryptoError> {
            if payload.len() < 16 || payload[payload.len() - 16..].iter().any(|&b| b != 0) {
                return Err(CryptoError);
            }
            let plain = payload.len() - 16;
            payload.truncate(plain);
            Ok(())
        }

        fn tag_len(&self) -> usize {
            16
        }
    }

    pub(crate) struct NullHeaderKey;

    impl HeaderKey for NullHeaderKey {
        fn decrypt(&self, _pn_offset: usize, _packet: &mut [u8]) {}
        fn encrypt(&self, _pn_offset: usize, _packet: &mut [u8]) {}
        fn sample_size(&self) -> usize {
            16
        }
    }

    pub(crate) fn null_keys() -> Keys {
        Keys {
            header: KeyPair {
                local: Box::new(NullHeaderKey),
                remote: Box::new(NullHeaderKey),
            },
            packet: KeyPair {
                local: Box::new(NullPacketKey),
                remote: Box::new(NullPacketKey),
            },
        }
    }

    /// Client-side scripted handshake:
    ///
    /// 1. `write_handshake` emits a hello at the Initial level
    /// 2. after the "server flight" arrives at the Initial level,
    ///    `write_handshake` yields handshake keys
    /// 3. after the "server finished" arrives at the Handshake level,
    ///    `write_handshake` yields 1-RTT keys and the configured peer
    ///    parameters become visible
    pub(crate) struct ScriptedSession {
        pub(crate) params: Option<ServerParameters>,
        pub(crate) offer_early_data: bool,
        pub(crate) accept_early_data: bool,
        state: u8,
        hello_sent: bool,
        finished: bool,
    }

    impl ScriptedSession {
        pub(crate) fn new(params: ServerParameters) -> Self {
            Self {
                params: Some(params),
                offer_early_data: false,
                accept_early_data: false,
                state: 0,
                hello_sent: false,
                finished: false,
            }
        }
    }

    impl Session for ScriptedSession {
        fn initial_keys(&self, _dst_cid: &ConnectionId, _side: Side) -> Keys {
            null_keys()
        }

        fn read_handshake(
            &mut self,
            level: EncryptionLevel,
            _data: &[u8],
        ) -> Result<(), TransportError> {
            match (self.state, level) {
                (0, EncryptionLevel::Initial) => self.state = 1,
                (2, EncryptionLevel::Handshake) => {
                    self.state = 3;
                    self.finished = true;
                }
                _ => {}
            }
            Ok(())
        }

        fn write_handshake(&mut self, buf: &mut Vec<u8>) -> Option<KeyChange> {
            if !self.hello_sent {
                self.hello_sent = true;
                buf.extend_from_slice(b"hello");
                return None;
            }
            match self.state {
                1 => {
                    self.state = 2;
                    Some(KeyChange::Handshake { keys: null_keys() })
                }
                3 => {
                    self.state = 4;
                    buf.extend_from_slice(b"finished");
                    Some(KeyChange::OneRtt { keys: null_keys() })
                }
                _ => None,
            }
        }

        fn is_handshaking(&self) -> bool {
            !self.finished
        }

        fn peer_params(&self) -> Result<Option<ServerParameters>, TransportError> {
            if self.state >= 3 {
                Ok(self.params.clone())
            } else {
                Ok(None)
            }
        }

        fn early_keys(&self) -> Option<DirectionalKeys> {
            if self.offer_early_data {
                Some(DirectionalKeys {
                    header: Box::new(NullHeaderKey),
                    packet: Box::new(NullPacketKey),
                })
            } else {
                None
            }
        }

        fn early_data_accepted(&self) -> Option<bool> {
            if self.state >= 3 && self.offer_early_data {
                Some(self.accept_early_data)
            } else {
                None
            }
        }

        fn next_1rtt_write_key(&mut self) -> Box<dyn PacketKey> {
            Box::new(NullPacketKey)
        }

        fn next_1rtt_read_key(&mut self) -> Box<dyn PacketKey> {
            Box::new(NullPacketKey)
        }

        fn is_valid_retry(
            &self,
            _orig_dst_cid: &ConnectionId,
            _header: &[u8],
            _payload: &[u8],
        ) -> bool {
            true
        }
    }
}
