//! Peer transport parameter ingestion
//!
//! The handshake provider surfaces the server's transport parameters as an
//! opaque list of (id, value) pairs; this module validates them against the
//! rules of the specification and flattens them into the records the engine
//! consumes: [`PeerParams`] for a live connection and
//! [`CachedServerParameters`] for resumption.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes};

use crate::{
    coding::{BufExt, BufMutExt},
    config::TransportConfig,
    packet::ConnectionId,
    transport_error::TransportError,
    DATAGRAM_OVERHEAD, DEFAULT_UDP_PAYLOAD_SIZE, MAX_ACK_DELAY_EXPONENT, MAX_CID_SIZE,
    MIN_UDP_PAYLOAD_SIZE, RESET_TOKEN_SIZE,
};

/// Identifies a transport parameter on the wire
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct TransportParameterId(pub u64);

macro_rules! parameter_ids {
    {$($name:ident = $val:expr,)*} => {
        impl TransportParameterId {
            $(pub(crate) const $name: Self = Self($val);)*
        }
    }
}

parameter_ids! {
    ORIGINAL_DESTINATION_CONNECTION_ID = 0x00,
    MAX_IDLE_TIMEOUT = 0x01,
    STATELESS_RESET_TOKEN = 0x02,
    MAX_UDP_PAYLOAD_SIZE = 0x03,
    INITIAL_MAX_DATA = 0x04,
    INITIAL_MAX_STREAM_DATA_BIDI_LOCAL = 0x05,
    INITIAL_MAX_STREAM_DATA_BIDI_REMOTE = 0x06,
    INITIAL_MAX_STREAM_DATA_UNI = 0x07,
    INITIAL_MAX_STREAMS_BIDI = 0x08,
    INITIAL_MAX_STREAMS_UNI = 0x09,
    ACK_DELAY_EXPONENT = 0x0a,
    MAX_ACK_DELAY = 0x0b,
    DISABLE_ACTIVE_MIGRATION = 0x0c,
    ACTIVE_CONNECTION_ID_LIMIT = 0x0e,
    INITIAL_SOURCE_CONNECTION_ID = 0x0f,
    RETRY_SOURCE_CONNECTION_ID = 0x10,
    // RFC 9221
    MAX_DATAGRAM_FRAME_SIZE = 0x20,
    // draft-ietf-quic-delayed-ack
    MIN_ACK_DELAY = 0xff02_de1a,
    // draft-ietf-quic-reliable-stream-reset; value must be empty
    RELIABLE_STREAM_RESET = 0x17f7_586d_2cb5_71,
    // Extensions negotiated out of band with compatible peers
    KNOB_FRAMES_SUPPORTED = 0x1551,
    STREAM_GROUPS_ENABLED = 0xff0b_001,
    ACK_RECEIVE_TIMESTAMPS_ENABLED = 0xff0a_001,
    MAX_RECEIVE_TIMESTAMPS_PER_ACK = 0xff0a_002,
    RECEIVE_TIMESTAMPS_EXPONENT = 0xff0a_003,
    EXTENDED_ACK_FEATURES = 0xff0a_004,
}

/// A single raw transport parameter
#[derive(Debug, Clone)]
pub struct TransportParameter {
    /// Wire identifier
    pub id: TransportParameterId,
    /// Undecoded value
    pub value: Bytes,
}

/// The server's transport parameters as delivered by the handshake provider
#[derive(Debug, Clone, Default)]
pub struct ServerParameters {
    /// Parameters in wire order; unknown ids are retained and ignored
    pub parameters: Vec<TransportParameter>,
}

impl ServerParameters {
    /// Decode a TLS-extension-style sequence of (id, length, value) records
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, TransportError> {
        let mut parameters = Vec::new();
        while buf.has_remaining() {
            let malformed =
                || TransportError::TRANSPORT_PARAMETER_ERROR("malformed transport parameters");
            let id = buf.get_var().map_err(|_| malformed())?;
            let len = buf.get_var().map_err(|_| malformed())?;
            if len > buf.remaining() as u64 {
                return Err(malformed());
            }
            let value = buf.copy_to_bytes(len as usize);
            parameters.push(TransportParameter {
                id: TransportParameterId(id),
                value,
            });
        }
        Ok(Self { parameters })
    }

    /// Encode in the same wire shape `decode` accepts
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        for param in &self.parameters {
            buf.write_var(param.id.0);
            buf.write_var(param.value.len() as u64);
            buf.put_slice(&param.value);
        }
    }

    fn find(&self, id: TransportParameterId) -> Option<&TransportParameter> {
        self.parameters.iter().find(|p| p.id == id)
    }

    /// Decode an integer-valued parameter; absent is `None`, malformed is an
    /// error
    fn integer(&self, id: TransportParameterId) -> Result<Option<u64>, TransportError> {
        let param = match self.find(id) {
            Some(x) => x,
            None => return Ok(None),
        };
        let mut buf = &param.value[..];
        let value = buf.get_var().map_err(|_| {
            TransportError::TRANSPORT_PARAMETER_ERROR("malformed integer parameter")
        })?;
        if buf.has_remaining() {
            return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                "trailing bytes in integer parameter",
            ));
        }
        Ok(Some(value))
    }

    fn cid(&self, id: TransportParameterId) -> Result<Option<ConnectionId>, TransportError> {
        let param = match self.find(id) {
            Some(x) => x,
            None => return Ok(None),
        };
        if param.value.len() > MAX_CID_SIZE {
            return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                "connection ID parameter too long",
            ));
        }
        Ok(Some(ConnectionId::new(&param.value)))
    }

    //
    // Test/builder conveniences
    //

    /// Append an integer-valued parameter
    pub fn push_int(&mut self, id: TransportParameterId, value: u64) -> &mut Self {
        let mut buf = Vec::new();
        buf.write_var(value);
        self.parameters.push(TransportParameter {
            id,
            value: buf.into(),
        });
        self
    }

    /// Append an arbitrary-valued parameter
    pub fn push_bytes(&mut self, id: TransportParameterId, value: impl Into<Bytes>) -> &mut Self {
        self.parameters.push(TransportParameter {
            id,
            value: value.into(),
        });
        self
    }

    /// Append a connection-ID-valued parameter
    pub fn push_cid(&mut self, id: TransportParameterId, cid: &ConnectionId) -> &mut Self {
        self.push_bytes(id, Bytes::copy_from_slice(cid))
    }
}

/// Receive-timestamp extension settings agreed with the peer
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AckReceiveTimestampsConfig {
    /// How many timestamps an ACK may carry
    pub max_timestamps_per_ack: u64,
    /// Power-of-two scaling applied to timestamp deltas
    pub exponent: u64,
}

/// Everything the engine retains from the server's transport parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerParams {
    pub(crate) initial_max_data: u64,
    pub(crate) initial_max_stream_data_bidi_local: u64,
    pub(crate) initial_max_stream_data_bidi_remote: u64,
    pub(crate) initial_max_stream_data_uni: u64,
    pub(crate) initial_max_streams_bidi: u64,
    pub(crate) initial_max_streams_uni: u64,
    pub(crate) idle_timeout: Duration,
    pub(crate) ack_delay_exponent: u64,
    pub(crate) min_ack_delay: Option<Duration>,
    pub(crate) max_udp_payload_size: u16,
    pub(crate) stateless_reset_token: Option<[u8; RESET_TOKEN_SIZE]>,
    pub(crate) active_cid_limit: u64,
    pub(crate) max_datagram_frame_size: Option<u64>,
    pub(crate) max_stream_groups: u64,
    pub(crate) knob_frames_supported: bool,
    pub(crate) reliable_stream_reset: bool,
    pub(crate) extended_ack_features: u64,
    pub(crate) ack_receive_timestamps: Option<AckReceiveTimestampsConfig>,
}

impl Default for PeerParams {
    /// Protocol defaults, used for each parameter the peer omits
    fn default() -> Self {
        Self {
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            idle_timeout: Duration::ZERO,
            ack_delay_exponent: 3,
            min_ack_delay: None,
            max_udp_payload_size: DEFAULT_UDP_PAYLOAD_SIZE,
            stateless_reset_token: None,
            active_cid_limit: 2,
            max_datagram_frame_size: None,
            max_stream_groups: 0,
            knob_frames_supported: false,
            reliable_stream_reset: false,
            extended_ack_features: 0,
            ack_receive_timestamps: None,
        }
    }
}

impl PeerParams {
    /// Validate and flatten the server's parameters
    ///
    /// `server_cid` is the source CID observed on the server's Initial
    /// packets and `orig_dst_cid` the destination CID the client's first
    /// Initial was sent to; both must be echoed for v1-family versions.
    pub(crate) fn from_server_params(
        version: u32,
        server_cid: &ConnectionId,
        orig_dst_cid: &ConnectionId,
        params: &ServerParameters,
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        use TransportParameterId as Id;
        let mut out = Self::default();

        if let Some(reliable_reset) = params.find(Id::RELIABLE_STREAM_RESET) {
            if !reliable_reset.value.is_empty() {
                return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                    "Reliable reset transport parameter must be empty",
                ));
            }
            out.reliable_stream_reset = true;
        }

        if crate::is_v1_like(version) {
            let initial_source_cid = params.cid(Id::INITIAL_SOURCE_CONNECTION_ID)?;
            let original_destination_cid = params.cid(Id::ORIGINAL_DESTINATION_CONNECTION_ID)?;
            match (initial_source_cid, original_destination_cid) {
                (Some(src), Some(orig)) if src == *server_cid && orig == *orig_dst_cid => {}
                _ => {
                    return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                        "Initial CID does not match.",
                    ));
                }
            }
        }

        let mut max_udp_payload = params
            .integer(Id::MAX_UDP_PAYLOAD_SIZE)?
            .filter(|&x| x != 0)
            .unwrap_or(u64::from(DEFAULT_UDP_PAYLOAD_SIZE));
        if max_udp_payload < u64::from(MIN_UDP_PAYLOAD_SIZE) {
            return Err(TransportError::TRANSPORT_PARAMETER_ERROR(format!(
                "Max packet size too small. received max_packetSize = {max_udp_payload}"
            )));
        }
        max_udp_payload = max_udp_payload.min(u64::from(u16::MAX));
        out.max_udp_payload_size = max_udp_payload as u16;

        out.initial_max_data = params.integer(Id::INITIAL_MAX_DATA)?.unwrap_or(0);
        out.initial_max_stream_data_bidi_local = params
            .integer(Id::INITIAL_MAX_STREAM_DATA_BIDI_LOCAL)?
            .unwrap_or(0);
        out.initial_max_stream_data_bidi_remote = params
            .integer(Id::INITIAL_MAX_STREAM_DATA_BIDI_REMOTE)?
            .unwrap_or(0);
        out.initial_max_stream_data_uni = params
            .integer(Id::INITIAL_MAX_STREAM_DATA_UNI)?
            .unwrap_or(0);
        out.initial_max_streams_bidi = params.integer(Id::INITIAL_MAX_STREAMS_BIDI)?.unwrap_or(0);
        out.initial_max_streams_uni = params.integer(Id::INITIAL_MAX_STREAMS_UNI)?.unwrap_or(0);

        let idle_timeout = params.integer(Id::MAX_IDLE_TIMEOUT)?.unwrap_or(0);
        out.idle_timeout = Duration::from_millis(idle_timeout)
            .min(TransportConfig::MAX_IDLE_TIMEOUT);

        if let Some(exponent) = params.integer(Id::ACK_DELAY_EXPONENT)? {
            if exponent > MAX_ACK_DELAY_EXPONENT {
                return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                    "ack_delay_exponent too large",
                ));
            }
            out.ack_delay_exponent = exponent;
        }

        if let Some(delay) = params.integer(Id::MIN_ACK_DELAY)? {
            out.min_ack_delay = Some(Duration::from_micros(delay));
        }

        if let Some(token) = params.find(Id::STATELESS_RESET_TOKEN) {
            if token.value.len() != RESET_TOKEN_SIZE {
                return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                    "malformed stateless reset token",
                ));
            }
            let mut bytes = [0; RESET_TOKEN_SIZE];
            bytes.copy_from_slice(&token.value);
            out.stateless_reset_token = Some(bytes);
        }

        out.active_cid_limit = params
            .integer(Id::ACTIVE_CONNECTION_ID_LIMIT)?
            .unwrap_or(2);

        if let Some(size) = params.integer(Id::MAX_DATAGRAM_FRAME_SIZE)? {
            if size > 0 && size <= DATAGRAM_OVERHEAD {
                return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                    "max_datagram_frame_size too small",
                ));
            }
            out.max_datagram_frame_size = Some(size);
        }

        if let Some(groups) = params.integer(Id::STREAM_GROUPS_ENABLED)? {
            out.max_stream_groups = groups;
        }

        if params.integer(Id::ACK_RECEIVE_TIMESTAMPS_ENABLED)? == Some(1) {
            let max = params.integer(Id::MAX_RECEIVE_TIMESTAMPS_PER_ACK)?;
            let exponent = params.integer(Id::RECEIVE_TIMESTAMPS_EXPONENT)?;
            if let (Some(max), Some(exponent)) = (max, exponent) {
                out.ack_receive_timestamps = Some(AckReceiveTimestampsConfig {
                    max_timestamps_per_ack: max
                        .min(config.max_receive_timestamps_per_ack_stored),
                    exponent,
                });
            }
        }

        out.knob_frames_supported =
            params.integer(Id::KNOB_FRAMES_SUPPORTED)?.unwrap_or(0) > 0;
        out.extended_ack_features = params.integer(Id::EXTENDED_ACK_FEATURES)?.unwrap_or(0);

        Ok(out)
    }

    /// The payload budget for outgoing DATAGRAM frames, if the peer accepts
    /// them
    pub(crate) fn max_datagram_write_size(&self) -> Option<u64> {
        self.max_datagram_frame_size
            .map(|x| x.saturating_sub(DATAGRAM_OVERHEAD))
    }

    /// Snapshot the fields that survive across connections for resumption
    pub(crate) fn cache(&self) -> CachedServerParameters {
        CachedServerParameters {
            idle_timeout_millis: self.idle_timeout.as_millis() as u64,
            max_udp_payload_size: self.max_udp_payload_size,
            initial_max_data: self.initial_max_data,
            initial_max_stream_data_bidi_local: self.initial_max_stream_data_bidi_local,
            initial_max_stream_data_bidi_remote: self.initial_max_stream_data_bidi_remote,
            initial_max_stream_data_uni: self.initial_max_stream_data_uni,
            initial_max_streams_bidi: self.initial_max_streams_bidi,
            initial_max_streams_uni: self.initial_max_streams_uni,
            knob_frames_supported: self.knob_frames_supported,
            ack_receive_timestamps_enabled: self.ack_receive_timestamps.is_some(),
            max_receive_timestamps_per_ack: self
                .ack_receive_timestamps
                .map_or(0, |x| x.max_timestamps_per_ack),
            receive_timestamps_exponent: self.ack_receive_timestamps.map_or(0, |x| x.exponent),
            reliable_stream_reset: self.reliable_stream_reset,
            extended_ack_features: self.extended_ack_features,
        }
    }

    /// Seed a fresh connection's parameters from a resumption record so
    /// 0-RTT writes can proceed before the handshake completes
    pub(crate) fn from_cached(cached: &CachedServerParameters) -> Self {
        Self {
            initial_max_data: cached.initial_max_data,
            initial_max_stream_data_bidi_local: cached.initial_max_stream_data_bidi_local,
            initial_max_stream_data_bidi_remote: cached.initial_max_stream_data_bidi_remote,
            initial_max_stream_data_uni: cached.initial_max_stream_data_uni,
            initial_max_streams_bidi: cached.initial_max_streams_bidi,
            initial_max_streams_uni: cached.initial_max_streams_uni,
            idle_timeout: Duration::from_millis(cached.idle_timeout_millis),
            knob_frames_supported: cached.knob_frames_supported,
            reliable_stream_reset: cached.reliable_stream_reset,
            extended_ack_features: cached.extended_ack_features,
            ack_receive_timestamps: if cached.ack_receive_timestamps_enabled {
                Some(AckReceiveTimestampsConfig {
                    max_timestamps_per_ack: cached.max_receive_timestamps_per_ack,
                    exponent: cached.receive_timestamps_exponent,
                })
            } else {
                None
            },
            ..Self::default()
        }
    }

    /// Whether the server's real parameters grant at least what the cached
    /// record promised; 0-RTT must be rejected otherwise
    pub(crate) fn satisfies_early(&self, cached: &CachedServerParameters) -> bool {
        self.initial_max_data >= cached.initial_max_data
            && self.initial_max_stream_data_bidi_local >= cached.initial_max_stream_data_bidi_local
            && self.initial_max_stream_data_bidi_remote
                >= cached.initial_max_stream_data_bidi_remote
            && self.initial_max_stream_data_uni >= cached.initial_max_stream_data_uni
            && self.initial_max_streams_bidi >= cached.initial_max_streams_bidi
            && self.initial_max_streams_uni >= cached.initial_max_streams_uni
    }
}

/// Server parameters retained across connections for 0-RTT resumption
///
/// Serialization is the embedder's concern; round-tripping through
/// [`PeerParams::from_cached`] and [`PeerParams::cache`] preserves every
/// field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedServerParameters {
    /// Negotiated idle timeout, in milliseconds
    pub idle_timeout_millis: u64,
    /// UDP payload budget
    pub max_udp_payload_size: u16,
    /// Connection-level flow control credit
    pub initial_max_data: u64,
    /// Per-stream credit for locally-initiated bidirectional streams
    pub initial_max_stream_data_bidi_local: u64,
    /// Per-stream credit for remotely-initiated bidirectional streams
    pub initial_max_stream_data_bidi_remote: u64,
    /// Per-stream credit for unidirectional streams
    pub initial_max_stream_data_uni: u64,
    /// How many bidirectional streams we may open
    pub initial_max_streams_bidi: u64,
    /// How many unidirectional streams we may open
    pub initial_max_streams_uni: u64,
    /// Whether the peer accepts knob frames
    pub knob_frames_supported: bool,
    /// Whether the receive-timestamp extension was active
    pub ack_receive_timestamps_enabled: bool,
    /// Receive-timestamp budget per ACK
    pub max_receive_timestamps_per_ack: u64,
    /// Receive-timestamp delta scaling
    pub receive_timestamps_exponent: u64,
    /// Whether the peer accepts RESET_STREAM_AT
    pub reliable_stream_reset: bool,
    /// Extended-ack feature bitmask
    pub extended_ack_features: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Side;

    fn base_params(server_cid: &ConnectionId, orig_dst_cid: &ConnectionId) -> ServerParameters {
        let mut params = ServerParameters::default();
        params
            .push_cid(TransportParameterId::INITIAL_SOURCE_CONNECTION_ID, server_cid)
            .push_cid(
                TransportParameterId::ORIGINAL_DESTINATION_CONNECTION_ID,
                orig_dst_cid,
            )
            .push_int(TransportParameterId::INITIAL_MAX_DATA, 1_000_000)
            .push_int(TransportParameterId::INITIAL_MAX_STREAMS_BIDI, 16)
            .push_int(TransportParameterId::MAX_IDLE_TIMEOUT, 30_000);
        params
    }

    fn ingest(params: &ServerParameters) -> Result<PeerParams, TransportError> {
        PeerParams::from_server_params(
            0x0000_0001,
            &ConnectionId::new(&[2; 8]),
            &ConnectionId::new(&[3; 8]),
            params,
            &TransportConfig::default(),
        )
    }

    fn cids() -> (ConnectionId, ConnectionId) {
        (ConnectionId::new(&[2; 8]), ConnectionId::new(&[3; 8]))
    }

    #[test]
    fn accepts_baseline() {
        let (server_cid, orig) = cids();
        let params = ingest(&base_params(&server_cid, &orig)).unwrap();
        assert_eq!(params.initial_max_data, 1_000_000);
        assert_eq!(params.initial_max_streams_bidi, 16);
        assert_eq!(params.idle_timeout, Duration::from_secs(30));
        assert_eq!(params.max_udp_payload_size, DEFAULT_UDP_PAYLOAD_SIZE);
    }

    #[test]
    fn rejects_small_max_packet_size() {
        let (server_cid, orig) = cids();
        let mut params = base_params(&server_cid, &orig);
        params.push_int(TransportParameterId::MAX_UDP_PAYLOAD_SIZE, 1000);
        let err = ingest(&params).unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::TRANSPORT_PARAMETER_ERROR);
        assert!(err.reason.starts_with("Max packet size too small"));
    }

    #[test]
    fn zero_max_packet_size_defaults() {
        let (server_cid, orig) = cids();
        let mut params = base_params(&server_cid, &orig);
        params.push_int(TransportParameterId::MAX_UDP_PAYLOAD_SIZE, 0);
        let out = ingest(&params).unwrap();
        assert_eq!(out.max_udp_payload_size, DEFAULT_UDP_PAYLOAD_SIZE);
    }

    #[test]
    fn rejects_large_ack_delay_exponent() {
        let (server_cid, orig) = cids();
        let mut params = base_params(&server_cid, &orig);
        params.push_int(TransportParameterId::ACK_DELAY_EXPONENT, 25);
        let err = ingest(&params).unwrap_err();
        assert_eq!(err.reason, "ack_delay_exponent too large");
    }

    #[test]
    fn rejects_nonempty_reliable_reset() {
        let (server_cid, orig) = cids();
        let mut params = base_params(&server_cid, &orig);
        params.push_bytes(
            TransportParameterId::RELIABLE_STREAM_RESET,
            Bytes::from_static(&[1]),
        );
        let err = ingest(&params).unwrap_err();
        assert_eq!(err.reason, "Reliable reset transport parameter must be empty");
    }

    #[test]
    fn empty_reliable_reset_enables_extension() {
        let (server_cid, orig) = cids();
        let mut params = base_params(&server_cid, &orig);
        params.push_bytes(TransportParameterId::RELIABLE_STREAM_RESET, Bytes::new());
        assert!(ingest(&params).unwrap().reliable_stream_reset);
    }

    #[test]
    fn rejects_cid_mismatch() {
        let (_, orig) = cids();
        let params = base_params(&ConnectionId::new(&[9; 8]), &orig);
        let err = ingest(&params).unwrap_err();
        assert_eq!(err.reason, "Initial CID does not match.");
    }

    #[test]
    fn rejects_missing_cid_echo() {
        let mut params = ServerParameters::default();
        params.push_int(TransportParameterId::INITIAL_MAX_DATA, 5);
        let err = ingest(&params).unwrap_err();
        assert_eq!(err.reason, "Initial CID does not match.");
    }

    #[test]
    fn rejects_tiny_datagram_size() {
        let (server_cid, orig) = cids();
        let mut params = base_params(&server_cid, &orig);
        params.push_int(TransportParameterId::MAX_DATAGRAM_FRAME_SIZE, 40);
        let err = ingest(&params).unwrap_err();
        assert_eq!(err.reason, "max_datagram_frame_size too small");
    }

    #[test]
    fn idle_timeout_clamped() {
        let (server_cid, orig) = cids();
        let mut params = base_params(&server_cid, &orig);
        // Replace the 30s baseline with something enormous
        params.parameters.retain(|p| p.id != TransportParameterId::MAX_IDLE_TIMEOUT);
        params.push_int(TransportParameterId::MAX_IDLE_TIMEOUT, 100_000_000);
        let out = ingest(&params).unwrap();
        assert_eq!(out.idle_timeout, TransportConfig::MAX_IDLE_TIMEOUT);
    }

    #[test]
    fn receive_timestamps_clamped() {
        let (server_cid, orig) = cids();
        let mut params = base_params(&server_cid, &orig);
        params
            .push_int(TransportParameterId::ACK_RECEIVE_TIMESTAMPS_ENABLED, 1)
            .push_int(TransportParameterId::MAX_RECEIVE_TIMESTAMPS_PER_ACK, 200)
            .push_int(TransportParameterId::RECEIVE_TIMESTAMPS_EXPONENT, 2);
        let out = ingest(&params).unwrap();
        let config = out.ack_receive_timestamps.unwrap();
        // Clamped to the local ceiling
        assert_eq!(
            config.max_timestamps_per_ack,
            TransportConfig::default().max_receive_timestamps_per_ack_stored
        );
        assert_eq!(config.exponent, 2);
    }

    #[test]
    fn timestamps_require_full_tuple() {
        let (server_cid, orig) = cids();
        let mut params = base_params(&server_cid, &orig);
        params.push_int(TransportParameterId::ACK_RECEIVE_TIMESTAMPS_ENABLED, 1);
        assert!(ingest(&params).unwrap().ack_receive_timestamps.is_none());
    }

    #[test]
    fn cache_roundtrip_identity() {
        let (server_cid, orig) = cids();
        let mut params = base_params(&server_cid, &orig);
        params
            .push_int(TransportParameterId::INITIAL_MAX_STREAM_DATA_BIDI_LOCAL, 4096)
            .push_int(TransportParameterId::INITIAL_MAX_STREAM_DATA_BIDI_REMOTE, 2048)
            .push_int(TransportParameterId::INITIAL_MAX_STREAM_DATA_UNI, 1024)
            .push_int(TransportParameterId::INITIAL_MAX_STREAMS_UNI, 8)
            .push_int(TransportParameterId::KNOB_FRAMES_SUPPORTED, 1)
            .push_bytes(TransportParameterId::RELIABLE_STREAM_RESET, Bytes::new())
            .push_int(TransportParameterId::EXTENDED_ACK_FEATURES, 3)
            .push_int(TransportParameterId::ACK_RECEIVE_TIMESTAMPS_ENABLED, 1)
            .push_int(TransportParameterId::MAX_RECEIVE_TIMESTAMPS_PER_ACK, 5)
            .push_int(TransportParameterId::RECEIVE_TIMESTAMPS_EXPONENT, 1);
        let live = ingest(&params).unwrap();
        let cached = live.cache();
        let reseeded = PeerParams::from_cached(&cached);
        assert_eq!(reseeded.cache(), cached);
        // And the reseeded params reflect the cached values
        assert_eq!(reseeded.initial_max_data, 1_000_000);
        assert_eq!(reseeded.initial_max_streams_bidi, 16);
        assert!(reseeded.knob_frames_supported);
        assert!(reseeded.reliable_stream_reset);
        assert_eq!(reseeded.extended_ack_features, 3);
    }

    #[test]
    fn early_params_must_not_shrink() {
        let (server_cid, orig) = cids();
        let live = ingest(&base_params(&server_cid, &orig)).unwrap();
        let mut cached = live.cache();
        assert!(live.satisfies_early(&cached));
        cached.initial_max_data += 1;
        assert!(!live.satisfies_early(&cached));
    }

    #[test]
    fn wire_roundtrip() {
        let (server_cid, orig) = cids();
        let params = base_params(&server_cid, &orig);
        let mut buf = Vec::new();
        params.encode(&mut buf);
        let decoded = ServerParameters::decode(&mut &buf[..]).unwrap();
        assert_eq!(decoded.parameters.len(), params.parameters.len());
        assert_eq!(ingest(&decoded).unwrap(), ingest(&params).unwrap());
    }
}
