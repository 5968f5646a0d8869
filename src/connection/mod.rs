use std::{
    collections::VecDeque,
    mem,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::{
    coding::Codec,
    config::TransportConfig,
    congestion::Controller,
    crypto::{DirectionalKeys, KeyChange, PacketKey, Session},
    frame::{self, ApplicationClose, Close, ConnectionClose, Frame, StreamMetaVec},
    packet::{
        ConnectionId, EncryptionLevel, Header, HeaderBuilder, PacketNumber, PartialDecode, SpaceId,
    },
    range_set::RangeSet,
    transport_error::TransportError,
    transport_parameters::{CachedServerParameters, PeerParams},
    Dir, Side, StreamGroupId, StreamId, VarInt, MIN_INITIAL_SIZE,
};

mod assembler;
mod batch;
pub use batch::{BatchError, BatchWriter, IoBatch, SocketCmsg, Transmit};

mod datagrams;
use datagrams::DatagramState;
pub use datagrams::{ReceivedDatagram, SendDatagramError};

mod flow_control;

mod handshake;
pub use handshake::ConnectError;
use handshake::Handshake;

mod pacing;
use pacing::Pacer;

mod recovery;
pub use recovery::RttEstimator;
use recovery::{MAX_PTO_BACKOFF, PACKET_THRESHOLD, TIME_THRESHOLD};

mod scheduler;

mod spaces;
use spaces::{PacketSpace, Retransmits, SentPacket};

mod streams;
pub use streams::{
    ByteEventKind, ConsumeError, FinishError, OpenError, ReadError, RetransmissionPolicy,
    StreamEvent, WriteError,
};
use streams::StreamsState;

mod timer;
use timer::{Timer, TimerTable};

/// Grace period for a graceful close, and the drain period after a
/// CONNECTION_CLOSE, expressed in PTOs
const DRAIN_PTO_FACTOR: u32 = 3;

/// Outcome of an application-requested ping
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PingResult {
    /// The peer acknowledged the ping
    Pong,
    /// The timeout elapsed without an acknowledgment
    Timeout,
}

/// Things the application should know about
#[derive(Debug)]
pub enum Event {
    /// The handshake completed and the peer's parameters are in effect
    Connected,
    /// The connection was terminated; no further events will follow
    ConnectionLost {
        /// Why
        reason: ConnectionError,
    },
    /// Something happened on a stream
    Stream(StreamEvent),
    /// One or more datagrams became readable
    DatagramReceived,
    /// The 0-RTT data offered at connect time was rejected by the server
    ZeroRttRejected,
    /// An application ping concluded
    Ping(PingResult),
    /// The peer pushed a tuning knob
    Knob {
        /// Knob namespace
        space: u64,
        /// Knob identifier within the namespace
        id: u64,
        /// Opaque payload
        payload: Bytes,
    },
}

/// Reasons a connection ends
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The peer violated the protocol
    #[error(transparent)]
    TransportError(#[from] TransportError),
    /// The peer closed the connection at the transport layer
    #[error("closed by peer: {0}")]
    ConnectionClosed(ConnectionClose),
    /// The peer's application closed the connection
    #[error("closed by peer application: {0}")]
    ApplicationClosed(ApplicationClose),
    /// Nothing was heard from the peer within the negotiated idle window
    #[error("timed out")]
    TimedOut,
    /// This endpoint closed the connection
    #[error("closed")]
    LocallyClosed,
}

/// Errors from queueing a knob frame
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum KnobError {
    /// The peer did not advertise knob frame support
    #[error("knob frames not supported by peer")]
    UnsupportedByPeer,
    /// The connection is closed or draining
    #[error("connection closed")]
    ConnectionClosed,
}

/// Coarse connection lifecycle
enum State {
    Handshaking,
    Established,
    /// We sent (or are about to send) CONNECTION_CLOSE and are waiting out
    /// the drain period
    Closing { reason: Close, close_sent: bool },
    /// The peer closed; we linger briefly to absorb stray packets
    Draining,
    Drained,
}

impl State {
    fn is_closed(&self) -> bool {
        matches!(
            *self,
            Self::Closing { .. } | Self::Draining | Self::Drained
        )
    }
}

/// Undecryptable packets buffered until their keys arrive
#[derive(Default)]
struct PendingPackets {
    handshake: Vec<BytesMut>,
    one_rtt: Vec<BytesMut>,
}

/// Protocol state machine for one QUIC connection
///
/// Sans-IO: owns no sockets and no clock. The embedding reactor feeds
/// datagrams to [`handle_datagram`](Self::handle_datagram), fires
/// [`handle_timeout`](Self::handle_timeout) at the deadline reported by
/// [`poll_timeout`](Self::poll_timeout), drains application events from
/// [`poll`](Self::poll), and asks [`write_packets`](Self::write_packets) to
/// fill a batch whenever the connection signals it has something to send.
pub struct Connection {
    side: Side,
    config: Arc<TransportConfig>,
    version: u32,
    state: State,
    handshake: Handshake,

    // Identity
    local_cid: ConnectionId,
    rem_cid: ConnectionId,
    orig_dst_cid: ConnectionId,
    remote: SocketAddr,
    orig_remote: SocketAddr,
    /// Token to put in Initial packets, from a Retry
    retry_token: Bytes,
    /// The source CID of an accepted Retry; set at most once
    retry_src_cid: Option<ConnectionId>,
    /// Connection IDs issued by the peer
    peer_cids: Vec<frame::NewConnectionId>,

    // Crypto
    spaces: [PacketSpace; 3],
    zero_rtt_keys: Option<DirectionalKeys>,
    /// Current 1-RTT key phase bit
    key_phase: bool,
    /// Read key for the previous phase, retired a round trip after rotation
    prev_1rtt_read_key: Option<Box<dyn PacketKey>>,
    /// Packets authenticated since the handshake keys arrived
    total_authed_packets: u64,
    pending_packets: PendingPackets,

    // Recovery
    rtt: RttEstimator,
    pto_count: u32,
    congestion: Box<dyn Controller>,
    pacer: Pacer,

    // Application data
    streams: StreamsState,
    datagrams: DatagramState,

    // Negotiated state
    peer_params: PeerParams,
    cached_params: Option<CachedServerParameters>,
    server_params_cache: Option<CachedServerParameters>,

    // Timers and liveness
    timers: TimerTable,
    /// Set while a graceful close waits for deliverables to drain
    graceful: bool,
    /// Outstanding application ping, as (space, packet number) once sent
    app_ping_sent: Option<(SpaceId, u64)>,
    app_ping_armed: bool,

    cmsgs: Vec<SocketCmsg>,
    events: VecDeque<Event>,
    error: Option<ConnectionError>,
}

impl Connection {
    /// Initiate a connection as a client
    ///
    /// `rem_cid` is the (typically random) destination CID for the first
    /// flight; it seeds the Initial packet protection keys and is preserved
    /// as the original destination CID for retry validation and parameter
    /// authentication. Providing `cached` parameters from an earlier
    /// connection permits 0-RTT data if the session has the matching
    /// resumption state.
    pub fn connect(
        config: Arc<TransportConfig>,
        session: Box<dyn Session>,
        version: u32,
        local_cid: ConnectionId,
        rem_cid: ConnectionId,
        remote: SocketAddr,
        cached: Option<CachedServerParameters>,
        now: Instant,
    ) -> Result<Self, ConnectError> {
        let mut handshake = Handshake::new(session);
        let zero_rtt_keys = handshake.connect()?;
        let initial_keys = handshake.session().initial_keys(&rem_cid, Side::Client);

        let congestion = config
            .congestion_controller_factory
            .clone()
            .build(now, config.max_udp_payload_size);
        let pacer = Pacer::new(congestion.initial_window(), now);

        let mut this = Self {
            side: Side::Client,
            version,
            state: State::Handshaking,
            handshake,
            local_cid,
            rem_cid,
            orig_dst_cid: rem_cid,
            remote,
            orig_remote: remote,
            retry_token: Bytes::new(),
            retry_src_cid: None,
            peer_cids: Vec::new(),
            spaces: [PacketSpace::new(), PacketSpace::new(), PacketSpace::new()],
            zero_rtt_keys,
            key_phase: false,
            prev_1rtt_read_key: None,
            total_authed_packets: 0,
            pending_packets: PendingPackets::default(),
            rtt: RttEstimator::new(),
            pto_count: 0,
            congestion,
            pacer,
            streams: StreamsState::new(Side::Client, &config),
            datagrams: DatagramState::default(),
            peer_params: PeerParams::default(),
            cached_params: cached,
            server_params_cache: None,
            timers: TimerTable::default(),
            graceful: false,
            app_ping_sent: None,
            app_ping_armed: false,
            cmsgs: Vec::new(),
            events: VecDeque::new(),
            error: None,
            config,
        };
        this.spaces[SpaceId::Initial as usize].crypto = Some(initial_keys);
        if this.zero_rtt_keys.is_some() {
            if let Some(cached) = this.cached_params {
                // Seed flow control and stream limits so early writes can
                // proceed before the real parameters arrive
                let early = PeerParams::from_cached(&cached);
                this.streams.set_params(&early);
                this.peer_params = early;
            }
        }
        if let Err(e) = this.pump_handshake(now) {
            // A session failing before the first flight is a local defect
            warn!(%e, "handshake failed to start");
        }
        this.reset_idle_timer(now);
        Ok(this)
    }

    /// Role of this endpoint
    pub fn side(&self) -> Side {
        self.side
    }

    /// Current address of the peer
    pub fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    /// The peer address this connection was created against; a difference
    /// from [`remote_address`](Self::remote_address) indicates migration
    pub fn original_remote_address(&self) -> SocketAddr {
        self.orig_remote
    }

    /// Why the connection ended, once it has
    pub fn close_reason(&self) -> Option<&ConnectionError> {
        self.error.as_ref()
    }

    /// Whether the handshake completed and the connection is usable
    pub fn is_established(&self) -> bool {
        matches!(self.state, State::Established)
    }

    /// Whether the connection is fully terminated and may be dropped
    pub fn is_drained(&self) -> bool {
        matches!(self.state, State::Drained)
    }

    /// Whether ownership may migrate between reactors right now
    ///
    /// True when no application-visible work is queued; the engine itself
    /// never holds a suspension point across calls.
    pub fn is_detachable(&self) -> bool {
        self.events.is_empty() && !self.streams.has_events()
    }

    /// Estimated round-trip time
    pub fn rtt(&self) -> Duration {
        self.rtt.get()
    }

    //
    // Events
    //

    /// Pop the next application-visible event
    pub fn poll(&mut self) -> Option<Event> {
        if let Some(event) = self.events.pop_front() {
            return Some(event);
        }
        self.streams.events().pop_front().map(Event::Stream)
    }

    /// Next instant at which `handle_timeout` must run
    pub fn poll_timeout(&mut self) -> Option<Instant> {
        self.timers.next_timeout()
    }

    //
    // Ingress
    //

    /// Process a UDP datagram received from the peer
    pub fn handle_datagram(&mut self, now: Instant, data: BytesMut) {
        if matches!(self.state, State::Drained) {
            return;
        }
        let mut remaining = Some(data);
        while let Some(buf) = remaining.take() {
            match PartialDecode::new(buf, self.local_cid.len()) {
                Ok((packet, rest)) => {
                    remaining = rest;
                    self.handle_packet(now, packet);
                }
                Err(reason) => {
                    debug!(?reason, "dropping undecodable datagram remainder");
                    break;
                }
            }
            if matches!(self.state, State::Drained) {
                break;
            }
        }
    }

    fn handle_packet(&mut self, now: Instant, packet: PartialDecode) {
        if packet.header.is_retry() {
            self.handle_retry(now, packet);
            return;
        }
        if *packet.header.dst_cid() != self.local_cid {
            trace!("dropping packet for another connection");
            return;
        }
        let level = packet.header.level();
        if level == EncryptionLevel::ZeroRtt {
            // Clients never decrypt 0-RTT
            trace!("dropping 0-RTT packet");
            return;
        }
        if !self.has_read_keys(level) {
            self.buffer_pending(level, packet.data);
            return;
        }
        match self.decrypt_and_dispatch(now, packet) {
            Ok(()) => {}
            Err(e) => self.close_on_error(now, e),
        }
    }

    fn has_read_keys(&self, level: EncryptionLevel) -> bool {
        self.spaces[level.space() as usize].crypto.is_some()
    }

    fn buffer_pending(&mut self, level: EncryptionLevel, data: BytesMut) {
        let queue = match level {
            EncryptionLevel::Handshake => &mut self.pending_packets.handshake,
            EncryptionLevel::OneRtt => &mut self.pending_packets.one_rtt,
            _ => {
                debug!(?level, "dropping packet: cipher unavailable");
                return;
            }
        };
        if queue.len() >= self.config.max_packets_to_buffer {
            debug!(?level, "dropping packet: max buffered");
            return;
        }
        trace!(?level, "buffering packet until keys are available");
        queue.push(data);
    }

    fn drain_pending(&mut self, now: Instant, level: EncryptionLevel) {
        let queued = match level {
            EncryptionLevel::Handshake => mem::take(&mut self.pending_packets.handshake),
            EncryptionLevel::OneRtt => mem::take(&mut self.pending_packets.one_rtt),
            _ => return,
        };
        for data in queued {
            self.handle_datagram(now, data);
        }
    }

    fn decrypt_and_dispatch(
        &mut self,
        now: Instant,
        packet: PartialDecode,
    ) -> Result<(), TransportError> {
        let level = packet.header.level();
        let space_id = level.space();
        let mut data = packet.data;
        let pn_offset = packet.header_len;

        // Remove header protection and recover the packet number
        {
            let space = &self.spaces[space_id as usize];
            let keys = space.crypto.as_ref().expect("keys checked by caller");
            let header_key = &keys.header.remote;
            if data.len() < pn_offset + 4 + header_key.sample_size() {
                trace!("dropping truncated packet");
                return Ok(());
            }
            header_key.decrypt(pn_offset, &mut data[..]);
        }
        let first = data[0];
        let pn_len = (first & 0x03) as usize + 1;
        let mut pn_bytes = &data[pn_offset..pn_offset + pn_len];
        let truncated = match PacketNumber::decode(pn_len, &mut pn_bytes) {
            Ok(x) => x,
            Err(_) => {
                trace!("dropping packet with malformed number");
                return Ok(());
            }
        };
        let expected = self.spaces[space_id as usize].rx_packet.wrapping_add(1);
        let number = truncated.expand(expected);

        // Key phase handling for short headers
        let key_phase = matches!(packet.header, Header::Short { key_phase: true, .. });
        if level == EncryptionLevel::OneRtt && key_phase != self.key_phase {
            self.rotate_read_key(now)?;
        }

        // Decrypt in place
        let header = data.split_to(pn_offset + pn_len);
        let mut payload = data;
        {
            let space = &self.spaces[space_id as usize];
            let keys = space.crypto.as_ref().unwrap();
            if keys
                .packet
                .remote
                .decrypt(number, &header, &mut payload)
                .is_err()
            {
                debug!(number, "dropping packet: decrypt error");
                return Ok(());
            }
        }

        if self.spaces[space_id as usize].dedup.insert(number) {
            trace!(number, "dropping duplicate packet");
            return Ok(());
        }
        self.total_authed_packets += 1;
        self.reset_idle_timer(now);

        // Track the source CID the server settled on
        if let Some(src) = packet.header.src_cid() {
            if level == EncryptionLevel::Initial && self.retry_src_cid.is_none() {
                self.rem_cid = *src;
            }
        }

        let frames = frame::Iter::new(payload.freeze())?;
        let mut ack_eliciting = false;
        for result in frames {
            let frame = result.map_err(TransportError::from)?;
            ack_eliciting |= frame.is_ack_eliciting();
            self.handle_frame(now, space_id, level, frame)?;
            if self.state.is_closed() {
                break;
            }
        }

        let space = &mut self.spaces[space_id as usize];
        if number > space.rx_packet || space.rx_packet_time.is_none() {
            space.rx_packet = number;
            space.rx_packet_time = Some(now);
        }
        space
            .pending_acks
            .on_packet_received(number, now, ack_eliciting);
        if let Some(ts) = self.peer_params.ack_receive_timestamps {
            space.record_recv_timestamp(number, now, ts.max_timestamps_per_ack);
        }
        Ok(())
    }

    fn rotate_read_key(&mut self, now: Instant) -> Result<(), TransportError> {
        let next = self.handshake.next_1rtt_read_key()?;
        let space = &mut self.spaces[SpaceId::Data as usize];
        let keys = space.crypto.as_mut().expect("1-RTT keys present");
        let old = mem::replace(&mut keys.packet.remote, next);
        self.prev_1rtt_read_key = Some(old);
        self.key_phase = !self.key_phase;
        // The previous phase's key answers reordered packets for one round
        // trip, then goes away
        self.timers.set(Timer::KeyDiscard, now + self.rtt.get());
        Ok(())
    }

    fn handle_frame(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        level: EncryptionLevel,
        frame: Frame,
    ) -> Result<(), TransportError> {
        if space_id != SpaceId::Data {
            match frame {
                Frame::Crypto(_)
                | Frame::Ack(_)
                | Frame::Close(_)
                | Frame::Padding
                | Frame::Ping => {}
                _ => {
                    let mut err =
                        TransportError::PROTOCOL_VIOLATION("illegal frame type in this space");
                    err.frame = Some(frame.ty());
                    return Err(err);
                }
            }
        }
        match frame {
            Frame::Padding | Frame::Ping => Ok(()),
            Frame::Crypto(crypto) => self.handle_crypto(now, space_id, level, crypto),
            Frame::Ack(ack) => self.handle_ack(now, space_id, ack),
            Frame::Stream(stream) => self.streams.on_stream_frame(stream),
            Frame::ResetStream(rst) => self.streams.on_reset_stream(rst),
            Frame::StopSending(stop) => self.streams.on_stop_sending(stop),
            Frame::MaxData(max) => {
                self.streams.on_max_data(max.into_inner());
                Ok(())
            }
            Frame::MaxStreamData { id, offset } => self.streams.on_max_stream_data(id, offset),
            Frame::MaxStreams { dir, count } => self.streams.on_max_streams(dir, count),
            Frame::DataBlocked { offset } => {
                trace!(offset, "peer reports DATA_BLOCKED");
                Ok(())
            }
            Frame::StreamDataBlocked { id, offset } => {
                trace!(%id, offset, "peer reports STREAM_DATA_BLOCKED");
                Ok(())
            }
            Frame::StreamsBlocked { dir, limit } => {
                trace!(%dir, limit, "peer reports STREAMS_BLOCKED");
                Ok(())
            }
            Frame::NewConnectionId(cid) => {
                if cid.sequence as usize > self.peer_cids.len() + 32 {
                    return Err(TransportError::CONNECTION_ID_LIMIT_ERROR(
                        "implausible connection ID sequence",
                    ));
                }
                self.peer_cids.retain(|c| c.sequence >= cid.retire_prior_to);
                self.peer_cids.push(cid);
                Ok(())
            }
            Frame::RetireConnectionId { sequence } => {
                trace!(sequence, "peer retired a connection ID");
                Ok(())
            }
            Frame::PathChallenge(token) => {
                // Must be answered on the same path, with priority
                self.spaces[SpaceId::Data as usize].pending.path_response = Some(token);
                Ok(())
            }
            Frame::PathResponse(token) => {
                trace!(token, "ignoring unsolicited PATH_RESPONSE");
                Ok(())
            }
            Frame::Datagram(datagram) => {
                let window = self.config.datagram_receive_buffer_size;
                if self.datagrams.received(datagram, window, now)? {
                    self.events.push_back(Event::DatagramReceived);
                }
                Ok(())
            }
            Frame::HandshakeDone => {
                if self.side == Side::Server {
                    return Err(TransportError::PROTOCOL_VIOLATION(
                        "HANDSHAKE_DONE sent by client",
                    ));
                }
                self.handshake.confirm();
                self.discard_space(now, SpaceId::Handshake);
                Ok(())
            }
            Frame::Knob(knob) => {
                if !self.config.enable_knob_frames {
                    trace!("ignoring knob frame: extension disabled");
                    return Ok(());
                }
                self.events.push_back(Event::Knob {
                    space: knob.space,
                    id: knob.id,
                    payload: knob.payload,
                });
                Ok(())
            }
            Frame::NewToken { token } => {
                trace!(len = token.len(), "received NEW_TOKEN");
                Ok(())
            }
            Frame::Close(close) => {
                let reason = match close {
                    Close::Connection(c) => ConnectionError::ConnectionClosed(c),
                    Close::Application(c) => ConnectionError::ApplicationClosed(c),
                };
                self.events.push_back(Event::ConnectionLost {
                    reason: reason.clone(),
                });
                self.error = Some(reason);
                self.state = State::Draining;
                self.timers.set(Timer::Close, now + DRAIN_PTO_FACTOR * self.pto(SpaceId::Data));
                Ok(())
            }
        }
    }

    fn handle_crypto(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        level: EncryptionLevel,
        crypto: frame::Crypto,
    ) -> Result<(), TransportError> {
        {
            let space = &mut self.spaces[space_id as usize];
            space.crypto_stream.insert(crypto.offset, crypto.data);
        }
        loop {
            let chunk = self.spaces[space_id as usize].crypto_stream.read(usize::MAX);
            let Some(chunk) = chunk else { break };
            self.handshake.read(level, &chunk)?;
        }
        self.pump_handshake(now)
    }

    /// Drive outgoing handshake data and key installation
    fn pump_handshake(&mut self, now: Instant) -> Result<(), TransportError> {
        loop {
            let mut buf = Vec::new();
            let change = self.handshake.write(&mut buf)?;
            let wrote = !buf.is_empty();
            if wrote {
                let level = self.write_level();
                let space = &mut self.spaces[level.space() as usize];
                let offset = space.crypto_offset;
                space.crypto_offset += buf.len() as u64;
                space.pending.crypto.push_back(frame::Crypto {
                    offset,
                    data: buf.into(),
                });
            }
            match change {
                Some(KeyChange::Handshake { keys }) => {
                    self.spaces[SpaceId::Handshake as usize].crypto = Some(keys);
                    // The Initial keys have served their purpose
                    self.discard_space(now, SpaceId::Initial);
                    self.drain_pending(now, EncryptionLevel::Handshake);
                }
                Some(KeyChange::OneRtt { keys }) => {
                    self.spaces[SpaceId::Data as usize].crypto = Some(keys);
                    self.process_peer_params(now)?;
                    self.drain_pending(now, EncryptionLevel::OneRtt);
                }
                None if !wrote => return Ok(()),
                None => {}
            }
        }
    }

    /// Ingest the server's transport parameters once the session exposes
    /// them
    fn process_peer_params(&mut self, now: Instant) -> Result<(), TransportError> {
        let Some(wire) = self.handshake.session().peer_params()? else {
            return Ok(());
        };
        let params = PeerParams::from_server_params(
            self.version,
            &self.rem_cid,
            &self.orig_dst_cid,
            &wire,
            &self.config,
        )?;

        if self.handshake.early_data_attempted() {
            let satisfies = self
                .cached_params
                .map_or(false, |cached| params.satisfies_early(&cached));
            let tls_rejected =
                self.handshake.session().early_data_accepted() != Some(true);
            let rejected = tls_rejected || !satisfies;
            self.handshake.set_zero_rtt_outcome(rejected, satisfies);
            if rejected {
                self.on_zero_rtt_rejected(now);
            }
        }

        self.streams.set_params(&params);
        self.server_params_cache = Some(params.cache());
        self.peer_params = params;

        self.reset_idle_timer(now);
        if let Some(interval) = self.config.keep_alive_interval {
            self.timers.set(Timer::KeepAlive, now + interval);
        }
        self.state = State::Established;
        self.events.push_back(Event::Connected);
        if self.handshake.take_zero_rtt_rejected() == Some(true) {
            self.events.push_back(Event::ZeroRttRejected);
        }
        Ok(())
    }

    /// 0-RTT was rejected: everything sent under those keys is gone and must
    /// be replayed under 1-RTT protection
    fn on_zero_rtt_rejected(&mut self, now: Instant) {
        self.zero_rtt_keys = None;
        let space = &mut self.spaces[SpaceId::Data as usize];
        let numbers: Vec<u64> = space
            .sent_packets
            .iter()
            .filter(|(_, p)| p.level == EncryptionLevel::ZeroRtt && !p.declared_lost)
            .map(|(&n, _)| n)
            .collect();
        for number in numbers {
            self.declare_lost(now, SpaceId::Data, number);
        }
    }

    //
    // Retry
    //

    fn handle_retry(&mut self, now: Instant, packet: PartialDecode) {
        if self.side == Side::Server {
            trace!("dropping Retry received by server");
            return;
        }
        if self.retry_src_cid.is_some() {
            trace!("dropping second Retry");
            return;
        }
        if self.total_authed_packets > 0 {
            // The handshake has made progress; a Retry now is an attack or a
            // confused peer
            self.close_on_error(
                now,
                TransportError::PROTOCOL_VIOLATION("Retry after handshake packets"),
            );
            return;
        }
        let (header, body) = packet.data.split_at(packet.header_len);
        if !self
            .handshake
            .session()
            .is_valid_retry(&self.orig_dst_cid, header, body)
        {
            trace!("dropping Retry with invalid integrity tag");
            return;
        }
        let Header::Retry { src_cid, .. } = packet.header else {
            unreachable!("handle_retry called for non-Retry header");
        };
        // Token is everything except the trailing integrity tag
        let token = Bytes::copy_from_slice(&body[..body.len().saturating_sub(16)]);
        self.apply_retry(now, src_cid, token);
    }

    /// Rebuild the connection state for a fresh first flight, preserving
    /// only what survives a stateless retry
    fn apply_retry(&mut self, now: Instant, new_rem_cid: ConnectionId, token: Bytes) {
        self.retry_src_cid = Some(new_rem_cid);
        self.rem_cid = new_rem_cid;
        self.retry_token = token;

        // Collect the Initial CRYPTO data for re-transmission under the new
        // keys, lowest offset first
        let mut crypto: Vec<frame::Crypto> = Vec::new();
        {
            let initial = &mut self.spaces[SpaceId::Initial as usize];
            crypto.extend(initial.pending.crypto.drain(..));
            for (_, packet) in mem::take(&mut initial.sent_packets) {
                crypto.extend(packet.retransmits.crypto);
            }
            crypto.sort_by_key(|c| c.offset);
        }

        // Only 0-RTT data survives in the application space; every other
        // packet is forgotten entirely
        let mut new_spaces = [PacketSpace::new(), PacketSpace::new(), PacketSpace::new()];
        for (space, new_space) in self.spaces.iter_mut().zip(new_spaces.iter_mut()) {
            new_space.next_packet_number = space.next_packet_number;
        }
        new_spaces[SpaceId::Initial as usize].crypto_offset =
            crypto.iter().map(|c| c.offset + c.data.len() as u64).max().unwrap_or(0);
        new_spaces[SpaceId::Initial as usize]
            .pending
            .crypto
            .extend(crypto);
        let old_data_space = mem::replace(&mut self.spaces[SpaceId::Data as usize], PacketSpace::new());
        for (number, mut packet) in old_data_space.sent_packets {
            if packet.level == EncryptionLevel::ZeroRtt && !packet.declared_lost {
                packet.in_flight = false;
                new_spaces[SpaceId::Data as usize]
                    .sent_packets
                    .insert(number, packet);
            }
        }
        self.spaces = new_spaces;

        // New Initial protection keys derive from the server-chosen CID
        self.spaces[SpaceId::Initial as usize].crypto = Some(
            self.handshake
                .session()
                .initial_keys(&new_rem_cid, self.side),
        );

        // The controller held references into the discarded state; rebuild it
        self.congestion = self
            .config
            .congestion_controller_factory
            .clone()
            .build(now, self.config.max_udp_payload_size);
        self.pacer = Pacer::new(self.congestion.initial_window(), now);
        self.timers.reset();
        self.reset_idle_timer(now);
        self.pending_packets = PendingPackets::default();
        self.total_authed_packets = 0;

        // The surviving 0-RTT packets are immediately treated as lost so
        // their frames go out again under the new connection
        let numbers: Vec<u64> = self.spaces[SpaceId::Data as usize]
            .sent_packets
            .keys()
            .copied()
            .collect();
        for number in numbers {
            self.declare_lost(now, SpaceId::Data, number);
        }
    }

    //
    // Acknowledgments and loss
    //

    fn handle_ack(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        ack: frame::Ack,
    ) -> Result<(), TransportError> {
        if ack.largest >= self.spaces[space_id as usize].next_packet_number {
            return Err(TransportError::PROTOCOL_VIOLATION("unsent packet acked"));
        }
        let mut newly_acked = Vec::new();
        {
            let space = &mut self.spaces[space_id as usize];
            for range in ack.iter() {
                let in_range: Vec<u64> =
                    space.sent_packets.range(range).map(|(&n, _)| n).collect();
                newly_acked.extend(in_range);
            }
        }
        if newly_acked.is_empty() {
            return Ok(());
        }
        newly_acked.sort_unstable();
        let largest_newly_acked = *newly_acked.last().unwrap();

        // RTT sample only when the largest acked is newly acked and
        // ack-eliciting
        let largest_prev = self.spaces[space_id as usize].largest_acked_packet;
        if largest_prev.map_or(true, |x| ack.largest > x) {
            self.spaces[space_id as usize].largest_acked_packet = Some(ack.largest);
            if largest_newly_acked == ack.largest {
                let packet = &self.spaces[space_id as usize].sent_packets[&largest_newly_acked];
                if packet.ack_eliciting {
                    let rtt_sample = now.saturating_duration_since(packet.time_sent);
                    let ack_delay = if space_id == SpaceId::Data {
                        Duration::from_micros(
                            ack.delay << self.peer_params.ack_delay_exponent,
                        )
                    } else {
                        Duration::ZERO
                    };
                    self.rtt.update(ack_delay, rtt_sample);
                }
            }
        }

        for &number in &newly_acked {
            self.on_packet_acked(now, space_id, number)?;
        }
        self.pto_count = 0;

        self.detect_lost_packets(now, space_id);
        self.streams.drain_deliverable();
        self.set_loss_detection_timer(now);
        self.maybe_finish_graceful_close(now);
        Ok(())
    }

    fn on_packet_acked(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        number: u64,
    ) -> Result<(), TransportError> {
        let Some(packet) = self.spaces[space_id as usize].sent_packets.remove(&number) else {
            return Ok(());
        };
        if packet.declared_lost {
            trace!(number, "spurious loss: packet eventually acked");
            return Ok(());
        }
        if packet.in_flight {
            self.spaces[space_id as usize].in_flight -= u64::from(packet.size);
            self.congestion.on_ack(
                now,
                packet.time_sent,
                u64::from(packet.size),
                !self.streams.has_sendable(),
                &self.rtt,
            );
        }
        self.spaces[space_id as usize]
            .pending_acks
            .subtract(&packet.acks);
        for meta in &packet.stream_frames {
            self.streams.ack_stream(meta)?;
        }
        for rst in &packet.retransmits.reset_stream {
            self.streams
                .ack_reset(rst.id, rst.reliable_size.map(VarInt::into_inner))?;
        }
        if self.app_ping_sent == Some((space_id, number)) {
            self.app_ping_sent = None;
            self.timers.stop(Timer::Ping);
            self.events.push_back(Event::Ping(PingResult::Pong));
        }
        Ok(())
    }

    /// Declare `number` lost: flag it, credit congestion, and requeue its
    /// frames
    fn declare_lost(&mut self, now: Instant, space_id: SpaceId, number: u64) {
        let space = &mut self.spaces[space_id as usize];
        let Some(packet) = space.sent_packets.get_mut(&number) else {
            return;
        };
        if packet.declared_lost {
            return;
        }
        packet.declared_lost = true;
        let was_in_flight = mem::take(&mut packet.in_flight);
        let size = packet.size;
        let time_sent = packet.time_sent;
        let clone_group = packet.clone_group;
        let retransmits = mem::take(&mut packet.retransmits);
        let stream_frames = mem::take(&mut packet.stream_frames);
        space.pending |= retransmits;
        if was_in_flight {
            space.in_flight -= u64::from(size);
        }
        for meta in &stream_frames {
            self.streams.on_stream_frame_lost(meta);
        }
        if was_in_flight {
            self.congestion
                .on_congestion_event(now, time_sent, false, u64::from(size));
        }
        trace!(number, ?space_id, ?clone_group, "packet lost");
    }

    fn detect_lost_packets(&mut self, now: Instant, space_id: SpaceId) {
        let Some(largest_acked) = self.spaces[space_id as usize].largest_acked_packet else {
            return;
        };
        let loss_delay = Duration::from_secs_f32(
            self.rtt.get().max(self.rtt.latest()).as_secs_f32() * TIME_THRESHOLD,
        );
        let lost_send_time = now.checked_sub(loss_delay);
        let mut lost = Vec::new();
        let mut loss_time = None;
        {
            let space = &self.spaces[space_id as usize];
            for (&number, packet) in space.sent_packets.range(..largest_acked) {
                if packet.declared_lost {
                    continue;
                }
                if number + PACKET_THRESHOLD <= largest_acked
                    || lost_send_time.map_or(false, |t| packet.time_sent <= t)
                {
                    lost.push(number);
                } else {
                    // Not lost yet; it will be once the reordering window
                    // expires
                    let when = packet.time_sent + loss_delay;
                    loss_time = Some(loss_time.map_or(when, |x: Instant| x.min(when)));
                }
            }
        }
        self.spaces[space_id as usize].loss_time = loss_time;
        for number in lost {
            self.declare_lost(now, space_id, number);
        }
        // Purge stale loss-flagged packets well below the ack horizon
        let horizon = largest_acked.saturating_sub(3 * PACKET_THRESHOLD);
        let space = &mut self.spaces[space_id as usize];
        let stale: Vec<u64> = space
            .sent_packets
            .range(..horizon)
            .filter(|(_, p)| p.declared_lost)
            .map(|(&n, _)| n)
            .collect();
        for number in stale {
            space.sent_packets.remove(&number);
        }
    }

    /// Probe timeout for a space, after backoff
    fn pto(&self, space_id: SpaceId) -> Duration {
        let mut pto = self.rtt.pto_base();
        if space_id == SpaceId::Data {
            pto += self.config.max_ack_delay;
        }
        pto * 2u32.pow(self.pto_count.min(MAX_PTO_BACKOFF))
    }

    fn set_loss_detection_timer(&mut self, now: Instant) {
        // Earliest time-threshold loss wins
        let mut earliest: Option<Instant> = None;
        for space_id in SpaceId::iter() {
            if let Some(t) = self.spaces[space_id as usize].loss_time {
                earliest = Some(earliest.map_or(t, |x| x.min(t)));
            }
        }
        if let Some(t) = earliest {
            self.timers.set(Timer::LossDetection, t);
            return;
        }
        // Otherwise arm the PTO off the most recent ack-eliciting packet
        let mut deadline: Option<Instant> = None;
        for space_id in SpaceId::iter() {
            let space = &self.spaces[space_id as usize];
            if space.in_flight == 0 {
                continue;
            }
            if let Some(sent) = space.time_of_last_ack_eliciting_packet {
                let when = sent + self.pto(space_id);
                deadline = Some(deadline.map_or(when, |x| x.min(when)));
            }
        }
        match deadline {
            Some(t) => self.timers.set(Timer::LossDetection, t.max(now)),
            None => self.timers.stop(Timer::LossDetection),
        }
    }

    fn on_loss_detection_timeout(&mut self, now: Instant) {
        // A space with an expired reordering window loses packets now
        for space_id in SpaceId::iter() {
            if self.spaces[space_id as usize]
                .loss_time
                .map_or(false, |t| t <= now)
            {
                self.detect_lost_packets(now, space_id);
                self.set_loss_detection_timer(now);
                return;
            }
        }
        // Otherwise this is a PTO: send probes
        let mut oldest: Option<(SpaceId, Instant)> = None;
        for space_id in SpaceId::iter() {
            let space = &self.spaces[space_id as usize];
            if space.in_flight == 0 {
                continue;
            }
            if let Some(sent) = space.time_of_last_ack_eliciting_packet {
                if oldest.map_or(true, |(_, t)| sent < t) {
                    oldest = Some((space_id, sent));
                }
            }
        }
        if let Some((space_id, _)) = oldest {
            let space = &mut self.spaces[space_id as usize];
            space.loss_probes = (space.loss_probes + 2).min(4);
            self.pto_count += 1;
            trace!(?space_id, count = self.pto_count, "probe timeout");
            self.set_loss_detection_timer(now);
        }
    }

    //
    // Egress
    //

    /// The protection level new application-space packets use
    fn write_level(&self) -> EncryptionLevel {
        if self.spaces[SpaceId::Data as usize].crypto.is_some() {
            return EncryptionLevel::OneRtt;
        }
        if self.spaces[SpaceId::Handshake as usize].crypto.is_some() {
            return EncryptionLevel::Handshake;
        }
        if self.zero_rtt_keys.is_some() {
            return EncryptionLevel::ZeroRtt;
        }
        EncryptionLevel::Initial
    }

    /// Whether a write wake would produce at least one packet
    pub fn has_pending_writes(&self) -> bool {
        if matches!(self.state, State::Drained | State::Draining) {
            return false;
        }
        if let State::Closing { close_sent, .. } = self.state {
            return !close_sent;
        }
        SpaceId::iter().any(|id| {
            let space = &self.spaces[id as usize];
            space.crypto.is_some() && !space.can_send().is_empty()
        }) || self.streams.has_sendable()
            || !self.streams.pending_control.is_empty()
            || self.datagrams.has_outgoing()
    }

    /// Fill `batch` with as many packets as congestion, pacing, and
    /// available data allow, then flush it
    ///
    /// Returns the number of packets handed to the batch.
    pub fn write_packets<W: BatchWriter>(
        &mut self,
        now: Instant,
        batch: &mut IoBatch<W>,
    ) -> Result<usize, BatchError> {
        if matches!(self.state, State::Drained | State::Draining) {
            return Ok(0);
        }
        let mut sent_total = 0;

        // A closing connection emits its CONNECTION_CLOSE once and nothing
        // else
        if let State::Closing { .. } = self.state {
            let reason = match self.state {
                State::Closing {
                    ref reason,
                    close_sent,
                } => {
                    if close_sent {
                        return Ok(0);
                    }
                    reason.clone()
                }
                _ => unreachable!(),
            };
            if let Some(payload) = self.build_close_packet(now, &reason) {
                batch.write(self.transmit(payload))?;
                sent_total += 1;
            }
            if let State::Closing {
                ref mut close_sent, ..
            } = self.state
            {
                *close_sent = true;
            }
            batch.flush()?;
            return Ok(sent_total);
        }

        // Stream-level control frames ride in the application space
        let control = mem::take(&mut self.streams.pending_control);
        self.spaces[SpaceId::Data as usize].pending |= control;

        for space_id in SpaceId::iter() {
            loop {
                let Some(level) = self.send_level(space_id) else {
                    break;
                };
                let mut sendable = self.spaces[space_id as usize].can_send();
                if space_id == SpaceId::Data {
                    sendable.other |= self.streams.has_sendable() || self.datagrams.has_outgoing();
                }
                let probe = self.spaces[space_id as usize].loss_probes > 0;
                if sendable.is_empty() && !probe {
                    break;
                }

                // Probes and pure acks are exempt from congestion control
                let mtu = u64::from(self.config.max_udp_payload_size);
                let congestion_blocked = self.in_flight_total() + mtu > self.congestion.window();
                let ack_only = sendable.acks && !sendable.other;
                if congestion_blocked && !probe && !ack_only {
                    break;
                }
                if self.config.pacing_enabled && !probe && !ack_only {
                    if let Some(deadline) = self.pacer.delay(
                        self.rtt.get(),
                        self.config.max_udp_payload_size,
                        self.congestion.window(),
                        now,
                    ) {
                        self.timers.set(Timer::Pacing, deadline);
                        break;
                    }
                }
                if probe {
                    let space = &mut self.spaces[space_id as usize];
                    space.loss_probes -= 1;
                    // Prefer real data for the probe; fabricate a ping only
                    // when there is nothing else to say
                    if space.pending.is_empty()
                        && !(space_id == SpaceId::Data && self.streams.has_sendable())
                    {
                        space.ping_pending = true;
                    }
                }

                match self.build_packet(now, space_id, level) {
                    Some(payload) => {
                        batch.write(self.transmit(payload))?;
                        sent_total += 1;
                    }
                    None => break,
                }
            }
        }
        batch.flush()?;
        Ok(sent_total)
    }

    fn transmit(&self, payload: Bytes) -> Transmit {
        Transmit {
            payload,
            cmsgs: if self.cmsgs.is_empty() {
                None
            } else {
                Some(Arc::new(self.cmsgs.clone()))
            },
        }
    }

    /// The level the next packet in `space_id` would be protected at, if any
    fn send_level(&self, space_id: SpaceId) -> Option<EncryptionLevel> {
        match space_id {
            SpaceId::Initial => self.spaces[SpaceId::Initial as usize]
                .crypto
                .as_ref()
                .map(|_| EncryptionLevel::Initial),
            SpaceId::Handshake => self.spaces[SpaceId::Handshake as usize]
                .crypto
                .as_ref()
                .map(|_| EncryptionLevel::Handshake),
            SpaceId::Data => {
                if self.spaces[SpaceId::Data as usize].crypto.is_some() {
                    Some(EncryptionLevel::OneRtt)
                } else if self.zero_rtt_keys.is_some() {
                    Some(EncryptionLevel::ZeroRtt)
                } else {
                    None
                }
            }
        }
    }

    fn seal_key(&self, level: EncryptionLevel) -> &dyn PacketKey {
        match level {
            EncryptionLevel::ZeroRtt => &*self.zero_rtt_keys.as_ref().unwrap().packet,
            _ => &*self.spaces[level.space() as usize]
                .crypto
                .as_ref()
                .unwrap()
                .packet
                .local,
        }
    }

    fn build_close_packet(&mut self, now: Instant, reason: &Close) -> Option<Bytes> {
        let level = self.write_level();
        let space_id = level.space();
        let tag_len = self.seal_key(level).tag_len();
        let mtu = self.config.max_udp_payload_size as usize;
        let mut buf = Vec::with_capacity(mtu);
        let pn = self.spaces[space_id as usize].get_tx_number();
        let number = PacketNumber::new(
            pn,
            self.spaces[space_id as usize]
                .largest_acked_packet
                .unwrap_or(0),
        );
        let (pn_offset, len_offset) = HeaderBuilder::encode(
            level,
            &self.rem_cid,
            &self.local_cid,
            self.version,
            &self.retry_token,
            number,
            self.key_phase,
            &mut buf,
        );
        let header_len = buf.len();
        reason.encode(&mut buf, mtu - header_len - tag_len);
        self.seal(level, pn, pn_offset, len_offset, header_len, &mut buf);
        self.spaces[space_id as usize].time_of_last_ack_eliciting_packet = Some(now);
        Some(buf.into())
    }

    /// Assemble, seal, and record one packet; `None` when no frame fit
    fn build_packet(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        level: EncryptionLevel,
    ) -> Option<Bytes> {
        let tag_len = self.seal_key(level).tag_len();
        let mtu = self.config.max_udp_payload_size as usize;
        let mut buf = Vec::with_capacity(mtu);
        let pn = self.spaces[space_id as usize].get_tx_number();
        let number = PacketNumber::new(
            pn,
            self.spaces[space_id as usize]
                .largest_acked_packet
                .unwrap_or(0),
        );
        let (pn_offset, len_offset) = HeaderBuilder::encode(
            level,
            &self.rem_cid,
            &self.local_cid,
            self.version,
            &self.retry_token,
            number,
            self.key_phase,
            &mut buf,
        );
        let header_len = buf.len();
        let max_payload_end = mtu - tag_len;
        let mut sent = SentFrames::default();

        // Acknowledgments lead so they survive even a crowded packet
        if self.spaces[space_id as usize].pending_acks.can_send() {
            self.write_ack(space_id, now, &mut buf, &mut sent);
        }

        if self.spaces[space_id as usize].ping_pending {
            frame::FrameType::PING.encode(&mut buf);
            self.spaces[space_id as usize].ping_pending = false;
            sent.ack_eliciting = true;
            if space_id == SpaceId::Data && self.app_ping_armed {
                self.app_ping_armed = false;
                self.app_ping_sent = Some((space_id, pn));
            }
        }

        if let Some(token) = self.spaces[space_id as usize].pending.path_response.take() {
            frame::FrameType::PATH_RESPONSE.encode(&mut buf);
            Codec::encode(&token, &mut buf);
            sent.ack_eliciting = true;
        }

        // CRYPTO data
        while buf.len() + frame::Crypto::SIZE_BOUND < max_payload_end {
            let Some(mut crypto) = self.spaces[space_id as usize].pending.crypto.pop_front()
            else {
                break;
            };
            let room = max_payload_end - buf.len() - frame::Crypto::SIZE_BOUND;
            if room == 0 {
                self.spaces[space_id as usize]
                    .pending
                    .crypto
                    .push_front(crypto);
                break;
            }
            if crypto.data.len() > room {
                let rest = crypto.data.split_off(room);
                self.spaces[space_id as usize]
                    .pending
                    .crypto
                    .push_front(frame::Crypto {
                        offset: crypto.offset + room as u64,
                        data: rest,
                    });
            }
            crypto.encode(&mut buf);
            sent.retransmits.crypto.push_back(crypto);
            sent.ack_eliciting = true;
        }

        if space_id == SpaceId::Data {
            self.write_control_frames(now, &mut buf, max_payload_end, &mut sent);

            // Unreliable datagrams
            while self.datagrams.write(&mut buf, max_payload_end) {
                sent.ack_eliciting = true;
            }

            // Stream data fills whatever is left
            use frame::FrameStruct;
            while buf.len() + frame::Stream::SIZE_BOUND < max_payload_end {
                let max_len = (max_payload_end - buf.len() - frame::Stream::SIZE_BOUND) as u64;
                let Some((meta, payload)) = self.streams.poll_transmit(max_len) else {
                    break;
                };
                if let Some(data) = payload {
                    meta.encode(true, &mut buf);
                    buf.extend_from_slice(&data);
                }
                // Metadata-only chunks are transmitted by the external body
                // source; we only account for them
                sent.stream_frames.push(meta);
                sent.ack_eliciting = true;
            }
        }

        if buf.len() == header_len {
            // Nothing to say after all
            return None;
        }

        // Client Initial flights must fill out the datagram
        let mut padded = false;
        if self.side.is_client() && level == EncryptionLevel::Initial {
            let target = MIN_INITIAL_SIZE as usize - tag_len;
            if buf.len() < target {
                buf.resize(target, 0);
                padded = true;
            }
        }

        self.seal(level, pn, pn_offset, len_offset, header_len, &mut buf);
        let size = buf.len() as u16;

        let in_flight = sent.ack_eliciting || padded;
        let space = &mut self.spaces[space_id as usize];
        space.sent_packets.insert(
            pn,
            SentPacket {
                time_sent: now,
                level,
                size,
                ack_eliciting: sent.ack_eliciting,
                in_flight,
                declared_lost: false,
                acks: sent.acks,
                retransmits: sent.retransmits,
                stream_frames: sent.stream_frames,
                clone_group: None,
            },
        );
        if in_flight {
            space.in_flight += u64::from(size);
        }
        if sent.ack_eliciting {
            space.time_of_last_ack_eliciting_packet = Some(now);
        }
        self.congestion.on_sent(now, u64::from(size), pn);
        self.pacer.on_transmit(size);
        self.set_loss_detection_timer(now);
        if let Some(interval) = self.config.keep_alive_interval {
            self.timers.set(Timer::KeepAlive, now + interval);
        }
        Some(buf.into())
    }

    fn seal(
        &mut self,
        level: EncryptionLevel,
        pn: u64,
        pn_offset: usize,
        len_offset: Option<usize>,
        header_len: usize,
        buf: &mut Vec<u8>,
    ) {
        let tag_len = self.seal_key(level).tag_len();
        buf.resize(buf.len() + tag_len, 0);
        if let Some(off) = len_offset {
            HeaderBuilder::patch_length(buf, off, pn_offset);
        }
        match level {
            EncryptionLevel::ZeroRtt => {
                let keys = self.zero_rtt_keys.as_ref().unwrap();
                keys.packet.encrypt(pn, buf, header_len);
                keys.header.encrypt(pn_offset, buf);
            }
            _ => {
                let keys = self.spaces[level.space() as usize].crypto.as_ref().unwrap();
                keys.packet.local.encrypt(pn, buf, header_len);
                keys.header.local.encrypt(pn_offset, buf);
            }
        }
    }

    fn write_ack(
        &mut self,
        space_id: SpaceId,
        now: Instant,
        buf: &mut Vec<u8>,
        sent: &mut SentFrames,
    ) {
        // Delay since the newest packet arrived, scaled by our exponent
        let (delay_micros, ranges, timestamps) = {
            let space = &mut self.spaces[space_id as usize];
            let delay = space
                .pending_acks
                .largest_recv_time
                .map_or(0, |t| now.saturating_duration_since(t).as_micros() as u64);
            let ranges = space.pending_acks.ranges.clone();
            let timestamps = if space_id == SpaceId::Data
                && self.peer_params.ack_receive_timestamps.is_some()
            {
                Some(encode_timestamps(
                    &space.recv_timestamps,
                    now,
                    self.peer_params
                        .ack_receive_timestamps
                        .map_or(0, |c| c.exponent),
                ))
            } else {
                None
            };
            space.recv_timestamps.clear();
            (delay, ranges, timestamps)
        };
        if ranges.is_empty() {
            return;
        }
        let delay = delay_micros >> self.config.ack_delay_exponent;
        frame::Ack::encode(delay, &ranges, None, timestamps.as_deref(), buf);
        self.spaces[space_id as usize].pending_acks.acks_sent();
        sent.acks = ranges;
    }

    fn write_control_frames(
        &mut self,
        now: Instant,
        buf: &mut Vec<u8>,
        max_payload_end: usize,
        sent: &mut SentFrames,
    ) {
        use frame::FrameStruct;

        // RESET_STREAM / RESET_STREAM_AT
        while buf.len() + frame::ResetStream::SIZE_BOUND < max_payload_end {
            let Some(rst) = self.spaces[SpaceId::Data as usize].pending.reset_stream.pop() else {
                break;
            };
            rst.encode(buf);
            sent.retransmits.reset_stream.push(rst);
            sent.ack_eliciting = true;
        }

        // STOP_SENDING
        while buf.len() + frame::StopSending::SIZE_BOUND < max_payload_end {
            let Some(stop) = self.spaces[SpaceId::Data as usize].pending.stop_sending.pop() else {
                break;
            };
            stop.encode(buf);
            sent.retransmits.stop_sending.push(stop);
            sent.ack_eliciting = true;
        }

        // MAX_DATA
        if self.spaces[SpaceId::Data as usize].pending.max_data
            && buf.len() + 9 < max_payload_end
        {
            self.spaces[SpaceId::Data as usize].pending.max_data = false;
            let value = self.streams.conn_max_data_value(now);
            frame::FrameType::MAX_DATA.encode(buf);
            VarInt::from_u64(value).unwrap().encode(buf);
            sent.retransmits.max_data = true;
            sent.ack_eliciting = true;
        }

        // MAX_STREAM_DATA
        loop {
            if buf.len() + 17 >= max_payload_end {
                break;
            }
            let Some(&id) = self.spaces[SpaceId::Data as usize]
                .pending
                .max_stream_data
                .iter()
                .next()
            else {
                break;
            };
            self.spaces[SpaceId::Data as usize]
                .pending
                .max_stream_data
                .remove(&id);
            let Some(value) = self.streams.max_stream_data_value(id, now) else {
                continue;
            };
            frame::FrameType::MAX_STREAM_DATA.encode(buf);
            Codec::encode(&id, buf);
            VarInt::from_u64(value).unwrap().encode(buf);
            sent.retransmits.max_stream_data.insert(id);
            sent.ack_eliciting = true;
        }

        // MAX_STREAMS
        for (dir, flag) in [(Dir::Bi, true), (Dir::Uni, false)] {
            let pending = if flag {
                &mut self.spaces[SpaceId::Data as usize].pending.max_bi_stream_id
            } else {
                &mut self.spaces[SpaceId::Data as usize].pending.max_uni_stream_id
            };
            if *pending && buf.len() + 9 < max_payload_end {
                *pending = false;
                match dir {
                    Dir::Bi => frame::FrameType::MAX_STREAMS_BIDI.encode(buf),
                    Dir::Uni => frame::FrameType::MAX_STREAMS_UNI.encode(buf),
                }
                VarInt::from_u64(self.streams.max_remote(dir))
                    .unwrap()
                    .encode(buf);
                match dir {
                    Dir::Bi => sent.retransmits.max_bi_stream_id = true,
                    Dir::Uni => sent.retransmits.max_uni_stream_id = true,
                }
                sent.ack_eliciting = true;
            }
        }

        // Knob frames
        while buf.len() + frame::Knob::SIZE_BOUND < max_payload_end {
            let Some(knob) = self.spaces[SpaceId::Data as usize].pending.knobs.pop() else {
                break;
            };
            if buf.len() + frame::Knob::SIZE_BOUND + knob.payload.len() >= max_payload_end {
                self.spaces[SpaceId::Data as usize].pending.knobs.push(knob);
                break;
            }
            knob.encode(buf);
            sent.retransmits.knobs.push(knob);
            sent.ack_eliciting = true;
        }
    }

    //
    // Timers
    //

    /// Process timer expiry
    pub fn handle_timeout(&mut self, now: Instant) {
        while let Some(timer) = self.timers.expire_before(now) {
            match timer {
                Timer::Idle => {
                    if self.state.is_closed() {
                        // Already terminating; let the close timer finish it
                        continue;
                    }
                    debug!("idle timeout expired");
                    self.error = Some(ConnectionError::TimedOut);
                    self.events.push_back(Event::ConnectionLost {
                        reason: ConnectionError::TimedOut,
                    });
                    self.state = State::Drained;
                }
                Timer::Close => {
                    self.state = State::Drained;
                }
                Timer::CloseGrace => {
                    if self.graceful {
                        self.finish_graceful_close(now);
                    }
                }
                Timer::LossDetection => {
                    self.on_loss_detection_timeout(now);
                }
                Timer::KeepAlive => {
                    self.spaces[SpaceId::Data as usize].ping_pending = true;
                    if let Some(interval) = self.config.keep_alive_interval {
                        self.timers.set(Timer::KeepAlive, now + interval);
                    }
                }
                Timer::Ping => {
                    if self.app_ping_sent.take().is_some() || self.app_ping_armed {
                        self.app_ping_armed = false;
                        self.events.push_back(Event::Ping(PingResult::Timeout));
                    }
                }
                Timer::Pacing => {
                    // The reactor wakes and calls write_packets
                }
                Timer::KeyDiscard => {
                    self.prev_1rtt_read_key = None;
                }
            }
        }
    }

    fn reset_idle_timer(&mut self, now: Instant) {
        let local = self.config.max_idle_timeout;
        let peer = self.peer_params.idle_timeout;
        let timeout = match (local, peer) {
            (Some(local), peer) if peer > Duration::ZERO => Some(local.min(peer)),
            (Some(local), _) => Some(local),
            (None, peer) if peer > Duration::ZERO => Some(peer),
            (None, _) => None,
        };
        match timeout {
            Some(t) => self.timers.set(Timer::Idle, now + t),
            None => self.timers.stop(Timer::Idle),
        }
    }

    fn in_flight_total(&self) -> u64 {
        self.spaces.iter().map(|s| s.in_flight).sum()
    }

    fn discard_space(&mut self, now: Instant, space_id: SpaceId) {
        debug_assert!(
            space_id != SpaceId::Data,
            "application space is never discarded"
        );
        let freed = self.spaces[space_id as usize].discard();
        if freed > 0 {
            trace!(?space_id, freed, "space discarded");
        }
        self.set_loss_detection_timer(now);
    }

    //
    // Closing
    //

    fn close_on_error(&mut self, now: Instant, error: TransportError) {
        debug!(%error, "closing connection");
        self.events.push_back(Event::ConnectionLost {
            reason: ConnectionError::TransportError(error.clone()),
        });
        self.error = Some(ConnectionError::TransportError(error.clone()));
        self.state = State::Closing {
            reason: Close::from(error),
            close_sent: false,
        };
        self.timers
            .set(Timer::Close, now + DRAIN_PTO_FACTOR * self.pto(SpaceId::Data));
    }

    /// Close immediately with an application error code
    pub fn close(&mut self, now: Instant, error_code: VarInt, reason: Bytes) {
        if self.state.is_closed() {
            return;
        }
        self.error = Some(ConnectionError::LocallyClosed);
        self.state = State::Closing {
            reason: Close::Application(ApplicationClose { error_code, reason }),
            close_sent: false,
        };
        self.timers
            .set(Timer::Close, now + DRAIN_PTO_FACTOR * self.pto(SpaceId::Data));
    }

    /// Stop accepting new work and close once outstanding deliveries drain,
    /// or once a bounded grace period expires
    pub fn close_gracefully(&mut self, now: Instant) {
        if self.state.is_closed() || self.graceful {
            return;
        }
        self.graceful = true;
        self.timers.set(
            Timer::CloseGrace,
            now + DRAIN_PTO_FACTOR * self.pto(SpaceId::Data),
        );
        self.maybe_finish_graceful_close(now);
    }

    fn maybe_finish_graceful_close(&mut self, now: Instant) {
        if self.graceful && !self.streams.has_undelivered_data() {
            self.finish_graceful_close(now);
        }
    }

    fn finish_graceful_close(&mut self, now: Instant) {
        self.graceful = false;
        self.error = Some(ConnectionError::LocallyClosed);
        self.state = State::Closing {
            reason: Close::Connection(ConnectionClose {
                error_code: crate::transport_error::Code::NO_ERROR,
                frame_type: None,
                reason: Bytes::new(),
            }),
            close_sent: false,
        };
        self.timers
            .set(Timer::Close, now + DRAIN_PTO_FACTOR * self.pto(SpaceId::Data));
    }

    /// Reset every non-control stream in both directions and surface the
    /// errors to the application immediately
    pub fn reset_non_control_streams(&mut self, now: Instant, error_code: VarInt, _reason: &str) {
        let rtt = self.rtt.has_sample().then(|| self.rtt.get());
        for id in self.streams.ids() {
            if self.streams.is_control(id) {
                continue;
            }
            if id.sendable_by(self.side) {
                let _ = self.streams.reset(id, error_code, None);
                self.streams
                    .events()
                    .push_back(StreamEvent::Stopped { id, error_code });
            }
            if id.receivable_by(self.side) {
                let _ = self.streams.stop_sending(id, error_code, now, rtt);
                self.streams
                    .events()
                    .push_back(StreamEvent::Readable { id });
            }
        }
    }

    //
    // Stream API
    //

    /// Open a bidirectional stream
    pub fn open_bidi(&mut self) -> Result<StreamId, OpenError> {
        self.check_open()?;
        self.streams.open(Dir::Bi)
    }

    /// Open a unidirectional stream
    pub fn open_uni(&mut self) -> Result<StreamId, OpenError> {
        self.check_open()?;
        self.streams.open(Dir::Uni)
    }

    /// Open a bidirectional stream inside a stream group
    pub fn open_bidi_in_group(&mut self, group: StreamGroupId) -> Result<StreamId, OpenError> {
        self.check_open()?;
        self.streams.open_in_group(Dir::Bi, group)
    }

    /// Open a unidirectional stream inside a stream group
    pub fn open_uni_in_group(&mut self, group: StreamGroupId) -> Result<StreamId, OpenError> {
        self.check_open()?;
        self.streams.open_in_group(Dir::Uni, group)
    }

    /// Create a bidirectional stream group
    pub fn create_bidi_group(&mut self) -> Result<StreamGroupId, OpenError> {
        self.check_open()?;
        self.streams.create_group(Dir::Bi)
    }

    /// Create a unidirectional stream group
    pub fn create_uni_group(&mut self) -> Result<StreamGroupId, OpenError> {
        self.check_open()?;
        self.streams.create_group(Dir::Uni)
    }

    fn check_open(&self) -> Result<(), OpenError> {
        if self.state.is_closed() || self.graceful {
            return Err(OpenError::ConnectionClosed);
        }
        Ok(())
    }

    /// Install, replace, or (`None`) restore the default retransmission
    /// policy for a stream group
    pub fn set_stream_group_retransmission_policy(
        &mut self,
        group: StreamGroupId,
        policy: Option<RetransmissionPolicy>,
    ) -> Result<(), OpenError> {
        self.streams.set_group_policy(group, policy)
    }

    /// Write application data to a stream
    pub fn write(&mut self, id: StreamId, data: &mut Bytes, fin: bool) -> Result<usize, WriteError> {
        if self.state.is_closed() || self.graceful {
            return Err(WriteError::ConnectionClosed);
        }
        if matches!(self.state, State::Handshaking)
            && self.zero_rtt_keys.is_none()
            && self.spaces[SpaceId::Data as usize].crypto.is_none()
        {
            // Data cannot leave yet and there is no early-data promise;
            // refuse rather than buffer unboundedly
            return Err(WriteError::Blocked);
        }
        self.streams.write(id, data, fin)
    }

    /// Record `len` bytes of externally-stored data on a stream (zero-copy
    /// body source); only metadata is retained for retransmission accounting
    pub fn write_meta(&mut self, id: StreamId, len: u64, fin: bool) -> Result<u64, WriteError> {
        if self.state.is_closed() || self.graceful {
            return Err(WriteError::ConnectionClosed);
        }
        self.streams.write_meta(id, len, fin)
    }

    /// Signal the end of a stream without further data
    pub fn finish(&mut self, id: StreamId) -> Result<(), FinishError> {
        self.streams.finish(id)
    }

    /// Reset a stream, optionally guaranteeing delivery of the first
    /// `reliable_size` bytes
    pub fn reset(
        &mut self,
        id: StreamId,
        error_code: VarInt,
        reliable_size: Option<u64>,
    ) -> Result<(), WriteError> {
        if self.state.is_closed() {
            return Err(WriteError::ConnectionClosed);
        }
        self.streams.reset(id, error_code, reliable_size)
    }

    /// Ask the peer to stop sending on a stream
    pub fn stop_sending(
        &mut self,
        id: StreamId,
        error_code: VarInt,
        now: Instant,
    ) -> Result<(), ReadError> {
        if self.state.is_closed() {
            return Err(ReadError::ConnectionClosed);
        }
        let rtt = self.rtt.has_sample().then(|| self.rtt.get());
        self.streams.stop_sending(id, error_code, now, rtt)
    }

    /// Ordered read of up to `max_len` bytes
    pub fn read(
        &mut self,
        id: StreamId,
        max_len: usize,
        now: Instant,
    ) -> Result<Option<Bytes>, ReadError> {
        let rtt = self.rtt.has_sample().then(|| self.rtt.get());
        self.streams.read(id, max_len, now, rtt)
    }

    /// Copy readable data without consuming it; repeated calls walk forward
    pub fn peek(&mut self, id: StreamId, max_len: usize) -> Result<Option<(u64, Bytes)>, ReadError> {
        self.streams.peek(id, max_len)
    }

    /// Discard `amount` readable bytes
    pub fn consume(&mut self, id: StreamId, amount: u64, now: Instant) -> Result<(), ConsumeError> {
        let rtt = self.rtt.has_sample().then(|| self.rtt.get());
        self.streams.consume(id, None, amount, now, rtt)
    }

    /// Offset-checked variant of [`consume`](Self::consume); fails with the
    /// expected offset when `offset` is stale
    pub fn consume_at(
        &mut self,
        id: StreamId,
        offset: u64,
        amount: u64,
        now: Instant,
    ) -> Result<(), ConsumeError> {
        let rtt = self.rtt.has_sample().then(|| self.rtt.get());
        self.streams.consume(id, Some(offset), amount, now, rtt)
    }

    /// Suppress Readable events and reads for a stream
    pub fn pause_read(&mut self, id: StreamId) -> Result<(), ReadError> {
        self.streams.set_read_paused(id, true)
    }

    /// Resume Readable events for a stream
    pub fn resume_read(&mut self, id: StreamId) -> Result<(), ReadError> {
        self.streams.set_read_paused(id, false)
    }

    /// Suppress peeks for a stream
    pub fn pause_peek(&mut self, id: StreamId) -> Result<(), ReadError> {
        self.streams.set_peek_paused(id, true)
    }

    /// Resume peeks for a stream
    pub fn resume_peek(&mut self, id: StreamId) -> Result<(), ReadError> {
        self.streams.set_peek_paused(id, false)
    }

    /// Request an event when a byte milestone is reached
    pub fn set_byte_event(
        &mut self,
        kind: ByteEventKind,
        id: StreamId,
        offset: u64,
    ) -> Result<(), WriteError> {
        self.streams.register_byte_event(kind, id, offset)
    }

    /// Mark a stream as a protocol control stream, shielding it from
    /// [`reset_non_control_streams`](Self::reset_non_control_streams)
    pub fn set_control_stream(&mut self, id: StreamId) -> bool {
        self.streams.set_control(id, true)
    }

    /// Bytes the application may write to `id` before blocking
    pub fn max_writable_on_stream(&self, id: StreamId) -> Result<u64, WriteError> {
        self.streams.max_writable(id)
    }

    /// Connection-level send credit remaining
    pub fn connection_flow_credit(&self) -> u64 {
        self.streams.conn_send.available()
    }

    /// Replace the connection-level receive window
    pub fn set_connection_flow_control_window(&mut self, window: u64) {
        self.streams.conn_recv.set_window(window);
        self.streams.pending_control.max_data = true;
    }

    /// Replace a stream's receive window
    pub fn set_stream_flow_control_window(
        &mut self,
        id: StreamId,
        window: u64,
    ) -> Result<(), ReadError> {
        self.streams.set_stream_recv_window(id, window)
    }

    /// Advance the scheduler to the next stream after `n` frames
    pub fn schedule_streams_by_nexts(&mut self, n: u64) {
        self.streams.pending.advance_after_next(n);
    }

    /// Advance the scheduler to the next stream after `bytes` bytes
    pub fn schedule_streams_by_bytes(&mut self, bytes: u64) {
        self.streams.pending.advance_after_bytes(bytes);
    }

    //
    // Datagrams
    //

    /// Queue an unreliable datagram
    pub fn write_datagram(&mut self, data: Bytes) -> Result<(), SendDatagramError> {
        if self.config.datagram_receive_buffer_size.is_none() {
            return Err(SendDatagramError::Disabled);
        }
        let max = self
            .peer_params
            .max_datagram_write_size()
            .ok_or(SendDatagramError::UnsupportedByPeer)?;
        if data.len() as u64 > max {
            return Err(SendDatagramError::TooLarge);
        }
        self.datagrams
            .queue_send(data, self.config.datagram_send_buffer_size);
        Ok(())
    }

    /// Pop up to `at_most` received datagrams with their receive times; zero
    /// means all
    pub fn read_datagrams(&mut self, at_most: usize) -> Vec<ReceivedDatagram> {
        self.datagrams.recv(at_most)
    }

    /// Pop up to `at_most` received datagram payloads; zero means all
    pub fn read_datagram_bufs(&mut self, at_most: usize) -> Vec<Bytes> {
        self.datagrams
            .recv(at_most)
            .into_iter()
            .map(|d| d.data)
            .collect()
    }

    /// Datagrams dropped by the bounded queues, as (received, sent)
    pub fn datagrams_dropped(&self) -> (u64, u64) {
        (self.datagrams.recv_dropped, self.datagrams.send_dropped)
    }

    //
    // Liveness and extensions
    //

    /// Send a PING and report [`Event::Ping`] with the outcome; `timeout`
    /// bounds the wait
    pub fn send_ping(&mut self, now: Instant, timeout: Duration) {
        self.spaces[SpaceId::Data as usize].ping_pending = true;
        self.app_ping_armed = true;
        self.app_ping_sent = None;
        self.timers.set(Timer::Ping, now + timeout);
    }

    /// Queue a knob frame for the peer
    pub fn send_knob(&mut self, space: u64, id: u64, payload: Bytes) -> Result<(), KnobError> {
        if self.state.is_closed() {
            return Err(KnobError::ConnectionClosed);
        }
        if !self.peer_params.knob_frames_supported {
            return Err(KnobError::UnsupportedByPeer);
        }
        self.spaces[SpaceId::Data as usize]
            .pending
            .knobs
            .push(frame::Knob { space, id, payload });
        Ok(())
    }

    /// Replace the ancillary data applied to subsequent sendmsg calls
    ///
    /// Already-queued packets are unaffected.
    pub fn set_cmsgs(&mut self, cmsgs: Vec<SocketCmsg>) {
        self.cmsgs = cmsgs;
    }

    /// Append ancillary data for subsequent sendmsg calls
    pub fn append_cmsgs(&mut self, cmsgs: &[SocketCmsg]) {
        self.cmsgs.extend_from_slice(cmsgs);
    }

    /// The resumption record for this server, once its parameters arrived
    pub fn server_cached_params(&self) -> Option<CachedServerParameters> {
        self.server_params_cache
    }

    /// The peer's declared minimum ack delay, if it offered one
    pub fn peer_min_ack_delay(&self) -> Option<Duration> {
        self.peer_params.min_ack_delay
    }

    /// How many connection IDs the peer is willing to track
    pub fn peer_active_cid_limit(&self) -> u64 {
        self.peer_params.active_cid_limit
    }

    /// The peer's stateless reset token for the current CID, if provided
    pub fn peer_stateless_reset_token(&self) -> Option<[u8; crate::RESET_TOKEN_SIZE]> {
        self.peer_params.stateless_reset_token
    }

    /// Connection IDs issued by the peer and not yet retired
    pub fn available_peer_cids(&self) -> usize {
        self.peer_cids.len()
    }

    /// Whether a rejected 0-RTT payload may be replayed on a successor
    /// connection
    pub fn can_resend_zero_rtt(&self) -> Option<bool> {
        self.handshake.can_resend_zero_rtt()
    }
}

/// What went into a packet, for the outstanding table
#[derive(Default)]
struct SentFrames {
    ack_eliciting: bool,
    acks: RangeSet,
    retransmits: Retransmits,
    stream_frames: StreamMetaVec,
}

/// Encode the receive-timestamp section: count, then per entry the packet
/// number delta and the scaled microsecond age, newest first
fn encode_timestamps(
    timestamps: &VecDeque<(u64, Instant)>,
    now: Instant,
    exponent: u64,
) -> Vec<u8> {
    use crate::coding::BufMutExt;
    let mut buf = Vec::new();
    buf.write_var(timestamps.len() as u64);
    let mut prev_pn = None;
    for &(pn, when) in timestamps.iter().rev() {
        let gap = prev_pn.map_or(0, |p: u64| p.saturating_sub(pn));
        prev_pn = Some(pn);
        buf.write_var(gap);
        let age = now.saturating_duration_since(when).as_micros() as u64;
        buf.write_var(age >> exponent);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::testing::ScriptedSession,
        test_util::subscribe,
        transport_parameters::{ServerParameters, TransportParameterId},
        TransportErrorCode,
    };
    use assert_matches::assert_matches;
    use std::net::{IpAddr, Ipv4Addr};

    use super::batch::testing::RecordingWriter;

    const VERSION: u32 = 0x0000_0001;

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4433)
    }

    fn cids() -> (ConnectionId, ConnectionId, ConnectionId) {
        (
            ConnectionId::new(&[0xc1; 8]), // client
            ConnectionId::new(&[0x51; 8]), // server
            ConnectionId::new(&[0x0d; 8]), // original destination
        )
    }

    fn server_params(server_cid: &ConnectionId, orig: &ConnectionId) -> ServerParameters {
        let mut params = ServerParameters::default();
        params
            .push_cid(TransportParameterId::INITIAL_SOURCE_CONNECTION_ID, server_cid)
            .push_cid(TransportParameterId::ORIGINAL_DESTINATION_CONNECTION_ID, orig)
            .push_int(TransportParameterId::INITIAL_MAX_DATA, 1 << 20)
            .push_int(TransportParameterId::INITIAL_MAX_STREAM_DATA_BIDI_LOCAL, 1 << 16)
            .push_int(TransportParameterId::INITIAL_MAX_STREAM_DATA_BIDI_REMOTE, 1 << 16)
            .push_int(TransportParameterId::INITIAL_MAX_STREAM_DATA_UNI, 1 << 16)
            .push_int(TransportParameterId::INITIAL_MAX_STREAMS_BIDI, 16)
            .push_int(TransportParameterId::INITIAL_MAX_STREAMS_UNI, 16)
            .push_int(TransportParameterId::MAX_IDLE_TIMEOUT, 30_000);
        params
    }

    fn client(params: ServerParameters) -> (Connection, Instant) {
        let (client_cid, _, orig) = cids();
        let now = Instant::now();
        let conn = Connection::connect(
            Arc::new(TransportConfig::default()),
            Box::new(ScriptedSession::new(params)),
            VERSION,
            client_cid,
            orig,
            addr(),
            None,
            now,
        )
        .unwrap();
        (conn, now)
    }

    /// Build a server-to-client packet sealed with the null test keys
    fn server_packet(
        level: EncryptionLevel,
        dst: &ConnectionId,
        src: &ConnectionId,
        pn: u64,
        frames: &[u8],
    ) -> BytesMut {
        let mut buf = Vec::new();
        let number = PacketNumber::new(pn, pn.saturating_sub(1));
        let (pn_offset, len_offset) = HeaderBuilder::encode(
            level, dst, src, VERSION, &[], number, false, &mut buf,
        );
        buf.extend_from_slice(frames);
        buf.resize(buf.len() + 16, 0); // null AEAD tag
        if let Some(off) = len_offset {
            HeaderBuilder::patch_length(&mut buf, off, pn_offset);
        }
        BytesMut::from(&buf[..])
    }

    fn crypto_frame(data: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        frame::Crypto {
            offset: 0,
            data: Bytes::copy_from_slice(data),
        }
        .encode(&mut buf);
        buf
    }

    fn ack_frame(largest: u64) -> Vec<u8> {
        let mut ranges = RangeSet::new();
        ranges.insert(0..largest + 1);
        let mut buf = Vec::new();
        frame::Ack::encode(0, &ranges, None, None, &mut buf);
        buf
    }

    /// Drive the handshake through both server flights
    fn establish(conn: &mut Connection, now: Instant) {
        let (client_cid, server_cid, _) = cids();
        conn.handle_datagram(
            now,
            server_packet(
                EncryptionLevel::Initial,
                &client_cid,
                &server_cid,
                0,
                &crypto_frame(b"server hello"),
            ),
        );
        conn.handle_datagram(
            now,
            server_packet(
                EncryptionLevel::Handshake,
                &client_cid,
                &server_cid,
                0,
                &crypto_frame(b"server finished"),
            ),
        );
    }

    fn drain_events(conn: &mut Connection) -> Vec<Event> {
        let mut out = Vec::new();
        while let Some(event) = conn.poll() {
            out.push(event);
        }
        out
    }

    #[test]
    fn handshake_establishes() {
        let _guard = subscribe();
        let (_, server_cid, orig) = cids();
        let (mut conn, now) = client(server_params(&server_cid, &orig));
        assert!(!conn.is_established());
        establish(&mut conn, now);
        assert!(conn.is_established());
        let events = drain_events(&mut conn);
        assert!(events.iter().any(|e| matches!(e, Event::Connected)));
        // Resumption record captured for the application
        let cached = conn.server_cached_params().unwrap();
        assert_eq!(cached.initial_max_data, 1 << 20);
    }

    #[test]
    fn first_flight_is_padded_initial() {
        let (_, server_cid, orig) = cids();
        let (mut conn, now) = client(server_params(&server_cid, &orig));
        let mut batch = IoBatch::new(RecordingWriter::default(), 1);
        let sent = conn.write_packets(now, &mut batch).unwrap();
        assert!(sent >= 1);
        let first = &batch.writer().calls[0][0];
        assert!(first.payload.len() >= MIN_INITIAL_SIZE as usize);
        // Long header, Initial type
        assert_eq!(first.payload[0] & 0xf0, 0xc0);
    }

    #[test]
    fn bad_transport_params_close_connection() {
        let _guard = subscribe();
        let (_, server_cid, orig) = cids();
        let mut params = server_params(&server_cid, &orig);
        params.push_int(TransportParameterId::MAX_UDP_PAYLOAD_SIZE, 1000);
        let (mut conn, now) = client(params);
        establish(&mut conn, now);
        assert!(!conn.is_established());
        let events = drain_events(&mut conn);
        let reason = events
            .iter()
            .find_map(|e| match e {
                Event::ConnectionLost { reason } => Some(reason.clone()),
                _ => None,
            })
            .expect("connection should have died");
        match reason {
            ConnectionError::TransportError(err) => {
                assert_eq!(err.code, TransportErrorCode::TRANSPORT_PARAMETER_ERROR);
                assert!(err.reason.starts_with("Max packet size too small"));
            }
            other => panic!("unexpected close reason {other:?}"),
        }
    }

    #[test]
    fn cid_mismatch_closes_connection() {
        let (_, _, orig) = cids();
        // Parameters echo the wrong source CID
        let bogus = ConnectionId::new(&[0xee; 8]);
        let (mut conn, now) = client(server_params(&bogus, &orig));
        establish(&mut conn, now);
        let events = drain_events(&mut conn);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::ConnectionLost {
                reason: ConnectionError::TransportError(err)
            } if err.reason == "Initial CID does not match."
        )));
    }

    #[test]
    fn idle_timeout_fires() {
        let (_, server_cid, orig) = cids();
        let (mut conn, now) = client(server_params(&server_cid, &orig));
        establish(&mut conn, now);
        drain_events(&mut conn);
        let deadline = conn.poll_timeout().unwrap();
        conn.handle_timeout(deadline + Duration::from_millis(1));
        assert!(conn.is_drained());
        let events = drain_events(&mut conn);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::ConnectionLost {
                reason: ConnectionError::TimedOut
            }
        )));
    }

    #[test]
    fn stream_data_round_trip() {
        let _guard = subscribe();
        let (client_cid, server_cid, orig) = cids();
        let (mut conn, now) = client(server_params(&server_cid, &orig));
        establish(&mut conn, now);
        drain_events(&mut conn);

        let id = conn.open_uni().unwrap();
        let mut data = Bytes::from_static(b"hello over quic");
        assert_eq!(conn.write(id, &mut data, true).unwrap(), 15);

        let mut batch = IoBatch::new(RecordingWriter::default(), -1);
        conn.write_packets(now, &mut batch).unwrap();
        batch.flush().unwrap();
        assert!(batch.pkts_sent() >= 1);

        // The server acks our 1-RTT packets
        let largest = conn.spaces[SpaceId::Data as usize].next_packet_number - 1;
        conn.handle_datagram(
            now + Duration::from_millis(30),
            server_packet(
                EncryptionLevel::OneRtt,
                &client_cid,
                &server_cid,
                1,
                &ack_frame(largest),
            ),
        );
        let events = drain_events(&mut conn);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Stream(StreamEvent::Finished { id: got }) if *got == id)));
    }

    #[test]
    fn incoming_stream_readable() {
        let (client_cid, server_cid, orig) = cids();
        let (mut conn, now) = client(server_params(&server_cid, &orig));
        establish(&mut conn, now);
        drain_events(&mut conn);

        let id = StreamId::new(Side::Server, Dir::Uni, 0);
        let mut frames = Vec::new();
        frame::StreamMeta {
            id,
            offsets: 0..5,
            fin: true,
            from_meta: false,
        }
        .encode(true, &mut frames);
        frames.extend_from_slice(b"howdy");
        conn.handle_datagram(
            now,
            server_packet(EncryptionLevel::OneRtt, &client_cid, &server_cid, 1, &frames),
        );
        let events = drain_events(&mut conn);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Stream(StreamEvent::Opened { .. }))));
        assert_eq!(&conn.read(id, 100, now).unwrap().unwrap()[..], b"howdy");
        assert_eq!(conn.read(id, 100, now).unwrap(), None);
    }

    #[test]
    fn ping_pong_and_timeout() {
        let _guard = subscribe();
        let (client_cid, server_cid, orig) = cids();
        let (mut conn, now) = client(server_params(&server_cid, &orig));
        establish(&mut conn, now);
        drain_events(&mut conn);

        conn.send_ping(now, Duration::from_secs(1));
        let mut batch = IoBatch::new(RecordingWriter::default(), -1);
        conn.write_packets(now, &mut batch).unwrap();
        let (space_id, pn) = conn.app_ping_sent.expect("ping packet recorded");
        assert_eq!(space_id, SpaceId::Data);
        conn.handle_datagram(
            now + Duration::from_millis(20),
            server_packet(
                EncryptionLevel::OneRtt,
                &client_cid,
                &server_cid,
                2,
                &ack_frame(pn),
            ),
        );
        let events = drain_events(&mut conn);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Ping(PingResult::Pong))));

        // Second ping: let it time out instead
        conn.send_ping(now, Duration::from_millis(100));
        conn.handle_timeout(now + Duration::from_millis(200));
        let events = drain_events(&mut conn);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Ping(PingResult::Timeout))));
    }

    #[test]
    fn retry_preserves_exactly_the_survivors() {
        let _guard = subscribe();
        let (client_cid, server_cid, orig) = cids();
        let (mut conn, now) = client(server_params(&server_cid, &orig));

        // Fabricate outstandings: two 0-RTT packets and one 1-RTT packet
        for (pn, level) in [
            (0, EncryptionLevel::ZeroRtt),
            (1, EncryptionLevel::ZeroRtt),
            (2, EncryptionLevel::OneRtt),
        ] {
            let space = &mut conn.spaces[SpaceId::Data as usize];
            space.next_packet_number = pn + 1;
            space.sent_packets.insert(
                pn,
                SentPacket {
                    time_sent: now,
                    level,
                    size: 1200,
                    ack_eliciting: true,
                    in_flight: true,
                    declared_lost: false,
                    acks: RangeSet::new(),
                    retransmits: Retransmits::default(),
                    stream_frames: StreamMetaVec::new(),
                    clone_group: None,
                },
            );
            space.in_flight += 1200;
        }
        let initial_pn_before = conn.spaces[SpaceId::Initial as usize].next_packet_number;

        let new_server_cid = ConnectionId::new(&[0x52; 8]);
        conn.apply_retry(now, new_server_cid, Bytes::from_static(b"token"));

        // Identity: client CID, new server CID, original destination CID
        assert_eq!(conn.local_cid, client_cid);
        assert_eq!(conn.rem_cid, new_server_cid);
        assert_eq!(conn.orig_dst_cid, orig);
        // Packet number counters survive
        assert_eq!(
            conn.spaces[SpaceId::Initial as usize].next_packet_number,
            initial_pn_before
        );
        assert_eq!(conn.spaces[SpaceId::Data as usize].next_packet_number, 3);
        // Only the 0-RTT packets survive, and both are marked lost
        let survivors: Vec<u64> = conn.spaces[SpaceId::Data as usize]
            .sent_packets
            .keys()
            .copied()
            .collect();
        assert_eq!(survivors, vec![0, 1]);
        assert!(conn.spaces[SpaceId::Data as usize]
            .sent_packets
            .values()
            .all(|p| p.declared_lost));
        assert_eq!(conn.spaces[SpaceId::Data as usize].in_flight, 0);
    }

    #[test]
    fn second_retry_is_ignored() {
        let (_, server_cid, orig) = cids();
        let (mut conn, now) = client(server_params(&server_cid, &orig));
        conn.apply_retry(now, ConnectionId::new(&[0x52; 8]), Bytes::new());
        let rem = conn.rem_cid;
        // handle_retry refuses a second retry outright
        let mut buf = vec![0x80 | 0x40 | 0x30];
        buf.extend_from_slice(&VERSION.to_be_bytes());
        buf.push(8);
        buf.extend_from_slice(&[0xc1; 8]);
        buf.push(8);
        buf.extend_from_slice(&[0x53; 8]);
        buf.extend_from_slice(&[0u8; 16]);
        conn.handle_datagram(now, BytesMut::from(&buf[..]));
        assert_eq!(conn.rem_cid, rem);
    }

    #[test]
    fn datagram_round_trip() {
        let (client_cid, server_cid, orig) = cids();
        let mut params = server_params(&server_cid, &orig);
        params.push_int(TransportParameterId::MAX_DATAGRAM_FRAME_SIZE, 65535);
        let (mut conn, now) = client(params);
        establish(&mut conn, now);
        drain_events(&mut conn);

        conn.write_datagram(Bytes::from_static(b"fire and forget"))
            .unwrap();
        let mut batch = IoBatch::new(RecordingWriter::default(), -1);
        conn.write_packets(now, &mut batch).unwrap();
        batch.flush().unwrap();
        assert!(batch.pkts_sent() >= 1);

        // And one arrives from the peer
        let mut frames = Vec::new();
        frame::Datagram {
            data: Bytes::from_static(b"pong"),
        }
        .encode(true, &mut frames);
        conn.handle_datagram(
            now,
            server_packet(EncryptionLevel::OneRtt, &client_cid, &server_cid, 1, &frames),
        );
        let events = drain_events(&mut conn);
        assert!(events.iter().any(|e| matches!(e, Event::DatagramReceived)));
        let got = conn.read_datagrams(0);
        assert_eq!(got.len(), 1);
        assert_eq!(&got[0].data[..], b"pong");
    }

    #[test]
    fn datagram_unsupported_by_peer() {
        let (_, server_cid, orig) = cids();
        let (mut conn, now) = client(server_params(&server_cid, &orig));
        establish(&mut conn, now);
        assert_matches!(
            conn.write_datagram(Bytes::from_static(b"nope")),
            Err(SendDatagramError::UnsupportedByPeer)
        );
    }

    #[test]
    fn peer_close_drains() {
        let (client_cid, server_cid, orig) = cids();
        let (mut conn, now) = client(server_params(&server_cid, &orig));
        establish(&mut conn, now);
        drain_events(&mut conn);

        let mut frames = Vec::new();
        frame::Close::Application(ApplicationClose {
            error_code: VarInt::from_u32(7),
            reason: Bytes::from_static(b"bye"),
        })
        .encode(&mut frames, 1000);
        conn.handle_datagram(
            now,
            server_packet(EncryptionLevel::OneRtt, &client_cid, &server_cid, 1, &frames),
        );
        let events = drain_events(&mut conn);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::ConnectionLost {
                reason: ConnectionError::ApplicationClosed(c)
            } if c.error_code == VarInt::from_u32(7)
        )));
        // Writes now fail
        let id_err = conn.open_uni().unwrap_err();
        assert_matches!(id_err, OpenError::ConnectionClosed);
        // And the drain timer eventually retires the connection
        conn.handle_timeout(now + Duration::from_secs(60));
        assert!(conn.is_drained());
    }

    #[test]
    fn local_close_emits_close_frame_once() {
        let (_, server_cid, orig) = cids();
        let (mut conn, now) = client(server_params(&server_cid, &orig));
        establish(&mut conn, now);
        conn.close(now, VarInt::from_u32(3), Bytes::from_static(b"done"));
        let mut batch = IoBatch::new(RecordingWriter::default(), -1);
        assert_eq!(conn.write_packets(now, &mut batch).unwrap(), 1);
        batch.flush().unwrap();
        // Second wake sends nothing further
        assert_eq!(conn.write_packets(now, &mut batch).unwrap(), 0);
    }

    #[test]
    fn graceful_close_waits_for_delivery() {
        let _guard = subscribe();
        let (client_cid, server_cid, orig) = cids();
        let (mut conn, now) = client(server_params(&server_cid, &orig));
        establish(&mut conn, now);
        drain_events(&mut conn);

        let id = conn.open_uni().unwrap();
        let mut data = Bytes::from_static(b"pending");
        conn.write(id, &mut data, true).unwrap();
        let mut batch = IoBatch::new(RecordingWriter::default(), -1);
        conn.write_packets(now, &mut batch).unwrap();

        conn.close_gracefully(now);
        // Still waiting on the ack
        assert!(matches!(conn.state, State::Established));
        let largest = conn.spaces[SpaceId::Data as usize].next_packet_number - 1;
        conn.handle_datagram(
            now,
            server_packet(
                EncryptionLevel::OneRtt,
                &client_cid,
                &server_cid,
                1,
                &ack_frame(largest),
            ),
        );
        assert!(matches!(conn.state, State::Closing { .. }));
    }

    #[test]
    fn reset_non_control_streams_spares_control() {
        let (_, server_cid, orig) = cids();
        let (mut conn, now) = client(server_params(&server_cid, &orig));
        establish(&mut conn, now);
        drain_events(&mut conn);

        let control = conn.open_uni().unwrap();
        let data_stream = conn.open_uni().unwrap();
        assert!(conn.set_control_stream(control));
        let mut payload = Bytes::from_static(b"x");
        conn.write(control, &mut payload.clone(), false).unwrap();
        conn.write(data_stream, &mut payload, false).unwrap();

        conn.reset_non_control_streams(now, VarInt::from_u32(0xbad), "going away");
        // The control stream is still writable; the other is not
        let mut more = Bytes::from_static(b"y");
        assert!(conn.write(control, &mut more.clone(), false).is_ok());
        assert_matches!(
            conn.write(data_stream, &mut more, false),
            Err(WriteError::Closed)
        );
    }

    #[test]
    fn reset_non_control_streams_stops_receive_halves() {
        let _guard = subscribe();
        let (client_cid, server_cid, orig) = cids();
        let (mut conn, now) = client(server_params(&server_cid, &orig));
        establish(&mut conn, now);
        drain_events(&mut conn);

        // A peer-initiated stream with undelivered data, and a local bidi
        // stream with a buffered write: both have receive halves to stop
        let incoming = StreamId::new(Side::Server, Dir::Uni, 0);
        let mut frames = Vec::new();
        frame::StreamMeta {
            id: incoming,
            offsets: 0..4,
            fin: false,
            from_meta: false,
        }
        .encode(true, &mut frames);
        frames.extend_from_slice(b"data");
        conn.handle_datagram(
            now,
            server_packet(EncryptionLevel::OneRtt, &client_cid, &server_cid, 1, &frames),
        );
        let bidi = conn.open_bidi().unwrap();
        let mut payload = Bytes::from_static(b"x");
        conn.write(bidi, &mut payload, false).unwrap();
        drain_events(&mut conn);

        // Driven under the caller's clock, like every other entry point
        let later = now + Duration::from_millis(250);
        conn.reset_non_control_streams(later, VarInt::from_u32(0xbad), "going away");

        // Receive halves are stopped and STOP_SENDING frames are owed
        assert_matches!(conn.read(incoming, 100, later), Err(ReadError::Closed));
        assert_matches!(conn.read(bidi, 100, later), Err(ReadError::Closed));
        assert_eq!(conn.streams.pending_control.stop_sending.len(), 2);
        // The one sendable half was reset
        assert_eq!(conn.streams.pending_control.reset_stream.len(), 1);
        let mut more = Bytes::from_static(b"y");
        assert_matches!(conn.write(bidi, &mut more, false), Err(WriteError::Closed));
    }

    #[test]
    fn stop_sending_under_caller_clock() {
        let (client_cid, server_cid, orig) = cids();
        let (mut conn, now) = client(server_params(&server_cid, &orig));
        establish(&mut conn, now);
        drain_events(&mut conn);

        let id = StreamId::new(Side::Server, Dir::Uni, 0);
        let mut frames = Vec::new();
        frame::StreamMeta {
            id,
            offsets: 0..5,
            fin: false,
            from_meta: false,
        }
        .encode(true, &mut frames);
        frames.extend_from_slice(b"howdy");
        conn.handle_datagram(
            now,
            server_packet(EncryptionLevel::OneRtt, &client_cid, &server_cid, 1, &frames),
        );
        drain_events(&mut conn);

        let later = now + Duration::from_millis(10);
        conn.stop_sending(id, VarInt::from_u32(2), later).unwrap();
        assert_eq!(conn.streams.pending_control.stop_sending.len(), 1);
        assert_matches!(conn.read(id, 100, later), Err(ReadError::Closed));
        // A second stop on the same stream is refused
        assert_matches!(
            conn.stop_sending(id, VarInt::from_u32(2), later),
            Err(ReadError::Closed)
        );
    }

    #[test]
    fn knob_requires_peer_support() {
        let (client_cid, server_cid, orig) = cids();
        let mut params = server_params(&server_cid, &orig);
        params.push_int(TransportParameterId::KNOB_FRAMES_SUPPORTED, 1);
        let (mut conn, now) = client(params);
        establish(&mut conn, now);
        conn.send_knob(1, 2, Bytes::from_static(b"\x05")).unwrap();

        // And inbound knobs surface as events when locally enabled
        let (mut conn2, now2) = {
            let mut params = server_params(&server_cid, &orig);
            params.push_int(TransportParameterId::KNOB_FRAMES_SUPPORTED, 1);
            let (client_cid2, _, orig2) = cids();
            let mut config = TransportConfig::default();
            config.enable_knob_frames(true);
            let now = Instant::now();
            let conn = Connection::connect(
                Arc::new(config),
                Box::new(ScriptedSession::new(params)),
                VERSION,
                client_cid2,
                orig2,
                addr(),
                None,
                now,
            )
            .unwrap();
            (conn, now)
        };
        establish(&mut conn2, now2);
        drain_events(&mut conn2);
        let mut frames = Vec::new();
        frame::Knob {
            space: 9,
            id: 4,
            payload: Bytes::from_static(b"\x01"),
        }
        .encode(&mut frames);
        conn2.handle_datagram(
            now2,
            server_packet(EncryptionLevel::OneRtt, &client_cid, &server_cid, 1, &frames),
        );
        let events = drain_events(&mut conn2);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Knob { space: 9, id: 4, .. })));
    }

    #[test]
    fn acked_then_lost_never_coexist() {
        let _guard = subscribe();
        let (client_cid, server_cid, orig) = cids();
        let (mut conn, now) = client(server_params(&server_cid, &orig));
        establish(&mut conn, now);
        drain_events(&mut conn);

        let id = conn.open_uni().unwrap();
        for chunk in 0..5u8 {
            let mut data = Bytes::from(vec![chunk; 100]);
            conn.write(id, &mut data, false).unwrap();
            let mut batch = IoBatch::new(RecordingWriter::default(), -1);
            conn.write_packets(now, &mut batch).unwrap();
        }
        // Ack only the newest packet; the gap triggers threshold loss for
        // the oldest
        let largest = conn.spaces[SpaceId::Data as usize].next_packet_number - 1;
        let mut ranges = RangeSet::new();
        ranges.insert(largest..largest + 1);
        let mut frames = Vec::new();
        frame::Ack::encode(0, &ranges, None, None, &mut frames);
        conn.handle_datagram(
            now + Duration::from_millis(50),
            server_packet(EncryptionLevel::OneRtt, &client_cid, &server_cid, 1, &frames),
        );
        let space = &conn.spaces[SpaceId::Data as usize];
        // No packet is simultaneously gone (acked) and flagged lost
        assert!(!space.sent_packets.contains_key(&largest));
        for (_, packet) in space.sent_packets.iter() {
            if packet.declared_lost {
                // Lost packets were not acked: their frames are queued again
                assert!(!packet.ack_eliciting || packet.retransmits.is_empty());
            }
        }
        // Lost stream data is pending again
        assert!(conn.streams.has_sendable());
    }
}
