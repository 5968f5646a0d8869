use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use bytes::Bytes;
use indexmap::{IndexMap, IndexSet};
use rustc_hash::{FxBuildHasher, FxHashMap};
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    config::TransportConfig,
    connection::{
        flow_control::{RecvWindow, SendWindow},
        scheduler::RoundRobin,
        spaces::Retransmits,
    },
    frame::{self, StreamMeta},
    transport_error::TransportError,
    transport_parameters::PeerParams,
    Dir, Side, StreamGroupId, StreamId, VarInt, MAX_STREAM_COUNT,
};

mod recv;
pub use recv::{ConsumeError, ReadError};
use recv::Recv;

mod send;
pub use send::{FinishError, WriteError};
use send::{Send, SendState};

/// How chunks from a stream group are treated when their packet is lost
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct RetransmissionPolicy {
    /// Lost chunks are abandoned instead of retransmitted; delivery of the
    /// stream completes as if they had arrived
    pub disable_retransmission: bool,
}

/// Which byte milestone a registered byte event waits for
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ByteEventKind {
    /// The byte was handed to the UDP socket
    Tx,
    /// The byte was acknowledged by the peer
    Ack,
}

/// Application-visible happenings on streams
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum StreamEvent {
    /// The peer opened a stream
    Opened {
        /// Which stream
        id: StreamId,
    },
    /// Data, EOF, or a reset is ready to read
    Readable {
        /// Which stream
        id: StreamId,
    },
    /// The stream may accept more application data
    Writable {
        /// Which stream
        id: StreamId,
    },
    /// Every outstanding byte through FIN (or the reliable prefix of a
    /// reset) was acknowledged
    Finished {
        /// Which stream
        id: StreamId,
    },
    /// The peer asked us to stop sending
    Stopped {
        /// Which stream
        id: StreamId,
        /// Application error code from the STOP_SENDING frame
        error_code: VarInt,
    },
    /// Delivery progressed: everything below `offset` is acknowledged
    Delivered {
        /// Which stream
        id: StreamId,
        /// One past the highest contiguously acknowledged offset
        offset: u64,
    },
    /// A registered byte event fired
    ByteEvent {
        /// Transmission or acknowledgment
        kind: ByteEventKind,
        /// Which stream
        id: StreamId,
        /// The registered offset
        offset: u64,
    },
    /// More streams of this direction may be opened
    Available {
        /// Bidirectional or unidirectional
        dir: Dir,
    },
    /// Both directions reached a terminal state; the stream is gone
    ///
    /// Reported exactly once per stream.
    Closed {
        /// Which stream
        id: StreamId,
    },
}

/// Errors from opening a stream or stream group
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum OpenError {
    /// The peer's stream limit for this direction is exhausted
    #[error("streams exhausted")]
    Exhausted,
    /// The referenced stream group does not exist
    #[error("unknown stream group")]
    UnknownGroup,
    /// Stream groups are not available on this connection
    #[error("invalid operation: stream groups not negotiated")]
    GroupsUnsupported,
    /// The connection is closed or draining
    #[error("connection closed")]
    ConnectionClosed,
}

pub(super) struct Stream {
    pub(super) send: Option<Send>,
    pub(super) recv: Option<Recv>,
    pub(super) group: Option<StreamGroupId>,
    /// Protocol control streams survive `reset_non_control_streams`
    pub(super) control: bool,
}

impl Stream {
    fn is_terminal(&self) -> bool {
        self.send
            .as_ref()
            .map_or(true, |s| s.state == SendState::Closed)
            && self.recv.as_ref().map_or(true, Recv::is_retired)
    }
}

/// Owns every live stream and the bookkeeping around them
///
/// Streams are stored in insertion order so whole-map walks are
/// deterministic. Other components refer to streams strictly by id.
pub(super) struct StreamsState {
    side: Side,
    pub(super) streams: IndexMap<StreamId, Stream, FxBuildHasher>,
    /// Next locally-initiated index, per direction
    next: [u64; 2],
    /// Peer-granted limit on locally-initiated streams, per direction
    max: [u64; 2],
    /// Lowest unopened peer-initiated index, per direction
    next_remote: [u64; 2],
    /// Advertised limit on peer-initiated streams, per direction
    max_remote: [u64; 2],

    /// Connection-level receive window
    pub(super) conn_recv: RecvWindow,
    /// Connection-level credit granted by the peer
    pub(super) conn_send: SendWindow,
    peer_params: PeerParams,
    params_received: bool,

    /// Local per-stream receive windows (from config until the setter
    /// overrides them)
    window_bidi_local: u64,
    window_bidi_remote: u64,
    window_uni: u64,
    auto_tune: bool,
    reliable_reset_enabled: bool,

    /// Stream groups
    next_group: [u64; 2],
    groups: IndexSet<StreamGroupId, FxBuildHasher>,
    group_policies: FxHashMap<StreamGroupId, RetransmissionPolicy>,
    local_max_groups: u64,

    /// Round-robin over streams with sendable data
    pub(super) pending: RoundRobin,
    /// Streams blocked on connection-level credit
    connection_blocked: Vec<StreamId>,
    /// Streams with newly acknowledged data awaiting delivery notification
    deliverable: IndexSet<StreamId, FxBuildHasher>,
    /// Registered (kind, stream, offset) milestones
    byte_events: Vec<(ByteEventKind, StreamId, u64)>,

    /// Control frames owed to the peer for stream state
    pub(super) pending_control: Retransmits,
    events: VecDeque<StreamEvent>,
}

impl StreamsState {
    pub(super) fn new(side: Side, config: &TransportConfig) -> Self {
        Self {
            side,
            streams: IndexMap::default(),
            next: [0, 0],
            max: [0, 0],
            next_remote: [0, 0],
            max_remote: [
                config.max_concurrent_bidi_streams.into_inner(),
                config.max_concurrent_uni_streams.into_inner(),
            ],
            conn_recv: RecvWindow::new(
                config.receive_window.into_inner(),
                config.auto_tune_flow_control,
            ),
            conn_send: SendWindow::new(0),
            peer_params: PeerParams::default(),
            params_received: false,
            window_bidi_local: config.stream_receive_window_bidi_local.into_inner(),
            window_bidi_remote: config.stream_receive_window_bidi_remote.into_inner(),
            window_uni: config.stream_receive_window_uni.into_inner(),
            auto_tune: config.auto_tune_flow_control,
            reliable_reset_enabled: config.enable_reliable_stream_reset,
            next_group: [0, 0],
            groups: IndexSet::default(),
            group_policies: FxHashMap::default(),
            local_max_groups: config.max_stream_groups_advertised,
            pending: RoundRobin::new(),
            connection_blocked: Vec::new(),
            deliverable: IndexSet::default(),
            byte_events: Vec::new(),
            pending_control: Retransmits::default(),
            events: VecDeque::new(),
        }
    }

    /// Apply the peer's transport parameters
    ///
    /// Streams may exist before the handshake completes (0-RTT, optimistic
    /// opens), so every pre-existing stream is revisited: its receive window
    /// is set from our advertised initial value and its send credit from the
    /// peer's.
    pub(super) fn set_params(&mut self, params: &PeerParams) {
        self.max[Dir::Bi as usize] = params.initial_max_streams_bidi;
        self.max[Dir::Uni as usize] = params.initial_max_streams_uni;
        self.conn_send.on_peer_max(params.initial_max_data);
        let side = self.side;
        for (&id, stream) in &mut self.streams {
            if let Some(recv) = stream.recv.as_mut() {
                let window = match id.dir() {
                    Dir::Uni => self.window_uni,
                    Dir::Bi if id.initiator() == side => self.window_bidi_local,
                    Dir::Bi => self.window_bidi_remote,
                };
                recv.flow.set_window(window);
            }
            if let Some(send) = stream.send.as_mut() {
                let credit = match id.dir() {
                    Dir::Uni => params.initial_max_stream_data_uni,
                    // The peer labels streams we initiate as remote
                    Dir::Bi if id.initiator() == side => {
                        params.initial_max_stream_data_bidi_remote
                    }
                    Dir::Bi => params.initial_max_stream_data_bidi_local,
                };
                send.increase_max_data(credit);
            }
        }
        self.peer_params = params.clone();
        self.params_received = true;
    }

    pub(super) fn events(&mut self) -> &mut VecDeque<StreamEvent> {
        &mut self.events
    }

    pub(super) fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    //
    // Opening
    //

    pub(super) fn open(&mut self, dir: Dir) -> Result<StreamId, OpenError> {
        // Streams may be opened optimistically before the peer's parameters
        // arrive; afterwards the advertised limit is binding
        if self.params_received && self.next[dir as usize] >= self.max[dir as usize] {
            return Err(OpenError::Exhausted);
        }
        if self.next[dir as usize] >= MAX_STREAM_COUNT {
            return Err(OpenError::Exhausted);
        }
        let id = StreamId::new(self.side, dir, self.next[dir as usize]);
        self.next[dir as usize] += 1;
        self.insert(id, None);
        Ok(id)
    }

    pub(super) fn open_in_group(
        &mut self,
        dir: Dir,
        group: StreamGroupId,
    ) -> Result<StreamId, OpenError> {
        if !self.groups.contains(&group) || group.dir() != dir {
            return Err(OpenError::UnknownGroup);
        }
        let id = self.open(dir)?;
        self.streams[&id].group = Some(group);
        Ok(id)
    }

    pub(super) fn create_group(&mut self, dir: Dir) -> Result<StreamGroupId, OpenError> {
        let peer_max = self.peer_params.max_stream_groups;
        if peer_max == 0 {
            return Err(OpenError::GroupsUnsupported);
        }
        if self.groups.len() as u64 >= peer_max {
            return Err(OpenError::Exhausted);
        }
        let group = StreamGroupId::new(self.side, dir, self.next_group[dir as usize]);
        self.next_group[dir as usize] += 1;
        self.groups.insert(group);
        Ok(group)
    }

    /// Install or clear a group's retransmission policy; `None` restores the
    /// default
    pub(super) fn set_group_policy(
        &mut self,
        group: StreamGroupId,
        policy: Option<RetransmissionPolicy>,
    ) -> Result<(), OpenError> {
        if self.local_max_groups == 0 {
            return Err(OpenError::GroupsUnsupported);
        }
        if !self.groups.contains(&group) {
            return Err(OpenError::UnknownGroup);
        }
        match policy {
            Some(policy) => {
                self.group_policies.insert(group, policy);
            }
            None => {
                self.group_policies.remove(&group);
            }
        }
        Ok(())
    }

    fn insert(&mut self, id: StreamId, group: Option<StreamGroupId>) {
        let send = id.sendable_by(self.side).then(|| {
            let credit = if self.params_received {
                match id.dir() {
                    Dir::Uni => self.peer_params.initial_max_stream_data_uni,
                    Dir::Bi if id.initiator() == self.side => {
                        self.peer_params.initial_max_stream_data_bidi_remote
                    }
                    Dir::Bi => self.peer_params.initial_max_stream_data_bidi_local,
                }
            } else {
                0
            };
            Send::new(credit)
        });
        let recv = id.receivable_by(self.side).then(|| {
            let window = match id.dir() {
                Dir::Uni => self.window_uni,
                Dir::Bi if id.initiator() == self.side => self.window_bidi_local,
                Dir::Bi => self.window_bidi_remote,
            };
            Recv::new(window, self.auto_tune)
        });
        self.streams.insert(
            id,
            Stream {
                send,
                recv,
                group,
                control: false,
            },
        );
    }

    /// Look up a peer-initiated stream, implicitly opening it (and any
    /// lower-numbered siblings) if the id is within the advertised limit
    fn get_or_open_remote(&mut self, id: StreamId) -> Result<(), TransportError> {
        if id.initiator() == self.side {
            // A frame referencing one of our streams that we never opened
            if id.index() >= self.next[id.dir() as usize] {
                return Err(TransportError::STREAM_STATE_ERROR(
                    "reference to an unopened local stream",
                ));
            }
            return Ok(());
        }
        let dir = id.dir() as usize;
        if id.index() >= self.max_remote[dir] {
            return Err(TransportError::STREAM_LIMIT_ERROR(""));
        }
        while self.next_remote[dir] <= id.index() {
            let new = StreamId::new(!self.side, id.dir(), self.next_remote[dir]);
            self.next_remote[dir] += 1;
            self.insert(new, None);
            self.events.push_back(StreamEvent::Opened { id: new });
        }
        Ok(())
    }

    //
    // Application I/O
    //

    pub(super) fn write(
        &mut self,
        id: StreamId,
        data: &mut Bytes,
        fin: bool,
    ) -> Result<usize, WriteError> {
        let conn_budget = self.conn_send.available();
        let stream = self.streams.get_mut(&id).ok_or(WriteError::UnknownStream)?;
        let send = stream.send.as_mut().ok_or(WriteError::NotSendable)?;
        let result = send.write(data, fin, conn_budget);
        match result {
            Ok(written) => {
                self.conn_send.on_sent(written as u64);
                if self.conn_send.should_signal_blocked() {
                    trace!("connection blocked on flow control");
                }
                self.after_send_mutation(id);
                Ok(written)
            }
            Err(WriteError::Blocked) => {
                if send.stream_budget() == 0 {
                    trace!(%id, "stream blocked on flow control");
                } else {
                    self.connection_blocked.push(id);
                }
                Err(WriteError::Blocked)
            }
            Err(e) => Err(e),
        }
    }

    pub(super) fn write_meta(
        &mut self,
        id: StreamId,
        len: u64,
        fin: bool,
    ) -> Result<u64, WriteError> {
        let conn_budget = self.conn_send.available();
        let stream = self.streams.get_mut(&id).ok_or(WriteError::UnknownStream)?;
        let send = stream.send.as_mut().ok_or(WriteError::NotSendable)?;
        let written = send.write_meta(len, fin, conn_budget)?;
        self.conn_send.on_sent(written);
        self.after_send_mutation(id);
        Ok(written)
    }

    pub(super) fn finish(&mut self, id: StreamId) -> Result<(), FinishError> {
        let stream = self.streams.get_mut(&id).ok_or(FinishError::Closed)?;
        let send = stream.send.as_mut().ok_or(FinishError::Closed)?;
        send.finish()?;
        self.after_send_mutation(id);
        Ok(())
    }

    /// Reset the send half towards the peer
    pub(super) fn reset(
        &mut self,
        id: StreamId,
        error_code: VarInt,
        reliable_size: Option<u64>,
    ) -> Result<(), WriteError> {
        let reliable_allowed = self.peer_params.reliable_stream_reset;
        let stream = self.streams.get_mut(&id).ok_or(WriteError::UnknownStream)?;
        let send = stream.send.as_mut().ok_or(WriteError::NotSendable)?;
        // Without the peer's support the reliable size silently degrades to
        // a full reset
        let reliable_size = reliable_size.filter(|_| reliable_allowed);
        if let Some(frame_data) = send.reset(error_code, reliable_size) {
            self.pending_control.reset_stream.push(frame::ResetStream {
                id,
                error_code: frame_data.error_code,
                final_size: VarInt::from_u64(frame_data.final_size)
                    .expect("stream offsets are varint-bounded"),
                reliable_size: frame_data
                    .reliable_size
                    .map(|x| VarInt::from_u64(x).expect("reliable size is varint-bounded")),
            });
        }
        self.after_send_mutation(id);
        Ok(())
    }

    /// Ask the peer to stop sending on a receive half
    pub(super) fn stop_sending(
        &mut self,
        id: StreamId,
        error_code: VarInt,
        now: Instant,
        rtt: Option<Duration>,
    ) -> Result<(), ReadError> {
        let stream = self.streams.get_mut(&id).ok_or(ReadError::UnknownStream)?;
        let recv = stream.recv.as_mut().ok_or(ReadError::NotReadable)?;
        if recv.stopped {
            return Err(ReadError::Closed);
        }
        let credit = recv.stop();
        self.pending_control
            .stop_sending
            .push(frame::StopSending { id, error_code });
        if credit > 0 {
            let should = self.conn_recv.on_consumed(credit, now, rtt);
            if should.0 {
                self.pending_control.max_data = true;
            }
        }
        self.check_closed(id);
        Ok(())
    }

    pub(super) fn read(
        &mut self,
        id: StreamId,
        max_len: usize,
        now: Instant,
        rtt: Option<Duration>,
    ) -> Result<Option<Bytes>, ReadError> {
        let stream = self.streams.get_mut(&id).ok_or(ReadError::UnknownStream)?;
        let recv = stream.recv.as_mut().ok_or(ReadError::NotReadable)?;
        let result = recv.read(max_len);
        if let Ok(Some(ref chunk)) = result {
            let n = chunk.len() as u64;
            if recv.flow_on_consumed(n, now, rtt).0 {
                self.pending_control.max_stream_data.insert(id);
            }
            if self.conn_recv.on_consumed(n, now, rtt).0 {
                self.pending_control.max_data = true;
            }
        }
        if matches!(result, Err(ReadError::Reset(_)) | Ok(None)) {
            self.check_closed(id);
        }
        result
    }

    pub(super) fn peek(
        &mut self,
        id: StreamId,
        max_len: usize,
    ) -> Result<Option<(u64, Bytes)>, ReadError> {
        let stream = self.streams.get_mut(&id).ok_or(ReadError::UnknownStream)?;
        let recv = stream.recv.as_mut().ok_or(ReadError::NotReadable)?;
        recv.peek(max_len)
    }

    pub(super) fn consume(
        &mut self,
        id: StreamId,
        offset: Option<u64>,
        amount: u64,
        now: Instant,
        rtt: Option<Duration>,
    ) -> Result<(), ConsumeError> {
        let stream = self.streams.get_mut(&id).ok_or(ConsumeError::UnknownStream)?;
        let recv = stream
            .recv
            .as_mut()
            .ok_or(ConsumeError::Closed)?;
        match offset {
            Some(offset) => recv.consume_at(offset, amount)?,
            None => recv.consume(amount)?,
        }
        if recv.flow_on_consumed(amount, now, rtt).0 {
            self.pending_control.max_stream_data.insert(id);
        }
        if self.conn_recv.on_consumed(amount, now, rtt).0 {
            self.pending_control.max_data = true;
        }
        Ok(())
    }

    pub(super) fn set_read_paused(&mut self, id: StreamId, paused: bool) -> Result<(), ReadError> {
        let stream = self.streams.get_mut(&id).ok_or(ReadError::UnknownStream)?;
        let recv = stream.recv.as_mut().ok_or(ReadError::NotReadable)?;
        let was = recv.read_paused;
        recv.read_paused = paused;
        if was && !paused && recv.is_readable() {
            self.events.push_back(StreamEvent::Readable { id });
        }
        Ok(())
    }

    pub(super) fn set_peek_paused(&mut self, id: StreamId, paused: bool) -> Result<(), ReadError> {
        let stream = self.streams.get_mut(&id).ok_or(ReadError::UnknownStream)?;
        let recv = stream.recv.as_mut().ok_or(ReadError::NotReadable)?;
        recv.peek_paused = paused;
        Ok(())
    }

    /// Register a transmission or delivery milestone
    pub(super) fn register_byte_event(
        &mut self,
        kind: ByteEventKind,
        id: StreamId,
        offset: u64,
    ) -> Result<(), WriteError> {
        let stream = self.streams.get(&id).ok_or(WriteError::UnknownStream)?;
        let send = stream.send.as_ref().ok_or(WriteError::NotSendable)?;
        let already = match kind {
            ByteEventKind::Tx => send.sent_offset > offset,
            ByteEventKind::Ack => send.acked.contains(offset),
        };
        if already {
            self.events
                .push_back(StreamEvent::ByteEvent { kind, id, offset });
        } else {
            self.byte_events.push((kind, id, offset));
        }
        Ok(())
    }

    /// Bytes the application may currently write to `id`
    pub(super) fn max_writable(&self, id: StreamId) -> Result<u64, WriteError> {
        let stream = self.streams.get(&id).ok_or(WriteError::UnknownStream)?;
        let send = stream.send.as_ref().ok_or(WriteError::NotSendable)?;
        Ok(send.stream_budget().min(self.conn_send.available()))
    }

    pub(super) fn set_stream_recv_window(
        &mut self,
        id: StreamId,
        window: u64,
    ) -> Result<(), ReadError> {
        let stream = self.streams.get_mut(&id).ok_or(ReadError::UnknownStream)?;
        let recv = stream.recv.as_mut().ok_or(ReadError::NotReadable)?;
        recv.flow.set_window(window);
        self.pending_control.max_stream_data.insert(id);
        Ok(())
    }

    //
    // Frame ingestion
    //

    pub(super) fn on_stream_frame(
        &mut self,
        stream_frame: frame::Stream,
    ) -> Result<(), TransportError> {
        let id = stream_frame.id;
        if !id.receivable_by(self.side) {
            return Err(TransportError::STREAM_STATE_ERROR(
                "STREAM frame for a send-only stream",
            ));
        }
        self.get_or_open_remote(id)?;
        let stream = match self.streams.get_mut(&id) {
            Some(x) => x,
            // Already closed and retired; late data is discarded
            None => return Ok(()),
        };
        let recv = match stream.recv.as_mut() {
            Some(x) => x,
            None => {
                return Err(TransportError::STREAM_STATE_ERROR(
                    "STREAM frame for a send-only stream",
                ));
            }
        };
        let (new_bytes, newly_readable) = recv.ingest(stream_frame)?;
        let paused = recv.read_paused;
        self.conn_recv.record_recv_bytes(new_bytes)?;
        if newly_readable && !paused {
            self.events.push_back(StreamEvent::Readable { id });
        }
        self.check_closed(id);
        Ok(())
    }

    pub(super) fn on_reset_stream(
        &mut self,
        rst: frame::ResetStream,
    ) -> Result<(), TransportError> {
        if rst.reliable_size.is_some() && !self.reliable_reset_enabled {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "RESET_STREAM_AT without reliable_stream_reset",
            ));
        }
        let id = rst.id;
        if !id.receivable_by(self.side) {
            return Err(TransportError::STREAM_STATE_ERROR(
                "RESET_STREAM for a send-only stream",
            ));
        }
        self.get_or_open_remote(id)?;
        let stream = match self.streams.get_mut(&id) {
            Some(x) => x,
            None => return Ok(()),
        };
        let recv = stream
            .recv
            .as_mut()
            .expect("receivable stream has a recv half");
        let paused = recv.read_paused;
        if let Some(new_bytes) = recv.on_reset(&rst)? {
            self.conn_recv.record_recv_bytes(new_bytes)?;
            if !paused {
                self.events.push_back(StreamEvent::Readable { id });
            }
        }
        self.check_closed(id);
        Ok(())
    }

    pub(super) fn on_stop_sending(
        &mut self,
        stop: frame::StopSending,
    ) -> Result<(), TransportError> {
        let id = stop.id;
        if !id.sendable_by(self.side) {
            return Err(TransportError::STREAM_STATE_ERROR(
                "STOP_SENDING for a receive-only stream",
            ));
        }
        self.get_or_open_remote(id)?;
        let side = self.side;
        let stream = match self.streams.get_mut(&id) {
            Some(x) => x,
            None => return Ok(()),
        };
        let send = stream
            .send
            .as_mut()
            .expect("sendable stream has a send half");
        match send.state {
            SendState::Open => {
                if side == Side::Server
                    && send.stream_budget() == 0
                    && send.final_offset.is_none()
                {
                    debug!(%id, "peer gave up a flow control blocked stream");
                }
                if send.try_stop(stop.error_code) {
                    self.events.push_back(StreamEvent::Stopped {
                        id,
                        error_code: stop.error_code,
                    });
                }
            }
            // Already reset or fully delivered; nothing to do
            SendState::ResetSent | SendState::Closed => {}
        }
        Ok(())
    }

    pub(super) fn on_max_data(&mut self, offset: u64) {
        if self.conn_send.on_peer_max(offset) {
            for id in std::mem::take(&mut self.connection_blocked) {
                if self.streams.contains_key(&id) {
                    self.events.push_back(StreamEvent::Writable { id });
                }
            }
        }
    }

    pub(super) fn on_max_stream_data(
        &mut self,
        id: StreamId,
        offset: u64,
    ) -> Result<(), TransportError> {
        if !id.sendable_by(self.side) {
            return Err(TransportError::STREAM_STATE_ERROR(
                "MAX_STREAM_DATA for a receive-only stream",
            ));
        }
        self.get_or_open_remote(id)?;
        let stream = match self.streams.get_mut(&id) {
            Some(x) => x,
            None => return Ok(()),
        };
        let send = stream
            .send
            .as_mut()
            .expect("sendable stream has a send half");
        if send.increase_max_data(offset) {
            self.events.push_back(StreamEvent::Writable { id });
        }
        Ok(())
    }

    pub(super) fn on_max_streams(&mut self, dir: Dir, count: u64) -> Result<(), TransportError> {
        if count > MAX_STREAM_COUNT {
            return Err(TransportError::FRAME_ENCODING_ERROR(
                "unrepresentable stream limit",
            ));
        }
        if count > self.max[dir as usize] {
            self.max[dir as usize] = count;
            self.events.push_back(StreamEvent::Available { dir });
        }
        Ok(())
    }

    //
    // Ack / loss plumbing
    //

    /// A previously sent STREAM frame was acknowledged
    pub(super) fn ack_stream(&mut self, meta: &StreamMeta) -> Result<(), TransportError> {
        let id = meta.id;
        let stream = match self.streams.get_mut(&id) {
            Some(x) => x,
            None => return Ok(()),
        };
        let send = match stream.send.as_mut() {
            Some(x) => x,
            None => return Ok(()),
        };
        let closed = send.ack(meta)?;
        self.deliverable.insert(id);
        if closed {
            self.events.push_back(StreamEvent::Finished { id });
            self.pending.erase(id);
            self.check_closed(id);
        }
        Ok(())
    }

    /// A previously sent RESET_STREAM[_AT] was acknowledged
    pub(super) fn ack_reset(
        &mut self,
        id: StreamId,
        reliable_size: Option<u64>,
    ) -> Result<(), TransportError> {
        let stream = match self.streams.get_mut(&id) {
            Some(x) => x,
            None => return Ok(()),
        };
        let send = match stream.send.as_mut() {
            Some(x) => x,
            None => return Ok(()),
        };
        if send.on_reset_acked(reliable_size)? {
            self.deliverable.insert(id);
            self.events.push_back(StreamEvent::Finished { id });
            self.pending.erase(id);
            self.check_closed(id);
        }
        Ok(())
    }

    /// A previously sent STREAM frame was declared lost
    pub(super) fn on_stream_frame_lost(&mut self, meta: &StreamMeta) {
        let id = meta.id;
        let stream = match self.streams.get_mut(&id) {
            Some(x) => x,
            None => return,
        };
        let retransmit = !stream
            .group
            .and_then(|g| self.group_policies.get(&g))
            .copied()
            .unwrap_or_default()
            .disable_retransmission;
        let send = match stream.send.as_mut() {
            Some(x) => x,
            None => return,
        };
        let completed = send.on_chunk_lost(meta, retransmit);
        if completed {
            self.deliverable.insert(id);
            self.events.push_back(StreamEvent::Finished { id });
            self.pending.erase(id);
            self.check_closed(id);
        } else {
            self.after_send_mutation(id);
        }
    }

    /// Fire delivery notifications for streams whose ack state advanced
    pub(super) fn drain_deliverable(&mut self) {
        let ids: Vec<StreamId> = self.deliverable.drain(..).collect();
        for id in ids {
            let acked_through = match self.streams.get(&id).and_then(|s| s.send.as_ref()) {
                Some(send) => send
                    .acked
                    .peek_min()
                    .filter(|r| r.start == 0)
                    .map_or(0, |r| r.end),
                // The stream may already be gone; acked byte events for it
                // fired when the ack arrived
                None => continue,
            };
            self.events.push_back(StreamEvent::Delivered {
                id,
                offset: acked_through,
            });
            let mut fired = Vec::new();
            self.byte_events.retain(|&(kind, event_id, offset)| {
                if event_id == id && kind == ByteEventKind::Ack && offset < acked_through {
                    fired.push(StreamEvent::ByteEvent { kind, id, offset });
                    false
                } else {
                    true
                }
            });
            self.events.extend(fired);
        }
    }

    //
    // Transmission
    //

    /// Whether any stream has data ready for a STREAM frame
    pub(super) fn has_sendable(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Pull the next chunk from the scheduler, at most `max_len` bytes
    pub(super) fn poll_transmit(
        &mut self,
        max_len: u64,
    ) -> Option<(StreamMeta, Option<Bytes>)> {
        while !self.pending.is_empty() {
            let id = self.pending.peek_next();
            let stream = match self.streams.get_mut(&id) {
                Some(x) => x,
                None => {
                    self.pending.erase(id);
                    continue;
                }
            };
            let send = match stream.send.as_mut() {
                Some(x) => x,
                None => {
                    self.pending.erase(id);
                    continue;
                }
            };
            let Some((chunk, payload)) = send.poll_transmit(max_len) else {
                self.pending.erase(id);
                send.scheduled = false;
                continue;
            };
            let meta = StreamMeta {
                id,
                offsets: chunk.offset..chunk.offset + chunk.data.len(),
                fin: chunk.fin,
                from_meta: payload.is_none(),
            };
            let len = chunk.data.len();
            if send.has_sendable_data() {
                self.pending.consume(Some(len));
            } else {
                send.scheduled = false;
                self.pending.erase(id);
            }
            // Tx byte events fire as soon as the data is packetized
            let sent_through = meta.offsets.end;
            let mut fired = Vec::new();
            self.byte_events.retain(|&(kind, event_id, offset)| {
                if event_id == id && kind == ByteEventKind::Tx && offset < sent_through {
                    fired.push(StreamEvent::ByteEvent { kind, id, offset });
                    false
                } else {
                    true
                }
            });
            self.events.extend(fired);
            return Some((meta, payload));
        }
        None
    }

    /// (Re-)register the stream with the scheduler after a send-side change
    fn after_send_mutation(&mut self, id: StreamId) {
        let stream = match self.streams.get_mut(&id) {
            Some(x) => x,
            None => return,
        };
        let send = match stream.send.as_mut() {
            Some(x) => x,
            None => return,
        };
        if send.has_sendable_data() && !send.scheduled {
            send.scheduled = true;
            self.pending.insert(id);
        }
    }

    /// Retire the stream once both halves are terminal
    fn check_closed(&mut self, id: StreamId) {
        let Some(stream) = self.streams.get(&id) else {
            return;
        };
        if !stream.is_terminal() {
            return;
        }
        self.streams.shift_remove(&id);
        self.pending.erase(id);
        self.byte_events.retain(|&(_, event_id, _)| event_id != id);
        self.deliverable.shift_remove(&id);
        self.events.push_back(StreamEvent::Closed { id });
        // A retired peer-initiated stream frees a slot in our advertised
        // limit
        if id.initiator() != self.side {
            let dir = id.dir() as usize;
            self.max_remote[dir] += 1;
            match id.dir() {
                Dir::Bi => self.pending_control.max_bi_stream_id = true,
                Dir::Uni => self.pending_control.max_uni_stream_id = true,
            }
        }
    }

    /// Current advertised remote-stream limit, for MAX_STREAMS frames
    pub(super) fn max_remote(&self, dir: Dir) -> u64 {
        self.max_remote[dir as usize]
    }

    /// The limit to advertise in a MAX_STREAM_DATA frame, recording it as
    /// sent; `None` when no update is appropriate
    pub(super) fn max_stream_data_value(&mut self, id: StreamId, now: Instant) -> Option<u64> {
        let stream = self.streams.get_mut(&id)?;
        let recv = stream.recv.as_mut()?;
        if recv.is_finished() || recv.stopped {
            return None;
        }
        let value = recv.flow.next_max();
        recv.flow.record_advertised(value, now);
        Some(value)
    }

    /// The limit to advertise in a MAX_DATA frame, recording it as sent
    pub(super) fn conn_max_data_value(&mut self, now: Instant) -> u64 {
        let value = self.conn_recv.next_max();
        self.conn_recv.record_advertised(value, now);
        value
    }

    /// Mark a stream as protocol-control so `reset_non_control_streams`
    /// leaves it alone
    pub(super) fn set_control(&mut self, id: StreamId, control: bool) -> bool {
        match self.streams.get_mut(&id) {
            Some(stream) => {
                stream.control = control;
                true
            }
            None => false,
        }
    }

    pub(super) fn is_control(&self, id: StreamId) -> bool {
        self.streams.get(&id).map_or(false, |s| s.control)
    }

    /// All live stream ids, in insertion order
    pub(super) fn ids(&self) -> Vec<StreamId> {
        self.streams.keys().copied().collect()
    }

    /// Whether unacknowledged sent data remains anywhere
    pub(super) fn has_undelivered_data(&self) -> bool {
        self.streams.values().any(|stream| {
            stream.send.as_ref().map_or(false, |send| {
                send.state == SendState::ResetSent || send.has_sendable_data() || {
                    send.sent_offset > 0
                        && !(send.acked.covers_through(send.sent_offset - 1))
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn client_streams() -> StreamsState {
        let mut config = TransportConfig::default();
        config.enable_reliable_stream_reset(true);
        let mut streams = StreamsState::new(Side::Client, &config);
        let mut params = PeerParams::default();
        params.initial_max_data = 1 << 20;
        params.initial_max_stream_data_bidi_local = 1 << 16;
        params.initial_max_stream_data_bidi_remote = 1 << 16;
        params.initial_max_stream_data_uni = 1 << 16;
        params.initial_max_streams_bidi = 16;
        params.initial_max_streams_uni = 16;
        params.reliable_stream_reset = true;
        params.max_stream_groups = 4;
        streams.set_params(&params);
        streams
    }

    fn now() -> Instant {
        Instant::now()
    }

    fn drain(streams: &mut StreamsState) -> Vec<StreamEvent> {
        streams.events().drain(..).collect()
    }

    #[test]
    fn open_respects_limits() {
        let mut streams = client_streams();
        for _ in 0..16 {
            streams.open(Dir::Bi).unwrap();
        }
        assert_matches!(streams.open(Dir::Bi), Err(OpenError::Exhausted));
        streams.on_max_streams(Dir::Bi, 17).unwrap();
        let events = drain(&mut streams);
        assert!(events.contains(&StreamEvent::Available { dir: Dir::Bi }));
        streams.open(Dir::Bi).unwrap();
    }

    #[test]
    fn optimistic_open_before_params() {
        let config = TransportConfig::default();
        let mut streams = StreamsState::new(Side::Client, &config);
        let id = streams.open(Dir::Bi).unwrap();
        // No credit yet
        let mut data = Bytes::from_static(b"x");
        assert_matches!(streams.write(id, &mut data, false), Err(WriteError::Blocked));
        let mut params = PeerParams::default();
        params.initial_max_data = 1000;
        params.initial_max_stream_data_bidi_remote = 100;
        streams.set_params(&params);
        assert_eq!(streams.write(id, &mut data, false).unwrap(), 1);
    }

    #[test]
    fn remote_streams_open_implicitly() {
        let mut streams = client_streams();
        let id = StreamId::new(Side::Server, Dir::Uni, 2);
        streams
            .on_stream_frame(frame::Stream {
                id,
                offset: 0,
                fin: false,
                data: Bytes::from_static(b"hi"),
            })
            .unwrap();
        let events = drain(&mut streams);
        let opened: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Opened { .. }))
            .collect();
        // Streams 0..=2 all spring into being
        assert_eq!(opened.len(), 3);
        assert!(events.contains(&StreamEvent::Readable { id }));
    }

    #[test]
    fn remote_stream_limit_enforced() {
        let mut streams = client_streams();
        let id = StreamId::new(Side::Server, Dir::Uni, 1_000_000);
        let err = streams
            .on_stream_frame(frame::Stream {
                id,
                offset: 0,
                fin: false,
                data: Bytes::new(),
            })
            .unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::STREAM_LIMIT_ERROR);
    }

    #[test]
    fn stream_frame_on_send_only_stream_errors() {
        let mut streams = client_streams();
        let id = streams.open(Dir::Uni).unwrap();
        let err = streams
            .on_stream_frame(frame::Stream {
                id,
                offset: 0,
                fin: false,
                data: Bytes::new(),
            })
            .unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::STREAM_STATE_ERROR);
    }

    #[test]
    fn write_then_transmit_then_ack_lifecycle() {
        let mut streams = client_streams();
        let id = streams.open(Dir::Bi).unwrap();
        let mut data = Bytes::from_static(b"hello world");
        assert_eq!(streams.write(id, &mut data, true).unwrap(), 11);
        assert!(streams.has_sendable());
        let (meta, payload) = streams.poll_transmit(1 << 16).unwrap();
        assert_eq!(meta.offsets, 0..11);
        assert!(meta.fin);
        assert_eq!(payload.unwrap(), Bytes::from_static(b"hello world"));
        assert!(!streams.has_sendable());

        streams.ack_stream(&meta).unwrap();
        streams.drain_deliverable();
        let events = drain(&mut streams);
        assert!(events.contains(&StreamEvent::Finished { id }));
        assert!(events.contains(&StreamEvent::Delivered { id, offset: 11 }));
        // Send half closed; bidi recv half still open, so the stream remains
        assert!(streams.streams.contains_key(&id));
    }

    #[test]
    fn uni_stream_closes_after_delivery() {
        let mut streams = client_streams();
        let id = streams.open(Dir::Uni).unwrap();
        let mut data = Bytes::from_static(b"bye");
        streams.write(id, &mut data, true).unwrap();
        let (meta, _) = streams.poll_transmit(1 << 16).unwrap();
        streams.ack_stream(&meta).unwrap();
        let events = drain(&mut streams);
        assert!(events.contains(&StreamEvent::Closed { id }));
        assert!(!streams.streams.contains_key(&id));
        // Late acks for the retired stream are ignored
        streams.ack_stream(&meta).unwrap();
    }

    #[test]
    fn round_robin_across_streams() {
        let mut streams = client_streams();
        let a = streams.open(Dir::Uni).unwrap();
        let b = streams.open(Dir::Uni).unwrap();
        let mut data = Bytes::from(vec![1u8; 100]);
        streams.write(a, &mut data.clone(), false).unwrap();
        streams.write(b, &mut data, false).unwrap();
        // Default scheduling: advance after each frame
        let (first, _) = streams.poll_transmit(40).unwrap();
        let (second, _) = streams.poll_transmit(40).unwrap();
        let (third, _) = streams.poll_transmit(40).unwrap();
        assert_eq!(first.id, a);
        assert_eq!(second.id, b);
        assert_eq!(third.id, a);
    }

    #[test]
    fn reset_enqueues_frame_and_stops_data() {
        let mut streams = client_streams();
        let id = streams.open(Dir::Uni).unwrap();
        let mut data = Bytes::from_static(b"abcdef");
        streams.write(id, &mut data, false).unwrap();
        streams.reset(id, VarInt::from_u32(9), None).unwrap();
        assert_eq!(streams.pending_control.reset_stream.len(), 1);
        let rst = streams.pending_control.reset_stream[0];
        assert_eq!(rst.error_code, VarInt::from_u32(9));
        assert_eq!(rst.final_size, VarInt::from_u32(6));
        assert!(rst.reliable_size.is_none());
        assert!(streams.poll_transmit(100).is_none());
        // Peer acks the reset: stream retires
        streams.ack_reset(id, None).unwrap();
        let events = drain(&mut streams);
        assert!(events.contains(&StreamEvent::Closed { id }));
    }

    #[test]
    fn reliable_size_dropped_without_peer_support() {
        let mut config = TransportConfig::default();
        config.enable_reliable_stream_reset(true);
        let mut streams = StreamsState::new(Side::Client, &config);
        let mut params = PeerParams::default();
        params.initial_max_data = 1000;
        params.initial_max_stream_data_uni = 100;
        params.initial_max_streams_uni = 4;
        params.reliable_stream_reset = false;
        streams.set_params(&params);
        let id = streams.open(Dir::Uni).unwrap();
        let mut data = Bytes::from_static(b"abcdef");
        streams.write(id, &mut data, false).unwrap();
        streams.reset(id, VarInt::from_u32(1), Some(3)).unwrap();
        assert!(streams.pending_control.reset_stream[0].reliable_size.is_none());
    }

    #[test]
    fn stop_sending_event_fires_once() {
        let mut streams = client_streams();
        let id = streams.open(Dir::Uni).unwrap();
        let stop = frame::StopSending {
            id,
            error_code: VarInt::from_u32(4),
        };
        streams.on_stop_sending(stop).unwrap();
        streams.on_stop_sending(stop).unwrap();
        let stopped: Vec<_> = drain(&mut streams)
            .into_iter()
            .filter(|e| matches!(e, StreamEvent::Stopped { .. }))
            .collect();
        assert_eq!(stopped.len(), 1);
    }

    #[test]
    fn stop_sending_on_receive_only_stream_errors() {
        let mut streams = client_streams();
        let id = StreamId::new(Side::Server, Dir::Uni, 0);
        let err = streams
            .on_stop_sending(frame::StopSending {
                id,
                error_code: VarInt::from_u32(0),
            })
            .unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::STREAM_STATE_ERROR);
    }

    #[test]
    fn connection_flow_control_blocks_writes() {
        let config = TransportConfig::default();
        let mut streams = StreamsState::new(Side::Client, &config);
        let mut params = PeerParams::default();
        params.initial_max_data = 10;
        params.initial_max_stream_data_uni = 100;
        params.initial_max_streams_uni = 4;
        streams.set_params(&params);
        let id = streams.open(Dir::Uni).unwrap();
        let mut data = Bytes::from(vec![0u8; 20]);
        assert_eq!(streams.write(id, &mut data, false).unwrap(), 10);
        assert_matches!(streams.write(id, &mut data, false), Err(WriteError::Blocked));
        streams.on_max_data(30);
        let events = drain(&mut streams);
        assert!(events.contains(&StreamEvent::Writable { id }));
        assert_eq!(streams.write(id, &mut data, false).unwrap(), 10);
    }

    #[test]
    fn group_policy_requires_advertisement() {
        // Local config advertises no groups: setter is an invalid operation
        let config = TransportConfig::default();
        let mut streams = StreamsState::new(Side::Client, &config);
        let mut params = PeerParams::default();
        params.max_stream_groups = 4;
        streams.set_params(&params);
        let group = streams.create_group(Dir::Uni).unwrap();
        assert_matches!(
            streams.set_group_policy(group, None),
            Err(OpenError::GroupsUnsupported)
        );
    }

    #[test]
    fn group_lifecycle_and_policy() {
        let mut config = TransportConfig::default();
        config.max_stream_groups_advertised(4);
        config.enable_reliable_stream_reset(true);
        let mut streams = StreamsState::new(Side::Client, &config);
        let mut params = PeerParams::default();
        params.initial_max_data = 1 << 20;
        params.initial_max_stream_data_uni = 1 << 16;
        params.initial_max_streams_uni = 16;
        params.max_stream_groups = 2;
        streams.set_params(&params);

        let group = streams.create_group(Dir::Uni).unwrap();
        let _ = streams.create_group(Dir::Uni).unwrap();
        assert_matches!(streams.create_group(Dir::Uni), Err(OpenError::Exhausted));

        let id = streams.open_in_group(Dir::Uni, group).unwrap();
        streams
            .set_group_policy(
                group,
                Some(RetransmissionPolicy {
                    disable_retransmission: true,
                }),
            )
            .unwrap();

        let mut data = Bytes::from_static(b"unreliable");
        streams.write(id, &mut data, true).unwrap();
        let (meta, _) = streams.poll_transmit(1 << 16).unwrap();
        // Loss under the policy abandons the data and completes the stream
        streams.on_stream_frame_lost(&meta);
        let events = drain(&mut streams);
        assert!(events.contains(&StreamEvent::Finished { id }));
        assert!(events.contains(&StreamEvent::Closed { id }));
    }

    #[test]
    fn lost_chunks_retransmit_by_default() {
        let mut streams = client_streams();
        let id = streams.open(Dir::Uni).unwrap();
        let mut data = Bytes::from_static(b"retry me");
        streams.write(id, &mut data, false).unwrap();
        let (meta, _) = streams.poll_transmit(1 << 16).unwrap();
        assert!(!streams.has_sendable());
        streams.on_stream_frame_lost(&meta);
        assert!(streams.has_sendable());
        let (again, payload) = streams.poll_transmit(1 << 16).unwrap();
        assert_eq!(again.offsets, meta.offsets);
        assert_eq!(payload.unwrap(), Bytes::from_static(b"retry me"));
    }

    #[test]
    fn byte_events_fire_on_tx_and_ack() {
        let mut streams = client_streams();
        let id = streams.open(Dir::Uni).unwrap();
        streams
            .register_byte_event(ByteEventKind::Tx, id, 2)
            .unwrap();
        streams
            .register_byte_event(ByteEventKind::Ack, id, 2)
            .unwrap();
        let mut data = Bytes::from_static(b"abcd");
        streams.write(id, &mut data, false).unwrap();
        let (meta, _) = streams.poll_transmit(1 << 16).unwrap();
        let events = drain(&mut streams);
        assert!(events.contains(&StreamEvent::ByteEvent {
            kind: ByteEventKind::Tx,
            id,
            offset: 2
        }));
        streams.ack_stream(&meta).unwrap();
        streams.drain_deliverable();
        let events = drain(&mut streams);
        assert!(events.contains(&StreamEvent::ByteEvent {
            kind: ByteEventKind::Ack,
            id,
            offset: 2
        }));
    }

    #[test]
    fn max_streams_credit_returned_when_remote_closes() {
        let mut streams = client_streams();
        let id = StreamId::new(Side::Server, Dir::Uni, 0);
        streams
            .on_stream_frame(frame::Stream {
                id,
                offset: 0,
                fin: true,
                data: Bytes::from_static(b"x"),
            })
            .unwrap();
        let before = streams.max_remote(Dir::Uni);
        // Reading through EOF retires the stream
        assert_eq!(
            &streams.read(id, 100, now(), None).unwrap().unwrap()[..],
            b"x"
        );
        assert_eq!(streams.read(id, 100, now(), None).unwrap(), None);
        assert_eq!(streams.max_remote(Dir::Uni), before + 1);
        assert!(streams.pending_control.max_uni_stream_id);
    }
}
