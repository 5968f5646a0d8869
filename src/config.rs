use std::{fmt, sync::Arc, time::Duration};

use crate::{
    congestion::{ControllerFactory, StaticCwndConfig},
    VarInt, DEFAULT_UDP_PAYLOAD_SIZE,
};

/// Parameters governing the core QUIC state machine
///
/// Default values should be suitable for most internet applications.
/// Applications protocols which forbid remotely-initiated streams should set
/// `max_concurrent_bidi_streams` and `max_concurrent_uni_streams` to zero.
pub struct TransportConfig {
    pub(crate) max_concurrent_bidi_streams: VarInt,
    pub(crate) max_concurrent_uni_streams: VarInt,
    pub(crate) max_idle_timeout: Option<Duration>,
    pub(crate) stream_receive_window_bidi_local: VarInt,
    pub(crate) stream_receive_window_bidi_remote: VarInt,
    pub(crate) stream_receive_window_uni: VarInt,
    pub(crate) receive_window: VarInt,
    pub(crate) send_window: u64,

    pub(crate) max_udp_payload_size: u16,
    pub(crate) ack_delay_exponent: u64,
    pub(crate) max_ack_delay: Duration,

    pub(crate) keep_alive_interval: Option<Duration>,
    /// Packets that arrive before their keys buffer here, per level
    pub(crate) max_packets_to_buffer: usize,

    pub(crate) datagram_receive_buffer_size: Option<usize>,
    pub(crate) datagram_send_buffer_size: usize,

    pub(crate) auto_tune_flow_control: bool,
    pub(crate) pacing_enabled: bool,

    pub(crate) enable_reliable_stream_reset: bool,
    pub(crate) enable_knob_frames: bool,
    pub(crate) extended_ack_features: u64,
    pub(crate) max_stream_groups_advertised: u64,
    pub(crate) ack_receive_timestamps_enabled: bool,
    /// Ceiling applied to the peer's max_receive_timestamps_per_ack
    pub(crate) max_receive_timestamps_per_ack_stored: u64,

    pub(crate) congestion_controller_factory: Arc<dyn ControllerFactory>,
}

impl TransportConfig {
    /// Upper bound we are willing to honor for a peer's idle timeout
    pub(crate) const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

    /// Maximum number of incoming bidirectional streams that may be open
    /// concurrently
    pub fn max_concurrent_bidi_streams(&mut self, value: VarInt) -> &mut Self {
        self.max_concurrent_bidi_streams = value;
        self
    }

    /// Maximum number of incoming unidirectional streams that may be open
    /// concurrently
    pub fn max_concurrent_uni_streams(&mut self, value: VarInt) -> &mut Self {
        self.max_concurrent_uni_streams = value;
        self
    }

    /// Maximum duration of inactivity to accept before timing out the
    /// connection; `None` disables the timeout
    pub fn max_idle_timeout(&mut self, value: Option<Duration>) -> &mut Self {
        self.max_idle_timeout = value;
        self
    }

    /// Flow control window for locally-initiated bidirectional streams
    pub fn stream_receive_window_bidi_local(&mut self, value: VarInt) -> &mut Self {
        self.stream_receive_window_bidi_local = value;
        self
    }

    /// Flow control window for remotely-initiated bidirectional streams
    pub fn stream_receive_window_bidi_remote(&mut self, value: VarInt) -> &mut Self {
        self.stream_receive_window_bidi_remote = value;
        self
    }

    /// Flow control window for unidirectional streams
    pub fn stream_receive_window_uni(&mut self, value: VarInt) -> &mut Self {
        self.stream_receive_window_uni = value;
        self
    }

    /// Connection-level flow control window
    pub fn receive_window(&mut self, value: VarInt) -> &mut Self {
        self.receive_window = value;
        self
    }

    /// Maximum unacknowledged data that may be buffered for transmission
    pub fn send_window(&mut self, value: u64) -> &mut Self {
        self.send_window = value;
        self
    }

    /// Interval after which, in the absence of other traffic, a PING frame
    /// keeps the connection alive
    pub fn keep_alive_interval(&mut self, value: Option<Duration>) -> &mut Self {
        self.keep_alive_interval = value;
        self
    }

    /// How many undecryptable packets to hold per level while waiting for keys
    pub fn max_packets_to_buffer(&mut self, value: usize) -> &mut Self {
        self.max_packets_to_buffer = value;
        self
    }

    /// Receive buffer for DATAGRAM frames; `None` disables the extension
    pub fn datagram_receive_buffer_size(&mut self, value: Option<usize>) -> &mut Self {
        self.datagram_receive_buffer_size = value;
        self
    }

    /// Send buffer for DATAGRAM frames
    pub fn datagram_send_buffer_size(&mut self, value: usize) -> &mut Self {
        self.datagram_send_buffer_size = value;
        self
    }

    /// Grow flow control windows in response to fast consumption
    pub fn auto_tune_flow_control(&mut self, value: bool) -> &mut Self {
        self.auto_tune_flow_control = value;
        self
    }

    /// Spread transmissions out over time, smoothing bursts
    pub fn pacing_enabled(&mut self, value: bool) -> &mut Self {
        self.pacing_enabled = value;
        self
    }

    /// Offer the RESET_STREAM_AT extension to the peer
    pub fn enable_reliable_stream_reset(&mut self, value: bool) -> &mut Self {
        self.enable_reliable_stream_reset = value;
        self
    }

    /// Offer the knob-frame extension to the peer
    pub fn enable_knob_frames(&mut self, value: bool) -> &mut Self {
        self.enable_knob_frames = value;
        self
    }

    /// Extended-ack feature bitmask to advertise
    pub fn extended_ack_features(&mut self, value: u64) -> &mut Self {
        self.extended_ack_features = value;
        self
    }

    /// Maximum number of stream groups to advertise; zero disables groups
    pub fn max_stream_groups_advertised(&mut self, value: u64) -> &mut Self {
        self.max_stream_groups_advertised = value;
        self
    }

    /// Request per-packet receive timestamps from the peer
    pub fn ack_receive_timestamps_enabled(&mut self, value: bool) -> &mut Self {
        self.ack_receive_timestamps_enabled = value;
        self
    }

    /// Ceiling applied to how many receive timestamps we store per ACK
    pub fn max_receive_timestamps_per_ack_stored(&mut self, value: u64) -> &mut Self {
        self.max_receive_timestamps_per_ack_stored = value;
        self
    }

    /// How to construct the congestion controller
    pub fn congestion_controller_factory(
        &mut self,
        factory: Arc<dyn ControllerFactory>,
    ) -> &mut Self {
        self.congestion_controller_factory = factory;
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        const EXPECTED_RTT: u32 = 100; // ms
        const MAX_STREAM_BANDWIDTH: u32 = 12500 * 1000; // bytes/s
        // Window size needed to avoid pipeline stalls
        const STREAM_RWND: u32 = MAX_STREAM_BANDWIDTH / 1000 * EXPECTED_RTT;

        Self {
            max_concurrent_bidi_streams: 100u32.into(),
            max_concurrent_uni_streams: 100u32.into(),
            max_idle_timeout: Some(Duration::from_secs(60)),
            stream_receive_window_bidi_local: STREAM_RWND.into(),
            stream_receive_window_bidi_remote: STREAM_RWND.into(),
            stream_receive_window_uni: STREAM_RWND.into(),
            receive_window: VarInt::from_u32(8 * STREAM_RWND),
            send_window: 8 * STREAM_RWND as u64,

            max_udp_payload_size: DEFAULT_UDP_PAYLOAD_SIZE,
            ack_delay_exponent: 3,
            max_ack_delay: Duration::from_millis(25),

            keep_alive_interval: None,
            max_packets_to_buffer: 10,

            datagram_receive_buffer_size: Some(STREAM_RWND as usize),
            datagram_send_buffer_size: 1024 * 1024,

            auto_tune_flow_control: false,
            pacing_enabled: true,

            enable_reliable_stream_reset: false,
            enable_knob_frames: false,
            extended_ack_features: 0,
            max_stream_groups_advertised: 0,
            ack_receive_timestamps_enabled: false,
            max_receive_timestamps_per_ack_stored: 10,

            congestion_controller_factory: Arc::new(StaticCwndConfig::default()),
        }
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("TransportConfig")
            .field(
                "max_concurrent_bidi_streams",
                &self.max_concurrent_bidi_streams,
            )
            .field(
                "max_concurrent_uni_streams",
                &self.max_concurrent_uni_streams,
            )
            .field("max_idle_timeout", &self.max_idle_timeout)
            .field("receive_window", &self.receive_window)
            .field("send_window", &self.send_window)
            .field("max_udp_payload_size", &self.max_udp_payload_size)
            .field("keep_alive_interval", &self.keep_alive_interval)
            .field("pacing_enabled", &self.pacing_enabled)
            .field(
                "enable_reliable_stream_reset",
                &self.enable_reliable_stream_reset,
            )
            .field("max_stream_groups_advertised", &self.max_stream_groups_advertised)
            .finish_non_exhaustive()
    }
}
