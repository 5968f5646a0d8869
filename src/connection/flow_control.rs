use std::time::{Duration, Instant};

use tracing::trace;

use crate::transport_error::TransportError;

/// Ceiling for auto-tuned receive windows
const MAX_AUTO_TUNED_WINDOW: u64 = 16 * 1024 * 1024;

/// Whether an update frame should be enqueued promptly
///
/// When `false`, an update is only worth transmitting if an earlier one was
/// lost.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[must_use = "a window update frame might need to be enqueued"]
pub(crate) struct ShouldTransmit(pub(crate) bool);

/// Receive-side flow control for a connection or a single stream
///
/// Tracks what we advertised, what has arrived, and what the application has
/// consumed; decides when a MAX_DATA / MAX_STREAM_DATA update is due, and
/// optionally grows the window when the application drains it faster than
/// one round trip.
#[derive(Debug)]
pub(crate) struct RecvWindow {
    window: u64,
    /// Largest offset limit we have advertised to the peer
    advertised: u64,
    /// Bytes delivered to (or skipped by) the application
    consumed: u64,
    /// Highest data offset observed
    highest_recv: u64,
    auto_tune: bool,
    /// When we last advertised a larger limit; drives auto-tuning
    last_update: Option<Instant>,
}

impl RecvWindow {
    pub(crate) fn new(window: u64, auto_tune: bool) -> Self {
        Self {
            window,
            advertised: window,
            consumed: 0,
            highest_recv: 0,
            auto_tune,
            last_update: None,
        }
    }

    /// Account data newly visible at `offset`; returns how many previously
    /// unseen bytes this represents
    pub(crate) fn record_recv(&mut self, offset: u64) -> Result<u64, TransportError> {
        if offset > self.advertised {
            return Err(TransportError::FLOW_CONTROL_ERROR(""));
        }
        let new_bytes = offset.saturating_sub(self.highest_recv);
        self.highest_recv = self.highest_recv.max(offset);
        Ok(new_bytes)
    }

    /// Account `n` previously unseen bytes (connection-level aggregation)
    pub(crate) fn record_recv_bytes(&mut self, n: u64) -> Result<(), TransportError> {
        self.highest_recv += n;
        if self.highest_recv > self.advertised {
            return Err(TransportError::FLOW_CONTROL_ERROR(""));
        }
        Ok(())
    }

    /// The application consumed `n` bytes; possibly grow the window and
    /// report whether an update frame is due
    ///
    /// `rtt` is the current smoothed RTT, used to detect that the window
    /// turned over within a round trip and should be enlarged.
    pub(crate) fn on_consumed(
        &mut self,
        n: u64,
        now: Instant,
        rtt: Option<Duration>,
    ) -> ShouldTransmit {
        self.consumed += n;
        let unannounced = (self.consumed + self.window).saturating_sub(self.advertised);
        if unannounced < self.window / 2 {
            return ShouldTransmit(false);
        }
        if self.auto_tune {
            if let (Some(last), Some(rtt)) = (self.last_update, rtt) {
                if now.saturating_duration_since(last) < 2 * rtt
                    && self.window < MAX_AUTO_TUNED_WINDOW
                {
                    self.window = (self.window * 2).min(MAX_AUTO_TUNED_WINDOW);
                    trace!(window = self.window, "grew flow control window");
                }
            }
        }
        ShouldTransmit(true)
    }

    /// The limit to put in the next update frame
    pub(crate) fn next_max(&self) -> u64 {
        self.consumed + self.window
    }

    /// Record that an update frame advertising `value` was transmitted
    pub(crate) fn record_advertised(&mut self, value: u64, now: Instant) {
        if value > self.advertised {
            self.advertised = value;
            self.last_update = Some(now);
        }
    }

    /// Replace the window size, e.g. from the application's setter or when
    /// the peer's transport parameters arrive
    pub(crate) fn set_window(&mut self, window: u64) {
        self.window = window;
        // A shrunken window never retracts an advertisement
        self.advertised = self.advertised.max(self.consumed + window);
    }

    pub(crate) fn window(&self) -> u64 {
        self.window
    }

    pub(crate) fn advertised(&self) -> u64 {
        self.advertised
    }

    pub(crate) fn consumed(&self) -> u64 {
        self.consumed
    }

    pub(crate) fn highest_recv(&self) -> u64 {
        self.highest_recv
    }
}

/// Send-side flow control: the peer's advertised limit versus what we've sent
#[derive(Debug, Default)]
pub(crate) struct SendWindow {
    /// Peer's advertised maximum offset
    peer_max: u64,
    /// Bytes of stream data sent (connection level: summed over streams)
    sent: u64,
    /// Whether we have signalled being blocked at the current limit
    blocked_at: Option<u64>,
}

impl SendWindow {
    pub(crate) fn new(peer_max: u64) -> Self {
        Self {
            peer_max,
            sent: 0,
            blocked_at: None,
        }
    }

    pub(crate) fn available(&self) -> u64 {
        self.peer_max.saturating_sub(self.sent)
    }

    pub(crate) fn on_sent(&mut self, n: u64) {
        self.sent += n;
        debug_assert!(self.sent <= self.peer_max, "sent past the peer's limit");
    }

    /// Returns whether this update unblocked us
    pub(crate) fn on_peer_max(&mut self, offset: u64) -> bool {
        if offset <= self.peer_max {
            return false;
        }
        let was_blocked = self.sent == self.peer_max;
        self.peer_max = offset;
        self.blocked_at = None;
        was_blocked
    }

    /// Whether a DATA_BLOCKED / STREAM_DATA_BLOCKED should be sent, marking
    /// the limit as reported
    pub(crate) fn should_signal_blocked(&mut self) -> bool {
        if self.available() == 0 && self.blocked_at != Some(self.peer_max) {
            self.blocked_at = Some(self.peer_max);
            return true;
        }
        false
    }

    pub(crate) fn peer_max(&self) -> u64 {
        self.peer_max
    }

    pub(crate) fn sent(&self) -> u64 {
        self.sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_enforces_advertised_limit() {
        let mut window = RecvWindow::new(100, false);
        assert_eq!(window.record_recv(60).unwrap(), 60);
        assert_eq!(window.record_recv(100).unwrap(), 40);
        assert!(window.record_recv(101).is_err());
    }

    #[test]
    fn update_due_at_half_window() {
        let now = Instant::now();
        let mut window = RecvWindow::new(100, false);
        window.record_recv(100).unwrap();
        assert_eq!(window.on_consumed(30, now, None), ShouldTransmit(false));
        assert_eq!(window.on_consumed(20, now, None), ShouldTransmit(true));
        assert_eq!(window.next_max(), 150);
        window.record_advertised(150, now);
        assert_eq!(window.advertised(), 150);
    }

    #[test]
    fn auto_tune_grows_on_fast_consumption() {
        let now = Instant::now();
        let rtt = Duration::from_millis(100);
        let mut window = RecvWindow::new(100, true);
        window.record_recv(100).unwrap();
        let t = window.on_consumed(60, now, Some(rtt));
        assert_eq!(t, ShouldTransmit(true));
        window.record_advertised(window.next_max(), now);
        // Second turnover arrives well within 2 RTT: window doubles
        window.record_recv(160).unwrap();
        let t = window.on_consumed(60, now + Duration::from_millis(50), Some(rtt));
        assert_eq!(t, ShouldTransmit(true));
        assert_eq!(window.window(), 200);
    }

    #[test]
    fn no_auto_tune_when_slow() {
        let now = Instant::now();
        let rtt = Duration::from_millis(10);
        let mut window = RecvWindow::new(100, true);
        window.record_recv(100).unwrap();
        let _ = window.on_consumed(60, now, Some(rtt));
        window.record_advertised(window.next_max(), now);
        window.record_recv(160).unwrap();
        let _ = window.on_consumed(60, now + Duration::from_secs(5), Some(rtt));
        assert_eq!(window.window(), 100);
    }

    #[test]
    fn send_window_blocks_and_unblocks() {
        let mut window = SendWindow::new(50);
        assert_eq!(window.available(), 50);
        window.on_sent(50);
        assert_eq!(window.available(), 0);
        assert!(window.should_signal_blocked());
        // Only report the same limit once
        assert!(!window.should_signal_blocked());
        assert!(window.on_peer_max(80));
        assert_eq!(window.available(), 30);
        // Stale or duplicate updates are ignored
        assert!(!window.on_peer_max(60));
        assert_eq!(window.peer_max(), 80);
    }
}
