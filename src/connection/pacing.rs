//! Pacing of packet transmissions.

use std::time::{Duration, Instant};

use tracing::warn;

/// A simple token-bucket pacer
///
/// The bucket starts full and refills at a rate slightly faster than one
/// congestion window per RTT. Once empty, transmission waits for the refill
/// deadline reported by [`Pacer::delay`].
pub(crate) struct Pacer {
    capacity: u64,
    tokens: u64,
    prev: Instant,
}

impl Pacer {
    pub(crate) fn new(capacity: u64, now: Instant) -> Self {
        Self {
            capacity,
            tokens: capacity,
            prev: now,
        }
    }

    /// Record that a packet has been transmitted.
    pub(crate) fn on_transmit(&mut self, packet_length: u16) {
        self.tokens = self.tokens.saturating_sub(packet_length.into())
    }

    /// Return how long we need to wait before sending a packet.
    ///
    /// If we can send a packet right away, this returns `None`. Otherwise,
    /// returns `Some(d)`, where `d` is the time before this function should
    /// be called again.
    ///
    /// The 5/4 refill ratio is N = 1.25 from the pacing recommendation in the
    /// recovery RFC.
    pub(crate) fn delay(
        &mut self,
        smoothed_rtt: Duration,
        mtu: u16,
        window: u64,
        now: Instant,
    ) -> Option<Instant> {
        debug_assert_ne!(window, 0, "zero-sized congestion control window is nonsense");

        if self.tokens >= mtu.into() {
            return None;
        }

        // Pacing is disabled for extremely large windows
        if window > u32::MAX.into() {
            return None;
        }
        let window = window as u32;

        let time_elapsed = now.checked_duration_since(self.prev).unwrap_or_else(|| {
            warn!("received a timestamp earlier than a previous recorded time, ignoring");
            Default::default()
        });

        if smoothed_rtt.as_nanos() == 0 {
            return None;
        }

        let elapsed_rtts = time_elapsed.as_secs_f64() / smoothed_rtt.as_secs_f64();
        let new_tokens = window as f64 * 1.25 * elapsed_rtts;
        self.tokens = self
            .tokens
            .saturating_add(new_tokens as _)
            .min(self.capacity);
        self.prev = now;

        if self.tokens >= mtu.into() {
            return None;
        }

        let unscaled_delay = smoothed_rtt
            .checked_mul(((u64::from(mtu)).max(self.capacity) - self.tokens) as _)
            .unwrap_or_else(|| Duration::new(u64::MAX, 999_999_999))
            / window;

        // Divisions before multiplications to prevent overflow; this is when
        // the bucket refills enough for one packet
        Some(self.prev + (unscaled_delay / 5) * 4)
    }

    /// Grow or shrink the bucket when the congestion window changes
    pub(crate) fn set_capacity(&mut self, capacity: u64) {
        self.capacity = capacity;
        self.tokens = self.tokens.min(capacity);
    }
}
