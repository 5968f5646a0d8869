use std::time::{Duration, Instant};

use crate::TIMER_GRANULARITY;

/// Default initial RTT before any sample arrives, per the recovery spec
pub(super) const INITIAL_RTT: Duration = Duration::from_millis(333);

/// Packets this far below the largest acked are declared lost
pub(super) const PACKET_THRESHOLD: u64 = 3;

/// Ratio applied to the RTT to form the reordering time threshold
pub(super) const TIME_THRESHOLD: f32 = 9.0 / 8.0;

/// Maximum number of consecutive PTOs before backoff stops doubling
pub(super) const MAX_PTO_BACKOFF: u32 = 12;

/// RTT estimation for a connection's path
#[derive(Debug, Copy, Clone)]
pub struct RttEstimator {
    /// The most recent RTT measurement made when receiving an ack for a
    /// previously unacked packet
    latest: Duration,
    /// The smoothed RTT of the connection
    smoothed: Option<Duration>,
    /// The RTT variance
    var: Duration,
    /// The minimum RTT seen in the connection, ignoring ack delay
    min: Duration,
}

impl RttEstimator {
    pub(super) fn new() -> Self {
        Self {
            latest: INITIAL_RTT,
            smoothed: None,
            var: INITIAL_RTT / 2,
            min: INITIAL_RTT,
        }
    }

    pub(super) fn update(&mut self, ack_delay: Duration, rtt: Duration) {
        self.latest = rtt;
        // min_rtt ignores ack delay
        self.min = self.min.min(rtt);
        if let Some(smoothed) = self.smoothed {
            // Adjust for ack delay if plausible
            let adjusted_rtt = if self.min + ack_delay <= self.latest {
                self.latest - ack_delay
            } else {
                self.latest
            };
            let var_sample = if smoothed > adjusted_rtt {
                smoothed - adjusted_rtt
            } else {
                adjusted_rtt - smoothed
            };
            self.var = (3 * self.var + var_sample) / 4;
            self.smoothed = Some((7 * smoothed + adjusted_rtt) / 8);
        } else {
            self.smoothed = Some(rtt);
            self.var = rtt / 2;
            self.min = rtt;
        }
    }

    /// Current best RTT estimation
    pub fn get(&self) -> Duration {
        self.smoothed.unwrap_or(self.latest)
    }

    /// Whether any RTT sample has been taken yet
    pub fn has_sample(&self) -> bool {
        self.smoothed.is_some()
    }

    /// Minimum RTT registered so far for this connection
    pub fn min(&self) -> Duration {
        self.min
    }

    /// The latest RTT sample
    pub fn latest(&self) -> Duration {
        self.latest
    }

    /// Base probe timeout interval, before exponential backoff and before the
    /// peer's max ack delay is added for the application space
    pub(super) fn pto_base(&self) -> Duration {
        self.get() + (4 * self.var).max(TIMER_GRANULARITY)
    }
}
