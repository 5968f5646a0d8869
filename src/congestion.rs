//! Pluggable congestion controllers
//!
//! The engine consults the controller for a send budget and reports sends,
//! acks, and loss events to it; everything else is up to the algorithm.
//! A fixed-window controller is provided for tests and for deployments that
//! pin the window externally.

use std::{any::Any, sync::Arc, time::Instant};

use crate::connection::RttEstimator;

/// Limits the rate at which packets may be sent on a connection
pub trait Controller: Send + Sync {
    /// One or more packets were just sent
    #[allow(unused_variables)]
    fn on_sent(&mut self, now: Instant, bytes: u64, last_packet_number: u64) {}

    /// Packet deliveries were confirmed
    ///
    /// `app_limited` indicates whether the connection was blocked on outgoing
    /// application data, rather than congestion, when these packets were sent.
    #[allow(unused_variables)]
    fn on_ack(
        &mut self,
        now: Instant,
        sent: Instant,
        bytes: u64,
        app_limited: bool,
        rtt: &RttEstimator,
    ) {
    }

    /// Packets are acked in batches; this is called after a full ACK frame
    /// has been processed
    #[allow(unused_variables)]
    fn on_end_acks(
        &mut self,
        now: Instant,
        in_flight: u64,
        app_limited: bool,
        largest_packet_num_acked: Option<u64>,
    ) {
    }

    /// Packets were deemed lost or marked congested
    ///
    /// `in_persistent_congestion` indicates whether the congestion window
    /// should be reset to its minimum.
    #[allow(unused_variables)]
    fn on_congestion_event(
        &mut self,
        now: Instant,
        sent: Instant,
        is_persistent_congestion: bool,
        lost_bytes: u64,
    ) {
    }

    /// Number of ack-eliciting bytes that may be in flight
    fn window(&self) -> u64;

    /// Duplicate the controller's state
    fn clone_box(&self) -> Box<dyn Controller>;

    /// Initial congestion window
    fn initial_window(&self) -> u64;

    /// Returns Self for use in down-casting to extract implementation details
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// Constructs controllers on demand
pub trait ControllerFactory: Send + Sync {
    /// Construct a fresh `Controller`
    fn build(self: Arc<Self>, now: Instant, current_mtu: u16) -> Box<dyn Controller>;
}

/// A controller holding the congestion window at a fixed size
///
/// Useful when an external tuner owns the sending rate, and in tests, where
/// a deterministic budget keeps scenarios reproducible.
#[derive(Debug, Clone)]
pub struct StaticCwnd {
    window: u64,
}

impl Controller for StaticCwnd {
    fn window(&self) -> u64 {
        self.window
    }

    fn clone_box(&self) -> Box<dyn Controller> {
        Box::new(self.clone())
    }

    fn initial_window(&self) -> u64 {
        self.window
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Configuration for the [`StaticCwnd`] controller
#[derive(Debug, Clone)]
pub struct StaticCwndConfig {
    window: u64,
}

impl StaticCwndConfig {
    /// Default fixed window: generous enough that tests rarely hit it
    pub const DEFAULT_WINDOW: u64 = 1_000_000;

    /// Set the fixed congestion window size in bytes
    pub fn window(&mut self, window: u64) -> &mut Self {
        self.window = window;
        self
    }
}

impl Default for StaticCwndConfig {
    fn default() -> Self {
        Self {
            window: Self::DEFAULT_WINDOW,
        }
    }
}

impl ControllerFactory for StaticCwndConfig {
    fn build(self: Arc<Self>, _now: Instant, _current_mtu: u16) -> Box<dyn Controller> {
        Box::new(StaticCwnd {
            window: self.window,
        })
    }
}
