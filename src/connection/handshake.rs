use thiserror::Error;
use tracing::warn;

use crate::{
    crypto::{DirectionalKeys, KeyChange, PacketKey, Session},
    packet::EncryptionLevel,
    transport_error::TransportError,
};

/// Client handshake phases
///
/// Transitions are driven exclusively by the cryptographic bytes produced
/// and consumed by the session.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub(super) enum Phase {
    Initial,
    Handshake,
    OneRttKeysDerived,
    Established,
}

/// Drives a [`Session`] and tracks the phase and key-rotation bookkeeping
/// around it
pub(super) struct Handshake {
    session: Box<dyn Session>,
    phase: Phase,
    connected: bool,
    early_data_attempted: bool,
    /// Edge-triggered rejection flag; taken once by the application
    zero_rtt_rejected: Option<bool>,
    /// Whether a rejected 0-RTT payload is safe to replay on a successor
    /// connection
    can_resend_zero_rtt: Option<bool>,
    /// Read rotations minus write rotations; legal values are -1, 0, and 1
    traffic_secret_sync: i8,
}

/// Errors from starting the handshake
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ConnectError {
    /// `connect` was invoked a second time
    #[error("connection already initiated")]
    AlreadyConnected,
}

impl Handshake {
    pub(super) fn new(session: Box<dyn Session>) -> Self {
        Self {
            session,
            phase: Phase::Initial,
            connected: false,
            early_data_attempted: false,
            zero_rtt_rejected: None,
            can_resend_zero_rtt: None,
            traffic_secret_sync: 0,
        }
    }

    pub(super) fn session(&self) -> &dyn Session {
        &*self.session
    }

    pub(super) fn phase(&self) -> Phase {
        self.phase
    }

    /// Begin the handshake; may be called exactly once
    ///
    /// Returns 0-RTT write keys if the session's resumption state allows
    /// early data.
    pub(super) fn connect(&mut self) -> Result<Option<DirectionalKeys>, ConnectError> {
        if self.connected {
            return Err(ConnectError::AlreadyConnected);
        }
        self.connected = true;
        let early = self.session.early_keys();
        if early.is_some() {
            self.early_data_attempted = true;
        }
        Ok(early)
    }

    /// Feed CRYPTO bytes received at `level`
    pub(super) fn read(
        &mut self,
        level: EncryptionLevel,
        data: &[u8],
    ) -> Result<(), TransportError> {
        // Levels whose phase has passed must stay silent
        if level == EncryptionLevel::Initial && self.phase >= Phase::OneRttKeysDerived {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "CRYPTO at the Initial level after the handshake advanced",
            ));
        }
        if level == EncryptionLevel::Handshake && self.phase == Phase::Established {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "CRYPTO at the Handshake level after confirmation",
            ));
        }
        if self.phase == Phase::Initial {
            // First server bytes of any kind begin the exchange proper
            self.phase = Phase::Handshake;
        }
        self.session.read_handshake(level, data)
    }

    /// Pump outgoing handshake bytes, advancing the phase when the session
    /// hands over new keys
    pub(super) fn write(&mut self, buf: &mut Vec<u8>) -> Result<Option<KeyChange>, TransportError> {
        let change = self.session.write_handshake(buf);
        match change {
            Some(KeyChange::Handshake { .. }) => {
                if self.phase > Phase::Handshake {
                    return Err(TransportError::PROTOCOL_VIOLATION(
                        "handshake keys derived out of order",
                    ));
                }
            }
            Some(KeyChange::OneRtt { .. }) => {
                if self.phase != Phase::Handshake {
                    return Err(TransportError::PROTOCOL_VIOLATION(
                        "1-RTT keys derived out of order",
                    ));
                }
                self.phase = Phase::OneRttKeysDerived;
                if self.early_data_attempted {
                    self.zero_rtt_rejected =
                        Some(self.session.early_data_accepted() != Some(true));
                }
            }
            None => {}
        }
        Ok(change)
    }

    /// HANDSHAKE_DONE arrived
    pub(super) fn confirm(&mut self) {
        self.phase = Phase::Established;
    }

    pub(super) fn is_established(&self) -> bool {
        self.phase == Phase::Established
    }

    /// Derive the successor 1-RTT write key
    pub(super) fn next_1rtt_write_key(&mut self) -> Result<Box<dyn PacketKey>, TransportError> {
        self.check_rotation(self.traffic_secret_sync - 1)?;
        self.traffic_secret_sync -= 1;
        Ok(self.session.next_1rtt_write_key())
    }

    /// Derive the successor 1-RTT read key
    pub(super) fn next_1rtt_read_key(&mut self) -> Result<Box<dyn PacketKey>, TransportError> {
        self.check_rotation(self.traffic_secret_sync + 1)?;
        self.traffic_secret_sync += 1;
        Ok(self.session.next_1rtt_read_key())
    }

    fn check_rotation(&self, next: i8) -> Result<(), TransportError> {
        if self.phase < Phase::OneRttKeysDerived {
            return Err(TransportError::INTERNAL_ERROR(
                "key rotation before 1-RTT keys exist",
            ));
        }
        if !(-1..=1).contains(&next) {
            warn!(sync = next, "read and write traffic secrets out of sync");
            return Err(TransportError::INTERNAL_ERROR(
                "traffic secrets out of sync",
            ));
        }
        Ok(())
    }

    pub(super) fn early_data_attempted(&self) -> bool {
        self.early_data_attempted
    }

    /// Record the outcome of comparing real parameters against the cached
    /// ones used for early data
    pub(super) fn set_zero_rtt_outcome(&mut self, rejected: bool, can_resend: bool) {
        self.zero_rtt_rejected = Some(rejected);
        self.can_resend_zero_rtt = Some(can_resend);
    }

    /// Edge-triggered: the first call after a rejection reports it, later
    /// calls report nothing
    pub(super) fn take_zero_rtt_rejected(&mut self) -> Option<bool> {
        match self.zero_rtt_rejected.take() {
            Some(true) => Some(true),
            _ => None,
        }
    }

    pub(super) fn can_resend_zero_rtt(&self) -> Option<bool> {
        self.can_resend_zero_rtt
    }
}
