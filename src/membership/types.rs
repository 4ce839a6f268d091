use std::time::Duration;

use crate::error::TransportFailure;
use crate::store::MembershipStatus;

/// Outbound call issued for a peer in a given status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAction {
    Register,
    Ping,
}

impl PeerAction {
    /// `None` for disabled peers: they are never contacted.
    pub fn for_status(status: MembershipStatus) -> Option<Self> {
        match status {
            MembershipStatus::Unknown | MembershipStatus::Registration => {
                Some(PeerAction::Register)
            }
            MembershipStatus::Active
            | MembershipStatus::Down
            | MembershipStatus::ConnectionRefused => Some(PeerAction::Ping),
            MembershipStatus::Disabled => None,
        }
    }
}

/// Result of one outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerOutcome {
    /// ACK received; the local entry was replaced with the peer's own descriptor.
    Registered,
    /// REG could not be delivered or was rejected.
    RegistrationFailed(TransportFailure),
    /// Heartbeat answered with `Pong`.
    Alive,
    /// Heartbeat failed.
    Unreachable(TransportFailure),
    /// ACK arrived after the peer was disabled or removed; it was dropped.
    Withdrawn,
}

impl PeerOutcome {
    /// Status the peer ends up in. `None` when the record is left alone.
    pub fn next_status(&self) -> Option<MembershipStatus> {
        match self {
            PeerOutcome::Registered | PeerOutcome::Alive => Some(MembershipStatus::Active),
            PeerOutcome::RegistrationFailed(_) => Some(MembershipStatus::Registration),
            PeerOutcome::Unreachable(TransportFailure::Refused) => {
                Some(MembershipStatus::ConnectionRefused)
            }
            PeerOutcome::Unreachable(_) => Some(MembershipStatus::Down),
            PeerOutcome::Withdrawn => None,
        }
    }
}

/// Timing and fan-out knobs for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    pub refused_backoff: Duration,
    pub registration_backoff: Duration,
    pub heartbeat_backoff: Duration,
    pub max_concurrent_calls: usize,
}

impl SchedulerSettings {
    /// How long the peer is left alone after `outcome`. `None` on success.
    pub fn backoff_for(&self, outcome: &PeerOutcome) -> Option<Duration> {
        match outcome {
            PeerOutcome::Registered | PeerOutcome::Alive | PeerOutcome::Withdrawn => None,
            PeerOutcome::RegistrationFailed(TransportFailure::Refused)
            | PeerOutcome::Unreachable(TransportFailure::Refused) => Some(self.refused_backoff),
            PeerOutcome::RegistrationFailed(_) => Some(self.registration_backoff),
            PeerOutcome::Unreachable(_) => Some(self.heartbeat_backoff),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(2000),
            refused_backoff: Duration::from_millis(5000),
            registration_backoff: Duration::from_millis(7000),
            heartbeat_backoff: Duration::from_millis(10000),
            max_concurrent_calls: 32,
        }
    }
}

/// Per-tick counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub registered: usize,
    pub registration_failed: usize,
    pub alive: usize,
    pub down: usize,
    pub refused: usize,
    /// ACKs dropped because the peer was disabled or removed meanwhile.
    pub withdrawn: usize,
    /// Still inside a backoff window.
    pub deferred: usize,
    /// Disabled, or pointing back at this node.
    pub skipped: usize,
}

impl TickReport {
    pub fn record(&mut self, outcome: &PeerOutcome) {
        match outcome {
            PeerOutcome::Registered => self.registered += 1,
            PeerOutcome::RegistrationFailed(_) => self.registration_failed += 1,
            PeerOutcome::Alive => self.alive += 1,
            PeerOutcome::Unreachable(TransportFailure::Refused) => self.refused += 1,
            PeerOutcome::Unreachable(_) => self.down += 1,
            PeerOutcome::Withdrawn => self.withdrawn += 1,
        }
    }

    /// Number of outbound calls made during the tick.
    pub fn contacted(&self) -> usize {
        self.registered
            + self.registration_failed
            + self.alive
            + self.down
            + self.refused
            + self.withdrawn
    }
}
