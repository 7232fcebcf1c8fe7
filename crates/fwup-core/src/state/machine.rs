//! State machine implementation for one component update.

use std::fmt;

/// Why a session ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    HandshakeTimeout,
    CommandRejected,
    TransferAborted,
    IntegrityMismatch,
    ManualRebootTimeout,
    TransportIo,
    ImageResolution,
    Encoding,
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::HandshakeTimeout => "HANDSHAKE_TIMEOUT",
            FailureKind::CommandRejected => "COMMAND_REJECTED",
            FailureKind::TransferAborted => "TRANSFER_ABORTED",
            FailureKind::IntegrityMismatch => "INTEGRITY_MISMATCH",
            FailureKind::ManualRebootTimeout => "MANUAL_REBOOT_TIMEOUT",
            FailureKind::TransportIo => "TRANSPORT_IO",
            FailureKind::ImageResolution => "IMAGE_RESOLUTION",
            FailureKind::Encoding => "ENCODING",
            FailureKind::Cancelled => "CANCELLED",
        };
        write!(f, "{}", s)
    }
}

/// State of an update session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Handshaking,
    Transferring,
    Verifying,
    AwaitingReboot,
    Complete,
    Failed(FailureKind),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "IDLE"),
            SessionState::Handshaking => write!(f, "HANDSHAKING"),
            SessionState::Transferring => write!(f, "TRANSFERRING"),
            SessionState::Verifying => write!(f, "VERIFYING"),
            SessionState::AwaitingReboot => write!(f, "AWAITING_REBOOT"),
            SessionState::Complete => write!(f, "COMPLETE"),
            SessionState::Failed(kind) => write!(f, "FAILED({})", kind),
        }
    }
}

impl SessionState {
    /// `Complete` and `Failed` end the session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Complete | SessionState::Failed(_))
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// `Transferring -> Transferring` is the step to the next packet.
    pub fn can_transition(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (*self, next) {
            (Complete, _) | (Failed(_), _) => false,
            (_, Failed(_)) => true,
            (Idle, Handshaking) => true,
            (Handshaking, Transferring) | (Handshaking, Verifying) => true,
            (Transferring, Transferring) | (Transferring, Verifying) => true,
            (Verifying, AwaitingReboot) => true,
            (AwaitingReboot, Complete) => true,
            _ => false,
        }
    }
}

/// Per-packet retry counter.
///
/// Created fresh for every packet; never shared between packets.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    max_retries: u32,
    retries: u32,
}

impl RetryBudget {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            retries: 0,
        }
    }

    /// Record a failed attempt. Returns `false` once the budget is exhausted.
    pub fn record_failure(&mut self) -> bool {
        self.retries += 1;
        self.retries <= self.max_retries
    }

    /// Retries consumed so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Sends made so far, counting the first one.
    pub fn attempts(&self) -> u32 {
        self.retries + 1
    }
}

/// Current state holder with transition logging.
#[derive(Debug, Default)]
pub struct StateMachine {
    state: SessionState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Transition to a new state.
    pub fn goto_state(&mut self, new_state: SessionState) {
        debug_assert!(
            self.state.can_transition(new_state),
            "illegal transition {} -> {}",
            self.state,
            new_state
        );
        tracing::debug!(from = %self.state, to = %new_state, "State transition");
        self.state = new_state;
    }
}
