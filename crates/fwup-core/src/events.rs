//! Event system for UI decoupling.
//!
//! Allows the CLI (or any other front end) to follow an update without
//! tight coupling to the core logic.

use std::fmt;
use std::time::Duration;

use crate::protocol::{Component, DeviceResponse};
use crate::state::SessionState;

/// Events emitted by an update session.
#[derive(Debug, Clone)]
pub enum UpdateEvent {
    /// The session entered a state. `Transferring` is reported once per packet.
    StateChanged {
        component: Component,
        state: SessionState,
    },
    /// Transfer progress in packets.
    Progress {
        component: Component,
        current: u64,
        total: u64,
    },
    /// A packet is being resent after a bad answer.
    Retry {
        sequence: u32,
        attempt: u32,
        response: DeviceResponse,
    },
    /// The operator has to power-cycle the device.
    ManualRebootRequired { message: String, window: Duration },
    /// Serial bytes sent/received.
    Packet {
        direction: PacketDirection,
        length: usize,
    },
}

/// Serial traffic direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Device
    Rx, // Device -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving update events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait UpdateObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &UpdateEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl UpdateObserver for NullObserver {
    fn on_event(&self, _event: &UpdateEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl UpdateObserver for TracingObserver {
    fn on_event(&self, event: &UpdateEvent) {
        match event {
            UpdateEvent::StateChanged { component, state } => {
                tracing::info!(component = %component, state = %state, "State changed");
            }
            UpdateEvent::Progress {
                component,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(component = %component, progress = %format!("{}%", pct), "Progress");
            }
            UpdateEvent::Retry {
                sequence,
                attempt,
                response,
            } => {
                tracing::warn!(sequence, attempt, response = %response, "Resending packet");
            }
            UpdateEvent::ManualRebootRequired { message, window } => {
                tracing::warn!(window_secs = window.as_secs(), "{}", message);
            }
            UpdateEvent::Packet { direction, length } => {
                tracing::trace!(dir = %direction, len = length, "Serial packet");
            }
        }
    }
}
