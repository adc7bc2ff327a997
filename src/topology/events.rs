//! Topology Events
//!
//! Events emitted by the target registry for external consumers to react to
//! fabric changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Events emitted by the target registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TopologyEvent {
    /// A device appeared and was handed to the mapping layer
    TargetAdded {
        port: u8,
        address: String,
        role: String,
        timestamp: DateTime<Utc>,
    },

    /// A device vanished and no other path to it remains
    TargetRemoved {
        port: u8,
        address: String,
        timestamp: DateTime<Utc>,
    },

    /// A device lost one path and is now reached through another
    TargetRemapped {
        address: String,
        from_port: u8,
        to_port: u8,
        timestamp: DateTime<Utc>,
    },

    /// A discovery session committed its result
    SessionCompleted {
        port: u8,
        targets: usize,
        added: usize,
        removed: usize,
        timestamp: DateTime<Utc>,
    },

    /// A discovery session failed; the previous result is kept
    SessionFailed {
        port: u8,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl TopologyEvent {
    /// Get the port associated with this event
    pub fn port(&self) -> u8 {
        match self {
            TopologyEvent::TargetAdded { port, .. } => *port,
            TopologyEvent::TargetRemoved { port, .. } => *port,
            TopologyEvent::TargetRemapped { to_port, .. } => *to_port,
            TopologyEvent::SessionCompleted { port, .. } => *port,
            TopologyEvent::SessionFailed { port, .. } => *port,
        }
    }

    /// Check if this is a session-level event
    pub fn is_session_event(&self) -> bool {
        matches!(
            self,
            TopologyEvent::SessionCompleted { .. } | TopologyEvent::SessionFailed { .. }
        )
    }

    /// Get the target address if this is a target event
    pub fn address(&self) -> Option<&str> {
        match self {
            TopologyEvent::TargetAdded { address, .. } => Some(address),
            TopologyEvent::TargetRemoved { address, .. } => Some(address),
            TopologyEvent::TargetRemapped { address, .. } => Some(address),
            _ => None,
        }
    }
}
