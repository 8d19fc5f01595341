use std::fmt;
use std::time::Duration;

use blesyn_transport::TransportOp;
use thiserror::Error;

use crate::session::Phase;

/// Failures surfaced while running either handshake role.
///
/// None of these end a session by themselves. They are logged, handed to
/// the observer, and the state machine keeps waiting for the next event or
/// a disconnect.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The platform stack reported an error for a GATT operation.
    #[error("transport failure during {op}: {reason}")]
    Transport { op: TransportOp, reason: String },
    /// A message arrived that the current phase does not expect. It is
    /// still processed as application data.
    #[error("unexpected {received:?} in phase {phase}, treated as application data")]
    ProtocolViolation { phase: Phase, received: String },
    /// The responder could not register its service; advertising never starts.
    #[error("service registration failed: {0}")]
    ServiceRegistration(String),
    #[error("peer disconnected during handshake in phase {phase}")]
    DisconnectDuringHandshake { phase: Phase },
    #[error("phase {phase} stalled for {elapsed:?}")]
    PhaseTimeout { phase: Phase, elapsed: Duration },
}

impl ProtocolError {
    pub(crate) fn transport(op: TransportOp, reason: impl fmt::Display) -> Self {
        Self::Transport {
            op,
            reason: reason.to_string(),
        }
    }
}
