use std::fmt;
use std::time::{Duration, Instant};

use blesyn_core::{CharacteristicId, Message, ServiceId};
use serde::Serialize;

/// Which side of the link a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Role {
    Initiator,
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

/// Phase type of one role's transition table.
pub trait SessionPhase: Copy + Eq + fmt::Debug {
    const ROLE: Role;

    fn initial() -> Self;
    /// Position in the transition table; transitions only increase it.
    fn ordinal(self) -> u8;
    fn is_terminal(self) -> bool;
    fn into_phase(self) -> Phase;
}

/// Peripheral-side phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResponderPhase {
    Idle,
    AwaitingSynAck,
    ReadyToSendData,
    AwaitingFinalAckDelivery,
    Closed,
}

impl ResponderPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponderPhase::Idle => "idle",
            ResponderPhase::AwaitingSynAck => "awaiting-syn-ack",
            ResponderPhase::ReadyToSendData => "ready-to-send-data",
            ResponderPhase::AwaitingFinalAckDelivery => "awaiting-final-ack-delivery",
            ResponderPhase::Closed => "closed",
        }
    }
}

impl SessionPhase for ResponderPhase {
    const ROLE: Role = Role::Responder;

    fn initial() -> Self {
        ResponderPhase::Idle
    }

    fn ordinal(self) -> u8 {
        self as u8
    }

    fn is_terminal(self) -> bool {
        self == ResponderPhase::Closed
    }

    fn into_phase(self) -> Phase {
        Phase::Responder(self)
    }
}

/// Central-side phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum InitiatorPhase {
    Idle,
    Scanning,
    Connecting,
    DiscoveringService,
    DiscoveringCharacteristic,
    AwaitingAck,
    ReadyToNotify,
    AwaitingData,
    Done,
    /// Torn down by dismissal, disconnect, or timeout.
    Closed,
}

impl InitiatorPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            InitiatorPhase::Idle => "idle",
            InitiatorPhase::Scanning => "scanning",
            InitiatorPhase::Connecting => "connecting",
            InitiatorPhase::DiscoveringService => "discovering-service",
            InitiatorPhase::DiscoveringCharacteristic => "discovering-characteristic",
            InitiatorPhase::AwaitingAck => "awaiting-ack",
            InitiatorPhase::ReadyToNotify => "ready-to-notify",
            InitiatorPhase::AwaitingData => "awaiting-data",
            InitiatorPhase::Done => "done",
            InitiatorPhase::Closed => "closed",
        }
    }
}

impl SessionPhase for InitiatorPhase {
    const ROLE: Role = Role::Initiator;

    fn initial() -> Self {
        InitiatorPhase::Idle
    }

    fn ordinal(self) -> u8 {
        self as u8
    }

    fn is_terminal(self) -> bool {
        matches!(self, InitiatorPhase::Done | InitiatorPhase::Closed)
    }

    fn into_phase(self) -> Phase {
        Phase::Initiator(self)
    }
}

/// Role-tagged phase, as shown to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Phase {
    Responder(ResponderPhase),
    Initiator(InitiatorPhase),
}

impl Phase {
    pub fn role(&self) -> Role {
        match self {
            Phase::Responder(_) => Role::Responder,
            Phase::Initiator(_) => Role::Initiator,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Responder(p) => write!(f, "responder/{}", p.as_str()),
            Phase::Initiator(p) => write!(f, "initiator/{}", p.as_str()),
        }
    }
}

/// One conversation between an initiator and a responder over one
/// characteristic.
#[derive(Debug, Clone)]
pub struct Session<P: SessionPhase> {
    phase: P,
    service: ServiceId,
    characteristic: CharacteristicId,
    pending_payload: Option<Message>,
    last_received_payload: Option<String>,
    phase_entered_at: Option<Instant>,
    transitions: u32,
}

impl<P: SessionPhase> Session<P> {
    pub fn new(service: ServiceId, characteristic: CharacteristicId) -> Self {
        Self {
            phase: P::initial(),
            service,
            characteristic,
            pending_payload: None,
            last_received_payload: None,
            phase_entered_at: None,
            transitions: 0,
        }
    }

    pub fn role(&self) -> Role {
        P::ROLE
    }

    pub fn phase(&self) -> P {
        self.phase
    }

    pub fn service(&self) -> &ServiceId {
        &self.service
    }

    pub fn characteristic(&self) -> &CharacteristicId {
        &self.characteristic
    }

    /// Outbound message not yet confirmed by the transport.
    pub fn pending_payload(&self) -> Option<&Message> {
        self.pending_payload.as_ref()
    }

    pub fn last_received_payload(&self) -> Option<&str> {
        self.last_received_payload.as_deref()
    }

    /// Number of forward transitions taken since creation or last reset.
    pub fn transitions(&self) -> u32 {
        self.transitions
    }

    /// Moves to `next` if it lies strictly after the current phase.
    pub fn advance(&mut self, next: P, now: Instant) -> bool {
        if next.ordinal() <= self.phase.ordinal() {
            return false;
        }
        self.phase = next;
        self.phase_entered_at = Some(now);
        self.transitions += 1;
        true
    }

    /// Returns to the initial phase and drops all per-connection data.
    pub fn reset(&mut self) {
        self.phase = P::initial();
        self.pending_payload = None;
        self.last_received_payload = None;
        self.phase_entered_at = None;
        self.transitions = 0;
    }

    /// Takes ownership of an outbound message until the transport confirms it.
    pub fn queue_payload(&mut self, message: Message) {
        self.pending_payload = Some(message);
    }

    /// Releases the pending message once delivery is confirmed or abandoned.
    pub fn retire_payload(&mut self) -> Option<Message> {
        self.pending_payload.take()
    }

    /// Overwrites the last inbound payload. Earlier ones are not kept.
    pub fn record_received(&mut self, payload: impl Into<String>) {
        self.last_received_payload = Some(payload.into());
    }

    /// Time spent in the current phase, if it was entered by a transition
    /// that is neither initial nor terminal and has exceeded `limit`.
    pub fn stalled_for(&self, now: Instant, limit: Duration) -> Option<Duration> {
        if self.phase == P::initial() || self.phase.is_terminal() {
            return None;
        }
        let entered = self.phase_entered_at?;
        let elapsed = now.saturating_duration_since(entered);
        (elapsed > limit).then_some(elapsed)
    }
}
