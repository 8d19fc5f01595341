use tracing::{info, warn};

use crate::error::ProtocolError;
use crate::session::Phase;

/// Narrow presentation interface the protocols report through.
pub trait SessionObserver {
    fn on_phase_changed(&mut self, phase: Phase);

    /// An application payload was delivered by the peer.
    fn on_message_delivered(&mut self, payload: &str);

    /// Human-readable progress text, e.g. "ACK received, ready to receive data".
    fn on_status(&mut self, _status: &str) {}

    fn on_error(&mut self, _error: &ProtocolError) {}
}

impl SessionObserver for () {
    fn on_phase_changed(&mut self, _phase: Phase) {}

    fn on_message_delivered(&mut self, _payload: &str) {}
}

impl<O: SessionObserver + ?Sized> SessionObserver for Box<O> {
    fn on_phase_changed(&mut self, phase: Phase) {
        (**self).on_phase_changed(phase);
    }

    fn on_message_delivered(&mut self, payload: &str) {
        (**self).on_message_delivered(payload);
    }

    fn on_status(&mut self, status: &str) {
        (**self).on_status(status);
    }

    fn on_error(&mut self, error: &ProtocolError) {
        (**self).on_error(error);
    }
}

/// Fans each observation out to both halves in order.
impl<A: SessionObserver, B: SessionObserver> SessionObserver for (A, B) {
    fn on_phase_changed(&mut self, phase: Phase) {
        self.0.on_phase_changed(phase);
        self.1.on_phase_changed(phase);
    }

    fn on_message_delivered(&mut self, payload: &str) {
        self.0.on_message_delivered(payload);
        self.1.on_message_delivered(payload);
    }

    fn on_status(&mut self, status: &str) {
        self.0.on_status(status);
        self.1.on_status(status);
    }

    fn on_error(&mut self, error: &ProtocolError) {
        self.0.on_error(error);
        self.1.on_error(error);
    }
}

/// Forwards every observation to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SessionObserver for TracingObserver {
    fn on_phase_changed(&mut self, phase: Phase) {
        info!(%phase, "phase changed");
    }

    fn on_message_delivered(&mut self, payload: &str) {
        info!(payload, "message delivered");
    }

    fn on_status(&mut self, status: &str) {
        info!(status, "status");
    }

    fn on_error(&mut self, error: &ProtocolError) {
        warn!(%error, "protocol error");
    }
}

/// One captured observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverEvent {
    PhaseChanged(Phase),
    MessageDelivered(String),
    Status(String),
    Error(ProtocolError),
}

/// Captures observations in order, for tests and the simulator report.
#[derive(Debug, Default, Clone)]
pub struct RecordingObserver {
    pub events: Vec<ObserverEvent>,
}

impl RecordingObserver {
    pub fn phases(&self) -> Vec<Phase> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ObserverEvent::PhaseChanged(p) => Some(*p),
                _ => None,
            })
            .collect()
    }

    pub fn delivered(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ObserverEvent::MessageDelivered(m) => Some(m.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn statuses(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ObserverEvent::Status(s) => Some(s.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<&ProtocolError> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ObserverEvent::Error(err) => Some(err),
                _ => None,
            })
            .collect()
    }
}

impl SessionObserver for RecordingObserver {
    fn on_phase_changed(&mut self, phase: Phase) {
        self.events.push(ObserverEvent::PhaseChanged(phase));
    }

    fn on_message_delivered(&mut self, payload: &str) {
        self.events
            .push(ObserverEvent::MessageDelivered(payload.to_string()));
    }

    fn on_status(&mut self, status: &str) {
        self.events.push(ObserverEvent::Status(status.to_string()));
    }

    fn on_error(&mut self, error: &ProtocolError) {
        self.events.push(ObserverEvent::Error(error.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ResponderPhase;

    #[test]
    fn recording_observer_filters_by_kind() {
        let mut observer = RecordingObserver::default();
        observer.on_status("Sending...");
        observer.on_phase_changed(Phase::Responder(ResponderPhase::AwaitingSynAck));
        observer.on_message_delivered("hello");
        observer.on_error(&ProtocolError::ServiceRegistration("busy".into()));

        assert_eq!(observer.statuses(), vec!["Sending..."]);
        assert_eq!(
            observer.phases(),
            vec![Phase::Responder(ResponderPhase::AwaitingSynAck)]
        );
        assert_eq!(observer.delivered(), vec!["hello"]);
        assert_eq!(observer.errors().len(), 1);
    }

    fn observe<O: SessionObserver>(observer: &mut O) {
        observer.on_status("SYN+ACK Sent...");
        observer.on_phase_changed(Phase::Responder(ResponderPhase::Idle));
        observer.on_message_delivered("hello");
        observer.on_error(&ProtocolError::ServiceRegistration("busy".into()));
    }

    #[test]
    fn boxed_observer_forwards() {
        let mut boxed = Box::new(RecordingObserver::default());
        observe(&mut boxed);

        assert_eq!(
            boxed.events,
            vec![
                ObserverEvent::Status("SYN+ACK Sent...".into()),
                ObserverEvent::PhaseChanged(Phase::Responder(ResponderPhase::Idle)),
                ObserverEvent::MessageDelivered("hello".into()),
                ObserverEvent::Error(ProtocolError::ServiceRegistration("busy".into())),
            ]
        );

        let mut unit = ();
        observe(&mut unit);
    }

    #[test]
    fn paired_observers_both_see_everything() {
        let mut pair = (RecordingObserver::default(), RecordingObserver::default());
        pair.on_status("SYN+ACK Sent...");
        pair.on_error(&ProtocolError::ServiceRegistration("busy".into()));
        assert_eq!(pair.0.events, pair.1.events);
        assert_eq!(pair.1.statuses(), vec!["SYN+ACK Sent..."]);
    }
}
