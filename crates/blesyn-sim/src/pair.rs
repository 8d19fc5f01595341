use std::time::Instant;

use blesyn_protocol::{
    AdvertisingState, Driver, InitiatorProtocol, ProtocolError, ProtocolSettings,
    RecordingObserver, ResponderProtocol, RunnerExit, SessionPhase, TracingObserver,
};
use blesyn_transport::{
    InMemoryInitiatorTransport, InMemoryResponderTransport, InitiatorTransport, LoopbackLink,
    ResponderTransport,
};

use crate::report::{HandshakeReport, RoleReport};

/// Logs every observation and keeps a copy for the report.
pub type SimObserver = (TracingObserver, RecordingObserver);

pub fn sim_observer() -> SimObserver {
    (TracingObserver, RecordingObserver::default())
}

pub type LoopbackResponder = ResponderProtocol<InMemoryResponderTransport, SimObserver>;
pub type LoopbackInitiator = InitiatorProtocol<InMemoryInitiatorTransport, SimObserver>;

/// Both roles wired through an in-process [`LoopbackLink`].
pub struct LoopbackPair {
    link: LoopbackLink,
    responder: LoopbackResponder,
    initiator: LoopbackInitiator,
}

impl LoopbackPair {
    pub fn new(settings: ProtocolSettings) -> Self {
        Self {
            link: LoopbackLink::default(),
            responder: ResponderProtocol::new(
                InMemoryResponderTransport::default(),
                sim_observer(),
                settings.clone(),
            ),
            initiator: InitiatorProtocol::new(
                InMemoryInitiatorTransport::default(),
                sim_observer(),
                settings,
            ),
        }
    }

    /// Starts advertising and scanning.
    pub fn start(&mut self, now: Instant) -> Result<(), ProtocolError> {
        self.responder.start_advertising()?;
        self.initiator.start_scanning(now)
    }

    /// Drops the connection as a radio loss would.
    pub fn sever(&mut self) {
        let responder = self.responder.transport_mut();
        let initiator = self.initiator.transport_mut();
        self.link.sever(responder, initiator);
    }

    pub fn link(&self) -> &LoopbackLink {
        &self.link
    }

    pub fn responder(&self) -> &LoopbackResponder {
        &self.responder
    }

    pub fn responder_mut(&mut self) -> &mut LoopbackResponder {
        &mut self.responder
    }

    pub fn initiator(&self) -> &LoopbackInitiator {
        &self.initiator
    }

    pub fn initiator_mut(&mut self) -> &mut LoopbackInitiator {
        &mut self.initiator
    }

    pub fn report(&self, exit: RunnerExit) -> HandshakeReport {
        let texts = |values: &[Vec<u8>]| {
            values
                .iter()
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .collect::<Vec<_>>()
        };
        let mut report = HandshakeReport::new("loopback", self.responder.settings(), exit)
            .with_responder(RoleReport::new(
                self.responder.phase().into_phase(),
                &self.responder.observer().1,
                self.responder.transport().health_snapshot(),
            ))
            .with_initiator(RoleReport::new(
                self.initiator.phase().into_phase(),
                &self.initiator.observer().1,
                self.initiator.transport().health_snapshot(),
            ));
        report.written = texts(self.link.written_values());
        report.served = texts(self.link.served_values());
        report
    }
}

impl Driver for LoopbackPair {
    fn step(&mut self, now: Instant) -> usize {
        let responder = self.responder.transport_mut();
        let initiator = self.initiator.transport_mut();
        let moved = self.link.route(responder, initiator);
        moved + self.responder.pump(now) + self.initiator.pump(now)
    }

    fn check_timeout(&mut self, now: Instant) -> bool {
        let responder = self.responder.check_timeout(now);
        let initiator = self.initiator.check_timeout(now);
        responder || initiator
    }

    /// Settled once the initiator is finished and the responder has either
    /// closed or lost its central, or when the responder could never
    /// advertise at all.
    fn is_settled(&self) -> bool {
        if self.responder.advertising_state() == AdvertisingState::Failed {
            return true;
        }
        self.initiator.is_finished()
            && (self.responder.phase().is_terminal() || !self.link.is_connected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blesyn_protocol::{run_until_settled, InitiatorPhase, ResponderPhase, RunnerConfig};
    use std::time::Duration;

    fn fast() -> RunnerConfig {
        RunnerConfig {
            tick_interval: Duration::from_millis(1),
            max_ticks: 200,
        }
    }

    #[test]
    fn runner_drives_pair_to_completion() {
        let mut pair = LoopbackPair::new(ProtocolSettings::default());
        pair.start(Instant::now()).expect("start");
        let exit = run_until_settled(&mut pair, &fast());

        assert!(exit.is_settled());
        assert_eq!(pair.responder().phase(), ResponderPhase::Closed);
        assert_eq!(pair.initiator().phase(), InitiatorPhase::Done);

        let report = pair.report(exit);
        assert!(report.completed);
        assert_eq!(report.served, vec!["ACK", "hello world", "Final ACK"]);
        assert_eq!(report.written, vec!["SYN+ACK", "Received Message"]);
        assert_eq!(
            report.initiator.as_ref().map(|r| r.delivered.clone()),
            Some(vec!["hello world".to_string()])
        );
    }

    #[test]
    fn rejected_registration_settles_without_completion() {
        let mut pair = LoopbackPair::new(ProtocolSettings::default());
        pair.responder_mut()
            .transport_mut()
            .reject_service_registration("no adapter");
        pair.start(Instant::now()).expect("start");
        let exit = run_until_settled(&mut pair, &fast());

        assert!(exit.is_settled());
        let report = pair.report(exit);
        assert!(!report.completed);
        assert_eq!(
            report.responder.map(|r| r.errors),
            Some(vec!["service registration failed: no adapter".to_string()])
        );
    }
}
