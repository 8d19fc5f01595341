use std::time::{Duration, Instant};

use blesyn_core::Message;
use blesyn_protocol::{
    AdvertisingState, InitiatorPhase, InitiatorProtocol, Phase, ProtocolError, ProtocolSettings,
    RecordingObserver, ResponderPhase, ResponderProtocol,
};
use blesyn_transport::{
    InMemoryInitiatorTransport, InMemoryResponderTransport, LoopbackLink, TransportOp,
};

type Responder = ResponderProtocol<InMemoryResponderTransport, RecordingObserver>;
type Initiator = InitiatorProtocol<InMemoryInitiatorTransport, RecordingObserver>;

struct Harness {
    link: LoopbackLink,
    responder: Responder,
    initiator: Initiator,
}

impl Harness {
    fn new(settings: ProtocolSettings) -> Self {
        Self {
            link: LoopbackLink::default(),
            responder: ResponderProtocol::new(
                InMemoryResponderTransport::default(),
                RecordingObserver::default(),
                settings.clone(),
            ),
            initiator: InitiatorProtocol::new(
                InMemoryInitiatorTransport::default(),
                RecordingObserver::default(),
                settings,
            ),
        }
    }

    fn start(&mut self, now: Instant) {
        self.responder.start_advertising().expect("advertise");
        self.initiator.start_scanning(now).expect("scan");
    }

    /// One routing pass plus one pump on each side.
    fn round(&mut self, now: Instant) -> usize {
        let responder = self.responder.transport_mut();
        let initiator = self.initiator.transport_mut();
        let moved = self.link.route(responder, initiator);
        moved + self.responder.pump(now) + self.initiator.pump(now)
    }

    fn settle(&mut self, now: Instant) {
        for _ in 0..200 {
            if self.round(now) == 0 {
                return;
            }
        }
        panic!("loopback did not go quiet");
    }

    fn run_until(&mut self, now: Instant, done: impl Fn(&Self) -> bool) {
        for _ in 0..200 {
            if done(self) {
                return;
            }
            self.round(now);
        }
        panic!("condition never reached");
    }

    fn sever(&mut self) {
        let responder = self.responder.transport_mut();
        let initiator = self.initiator.transport_mut();
        self.link.sever(responder, initiator);
    }
}

fn texts(values: &[Vec<u8>]) -> Vec<String> {
    values
        .iter()
        .map(|v| String::from_utf8_lossy(v).into_owned())
        .collect()
}

#[test]
fn full_handshake_reaches_terminal_phases_once() {
    let now = Instant::now();
    let mut h = Harness::new(ProtocolSettings::default());
    h.start(now);
    h.settle(now);

    assert_eq!(h.responder.phase(), ResponderPhase::Closed);
    assert_eq!(h.initiator.phase(), InitiatorPhase::Done);
    assert_eq!(h.responder.advertising_state(), AdvertisingState::Stopped);

    assert_eq!(
        h.responder.observer().phases(),
        vec![
            Phase::Responder(ResponderPhase::AwaitingSynAck),
            Phase::Responder(ResponderPhase::ReadyToSendData),
            Phase::Responder(ResponderPhase::AwaitingFinalAckDelivery),
            Phase::Responder(ResponderPhase::Closed),
        ]
    );
    assert_eq!(
        h.initiator.observer().phases(),
        vec![
            Phase::Initiator(InitiatorPhase::Scanning),
            Phase::Initiator(InitiatorPhase::Connecting),
            Phase::Initiator(InitiatorPhase::DiscoveringService),
            Phase::Initiator(InitiatorPhase::DiscoveringCharacteristic),
            Phase::Initiator(InitiatorPhase::AwaitingAck),
            Phase::Initiator(InitiatorPhase::ReadyToNotify),
            Phase::Initiator(InitiatorPhase::AwaitingData),
            Phase::Initiator(InitiatorPhase::Done),
        ]
    );

    assert_eq!(
        texts(h.link.written_values()),
        vec!["SYN+ACK", "Received Message"]
    );
    assert_eq!(
        texts(h.link.served_values()),
        vec!["ACK", "hello world", "Final ACK"]
    );
    assert_eq!(h.initiator.observer().delivered(), vec!["hello world"]);
    assert_eq!(h.responder.observer().delivered(), vec!["Received Message"]);
    assert!(h.responder.observer().errors().is_empty());
    assert!(h.initiator.observer().errors().is_empty());
    assert_eq!(
        h.initiator.observer().statuses().last(),
        Some(&"Final ACK received")
    );
}

#[test]
fn teardown_after_handshake_is_idempotent() {
    let now = Instant::now();
    let mut h = Harness::new(ProtocolSettings::default());
    h.start(now);
    h.settle(now);

    h.initiator.dismiss().expect("dismiss");
    h.initiator.dismiss().expect("dismiss again");
    h.responder.stop_advertising().expect("stop");
    h.responder.stop_advertising().expect("stop again");
    h.settle(now);

    assert_eq!(h.initiator.phase(), InitiatorPhase::Closed);
    assert!(!h.link.is_connected());
    assert!(!h.initiator.is_subscribed());
    // The finished responder session is cleared for the next central.
    assert_eq!(h.responder.phase(), ResponderPhase::Idle);
    assert!(h.responder.observer().errors().is_empty());
}

#[test]
fn custom_text_that_resembles_a_control_message_is_data() {
    let now = Instant::now();
    let mut h = Harness::new(ProtocolSettings::default());
    h.responder.set_outbound_text("ACKnowledge");
    h.start(now);
    h.settle(now);

    assert_eq!(h.initiator.phase(), InitiatorPhase::Done);
    assert_eq!(h.initiator.last_received_payload(), Some("ACKnowledge"));
    assert_eq!(
        Message::decode(b"ACKnowledge"),
        Message::Data("ACKnowledge".into())
    );
}

#[test]
fn disconnect_mid_handshake_then_reconnect() {
    let now = Instant::now();
    let mut h = Harness::new(ProtocolSettings::default());
    h.start(now);
    h.run_until(now, |h| {
        h.initiator.phase() == InitiatorPhase::ReadyToNotify
    });
    assert_eq!(h.responder.phase(), ResponderPhase::AwaitingSynAck);

    h.sever();
    h.settle(now);

    assert_eq!(h.initiator.phase(), InitiatorPhase::Closed);
    assert_eq!(h.initiator.session().pending_payload(), None);
    assert_eq!(h.responder.phase(), ResponderPhase::Idle);
    assert_eq!(
        h.responder.advertising_state(),
        AdvertisingState::Advertising
    );
    assert!(matches!(
        h.responder.observer().errors().as_slice(),
        [ProtocolError::DisconnectDuringHandshake {
            phase: Phase::Responder(ResponderPhase::AwaitingSynAck)
        }]
    ));
    assert!(matches!(
        h.initiator.observer().errors().as_slice(),
        [ProtocolError::DisconnectDuringHandshake {
            phase: Phase::Initiator(InitiatorPhase::ReadyToNotify)
        }]
    ));

    h.initiator.start_scanning(now).expect("rescan");
    h.settle(now);

    assert_eq!(h.initiator.phase(), InitiatorPhase::Done);
    assert_eq!(h.responder.phase(), ResponderPhase::Closed);
    assert_eq!(h.initiator.observer().delivered(), vec!["hello world"]);
    assert_eq!(h.responder.observer().errors().len(), 1);
}

#[test]
fn registration_failure_keeps_responder_invisible() {
    let now = Instant::now();
    let mut h = Harness::new(ProtocolSettings::default());
    h.responder
        .transport_mut()
        .reject_service_registration("adapter powered off");
    h.start(now);
    h.settle(now);

    assert_eq!(h.responder.advertising_state(), AdvertisingState::Failed);
    assert_eq!(h.initiator.phase(), InitiatorPhase::Scanning);
    assert_eq!(
        h.responder.observer().errors(),
        vec![&ProtocolError::ServiceRegistration(
            "adapter powered off".into()
        )]
    );
}

#[test]
fn transport_failure_stalls_until_timeout_fails_closed() {
    let start = Instant::now();
    let settings = ProtocolSettings {
        phase_timeout: Some(Duration::from_secs(5)),
        ..ProtocolSettings::default()
    };
    let mut h = Harness::new(settings);
    h.initiator.transport_mut().fail_next(TransportOp::ReadValue);
    h.start(start);
    h.settle(start);

    assert_eq!(h.initiator.phase(), InitiatorPhase::AwaitingAck);
    assert!(matches!(
        h.initiator.observer().errors().as_slice(),
        [ProtocolError::Transport {
            op: TransportOp::ReadValue,
            ..
        }]
    ));

    let later = start + Duration::from_secs(6);
    assert!(h.initiator.check_timeout(later));
    h.settle(later);

    assert_eq!(h.initiator.phase(), InitiatorPhase::Closed);
    assert!(!h.link.is_connected());
    assert_eq!(h.responder.phase(), ResponderPhase::Idle);
    assert_eq!(
        h.responder.advertising_state(),
        AdvertisingState::Advertising
    );
}
