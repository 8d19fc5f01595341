use std::time::Instant;

use blesyn_core::{CharacteristicId, Message, PeerId, ServiceId};
use blesyn_transport::{InitiatorEvent, InitiatorTransport, TransportOp, ValueSource};
use tracing::{debug, info, warn};

use crate::config::ProtocolSettings;
use crate::error::ProtocolError;
use crate::observer::SessionObserver;
use crate::session::{InitiatorPhase, Phase, Session, SessionPhase};

/// Central side of the handshake.
///
/// Each transport call is issued from the completion of the previous one:
/// SYN+ACK write, first read (ACK), notify subscription, second read (data),
/// then the "Received Message" write and a last read that collects Final ACK.
/// Dropping the protocol tears the connection down.
pub struct InitiatorProtocol<T: InitiatorTransport, O: SessionObserver = ()> {
    transport: T,
    observer: O,
    settings: ProtocolSettings,
    session: Session<InitiatorPhase>,
    peer: Option<PeerId>,
    scanning: bool,
    subscribed: bool,
    acknowledged: bool,
    /// Set once `Done` expects nothing further from the responder.
    confirmed: bool,
}

impl<T: InitiatorTransport, O: SessionObserver> InitiatorProtocol<T, O> {
    pub fn new(transport: T, observer: O, settings: ProtocolSettings) -> Self {
        let session = Session::new(settings.service, settings.characteristic);
        Self {
            transport,
            observer,
            settings,
            session,
            peer: None,
            scanning: false,
            subscribed: false,
            acknowledged: false,
            confirmed: false,
        }
    }

    pub fn phase(&self) -> InitiatorPhase {
        self.session.phase()
    }

    pub fn session(&self) -> &Session<InitiatorPhase> {
        &self.session
    }

    /// Peer this session connected to, until teardown.
    pub fn peer(&self) -> Option<&PeerId> {
        self.peer.as_ref()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    /// True once the session closed, or finished and either collected the
    /// final ACK or can no longer expect it.
    pub fn is_finished(&self) -> bool {
        match self.phase() {
            InitiatorPhase::Closed => true,
            InitiatorPhase::Done => self.confirmed || self.peer.is_none(),
            _ => false,
        }
    }

    pub fn last_received_payload(&self) -> Option<&str> {
        self.session.last_received_payload()
    }

    pub fn settings(&self) -> &ProtocolSettings {
        &self.settings
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    /// Starts scanning for the configured service. A no-op while a session
    /// is in progress; a finished session is torn down and replaced.
    pub fn start_scanning(&mut self, now: Instant) -> Result<(), ProtocolError> {
        let phase = self.phase();
        if phase.is_terminal() {
            // Teardown errors are reported through the observer.
            let _ = self.dismiss();
            self.session.reset();
            self.acknowledged = false;
            self.confirmed = false;
            self.observer
                .on_phase_changed(Phase::Initiator(InitiatorPhase::initial()));
        } else if phase != InitiatorPhase::initial() {
            return Ok(());
        }

        let service = self.settings.service;
        if let Err(err) = self.transport.scan(&service, false) {
            let error = ProtocolError::transport(TransportOp::Scan, err);
            self.report(&error);
            return Err(error);
        }
        info!("initiator: scanning for {}", service);
        self.scanning = true;
        self.advance(InitiatorPhase::Scanning, now);
        Ok(())
    }

    /// Releases the subscription, the scan and the connection. Safe in any
    /// phase and idempotent. Returns the first transport error hit.
    pub fn dismiss(&mut self) -> Result<(), ProtocolError> {
        let mut first_error = None;

        if self.subscribed {
            self.subscribed = false;
            if let Some(peer) = self.peer.clone() {
                let characteristic = self.settings.characteristic;
                if let Err(err) = self.transport.set_notify(&peer, &characteristic, false) {
                    first_error
                        .get_or_insert(ProtocolError::transport(TransportOp::SetNotify, err));
                }
            }
        }
        if self.scanning {
            self.scanning = false;
            if let Err(err) = self.transport.stop_scan() {
                first_error.get_or_insert(ProtocolError::transport(TransportOp::StopScan, err));
            }
        }
        if let Some(peer) = self.peer.take() {
            info!("initiator: disconnecting from {}", peer);
            if let Err(err) = self.transport.cancel_connection(&peer) {
                first_error.get_or_insert(ProtocolError::transport(
                    TransportOp::CancelConnection,
                    err,
                ));
            }
        }
        self.session.retire_payload();
        if self.phase() != InitiatorPhase::Closed && self.phase() != InitiatorPhase::initial() {
            self.advance(InitiatorPhase::Closed, Instant::now());
        }

        match first_error {
            Some(error) => {
                self.report(&error);
                Err(error)
            }
            None => Ok(()),
        }
    }

    /// Drains the transport's event queue. Returns the number of events handled.
    pub fn pump(&mut self, now: Instant) -> usize {
        let mut handled = 0;
        while let Some(event) = self.transport.poll_event() {
            self.handle_event(event, now);
            handled += 1;
        }
        handled
    }

    pub fn handle_event(&mut self, event: InitiatorEvent, now: Instant) {
        match event {
            InitiatorEvent::DiscoveredPeer { peer } => self.on_discovered(peer, now),
            InitiatorEvent::Connected { peer } => self.on_connected(peer, now),
            InitiatorEvent::ConnectFailed { peer, reason } => {
                if self.is_current(&peer) {
                    self.report(&ProtocolError::transport(TransportOp::Connect, reason));
                }
            }
            InitiatorEvent::ServicesDiscovered { peer, result } => {
                self.on_services_discovered(peer, result, now)
            }
            InitiatorEvent::CharacteristicsDiscovered {
                peer,
                service,
                result,
            } => self.on_characteristics_discovered(peer, service, result, now),
            InitiatorEvent::WriteCompleted {
                peer,
                characteristic,
                result,
            } => self.on_write_completed(peer, characteristic, result),
            InitiatorEvent::ValueUpdated {
                peer,
                characteristic,
                value,
                source,
            } => self.on_value_updated(peer, characteristic, value, source, now),
            InitiatorEvent::NotifyStateChanged {
                peer,
                characteristic,
                enabled,
                result,
            } => self.on_notify_state_changed(peer, characteristic, enabled, result, now),
            InitiatorEvent::Disconnected { peer } => self.on_disconnected(peer, now),
        }
    }

    /// Tears down a session that sat too long in one phase. Returns `true`
    /// when a timeout fired.
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        let Some(limit) = self.settings.phase_timeout else {
            return false;
        };
        let Some(elapsed) = self.session.stalled_for(now, limit) else {
            return false;
        };
        let error = ProtocolError::PhaseTimeout {
            phase: self.phase().into_phase(),
            elapsed,
        };
        self.report(&error);
        let _ = self.dismiss();
        true
    }

    fn on_discovered(&mut self, peer: PeerId, now: Instant) {
        if self.phase() != InitiatorPhase::Scanning || self.peer.is_some() {
            debug!("initiator: ignoring sighting of {}", peer);
            return;
        }
        if let Err(err) = self.transport.connect(&peer) {
            self.report(&ProtocolError::transport(TransportOp::Connect, err));
            return;
        }
        info!("initiator: connecting to {}", peer);
        self.peer = Some(peer);
        self.advance(InitiatorPhase::Connecting, now);
    }

    fn on_connected(&mut self, peer: PeerId, now: Instant) {
        if !self.is_current(&peer) || self.phase() != InitiatorPhase::Connecting {
            debug!("initiator: unexpected connection to {}", peer);
            return;
        }
        if self.scanning {
            self.scanning = false;
            if let Err(err) = self.transport.stop_scan() {
                self.report(&ProtocolError::transport(TransportOp::StopScan, err));
            }
        }
        let service = self.settings.service;
        if let Err(err) = self.transport.discover_service(&peer, &service) {
            self.report(&ProtocolError::transport(TransportOp::DiscoverService, err));
            return;
        }
        self.advance(InitiatorPhase::DiscoveringService, now);
    }

    fn on_services_discovered(
        &mut self,
        peer: PeerId,
        result: Result<Vec<ServiceId>, String>,
        now: Instant,
    ) {
        if !self.is_current(&peer) || self.phase() != InitiatorPhase::DiscoveringService {
            return;
        }
        let services = match result {
            Ok(services) => services,
            Err(reason) => {
                self.report(&ProtocolError::transport(
                    TransportOp::DiscoverService,
                    reason,
                ));
                return;
            }
        };
        let service = self.settings.service;
        if !services.contains(&service) {
            self.report(&ProtocolError::transport(
                TransportOp::DiscoverService,
                format!("{peer} does not offer {service}"),
            ));
            return;
        }

        self.observer
            .on_status("SYN Discovered preparing to send SYN+ACK");
        let characteristic = self.settings.characteristic;
        if let Err(err) = self
            .transport
            .discover_characteristic(&peer, &service, &characteristic)
        {
            self.report(&ProtocolError::transport(
                TransportOp::DiscoverCharacteristic,
                err,
            ));
            return;
        }
        self.advance(InitiatorPhase::DiscoveringCharacteristic, now);
    }

    fn on_characteristics_discovered(
        &mut self,
        peer: PeerId,
        service: ServiceId,
        result: Result<Vec<CharacteristicId>, String>,
        now: Instant,
    ) {
        if !self.is_current(&peer)
            || service != self.settings.service
            || self.phase() != InitiatorPhase::DiscoveringCharacteristic
        {
            return;
        }
        let characteristics = match result {
            Ok(characteristics) => characteristics,
            Err(reason) => {
                self.report(&ProtocolError::transport(
                    TransportOp::DiscoverCharacteristic,
                    reason,
                ));
                return;
            }
        };
        let characteristic = self.settings.characteristic;
        if !characteristics.contains(&characteristic) {
            self.report(&ProtocolError::transport(
                TransportOp::DiscoverCharacteristic,
                format!("{service} has no characteristic {characteristic}"),
            ));
            return;
        }

        if self.write(&peer, Message::SynAck) {
            self.advance(InitiatorPhase::AwaitingAck, now);
        }
    }

    fn on_write_completed(
        &mut self,
        peer: PeerId,
        characteristic: CharacteristicId,
        result: Result<(), String>,
    ) {
        if !self.is_current(&peer) || characteristic != self.settings.characteristic {
            return;
        }
        if let Err(reason) = result {
            self.report(&ProtocolError::transport(TransportOp::WriteValue, reason));
            return;
        }

        match self.session.retire_payload() {
            Some(Message::SynAck) => {
                self.observer.on_status("SYN+ACK Sent...");
                self.read(&peer);
            }
            Some(message) if message == Message::received_ack() => {
                debug!("initiator: acknowledgment delivered, collecting final ACK");
                self.read(&peer);
            }
            other => debug!("initiator: write completion for {:?}", other),
        }
    }

    fn on_value_updated(
        &mut self,
        peer: PeerId,
        characteristic: CharacteristicId,
        value: Result<Vec<u8>, String>,
        source: ValueSource,
        now: Instant,
    ) {
        if !self.is_current(&peer) || characteristic != self.settings.characteristic {
            return;
        }
        let bytes = match value {
            Ok(bytes) => bytes,
            Err(reason) => {
                self.report(&ProtocolError::transport(TransportOp::ReadValue, reason));
                return;
            }
        };

        let phase = self.phase();
        if phase.ordinal() < InitiatorPhase::AwaitingAck.ordinal()
            || phase == InitiatorPhase::Closed
        {
            debug!("initiator: value in {} ignored", phase.into_phase());
            return;
        }

        let message = Message::decode(&bytes);
        debug!(
            "initiator: {:?} via {:?} in {}",
            message.as_text(),
            source,
            phase.into_phase()
        );
        match message {
            Message::Ack => {
                if phase != InitiatorPhase::AwaitingAck {
                    return;
                }
                self.observer.on_status("ACK received, ready to receive data");
                self.advance(InitiatorPhase::ReadyToNotify, now);
                let characteristic = self.settings.characteristic;
                if let Err(err) = self.transport.set_notify(&peer, &characteristic, true) {
                    self.report(&ProtocolError::transport(TransportOp::SetNotify, err));
                }
            }
            Message::FinalAck if phase == InitiatorPhase::Done => {
                info!("initiator: final ACK received from {}", peer);
                self.confirmed = true;
                self.observer.on_status("Final ACK received");
            }
            other => {
                let text = other.as_text().to_string();
                self.session.record_received(text.clone());
                if phase == InitiatorPhase::Done || self.acknowledged {
                    debug!("initiator: already acknowledged, not repeating");
                    return;
                }
                if phase == InitiatorPhase::AwaitingAck {
                    self.report(&ProtocolError::ProtocolViolation {
                        phase: phase.into_phase(),
                        received: text.clone(),
                    });
                }
                self.observer.on_message_delivered(&text);
                self.acknowledged = self.write(&peer, Message::received_ack());
                self.confirmed = !self.acknowledged;
                self.advance(InitiatorPhase::Done, now);
            }
        }
    }

    fn on_notify_state_changed(
        &mut self,
        peer: PeerId,
        characteristic: CharacteristicId,
        enabled: bool,
        result: Result<(), String>,
        now: Instant,
    ) {
        if !self.is_current(&peer) || characteristic != self.settings.characteristic {
            return;
        }
        if let Err(reason) = result {
            self.report(&ProtocolError::transport(TransportOp::SetNotify, reason));
            return;
        }
        self.subscribed = enabled;
        if enabled && self.phase() == InitiatorPhase::ReadyToNotify {
            self.advance(InitiatorPhase::AwaitingData, now);
            self.read(&peer);
        }
    }

    fn on_disconnected(&mut self, peer: PeerId, now: Instant) {
        if !self.is_current(&peer) {
            return;
        }
        let phase = self.phase();
        info!("initiator: {} disconnected in {}", peer, phase.into_phase());
        if !phase.is_terminal() {
            self.report(&ProtocolError::DisconnectDuringHandshake {
                phase: phase.into_phase(),
            });
        }
        self.peer = None;
        self.subscribed = false;
        self.session.retire_payload();
        self.advance(InitiatorPhase::Closed, now);
    }

    /// Queues `message` and writes it with response. Returns `false` when
    /// the call was rejected; the payload then stays pending.
    fn write(&mut self, peer: &PeerId, message: Message) -> bool {
        let characteristic = self.settings.characteristic;
        let bytes = message.encode();
        self.session.queue_payload(message);
        if let Err(err) = self
            .transport
            .write_value(peer, &characteristic, &bytes, true)
        {
            self.report(&ProtocolError::transport(TransportOp::WriteValue, err));
            return false;
        }
        true
    }

    fn read(&mut self, peer: &PeerId) {
        let characteristic = self.settings.characteristic;
        if let Err(err) = self.transport.read_value(peer, &characteristic) {
            self.report(&ProtocolError::transport(TransportOp::ReadValue, err));
        }
    }

    fn is_current(&self, peer: &PeerId) -> bool {
        self.peer.as_ref() == Some(peer)
    }

    fn advance(&mut self, next: InitiatorPhase, now: Instant) {
        if self.session.advance(next, now) {
            self.observer.on_phase_changed(Phase::Initiator(next));
        }
    }

    fn report(&mut self, error: &ProtocolError) {
        warn!("initiator: {}", error);
        // A failure after Done means the final ACK is not coming.
        if self.phase() == InitiatorPhase::Done {
            self.confirmed = true;
        }
        self.observer.on_error(error);
    }
}

impl<T: InitiatorTransport, O: SessionObserver> Drop for InitiatorProtocol<T, O> {
    fn drop(&mut self) {
        let _ = self.dismiss();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::RecordingObserver;
    use blesyn_transport::{InMemoryInitiatorTransport, InitiatorCall};
    use std::time::Duration;

    type Initiator = InitiatorProtocol<InMemoryInitiatorTransport, RecordingObserver>;

    fn peer() -> PeerId {
        PeerId::new("responder")
    }

    fn initiator() -> Initiator {
        InitiatorProtocol::new(
            InMemoryInitiatorTransport::default(),
            RecordingObserver::default(),
            ProtocolSettings::default(),
        )
    }

    fn value(text: &str) -> InitiatorEvent {
        InitiatorEvent::ValueUpdated {
            peer: peer(),
            characteristic: CharacteristicId::default(),
            value: Ok(text.as_bytes().to_vec()),
            source: ValueSource::Read,
        }
    }

    fn write_completed() -> InitiatorEvent {
        InitiatorEvent::WriteCompleted {
            peer: peer(),
            characteristic: CharacteristicId::default(),
            result: Ok(()),
        }
    }

    /// Drives a fresh initiator up to `AwaitingAck`.
    fn connected(now: Instant) -> Initiator {
        let mut i = initiator();
        i.start_scanning(now).expect("scan");
        i.handle_event(InitiatorEvent::DiscoveredPeer { peer: peer() }, now);
        i.handle_event(InitiatorEvent::Connected { peer: peer() }, now);
        i.handle_event(
            InitiatorEvent::ServicesDiscovered {
                peer: peer(),
                result: Ok(vec![ServiceId::default()]),
            },
            now,
        );
        i.handle_event(
            InitiatorEvent::CharacteristicsDiscovered {
                peer: peer(),
                service: ServiceId::default(),
                result: Ok(vec![CharacteristicId::default()]),
            },
            now,
        );
        i
    }

    fn writes(calls: &[InitiatorCall]) -> Vec<String> {
        calls
            .iter()
            .filter_map(|call| match call {
                InitiatorCall::WriteValue { bytes, .. } => {
                    Some(String::from_utf8_lossy(bytes).into_owned())
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn discovery_sequence_issues_calls_in_order() {
        let now = Instant::now();
        let mut i = connected(now);
        assert_eq!(i.phase(), InitiatorPhase::AwaitingAck);
        assert_eq!(i.session().pending_payload(), Some(&Message::SynAck));

        let calls = i.transport_mut().take_calls();
        assert_eq!(
            calls,
            vec![
                InitiatorCall::Scan {
                    service: ServiceId::default(),
                    allow_duplicates: false,
                },
                InitiatorCall::Connect { peer: peer() },
                InitiatorCall::StopScan,
                InitiatorCall::DiscoverService {
                    peer: peer(),
                    service: ServiceId::default(),
                },
                InitiatorCall::DiscoverCharacteristic {
                    peer: peer(),
                    service: ServiceId::default(),
                    characteristic: CharacteristicId::default(),
                },
                InitiatorCall::WriteValue {
                    peer: peer(),
                    characteristic: CharacteristicId::default(),
                    bytes: b"SYN+ACK".to_vec(),
                    with_response: true,
                },
            ]
        );
        assert_eq!(
            i.observer().statuses(),
            vec!["SYN Discovered preparing to send SYN+ACK"]
        );
    }

    #[test]
    fn repeated_scan_and_sightings_are_ignored() {
        let now = Instant::now();
        let mut i = initiator();
        i.start_scanning(now).expect("scan");
        i.start_scanning(now).expect("second scan is a no-op");
        i.handle_event(InitiatorEvent::DiscoveredPeer { peer: peer() }, now);
        i.handle_event(
            InitiatorEvent::DiscoveredPeer {
                peer: PeerId::new("other"),
            },
            now,
        );
        let calls = i.transport_mut().take_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(i.peer(), Some(&peer()));
    }

    #[test]
    fn literal_trace_acknowledges_data_once() {
        let now = Instant::now();
        let mut i = connected(now);
        i.transport_mut().take_calls();

        i.handle_event(write_completed(), now);
        assert_eq!(i.session().pending_payload(), None);
        i.handle_event(value("ACK"), now);
        assert_eq!(i.phase(), InitiatorPhase::ReadyToNotify);
        i.handle_event(
            InitiatorEvent::NotifyStateChanged {
                peer: peer(),
                characteristic: CharacteristicId::default(),
                enabled: true,
                result: Ok(()),
            },
            now,
        );
        assert_eq!(i.phase(), InitiatorPhase::AwaitingData);
        i.handle_event(value("hello world"), now);
        i.handle_event(
            InitiatorEvent::ValueUpdated {
                peer: peer(),
                characteristic: CharacteristicId::default(),
                value: Ok(b"hello again".to_vec()),
                source: ValueSource::Notification,
            },
            now,
        );

        assert_eq!(i.phase(), InitiatorPhase::Done);
        assert_eq!(i.last_received_payload(), Some("hello again"));
        assert_eq!(i.observer().delivered(), vec!["hello world"]);

        let calls = i.transport_mut().take_calls();
        assert_eq!(writes(&calls), vec!["Received Message"]);
        let reads = calls
            .iter()
            .filter(|c| matches!(c, InitiatorCall::ReadValue { .. }))
            .count();
        assert_eq!(reads, 2);
        assert!(calls.contains(&InitiatorCall::SetNotify {
            peer: peer(),
            characteristic: CharacteristicId::default(),
            enabled: true,
        }));
        assert_eq!(
            i.observer().statuses(),
            vec![
                "SYN Discovered preparing to send SYN+ACK",
                "SYN+ACK Sent...",
                "ACK received, ready to receive data",
            ]
        );
    }

    #[test]
    fn acknowledgment_completion_collects_final_ack() {
        let now = Instant::now();
        let mut i = connected(now);
        i.handle_event(write_completed(), now);
        i.handle_event(value("ACK"), now);
        i.handle_event(value("payload"), now);
        i.transport_mut().take_calls();
        assert!(!i.is_finished());

        i.handle_event(write_completed(), now);
        assert!(matches!(
            i.transport_mut().take_calls().as_slice(),
            [InitiatorCall::ReadValue { .. }]
        ));
        i.handle_event(value("Final ACK"), now);
        assert_eq!(i.last_received_payload(), Some("payload"));
        assert_eq!(i.observer().statuses().last(), Some(&"Final ACK received"));
        assert!(i.is_finished());
    }

    #[test]
    fn failed_confirming_read_still_finishes() {
        let now = Instant::now();
        let mut i = connected(now);
        i.handle_event(write_completed(), now);
        i.handle_event(value("ACK"), now);
        i.handle_event(value("payload"), now);
        i.transport_mut().fail_next(TransportOp::ReadValue);

        i.handle_event(write_completed(), now);
        assert_eq!(i.phase(), InitiatorPhase::Done);
        assert!(i.is_finished());
    }

    #[test]
    fn data_before_ack_is_a_tolerated_violation() {
        let now = Instant::now();
        let mut i = connected(now);
        i.handle_event(value("early"), now);
        assert_eq!(i.phase(), InitiatorPhase::Done);
        assert!(matches!(
            i.observer().errors().as_slice(),
            [ProtocolError::ProtocolViolation { .. }]
        ));
    }

    #[test]
    fn connect_failure_keeps_phase() {
        let now = Instant::now();
        let mut i = initiator();
        i.start_scanning(now).expect("scan");
        i.handle_event(InitiatorEvent::DiscoveredPeer { peer: peer() }, now);
        i.handle_event(
            InitiatorEvent::ConnectFailed {
                peer: peer(),
                reason: "le connection timeout".into(),
            },
            now,
        );

        assert_eq!(i.phase(), InitiatorPhase::Connecting);
        assert_eq!(i.peer(), Some(&peer()));
        assert_eq!(
            i.observer().errors(),
            vec![&ProtocolError::Transport {
                op: TransportOp::Connect,
                reason: "le connection timeout".into(),
            }]
        );
    }

    #[test]
    fn missing_service_is_reported() {
        let now = Instant::now();
        let mut i = initiator();
        i.start_scanning(now).expect("scan");
        i.handle_event(InitiatorEvent::DiscoveredPeer { peer: peer() }, now);
        i.handle_event(InitiatorEvent::Connected { peer: peer() }, now);
        i.transport_mut().take_calls();
        i.handle_event(
            InitiatorEvent::ServicesDiscovered {
                peer: peer(),
                result: Ok(vec![ServiceId::from_short(0x180f)]),
            },
            now,
        );

        assert_eq!(i.phase(), InitiatorPhase::DiscoveringService);
        assert!(i.transport_mut().take_calls().is_empty());
        assert!(i.observer().statuses().is_empty());
        assert!(matches!(
            i.observer().errors().as_slice(),
            [ProtocolError::Transport {
                op: TransportOp::DiscoverService,
                ..
            }]
        ));
    }

    #[test]
    fn failed_subscription_stays_ready_to_notify() {
        let now = Instant::now();
        let mut i = connected(now);
        i.handle_event(write_completed(), now);
        i.handle_event(value("ACK"), now);
        i.transport_mut().take_calls();
        i.handle_event(
            InitiatorEvent::NotifyStateChanged {
                peer: peer(),
                characteristic: CharacteristicId::default(),
                enabled: true,
                result: Err("cccd write rejected".into()),
            },
            now,
        );

        assert_eq!(i.phase(), InitiatorPhase::ReadyToNotify);
        assert!(!i.is_subscribed());
        assert!(i.transport_mut().take_calls().is_empty());
        assert_eq!(
            i.observer().errors(),
            vec![&ProtocolError::Transport {
                op: TransportOp::SetNotify,
                reason: "cccd write rejected".into(),
            }]
        );
    }

    #[test]
    fn failed_write_keeps_payload_pending() {
        let now = Instant::now();
        let mut i = connected(now);
        i.handle_event(
            InitiatorEvent::WriteCompleted {
                peer: peer(),
                characteristic: CharacteristicId::default(),
                result: Err("gatt 0x03".into()),
            },
            now,
        );
        assert_eq!(i.phase(), InitiatorPhase::AwaitingAck);
        assert_eq!(i.session().pending_payload(), Some(&Message::SynAck));
        assert_eq!(
            i.observer().errors(),
            vec![&ProtocolError::Transport {
                op: TransportOp::WriteValue,
                reason: "gatt 0x03".into(),
            }]
        );
    }

    #[test]
    fn disconnect_releases_payload_and_closes() {
        let now = Instant::now();
        let mut i = connected(now);
        i.handle_event(InitiatorEvent::Disconnected { peer: peer() }, now);

        assert_eq!(i.phase(), InitiatorPhase::Closed);
        assert_eq!(i.session().pending_payload(), None);
        assert_eq!(i.peer(), None);
        assert!(matches!(
            i.observer().errors().as_slice(),
            [ProtocolError::DisconnectDuringHandshake { .. }]
        ));
    }

    #[test]
    fn dismiss_is_idempotent() {
        let now = Instant::now();
        let mut i = connected(now);
        i.handle_event(write_completed(), now);
        i.handle_event(value("ACK"), now);
        i.handle_event(
            InitiatorEvent::NotifyStateChanged {
                peer: peer(),
                characteristic: CharacteristicId::default(),
                enabled: true,
                result: Ok(()),
            },
            now,
        );
        i.transport_mut().take_calls();

        i.dismiss().expect("dismiss");
        i.dismiss().expect("dismiss again");

        let calls = i.transport_mut().take_calls();
        assert_eq!(
            calls,
            vec![
                InitiatorCall::SetNotify {
                    peer: peer(),
                    characteristic: CharacteristicId::default(),
                    enabled: false,
                },
                InitiatorCall::CancelConnection { peer: peer() },
            ]
        );
        assert_eq!(i.phase(), InitiatorPhase::Closed);
    }

    #[test]
    fn dismiss_while_scanning_stops_scan() {
        let now = Instant::now();
        let mut i = initiator();
        i.start_scanning(now).expect("scan");
        i.transport_mut().take_calls();
        i.dismiss().expect("dismiss");
        assert_eq!(
            i.transport_mut().take_calls(),
            vec![InitiatorCall::StopScan]
        );
        assert!(!i.transport().is_scanning());
    }

    #[test]
    fn scan_failure_is_returned() {
        let now = Instant::now();
        let mut i = initiator();
        i.transport_mut().fail_next(TransportOp::Scan);
        let err = i.start_scanning(now).expect_err("scan fails");
        assert_eq!(
            err.to_string(),
            "transport failure during scan: injected failure on scan"
        );
        assert_eq!(i.phase(), InitiatorPhase::Idle);
    }

    #[test]
    fn stalled_phase_tears_down() {
        let start = Instant::now();
        let settings = ProtocolSettings {
            phase_timeout: Some(Duration::from_secs(3)),
            ..ProtocolSettings::default()
        };
        let mut i = InitiatorProtocol::new(
            InMemoryInitiatorTransport::default(),
            RecordingObserver::default(),
            settings,
        );
        i.start_scanning(start).expect("scan");
        i.handle_event(InitiatorEvent::DiscoveredPeer { peer: peer() }, start);
        assert!(!i.check_timeout(start + Duration::from_secs(2)));
        assert!(i.check_timeout(start + Duration::from_secs(4)));
        assert_eq!(i.phase(), InitiatorPhase::Closed);
        assert_eq!(i.peer(), None);
    }

    #[test]
    fn finished_session_can_scan_again() {
        let now = Instant::now();
        let mut i = connected(now);
        i.handle_event(InitiatorEvent::Disconnected { peer: peer() }, now);
        i.transport_mut().take_calls();

        i.start_scanning(now).expect("rescan");
        assert_eq!(i.phase(), InitiatorPhase::Scanning);
        assert_eq!(i.session().transitions(), 1);
    }
}
