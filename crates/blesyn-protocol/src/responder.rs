use std::time::Instant;

use blesyn_core::{CharacteristicId, Message, PeerId, RequestId, ServiceId};
use blesyn_transport::{ResponderEvent, ResponderTransport, TransportOp};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ProtocolSettings;
use crate::error::ProtocolError;
use crate::observer::SessionObserver;
use crate::session::{Phase, ResponderPhase, Session, SessionPhase};

/// Service registration and broadcast state of the responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AdvertisingState {
    Stopped,
    /// `advertise` was issued; waiting for the stack to confirm the service.
    Registering,
    Advertising,
    Failed,
}

#[derive(Debug, Clone)]
struct ResponderState {
    session: Session<ResponderPhase>,
    /// Set once the initiator has written SYN+ACK.
    data_requested: bool,
    /// Set once the initiator's final message arrived; the next read gets
    /// Final ACK.
    final_ack_pending: bool,
}

impl ResponderState {
    fn fresh(settings: &ProtocolSettings) -> Self {
        Self {
            session: Session::new(settings.service, settings.characteristic),
            data_requested: false,
            final_ack_pending: false,
        }
    }
}

/// Peripheral side of the handshake.
///
/// Answers reads with ACK, then the outbound text, then Final ACK, and
/// treats any write other than SYN+ACK as the initiator's closing message.
pub struct ResponderProtocol<T: ResponderTransport, O: SessionObserver = ()> {
    transport: T,
    observer: O,
    settings: ProtocolSettings,
    advertising: AdvertisingState,
    state: ResponderState,
    characteristic_value: Option<Vec<u8>>,
}

impl<T: ResponderTransport, O: SessionObserver> ResponderProtocol<T, O> {
    pub fn new(transport: T, observer: O, settings: ProtocolSettings) -> Self {
        let state = ResponderState::fresh(&settings);
        Self {
            transport,
            observer,
            settings,
            advertising: AdvertisingState::Stopped,
            state,
            characteristic_value: None,
        }
    }

    pub fn phase(&self) -> ResponderPhase {
        self.state.session.phase()
    }

    pub fn session(&self) -> &Session<ResponderPhase> {
        &self.state.session
    }

    pub fn advertising_state(&self) -> AdvertisingState {
        self.advertising
    }

    pub fn settings(&self) -> &ProtocolSettings {
        &self.settings
    }

    /// Last value written to the characteristic by the initiator.
    pub fn characteristic_value(&self) -> Option<&[u8]> {
        self.characteristic_value.as_deref()
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

    /// Sets the data served after the handshake. Empty text means the default.
    pub fn set_outbound_text(&mut self, text: &str) {
        self.settings.outbound_text = Message::outbound(text);
    }

    pub fn start_advertising(&mut self) -> Result<(), ProtocolError> {
        if matches!(
            self.advertising,
            AdvertisingState::Registering | AdvertisingState::Advertising
        ) {
            return Ok(());
        }

        self.observer.on_status("Sending...");
        self.reset_session();

        let service = self.settings.service;
        let characteristic = self.settings.characteristic;
        let local_name = self.settings.local_name.clone();
        if let Err(err) = self.transport.advertise(&service, &characteristic, &local_name) {
            self.advertising = AdvertisingState::Failed;
            let error = ProtocolError::ServiceRegistration(err.to_string());
            self.report(&error);
            return Err(error);
        }

        info!(
            "responder: advertising {} / {} as {:?}",
            service, characteristic, local_name
        );
        self.advertising = AdvertisingState::Registering;
        self.observer.on_status("Sent SYN...");
        Ok(())
    }

    pub fn stop_advertising(&mut self) -> Result<(), ProtocolError> {
        if matches!(
            self.advertising,
            AdvertisingState::Stopped | AdvertisingState::Failed
        ) {
            return Ok(());
        }

        self.observer.on_status("Sending Off:");
        if let Err(err) = self.transport.stop_advertising() {
            let error = ProtocolError::transport(TransportOp::StopAdvertising, err);
            self.report(&error);
            return Err(error);
        }
        info!("responder: stopped advertising");
        self.advertising = AdvertisingState::Stopped;
        Ok(())
    }

    /// Single on/off control: starts when stopped or failed, stops otherwise.
    pub fn toggle_advertising(&mut self) -> Result<(), ProtocolError> {
        match self.advertising {
            AdvertisingState::Stopped | AdvertisingState::Failed => self.start_advertising(),
            AdvertisingState::Registering | AdvertisingState::Advertising => {
                self.stop_advertising()
            }
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

    pub fn handle_event(&mut self, event: ResponderEvent, now: Instant) {
        match event {
            ResponderEvent::ServiceAdded { service, result } => {
                self.on_service_added(service, result)
            }
            ResponderEvent::ReadRequest {
                request,
                characteristic,
            } => self.on_read_request(request, characteristic, now),
            ResponderEvent::WriteRequest {
                request,
                characteristic,
                value,
            } => self.on_write_request(request, characteristic, value, now),
            ResponderEvent::CentralDisconnected { peer } => self.on_central_disconnected(peer),
        }
    }

    /// Resets a session that sat too long in one phase. Returns `true` when
    /// a timeout fired.
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        let Some(limit) = self.settings.phase_timeout else {
            return false;
        };
        let Some(elapsed) = self.state.session.stalled_for(now, limit) else {
            return false;
        };
        let error = ProtocolError::PhaseTimeout {
            phase: self.phase().into_phase(),
            elapsed,
        };
        self.report(&error);
        self.reset_session();
        true
    }

    fn on_service_added(&mut self, service: ServiceId, result: Result<(), String>) {
        if service != self.settings.service {
            debug!(
                "responder: ignoring registration of foreign service {}",
                service
            );
            return;
        }
        if self.advertising != AdvertisingState::Registering {
            debug!(
                "responder: late registration result for {} ignored",
                service
            );
            return;
        }
        match result {
            Ok(()) => {
                info!("responder: service {} registered", service);
                self.advertising = AdvertisingState::Advertising;
            }
            Err(reason) => {
                self.advertising = AdvertisingState::Failed;
                self.report(&ProtocolError::ServiceRegistration(reason));
            }
        }
    }

    fn on_read_request(
        &mut self,
        request: RequestId,
        characteristic: CharacteristicId,
        now: Instant,
    ) {
        if characteristic != self.settings.characteristic {
            debug!(
                "responder: {} targets foreign characteristic {}",
                request, characteristic
            );
            if let Err(err) = self.transport.respond_to_read(request, &[]) {
                self.report(&ProtocolError::transport(TransportOp::RespondToRead, err));
            }
            return;
        }

        let phase = self.phase();
        let (reply, next) = match phase {
            ResponderPhase::Closed => (Message::FinalAck, None),
            _ if self.state.final_ack_pending => (Message::FinalAck, Some(ResponderPhase::Closed)),
            ResponderPhase::Idle => (Message::Ack, Some(ResponderPhase::AwaitingSynAck)),
            ResponderPhase::AwaitingSynAck if self.state.data_requested => (
                self.settings.outbound_text.clone(),
                Some(ResponderPhase::ReadyToSendData),
            ),
            ResponderPhase::AwaitingSynAck => (Message::Ack, None),
            ResponderPhase::ReadyToSendData => (self.settings.outbound_text.clone(), None),
            ResponderPhase::AwaitingFinalAckDelivery => {
                (Message::FinalAck, Some(ResponderPhase::Closed))
            }
        };

        let bytes = reply.encode();
        self.state.session.queue_payload(reply);
        if let Err(err) = self.transport.respond_to_read(request, &bytes) {
            self.report(&ProtocolError::transport(TransportOp::RespondToRead, err));
            return;
        }
        if let Some(sent) = self.state.session.retire_payload() {
            debug!(
                "responder: answered {} with {:?} in {}",
                request,
                sent.as_text(),
                phase.into_phase()
            );
        }

        if next == Some(ResponderPhase::Closed) {
            self.state.final_ack_pending = false;
            // A stop failure is reported through the observer; the session
            // still closes.
            let _ = self.stop_advertising();
        }
        if let Some(next) = next {
            self.advance(next, now);
        }
    }

    fn on_write_request(
        &mut self,
        request: RequestId,
        characteristic: CharacteristicId,
        value: Vec<u8>,
        now: Instant,
    ) {
        let on_target = characteristic == self.settings.characteristic;
        let message = Message::decode(&value);
        if on_target {
            self.characteristic_value = Some(value);
        }
        if let Err(err) = self.transport.respond_to_write(request) {
            self.report(&ProtocolError::transport(TransportOp::RespondToWrite, err));
        }
        if !on_target {
            debug!(
                "responder: {} targets foreign characteristic {}",
                request, characteristic
            );
            return;
        }

        debug!(
            "responder: received {:?} in {}",
            message.as_text(),
            self.phase().into_phase()
        );
        match message {
            Message::SynAck => {
                self.state.data_requested = true;
                self.observer.on_status("Received a SYN+ACK. Sending ACK...");
            }
            other => {
                if !self.state.data_requested {
                    let violation = ProtocolError::ProtocolViolation {
                        phase: self.phase().into_phase(),
                        received: other.as_text().to_string(),
                    };
                    self.report(&violation);
                }
                let text = other.as_text().to_string();
                self.state.session.record_received(text.clone());
                self.state.final_ack_pending = true;
                self.observer.on_message_delivered(&text);
                self.advance(ResponderPhase::AwaitingFinalAckDelivery, now);
                self.observer.on_status("Server received message");
            }
        }
    }

    fn on_central_disconnected(&mut self, peer: PeerId) {
        let phase = self.phase();
        let mid_handshake = !phase.is_terminal()
            && (phase != ResponderPhase::initial() || self.state.data_requested);
        info!(
            "responder: central {} disconnected in {}",
            peer,
            phase.into_phase()
        );
        if mid_handshake {
            self.report(&ProtocolError::DisconnectDuringHandshake {
                phase: phase.into_phase(),
            });
        }
        self.reset_session();
        self.observer.on_status("Server Disconnected");
    }

    fn advance(&mut self, next: ResponderPhase, now: Instant) {
        if self.state.session.advance(next, now) {
            self.observer.on_phase_changed(Phase::Responder(next));
        }
    }

    fn reset_session(&mut self) {
        let previous = self.phase();
        self.state = ResponderState::fresh(&self.settings);
        if previous != ResponderPhase::initial() {
            self.observer
                .on_phase_changed(Phase::Responder(ResponderPhase::initial()));
        }
    }

    fn report(&mut self, error: &ProtocolError) {
        warn!("responder: {}", error);
        self.observer.on_error(error);
    }
}
