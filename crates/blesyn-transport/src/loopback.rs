use std::collections::HashMap;

use blesyn_core::{CharacteristicId, PeerId, RequestId, ServiceId};

use crate::adapter::{InitiatorEvent, ResponderEvent, ValueSource};
use crate::memory::{
    InMemoryInitiatorTransport, InMemoryResponderTransport, InitiatorCall, ResponderCall,
};

/// In-process GATT link between one responder and one initiator transport.
///
/// The link holds only routing state; the transports stay owned by their
/// protocols and are passed in on every [`LoopbackLink::route`] call.
#[derive(Debug, Clone)]
pub struct LoopbackLink {
    responder_peer: PeerId,
    initiator_peer: PeerId,
    scan_filter: Option<ServiceId>,
    discovery_reported: bool,
    connected: bool,
    next_request: u64,
    pending_reads: HashMap<RequestId, CharacteristicId>,
    pending_writes: HashMap<RequestId, CharacteristicId>,
    written_values: Vec<Vec<u8>>,
    served_values: Vec<Vec<u8>>,
}

impl Default for LoopbackLink {
    fn default() -> Self {
        Self::new(
            PeerId::new("loopback-responder"),
            PeerId::new("loopback-initiator"),
        )
    }
}

impl LoopbackLink {
    pub fn new(responder_peer: PeerId, initiator_peer: PeerId) -> Self {
        Self {
            responder_peer,
            initiator_peer,
            scan_filter: None,
            discovery_reported: false,
            connected: false,
            next_request: 1,
            pending_reads: HashMap::new(),
            pending_writes: HashMap::new(),
            written_values: Vec::new(),
            served_values: Vec::new(),
        }
    }

    /// Address the initiator sees for the responder.
    pub fn responder_peer(&self) -> &PeerId {
        &self.responder_peer
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Every value the initiator wrote across the link, in order.
    pub fn written_values(&self) -> &[Vec<u8>] {
        &self.written_values
    }

    /// Every value the responder served to a read, in order.
    pub fn served_values(&self) -> &[Vec<u8>] {
        &self.served_values
    }

    /// Drops the connection from the link side, as a radio loss would.
    pub fn sever(
        &mut self,
        responder: &mut InMemoryResponderTransport,
        initiator: &mut InMemoryInitiatorTransport,
    ) {
        if !self.connected {
            return;
        }
        self.connected = false;
        self.pending_reads.clear();
        self.pending_writes.clear();
        initiator.enqueue_event(InitiatorEvent::Disconnected {
            peer: self.responder_peer.clone(),
        });
        responder.enqueue_event(ResponderEvent::CentralDisconnected {
            peer: self.initiator_peer.clone(),
        });
    }

    /// Moves captured calls from each transport into the other's event
    /// queue. Returns the number of calls routed.
    pub fn route(
        &mut self,
        responder: &mut InMemoryResponderTransport,
        initiator: &mut InMemoryInitiatorTransport,
    ) -> usize {
        let mut moved = 0usize;

        for call in initiator.take_calls() {
            moved += 1;
            self.route_initiator_call(call, responder, initiator);
        }

        for call in responder.take_calls() {
            moved += 1;
            self.route_responder_call(call, initiator);
        }

        if let Some(filter) = self.scan_filter {
            let visible = responder.is_advertising()
                && responder.registered().map(|(s, _)| s) == Some(filter);
            if visible && !self.discovery_reported {
                self.discovery_reported = true;
                initiator.enqueue_event(InitiatorEvent::DiscoveredPeer {
                    peer: self.responder_peer.clone(),
                });
                moved += 1;
            }
        }

        moved
    }

    fn allocate_request(&mut self) -> RequestId {
        let id = RequestId(self.next_request);
        self.next_request += 1;
        id
    }

    fn route_initiator_call(
        &mut self,
        call: InitiatorCall,
        responder: &mut InMemoryResponderTransport,
        initiator: &mut InMemoryInitiatorTransport,
    ) {
        match call {
            // Duplicate suppression lasts for one scan; the loopback only
            // ever reports its single advertiser once per scan either way.
            InitiatorCall::Scan { service, .. } => {
                self.scan_filter = Some(service);
                self.discovery_reported = false;
            }
            InitiatorCall::StopScan => {
                self.scan_filter = None;
            }
            InitiatorCall::Connect { peer } => {
                if peer == self.responder_peer && responder.registered().is_some() {
                    self.connected = true;
                    initiator.enqueue_event(InitiatorEvent::Connected { peer });
                } else {
                    initiator.enqueue_event(InitiatorEvent::ConnectFailed {
                        peer,
                        reason: "peer unavailable".to_string(),
                    });
                }
            }
            InitiatorCall::CancelConnection { .. } => {
                self.sever(responder, initiator);
            }
            InitiatorCall::DiscoverService { peer, .. } => {
                let result = match (self.connected, responder.registered()) {
                    (true, Some((service, _))) => Ok(vec![service]),
                    (true, None) => Ok(Vec::new()),
                    (false, _) => Err("not connected".to_string()),
                };
                initiator.enqueue_event(InitiatorEvent::ServicesDiscovered { peer, result });
            }
            InitiatorCall::DiscoverCharacteristic { peer, service, .. } => {
                let result = match (self.connected, responder.registered()) {
                    (true, Some((registered, characteristic))) if registered == service => {
                        Ok(vec![characteristic])
                    }
                    (true, _) => Ok(Vec::new()),
                    (false, _) => Err("not connected".to_string()),
                };
                initiator.enqueue_event(InitiatorEvent::CharacteristicsDiscovered {
                    peer,
                    service,
                    result,
                });
            }
            InitiatorCall::ReadValue {
                peer,
                characteristic,
            } => {
                if !self.connected {
                    initiator.enqueue_event(InitiatorEvent::ValueUpdated {
                        peer,
                        characteristic,
                        value: Err("not connected".to_string()),
                        source: ValueSource::Read,
                    });
                    return;
                }
                let request = self.allocate_request();
                self.pending_reads.insert(request, characteristic);
                responder.enqueue_event(ResponderEvent::ReadRequest {
                    request,
                    characteristic,
                });
            }
            InitiatorCall::WriteValue {
                peer,
                characteristic,
                bytes,
                with_response,
            } => {
                if !self.connected {
                    if with_response {
                        initiator.enqueue_event(InitiatorEvent::WriteCompleted {
                            peer,
                            characteristic,
                            result: Err("not connected".to_string()),
                        });
                    }
                    return;
                }
                let request = self.allocate_request();
                if with_response {
                    self.pending_writes.insert(request, characteristic);
                }
                self.written_values.push(bytes.clone());
                responder.enqueue_event(ResponderEvent::WriteRequest {
                    request,
                    characteristic,
                    value: bytes,
                });
            }
            InitiatorCall::SetNotify {
                peer,
                characteristic,
                enabled,
            } => {
                let result = if self.connected {
                    Ok(())
                } else {
                    Err("not connected".to_string())
                };
                initiator.enqueue_event(InitiatorEvent::NotifyStateChanged {
                    peer,
                    characteristic,
                    enabled,
                    result,
                });
            }
        }
    }

    fn route_responder_call(
        &mut self,
        call: ResponderCall,
        initiator: &mut InMemoryInitiatorTransport,
    ) {
        match call {
            ResponderCall::Advertise { .. } => {
                self.discovery_reported = false;
            }
            ResponderCall::StopAdvertising => {}
            ResponderCall::RespondToRead { request, value } => {
                if let Some(characteristic) = self.pending_reads.remove(&request) {
                    self.served_values.push(value.clone());
                    initiator.enqueue_event(InitiatorEvent::ValueUpdated {
                        peer: self.responder_peer.clone(),
                        characteristic,
                        value: Ok(value),
                        source: ValueSource::Read,
                    });
                }
            }
            ResponderCall::RespondToWrite { request } => {
                if let Some(characteristic) = self.pending_writes.remove(&request) {
                    initiator.enqueue_event(InitiatorEvent::WriteCompleted {
                        peer: self.responder_peer.clone(),
                        characteristic,
                        result: Ok(()),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{InitiatorTransport, ResponderTransport};

    fn advertised() -> InMemoryResponderTransport {
        let mut responder = InMemoryResponderTransport::default();
        responder
            .advertise(
                &ServiceId::default(),
                &CharacteristicId::default(),
                "SYN Message",
            )
            .expect("advertise");
        responder
    }

    #[test]
    fn scan_reports_advertiser_once() {
        let mut link = LoopbackLink::default();
        let mut responder = advertised();
        let mut initiator = InMemoryInitiatorTransport::default();

        initiator.scan(&ServiceId::default(), false).expect("scan");
        link.route(&mut responder, &mut initiator);
        link.route(&mut responder, &mut initiator);

        assert_eq!(
            initiator.poll_event(),
            Some(InitiatorEvent::DiscoveredPeer {
                peer: link.responder_peer().clone()
            })
        );
        assert_eq!(initiator.poll_event(), None);
    }

    #[test]
    fn scan_for_other_service_sees_nothing() {
        let mut link = LoopbackLink::default();
        let mut responder = advertised();
        let mut initiator = InMemoryInitiatorTransport::default();

        initiator
            .scan(&ServiceId::from_short(0x1800), false)
            .expect("scan");
        link.route(&mut responder, &mut initiator);
        assert_eq!(initiator.poll_event(), None);
    }

    #[test]
    fn read_is_answered_with_responder_value() {
        let mut link = LoopbackLink::default();
        let mut responder = advertised();
        let _ = responder.poll_event();
        let mut initiator = InMemoryInitiatorTransport::default();
        let peer = link.responder_peer().clone();
        let characteristic = CharacteristicId::default();

        initiator.connect(&peer).expect("connect");
        link.route(&mut responder, &mut initiator);
        assert!(link.is_connected());
        assert!(matches!(
            initiator.poll_event(),
            Some(InitiatorEvent::Connected { .. })
        ));

        initiator.read_value(&peer, &characteristic).expect("read");
        link.route(&mut responder, &mut initiator);
        let request = match responder.poll_event() {
            Some(ResponderEvent::ReadRequest { request, .. }) => request,
            other => panic!("expected read request, got {other:?}"),
        };
        responder.respond_to_read(request, b"ACK").expect("respond");
        link.route(&mut responder, &mut initiator);

        assert_eq!(
            initiator.poll_event(),
            Some(InitiatorEvent::ValueUpdated {
                peer,
                characteristic,
                value: Ok(b"ACK".to_vec()),
                source: ValueSource::Read,
            })
        );
        assert_eq!(link.served_values(), &[b"ACK".to_vec()]);
    }

    #[test]
    fn cancel_connection_notifies_both_sides() {
        let mut link = LoopbackLink::default();
        let mut responder = advertised();
        let _ = responder.poll_event();
        let mut initiator = InMemoryInitiatorTransport::default();
        let peer = link.responder_peer().clone();

        initiator.connect(&peer).expect("connect");
        link.route(&mut responder, &mut initiator);
        let _ = initiator.poll_event();

        initiator.cancel_connection(&peer).expect("cancel");
        link.route(&mut responder, &mut initiator);

        assert_eq!(
            initiator.poll_event(),
            Some(InitiatorEvent::Disconnected { peer })
        );
        assert!(matches!(
            responder.poll_event(),
            Some(ResponderEvent::CentralDisconnected { .. })
        ));
        assert!(responder.is_advertising());
    }
}
