use std::collections::VecDeque;

use blesyn_core::{CharacteristicId, PeerId, RequestId, ServiceId};
use thiserror::Error;

use crate::adapter::{
    InitiatorEvent, InitiatorTransport, ResponderEvent, ResponderTransport,
    TransportHealthSnapshot, TransportOp,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InMemoryTransportError {
    /// A failure scheduled with `fail_next`.
    #[error("injected failure on {0}")]
    Injected(TransportOp),
}

/// One call captured by [`InMemoryResponderTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponderCall {
    Advertise {
        service: ServiceId,
        characteristic: CharacteristicId,
        local_name: String,
    },
    StopAdvertising,
    RespondToRead {
        request: RequestId,
        value: Vec<u8>,
    },
    RespondToWrite {
        request: RequestId,
    },
}

/// One call captured by [`InMemoryInitiatorTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitiatorCall {
    Scan {
        service: ServiceId,
        allow_duplicates: bool,
    },
    StopScan,
    Connect {
        peer: PeerId,
    },
    CancelConnection {
        peer: PeerId,
    },
    DiscoverService {
        peer: PeerId,
        service: ServiceId,
    },
    DiscoverCharacteristic {
        peer: PeerId,
        service: ServiceId,
        characteristic: CharacteristicId,
    },
    ReadValue {
        peer: PeerId,
        characteristic: CharacteristicId,
    },
    WriteValue {
        peer: PeerId,
        characteristic: CharacteristicId,
        bytes: Vec<u8>,
        with_response: bool,
    },
    SetNotify {
        peer: PeerId,
        characteristic: CharacteristicId,
        enabled: bool,
    },
}

#[derive(Debug, Default, Clone)]
struct CallCounters {
    ok: u64,
    err: u64,
    delivered: u64,
    last_error: Option<String>,
}

impl CallCounters {
    fn snapshot(&self) -> TransportHealthSnapshot {
        TransportHealthSnapshot {
            calls_ok: self.ok,
            calls_err: self.err,
            events_delivered: self.delivered,
            events_dropped: 0,
            last_error: self.last_error.clone(),
        }
    }
}

fn take_failure(
    failures: &mut Vec<TransportOp>,
    counters: &mut CallCounters,
    op: TransportOp,
) -> Result<(), InMemoryTransportError> {
    if let Some(pos) = failures.iter().position(|f| *f == op) {
        failures.remove(pos);
        let err = InMemoryTransportError::Injected(op);
        counters.err += 1;
        counters.last_error = Some(err.to_string());
        return Err(err);
    }
    counters.ok += 1;
    Ok(())
}

/// Recording peripheral-role transport for tests and simulations.
#[derive(Debug, Default, Clone)]
pub struct InMemoryResponderTransport {
    events: VecDeque<ResponderEvent>,
    calls: Vec<ResponderCall>,
    failures: Vec<TransportOp>,
    registration_error: Option<String>,
    registered: Option<(ServiceId, CharacteristicId)>,
    advertising: bool,
    counters: CallCounters,
}

impl InMemoryResponderTransport {
    /// Queues an event for the next `poll_event`.
    pub fn enqueue_event(&mut self, event: ResponderEvent) {
        self.events.push_back(event);
    }

    /// Drains and returns all calls captured so far.
    pub fn take_calls(&mut self) -> Vec<ResponderCall> {
        std::mem::take(&mut self.calls)
    }

    /// Makes the next call of `op` fail.
    pub fn fail_next(&mut self, op: TransportOp) {
        self.failures.push(op);
    }

    /// Makes the next service registration report `reason` asynchronously.
    pub fn reject_service_registration(&mut self, reason: impl Into<String>) {
        self.registration_error = Some(reason.into());
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising
    }

    /// Service and characteristic registered by the last successful advertise.
    pub fn registered(&self) -> Option<(ServiceId, CharacteristicId)> {
        self.registered
    }
}

impl ResponderTransport for InMemoryResponderTransport {
    type Error = InMemoryTransportError;

    fn advertise(
        &mut self,
        service: &ServiceId,
        characteristic: &CharacteristicId,
        local_name: &str,
    ) -> Result<(), Self::Error> {
        take_failure(
            &mut self.failures,
            &mut self.counters,
            TransportOp::Advertise,
        )?;
        self.calls.push(ResponderCall::Advertise {
            service: *service,
            characteristic: *characteristic,
            local_name: local_name.to_string(),
        });
        let result = match self.registration_error.take() {
            Some(reason) => Err(reason),
            None => {
                self.registered = Some((*service, *characteristic));
                self.advertising = true;
                Ok(())
            }
        };
        self.events.push_back(ResponderEvent::ServiceAdded {
            service: *service,
            result,
        });
        Ok(())
    }

    fn stop_advertising(&mut self) -> Result<(), Self::Error> {
        take_failure(
            &mut self.failures,
            &mut self.counters,
            TransportOp::StopAdvertising,
        )?;
        self.calls.push(ResponderCall::StopAdvertising);
        self.advertising = false;
        Ok(())
    }

    fn respond_to_read(&mut self, request: RequestId, value: &[u8]) -> Result<(), Self::Error> {
        take_failure(
            &mut self.failures,
            &mut self.counters,
            TransportOp::RespondToRead,
        )?;
        self.calls.push(ResponderCall::RespondToRead {
            request,
            value: value.to_vec(),
        });
        Ok(())
    }

    fn respond_to_write(&mut self, request: RequestId) -> Result<(), Self::Error> {
        take_failure(
            &mut self.failures,
            &mut self.counters,
            TransportOp::RespondToWrite,
        )?;
        self.calls.push(ResponderCall::RespondToWrite { request });
        Ok(())
    }

    fn poll_event(&mut self) -> Option<ResponderEvent> {
        let event = self.events.pop_front();
        if event.is_some() {
            self.counters.delivered += 1;
        }
        event
    }

    fn health_snapshot(&self) -> TransportHealthSnapshot {
        self.counters.snapshot()
    }
}

/// Recording central-role transport for tests and simulations.
#[derive(Debug, Default, Clone)]
pub struct InMemoryInitiatorTransport {
    events: VecDeque<InitiatorEvent>,
    calls: Vec<InitiatorCall>,
    failures: Vec<TransportOp>,
    scanning: bool,
    connected: Option<PeerId>,
    counters: CallCounters,
}

impl InMemoryInitiatorTransport {
    /// Queues an event for the next `poll_event`.
    pub fn enqueue_event(&mut self, event: InitiatorEvent) {
        self.events.push_back(event);
    }

    /// Drains and returns all calls captured so far.
    pub fn take_calls(&mut self) -> Vec<InitiatorCall> {
        std::mem::take(&mut self.calls)
    }

    /// Makes the next call of `op` fail.
    pub fn fail_next(&mut self, op: TransportOp) {
        self.failures.push(op);
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Peer a `connect` was last issued to, until cancelled.
    pub fn connected_peer(&self) -> Option<&PeerId> {
        self.connected.as_ref()
    }

    fn record(
        &mut self,
        op: TransportOp,
        call: InitiatorCall,
    ) -> Result<(), InMemoryTransportError> {
        take_failure(&mut self.failures, &mut self.counters, op)?;
        self.calls.push(call);
        Ok(())
    }
}

impl InitiatorTransport for InMemoryInitiatorTransport {
    type Error = InMemoryTransportError;

    fn scan(&mut self, service: &ServiceId, allow_duplicates: bool) -> Result<(), Self::Error> {
        self.record(
            TransportOp::Scan,
            InitiatorCall::Scan {
                service: *service,
                allow_duplicates,
            },
        )?;
        self.scanning = true;
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), Self::Error> {
        self.record(TransportOp::StopScan, InitiatorCall::StopScan)?;
        self.scanning = false;
        Ok(())
    }

    fn connect(&mut self, peer: &PeerId) -> Result<(), Self::Error> {
        self.record(
            TransportOp::Connect,
            InitiatorCall::Connect { peer: peer.clone() },
        )?;
        self.connected = Some(peer.clone());
        Ok(())
    }

    fn cancel_connection(&mut self, peer: &PeerId) -> Result<(), Self::Error> {
        if self.connected.as_ref() != Some(peer) {
            return Ok(());
        }
        self.record(
            TransportOp::CancelConnection,
            InitiatorCall::CancelConnection { peer: peer.clone() },
        )?;
        self.connected = None;
        Ok(())
    }

    fn discover_service(&mut self, peer: &PeerId, service: &ServiceId) -> Result<(), Self::Error> {
        self.record(
            TransportOp::DiscoverService,
            InitiatorCall::DiscoverService {
                peer: peer.clone(),
                service: *service,
            },
        )
    }

    fn discover_characteristic(
        &mut self,
        peer: &PeerId,
        service: &ServiceId,
        characteristic: &CharacteristicId,
    ) -> Result<(), Self::Error> {
        self.record(
            TransportOp::DiscoverCharacteristic,
            InitiatorCall::DiscoverCharacteristic {
                peer: peer.clone(),
                service: *service,
                characteristic: *characteristic,
            },
        )
    }

    fn read_value(
        &mut self,
        peer: &PeerId,
        characteristic: &CharacteristicId,
    ) -> Result<(), Self::Error> {
        self.record(
            TransportOp::ReadValue,
            InitiatorCall::ReadValue {
                peer: peer.clone(),
                characteristic: *characteristic,
            },
        )
    }

    fn write_value(
        &mut self,
        peer: &PeerId,
        characteristic: &CharacteristicId,
        bytes: &[u8],
        with_response: bool,
    ) -> Result<(), Self::Error> {
        self.record(
            TransportOp::WriteValue,
            InitiatorCall::WriteValue {
                peer: peer.clone(),
                characteristic: *characteristic,
                bytes: bytes.to_vec(),
                with_response,
            },
        )
    }

    fn set_notify(
        &mut self,
        peer: &PeerId,
        characteristic: &CharacteristicId,
        enabled: bool,
    ) -> Result<(), Self::Error> {
        self.record(
            TransportOp::SetNotify,
            InitiatorCall::SetNotify {
                peer: peer.clone(),
                characteristic: *characteristic,
                enabled,
            },
        )
    }

    fn poll_event(&mut self) -> Option<InitiatorEvent> {
        let event = self.events.pop_front();
        if event.is_some() {
            self.counters.delivered += 1;
        }
        event
    }

    fn health_snapshot(&self) -> TransportHealthSnapshot {
        self.counters.snapshot()
    }
}
