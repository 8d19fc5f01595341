use std::fmt;

use blesyn_core::{CharacteristicId, PeerId, RequestId, ServiceId};

/// Coarse per-transport health counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportHealthSnapshot {
    pub calls_ok: u64,
    pub calls_err: u64,
    pub events_delivered: u64,
    pub events_dropped: u64,
    pub last_error: Option<String>,
}

/// Transport operation names, used when reporting failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportOp {
    Advertise,
    StopAdvertising,
    RespondToRead,
    RespondToWrite,
    Scan,
    StopScan,
    Connect,
    CancelConnection,
    DiscoverService,
    DiscoverCharacteristic,
    ReadValue,
    WriteValue,
    SetNotify,
}

impl TransportOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportOp::Advertise => "advertise",
            TransportOp::StopAdvertising => "stop-advertising",
            TransportOp::RespondToRead => "respond-to-read",
            TransportOp::RespondToWrite => "respond-to-write",
            TransportOp::Scan => "scan",
            TransportOp::StopScan => "stop-scan",
            TransportOp::Connect => "connect",
            TransportOp::CancelConnection => "cancel-connection",
            TransportOp::DiscoverService => "discover-service",
            TransportOp::DiscoverCharacteristic => "discover-characteristic",
            TransportOp::ReadValue => "read-value",
            TransportOp::WriteValue => "write-value",
            TransportOp::SetNotify => "set-notify",
        }
    }
}

impl fmt::Display for TransportOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Asynchronous deliveries from a peripheral-role stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponderEvent {
    /// The stack finished registering the advertised service.
    ServiceAdded {
        service: ServiceId,
        result: Result<(), String>,
    },
    /// A central is reading the characteristic and awaits `respond_to_read`.
    ReadRequest {
        request: RequestId,
        characteristic: CharacteristicId,
    },
    /// A central wrote the characteristic and awaits `respond_to_write`.
    WriteRequest {
        request: RequestId,
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },
    /// The connected central went away.
    CentralDisconnected { peer: PeerId },
}

/// Whether a value arrived as a read result or a pushed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Read,
    Notification,
}

/// Asynchronous deliveries from a central-role stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitiatorEvent {
    DiscoveredPeer {
        peer: PeerId,
    },
    Connected {
        peer: PeerId,
    },
    ConnectFailed {
        peer: PeerId,
        reason: String,
    },
    ServicesDiscovered {
        peer: PeerId,
        result: Result<Vec<ServiceId>, String>,
    },
    CharacteristicsDiscovered {
        peer: PeerId,
        service: ServiceId,
        result: Result<Vec<CharacteristicId>, String>,
    },
    /// Completion of a write issued with `with_response = true`.
    WriteCompleted {
        peer: PeerId,
        characteristic: CharacteristicId,
        result: Result<(), String>,
    },
    ValueUpdated {
        peer: PeerId,
        characteristic: CharacteristicId,
        value: Result<Vec<u8>, String>,
        source: ValueSource,
    },
    NotifyStateChanged {
        peer: PeerId,
        characteristic: CharacteristicId,
        enabled: bool,
        result: Result<(), String>,
    },
    Disconnected {
        peer: PeerId,
    },
}

/// Peripheral-role GATT capability consumed by the responder protocol.
///
/// Calls are non-blocking: completions and inbound requests come back
/// through [`ResponderTransport::poll_event`].
pub trait ResponderTransport {
    /// Transport-specific call error.
    type Error: fmt::Display;

    /// Registers one service carrying one read/write/notify characteristic
    /// and starts broadcasting it.
    fn advertise(
        &mut self,
        service: &ServiceId,
        characteristic: &CharacteristicId,
        local_name: &str,
    ) -> Result<(), Self::Error>;

    fn stop_advertising(&mut self) -> Result<(), Self::Error>;

    /// Answers a pending read request with `value`.
    fn respond_to_read(&mut self, request: RequestId, value: &[u8]) -> Result<(), Self::Error>;

    /// Acknowledges a pending write request.
    fn respond_to_write(&mut self, request: RequestId) -> Result<(), Self::Error>;

    /// Returns the next pending event, if any.
    fn poll_event(&mut self) -> Option<ResponderEvent>;

    /// Best-effort health counters for status displays.
    fn health_snapshot(&self) -> TransportHealthSnapshot {
        TransportHealthSnapshot::default()
    }
}

/// Central-role GATT capability consumed by the initiator protocol.
pub trait InitiatorTransport {
    /// Transport-specific call error.
    type Error: fmt::Display;

    /// Starts a continuous scan filtered to `service`.
    fn scan(&mut self, service: &ServiceId, allow_duplicates: bool) -> Result<(), Self::Error>;

    fn stop_scan(&mut self) -> Result<(), Self::Error>;

    fn connect(&mut self, peer: &PeerId) -> Result<(), Self::Error>;

    /// Tears down a connection. Must be a no-op for unknown peers.
    fn cancel_connection(&mut self, peer: &PeerId) -> Result<(), Self::Error>;

    fn discover_service(&mut self, peer: &PeerId, service: &ServiceId) -> Result<(), Self::Error>;

    fn discover_characteristic(
        &mut self,
        peer: &PeerId,
        service: &ServiceId,
        characteristic: &CharacteristicId,
    ) -> Result<(), Self::Error>;

    fn read_value(
        &mut self,
        peer: &PeerId,
        characteristic: &CharacteristicId,
    ) -> Result<(), Self::Error>;

    fn write_value(
        &mut self,
        peer: &PeerId,
        characteristic: &CharacteristicId,
        bytes: &[u8],
        with_response: bool,
    ) -> Result<(), Self::Error>;

    fn set_notify(
        &mut self,
        peer: &PeerId,
        characteristic: &CharacteristicId,
        enabled: bool,
    ) -> Result<(), Self::Error>;

    /// Returns the next pending event, if any.
    fn poll_event(&mut self) -> Option<InitiatorEvent>;

    /// Best-effort health counters for status displays.
    fn health_snapshot(&self) -> TransportHealthSnapshot {
        TransportHealthSnapshot::default()
    }
}
