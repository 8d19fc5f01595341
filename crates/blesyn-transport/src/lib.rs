//! Transport abstractions for the handshake protocols.
//!
//! The protocol state machines only depend on the capability traits defined
//! here. Platform stacks implement them in `blesyn-transport-ble`; tests and
//! the simulator use the recording in-memory transports and the loopback
//! link that wires them together.

pub mod adapter;
pub mod loopback;
pub mod memory;

pub use adapter::{
    InitiatorEvent, InitiatorTransport, ResponderEvent, ResponderTransport,
    TransportHealthSnapshot, TransportOp, ValueSource,
};
pub use loopback::LoopbackLink;
pub use memory::{
    InMemoryInitiatorTransport, InMemoryResponderTransport, InMemoryTransportError,
    InitiatorCall, ResponderCall,
};
