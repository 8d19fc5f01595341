//! SYN / SYN+ACK / ACK handshake state machines over a single GATT
//! characteristic.
//!
//! [`ResponderProtocol`] plays the peripheral role and answers reads and
//! writes; [`InitiatorProtocol`] plays the central role and drives the
//! exchange. Both are sans-IO: they react to one transport event at a time
//! and only talk to the radio through the capability traits in
//! `blesyn-transport`.

pub mod config;
pub mod error;
pub mod initiator;
pub mod observer;
pub mod responder;
pub mod service;
pub mod session;

pub use config::{HandshakeConfig, HandshakeConfigError, ProtocolSettings};
pub use error::ProtocolError;
pub use initiator::InitiatorProtocol;
pub use observer::{ObserverEvent, RecordingObserver, SessionObserver, TracingObserver};
pub use responder::{AdvertisingState, ResponderProtocol};
pub use service::{run_until_settled, Driver, RunnerConfig, RunnerExit};
pub use session::{InitiatorPhase, Phase, ResponderPhase, Role, Session, SessionPhase};
