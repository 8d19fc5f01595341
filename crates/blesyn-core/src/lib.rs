//! Core primitives shared by both handshake roles.
//!
//! Includes the on-air message framing, GATT identifiers, and base errors.

pub mod error;
pub mod ids;
pub mod message;

pub use error::CoreError;
pub use ids::{CharacteristicId, PeerId, RequestId, ServiceId};
pub use message::{Message, DEFAULT_OUTBOUND_TEXT, RECEIVED_MESSAGE_ACK};
