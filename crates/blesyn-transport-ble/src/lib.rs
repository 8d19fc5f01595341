//! Platform BLE backends for the handshake transports.
//!
//! Each backend runs its async stack on a dedicated worker thread and
//! exposes one of the synchronous capability traits from
//! `blesyn-transport`. Enable `btleplug` for the central (initiator) side
//! and `bluer` for the BlueZ peripheral (responder) side on Linux.

#[cfg(all(feature = "bluer", target_os = "linux"))]
pub mod bluer_backend;
#[cfg(feature = "btleplug")]
pub mod btleplug_backend;
pub mod worker;

pub use worker::{WorkerCounters, WorkerQueueConfig};
