use blesyn_protocol::{HandshakeConfigError, ProtocolError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] HandshakeConfigError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("ble backend: {0}")]
    Backend(String),
}
