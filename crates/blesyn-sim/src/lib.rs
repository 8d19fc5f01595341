//! Drives both handshake roles, either against each other through the
//! in-process loopback link or one role at a time over a real adapter.

pub mod error;
pub mod pair;
pub mod radio;
pub mod report;

pub use error::SimError;
pub use pair::{sim_observer, LoopbackPair, SimObserver};
pub use report::{HandshakeReport, RoleReport, TransportHealth};

use std::time::Instant;

use blesyn_protocol::{run_until_settled, ProtocolSettings, RunnerConfig};

/// Runs a full in-process handshake and reports how it went.
pub fn run_loopback(
    settings: ProtocolSettings,
    runner: &RunnerConfig,
) -> Result<HandshakeReport, SimError> {
    let mut pair = LoopbackPair::new(settings);
    pair.start(Instant::now())?;
    let exit = run_until_settled(&mut pair, runner);
    Ok(pair.report(exit))
}
