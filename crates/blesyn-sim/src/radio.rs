//! Single-role runs over a platform adapter. Each function is compiled
//! only when its backend feature is enabled.

#![cfg_attr(
    not(any(feature = "btleplug", all(feature = "bluer", target_os = "linux"))),
    allow(unused_imports)
)]

use blesyn_protocol::{run_until_settled, ProtocolSettings, RunnerConfig, SessionPhase};
use blesyn_transport::{InitiatorTransport, ResponderTransport};
use tracing::info;

use crate::{sim_observer, HandshakeReport, RoleReport, SimError};

/// Advertises on the default BlueZ adapter and serves one central.
#[cfg(all(feature = "bluer", target_os = "linux"))]
pub fn run_responder(
    settings: ProtocolSettings,
    runner: &RunnerConfig,
) -> Result<HandshakeReport, SimError> {
    use blesyn_protocol::ResponderProtocol;
    use blesyn_transport_ble::bluer_backend::{BluerResponder, BluerResponderConfig};

    let transport = BluerResponder::spawn(BluerResponderConfig::default())
        .map_err(|err| SimError::Backend(err.to_string()))?;
    let mut responder = ResponderProtocol::new(transport, sim_observer(), settings);
    responder.start_advertising()?;
    info!("sim: responder waiting for a central");

    let exit = run_until_settled(&mut responder, runner);
    // Teardown errors are already in the log.
    let _ = responder.stop_advertising();
    let role = RoleReport::new(
        responder.phase().into_phase(),
        &responder.observer().1,
        responder.transport().health_snapshot(),
    );
    let report = HandshakeReport::new("respond", responder.settings(), exit);
    Ok(report.with_responder(role))
}

/// Scans with btleplug, connects to the first responder seen and runs the
/// handshake against it.
#[cfg(feature = "btleplug")]
pub fn run_initiator(
    settings: ProtocolSettings,
    runner: &RunnerConfig,
) -> Result<HandshakeReport, SimError> {
    use blesyn_protocol::InitiatorProtocol;
    use blesyn_transport_ble::btleplug_backend::{BtleplugInitiator, BtleplugInitiatorConfig};

    let transport = BtleplugInitiator::spawn(BtleplugInitiatorConfig::default())
        .map_err(|err| SimError::Backend(err.to_string()))?;
    let mut initiator = InitiatorProtocol::new(transport, sim_observer(), settings);
    initiator.start_scanning(std::time::Instant::now())?;
    info!("sim: initiator scanning");

    let exit = run_until_settled(&mut initiator, runner);
    let role = RoleReport::new(
        initiator.phase().into_phase(),
        &initiator.observer().1,
        initiator.transport().health_snapshot(),
    );
    let report = HandshakeReport::new("initiate", initiator.settings(), exit).with_initiator(role);
    // Teardown errors are already in the log.
    let _ = initiator.dismiss();
    Ok(report)
}
