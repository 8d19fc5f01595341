use blesyn_core::{CharacteristicId, ServiceId};
use blesyn_protocol::{ObserverEvent, Phase, ProtocolSettings, RecordingObserver, RunnerExit};
use blesyn_transport::TransportHealthSnapshot;
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransportHealth {
    pub calls_ok: u64,
    pub calls_err: u64,
    pub events_delivered: u64,
    pub events_dropped: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<TransportHealthSnapshot> for TransportHealth {
    fn from(snapshot: TransportHealthSnapshot) -> Self {
        Self {
            calls_ok: snapshot.calls_ok,
            calls_err: snapshot.calls_err,
            events_delivered: snapshot.events_delivered,
            events_dropped: snapshot.events_dropped,
            last_error: snapshot.last_error,
        }
    }
}

/// What one role went through, rendered for output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleReport {
    pub final_phase: String,
    pub phases: Vec<String>,
    pub delivered: Vec<String>,
    pub statuses: Vec<String>,
    pub errors: Vec<String>,
    pub transport: TransportHealth,
}

impl RoleReport {
    pub fn new(
        final_phase: Phase,
        observer: &RecordingObserver,
        health: TransportHealthSnapshot,
    ) -> Self {
        let mut report = Self {
            final_phase: final_phase.to_string(),
            phases: Vec::new(),
            delivered: Vec::new(),
            statuses: Vec::new(),
            errors: Vec::new(),
            transport: health.into(),
        };
        for event in &observer.events {
            match event {
                ObserverEvent::PhaseChanged(phase) => report.phases.push(phase.to_string()),
                ObserverEvent::MessageDelivered(payload) => report.delivered.push(payload.clone()),
                ObserverEvent::Status(status) => report.statuses.push(status.clone()),
                ObserverEvent::Error(error) => report.errors.push(error.to_string()),
            }
        }
        report
    }
}

/// Outcome of one simulator run, printed as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandshakeReport {
    pub mode: &'static str,
    pub service: ServiceId,
    pub characteristic: CharacteristicId,
    pub settled: bool,
    pub ticks: u64,
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responder: Option<RoleReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initiator: Option<RoleReport>,
    /// Values that crossed the in-process link; empty on a real radio.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub written: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub served: Vec<String>,
}

impl HandshakeReport {
    pub fn new(mode: &'static str, settings: &ProtocolSettings, exit: RunnerExit) -> Self {
        Self {
            mode,
            service: settings.service,
            characteristic: settings.characteristic,
            settled: exit.is_settled(),
            ticks: exit.ticks(),
            completed: false,
            responder: None,
            initiator: None,
            written: Vec::new(),
            served: Vec::new(),
        }
    }

    pub fn with_responder(mut self, report: RoleReport) -> Self {
        self.responder = Some(report);
        self.refresh_completed();
        self
    }

    pub fn with_initiator(mut self, report: RoleReport) -> Self {
        self.initiator = Some(report);
        self.refresh_completed();
        self
    }

    /// Completed means every role present delivered a payload without errors.
    fn refresh_completed(&mut self) {
        let roles = [self.responder.as_ref(), self.initiator.as_ref()];
        self.completed = self.settled
            && roles.iter().any(Option::is_some)
            && roles
                .iter()
                .flatten()
                .all(|role| !role.delivered.is_empty() && role.errors.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blesyn_protocol::{InitiatorPhase, ProtocolError, SessionObserver};

    fn report(mode: &'static str, exit: RunnerExit) -> HandshakeReport {
        HandshakeReport::new(mode, &ProtocolSettings::default(), exit)
    }

    fn observed() -> RecordingObserver {
        let mut observer = RecordingObserver::default();
        observer.on_phase_changed(Phase::Initiator(InitiatorPhase::Scanning));
        observer.on_status("SYN+ACK Sent...");
        observer.on_message_delivered("hello world");
        observer
    }

    #[test]
    fn role_report_splits_observations() {
        let report = RoleReport::new(
            Phase::Initiator(InitiatorPhase::Done),
            &observed(),
            TransportHealthSnapshot::default(),
        );
        assert_eq!(report.final_phase, "initiator/done");
        assert_eq!(report.phases, vec!["initiator/scanning"]);
        assert_eq!(report.statuses, vec!["SYN+ACK Sent..."]);
        assert_eq!(report.delivered, vec!["hello world"]);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn errors_or_budget_exhaustion_mean_incomplete() {
        let done = Phase::Initiator(InitiatorPhase::Done);
        let clean = RoleReport::new(done, &observed(), TransportHealthSnapshot::default());
        let settled =
            report("initiate", RunnerExit::Settled { ticks: 4 }).with_initiator(clean.clone());
        assert!(settled.completed);

        let exhausted =
            report("initiate", RunnerExit::TickBudgetExhausted { ticks: 9 }).with_initiator(clean);
        assert!(!exhausted.completed);

        let mut noisy = observed();
        noisy.on_error(&ProtocolError::ServiceRegistration("busy".into()));
        let noisy = RoleReport::new(done, &noisy, TransportHealthSnapshot::default());
        let noisy = report("initiate", RunnerExit::Settled { ticks: 4 }).with_initiator(noisy);
        assert!(!noisy.completed);
    }

    #[test]
    fn json_omits_absent_roles() {
        let settings = ProtocolSettings {
            service: ServiceId::from_short(0xFFE0),
            ..ProtocolSettings::default()
        };
        let report = HandshakeReport::new("respond", &settings, RunnerExit::Settled { ticks: 1 });
        let json = serde_json::to_value(&report).expect("serializes");
        assert!(json.get("initiator").is_none());
        assert!(json.get("written").is_none());
        assert_eq!(json["mode"], "respond");
        let service = ServiceId::from_short(0xFFE0).uuid();
        assert_eq!(json["service"], service.to_string());
        assert_eq!(json["completed"], false);
    }
}
