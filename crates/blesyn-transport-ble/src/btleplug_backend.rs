use std::collections::{HashMap, HashSet};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use blesyn_core::{CharacteristicId, PeerId, ServiceId};
use blesyn_transport::{InitiatorEvent, InitiatorTransport, TransportHealthSnapshot, ValueSource};
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::{mpsc as tokio_mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::worker::{forward, WorkerCounters, WorkerQueueConfig};

#[derive(Debug, Clone)]
pub struct BtleplugInitiatorConfig {
    pub queues: WorkerQueueConfig,
    pub connect_timeout: Duration,
    /// Index into the platform adapter list.
    pub adapter_index: usize,
}

impl Default for BtleplugInitiatorConfig {
    fn default() -> Self {
        Self {
            queues: WorkerQueueConfig::default(),
            connect_timeout: Duration::from_secs(10),
            adapter_index: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BtleplugInitiatorError {
    #[error("ble worker is not running")]
    WorkerUnavailable,
    #[error("ble command queue is full")]
    QueueFull,
    #[error("failed to start ble worker: {0}")]
    Spawn(String),
}

#[derive(Debug)]
enum Command {
    Scan {
        service: Uuid,
        allow_duplicates: bool,
    },
    StopScan,
    Connect(PeerId),
    CancelConnection(PeerId),
    DiscoverService {
        peer: PeerId,
        service: ServiceId,
    },
    DiscoverCharacteristic {
        peer: PeerId,
        service: ServiceId,
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

/// Central-role transport backed by `btleplug`.
#[derive(Debug)]
pub struct BtleplugInitiator {
    commands: tokio_mpsc::Sender<Command>,
    events: mpsc::Receiver<InitiatorEvent>,
    counters: Arc<WorkerCounters>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl BtleplugInitiator {
    pub fn spawn(config: BtleplugInitiatorConfig) -> Result<Self, BtleplugInitiatorError> {
        let (commands, command_rx) = tokio_mpsc::channel::<Command>(config.queues.command_capacity);
        let (event_tx, events) = mpsc::sync_channel::<InitiatorEvent>(config.queues.event_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let counters = Arc::new(WorkerCounters::default());
        let worker_counters = counters.clone();

        let worker = thread::Builder::new()
            .name("blesyn-btleplug".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(err) => {
                        warn!("btleplug: failed to build runtime: {}", err);
                        return;
                    }
                };
                runtime.block_on(run_worker(
                    config,
                    command_rx,
                    event_tx,
                    shutdown_rx,
                    worker_counters,
                ));
            })
            .map_err(|err| BtleplugInitiatorError::Spawn(err.to_string()))?;

        Ok(Self {
            commands,
            events,
            counters,
            shutdown_tx: Some(shutdown_tx),
            worker: Some(worker),
        })
    }

    fn send(&mut self, command: Command) -> Result<(), BtleplugInitiatorError> {
        let result = self.commands.try_send(command).map_err(|err| match err {
            tokio_mpsc::error::TrySendError::Full(_) => BtleplugInitiatorError::QueueFull,
            tokio_mpsc::error::TrySendError::Closed(_) => {
                BtleplugInitiatorError::WorkerUnavailable
            }
        });
        self.counters.record_call(&result);
        result
    }
}

impl InitiatorTransport for BtleplugInitiator {
    type Error = BtleplugInitiatorError;

    fn scan(&mut self, service: &ServiceId, allow_duplicates: bool) -> Result<(), Self::Error> {
        self.send(Command::Scan {
            service: service.uuid(),
            allow_duplicates,
        })
    }

    fn stop_scan(&mut self) -> Result<(), Self::Error> {
        self.send(Command::StopScan)
    }

    fn connect(&mut self, peer: &PeerId) -> Result<(), Self::Error> {
        self.send(Command::Connect(peer.clone()))
    }

    fn cancel_connection(&mut self, peer: &PeerId) -> Result<(), Self::Error> {
        self.send(Command::CancelConnection(peer.clone()))
    }

    fn discover_service(&mut self, peer: &PeerId, service: &ServiceId) -> Result<(), Self::Error> {
        self.send(Command::DiscoverService {
            peer: peer.clone(),
            service: *service,
        })
    }

    fn discover_characteristic(
        &mut self,
        peer: &PeerId,
        service: &ServiceId,
        _characteristic: &CharacteristicId,
    ) -> Result<(), Self::Error> {
        self.send(Command::DiscoverCharacteristic {
            peer: peer.clone(),
            service: *service,
        })
    }

    fn read_value(
        &mut self,
        peer: &PeerId,
        characteristic: &CharacteristicId,
    ) -> Result<(), Self::Error> {
        self.send(Command::ReadValue {
            peer: peer.clone(),
            characteristic: *characteristic,
        })
    }

    fn write_value(
        &mut self,
        peer: &PeerId,
        characteristic: &CharacteristicId,
        bytes: &[u8],
        with_response: bool,
    ) -> Result<(), Self::Error> {
        self.send(Command::WriteValue {
            peer: peer.clone(),
            characteristic: *characteristic,
            bytes: bytes.to_vec(),
            with_response,
        })
    }

    fn set_notify(
        &mut self,
        peer: &PeerId,
        characteristic: &CharacteristicId,
        enabled: bool,
    ) -> Result<(), Self::Error> {
        self.send(Command::SetNotify {
            peer: peer.clone(),
            characteristic: *characteristic,
            enabled,
        })
    }

    fn poll_event(&mut self) -> Option<InitiatorEvent> {
        let event = self.events.try_recv().ok();
        if event.is_some() {
            self.counters.record_delivered();
        }
        event
    }

    fn health_snapshot(&self) -> TransportHealthSnapshot {
        self.counters.snapshot()
    }
}

impl Drop for BtleplugInitiator {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

struct Worker {
    adapter: Adapter,
    config: BtleplugInitiatorConfig,
    events: mpsc::SyncSender<InitiatorEvent>,
    counters: Arc<WorkerCounters>,
    peripherals: HashMap<String, Peripheral>,
    connected: HashSet<String>,
    scan_filter: Option<Uuid>,
    allow_duplicates: bool,
    reported: HashSet<String>,
    notify_tasks: HashMap<String, tokio::task::JoinHandle<()>>,
}

async fn first_adapter(index: usize) -> Result<Adapter, String> {
    let manager = Manager::new().await.map_err(|e| e.to_string())?;
    let adapters = manager.adapters().await.map_err(|e| e.to_string())?;
    adapters
        .into_iter()
        .nth(index)
        .ok_or_else(|| format!("no bluetooth adapter at index {index}"))
}

async fn run_worker(
    config: BtleplugInitiatorConfig,
    mut commands: tokio_mpsc::Receiver<Command>,
    events: mpsc::SyncSender<InitiatorEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
    counters: Arc<WorkerCounters>,
) {
    let adapter = match first_adapter(config.adapter_index).await {
        Ok(adapter) => adapter,
        Err(err) => {
            warn!("btleplug: adapter unavailable: {}", err);
            counters.record_error(&err);
            return;
        }
    };
    let mut central_events = match adapter.events().await {
        Ok(stream) => stream,
        Err(err) => {
            warn!("btleplug: event stream unavailable: {}", err);
            counters.record_error(err);
            return;
        }
    };

    let mut worker = Worker {
        adapter,
        config,
        events,
        counters,
        peripherals: HashMap::new(),
        connected: HashSet::new(),
        scan_filter: None,
        allow_duplicates: false,
        reported: HashSet::new(),
        notify_tasks: HashMap::new(),
    };

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            Some(event) = central_events.next() => worker.on_central_event(event).await,
            maybe_command = commands.recv() => match maybe_command {
                Some(command) => worker.execute(command).await,
                None => break,
            },
        }
    }

    worker.shutdown().await;
}

impl Worker {
    fn emit(&self, event: InitiatorEvent) {
        forward(&self.events, &self.counters, event);
    }

    fn peripheral(&self, peer: &PeerId) -> Result<Peripheral, String> {
        self.peripherals
            .get(peer.as_str())
            .cloned()
            .ok_or_else(|| format!("unknown peer {peer}"))
    }

    fn find_characteristic(
        peripheral: &Peripheral,
        characteristic: &CharacteristicId,
    ) -> Result<Characteristic, String> {
        let uuid = characteristic.uuid();
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| format!("characteristic {characteristic} not discovered"))
    }

    async fn on_central_event(&mut self, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let Some(filter) = self.scan_filter else {
                    return;
                };
                let Ok(peripheral) = self.adapter.peripheral(&id).await else {
                    return;
                };
                let advertises = match peripheral.properties().await {
                    Ok(Some(props)) => props.services.contains(&filter),
                    _ => false,
                };
                if !advertises {
                    return;
                }
                let addr = id.to_string();
                self.peripherals.insert(addr.clone(), peripheral);
                if !self.allow_duplicates && !self.reported.insert(addr.clone()) {
                    return;
                }
                debug!("btleplug: discovered {}", addr);
                self.emit(InitiatorEvent::DiscoveredPeer {
                    peer: PeerId::new(addr),
                });
            }
            CentralEvent::DeviceDisconnected(id) => {
                let addr = id.to_string();
                if self.connected.remove(&addr) {
                    info!("btleplug: {} disconnected", addr);
                    self.abort_notifications(&addr);
                    self.emit(InitiatorEvent::Disconnected {
                        peer: PeerId::new(addr),
                    });
                }
            }
            _ => {}
        }
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::Scan {
                service,
                allow_duplicates,
            } => {
                self.scan_filter = Some(service);
                self.allow_duplicates = allow_duplicates;
                self.reported.clear();
                let filter = ScanFilter {
                    services: vec![service],
                };
                if let Err(err) = self.adapter.start_scan(filter).await {
                    warn!("btleplug: start_scan failed: {}", err);
                    self.counters.record_error(err);
                }
            }
            Command::StopScan => {
                self.scan_filter = None;
                if let Err(err) = self.adapter.stop_scan().await {
                    warn!("btleplug: stop_scan failed: {}", err);
                    self.counters.record_error(err);
                }
            }
            Command::Connect(peer) => {
                let event = match self.connect(&peer).await {
                    Ok(()) => InitiatorEvent::Connected { peer },
                    Err(reason) => InitiatorEvent::ConnectFailed { peer, reason },
                };
                self.emit(event);
            }
            Command::CancelConnection(peer) => {
                let addr = peer.as_str().to_string();
                if !self.connected.remove(&addr) {
                    return;
                }
                self.abort_notifications(&addr);
                if let Ok(peripheral) = self.peripheral(&peer) {
                    if let Err(err) = peripheral.disconnect().await {
                        warn!("btleplug: disconnect from {} failed: {}", peer, err);
                    }
                }
                self.emit(InitiatorEvent::Disconnected { peer });
            }
            Command::DiscoverService { peer, service } => {
                let result = self.discover(&peer).await.map(|p| {
                    p.services()
                        .into_iter()
                        .map(|s| ServiceId::from(s.uuid))
                        .collect::<Vec<_>>()
                });
                debug!(
                    "btleplug: services on {} looking for {}: {:?}",
                    peer, service, result
                );
                self.emit(InitiatorEvent::ServicesDiscovered { peer, result });
            }
            Command::DiscoverCharacteristic { peer, service } => {
                let result = self.peripheral(&peer).and_then(|p| {
                    let uuid = service.uuid();
                    p.services()
                        .into_iter()
                        .find(|s| s.uuid == uuid)
                        .map(|s| {
                            s.characteristics
                                .into_iter()
                                .map(|c| CharacteristicId::from(c.uuid))
                                .collect()
                        })
                        .ok_or_else(|| format!("service {service} not found on {peer}"))
                });
                self.emit(InitiatorEvent::CharacteristicsDiscovered {
                    peer,
                    service,
                    result,
                });
            }
            Command::ReadValue {
                peer,
                characteristic,
            } => {
                let value = match self.target(&peer, &characteristic) {
                    Ok((p, ch)) => p.read(&ch).await.map_err(|e| e.to_string()),
                    Err(reason) => Err(reason),
                };
                self.emit(InitiatorEvent::ValueUpdated {
                    peer,
                    characteristic,
                    value,
                    source: ValueSource::Read,
                });
            }
            Command::WriteValue {
                peer,
                characteristic,
                bytes,
                with_response,
            } => {
                let write_type = if with_response {
                    WriteType::WithResponse
                } else {
                    WriteType::WithoutResponse
                };
                let result = match self.target(&peer, &characteristic) {
                    Ok((p, ch)) => p
                        .write(&ch, &bytes, write_type)
                        .await
                        .map_err(|e| e.to_string()),
                    Err(reason) => Err(reason),
                };
                if with_response {
                    self.emit(InitiatorEvent::WriteCompleted {
                        peer,
                        characteristic,
                        result,
                    });
                } else if let Err(reason) = result {
                    warn!(
                        "btleplug: unacknowledged write to {} failed: {}",
                        peer, reason
                    );
                    self.counters.record_error(reason);
                }
            }
            Command::SetNotify {
                peer,
                characteristic,
                enabled,
            } => {
                let result = self.set_notify(&peer, &characteristic, enabled).await;
                self.emit(InitiatorEvent::NotifyStateChanged {
                    peer,
                    characteristic,
                    enabled,
                    result,
                });
            }
        }
    }

    async fn connect(&mut self, peer: &PeerId) -> Result<(), String> {
        let peripheral = self.peripheral(peer)?;
        match tokio::time::timeout(self.config.connect_timeout, peripheral.connect()).await {
            Ok(Ok(())) => {
                info!("btleplug: connected to {}", peer);
                self.connected.insert(peer.as_str().to_string());
                Ok(())
            }
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!(
                "connect timed out after {:?}",
                self.config.connect_timeout
            )),
        }
    }

    async fn discover(&self, peer: &PeerId) -> Result<Peripheral, String> {
        let peripheral = self.peripheral(peer)?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| e.to_string())?;
        Ok(peripheral)
    }

    fn target(
        &self,
        peer: &PeerId,
        characteristic: &CharacteristicId,
    ) -> Result<(Peripheral, Characteristic), String> {
        let peripheral = self.peripheral(peer)?;
        let ch = Self::find_characteristic(&peripheral, characteristic)?;
        Ok((peripheral, ch))
    }

    async fn set_notify(
        &mut self,
        peer: &PeerId,
        characteristic: &CharacteristicId,
        enabled: bool,
    ) -> Result<(), String> {
        let (peripheral, ch) = self.target(peer, characteristic)?;
        if !enabled {
            self.abort_notifications(peer.as_str());
            return peripheral.unsubscribe(&ch).await.map_err(|e| e.to_string());
        }

        peripheral.subscribe(&ch).await.map_err(|e| e.to_string())?;
        if self.notify_tasks.contains_key(peer.as_str()) {
            return Ok(());
        }
        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| e.to_string())?;
        let events = self.events.clone();
        let counters = self.counters.clone();
        let source_peer = peer.clone();
        let handle = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                forward(
                    &events,
                    &counters,
                    InitiatorEvent::ValueUpdated {
                        peer: source_peer.clone(),
                        characteristic: CharacteristicId::from(notification.uuid),
                        value: Ok(notification.value),
                        source: ValueSource::Notification,
                    },
                );
            }
        });
        self.notify_tasks.insert(peer.as_str().to_string(), handle);
        Ok(())
    }

    fn abort_notifications(&mut self, addr: &str) {
        if let Some(task) = self.notify_tasks.remove(addr) {
            task.abort();
        }
    }

    async fn shutdown(&mut self) {
        for (_, task) in self.notify_tasks.drain() {
            task.abort();
        }
        if self.scan_filter.take().is_some() {
            let _ = self.adapter.stop_scan().await;
        }
        for addr in self.connected.drain() {
            if let Some(peripheral) = self.peripherals.get(&addr) {
                let _ = peripheral.disconnect().await;
            }
        }
    }
}
