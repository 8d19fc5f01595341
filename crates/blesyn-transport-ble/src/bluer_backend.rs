//! Peripheral-role transport on BlueZ via `bluer`.
//!
//! GATT callbacks run on the worker runtime. Each inbound read or write is
//! parked behind a oneshot until the protocol answers it through
//! [`ResponderTransport::respond_to_read`] or
//! [`ResponderTransport::respond_to_write`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use blesyn_core::{CharacteristicId, PeerId, RequestId, ServiceId};
use blesyn_transport::{ResponderEvent, ResponderTransport, TransportHealthSnapshot};
use bluer::adv::{Advertisement, AdvertisementHandle};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotifier, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicReadRequest, CharacteristicWrite,
    CharacteristicWriteMethod, CharacteristicWriteRequest, ReqError, Service,
};
use bluer::{Adapter, Address, Session};
use thiserror::Error;
use tokio::sync::{mpsc as tokio_mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::worker::{forward, lock, WorkerCounters, WorkerQueueConfig};

#[derive(Debug, Clone)]
pub struct BluerResponderConfig {
    pub queues: WorkerQueueConfig,
    /// How long a GATT request waits for the protocol before failing.
    pub reply_timeout: Duration,
    /// Interval for checking whether the current central is still there.
    pub disconnect_poll: Duration,
}

impl Default for BluerResponderConfig {
    fn default() -> Self {
        Self {
            queues: WorkerQueueConfig::default(),
            reply_timeout: Duration::from_secs(5),
            disconnect_poll: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BluerResponderError {
    #[error("ble worker is not running")]
    WorkerUnavailable,
    #[error("ble command queue is full")]
    QueueFull,
    #[error("failed to start ble worker: {0}")]
    Spawn(String),
    #[error("no pending {kind} request {request}")]
    UnknownRequest {
        request: RequestId,
        kind: &'static str,
    },
    #[error("central gave up on {0}")]
    RequestExpired(RequestId),
}

#[derive(Debug)]
enum Command {
    Advertise {
        service: ServiceId,
        characteristic: CharacteristicId,
        local_name: String,
    },
    StopAdvertising,
}

#[derive(Debug)]
enum Pending {
    Read(oneshot::Sender<Vec<u8>>),
    Write(oneshot::Sender<()>),
}

impl Pending {
    fn kind(&self) -> &'static str {
        match self {
            Pending::Read(_) => "read",
            Pending::Write(_) => "write",
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<RequestId, Pending>>>;

const NOTIFY_QUEUE: usize = 8;

/// BlueZ GATT server exposing the handshake characteristic.
#[derive(Debug)]
pub struct BluerResponder {
    commands: tokio_mpsc::Sender<Command>,
    events: mpsc::Receiver<ResponderEvent>,
    pending: PendingMap,
    counters: Arc<WorkerCounters>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl BluerResponder {
    pub fn spawn(config: BluerResponderConfig) -> Result<Self, BluerResponderError> {
        let (commands, command_rx) = tokio_mpsc::channel::<Command>(config.queues.command_capacity);
        let (event_tx, events) = mpsc::sync_channel::<ResponderEvent>(config.queues.event_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let counters = Arc::new(WorkerCounters::default());
        let pending: PendingMap = Arc::default();

        let bridge = RequestBridge {
            events: event_tx,
            counters: counters.clone(),
            pending: pending.clone(),
            next_request: Arc::new(AtomicU64::new(1)),
            central: Arc::default(),
            last_served: Arc::default(),
            notifications: Arc::default(),
            characteristic: CharacteristicId::default(),
            reply_timeout: config.reply_timeout,
        };

        let worker = thread::Builder::new()
            .name("blesyn-bluer".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(err) => {
                        warn!("bluer: failed to build runtime: {}", err);
                        return;
                    }
                };
                runtime.block_on(run_worker(config, command_rx, bridge, shutdown_rx));
            })
            .map_err(|err| BluerResponderError::Spawn(err.to_string()))?;

        Ok(Self {
            commands,
            events,
            pending,
            counters,
            shutdown_tx: Some(shutdown_tx),
            worker: Some(worker),
        })
    }

    fn send(&mut self, command: Command) -> Result<(), BluerResponderError> {
        let result = self.commands.try_send(command).map_err(|err| match err {
            tokio_mpsc::error::TrySendError::Full(_) => BluerResponderError::QueueFull,
            tokio_mpsc::error::TrySendError::Closed(_) => BluerResponderError::WorkerUnavailable,
        });
        self.counters.record_call(&result);
        result
    }

    fn take_pending(
        &mut self,
        request: RequestId,
        kind: &'static str,
    ) -> Result<Pending, BluerResponderError> {
        let mut pending = lock(&self.pending);
        match pending.remove(&request) {
            Some(entry) if entry.kind() == kind => Ok(entry),
            Some(other) => {
                pending.insert(request, other);
                Err(BluerResponderError::UnknownRequest { request, kind })
            }
            None => Err(BluerResponderError::UnknownRequest { request, kind }),
        }
    }
}

impl ResponderTransport for BluerResponder {
    type Error = BluerResponderError;

    fn advertise(
        &mut self,
        service: &ServiceId,
        characteristic: &CharacteristicId,
        local_name: &str,
    ) -> Result<(), Self::Error> {
        self.send(Command::Advertise {
            service: *service,
            characteristic: *characteristic,
            local_name: local_name.to_string(),
        })
    }

    fn stop_advertising(&mut self) -> Result<(), Self::Error> {
        self.send(Command::StopAdvertising)
    }

    fn respond_to_read(&mut self, request: RequestId, value: &[u8]) -> Result<(), Self::Error> {
        let result = match self.take_pending(request, "read") {
            Ok(Pending::Read(tx)) => tx
                .send(value.to_vec())
                .map_err(|_| BluerResponderError::RequestExpired(request)),
            Ok(Pending::Write(_)) => Err(BluerResponderError::UnknownRequest {
                request,
                kind: "read",
            }),
            Err(err) => Err(err),
        };
        self.counters.record_call(&result);
        result
    }

    fn respond_to_write(&mut self, request: RequestId) -> Result<(), Self::Error> {
        let result = match self.take_pending(request, "write") {
            Ok(Pending::Write(tx)) => tx
                .send(())
                .map_err(|_| BluerResponderError::RequestExpired(request)),
            Ok(Pending::Read(_)) => Err(BluerResponderError::UnknownRequest {
                request,
                kind: "write",
            }),
            Err(err) => Err(err),
        };
        self.counters.record_call(&result);
        result
    }

    fn poll_event(&mut self) -> Option<ResponderEvent> {
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

impl Drop for BluerResponder {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// State shared between the worker and the GATT callbacks.
#[derive(Clone)]
struct RequestBridge {
    events: mpsc::SyncSender<ResponderEvent>,
    counters: Arc<WorkerCounters>,
    pending: PendingMap,
    next_request: Arc<AtomicU64>,
    central: Arc<Mutex<Option<Address>>>,
    /// Value handed out by the last read; BlueZ asks for long values in
    /// offset chunks and those must not reach the protocol twice.
    last_served: Arc<Mutex<Vec<u8>>>,
    /// Feeds the notification session of a subscribed central.
    notifications: Arc<Mutex<Option<tokio_mpsc::Sender<Vec<u8>>>>>,
    characteristic: CharacteristicId,
    reply_timeout: Duration,
}

impl RequestBridge {
    fn park(&self, device: Address, entry: Pending) -> RequestId {
        let request = RequestId(self.next_request.fetch_add(1, Ordering::Relaxed));
        let mut central = lock(&self.central);
        if central.is_none() {
            debug!("bluer: central {} attached", device);
            *central = Some(device);
        }
        drop(central);
        lock(&self.pending).insert(request, entry);
        request
    }

    fn abandon(&self, request: RequestId) {
        lock(&self.pending).remove(&request);
    }

    async fn read(&self, req: CharacteristicReadRequest) -> Result<Vec<u8>, ReqError> {
        if req.offset > 0 {
            let served = lock(&self.last_served);
            let offset = usize::from(req.offset);
            return Ok(served.get(offset..).map(<[u8]>::to_vec).unwrap_or_default());
        }

        let (tx, rx) = oneshot::channel();
        let request = self.park(req.device_address, Pending::Read(tx));
        let event = ResponderEvent::ReadRequest {
            request,
            characteristic: self.characteristic,
        };
        if !forward(&self.events, &self.counters, event) {
            self.abandon(request);
            return Err(ReqError::Failed);
        }
        match tokio::time::timeout(self.reply_timeout, rx).await {
            Ok(Ok(value)) => {
                *lock(&self.last_served) = value.clone();
                self.push_notification(&value);
                Ok(value)
            }
            _ => {
                warn!("bluer: {} not answered in time", request);
                self.abandon(request);
                Err(ReqError::Failed)
            }
        }
    }

    async fn write(
        &self,
        value: Vec<u8>,
        req: CharacteristicWriteRequest,
    ) -> Result<(), ReqError> {
        let (tx, rx) = oneshot::channel();
        let request = self.park(req.device_address, Pending::Write(tx));
        let event = ResponderEvent::WriteRequest {
            request,
            characteristic: self.characteristic,
            value,
        };
        if !forward(&self.events, &self.counters, event) {
            self.abandon(request);
            return Err(ReqError::Failed);
        }
        match tokio::time::timeout(self.reply_timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            _ => {
                warn!("bluer: {} not answered in time", request);
                self.abandon(request);
                Err(ReqError::Failed)
            }
        }
    }

    /// Mirrors an answered read to the subscribed central, if any.
    fn push_notification(&self, value: &[u8]) {
        let notifications = lock(&self.notifications);
        let Some(tx) = notifications.as_ref() else {
            return;
        };
        if tx.try_send(value.to_vec()).is_err() {
            debug!("bluer: notification queue unavailable, value not pushed");
        }
    }

    /// Runs one notification session until the central unsubscribes or
    /// is released.
    async fn serve_notifications(&self, mut notifier: CharacteristicNotifier) {
        let (tx, mut rx) = tokio_mpsc::channel::<Vec<u8>>(NOTIFY_QUEUE);
        *lock(&self.notifications) = Some(tx);
        debug!("bluer: central subscribed");
        while let Some(value) = rx.recv().await {
            if let Err(err) = notifier.notify(value).await {
                warn!("bluer: notification failed: {}", err);
                break;
            }
        }
        debug!("bluer: notification session ended");
    }

    /// Forgets the current central and fails anything it left pending.
    fn release_central(&self) -> Option<Address> {
        lock(&self.pending).clear();
        lock(&self.last_served).clear();
        *lock(&self.notifications) = None;
        lock(&self.central).take()
    }
}

struct Worker {
    bridge: RequestBridge,
    session: Option<Session>,
    adapter: Option<Adapter>,
    application: Option<ApplicationHandle>,
    advertisement: Option<AdvertisementHandle>,
}

async fn run_worker(
    config: BluerResponderConfig,
    mut commands: tokio_mpsc::Receiver<Command>,
    bridge: RequestBridge,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut worker = Worker {
        bridge,
        session: None,
        adapter: None,
        application: None,
        advertisement: None,
    };
    let mut poll = tokio::time::interval(config.disconnect_poll);

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            maybe_command = commands.recv() => match maybe_command {
                Some(command) => worker.execute(command).await,
                None => break,
            },
            _ = poll.tick() => worker.check_central().await,
        }
    }

    worker.advertisement = None;
    worker.application = None;
    worker.bridge.release_central();
}

impl Worker {
    async fn adapter(&mut self) -> bluer::Result<Adapter> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }
        let session = match self.session.take() {
            Some(session) => session,
            None => Session::new().await?,
        };
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        info!("bluer: using adapter {}", adapter.name());
        self.session = Some(session);
        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::Advertise {
                service,
                characteristic,
                local_name,
            } => {
                let result = self
                    .register(service, characteristic, local_name)
                    .await
                    .map_err(|err| err.to_string());
                if let Err(reason) = &result {
                    warn!("bluer: registering {} failed: {}", service, reason);
                    self.bridge.counters.record_error(reason);
                }
                forward(
                    &self.bridge.events,
                    &self.bridge.counters,
                    ResponderEvent::ServiceAdded { service, result },
                );
            }
            Command::StopAdvertising => {
                if self.advertisement.take().is_some() {
                    info!("bluer: advertising stopped");
                }
            }
        }
    }

    async fn register(
        &mut self,
        service: ServiceId,
        characteristic: CharacteristicId,
        local_name: String,
    ) -> bluer::Result<()> {
        let adapter = self.adapter().await?;
        // Replace any earlier registration wholesale.
        self.advertisement = None;
        self.application = None;
        self.bridge.characteristic = characteristic;

        let application = Application {
            services: vec![Service {
                uuid: service.uuid(),
                primary: true,
                characteristics: vec![self.characteristic(characteristic)],
                ..Default::default()
            }],
            ..Default::default()
        };
        self.application = Some(adapter.serve_gatt_application(application).await?);

        let advertisement = Advertisement {
            service_uuids: vec![service.uuid()].into_iter().collect(),
            discoverable: Some(true),
            local_name: Some(local_name),
            ..Default::default()
        };
        self.advertisement = Some(adapter.advertise(advertisement).await?);
        info!("bluer: advertising {} on {}", service, adapter.name());
        Ok(())
    }

    fn characteristic(&self, id: CharacteristicId) -> Characteristic {
        let reads = self.bridge.clone();
        let writes = self.bridge.clone();
        let notifies = self.bridge.clone();
        Characteristic {
            uuid: id.uuid(),
            read: Some(CharacteristicRead {
                read: true,
                fun: Box::new(move |req: CharacteristicReadRequest| {
                    let bridge = reads.clone();
                    Box::pin(async move { bridge.read(req).await })
                }),
                ..Default::default()
            }),
            write: Some(CharacteristicWrite {
                write: true,
                write_without_response: true,
                method: CharacteristicWriteMethod::Fun(Box::new(
                    move |value: Vec<u8>, req: CharacteristicWriteRequest| {
                        let bridge = writes.clone();
                        Box::pin(async move { bridge.write(value, req).await })
                    },
                )),
                ..Default::default()
            }),
            notify: Some(CharacteristicNotify {
                notify: true,
                method: CharacteristicNotifyMethod::Fun(Box::new(
                    move |notifier: CharacteristicNotifier| {
                        let bridge = notifies.clone();
                        Box::pin(async move { bridge.serve_notifications(notifier).await })
                    },
                )),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn check_central(&mut self) {
        let Some(address) = *lock(&self.bridge.central) else {
            return;
        };
        let Some(adapter) = &self.adapter else {
            return;
        };
        let connected = match adapter.device(address) {
            Ok(device) => device.is_connected().await.unwrap_or(false),
            Err(_) => false,
        };
        if connected {
            return;
        }
        if let Some(address) = self.bridge.release_central() {
            info!("bluer: central {} disconnected", address);
            forward(
                &self.bridge.events,
                &self.bridge.counters,
                ResponderEvent::CentralDisconnected {
                    peer: PeerId::new(address.to_string()),
                },
            );
        }
    }
}
