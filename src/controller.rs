use bytes::Bytes;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};

use crate::{
    connection::{Action, ConnectionInput, ConnectionMachine},
    discovery::{ConnectRequest, Discovery, ScanJob, SessionGate},
    error::{NexusError, Result},
    handshake::{self, Completions},
    model::{apply_report, register, ModelStore, StatusReport},
    protocol::CharacteristicRole,
    radio::{GattStatus, LinkState, Radio, RadioEvent},
    sync::Worker,
    transfer::{TransferParams, TransferSession},
    types::{ControllerConfig, DeviceId, Robot, TimeoutConfig},
};

/// Events published for UI layers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    /// Scanning (re)started
    ScanStarted,
    /// A robot was classified and a connection is being attempted
    RobotDiscovered {
        /// Robot identity
        device: DeviceId,
        /// Signal strength at classification
        rssi: i16,
    },
    /// The link to a robot came up
    Connected {
        /// Robot identity
        device: DeviceId,
    },
    /// A status document was received and applied
    TransferComplete {
        /// Robot identity
        device: DeviceId,
        /// Parsed document
        report: StatusReport,
    },
    /// The robot model was republished
    ModelUpdated(Vec<Robot>),
    /// The session ended
    Disconnected {
        /// Robot identity
        device: DeviceId,
    },
    /// The adapter is being cycled to recover from a radio fault
    RadioReset,
}

const EVENT_CAPACITY: usize = 64;

/// Robot discovery and status synchronization controller
///
/// Owns discovery, the connection machine and the transfer, and keeps the
/// robot model up to date.
pub struct Controller {
    radio: Arc<dyn Radio>,
    config: ControllerConfig,
    store: ModelStore,
    events: broadcast::Sender<ControllerEvent>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Create a controller driving `radio`
    ///
    /// # Errors
    ///
    /// Returns [`crate::NexusError::InvalidConfig`] if `config` does not validate.
    pub fn new(radio: Arc<dyn Radio>, config: ControllerConfig) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            radio,
            config,
            store: ModelStore::new(),
            events,
        })
    }

    /// Use an existing model store
    #[must_use]
    pub fn with_store(mut self, store: ModelStore) -> Self {
        self.store = store;
        self
    }

    /// Shared robot model
    #[must_use]
    pub fn store(&self) -> ModelStore {
        self.store.clone()
    }

    /// Subscribe to controller events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    /// Start scanning and serving radio events
    pub fn start(self, radio_events: mpsc::UnboundedReceiver<RadioEvent>) -> ControllerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();

        let gate = SessionGate::new();
        let discovery = Arc::new(Discovery::new(self.config.discovery.clone(), gate.clone()));
        let scan_worker = discovery.clone().spawn_worker(jobs_rx, connect_tx);

        let events = self.events.clone();
        let store = self.store.clone();

        let runtime = Runtime {
            radio: self.radio,
            config: self.config,
            store: self.store,
            events: self.events,
            machine: ConnectionMachine::new(),
            gate,
            discovery,
            scan_worker,
            completions: Arc::new(Completions::default()),
            inputs: inputs_tx,
            scan_jobs: jobs_tx,
            session: SessionTasks::default(),
            scanner: None,
        };

        let task = tokio::spawn(runtime.run(radio_events, inputs_rx, connect_rx, shutdown_rx));
        ControllerHandle {
            events,
            store,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

/// Handle to a running controller
#[derive(Debug)]
pub struct ControllerHandle {
    events: broadcast::Sender<ControllerEvent>,
    store: ModelStore,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ControllerHandle {
    /// Subscribe to controller events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    /// Shared robot model
    #[must_use]
    pub fn store(&self) -> ModelStore {
        self.store.clone()
    }

    /// Stop every worker, close any open session and stop scanning
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                error!(error = %err, "controller task failed");
            }
        }
    }
}

impl Drop for ControllerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Tasks and queues that live as long as one session
#[derive(Debug, Default)]
struct SessionTasks {
    device: Option<DeviceId>,
    notifications: Option<mpsc::UnboundedSender<Bytes>>,
    pending: Option<mpsc::UnboundedReceiver<Bytes>>,
    handshake: Option<JoinHandle<()>>,
    transfer: Option<TransferSession>,
    waiter: Option<JoinHandle<()>>,
}

impl SessionTasks {
    fn open(device: DeviceId) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            device: Some(device),
            notifications: Some(tx),
            pending: Some(rx),
            ..Self::default()
        }
    }

    fn close(&mut self) -> Option<DeviceId> {
        if let Some(handshake) = self.handshake.take() {
            handshake.abort();
        }
        if let Some(transfer) = self.transfer.take() {
            transfer.close();
        }
        if let Some(waiter) = self.waiter.take() {
            waiter.abort();
        }
        self.notifications = None;
        self.pending = None;
        self.device.take()
    }
}

struct Runtime {
    radio: Arc<dyn Radio>,
    config: ControllerConfig,
    store: ModelStore,
    events: broadcast::Sender<ControllerEvent>,
    machine: ConnectionMachine,
    gate: SessionGate,
    discovery: Arc<Discovery>,
    scan_worker: Worker,
    completions: Arc<Completions>,
    inputs: mpsc::UnboundedSender<ConnectionInput>,
    scan_jobs: mpsc::UnboundedSender<ScanJob>,
    session: SessionTasks,
    scanner: Option<JoinHandle<()>>,
}

impl Runtime {
    async fn run(
        mut self,
        mut radio_events: mpsc::UnboundedReceiver<RadioEvent>,
        mut inputs: mpsc::UnboundedReceiver<ConnectionInput>,
        mut connect_requests: mpsc::UnboundedReceiver<ConnectRequest>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        info!("controller started");
        self.start_scanner(None);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(event) = radio_events.recv() => self.dispatch(event).await,
                Some(input) = inputs.recv() => self.feed(input).await,
                Some(request) = connect_requests.recv() => {
                    self.emit(ControllerEvent::RobotDiscovered {
                        device: request.device.clone(),
                        rssi: request.rssi,
                    });
                    self.feed(ConnectionInput::ConnectRequested(request)).await;
                }
                else => break,
            }
        }

        self.stop().await;
    }

    fn emit(&self, event: ControllerEvent) {
        let _ = self.events.send(event);
    }

    /// Route one radio event to the component waiting for it
    async fn dispatch(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::Advertisement {
                device,
                rssi,
                payload,
            } => {
                let _ = self.scan_jobs.send(ScanJob {
                    device,
                    rssi,
                    payload,
                });
            }
            RadioEvent::CharacteristicChanged {
                characteristic,
                value,
            } => {
                if characteristic != CharacteristicRole::PacketRead.uuid() {
                    debug!(%characteristic, "ignoring change on unused characteristic");
                    return;
                }
                match &self.session.notifications {
                    Some(queue) => {
                        let _ = queue.send(value);
                    }
                    None => debug!("dropping notification outside a session"),
                }
            }
            RadioEvent::ConnectionStateChanged {
                device,
                status,
                state,
            } => {
                self.feed(ConnectionInput::LinkChanged {
                    device,
                    status,
                    state,
                })
                .await;
            }
            RadioEvent::ServicesDiscovered { device, status } => {
                self.feed(ConnectionInput::ServicesDiscovered { device, status })
                    .await;
            }
            completion => {
                self.completions.route(&completion);
            }
        }
    }

    async fn feed(&mut self, input: ConnectionInput) {
        for action in self.machine.on_event(input) {
            self.execute(action).await;
        }
    }

    async fn execute(&mut self, action: Action) {
        debug!(?action, "executing");
        match action {
            Action::StopScan => {
                if let Some(scanner) = self.scanner.take() {
                    scanner.abort();
                }
                if let Err(err) = self.radio.stop_scan().await {
                    warn!(error = %err, "could not stop scanning");
                }
            }
            Action::Connect(device) => {
                self.session.close();
                self.session = SessionTasks::open(device.clone());
                self.completions.clear().await;
                if let Err(err) = self.radio.connect(&device).await {
                    warn!(device = %device, error = %err, "connect request failed");
                    self.push(ConnectionInput::LinkChanged {
                        device,
                        status: GattStatus::INTERNAL_ERROR,
                        state: LinkState::Disconnected,
                    });
                }
            }
            Action::DiscoverServices(device) => {
                self.emit(ControllerEvent::Connected {
                    device: device.clone(),
                });
                if !self.radio.discover_services(&device).await {
                    self.push(ConnectionInput::DiscoveryRefused);
                }
            }
            Action::StartHandshake(device) => self.start_handshake(device),
            Action::RegisterRobot { device, proximity } => {
                let registered = self
                    .store
                    .update(|robots| {
                        register(robots, &device, proximity);
                        Ok(())
                    })
                    .await;
                if let Err(err) = registered {
                    warn!(device = %device, error = %err, "could not register robot");
                }
            }
            Action::StartTransfer {
                device,
                total_packets,
            } => self.start_transfer(device, total_packets),
            Action::ApplyReport {
                device,
                proximity,
                document,
            } => self.apply_document(device, proximity, &document).await,
            Action::Disconnect(device) => {
                if let Err(err) = self.radio.disconnect(&device).await {
                    warn!(device = %device, error = %err, "disconnect failed, dropping session");
                    self.push(ConnectionInput::LinkChanged {
                        device,
                        status: GattStatus::SUCCESS,
                        state: LinkState::Disconnected,
                    });
                }
            }
            Action::Teardown => {
                if let Some(device) = self.session.close() {
                    self.emit(ControllerEvent::Disconnected { device });
                }
                self.completions.clear().await;
                self.gate.close();
            }
            Action::RestartScan => self.start_scanner(None),
            Action::RadioReset(fault) => self.recover(&NexusError::from(fault)),
        }
    }

    /// Restart scanning, cycling the adapter first when the error is a radio fault
    fn recover(&mut self, err: &NexusError) {
        if err.is_radio_fault() {
            warn!(error = %err, "radio fault, cycling adapter");
            self.emit(ControllerEvent::RadioReset);
            self.start_scanner(Some(self.config.timeouts.clone()));
        } else {
            debug!(error = %err, "rescanning without adapter reset");
            self.start_scanner(None);
        }
    }

    fn push(&self, input: ConnectionInput) {
        let _ = self.inputs.send(input);
    }

    fn start_handshake(&mut self, device: DeviceId) {
        let radio = self.radio.clone();
        let completions = self.completions.clone();
        let inputs = self.inputs.clone();
        let step_timeout = Duration::from_millis(self.config.timeouts.handshake_step_timeout_ms);

        self.session.handshake = Some(tokio::spawn(async move {
            let subscribed = inputs.clone();
            let outcome = handshake::run(&*radio, &device, &completions, step_timeout, move || {
                let _ = subscribed.send(ConnectionInput::Subscribed);
            })
            .await;

            let input = match outcome {
                Ok(outcome) => ConnectionInput::HandshakeComplete {
                    total_packets: outcome.total_packets,
                },
                Err(err) => {
                    warn!(device = %device, error = %err, "handshake failed");
                    ConnectionInput::HandshakeFailed
                }
            };
            let _ = inputs.send(input);
        }));
    }

    fn start_transfer(&mut self, device: DeviceId, total_packets: u32) {
        let Some(notifications) = self.session.pending.take() else {
            warn!(device = %device, "no notification queue for transfer");
            self.push(ConnectionInput::TransferFailed);
            return;
        };

        let params = TransferParams {
            device: device.clone(),
            sink: CharacteristicRole::MissingPacketWrite.uuid(),
            total_packets,
            config: self.config.transfer.clone(),
            write_timeout: Duration::from_millis(self.config.timeouts.write_confirm_timeout_ms),
        };
        let (session, done) = match TransferSession::start(
            self.radio.clone(),
            self.completions.clone(),
            params,
            notifications,
        ) {
            Ok(started) => started,
            Err(err) => {
                warn!(device = %device, error = %err, "transfer abandoned");
                self.push(ConnectionInput::TransferFailed);
                return;
            }
        };

        let inputs = self.inputs.clone();
        self.session.transfer = Some(session);
        self.session.waiter = Some(tokio::spawn(async move {
            let input = match done.await {
                Ok(Ok(document)) => ConnectionInput::TransferComplete { document },
                Ok(Err(err)) => {
                    if err.is_protocol_loss() {
                        warn!(device = %device, error = %err, "transfer lost");
                    } else {
                        warn!(device = %device, error = %err, "transfer failed");
                    }
                    ConnectionInput::TransferFailed
                }
                Err(_) => return,
            };
            let _ = inputs.send(input);
        }));
    }

    async fn apply_document(&self, device: DeviceId, proximity: i16, document: &str) {
        let report = match StatusReport::parse(document) {
            Ok(report) => report,
            Err(err) => {
                warn!(device = %device, error = %err, "discarding malformed status document");
                return;
            }
        };

        match self
            .store
            .update(|robots| apply_report(robots, &device, proximity, &report))
            .await
        {
            Ok(model) => {
                info!(device = %device, msgtype = %report.msgtype, "status synchronized");
                self.emit(ControllerEvent::TransferComplete {
                    device,
                    report,
                });
                self.emit(ControllerEvent::ModelUpdated(model));
            }
            Err(err) => warn!(device = %device, error = %err, "status not applied"),
        }
    }

    /// Restart scanning in the background, cycling the adapter first if asked
    fn start_scanner(&mut self, reset: Option<TimeoutConfig>) {
        if let Some(previous) = self.scanner.take() {
            previous.abort();
        }

        let radio = self.radio.clone();
        let events = self.events.clone();
        let retry = self.config.discovery.scan_retry_delay();
        self.scanner = Some(tokio::spawn(async move {
            if let Some(timeouts) = reset {
                if let Err(err) = reset_radio(&*radio, &timeouts).await {
                    error!(error = %err, "radio reset failed");
                }
            }
            restart_scanning(&*radio, retry).await;
            let _ = events.send(ControllerEvent::ScanStarted);
        }));
    }

    async fn stop(mut self) {
        info!("controller stopping");
        if let Some(scanner) = self.scanner.take() {
            scanner.abort();
        }
        self.scan_worker.close();
        self.discovery.shutdown();

        let device = self.session.close();
        if let Some(device) = device {
            if let Err(err) = self.radio.disconnect(&device).await {
                debug!(device = %device, error = %err, "disconnect on shutdown");
            }
        }
        self.gate.close();
        if let Err(err) = self.radio.stop_scan().await {
            debug!(error = %err, "stop scan on shutdown");
        }
    }
}

/// Cycle the adapter off and back on
///
/// # Errors
///
/// Returns the radio error if the adapter cannot be turned off or on.
pub async fn reset_radio(radio: &dyn Radio, timeouts: &TimeoutConfig) -> Result<()> {
    warn!("resetting radio");
    radio.disable_adapter().await?;

    let poll = Duration::from_millis(timeouts.adapter_poll_interval_ms);
    let turned_off = async {
        while radio.is_adapter_enabled().await {
            sleep(poll).await;
        }
    };
    if timeout(Duration::from_millis(timeouts.adapter_reset_timeout_ms), turned_off)
        .await
        .is_err()
    {
        warn!("adapter still on, enabling anyway");
    }

    radio.enable_adapter().await?;
    info!("radio reset finished");
    Ok(())
}

/// Start scanning, retrying until the radio accepts
///
/// A disabled adapter is turned on before each attempt.
pub async fn restart_scanning(radio: &dyn Radio, retry: Duration) {
    let mut attempts = 0u32;
    loop {
        if !radio.is_adapter_enabled().await {
            if let Err(err) = radio.enable_adapter().await {
                warn!(error = %err, "could not enable adapter");
            }
        }
        if radio.start_scan().await {
            break;
        }
        attempts += 1;
        debug!(attempts, "scan start failed, retrying");
        sleep(retry).await;
    }
    info!(attempts, "scan restarted");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        advertisement::AdvertisementBuilder,
        protocol::Packet,
        radio::mock::{MockRadio, MockScript, RadioCall},
        types::RobotState,
        TARGET_ROBOT_UUID,
    };

    fn advertisement(address: &str, rssi: i16) -> RadioEvent {
        RadioEvent::Advertisement {
            device: DeviceId::from(address),
            rssi,
            payload: AdvertisementBuilder::new()
                .incomplete_uuids(&[TARGET_ROBOT_UUID])
                .build(),
        }
    }

    fn start(script: MockScript) -> (MockRadio, ControllerHandle) {
        let (radio, events) = MockRadio::new(script);
        let controller =
            Controller::new(Arc::new(radio.clone()), ControllerConfig::default()).unwrap();
        (radio, controller.start(events))
    }

    async fn wait_for(radio: &MockRadio, pred: impl Fn(&RadioCall) -> bool + Copy) {
        for _ in 0..200 {
            if radio.count(pred) > 0 {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("radio call never issued: {:?}", radio.calls());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_connection_for_many_robots() {
        let script = MockScript {
            connect_status: None,
            ..MockScript::default()
        };
        let (radio, handle) = start(script);
        wait_for(&radio, |c| *c == RadioCall::StartScan).await;

        for index in 0..20 {
            radio.emit(advertisement(&format!("C0:FF:EE:00:00:{index:02X}"), -40));
        }
        sleep(Duration::from_secs(1)).await;

        assert_eq!(radio.count(|c| matches!(c, RadioCall::Connect(_))), 1);
        assert_eq!(radio.count(|c| *c == RadioCall::StopScan), 1);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_pull_updates_model() {
        let (radio, handle) = start(MockScript::default().with_total_packets(2));
        let mut events = handle.subscribe();
        wait_for(&radio, |c| *c == RadioCall::StartScan).await;

        radio.emit(advertisement("C0:FF:EE:00:00:01", -48));
        let total = CharacteristicRole::TotalPacketCount.uuid();
        wait_for(&radio, |c| *c == RadioCall::Read(total)).await;

        let packet_read = CharacteristicRole::PacketRead.uuid();
        for (sequence, part) in [
            (1, r#""state":"help","model":"R2"}"#),
            (0, r#"{"msgtype":"status","name":"Rover","#),
        ] {
            radio.emit(RadioEvent::CharacteristicChanged {
                characteristic: packet_read,
                value: Packet::new(false, sequence, part.as_bytes().to_vec()).to_bytes(),
            });
        }

        let report = timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(ControllerEvent::TransferComplete { report, .. }) = events.recv().await {
                    return report;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(report.name.as_deref(), Some("Rover"));

        let robots = handle.store().get_snapshot().await;
        assert_eq!(robots.len(), 1);
        assert_eq!(robots[0].id, "C0:FF:EE:00:00:01");
        assert_eq!(robots[0].proximity, -48);
        assert_eq!(robots[0].state, Some(RobotState::Help));

        wait_for(&radio, |c| matches!(c, RadioCall::Disconnect(_))).await;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(radio.count(|c| *c == RadioCall::StartScan), 2);
        let acks = radio.writes_to(CharacteristicRole::MissingPacketWrite.uuid());
        assert_eq!(acks.len(), 1);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_connect_status_resets_radio() {
        let script = MockScript {
            connect_status: Some(GattStatus::GATT_ERROR),
            disable_lag_polls: 2,
            ..MockScript::default()
        };
        let (radio, handle) = start(script);
        let mut events = handle.subscribe();
        wait_for(&radio, |c| *c == RadioCall::StartScan).await;

        radio.emit(advertisement("C0:FF:EE:00:00:01", -48));
        wait_for(&radio, |c| *c == RadioCall::EnableAdapter).await;
        sleep(Duration::from_millis(100)).await;

        let calls = radio.calls();
        let disable = calls
            .iter()
            .position(|c| *c == RadioCall::DisableAdapter)
            .unwrap();
        let enable = calls
            .iter()
            .position(|c| *c == RadioCall::EnableAdapter)
            .unwrap();
        let rescan = calls.iter().rposition(|c| *c == RadioCall::StartScan).unwrap();
        assert!(disable < enable && enable < rescan);

        let mut saw_reset = false;
        while let Ok(event) = events.try_recv() {
            saw_reset |= event == ControllerEvent::RadioReset;
        }
        assert!(saw_reset);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_start_retried_until_accepted() {
        let script = MockScript {
            scan_failures: 3,
            ..MockScript::default()
        };
        let (radio, handle) = start(script);
        let mut events = handle.subscribe();

        let started = timeout(Duration::from_secs(5), events.recv()).await.unwrap();
        assert_eq!(started.unwrap(), ControllerEvent::ScanStarted);
        assert_eq!(radio.count(|c| *c == RadioCall::StartScan), 4);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_document_abandons_session() {
        let (radio, handle) = start(MockScript::default().with_total_packets(1));
        wait_for(&radio, |c| *c == RadioCall::StartScan).await;

        radio.emit(advertisement("C0:FF:EE:00:00:01", -48));
        let total = CharacteristicRole::TotalPacketCount.uuid();
        wait_for(&radio, |c| *c == RadioCall::Read(total)).await;
        radio.emit(RadioEvent::CharacteristicChanged {
            characteristic: CharacteristicRole::PacketRead.uuid(),
            value: Packet::new(false, 0, b"{not json".to_vec()).to_bytes(),
        });

        wait_for(&radio, |c| matches!(c, RadioCall::Disconnect(_))).await;
        let robots = handle.store().get_snapshot().await;
        assert_eq!(robots.len(), 1);
        assert!(robots[0].name.is_none());
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_disconnects_open_session() {
        let script = MockScript {
            acknowledge_descriptors: false,
            ..MockScript::default().with_total_packets(3)
        };
        let (radio, handle) = start(script);
        wait_for(&radio, |c| *c == RadioCall::StartScan).await;
        radio.emit(advertisement("C0:FF:EE:00:00:01", -48));
        wait_for(&radio, |c| matches!(c, RadioCall::SetNotification(..))).await;

        handle.shutdown().await;
        assert_eq!(radio.count(|c| matches!(c, RadioCall::Disconnect(_))), 1);
        assert_eq!(radio.calls().last(), Some(&RadioCall::StopScan));
    }
}
