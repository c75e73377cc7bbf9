use bytes::Bytes;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::{advertisement, sync::Worker, types::DiscoveryConfig, types::DeviceId};

/// What discovery has concluded about a peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Not seen, or forgotten when the presence timer fired
    Unknown,
    /// Advertises the target UUID
    Robot,
    /// Does not advertise the target UUID; ignored until restart
    Rejected,
}

/// A peripheral known to discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateDevice {
    /// Peripheral identity
    pub device: DeviceId,
    /// Signal strength of the latest advertisement
    pub last_rssi: i16,
    /// Current classification
    pub classification: Classification,
}

/// One advertisement waiting to be classified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanJob {
    /// Advertising peripheral
    pub device: DeviceId,
    /// Signal strength
    pub rssi: i16,
    /// Raw GAP payload
    pub payload: Bytes,
}

/// Request to open a session with a newly classified robot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Robot to connect to
    pub device: DeviceId,
    /// Signal strength recorded at classification, the robot's proximity
    pub rssi: i16,
}

/// Result of processing one scan job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// Device was already rejected
    Skipped,
    /// A session is open; the pending queue was discarded
    QueueDropped {
        /// Jobs discarded along with this one
        discarded: usize,
    },
    /// Known robot heard again
    ProximityUpdated,
    /// Device does not advertise the target UUID
    Rejected,
    /// New robot; a connection should be attempted
    Connect(ConnectRequest),
}

/// Single-active-connection gate shared by discovery and the connection machine
#[derive(Debug, Clone, Default)]
pub struct SessionGate(Arc<AtomicBool>);

impl SessionGate {
    /// Create a closed gate
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the only session slot
    ///
    /// Returns `false` if a session is already open.
    pub fn try_open(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the session slot
    pub fn close(&self) {
        self.0.store(false, Ordering::Release);
    }

    /// Check if a session is open
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Candidate robots and rejected devices
#[derive(Debug)]
pub struct CandidateRegistry {
    target: Uuid,
    robots: HashMap<DeviceId, i16>,
    rejected: HashSet<DeviceId>,
}

impl CandidateRegistry {
    /// Create an empty registry looking for `target`
    #[must_use]
    pub fn new(target: Uuid) -> Self {
        Self {
            target,
            robots: HashMap::new(),
            rejected: HashSet::new(),
        }
    }

    /// Current classification of a device
    #[must_use]
    pub fn classification(&self, device: &DeviceId) -> Classification {
        if self.rejected.contains(device) {
            Classification::Rejected
        } else if self.robots.contains_key(device) {
            Classification::Robot
        } else {
            Classification::Unknown
        }
    }

    /// Latest signal strength of a candidate robot
    #[must_use]
    pub fn robot_rssi(&self, device: &DeviceId) -> Option<i16> {
        self.robots.get(device).copied()
    }

    /// Forget every candidate robot so each must be rediscovered
    pub fn clear_robots(&mut self) -> usize {
        let cleared = self.robots.len();
        self.robots.clear();
        cleared
    }

    /// Snapshot of every known device
    #[must_use]
    pub fn candidates(&self) -> Vec<CandidateDevice> {
        let robots = self.robots.iter().map(|(device, rssi)| CandidateDevice {
            device: device.clone(),
            last_rssi: *rssi,
            classification: Classification::Robot,
        });
        let rejected = self.rejected.iter().map(|device| CandidateDevice {
            device: device.clone(),
            last_rssi: 0,
            classification: Classification::Rejected,
        });
        let mut all: Vec<_> = robots.chain(rejected).collect();
        all.sort_by(|a, b| a.device.cmp(&b.device));
        all
    }

    /// Classify an advertisement from a device not yet known as a robot
    ///
    /// Returns the resulting classification, recording robots with their RSSI
    /// and rejecting everything else.
    pub fn classify(&mut self, job: &ScanJob) -> Classification {
        match self.classification(&job.device) {
            Classification::Rejected => return Classification::Rejected,
            Classification::Robot => {
                self.robots.insert(job.device.clone(), job.rssi);
                return Classification::Robot;
            }
            Classification::Unknown => {}
        }

        if advertisement::advertised_uuid(&job.payload) == Some(self.target) {
            self.robots.insert(job.device.clone(), job.rssi);
            Classification::Robot
        } else {
            self.rejected.insert(job.device.clone());
            Classification::Rejected
        }
    }
}

/// Restartable one-shot timer that clears the candidate robots
#[derive(Debug, Default)]
struct PresenceTimer {
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PresenceTimer {
    fn restart(&self, registry: Arc<Mutex<CandidateRegistry>>, after: Duration) {
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let cleared = registry.lock().await.clear_robots();
            debug!(cleared, "presence timer fired, candidate robots cleared");
        });

        let mut slot = match self.task.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }

    fn cancel(&self) {
        let mut slot = match self.task.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(task) = slot.take() {
            task.abort();
        }
    }
}

impl Drop for PresenceTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Discovery and filter manager
///
/// Consumes scan jobs in arrival order, classifies devices and asks for a
/// connection when a new robot shows up. Nothing is considered while a
/// session is open.
#[derive(Debug)]
pub struct Discovery {
    registry: Arc<Mutex<CandidateRegistry>>,
    gate: SessionGate,
    presence: PresenceTimer,
    config: DiscoveryConfig,
}

impl Discovery {
    /// Create a discovery manager sharing `gate` with the connection machine
    #[must_use]
    pub fn new(config: DiscoveryConfig, gate: SessionGate) -> Self {
        Self {
            registry: Arc::new(Mutex::new(CandidateRegistry::new(config.target_uuid))),
            gate,
            presence: PresenceTimer::default(),
            config,
        }
    }

    /// Shared candidate registry
    #[must_use]
    pub fn registry(&self) -> Arc<Mutex<CandidateRegistry>> {
        self.registry.clone()
    }

    /// Process one job, draining `pending` when a session is or becomes open
    pub async fn handle(
        &self,
        job: ScanJob,
        pending: &mut mpsc::UnboundedReceiver<ScanJob>,
    ) -> DiscoveryOutcome {
        let mut registry = self.registry.lock().await;

        if registry.classification(&job.device) == Classification::Rejected {
            trace!(device = %job.device, "skipping rejected device");
            return DiscoveryOutcome::Skipped;
        }

        if self.gate.is_open() {
            let discarded = drain(pending);
            trace!(discarded, "session open, dropping scan queue");
            return DiscoveryOutcome::QueueDropped { discarded };
        }

        if registry.classification(&job.device) == Classification::Robot {
            registry.classify(&job);
            trace!(device = %job.device, rssi = job.rssi, "heard known robot");
            return DiscoveryOutcome::ProximityUpdated;
        }

        match registry.classify(&job) {
            Classification::Robot => {
                drop(registry);
                info!(device = %job.device, rssi = job.rssi, "found robot");
                self.presence
                    .restart(self.registry.clone(), self.config.presence_timeout());

                if !self.gate.try_open() {
                    let discarded = drain(pending);
                    return DiscoveryOutcome::QueueDropped { discarded };
                }
                let discarded = drain(pending);
                debug!(discarded, "cleared scan queue before connecting");

                DiscoveryOutcome::Connect(ConnectRequest {
                    device: job.device,
                    rssi: job.rssi,
                })
            }
            _ => {
                debug!(device = %job.device, "rejected device");
                DiscoveryOutcome::Rejected
            }
        }
    }

    /// Run the scan-queue consumer until the job channel closes
    pub fn spawn_worker(
        self: Arc<Self>,
        mut jobs: mpsc::UnboundedReceiver<ScanJob>,
        connect: mpsc::UnboundedSender<ConnectRequest>,
    ) -> Worker {
        Worker::spawn("scan-callbacks", move |keep_alive| async move {
            while let Some(job) = jobs.recv().await {
                if !keep_alive.is_alive() {
                    break;
                }
                if let DiscoveryOutcome::Connect(request) = self.handle(job, &mut jobs).await {
                    if connect.send(request).is_err() {
                        break;
                    }
                }
            }
        })
    }

    /// Stop the presence timer
    pub fn shutdown(&self) {
        self.presence.cancel();
    }
}

fn drain(pending: &mut mpsc::UnboundedReceiver<ScanJob>) -> usize {
    let mut discarded = 0;
    while pending.try_recv().is_ok() {
        discarded += 1;
    }
    discarded
}
