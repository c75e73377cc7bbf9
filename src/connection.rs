use std::fmt;
use tracing::{debug, info, warn};

use crate::{
    discovery::ConnectRequest,
    error::NexusError,
    radio::{GattStatus, LinkState},
    types::DeviceId,
};

/// Lifecycle state of the single robot session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session; scanning or recovering
    Disconnected,
    /// Link requested
    Connecting,
    /// Link up, services being discovered
    ServiceDiscovery,
    /// Enabling change delivery on the robot's characteristics
    Subscribing,
    /// Initial characteristic reads
    Reading,
    /// Document transfer running
    Transferring,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::ServiceDiscovery => "service discovery",
            Self::Subscribing => "subscribing",
            Self::Reading => "reading",
            Self::Transferring => "transferring",
        };
        f.write_str(name)
    }
}

/// Something that happened to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionInput {
    /// Discovery found a robot and claimed the session slot
    ConnectRequested(ConnectRequest),
    /// The radio reported a link change
    LinkChanged {
        /// Peripheral concerned
        device: DeviceId,
        /// Platform status
        status: GattStatus,
        /// New link state
        state: LinkState,
    },
    /// The service discovery request was refused outright
    DiscoveryRefused,
    /// Service discovery finished
    ServicesDiscovered {
        /// Peripheral concerned
        device: DeviceId,
        /// Platform status
        status: GattStatus,
    },
    /// Every subscription was confirmed
    Subscribed,
    /// The handshake read the transfer size
    HandshakeComplete {
        /// Packets the robot will send
        total_packets: u32,
    },
    /// The handshake failed or timed out
    HandshakeFailed,
    /// The document arrived and its last wave was acknowledged
    TransferComplete {
        /// Reassembled document
        document: String,
    },
    /// The transfer was abandoned
    TransferFailed,
}

/// Radio failure that forces an adapter reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioFault {
    /// A link event carried the fatal link-layer status
    FatalStatus(GattStatus),
    /// The link never came up
    ConnectFailed(GattStatus),
    /// Service discovery was refused or failed
    DiscoveryFailed,
}

impl From<RadioFault> for NexusError {
    fn from(fault: RadioFault) -> Self {
        match fault {
            RadioFault::FatalStatus(status) => {
                Self::ConnectionFailed(format!("fatal link status {status}"))
            }
            RadioFault::ConnectFailed(status) => {
                Self::ConnectionFailed(format!("link status {status}"))
            }
            RadioFault::DiscoveryFailed => Self::ServiceDiscoveryFailed,
        }
    }
}

/// Work the controller must carry out after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Stop scanning before connecting
    StopScan,
    /// Open the link
    Connect(DeviceId),
    /// Start service discovery
    DiscoverServices(DeviceId),
    /// Run the subscription and read handshake
    StartHandshake(DeviceId),
    /// Record the robot in the model
    RegisterRobot {
        /// Robot identity
        device: DeviceId,
        /// Signal strength at classification
        proximity: i16,
    },
    /// Start pulling the document
    StartTransfer {
        /// Connected robot
        device: DeviceId,
        /// Packets announced by the robot
        total_packets: u32,
    },
    /// Parse the document and apply it to the model
    ApplyReport {
        /// Robot identity
        device: DeviceId,
        /// Signal strength at classification
        proximity: i16,
        /// Reassembled document
        document: String,
    },
    /// Close the link
    Disconnect(DeviceId),
    /// Stop session workers, discard the transfer and release the session slot
    Teardown,
    /// Restart scanning, retrying until it succeeds
    RestartScan,
    /// Cycle the adapter off and on, then restart scanning
    RadioReset(RadioFault),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Session {
    device: DeviceId,
    rssi: i16,
}

/// Connection lifecycle machine
///
/// Transitions are pure: the machine only decides, and returns the
/// [`Action`]s that carry a decision out.
#[derive(Debug)]
pub struct ConnectionMachine {
    state: ConnectionState,
    session: Option<Session>,
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMachine {
    /// Create a machine with no session
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            session: None,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Peripheral of the open session, if any
    #[must_use]
    pub fn device(&self) -> Option<&DeviceId> {
        self.session.as_ref().map(|session| &session.device)
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "connection state change");
            self.state = next;
        }
    }

    fn end_session(&mut self, recovery: Action) -> Vec<Action> {
        self.session = None;
        self.transition(ConnectionState::Disconnected);
        vec![Action::Teardown, recovery]
    }

    fn is_session_device(&self, device: &DeviceId) -> bool {
        self.device() == Some(device)
    }

    /// Feed one input and collect the resulting actions
    pub fn on_event(&mut self, input: ConnectionInput) -> Vec<Action> {
        use ConnectionState as S;

        match (self.state, input) {
            (S::Disconnected, ConnectionInput::ConnectRequested(request)) => {
                info!(device = %request.device, rssi = request.rssi, "connecting to robot");
                let device = request.device.clone();
                self.session = Some(Session {
                    device: request.device,
                    rssi: request.rssi,
                });
                self.transition(S::Connecting);
                vec![Action::StopScan, Action::Connect(device)]
            }
            (_, ConnectionInput::ConnectRequested(request)) => {
                warn!(device = %request.device, state = %self.state, "ignoring connect request during a session");
                Vec::new()
            }

            (
                state,
                ConnectionInput::LinkChanged {
                    device,
                    status,
                    state: link,
                },
            ) => {
                if state == S::Disconnected || !self.is_session_device(&device) {
                    debug!(device = %device, %status, "ignoring link change outside the session");
                    return Vec::new();
                }
                if status.is_fatal() {
                    warn!(device = %device, %status, "fatal link status, resetting radio");
                    return self.end_session(Action::RadioReset(RadioFault::FatalStatus(status)));
                }
                match (state, link) {
                    (S::Connecting, LinkState::Connected) if status.is_success() => {
                        self.transition(S::ServiceDiscovery);
                        vec![Action::DiscoverServices(device)]
                    }
                    (S::Connecting, _) => {
                        warn!(device = %device, %status, "connect failed, resetting radio");
                        self.end_session(Action::RadioReset(RadioFault::ConnectFailed(status)))
                    }
                    (_, LinkState::Disconnected) => {
                        info!(device = %device, %status, "robot disconnected");
                        self.end_session(Action::RestartScan)
                    }
                    (_, LinkState::Connected) => Vec::new(),
                }
            }

            (S::ServiceDiscovery, ConnectionInput::DiscoveryRefused) => {
                warn!("service discovery refused, resetting radio");
                self.end_session(Action::RadioReset(RadioFault::DiscoveryFailed))
            }
            (S::ServiceDiscovery, ConnectionInput::ServicesDiscovered { device, status }) => {
                if !self.is_session_device(&device) {
                    return Vec::new();
                }
                if status.is_success() {
                    self.transition(S::Subscribing);
                    vec![Action::StartHandshake(device)]
                } else {
                    warn!(device = %device, %status, "service discovery failed, resetting radio");
                    self.end_session(Action::RadioReset(RadioFault::DiscoveryFailed))
                }
            }

            (S::Subscribing, ConnectionInput::Subscribed) => {
                self.transition(S::Reading);
                Vec::new()
            }
            (S::Subscribing | S::Reading, ConnectionInput::HandshakeComplete { total_packets }) => {
                let Some(session) = self.session.clone() else {
                    return self.end_session(Action::RestartScan);
                };
                let mut actions = vec![Action::RegisterRobot {
                    device: session.device.clone(),
                    proximity: session.rssi,
                }];
                if total_packets == 0 {
                    info!(device = %session.device, "robot has nothing to send");
                    actions.push(Action::Disconnect(session.device));
                } else {
                    self.transition(S::Transferring);
                    actions.push(Action::StartTransfer {
                        device: session.device,
                        total_packets,
                    });
                }
                actions
            }
            (S::Subscribing | S::Reading, ConnectionInput::HandshakeFailed)
            | (S::Transferring, ConnectionInput::TransferFailed) => self
                .device()
                .cloned()
                .map(|device| vec![Action::Disconnect(device)])
                .unwrap_or_default(),

            (S::Transferring, ConnectionInput::TransferComplete { document }) => {
                let Some(session) = self.session.clone() else {
                    return Vec::new();
                };
                vec![
                    Action::ApplyReport {
                        device: session.device.clone(),
                        proximity: session.rssi,
                        document,
                    },
                    Action::Disconnect(session.device),
                ]
            }

            (state, input) => {
                debug!(%state, ?input, "input has no effect in this state");
                Vec::new()
            }
        }
    }
}
