use serde::{Deserialize, Serialize};
use std::{fmt, path::Path, str::FromStr, time::Duration};
use uuid::Uuid;

use crate::{
    error::{NexusError, Result},
    protocol::MAX_WAVE_SIZE,
    TARGET_ROBOT_UUID,
};

/// Opaque identity of a peripheral, the device address as reported by the platform
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wrap a platform address
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Address string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Self-reported condition of a robot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RobotState {
    /// Operating normally
    Ok,
    /// Stopped in a safe state
    Safe,
    /// Requesting assistance
    Help,
    /// Unsafe to approach
    Dangerous,
    /// Powered down
    Off,
}

impl fmt::Display for RobotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Safe => write!(f, "safe"),
            Self::Help => write!(f, "help"),
            Self::Dangerous => write!(f, "dangerous"),
            Self::Off => write!(f, "off"),
        }
    }
}

impl FromStr for RobotState {
    type Err = NexusError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ok" => Ok(Self::Ok),
            "safe" => Ok(Self::Safe),
            "help" => Ok(Self::Help),
            "dangerous" => Ok(Self::Dangerous),
            "off" => Ok(Self::Off),
            other => Err(NexusError::MalformedDocument(format!(
                "unknown robot state: {other}"
            ))),
        }
    }
}

/// A robot as published in the shared model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Robot {
    /// Device address, stable identity within the model
    pub id: String,
    /// Name reported by the robot
    pub name: Option<String>,
    /// Make or model reported by the robot
    pub model: Option<String>,
    /// Last reported state
    pub state: Option<RobotState>,
    /// Signal strength (RSSI) at discovery time
    pub proximity: i16,
    /// Image blob, left to the UI layer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Vec<u8>>,
}

impl Robot {
    /// Create a robot that has only been heard, not yet described
    #[must_use]
    pub fn new(id: impl Into<String>, proximity: i16) -> Self {
        Self {
            id: id.into(),
            name: None,
            model: None,
            state: None,
            proximity,
            image: None,
        }
    }
}

impl fmt::Display for Robot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {} (status: {}, proximity: {}, id: {})",
            self.name.as_deref().unwrap_or("Null"),
            self.model.as_deref().unwrap_or("unknown"),
            self.state.map_or_else(|| "unknown".to_string(), |s| s.to_string()),
            self.proximity,
            self.id
        )
    }
}

/// Discovery tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// UUID a peripheral must advertise to be treated as a robot
    pub target_uuid: Uuid,
    /// How long robots stay in the candidate set without being heard again
    pub presence_timeout_ms: u64,
    /// Delay between failed scan-start attempts
    pub scan_retry_delay_ms: u64,
}

/// Reliable transfer tuning
///
/// `stall_threshold_ms` and `review_interval_ms` trade stall-detection
/// latency against false positives from notification jitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Silence after the last accepted packet that counts as a stall
    pub stall_threshold_ms: u64,
    /// Period of the stall reviewer
    pub review_interval_ms: u64,
    /// Largest number of packets in one wave
    pub max_wave_size: usize,
    /// Missing-packet requests allowed per wave before the transfer is abandoned
    pub max_retransmission_rounds: u32,
    /// Length of the frame written for missing lists and acknowledgments
    pub frame_len: usize,
}

/// Timeouts for blocking radio waits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Per-step wait on a descriptor write or characteristic read during the handshake
    pub handshake_step_timeout_ms: u64,
    /// Wait on a characteristic write confirmation
    pub write_confirm_timeout_ms: u64,
    /// Poll interval while waiting for the adapter to turn off
    pub adapter_poll_interval_ms: u64,
    /// Upper bound on one adapter reset
    pub adapter_reset_timeout_ms: u64,
}

/// Complete controller configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Discovery tuning
    pub discovery: DiscoveryConfig,
    /// Transfer tuning
    pub transfer: TransferConfig,
    /// Radio wait timeouts
    pub timeouts: TimeoutConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            target_uuid: TARGET_ROBOT_UUID,
            presence_timeout_ms: 3_000,
            scan_retry_delay_ms: 500,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            stall_threshold_ms: 150,
            review_interval_ms: 100,
            max_wave_size: MAX_WAVE_SIZE,
            max_retransmission_rounds: 5,
            frame_len: 20,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake_step_timeout_ms: 5_000,
            write_confirm_timeout_ms: 2_000,
            adapter_poll_interval_ms: 500,
            adapter_reset_timeout_ms: 15_000,
        }
    }
}

impl DiscoveryConfig {
    /// Presence timeout as a duration
    #[must_use]
    pub const fn presence_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_timeout_ms)
    }

    /// Scan retry delay as a duration
    #[must_use]
    pub const fn scan_retry_delay(&self) -> Duration {
        Duration::from_millis(self.scan_retry_delay_ms)
    }
}

impl TransferConfig {
    /// Stall threshold as a duration
    #[must_use]
    pub const fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_threshold_ms)
    }

    /// Review interval as a duration
    #[must_use]
    pub const fn review_interval(&self) -> Duration {
        Duration::from_millis(self.review_interval_ms)
    }
}

impl ControllerConfig {
    /// Parse a configuration from JSON, filling omitted fields with defaults
    ///
    /// # Errors
    ///
    /// Returns [`NexusError::Json`] for malformed JSON or
    /// [`NexusError::InvalidConfig`] if validation fails.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    ///
    /// # Errors
    ///
    /// Returns [`NexusError::Io`] if the file cannot be read, otherwise as
    /// [`ControllerConfig::from_json_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Check the transfer settings for values the protocol cannot work with
    ///
    /// # Errors
    ///
    /// Returns [`NexusError::InvalidConfig`] describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        let transfer = &self.transfer;
        if transfer.review_interval_ms == 0 {
            return Err(NexusError::InvalidConfig(
                "review interval must be non-zero".to_string(),
            ));
        }
        if transfer.review_interval_ms >= transfer.stall_threshold_ms {
            return Err(NexusError::InvalidConfig(format!(
                "review interval {}ms must be shorter than stall threshold {}ms",
                transfer.review_interval_ms, transfer.stall_threshold_ms
            )));
        }
        if !(1..=MAX_WAVE_SIZE).contains(&transfer.max_wave_size) {
            return Err(NexusError::InvalidConfig(format!(
                "wave size {} outside 1..={MAX_WAVE_SIZE}",
                transfer.max_wave_size
            )));
        }
        // flag bit plus one bit per packet
        let needed = (transfer.max_wave_size + 1).div_ceil(8);
        if transfer.frame_len < needed {
            return Err(NexusError::InvalidConfig(format!(
                "frame length {} cannot hold a {}-packet missing list",
                transfer.frame_len, transfer.max_wave_size
            )));
        }
        Ok(())
    }
}
