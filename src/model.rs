use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    error::{NexusError, Result},
    types::{DeviceId, Robot, RobotState},
};

/// Message type a robot sends when nothing changed
pub const ACK_MESSAGE: &str = "ack";

/// Status document pulled from a robot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// `"ack"` for no change, anything else carries the fields below
    pub msgtype: String,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Reported state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Make of the robot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Fields of a non-ack report, validated
#[derive(Debug, Clone, PartialEq, Eq)]
struct StatusUpdate {
    name: String,
    state: RobotState,
    model: String,
}

impl StatusReport {
    /// Parse a reassembled document
    ///
    /// # Errors
    ///
    /// Returns [`NexusError::Json`] if the document is not a JSON object with
    /// a `msgtype`, and [`NexusError::MalformedDocument`] if a non-ack report
    /// misses a field or names an unknown state.
    pub fn parse(document: &str) -> Result<Self> {
        let report: Self = serde_json::from_str(document)?;
        report.update()?;
        Ok(report)
    }

    /// Check if the report carries no changes
    #[must_use]
    pub fn is_ack(&self) -> bool {
        self.msgtype == ACK_MESSAGE
    }

    fn update(&self) -> Result<Option<StatusUpdate>> {
        if self.is_ack() {
            return Ok(None);
        }

        let field = |value: &Option<String>, name: &str| {
            value
                .clone()
                .ok_or_else(|| NexusError::MalformedDocument(format!("missing field `{name}`")))
        };
        Ok(Some(StatusUpdate {
            name: field(&self.name, "name")?,
            state: field(&self.state, "state")?.parse()?,
            model: field(&self.model, "model")?,
        }))
    }
}

/// Insert a robot, or refresh its proximity if already known
pub fn register(robots: &mut Vec<Robot>, device: &DeviceId, proximity: i16) {
    match robots.iter_mut().find(|robot| robot.id == device.as_str()) {
        Some(robot) => robot.proximity = proximity,
        None => robots.push(Robot::new(device.as_str(), proximity)),
    }
}

/// Apply a status report to the robot with the given identity
///
/// The robot is registered first so a report from a robot not yet in the
/// model still lands.
///
/// # Errors
///
/// Returns [`NexusError::MalformedDocument`] if the report is invalid; the
/// model is left untouched in that case.
pub fn apply_report(
    robots: &mut Vec<Robot>,
    device: &DeviceId,
    proximity: i16,
    report: &StatusReport,
) -> Result<()> {
    let update = report.update()?;
    register(robots, device, proximity);

    let Some(update) = update else {
        debug!(device = %device, "robot reported no change");
        return Ok(());
    };

    if let Some(robot) = robots.iter_mut().find(|robot| robot.id == device.as_str()) {
        robot.name = Some(update.name);
        robot.state = Some(update.state);
        robot.model = Some(update.model);
        info!(robot = %robot, "robot updated");
    }
    Ok(())
}

/// Shared robot model
///
/// All access copies the whole list in or out under one lock, so readers
/// never observe a partially applied update.
#[derive(Debug, Clone, Default)]
pub struct ModelStore {
    robots: Arc<Mutex<Vec<Robot>>>,
}

impl ModelStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current model
    pub async fn get_snapshot(&self) -> Vec<Robot> {
        self.robots.lock().await.clone()
    }

    /// Replace the whole model
    pub async fn replace(&self, robots: Vec<Robot>) {
        *self.robots.lock().await = robots;
    }

    /// Run a read-modify-write under the model lock and return the new model
    ///
    /// # Errors
    ///
    /// Propagates the error of `edit`, in which case the model is unchanged.
    pub async fn update<F>(&self, edit: F) -> Result<Vec<Robot>>
    where
        F: FnOnce(&mut Vec<Robot>) -> Result<()>,
    {
        let mut guard = self.robots.lock().await;
        let mut copy = guard.clone();
        edit(&mut copy)?;
        *guard = copy.clone();
        Ok(copy)
    }
}
