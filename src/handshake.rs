use bytes::Bytes;
use std::{collections::HashMap, time::Duration};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    error::{NexusError, Result},
    protocol::{decode_total_packets, is_supported_service, CharacteristicRole},
    radio::{GattCharacteristic, GattStatus, Radio, RadioEvent},
    sync::Handoff,
    types::DeviceId,
};

/// Completion signals the handshake and transfer wait on
///
/// The event dispatcher feeds these from radio completions without ever
/// blocking; session code consumes one signal per request it issued.
#[derive(Debug)]
pub struct Completions {
    /// Descriptor write confirmations
    pub descriptor: Handoff<(Uuid, GattStatus)>,
    /// Characteristic read results
    pub read: Handoff<(Uuid, GattStatus, Bytes)>,
    /// Characteristic write confirmations
    pub write: Handoff<(Uuid, GattStatus)>,
}

impl Default for Completions {
    fn default() -> Self {
        Self {
            descriptor: Handoff::new("descriptor write"),
            read: Handoff::new("characteristic read"),
            write: Handoff::new("characteristic write"),
        }
    }
}

impl Completions {
    /// Route a completion event to its handoff
    ///
    /// Returns `false` for events that are not completions.
    pub fn route(&self, event: &RadioEvent) -> bool {
        match event {
            RadioEvent::DescriptorWrite {
                characteristic,
                status,
            } => {
                self.descriptor.offer((*characteristic, *status));
                true
            }
            RadioEvent::CharacteristicRead {
                characteristic,
                status,
                value,
            } => {
                self.read.offer((*characteristic, *status, value.clone()));
                true
            }
            RadioEvent::CharacteristicWrite {
                characteristic,
                status,
            } => {
                self.write.offer((*characteristic, *status));
                true
            }
            _ => false,
        }
    }

    /// Drop signals left over from a previous session
    pub async fn clear(&self) {
        self.descriptor.clear().await;
        self.read.clear().await;
        self.write.clear().await;
    }
}

/// What the handshake learned about the connected robot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    /// Packets the robot will send in total
    pub total_packets: u32,
    /// Characteristics that were subscribed
    pub subscribed: Vec<Uuid>,
    /// Values of the initial reads, by role
    pub values: HashMap<CharacteristicRole, Bytes>,
}

/// Subscribe to every notify-capable supported characteristic, then read
/// each supported characteristic in registry order
///
/// Every request waits for its completion before the next one is issued.
/// `on_subscribed` runs once all subscriptions are confirmed.
///
/// # Errors
///
/// Returns [`NexusError::HandshakeFailed`] if a required characteristic is
/// missing or a request is refused, and [`NexusError::Timeout`] if a
/// completion does not arrive within `step_timeout`.
pub async fn run<R, F>(
    radio: &R,
    device: &DeviceId,
    completions: &Completions,
    step_timeout: Duration,
    on_subscribed: F,
) -> Result<HandshakeOutcome>
where
    R: Radio + ?Sized,
    F: FnOnce(),
{
    let supported = supported_characteristics(&radio.services(device).await);
    for role in [
        CharacteristicRole::PacketRead,
        CharacteristicRole::MissingPacketWrite,
        CharacteristicRole::TotalPacketCount,
    ] {
        if !supported.contains_key(&role) {
            return Err(NexusError::HandshakeFailed(format!(
                "{role} characteristic not found"
            )));
        }
    }

    let mut subscribed = Vec::new();
    for role in CharacteristicRole::ALL {
        let Some(characteristic) = supported.get(&role) else {
            continue;
        };
        let Some(kind) = characteristic.subscription_kind() else {
            continue;
        };

        debug!(device = %device, %role, ?kind, "enabling change delivery");
        if !radio
            .set_notification(device, characteristic.uuid, kind, true)
            .await
        {
            return Err(NexusError::HandshakeFailed(format!(
                "subscription to {role} refused"
            )));
        }

        let (uuid, status) = completions.descriptor.take(Some(step_timeout)).await?;
        if !status.is_success() || uuid != characteristic.uuid {
            return Err(NexusError::HandshakeFailed(format!(
                "descriptor write for {role} failed with status {status}"
            )));
        }
        subscribed.push(characteristic.uuid);
    }
    on_subscribed();

    let mut values = HashMap::new();
    for role in CharacteristicRole::ALL {
        let Some(characteristic) = supported.get(&role) else {
            continue;
        };
        if !characteristic.read {
            continue;
        }
        if !radio.read_characteristic(device, characteristic.uuid).await {
            warn!(device = %device, %role, "read request refused");
            continue;
        }

        let (uuid, status, value) = completions.read.take(Some(step_timeout)).await?;
        if uuid != characteristic.uuid {
            return Err(NexusError::HandshakeFailed(format!(
                "read of {role} answered for {uuid}"
            )));
        }
        if !status.is_success() {
            warn!(device = %device, %role, %status, "reading failed");
            continue;
        }
        trace!(device = %device, %role, value = ?&value[..], "read characteristic");
        values.insert(role, value);
    }

    let total_packets = values
        .get(&CharacteristicRole::TotalPacketCount)
        .map(|value| decode_total_packets(value))
        .ok_or_else(|| {
            NexusError::HandshakeFailed("total packet count could not be read".to_string())
        })?;

    info!(device = %device, total_packets, "handshake finished");
    Ok(HandshakeOutcome {
        total_packets,
        subscribed,
        values,
    })
}

fn supported_characteristics(
    services: &[crate::radio::GattService],
) -> HashMap<CharacteristicRole, GattCharacteristic> {
    services
        .iter()
        .filter(|service| is_supported_service(&service.uuid))
        .flat_map(|service| service.characteristics.iter())
        .filter_map(|c| CharacteristicRole::from_uuid(&c.uuid).map(|role| (role, c.clone())))
        .collect()
}
