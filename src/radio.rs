use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use uuid::Uuid;

use crate::{error::Result, types::DeviceId};

/// Platform status code attached to radio completions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattStatus(pub u8);

impl GattStatus {
    /// Operation succeeded
    pub const SUCCESS: Self = Self(0);
    /// Generic GATT error, seen as abrupt peripheral-side disconnects that
    /// only an adapter reset clears
    pub const GATT_ERROR: Self = Self(133);
    /// Request failed inside the host stack
    pub const INTERNAL_ERROR: Self = Self(129);

    /// Check if the operation succeeded
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 == Self::SUCCESS.0
    }

    /// Check if the link is in a state only an adapter reset recovers from
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        self.0 == Self::GATT_ERROR.0
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

/// Link state reported with a connection change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Link is up
    Connected,
    /// Link is down
    Disconnected,
}

/// How a characteristic delivers changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    /// Unacknowledged notifications
    Notify,
    /// Acknowledged indications
    Indicate,
}

/// A characteristic found during service discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Characteristic can be read
    pub read: bool,
    /// Characteristic can be written
    pub write: bool,
    /// Characteristic supports notifications
    pub notify: bool,
    /// Characteristic supports indications
    pub indicate: bool,
}

impl GattCharacteristic {
    /// Subscription mode the characteristic supports, notifications first
    #[must_use]
    pub const fn subscription_kind(&self) -> Option<SubscriptionKind> {
        if self.notify {
            Some(SubscriptionKind::Notify)
        } else if self.indicate {
            Some(SubscriptionKind::Indicate)
        } else {
            None
        }
    }
}

/// A service found during service discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    /// Service UUID
    pub uuid: Uuid,
    /// Characteristics of the service
    pub characteristics: Vec<GattCharacteristic>,
}

/// Asynchronous completions and indications delivered by a [`Radio`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// An advertisement was heard while scanning
    Advertisement {
        /// Advertising peripheral
        device: DeviceId,
        /// Signal strength
        rssi: i16,
        /// Raw GAP payload
        payload: Bytes,
    },
    /// A connection attempt finished or a link dropped
    ConnectionStateChanged {
        /// Peripheral concerned
        device: DeviceId,
        /// Platform status
        status: GattStatus,
        /// New link state
        state: LinkState,
    },
    /// Service discovery finished
    ServicesDiscovered {
        /// Peripheral concerned
        device: DeviceId,
        /// Platform status
        status: GattStatus,
    },
    /// A characteristic read finished
    CharacteristicRead {
        /// Characteristic read
        characteristic: Uuid,
        /// Platform status
        status: GattStatus,
        /// Value read
        value: Bytes,
    },
    /// A subscribed characteristic changed
    CharacteristicChanged {
        /// Characteristic that changed
        characteristic: Uuid,
        /// New value
        value: Bytes,
    },
    /// A characteristic write finished
    CharacteristicWrite {
        /// Characteristic written
        characteristic: Uuid,
        /// Platform status
        status: GattStatus,
    },
    /// A client characteristic configuration descriptor write finished
    DescriptorWrite {
        /// Characteristic owning the descriptor
        characteristic: Uuid,
        /// Platform status
        status: GattStatus,
    },
}

/// The host's BLE stack as seen by the controller
///
/// Operations only issue requests. Their outcomes arrive later as
/// [`RadioEvent`]s on the channel the implementation was built with. Methods
/// returning `bool` report whether the request was accepted.
#[async_trait]
pub trait Radio: Send + Sync + 'static {
    /// Start scanning for advertisements
    async fn start_scan(&self) -> bool;

    /// Stop scanning
    async fn stop_scan(&self) -> Result<()>;

    /// Open a link to a peripheral
    async fn connect(&self, device: &DeviceId) -> Result<()>;

    /// Close the link to a peripheral
    async fn disconnect(&self, device: &DeviceId) -> Result<()>;

    /// Begin GATT service discovery
    async fn discover_services(&self, device: &DeviceId) -> bool;

    /// Services found by the last discovery
    async fn services(&self, device: &DeviceId) -> Vec<GattService>;

    /// Begin reading a characteristic
    async fn read_characteristic(&self, device: &DeviceId, characteristic: Uuid) -> bool;

    /// Begin writing a characteristic
    async fn write_characteristic(
        &self,
        device: &DeviceId,
        characteristic: Uuid,
        value: Bytes,
    ) -> bool;

    /// Enable or disable change delivery and write the configuration descriptor
    async fn set_notification(
        &self,
        device: &DeviceId,
        characteristic: Uuid,
        kind: SubscriptionKind,
        enabled: bool,
    ) -> bool;

    /// Ask the local adapter to turn off
    async fn disable_adapter(&self) -> Result<()>;

    /// Ask the local adapter to turn on
    async fn enable_adapter(&self) -> Result<()>;

    /// Check if the local adapter is on
    async fn is_adapter_enabled(&self) -> bool;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gatt_status_classification() {
        assert!(GattStatus::SUCCESS.is_success());
        assert!(!GattStatus::SUCCESS.is_fatal());
        assert!(GattStatus(133).is_fatal());
        assert!(!GattStatus(8).is_fatal());
        assert_eq!(GattStatus::GATT_ERROR.to_string(), "0x85");
    }

    #[test]
    fn test_subscription_kind_prefers_notify() {
        let mut characteristic = GattCharacteristic {
            uuid: Uuid::nil(),
            read: false,
            write: false,
            notify: true,
            indicate: true,
        };
        assert_eq!(
            characteristic.subscription_kind(),
            Some(SubscriptionKind::Notify)
        );
        characteristic.notify = false;
        assert_eq!(
            characteristic.subscription_kind(),
            Some(SubscriptionKind::Indicate)
        );
        characteristic.indicate = false;
        assert_eq!(characteristic.subscription_kind(), None);
    }
}
