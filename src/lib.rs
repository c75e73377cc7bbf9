#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Robot Nexus 🤖
//!
//! A Rust library that finds nearby robots over Bluetooth Low Energy and
//! pulls their JSON status reports into a shared robot model.
//!
//! Robots advertise a fixed 128-bit UUID. Once one is heard the controller
//! stops scanning, connects, subscribes to the robot's packet characteristic
//! and reads the announced packet count. The status document then arrives as
//! a stream of notifications that is reassembled in waves of up to 128
//! packets, with holes requested again through a missing-packet bitmap.
//!
//! ## Transfer Protocol
//!
//! - **Framing**: byte 0 of each notification carries a retransmission flag
//!   and a 7-bit sequence number, the rest is a UTF-8 fragment
//! - **Waves**: each wave is acknowledged with a zeroed frame once complete
//! - **Stall Detection**: a wave silent for 150 ms with holes left triggers a
//!   missing-packet request
//! - **Recovery**: radio faults cycle the adapter and restart scanning
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use robot_nexus::{BtleplugRadio, Controller, ControllerConfig, ControllerEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (radio, radio_events) = BtleplugRadio::new().await?;
//!     let controller = Controller::new(Arc::new(radio), ControllerConfig::default())?;
//!     let mut events = controller.subscribe();
//!     let handle = controller.start(radio_events);
//!
//!     while let Ok(event) = events.recv().await {
//!         if let ControllerEvent::ModelUpdated(robots) = event {
//!             for robot in robots {
//!                 println!("{robot}");
//!             }
//!             break;
//!         }
//!     }
//!
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```

use uuid::Uuid;

/// Advertising payload parsing and encoding
pub mod advertisement;
/// btleplug radio backend
pub mod ble;
/// Connection lifecycle state machine
pub mod connection;
/// Controller wiring discovery, sessions and the model together
pub mod controller;
/// Robot discovery and filtering
pub mod discovery;
/// Error types and handling
pub mod error;
/// Subscription and read handshake
pub mod handshake;
/// Shared robot model and status reports
pub mod model;
/// Wire formats of the transfer protocol
pub mod protocol;
/// Radio capability interface
pub mod radio;
/// Handoffs and worker handles
pub mod sync;
/// Reliable multi-packet transfer
pub mod transfer;
/// Type definitions and configuration
pub mod types;

// Re-export the main types for convenient usage
pub use ble::BtleplugRadio;
pub use controller::{Controller, ControllerEvent, ControllerHandle};
pub use error::{NexusError, Result};
pub use model::{ModelStore, StatusReport};
pub use radio::{Radio, RadioEvent};
pub use types::{
    ControllerConfig, DeviceId, DiscoveryConfig, Robot, RobotState, TimeoutConfig, TransferConfig,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// UUID every robot lists in its advertisement
///
/// Carried in an incomplete list of 128-bit service UUIDs (GAP type 0x06).
pub const TARGET_ROBOT_UUID: Uuid = Uuid::from_u128(0x11bf_458d_2227_599b_3046_de30_0018_0000);

/// Service through which the robot receives images
pub const IMAGE_RECEIVE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_1800_30de_4630_9b59_2722_8d45_bf11);

/// Service through which the robot sends its status
pub const IMAGE_SEND_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_1801_30de_4630_9b59_2722_8d45_bf11);

/// Notify characteristic carrying transfer packets
pub const PACKET_READ_CHAR_UUID: Uuid = Uuid::from_u128(0x0000_2a10_30de_4630_9b59_2722_8d45_bf11);

/// Characteristic receiving missing lists and wave acknowledgments
pub const MISSING_PACKET_WRITE_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000_2a11_30de_4630_9b59_2722_8d45_bf11);

/// Characteristic for packets sent to the robot
pub const PACKET_WRITE_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000_2a12_30de_4630_9b59_2722_8d45_bf11);

/// Characteristic holding the number of packets the robot will send
///
/// Big-endian signed 32-bit value.
pub const TOTAL_PACKET_COUNT_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000_2a14_30de_4630_9b59_2722_8d45_bf11);

/// Standard client characteristic configuration descriptor
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x0000_2902_0000_1000_8000_0080_5f9b_34fb);
