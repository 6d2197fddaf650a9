//! Kingsmith ↔ FTMS BLE bridge.
//!
//! Mediates between a Kingsmith/WalkingPad treadmill's proprietary BLE
//! GATT protocol (central role) and the Bluetooth SIG Fitness Machine
//! Service (peripheral role), republishing treadmill telemetry so any
//! FTMS-aware fitness app can subscribe to it.

pub mod adapter;
pub mod codec;
pub mod config;
pub mod error;
pub mod facade;
pub mod ftms_server;
pub mod supervisor;
pub mod telemetry;
pub mod treadmill_client;

pub use adapter::{BleAdapter, BluerAdapter};
pub use config::BridgeConfig;
pub use error::BridgeError;
pub use facade::{Facade, Snapshot};
pub use supervisor::{BridgeState, BridgeSupervisor};
