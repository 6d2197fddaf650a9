//! Bridge configuration.
//!
//! A plain, immutable-after-construction struct passed in by the caller.
//! This crate does no disk I/O itself — loading config from a file,
//! environment, or CLI flags is the embedding process's job.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Construction-time configuration for the bridge supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Which local BLE adapter to use; `None` selects the system default.
    pub ble_adapter: Option<String>,
    /// Advertised local name for the FTMS peripheral.
    pub ftms_device_name: String,
    /// How long to wait between scan attempts while idle-scanning.
    pub scan_interval_s: f64,
    /// Cadence for both the treadmill poll timer and the FTMS notify timer.
    pub stats_interval_ms: u32,
    /// Whether entering `Connected` should automatically advance to `Bridging`.
    pub auto_start_bridge: bool,
    /// Whether the supervisor drives its own scan/connect loop, or waits
    /// for explicit facade commands.
    pub auto_mode: bool,
}

impl BridgeConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms as u64)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs_f64(self.scan_interval_s)
    }

    /// `max(3 * stats_interval_ms, 3000ms)`, per the poll watchdog rule.
    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis((self.stats_interval_ms as u64 * 3).max(3000))
    }

    /// `scan_interval_s * 4`: how long an address that failed protocol
    /// discovery (`ProtocolMismatch`) is excluded from reconnection.
    pub fn protocol_mismatch_cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.scan_interval_s * 4.0)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            ble_adapter: None,
            ftms_device_name: "WalkingPad Bridge".to_string(),
            scan_interval_s: 5.0,
            stats_interval_ms: 750,
            auto_start_bridge: true,
            auto_mode: true,
        }
    }
}
