//! FTMS (Fitness Machine Service, 0x1826) peripheral encoding and server loop.
//!
//! Publishes Fitness Machine Feature (read-only capability bitmap),
//! Treadmill Data (notify at `stats_interval_ms`), and Fitness Machine
//! Status (notify "Started/Resumed" and "Stopped" around the bridge
//! lifecycle — `adapter::BluerAdvertiseHandle` owns the actual notifier).
//! Control Point, Training Status, and the Speed/Incline Range
//! characteristics are intentionally not published — this bridge is
//! read-only by design.

use std::time::Duration;

use futures::FutureExt;
use log::{debug, info, warn};

use crate::adapter::{BleAdapter, TreadmillDataNotifyFn};
use crate::error::BridgeError;
use crate::telemetry::TelemetryCell;

/// Fitness Machine Feature flags: bit 0 = Average Speed Supported, bit 2 =
/// Total Distance Supported, bit 14 = Elapsed Time Supported.
const FEATURE_AVERAGE_SPEED_SUPPORTED: u32 = 1 << 0;
const FEATURE_TOTAL_DISTANCE_SUPPORTED: u32 = 1 << 2;
const FEATURE_ELAPSED_TIME_SUPPORTED: u32 = 1 << 14;

/// Maximum value a 24-bit little-endian distance field can hold.
const DISTANCE_MAX: u32 = (1 << 24) - 1;

/// Encode the Fitness Machine Feature characteristic value: two little-
/// endian `u32` fields, feature flags then target setting flags (the
/// latter always zero — this bridge accepts no control writes).
pub fn encode_feature() -> [u8; 8] {
    let mut buf = [0u8; 8];
    let flags =
        FEATURE_AVERAGE_SPEED_SUPPORTED | FEATURE_TOTAL_DISTANCE_SUPPORTED | FEATURE_ELAPSED_TIME_SUPPORTED;
    buf[0..4].copy_from_slice(&flags.to_le_bytes());
    buf
}

/// Treadmill Data flag bits actually used here. Bit 0 cleared means
/// instantaneous speed is present (FTMS encodes presence inverted for this
/// particular bit); bit 2 = Total Distance present; bit 8 = Elapsed Time
/// present.
const TD_FLAG_INSTANT_SPEED_PRESENT: u16 = 0;
const TD_FLAG_TOTAL_DISTANCE_PRESENT: u16 = 1 << 2;
const TD_FLAG_ELAPSED_TIME_PRESENT: u16 = 1 << 8;

/// Encode one Treadmill Data notification: `[flags:u16][speed:u16 in
/// 0.01 km/h][distance:uint24 meters][elapsed:u16 seconds]`.
pub fn encode_treadmill_data(speed_kmh: f64, distance_m: u32, elapsed_s: u16) -> Vec<u8> {
    let flags = TD_FLAG_INSTANT_SPEED_PRESENT | TD_FLAG_TOTAL_DISTANCE_PRESENT | TD_FLAG_ELAPSED_TIME_PRESENT;
    let speed_hundredths = (speed_kmh * 100.0).round().clamp(0.0, u16::MAX as f64) as u16;
    let distance = distance_m.min(DISTANCE_MAX);
    let distance_bytes = distance.to_le_bytes(); // little-endian, take low 3 bytes

    let mut buf = Vec::with_capacity(9);
    buf.extend_from_slice(&flags.to_le_bytes());
    buf.extend_from_slice(&speed_hundredths.to_le_bytes());
    buf.extend_from_slice(&distance_bytes[0..3]);
    buf.extend_from_slice(&elapsed_s.to_le_bytes());
    buf
}

/// Start advertising and serving the FTMS GATT application, pumping
/// `telemetry` snapshots into the Treadmill Data characteristic at
/// `interval` while a client is subscribed.
pub async fn run(
    adapter: &dyn BleAdapter,
    local_name: String,
    telemetry: TelemetryCell,
    interval: Duration,
) -> Result<Box<dyn crate::adapter::AdvertiseHandle>, BridgeError> {
    let notify_fn: TreadmillDataNotifyFn = Box::new(move |notifier| {
        let telemetry = telemetry.clone();
        async move {
            tokio::spawn(async move {
                info!("treadmill data notify session started");
                let mut notifier = notifier;
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    if notifier.is_stopped() {
                        break;
                    }
                    // No treadmill frame has arrived yet this session — publishing
                    // a zeroed sample would misrepresent "no data" as "stopped".
                    if !telemetry.has_sample() {
                        continue;
                    }
                    let snap = telemetry.snapshot().await;
                    let data = encode_treadmill_data(snap.speed_kmh, snap.distance_m, snap.elapsed_s);
                    debug!("notifying {} bytes", data.len());
                    if let Err(e) = notifier.notify(data).await {
                        warn!("treadmill data notify error: {}", e);
                        break;
                    }
                }
                info!("treadmill data notify session ended");
            });
        }
        .boxed()
    });

    adapter.start_peripheral(local_name, notify_fn).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_feature_sets_expected_bits() {
        let data = encode_feature();
        let flags = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        assert_ne!(flags & FEATURE_TOTAL_DISTANCE_SUPPORTED, 0);
        assert_ne!(flags & FEATURE_ELAPSED_TIME_SUPPORTED, 0);
        // target setting flags (second u32) are always zero
        assert_eq!(&data[4..8], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_encode_treadmill_data_matches_spec_example() {
        let data = encode_treadmill_data(3.4, 1234, 567);
        assert_eq!(data, vec![0x04, 0x01, 0x54, 0x01, 0xD2, 0x04, 0x00, 0x37, 0x02]);
    }

    #[test]
    fn test_encode_treadmill_data_layout() {
        let data = encode_treadmill_data(12.5, 420, 600);
        assert_eq!(data.len(), 9);
        let speed = u16::from_le_bytes([data[2], data[3]]);
        assert_eq!(speed, 1250);
        let distance = u32::from_le_bytes([data[4], data[5], data[6], 0]);
        assert_eq!(distance, 420);
        let elapsed = u16::from_le_bytes([data[7], data[8]]);
        assert_eq!(elapsed, 600);
    }

    #[test]
    fn test_encode_treadmill_data_clamps_distance_at_24_bits() {
        let data = encode_treadmill_data(0.0, 1 << 24, 0);
        assert_eq!(&data[4..7], &[0xFF, 0xFF, 0xFF]);

        let data = encode_treadmill_data(0.0, u32::MAX, 0);
        let distance = u32::from_le_bytes([data[4], data[5], data[6], 0]);
        assert_eq!(distance, DISTANCE_MAX);
    }

    #[test]
    fn test_encode_treadmill_data_zero_speed() {
        let data = encode_treadmill_data(0.0, 0, 0);
        let speed = u16::from_le_bytes([data[2], data[3]]);
        assert_eq!(speed, 0);
    }

    #[test]
    fn test_encode_treadmill_data_rounds_fractional_speed() {
        // 5.004 km/h should round to 500 (5.00 km/h in hundredths), not truncate to 500.3->500
        let data = encode_treadmill_data(5.004, 0, 0);
        let speed = u16::from_le_bytes([data[2], data[3]]);
        assert_eq!(speed, 500);
    }
}
