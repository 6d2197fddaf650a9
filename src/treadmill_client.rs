//! Treadmill GATT client.
//!
//! Drives a single already-connected `CentralSession`: polls the vendor
//! write characteristic at `stats_interval`, decodes notifications off the
//! vendor notify characteristic, updates shared telemetry, and watches for
//! a stale link via a single `tokio::select!` loop combining the
//! notification stream, the poll timer, and the watchdog timer, since the
//! Kingsmith protocol is poll/response rather than push-only.

use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::oneshot;

use crate::adapter::CentralSession;
use crate::codec::{self, DecodedFrame};
use crate::error::BridgeError;
use crate::telemetry::TelemetryCell;

/// Why a bridging session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// `stop_rx` fired — a clean, caller-requested stop.
    Stopped,
    /// No `StatsReply` arrived within the watchdog window.
    Stale,
    /// The notification stream ended (device disconnected).
    Lost,
}

/// Run the poll/notify/watchdog loop until told to stop or the link drops.
/// `telemetry` is reset by the caller before this is invoked (on entering
/// a fresh `Connecting` episode), not by this function.
pub async fn run(
    session: &mut dyn CentralSession,
    telemetry: &TelemetryCell,
    stats_interval: Duration,
    watchdog_timeout: Duration,
    mut stop_rx: oneshot::Receiver<()>,
) -> Result<SessionEnd, BridgeError> {
    let mut notify_rx = session.subscribe_stats().await?;

    let mut poll_ticker = tokio::time::interval(stats_interval);
    let mut watchdog = Box::pin(tokio::time::sleep(watchdog_timeout));

    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                info!("treadmill client stopping on request");
                return Ok(SessionEnd::Stopped);
            }
            _ = poll_ticker.tick() => {
                if let Err(e) = session.write_command(&codec::encode_ask_stats()).await {
                    warn!("poll write failed: {}", e);
                    return Ok(SessionEnd::Lost);
                }
            }
            _ = &mut watchdog => {
                warn!("{}", BridgeError::LinkStale);
                return Ok(SessionEnd::Stale);
            }
            frame = notify_rx.recv() => {
                match frame {
                    Some(bytes) => {
                        match codec::decode_frame(&bytes) {
                            DecodedFrame::StatsReply(reply) => {
                                debug!("stats reply: {:?}", reply);
                                telemetry.apply_stats_reply(reply).await;
                                watchdog.as_mut().reset(tokio::time::Instant::now() + watchdog_timeout);
                            }
                            DecodedFrame::ControlReply { .. } => {}
                            DecodedFrame::Unknown => {
                                telemetry.record_codec_error();
                                debug!("{}", BridgeError::CodecError);
                            }
                        }
                    }
                    None => {
                        info!("notification stream ended");
                        return Ok(SessionEnd::Lost);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BeltState;
    use async_trait::async_trait;
    use bluer::Address;
    use tokio::sync::mpsc;

    struct FakeSession {
        address: Address,
        notify_rx: Option<mpsc::Receiver<Vec<u8>>>,
        writes: std::sync::Arc<std::sync::Mutex<u32>>,
    }

    #[async_trait]
    impl CentralSession for FakeSession {
        fn address(&self) -> Address {
            self.address
        }

        async fn write_command(&self, _bytes: &[u8]) -> Result<(), BridgeError> {
            *self.writes.lock().unwrap() += 1;
            Ok(())
        }

        async fn subscribe_stats(&mut self) -> Result<mpsc::Receiver<Vec<u8>>, BridgeError> {
            Ok(self.notify_rx.take().expect("subscribe_stats called twice"))
        }

        async fn disconnect(&self) -> Result<(), BridgeError> {
            Ok(())
        }
    }

    fn stats_frame(belt: u8, speed: u8, distance: u16, elapsed: u16) -> Vec<u8> {
        let distance_bytes = distance.to_le_bytes();
        let elapsed_bytes = elapsed.to_le_bytes();
        let payload = [belt, speed, distance_bytes[0], distance_bytes[1], elapsed_bytes[0], elapsed_bytes[1]];
        let mut frame = vec![0xF7, codec::OPCODE_STATS_REPLY];
        frame.extend_from_slice(&payload);
        let cksum = payload.iter().fold(codec::OPCODE_STATS_REPLY, |a, &b| a.wrapping_add(b));
        frame.push(cksum);
        frame.push(0xFD);
        frame
    }

    #[tokio::test]
    async fn test_stop_signal_ends_session_cleanly() {
        let (_notify_tx, notify_rx) = mpsc::channel(4);
        let mut session = FakeSession {
            address: Address::from([0u8; 6]),
            notify_rx: Some(notify_rx),
            writes: std::sync::Arc::new(std::sync::Mutex::new(0)),
        };
        let (stop_tx, stop_rx) = oneshot::channel();
        let telemetry = TelemetryCell::new();

        stop_tx.send(()).unwrap();
        let result = run(
            &mut session,
            &telemetry,
            Duration::from_millis(50),
            Duration::from_secs(10),
            stop_rx,
        )
        .await
        .unwrap();
        assert!(matches!(result, SessionEnd::Stopped));
    }

    #[tokio::test]
    async fn test_stats_reply_updates_telemetry() {
        let (notify_tx, notify_rx) = mpsc::channel(4);
        let mut session = FakeSession {
            address: Address::from([0u8; 6]),
            notify_rx: Some(notify_rx),
            writes: std::sync::Arc::new(std::sync::Mutex::new(0)),
        };
        let (stop_tx, stop_rx) = oneshot::channel();
        let telemetry = TelemetryCell::new();

        notify_tx.send(stats_frame(1, 50, 10, 60)).await.unwrap();

        let telemetry_clone = telemetry.clone();
        let handle = tokio::spawn(async move {
            run(
                &mut session,
                &telemetry_clone,
                Duration::from_millis(20),
                Duration::from_secs(10),
                stop_rx,
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(()).unwrap();
        let result = handle.await.unwrap().unwrap();
        assert!(matches!(result, SessionEnd::Stopped));

        let snap = telemetry.snapshot().await;
        assert_eq!(snap.belt_state, BeltState::Running);
        assert_eq!(snap.distance_m, 100);
        assert_eq!(snap.elapsed_s, 60);
    }

    #[tokio::test]
    async fn test_watchdog_fires_when_no_replies_arrive() {
        let (_notify_tx, notify_rx) = mpsc::channel(4);
        let mut session = FakeSession {
            address: Address::from([0u8; 6]),
            notify_rx: Some(notify_rx),
            writes: std::sync::Arc::new(std::sync::Mutex::new(0)),
        };
        let (_stop_tx, stop_rx) = oneshot::channel();
        let telemetry = TelemetryCell::new();

        let result = run(
            &mut session,
            &telemetry,
            Duration::from_millis(20),
            Duration::from_millis(60),
            stop_rx,
        )
        .await
        .unwrap();
        assert!(matches!(result, SessionEnd::Stale));
    }

    #[tokio::test]
    async fn test_notify_stream_end_is_lost() {
        let (notify_tx, notify_rx) = mpsc::channel(4);
        let mut session = FakeSession {
            address: Address::from([0u8; 6]),
            notify_rx: Some(notify_rx),
            writes: std::sync::Arc::new(std::sync::Mutex::new(0)),
        };
        let (_stop_tx, stop_rx) = oneshot::channel();
        let telemetry = TelemetryCell::new();

        drop(notify_tx);
        let result = run(
            &mut session,
            &telemetry,
            Duration::from_millis(20),
            Duration::from_secs(10),
            stop_rx,
        )
        .await
        .unwrap();
        assert!(matches!(result, SessionEnd::Lost));
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_reset_watchdog_or_panic() {
        let (notify_tx, notify_rx) = mpsc::channel(4);
        let mut session = FakeSession {
            address: Address::from([0u8; 6]),
            notify_rx: Some(notify_rx),
            writes: std::sync::Arc::new(std::sync::Mutex::new(0)),
        };
        let (_stop_tx, stop_rx) = oneshot::channel();
        let telemetry = TelemetryCell::new();

        for _ in 0..5 {
            notify_tx.send(vec![0xAA; 16]).await.unwrap();
        }

        let result = run(
            &mut session,
            &telemetry,
            Duration::from_millis(10),
            Duration::from_millis(60),
            stop_rx,
        )
        .await
        .unwrap();
        assert!(matches!(result, SessionEnd::Stale));
        let snap = telemetry.snapshot().await;
        assert_eq!(snap.belt_state, BeltState::Unknown);
        assert_eq!(telemetry.codec_error_count(), 5);
    }
}
