//! Shared treadmill telemetry.
//!
//! A plain struct behind a lock, updated by the treadmill client and read
//! by the FTMS notify pump and the facade. Reads vastly outnumber writes
//! (one writer per stats poll vs. two readers at their own cadences), so
//! this uses `RwLock` rather than a plain `Mutex`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::codec::{BeltState, StatsReply};

/// Current treadmill telemetry, monotonic within a connection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub belt_state: BeltState,
    pub speed_kmh: f64,
    pub distance_m: u32,
    pub elapsed_s: u16,
}

impl Default for Telemetry {
    fn default() -> Self {
        Telemetry {
            belt_state: BeltState::Unknown,
            speed_kmh: 0.0,
            distance_m: 0,
            elapsed_s: 0,
        }
    }
}

impl Telemetry {
    /// Resolves `BeltState::Unknown` into a concrete state for consumers
    /// that can't act on "unknown": running iff the treadmill is reporting
    /// forward motion, idle otherwise.
    pub fn effective_belt_state(&self) -> BeltState {
        match self.belt_state {
            BeltState::Unknown if self.speed_kmh > 0.0 => BeltState::Running,
            BeltState::Unknown => BeltState::Idle,
            other => other,
        }
    }
}

/// Shared, lock-guarded telemetry cell. Tracks, alongside the record
/// itself, whether any stats reply has ever been applied since the last
/// reset — the FTMS notify pump suppresses notifications until this is
/// true rather than publish a misleadingly-zeroed sample.
#[derive(Debug, Clone)]
pub struct TelemetryCell {
    inner: Arc<RwLock<Telemetry>>,
    has_sample: Arc<AtomicBool>,
    codec_errors: Arc<AtomicU64>,
}

impl TelemetryCell {
    pub fn new() -> Self {
        TelemetryCell {
            inner: Arc::new(RwLock::new(Telemetry::default())),
            has_sample: Arc::new(AtomicBool::new(false)),
            codec_errors: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Reset telemetry to its default, zeroed state. Called whenever the
    /// supervisor starts a fresh connection so distance/elapsed never leak
    /// across sessions.
    pub async fn reset(&self) {
        *self.inner.write().await = Telemetry::default();
        self.has_sample.store(false, Ordering::Release);
    }

    /// Take the latest snapshot for read-only consumers (FTMS notifier,
    /// facade).
    pub async fn snapshot(&self) -> Telemetry {
        *self.inner.read().await
    }

    /// Whether at least one stats reply has been applied since the last
    /// reset. Checked without awaiting the lock since it's only ever read
    /// on the FTMS notify pump's hot path.
    pub fn has_sample(&self) -> bool {
        self.has_sample.load(Ordering::Acquire)
    }

    /// Record a malformed/unrecognized frame dropped by the codec. Counts
    /// across the process lifetime, not per-connection — unlike telemetry
    /// itself, a dropped-frame tally surviving a reconnect is more useful
    /// than one that resets.
    pub fn record_codec_error(&self) {
        self.codec_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn codec_error_count(&self) -> u64 {
        self.codec_errors.load(Ordering::Relaxed)
    }

    /// Apply a freshly decoded stats reply, clamping distance/elapsed so
    /// they never move backwards within a session (BLE stacks occasionally
    /// redeliver or reorder notifications).
    pub async fn apply_stats_reply(&self, reply: StatsReply) {
        let mut guard = self.inner.write().await;
        guard.belt_state = reply.belt_state;
        guard.speed_kmh = reply.speed_kmh();
        guard.distance_m = guard.distance_m.max(reply.distance_m());
        guard.elapsed_s = guard.elapsed_s.max(reply.elapsed_s);
        self.has_sample.store(true, Ordering::Release);
    }
}

impl Default for TelemetryCell {
    fn default() -> Self {
        Self::new()
    }
}
