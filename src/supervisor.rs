//! Bridge supervisor: the top-level state machine.
//!
//! Owns the one contended resource (the BLE adapter) for the process
//! lifetime, coordinating scan → connect → bridge → reconnect as an
//! explicit state machine over a single `tokio::select!` loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bluer::Address;
use log::{error, info, warn};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;

use crate::adapter::{AdvertiseHandle, BleAdapter, DiscoveredTreadmill};
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::ftms_server;
use crate::telemetry::TelemetryCell;
use crate::treadmill_client::{self, SessionEnd};

/// Why the supervisor is currently sitting in `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConnectFail,
    LinkLost,
    /// A connect attempt reached the device but it didn't expose the
    /// expected Kingsmith service/characteristics. Distinct from
    /// `ConnectFail` because recovery isn't an exponential backoff on the
    /// same address — it's an immediate re-scan with that address quarantined.
    ProtocolMismatch,
}

/// The bridge's top-level state.
#[derive(Debug, Clone)]
pub enum BridgeState {
    Idle,
    Scanning,
    Connecting(Address),
    Connected(Address),
    Bridging(Address),
    Error(ErrorKind, Instant),
}

/// Hand-rolled rather than derived: `Address` has no `serde` impl (see
/// `adapter::serialize_address`) and `Instant` isn't meaningfully
/// serializable at all, so the `Error` variant's retry deadline is simply
/// omitted from the wire representation.
impl serde::Serialize for BridgeState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(None)?;
        match self {
            BridgeState::Idle => map.serialize_entry("state", "idle")?,
            BridgeState::Scanning => map.serialize_entry("state", "scanning")?,
            BridgeState::Connecting(addr) => {
                map.serialize_entry("state", "connecting")?;
                map.serialize_entry("address", &addr.to_string())?;
            }
            BridgeState::Connected(addr) => {
                map.serialize_entry("state", "connected")?;
                map.serialize_entry("address", &addr.to_string())?;
            }
            BridgeState::Bridging(addr) => {
                map.serialize_entry("state", "bridging")?;
                map.serialize_entry("address", &addr.to_string())?;
            }
            BridgeState::Error(kind, _) => {
                map.serialize_entry("state", "error")?;
                let kind_str = match kind {
                    ErrorKind::ConnectFail => "connect_fail",
                    ErrorKind::LinkLost => "link_lost",
                    ErrorKind::ProtocolMismatch => "protocol_mismatch",
                };
                map.serialize_entry("kind", kind_str)?;
            }
        }
        map.end()
    }
}

impl PartialEq for BridgeState {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (BridgeState::Idle, BridgeState::Idle) => true,
            (BridgeState::Scanning, BridgeState::Scanning) => true,
            (BridgeState::Connecting(a), BridgeState::Connecting(b)) => a == b,
            (BridgeState::Connected(a), BridgeState::Connected(b)) => a == b,
            (BridgeState::Bridging(a), BridgeState::Bridging(b)) => a == b,
            (BridgeState::Error(a, _), BridgeState::Error(b, _)) => a == b,
            _ => false,
        }
    }
}

/// Why an in-progress `Bridging` session's stop signal was raised, so the
/// post-loop match can land in the state the triggering command actually
/// asked for instead of assuming "stopped" always means "back to Connected".
#[derive(Debug, Clone, Copy)]
enum StopReason {
    BridgeStop,
    Disconnect,
    Shutdown,
    Reconnect(Address),
}

/// `min(30s, 1s * 2^n)`.
fn reconnect_backoff(n: u32) -> Duration {
    let capped_shift = n.min(5); // 2^5 = 32 already exceeds the 30s cap
    Duration::from_secs(1u64.saturating_mul(1 << capped_shift)).min(Duration::from_secs(30))
}

/// Commands accepted from the facade. Each carries a response channel so
/// the caller can await the outcome.
pub enum SupervisorCommand {
    ScanOnce(oneshot::Sender<Result<Vec<DiscoveredTreadmill>, BridgeError>>),
    Connect(Address, oneshot::Sender<Result<(), BridgeError>>),
    Disconnect(oneshot::Sender<Result<(), BridgeError>>),
    BridgeStart(oneshot::Sender<Result<(), BridgeError>>),
    BridgeStop(oneshot::Sender<Result<(), BridgeError>>),
    Shutdown(oneshot::Sender<Result<(), BridgeError>>),
}

pub struct BridgeSupervisor {
    config: BridgeConfig,
    adapter: Arc<dyn BleAdapter>,
    pub(crate) state: Mutex<BridgeState>,
    pub(crate) telemetry: TelemetryCell,
    pub(crate) ftms_active: Arc<AtomicBool>,
    session: Mutex<Option<Box<dyn crate::adapter::CentralSession>>>,
    /// Addresses that failed protocol discovery, mapped to the instant
    /// their cooldown expires. Checked before (re)entering `Connecting`.
    quarantine: Mutex<HashMap<Address, Instant>>,
}

impl BridgeSupervisor {
    pub fn new(config: BridgeConfig, adapter: Arc<dyn BleAdapter>) -> (Arc<Self>, mpsc::Sender<SupervisorCommand>) {
        let (tx, rx) = mpsc::channel(8);
        let supervisor = Arc::new(BridgeSupervisor {
            config,
            adapter,
            state: Mutex::new(BridgeState::Idle),
            telemetry: TelemetryCell::new(),
            ftms_active: Arc::new(AtomicBool::new(false)),
            session: Mutex::new(None),
            quarantine: Mutex::new(HashMap::new()),
        });
        let task_supervisor = supervisor.clone();
        tokio::spawn(async move {
            task_supervisor.run(rx).await;
        });
        (supervisor, tx)
    }

    pub async fn state(&self) -> BridgeState {
        self.state.lock().await.clone()
    }

    pub fn telemetry(&self) -> TelemetryCell {
        self.telemetry.clone()
    }

    async fn set_state(&self, s: BridgeState) {
        info!("state -> {:?}", s);
        *self.state.lock().await = s;
    }

    /// Transitions into `Connecting(addr)`, clearing stale telemetry from
    /// whatever connection episode preceded it. This is the only place that
    /// should ever reset telemetry — every path into `Connecting` routes
    /// through here so a new episode never inherits an old one's readings.
    async fn enter_connecting(&self, addr: Address) {
        self.telemetry.reset().await;
        self.set_state(BridgeState::Connecting(addr)).await;
    }

    async fn quarantine_address(&self, address: Address, cooldown: Duration) {
        let until = Instant::now() + cooldown;
        self.quarantine.lock().await.insert(address, until);
    }

    /// `true` if `address` is still within its protocol-mismatch cooldown.
    /// Opportunistically evicts an expired entry when found.
    async fn is_quarantined(&self, address: &Address) -> bool {
        let mut quarantine = self.quarantine.lock().await;
        match quarantine.get(address) {
            Some(&until) if until > Instant::now() => true,
            Some(_) => {
                quarantine.remove(address);
                false
            }
            None => false,
        }
    }

    async fn run(self: Arc<Self>, mut cmd_rx: mpsc::Receiver<SupervisorCommand>) {
        let mut backoff_n: u32 = 0;

        loop {
            let state = self.state().await;
            match state {
                BridgeState::Idle => {
                    if self.config.auto_mode {
                        self.set_state(BridgeState::Scanning).await;
                        continue;
                    }
                    match cmd_rx.recv().await {
                        Some(cmd) => {
                            if self.handle_idle_command(cmd).await {
                                return;
                            }
                        }
                        None => return,
                    }
                }

                BridgeState::Scanning => {
                    tokio::select! {
                        cmd = cmd_rx.recv() => {
                            match cmd {
                                Some(cmd) => { if self.handle_idle_command(cmd).await { return; } }
                                None => return,
                            }
                        }
                        result = self.adapter.scan(self.config.scan_interval()) => {
                            match result {
                                Ok(devices) => {
                                    let mut candidate = None;
                                    for device in devices {
                                        if !self.is_quarantined(&device.address).await {
                                            candidate = Some(device.address);
                                            break;
                                        }
                                    }
                                    match candidate {
                                        Some(addr) => self.enter_connecting(addr).await,
                                        None => {
                                            // ScanEmpty, or every match is quarantined: loop with scan_interval_s.
                                        }
                                    }
                                }
                                Err(e) => warn!("scan failed: {}", e),
                            }
                        }
                    }
                }

                BridgeState::Connecting(addr) => {
                    match self.adapter.connect(addr).await {
                        Ok(session) => {
                            *self.session.lock().await = Some(session);
                            backoff_n = 0;
                            self.set_state(BridgeState::Connected(addr)).await;
                        }
                        Err(BridgeError::ProtocolMismatch(mismatched_addr)) => {
                            warn!(
                                "{}; quarantining for {:?}",
                                BridgeError::ProtocolMismatch(mismatched_addr),
                                self.config.protocol_mismatch_cooldown()
                            );
                            self.quarantine_address(mismatched_addr, self.config.protocol_mismatch_cooldown())
                                .await;
                            self.set_state(BridgeState::Error(ErrorKind::ProtocolMismatch, Instant::now()))
                                .await;
                        }
                        Err(e) => {
                            warn!("connect to {} failed: {}", addr, e);
                            backoff_n += 1;
                            let backoff = reconnect_backoff(backoff_n);
                            self.set_state(BridgeState::Error(ErrorKind::ConnectFail, Instant::now() + backoff))
                                .await;
                        }
                    }
                }

                BridgeState::Connected(addr) => {
                    if self.config.auto_start_bridge {
                        if self.enter_bridging(addr, &mut cmd_rx, &mut backoff_n).await {
                            return;
                        }
                        continue;
                    }
                    match cmd_rx.recv().await {
                        Some(cmd) => {
                            if self
                                .handle_connected_command(cmd, addr, &mut cmd_rx, &mut backoff_n)
                                .await
                            {
                                return;
                            }
                        }
                        None => return,
                    }
                }

                BridgeState::Bridging(_) => {
                    // Reached only if state was set to Bridging outside enter_bridging
                    // (shouldn't happen); fall back to Connected semantics.
                    unreachable!("Bridging is only entered and driven from within enter_bridging");
                }

                BridgeState::Error(_, retry_at) => {
                    let now = Instant::now();
                    if retry_at > now {
                        tokio::select! {
                            cmd = cmd_rx.recv() => {
                                match cmd {
                                    Some(cmd) => { if self.handle_idle_command(cmd).await { return; } }
                                    None => return,
                                }
                            }
                            _ = tokio::time::sleep(retry_at - now) => {
                                self.set_state(BridgeState::Scanning).await;
                            }
                        }
                    } else {
                        self.set_state(BridgeState::Scanning).await;
                    }
                }
            }
        }
    }

    /// Handles a command while in `Idle`/`Scanning`/`Error` — states where
    /// no treadmill session exists yet. Returns `true` if the supervisor
    /// should shut down.
    async fn handle_idle_command(&self, cmd: SupervisorCommand) -> bool {
        match cmd {
            SupervisorCommand::ScanOnce(resp) => {
                let result = self.adapter.scan(self.config.scan_interval()).await;
                let _ = resp.send(result);
                false
            }
            SupervisorCommand::Connect(addr, resp) => {
                self.enter_connecting(addr).await;
                let _ = resp.send(Ok(()));
                false
            }
            SupervisorCommand::Disconnect(resp) => {
                self.set_state(BridgeState::Idle).await;
                let _ = resp.send(Ok(()));
                false
            }
            SupervisorCommand::BridgeStart(resp) => {
                let _ = resp.send(Err(BridgeError::FacadeInvalidState(
                    "bridge_start requires a connected treadmill".to_string(),
                )));
                false
            }
            SupervisorCommand::BridgeStop(resp) => {
                // Idempotent: already not bridging.
                let _ = resp.send(Ok(()));
                false
            }
            SupervisorCommand::Shutdown(resp) => {
                self.set_state(BridgeState::Idle).await;
                let _ = resp.send(Ok(()));
                true
            }
        }
    }

    /// Handles a command while `Connected(addr)` (bridging not yet
    /// started). Returns `true` if the supervisor should shut down.
    async fn handle_connected_command(
        &self,
        cmd: SupervisorCommand,
        addr: Address,
        cmd_rx: &mut mpsc::Receiver<SupervisorCommand>,
        backoff_n: &mut u32,
    ) -> bool {
        match cmd {
            SupervisorCommand::ScanOnce(resp) => {
                let result = self.adapter.scan(self.config.scan_interval()).await;
                let _ = resp.send(result);
                false
            }
            SupervisorCommand::Connect(new_addr, resp) => {
                self.teardown_session().await;
                self.enter_connecting(new_addr).await;
                let _ = resp.send(Ok(()));
                false
            }
            SupervisorCommand::Disconnect(resp) => {
                self.teardown_session().await;
                self.set_state(BridgeState::Idle).await;
                let _ = resp.send(Ok(()));
                false
            }
            SupervisorCommand::BridgeStart(resp) => {
                let _ = resp.send(Ok(()));
                self.enter_bridging(addr, cmd_rx, backoff_n).await
            }
            SupervisorCommand::BridgeStop(resp) => {
                // Idempotent: already not bridging.
                let _ = resp.send(Ok(()));
                false
            }
            SupervisorCommand::Shutdown(resp) => {
                self.teardown_session().await;
                self.set_state(BridgeState::Idle).await;
                let _ = resp.send(Ok(()));
                true
            }
        }
    }

    /// Starts the FTMS peripheral and the treadmill poll/notify loop, then
    /// processes commands until the session ends (stop requested, link
    /// stale/lost, or shutdown), leaving the supervisor in `Connected`,
    /// `Connecting`, `Error`, or `Idle` as appropriate. Returns `true` if the
    /// caller (the main `run` loop) should stop driving the state machine
    /// entirely, i.e. a `Shutdown` was processed or the command channel
    /// closed.
    async fn enter_bridging(
        &self,
        addr: Address,
        cmd_rx: &mut mpsc::Receiver<SupervisorCommand>,
        backoff_n: &mut u32,
    ) -> bool {
        self.set_state(BridgeState::Bridging(addr)).await;

        let ftms_handle: Box<dyn AdvertiseHandle> = match ftms_server::run(
            self.adapter.as_ref(),
            self.config.ftms_device_name.clone(),
            self.telemetry.clone(),
            self.config.stats_interval(),
        )
        .await
        {
            Ok(h) => h,
            Err(e) => {
                error!("failed to start FTMS peripheral: {}", e);
                self.set_state(BridgeState::Connected(addr)).await;
                return false;
            }
        };
        self.ftms_active.store(true, Ordering::SeqCst);

        let (stop_tx, stop_rx) = oneshot::channel();
        let mut stop_tx = Some(stop_tx);
        let mut stop_reason: Option<StopReason> = None;

        let mut session_guard = self.session.lock().await;
        let session = match session_guard.as_deref_mut() {
            Some(s) => s,
            None => {
                drop(session_guard);
                self.ftms_active.store(false, Ordering::SeqCst);
                drop(ftms_handle);
                self.set_state(BridgeState::Idle).await;
                return false;
            }
        };

        let client_fut = treadmill_client::run(
            session,
            &self.telemetry,
            self.config.stats_interval(),
            self.config.watchdog_timeout(),
            stop_rx,
        );
        tokio::pin!(client_fut);

        let outcome = loop {
            tokio::select! {
                res = &mut client_fut => break res,
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SupervisorCommand::BridgeStop(resp)) => {
                            stop_reason = Some(StopReason::BridgeStop);
                            if let Some(tx) = stop_tx.take() { let _ = tx.send(()); }
                            let _ = resp.send(Ok(()));
                        }
                        Some(SupervisorCommand::Disconnect(resp)) => {
                            stop_reason = Some(StopReason::Disconnect);
                            if let Some(tx) = stop_tx.take() { let _ = tx.send(()); }
                            let _ = resp.send(Ok(()));
                        }
                        Some(SupervisorCommand::Shutdown(resp)) => {
                            stop_reason = Some(StopReason::Shutdown);
                            if let Some(tx) = stop_tx.take() { let _ = tx.send(()); }
                            let _ = resp.send(Ok(()));
                        }
                        Some(SupervisorCommand::Connect(new_addr, resp)) => {
                            stop_reason = Some(StopReason::Reconnect(new_addr));
                            if let Some(tx) = stop_tx.take() { let _ = tx.send(()); }
                            let _ = resp.send(Ok(()));
                        }
                        Some(SupervisorCommand::BridgeStart(resp)) => {
                            let _ = resp.send(Ok(())); // already bridging
                        }
                        Some(SupervisorCommand::ScanOnce(resp)) => {
                            let result = self.adapter.scan(self.config.scan_interval()).await;
                            let _ = resp.send(result);
                        }
                        None => {
                            stop_reason = Some(StopReason::Shutdown);
                            if let Some(tx) = stop_tx.take() { let _ = tx.send(()); }
                        }
                    }
                }
            }
        };

        ftms_handle.notify_stopped().await;
        drop(session_guard);
        self.ftms_active.store(false, Ordering::SeqCst);
        drop(ftms_handle);

        match outcome {
            Ok(SessionEnd::Stopped) => match stop_reason {
                None | Some(StopReason::BridgeStop) => {
                    self.set_state(BridgeState::Connected(addr)).await;
                    false
                }
                Some(StopReason::Disconnect) => {
                    self.teardown_session().await;
                    self.set_state(BridgeState::Idle).await;
                    false
                }
                Some(StopReason::Shutdown) => {
                    self.teardown_session().await;
                    self.set_state(BridgeState::Idle).await;
                    true
                }
                Some(StopReason::Reconnect(new_addr)) => {
                    self.teardown_session().await;
                    *backoff_n = 0;
                    self.enter_connecting(new_addr).await;
                    false
                }
            },
            Ok(SessionEnd::Stale) | Ok(SessionEnd::Lost) => {
                warn!("treadmill link lost for {}", addr);
                self.teardown_session().await;
                *backoff_n = 0;
                self.set_state(BridgeState::Error(ErrorKind::LinkLost, Instant::now())).await;
                false
            }
            Err(e) => {
                error!("treadmill client error: {}", e);
                self.teardown_session().await;
                self.set_state(BridgeState::Error(ErrorKind::LinkLost, Instant::now())).await;
                false
            }
        }
    }

    async fn teardown_session(&self) {
        if let Some(session) = self.session.lock().await.take() {
            let _ = session.disconnect().await;
        }
    }
}
