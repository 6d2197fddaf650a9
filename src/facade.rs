//! Control facade: the narrow, thread-safe boundary an external process
//! (an HTTP/JSON layer, or a CLI) drives the bridge through.
//!
//! Plain async methods on a cloneable handle, backed by a command channel
//! into the supervisor task — no wire protocol lives in this crate.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bluer::Address;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::adapter::DiscoveredTreadmill;
use crate::codec::BeltState;
use crate::error::BridgeError;
use crate::supervisor::{BridgeState, BridgeSupervisor, SupervisorCommand};
use crate::telemetry::Telemetry;

/// Mirrors `adapter::serialize_address` for the optional case: `None` while
/// idle/scanning, `Some` once a treadmill address is known.
fn serialize_address_opt<S: serde::Serializer>(addr: &Option<Address>, s: S) -> Result<S::Ok, S::Error> {
    match addr {
        Some(a) => s.serialize_some(&a.to_string()),
        None => s.serialize_none(),
    }
}

/// A point-in-time view of the bridge, as returned by [`Facade::snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub state: BridgeState,
    #[serde(serialize_with = "serialize_address_opt")]
    pub address: Option<Address>,
    pub telemetry: Option<Telemetry>,
    /// `telemetry.belt_state` with `Unknown` resolved to `Running`/`Idle` by
    /// speed, for consumers that need a concrete state to act on. `None`
    /// whenever `telemetry` is.
    pub belt_state: Option<BeltState>,
    pub ftms_active: bool,
    /// Malformed frames dropped by the codec over the process lifetime.
    pub codec_errors: u64,
}

/// Thread-safe handle for driving the bridge supervisor.
#[derive(Clone)]
pub struct Facade {
    supervisor: Arc<BridgeSupervisor>,
    cmd_tx: mpsc::Sender<SupervisorCommand>,
}

/// How long a facade call waits for the supervisor to respond before
/// treating it as unreachable. The supervisor task only blocks on BLE I/O
/// it owns exclusively, so a hang here indicates the task has stalled.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

impl Facade {
    pub fn new(supervisor: Arc<BridgeSupervisor>, cmd_tx: mpsc::Sender<SupervisorCommand>) -> Self {
        Facade { supervisor, cmd_tx }
    }

    pub async fn snapshot(&self) -> Snapshot {
        let state = self.supervisor.state().await;
        let address = match &state {
            BridgeState::Connecting(a) | BridgeState::Connected(a) | BridgeState::Bridging(a) => Some(*a),
            _ => None,
        };
        let telemetry = if address.is_some() {
            Some(self.supervisor.telemetry().snapshot().await)
        } else {
            None
        };
        let belt_state = telemetry.as_ref().map(Telemetry::effective_belt_state);
        Snapshot {
            state,
            address,
            telemetry,
            belt_state,
            ftms_active: self.supervisor.ftms_active.load(Ordering::SeqCst),
            codec_errors: self.supervisor.telemetry().codec_error_count(),
        }
    }

    pub async fn scan_once(&self) -> Result<Vec<DiscoveredTreadmill>, BridgeError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.send(SupervisorCommand::ScanOnce(resp_tx)).await?;
        self.await_response(resp_rx).await?
    }

    pub async fn connect(&self, address: Address) -> Result<(), BridgeError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.send(SupervisorCommand::Connect(address, resp_tx)).await?;
        self.await_response(resp_rx).await?
    }

    pub async fn disconnect(&self) -> Result<(), BridgeError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.send(SupervisorCommand::Disconnect(resp_tx)).await?;
        self.await_response(resp_rx).await?
    }

    pub async fn bridge_start(&self) -> Result<(), BridgeError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.send(SupervisorCommand::BridgeStart(resp_tx)).await?;
        self.await_response(resp_rx).await?
    }

    pub async fn bridge_stop(&self) -> Result<(), BridgeError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.send(SupervisorCommand::BridgeStop(resp_tx)).await?;
        self.await_response(resp_rx).await?
    }

    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.send(SupervisorCommand::Shutdown(resp_tx)).await?;
        self.await_response(resp_rx).await?
    }

    async fn send(&self, cmd: SupervisorCommand) -> Result<(), BridgeError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| BridgeError::FacadeInvalidState("supervisor task is gone".to_string()))
    }

    async fn await_response<T>(&self, rx: oneshot::Receiver<T>) -> Result<T, BridgeError> {
        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(_)) => Err(BridgeError::FacadeInvalidState(
                "command superseded before it was handled".to_string(),
            )),
            Err(_) => Err(BridgeError::FacadeInvalidState(
                "supervisor did not respond in time".to_string(),
            )),
        }
    }
}
