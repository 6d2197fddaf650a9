//! Error taxonomy for the bridge.
//!
//! One variant per recoverable kind in the design's error table. The
//! supervisor matches on these to decide whether a failure is fatal
//! (propagate to shutdown) or local (absorbed with a state transition).

use bluer::Address;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("BLE adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("permission denied accessing BLE adapter: {0}")]
    PermissionDenied(String),

    #[error("adapter cannot run central and peripheral roles simultaneously")]
    RoleConflict,

    #[error("no matching treadmill found during scan")]
    ScanEmpty,

    #[error("failed to connect to {address}: {reason}")]
    ConnectFail { address: Address, reason: String },

    #[error("treadmill at {0} does not expose the expected GATT service/characteristics")]
    ProtocolMismatch(Address),

    #[error("no stats reply received within the watchdog window")]
    LinkStale,

    #[error("treadmill link lost: {0}")]
    LinkLost(String),

    #[error("malformed frame dropped by codec")]
    CodecError,

    #[error("facade operation invalid in current state: {0}")]
    FacadeInvalidState(String),

    #[error(transparent)]
    Transport(#[from] bluer::Error),
}

impl BridgeError {
    /// Whether this kind is fatal to the whole supervisor (propagates to
    /// shutdown) rather than being absorbed locally with a retry/transition.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::AdapterUnavailable(_) | BridgeError::PermissionDenied(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_adapter_init_failures_are_fatal() {
        assert!(BridgeError::AdapterUnavailable("x".into()).is_fatal());
        assert!(BridgeError::PermissionDenied("x".into()).is_fatal());
        assert!(!BridgeError::RoleConflict.is_fatal());
        assert!(!BridgeError::ScanEmpty.is_fatal());
        assert!(!BridgeError::LinkStale.is_fatal());
        assert!(!BridgeError::CodecError.is_fatal());
    }
}
