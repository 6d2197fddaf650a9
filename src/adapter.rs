//! BLE adapter abstraction.
//!
//! Narrows the generic "Session/Characteristic" surface down to exactly
//! what this bridge needs: scan for and connect to one Kingsmith
//! treadmill, and advertise one FTMS peripheral. Defined as async traits
//! so the supervisor can be driven in tests by a fake implementation with
//! no real BlueZ adapter present, following the same ports-style split the
//! wider pack uses to keep domain logic testable without hardware.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bluer::gatt::local::{
    characteristic_control, Application, Characteristic, CharacteristicNotifier,
    CharacteristicNotify, CharacteristicNotifyMethod, CharacteristicRead,
};
use bluer::{
    adv::{Advertisement, Type as AdvertisementType},
    gatt::remote::Characteristic as RemoteCharacteristic,
    Adapter, AdapterEvent, Address,
};
use futures::{FutureExt, StreamExt};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::error::BridgeError;

/// `bluer::Address` has no `serde` impl of its own. We keep the typed
/// `Address` internally and only stringify it at the serialization
/// boundary.
pub(crate) fn serialize_address<S: serde::Serializer>(addr: &Address, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&addr.to_string())
}

// Bluetooth SIG base UUID: 0000XXXX-0000-1000-8000-00805f9b34fb
const fn ble_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb_u128)
}

/// Kingsmith vendor service, as reverse-engineered by the WalkingPad
/// community (not published by Bluetooth SIG).
pub const KINGSMITH_SERVICE_UUID: Uuid = ble_uuid(0xFE00);
/// Characteristic the bridge writes commands to.
pub const KINGSMITH_WRITE_UUID: Uuid = ble_uuid(0xFE01);
/// Characteristic the treadmill notifies stats replies on.
pub const KINGSMITH_NOTIFY_UUID: Uuid = ble_uuid(0xFE02);

/// Bluetooth SIG Fitness Machine Service.
pub const FTMS_SERVICE_UUID: Uuid = ble_uuid(0x1826);
/// Fitness Machine Feature.
pub const FEATURE_UUID: Uuid = ble_uuid(0x2ACC);
/// Treadmill Data.
pub const TREADMILL_DATA_UUID: Uuid = ble_uuid(0x2ACD);
/// Fitness Machine Status.
pub const MACHINE_STATUS_UUID: Uuid = ble_uuid(0x2ADA);

/// Advertised-name prefixes (case-insensitive) that identify a Kingsmith
/// treadmill when the vendor service UUID isn't in the advertisement.
const KINGSMITH_NAME_PREFIXES: [&str; 4] = ["walkingpad", "kingsmith", "k-pad", "ksm"];

/// A BLE peripheral discovered during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredTreadmill {
    #[serde(serialize_with = "serialize_address")]
    pub address: Address,
    pub name: String,
    pub rssi: i16,
}

/// A live connection to the treadmill's GATT server. Narrowed to exactly
/// the two characteristics this bridge touches.
#[async_trait]
pub trait CentralSession: Send + Sync {
    fn address(&self) -> Address;

    /// Write a command frame to the vendor write characteristic.
    async fn write_command(&self, bytes: &[u8]) -> Result<(), BridgeError>;

    /// Subscribe to the vendor notify characteristic, returning a channel
    /// that yields each notification's raw payload.
    async fn subscribe_stats(&mut self) -> Result<mpsc::Receiver<Vec<u8>>, BridgeError>;

    async fn disconnect(&self) -> Result<(), BridgeError>;
}

/// Handle to a live peripheral advertisement. Dropping it tears down the
/// advertisement; kept alive for as long as the bridge should be visible.
#[async_trait]
pub trait AdvertiseHandle: Send + Sync {
    /// Best-effort Fitness Machine Status notification that the machine has
    /// stopped. Only reaches a client currently subscribed to that
    /// characteristic — there is no durable delivery, matching §4.5's
    /// "tolerates zero or more simultaneous subscribers" policy.
    async fn notify_stopped(&self);
}

/// Abstraction over the BLE stack, covering both roles this bridge plays:
/// scanning/connecting as a central to the treadmill, and advertising/
/// serving GATT as a peripheral for FTMS clients.
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Scan for Kingsmith treadmills for up to `timeout`, returning
    /// whatever was found (possibly empty) when the timeout elapses.
    async fn scan(&self, timeout: Duration) -> Result<Vec<DiscoveredTreadmill>, BridgeError>;

    /// Connect to the treadmill at `address` and resolve its GATT
    /// services, returning a session for it.
    async fn connect(&self, address: Address) -> Result<Box<dyn CentralSession>, BridgeError>;

    /// Start advertising the FTMS peripheral. `notify_fn` is invoked by
    /// the BLE stack whenever a client subscribes to Treadmill Data; it
    /// should push encoded samples for the lifetime of that subscription.
    async fn start_peripheral(
        &self,
        local_name: String,
        notify_fn: TreadmillDataNotifyFn,
    ) -> Result<Box<dyn AdvertiseHandle>, BridgeError>;
}

/// Boxed closure matching `bluer`'s `CharacteristicNotifyMethod::Fun` shape:
/// invoked once per subscriber with a handle to push notifications on.
pub type TreadmillDataNotifyFn = Box<
    dyn Fn(bluer::gatt::local::CharacteristicNotifier) -> std::pin::Pin<Box<dyn futures::Future<Output = ()> + Send>>
        + Send
        + Sync,
>;

/// Real `bluer`/BlueZ-backed adapter.
pub struct BluerAdapter {
    adapter: Adapter,
}

impl BluerAdapter {
    /// Opens `adapter_name` if given, otherwise the stack's default adapter.
    pub async fn new(adapter_name: Option<&str>) -> Result<Self, BridgeError> {
        let session = bluer::Session::new().await.map_err(classify_init_error)?;
        let adapter = match adapter_name {
            Some(name) => session.adapter(name).map_err(classify_init_error)?,
            None => session.default_adapter().await.map_err(classify_init_error)?,
        };
        adapter.set_powered(true).await.map_err(classify_init_error)?;
        info!("using BLE adapter: {}", adapter.name());
        Ok(BluerAdapter { adapter })
    }
}

/// BlueZ/`bluer` has no dedicated error variant for "no permission to touch
/// the adapter" — it surfaces as a D-Bus error whose message names the
/// rejection. We sniff for that rather than treat every init failure as
/// the coarser `AdapterUnavailable`.
fn classify_init_error(e: bluer::Error) -> BridgeError {
    let msg = e.to_string();
    if is_permission_error(&msg) {
        BridgeError::PermissionDenied(msg)
    } else {
        BridgeError::AdapterUnavailable(msg)
    }
}

/// Same idea for `start_peripheral`: distinguishes a permission rejection
/// and a role conflict (stack already occupies the other BLE role) from a
/// generic transport failure.
fn classify_peripheral_error(e: bluer::Error) -> BridgeError {
    let msg = e.to_string();
    let lower = msg.to_lowercase();
    if is_permission_error(&msg) {
        BridgeError::PermissionDenied(msg)
    } else if lower.contains("already") || lower.contains("in progress") || lower.contains("busy") {
        BridgeError::RoleConflict
    } else {
        BridgeError::Transport(e)
    }
}

fn is_permission_error(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    lower.contains("permission") || lower.contains("not authorized") || lower.contains("not permitted")
}

#[async_trait]
impl BleAdapter for BluerAdapter {
    async fn scan(&self, timeout: Duration) -> Result<Vec<DiscoveredTreadmill>, BridgeError> {
        let discover = self.adapter.discover_devices().await?;
        let mut discover = Box::pin(discover);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut found = Vec::new();
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = discover.next() => {
                    match event {
                        Some(AdapterEvent::DeviceAdded(addr)) => {
                            if let Ok(device) = self.adapter.device(addr) {
                                if is_kingsmith_device(&device).await {
                                    let name = device.name().await.ok().flatten()
                                        .unwrap_or_else(|| "Unknown".to_string());
                                    let rssi = device.rssi().await.ok().flatten().unwrap_or(0);
                                    debug!("found candidate treadmill {} ({}) rssi={}", name, addr, rssi);
                                    found.push(DiscoveredTreadmill { address: addr, name, rssi });
                                }
                            }
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        }
        Ok(found)
    }

    async fn connect(&self, address: Address) -> Result<Box<dyn CentralSession>, BridgeError> {
        let device = self.adapter.device(address)?;
        if !device.is_connected().await.unwrap_or(false) {
            device
                .connect()
                .await
                .map_err(|e| BridgeError::ConnectFail { address, reason: e.to_string() })?;
        }

        for _ in 0..20 {
            if device.is_services_resolved().await.unwrap_or(false) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        let write_char = find_characteristic(&device, KINGSMITH_SERVICE_UUID, KINGSMITH_WRITE_UUID)
            .await
            .ok_or(BridgeError::ProtocolMismatch(address))?;
        let notify_char = find_characteristic(&device, KINGSMITH_SERVICE_UUID, KINGSMITH_NOTIFY_UUID)
            .await
            .ok_or(BridgeError::ProtocolMismatch(address))?;

        Ok(Box::new(BluerCentralSession {
            address,
            write_char,
            notify_char,
        }))
    }

    async fn start_peripheral(
        &self,
        local_name: String,
        notify_fn: TreadmillDataNotifyFn,
    ) -> Result<Box<dyn AdvertiseHandle>, BridgeError> {
        let adv = Advertisement {
            advertisement_type: AdvertisementType::Peripheral,
            service_uuids: vec![FTMS_SERVICE_UUID].into_iter().collect(),
            local_name: Some(local_name),
            discoverable: Some(true),
            ..Default::default()
        };
        let adv_handle = self.adapter.advertise(adv).await.map_err(classify_peripheral_error)?;

        let status_notifier: Arc<Mutex<Option<CharacteristicNotifier>>> = Arc::new(Mutex::new(None));
        let sn_for_notify = status_notifier.clone();
        let machine_status_notify_fn: TreadmillDataNotifyFn = Box::new(move |notifier| {
            let sn = sn_for_notify.clone();
            async move {
                info!("machine status notify session started");
                let mut notifier = notifier;
                // A subscriber attaching while already Bridging is the only
                // time "Started or Resumed" (0x04) can actually reach it —
                // FTMS has no durable delivery for subscribers who missed it.
                let _ = notifier.notify(vec![0x04]).await;
                *sn.lock().await = Some(notifier);
            }
            .boxed()
        });

        let (_cp_control, cp_handle) = characteristic_control();
        let app = Application {
            services: vec![bluer::gatt::local::Service {
                uuid: FTMS_SERVICE_UUID,
                primary: true,
                characteristics: vec![
                    Characteristic {
                        uuid: FEATURE_UUID,
                        read: Some(CharacteristicRead {
                            read: true,
                            fun: Box::new(|_req| {
                                async move { Ok(crate::ftms_server::encode_feature().to_vec()) }
                                    .boxed()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    Characteristic {
                        uuid: TREADMILL_DATA_UUID,
                        notify: Some(CharacteristicNotify {
                            notify: true,
                            method: CharacteristicNotifyMethod::Fun(notify_fn),
                            ..Default::default()
                        }),
                        control_handle: cp_handle,
                        ..Default::default()
                    },
                    Characteristic {
                        uuid: MACHINE_STATUS_UUID,
                        read: Some(CharacteristicRead {
                            read: true,
                            fun: Box::new(|_req| async move { Ok(vec![0x02, 0x01]) }.boxed()),
                            ..Default::default()
                        }),
                        notify: Some(CharacteristicNotify {
                            notify: true,
                            method: CharacteristicNotifyMethod::Fun(machine_status_notify_fn),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }],
            ..Default::default()
        };
        let app_handle = self
            .adapter
            .serve_gatt_application(app)
            .await
            .map_err(classify_peripheral_error)?;

        Ok(Box::new(BluerAdvertiseHandle {
            _adv: adv_handle,
            _app: app_handle,
            status_notifier,
        }))
    }
}

struct BluerAdvertiseHandle {
    _adv: bluer::adv::AdvertisementHandle,
    _app: bluer::gatt::local::ApplicationHandle,
    status_notifier: Arc<Mutex<Option<CharacteristicNotifier>>>,
}

#[async_trait]
impl AdvertiseHandle for BluerAdvertiseHandle {
    async fn notify_stopped(&self) {
        let mut guard = self.status_notifier.lock().await;
        if let Some(notifier) = guard.as_mut() {
            // Stopped by User (0x02), param 0x01 = stop.
            let _ = notifier.notify(vec![0x02, 0x01]).await;
        }
    }
}

struct BluerCentralSession {
    address: Address,
    write_char: RemoteCharacteristic,
    notify_char: RemoteCharacteristic,
}

#[async_trait]
impl CentralSession for BluerCentralSession {
    fn address(&self) -> Address {
        self.address
    }

    async fn write_command(&self, bytes: &[u8]) -> Result<(), BridgeError> {
        self.write_char
            .write(bytes)
            .await
            .map_err(|e| BridgeError::LinkLost(e.to_string()))
    }

    async fn subscribe_stats(&mut self) -> Result<mpsc::Receiver<Vec<u8>>, BridgeError> {
        let mut stream = self
            .notify_char
            .notify()
            .await
            .map_err(|e| BridgeError::LinkLost(e.to_string()))?;
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            while let Some(data) = stream.next().await {
                if tx.send(data).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn disconnect(&self) -> Result<(), BridgeError> {
        // Best-effort; the adapter's device() handle is re-derived by the
        // supervisor on next connect so no stored reference is needed here.
        Ok(())
    }
}

async fn is_kingsmith_device(device: &bluer::Device) -> bool {
    if let Ok(Some(uuids)) = device.uuids().await {
        if uuids.contains(&KINGSMITH_SERVICE_UUID) {
            return true;
        }
    }
    if let Ok(Some(name)) = device.name().await {
        return name_matches_kingsmith_prefix(&name);
    }
    false
}

/// Pure prefix check, factored out of `is_kingsmith_device` so it's
/// testable without a live `bluer::Device`.
fn name_matches_kingsmith_prefix(name: &str) -> bool {
    let lower = name.to_lowercase();
    KINGSMITH_NAME_PREFIXES.iter().any(|p| lower.starts_with(p))
}

async fn find_characteristic(
    device: &bluer::Device,
    service_uuid: Uuid,
    char_uuid: Uuid,
) -> Option<RemoteCharacteristic> {
    let services = device.services().await.ok()?;
    for service in services {
        if service.uuid().await.ok()? == service_uuid {
            for chr in service.characteristics().await.ok()? {
                if chr.uuid().await.ok()? == char_uuid {
                    return Some(chr);
                }
            }
        }
    }
    warn!("service {} found but characteristic {} missing", service_uuid, char_uuid);
    None
}
