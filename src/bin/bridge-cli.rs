//! Runnable entry point wiring the library together for manual smoke-testing.
//!
//! Not part of the bridge's core; contains no logic beyond argument parsing
//! and wiring: `env_logger::init()`, build the long-running task, race it
//! against `tokio::signal::ctrl_c()`.

use std::sync::Arc;

use kingsmith_ftms_bridge::{BleAdapter, BluerAdapter, BridgeConfig, BridgeSupervisor, Facade};

const DEFAULT_DEVICE_NAME: &str = "WalkingPad Bridge";

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = parse_args();
    log::info!(
        "bridge starting, ftms_device_name={}, auto_mode={}, auto_start_bridge={}",
        config.ftms_device_name,
        config.auto_mode,
        config.auto_start_bridge
    );

    let adapter: Arc<dyn BleAdapter> = match BluerAdapter::new(config.ble_adapter.as_deref()).await {
        Ok(a) => Arc::new(a),
        Err(e) => {
            log::error!("failed to open BLE adapter: {}", e);
            return;
        }
    };

    let (supervisor, cmd_tx) = BridgeSupervisor::new(config, adapter);
    let facade = Facade::new(supervisor, cmd_tx);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("received shutdown signal");
        }
    }

    if let Err(e) = facade.shutdown().await {
        log::error!("shutdown did not complete cleanly: {}", e);
    }
    log::info!("bridge shut down");
}

fn parse_args() -> BridgeConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = BridgeConfig {
        ftms_device_name: DEFAULT_DEVICE_NAME.to_string(),
        ..BridgeConfig::default()
    };
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--adapter" => {
                if let Some(name) = args.get(i + 1) {
                    config.ble_adapter = Some(name.clone());
                    i += 1;
                }
            }
            "--device-name" => {
                if let Some(name) = args.get(i + 1) {
                    config.ftms_device_name = name.clone();
                    i += 1;
                }
            }
            "--manual" => {
                config.auto_mode = false;
                config.auto_start_bridge = false;
            }
            "--stats-interval-ms" => {
                if let Some(ms) = args.get(i + 1) {
                    config.stats_interval_ms = ms.parse().unwrap_or(config.stats_interval_ms);
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    config
}
