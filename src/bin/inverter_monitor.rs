//! Inverter monitor
//!
//! Polls the inverter configured through `config.json` / environment and
//! prints every sample as one JSON line on stdout. Stops on Ctrl-C.
//!
//! Usage: inverter-monitor
//! Environment: INVERTER_IP, MODBUS_PORT, SLAVE_ID, POLL_INTERVAL, DATA_DIR, RUST_LOG

use std::sync::Arc;

use inverter_monitor::{logging, ConfigStore, DeviceHealth, Monitor, MonitorOptions};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    logging::init();
    info!("inverter-monitor v{}", inverter_monitor::VERSION);

    let store = Arc::new(ConfigStore::from_env().await);
    info!(record = %store.path().display(), "Configuration record");

    let monitor = Monitor::start(store, MonitorOptions::default());
    let mut viewer = monitor.subscribe();
    let mut health = monitor.subscribe_health();

    loop {
        tokio::select! {
            sample = viewer.next() => match sample {
                Some(sample) => match sample.to_json() {
                    Ok(line) => println!("{}", line),
                    Err(e) => error!(error = %e, "Failed to serialize sample"),
                },
                None => break,
            },

            changed = health.changed() => {
                if changed.is_err() {
                    break;
                }
                if *health.borrow_and_update() == DeviceHealth::Unreachable {
                    warn!("Inverter unreachable, still retrying");
                }
            }

            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!(error = %e, "Failed to listen for Ctrl-C");
                }
                break;
            }
        }
    }

    info!("Shutting down");
    drop(viewer);
    monitor.shutdown().await;
}
