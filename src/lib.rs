//! # Inverter Monitor - Live Modbus TCP Monitor for Hybrid Inverters
//!
//! Samples the operating state of a hybrid inverter/battery system over
//! Modbus TCP, fans the latest sample out to any number of viewers, and
//! accepts validated writes to the inverter's settings registers.
//!
//! ## Features
//!
//! - **Single device link**: one connection, one exchange on the wire at a time
//! - **Self-healing**: exponential-backoff reconnect, immediate rebuild on config change
//! - **Partial degradation**: a failed read blanks only the affected fields
//! - **Best-effort fan-out**: slow viewers skip to the newest sample, never stall polling
//! - **Durable configuration**: persisted record > environment > defaults
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Used for |
//! |------|----------|----------|
//! | 0x03 | Read Holding Registers | polling, write read-back |
//! | 0x06 | Write Single Register | settings writes |
//! | 0x10 | Write Multiple Registers | two-word settings |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use inverter_monitor::{ConfigStore, Monitor, MonitorOptions};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(ConfigStore::from_env().await);
//!     let monitor = Monitor::start(store, MonitorOptions::default());
//!
//!     let mut viewer = monitor.subscribe();
//!     while let Some(sample) = viewer.next().await {
//!         println!("{}", sample.to_json().unwrap_or_default());
//!     }
//! }
//! ```

// ============================================================================
// Protocol layer
// ============================================================================

/// Error taxonomy and result alias
pub mod error;

/// Modbus constants and process-wide defaults
pub mod constants;

/// Stack-allocated PDU with request builders and strict response parsers
pub mod pdu;

/// MBAP framing and the TCP transport
pub mod transport;

/// Register-level client over any transport
pub mod client;

// ============================================================================
// Device model
// ============================================================================

/// Static register table of the inverter
pub mod register_map;

/// Raw words to logical values and back
pub mod codec;

/// Grouping of fields into contiguous read blocks
pub mod read_plan;

// ============================================================================
// Monitor core
// ============================================================================

/// Connection configuration precedence and persistence
pub mod config;

/// Connection worker and its handle
pub mod protocol_client;

/// Sample snapshots and the viewer message format
pub mod sample;

/// Fan-out of samples to viewer sessions
pub mod distributor;

/// Periodic polling
pub mod poller;

/// Validated settings writes
pub mod gateway;

/// Composition root
pub mod service;

/// Tracing subscriber setup
pub mod logging;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Core API ===
pub use config::{ConfigStore, ConnectionConfig};
pub use distributor::{Distributor, ViewerSession};
pub use gateway::{WriteGateway, WriteOutcome};
pub use poller::{DeviceHealth, PollTrigger, Poller, PollerOptions};
pub use protocol_client::{ClientOptions, ConnectionState, ProtocolClient};
pub use sample::{FieldValue, Sample};
pub use service::{Monitor, MonitorOptions};

// === Error handling ===
pub use error::{MonitorError, MonitorResult};

// === Device model ===
pub use register_map::{resolve, RegisterField};

// === Protocol (advanced usage) ===
pub use client::{GenericModbusClient, ModbusClient, ModbusTcpClient};
pub use pdu::{ModbusPdu, PduBuilder};
pub use transport::{ModbusTransport, TcpTransport, TransportStats};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
