//! Protocol constants and process-wide defaults
//!
//! Frame limits follow the Modbus application protocol:
//! - Maximum PDU size: 253 bytes (inherited from RS485 ADU limit of 256 bytes)
//! - Register limits are calculated to fit within the PDU size constraint

// ============================================================================
// Frame Size Constants
// ============================================================================

/// MBAP prefix read before the length is known.
/// Format: Transaction ID(2) + Protocol ID(2) + Length(2) = 6 bytes
/// The Unit ID is counted by the Length field, together with the PDU.
pub const MBAP_HEADER_LEN: usize = 6;

/// Maximum PDU (Protocol Data Unit) size
/// RS485 ADU (256 bytes) - Slave Address (1 byte) - CRC (2 bytes) = 253 bytes
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (Unit ID + PDU)
/// = 1 (Unit ID) + 253 (Max PDU) = 254 bytes
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Protocol identifier carried by every Modbus TCP frame.
pub const MODBUS_PROTOCOL_ID: u16 = 0;

// ============================================================================
// Register Operation Limits
// ============================================================================

/// Maximum number of registers for FC03 (Read Holding Registers)
///
/// Response PDU: Function Code (1) + Byte Count (1) + N × 2 ≤ 253
/// Therefore: N ≤ (253 - 2) / 2 = 125 registers
pub const MAX_READ_REGISTERS: usize = 125;

/// Maximum number of registers for FC16 (Write Multiple Registers)
///
/// Request PDU: FC (1) + Address (2) + Quantity (2) + Byte Count (1) + N × 2 ≤ 253
/// Therefore: N ≤ (253 - 6) / 2 = 123 registers
pub const MAX_WRITE_REGISTERS: usize = 123;

// ============================================================================
// Modbus Function Codes
// ============================================================================

/// Read Holding Registers (FC03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Write Single Register (FC06)
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Write Multiple Registers (FC16)
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

// ============================================================================
// Modbus Exception Codes
// ============================================================================

/// Illegal Function
pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;

/// Illegal Data Address
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;

/// Illegal Data Value
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;

/// Server Device Failure
pub const EXCEPTION_SERVER_DEVICE_FAILURE: u8 = 0x04;

/// Acknowledge
pub const EXCEPTION_ACKNOWLEDGE: u8 = 0x05;

/// Server Device Busy
pub const EXCEPTION_SERVER_DEVICE_BUSY: u8 = 0x06;

/// Memory Parity Error
pub const EXCEPTION_MEMORY_PARITY_ERROR: u8 = 0x08;

/// Gateway Path Unavailable
pub const EXCEPTION_GATEWAY_PATH_UNAVAILABLE: u8 = 0x0A;

/// Gateway Target Device Failed to Respond
pub const EXCEPTION_GATEWAY_TARGET_FAILED: u8 = 0x0B;

// ============================================================================
// Connection Defaults
// ============================================================================

/// Hard-coded inverter address used when neither the record nor env supply one.
pub const DEFAULT_HOST: &str = "192.168.1.100";

/// Modbus TCP default port
pub const DEFAULT_PORT: u16 = 502;

/// Default unit identifier of the inverter's Modbus TCP bridge
pub const DEFAULT_SLAVE_ID: u8 = 247;

/// Highest unicast slave identifier
pub const MAX_SLAVE_ID: u8 = 247;

/// Default poll period in seconds
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Shortest poll period accepted from configuration, in seconds
pub const MIN_POLL_INTERVAL_SECS: u64 = 5;

/// Bound on a single request/response exchange (milliseconds)
pub const DEFAULT_EXCHANGE_TIMEOUT_MS: u64 = 5000;

/// Bound on opening the TCP connection (milliseconds)
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// First reconnect delay (milliseconds)
pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 1000;

/// Reconnect delay ceiling (milliseconds)
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

/// Consecutive empty ticks before the device is reported unreachable
pub const DEFAULT_UNREACHABLE_AFTER: u32 = 3;

/// Settle time between a write and its read-back (milliseconds)
pub const DEFAULT_VERIFY_DELAY_MS: u64 = 500;

/// File name of the persisted configuration record
pub const CONFIG_FILE_NAME: &str = "config.json";
