//! Error types for the monitor core.
//!
//! Every failure mode is a value. Transport and protocol failures from a
//! poll degrade a single field; the same failures from a write are handed
//! back to the caller; validation failures never reach the wire.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type MonitorResult<T> = Result<T, MonitorError>;

/// Error taxonomy for device exchanges, register validation and configuration.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MonitorError {
    /// The transport to the device could not be established.
    #[error("connect error: {message}")]
    Connect { message: String },

    /// No response arrived within the exchange bound.
    #[error("timeout after {timeout_ms} ms: {message}")]
    Timeout { message: String, timeout_ms: u64 },

    /// The response was malformed or did not match the request.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// The transport failed while an exchange was in progress.
    #[error("connection lost: {message}")]
    ConnectionLost { message: String },

    /// The device answered with a Modbus exception.
    #[error("rejected by device: function 0x{function:02X}, exception 0x{code:02X} ({message})")]
    Rejected {
        function: u8,
        code: u8,
        message: String,
    },

    /// No connection is currently open to the device.
    #[error("not connected to device")]
    NotConnected,

    /// The value lies outside the field's declared bounds.
    #[error("value {value} out of range for {field} ({min}..={max})")]
    OutOfRange {
        field: String,
        value: i64,
        min: i64,
        max: i64,
    },

    /// The field exists but is read-only.
    #[error("field {field} is not writable")]
    NotWritable { field: String },

    /// No register is mapped under this name.
    #[error("unknown field: {field}")]
    UnknownField { field: String },

    /// A configuration value failed validation.
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// The configuration record could not be saved durably.
    #[error("persistence error: {message}")]
    Persistence { message: String },

    /// The connection worker has stopped.
    #[error("protocol client has shut down")]
    Shutdown,
}

impl MonitorError {
    /// Create a connect error
    pub fn connect<S: Into<String>>(message: S) -> Self {
        Self::Connect {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(message: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            message: message.into(),
            timeout_ms,
        }
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a connection-lost error
    pub fn connection_lost<S: Into<String>>(message: S) -> Self {
        Self::ConnectionLost {
            message: message.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a persistence error
    pub fn persistence<S: Into<String>>(message: S) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    /// Build a rejection from a Modbus exception response.
    pub fn rejected(function: u8, code: u8) -> Self {
        Self::Rejected {
            function: function & 0x7F,
            code,
            message: exception_description(code).to_string(),
        }
    }

    /// Whether this error leaves the connection unusable.
    ///
    /// A timed-out or broken stream cannot be trusted for the next
    /// exchange. A malformed but complete response can: the transport
    /// drops the stream itself when framing is lost.
    pub fn is_transport_fault(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::ConnectionLost { .. })
    }

    /// Whether this error was raised by request validation, before any I/O.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::OutOfRange { .. } | Self::NotWritable { .. } | Self::UnknownField { .. }
        )
    }
}

/// Human-readable name of a Modbus exception code.
pub fn exception_description(code: u8) -> &'static str {
    use crate::constants::*;
    match code {
        EXCEPTION_ILLEGAL_FUNCTION => "Illegal Function",
        EXCEPTION_ILLEGAL_DATA_ADDRESS => "Illegal Data Address",
        EXCEPTION_ILLEGAL_DATA_VALUE => "Illegal Data Value",
        EXCEPTION_SERVER_DEVICE_FAILURE => "Server Device Failure",
        EXCEPTION_ACKNOWLEDGE => "Acknowledge",
        EXCEPTION_SERVER_DEVICE_BUSY => "Server Device Busy",
        EXCEPTION_MEMORY_PARITY_ERROR => "Memory Parity Error",
        EXCEPTION_GATEWAY_PATH_UNAVAILABLE => "Gateway Path Unavailable",
        EXCEPTION_GATEWAY_TARGET_FAILED => "Gateway Target Failed",
        _ => "Unknown Exception",
    }
}

impl From<std::io::Error> for MonitorError {
    fn from(err: std::io::Error) -> Self {
        Self::connection_lost(err.to_string())
    }
}
