//! Register-level Modbus client
//!
//! [`GenericModbusClient`] turns register operations into PDUs, hands them to
//! a [`ModbusTransport`], and validates the device's answer. The transport
//! decides how the PDU is framed; the client only knows the application layer.
//!
//! | Function Code | Primary Name | Semantic Alias |
//! |---------------|--------------|----------------|
//! | 0x03 | `read_03()` | `read_holding_registers()` |
//! | 0x06 | `write_06()` | `write_single_register()` |
//! | 0x10 | `write_10()` | `write_multiple_registers()` |

use std::time::Duration;

use tracing::{debug, trace};

use crate::constants::{FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_REGISTER};
use crate::error::MonitorResult;
use crate::pdu::{ModbusPdu, PduBuilder};
use crate::transport::{ModbusTransport, TcpTransport, TransportStats};

/// Register operations against one Modbus device.
pub trait ModbusClient: Send {
    /// Read holding registers (FC03)
    fn read_03(
        &mut self,
        slave_id: u8,
        address: u16,
        quantity: u16,
    ) -> impl std::future::Future<Output = MonitorResult<Vec<u16>>> + Send;

    /// Write single register (FC06)
    fn write_06(
        &mut self,
        slave_id: u8,
        address: u16,
        value: u16,
    ) -> impl std::future::Future<Output = MonitorResult<()>> + Send;

    /// Write multiple registers (FC16)
    fn write_10(
        &mut self,
        slave_id: u8,
        address: u16,
        values: &[u16],
    ) -> impl std::future::Future<Output = MonitorResult<()>> + Send;

    /// Whether the underlying transport is still open
    fn is_connected(&self) -> bool;

    /// Close the connection
    fn close(&mut self) -> impl std::future::Future<Output = MonitorResult<()>> + Send;

    /// Get transport statistics
    fn get_stats(&self) -> TransportStats;

    /// Alias for [`read_03`](Self::read_03)
    fn read_holding_registers(
        &mut self,
        slave_id: u8,
        address: u16,
        quantity: u16,
    ) -> impl std::future::Future<Output = MonitorResult<Vec<u16>>> + Send {
        self.read_03(slave_id, address, quantity)
    }

    /// Alias for [`write_06`](Self::write_06)
    fn write_single_register(
        &mut self,
        slave_id: u8,
        address: u16,
        value: u16,
    ) -> impl std::future::Future<Output = MonitorResult<()>> + Send {
        self.write_06(slave_id, address, value)
    }

    /// Alias for [`write_10`](Self::write_10)
    fn write_multiple_registers(
        &mut self,
        slave_id: u8,
        address: u16,
        values: &[u16],
    ) -> impl std::future::Future<Output = MonitorResult<()>> + Send {
        self.write_10(slave_id, address, values)
    }
}

/// Client generic over its transport.
pub struct GenericModbusClient<T: ModbusTransport> {
    transport: T,
}

/// Modbus TCP client
pub type ModbusTcpClient = GenericModbusClient<TcpTransport>;

impl ModbusTcpClient {
    /// Connect to `host:port` with the given connect and exchange bounds.
    pub async fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        timeout: Duration,
    ) -> MonitorResult<Self> {
        let transport = TcpTransport::connect(host, port, connect_timeout, timeout).await?;
        Ok(Self::new(transport))
    }
}

impl<T: ModbusTransport> GenericModbusClient<T> {
    /// Create a new generic client with the specified transport
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Get a reference to the underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Execute a raw request
    pub async fn execute_request(
        &mut self,
        slave_id: u8,
        request: &ModbusPdu,
    ) -> MonitorResult<ModbusPdu> {
        trace!(
            slave_id,
            function = ModbusPdu::function_code_description(request.function_code().unwrap_or(0)),
            pdu = ?request.as_slice(),
            "Modbus request"
        );

        let response = self.transport.request(slave_id, request).await?;

        trace!(slave_id, pdu = ?response.as_slice(), "Modbus response");
        Ok(response)
    }
}

impl<T: ModbusTransport + Sync> ModbusClient for GenericModbusClient<T> {
    async fn read_03(
        &mut self,
        slave_id: u8,
        address: u16,
        quantity: u16,
    ) -> MonitorResult<Vec<u16>> {
        let request = PduBuilder::build_read_holding(address, quantity)?;
        let response = self.execute_request(slave_id, &request).await?;
        let registers = response.parse_read_registers(quantity)?;
        debug!(slave_id, address, quantity, "Read holding registers");
        Ok(registers)
    }

    async fn write_06(&mut self, slave_id: u8, address: u16, value: u16) -> MonitorResult<()> {
        let request = PduBuilder::build_write_single_register(address, value)?;
        let response = self.execute_request(slave_id, &request).await?;
        response.check_write_echo(FC_WRITE_SINGLE_REGISTER, address, value)?;
        debug!(slave_id, address, value, "Wrote single register");
        Ok(())
    }

    async fn write_10(&mut self, slave_id: u8, address: u16, values: &[u16]) -> MonitorResult<()> {
        let request = PduBuilder::build_write_multiple_registers(address, values)?;
        let response = self.execute_request(slave_id, &request).await?;
        response.check_write_echo(FC_WRITE_MULTIPLE_REGISTERS, address, values.len() as u16)?;
        debug!(slave_id, address, count = values.len(), "Wrote multiple registers");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    async fn close(&mut self) -> MonitorResult<()> {
        self.transport.close().await
    }

    fn get_stats(&self) -> TransportStats {
        self.transport.get_stats()
    }
}
