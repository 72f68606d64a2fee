//! Modbus PDU data structure
//!
//! Use a fixed-size stack array to avoid heap allocation per exchange.
//! Besides building requests, this module owns the strict checks a response
//! must pass before any of its data is used: function code echo, byte count
//! and word count against the request.

use tracing::trace;

use crate::constants::{
    FC_READ_HOLDING_REGISTERS, FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_REGISTER,
    MAX_PDU_SIZE, MAX_READ_REGISTERS, MAX_WRITE_REGISTERS,
};
use crate::error::{MonitorError, MonitorResult};

/// PDU with stack-allocated fixed array
#[derive(Debug, Clone)]
pub struct ModbusPdu {
    /// Fixed-size buffer (stack)
    data: [u8; MAX_PDU_SIZE],
    /// Actual data length
    len: usize,
}

impl ModbusPdu {
    /// Create an empty PDU
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Create a PDU from a byte slice
    pub fn from_slice(data: &[u8]) -> MonitorResult<Self> {
        if data.len() > MAX_PDU_SIZE {
            return Err(MonitorError::protocol(format!(
                "PDU too large: {} bytes (max {})",
                data.len(),
                MAX_PDU_SIZE
            )));
        }

        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();

        if let Some(fc) = pdu.function_code() {
            trace!(
                fc = format_args!("{:02X}", fc),
                desc = Self::function_code_description(fc),
                exception = pdu.is_exception(),
                len = pdu.len,
                "PDU parsed"
            );
        }

        Ok(pdu)
    }

    /// Push a single byte
    #[inline]
    pub fn push(&mut self, byte: u8) -> MonitorResult<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(MonitorError::protocol("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> MonitorResult<()> {
        self.push((value >> 8) as u8)?;
        self.push((value & 0xFF) as u8)?;
        Ok(())
    }

    /// Get immutable data slice
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Get current length
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get function code (first byte)
    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        if self.len > 0 {
            Some(self.data[0])
        } else {
            None
        }
    }

    /// Check if exception response
    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .map(|fc| fc & 0x80 != 0)
            .unwrap_or(false)
    }

    /// Get exception code
    #[inline]
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() && self.len > 1 {
            Some(self.data[1])
        } else {
            None
        }
    }

    fn u16_at(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.data[offset], self.data[offset + 1]])
    }

    /// Reject exception responses and function codes that do not echo the request.
    fn expect_function(&self, expected_fc: u8) -> MonitorResult<()> {
        let fc = self
            .function_code()
            .ok_or_else(|| MonitorError::protocol("Empty response PDU"))?;

        if fc == expected_fc | 0x80 {
            let code = self.exception_code().unwrap_or(0);
            return Err(MonitorError::rejected(fc, code));
        }

        if fc != expected_fc {
            return Err(MonitorError::protocol(format!(
                "Function code mismatch: expected {:02X}, got {:02X}",
                expected_fc, fc
            )));
        }

        Ok(())
    }

    /// Parse an FC03 response carrying exactly `quantity` registers.
    pub fn parse_read_registers(&self, quantity: u16) -> MonitorResult<Vec<u16>> {
        self.expect_function(FC_READ_HOLDING_REGISTERS)?;

        if self.len < 2 {
            return Err(MonitorError::protocol("Read response missing byte count"));
        }

        let byte_count = self.data[1] as usize;
        let expected_bytes = quantity as usize * 2;
        if byte_count != expected_bytes {
            return Err(MonitorError::protocol(format!(
                "Byte count mismatch: expected {}, got {}",
                expected_bytes, byte_count
            )));
        }

        if self.len != 2 + byte_count {
            return Err(MonitorError::protocol(format!(
                "Read response length {} does not match byte count {}",
                self.len, byte_count
            )));
        }

        Ok((0..quantity as usize)
            .map(|i| self.u16_at(2 + i * 2))
            .collect())
    }

    /// Check an FC06/FC16 response echoes the request's address and value/quantity.
    pub fn check_write_echo(&self, expected_fc: u8, address: u16, word: u16) -> MonitorResult<()> {
        self.expect_function(expected_fc)?;

        if self.len != 5 {
            return Err(MonitorError::protocol(format!(
                "Write response length {} (expected 5)",
                self.len
            )));
        }

        let echoed_address = self.u16_at(1);
        let echoed_word = self.u16_at(3);
        if echoed_address != address || echoed_word != word {
            return Err(MonitorError::protocol(format!(
                "Write echo mismatch: sent {:04X}/{:04X}, got {:04X}/{:04X}",
                address, word, echoed_address, echoed_word
            )));
        }

        Ok(())
    }

    /// Get human-readable function code description
    pub fn function_code_description(fc: u8) -> &'static str {
        match fc & 0x7F {
            0x03 => "Read Holding Registers",
            0x06 => "Write Single Register",
            0x10 => "Write Multiple Registers",
            _ => "Unknown Function",
        }
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// PDU builder - fluent API
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl Default for PduBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PduBuilder {
    /// Create a new builder
    #[inline]
    pub fn new() -> Self {
        Self {
            pdu: ModbusPdu::new(),
        }
    }

    /// Set function code
    #[inline]
    pub fn function_code(mut self, fc: u8) -> MonitorResult<Self> {
        self.pdu.push(fc)?;
        Ok(self)
    }

    /// Add a big-endian word (address, quantity or value)
    #[inline]
    pub fn word(mut self, word: u16) -> MonitorResult<Self> {
        self.pdu.push_u16(word)?;
        Ok(self)
    }

    /// Add a byte
    #[inline]
    pub fn byte(mut self, b: u8) -> MonitorResult<Self> {
        self.pdu.push(b)?;
        Ok(self)
    }

    /// Build the PDU
    #[inline]
    pub fn build(self) -> ModbusPdu {
        self.pdu
    }

    /// Build a read holding registers request (FC03)
    pub fn build_read_holding(start_address: u16, quantity: u16) -> MonitorResult<ModbusPdu> {
        if quantity == 0 || quantity as usize > MAX_READ_REGISTERS {
            return Err(MonitorError::protocol(format!(
                "Invalid read quantity: {}",
                quantity
            )));
        }
        Ok(PduBuilder::new()
            .function_code(FC_READ_HOLDING_REGISTERS)?
            .word(start_address)?
            .word(quantity)?
            .build())
    }

    /// Build a write single register request (FC06)
    pub fn build_write_single_register(address: u16, value: u16) -> MonitorResult<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(FC_WRITE_SINGLE_REGISTER)?
            .word(address)?
            .word(value)?
            .build())
    }

    /// Build a write multiple registers request (FC16)
    pub fn build_write_multiple_registers(
        address: u16,
        values: &[u16],
    ) -> MonitorResult<ModbusPdu> {
        if values.is_empty() || values.len() > MAX_WRITE_REGISTERS {
            return Err(MonitorError::protocol(format!(
                "Invalid write quantity: {}",
                values.len()
            )));
        }

        let mut builder = PduBuilder::new()
            .function_code(FC_WRITE_MULTIPLE_REGISTERS)?
            .word(address)?
            .word(values.len() as u16)?
            .byte((values.len() * 2) as u8)?;

        for &value in values {
            builder = builder.word(value)?;
        }

        Ok(builder.build())
    }
}
