//! # Read Planning
//!
//! Groups register fields into contiguous read blocks so one poll cycle
//! needs as few exchanges as possible.
//!
//! Two fields share a block only when the second starts exactly where the
//! first ends; unmapped gaps are never read, since devices commonly reject
//! reads that touch them. A block never exceeds the per-request register
//! limit of the device.

use crate::constants::MAX_READ_REGISTERS;
use crate::register_map::RegisterField;

/// Device-specific read limits.
///
/// # Example
///
/// ```rust
/// use inverter_monitor::read_plan::ReadLimits;
///
/// let limits = ReadLimits::new().with_max_read_registers(50);
/// assert_eq!(limits.max_read_registers, 50);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadLimits {
    /// Maximum registers per read request.
    pub max_read_registers: u16,
}

impl Default for ReadLimits {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadLimits {
    /// Protocol maximum of 125 registers per read.
    pub fn new() -> Self {
        Self {
            max_read_registers: MAX_READ_REGISTERS as u16,
        }
    }

    /// Set maximum registers per read (clamped to 1..=125).
    pub fn with_max_read_registers(mut self, count: u16) -> Self {
        self.max_read_registers = count.clamp(1, MAX_READ_REGISTERS as u16);
        self
    }
}

/// One read request covering one or more adjacent fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadBlock {
    pub start: u16,
    pub count: u16,
    pub fields: Vec<&'static RegisterField>,
}

impl ReadBlock {
    fn single(field: &'static RegisterField) -> Self {
        Self {
            start: field.address,
            count: field.width,
            fields: vec![field],
        }
    }

    fn end(&self) -> u32 {
        self.start as u32 + self.count as u32
    }

    /// The words of `field` within a response to this block.
    pub fn words_for<'a>(&self, field: &RegisterField, registers: &'a [u16]) -> Option<&'a [u16]> {
        let offset = field.address.checked_sub(self.start)? as usize;
        registers.get(offset..offset + field.width as usize)
    }
}

/// Ordered set of read blocks covering a set of fields.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReadPlan {
    blocks: Vec<ReadBlock>,
}

impl ReadPlan {
    /// Plan reads for `fields` under `limits`.
    pub fn build<I>(fields: I, limits: &ReadLimits) -> Self
    where
        I: IntoIterator<Item = &'static RegisterField>,
    {
        let mut sorted: Vec<&'static RegisterField> = fields.into_iter().collect();
        sorted.sort_by_key(|f| f.address);
        sorted.dedup_by_key(|f| f.address);

        let mut blocks: Vec<ReadBlock> = Vec::new();
        for field in sorted {
            match blocks.last_mut() {
                Some(block)
                    if block.end() == field.address as u32
                        && block.count + field.width <= limits.max_read_registers =>
                {
                    block.count += field.width;
                    block.fields.push(field);
                }
                _ => blocks.push(ReadBlock::single(field)),
            }
        }

        Self { blocks }
    }

    pub fn blocks(&self) -> &[ReadBlock] {
        &self.blocks
    }

    /// Number of read requests a full cycle issues when nothing fails.
    pub fn request_count(&self) -> usize {
        self.blocks.len()
    }

    /// Total registers read by a full cycle.
    pub fn register_count(&self) -> usize {
        self.blocks.iter().map(|b| b.count as usize).sum()
    }

    pub fn field_count(&self) -> usize {
        self.blocks.iter().map(|b| b.fields.len()).sum()
    }
}
