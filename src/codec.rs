//! # Register Codec
//!
//! Conversion between raw holding-register words and logical field values.
//!
//! ## Word Layout
//!
//! | Width | Signed | Raw type | Word order |
//! |-------|--------|----------|------------|
//! | 1 | no | u16 | - |
//! | 1 | yes | i16 | - |
//! | 2 | no | u32 | high word first |
//! | 2 | yes | i32 | high word first |
//!
//! The logical value is `raw / divisor`.

use crate::error::{MonitorError, MonitorResult};
use crate::register_map::RegisterField;

// ============================================================================
// Decoding
// ============================================================================

/// Interpret a field's register words as a raw integer.
pub fn decode_raw(field: &RegisterField, registers: &[u16]) -> MonitorResult<i64> {
    if registers.len() != field.width as usize {
        return Err(MonitorError::protocol(format!(
            "{} needs {} register(s), got {}",
            field.name,
            field.width,
            registers.len()
        )));
    }

    let raw = match (field.width, field.signed) {
        (1, false) => registers[0] as i64,
        (1, true) => registers[0] as i16 as i64,
        (2, false) => regs_to_u32(registers[0], registers[1]) as i64,
        (2, true) => regs_to_u32(registers[0], registers[1]) as i32 as i64,
        (width, _) => {
            return Err(MonitorError::protocol(format!(
                "Unsupported register width {} for {}",
                width, field.name
            )));
        }
    };

    Ok(raw)
}

/// Decode a field's register words into its scaled logical value.
///
/// # Example
///
/// ```rust
/// use inverter_monitor::{codec, register_map};
///
/// let vbat = register_map::resolve("vbattery").unwrap();
/// assert_eq!(codec::decode_field(vbat, &[5234]).unwrap(), 523.4);
/// ```
pub fn decode_field(field: &RegisterField, registers: &[u16]) -> MonitorResult<f64> {
    let raw = decode_raw(field, registers)?;
    Ok(raw as f64 / field.divisor as f64)
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode a logical value into the register words written to the device.
///
/// The scaled raw value must fit the field's register type, otherwise the
/// request fails with `OutOfRange` before anything is sent.
pub fn encode_field(field: &RegisterField, value: i64) -> MonitorResult<Vec<u16>> {
    let out_of_range = |min: i64, max: i64| MonitorError::OutOfRange {
        field: field.name.to_string(),
        value,
        min,
        max,
    };

    let raw = value
        .checked_mul(field.divisor as i64)
        .ok_or_else(|| out_of_range(i64::MIN, i64::MAX))?;

    let (min, max) = raw_bounds(field);
    if raw < min || raw > max {
        let divisor = field.divisor as i64;
        return Err(out_of_range(min / divisor, max / divisor));
    }

    let words = match field.width {
        1 => vec![raw as u16],
        _ => {
            let [high, low] = u32_to_regs(raw as u32);
            vec![high, low]
        }
    };

    Ok(words)
}

/// Raw integer range representable by a field's register type.
pub fn raw_bounds(field: &RegisterField) -> (i64, i64) {
    match (field.width, field.signed) {
        (1, false) => (0, u16::MAX as i64),
        (1, true) => (i16::MIN as i64, i16::MAX as i64),
        (_, false) => (0, u32::MAX as i64),
        (_, true) => (i32::MIN as i64, i32::MAX as i64),
    }
}

// ============================================================================
// Word Helpers
// ============================================================================

/// Combine two registers, high word first.
pub fn regs_to_u32(high: u16, low: u16) -> u32 {
    ((high as u32) << 16) | low as u32
}

/// Split a 32-bit value into registers, high word first.
pub fn u32_to_regs(value: u32) -> [u16; 2] {
    [(value >> 16) as u16, value as u16]
}
