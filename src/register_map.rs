//! Static register table of the inverter
//!
//! Maps logical field names to holding-register locations, data width,
//! signedness, scaling and write bounds. The table is fixed at build time;
//! every lookup is pure.
//!
//! | Width | Signed | Decoded as |
//! |-------|--------|------------|
//! | 1 | no | u16 |
//! | 1 | yes | i16 |
//! | 2 | no | u32 (high word first) |
//! | 2 | yes | i32 (high word first) |

use crate::error::{MonitorError, MonitorResult};

/// Inclusive bounds a logical value must fall in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds<T> {
    pub min: T,
    pub max: T,
}

impl<T: PartialOrd + Copy> Bounds<T> {
    pub const fn new(min: T, max: T) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: T) -> bool {
        value >= self.min && value <= self.max
    }
}

/// One logical field backed by one or two holding registers.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterField {
    /// Canonical field name, used as the key of a sample
    pub name: &'static str,
    /// Display label
    pub label: &'static str,
    /// Engineering unit of the logical value
    pub unit: &'static str,
    /// First holding register
    pub address: u16,
    /// Number of register words (1 or 2)
    pub width: u16,
    /// Two's complement interpretation
    pub signed: bool,
    /// logical = raw / divisor
    pub divisor: u32,
    /// Accepted logical values for writes; `None` for read-only fields
    pub writable: Option<Bounds<i64>>,
    /// Decoded values outside these bounds are treated as unavailable
    pub plausible: Option<Bounds<f64>>,
}

impl RegisterField {
    const fn monitored(
        name: &'static str,
        label: &'static str,
        unit: &'static str,
        address: u16,
        width: u16,
        signed: bool,
        divisor: u32,
    ) -> Self {
        Self {
            name,
            label,
            unit,
            address,
            width,
            signed,
            divisor,
            writable: None,
            plausible: None,
        }
    }

    const fn with_plausible(mut self, min: f64, max: f64) -> Self {
        self.plausible = Some(Bounds::new(min, max));
        self
    }

    const fn with_write_range(mut self, min: i64, max: i64) -> Self {
        self.writable = Some(Bounds::new(min, max));
        self
    }

    pub fn is_writable(&self) -> bool {
        self.writable.is_some()
    }

    /// One past the last register this field occupies.
    pub fn end_address(&self) -> u32 {
        self.address as u32 + self.width as u32
    }

    /// Check a requested logical value against the field's write bounds.
    pub fn validate_write(&self, value: i64) -> MonitorResult<()> {
        let bounds = self.writable.ok_or_else(|| MonitorError::NotWritable {
            field: self.name.to_string(),
        })?;

        if !bounds.contains(value) {
            return Err(MonitorError::OutOfRange {
                field: self.name.to_string(),
                value,
                min: bounds.min,
                max: bounds.max,
            });
        }

        Ok(())
    }

    /// Whether a decoded value passes the sensor sanity check.
    pub fn is_plausible(&self, value: f64) -> bool {
        value.is_finite() && self.plausible.map_or(true, |b| b.contains(value))
    }
}

// ============================================================================
// Register Table
// ============================================================================

static REGISTER_MAP: [RegisterField; 15] = [
    RegisterField::monitored("ppv1", "PV1 Power", "W", 35105, 2, false, 1),
    RegisterField::monitored("ppv2", "PV2 Power", "W", 35109, 2, false, 1),
    RegisterField::monitored("total_inverter_power", "AC Power", "W", 35137, 2, true, 1),
    RegisterField::monitored("ac_active_power", "Grid Power", "W", 35139, 2, true, 1),
    RegisterField::monitored("total_load_power", "House Load", "W", 35171, 2, true, 1),
    RegisterField::monitored("vbattery", "Battery Voltage", "V", 35180, 1, false, 10)
        .with_plausible(40.0, 600.0),
    RegisterField::monitored("ibattery", "Battery Current", "A", 35181, 1, true, 10),
    RegisterField::monitored("pbattery", "Battery Power", "W", 35182, 2, true, 1),
    RegisterField::monitored("pv_energy_day", "Solar Today", "kWh", 35193, 2, false, 10),
    RegisterField::monitored("battery_charge_day", "Charged Today", "kWh", 35208, 1, false, 10),
    RegisterField::monitored(
        "battery_discharge_day",
        "Discharged Today",
        "kWh",
        35211,
        1,
        false,
        10,
    ),
    RegisterField::monitored("bms_temperature", "Battery Temperature", "°C", 37003, 1, true, 10)
        .with_plausible(-20.0, 80.0),
    RegisterField::monitored("battery_soc", "Battery SOC", "%", 37007, 1, false, 1)
        .with_plausible(0.0, 100.0),
    RegisterField::monitored(
        "meter_target_power_offset",
        "Meter Target Power Offset",
        "W",
        47120,
        1,
        true,
        1,
    )
    .with_write_range(-32768, 32767),
    RegisterField::monitored("grid_export_limit", "Grid Export Limit", "W", 47510, 1, false, 1)
        .with_write_range(0, 65535),
];

/// All fields, in ascending address order.
pub fn fields() -> &'static [RegisterField] {
    &REGISTER_MAP
}

/// Fields that accept writes.
pub fn writable_fields() -> impl Iterator<Item = &'static RegisterField> {
    REGISTER_MAP.iter().filter(|f| f.is_writable())
}

/// Look a field up by name.
///
/// Matching ignores case, underscores, spaces and hyphens, so
/// `grid_export_limit`, `GridExportLimit` and `Grid Export Limit` all
/// resolve to the same field. Labels are accepted too.
pub fn resolve(name: &str) -> MonitorResult<&'static RegisterField> {
    let key = normalize(name);
    REGISTER_MAP
        .iter()
        .find(|f| normalize(f.name) == key || normalize(f.label) == key)
        .ok_or_else(|| MonitorError::UnknownField {
            field: name.to_string(),
        })
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '_' | ' ' | '-'))
        .flat_map(char::to_lowercase)
        .collect()
}
