//! Validated register writes on behalf of viewers
//!
//! A write is checked against the register table before anything is sent.
//! The encoded words go through the same [`ProtocolClient`] queue the poller
//! uses, a successful write triggers an immediate refresh of the live
//! sample, and the register is read back to confirm what the device holds.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::codec::{decode_field, encode_field};
use crate::constants::DEFAULT_VERIFY_DELAY_MS;
use crate::error::MonitorResult;
use crate::poller::PollTrigger;
use crate::protocol_client::ProtocolClient;
use crate::register_map::{self, RegisterField};

/// Result of a successful write.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteOutcome {
    pub field: &'static str,
    pub address: u16,
    /// Logical value that was requested
    pub value: i64,
    /// Words sent to the device
    pub raw: Vec<u16>,
    /// Value read back after the settle delay; `None` if the read-back failed
    pub verified_value: Option<f64>,
}

impl WriteOutcome {
    /// Whether the read-back matches the requested value.
    pub fn is_verified(&self) -> bool {
        self.verified_value == Some(self.value as f64)
    }
}

#[derive(Debug, Clone)]
pub struct WriteGateway {
    client: ProtocolClient,
    trigger: PollTrigger,
    verify_delay: Duration,
}

impl WriteGateway {
    pub fn new(client: ProtocolClient, trigger: PollTrigger) -> Self {
        Self {
            client,
            trigger,
            verify_delay: Duration::from_millis(DEFAULT_VERIFY_DELAY_MS),
        }
    }

    /// Settle time before the read-back.
    pub fn with_verify_delay(mut self, delay: Duration) -> Self {
        self.verify_delay = delay;
        self
    }

    /// Write the logical `value` to the field named `field`.
    ///
    /// Fails with `UnknownField`, `NotWritable` or `OutOfRange` without any
    /// network traffic. Device rejections and transport failures are
    /// returned as-is.
    pub async fn write(&self, field: &str, value: i64) -> MonitorResult<WriteOutcome> {
        let field = register_map::resolve(field)?;
        field.validate_write(value)?;
        let raw = encode_field(field, value)?;

        let written = if raw.len() == 1 {
            self.client.write_register(field.address, raw[0]).await
        } else {
            self.client.write_registers(field.address, &raw).await
        };

        if let Err(e) = written {
            warn!(field = field.name, value, error = %e, "Register write failed");
            return Err(e);
        }

        info!(field = field.name, value, address = field.address, "Register written");
        self.trigger.refresh();

        tokio::time::sleep(self.verify_delay).await;
        let verified_value = match self.read_field(field).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(field = field.name, error = %e, "Write read-back failed");
                None
            }
        };

        if verified_value != Some(value as f64) {
            warn!(
                field = field.name,
                requested = value,
                read_back = ?verified_value,
                "Read-back does not match written value"
            );
        }

        Ok(WriteOutcome {
            field: field.name,
            address: field.address,
            value,
            raw,
            verified_value,
        })
    }

    /// Current value of every writable field; `None` where the read failed.
    pub async fn read_settings(&self) -> BTreeMap<&'static str, Option<f64>> {
        let mut settings = BTreeMap::new();
        for field in register_map::writable_fields() {
            let value = match self.read_field(field).await {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!(field = field.name, error = %e, "Setting read failed");
                    None
                }
            };
            settings.insert(field.name, value);
        }
        settings
    }

    async fn read_field(&self, field: &RegisterField) -> MonitorResult<f64> {
        let words = self.client.read_registers(field.address, field.width).await?;
        decode_field(field, &words)
    }
}
