//! Periodic sampling of the device
//!
//! Every tick the poller reads all planned blocks through the shared
//! [`ProtocolClient`], decodes each field, and publishes one complete
//! [`Sample`]. A failed read only marks the affected fields unavailable.
//! Ticks are skipped without waiting while the device is not connected.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::codec::decode_field;
use crate::config::ConnectionConfig;
use crate::constants::DEFAULT_UNREACHABLE_AFTER;
use crate::distributor::Distributor;
use crate::error::MonitorError;
use crate::protocol_client::ProtocolClient;
use crate::read_plan::{ReadBlock, ReadLimits, ReadPlan};
use crate::register_map::{self, RegisterField};
use crate::sample::{FieldValue, Sample};

/// Reachability of the device as seen by the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceHealth {
    /// No tick has completed yet
    Unknown,
    /// The last tick produced at least one value
    Online,
    /// Several consecutive ticks were skipped or produced nothing
    Unreachable,
}

/// Requests an immediate out-of-cycle poll.
#[derive(Debug, Clone)]
pub struct PollTrigger {
    tx: mpsc::Sender<()>,
}

impl PollTrigger {
    /// Ask for a refresh. Requests made while one is pending coalesce.
    pub fn refresh(&self) {
        let _ = self.tx.try_send(());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerOptions {
    /// Consecutive empty ticks before the device is reported unreachable
    pub unreachable_after: u32,
    pub limits: ReadLimits,
}

impl Default for PollerOptions {
    fn default() -> Self {
        Self {
            unreachable_after: DEFAULT_UNREACHABLE_AFTER,
            limits: ReadLimits::new(),
        }
    }
}

pub struct Poller {
    client: ProtocolClient,
    distributor: Distributor,
    config_rx: watch::Receiver<ConnectionConfig>,
    trigger_rx: mpsc::Receiver<()>,
    health_tx: watch::Sender<DeviceHealth>,
    plan: ReadPlan,
    options: PollerOptions,
    update_count: u64,
    empty_ticks: u32,
}

impl Poller {
    pub fn new(
        client: ProtocolClient,
        distributor: Distributor,
        config_rx: watch::Receiver<ConnectionConfig>,
        options: PollerOptions,
    ) -> (Self, PollTrigger, watch::Receiver<DeviceHealth>) {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (health_tx, health_rx) = watch::channel(DeviceHealth::Unknown);
        let plan = ReadPlan::build(register_map::fields(), &options.limits);

        debug!(
            requests = plan.request_count(),
            registers = plan.register_count(),
            "Read plan built"
        );

        let poller = Self {
            client,
            distributor,
            config_rx,
            trigger_rx,
            health_tx,
            plan,
            options,
            update_count: 0,
            empty_ticks: 0,
        };
        (poller, PollTrigger { tx: trigger_tx }, health_rx)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        let mut period = self.config_rx.borrow_and_update().poll_interval();
        let mut ticker = new_ticker(Instant::now(), period);
        let mut config_open = true;
        let mut trigger_open = true;

        info!(period_secs = period.as_secs(), "Poller started");

        loop {
            tokio::select! {
                changed = self.config_rx.changed(), if config_open => {
                    if changed.is_err() {
                        config_open = false;
                        continue;
                    }
                    let new_period = self.config_rx.borrow_and_update().poll_interval();
                    if new_period != period {
                        info!(period_secs = new_period.as_secs(), "Poll interval changed");
                        period = new_period;
                        ticker = ticker_from_now(period);
                    }
                }

                trigger = self.trigger_rx.recv(), if trigger_open => match trigger {
                    Some(()) => {
                        debug!("Out-of-cycle poll requested");
                        self.poll_once().await;
                    }
                    None => trigger_open = false,
                },

                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }
    }

    /// Run one tick. Returns the published sample, if any.
    pub async fn poll_once(&mut self) -> Option<Arc<Sample>> {
        if !self.client.is_connected() {
            debug!("Device not connected, skipping poll");
            self.record_empty_tick();
            return None;
        }

        let sample = collect_sample(&self.client, &self.plan, self.update_count + 1).await;

        if !sample.has_any_value() {
            warn!("Poll produced no values");
            self.record_empty_tick();
            return None;
        }

        self.update_count += 1;
        debug!(
            update_count = self.update_count,
            available = sample.available_count(),
            total = sample.values.len(),
            "Poll complete"
        );
        self.distributor.publish(sample);
        self.set_health(DeviceHealth::Online);
        self.empty_ticks = 0;
        self.distributor.latest()
    }

    fn record_empty_tick(&mut self) {
        self.empty_ticks = self.empty_ticks.saturating_add(1);
        if self.empty_ticks >= self.options.unreachable_after {
            self.set_health(DeviceHealth::Unreachable);
        }
    }

    fn set_health(&self, health: DeviceHealth) {
        let changed = self.health_tx.send_if_modified(|current| {
            if *current == health {
                false
            } else {
                *current = health;
                true
            }
        });

        if changed {
            match health {
                DeviceHealth::Unreachable => warn!(
                    empty_ticks = self.empty_ticks,
                    "Device unreachable"
                ),
                _ => info!(?health, "Device health changed"),
            }
        }
    }
}

fn new_ticker(start: Instant, period: std::time::Duration) -> Interval {
    let mut ticker = interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

fn ticker_from_now(period: std::time::Duration) -> Interval {
    new_ticker(Instant::now() + period, period)
}

/// Read every block of `plan` and assemble a sample.
///
/// A block the device rejects is retried field by field so one bad
/// register does not blank its neighbours. A timeout or malformed answer
/// only blanks the block it hit; the worker reconnects and the remaining
/// blocks are still read. Once no connection can be made at all, the rest
/// of the fields are marked unavailable without further requests.
pub async fn collect_sample(client: &ProtocolClient, plan: &ReadPlan, update_count: u64) -> Sample {
    let mut sample = Sample::new(Utc::now(), update_count);
    let mut link_down = false;

    for block in plan.blocks() {
        if link_down {
            mark_unavailable(&mut sample, block);
            continue;
        }

        match client.read_registers(block.start, block.count).await {
            Ok(words) => {
                for field in &block.fields {
                    insert_decoded(&mut sample, field, block.words_for(field, &words));
                }
            }
            Err(e @ MonitorError::Rejected { .. }) if block.fields.len() > 1 => {
                debug!(start = block.start, count = block.count, error = %e, "Block rejected, reading fields individually");
                for field in &block.fields {
                    if link_down {
                        sample.insert(field.name, FieldValue::Unavailable);
                        continue;
                    }
                    match client.read_registers(field.address, field.width).await {
                        Ok(words) => insert_decoded(&mut sample, field, Some(words.as_slice())),
                        Err(e) => {
                            debug!(field = field.name, error = %e, "Field read failed");
                            link_down = ends_cycle(&e);
                            sample.insert(field.name, FieldValue::Unavailable);
                        }
                    }
                }
            }
            Err(e) => {
                debug!(start = block.start, count = block.count, error = %e, "Block read failed");
                link_down = ends_cycle(&e);
                mark_unavailable(&mut sample, block);
            }
        }
    }

    sample.timestamp = Utc::now();
    sample
}

fn ends_cycle(error: &MonitorError) -> bool {
    matches!(error, MonitorError::NotConnected | MonitorError::Shutdown)
}

fn mark_unavailable(sample: &mut Sample, block: &ReadBlock) {
    for field in &block.fields {
        sample.insert(field.name, FieldValue::Unavailable);
    }
}

fn insert_decoded(sample: &mut Sample, field: &RegisterField, words: Option<&[u16]>) {
    let value = words
        .and_then(|w| decode_field(field, w).ok())
        .filter(|v| {
            let plausible = field.is_plausible(*v);
            if !plausible {
                debug!(field = field.name, value = *v, "Implausible value discarded");
            }
            plausible
        });
    sample.insert(field.name, value.into());
}
