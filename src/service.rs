//! Wiring of the monitor core
//!
//! [`Monitor`] starts the connection worker and the poller for a
//! [`ConfigStore`], and hands out the pieces the outer application talks to:
//! viewer sessions, the write gateway, and the configuration store itself.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{ConfigStore, ConnectionConfig};
use crate::distributor::{Distributor, ViewerSession};
use crate::error::MonitorResult;
use crate::gateway::WriteGateway;
use crate::poller::{DeviceHealth, PollTrigger, Poller, PollerOptions};
use crate::protocol_client::{ClientOptions, ConnectionState, ProtocolClient};
use crate::sample::Sample;

/// Tunables for a [`Monitor`]; defaults match production use.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorOptions {
    pub client: ClientOptions,
    pub poller: PollerOptions,
    pub verify_delay: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            client: ClientOptions::default(),
            poller: PollerOptions::default(),
            verify_delay: Duration::from_millis(crate::constants::DEFAULT_VERIFY_DELAY_MS),
        }
    }
}

/// Running monitor: one device connection, one poller, any number of viewers.
pub struct Monitor {
    config: Arc<ConfigStore>,
    client: ProtocolClient,
    distributor: Distributor,
    gateway: WriteGateway,
    trigger: PollTrigger,
    health: watch::Receiver<DeviceHealth>,
    tasks: Vec<JoinHandle<()>>,
}

impl Monitor {
    /// Start the connection worker and the poller.
    pub fn start(config: Arc<ConfigStore>, options: MonitorOptions) -> Self {
        let (client, worker) = ProtocolClient::spawn(config.subscribe(), options.client);
        let distributor = Distributor::new();
        let (poller, trigger, health) = Poller::new(
            client.clone(),
            distributor.clone(),
            config.subscribe(),
            options.poller,
        );
        let gateway =
            WriteGateway::new(client.clone(), trigger.clone()).with_verify_delay(options.verify_delay);

        let effective = config.effective_config();
        info!(
            endpoint = %effective.endpoint(),
            slave_id = effective.slave_id,
            poll_interval = effective.poll_interval_secs,
            "Monitor started"
        );

        Self {
            config,
            client,
            distributor,
            gateway,
            trigger,
            health,
            tasks: vec![worker, poller.spawn()],
        }
    }

    /// Open a viewer session.
    pub fn subscribe(&self) -> ViewerSession {
        self.distributor.subscribe()
    }

    pub fn distributor(&self) -> &Distributor {
        &self.distributor
    }

    pub fn gateway(&self) -> &WriteGateway {
        &self.gateway
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn client(&self) -> &ProtocolClient {
        &self.client
    }

    /// Change connection parameters; the link is rebuilt if the endpoint moved.
    pub async fn update_config(&self, new: ConnectionConfig) -> MonitorResult<ConnectionConfig> {
        self.config.update(new).await
    }

    /// Ask the poller for an immediate refresh.
    pub fn refresh(&self) {
        self.trigger.refresh();
    }

    pub fn latest(&self) -> Option<Arc<Sample>> {
        self.distributor.latest()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.client.state()
    }

    pub fn health(&self) -> DeviceHealth {
        *self.health.borrow()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<DeviceHealth> {
        self.health.clone()
    }

    /// Stop the poller and the connection worker.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Monitor stopped");
    }
}
