//! Connection owner for the single device link
//!
//! [`ProtocolClient`] is a cheap, cloneable handle. All exchanges are sent
//! over a bounded queue to one worker task that owns the TCP connection, so
//! the wire never sees two overlapping requests no matter how many callers
//! there are.
//!
//! The worker:
//! - connects to the endpoint in the current [`ConnectionConfig`], retrying
//!   with exponential backoff while the device is unreachable,
//! - executes queued exchanges one at a time,
//! - drops the connection on a transport fault and reopens it right away;
//!   requests queued meanwhile wait for the new connection,
//! - closes the connection and reconnects immediately when the endpoint in
//!   the configuration changes, aborting any exchange in flight.
//!
//! ```text
//! Disconnected -> Connecting -> Ready -> Busy -> Ready
//!       ^              |          |        |
//!       +--------------+----------+--------+  (fault, close, reconfigure)
//! ```

use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{ModbusClient, ModbusTcpClient};
use crate::config::ConnectionConfig;
use crate::constants::{
    DEFAULT_BACKOFF_INITIAL_MS, DEFAULT_BACKOFF_MAX_MS, DEFAULT_CONNECT_TIMEOUT_MS,
    DEFAULT_EXCHANGE_TIMEOUT_MS, MAX_READ_REGISTERS, MAX_WRITE_REGISTERS,
};
use crate::error::{MonitorError, MonitorResult};

/// Lifecycle of the device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection; a reconnect is pending
    Disconnected,
    /// Opening the TCP connection
    Connecting,
    /// Connected and idle
    Ready,
    /// An exchange is on the wire
    Busy,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Ready | Self::Busy)
    }
}

/// Timing knobs of the connection worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    pub connect_timeout: Duration,
    pub exchange_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Exchanges that may wait for the connection before callers block
    pub queue_capacity: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            exchange_timeout: Duration::from_millis(DEFAULT_EXCHANGE_TIMEOUT_MS),
            backoff_initial: Duration::from_millis(DEFAULT_BACKOFF_INITIAL_MS),
            backoff_max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
            queue_capacity: 32,
        }
    }
}

impl ClientOptions {
    pub fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial = initial;
        self.backoff_max = max.max(initial);
        self
    }
}

/// Doubling reconnect delay with a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next attempt; doubles the following one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

// ============================================================================
// Worker protocol
// ============================================================================

#[derive(Debug)]
enum Operation {
    ReadHoldingRegisters { address: u16, quantity: u16 },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
}

#[derive(Debug)]
enum Outcome {
    Registers(Vec<u16>),
    Written,
}

#[derive(Debug)]
enum Responder {
    Registers(oneshot::Sender<MonitorResult<Vec<u16>>>),
    Written(oneshot::Sender<MonitorResult<()>>),
}

impl Responder {
    fn send(self, result: MonitorResult<Outcome>) {
        // A caller that gave up waiting has dropped its receiver.
        match (self, result) {
            (Self::Registers(tx), Ok(Outcome::Registers(words))) => {
                let _ = tx.send(Ok(words));
            }
            (Self::Written(tx), Ok(Outcome::Written)) => {
                let _ = tx.send(Ok(()));
            }
            (responder, Err(e)) => responder.fail(e),
            (responder, Ok(_)) => responder.fail(MonitorError::protocol("Mismatched exchange outcome")),
        }
    }

    fn fail(self, error: MonitorError) {
        match self {
            Self::Registers(tx) => {
                let _ = tx.send(Err(error));
            }
            Self::Written(tx) => {
                let _ = tx.send(Err(error));
            }
        }
    }
}

#[derive(Debug)]
struct WorkerRequest {
    operation: Operation,
    responder: Responder,
}

// ============================================================================
// Handle
// ============================================================================

/// Handle to the connection worker.
///
/// Cloning is cheap; the worker stops once every handle is dropped.
#[derive(Debug, Clone)]
pub struct ProtocolClient {
    requests: mpsc::Sender<WorkerRequest>,
    state: watch::Receiver<ConnectionState>,
}

impl ProtocolClient {
    /// Start the worker for the configuration published on `config`.
    pub fn spawn(
        config: watch::Receiver<ConnectionConfig>,
        options: ClientOptions,
    ) -> (Self, JoinHandle<()>) {
        let (requests, request_receiver) = mpsc::channel(options.queue_capacity.max(1));
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);

        let worker = Worker::new(request_receiver, config, state_tx, options);
        let handle = tokio::spawn(worker.run());

        (Self { requests, state }, handle)
    }

    /// Read `quantity` holding registers starting at `address`.
    pub async fn read_registers(&self, address: u16, quantity: u16) -> MonitorResult<Vec<u16>> {
        if quantity == 0 || quantity as usize > MAX_READ_REGISTERS {
            return Err(MonitorError::protocol(format!(
                "Invalid read quantity: {}",
                quantity
            )));
        }

        let (responder, receiver) = oneshot::channel();
        self.submit(
            Operation::ReadHoldingRegisters { address, quantity },
            Responder::Registers(responder),
        )
        .await?;
        receiver.await.map_err(|_| MonitorError::Shutdown)?
    }

    /// Write one holding register.
    pub async fn write_register(&self, address: u16, value: u16) -> MonitorResult<()> {
        let (responder, receiver) = oneshot::channel();
        self.submit(
            Operation::WriteSingleRegister { address, value },
            Responder::Written(responder),
        )
        .await?;
        receiver.await.map_err(|_| MonitorError::Shutdown)?
    }

    /// Write consecutive holding registers in one exchange.
    pub async fn write_registers(&self, address: u16, values: &[u16]) -> MonitorResult<()> {
        if values.is_empty() || values.len() > MAX_WRITE_REGISTERS {
            return Err(MonitorError::protocol(format!(
                "Invalid write quantity: {}",
                values.len()
            )));
        }

        let (responder, receiver) = oneshot::channel();
        self.submit(
            Operation::WriteMultipleRegisters {
                address,
                values: values.to_vec(),
            },
            Responder::Written(responder),
        )
        .await?;
        receiver.await.map_err(|_| MonitorError::Shutdown)?
    }

    async fn submit(&self, operation: Operation, responder: Responder) -> MonitorResult<()> {
        self.requests
            .send(WorkerRequest {
                operation,
                responder,
            })
            .await
            .map_err(|_| MonitorError::Shutdown)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Observe state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the connection is up, at most `within`.
    pub async fn wait_connected(&self, within: Duration) -> bool {
        let mut state = self.state.clone();
        tokio::time::timeout(within, state.wait_for(|s| s.is_connected()))
            .await
            .is_ok_and(|r| r.is_ok())
    }
}

// ============================================================================
// Worker
// ============================================================================

struct Worker {
    requests: mpsc::Receiver<WorkerRequest>,
    config_rx: watch::Receiver<ConnectionConfig>,
    config_open: bool,
    config: ConnectionConfig,
    state_tx: watch::Sender<ConnectionState>,
    options: ClientOptions,
    backoff: Backoff,
    link: Option<ModbusTcpClient>,
    next_attempt: Instant,
}

impl Worker {
    fn new(
        requests: mpsc::Receiver<WorkerRequest>,
        mut config_rx: watch::Receiver<ConnectionConfig>,
        state_tx: watch::Sender<ConnectionState>,
        options: ClientOptions,
    ) -> Self {
        let config = config_rx.borrow_and_update().clone();
        Self {
            requests,
            config_rx,
            config_open: true,
            config,
            state_tx,
            backoff: Backoff::new(options.backoff_initial, options.backoff_max),
            options,
            link: None,
            next_attempt: Instant::now(),
        }
    }

    async fn run(mut self) {
        info!(endpoint = %self.config.endpoint(), "Connection worker started");

        loop {
            let connect_due = self.link.is_none();
            tokio::select! {
                biased;

                changed = self.config_rx.changed(), if self.config_open => match changed {
                    Ok(()) => {
                        let new = self.config_rx.borrow_and_update().clone();
                        self.apply_config(new).await;
                    }
                    Err(_) => {
                        debug!("Configuration source closed");
                        self.config_open = false;
                    }
                },

                request = self.requests.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },

                _ = tokio::time::sleep_until(self.next_attempt), if connect_due => {
                    self.connect().await;
                }
            }
        }

        self.drop_link().await;
        self.set_state(ConnectionState::Disconnected);
        info!("Connection worker stopped");
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    async fn drop_link(&mut self) {
        if let Some(mut link) = self.link.take() {
            let _ = link.close().await;
        }
    }

    /// Adopt a new configuration; reconnect now if the endpoint moved.
    async fn apply_config(&mut self, new: ConnectionConfig) {
        if new.same_endpoint(&self.config) {
            self.config = new;
            return;
        }

        info!(
            from = %self.config.endpoint(),
            to = %new.endpoint(),
            slave_id = new.slave_id,
            "Connection parameters changed, reconnecting"
        );
        self.config = new;
        self.drop_link().await;
        self.set_state(ConnectionState::Disconnected);
        self.backoff.reset();
        self.next_attempt = Instant::now();
    }

    async fn connect(&mut self) {
        self.set_state(ConnectionState::Connecting);

        let host = self.config.host.clone();
        let port = self.config.port;
        let attempt = ModbusTcpClient::connect(
            &host,
            port,
            self.options.connect_timeout,
            self.options.exchange_timeout,
        );
        tokio::pin!(attempt);

        let result = loop {
            tokio::select! {
                biased;

                changed = self.config_rx.changed(), if self.config_open => {
                    if changed.is_err() {
                        self.config_open = false;
                        continue;
                    }
                    let new = self.config_rx.borrow_and_update().clone();
                    if new.same_endpoint(&self.config) {
                        self.config = new;
                        continue;
                    }
                    break Err(new);
                }

                result = &mut attempt => break Ok(result),
            }
        };

        match result {
            Ok(Ok(link)) => {
                info!(host = %host, port, "Device connection ready");
                self.link = Some(link);
                self.set_state(ConnectionState::Ready);
            }
            Ok(Err(e)) => {
                let delay = self.backoff.next_delay();
                self.next_attempt = Instant::now() + delay;
                self.set_state(ConnectionState::Disconnected);
                warn!(
                    host = %host,
                    port,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Device connection failed"
                );
            }
            Err(new) => {
                debug!(host = %host, port, "Connect attempt abandoned for new endpoint");
                self.apply_config(new).await;
            }
        }
    }

    async fn handle(&mut self, request: WorkerRequest) {
        let WorkerRequest {
            operation,
            responder,
        } = request;

        // A reconnect that is due now is served before the request; one
        // waiting out a backoff delay is not.
        if self.link.is_none() && Instant::now() >= self.next_attempt {
            self.connect().await;
        }
        if self.link.is_none() {
            responder.fail(MonitorError::NotConnected);
            return;
        }

        self.set_state(ConnectionState::Busy);
        let slave_id = self.config.slave_id;

        let (result, reconfigure) = match self.link.as_mut() {
            Some(link) => {
                let exchange = perform(link, slave_id, &operation);
                tokio::pin!(exchange);

                loop {
                    tokio::select! {
                        biased;

                        changed = self.config_rx.changed(), if self.config_open => {
                            if changed.is_err() {
                                self.config_open = false;
                                continue;
                            }
                            let new = self.config_rx.borrow_and_update().clone();
                            if new.same_endpoint(&self.config) {
                                self.config = new;
                                continue;
                            }
                            break (
                                Err(MonitorError::connection_lost(
                                    "exchange aborted by configuration change",
                                )),
                                Some(new),
                            );
                        }

                        result = &mut exchange => break (result, None),
                    }
                }
            }
            None => (Err(MonitorError::NotConnected), None),
        };

        let link_alive = self.link.as_ref().is_some_and(|l| l.is_connected());
        let fault = match &result {
            Ok(_) => {
                self.backoff.reset();
                false
            }
            Err(_) if reconfigure.is_some() => false,
            Err(e) if e.is_transport_fault() || !link_alive => {
                warn!(error = %e, ?operation, "Exchange failed, dropping connection");
                true
            }
            Err(e) => {
                debug!(error = %e, ?operation, "Exchange rejected");
                false
            }
        };

        // State settles before the caller sees the result.
        if let Some(new) = reconfigure {
            self.apply_config(new).await;
        } else if fault {
            self.drop_link().await;
            self.next_attempt = Instant::now();
            self.set_state(ConnectionState::Disconnected);
        } else {
            self.set_state(ConnectionState::Ready);
        }

        responder.send(result);
    }
}

async fn perform(
    link: &mut ModbusTcpClient,
    slave_id: u8,
    operation: &Operation,
) -> MonitorResult<Outcome> {
    match operation {
        Operation::ReadHoldingRegisters { address, quantity } => link
            .read_holding_registers(slave_id, *address, *quantity)
            .await
            .map(Outcome::Registers),
        Operation::WriteSingleRegister { address, value } => link
            .write_single_register(slave_id, *address, *value)
            .await
            .map(|_| Outcome::Written),
        Operation::WriteMultipleRegisters { address, values } => link
            .write_multiple_registers(slave_id, *address, values)
            .await
            .map(|_| Outcome::Written),
    }
}
