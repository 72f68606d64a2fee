//! In-process Modbus TCP device for integration tests.
//!
//! Serves FC03/FC06/FC16 from an in-memory register bank. Every request is
//! handled on its own task so pipelined requests would overlap and show up
//! in [`FakeDevice::max_in_flight`].

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use inverter_monitor::{ConfigStore, ConnectionConfig, MonitorOptions, Sample, ViewerSession};
use inverter_monitor::{ClientOptions, PollerOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One request as seen by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggedRequest {
    pub function: u8,
    pub address: u16,
    pub quantity: u16,
}

#[derive(Default)]
struct DeviceState {
    registers: Mutex<HashMap<u16, u16>>,
    exception_addresses: Mutex<HashSet<u16>>,
    silent_addresses: Mutex<HashSet<u16>>,
    corrupt_addresses: Mutex<HashSet<u16>>,
    delay: Mutex<Duration>,
    log: Mutex<Vec<LoggedRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    open_connections: AtomicUsize,
    accepted: AtomicUsize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub struct FakeDevice {
    addr: SocketAddr,
    state: Arc<DeviceState>,
    accept: JoinHandle<()>,
}

impl FakeDevice {
    /// Listen on an ephemeral localhost port.
    pub async fn start() -> Self {
        Self::start_on(0).await
    }

    /// Listen on a specific localhost port.
    pub async fn start_on(port: u16) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(DeviceState::default());

        let accept_state = state.clone();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                let conn_state = accept_state.clone();
                let task = tokio::spawn(serve_connection(stream, conn_state));
                accept_state.tasks.lock().unwrap().push(task);
            }
        });

        Self {
            addr,
            state,
            accept,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Connection config pointing at this device.
    pub fn config(&self) -> ConnectionConfig {
        ConnectionConfig::new("127.0.0.1", self.port(), 1)
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.state.registers.lock().unwrap().insert(address, value);
    }

    pub fn set_registers(&self, address: u16, values: &[u16]) {
        let mut registers = self.state.registers.lock().unwrap();
        for (i, v) in values.iter().enumerate() {
            registers.insert(address + i as u16, *v);
        }
    }

    pub fn register(&self, address: u16) -> u16 {
        self.state
            .registers
            .lock()
            .unwrap()
            .get(&address)
            .copied()
            .unwrap_or(0)
    }

    /// Answer requests touching `address` with exception 0x02.
    pub fn reject_address(&self, address: u16) {
        self.state.exception_addresses.lock().unwrap().insert(address);
    }

    /// Never answer requests touching `address`.
    pub fn silence_address(&self, address: u16) {
        self.state.silent_addresses.lock().unwrap().insert(address);
    }

    /// Answer reads touching `address` with a well-framed PDU whose byte
    /// count claims one more register than it carries.
    pub fn corrupt_address(&self, address: u16) {
        self.state.corrupt_addresses.lock().unwrap().insert(address);
    }

    /// Delay every response by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock().unwrap() = delay;
    }

    pub fn requests(&self) -> Vec<LoggedRequest> {
        self.state.log.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.log.lock().unwrap().len()
    }

    pub fn writes(&self) -> Vec<LoggedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.function != 0x03)
            .collect()
    }

    /// Highest number of requests the device was handling at once.
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.state.open_connections.load(Ordering::SeqCst)
    }

    /// Connections accepted since start.
    pub fn connection_count(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Stop listening and drop every connection.
    pub fn stop(&self) {
        self.accept.abort();
        for task in self.state.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A localhost port with nothing listening on it (at the time of the call).
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

struct OpenConnection(Arc<DeviceState>);

impl Drop for OpenConnection {
    fn drop(&mut self) {
        self.0.open_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn serve_connection(stream: TcpStream, state: Arc<DeviceState>) {
    state.open_connections.fetch_add(1, Ordering::SeqCst);
    let _open = OpenConnection(state.clone());

    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(16);

    let write_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    loop {
        let mut header = [0u8; 7];
        if reader.read_exact(&mut header).await.is_err() {
            break;
        }
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        if length < 2 {
            break;
        }
        let mut pdu = vec![0u8; length - 1];
        if reader.read_exact(&mut pdu).await.is_err() {
            break;
        }

        let state = state.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let in_flight = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            state.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

            let delay = *state.delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let response = handle_pdu(&state, &pdu);
            state.in_flight.fetch_sub(1, Ordering::SeqCst);

            if let Some(response) = response {
                let mut frame = Vec::with_capacity(7 + response.len());
                frame.extend_from_slice(&header[0..4]);
                frame.extend_from_slice(&((response.len() + 1) as u16).to_be_bytes());
                frame.push(header[6]);
                frame.extend_from_slice(&response);
                let _ = tx.send(frame).await;
            }
        });
    }

    write_task.abort();
}

fn handle_pdu(state: &DeviceState, pdu: &[u8]) -> Option<Vec<u8>> {
    if pdu.len() < 5 {
        return Some(vec![pdu.first().copied().unwrap_or(0) | 0x80, 0x03]);
    }
    let function = pdu[0];
    let address = u16::from_be_bytes([pdu[1], pdu[2]]);
    let second = u16::from_be_bytes([pdu[3], pdu[4]]);
    let quantity = if function == 0x06 { 1 } else { second };

    state.log.lock().unwrap().push(LoggedRequest {
        function,
        address,
        quantity,
    });

    let touched = |set: &Mutex<HashSet<u16>>| {
        let set = set.lock().unwrap();
        (0..quantity).any(|i| set.contains(&address.wrapping_add(i)))
    };
    if touched(&state.silent_addresses) {
        return None;
    }
    if touched(&state.exception_addresses) {
        return Some(vec![function | 0x80, 0x02]);
    }

    let corrupt = touched(&state.corrupt_addresses);
    let mut registers = state.registers.lock().unwrap();
    match function {
        0x03 if corrupt => {
            let mut response = vec![0x03, (quantity * 2) as u8];
            for i in 1..quantity {
                let value = registers.get(&address.wrapping_add(i)).copied().unwrap_or(0);
                response.extend_from_slice(&value.to_be_bytes());
            }
            Some(response)
        }
        0x03 => {
            let mut response = vec![0x03, (quantity * 2) as u8];
            for i in 0..quantity {
                let value = registers.get(&address.wrapping_add(i)).copied().unwrap_or(0);
                response.extend_from_slice(&value.to_be_bytes());
            }
            Some(response)
        }
        0x06 => {
            registers.insert(address, second);
            Some(pdu[..5].to_vec())
        }
        0x10 => {
            for i in 0..quantity as usize {
                let offset = 6 + i * 2;
                let value = u16::from_be_bytes([pdu[offset], pdu[offset + 1]]);
                registers.insert(address.wrapping_add(i as u16), value);
            }
            Some(pdu[..5].to_vec())
        }
        other => Some(vec![other | 0x80, 0x01]),
    }
}

/// Monitor options tuned for fast tests.
pub fn fast_options() -> MonitorOptions {
    MonitorOptions {
        client: ClientOptions::default()
            .with_connect_timeout(Duration::from_millis(200))
            .with_exchange_timeout(Duration::from_millis(300))
            .with_backoff(Duration::from_millis(50), Duration::from_millis(200)),
        poller: PollerOptions::default(),
        verify_delay: Duration::from_millis(50),
    }
}

/// Config store in `dir` whose effective config is `config`.
pub async fn store_for(dir: &std::path::Path, config: ConnectionConfig) -> Arc<ConfigStore> {
    Arc::new(ConfigStore::load(dir, config).await)
}

/// Wait for a sample satisfying `accept`, giving up after `within`.
pub async fn next_matching<F>(
    viewer: &mut ViewerSession,
    within: Duration,
    accept: F,
) -> Option<Arc<Sample>>
where
    F: Fn(&Sample) -> bool,
{
    tokio::time::timeout(within, async {
        while let Some(sample) = viewer.next().await {
            if accept(&sample) {
                return Some(sample);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// Keep requesting refreshes until a sample satisfying `accept` arrives.
pub async fn refresh_until<F>(
    monitor: &inverter_monitor::Monitor,
    viewer: &mut ViewerSession,
    within: Duration,
    accept: F,
) -> Option<Arc<Sample>>
where
    F: Fn(&Sample) -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        monitor.refresh();
        if let Some(sample) = next_matching(viewer, Duration::from_millis(200), &accept).await {
            return Some(sample);
        }
    }
    None
}

/// Poll `check` until it holds, giving up after `within`.
pub async fn eventually<F>(within: Duration, check: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Register image of a healthy, mid-afternoon inverter.
pub fn seed_registers(device: &FakeDevice) {
    device.set_registers(35105, &[0, 1200]); // ppv1
    device.set_registers(35109, &[0, 800]); // ppv2
    device.set_registers(35137, &[0, 1900]);
    device.set_registers(35139, &[0xFFFF, 0xFE0C]); // -500 W export
    device.set_registers(35171, &[0, 1400]);
    device.set_register(35180, 5234); // 523.4 V
    device.set_register(35181, 0xFFEC); // -2.0 A
    device.set_registers(35182, &[0xFFFF, 0xFC18]); // -1000 W
    device.set_registers(35193, &[0, 123]);
    device.set_register(35208, 45);
    device.set_register(35211, 12);
    device.set_register(37003, 251); // 25.1 °C
    device.set_register(37007, 55);
    device.set_register(47120, 0);
    device.set_register(47510, 10000);
}
