//! Network transport for Modbus TCP
//!
//! A transport performs exactly one request/response exchange at a time:
//! it frames the PDU with an MBAP header, writes it, and reads back the
//! single matching response. Every wait is bounded by the exchange timeout.
//! When a failure leaves the stream off a frame boundary (I/O error,
//! timeout, unusable MBAP header) the socket is dropped and the transport
//! reports itself disconnected. A complete frame with bad contents keeps it.

use std::future::Future;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

use crate::constants::{MAX_MBAP_LENGTH, MBAP_HEADER_LEN, MODBUS_PROTOCOL_ID};
use crate::error::{MonitorError, MonitorResult};
use crate::pdu::ModbusPdu;

/// Counters kept by a transport over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// A request/response channel to one device.
pub trait ModbusTransport: Send {
    /// Send `pdu` addressed to `slave_id` and wait for the matching response.
    fn request(
        &mut self,
        slave_id: u8,
        pdu: &ModbusPdu,
    ) -> impl Future<Output = MonitorResult<ModbusPdu>> + Send;

    /// Whether the underlying connection is still open.
    fn is_connected(&self) -> bool;

    /// Close the connection. Idempotent.
    fn close(&mut self) -> impl Future<Output = MonitorResult<()>> + Send;

    /// Get transport statistics.
    fn get_stats(&self) -> TransportStats;
}

/// Modbus Application Protocol header (MBAP) including the unit identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    /// Transaction identifier, echoed by the server.
    pub transaction_id: u16,
    /// Protocol identifier (0 for Modbus).
    pub protocol_id: u16,
    /// Length of the remaining data (unit ID + PDU).
    pub length: u16,
    /// Unit identifier (slave address).
    pub unit_id: u8,
}

impl MbapHeader {
    /// Header size on the wire, unit ID included.
    pub const SIZE: usize = MBAP_HEADER_LEN + 1;

    /// Parse a header from its wire bytes.
    pub fn decode(bytes: &[u8; Self::SIZE]) -> Self {
        let mut buf = &bytes[..];
        Self {
            transaction_id: buf.get_u16(),
            protocol_id: buf.get_u16(),
            length: buf.get_u16(),
            unit_id: buf.get_u8(),
        }
    }

    /// Length of the PDU that follows the header.
    pub fn pdu_len(&self) -> MonitorResult<usize> {
        let length = self.length as usize;
        if length < 2 || length > MAX_MBAP_LENGTH {
            return Err(MonitorError::protocol(format!(
                "Invalid MBAP length field: {}",
                length
            )));
        }
        Ok(length - 1)
    }
}

/// Frame a PDU as a Modbus TCP ADU.
pub fn encode_frame(transaction_id: u16, unit_id: u8, pdu: &ModbusPdu) -> Bytes {
    let mut frame = BytesMut::with_capacity(MbapHeader::SIZE + pdu.len());
    frame.put_u16(transaction_id);
    frame.put_u16(MODBUS_PROTOCOL_ID);
    frame.put_u16(pdu.len() as u16 + 1);
    frame.put_u8(unit_id);
    frame.put_slice(pdu.as_slice());
    frame.freeze()
}

/// Modbus TCP transport over a tokio `TcpStream`.
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    /// Remote `host:port`
    pub address: String,
    timeout: Duration,
    transaction_id: u16,
    stats: TransportStats,
}

impl TcpTransport {
    /// Open a connection to `host:port`.
    ///
    /// Fails with [`MonitorError::Connect`] on refusal, resolution failure or
    /// when `connect_timeout` elapses.
    pub async fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        timeout: Duration,
    ) -> MonitorResult<Self> {
        let address = format!("{}:{}", host, port);
        debug!(%address, "Opening Modbus TCP connection");

        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect((host, port)))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(MonitorError::connect(format!("{}: {}", address, e)));
            }
            Err(_) => {
                return Err(MonitorError::connect(format!(
                    "{}: no answer within {} ms",
                    address,
                    connect_timeout.as_millis()
                )));
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!(%address, error = %e, "Failed to set TCP_NODELAY");
        }

        info!(%address, "Connected to Modbus TCP device");
        Ok(Self {
            stream: Some(stream),
            address,
            timeout,
            transaction_id: 0,
            stats: TransportStats::default(),
        })
    }

    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        self.transaction_id
    }
}

impl ModbusTransport for TcpTransport {
    async fn request(&mut self, slave_id: u8, pdu: &ModbusPdu) -> MonitorResult<ModbusPdu> {
        let transaction_id = self.next_transaction_id();
        let frame = encode_frame(transaction_id, slave_id, pdu);
        let timeout = self.timeout;

        let stream = self.stream.as_mut().ok_or(MonitorError::NotConnected)?;
        trace!(transaction_id, frame = ?&frame[..], "Sending Modbus request");

        let result = match tokio::time::timeout(
            timeout,
            exchange(stream, &frame, transaction_id, slave_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                self.stats.timeouts += 1;
                Err(ExchangeError::desync(MonitorError::timeout(
                    format!("no response to transaction {}", transaction_id),
                    timeout.as_millis() as u64,
                )))
            }
        };

        self.stats.requests_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;

        match result {
            Ok(response) => {
                self.stats.responses_received += 1;
                self.stats.bytes_received += (MbapHeader::SIZE + response.len()) as u64;
                Ok(response)
            }
            Err(ExchangeError { error, desync }) => {
                self.stats.errors += 1;
                if desync {
                    warn!(address = %self.address, error = %error, "Dropping Modbus TCP connection");
                    self.stream = None;
                }
                Err(error)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn close(&mut self) -> MonitorResult<()> {
        if let Some(mut stream) = self.stream.take() {
            debug!(address = %self.address, "Closing Modbus TCP connection");
            // The peer may already be gone; the socket is released either way.
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats
    }
}

/// Failed exchange. `desync` is set when the stream can no longer be
/// trusted to sit on a frame boundary.
#[derive(Debug)]
struct ExchangeError {
    error: MonitorError,
    desync: bool,
}

impl ExchangeError {
    fn desync(error: MonitorError) -> Self {
        Self {
            error,
            desync: true,
        }
    }

    fn framed(error: MonitorError) -> Self {
        Self {
            error,
            desync: false,
        }
    }
}

async fn exchange(
    stream: &mut TcpStream,
    frame: &[u8],
    transaction_id: u16,
    unit_id: u8,
) -> Result<ModbusPdu, ExchangeError> {
    stream.write_all(frame).await.map_err(|e| {
        ExchangeError::desync(MonitorError::connection_lost(format!("Send failed: {}", e)))
    })?;

    let mut header_buf = [0u8; MbapHeader::SIZE];
    stream.read_exact(&mut header_buf).await.map_err(|e| {
        ExchangeError::desync(MonitorError::connection_lost(format!(
            "Receive header failed: {}",
            e
        )))
    })?;
    let header = MbapHeader::decode(&header_buf);

    // Without a trustworthy length the body cannot be skipped.
    if header.protocol_id != MODBUS_PROTOCOL_ID {
        return Err(ExchangeError::desync(MonitorError::protocol(format!(
            "Invalid protocol ID: {}",
            header.protocol_id
        ))));
    }
    let pdu_len = header.pdu_len().map_err(ExchangeError::desync)?;

    let mut body = vec![0u8; pdu_len];
    stream.read_exact(&mut body).await.map_err(|e| {
        ExchangeError::desync(MonitorError::connection_lost(format!(
            "Receive PDU failed: {}",
            e
        )))
    })?;

    // The whole frame is consumed from here on.
    if header.transaction_id != transaction_id {
        return Err(ExchangeError::framed(MonitorError::protocol(format!(
            "Transaction ID mismatch: expected {}, got {}",
            transaction_id, header.transaction_id
        ))));
    }

    if header.unit_id != unit_id {
        return Err(ExchangeError::framed(MonitorError::protocol(format!(
            "Unit ID mismatch: expected {}, got {}",
            unit_id, header.unit_id
        ))));
    }

    trace!(transaction_id, pdu = ?body, "Received Modbus response");
    ModbusPdu::from_slice(&body).map_err(ExchangeError::framed)
}
