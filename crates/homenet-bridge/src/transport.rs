//! Byte transports.
//!
//! The bus runtime is generic over [`ByteTransport`]; the serial link itself
//! is an external collaborator. Shipped here: the TCP-tunnelled serial
//! transport (ser2net-style gateways) with backoff reconnect, and an
//! in-memory pair for tests and simulation.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Transport failures.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The link is down and the write was dropped.
    #[error("transport disconnected: {0}")]
    Disconnected(String),

    /// I/O error on a connected link.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An opaque chunked byte link.
///
/// `recv` returns arbitrary chunks (framing is entirely the parser's job) or
/// `None` when the link is permanently closed. Implementations own their
/// reconnect policy; `recv` blocking across a reconnect is expected.
pub trait ByteTransport: Send {
    /// Receive the next chunk; `None` means the link is closed for good.
    fn recv(&mut self) -> impl Future<Output = Option<Bytes>> + Send;

    /// Write a frame.
    fn send(&mut self, bytes: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Initial reconnect backoff.
const BACKOFF_FLOOR: Duration = Duration::from_secs(1);
/// Backoff cap.
const BACKOFF_CEIL: Duration = Duration::from_secs(30);

/// TCP-tunnelled serial link with exponential-backoff reconnect (1 s → 30 s).
pub struct TcpSerialTransport {
    addr: String,
    stream: Option<TcpStream>,
    backoff: Duration,
    buf: Vec<u8>,
}

impl TcpSerialTransport {
    /// Transport for `host:port`; connects lazily on first use.
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into(), stream: None, backoff: BACKOFF_FLOOR, buf: vec![0; 1024] }
    }

    /// Connect, sleeping with doubled backoff between attempts.
    async fn connect_with_backoff(&mut self) {
        while self.stream.is_none() {
            match TcpStream::connect(&self.addr).await {
                Ok(stream) => {
                    tracing::info!(addr = %self.addr, "serial tunnel connected");
                    self.backoff = BACKOFF_FLOOR;
                    self.stream = Some(stream);
                },
                Err(err) => {
                    tracing::warn!(
                        addr = %self.addr,
                        error = %err,
                        retry_in = ?self.backoff,
                        "serial tunnel connect failed"
                    );
                    tokio::time::sleep(self.backoff).await;
                    self.backoff = (self.backoff * 2).min(BACKOFF_CEIL);
                },
            }
        }
    }

    fn drop_connection(&mut self, why: &dyn std::fmt::Display) {
        tracing::warn!(addr = %self.addr, error = %why, "serial tunnel dropped, reconnecting");
        self.stream = None;
    }
}

impl ByteTransport for TcpSerialTransport {
    async fn recv(&mut self) -> Option<Bytes> {
        loop {
            self.connect_with_backoff().await;
            let Some(stream) = self.stream.as_mut() else { continue };
            match stream.read(&mut self.buf).await {
                Ok(0) => self.drop_connection(&"peer closed"),
                Ok(n) => return Some(Bytes::copy_from_slice(&self.buf[..n])),
                Err(err) => self.drop_connection(&err),
            }
        }
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.connect_with_backoff().await;
        let Some(stream) = self.stream.as_mut() else {
            return Err(TransportError::Disconnected(self.addr.clone()));
        };
        if let Err(err) = stream.write_all(bytes).await {
            self.drop_connection(&err);
            return Err(TransportError::Io(err));
        }
        Ok(())
    }
}

/// In-memory transport endpoint; see [`memory_pair`].
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

/// A connected pair of in-memory transports.
///
/// Bytes sent on one side arrive as chunks on the other; dropping one side
/// closes the peer's `recv`. One end plays the bus, the other the device.
pub fn memory_pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (MemoryTransport { tx: a_tx, rx: b_rx }, MemoryTransport { tx: b_tx, rx: a_rx })
}

impl ByteTransport for MemoryTransport {
    async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.tx
            .send(Bytes::copy_from_slice(bytes))
            .map_err(|_| TransportError::Disconnected("memory peer dropped".to_owned()))
    }
}
