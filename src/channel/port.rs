//! The [`Port`] trait and the in-memory implementation used by the harness and tests.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

use super::Frame;

/// One duplex message port (§4.1, §6 "Transport").
///
/// A `Port` is the Rust-native stand-in for the browser `MessagePort` the
/// original coordinator runs over: something that can send and receive
/// [`Frame`]s and signals its own closure by ending its receive side. Real
/// transports (a Unix socket, a WebSocket) implement this trait; this crate
/// ships only [`MemoryPort`], the in-process pair used by the bundled
/// harness and the integration tests.
#[async_trait]
pub trait Port: Send + Sync {
    /// Send one frame. Errors only on a definitely-dead transport.
    async fn send(&self, frame: Frame) -> Result<(), PortError>;

    /// Receive the next frame, or `None` once the peer has gone away.
    async fn recv(&self) -> Option<Frame>;
}

/// The port died; all in-flight requests over it should fail as disconnected.
#[derive(Debug, thiserror::Error)]
#[error("port closed")]
pub struct PortError;

/// An in-process duplex port backed by two `tokio::mpsc` channels.
///
/// `MemoryPort::pair()` returns two ends already wired to each other, as if
/// a single `MessageChannel` had been constructed and its two ports handed
/// to each side.
pub struct MemoryPort {
    tx: mpsc::UnboundedSender<Frame>,
    rx: Mutex<mpsc::UnboundedReceiver<Frame>>,
}

impl MemoryPort {
    pub fn pair() -> (MemoryPort, MemoryPort) {
        let (tx_a, rx_b) = mpsc::unbounded_channel();
        let (tx_b, rx_a) = mpsc::unbounded_channel();
        (
            MemoryPort {
                tx: tx_a,
                rx: Mutex::new(rx_a),
            },
            MemoryPort {
                tx: tx_b,
                rx: Mutex::new(rx_b),
            },
        )
    }
}

#[async_trait]
impl Port for MemoryPort {
    async fn send(&self, frame: Frame) -> Result<(), PortError> {
        self.tx.send(frame).map_err(|_| PortError)
    }

    async fn recv(&self) -> Option<Frame> {
        self.rx.lock().await.recv().await
    }
}
