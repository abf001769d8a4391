//! The request/response + notification transport over one duplex [`Port`] (§4.1).

mod port;

pub use port::{MemoryPort, Port, PortError};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::engine::SyncStatus;
use crate::errors::ChannelError;

/// The tagged kinds a [`Frame`] can carry (§4.1, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    StartSynchronization,
    AbortSynchronization,
    Ping,
    RequestDatabase,
    CredentialsCallback,
    InvalidCredentialsCallback,
    UploadCrud,
    NotifySyncStatus,
    LogEvent,
}

/// The payload carried by a [`Frame`], one variant per [`MessageKind`].
///
/// `Port` implementations that cross a real wire would serialize everything
/// except [`Payload::DatabaseEndpoint`]'s port field, which only makes sense
/// between transports in the same process (or one that can hand off a live
/// connection) — exactly the "transferable" the original spec calls out.
pub enum Payload {
    /// Carries no data; used as the reply to several requests and as the
    /// request body of kinds that need none.
    Empty,
    StartSynchronization {
        database_name: String,
    },
    DatabaseEndpoint {
        port: Arc<dyn Port>,
        database_name: String,
        lock_name: String,
    },
    Credentials(serde_json::Value),
    NotifySyncStatus {
        status: SyncStatus,
    },
    LogEvent {
        text: String,
    },
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Empty => write!(f, "Empty"),
            Payload::StartSynchronization { database_name } => {
                write!(f, "StartSynchronization({database_name})")
            }
            Payload::DatabaseEndpoint {
                database_name,
                lock_name,
                ..
            } => write!(f, "DatabaseEndpoint({database_name}, {lock_name})"),
            Payload::Credentials(_) => write!(f, "Credentials(..)"),
            Payload::NotifySyncStatus { status } => write!(f, "NotifySyncStatus({status:?})"),
            Payload::LogEvent { text } => write!(f, "LogEvent({text:?})"),
        }
    }
}

/// One message over the wire: a request, a reply, or a notification.
#[derive(Debug)]
pub struct Frame {
    pub kind: MessageKind,
    pub correlation_id: Option<u64>,
    pub payload: Payload,
    pub is_reply: bool,
    /// Set on a reply frame that represents a failed request (§4.1 "fails the
    /// request with a protocol error" / §7 Transport).
    pub error: Option<String>,
}

impl Frame {
    pub fn request(kind: MessageKind, correlation_id: u64, payload: Payload) -> Self {
        Frame {
            kind,
            correlation_id: Some(correlation_id),
            payload,
            is_reply: false,
            error: None,
        }
    }

    pub fn notification(kind: MessageKind, payload: Payload) -> Self {
        Frame {
            kind,
            correlation_id: None,
            payload,
            is_reply: false,
            error: None,
        }
    }

    fn ok_reply(kind: MessageKind, correlation_id: u64, payload: Payload) -> Self {
        Frame {
            kind,
            correlation_id: Some(correlation_id),
            payload,
            is_reply: true,
            error: None,
        }
    }

    fn err_reply(kind: MessageKind, correlation_id: u64, error: String) -> Self {
        Frame {
            kind,
            correlation_id: Some(correlation_id),
            payload: Payload::Empty,
            is_reply: true,
            error: Some(error),
        }
    }
}

/// A server-role request handler: `(kind, payload) -> reply`. Installed once
/// per channel (§4.1 "installs a requestHandler").
pub type RequestHandler =
    Arc<dyn Fn(MessageKind, Payload) -> BoxFuture<'static, Result<Payload, ChannelError>> + Send + Sync>;

/// Dispatched for every inbound notification frame.
pub type NotificationHandler = Arc<dyn Fn(MessageKind, Payload) + Send + Sync>;

/// Invoked once, when the underlying port signals closure.
pub type CloseHandler = Arc<dyn Fn() + Send + Sync>;

/// Bidirectional request/response + notification channel over one [`Port`].
pub struct Channel {
    port: Arc<dyn Port>,
    next_correlation: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<Result<Payload, ChannelError>>>,
    request_handler: OnceLock<RequestHandler>,
    notification_handler: OnceLock<NotificationHandler>,
    on_close: OnceLock<CloseHandler>,
}

impl Channel {
    /// Bind a channel to `port`. The read loop does not start until
    /// [`Channel::start`] is called — giving the caller a chance to install
    /// handlers first, so an eager peer can never have its first frame
    /// dispatched against a not-yet-installed handler.
    pub fn new(port: Arc<dyn Port>) -> Arc<Self> {
        Arc::new(Channel {
            port,
            next_correlation: AtomicU64::new(1),
            pending: DashMap::new(),
            request_handler: OnceLock::new(),
            notification_handler: OnceLock::new(),
            on_close: OnceLock::new(),
        })
    }

    /// Start the read loop. Call once handlers are installed (§4.1 "installs
    /// a requestHandler"); frames that arrive before this point are simply
    /// not read yet, so there is no window where a frame reaches
    /// `handle_frame` without a handler in place.
    pub fn start(self: &Arc<Self>) {
        tokio::spawn(Channel::run(self.clone()));
    }

    /// Install the server-role request handler. May be set only once; later
    /// calls are ignored (a channel is bound to exactly one owner).
    pub fn set_request_handler(&self, handler: RequestHandler) {
        let _ = self.request_handler.set(handler);
    }

    pub fn set_notification_handler(&self, handler: NotificationHandler) {
        let _ = self.notification_handler.set(handler);
    }

    /// Invoked once when the port closes (§7 Transport: "in-flight requests
    /// fail with disconnected; the Connected Client is marked closed").
    pub fn set_on_close(&self, handler: CloseHandler) {
        let _ = self.on_close.set(handler);
    }

    fn next_id(&self) -> u64 {
        self.next_correlation.fetch_add(1, Ordering::Relaxed)
    }

    /// Issue a correlated request and await the peer's reply.
    pub async fn request(&self, kind: MessageKind, payload: Payload) -> Result<Payload, ChannelError> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        if self.port.send(Frame::request(kind, id, payload)).await.is_err() {
            self.pending.remove(&id);
            return Err(ChannelError::Disconnected);
        }
        rx.await.unwrap_or(Err(ChannelError::Disconnected))
    }

    /// One-way send; never fails observably (§4.1).
    pub async fn notify(&self, kind: MessageKind, payload: Payload) {
        let _ = self.port.send(Frame::notification(kind, payload)).await;
    }

    /// Fixed-kind request used for liveness (§4.3 "Host election").
    pub async fn ping(&self) -> Result<Payload, ChannelError> {
        self.request(MessageKind::Ping, Payload::Empty).await
    }

    async fn run(self: Arc<Self>) {
        loop {
            match self.port.recv().await {
                Some(frame) => self.handle_frame(frame).await,
                None => {
                    for entry in self.pending_drain() {
                        let _ = entry.send(Err(ChannelError::Disconnected));
                    }
                    if let Some(on_close) = self.on_close.get() {
                        on_close();
                    }
                    return;
                }
            }
        }
    }

    fn pending_drain(&self) -> Vec<oneshot::Sender<Result<Payload, ChannelError>>> {
        let keys: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        keys.into_iter()
            .filter_map(|k| self.pending.remove(&k).map(|(_, v)| v))
            .collect()
    }

    async fn handle_frame(self: &Arc<Self>, frame: Frame) {
        if frame.is_reply {
            let Some(id) = frame.correlation_id else {
                return;
            };
            if let Some((_, tx)) = self.pending.remove(&id) {
                let result = match frame.error {
                    Some(message) => Err(ChannelError::Remote(message)),
                    None => Ok(frame.payload),
                };
                let _ = tx.send(result);
            }
            return;
        }

        match frame.correlation_id {
            Some(id) => {
                let this = self.clone();
                let kind = frame.kind;
                let payload = frame.payload;
                tokio::spawn(async move {
                    let reply = match this.request_handler.get() {
                        Some(handler) => match handler(kind, payload).await {
                            Ok(reply_payload) => Frame::ok_reply(kind, id, reply_payload),
                            Err(error) => Frame::err_reply(kind, id, error.to_string()),
                        },
                        None => Frame::err_reply(kind, id, ChannelError::NoHandler(kind).to_string()),
                    };
                    let _ = this.port.send(reply).await;
                });
            }
            None => {
                if let Some(handler) = self.notification_handler.get() {
                    handler(frame.kind, frame.payload);
                }
            }
        }
    }
}
