//! One connected tab (§4.2).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::channel::{Channel, MessageKind, Payload, Port};
use crate::errors::ChannelError;
use crate::logging::LogHub;
use crate::runner::SyncRunner;
use crate::worker::WorkerRoot;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a [`ConnectedClient`] for set membership in a runner's
/// `connections` (§3 "Connected Client").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

/// One tab, for the lifetime of its port (§4.2).
pub struct ConnectedClient {
    pub id: ClientId,
    self_handle: Weak<ConnectedClient>,
    channel: Arc<Channel>,
    worker: Arc<WorkerRoot>,
    runner: Mutex<Option<Arc<SyncRunner>>>,
    log_task: StdMutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ConnectedClient {
    /// Bind a channel to `port`, install the control-message handler, and
    /// start forwarding the worker-wide log stream (§4.2).
    pub fn spawn(worker: Arc<WorkerRoot>, port: Arc<dyn Port>, log_hub: &LogHub) -> Arc<ConnectedClient> {
        let channel = Channel::new(port);
        let client = Arc::new_cyclic(|weak| ConnectedClient {
            id: ClientId(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed)),
            self_handle: weak.clone(),
            channel,
            worker,
            runner: Mutex::new(None),
            log_task: StdMutex::new(None),
            closed: AtomicBool::new(false),
        });

        let handler_client = client.clone();
        client.channel.set_request_handler(Arc::new(move |kind, payload| {
            let client = handler_client.clone();
            Box::pin(async move { client.handle_request(kind, payload).await })
        }));

        let close_client = client.clone();
        client.channel.set_on_close(Arc::new(move || {
            let client = close_client.clone();
            tokio::spawn(async move {
                client.mark_closed().await;
            });
        }));

        let log_client = client.clone();
        let mut log_rx = log_hub.subscribe();
        let log_task = tokio::spawn(async move {
            loop {
                match log_rx.recv().await {
                    Ok(record) => {
                        log_client
                            .channel
                            .notify(
                                MessageKind::LogEvent,
                                Payload::LogEvent {
                                    text: record.format_line(),
                                },
                            )
                            .await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *client.log_task.lock().unwrap() = Some(log_task);

        client.channel.start();
        client
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// The `Arc` this client is always held behind; valid as long as `self`
    /// is reachable at all (the weak handle was taken from that same `Arc`
    /// at construction in [`Self::spawn`]).
    fn arc(&self) -> Arc<ConnectedClient> {
        self.self_handle
            .upgrade()
            .expect("ConnectedClient outlives its own Arc")
    }

    /// Exactly the two control requests a tab may send, per §4.2.
    async fn handle_request(&self, kind: MessageKind, payload: Payload) -> Result<Payload, ChannelError> {
        match kind {
            MessageKind::StartSynchronization => {
                let Payload::StartSynchronization { database_name } = payload else {
                    return Err(ChannelError::MalformedPayload(kind));
                };
                let runner = self.worker.reference_sync_task(&database_name, self.arc());
                *self.runner.lock().await = Some(runner);
                Ok(Payload::Empty)
            }
            MessageKind::AbortSynchronization => {
                let mut slot = self.runner.lock().await;
                if let Some(runner) = slot.take() {
                    runner.remove_connection(self.arc());
                }
                Ok(Payload::Empty)
            }
            other => Err(ChannelError::Protocol(other)),
        }
    }

    /// Cancel the log subscription, unregister from the runner if any, and
    /// clear the stored runner reference. Idempotent (§4.2, §8 law).
    pub async fn mark_closed(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.log_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(runner) = self.runner.lock().await.take() {
            runner.remove_connection(self.clone());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl PartialEq for ConnectedClient {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for ConnectedClient {}

impl std::hash::Hash for ConnectedClient {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Debug for ConnectedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedClient").field("id", &self.id).finish()
    }
}
