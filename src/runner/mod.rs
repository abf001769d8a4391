//! Per-database supervisor: host election, liveness, and the engine
//! lifecycle (§4.3).

mod state;

pub use state::RunnerState;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{MessageKind, Payload};
use crate::client::ConnectedClient;
use crate::config::RunnerConfig;
use crate::database::{DatabaseConnector, DatabaseEndpoint};
use crate::engine::{ClientCallbacks, EngineFactory, EngineParams};
use crate::errors::RunnerError;

/// One change to a runner's membership or engine lifecycle (§3 "Runner Event").
///
/// A closed sum type: handling must stay exhaustive as this enum grows.
pub enum RunnerEvent {
    AddConnection(Arc<ConnectedClient>),
    RemoveConnection(Arc<ConnectedClient>),
    ActiveDatabaseClosed,
}

/// Owns exactly one streaming-sync pipeline for `identifier` (§4.3). All
/// mutation of `(engine, host, connections)` happens on the single task
/// draining `events_tx`'s receiver (§5 "Serialization"); callers only ever
/// enqueue.
pub struct SyncRunner {
    pub identifier: String,
    events_tx: mpsc::UnboundedSender<RunnerEvent>,
    /// Bumped every time `state.host` is set or cleared, so a host-closed
    /// watcher spawned for a since-superseded host can tell it is stale
    /// without reaching into `RunnerState` from outside the queue task.
    host_generation: AtomicU64,
    /// Read-only mirror of `state.connections`, refreshed by the queue
    /// consumer on every membership change. Lets the status-broadcast task
    /// (which outlives any single `request_database` call) fan out to
    /// whoever is *currently* connected without taking a lock on the state
    /// the queue owns (§4.3.2 step 6, "Broadcast fanout" law).
    connections_snapshot: ArcSwap<Vec<Arc<ConnectedClient>>>,
}

impl SyncRunner {
    pub fn spawn(
        identifier: String,
        connector: Arc<dyn DatabaseConnector>,
        engine_factory: Arc<dyn EngineFactory>,
        config: RunnerConfig,
    ) -> Arc<SyncRunner> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let runner = Arc::new(SyncRunner {
            identifier,
            events_tx,
            host_generation: AtomicU64::new(0),
            connections_snapshot: ArcSwap::from_pointee(Vec::new()),
        });
        tokio::spawn(SyncRunner::run(runner.clone(), events_rx, connector, engine_factory, config));
        runner
    }

    pub fn add_connection(&self, client: Arc<ConnectedClient>) {
        let _ = self.events_tx.send(RunnerEvent::AddConnection(client));
    }

    pub fn remove_connection(&self, client: Arc<ConnectedClient>) {
        let _ = self.events_tx.send(RunnerEvent::RemoveConnection(client));
    }

    pub fn notify_active_database_closed(&self) {
        let _ = self.events_tx.send(RunnerEvent::ActiveDatabaseClosed);
    }

    async fn run(
        self_arc: Arc<SyncRunner>,
        mut events_rx: mpsc::UnboundedReceiver<RunnerEvent>,
        connector: Arc<dyn DatabaseConnector>,
        engine_factory: Arc<dyn EngineFactory>,
        config: RunnerConfig,
    ) {
        let mut state = RunnerState::default();
        while let Some(event) = events_rx.recv().await {
            let event_name = match &event {
                RunnerEvent::AddConnection(_) => "AddConnection",
                RunnerEvent::RemoveConnection(_) => "RemoveConnection",
                RunnerEvent::ActiveDatabaseClosed => "ActiveDatabaseClosed",
            };
            // Any failure inside a transition is logged and does not poison
            // the queue (§4.3 "Event handling is wrapped").
            if let Err(error) = SyncRunner::handle_event(&self_arc, &mut state, event, &connector, &engine_factory, &config).await {
                warn!(runner = %self_arc.identifier, event = event_name, %error, "runner transition failed");
            }
            debug_assert!(state.check_invariants());
        }
    }

    /// Refresh the read-only mirror of `state.connections` immediately after
    /// `state.connections` itself changes — not once at the end of the outer
    /// loop body, since the status-broadcast task spawned inside
    /// `request_database` (below) can start delivering notifications on
    /// another executor thread before `handle_event` returns, and the
    /// "Broadcast fanout" law (§8) requires the snapshot it reads to already
    /// reflect the membership change from the event being handled.
    fn sync_connections_snapshot(self_arc: &Arc<SyncRunner>, state: &RunnerState) {
        self_arc
            .connections_snapshot
            .store(Arc::new(state.connections.iter().cloned().collect()));
    }

    async fn handle_event(
        self_arc: &Arc<SyncRunner>,
        state: &mut RunnerState,
        event: RunnerEvent,
        connector: &Arc<dyn DatabaseConnector>,
        engine_factory: &Arc<dyn EngineFactory>,
        config: &RunnerConfig,
    ) -> Result<(), RunnerError> {
        match event {
            RunnerEvent::AddConnection(client) => {
                let was_idle = state.is_idle();
                state.connections.insert(client.clone());
                SyncRunner::sync_connections_snapshot(self_arc, state);
                if was_idle {
                    SyncRunner::request_database(self_arc, state, client, connector, engine_factory, config)
                        .await
                        .map_err(|source| RunnerError::Transition {
                            event: "AddConnection",
                            source: Box::new(source),
                        })?;
                }
                Ok(())
            }
            RunnerEvent::RemoveConnection(client) => {
                state.connections.remove(&client);
                SyncRunner::sync_connections_snapshot(self_arc, state);
                // The host is always a member of `connections` (§8 invariant
                // 2), so removing it here — whether or not connections ends
                // up empty — must clear host/engine in the same step to keep
                // the invariant from being observably broken between this
                // event and a same-client `ActiveDatabaseClosed` that may
                // already be queued behind it (§4.3.1).
                if state.host.as_ref() == Some(&client) {
                    if let Some(engine) = state.engine.take() {
                        if let Err(error) = engine.abort().await {
                            warn!(runner = %self_arc.identifier, %error, "engine abort failed on host disconnect");
                        }
                    }
                    state.host = None;
                    // Not bumped here: the host-closed watcher for `client`
                    // (if this removal came from it) still needs to see its
                    // own captured generation below, in `request_database`.
                }
                Ok(())
            }
            RunnerEvent::ActiveDatabaseClosed => {
                if let Some(engine) = state.engine.take() {
                    if let Err(error) = engine.abort().await {
                        warn!(runner = %self_arc.identifier, %error, "engine abort failed on host loss");
                    }
                }
                state.host = None;
                self_arc.host_generation.fetch_add(1, Ordering::SeqCst);

                let candidates = state.connections.clone();
                let ping_timeout = config.ping_timeout.as_std();
                if let Some(new_host) = SyncRunner::elect_host(candidates, ping_timeout).await {
                    info!(runner = %self_arc.identifier, client = ?new_host.id, "elected new host");
                    SyncRunner::request_database(self_arc, state, new_host, connector, engine_factory, config)
                        .await
                        .map_err(|source| RunnerError::Transition {
                            event: "ActiveDatabaseClosed",
                            source: Box::new(source),
                        })?;
                } else {
                    info!(runner = %self_arc.identifier, "election found no live candidate");
                }
                Ok(())
            }
        }
    }

    /// §4.3.2: the full sequence to bring up the engine against `client`.
    async fn request_database(
        self_arc: &Arc<SyncRunner>,
        state: &mut RunnerState,
        client: Arc<ConnectedClient>,
        connector: &Arc<dyn DatabaseConnector>,
        engine_factory: &Arc<dyn EngineFactory>,
        config: &RunnerConfig,
    ) -> Result<(), RunnerError> {
        let reply = client
            .channel()
            .request(MessageKind::RequestDatabase, Payload::Empty)
            .await
            .map_err(crate::errors::HandshakeError::from)?;
        let Payload::DatabaseEndpoint {
            port,
            database_name,
            lock_name,
        } = reply
        else {
            return Err(crate::errors::HandshakeError::Connect("client returned no database endpoint".into()).into());
        };

        let handle = connector
            .connect(DatabaseEndpoint {
                port,
                database_name,
                lock_name,
            })
            .await?;

        state.host = Some(client.clone());
        let generation = self_arc.host_generation.fetch_add(1, Ordering::SeqCst) + 1;

        // §4.3.1: the only reliable disconnect signal. Captures `generation`
        // so a closure observed after a later election has already replaced
        // this host is a no-op.
        let watcher_runner = self_arc.clone();
        let watcher_client = client.clone();
        let closed = handle.closed();
        tokio::spawn(async move {
            closed.await;
            watcher_client.mark_closed().await;
            if watcher_runner.host_generation.load(Ordering::SeqCst) == generation {
                watcher_runner.notify_active_database_closed();
            }
        });

        let callbacks = ClientCallbacks::new(client.channel().clone());
        let engine = engine_factory
            .build(EngineParams {
                identifier: self_arc.identifier.clone(),
                database: handle.clone(),
                updates: handle.update_stream(),
                callbacks,
                retry_delay: config.engine_retry_delay.as_std(),
                cors: config.fetch_cors,
            })
            .await?;

        let status_runner = self_arc.clone();
        let mut status_stream = engine.status_stream();
        tokio::spawn(async move {
            use futures::StreamExt;
            while let Some(status) = status_stream.next().await {
                let connections = status_runner.connections_snapshot.load();
                debug!(runner = %status_runner.identifier, ?status, clients = connections.len(), "broadcasting sync status");
                for client in connections.iter() {
                    client
                        .channel()
                        .notify(MessageKind::NotifySyncStatus, Payload::NotifySyncStatus { status: status.clone() })
                        .await;
                }
            }
        });

        engine.start().await?;
        state.engine = Some(engine);
        Ok(())
    }

    /// Ping every candidate in parallel; first responder wins, the rest race
    /// to completion independently and mark themselves closed on timeout
    /// (§4.3 "Host election on host loss").
    async fn elect_host(
        candidates: HashSet<Arc<ConnectedClient>>,
        ping_timeout: Duration,
    ) -> Option<Arc<ConnectedClient>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for client in candidates {
            let tx = tx.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(ping_timeout, client.channel().ping()).await {
                    Ok(Ok(_)) => {
                        let _ = tx.send(client);
                    }
                    _ => {
                        client.mark_closed().await;
                    }
                }
            });
        }
        drop(tx);
        rx.recv().await
    }
}
