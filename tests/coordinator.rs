//! End-to-end scenarios from the supervisor's state machine: a tab connects,
//! a second tab attaches, the host disappears and a new one is elected, and
//! the runner drains back to idle when every tab leaves.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;

use coordinator::channel::{Channel, MemoryPort, MessageKind, Payload, Port};
use coordinator::config::RunnerConfig;
use coordinator::database::{DatabaseConnector, DatabaseEndpoint, DatabaseHandle, InMemoryDatabaseHandle};
use coordinator::engine::{NullEngineFactory, SyncStatus};
use coordinator::errors::HandshakeError;
use coordinator::worker::WorkerRoot;

/// Connects every endpoint to a fresh [`InMemoryDatabaseHandle`] and keeps
/// every handle it hands out, in connect order, so tests can simulate a
/// host tab's local database going away.
#[derive(Default)]
struct RecordingConnector {
    handles: tokio::sync::Mutex<Vec<Arc<InMemoryDatabaseHandle>>>,
}

impl RecordingConnector {
    async fn handle_at(&self, index: usize) -> Arc<InMemoryDatabaseHandle> {
        self.handles.lock().await[index].clone()
    }

    async fn connect_count(&self) -> usize {
        self.handles.lock().await.len()
    }
}

#[async_trait]
impl DatabaseConnector for RecordingConnector {
    async fn connect(&self, _endpoint: DatabaseEndpoint) -> Result<Arc<dyn DatabaseHandle>, HandshakeError> {
        let handle = Arc::new(InMemoryDatabaseHandle::default());
        self.handles.lock().await.push(handle.clone());
        Ok(handle)
    }
}

/// The tab side of one `MemoryPort` pair: answers `requestDatabase` and
/// `ping`, and records every `notifySyncStatus` it receives. Ping replies
/// can be switched off to simulate a tab that has silently died.
struct TestTab {
    channel: Arc<Channel>,
    responsive: Arc<AtomicBool>,
    statuses: Arc<StdMutex<Vec<SyncStatus>>>,
}

impl TestTab {
    fn spawn(port: MemoryPort) -> Self {
        let channel = Channel::new(Arc::new(port));
        let responsive = Arc::new(AtomicBool::new(true));
        let statuses = Arc::new(StdMutex::new(Vec::new()));

        let handler_responsive = responsive.clone();
        channel.set_request_handler(Arc::new(move |kind, _payload| {
            let responsive = handler_responsive.clone();
            Box::pin(async move {
                match kind {
                    MessageKind::Ping => {
                        if responsive.load(Ordering::SeqCst) {
                            Ok(Payload::Empty)
                        } else {
                            futures::future::pending::<()>().await;
                            unreachable!("dead tab never replies")
                        }
                    }
                    MessageKind::RequestDatabase => {
                        let (db_port, _unused_peer) = MemoryPort::pair();
                        Ok(Payload::DatabaseEndpoint {
                            port: Arc::new(db_port),
                            database_name: "db1".to_string(),
                            lock_name: "lock".to_string(),
                        })
                    }
                    _ => Ok(Payload::Empty),
                }
            })
        }));

        let notify_statuses = statuses.clone();
        channel.set_notification_handler(Arc::new(move |kind, payload| {
            if kind == MessageKind::NotifySyncStatus {
                if let Payload::NotifySyncStatus { status } = payload {
                    notify_statuses.lock().unwrap().push(status);
                }
            }
        }));

        channel.start();

        TestTab {
            channel,
            responsive,
            statuses,
        }
    }

    fn go_silent(&self) {
        self.responsive.store(false, Ordering::SeqCst);
    }

    fn status_count(&self) -> usize {
        self.statuses.lock().unwrap().len()
    }

    /// Sends `startSynchronization`/`abortSynchronization` the way a real tab
    /// does: as a request issued *from* the tab's own end of the port, not
    /// from the `ConnectedClient` (which only ever answers these, it never
    /// sends them — see `ConnectedClient::handle_request`).
    async fn start_synchronization(&self, database_name: &str) {
        self.channel
            .request(
                MessageKind::StartSynchronization,
                Payload::StartSynchronization {
                    database_name: database_name.to_string(),
                },
            )
            .await
            .expect("startSynchronization should succeed");
    }

    async fn abort_synchronization(&self) {
        self.channel
            .request(MessageKind::AbortSynchronization, Payload::Empty)
            .await
            .expect("abortSynchronization should succeed");
    }
}

fn fast_runner_config() -> RunnerConfig {
    RunnerConfig {
        ping_timeout: coordinator::config::Duration::from_millis(100),
        ..RunnerConfig::default()
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition did not become true in time");
}

async fn connect_tab(worker: &Arc<WorkerRoot>) -> (TestTab, Arc<coordinator::client::ConnectedClient>) {
    let (coordinator_side, tab_side) = MemoryPort::pair();
    let tab = TestTab::spawn(tab_side);
    let mut clients = worker.accept_connection(vec![Arc::new(coordinator_side) as Arc<dyn Port>]);
    (tab, clients.pop().unwrap())
}

#[tokio::test]
async fn single_client_happy_path_starts_engine_and_broadcasts_status() {
    let connector = Arc::new(RecordingConnector::default());
    let worker = WorkerRoot::new(connector.clone(), Arc::new(NullEngineFactory), fast_runner_config());

    let (tab_a, _client_a) = connect_tab(&worker).await;
    tab_a.start_synchronization("db1").await;

    wait_until(|| tab_a.status_count() >= 1).await;
    assert_eq!(worker.runner_count(), 1);
    assert_eq!(connector.connect_count().await, 1);
}

#[tokio::test]
async fn second_tab_attaches_without_new_election() {
    let connector = Arc::new(RecordingConnector::default());
    let worker = WorkerRoot::new(connector.clone(), Arc::new(NullEngineFactory), fast_runner_config());

    let (tab_a, _client_a) = connect_tab(&worker).await;
    tab_a.start_synchronization("db1").await;
    wait_until(|| tab_a.status_count() >= 1).await;

    let (tab_b, _client_b) = connect_tab(&worker).await;
    tab_b.start_synchronization("db1").await;

    // No second requestDatabase round: still exactly one database connection.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connector.connect_count().await, 1);
    assert_eq!(worker.runner_count(), 1);
}

#[tokio::test]
async fn host_closing_triggers_failover_to_remaining_tab() {
    let connector = Arc::new(RecordingConnector::default());
    let worker = WorkerRoot::new(connector.clone(), Arc::new(NullEngineFactory), fast_runner_config());

    let (tab_a, _client_a) = connect_tab(&worker).await;
    tab_a.start_synchronization("db1").await;
    wait_until(|| tab_a.status_count() >= 1).await;

    let (tab_b, _client_b) = connect_tab(&worker).await;
    tab_b.start_synchronization("db1").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Simulate A's local database (and hence its tab) going away.
    let host_handle = connector.handle_at(0).await;
    host_handle.close();

    wait_until(|| tab_b.status_count() >= 1).await;
    assert_eq!(connector.connect_count().await, 2, "failover should open a second database connection, against B");
}

#[tokio::test]
async fn stale_secondary_is_marked_closed_during_failover() {
    let connector = Arc::new(RecordingConnector::default());
    let worker = WorkerRoot::new(connector.clone(), Arc::new(NullEngineFactory), fast_runner_config());

    let (tab_a, _client_a) = connect_tab(&worker).await;
    tab_a.start_synchronization("db1").await;
    wait_until(|| tab_a.status_count() >= 1).await;

    let (tab_b, _client_b) = connect_tab(&worker).await;
    tab_b.start_synchronization("db1").await;
    let (tab_c, client_c) = connect_tab(&worker).await;
    tab_c.start_synchronization("db1").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    tab_c.go_silent();
    connector.handle_at(0).await.close();

    wait_until(|| tab_b.status_count() >= 1).await;
    wait_until(|| client_c.is_closed()).await;
    assert_eq!(connector.connect_count().await, 2);
}

#[tokio::test]
async fn last_tab_leaving_returns_runner_to_idle() {
    let connector = Arc::new(RecordingConnector::default());
    let worker = WorkerRoot::new(connector.clone(), Arc::new(NullEngineFactory), fast_runner_config());

    let (tab_a, _client_a) = connect_tab(&worker).await;
    tab_a.start_synchronization("db1").await;
    wait_until(|| tab_a.status_count() >= 1).await;

    tab_a.abort_synchronization().await;

    // The runner itself persists (runners are never evicted), but no new
    // database connection should be opened again.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connector.connect_count().await, 1);
    assert_eq!(worker.runner_count(), 1);
}

#[tokio::test]
async fn election_with_no_live_candidate_leaves_runner_hostless() {
    let connector = Arc::new(RecordingConnector::default());
    let worker = WorkerRoot::new(connector.clone(), Arc::new(NullEngineFactory), fast_runner_config());

    let (tab_a, _client_a) = connect_tab(&worker).await;
    tab_a.start_synchronization("db1").await;
    wait_until(|| tab_a.status_count() >= 1).await;

    let (tab_b, client_b) = connect_tab(&worker).await;
    tab_b.start_synchronization("db1").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    tab_b.go_silent();
    connector.handle_at(0).await.close();

    // Give the (timing-out) election time to resolve with no host.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(connector.connect_count().await, 1, "no second connect should happen when every candidate is dead");
    wait_until(|| client_b.is_closed()).await;

    // Recovery: a fresh tab joining restarts the cycle.
    let (tab_d, _client_d) = connect_tab(&worker).await;
    tab_d.start_synchronization("db1").await;
    wait_until(|| tab_d.status_count() >= 1).await;
    assert_eq!(connector.connect_count().await, 2);
}
