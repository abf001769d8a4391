//! The local database collaborator (§1 "out of scope", §4.3.1, §4.3.2, §6).
//!
//! This crate only observes two signals from the local database: the
//! "connect to endpoint" handshake and the "closed" future that fires when
//! the host tab's database handle goes away. Schema, migration, and storage
//! are entirely out of scope.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::sync::Arc;

use crate::channel::Port;
use crate::errors::HandshakeError;

/// The transferable endpoint a client hands back in reply to
/// `requestDatabase`: a port plus the database name and lock name needed to
/// open it (§4.3.2 step 1, §6).
pub struct DatabaseEndpoint {
    pub port: Arc<dyn Port>,
    pub database_name: String,
    pub lock_name: String,
}

/// A live handle to the host tab's local database, proxied over its port.
pub trait DatabaseHandle: Send + Sync {
    /// Resolves when the host tab's database handle goes away — the only
    /// reliable disconnect signal in this system (§4.3.1).
    fn closed(&self) -> BoxFuture<'static, ()>;

    /// The database's change notifications, driving the engine's upload
    /// side (§4.3.2 step 5).
    fn update_stream(&self) -> BoxStream<'static, ()>;
}

/// Connects to a [`DatabaseEndpoint`] and returns a live handle (§4.3.2 step 2).
#[async_trait]
pub trait DatabaseConnector: Send + Sync {
    async fn connect(&self, endpoint: DatabaseEndpoint) -> Result<Arc<dyn DatabaseHandle>, HandshakeError>;
}

/// A database handle whose closure is driven manually via
/// [`InMemoryDatabaseHandle::close`]. Used by the harness and by tests that
/// need to simulate a host tab disappearing.
pub struct InMemoryDatabaseHandle {
    closed: Arc<tokio::sync::Notify>,
    updates: tokio::sync::broadcast::Sender<()>,
}

impl Default for InMemoryDatabaseHandle {
    fn default() -> Self {
        let (updates, _) = tokio::sync::broadcast::channel(16);
        InMemoryDatabaseHandle {
            closed: Arc::new(tokio::sync::Notify::new()),
            updates,
        }
    }
}

impl InMemoryDatabaseHandle {
    /// Simulate the host tab going away.
    pub fn close(&self) {
        self.closed.notify_waiters();
    }

    /// Simulate a local write, driving the engine's update stream.
    pub fn notify_update(&self) {
        let _ = self.updates.send(());
    }
}

impl DatabaseHandle for InMemoryDatabaseHandle {
    fn closed(&self) -> BoxFuture<'static, ()> {
        let notify = self.closed.clone();
        Box::pin(async move { notify.notified().await })
    }

    fn update_stream(&self) -> BoxStream<'static, ()> {
        let rx = self.updates.subscribe();
        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(()) => Some(((), rx)),
                Err(_) => None,
            }
        }))
    }
}

/// Connects any [`DatabaseEndpoint`] to a fresh [`InMemoryDatabaseHandle`],
/// ignoring the endpoint's port — used by the harness and tests in place of
/// a real local-database connection.
#[derive(Default)]
pub struct InMemoryDatabaseConnector;

#[async_trait]
impl DatabaseConnector for InMemoryDatabaseConnector {
    async fn connect(&self, _endpoint: DatabaseEndpoint) -> Result<Arc<dyn DatabaseHandle>, HandshakeError> {
        Ok(Arc::new(InMemoryDatabaseHandle::default()))
    }
}
