//! The streaming-sync engine collaborator (§1 "out of scope", §4.3.2, §6).
//!
//! This crate only needs the engine's start/abort/status contract; the wire
//! protocol to the remote server, bucket storage, CRUD upload, and
//! credential refresh all live outside it. [`SyncEngine`] and
//! [`EngineFactory`] are the seam; [`NullSyncEngine`] is a test double, not a
//! production implementation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::channel::{Channel, MessageKind, Payload};
use crate::database::DatabaseHandle;
use crate::errors::EngineError;
use std::sync::Arc;

/// Serialized sync status broadcast to clients (§6 `notifySyncStatus`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub connected: bool,
    pub downloading: bool,
    pub uploading: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SyncStatus {
    pub fn connected() -> Self {
        SyncStatus {
            connected: true,
            downloading: false,
            uploading: false,
            last_synced_at: None,
        }
    }

    pub fn disconnected() -> Self {
        SyncStatus {
            connected: false,
            downloading: false,
            uploading: false,
            last_synced_at: None,
        }
    }
}

/// Request-shaped proxies to the client side, used by the engine for
/// credential refresh and CRUD upload (§4.1 "Credential/CRUD callbacks",
/// §4.3.2 step 5).
#[derive(Clone)]
pub struct ClientCallbacks {
    channel: Arc<Channel>,
}

impl ClientCallbacks {
    pub fn new(channel: Arc<Channel>) -> Self {
        ClientCallbacks { channel }
    }

    pub async fn credentials(&self) -> Result<serde_json::Value, EngineError> {
        match self
            .channel
            .request(MessageKind::CredentialsCallback, Payload::Empty)
            .await
        {
            Ok(Payload::Credentials(value)) => Ok(value),
            Ok(_) => Ok(serde_json::Value::Null),
            Err(error) => Err(EngineError::Start(error.to_string())),
        }
    }

    pub async fn invalid_credentials(&self) -> Result<(), EngineError> {
        self.channel
            .request(MessageKind::InvalidCredentialsCallback, Payload::Empty)
            .await
            .map(|_| ())
            .map_err(|error| EngineError::Start(error.to_string()))
    }

    pub async fn upload_crud(&self) -> Result<(), EngineError> {
        self.channel
            .request(MessageKind::UploadCrud, Payload::Empty)
            .await
            .map(|_| ())
            .map_err(|error| EngineError::Start(error.to_string()))
    }
}

/// Everything needed to build one engine instance (§4.3.2 step 5).
pub struct EngineParams {
    pub identifier: String,
    pub database: Arc<dyn DatabaseHandle>,
    /// The database's update notifications, fed to the engine as its trigger
    /// to re-check for local changes to upload.
    pub updates: BoxStream<'static, ()>,
    pub callbacks: ClientCallbacks,
    /// Fixed 3-second retry delay per the original spec; configurable here
    /// (§ SPEC_FULL "Configuration").
    pub retry_delay: Duration,
    /// Fetch transport configured for CORS.
    pub cors: bool,
}

/// The downstream sync pipeline: start, abort, and a status stream.
#[async_trait]
pub trait SyncEngine: Send + Sync {
    async fn start(&self) -> Result<(), EngineError>;
    async fn abort(&self) -> Result<(), EngineError>;
    fn status_stream(&self) -> BoxStream<'static, SyncStatus>;
}

/// Builds a [`SyncEngine`] for a runner (§4.3.2 step 5).
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn build(&self, params: EngineParams) -> Result<Arc<dyn SyncEngine>, EngineError>;
}

/// A no-op engine used by the bundled harness and tests: `start` emits one
/// `connected: true` status and otherwise does nothing.
pub struct NullSyncEngine {
    status_tx: tokio::sync::broadcast::Sender<SyncStatus>,
}

impl Default for NullSyncEngine {
    fn default() -> Self {
        let (status_tx, _) = tokio::sync::broadcast::channel(16);
        NullSyncEngine { status_tx }
    }
}

#[async_trait]
impl SyncEngine for NullSyncEngine {
    async fn start(&self) -> Result<(), EngineError> {
        let _ = self.status_tx.send(SyncStatus::connected());
        Ok(())
    }

    async fn abort(&self) -> Result<(), EngineError> {
        let _ = self.status_tx.send(SyncStatus::disconnected());
        Ok(())
    }

    fn status_stream(&self) -> BoxStream<'static, SyncStatus> {
        let rx = self.status_tx.subscribe();
        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(status) => Some((status, rx)),
                Err(_) => None,
            }
        }))
    }
}

/// Builds a fresh [`NullSyncEngine`] for every runner; used by the harness
/// and tests in place of the real remote-sync pipeline.
#[derive(Default)]
pub struct NullEngineFactory;

#[async_trait]
impl EngineFactory for NullEngineFactory {
    async fn build(&self, _params: EngineParams) -> Result<Arc<dyn SyncEngine>, EngineError> {
        Ok(Arc::new(NullSyncEngine::default()))
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    pub fn fake_engine() -> Arc<dyn SyncEngine> {
        Arc::new(NullSyncEngine::default())
    }
}
