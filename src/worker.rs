//! Accepts port connections and maintains the `identifier -> SyncRunner` map (§4.4).

use std::sync::Arc;

use dashmap::DashMap;

use crate::channel::Port;
use crate::client::ConnectedClient;
use crate::config::RunnerConfig;
use crate::database::DatabaseConnector;
use crate::engine::EngineFactory;
use crate::logging::LogHub;
use crate::runner::SyncRunner;

/// The coordinator's single entry point: demultiplexes incoming port
/// connections into [`ConnectedClient`]s and keys [`SyncRunner`]s by
/// database identifier.
///
/// Runners are never evicted (§4.4): once created they persist for the
/// worker's lifetime, even when idle.
pub struct WorkerRoot {
    runners: DashMap<String, Arc<SyncRunner>>,
    connector: Arc<dyn DatabaseConnector>,
    engine_factory: Arc<dyn EngineFactory>,
    config: RunnerConfig,
    log_hub: LogHub,
}

impl WorkerRoot {
    pub fn new(
        connector: Arc<dyn DatabaseConnector>,
        engine_factory: Arc<dyn EngineFactory>,
        config: RunnerConfig,
    ) -> Arc<WorkerRoot> {
        Arc::new(WorkerRoot {
            runners: DashMap::new(),
            connector,
            engine_factory,
            config,
            log_hub: LogHub::new(config.log_channel_capacity),
        })
    }

    pub fn log_hub(&self) -> &LogHub {
        &self.log_hub
    }

    /// One connection event, possibly carrying several ports (§4.4, §6
    /// "Connection bootstrap"). Each port yields one `ConnectedClient`.
    pub fn accept_connection(self: &Arc<Self>, ports: Vec<Arc<dyn Port>>) -> Vec<Arc<ConnectedClient>> {
        ports
            .into_iter()
            .map(|port| ConnectedClient::spawn(self.clone(), port, &self.log_hub))
            .collect()
    }

    /// Returns the runner for `identifier`, creating it on first use, and
    /// registers `client` with it (§4.4).
    pub fn reference_sync_task(self: &Arc<Self>, identifier: &str, client: Arc<ConnectedClient>) -> Arc<SyncRunner> {
        let runner = self
            .runners
            .entry(identifier.to_string())
            .or_insert_with(|| {
                SyncRunner::spawn(
                    identifier.to_string(),
                    self.connector.clone(),
                    self.engine_factory.clone(),
                    self.config,
                )
            })
            .clone();
        runner.add_connection(client);
        runner
    }

    /// Number of runners created so far (for tests and the harness; not part
    /// of the original spec's contract).
    pub fn runner_count(&self) -> usize {
        self.runners.len()
    }
}
