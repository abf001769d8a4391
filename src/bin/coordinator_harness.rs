//! A small local-smoke-test harness: wires a [`WorkerRoot`] to a handful of
//! in-process [`MemoryPort`] connections, drives a couple of
//! `startSynchronization` calls, and prints the sync status broadcasts it
//! observes. Not a production entrypoint — there is no real transport, no
//! real streaming-sync engine, and no real local database in this crate
//! (§1 "out of scope").

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use coordinator::channel::{Channel, MemoryPort, MessageKind, Payload};
use coordinator::config::Config;
use coordinator::database::InMemoryDatabaseConnector;
use coordinator::engine::NullEngineFactory;
use coordinator::logging::LogHubLayer;
use coordinator::worker::WorkerRoot;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Cross-tab sync coordinator harness.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(default_value_t = String::from("coordinator.toml"), env)]
    config_file: String,

    #[arg(short, long, default_value_t = tracing::Level::INFO, env)]
    log_level: Level,

    #[arg(long, default_value_t = String::from("default"), help = "database identifier to synchronize")]
    database_name: String,

    #[arg(long, default_value_t = 2, help = "number of simulated tabs to connect")]
    tabs: u32,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match Config::load(&args.config_file).await {
        Ok(config) => config,
        Err(error) => {
            eprintln!("no usable config at {}, using defaults ({error})", args.config_file);
            Config::default()
        }
    };

    let worker = WorkerRoot::new(
        Arc::new(InMemoryDatabaseConnector),
        Arc::new(NullEngineFactory),
        config.runner,
    );

    let filter = EnvFilter::from_default_env().add_directive(args.log_level.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(LogHubLayer::new(worker.log_hub().clone()))
        .init();

    tracing::info!(tabs = args.tabs, database = %args.database_name, "starting harness");

    let mut ports = Vec::new();
    for _ in 0..args.tabs {
        let (coordinator_side, tab_side) = MemoryPort::pair();
        ports.push(Arc::new(coordinator_side) as Arc<dyn coordinator::channel::Port>);
        tokio::spawn(run_fake_tab(tab_side, args.database_name.clone()));
    }

    let _clients = worker.accept_connection(ports);

    tokio::time::sleep(Duration::from_secs(1)).await;
    tracing::info!(runners = worker.runner_count(), "harness run complete");
}

/// Stands in for a browser tab: answers `requestDatabase` with a fresh
/// in-process port pair and otherwise ignores everything the coordinator
/// sends it.
async fn run_fake_tab(port: coordinator::channel::MemoryPort, database_name: String) {
    let channel = Channel::new(Arc::new(port));
    let handler_database_name = database_name.clone();
    channel.set_request_handler(Arc::new(move |kind, _payload| {
        let database_name = handler_database_name.clone();
        Box::pin(async move {
            match kind {
                MessageKind::RequestDatabase => {
                    let (db_port, _peer) = MemoryPort::pair();
                    Ok(Payload::DatabaseEndpoint {
                        port: Arc::new(db_port),
                        database_name,
                        lock_name: "lock".to_string(),
                    })
                }
                MessageKind::Ping => Ok(Payload::Empty),
                _ => Ok(Payload::Empty),
            }
        })
    }));
    channel.start();

    channel
        .request(
            MessageKind::StartSynchronization,
            Payload::StartSynchronization { database_name },
        )
        .await
        .ok();

    tokio::time::sleep(Duration::from_secs(5)).await;
}
