//! Errors.

use crate::channel::MessageKind;

/// Top level error type for the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors raised by the [`crate::channel::Channel`] transport (§4.1, §7 "Protocol"/"Transport").
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("unknown message kind {0:?}")]
    Protocol(MessageKind),
    #[error("malformed payload for {0:?}")]
    MalformedPayload(MessageKind),
    #[error("channel disconnected")]
    Disconnected,
    #[error("request handler not installed for {0:?}")]
    NoHandler(MessageKind),
    #[error("remote error: {0}")]
    Remote(String),
}

/// Errors surfaced while a [`crate::runner::SyncRunner`] drives its state machine (§7 "Runner-queue").
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("transition for event {event} failed: {source}")]
    Transition {
        event: &'static str,
        #[source]
        source: Box<RunnerError>,
    },
}

/// Failure of `requestDatabase` or the subsequent endpoint connect (§4.3.2, §7 "Handshake").
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("database connect failed: {0}")]
    Connect(String),
}

/// Failures from starting, aborting, or streaming status off the streaming-sync engine (§7 "Engine").
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine start failed: {0}")]
    Start(String),
    #[error("engine abort failed: {0}")]
    Abort(String),
    #[error("engine status stream ended with error: {0}")]
    Status(String),
}

/// Configuration parse/validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(String),
}
