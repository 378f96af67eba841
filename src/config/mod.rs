//! Server configuration.
//!
//! Every [`ServerConfig`] field has a default, so partial documents
//! deserialize and embedding processes can layer it over their own config
//! loading. The event-loop provider is not part of the serialized surface
//! (it may hold a live runtime handle); it is set on the server builder.

use serde::Deserialize;

use crate::observe::ReportingConfiguration;

/// How an operation's body is scheduled relative to the accepting task.
///
/// The three modes differ in ordering and cost; the framework branches on
/// the value and otherwise treats dispatch as opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InvocationStrategy {
    /// Run inline on the task that accepted the request.
    #[default]
    OriginalEventLoop,
    /// Spawn an async task and await it.
    CooperativeTaskGroup,
    /// Run on the blocking work pool.
    DispatchQueue,
}

/// Signals that trigger a graceful shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ShutdownSignal {
    Sigint,
    Sigterm,
}

/// Where the server's event loops come from.
///
/// The server tears down the group at shutdown only when it spawned the
/// threads itself; an external group stays with its owner.
#[derive(Debug, Clone)]
pub enum EventLoopProvider {
    /// Spawn a fresh multi-threaded runtime with `threads` workers.
    SpawnNewThreads { threads: usize },
    /// Run on a caller-provided runtime.
    External(tokio::runtime::Handle),
}

impl Default for EventLoopProvider {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::SpawnNewThreads { threads }
    }
}

/// Tunable server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// TCP port to bind. Default 8080.
    pub port: u16,
    /// Bind host. Default loopback.
    pub host: String,
    pub invocation_strategy: InvocationStrategy,
    /// Signals that trigger shutdown; empty disables handler registration.
    /// Default `[SIGINT]`.
    pub shutdown_on_signals: Vec<ShutdownSignal>,
    /// Cap on collected request-body bytes. Default 1 MiB.
    pub max_body_bytes: usize,
    /// Emit per-request tracing spans. Default off.
    pub enable_tracing: bool,
    pub reporting: ReportingConfiguration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "127.0.0.1".to_owned(),
            invocation_strategy: InvocationStrategy::default(),
            shutdown_on_signals: vec![ShutdownSignal::Sigint],
            max_body_bytes: 1_048_576,
            enable_tracing: false,
            reporting: ReportingConfiguration::default(),
        }
    }
}
