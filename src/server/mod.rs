//! The operation server — lifecycle, signal handling, and the accept loop.
//!
//! A server moves monotonically through `initialised → running →
//! shutting-down → shut-down`, guarded by a single mutex. `start` brings up
//! the transport on the configured event-loop group; `shutdown` stops
//! accepting, drains in-flight connections, tears down a group the server
//! owns, and resumes everything parked on [`Server::until_shutdown`] along
//! with the queued completion callbacks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch, Notify};
use tracing::{debug, error, info};

use crate::config::{EventLoopProvider, ServerConfig, ShutdownSignal};
use crate::context::OperationContext;
use crate::handler::{assemble_endpoint, AllowedError};
use crate::http::{Method, Request, StatusCode};
use crate::middleware::{MiddlewareStack, OperationTransform};
use crate::observe::{MetricsSink, NoopMetrics, RequestIdMinter};
use crate::operation::{ErrorShape, Operation, OperationId, OperationInput, OperationOutput};
use crate::path::TemplateError;
use crate::router::Router;
use crate::writer::{OperationResponseWriter, ResponseWriter};

mod connection;

/// Errors produced by the server lifecycle and registration.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("shutdown attempted on a server that was never started")]
    ShutdownOnUnstartedServer,

    #[error("invalid path template for operation {operation}: {source}")]
    InvalidTemplate {
        operation: String,
        #[source]
        source: TemplateError,
    },
}

/// Externally visible lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Initialised,
    Running,
    ShuttingDown,
    ShutDown,
}

enum Lifecycle {
    Initialised,
    /// `start` is mid-flight; treated as unstarted by everyone else.
    Starting,
    Running(RunningState),
    ShuttingDown,
    ShutDown,
}

struct RunningState {
    local_addr: SocketAddr,
    stop_tx: watch::Sender<bool>,
    owned_runtime: Option<tokio::runtime::Runtime>,
}

type ShutdownCallback = Box<dyn FnOnce() + Send>;

pub(crate) struct ServerInner {
    pub(crate) name: String,
    pub(crate) config: ServerConfig,
    pub(crate) router: Router,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    pub(crate) minter: RequestIdMinter,
    provider: EventLoopProvider,
    state: Mutex<Lifecycle>,
    callbacks: Mutex<Vec<ShutdownCallback>>,
    shutdown_tx: watch::Sender<bool>,
    local_addr: Mutex<Option<SocketAddr>>,
    in_flight: AtomicUsize,
    drained: Notify,
}

/// An operation-oriented HTTP/1.1 server.
///
/// Built through [`Server::builder`]; the router and middleware stacks are
/// fixed at build time and immutable while the server runs.
///
/// # Examples
///
/// ```rust,no_run
/// use opserve::http::{Method, StatusCode};
/// use opserve::operation::{BodyOnly, BodyOutput, OperationId, Validate};
/// use opserve::server::Server;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Deserialize)]
/// struct EchoInput { text: String }
/// impl Validate for EchoInput {}
///
/// #[derive(Serialize)]
/// struct EchoOutput { text: String }
/// impl Validate for EchoOutput {}
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let server = Server::builder("echo-service")
///     .add_operation(
///         OperationId::new("Echo", "/echo"),
///         Method::Post,
///         |input: BodyOnly<EchoInput>, _ctx| async move {
///             Ok::<_, std::convert::Infallible>(BodyOutput(EchoOutput { text: input.0.text }))
///         },
///         vec![],
///     )?
///     .build();
///
/// server.start().await?;
/// server.until_shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Starts a builder for a server named `name`.
    ///
    /// The name shows up in logs and as the tracing span's `server` field.
    pub fn builder(name: impl Into<String>) -> ServerBuilder {
        ServerBuilder::new(name)
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> LifecyclePhase {
        match *self.inner.state.lock() {
            Lifecycle::Initialised | Lifecycle::Starting => LifecyclePhase::Initialised,
            Lifecycle::Running(_) => LifecyclePhase::Running,
            Lifecycle::ShuttingDown => LifecyclePhase::ShuttingDown,
            Lifecycle::ShutDown => LifecyclePhase::ShutDown,
        }
    }

    /// The bound address, once running. Useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Brings up the transport and starts accepting requests.
    ///
    /// Only a server in the `Initialised` phase starts; calling `start` in
    /// any later phase is a no-op.
    ///
    /// # Errors
    ///
    /// [`ServerError::Bind`] when the configured address cannot be bound.
    pub async fn start(&self) -> Result<(), ServerError> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                Lifecycle::Initialised => *state = Lifecycle::Starting,
                _ => return Ok(()),
            }
        }

        let (handle, owned_runtime) = match &self.inner.provider {
            EventLoopProvider::SpawnNewThreads { threads } => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads((*threads).max(1))
                    .thread_name(format!("{}-worker", self.inner.name))
                    .enable_all()
                    .build()?;
                (runtime.handle().clone(), Some(runtime))
            }
            EventLoopProvider::External(handle) => (handle.clone(), None),
        };

        let bind_addr = format!("{}:{}", self.inner.config.host, self.inner.config.port);
        info!(server = %self.inner.name, address = %bind_addr, "server starting");

        let (stop_tx, stop_rx) = watch::channel(false);
        let (addr_tx, addr_rx) = oneshot::channel();
        handle.spawn(accept_loop(
            Arc::clone(&self.inner),
            bind_addr,
            stop_rx,
            addr_tx,
        ));

        let local_addr = match addr_rx.await {
            Ok(Ok(addr)) => addr,
            Ok(Err(e)) => {
                *self.inner.state.lock() = Lifecycle::Initialised;
                return Err(e);
            }
            Err(_) => {
                *self.inner.state.lock() = Lifecycle::Initialised;
                return Err(ServerError::Io(std::io::Error::other(
                    "accept loop exited before binding",
                )));
            }
        };

        if !self.inner.config.shutdown_on_signals.is_empty() {
            handle.spawn(signal_task(
                Arc::clone(&self.inner),
                self.inner.config.shutdown_on_signals.clone(),
                self.inner.shutdown_tx.subscribe(),
            ));
        }

        *self.inner.local_addr.lock() = Some(local_addr);
        *self.inner.state.lock() = Lifecycle::Running(RunningState {
            local_addr,
            stop_tx,
            owned_runtime,
        });
        info!(server = %self.inner.name, port = local_addr.port(), "server started");
        Ok(())
    }

    /// Gracefully stops the server.
    ///
    /// Stops accepting new connections, drains in-flight ones, tears down an
    /// owned event-loop group, then resumes every
    /// [`until_shutdown`](Self::until_shutdown) caller and runs the queued
    /// completion callbacks, each exactly once.
    ///
    /// # Errors
    ///
    /// [`ServerError::ShutdownOnUnstartedServer`] when the server was never
    /// started. Calling `shutdown` again while shutting down (or once shut
    /// down) is a no-op.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        shutdown_inner(&self.inner).await
    }

    /// Enqueues `callback` to run once shutdown completes, or runs it
    /// immediately if the server is already shut down.
    pub fn wait_until_shutdown(&self, callback: impl FnOnce() + Send + 'static) {
        let run_now = {
            let state = self.inner.state.lock();
            if matches!(*state, Lifecycle::ShutDown) {
                true
            } else {
                self.inner.callbacks.lock().push(Box::new(callback));
                return;
            }
        };
        if run_now {
            callback();
        }
    }

    /// Suspends the caller until the server has shut down.
    pub async fn until_shutdown(&self) {
        let mut rx = self.inner.shutdown_tx.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

async fn shutdown_inner(inner: &Arc<ServerInner>) -> Result<(), ServerError> {
    let running = {
        let mut state = inner.state.lock();
        match std::mem::replace(&mut *state, Lifecycle::ShuttingDown) {
            Lifecycle::Running(running) => running,
            Lifecycle::Initialised | Lifecycle::Starting => {
                *state = Lifecycle::Initialised;
                return Err(ServerError::ShutdownOnUnstartedServer);
            }
            Lifecycle::ShuttingDown => return Ok(()),
            Lifecycle::ShutDown => {
                *state = Lifecycle::ShutDown;
                return Ok(());
            }
        }
    };

    info!(server = %inner.name, "server shutting down");
    let _ = running.stop_tx.send(true);

    // Drain in-flight connections.
    loop {
        if inner.in_flight.load(Ordering::SeqCst) == 0 {
            break;
        }
        let notified = inner.drained.notified();
        if inner.in_flight.load(Ordering::SeqCst) == 0 {
            break;
        }
        notified.await;
    }

    // An owned group is torn down off-loop; an external group stays with its
    // owner.
    if let Some(runtime) = running.owned_runtime {
        std::thread::spawn(move || {
            runtime.shutdown_timeout(std::time::Duration::from_secs(5));
        });
    }

    let callbacks = {
        let mut state = inner.state.lock();
        *state = Lifecycle::ShutDown;
        std::mem::take(&mut *inner.callbacks.lock())
    };
    let _ = inner.shutdown_tx.send(true);
    for callback in callbacks {
        callback();
    }
    info!(server = %inner.name, "server shut down");
    Ok(())
}

async fn accept_loop(
    inner: Arc<ServerInner>,
    bind_addr: String,
    mut stop_rx: watch::Receiver<bool>,
    addr_tx: oneshot::Sender<Result<SocketAddr, ServerError>>,
) {
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            let _ = addr_tx.send(Err(ServerError::Bind {
                addr: bind_addr,
                source: e,
            }));
            return;
        }
    };
    let local_addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            let _ = addr_tx.send(Err(ServerError::Io(e)));
            return;
        }
    };
    let _ = addr_tx.send(Ok(local_addr));

    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        continue;
                    }
                };
                debug!(peer = %peer_addr, "connection accepted");

                inner.in_flight.fetch_add(1, Ordering::SeqCst);
                let conn_inner = Arc::clone(&inner);
                let conn_stop = stop_rx.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        connection::serve(Arc::clone(&conn_inner), stream, peer_addr, conn_stop).await
                    {
                        debug!(peer = %peer_addr, error = %e, "connection closed with error");
                    }
                    if conn_inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                        conn_inner.drained.notify_waiters();
                    }
                });
            }
        }
    }
    // Dropping the listener stops accepting.
}

/// Waits for the configured signals on a dedicated task and triggers
/// shutdown. Exits once the server has shut down by any path.
async fn signal_task(
    inner: Arc<ServerInner>,
    signals: Vec<ShutdownSignal>,
    mut exit_rx: watch::Receiver<bool>,
) {
    let want_int = signals.contains(&ShutdownSignal::Sigint);
    let want_term = signals.contains(&ShutdownSignal::Sigterm);

    let mut sigterm = if want_term {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok()
    } else {
        None
    };

    // Resolves on SIGTERM, or never when SIGTERM handling is off.
    async fn recv_terminate(sigterm: &mut Option<tokio::signal::unix::Signal>) {
        match sigterm {
            Some(signal) => {
                signal.recv().await;
            }
            None => std::future::pending().await,
        }
    }

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c(), if want_int => {
                if result.is_ok() {
                    info!(server = %inner.name, "SIGINT received — shutting down");
                    let _ = shutdown_inner(&inner).await;
                }
                break;
            }
            _ = recv_terminate(&mut sigterm) => {
                info!(server = %inner.name, "SIGTERM received — shutting down");
                let _ = shutdown_inner(&inner).await;
                break;
            }
            changed = exit_rx.changed() => {
                if changed.is_err() || *exit_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// Builds a [`Server`]: configuration, metrics sink, event-loop provider,
/// and operation registrations.
pub struct ServerBuilder {
    name: String,
    config: ServerConfig,
    provider: EventLoopProvider,
    metrics: Arc<dyn MetricsSink>,
    router: Router,
}

impl ServerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: ServerConfig::default(),
            provider: EventLoopProvider::default(),
            metrics: Arc::new(NoopMetrics),
            router: Router::new(),
        }
    }

    /// Replaces the whole configuration.
    ///
    /// Set configuration before registering operations: the body cap is
    /// captured into each operation's transform at registration time.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn invocation_strategy(mut self, strategy: crate::config::InvocationStrategy) -> Self {
        self.config.invocation_strategy = strategy;
        self
    }

    pub fn max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.config.max_body_bytes = max_body_bytes;
        self
    }

    pub fn enable_tracing(mut self, enable: bool) -> Self {
        self.config.enable_tracing = enable;
        self
    }

    pub fn shutdown_on_signals(mut self, signals: Vec<ShutdownSignal>) -> Self {
        self.config.shutdown_on_signals = signals;
        self
    }

    pub fn event_loop_provider(mut self, provider: EventLoopProvider) -> Self {
        self.provider = provider;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Registers an operation responding `200 OK` on success, with no extra
    /// middleware.
    pub fn add_operation<In, O, E, Op>(
        self,
        id: OperationId,
        method: Method,
        operation: Op,
        allowed_errors: Vec<AllowedError>,
    ) -> Result<Self, ServerError>
    where
        In: OperationInput + 'static,
        O: OperationOutput + 'static,
        E: ErrorShape,
        Op: Operation<In, O, E>,
    {
        self.add_operation_with_middleware(
            id,
            method,
            StatusCode::Ok,
            operation,
            allowed_errors,
            MiddlewareStack::new(),
            MiddlewareStack::new(),
        )
    }

    /// Registers an operation with a custom success status and outer/inner
    /// middleware stacks.
    ///
    /// `/ping` is reserved: a registration there is accepted but shadowed by
    /// the ping shortcut.
    #[allow(clippy::too_many_arguments)]
    pub fn add_operation_with_middleware<In, O, E, Op>(
        mut self,
        id: OperationId,
        method: Method,
        success_status: StatusCode,
        operation: Op,
        allowed_errors: Vec<AllowedError>,
        outer: MiddlewareStack<Request, ResponseWriter, OperationContext>,
        inner: MiddlewareStack<In, OperationResponseWriter<O>, OperationContext>,
    ) -> Result<Self, ServerError>
    where
        In: OperationInput + 'static,
        O: OperationOutput + 'static,
        E: ErrorShape,
        Op: Operation<In, O, E>,
    {
        let transform = OperationTransform::<In, O>::with_input_and_output(
            success_status,
            self.config.max_body_bytes,
        );
        let handler = assemble_endpoint(operation, allowed_errors, outer, inner, transform);
        self.router
            .add_handler(id.clone(), method, handler)
            .map_err(|source| ServerError::InvalidTemplate {
                operation: id.name().to_owned(),
                source,
            })?;
        Ok(self)
    }

    pub fn build(self) -> Server {
        let (shutdown_tx, _) = watch::channel(false);
        Server {
            inner: Arc::new(ServerInner {
                name: self.name,
                config: self.config,
                router: self.router,
                metrics: self.metrics,
                minter: RequestIdMinter::new(),
                provider: self.provider,
                state: Mutex::new(Lifecycle::Initialised),
                callbacks: Mutex::new(Vec::new()),
                shutdown_tx,
                local_addr: Mutex::new(None),
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        }
    }
}

// Dispatch of an assembled endpoint per the configured invocation strategy
// lives in `connection`; re-exported pieces below are the public surface.
pub use connection::MAX_HEAD_BYTES;

#[cfg(test)]
pub(crate) fn build_inner_for_tests(
    name: String,
    config: ServerConfig,
    router: Router,
    metrics: Arc<dyn MetricsSink>,
    minter: RequestIdMinter,
) -> Arc<ServerInner> {
    let (shutdown_tx, _) = watch::channel(false);
    Arc::new(ServerInner {
        name,
        config,
        router,
        metrics,
        minter,
        provider: EventLoopProvider::default(),
        state: Mutex::new(Lifecycle::Initialised),
        callbacks: Mutex::new(Vec::new()),
        shutdown_tx,
        local_addr: Mutex::new(None),
        in_flight: AtomicUsize::new(0),
        drained: Notify::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InvocationStrategy;
    use crate::error::ServiceError;
    use crate::operation::{BodyOnly, BodyOutput, PathOnly, Validate};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::AtomicUsize;
    use thiserror::Error;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[derive(Debug, Deserialize)]
    struct TheInput {
        #[serde(rename = "theID")]
        the_id: String,
    }

    impl Validate for TheInput {
        fn validate(&self) -> Result<(), ServiceError> {
            if self.the_id.len() == 12 {
                Ok(())
            } else {
                Err(ServiceError::validation("ID not the correct length."))
            }
        }
    }

    #[derive(Debug, Serialize)]
    struct TheOutput {
        #[serde(rename = "bodyColor")]
        body_color: &'static str,
        #[serde(rename = "isGreat")]
        is_great: bool,
    }

    impl Validate for TheOutput {
        fn validate(&self) -> Result<(), ServiceError> {
            if self.body_color == "YELLOW" {
                Err(ServiceError::validation("YELLOW is not great."))
            } else {
                Ok(())
            }
        }
    }

    #[derive(Debug, Error)]
    #[error("{reason}")]
    struct MyError {
        reason: String,
    }

    impl ErrorShape for MyError {
        fn kind(&self) -> &str {
            "TheError"
        }
    }

    async fn post_example(
        input: BodyOnly<TheInput>,
        _ctx: OperationContext,
    ) -> Result<BodyOutput<TheOutput>, MyError> {
        match input.0.the_id.as_str() {
            "888888888888" => Err(MyError {
                reason: "Is bad!".to_owned(),
            }),
            id if id.starts_with('9') => Ok(BodyOutput(TheOutput {
                body_color: "YELLOW",
                is_great: true,
            })),
            _ => Ok(BodyOutput(TheOutput {
                body_color: "BLUE",
                is_great: true,
            })),
        }
    }

    async fn test_server(strategy: InvocationStrategy) -> Server {
        let server = Server::builder("test-service")
            .port(0)
            .invocation_strategy(strategy)
            .shutdown_on_signals(vec![])
            .event_loop_provider(EventLoopProvider::External(
                tokio::runtime::Handle::current(),
            ))
            .add_operation(
                OperationId::new("PostExample", "/postexample"),
                Method::Post,
                post_example,
                vec![AllowedError::new("TheError", 400u16)],
            )
            .unwrap()
            .add_operation(
                OperationId::new("PostChildren", "/items/{id}/children"),
                Method::Post,
                |_input: PathOnly<ChildVars>, ctx: OperationContext| async move {
                    use crate::context::CarriesPathShape;
                    let id = ctx
                        .path_shape()
                        .get("id")
                        .unwrap_or_default()
                        .to_owned();
                    Ok::<_, MyError>(BodyOutput(Echo { id }))
                },
                vec![],
            )
            .unwrap()
            .build();
        server.start().await.unwrap();
        server
    }

    #[derive(Debug, Deserialize)]
    struct ChildVars {
        #[allow(dead_code)]
        id: String,
    }
    impl Validate for ChildVars {}

    #[derive(Debug, Serialize)]
    struct Echo {
        id: String,
    }
    impl Validate for Echo {}

    async fn send_raw(addr: SocketAddr, raw: String) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8(response).unwrap()
    }

    fn request_with_body(method: &str, target: &str, body: &str) -> String {
        format!(
            "{method} {target} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        )
    }

    fn body_of(response: &str) -> &str {
        response.split("\r\n\r\n").nth(1).unwrap_or("")
    }

    // ── end-to-end scenarios ──────────────────────────────────────────────

    #[tokio::test]
    async fn happy_path_returns_encoded_output() {
        let server = test_server(InvocationStrategy::OriginalEventLoop).await;
        let addr = server.local_addr().unwrap();

        let response = send_raw(
            addr,
            request_with_body("POST", "/postexample", r#"{"theID":"123456789012"}"#),
        )
        .await;

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Type: application/json\r\n"));
        let json: serde_json::Value = serde_json::from_str(body_of(&response)).unwrap();
        assert_eq!(json["bodyColor"], "BLUE");
        assert_eq!(json["isGreat"], true);

        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn input_validation_failure_is_400() {
        let server = test_server(InvocationStrategy::OriginalEventLoop).await;
        let addr = server.local_addr().unwrap();

        let response = send_raw(
            addr,
            request_with_body("POST", "/postexample", r#"{"theID":"short"}"#),
        )
        .await;

        assert!(response.starts_with("HTTP/1.1 400 "));
        let json: serde_json::Value = serde_json::from_str(body_of(&response)).unwrap();
        assert_eq!(json["__type"], "ValidationError");
        assert_eq!(json["message"], "ID not the correct length.");

        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn output_validation_failure_is_opaque_500() {
        let server = test_server(InvocationStrategy::OriginalEventLoop).await;
        let addr = server.local_addr().unwrap();

        let response = send_raw(
            addr,
            request_with_body("POST", "/postexample", r#"{"theID":"999999999999"}"#),
        )
        .await;

        assert!(response.starts_with("HTTP/1.1 500 "));
        let json: serde_json::Value = serde_json::from_str(body_of(&response)).unwrap();
        assert_eq!(json["__type"], "InternalError");
        assert!(json["message"].is_null());

        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn declared_error_uses_registered_status_and_kind() {
        let server = test_server(InvocationStrategy::OriginalEventLoop).await;
        let addr = server.local_addr().unwrap();

        let response = send_raw(
            addr,
            request_with_body("POST", "/postexample", r#"{"theID":"888888888888"}"#),
        )
        .await;

        assert!(response.starts_with("HTTP/1.1 400 "));
        let json: serde_json::Value = serde_json::from_str(body_of(&response)).unwrap();
        assert_eq!(json["__type"], "TheError");
        assert_eq!(json["message"], "Is bad!");

        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_route_is_invalid_operation() {
        let server = test_server(InvocationStrategy::OriginalEventLoop).await;
        let addr = server.local_addr().unwrap();

        let response = send_raw(addr, request_with_body("POST", "/unknown", "{}")).await;
        assert!(response.starts_with("HTTP/1.1 400 "));
        let json: serde_json::Value = serde_json::from_str(body_of(&response)).unwrap();
        assert_eq!(json["__type"], "InvalidOperation");

        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn wrong_method_is_invalid_operation() {
        let server = test_server(InvocationStrategy::OriginalEventLoop).await;
        let addr = server.local_addr().unwrap();

        let response = send_raw(
            addr,
            "GET /postexample HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n".to_owned(),
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 400 "));
        let json: serde_json::Value = serde_json::from_str(body_of(&response)).unwrap();
        assert_eq!(json["__type"], "InvalidOperation");

        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn ping_shortcut_answers_in_plain_text() {
        let server = test_server(InvocationStrategy::OriginalEventLoop).await;
        let addr = server.local_addr().unwrap();

        for method in ["GET", "POST", "DELETE"] {
            let response = send_raw(
                addr,
                format!("{method} /ping HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"),
            )
            .await;
            assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{method}");
            assert!(response.contains("Content-Type: text/plain\r\n"));
            assert_eq!(body_of(&response), "Ping completed.");
        }

        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn tokenized_path_delivers_shape_to_operation() {
        let server = test_server(InvocationStrategy::OriginalEventLoop).await;
        let addr = server.local_addr().unwrap();

        let response = send_raw(
            addr,
            "POST /items/abc/children HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Length: 0\r\n\r\n"
                .to_owned(),
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        let json: serde_json::Value = serde_json::from_str(body_of(&response)).unwrap();
        assert_eq!(json["id"], "abc");

        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn over_cap_body_reports_validation() {
        let server = Server::builder("cap-service")
            .port(0)
            .max_body_bytes(16)
            .shutdown_on_signals(vec![])
            .event_loop_provider(EventLoopProvider::External(
                tokio::runtime::Handle::current(),
            ))
            .add_operation(
                OperationId::new("PostExample", "/postexample"),
                Method::Post,
                post_example,
                vec![],
            )
            .unwrap()
            .build();
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let response = send_raw(
            addr,
            request_with_body("POST", "/postexample", r#"{"theID":"123456789012"}"#),
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 400 "));
        let json: serde_json::Value = serde_json::from_str(body_of(&response)).unwrap();
        assert_eq!(json["__type"], "ValidationError");

        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn request_id_is_echoed() {
        let server = test_server(InvocationStrategy::OriginalEventLoop).await;
        let addr = server.local_addr().unwrap();

        let response = send_raw(
            addr,
            request_with_body("POST", "/postexample", r#"{"theID":"123456789012"}"#),
        )
        .await;
        let id_line = response
            .lines()
            .find(|l| l.to_ascii_lowercase().starts_with("x-smoke-request-id:"))
            .expect("response carries x-smoke-request-id");
        assert!(!id_line.split(':').nth(1).unwrap().trim().is_empty());

        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn trace_id_is_echoed_when_present() {
        let server = test_server(InvocationStrategy::OriginalEventLoop).await;
        let addr = server.local_addr().unwrap();

        let body = r#"{"theID":"123456789012"}"#;
        let raw = format!(
            "POST /postexample HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nx-smoke-trace-id: trace-42\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let response = send_raw(addr, raw).await;
        assert!(response.contains("x-smoke-trace-id: trace-42\r\n"));

        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn task_group_and_dispatch_queue_strategies_serve_requests() {
        for strategy in [
            InvocationStrategy::CooperativeTaskGroup,
            InvocationStrategy::DispatchQueue,
        ] {
            let server = test_server(strategy).await;
            let addr = server.local_addr().unwrap();
            let response = send_raw(
                addr,
                request_with_body("POST", "/postexample", r#"{"theID":"123456789012"}"#),
            )
            .await;
            assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{strategy:?}");
            server.shutdown().await.unwrap();
        }
    }

    #[tokio::test]
    async fn custom_status_and_middleware_stacks() {
        use crate::middleware::{from_fn, RequestLogMiddleware};

        let inner_hits = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&inner_hits);
        let inner_stack = MiddlewareStack::new().with(from_fn(
            move |input: BodyOnly<TheInput>,
                  writer: OperationResponseWriter<BodyOutput<TheOutput>>,
                  ctx,
                  next| {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    next.run(input, writer, ctx).await
                }
            },
        ));
        let outer_stack = MiddlewareStack::new().with(RequestLogMiddleware);

        let server = Server::builder("middleware-service")
            .port(0)
            .shutdown_on_signals(vec![])
            .event_loop_provider(EventLoopProvider::External(
                tokio::runtime::Handle::current(),
            ))
            .add_operation_with_middleware(
                OperationId::new("PostExample", "/postexample"),
                Method::Post,
                StatusCode::Created,
                post_example,
                vec![AllowedError::new("TheError", 400u16)],
                outer_stack,
                inner_stack,
            )
            .unwrap()
            .build();
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let response = send_raw(
            addr,
            request_with_body("POST", "/postexample", r#"{"theID":"123456789012"}"#),
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 201 Created\r\n"));
        assert_eq!(inner_hits.load(Ordering::SeqCst), 1);

        server.shutdown().await.unwrap();
    }

    // ── lifecycle ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn shutdown_before_start_fails() {
        let server = Server::builder("unstarted").build();
        let err = server.shutdown().await.unwrap_err();
        assert!(matches!(err, ServerError::ShutdownOnUnstartedServer));
        assert_eq!(server.phase(), LifecyclePhase::Initialised);
    }

    #[tokio::test]
    async fn start_is_a_noop_after_running() {
        let server = test_server(InvocationStrategy::OriginalEventLoop).await;
        assert_eq!(server.phase(), LifecyclePhase::Running);
        server.start().await.unwrap(); // no-op
        assert_eq!(server.phase(), LifecyclePhase::Running);
        server.shutdown().await.unwrap();
        assert_eq!(server.phase(), LifecyclePhase::ShutDown);
    }

    #[tokio::test]
    async fn waiters_and_callbacks_resume_exactly_once() {
        let server = Arc::new(test_server(InvocationStrategy::OriginalEventLoop).await);

        let calls = Arc::new(AtomicUsize::new(0));
        let cb_calls = Arc::clone(&calls);
        server.wait_until_shutdown(move || {
            cb_calls.fetch_add(1, Ordering::SeqCst);
        });

        let waiter = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.until_shutdown().await })
        };

        // Two concurrent shutdowns: one wins, the other no-ops.
        let (a, b) = tokio::join!(server.shutdown(), server.shutdown());
        a.unwrap();
        b.unwrap();

        waiter.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Registering after shutdown runs immediately.
        let late = Arc::new(AtomicUsize::new(0));
        let late_inner = Arc::clone(&late);
        server.wait_until_shutdown(move || {
            late_inner.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(late.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn until_shutdown_returns_immediately_when_already_down() {
        let server = test_server(InvocationStrategy::OriginalEventLoop).await;
        server.shutdown().await.unwrap();
        server.until_shutdown().await; // must not hang
    }

    /// Reads exactly one HTTP/1.1 response, honouring `Content-Length`.
    async fn read_one_response(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed mid-response");
            buf.extend_from_slice(&chunk[..n]);

            let text = String::from_utf8_lossy(&buf);
            if let Some(split) = text.find("\r\n\r\n") {
                let content_length = text[..split]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.trim()
                            .eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())?
                    })
                    .unwrap_or(0);
                if buf.len() >= split + 4 + content_length {
                    return text.into_owned();
                }
            }
        }
    }

    #[tokio::test]
    async fn keep_alive_serves_sequential_requests() {
        let server = test_server(InvocationStrategy::OriginalEventLoop).await;
        let addr = server.local_addr().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        for _ in 0..2 {
            let body = r#"{"theID":"123456789012"}"#;
            let raw = format!(
                "POST /postexample HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(raw.as_bytes()).await.unwrap();

            let response = read_one_response(&mut stream).await;
            assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
            assert!(response.contains("Connection: keep-alive\r\n"));
        }

        server.shutdown().await.unwrap();
    }
}
