//! # opserve
//!
//! An operation-oriented async HTTP/1.1 server framework written in Rust.
//!
//! A server process becomes a dispatch surface for strongly-typed
//! *operations*: input struct → output struct, with a closed set of declared
//! errors. Requests are routed by (path template, method), decoded into a
//! typed input from the path, query, headers, and body surfaces, run through
//! an ordered middleware pipeline, and encoded back as a typed HTTP
//! response.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use opserve::http::Method;
//! use opserve::operation::{BodyOnly, BodyOutput, OperationId, Validate};
//! use opserve::server::Server;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Deserialize)]
//! struct GreetInput { name: String }
//! impl Validate for GreetInput {}
//!
//! #[derive(Serialize)]
//! struct GreetOutput { greeting: String }
//! impl Validate for GreetOutput {}
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::builder("greeter")
//!         .port(8080)
//!         .add_operation(
//!             OperationId::new("Greet", "/greet"),
//!             Method::Post,
//!             |input: BodyOnly<GreetInput>, _ctx| async move {
//!                 Ok::<_, std::convert::Infallible>(BodyOutput(GreetOutput {
//!                     greeting: format!("Hello, {}!", input.0.name),
//!                 }))
//!             },
//!             vec![],
//!         )?
//!         .build();
//!
//!     server.start().await?;
//!     server.until_shutdown().await;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod handler;
pub mod http;
pub mod middleware;
pub mod observe;
pub mod operation;
pub mod path;
pub mod router;
pub mod server;
pub mod writer;

/// Boxed, sendable future — the shape every type-erased pipeline stage
/// returns.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ── Convenience re-exports ────────────────────────────────────────────────
pub use config::{EventLoopProvider, InvocationStrategy, ServerConfig, ShutdownSignal};
pub use error::ServiceError;
pub use handler::AllowedError;
pub use http::{Headers, Method, StatusCode};
pub use operation::{OperationId, Validate};
pub use server::{Server, ServerBuilder, ServerError};
