//! Middleware pipeline — composable, typed `(input, writer, context)` layers.
//!
//! Two families make up a pipeline:
//!
//! - [`Middleware`] — a layer over a fixed triple `(In, W, Ctx)`. It may
//!   observe or mutate the triple, short-circuit by completing the writer
//!   without calling [`Next::run`], or pass through.
//! - [`TransformingMiddleware`] (see [`transform`]) — the distinguished
//!   segment that changes the triple's types, spanning the request-decode /
//!   response-bind step.
//!
//! A full pipeline composes as
//! `outer₁ ∘ … ∘ outerₙ ∘ transform ∘ inner₁ ∘ … ∘ innerₘ ∘ operation`.

use std::sync::Arc;

use crate::error::ServiceError;
use crate::BoxFuture;

pub mod logging;
pub mod transform;

pub use logging::RequestLogMiddleware;
pub use transform::{OperationTransform, PassthroughTransform, TransformNext, TransformingMiddleware};

/// The function at the end of a middleware chain.
pub type Terminal<In, W, Ctx> =
    Arc<dyn Fn(In, W, Ctx) -> BoxFuture<'static, Result<(), ServiceError>> + Send + Sync>;

/// A middleware layer over the `(In, W, Ctx)` triple.
///
/// Implementations clone whatever they need out of `&self` before building
/// their future, since the returned future is `'static`.
pub trait Middleware<In, W, Ctx>: Send + Sync {
    /// Handle the triple and optionally delegate to the next layer.
    ///
    /// Short-circuiting is done by completing the writer and returning
    /// without calling [`Next::run`].
    fn handle(
        &self,
        input: In,
        writer: W,
        ctx: Ctx,
        next: Next<In, W, Ctx>,
    ) -> BoxFuture<'static, Result<(), ServiceError>>;
}

/// A cursor into the remaining layers of one chain, ending in its terminal.
///
/// `Next` is consumed by [`run`](Self::run), so a layer cannot invoke the
/// remainder of the chain more than once.
pub struct Next<In, W, Ctx> {
    layers: Vec<Arc<dyn Middleware<In, W, Ctx>>>,
    index: usize,
    terminal: Terminal<In, W, Ctx>,
}

impl<In, W, Ctx> Next<In, W, Ctx>
where
    In: Send + 'static,
    W: Send + 'static,
    Ctx: Send + 'static,
{
    /// Invokes the next layer in the chain, or the terminal once the layers
    /// are exhausted.
    pub fn run(
        mut self,
        input: In,
        writer: W,
        ctx: Ctx,
    ) -> BoxFuture<'static, Result<(), ServiceError>> {
        if self.index < self.layers.len() {
            let layer = Arc::clone(&self.layers[self.index]);
            self.index += 1;
            layer.handle(input, writer, ctx, self)
        } else {
            (self.terminal)(input, writer, ctx)
        }
    }
}

/// An ordered, homogeneous list of middleware layers.
///
/// Stacks are built once at registration and cloned per request; clones
/// share the layers through `Arc`.
pub struct MiddlewareStack<In, W, Ctx> {
    layers: Vec<Arc<dyn Middleware<In, W, Ctx>>>,
}

impl<In, W, Ctx> Clone for MiddlewareStack<In, W, Ctx> {
    fn clone(&self) -> Self {
        Self {
            layers: self.layers.clone(),
        }
    }
}

impl<In, W, Ctx> Default for MiddlewareStack<In, W, Ctx>
where
    In: Send + 'static,
    W: Send + 'static,
    Ctx: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<In, W, Ctx> MiddlewareStack<In, W, Ctx>
where
    In: Send + 'static,
    W: Send + 'static,
    Ctx: Send + 'static,
{
    /// The identity stack: no layers.
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    /// Appends a layer to the end of the stack.
    pub fn push<M>(&mut self, layer: M)
    where
        M: Middleware<In, W, Ctx> + 'static,
    {
        self.layers.push(Arc::new(layer));
    }

    /// Builder-style [`push`](Self::push).
    pub fn with<M>(mut self, layer: M) -> Self
    where
        M: Middleware<In, W, Ctx> + 'static,
    {
        self.push(layer);
        self
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// `true` for the identity stack.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Runs the triple through every layer, ending in `terminal`.
    pub fn run(
        &self,
        input: In,
        writer: W,
        ctx: Ctx,
        terminal: Terminal<In, W, Ctx>,
    ) -> BoxFuture<'static, Result<(), ServiceError>> {
        Next {
            layers: self.layers.clone(),
            index: 0,
            terminal,
        }
        .run(input, writer, ctx)
    }
}

/// Wraps a closure as a [`Middleware`] layer.
///
/// # Examples
///
/// ```
/// use opserve::middleware::{from_fn, MiddlewareStack};
/// use opserve::context::OperationContext;
/// use opserve::http::Request;
/// use opserve::writer::ResponseWriter;
///
/// let stack: MiddlewareStack<Request, ResponseWriter, OperationContext> =
///     MiddlewareStack::new().with(from_fn(|req, writer, ctx, next| async move {
///         next.run(req, writer, ctx).await
///     }));
/// assert_eq!(stack.len(), 1);
/// ```
pub fn from_fn<In, W, Ctx, F, Fut>(f: F) -> FnMiddleware<F>
where
    F: Fn(In, W, Ctx, Next<In, W, Ctx>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), ServiceError>> + Send + 'static,
{
    FnMiddleware { f }
}

/// See [`from_fn`].
pub struct FnMiddleware<F> {
    f: F,
}

impl<In, W, Ctx, F, Fut> Middleware<In, W, Ctx> for FnMiddleware<F>
where
    In: Send + 'static,
    W: Send + 'static,
    Ctx: Send + 'static,
    F: Fn(In, W, Ctx, Next<In, W, Ctx>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), ServiceError>> + Send + 'static,
{
    fn handle(
        &self,
        input: In,
        writer: W,
        ctx: Ctx,
        next: Next<In, W, Ctx>,
    ) -> BoxFuture<'static, Result<(), ServiceError>> {
        Box::pin((self.f)(input, writer, ctx, next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Trace = Arc<parking_lot::Mutex<Vec<&'static str>>>;

    fn tracing_layer(trace: Trace, label: &'static str) -> impl Middleware<u32, (), ()> {
        from_fn(move |input: u32, writer: (), ctx: (), next| {
            let trace = Arc::clone(&trace);
            async move {
                trace.lock().push(label);
                next.run(input, writer, ctx).await
            }
        })
    }

    #[tokio::test]
    async fn layers_run_in_insertion_order() {
        let trace: Trace = Arc::default();
        let stack = MiddlewareStack::new()
            .with(tracing_layer(Arc::clone(&trace), "a"))
            .with(tracing_layer(Arc::clone(&trace), "b"));

        let hits = Arc::new(AtomicUsize::new(0));
        let terminal_hits = Arc::clone(&hits);
        let terminal: Terminal<u32, (), ()> = Arc::new(move |_, _, _| {
            let hits = Arc::clone(&terminal_hits);
            Box::pin(async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        stack.run(7, (), (), terminal).await.unwrap();
        assert_eq!(*trace.lock(), vec!["a", "b"]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn short_circuit_skips_terminal() {
        let stack: MiddlewareStack<u32, (), ()> =
            MiddlewareStack::new().with(from_fn(|_input, _writer, _ctx, _next| async move {
                // never calls next
                Ok(())
            }));

        let hits = Arc::new(AtomicUsize::new(0));
        let terminal_hits = Arc::clone(&hits);
        let terminal: Terminal<u32, (), ()> = Arc::new(move |_, _, _| {
            let hits = Arc::clone(&terminal_hits);
            Box::pin(async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        stack.run(7, (), (), terminal).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn layers_may_mutate_the_input() {
        let stack: MiddlewareStack<u32, (), ()> = MiddlewareStack::new()
            .with(from_fn(|input: u32, writer, ctx, next| async move {
                next.run(input + 1, writer, ctx).await
            }));

        let seen = Arc::new(AtomicUsize::new(0));
        let terminal_seen = Arc::clone(&seen);
        let terminal: Terminal<u32, (), ()> = Arc::new(move |input, _, _| {
            let seen = Arc::clone(&terminal_seen);
            Box::pin(async move {
                seen.store(input as usize, Ordering::SeqCst);
                Ok(())
            })
        });

        stack.run(7, (), (), terminal).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn identity_stack_goes_straight_to_terminal() {
        let stack: MiddlewareStack<u32, (), ()> = MiddlewareStack::new();
        assert!(stack.is_empty());

        let hits = Arc::new(AtomicUsize::new(0));
        let terminal_hits = Arc::clone(&hits);
        let terminal: Terminal<u32, (), ()> = Arc::new(move |_, _, _| {
            let hits = Arc::clone(&terminal_hits);
            Box::pin(async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        stack.run(1, (), (), terminal).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn errors_short_circuit_upward() {
        let trace: Trace = Arc::default();
        let stack = MiddlewareStack::new()
            .with(from_fn(|_input: u32, _writer: (), _ctx: (), _next| {
                async move { Err(ServiceError::validation("rejected")) }
            }))
            .with(tracing_layer(Arc::clone(&trace), "unreached"));

        let terminal: Terminal<u32, (), ()> =
            Arc::new(|_, _, _| Box::pin(async { Ok(()) }));

        let err = stack.run(1, (), (), terminal).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation { .. }));
        assert!(trace.lock().is_empty());
    }
}
