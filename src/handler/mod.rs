//! Operation endpoint assembly.
//!
//! Combines the outer middleware stack, the transform segment, the inner
//! middleware stack, the operation itself, and the response transform into
//! one routed endpoint: a type-erased handler the router can dispatch to.
//! Each registration is monomorphised; the only dynamic dispatch on the
//! request path is the router's table lookup.

use std::sync::Arc;

use crate::context::OperationContext;
use crate::error::ServiceError;
use crate::http::{Request, StatusCode};
use crate::middleware::transform::terminal_from;
use crate::middleware::{
    MiddlewareStack, Terminal, TransformNext, TransformingMiddleware,
};
use crate::operation::{ErrorShape, Operation, OperationInput, OperationOutput};
use crate::writer::{OperationResponseWriter, ResponseWriter};
use crate::BoxFuture;

/// The type-erased endpoint installed into the router.
pub type RouteHandler = Arc<
    dyn Fn(Request, ResponseWriter, OperationContext) -> BoxFuture<'static, Result<(), ServiceError>>
        + Send
        + Sync,
>;

/// One entry of an operation's declared-error table.
///
/// Identity is the `kind` string, which must be stable across rebuilds.
/// Duplicate kinds keep the first entry.
#[derive(Debug, Clone)]
pub struct AllowedError {
    pub kind: String,
    pub status: StatusCode,
}

impl AllowedError {
    pub fn new(kind: impl Into<String>, status: impl Into<StatusCode>) -> Self {
        Self {
            kind: kind.into(),
            status: status.into(),
        }
    }
}

/// Maps a domain error through the declared-error table.
///
/// A matched kind becomes [`ServiceError::Declared`] with the table's
/// status; a miss is an *internal* error, with the reason kept for logs.
pub(crate) fn map_declared<E: ErrorShape>(allowed: &[AllowedError], error: &E) -> ServiceError {
    match allowed.iter().find(|entry| entry.kind == error.kind()) {
        Some(entry) => ServiceError::Declared {
            kind: entry.kind.clone(),
            status: entry.status,
            message: error.message(),
        },
        None => ServiceError::internal(format!(
            "operation failed with undeclared error kind {:?}: {error}",
            error.kind()
        )),
    }
}

/// Assembles `outer* ∘ transform ∘ inner* ∘ operation ∘ response-transform`
/// into a routed endpoint.
///
/// The operation's result is matched against `allowed_errors`; errors bubble
/// out of the returned handler for the handler-frame guard to serialize and
/// complete.
pub fn assemble_endpoint<In, O, E, Op, T>(
    operation: Op,
    allowed_errors: Vec<AllowedError>,
    outer: MiddlewareStack<Request, ResponseWriter, OperationContext>,
    inner: MiddlewareStack<In, OperationResponseWriter<O>, OperationContext>,
    transform: T,
) -> RouteHandler
where
    In: OperationInput + 'static,
    O: OperationOutput + 'static,
    E: ErrorShape,
    Op: Operation<In, O, E>,
    T: TransformingMiddleware<
            InputIn = Request,
            WriterIn = ResponseWriter,
            ContextIn = OperationContext,
            InputOut = In,
            WriterOut = OperationResponseWriter<O>,
            ContextOut = OperationContext,
        > + 'static,
{
    let operation = Arc::new(operation);
    let allowed = Arc::new(allowed_errors);
    let transform = Arc::new(transform);

    // The innermost terminal: invoke the operation, encode its output (the
    // response transform), or map its error through the declared table.
    let op_terminal: Terminal<In, OperationResponseWriter<O>, OperationContext> = {
        let operation = Arc::clone(&operation);
        let allowed = Arc::clone(&allowed);
        terminal_from(move |input: In, writer: OperationResponseWriter<O>, ctx| {
            let operation = Arc::clone(&operation);
            let allowed = Arc::clone(&allowed);
            async move {
                match operation.invoke(input, ctx).await {
                    Ok(output) => writer.send_output(output).await,
                    Err(domain) => Err(map_declared(&allowed, &domain)),
                }
            }
        })
    };

    // Entry into the inner stack, handed to the transform as its next.
    let inner_entry: Terminal<In, OperationResponseWriter<O>, OperationContext> = {
        let inner = inner.clone();
        let op_terminal = op_terminal.clone();
        Arc::new(move |input, writer, ctx| {
            inner.run(input, writer, ctx, Arc::clone(&op_terminal))
        })
    };

    // Outer terminal: the transform segment bridging raw to typed.
    let outer_terminal: Terminal<Request, ResponseWriter, OperationContext> = {
        let transform = Arc::clone(&transform);
        let inner_entry = inner_entry.clone();
        Arc::new(move |request, writer, ctx| {
            transform.transform(
                request,
                writer,
                ctx,
                TransformNext::new(Arc::clone(&inner_entry)),
            )
        })
    };

    Arc::new(move |request, writer, ctx| {
        outer.run(request, writer, ctx, Arc::clone(&outer_terminal))
    })
}
