//! The transform segment — the pipeline stage that changes the triple's
//! types, spanning the request-decode / response-bind step.
//!
//! On the way in it consumes the raw [`Request`], collects the body up to
//! the configured cap, composes the typed operation input from the four
//! surfaces, and wraps the raw writer into the typed
//! [`OperationResponseWriter`]. The context passes through unchanged.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::context::{CarriesPathShape, OperationContext};
use crate::error::ServiceError;
use crate::http::{Request, StatusCode};
use crate::middleware::Terminal;
use crate::operation::{InputSurfaces, NoInput, NoOutput, OperationInput, OperationOutput};
use crate::writer::{OperationResponseWriter, ResponseWriter};
use crate::BoxFuture;

/// A middleware whose output triple types differ from its input triple.
///
/// The framework composes transforms statically: the output types of the
/// segment are the input types of everything downstream of it.
pub trait TransformingMiddleware: Send + Sync {
    type InputIn: Send + 'static;
    type WriterIn: Send + 'static;
    type ContextIn: Send + 'static;
    type InputOut: Send + 'static;
    type WriterOut: Send + 'static;
    type ContextOut: Send + 'static;

    fn transform(
        &self,
        input: Self::InputIn,
        writer: Self::WriterIn,
        ctx: Self::ContextIn,
        next: TransformNext<Self::InputOut, Self::WriterOut, Self::ContextOut>,
    ) -> BoxFuture<'static, Result<(), ServiceError>>;
}

/// Continuation of the pipeline downstream of a transform segment.
pub struct TransformNext<In, W, Ctx> {
    terminal: Terminal<In, W, Ctx>,
}

impl<In, W, Ctx> TransformNext<In, W, Ctx>
where
    In: Send + 'static,
    W: Send + 'static,
    Ctx: Send + 'static,
{
    pub fn new(terminal: Terminal<In, W, Ctx>) -> Self {
        Self { terminal }
    }

    /// Hands the transformed triple to the downstream pipeline.
    pub fn run(self, input: In, writer: W, ctx: Ctx) -> BoxFuture<'static, Result<(), ServiceError>> {
        (self.terminal)(input, writer, ctx)
    }
}

/// The operation transform: raw request in, typed input and typed writer out.
///
/// Constructed through one of the three typed factories, depending on
/// whether the operation consumes an input and produces an output.
pub struct OperationTransform<In, O> {
    success_status: StatusCode,
    max_body_bytes: usize,
    _types: PhantomData<fn(In, O)>,
}

impl<In, O> OperationTransform<In, O>
where
    In: OperationInput + 'static,
    O: OperationOutput + 'static,
{
    /// Transform for an operation with both a typed input and a typed output.
    pub fn with_input_and_output(success_status: StatusCode, max_body_bytes: usize) -> Self {
        Self {
            success_status,
            max_body_bytes,
            _types: PhantomData,
        }
    }
}

impl<In> OperationTransform<In, NoOutput>
where
    In: OperationInput + 'static,
{
    /// Transform for an operation with a typed input and no output.
    pub fn with_input_no_output(success_status: StatusCode, max_body_bytes: usize) -> Self {
        Self::with_input_and_output(success_status, max_body_bytes)
    }
}

impl<O> OperationTransform<NoInput, O>
where
    O: OperationOutput + 'static,
{
    /// Transform for an operation with no input and a typed output.
    pub fn no_input_with_output(success_status: StatusCode, max_body_bytes: usize) -> Self {
        Self::with_input_and_output(success_status, max_body_bytes)
    }
}

impl<In, O> TransformingMiddleware for OperationTransform<In, O>
where
    In: OperationInput + 'static,
    O: OperationOutput + 'static,
{
    type InputIn = Request;
    type WriterIn = ResponseWriter;
    type ContextIn = OperationContext;
    type InputOut = In;
    type WriterOut = OperationResponseWriter<O>;
    type ContextOut = OperationContext;

    fn transform(
        &self,
        request: Request,
        writer: ResponseWriter,
        ctx: OperationContext,
        next: TransformNext<In, OperationResponseWriter<O>, OperationContext>,
    ) -> BoxFuture<'static, Result<(), ServiceError>> {
        let max_body_bytes = self.max_body_bytes;
        let success_status = self.success_status;
        Box::pin(async move {
            let (head, body) = request.into_parts();
            // The cap applies to every operation, input-consuming or not.
            let bytes = body.collect(max_body_bytes).await?;

            let input = {
                let (_, query) = head.split_uri();
                let surfaces =
                    InputSurfaces::new(query, ctx.path_shape(), &head.headers, &bytes);
                In::compose(surfaces)?
            };
            input.validate()?;

            let typed = OperationResponseWriter::new(writer, success_status);
            next.run(input, typed, ctx).await
        })
    }
}

/// The untyped pass-through transform: the triple flows unchanged.
pub struct PassthroughTransform;

impl TransformingMiddleware for PassthroughTransform {
    type InputIn = Request;
    type WriterIn = ResponseWriter;
    type ContextIn = OperationContext;
    type InputOut = Request;
    type WriterOut = ResponseWriter;
    type ContextOut = OperationContext;

    fn transform(
        &self,
        input: Request,
        writer: ResponseWriter,
        ctx: OperationContext,
        next: TransformNext<Request, ResponseWriter, OperationContext>,
    ) -> BoxFuture<'static, Result<(), ServiceError>> {
        next.run(input, writer, ctx)
    }
}

/// Helper for building a [`TransformNext`] from a closure in tests and
/// assembly code.
pub(crate) fn terminal_from<In, W, Ctx, F, Fut>(f: F) -> Terminal<In, W, Ctx>
where
    In: Send + 'static,
    W: Send + 'static,
    Ctx: Send + 'static,
    F: Fn(In, W, Ctx) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), ServiceError>> + Send + 'static,
{
    Arc::new(move |input, writer, ctx| Box::pin(f(input, writer, ctx)))
}
