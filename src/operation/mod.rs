//! Typed operation I/O — the contracts the framework relies on.
//!
//! An operation is a typed async function `(Input, OperationContext) ->
//! Result<Output, Error>` with a closed set of declared error kinds. Its
//! input is composed from four independently-decoded surfaces (query, path,
//! headers, body), its output split across body bytes and additional
//! headers.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::future::Future;

use crate::codec;
use crate::context::OperationContext;
use crate::error::ServiceError;
use crate::http::Headers;
use crate::path::PathShape;
use crate::BoxFuture;

/// Identifies a registered operation.
///
/// Externally comparable; yields the canonical path template and a stable
/// description used for logs and metrics. Registration is unique per
/// (identifier, method) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationId {
    name: String,
    path: String,
}

impl OperationId {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// Stable description for logs and metrics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The canonical path template.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// The four decode surfaces handed to [`OperationInput::compose`].
///
/// Each accessor is a fallible thunk; failures propagate unchanged, and an
/// input type that uses only one surface simply never invokes the others.
#[derive(Clone, Copy)]
pub struct InputSurfaces<'a> {
    pub(crate) query: Option<&'a str>,
    pub(crate) shape: &'a PathShape,
    pub(crate) headers: &'a Headers,
    pub(crate) body: &'a Bytes,
}

impl<'a> InputSurfaces<'a> {
    pub fn new(
        query: Option<&'a str>,
        shape: &'a PathShape,
        headers: &'a Headers,
        body: &'a Bytes,
    ) -> Self {
        Self {
            query,
            shape,
            headers,
            body,
        }
    }

    /// Decodes the query string surface.
    pub fn query<T: DeserializeOwned>(&self) -> Result<T, ServiceError> {
        codec::decode_query(self.query)
    }

    /// Decodes the path-variable surface.
    pub fn path<T: DeserializeOwned>(&self) -> Result<T, ServiceError> {
        codec::decode_path(self.shape)
    }

    /// Decodes the header surface.
    pub fn headers<T: DeserializeOwned>(&self) -> Result<T, ServiceError> {
        codec::decode_headers(self.headers)
    }

    /// Decodes the body surface; an empty body fails with *validation*.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T, ServiceError> {
        codec::decode_body(self.body)
    }

    /// Decodes the body surface, mapping an empty body to `None`.
    pub fn body_optional<T: DeserializeOwned>(&self) -> Result<Option<T>, ServiceError> {
        codec::decode_body_optional(self.body)
    }
}

/// Validation hook shared by input and output payload types.
///
/// The default accepts everything; override to reject malformed values with
/// a human-readable reason.
pub trait Validate {
    fn validate(&self) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// A typed operation input, composed once per request from the four
/// surfaces. Decoding is not retried.
pub trait OperationInput: Sized + Send {
    fn compose(surfaces: InputSurfaces<'_>) -> Result<Self, ServiceError>;

    /// Runs after decode, before the operation. Failures report as
    /// *validation*.
    fn validate(&self) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// The encoded pieces of an operation output.
pub struct OutputParts {
    /// Content type and bytes of the response body, when the output has one.
    pub body: Option<(String, Bytes)>,
    /// Additional response headers contributed by the output.
    pub extra_headers: Headers,
}

impl OutputParts {
    /// An output with neither body nor headers.
    pub fn none() -> Self {
        Self {
            body: None,
            extra_headers: Headers::new(),
        }
    }
}

/// A typed operation output, split across body bytes and extra headers.
/// The framework requires neither.
pub trait OperationOutput: Send {
    fn into_parts(self) -> Result<OutputParts, ServiceError>;

    /// Runs before encode. Failures report as *internal*: the service
    /// produced a malformed value.
    fn validate(&self) -> Result<(), ServiceError> {
        Ok(())
    }
}

// ── surface adapters ──────────────────────────────────────────────────────

/// Input decoded entirely from the request body.
#[derive(Debug, Clone, PartialEq)]
pub struct BodyOnly<T>(pub T);

impl<T: DeserializeOwned + Validate + Send> OperationInput for BodyOnly<T> {
    fn compose(surfaces: InputSurfaces<'_>) -> Result<Self, ServiceError> {
        surfaces.body().map(BodyOnly)
    }

    fn validate(&self) -> Result<(), ServiceError> {
        self.0.validate()
    }
}

/// Input decoded entirely from the query string.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOnly<T>(pub T);

impl<T: DeserializeOwned + Validate + Send> OperationInput for QueryOnly<T> {
    fn compose(surfaces: InputSurfaces<'_>) -> Result<Self, ServiceError> {
        surfaces.query().map(QueryOnly)
    }

    fn validate(&self) -> Result<(), ServiceError> {
        self.0.validate()
    }
}

/// Input decoded entirely from the matched path variables.
#[derive(Debug, Clone, PartialEq)]
pub struct PathOnly<T>(pub T);

impl<T: DeserializeOwned + Validate + Send> OperationInput for PathOnly<T> {
    fn compose(surfaces: InputSurfaces<'_>) -> Result<Self, ServiceError> {
        surfaces.path().map(PathOnly)
    }

    fn validate(&self) -> Result<(), ServiceError> {
        self.0.validate()
    }
}

/// Input decoded entirely from the request headers.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadersOnly<T>(pub T);

impl<T: DeserializeOwned + Validate + Send> OperationInput for HeadersOnly<T> {
    fn compose(surfaces: InputSurfaces<'_>) -> Result<Self, ServiceError> {
        surfaces.headers().map(HeadersOnly)
    }

    fn validate(&self) -> Result<(), ServiceError> {
        self.0.validate()
    }
}

/// The input of an operation that reads nothing from the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NoInput;

impl OperationInput for NoInput {
    fn compose(_surfaces: InputSurfaces<'_>) -> Result<Self, ServiceError> {
        Ok(NoInput)
    }
}

/// Output serialized as a JSON body with no extra headers.
#[derive(Debug, Clone, PartialEq)]
pub struct BodyOutput<T>(pub T);

impl<T: Serialize + Validate + Send> OperationOutput for BodyOutput<T> {
    fn into_parts(self) -> Result<OutputParts, ServiceError> {
        Ok(OutputParts {
            body: Some(("application/json".to_owned(), codec::encode_body(&self.0)?)),
            extra_headers: Headers::new(),
        })
    }

    fn validate(&self) -> Result<(), ServiceError> {
        self.0.validate()
    }
}

/// Output with a JSON body plus additional headers encoded from `H`.
#[derive(Debug, Clone, PartialEq)]
pub struct BodyAndHeaders<B, H> {
    pub body: B,
    pub headers: H,
}

impl<B, H> OperationOutput for BodyAndHeaders<B, H>
where
    B: Serialize + Validate + Send,
    H: Serialize + Send,
{
    fn into_parts(self) -> Result<OutputParts, ServiceError> {
        Ok(OutputParts {
            body: Some(("application/json".to_owned(), codec::encode_body(&self.body)?)),
            extra_headers: codec::encode_headers(&self.headers)?,
        })
    }

    fn validate(&self) -> Result<(), ServiceError> {
        self.body.validate()
    }
}

/// The output of an operation that writes nothing beyond the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NoOutput;

impl OperationOutput for NoOutput {
    fn into_parts(self) -> Result<OutputParts, ServiceError> {
        Ok(OutputParts::none())
    }
}

// ── operation errors & the operation itself ───────────────────────────────

/// A domain error an operation can declare.
///
/// The `kind` string identifies the error in the allowed-errors table and is
/// serialized to the caller as `__type`; it must be stable across rebuilds.
pub trait ErrorShape: std::error::Error + Send + Sync + 'static {
    fn kind(&self) -> &str;

    /// The caller-visible message. Defaults to the `Display` rendering.
    fn message(&self) -> Option<String> {
        Some(self.to_string())
    }
}

impl ErrorShape for std::convert::Infallible {
    fn kind(&self) -> &str {
        match *self {}
    }

    fn message(&self) -> Option<String> {
        match *self {}
    }
}

/// A typed, named async function from input to output.
///
/// Implemented automatically for any
/// `Fn(In, OperationContext) -> impl Future<Output = Result<Out, E>>`.
pub trait Operation<In, Out, E>: Send + Sync + 'static {
    fn invoke(&self, input: In, ctx: OperationContext) -> BoxFuture<'static, Result<Out, E>>;
}

impl<F, Fut, In, Out, E> Operation<In, Out, E> for F
where
    F: Fn(In, OperationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Out, E>> + Send + 'static,
{
    fn invoke(&self, input: In, ctx: OperationContext) -> BoxFuture<'static, Result<Out, E>> {
        Box::pin((self)(input, ctx))
    }
}
