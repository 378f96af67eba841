//! Per-request middleware context and the capability traits middleware
//! programs against.
//!
//! The concrete [`OperationContext`] record carries the five per-request
//! slots: logger span, internal request id, path shape, operation identifier,
//! and a snapshot of the request head. Middleware reads and updates these
//! through the `Carries*` traits so it stays decoupled from the record
//! itself.

use tracing::Span;

use crate::http::RequestHead;
use crate::operation::OperationId;
use crate::path::PathShape;

/// Context slot: the per-request logger span.
pub trait CarriesLogger {
    fn logger(&self) -> &Span;
    fn set_logger(&mut self, span: Span);
}

/// Context slot: the framework-minted internal request id.
pub trait CarriesRequestId {
    fn internal_request_id(&self) -> Option<&str>;
    fn set_internal_request_id(&mut self, id: String);
}

/// Context slot: the variables captured from the matched path template.
pub trait CarriesPathShape {
    fn path_shape(&self) -> &PathShape;
}

/// Context slot: the identifier of the selected operation.
pub trait CarriesOperationId {
    fn operation_id(&self) -> Option<&OperationId>;
}

/// Context slot: a snapshot of the HTTP request head.
///
/// Inner-stage contexts keep this so e.g. correlation headers remain
/// readable after the typed input replaced the raw request.
pub trait CarriesRequestHead {
    fn request_head(&self) -> &RequestHead;
}

/// The per-request context record threaded through the middleware pipeline.
#[derive(Debug, Clone)]
pub struct OperationContext {
    span: Span,
    request_id: Option<String>,
    shape: PathShape,
    operation_id: Option<OperationId>,
    head: RequestHead,
}

impl OperationContext {
    /// Creates a context for a request, with no routing information bound yet.
    pub fn new(head: RequestHead) -> Self {
        Self {
            span: Span::current(),
            request_id: None,
            shape: PathShape::new(),
            operation_id: None,
            head,
        }
    }

    /// Binds the per-request logger span.
    pub fn with_logger(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Binds the internal request id.
    pub fn with_request_id(mut self, id: String) -> Self {
        self.request_id = Some(id);
        self
    }

    /// Binds the matched path shape.
    pub fn with_shape(mut self, shape: PathShape) -> Self {
        self.shape = shape;
        self
    }

    /// Binds the selected operation identifier.
    pub fn with_operation_id(mut self, id: OperationId) -> Self {
        self.operation_id = Some(id);
        self
    }
}

impl CarriesLogger for OperationContext {
    fn logger(&self) -> &Span {
        &self.span
    }

    fn set_logger(&mut self, span: Span) {
        self.span = span;
    }
}

impl CarriesRequestId for OperationContext {
    fn internal_request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    fn set_internal_request_id(&mut self, id: String) {
        self.request_id = Some(id);
    }
}

impl CarriesPathShape for OperationContext {
    fn path_shape(&self) -> &PathShape {
        &self.shape
    }
}

impl CarriesOperationId for OperationContext {
    fn operation_id(&self) -> Option<&OperationId> {
        self.operation_id.as_ref()
    }
}

impl CarriesRequestHead for OperationContext {
    fn request_head(&self) -> &RequestHead {
        &self.head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Headers, Method, Version};

    fn head() -> RequestHead {
        RequestHead {
            method: Method::Get,
            version: Version::Http11,
            uri: "/items/1".to_owned(),
            headers: Headers::new(),
        }
    }

    #[test]
    fn slots_are_readable_through_capability_traits() {
        let mut shape = PathShape::new();
        shape.insert("id".into(), "1".into());
        let id = OperationId::new("GetItem", "/items/{id}");

        let ctx = OperationContext::new(head())
            .with_request_id("req-1".into())
            .with_shape(shape)
            .with_operation_id(id.clone());

        assert_eq!(ctx.internal_request_id(), Some("req-1"));
        assert_eq!(ctx.path_shape().get("id"), Some("1"));
        assert_eq!(ctx.operation_id(), Some(&id));
        assert_eq!(ctx.request_head().uri, "/items/1");
    }

    #[test]
    fn request_id_is_mutable_through_trait() {
        let mut ctx = OperationContext::new(head());
        assert!(ctx.internal_request_id().is_none());
        ctx.set_internal_request_id("req-2".into());
        assert_eq!(ctx.internal_request_id(), Some("req-2"));
    }
}
