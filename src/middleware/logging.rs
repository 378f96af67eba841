//! Built-in middleware that logs each request's method, URI, status, and
//! duration.
//!
//! Emits a single `tracing::info!` line after the downstream pipeline
//! completes:
//!
//! ```text
//! METHOD /uri - STATUS (duration)
//! ```
//!
//! `RequestLogMiddleware` never short-circuits; it delegates and decorates
//! the timing after the fact. It runs in the outer stack, before the typed
//! transform.

use tokio::time::Instant;

use crate::context::OperationContext;
use crate::error::ServiceError;
use crate::http::Request;
use crate::middleware::{Middleware, Next};
use crate::writer::ResponseWriter;
use crate::BoxFuture;

pub struct RequestLogMiddleware;

impl Middleware<Request, ResponseWriter, OperationContext> for RequestLogMiddleware {
    fn handle(
        &self,
        request: Request,
        writer: ResponseWriter,
        ctx: OperationContext,
        next: Next<Request, ResponseWriter, OperationContext>,
    ) -> BoxFuture<'static, Result<(), ServiceError>> {
        Box::pin(async move {
            let start = Instant::now();
            let method = request.head.method.clone();
            let uri = request.head.uri.clone();

            let result = next.run(request, writer.clone(), ctx).await;

            let duration = start.elapsed();
            match writer.sent_status().await {
                Some(status) => {
                    tracing::info!("{} {} - {} ({:?})", method, uri, status.as_u16(), duration)
                }
                None => tracing::info!("{} {} - (no response) ({:?})", method, uri, duration),
            }

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Body, Headers, Method, RequestHead, StatusCode, Version};
    use crate::middleware::{MiddlewareStack, Terminal};
    use crate::writer::BufferedChannel;
    use bytes::Bytes;
    use std::sync::Arc;

    #[tokio::test]
    async fn delegates_and_preserves_the_result() {
        let head = RequestHead {
            method: Method::Get,
            version: Version::Http11,
            uri: "/logged".to_owned(),
            headers: Headers::new(),
        };
        let request = Request::new(head.clone(), Body::empty());
        let (channel, handle) = BufferedChannel::new();
        let writer = ResponseWriter::new(Box::new(channel), Headers::new());
        let ctx = OperationContext::new(head);

        let stack = MiddlewareStack::new().with(RequestLogMiddleware);
        let terminal: Terminal<Request, ResponseWriter, OperationContext> =
            Arc::new(|_req, writer: ResponseWriter, _ctx| {
                Box::pin(async move {
                    writer.set_status(StatusCode::Ok).await?;
                    writer
                        .commit_and_complete_with(Bytes::from_static(b"ok"))
                        .await
                })
            });

        stack.run(request, writer, ctx, terminal).await.unwrap();
        assert_eq!(handle.finish_count(), 1);
    }
}
