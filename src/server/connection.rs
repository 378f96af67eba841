//! Per-connection service loop and the request-handling state machine.
//!
//! Each accepted connection runs one task: parse a head, gather the body,
//! hand the request to [`handle_request`], write out whatever the response
//! writer produced, and repeat while the connection is kept alive. Requests
//! on one connection are answered in order; connections never block each
//! other.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::InvocationStrategy;
use crate::context::OperationContext;
use crate::error::ServiceError;
use crate::http::request::HeadError;
use crate::http::{response, Body, Headers, Request, RequestHead, ResponseHead, StatusCode};
use crate::observe::{
    self, ReportingCategory, REQUEST_ID_HEADER, TRACE_ID_HEADER,
};
use crate::server::ServerInner;
use crate::writer::{BufferedChannel, BufferedHandle, ResponseWriter};
use crate::BoxFuture;

/// Cap on buffered head bytes before a request is rejected outright.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// Serves one TCP connection for its lifetime.
///
/// HTTP/1.1 connections are persistent by default: one request per loop
/// iteration until the peer closes, sends `Connection: close`, or the server
/// begins shutting down while the connection is idle.
pub(crate) async fn serve(
    inner: Arc<ServerInner>,
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    mut stop_rx: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        // Try to parse a head from buffered data first so pipelined requests
        // are served without waiting for more bytes.
        let parsed = if buf.is_empty() {
            None
        } else {
            match RequestHead::parse(&buf) {
                Ok(pair) => Some(pair),
                Err(HeadError::Incomplete) => {
                    if buf.len() > MAX_HEAD_BYTES {
                        warn!(peer = %peer_addr, "request head too large — sending 413");
                        let head = ResponseHead::new(StatusCode::PayloadTooLarge);
                        stream
                            .write_all(&response::encode(&head, b"", false))
                            .await?;
                        return Ok(());
                    }
                    None
                }
                Err(e) => {
                    warn!(peer = %peer_addr, error = %e, "bad request — sending 400");
                    let head = ResponseHead::new(StatusCode::BadRequest);
                    stream
                        .write_all(&response::encode(&head, b"", false))
                        .await?;
                    return Ok(());
                }
            }
        };

        let Some((head, body_offset)) = parsed else {
            // Need more data. While idle, a shutdown closes the connection.
            let bytes_read = if buf.is_empty() {
                tokio::select! {
                    read = stream.read_buf(&mut buf) => read?,
                    _ = stop_rx.changed() => {
                        debug!(peer = %peer_addr, "closing idle connection for shutdown");
                        return Ok(());
                    }
                }
            } else {
                stream.read_buf(&mut buf).await?
            };
            if bytes_read == 0 {
                debug!(peer = %peer_addr, "connection closed by peer");
                return Ok(());
            }
            continue;
        };

        // Gather the body, reading at most one byte past the cap; an over-cap
        // request is answered and the connection closed so framing is not
        // corrupted by the unread remainder.
        let content_length = head.content_length().unwrap_or(0);
        let over_cap = content_length > inner.config.max_body_bytes;
        let body_target = if over_cap {
            inner.config.max_body_bytes + 1
        } else {
            content_length
        };

        let mut truncated = false;
        while buf.len() < body_offset + body_target {
            let bytes_read = stream.read_buf(&mut buf).await?;
            if bytes_read == 0 {
                truncated = true;
                break;
            }
        }

        let keep_alive = head.is_keep_alive() && !over_cap && !truncated;

        buf.advance(body_offset);
        let take = body_target.min(buf.len());
        let body_bytes = buf.split_to(take).freeze();

        let body = if truncated {
            // The peer went away mid-body; the stream observes cancellation
            // on its next read.
            let (tx, body) = Body::channel();
            tx.send(body_bytes).await;
            tx.cancel().await;
            body
        } else {
            Body::from_bytes(body_bytes)
        };

        debug!(
            peer = %peer_addr,
            method = %head.method,
            uri = %head.uri,
            "dispatching request"
        );

        let (channel, response_handle) = BufferedChannel::new();
        handle_request(
            &inner,
            Request::new(head, body),
            channel,
            response_handle.clone(),
        )
        .await;

        match response_handle.take() {
            Some((response_head, response_body)) => {
                stream
                    .write_all(&response::encode(&response_head, &response_body, keep_alive))
                    .await?;
                stream.flush().await?;
            }
            None => {
                // The guard completes every writer; reaching here means the
                // channel was bypassed entirely. Answer with a bare 500.
                error!(peer = %peer_addr, "request finished without a response");
                let head = ResponseHead::new(StatusCode::InternalServerError);
                stream
                    .write_all(&response::encode(&head, b"", false))
                    .await?;
                return Ok(());
            }
        }

        if !keep_alive {
            if over_cap {
                // Drain the declared remainder so closing the socket with
                // unread data does not reset the connection before the peer
                // reads the response.
                let mut remaining = content_length
                    .saturating_sub(take)
                    .saturating_sub(buf.len());
                let mut scratch = [0u8; 4096];
                while remaining > 0 {
                    match stream.read(&mut scratch).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => remaining = remaining.saturating_sub(n),
                    }
                }
            }
            debug!(peer = %peer_addr, "closing connection");
            return Ok(());
        }
    }
}

/// The request-handling state machine.
///
/// Mints the internal request id, short-circuits `/ping`, selects a handler,
/// dispatches it per the configured invocation strategy, and guards the
/// response writer so it completes exactly once whatever happens inside the
/// pipeline.
pub(crate) async fn handle_request(
    inner: &Arc<ServerInner>,
    request: Request,
    channel: BufferedChannel,
    response_handle: BufferedHandle,
) {
    let started = Instant::now();
    let request_id = inner.minter.mint();
    let head = request.head.clone();

    let mut base_headers = Headers::new();
    base_headers.set(REQUEST_ID_HEADER, request_id.as_str());
    if let Some(trace_id) = head.headers.get(TRACE_ID_HEADER) {
        base_headers.set(TRACE_ID_HEADER, trace_id);
    }
    let writer = ResponseWriter::new(Box::new(channel), base_headers);

    let logger = tracing::info_span!("request", internal_request_id = %request_id);

    // Reserved path: health checks never pay for middleware, tracing
    // included.
    if head.uri == "/ping" {
        let result = async {
            writer.set_status(StatusCode::Ok).await?;
            writer.set_content_type("text/plain").await?;
            writer
                .commit_and_complete_with(Bytes::from_static(b"Ping completed."))
                .await
        }
        .await;
        let success = result.is_ok();
        if let Err(e) = result {
            error!(parent: &logger, error = %e, "failed to answer ping");
        } else {
            debug!(parent: &logger, "ping");
        }
        inner.config.reporting.publish(
            &*inner.metrics,
            &ReportingCategory::Ping,
            success,
            started.elapsed(),
        );
        return;
    }

    let (path, _query) = head.split_uri();

    let selection = match inner.router.select_handler(path, &head.method) {
        Ok(selection) => selection,
        Err(err @ ServiceError::InvalidOperation { .. }) => {
            warn!(
                parent: &logger,
                uri = %head.uri,
                method = %head.method,
                "unknownOperation"
            );
            if let Err(write_err) = writer.complete_with_error(&err).await {
                error!(parent: &logger, error = %write_err, "failed to write error response");
            }
            inner.config.reporting.publish(
                &*inner.metrics,
                &ReportingCategory::UnknownOperation,
                false,
                started.elapsed(),
            );
            return;
        }
        Err(err) => {
            error!(
                parent: &logger,
                uri = %head.uri,
                cause = %err,
                "errorDeterminingOperation"
            );
            let internal = ServiceError::internal(err.to_string());
            if let Err(write_err) = writer.complete_with_error(&internal).await {
                error!(parent: &logger, error = %write_err, "failed to write error response");
            }
            inner.config.reporting.publish(
                &*inner.metrics,
                &ReportingCategory::ErrorDeterminingOperation,
                false,
                started.elapsed(),
            );
            return;
        }
    };

    let category = ReportingCategory::Operation(selection.id.name().to_owned());
    let span = observe::request_span(&inner.name, &head, inner.config.enable_tracing);

    let ctx = OperationContext::new(head.clone())
        .with_logger(logger.clone())
        .with_request_id(request_id.clone())
        .with_shape(selection.shape)
        .with_operation_id(selection.id.clone());

    let pipeline = (selection.handler)(request, writer.clone(), ctx);
    let result = dispatch(
        inner.config.invocation_strategy,
        pipeline.instrument(span.clone()),
    )
    .await;

    // Handler-frame guard: the writer completes exactly once per request.
    let completed = writer.is_completed().await;
    let outcome = match result {
        Ok(()) if completed => Ok(()),
        Ok(()) => Err(ServiceError::internal(
            "pipeline finished without completing the response writer",
        )),
        Err(err) => Err(err),
    };

    match outcome {
        Ok(()) => {
            let status = writer
                .sent_status()
                .await
                .unwrap_or(StatusCode::Ok)
                .as_u16();
            observe::record_completion(&span, status, response_handle.body_len());
            info!(
                parent: &logger,
                operation = %selection.id,
                status,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "request completed"
            );
            inner
                .config
                .reporting
                .publish(&*inner.metrics, &category, true, started.elapsed());
        }
        Err(err) => {
            if let Err(write_err) = writer.complete_with_error(&err).await {
                // The connection is allowed to reset at this point.
                error!(parent: &logger, error = %write_err, "failed to write error response");
            }
            observe::record_failure(&span, &err);
            if let Some(status) = writer.sent_status().await {
                observe::record_completion(&span, status.as_u16(), response_handle.body_len());
            }
            error!(
                parent: &logger,
                operation = %selection.id,
                cause = %err,
                "request failed"
            );
            inner
                .config
                .reporting
                .publish(&*inner.metrics, &category, false, started.elapsed());
        }
    }
}

/// Runs the assembled pipeline per the configured invocation strategy.
///
/// `OriginalEventLoop` stays on the accepting task; `CooperativeTaskGroup`
/// spawns an async task; `DispatchQueue` runs on the blocking pool. No
/// ordering is guaranteed between operations dispatched through the latter
/// two.
async fn dispatch(
    strategy: InvocationStrategy,
    pipeline: impl std::future::Future<Output = Result<(), ServiceError>> + Send + 'static,
) -> Result<(), ServiceError> {
    match strategy {
        InvocationStrategy::OriginalEventLoop => pipeline.await,
        InvocationStrategy::CooperativeTaskGroup => match tokio::spawn(pipeline).await {
            Ok(result) => result,
            Err(join_err) => Err(ServiceError::internal(format!(
                "operation task failed: {join_err}"
            ))),
        },
        InvocationStrategy::DispatchQueue => {
            let handle = tokio::runtime::Handle::current();
            let pipeline: BoxFuture<'static, Result<(), ServiceError>> = Box::pin(pipeline);
            match tokio::task::spawn_blocking(move || handle.block_on(pipeline)).await {
                Ok(result) => result,
                Err(join_err) => Err(ServiceError::internal(format!(
                    "operation task failed: {join_err}"
                ))),
            }
        }
    }
}
