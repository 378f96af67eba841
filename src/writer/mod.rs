//! Response writer — a staged sink over the outbound byte channel.
//!
//! A writer moves through `new → status-set → headers-set → committed →
//! body-parts* → completed`; any out-of-order call is a programming error
//! reported as *internal*. `complete` is idempotent only once the writer is
//! completed. The handler frame guarantees every request completes its
//! writer exactly once, success or error.

use std::io;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::Mutex;

use crate::error::ServiceError;
use crate::http::{Headers, ResponseHead, StatusCode};
use crate::operation::OperationOutput;
use crate::BoxFuture;

/// The transport-facing half of a response: head, body parts, completion.
///
/// Implemented by the per-connection buffered channel and by test doubles.
/// Each method may await transport backpressure.
pub trait OutboundChannel: Send {
    fn send_head(&mut self, head: ResponseHead) -> BoxFuture<'_, io::Result<()>>;
    fn send_body_part(&mut self, chunk: Bytes) -> BoxFuture<'_, io::Result<()>>;
    fn finish(&mut self) -> BoxFuture<'_, io::Result<()>>;
}

/// Writer lifecycle states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    New,
    StatusSet,
    HeadersSet,
    Committed,
    Completed,
}

struct WriterCore {
    state: WriterState,
    head: ResponseHead,
    base_headers: Headers,
    channel: Box<dyn OutboundChannel>,
}

impl WriterCore {
    fn misuse(&self, call: &str) -> ServiceError {
        ServiceError::internal(format!(
            "response writer: {call} called in state {:?}",
            self.state
        ))
    }

    async fn commit_locked(&mut self) -> Result<(), ServiceError> {
        // The framework-owned headers win over anything staged by user code.
        let base = std::mem::take(&mut self.base_headers);
        for (name, value) in base.iter() {
            self.head.headers.set(name, value);
        }
        let head = self.head.clone();
        self.channel
            .send_head(head)
            .await
            .map_err(|e| ServiceError::internal(format!("failed to send response head: {e}")))?;
        self.state = WriterState::Committed;
        Ok(())
    }
}

/// The staged response sink for one request.
///
/// Cheap to clone; clones share the same underlying state machine, which is
/// how the handler-frame guard can observe and complete a writer that was
/// also handed into the pipeline.
#[derive(Clone)]
pub struct ResponseWriter {
    core: Arc<Mutex<WriterCore>>,
}

impl ResponseWriter {
    /// Creates a writer over `channel`.
    ///
    /// `base_headers` are merged into the head at commit time, replacing any
    /// same-named entries staged by user code; the request handler uses this
    /// for the `x-smoke-request-id` / `x-smoke-trace-id` echo.
    pub fn new(channel: Box<dyn OutboundChannel>, base_headers: Headers) -> Self {
        Self {
            core: Arc::new(Mutex::new(WriterCore {
                state: WriterState::New,
                head: ResponseHead::default(),
                base_headers,
                channel,
            })),
        }
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> WriterState {
        self.core.lock().await.state
    }

    /// `true` once `complete` has run.
    pub async fn is_completed(&self) -> bool {
        self.state().await == WriterState::Completed
    }

    /// The status sent to the transport, once the head is committed.
    pub async fn sent_status(&self) -> Option<StatusCode> {
        let core = self.core.lock().await;
        match core.state {
            WriterState::Committed | WriterState::Completed => Some(core.head.status),
            _ => None,
        }
    }

    /// Sets the response status. Valid only in the `New` state.
    pub async fn set_status(&self, status: StatusCode) -> Result<(), ServiceError> {
        let mut core = self.core.lock().await;
        if core.state != WriterState::New {
            return Err(core.misuse("set_status"));
        }
        core.head.status = status;
        core.state = WriterState::StatusSet;
        Ok(())
    }

    /// Applies a mutation to the staged headers. Valid after `set_status`,
    /// before `commit`.
    pub async fn update_headers<F>(&self, f: F) -> Result<(), ServiceError>
    where
        F: FnOnce(&mut Headers) + Send,
    {
        let mut core = self.core.lock().await;
        match core.state {
            WriterState::StatusSet | WriterState::HeadersSet => {
                f(&mut core.head.headers);
                core.state = WriterState::HeadersSet;
                Ok(())
            }
            _ => Err(core.misuse("update_headers")),
        }
    }

    /// Sets the `Content-Type` header. Valid after `set_status`, before `commit`.
    pub async fn set_content_type(&self, content_type: &str) -> Result<(), ServiceError> {
        let mut core = self.core.lock().await;
        match core.state {
            WriterState::StatusSet | WriterState::HeadersSet => {
                core.head.headers.set("Content-Type", content_type);
                core.state = WriterState::HeadersSet;
                Ok(())
            }
            _ => Err(core.misuse("set_content_type")),
        }
    }

    /// Sends the head. Valid after `set_status`, before any body part.
    pub async fn commit(&self) -> Result<(), ServiceError> {
        let mut core = self.core.lock().await;
        match core.state {
            WriterState::StatusSet | WriterState::HeadersSet => core.commit_locked().await,
            _ => Err(core.misuse("commit")),
        }
    }

    /// Appends one body part. Valid only after `commit`.
    pub async fn body_part(&self, chunk: Bytes) -> Result<(), ServiceError> {
        let mut core = self.core.lock().await;
        if core.state != WriterState::Committed {
            return Err(core.misuse("body_part"));
        }
        core.channel
            .send_body_part(chunk)
            .await
            .map_err(|e| ServiceError::internal(format!("failed to send body part: {e}")))
    }

    /// Finishes the response. Idempotent only once completed.
    pub async fn complete(&self) -> Result<(), ServiceError> {
        let mut core = self.core.lock().await;
        match core.state {
            WriterState::Completed => Ok(()),
            WriterState::Committed => {
                core.channel
                    .finish()
                    .await
                    .map_err(|e| ServiceError::internal(format!("failed to finish response: {e}")))?;
                core.state = WriterState::Completed;
                Ok(())
            }
            _ => Err(core.misuse("complete")),
        }
    }

    /// Convenience: commit the head, send one body part, complete.
    pub async fn commit_and_complete_with(&self, chunk: Bytes) -> Result<(), ServiceError> {
        let mut core = self.core.lock().await;
        match core.state {
            WriterState::StatusSet | WriterState::HeadersSet => {
                core.commit_locked().await?;
                core.channel
                    .send_body_part(chunk)
                    .await
                    .map_err(|e| ServiceError::internal(format!("failed to send body part: {e}")))?;
                core.channel
                    .finish()
                    .await
                    .map_err(|e| ServiceError::internal(format!("failed to finish response: {e}")))?;
                core.state = WriterState::Completed;
                Ok(())
            }
            _ => Err(core.misuse("commit_and_complete_with")),
        }
    }

    /// Forces the writer to completion with the serialized error payload.
    ///
    /// Used by the handler-frame guard. If the head has not been committed
    /// the staged status and headers are discarded in favour of the error's;
    /// once committed, the response is finished as-is since the status is
    /// already on the wire.
    pub async fn complete_with_error(&self, error: &ServiceError) -> Result<(), ServiceError> {
        let mut core = self.core.lock().await;
        match core.state {
            WriterState::Completed => Ok(()),
            WriterState::Committed => {
                core.channel
                    .finish()
                    .await
                    .map_err(|e| ServiceError::internal(format!("failed to finish response: {e}")))?;
                core.state = WriterState::Completed;
                Ok(())
            }
            WriterState::New | WriterState::StatusSet | WriterState::HeadersSet => {
                core.head = ResponseHead::new(error.status());
                core.head.headers.set("Content-Type", "application/json");
                core.commit_locked().await?;
                let payload = Bytes::from(error.to_wire_json());
                core.channel
                    .send_body_part(payload)
                    .await
                    .map_err(|e| ServiceError::internal(format!("failed to send body part: {e}")))?;
                core.channel
                    .finish()
                    .await
                    .map_err(|e| ServiceError::internal(format!("failed to finish response: {e}")))?;
                core.state = WriterState::Completed;
                Ok(())
            }
        }
    }
}

/// The typed writer bound by the transform segment: wraps a raw writer with
/// the operation's success status and the payload format.
pub struct OperationResponseWriter<O: OperationOutput> {
    raw: ResponseWriter,
    success_status: StatusCode,
    _output: PhantomData<fn(O)>,
}

impl<O: OperationOutput> Clone for OperationResponseWriter<O> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            success_status: self.success_status,
            _output: PhantomData,
        }
    }
}

impl<O: OperationOutput> OperationResponseWriter<O> {
    pub fn new(raw: ResponseWriter, success_status: StatusCode) -> Self {
        Self {
            raw,
            success_status,
            _output: PhantomData,
        }
    }

    /// The wrapped raw writer.
    pub fn raw(&self) -> &ResponseWriter {
        &self.raw
    }

    /// Validates, encodes, and sends the operation output, completing the
    /// writer.
    ///
    /// Output-validation failures report as *internal*: the service, not the
    /// caller, produced the malformed value.
    pub async fn send_output(&self, output: O) -> Result<(), ServiceError> {
        output
            .validate()
            .map_err(|e| ServiceError::internal(format!("output validation failed: {e}")))?;
        let parts = output.into_parts()?;

        self.raw.set_status(self.success_status).await?;
        if !parts.extra_headers.is_empty() {
            let extra = parts.extra_headers;
            self.raw.update_headers(move |h| h.extend(extra)).await?;
        }
        match parts.body {
            Some((content_type, bytes)) => {
                self.raw.set_content_type(&content_type).await?;
                self.raw.commit().await?;
                self.raw.body_part(bytes).await?;
            }
            None => self.raw.commit().await?,
        }
        self.raw.complete().await
    }
}

// ── buffered channel ──────────────────────────────────────────────────────

/// What a [`BufferedChannel`] has accumulated so far.
#[derive(Debug, Default)]
pub struct BufferedResponse {
    pub head: Option<ResponseHead>,
    pub body: BytesMut,
    pub finish_count: usize,
}

/// An [`OutboundChannel`] that accumulates the response in memory.
///
/// The per-connection loop drives one per request and writes the encoded
/// bytes to the socket once the writer completes; tests use the paired
/// [`BufferedHandle`] to assert on what was written.
pub struct BufferedChannel {
    buf: Arc<parking_lot::Mutex<BufferedResponse>>,
}

/// Read side of a [`BufferedChannel`].
#[derive(Clone)]
pub struct BufferedHandle {
    buf: Arc<parking_lot::Mutex<BufferedResponse>>,
}

impl BufferedChannel {
    pub fn new() -> (Self, BufferedHandle) {
        let buf = Arc::new(parking_lot::Mutex::new(BufferedResponse::default()));
        (
            Self {
                buf: Arc::clone(&buf),
            },
            BufferedHandle { buf },
        )
    }
}

impl BufferedHandle {
    /// Takes the finished response, or `None` if `finish` never ran.
    pub fn take(&self) -> Option<(ResponseHead, Bytes)> {
        let mut buf = self.buf.lock();
        if buf.finish_count == 0 {
            return None;
        }
        let head = buf.head.take()?;
        let body = std::mem::take(&mut buf.body).freeze();
        Some((head, body))
    }

    /// How many times `finish` ran. Exactly-once is the invariant.
    pub fn finish_count(&self) -> usize {
        self.buf.lock().finish_count
    }

    /// Bytes of response body accumulated so far.
    pub fn body_len(&self) -> usize {
        self.buf.lock().body.len()
    }
}

impl OutboundChannel for BufferedChannel {
    fn send_head(&mut self, head: ResponseHead) -> BoxFuture<'_, io::Result<()>> {
        let buf = Arc::clone(&self.buf);
        Box::pin(async move {
            buf.lock().head = Some(head);
            Ok(())
        })
    }

    fn send_body_part(&mut self, chunk: Bytes) -> BoxFuture<'_, io::Result<()>> {
        let buf = Arc::clone(&self.buf);
        Box::pin(async move {
            buf.lock().body.extend_from_slice(&chunk);
            Ok(())
        })
    }

    fn finish(&mut self) -> BoxFuture<'_, io::Result<()>> {
        let buf = Arc::clone(&self.buf);
        Box::pin(async move {
            buf.lock().finish_count += 1;
            Ok(())
        })
    }
}
