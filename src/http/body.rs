//! Request body — a finite asynchronous byte stream.
//!
//! A [`Body`] is consumed at most once, by [`Body::collect`], which gathers
//! chunks up to a configured cap. The transport feeds streamed bodies through
//! a [`BodySender`]; dropping the sender ends the stream, while
//! [`BodySender::cancel`] surfaces transport-side cancellation to the reader.

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors observed while consuming a request body.
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("request body exceeds maximum allowed size of {max_bytes} bytes")]
    TooLarge { max_bytes: usize },

    #[error("request was cancelled by the transport before the body completed")]
    Cancelled,
}

/// A finite async byte stream carrying the request payload.
///
/// # Examples
///
/// ```
/// use opserve::http::Body;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let body = Body::from_bytes("hello");
/// let bytes = body.collect(1024).await.unwrap();
/// assert_eq!(&bytes[..], b"hello");
/// # });
/// ```
#[derive(Debug)]
pub struct Body {
    inner: Inner,
}

#[derive(Debug)]
enum Inner {
    Empty,
    Full(Bytes),
    Stream(mpsc::Receiver<Result<Bytes, BodyError>>),
}

impl Body {
    /// An empty body.
    pub fn empty() -> Self {
        Self {
            inner: Inner::Empty,
        }
    }

    /// A body whose bytes are already in memory.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            inner: Inner::Full(bytes.into()),
        }
    }

    /// Creates a streaming body fed by the returned [`BodySender`].
    pub fn channel() -> (BodySender, Self) {
        let (tx, rx) = mpsc::channel(8);
        (
            BodySender { tx },
            Self {
                inner: Inner::Stream(rx),
            },
        )
    }

    /// Consumes the body, gathering at most `max_bytes` bytes.
    ///
    /// # Errors
    ///
    /// - [`BodyError::TooLarge`] once accumulated bytes exceed `max_bytes`.
    /// - [`BodyError::Cancelled`] if the transport cancelled the request.
    pub async fn collect(self, max_bytes: usize) -> Result<Bytes, BodyError> {
        match self.inner {
            Inner::Empty => Ok(Bytes::new()),
            Inner::Full(bytes) => {
                if bytes.len() > max_bytes {
                    return Err(BodyError::TooLarge { max_bytes });
                }
                Ok(bytes)
            }
            Inner::Stream(mut rx) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = rx.recv().await {
                    let chunk = chunk?;
                    if buf.len() + chunk.len() > max_bytes {
                        return Err(BodyError::TooLarge { max_bytes });
                    }
                    buf.extend_from_slice(&chunk);
                }
                Ok(buf.freeze())
            }
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

/// Write half of a streaming [`Body`].
///
/// Dropping the sender completes the stream; [`cancel`](Self::cancel)
/// terminates it with [`BodyError::Cancelled`] instead.
#[derive(Debug, Clone)]
pub struct BodySender {
    tx: mpsc::Sender<Result<Bytes, BodyError>>,
}

impl BodySender {
    /// Feeds one chunk to the reader. Fails silently once the reader is gone.
    pub async fn send(&self, chunk: Bytes) {
        let _ = self.tx.send(Ok(chunk)).await;
    }

    /// Signals transport-side cancellation to the reader.
    pub async fn cancel(&self) {
        let _ = self.tx.send(Err(BodyError::Cancelled)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_collects_to_nothing() {
        let bytes = Body::empty().collect(16).await.unwrap();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn full_body_over_cap_fails() {
        let body = Body::from_bytes(vec![0u8; 32]);
        let err = body.collect(16).await.unwrap_err();
        assert!(matches!(err, BodyError::TooLarge { max_bytes: 16 }));
    }

    #[tokio::test]
    async fn streamed_chunks_are_concatenated() {
        let (tx, body) = Body::channel();
        tokio::spawn(async move {
            tx.send(Bytes::from_static(b"hel")).await;
            tx.send(Bytes::from_static(b"lo")).await;
        });
        let bytes = body.collect(64).await.unwrap();
        assert_eq!(&bytes[..], b"hello");
    }

    #[tokio::test]
    async fn streamed_over_cap_fails_midway() {
        let (tx, body) = Body::channel();
        tokio::spawn(async move {
            tx.send(Bytes::from(vec![0u8; 10])).await;
            tx.send(Bytes::from(vec![0u8; 10])).await;
        });
        let err = body.collect(15).await.unwrap_err();
        assert!(matches!(err, BodyError::TooLarge { .. }));
    }

    #[tokio::test]
    async fn cancellation_is_observed_on_next_read() {
        let (tx, body) = Body::channel();
        tokio::spawn(async move {
            tx.send(Bytes::from_static(b"partial")).await;
            tx.cancel().await;
        });
        let err = body.collect(64).await.unwrap_err();
        assert!(matches!(err, BodyError::Cancelled));
    }
}
