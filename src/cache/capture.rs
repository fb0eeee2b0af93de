//! Response capture.
//!
//! [`CaptureBody`] sits between the upstream body and the client. Frames
//! pass through untouched as soon as they are polled while a copy of the
//! data accumulates. Once the upstream body is complete the completion hook
//! receives the whole response and runs as its own task. When the upstream
//! reports its end together with the last frame, that frame is held back
//! until the task is done, so a server that stops polling after
//! `Content-Length` bytes still sees the write finish first.
//!
//! A body dropped before its end (the client went away, or the server
//! discarded it as for `HEAD`) hands the rest of the upstream body to a
//! background task that drains it and completes the capture there.

use std::{
    future::Future,
    mem,
    pin::Pin,
    task::{Context, Poll, ready},
};

use axum::{
    body::Body,
    http::{HeaderMap, StatusCode},
};
use bytes::{Bytes, BytesMut};
use futures::{
    StreamExt,
    future::{BoxFuture, FutureExt},
};
use http_body::{Body as _, Frame, SizeHint};
use metrics::counter;
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{debug, warn};

use super::policy::SkipReason;

pub(crate) const METRIC_SKIP: &str = "routecache_skip_total";

/// Everything the upstream sent, as the client received it.
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

type Completion = Box<dyn FnOnce(CapturedResponse) -> BoxFuture<'static, ()> + Send>;

struct Pending {
    status: StatusCode,
    headers: HeaderMap,
    buffer: BytesMut,
    limit: usize,
    on_complete: Completion,
}

impl Pending {
    /// Append `data`, or give up on the capture once it exceeds the limit.
    fn record(&mut self, data: &Bytes) -> bool {
        if self.buffer.len() + data.len() > self.limit {
            debug!(
                target = "routecache::cache::capture",
                op = "capture::record",
                result = "skipped",
                limit = self.limit,
                "Response body exceeds capture limit; not caching"
            );
            counter!(METRIC_SKIP, "reason" => SkipReason::BodyTooLarge.as_str()).increment(1);
            return false;
        }
        self.buffer.extend_from_slice(data);
        true
    }

    fn finish(self) -> JoinHandle<()> {
        let captured = CapturedResponse {
            status: self.status,
            headers: self.headers,
            body: self.buffer.freeze(),
        };
        tokio::spawn((self.on_complete)(captured))
    }

    /// Read the rest of `inner` and complete. Used once the client side is
    /// gone; an upstream error or an oversized remainder stores nothing.
    async fn drain(mut self, inner: Body) {
        let mut stream = inner.into_data_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(data) => {
                    if !self.record(&data) {
                        return;
                    }
                }
                Err(err) => {
                    debug!(
                        target = "routecache::cache::capture",
                        op = "capture::drain",
                        result = "error",
                        error = %err,
                        "Upstream body failed after the client left; not caching"
                    );
                    return;
                }
            }
        }

        if let Err(err) = self.finish().await {
            warn!(
                target = "routecache::cache::capture",
                op = "capture::drain",
                result = "error",
                error = %err,
                "Cache completion task failed"
            );
        }
    }
}

enum CaptureState {
    Buffering(Pending),
    /// The completion task is running. `last` is the final frame, held
    /// back until the task is done.
    Finishing {
        task: JoinHandle<()>,
        last: Option<Frame<Bytes>>,
    },
    /// Forward only; nothing will be cached.
    Passthrough,
    Done,
}

/// Body wrapper that tees the stream into a buffer.
pub struct CaptureBody {
    inner: Body,
    state: CaptureState,
}

impl CaptureBody {
    /// Wrap `inner`. `status` and `headers` are the snapshot taken when
    /// the upstream response head arrived. At most `limit` body bytes are
    /// buffered; a longer body still streams but is not captured.
    pub fn new<F, Fut>(
        inner: Body,
        status: StatusCode,
        headers: HeaderMap,
        limit: usize,
        on_complete: F,
    ) -> Self
    where
        F: FnOnce(CapturedResponse) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let capacity = inner
            .size_hint()
            .exact()
            .and_then(|len| usize::try_from(len).ok())
            .filter(|len| *len <= limit)
            .unwrap_or(0);

        Self {
            inner,
            state: CaptureState::Buffering(Pending {
                status,
                headers,
                buffer: BytesMut::with_capacity(capacity),
                limit,
                on_complete: Box::new(move |captured| on_complete(captured).boxed()),
            }),
        }
    }

    fn record(&mut self, data: &Bytes) {
        let CaptureState::Buffering(pending) = &mut self.state else {
            return;
        };
        if !pending.record(data) {
            self.state = CaptureState::Passthrough;
        }
    }

    /// Start the completion task if still buffering, holding `last` back
    /// until it finishes.
    fn complete(&mut self, last: Option<Frame<Bytes>>) -> Option<Frame<Bytes>> {
        match mem::replace(&mut self.state, CaptureState::Done) {
            CaptureState::Buffering(pending) => {
                self.state = CaptureState::Finishing {
                    task: pending.finish(),
                    last,
                };
                None
            }
            _ => last,
        }
    }
}

impl http_body::Body for CaptureBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        loop {
            match &mut this.state {
                CaptureState::Finishing { task, last } => {
                    if let Err(err) = ready!(Pin::new(task).poll(cx)) {
                        warn!(
                            target = "routecache::cache::capture",
                            op = "capture::complete",
                            result = "error",
                            error = %err,
                            "Cache completion task failed"
                        );
                    }
                    let last = last.take();
                    this.state = CaptureState::Done;
                    return Poll::Ready(last.map(Ok));
                }
                CaptureState::Done => return Poll::Ready(None),
                CaptureState::Buffering(_) | CaptureState::Passthrough => {}
            }

            match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
                Some(Ok(frame)) => {
                    if let Some(data) = frame.data_ref() {
                        this.record(data);
                    }
                    if !this.inner.is_end_stream() {
                        return Poll::Ready(Some(Ok(frame)));
                    }
                    if let Some(frame) = this.complete(Some(frame)) {
                        return Poll::Ready(Some(Ok(frame)));
                    }
                }
                Some(Err(err)) => {
                    this.state = CaptureState::Passthrough;
                    return Poll::Ready(Some(Err(err)));
                }
                None => {
                    this.complete(None);
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        match self.state {
            CaptureState::Done => true,
            CaptureState::Passthrough => self.inner.is_end_stream(),
            // The completion must run before end-of-stream is reported.
            CaptureState::Buffering(_) | CaptureState::Finishing { .. } => false,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.state {
            CaptureState::Finishing { last, .. } => {
                let held = last
                    .as_ref()
                    .and_then(Frame::data_ref)
                    .map_or(0, |data| data.len() as u64);
                SizeHint::with_exact(held)
            }
            CaptureState::Done => SizeHint::with_exact(0),
            CaptureState::Buffering(_) | CaptureState::Passthrough => self.inner.size_hint(),
        }
    }
}

impl Drop for CaptureBody {
    fn drop(&mut self) {
        if !matches!(self.state, CaptureState::Buffering(_)) {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        let CaptureState::Buffering(pending) = mem::replace(&mut self.state, CaptureState::Done)
        else {
            return;
        };
        let inner = mem::replace(&mut self.inner, Body::empty());
        runtime.spawn(pending.drain(inner));
    }
}
