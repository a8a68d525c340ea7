//! Body wrappers that report stream events back to the request lifecycle.
use std::{
    pin::Pin,
    task::{Context, Poll},
};

use axum::body::Body as AxumBody;
use bytes::Bytes;
use hyper::body::{Body, Frame, Incoming, SizeHint};
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use crate::core::lifecycle::{ProxyEvent, ProxyRequestContext};

/// Client request body forwarded to the backend.
///
/// Reports `ClientRequestEnded` or `ClientRequestErrored` exactly once. Bodies
/// that are empty from the start report the end immediately, since the backend
/// connection never polls them.
pub struct ForwardBody {
    inner: Incoming,
    events: UnboundedSender<ProxyEvent>,
    reported: bool,
}

impl ForwardBody {
    pub fn new(inner: Incoming, events: UnboundedSender<ProxyEvent>) -> Self {
        let mut body = Self {
            inner,
            events,
            reported: false,
        };
        if body.inner.is_end_stream() {
            body.report(ProxyEvent::ClientRequestEnded);
        }
        body
    }

    fn report(&mut self, event: ProxyEvent) {
        if !self.reported {
            self.reported = true;
            // The handler stops listening once the response has started
            let _ = self.events.send(event);
        }
    }
}

impl Body for ForwardBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if this.inner.is_end_stream() {
                    this.report(ProxyEvent::ClientRequestEnded);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.report(ProxyEvent::ClientRequestErrored);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.report(ProxyEvent::ClientRequestEnded);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Backend response body streamed to the client.
///
/// Owns the request context from the moment the response headers are sent.
/// Dropping it before the backend body is exhausted tears down the backend
/// request and records a premature close.
pub struct ProxyResponseBody {
    inner: AxumBody,
    ctx: ProxyRequestContext,
    finished: bool,
}

impl ProxyResponseBody {
    pub fn new(inner: AxumBody, ctx: ProxyRequestContext) -> Self {
        let finished = inner.is_end_stream();
        let mut body = Self {
            inner,
            ctx,
            finished,
        };
        if finished {
            body.ctx.on_event(ProxyEvent::BackendResponseEnded);
        }
        body
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.ctx.on_event(ProxyEvent::BackendResponseEnded);
        }
    }
}

impl Body for ProxyResponseBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if this.inner.is_end_stream() {
                    this.finish();
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                {
                    let _enter = this.ctx.span.enter();
                    warn!(error = %e, "Backend response failed mid-transfer");
                }
                this.ctx.on_event(ProxyEvent::BackendResponseErrored);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for ProxyResponseBody {
    fn drop(&mut self) {
        self.ctx.on_event(ProxyEvent::ClientResponseClosed {
            finished: self.finished,
        });
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;
    use hyper::Method;
    use tracing::Span;

    use super::*;
    use crate::core::lifecycle::RequestState;

    fn proxying_ctx() -> ProxyRequestContext {
        let mut ctx = ProxyRequestContext::new(
            "test".to_string(),
            Method::GET,
            "http://a.test/".to_string(),
            Span::none(),
        );
        for state in [
            RequestState::ValidatingHost,
            RequestState::ValidatingUrl,
            RequestState::ResolvingVhost,
            RequestState::Proxying,
        ] {
            ctx.transition(state);
        }
        ctx.on_event(ProxyEvent::BackendResponseStarted);
        ctx
    }

    #[tokio::test]
    async fn test_response_body_streams_all_frames() {
        let body = ProxyResponseBody::new(AxumBody::from("streamed"), proxying_ctx());
        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"streamed");
    }

    #[tokio::test]
    async fn test_empty_response_is_finished_immediately() {
        let body = ProxyResponseBody::new(AxumBody::empty(), proxying_ctx());
        assert!(body.finished);
        assert!(!body.ctx.lifecycle.backend_open());
    }
}
