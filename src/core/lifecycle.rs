//! Per-request state machine.
//!
//! A proxied request correlates four independent streams: the client request,
//! the client response, the backend request and the backend response. Events
//! from those streams are fed into [`ProxyLifecycle::on_event`], which updates
//! the state and tells the caller what to do next.
use std::{fmt, time::Instant};

use hyper::{Method, StatusCode};
use tracing::{Span, debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    Received,
    ValidatingHost,
    ValidatingUrl,
    AcmeChallenge,
    ResolvingVhost,
    NotFound,
    Redirecting,
    Proxying,
    Responded,
    BadRequest,
    BadGateway,
    GatewayTimeout,
    Aborted,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::AcmeChallenge
                | RequestState::NotFound
                | RequestState::Redirecting
                | RequestState::Responded
                | RequestState::BadRequest
                | RequestState::BadGateway
                | RequestState::GatewayTimeout
                | RequestState::Aborted
        )
    }

    pub fn can_transition_to(&self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Received, ValidatingHost)
                | (ValidatingHost, ValidatingUrl | AcmeChallenge | BadRequest)
                | (ValidatingUrl, ResolvingVhost | AcmeChallenge | BadRequest)
                | (ResolvingVhost, NotFound | Redirecting | Proxying)
                | (Proxying, Responded | BadGateway | GatewayTimeout | Aborted)
        )
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::Received => "received",
            RequestState::ValidatingHost => "validating_host",
            RequestState::ValidatingUrl => "validating_url",
            RequestState::AcmeChallenge => "acme_challenge",
            RequestState::ResolvingVhost => "resolving_vhost",
            RequestState::NotFound => "not_found",
            RequestState::Redirecting => "redirecting",
            RequestState::Proxying => "proxying",
            RequestState::Responded => "responded",
            RequestState::BadRequest => "bad_request",
            RequestState::BadGateway => "bad_gateway",
            RequestState::GatewayTimeout => "gateway_timeout",
            RequestState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Something that happened on one of the four streams of a proxied request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyEvent {
    ClientRequestEnded,
    ClientRequestErrored,
    BackendResponseStarted,
    BackendRequestErrored,
    GatewayTimeoutElapsed,
    BackendResponseErrored,
    BackendResponseEnded,
    ClientResponseClosed { finished: bool },
}

/// What the request handler must do in reaction to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyAction {
    ArmGatewayTimer,
    ClearGatewayTimer,
    StreamResponse,
    RespondBadGateway,
    RespondGatewayTimeout,
    RespondClientAborted,
    DestroyBackendRequest,
    LogPrematureClose,
}

#[derive(Debug)]
pub struct ProxyLifecycle {
    state: RequestState,
    trail: Vec<RequestState>,
    timer_armed: bool,
    timer_cleared: bool,
    response_started: bool,
    client_ended: bool,
    client_errored: bool,
    backend_open: bool,
    client_closed: bool,
}

impl Default for ProxyLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyLifecycle {
    pub fn new() -> Self {
        Self {
            state: RequestState::Received,
            trail: vec![RequestState::Received],
            timer_armed: false,
            timer_cleared: false,
            response_started: false,
            client_ended: false,
            client_errored: false,
            backend_open: false,
            client_closed: false,
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Every state visited so far, in order.
    pub fn trail(&self) -> &[RequestState] {
        &self.trail
    }

    pub fn response_started(&self) -> bool {
        self.response_started
    }

    pub fn client_errored(&self) -> bool {
        self.client_errored
    }

    pub fn client_closed(&self) -> bool {
        self.client_closed
    }

    pub fn backend_open(&self) -> bool {
        self.backend_open
    }

    pub fn timer_armed(&self) -> bool {
        self.timer_armed && !self.timer_cleared
    }

    /// Move to `next`; illegal transitions are logged and ignored.
    pub fn transition(&mut self, next: RequestState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(from = %self.state, to = %next, "Ignoring illegal request state transition");
            return false;
        }
        debug!(from = %self.state, to = %next, "Request state transition");
        self.state = next;
        self.trail.push(next);
        if next == RequestState::Proxying {
            self.backend_open = true;
        }
        true
    }

    fn clear_timer(&mut self, actions: &mut Vec<ProxyAction>) {
        if self.timer_armed && !self.timer_cleared {
            self.timer_cleared = true;
            actions.push(ProxyAction::ClearGatewayTimer);
        }
    }

    fn destroy_backend(&mut self, actions: &mut Vec<ProxyAction>) {
        if self.backend_open {
            self.backend_open = false;
            actions.push(ProxyAction::DestroyBackendRequest);
        }
    }

    /// Apply one stream event and return the reactions, in the order they must run.
    pub fn on_event(&mut self, event: ProxyEvent) -> Vec<ProxyAction> {
        let mut actions = Vec::new();
        let proxying = self.state == RequestState::Proxying;

        match event {
            ProxyEvent::ClientRequestEnded => {
                self.client_ended = true;
                if proxying && !self.response_started && !self.timer_armed {
                    self.timer_armed = true;
                    actions.push(ProxyAction::ArmGatewayTimer);
                }
            }
            ProxyEvent::ClientRequestErrored => {
                self.client_errored = true;
                if proxying && !self.response_started {
                    self.clear_timer(&mut actions);
                    self.destroy_backend(&mut actions);
                    self.transition(RequestState::Aborted);
                    actions.push(ProxyAction::RespondClientAborted);
                } else if self.response_started {
                    self.destroy_backend(&mut actions);
                }
            }
            ProxyEvent::BackendResponseStarted => {
                if proxying {
                    self.clear_timer(&mut actions);
                    self.response_started = true;
                    self.transition(RequestState::Responded);
                    actions.push(ProxyAction::StreamResponse);
                } else {
                    // Late response for a request that already has an outcome
                    self.destroy_backend(&mut actions);
                }
            }
            ProxyEvent::BackendRequestErrored => {
                self.backend_open = false;
                self.clear_timer(&mut actions);
                if proxying {
                    if self.client_errored {
                        self.transition(RequestState::Aborted);
                    } else if !self.response_started {
                        self.transition(RequestState::BadGateway);
                        actions.push(ProxyAction::RespondBadGateway);
                    }
                }
            }
            ProxyEvent::GatewayTimeoutElapsed => {
                if proxying && self.timer_armed && !self.timer_cleared {
                    self.timer_cleared = true;
                    if !self.response_started {
                        self.transition(RequestState::GatewayTimeout);
                        actions.push(ProxyAction::RespondGatewayTimeout);
                    }
                    self.destroy_backend(&mut actions);
                }
            }
            ProxyEvent::BackendResponseErrored => {
                // Headers are already on the wire; the abort propagates through the body
                self.backend_open = false;
            }
            ProxyEvent::BackendResponseEnded => {
                self.backend_open = false;
            }
            ProxyEvent::ClientResponseClosed { finished } => {
                self.client_closed = true;
                self.destroy_backend(&mut actions);
                if !finished {
                    actions.push(ProxyAction::LogPrematureClose);
                }
            }
        }

        actions
    }
}

/// Everything known about one request, kept for log correlation.
///
/// Dropping a context that never reached a terminal state means the client
/// went away while the backend was still being waited on.
#[derive(Debug)]
pub struct ProxyRequestContext {
    pub id: String,
    pub method: Method,
    pub original_url: String,
    pub resolved_url: Option<String>,
    pub started_at: Instant,
    pub lifecycle: ProxyLifecycle,
    pub status: Option<StatusCode>,
    pub span: Span,
}

impl ProxyRequestContext {
    pub fn new(id: String, method: Method, original_url: String, span: Span) -> Self {
        Self {
            id,
            method,
            original_url,
            resolved_url: None,
            started_at: Instant::now(),
            lifecycle: ProxyLifecycle::new(),
            status: None,
            span,
        }
    }

    pub fn state(&self) -> RequestState {
        self.lifecycle.state()
    }

    pub fn transition(&mut self, next: RequestState) -> bool {
        let _enter = self.span.enter();
        self.lifecycle.transition(next)
    }

    pub fn on_event(&mut self, event: ProxyEvent) -> Vec<ProxyAction> {
        let _enter = self.span.enter();
        let actions = self.lifecycle.on_event(event);
        if actions.contains(&ProxyAction::LogPrematureClose) {
            warn!(
                url = %self.original_url,
                backend = self.resolved_url.as_deref().unwrap_or("-"),
                "Client response closed before it was fully written"
            );
        }
        actions
    }

    /// Record the status of the edge or backend response on the request span.
    pub fn record_status(&mut self, status: StatusCode) {
        self.status = Some(status);
        self.span.record("http.status_code", status.as_u16());
    }
}

impl Drop for ProxyRequestContext {
    fn drop(&mut self) {
        let _enter = self.span.enter();
        let elapsed_ms = self.started_at.elapsed().as_millis() as u64;
        self.span.record("duration_ms", elapsed_ms);

        if self.lifecycle.state() == RequestState::Proxying && !self.lifecycle.client_closed() {
            info!(
                method = %self.method,
                url = %self.original_url,
                elapsed_ms,
                "Client disconnected before the backend responded"
            );
        } else {
            debug!(
                state = %self.lifecycle.state(),
                status = self.status.map(|s| s.as_u16()),
                elapsed_ms,
                "Request finished"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxying() -> ProxyLifecycle {
        let mut lifecycle = ProxyLifecycle::new();
        for state in [
            RequestState::ValidatingHost,
            RequestState::ValidatingUrl,
            RequestState::ResolvingVhost,
            RequestState::Proxying,
        ] {
            assert!(lifecycle.transition(state));
        }
        lifecycle
    }

    #[test]
    fn test_terminal_states_do_not_transition() {
        let mut lifecycle = proxying();
        assert!(lifecycle.transition(RequestState::Responded));
        assert!(lifecycle.state().is_terminal());
        assert!(!lifecycle.transition(RequestState::Aborted));
        assert_eq!(lifecycle.state(), RequestState::Responded);
    }

    #[test]
    fn test_illegal_transition_is_ignored() {
        let mut lifecycle = ProxyLifecycle::new();
        assert!(!lifecycle.transition(RequestState::Proxying));
        assert_eq!(lifecycle.trail(), &[RequestState::Received]);
    }

    #[test]
    fn test_timer_armed_once_when_client_request_ends() {
        let mut lifecycle = proxying();
        assert_eq!(
            lifecycle.on_event(ProxyEvent::ClientRequestEnded),
            vec![ProxyAction::ArmGatewayTimer]
        );
        assert!(lifecycle.on_event(ProxyEvent::ClientRequestEnded).is_empty());
        assert!(lifecycle.timer_armed());
    }

    #[test]
    fn test_response_headers_clear_timer_exactly_once() {
        let mut lifecycle = proxying();
        lifecycle.on_event(ProxyEvent::ClientRequestEnded);
        assert_eq!(
            lifecycle.on_event(ProxyEvent::BackendResponseStarted),
            vec![ProxyAction::ClearGatewayTimer, ProxyAction::StreamResponse]
        );
        assert_eq!(lifecycle.state(), RequestState::Responded);
        assert!(lifecycle.response_started());
        // A late timer firing is a no-op
        assert!(lifecycle.on_event(ProxyEvent::GatewayTimeoutElapsed).is_empty());
    }

    #[test]
    fn test_gateway_timeout_before_headers() {
        let mut lifecycle = proxying();
        lifecycle.on_event(ProxyEvent::ClientRequestEnded);
        assert_eq!(
            lifecycle.on_event(ProxyEvent::GatewayTimeoutElapsed),
            vec![
                ProxyAction::RespondGatewayTimeout,
                ProxyAction::DestroyBackendRequest
            ]
        );
        assert_eq!(lifecycle.state(), RequestState::GatewayTimeout);
        assert!(!lifecycle.response_started());
        // Late backend response is discarded
        assert!(lifecycle.on_event(ProxyEvent::BackendResponseStarted).is_empty());
    }

    #[test]
    fn test_gateway_timer_ignored_while_not_armed() {
        let mut lifecycle = proxying();
        assert!(lifecycle.on_event(ProxyEvent::GatewayTimeoutElapsed).is_empty());
        assert_eq!(lifecycle.state(), RequestState::Proxying);
    }

    #[test]
    fn test_backend_error_is_bad_gateway() {
        let mut lifecycle = proxying();
        lifecycle.on_event(ProxyEvent::ClientRequestEnded);
        assert_eq!(
            lifecycle.on_event(ProxyEvent::BackendRequestErrored),
            vec![ProxyAction::ClearGatewayTimer, ProxyAction::RespondBadGateway]
        );
        assert_eq!(lifecycle.state(), RequestState::BadGateway);
        assert!(!lifecycle.backend_open());
    }

    #[test]
    fn test_client_error_aborts_and_destroys_backend() {
        let mut lifecycle = proxying();
        assert_eq!(
            lifecycle.on_event(ProxyEvent::ClientRequestErrored),
            vec![
                ProxyAction::DestroyBackendRequest,
                ProxyAction::RespondClientAborted
            ]
        );
        assert_eq!(lifecycle.state(), RequestState::Aborted);
        // The backend error that follows does not turn into a 502
        assert!(lifecycle.on_event(ProxyEvent::BackendRequestErrored).is_empty());
        assert_eq!(lifecycle.state(), RequestState::Aborted);
    }

    #[test]
    fn test_client_error_after_response_destroys_backend() {
        let mut lifecycle = proxying();
        lifecycle.on_event(ProxyEvent::ClientRequestEnded);
        lifecycle.on_event(ProxyEvent::BackendResponseStarted);
        lifecycle.on_event(ProxyEvent::ClientRequestErrored);
        assert!(lifecycle.client_errored());
        assert!(!lifecycle.backend_open());
    }

    #[test]
    fn test_client_response_closed_early() {
        let mut lifecycle = proxying();
        lifecycle.on_event(ProxyEvent::BackendResponseStarted);
        assert_eq!(
            lifecycle.on_event(ProxyEvent::ClientResponseClosed { finished: false }),
            vec![
                ProxyAction::DestroyBackendRequest,
                ProxyAction::LogPrematureClose
            ]
        );
    }

    #[test]
    fn test_client_response_closed_after_completion() {
        let mut lifecycle = proxying();
        lifecycle.on_event(ProxyEvent::BackendResponseStarted);
        lifecycle.on_event(ProxyEvent::BackendResponseEnded);
        assert!(
            lifecycle
                .on_event(ProxyEvent::ClientResponseClosed { finished: true })
                .is_empty()
        );
        assert!(lifecycle.client_closed());
    }

    #[test]
    fn test_backend_body_error_never_resends_headers() {
        let mut lifecycle = proxying();
        lifecycle.on_event(ProxyEvent::BackendResponseStarted);
        assert!(lifecycle.on_event(ProxyEvent::BackendResponseErrored).is_empty());
        assert_eq!(lifecycle.state(), RequestState::Responded);
        assert!(
            !lifecycle
                .on_event(ProxyEvent::ClientResponseClosed { finished: false })
                .contains(&ProxyAction::DestroyBackendRequest)
        );
    }
}
