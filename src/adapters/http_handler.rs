use std::{pin::Pin, sync::Arc, time::Duration};

use axum::body::Body as AxumBody;
use http::{
    HeaderMap, Request, Response, Uri, Version,
    header::{self, HeaderName, HeaderValue},
};
use hyper::body::Incoming;
use tokio::{
    sync::mpsc,
    time::{Sleep, sleep},
};
use tracing::{Instrument, debug, info, warn};

use crate::{
    adapters::{
        FileSystemAdapter, acme, responses,
        streaming::{ForwardBody, ProxyResponseBody},
    },
    config::{ProxyConfig, TimeoutConfig},
    core::{
        error::{ProxyError, RejectReason},
        lifecycle::{ProxyAction, ProxyEvent, ProxyRequestContext},
        request_id::next_request_id,
        routing::{RouteDecision, request_target, route_request},
        vhost::VirtualHostRegistry,
    },
    ports::{
        http_client::{BackendClient, BackendError, BackendResult},
        http_server::{ConnectionInfo, RequestHandler},
    },
    tracing_setup::create_request_span,
};

static KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");
static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Settings the handler needs from the proxy configuration
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub public_dir: String,
    pub backend_host: String,
    pub timeouts: TimeoutConfig,
}

impl From<&ProxyConfig> for HandlerSettings {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            public_dir: config.public_dir.clone(),
            backend_host: config.backend_host.clone(),
            timeouts: config.timeouts.clone(),
        }
    }
}

/// Per-request orchestrator shared by every listener.
///
/// Validates the request, resolves its virtual host, answers locally (errors,
/// redirects, ACME challenges) or proxies it to the application's backend while
/// correlating the client and backend streams through the request lifecycle.
pub struct ProxyHandler {
    registry: Arc<VirtualHostRegistry>,
    backend: Arc<dyn BackendClient>,
    file_system: Arc<FileSystemAdapter>,
    settings: HandlerSettings,
}

/// What woke up the proxy loop
enum Step {
    Backend(BackendResult<Response<AxumBody>>),
    Client(Option<ProxyEvent>),
    GatewayTimer,
}

/// Headers added to every request forwarded to a backend
#[derive(Debug, Clone, Copy)]
pub struct ForwardedContext<'a> {
    pub request_id: &'a str,
    pub encrypted: bool,
    pub backend_port: u16,
    pub backend_keep_alive_secs: u64,
}

impl ProxyHandler {
    pub fn new(
        registry: Arc<VirtualHostRegistry>,
        backend: Arc<dyn BackendClient>,
        file_system: Arc<FileSystemAdapter>,
        settings: HandlerSettings,
    ) -> Self {
        Self {
            registry,
            backend,
            file_system,
            settings,
        }
    }

    /// Main request handler that routes requests appropriately
    pub async fn handle_request(
        &self,
        req: Request<Incoming>,
        conn: ConnectionInfo,
    ) -> Response<AxumBody> {
        let id = next_request_id();
        let span = create_request_span(
            req.method().as_str(),
            req.uri().path(),
            &id,
            conn.local_port,
        );
        let original_url = format!(
            "{}://{}{}",
            if conn.encrypted { "https" } else { "http" },
            req.headers()
                .get(header::HOST)
                .and_then(|h| h.to_str().ok())
                .unwrap_or("-"),
            request_target(req.uri()),
        );
        let ctx = ProxyRequestContext::new(id, req.method().clone(), original_url, span.clone());

        self.dispatch(req, conn, ctx).instrument(span).await
    }

    async fn dispatch(
        &self,
        req: Request<Incoming>,
        conn: ConnectionInfo,
        mut ctx: ProxyRequestContext,
    ) -> Response<AxumBody> {
        debug!(remote = %conn.remote_addr, url = %ctx.original_url, "Handling request");

        let decision = route_request(
            &self.registry,
            req.headers().get(header::HOST),
            req.uri(),
            conn.local_port,
            &mut ctx,
        );

        let response = match decision {
            RouteDecision::Reject(reason) => {
                let error = ProxyError::BadRequest { reason };
                info!(%error, url = %ctx.original_url, "Rejected request");
                responses::error_response(&error)
            }
            RouteDecision::AcmeChallenge => {
                acme::serve_challenge(
                    self.file_system.as_ref(),
                    &self.settings.public_dir,
                    req.method(),
                    req.uri().path(),
                )
                .await
            }
            RouteDecision::NotFound { hostname, bare_ipv4 } => {
                let error = ProxyError::NotFound {
                    hostname,
                    port: conn.local_port,
                };
                // Scanners probing bare IPs are too noisy for info
                if bare_ipv4 {
                    debug!(%error, "No application for IP host");
                } else {
                    info!(%error, "No application for host");
                }
                responses::error_response(&error)
            }
            RouteDecision::Redirect { location } => {
                info!(url = %ctx.original_url, %location, "Redirecting to canonical URL");
                responses::redirect(&location)
            }
            RouteDecision::Proxy { binding } => {
                let backend_port = binding.backend_port;
                debug!(application = %binding.name, backend_port, "Proxying request");
                return self.proxy(req, conn, backend_port, ctx).await;
            }
        };

        ctx.record_status(response.status());
        response
    }

    /// Forward the request and correlate the four streams until the response starts
    async fn proxy(
        &self,
        req: Request<Incoming>,
        conn: ConnectionInfo,
        backend_port: u16,
        mut ctx: ProxyRequestContext,
    ) -> Response<AxumBody> {
        let (mut parts, body) = req.into_parts();
        let backend_url = format!(
            "http://{}:{}{}",
            self.settings.backend_host,
            backend_port,
            request_target(&parts.uri)
        );

        let uri: Uri = match backend_url.parse() {
            Ok(uri) => uri,
            Err(e) => {
                let error = ProxyError::BadGateway {
                    backend_port,
                    reason: format!("invalid backend url '{backend_url}': {e}"),
                };
                warn!(%error, "Could not build backend URL");
                ctx.on_event(ProxyEvent::BackendRequestErrored);
                ctx.record_status(http::StatusCode::BAD_GATEWAY);
                return responses::error_response(&error);
            }
        };

        rewrite_forwarded_headers(
            &mut parts.headers,
            ForwardedContext {
                request_id: &ctx.id,
                encrypted: conn.encrypted,
                backend_port,
                backend_keep_alive_secs: self.settings.timeouts.backend_keep_alive_secs,
            },
        );
        parts.uri = uri;
        parts.version = Version::HTTP_11;
        ctx.resolved_url = Some(backend_url);

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let forward_body = AxumBody::new(ForwardBody::new(body, events_tx));
        let backend_req = Request::from_parts(parts, forward_body);

        let mut backend_fut = self.backend.send_request(backend_req);
        let mut gateway_timer: Option<Pin<Box<Sleep>>> = None;
        let mut client_open = true;
        let gateway_timeout = self.settings.timeouts.gateway_timeout();

        loop {
            let step = tokio::select! {
                result = &mut backend_fut => Step::Backend(result),
                event = events_rx.recv(), if client_open => Step::Client(event),
                () = wait_for(&mut gateway_timer) => Step::GatewayTimer,
            };

            match step {
                Step::Client(None) => client_open = false,
                Step::Client(Some(event)) => {
                    let actions = ctx.on_event(event);
                    if let Some(response) = self.apply(
                        &actions,
                        &mut ctx,
                        &mut gateway_timer,
                        gateway_timeout,
                        backend_port,
                    ) {
                        return response;
                    }
                }
                Step::GatewayTimer => {
                    let actions = ctx.on_event(ProxyEvent::GatewayTimeoutElapsed);
                    gateway_timer = None;
                    if let Some(response) = self.apply(
                        &actions,
                        &mut ctx,
                        &mut gateway_timer,
                        gateway_timeout,
                        backend_port,
                    ) {
                        return response;
                    }
                }
                Step::Backend(Ok(response)) => {
                    let actions = ctx.on_event(ProxyEvent::BackendResponseStarted);
                    if actions.contains(&ProxyAction::StreamResponse) {
                        return self.stream_response(response, ctx);
                    }
                    // Another stream already decided the outcome
                    return client_aborted();
                }
                Step::Backend(Err(e)) => {
                    return self.backend_failed(e, &mut events_rx, ctx, backend_port);
                }
            }
        }
    }

    /// Run the actions that can be taken before a response exists
    fn apply(
        &self,
        actions: &[ProxyAction],
        ctx: &mut ProxyRequestContext,
        gateway_timer: &mut Option<Pin<Box<Sleep>>>,
        gateway_timeout: Duration,
        backend_port: u16,
    ) -> Option<Response<AxumBody>> {
        let mut response = None;
        for action in actions {
            match action {
                ProxyAction::ArmGatewayTimer => {
                    debug!(timeout = ?gateway_timeout, "Client request complete, arming timer");
                    *gateway_timer = Some(Box::pin(sleep(gateway_timeout)));
                }
                ProxyAction::ClearGatewayTimer => *gateway_timer = None,
                ProxyAction::RespondGatewayTimeout => {
                    let error = ProxyError::GatewayTimeout {
                        backend_port,
                        timeout: gateway_timeout,
                    };
                    warn!(%error, "Backend did not respond in time");
                    response = Some(responses::error_response(&error));
                }
                ProxyAction::RespondClientAborted => {
                    info!(url = %ctx.original_url, "Client request failed before backend response");
                    response = Some(client_aborted());
                }
                ProxyAction::RespondBadGateway => {
                    response = Some(responses::error_response(&ProxyError::BadGateway {
                        backend_port,
                        reason: "backend request failed".to_string(),
                    }))
                }
                // Returning drops the pending backend future, which closes its connection
                ProxyAction::DestroyBackendRequest => {
                    debug!(backend_port, "Destroying backend request")
                }
                ProxyAction::StreamResponse | ProxyAction::LogPrematureClose => {}
            }
        }
        if let Some(response) = &response {
            ctx.record_status(response.status());
        }
        response
    }

    fn backend_failed(
        &self,
        cause: BackendError,
        events_rx: &mut mpsc::UnboundedReceiver<ProxyEvent>,
        mut ctx: ProxyRequestContext,
        backend_port: u16,
    ) -> Response<AxumBody> {
        // A client failure usually causes the backend failure; account for it first
        while let Ok(event) = events_rx.try_recv() {
            let actions = ctx.on_event(event);
            if actions.contains(&ProxyAction::RespondClientAborted) {
                info!(
                    url = %ctx.original_url,
                    error = %cause,
                    "Client request failed while forwarding"
                );
                ctx.record_status(http::StatusCode::BAD_REQUEST);
                return client_aborted();
            }
        }

        let actions = ctx.on_event(ProxyEvent::BackendRequestErrored);
        if actions.contains(&ProxyAction::RespondBadGateway) {
            let error = ProxyError::BadGateway {
                backend_port,
                reason: cause.to_string(),
            };
            warn!(%error, connect = cause.is_connect(), "Backend unavailable");
            ctx.record_status(http::StatusCode::BAD_GATEWAY);
            responses::error_response(&error)
        } else {
            debug!(
                backend_port,
                error = %cause,
                "Backend request failed after the outcome was decided"
            );
            client_aborted()
        }
    }

    fn stream_response(
        &self,
        response: Response<AxumBody>,
        mut ctx: ProxyRequestContext,
    ) -> Response<AxumBody> {
        let (mut parts, body) = response.into_parts();
        replace_hop_by_hop_headers(
            &mut parts.headers,
            self.settings.timeouts.frontend_keep_alive_secs,
        );
        ctx.record_status(parts.status);
        info!(
            status = parts.status.as_u16(),
            backend = ctx.resolved_url.as_deref().unwrap_or("-"),
            elapsed_ms = ctx.started_at.elapsed().as_millis() as u64,
            "Proxied request"
        );

        Response::from_parts(parts, AxumBody::new(ProxyResponseBody::new(body, ctx)))
    }
}

impl RequestHandler for ProxyHandler {
    async fn handle(&self, req: Request<Incoming>, conn: ConnectionInfo) -> Response<AxumBody> {
        self.handle_request(req, conn).await
    }
}

async fn wait_for(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}

fn client_aborted() -> Response<AxumBody> {
    responses::error_response(&ProxyError::BadRequest {
        reason: RejectReason::ClientAborted,
    })
}

fn insert_formatted(headers: &mut HeaderMap, name: &HeaderName, value: String) {
    match HeaderValue::from_str(&value) {
        Ok(value) => {
            headers.insert(name.clone(), value);
        }
        Err(e) => debug!(header = %name, error = %e, "Skipping unrepresentable header value"),
    }
}

/// Turn client request headers into the headers sent to a backend.
///
/// The backend always sees `host: localhost:<port>`; the client's Host moves to
/// `x-forwarded-host`. Client connection management headers are replaced by
/// the edge's own keep-alive settings for the backend pool.
pub fn rewrite_forwarded_headers(headers: &mut HeaderMap, forwarded: ForwardedContext<'_>) {
    let original_host = headers.remove(header::HOST);
    headers.remove(header::CONNECTION);
    headers.remove(&KEEP_ALIVE);

    insert_formatted(
        headers,
        &header::HOST,
        format!("localhost:{}", forwarded.backend_port),
    );
    if let Some(host) = original_host {
        headers.insert(X_FORWARDED_HOST.clone(), host);
    }
    headers.insert(
        X_FORWARDED_PROTO.clone(),
        HeaderValue::from_static(if forwarded.encrypted { "https" } else { "http" }),
    );
    insert_formatted(headers, &X_REQUEST_ID, forwarded.request_id.to_string());
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    insert_formatted(
        headers,
        &KEEP_ALIVE,
        format!("timeout={}", forwarded.backend_keep_alive_secs),
    );
}

/// Drop the backend's framing headers; hyper frames the client response itself.
pub fn replace_hop_by_hop_headers(headers: &mut HeaderMap, frontend_keep_alive_secs: u64) {
    headers.remove(header::CONNECTION);
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(&KEEP_ALIVE);
    insert_formatted(
        headers,
        &KEEP_ALIVE,
        format!("timeout={frontend_keep_alive_secs}"),
    );
}
