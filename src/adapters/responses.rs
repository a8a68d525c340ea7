//! Fixed-shape responses generated by the edge itself.
//!
//! Every error response carries `connection: close` so the client does not
//! reuse a connection the edge has given up on.
use axum::body::Body as AxumBody;
use http::{
    Response, StatusCode,
    header::{self, HeaderValue},
};

use crate::core::error::{ProxyError, RejectReason};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

fn error_response_with_body(status: StatusCode, body: AxumBody, text: bool) -> Response<AxumBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    if text {
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(TEXT_PLAIN));
    }
    response
}

fn text_error(status: StatusCode, message: &'static str) -> Response<AxumBody> {
    error_response_with_body(status, AxumBody::from(message), true)
}

fn empty_error(status: StatusCode) -> Response<AxumBody> {
    error_response_with_body(status, AxumBody::empty(), false)
}

pub fn invalid_host() -> Response<AxumBody> {
    text_error(StatusCode::BAD_REQUEST, "Invalid host")
}

pub fn invalid_url() -> Response<AxumBody> {
    text_error(StatusCode::BAD_REQUEST, "Invalid URL")
}

pub fn invalid_challenge_path() -> Response<AxumBody> {
    text_error(StatusCode::BAD_REQUEST, "Invalid challenge path")
}

fn client_aborted() -> Response<AxumBody> {
    text_error(StatusCode::BAD_REQUEST, "Request aborted")
}

pub fn host_not_found() -> Response<AxumBody> {
    text_error(StatusCode::NOT_FOUND, "Host not found")
}

pub fn file_not_found() -> Response<AxumBody> {
    text_error(StatusCode::NOT_FOUND, "Not found")
}

/// Challenge files are only readable, never written through the edge
pub fn method_not_allowed() -> Response<AxumBody> {
    let mut response = text_error(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
    response
        .headers_mut()
        .insert(header::ALLOW, HeaderValue::from_static("GET, HEAD"));
    response
}

pub fn bad_gateway() -> Response<AxumBody> {
    empty_error(StatusCode::BAD_GATEWAY)
}

pub fn gateway_timeout() -> Response<AxumBody> {
    empty_error(StatusCode::GATEWAY_TIMEOUT)
}

/// Permanent redirect to `location`.
///
/// Locations are assembled from validated hosts and targets; one that still is
/// not a legal header value is answered as an invalid URL.
pub fn redirect(location: &str) -> Response<AxumBody> {
    let Ok(value) = HeaderValue::from_str(location) else {
        return invalid_url();
    };
    let mut response = Response::new(AxumBody::empty());
    *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
    response.headers_mut().insert(header::LOCATION, value);
    response
}

pub fn rejection(reason: RejectReason) -> Response<AxumBody> {
    match reason {
        RejectReason::InvalidHost => invalid_host(),
        RejectReason::InvalidUrl => invalid_url(),
        RejectReason::InvalidChallengePath => invalid_challenge_path(),
        RejectReason::ClientAborted => client_aborted(),
    }
}

/// Edge response for a per-request error kind.
pub fn error_response(error: &ProxyError) -> Response<AxumBody> {
    match error {
        ProxyError::BadRequest { reason } => rejection(*reason),
        ProxyError::NotFound { .. } => host_not_found(),
        ProxyError::BadGateway { .. } => bad_gateway(),
        ProxyError::GatewayTimeout { .. } => gateway_timeout(),
        _ => empty_error(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http_body_util::BodyExt;

    use super::*;

    async fn body_string(response: Response<AxumBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_error_responses_close_connection() {
        for response in [
            invalid_host(),
            invalid_url(),
            host_not_found(),
            bad_gateway(),
            gateway_timeout(),
        ] {
            assert_eq!(response.headers().get(header::CONNECTION).unwrap(), "close");
        }
    }

    #[tokio::test]
    async fn test_text_bodies() {
        let response = invalid_host();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_string(response).await, "Invalid host");

        let response = host_not_found();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_string(response).await, "Host not found");
    }

    #[tokio::test]
    async fn test_gateway_errors_are_empty() {
        let response = bad_gateway();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(body_string(response).await.is_empty());
    }

    #[test]
    fn test_redirect_sets_location() {
        let response = redirect("https://www.example.com/path?q=1");
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://www.example.com/path?q=1"
        );
        assert!(response.headers().get(header::CONNECTION).is_none());
    }

    #[test]
    fn test_error_response_maps_kinds() {
        let timeout = ProxyError::GatewayTimeout {
            backend_port: 3000,
            timeout: Duration::from_secs(20),
        };
        assert_eq!(error_response(&timeout).status(), StatusCode::GATEWAY_TIMEOUT);

        let rejected = ProxyError::BadRequest {
            reason: RejectReason::InvalidUrl,
        };
        assert_eq!(error_response(&rejected).status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_client_aborted_maps_to_bad_request() {
        let aborted = ProxyError::BadRequest {
            reason: RejectReason::ClientAborted,
        };
        let response = error_response(&aborted);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers().get(header::CONNECTION).unwrap(), "close");
        assert_eq!(body_string(response).await, "Request aborted");
    }

    #[tokio::test]
    async fn test_method_not_allowed_lists_read_methods() {
        let response = method_not_allowed();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers().get(header::ALLOW).unwrap(), "GET, HEAD");
        assert_eq!(response.headers().get(header::CONNECTION).unwrap(), "close");
    }
}
