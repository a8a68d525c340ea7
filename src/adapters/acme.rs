//! ACME HTTP-01 challenge files served from the public directory.
use axum::body::Body as AxumBody;
use http::{
    Method, Response, StatusCode,
    header::{self, HeaderValue},
};
use tracing::{debug, info};

use crate::{
    adapters::responses,
    core::error::RejectReason,
    ports::file_system::FileSystem,
};

pub use crate::core::routing::ACME_CHALLENGE_PREFIX;

/// Reject traversal sequences and segment characters outside `[a-zA-Z0-9_.-]`.
pub fn validate_challenge_path(path: &str) -> Result<(), RejectReason> {
    if path.contains("..") || path.contains("//") {
        return Err(RejectReason::InvalidChallengePath);
    }

    let valid = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .all(|segment| {
            segment
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
        });

    if valid {
        Ok(())
    } else {
        Err(RejectReason::InvalidChallengePath)
    }
}

/// Serve `<public_dir><path>` as an opaque challenge response.
pub async fn serve_challenge<F: FileSystem>(
    file_system: &F,
    public_dir: &str,
    method: &Method,
    path: &str,
) -> Response<AxumBody> {
    if *method != Method::GET && *method != Method::HEAD {
        debug!(%method, path, "Rejected ACME challenge method");
        return responses::method_not_allowed();
    }

    if let Err(reason) = validate_challenge_path(path) {
        debug!(path, "Rejected ACME challenge path");
        return responses::rejection(reason);
    }

    let contents = match file_system.read_file(public_dir, path).await {
        Ok(contents) => contents,
        Err(e) => {
            debug!(path, error = %e, "ACME challenge file unavailable");
            return responses::file_not_found();
        }
    };

    info!(path, bytes = contents.len(), "Serving ACME challenge");

    let length = HeaderValue::from(contents.len());
    let body = if *method == Method::HEAD {
        AxumBody::empty()
    } else {
        AxumBody::from(contents)
    };

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, length);
    response
}
