//! Request validation, virtual-host resolution and canonical redirects.
//!
//! Everything here is synchronous and free of I/O so the decision for a request
//! can be computed (and tested) before any backend work starts.
use std::net::Ipv4Addr;

use http::{HeaderValue, Uri};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::core::{
    error::RejectReason,
    lifecycle::{ProxyRequestContext, RequestState},
    vhost::{ApplicationBinding, VirtualHostRegistry},
};

pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

static HOST_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_.:\-]+$").expect("invalid host regex"));

static URL_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_.:/&?=%\-]*$").expect("invalid url regex"));

/// Outcome of routing one request.
#[derive(Debug, PartialEq, Eq)]
pub enum RouteDecision<'a> {
    Reject(RejectReason),
    AcmeChallenge,
    NotFound { hostname: String, bare_ipv4: bool },
    Redirect { location: String },
    Proxy { binding: &'a ApplicationBinding },
}

/// Decide what to do with a request received on `local_port`.
///
/// Validation runs before any lookup. ACME challenge paths are recognised as
/// soon as a Host header is present so certificate issuance keeps working for
/// hosts the registry does not know about yet.
pub fn route_request<'a>(
    registry: &'a VirtualHostRegistry,
    host_header: Option<&HeaderValue>,
    uri: &Uri,
    local_port: u16,
    ctx: &mut ProxyRequestContext,
) -> RouteDecision<'a> {
    ctx.transition(RequestState::ValidatingHost);

    let Some(host) = host_header
        .and_then(|value| value.to_str().ok())
        .filter(|host| !host.is_empty())
    else {
        ctx.transition(RequestState::BadRequest);
        return RouteDecision::Reject(RejectReason::InvalidHost);
    };

    if uri.path().starts_with(ACME_CHALLENGE_PREFIX) {
        ctx.transition(RequestState::AcmeChallenge);
        return RouteDecision::AcmeChallenge;
    }

    if !is_valid_host(host) {
        ctx.transition(RequestState::BadRequest);
        return RouteDecision::Reject(RejectReason::InvalidHost);
    }

    ctx.transition(RequestState::ValidatingUrl);
    let target = request_target(uri);
    if !is_valid_target(target) {
        ctx.transition(RequestState::BadRequest);
        return RouteDecision::Reject(RejectReason::InvalidUrl);
    }

    ctx.transition(RequestState::ResolvingVhost);
    let (hostname, _) = split_host_port(host);

    let Some(binding) = registry.resolve(hostname, local_port) else {
        ctx.transition(RequestState::NotFound);
        return RouteDecision::NotFound {
            hostname: hostname.to_string(),
            bare_ipv4: hostname.parse::<Ipv4Addr>().is_ok(),
        };
    };

    if let Some(location) = canonical_redirect(registry, binding, hostname, local_port, target) {
        debug!(application = %binding.name, %location, "Redirecting to canonical host");
        ctx.transition(RequestState::Redirecting);
        return RouteDecision::Redirect { location };
    }

    ctx.transition(RequestState::Proxying);
    RouteDecision::Proxy { binding }
}

/// Path and query of the request, `/` when the target carries neither.
pub fn request_target(uri: &Uri) -> &str {
    uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
}

/// Split `host[:port]` at the first colon.
pub fn split_host_port(host: &str) -> (&str, Option<&str>) {
    match host.split_once(':') {
        Some((hostname, port)) => (hostname, Some(port)),
        None => (host, None),
    }
}

pub fn is_valid_host(host: &str) -> bool {
    HOST_CHARS.is_match(host)
}

pub fn is_valid_target(target: &str) -> bool {
    URL_CHARS.is_match(target) && decodes_strictly(target)
}

/// Every `%` must start a two-digit hex escape and the decoded bytes must be UTF-8.
fn decodes_strictly(target: &str) -> bool {
    let bytes = target.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let escape = bytes.get(i + 1..i + 3);
            if !escape.is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit)) {
                return false;
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    urlencoding::decode(target).is_ok()
}

/// Location of the canonical form of this request, if it differs from the request.
pub fn canonical_redirect(
    registry: &VirtualHostRegistry,
    binding: &ApplicationBinding,
    hostname: &str,
    port: u16,
    target: &str,
) -> Option<String> {
    let preferred_host = registry
        .preferred_host(binding)
        .map(|h| h.hostname.as_str())
        .filter(|preferred| !preferred.eq_ignore_ascii_case(hostname));
    let preferred_port = registry
        .preferred_port(binding)
        .filter(|preferred| *preferred != port);

    if preferred_host.is_none() && preferred_port.is_none() {
        return None;
    }

    let protocol = if binding.prefer_encrypted { "https" } else { "http" };
    Some(build_location(
        protocol,
        preferred_host.unwrap_or(hostname),
        preferred_port.unwrap_or(port),
        target,
    ))
}

fn build_location(protocol: &str, host: &str, port: u16, target: &str) -> String {
    let default_port = matches!((protocol, port), ("https", 443) | ("http", 80));
    if default_port {
        format!("{protocol}://{host}{target}")
    } else {
        format!("{protocol}://{host}:{port}{target}")
    }
}

#[cfg(test)]
mod tests {
    use hyper::Method;
    use tracing::Span;

    use super::*;
    use crate::config::{ApplicationConfig, ProxyConfig};

    fn registry() -> VirtualHostRegistry {
        let config = ProxyConfig::builder()
            .server(443, true)
            .server(80, false)
            .server(8080, false)
            .application(
                ApplicationConfig::new("www", 3000)
                    .port(443)
                    .port(80)
                    .hostname_with_certificate("www.example.com", "example")
                    .hostname_with_certificate("example.com", "example"),
            )
            .application(
                ApplicationConfig::new("internal", 3001)
                    .port(8080)
                    .hostname("internal.example.com"),
            )
            .build()
            .unwrap();
        VirtualHostRegistry::from_config(&config)
    }

    fn ctx() -> ProxyRequestContext {
        ProxyRequestContext::new("test".to_string(), Method::GET, "/".to_string(), Span::none())
    }

    fn route<'a>(
        registry: &'a VirtualHostRegistry,
        host: Option<&str>,
        target: &str,
        port: u16,
    ) -> (RouteDecision<'a>, RequestState) {
        let header = host.map(|h| HeaderValue::from_str(h).unwrap());
        let uri: Uri = target.parse().unwrap();
        let mut ctx = ctx();
        let decision = route_request(registry, header.as_ref(), &uri, port, &mut ctx);
        (decision, ctx.state())
    }

    #[test]
    fn test_missing_host_is_rejected() {
        let registry = registry();
        let (decision, state) = route(&registry, None, "/", 443);
        assert_eq!(decision, RouteDecision::Reject(RejectReason::InvalidHost));
        assert_eq!(state, RequestState::BadRequest);
    }

    #[test]
    fn test_invalid_host_characters_are_rejected() {
        let registry = registry();
        for host in ["exa mple.com", "example.com/", "[::1]:443", "a@b"] {
            let (decision, _) = route(&registry, Some(host), "/", 443);
            assert_eq!(decision, RouteDecision::Reject(RejectReason::InvalidHost), "{host}");
        }
    }

    #[test]
    fn test_invalid_targets_are_rejected() {
        let registry = registry();
        for target in ["/a%zz", "/a%2", "/%ff%fe", "/<script>", "/a;b", "/a~b"] {
            assert!(!is_valid_target(target), "{target}");
        }
        let (decision, _) = route(&registry, Some("www.example.com"), "/a%zz", 443);
        assert_eq!(decision, RouteDecision::Reject(RejectReason::InvalidUrl));
    }

    #[test]
    fn test_valid_targets_are_accepted() {
        for target in ["/", "/a/b.c?x=1&y=2", "/caf%C3%A9", "/a:b-c_d"] {
            assert!(is_valid_target(target), "{target}");
        }
    }

    #[test]
    fn test_acme_runs_before_host_character_check() {
        let registry = registry();
        let (decision, state) = route(
            &registry,
            Some("bad host"),
            "/.well-known/acme-challenge/token",
            80,
        );
        assert_eq!(decision, RouteDecision::AcmeChallenge);
        assert_eq!(state, RequestState::AcmeChallenge);
    }

    #[test]
    fn test_unknown_host_is_not_found() {
        let registry = registry();
        let (decision, state) = route(&registry, Some("10.0.0.1"), "/", 9000);
        assert_eq!(
            decision,
            RouteDecision::NotFound {
                hostname: "10.0.0.1".to_string(),
                bare_ipv4: true
            }
        );
        assert_eq!(state, RequestState::NotFound);
    }

    #[test]
    fn test_combined_redirect_for_host_and_port() {
        let registry = registry();
        let (decision, _) = route(&registry, Some("example.com"), "/path?q=1", 80);
        assert_eq!(
            decision,
            RouteDecision::Redirect {
                location: "https://www.example.com/path?q=1".to_string()
            }
        );
    }

    #[test]
    fn test_redirect_correcting_host_only() {
        let registry = registry();
        let (decision, _) = route(&registry, Some("EXAMPLE.com:443"), "/", 443);
        assert_eq!(
            decision,
            RouteDecision::Redirect {
                location: "https://www.example.com/".to_string()
            }
        );
    }

    #[test]
    fn test_redirect_correcting_port_only() {
        let registry = registry();
        let (decision, _) = route(&registry, Some("www.example.com"), "/x", 80);
        assert_eq!(
            decision,
            RouteDecision::Redirect {
                location: "https://www.example.com/x".to_string()
            }
        );
    }

    #[test]
    fn test_canonical_request_is_proxied() {
        let registry = registry();
        let (decision, state) = route(&registry, Some("www.example.com:443"), "/", 443);
        match decision {
            RouteDecision::Proxy { binding } => assert_eq!(binding.name, "www"),
            other => panic!("unexpected decision: {other:?}"),
        }
        assert_eq!(state, RequestState::Proxying);
    }

    #[test]
    fn test_non_default_port_is_kept_in_location() {
        let registry = registry();
        let (decision, _) = route(&registry, Some("other.example.com"), "/", 8080);
        assert_eq!(
            decision,
            RouteDecision::Redirect {
                location: "http://internal.example.com:8080/".to_string()
            }
        );
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("a.test:8080"), ("a.test", Some("8080")));
        assert_eq!(split_host_port("a.test"), ("a.test", None));
    }
}
