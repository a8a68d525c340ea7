//! vhost-edge - an HTTP/1.1 edge reverse proxy for locally hosted applications.
//!
//! The proxy terminates plaintext and TLS connections on a set of edge ports,
//! picks the application owning the request's virtual host and streams the
//! exchange to that application's backend port on the local machine.
//!
//! # Features
//! - Name-based virtual hosting with per-hostname certificates selected by SNI
//! - Canonical redirects to an application's preferred hostname and port
//! - ACME HTTP-01 challenge files served from a public directory
//! - Streaming in both directions with a gateway timeout for silent backends
//! - 502/504/400 answers that mirror which side of the exchange failed
//! - Structured tracing with one span per request
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use vhost_edge::{EdgeServer, GracefulShutdown, config::load_config};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = load_config("edge.toml").await?;
//! let shutdown = Arc::new(GracefulShutdown::new());
//! let running = EdgeServer::new(config).start(shutdown).await?;
//! let reason = running.run().await;
//! println!("stopped: {reason:?}");
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! Request decisions (validation, virtual-host resolution, redirects, the
//! per-request state machine) live in `core` and are free of I/O. Traits in
//! `ports` describe the seams to the outside world and `adapters` implement
//! them on top of hyper, rustls and tokio.
pub mod config;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{BackendPool, EdgeServer, FileSystemAdapter, ProxyHandler, RunningServer},
    core::{ProxyError, VirtualHostRegistry},
    utils::{GracefulShutdown, ShutdownReason},
};
