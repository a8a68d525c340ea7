pub mod acme;
pub mod edge_server;
pub mod file_system;
pub mod http_client;
pub mod http_handler;
pub mod listener;
pub mod responses;
pub mod streaming;
pub mod tls;

/// Re-export commonly used types from adapters
pub use edge_server::{EdgeServer, RunningServer};
pub use file_system::FileSystemAdapter;
pub use http_client::BackendPool;
pub use http_handler::ProxyHandler;
pub use listener::{Listener, ListenerEvent, ListenerHandle};
