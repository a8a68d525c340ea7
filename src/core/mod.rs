pub mod certificates;
pub mod error;
pub mod lifecycle;
pub mod request_id;
pub mod routing;
pub mod vhost;

pub use certificates::CertificateStore;
pub use error::{ProxyError, RejectReason};
pub use lifecycle::{ProxyRequestContext, RequestState};
pub use vhost::VirtualHostRegistry;
