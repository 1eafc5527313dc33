//! Transparent HTTP/HTTPS interception proxy.
//!
//! This module provides the proxy listener, the hook protocol it drives for
//! every request/response cycle, and the instance lifecycle that ties the
//! listener to its firewall redirection.

mod admission;
mod hook;
mod instance;
mod server;
mod tls;
mod upstream;

pub use admission::{BLACKLIST, Rejection, check_host, effective_host};
pub use hook::{InterceptionHook, InterceptionResult, RequestView, ResponseView};
pub use instance::{
    DEFAULT_SHUTDOWN_TIMEOUT, LifecycleState, ProxyError, ProxyInstance, ProxyOptions,
};
pub use server::ListenerState;
pub use tls::{TlsAcceptor, TlsError, TlsMaterial};
pub use upstream::{Scheme, Upstream, UpstreamError};
