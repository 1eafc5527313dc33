//! Transparent HTTP/HTTPS interception proxy.
//!
//! This crate provides the traffic-interception core of a man-in-the-middle
//! network tool: firewall rules divert a victim's traffic to a local proxy,
//! which forwards it to the real destination while letting an
//! [`InterceptionHook`] inspect, pass through or replace every request and
//! response.
//!
//! # Architecture
//!
//! A [`ProxyInstance`]:
//! 1. Installs a NAT [`Redirection`] from the public port to its listener
//! 2. Spawns the listener task (plain HTTP, or TLS-terminating)
//! 3. Serves each connection in its own task; `CONNECT` tunnels are decrypted
//!    with certificates minted on the fly from the instance's CA
//! 4. Runs the hook for every admitted request and upstream response, and
//!    records an event for every synthesized response
//! 5. On stop, removes the redirection and drains open connections
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mitm_proxy::{EventLog, IptablesFirewall, ProxyInstance, ProxyOptions, Session};
//!
//! # async fn run() -> Result<(), mitm_proxy::ProxyError> {
//! let session = Session::new(
//!     "eth0",
//!     Arc::new(IptablesFirewall::new()),
//!     Arc::new(EventLog::new()),
//! );
//! let mut proxy = ProxyInstance::new(session)?;
//! proxy.configure(ProxyOptions::new("192.168.1.10", 8080, 80).with_script("rules.yaml"))?;
//! proxy.start()?;
//! proxy.bound().await?;
//! // ...
//! proxy.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod ca;
pub mod config;
pub mod events;
pub mod firewall;
pub mod proxy;
pub mod script;
mod session;

pub use config::{ConfigError, ProxyConfig};
pub use events::{Event, EventData, EventLog, EventSink, InterceptionEvent, SPOOFED_RESPONSE};
pub use firewall::{
    Firewall, FirewallError, IptablesFirewall, MemoryFirewall, Protocol, Redirection,
};
pub use proxy::{
    InterceptionHook, InterceptionResult, LifecycleState, ProxyError, ProxyInstance, ProxyOptions,
    RequestView, ResponseView,
};
pub use script::{ProxyScript, ScriptError};
pub use session::Session;
