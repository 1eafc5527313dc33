//! Traffic redirection capability.
//!
//! A [`Firewall`] installs NAT rules that divert traffic arriving on a public
//! port to the proxy's listening socket, and toggles kernel IP forwarding so
//! diverted victims keep reaching the rest of the network.

mod iptables;
mod memory;

use std::fmt;
use std::net::IpAddr;

use thiserror::Error;

pub use iptables::IptablesFirewall;
pub use memory::MemoryFirewall;

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("redirection conflict: {0} is already installed")]
    Conflict(Redirection),
    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },
    #[error("failed to run firewall command: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport protocol a redirection applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
}

impl Protocol {
    fn as_arg(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("TCP"),
        }
    }
}

/// Descriptor of one installed NAT rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Redirection {
    pub interface: String,
    pub protocol: Protocol,
    /// Port traffic is diverted from.
    pub src_port: u16,
    pub dst_address: IpAddr,
    pub dst_port: u16,
}

impl Redirection {
    pub fn new(
        interface: impl Into<String>,
        protocol: Protocol,
        src_port: u16,
        dst_address: IpAddr,
        dst_port: u16,
    ) -> Self {
        Self {
            interface: interface.into(),
            protocol,
            src_port,
            dst_address,
            dst_port,
        }
    }

    /// Two redirections conflict when they divert the same public port.
    pub fn conflicts_with(&self, other: &Redirection) -> bool {
        self.interface == other.interface
            && self.protocol == other.protocol
            && self.src_port == other.src_port
    }
}

impl fmt::Display for Redirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] ({}) :{} -> {}:{}",
            self.interface, self.protocol, self.src_port, self.dst_address, self.dst_port
        )
    }
}

/// OS-level redirection and forwarding control.
///
/// Implementations must reject a second rule for a public port that is
/// already diverted, and must treat removal of an unknown rule as a no-op.
pub trait Firewall: Send + Sync {
    /// Whether the kernel forwards packets between interfaces.
    fn is_forwarding_enabled(&self) -> bool;

    /// Enables or disables packet forwarding.
    fn enable_forwarding(&self, enabled: bool) -> Result<(), FirewallError>;

    /// Installs a rule diverting `public_port` on `interface` to `address:port`.
    fn install(
        &self,
        interface: &str,
        protocol: Protocol,
        public_port: u16,
        address: IpAddr,
        port: u16,
    ) -> Result<Redirection, FirewallError>;

    /// Removes a previously installed rule. Idempotent.
    fn remove(&self, redirection: &Redirection) -> Result<(), FirewallError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn redirection_display() {
        let r = Redirection::new(
            "eth0",
            Protocol::Tcp,
            80,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            8080,
        );
        assert_eq!(r.to_string(), "[eth0] (TCP) :80 -> 10.0.0.2:8080");
    }

    /// Rules targeting different proxy ports still conflict when they
    /// divert the same public port.
    #[test]
    fn conflict_is_keyed_on_public_port() {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let a = Redirection::new("eth0", Protocol::Tcp, 80, ip, 8080);
        let b = Redirection::new("eth0", Protocol::Tcp, 80, ip, 9090);
        let c = Redirection::new("eth0", Protocol::Tcp, 443, ip, 8080);
        let d = Redirection::new("wlan0", Protocol::Tcp, 80, ip, 8080);
        assert!(a.conflicts_with(&b));
        assert!(!a.conflicts_with(&c));
        assert!(!a.conflicts_with(&d));
    }
}
