//! In-process firewall used for dry runs and tests.

use std::net::IpAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use super::{Firewall, FirewallError, Protocol, Redirection};

#[derive(Default)]
struct State {
    installed: Vec<Redirection>,
    removed: Vec<Redirection>,
}

/// Bookkeeping-only firewall: enforces the same conflict and idempotence
/// rules as a real backend without touching the host.
#[derive(Default)]
pub struct MemoryFirewall {
    forwarding: AtomicBool,
    fail_installs: AtomicBool,
    fail_removals: AtomicBool,
    state: Mutex<State>,
}

impl MemoryFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent installs fail, simulating a rejected rule.
    pub fn fail_installs(&self, fail: bool) {
        self.fail_installs.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent removals fail, simulating a stuck rule.
    pub fn fail_removals(&self, fail: bool) {
        self.fail_removals.store(fail, Ordering::SeqCst);
    }

    /// Currently active redirections.
    pub fn installed(&self) -> Vec<Redirection> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).installed.clone()
    }

    /// Redirections removed so far, in removal order.
    pub fn removed(&self) -> Vec<Redirection> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).removed.clone()
    }
}

impl Firewall for MemoryFirewall {
    fn is_forwarding_enabled(&self) -> bool {
        self.forwarding.load(Ordering::SeqCst)
    }

    fn enable_forwarding(&self, enabled: bool) -> Result<(), FirewallError> {
        self.forwarding.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    fn install(
        &self,
        interface: &str,
        protocol: Protocol,
        public_port: u16,
        address: IpAddr,
        port: u16,
    ) -> Result<Redirection, FirewallError> {
        let redirection = Redirection::new(interface, protocol, public_port, address, port);
        if self.fail_installs.load(Ordering::SeqCst) {
            return Err(FirewallError::Command {
                command: format!("install {}", redirection),
                stderr: "simulated failure".to_string(),
            });
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = state.installed.iter().find(|r| r.conflicts_with(&redirection)) {
            return Err(FirewallError::Conflict(existing.clone()));
        }
        state.installed.push(redirection.clone());
        debug!("recorded redirection {}", redirection);

        Ok(redirection)
    }

    fn remove(&self, redirection: &Redirection) -> Result<(), FirewallError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(index) = state.installed.iter().position(|r| r == redirection) else {
            return Ok(());
        };
        if self.fail_removals.load(Ordering::SeqCst) {
            return Err(FirewallError::Command {
                command: format!("remove {}", redirection),
                stderr: "simulated failure".to_string(),
            });
        }
        let removed = state.installed.remove(index);
        state.removed.push(removed);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCAL: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    /// A second rule for the same public port is refused while the first
    /// is active, and allowed again once it is removed.
    #[test]
    fn conflicting_install_is_rejected() {
        let fw = MemoryFirewall::new();
        let first = fw.install("eth0", Protocol::Tcp, 80, LOCAL, 8080).unwrap();

        let err = fw.install("eth0", Protocol::Tcp, 80, LOCAL, 9090).unwrap_err();
        assert!(matches!(err, FirewallError::Conflict(ref r) if *r == first));

        fw.remove(&first).unwrap();
        assert!(fw.install("eth0", Protocol::Tcp, 80, LOCAL, 9090).is_ok());
    }

    #[test]
    fn remove_twice_is_noop() {
        let fw = MemoryFirewall::new();
        let r = fw.install("eth0", Protocol::Tcp, 443, LOCAL, 8443).unwrap();
        fw.remove(&r).unwrap();
        fw.remove(&r).unwrap();
        assert!(fw.installed().is_empty());
        assert_eq!(fw.removed(), vec![r]);
    }

    #[test]
    fn forwarding_flag() {
        let fw = MemoryFirewall::new();
        assert!(!fw.is_forwarding_enabled());
        fw.enable_forwarding(true).unwrap();
        assert!(fw.is_forwarding_enabled());
    }
}
