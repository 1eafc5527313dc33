//! Linux NAT redirection through `iptables`/`ip6tables`.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Mutex;

use tracing::{debug, info, warn};

use super::{Firewall, FirewallError, Protocol, Redirection};

const IPV4_FORWARD_PATH: &str = "/proc/sys/net/ipv4/ip_forward";

/// Firewall backed by the `nat` table's `PREROUTING` chain.
///
/// Only rules installed through this value are tracked; removing a rule it
/// never installed is a no-op.
pub struct IptablesFirewall {
    iptables: String,
    ip6tables: String,
    forward_path: PathBuf,
    installed: Mutex<HashSet<Redirection>>,
}

impl IptablesFirewall {
    pub fn new() -> Self {
        Self {
            iptables: "iptables".to_string(),
            ip6tables: "ip6tables".to_string(),
            forward_path: PathBuf::from(IPV4_FORWARD_PATH),
            installed: Mutex::new(HashSet::new()),
        }
    }

    /// Overrides the sysctl file used to read and toggle forwarding.
    pub fn with_forward_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.forward_path = path.into();
        self
    }

    /// Overrides the binaries invoked for IPv4 and IPv6 rules.
    pub fn with_binaries(
        mut self,
        iptables: impl Into<String>,
        ip6tables: impl Into<String>,
    ) -> Self {
        self.iptables = iptables.into();
        self.ip6tables = ip6tables.into();
        self
    }

    fn binary_for(&self, redirection: &Redirection) -> &str {
        match redirection.dst_address {
            IpAddr::V4(_) => &self.iptables,
            IpAddr::V6(_) => &self.ip6tables,
        }
    }

    fn run(&self, redirection: &Redirection, action: &str) -> Result<(), FirewallError> {
        let binary = self.binary_for(redirection);
        let args = rule_args(redirection, action);
        debug!("running {} {}", binary, args.join(" "));

        let output = Command::new(binary).args(&args).output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(FirewallError::Command {
                command: format!("{} {}", binary, args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

impl Default for IptablesFirewall {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the iptables arguments for adding (`-A`) or deleting (`-D`) a rule.
fn rule_args(redirection: &Redirection, action: &str) -> Vec<String> {
    let destination = match redirection.dst_address {
        IpAddr::V4(ip) => format!("{}:{}", ip, redirection.dst_port),
        IpAddr::V6(ip) => format!("[{}]:{}", ip, redirection.dst_port),
    };
    vec![
        "-t".to_string(),
        "nat".to_string(),
        action.to_string(),
        "PREROUTING".to_string(),
        "-i".to_string(),
        redirection.interface.clone(),
        "-p".to_string(),
        redirection.protocol.as_arg().to_string(),
        "--dport".to_string(),
        redirection.src_port.to_string(),
        "-j".to_string(),
        "DNAT".to_string(),
        "--to-destination".to_string(),
        destination,
    ]
}

impl Firewall for IptablesFirewall {
    fn is_forwarding_enabled(&self) -> bool {
        match std::fs::read_to_string(&self.forward_path) {
            Ok(value) => value.trim() == "1",
            Err(e) => {
                warn!(
                    "failed to read {}: {}",
                    self.forward_path.display(),
                    e
                );
                false
            }
        }
    }

    fn enable_forwarding(&self, enabled: bool) -> Result<(), FirewallError> {
        let value = if enabled { "1" } else { "0" };
        std::fs::write(&self.forward_path, value)?;
        info!("IP forwarding set to {}", value);
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

        let mut installed = self.installed.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = installed.iter().find(|r| r.conflicts_with(&redirection)) {
            return Err(FirewallError::Conflict(existing.clone()));
        }

        self.run(&redirection, "-A")?;
        installed.insert(redirection.clone());
        info!("installed redirection {}", redirection);

        Ok(redirection)
    }

    fn remove(&self, redirection: &Redirection) -> Result<(), FirewallError> {
        let mut installed = self.installed.lock().unwrap_or_else(|e| e.into_inner());
        if !installed.contains(redirection) {
            debug!("redirection {} not installed, nothing to remove", redirection);
            return Ok(());
        }

        self.run(redirection, "-D")?;
        installed.remove(redirection);
        info!("removed redirection {}", redirection);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn ipv4_rule_arguments() {
        let r = Redirection::new(
            "eth0",
            Protocol::Tcp,
            80,
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
            8080,
        );
        assert_eq!(
            rule_args(&r, "-A").join(" "),
            "-t nat -A PREROUTING -i eth0 -p tcp --dport 80 -j DNAT --to-destination 192.168.1.10:8080"
        );
    }

    #[test]
    fn ipv6_destination_is_bracketed() {
        let r = Redirection::new(
            "eth0",
            Protocol::Tcp,
            443,
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            8443,
        );
        assert!(rule_args(&r, "-D").ends_with(&["[::1]:8443".to_string()]));
    }

    /// Forwarding state is read from and written to the sysctl file.
    #[test]
    fn forwarding_toggles_sysctl_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ip_forward");
        std::fs::write(&path, "0\n").unwrap();

        let fw = IptablesFirewall::new().with_forward_path(&path);
        assert!(!fw.is_forwarding_enabled());

        fw.enable_forwarding(true).unwrap();
        assert!(fw.is_forwarding_enabled());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1");
    }

    /// Removing a rule this firewall never installed does not shell out.
    #[test]
    fn remove_unknown_rule_is_noop() {
        let fw = IptablesFirewall::new()
            .with_binaries("/nonexistent/iptables", "/nonexistent/ip6tables");
        let r = Redirection::new(
            "eth0",
            Protocol::Tcp,
            80,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            8080,
        );
        assert!(fw.remove(&r).is_ok());
    }

    /// A failing binary surfaces as an error and leaves nothing tracked.
    #[test]
    fn failed_install_is_not_tracked() {
        let fw = IptablesFirewall::new()
            .with_binaries("/nonexistent/iptables", "/nonexistent/ip6tables");
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert!(fw.install("eth0", Protocol::Tcp, 80, ip, 8080).is_err());
        assert!(fw.installed.lock().unwrap().is_empty());
    }
}
