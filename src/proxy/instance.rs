//! Proxy instance lifecycle.
//!
//! A [`ProxyInstance`] owns at most one firewall redirection and one listener
//! task. `configure` installs the redirection, `start` spawns the listener and
//! `stop` tears both down again, on every path.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::hook::InterceptionHook;
use super::server::{self, ListenerSpec, ListenerState, ProxyCore};
use super::tls::TlsMaterial;
use super::upstream::Upstream;
use crate::ca::{CaError, CaState, CertCache};
use crate::firewall::{FirewallError, Protocol, Redirection};
use crate::script::{ProxyScript, ScriptError};
use crate::session::Session;

/// Grace period granted to open connections on stop.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Unconfigured,
    Configured,
    Running,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Unconfigured => "unconfigured",
            LifecycleState::Configured => "configured",
            LifecycleState::Running => "running",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("failed to load proxy script: {0}")]
    Script(#[from] ScriptError),
    #[error("redirection failed: {0}")]
    Redirection(#[from] FirewallError),
    #[error("failed to listen on {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },
    #[error("certificate authority error: {0}")]
    Ca(#[from] CaError),
    #[error("no tokio runtime available to run the listener")]
    NoRuntime,
}

/// Parameters of one `configure` call.
#[derive(Clone)]
pub struct ProxyOptions {
    /// Address the listener binds to and redirected traffic is sent to.
    pub address: String,
    /// Listening port; `0` picks an ephemeral port at start.
    pub proxy_port: u16,
    /// Port whose inbound traffic is redirected to the proxy.
    pub public_port: u16,
    /// Rule script loaded as the interception hook.
    pub script: Option<PathBuf>,
    /// Hook used when no script is given.
    pub hook: Option<Arc<dyn InterceptionHook>>,
    pub shutdown_timeout: Duration,
    /// Static upstream address overrides, consulted before DNS.
    pub resolve: HashMap<String, SocketAddr>,
}

impl ProxyOptions {
    pub fn new(address: impl Into<String>, proxy_port: u16, public_port: u16) -> Self {
        Self {
            address: address.into(),
            proxy_port,
            public_port,
            script: None,
            hook: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            resolve: HashMap::new(),
        }
    }

    pub fn with_script(mut self, path: impl Into<PathBuf>) -> Self {
        self.script = Some(path.into());
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn InterceptionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_resolve(mut self, host: impl Into<String>, addr: SocketAddr) -> Self {
        self.resolve.insert(host.into(), addr);
        self
    }
}

impl fmt::Debug for ProxyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyOptions")
            .field("address", &self.address)
            .field("proxy_port", &self.proxy_port)
            .field("public_port", &self.public_port)
            .field("script", &self.script)
            .field("hook", &self.hook.is_some())
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("resolve", &self.resolve)
            .finish()
    }
}

/// Handle on the spawned listener task.
struct Listener {
    stop: Option<oneshot::Sender<()>>,
    status: watch::Receiver<ListenerState>,
    task: JoinHandle<()>,
}

impl Listener {
    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = self.task.await {
            error!("proxy listener task failed: {}", e);
        }
    }
}

/// One transparent interception proxy.
pub struct ProxyInstance {
    session: Session,
    cert_cache: Arc<CertCache>,
    state: LifecycleState,
    bind_address: Option<IpAddr>,
    listen_port: u16,
    public_port: u16,
    tls: Option<TlsMaterial>,
    hook: Option<Arc<dyn InterceptionHook>>,
    redirection: Option<Redirection>,
    shutdown_timeout: Duration,
    resolve: HashMap<String, SocketAddr>,
    listener: Option<Listener>,
}

impl ProxyInstance {
    /// Creates an instance with a freshly generated CA for CONNECT tunnels.
    pub fn new(session: Session) -> Result<Self, ProxyError> {
        let ca = CaState::generate()?;
        Ok(Self::with_ca(session, Arc::new(ca)))
    }

    /// Creates an instance minting tunnel certificates from `ca`.
    pub fn with_ca(session: Session, ca: Arc<CaState>) -> Self {
        Self {
            session,
            cert_cache: Arc::new(CertCache::new(ca)),
            state: LifecycleState::Unconfigured,
            bind_address: None,
            listen_port: 0,
            public_port: 0,
            tls: None,
            hook: None,
            redirection: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            resolve: HashMap::new(),
            listener: None,
        }
    }

    /// Prepares a plain HTTP proxy and installs its redirection.
    ///
    /// Errors raised before the previous redirection is touched keep the
    /// previous configuration. Once it has been removed, a failure leaves the
    /// instance `Unconfigured`, so it cannot start without a redirection.
    pub fn configure(&mut self, options: ProxyOptions) -> Result<(), ProxyError> {
        if self.state == LifecycleState::Running {
            return Err(ProxyError::InvalidState {
                operation: "configure",
                state: self.state,
            });
        }

        let address: IpAddr = options.address.parse().map_err(|_| {
            ProxyError::Configuration(format!("invalid bind address {:?}", options.address))
        })?;
        if options.public_port == 0 {
            return Err(ProxyError::Configuration(
                "public port must not be 0".to_string(),
            ));
        }

        let hook = match &options.script {
            Some(path) => {
                let script = ProxyScript::load(path)?;
                debug!("proxy script {} loaded", path.display());
                Some(Arc::new(script) as Arc<dyn InterceptionHook>)
            }
            None => options.hook.clone(),
        };

        let firewall = &self.session.firewall;
        if !firewall.is_forwarding_enabled() {
            info!("enabling forwarding");
            firewall.enable_forwarding(true)?;
        }

        let replacing = self.redirection.is_some();
        if let Some(previous) = self.redirection.take() {
            debug!("removing previous redirection {}", previous);
            if let Err(e) = firewall.remove(&previous) {
                self.redirection = Some(previous);
                return Err(e.into());
            }
        }

        let redirection = match firewall.install(
            &self.session.interface,
            Protocol::Tcp,
            options.public_port,
            address,
            options.proxy_port,
        ) {
            Ok(redirection) => redirection,
            Err(e) => {
                if replacing {
                    self.reset();
                }
                return Err(e.into());
            }
        };
        debug!("applied redirection {}", redirection);

        self.bind_address = Some(address);
        self.listen_port = options.proxy_port;
        self.public_port = options.public_port;
        self.tls = None;
        self.hook = hook;
        self.redirection = Some(redirection);
        self.shutdown_timeout = options.shutdown_timeout;
        self.resolve = options.resolve;
        self.state = LifecycleState::Configured;
        Ok(())
    }

    /// Forgets the listener configuration after a failed re-configure.
    fn reset(&mut self) {
        warn!("previous proxy configuration discarded");
        self.bind_address = None;
        self.listen_port = 0;
        self.public_port = 0;
        self.tls = None;
        self.hook = None;
        self.state = LifecycleState::Unconfigured;
    }

    /// Like [`configure`](Self::configure), for a TLS-terminating listener.
    ///
    /// The files are read when the listener starts.
    pub fn configure_tls(
        &mut self,
        options: ProxyOptions,
        cert_file: impl AsRef<Path>,
        key_file: impl AsRef<Path>,
    ) -> Result<(), ProxyError> {
        self.configure(options)?;
        self.tls = Some(TlsMaterial::new(
            cert_file.as_ref(),
            key_file.as_ref(),
        ));
        Ok(())
    }

    /// Spawns the listener and returns immediately.
    ///
    /// Bind and certificate failures are reported by [`bound`](Self::bound),
    /// not here.
    pub fn start(&mut self) -> Result<(), ProxyError> {
        let Some(address) = self.bind_address.filter(|_| self.state == LifecycleState::Configured)
        else {
            return Err(ProxyError::InvalidState {
                operation: "start",
                state: self.state,
            });
        };
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ProxyError::NoRuntime)?;

        let core = Arc::new(ProxyCore {
            events: Arc::clone(&self.session.events),
            hook: self.hook.clone(),
            upstream: Upstream::new(self.resolve.clone()),
            cert_cache: Arc::clone(&self.cert_cache),
        });
        let settings = ListenerSpec {
            addr: SocketAddr::new(address, self.listen_port),
            tls: self.tls.clone(),
            grace: self.shutdown_timeout,
        };

        let (status_tx, status_rx) = watch::channel(ListenerState::Starting);
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = runtime.spawn(server::serve(core, settings, status_tx, stop_rx));

        self.listener = Some(Listener {
            stop: Some(stop_tx),
            status: status_rx,
            task,
        });
        self.state = LifecycleState::Running;
        info!(
            "proxy started on {}:{} (public port {})",
            address, self.listen_port, self.public_port
        );
        Ok(())
    }

    /// Waits until the listener is accepting connections and returns its
    /// local address.
    pub async fn bound(&self) -> Result<SocketAddr, ProxyError> {
        let Some(listener) = &self.listener else {
            return Err(ProxyError::InvalidState {
                operation: "wait for the listener",
                state: self.state,
            });
        };

        let mut status = listener.status.clone();
        let state = status
            .wait_for(|state| *state != ListenerState::Starting)
            .await
            .map(|state| state.clone())
            .unwrap_or(ListenerState::Closed);

        match state {
            ListenerState::Listening(addr) => Ok(addr),
            ListenerState::Failed(reason) => Err(ProxyError::Bind {
                addr: self.listen_addr(),
                reason,
            }),
            ListenerState::Starting | ListenerState::Closed => Err(ProxyError::InvalidState {
                operation: "wait for the listener",
                state: LifecycleState::Stopped,
            }),
        }
    }

    /// Removes the redirection and shuts the listener down.
    ///
    /// Safe in any state. A failed removal is returned after the listener
    /// has been shut down anyway; the redirection stays recorded so the next
    /// `stop` retries it.
    pub async fn stop(&mut self) -> Result<(), ProxyError> {
        let mut result = Ok(());

        if let Some(redirection) = &self.redirection {
            debug!("disabling redirection {}", redirection);
            match self.session.firewall.remove(redirection) {
                Ok(()) => self.redirection = None,
                Err(e) => {
                    error!("failed to remove redirection {}: {}", redirection, e);
                    result = Err(ProxyError::Redirection(e));
                }
            }
        }

        if let Some(listener) = self.listener.take() {
            listener.shutdown().await;
            info!("proxy stopped");
        }

        self.state = LifecycleState::Stopped;
        result
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn redirection(&self) -> Option<&Redirection> {
        self.redirection.as_ref()
    }

    /// Address the listener is accepting on, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.listener.as_ref()?.status.borrow() {
            ListenerState::Listening(addr) => Some(*addr),
            _ => None,
        }
    }

    /// PEM of the CA clients must trust for intercepted tunnels.
    pub fn ca_cert_pem(&self) -> &str {
        self.cert_cache.ca().ca_cert_pem()
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    fn listen_addr(&self) -> SocketAddr {
        let address = self
            .bind_address
            .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(address, self.listen_port)
    }
}

impl Drop for ProxyInstance {
    fn drop(&mut self) {
        if let Some(mut listener) = self.listener.take()
            && let Some(stop) = listener.stop.take()
        {
            let _ = stop.send(());
        }

        if let Some(redirection) = self.redirection.take() {
            match self.session.firewall.remove(&redirection) {
                Ok(()) => debug!("removed redirection {} on drop", redirection),
                Err(e) => warn!("failed to remove redirection {} on drop: {}", redirection, e),
            }
        }
    }
}
