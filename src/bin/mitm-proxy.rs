use anyhow::{Context, Result};
use clap::Parser;
use mitm_proxy::ca::CaState;
use mitm_proxy::{
    EventLog, Firewall, IptablesFirewall, MemoryFirewall, ProxyConfig, ProxyInstance, Session,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Transparent HTTP/HTTPS interception proxy.
///
/// Redirects traffic arriving on the configured interface and public port
/// to a local proxy that forwards it, applying the rules of an optional
/// proxy script.
#[derive(Parser, Debug)]
#[command(name = "mitm-proxy")]
#[command(version, about)]
struct Args {
    /// Path to the proxy configuration file (YAML).
    #[arg(short = 'c', long)]
    config: PathBuf,

    /// Override the interface from the configuration file.
    #[arg(short = 'i', long)]
    interface: Option<String>,

    /// Override the rule script from the configuration file.
    #[arg(short = 's', long)]
    script: Option<PathBuf>,

    /// Record redirections in memory instead of changing firewall rules.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();

    let mut config = ProxyConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {:?}", args.config))?;
    if let Some(interface) = args.interface {
        config.interface = interface;
    }
    if let Some(script) = args.script {
        config.script = Some(script);
    }

    let firewall: Arc<dyn Firewall> = if args.dry_run {
        info!("dry run: firewall changes are only recorded");
        Arc::new(MemoryFirewall::new())
    } else {
        Arc::new(IptablesFirewall::new())
    };
    let events = Arc::new(EventLog::new());
    let session = Session::new(config.interface.clone(), firewall, events.clone());

    let mut proxy = match &config.ca {
        Some(ca) => {
            let ca = CaState::load(&ca.cert, &ca.key)
                .with_context(|| format!("failed to load CA from {:?}", ca.cert))?;
            ProxyInstance::with_ca(session, Arc::new(ca))
        }
        None => ProxyInstance::new(session)?,
    };

    let options = config.to_options();
    match &config.tls {
        Some(tls) => proxy.configure_tls(options, &tls.cert, &tls.key)?,
        None => proxy.configure(options)?,
    }
    if let Some(redirection) = proxy.redirection() {
        info!("redirecting {}", redirection);
    }

    proxy.start()?;
    match proxy.bound().await {
        Ok(addr) => info!("intercepting on {}", addr),
        Err(e) => {
            warn!("{}", e);
            proxy.stop().await?;
            return Err(e.into());
        }
    }
    if config.ca.is_none() {
        info!("clients must trust this CA for CONNECT interception:\n{}", proxy.ca_cert_pem());
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutting down");

    proxy.stop().await?;
    info!("{} responses spoofed", events.interceptions().len());

    Ok(())
}
