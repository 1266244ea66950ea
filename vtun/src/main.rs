//! vtun - forwards raw IP packets between an enclave's vsock connection and
//! a TUN device.

use clap::Parser;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vtun::config::{Config, DIAG_ADDR, Mode};
use vtun::nat::{self, Forwarding, Iptables};
use vtun::tun::{TUN_NAME, TunDevice};
use vtun::vsock::{self, PARENT_CID, VsockDialer};
use vtun::{Acceptor, TunnelEngine, TunnelStats, diag};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "vtun")]
#[command(version = VERSION)]
#[command(about = "Packet tunnel between an enclave and its parent instance")]
struct Args {
    /// VSOCK port that the enclave connects to
    #[arg(long, default_value_t = vsock::DEFAULT_PORT as u64)]
    port: u64,

    /// Enable the diagnostic HTTP endpoint
    #[arg(long)]
    profile: bool,

    /// Which end of the tunnel to run
    #[arg(long, value_enum, default_value_t = Mode::Proxy)]
    mode: Mode,

    /// CID of the parent instance (enclave mode)
    #[arg(long, default_value_t = PARENT_CID)]
    parent_cid: u32,

    /// Name of the TUN device
    #[arg(long, default_value = TUN_NAME)]
    tun_name: String,

    /// Listen address of the diagnostic endpoint
    #[arg(long, default_value = DIAG_ADDR)]
    diag_addr: String,
}

impl Args {
    fn into_config(self) -> vtun::Result<Config> {
        let port = Config::validate_port(self.port)?;
        Config::validate_diag_addr(&self.diag_addr)?;
        Ok(Config {
            mode: self.mode,
            port,
            parent_cid: self.parent_cid,
            tun_name: self.tun_name,
            profile: self.profile,
            diag_addr: self.diag_addr,
        })
    }
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match Args::parse().into_config() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Invalid arguments");
            std::process::exit(1);
        }
    };

    info!(version = VERSION, mode = ?config.mode, port = config.port, "vtun starting");

    let result = match config.mode {
        Mode::Proxy => run_proxy(config).await,
        Mode::Enclave => run_enclave(config).await,
    };
    if let Err(e) = result {
        error!(error = %e, "Fatal error");
        std::process::exit(1);
    }

    info!("vtun stopped");
}

/// Parent side: NAT, vsock listener, TUN device, accept loop.
///
/// The NAT rules are removed on the way out whether or not setup succeeded.
async fn run_proxy(config: Config) -> vtun::Result<()> {
    let tun_config = config.tun_config();
    let forwarding = Forwarding::new(
        Iptables::new(),
        nat::forwarding_rules(&tun_config.name, tun_config.subnet()),
    );

    let result = async {
        info!("Enabling NAT");
        forwarding.enable()?;

        let acceptor = vsock::listen(config.port)?;
        let tun = setup_tun(&config).await?;
        run_engine(&config, acceptor, tun).await;
        Ok::<_, vtun::Error>(())
    }
    .await;

    info!("Disabling NAT");
    if let Err(e) = forwarding.disable() {
        error!(error = %e, "Failed to disable NAT");
    }
    result
}

/// Enclave side: TUN device with a default route via the parent, dialing
/// loop instead of a listener.
async fn run_enclave(config: Config) -> vtun::Result<()> {
    let tun = setup_tun(&config).await?;
    let dialer = VsockDialer::new(config.parent_cid, config.port);
    run_engine(&config, dialer, tun).await;
    Ok(())
}

async fn setup_tun(config: &Config) -> vtun::Result<Arc<TunDevice>> {
    let tun = TunDevice::create(&config.tun_name)?;
    tun.configure(&config.tun_config()).await?;
    Ok(Arc::new(tun))
}

/// Run the accept loop until SIGINT or SIGTERM.
async fn run_engine<A: Acceptor>(config: &Config, acceptor: A, tun: Arc<TunDevice>) {
    let stats = Arc::new(TunnelStats::new());
    if config.profile {
        diag::spawn(config.diag_addr.clone(), Arc::clone(&stats));
    }

    let engine = TunnelEngine::new(acceptor, tun).with_stats(stats);

    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to set up SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to set up SIGTERM handler");

    tokio::select! {
        _ = engine.run() => {}
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}
