use anyhow::Context;
use clap::Parser;
use clatd::configure::{configure, reconfigure_ipv6, Environment, Options};
use clatd::constants::{DEFAULT_CONFIG_PATH, MARK_UNSET, NETID_UNSET};
use clatd::iface::TunDevice;
use clatd::privilege::{Identity, Privileged};
use clatd::relay::{LoopExit, RelayLoop};
use clatd::signal::{install_termination_handler, RunningFlag};
use clatd::translate::Nat46;
use clatd::tunnel::TunnelSession;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// 464XLAT customer-side translator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Uplink interface carrying IPv6 traffic
    #[arg(short = 'i', long)]
    uplink: String,

    /// PLAT prefix (/96)
    #[arg(short = 'p', long)]
    plat_prefix: String,

    /// Synthetic IPv4 address to use instead of picking one
    #[arg(short = '4', long)]
    ipv4: Option<String>,

    /// Synthetic IPv6 address to use instead of deriving one
    #[arg(short = '6', long)]
    ipv6: Option<String>,

    /// Network id
    #[arg(short = 'n', long, default_value_t = NETID_UNSET)]
    net_id: u32,

    /// Socket mark for translated IPv6 packets
    #[arg(short = 'm', long, default_value_t = MARK_UNSET)]
    mark: u32,

    /// Name of the TUN device (default: v4-<uplink>)
    #[arg(short = 't', long)]
    tun_name: Option<String>,

    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args)) {
        Ok(LoopExit::Stopped) => ExitCode::SUCCESS,
        Ok(exit) => {
            error!("relay loop ended: {:?}", exit);
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<LoopExit> {
    info!(
        "Starting clat version {} on {} netid={} mark={}",
        env!("CARGO_PKG_VERSION"),
        args.uplink,
        args.net_id,
        args.mark
    );

    let privileged = Privileged::assume().context("claiming privileged phase")?;

    let tun_name = args.tun_name.clone().unwrap_or_else(|| format!("v4-{}", args.uplink));
    let device = TunDevice::create(&privileged, &tun_name).context("creating TUN device")?;
    let tun_fd = device.clone_fd().context("preparing TUN descriptor")?;

    let session = TunnelSession::open(&privileged, &tun_name, tun_fd, args.mark).context("opening sockets")?;

    let unprivileged = privileged
        .drop_privileges(&Identity::clat())
        .context("dropping privileges")?;

    let opts = Options {
        config_path: args.config,
        uplink: args.uplink,
        plat_prefix: args.plat_prefix,
        ipv4: args.ipv4,
        ipv6: args.ipv6,
        net_id: args.net_id,
    };
    let env = Environment::system();
    let mut config = configure(&unprivileged, &opts, &session, &device, &env).context("configuring interface")?;

    let running = RunningFlag::new();
    install_termination_handler(running.clone()).context("installing signal handler")?;

    let mut translator = Nat46::from_config(&config);
    loop {
        let exit = RelayLoop::new(&session, &config, &mut translator, &env.addrs, running.clone())
            .run()
            .await?;
        if exit != LoopExit::PrefixChanged {
            info!("Shutting down clat on {}", config.uplink);
            return Ok(exit);
        }

        match reconfigure_ipv6(&mut config, &session, opts.ipv6.as_deref(), &env) {
            Ok(()) => translator.set_local6(config.ipv6_local),
            Err(e) if e.is_recoverable() => warn!("reconfiguration failed, will retry: {}", e),
            Err(e) => return Err(e).context("reconfiguring IPv6"),
        }
    }
}
