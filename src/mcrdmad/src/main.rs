use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use nix::sys::signal;

use mcrdma::proto::ascii::AsciiProtocol;
use mcrdma::store::Store;
use mcrdma::{Config, Dispatcher, Error, ServerContext};
use rdma::Provider;

mod logging;

#[derive(Debug, Clone, Parser)]
#[command(name = "mcrdma server")]
struct Opts {
    /// Config path
    #[arg(short, long, default_value = "mcrdma.toml")]
    config: PathBuf,
    #[arg(long)]
    no_ansi: bool,
    /// Overrides `transport.interface`
    #[arg(short, long)]
    interface: Option<String>,
    /// Overrides `transport.port`
    #[arg(short, long)]
    port: Option<u16>,
}

static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(sig: i32) {
    if sig == signal::SIGINT as i32 {
        TERMINATE.store(true, Ordering::Relaxed);
    }
}

fn serve<P: Provider>(provider: P, config: Config) -> Result<()> {
    let store = Arc::new(Store::new());
    let protocol = Arc::new(AsciiProtocol::new(store, &config.cache));
    let interface = config.transport.interface.clone();
    let port = config.transport.port;
    let ctx = Arc::new(ServerContext::new(Arc::new(provider), config, protocol));

    let mut dispatcher = Dispatcher::new(ctx);
    dispatcher.init(interface.as_deref(), port)?;

    while !TERMINATE.load(Ordering::Relaxed) {
        match dispatcher.poll_once() {
            Ok(_) => {}
            Err(Error::Spawn(e)) => tracing::warn!("dropped a connection: {}", e),
            Err(Error::CmEvent(e)) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                dispatcher.destroy();
                return Err(e.into());
            }
        }
    }

    let stats = dispatcher.context().stats().snapshot();
    tracing::info!(
        "served {} connections, {} still open, {} rejected, {} failed during setup",
        stats.total_conns,
        stats.curr_conns,
        stats.rejected_conns,
        stats.accept_failures,
    );
    dispatcher.destroy();
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    let mut config = Config::from_path(&opts.config)?;
    if let Some(interface) = opts.interface {
        config.transport.interface = Some(interface);
    }
    if let Some(port) = opts.port {
        config.transport.port = port;
    }

    let _guard = logging::init_log(&config, !opts.no_ansi)?;

    let sig_action = signal::SigAction::new(
        signal::SigHandler::Handler(handle_sigint),
        signal::SaFlags::empty(),
        signal::SigSet::empty(),
    );
    unsafe { signal::sigaction(signal::SIGINT, &sig_action) }?;

    #[cfg(feature = "verbs")]
    let res = serve(rdma::verbs::Verbs::new(), config);
    #[cfg(not(feature = "verbs"))]
    let res = {
        tracing::warn!("built without the verbs feature, serving on the in-process fabric");
        serve(rdma::sim::SimFabric::new(), config)
    };

    if let Err(e) = &res {
        tracing::error!("server stopped: {}", e);
    }
    res
}
