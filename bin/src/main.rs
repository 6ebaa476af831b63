//! kiln command line entry point: configuration loading, logging setup,
//! signal wiring and the event loop.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::info;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use kiln_lib::{
    config::Config,
    server::{Server, CHILD_SIGNAL, SHUTDOWN_SIGNAL},
};

#[derive(Parser, Debug)]
#[command(name = "kiln", version, about = "an event-driven HTTP/1.1 server with CGI support")]
struct Args {
    /// path to the TOML configuration file
    #[arg(short, long, default_value = "kiln.toml")]
    config: PathBuf,

    /// check the configuration and exit
    #[arg(long)]
    check: bool,
}

extern "C" fn handle_shutdown_signal(_signal: libc::c_int) {
    SHUTDOWN_SIGNAL.store(true, std::sync::atomic::Ordering::SeqCst);
}

extern "C" fn handle_child_signal(_signal: libc::c_int) {
    CHILD_SIGNAL.store(true, std::sync::atomic::Ordering::SeqCst);
}

/// Handlers only set flags; the event loop acts on them at its next
/// iteration, which its bounded poll timeout keeps close.
fn register_signal_handlers() -> anyhow::Result<()> {
    let shutdown = SigAction::new(
        SigHandler::Handler(handle_shutdown_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    let child = SigAction::new(
        SigHandler::Handler(handle_child_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGINT, &shutdown).context("could not install SIGINT handler")?;
        sigaction(Signal::SIGTERM, &shutdown).context("could not install SIGTERM handler")?;
        sigaction(Signal::SIGCHLD, &child).context("could not install SIGCHLD handler")?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("invalid configuration {}", args.config.display()))?;

    if args.check {
        println!("{} is valid", args.config.display());
        return Ok(());
    }

    register_signal_handlers()?;

    let mut server = Server::new(config).context("could not start the server")?;
    info!("kiln {} starting", env!("CARGO_PKG_VERSION"));
    server.run().context("event loop failed")?;
    Ok(())
}
