//! `erraidd`: the scheduling daemon entry point (spec §6).

use std::path::PathBuf;

use anyhow::Context;
use erraid::config::Config;
use erraid::daemon::Daemon;
use erraid::signals;
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, StructOpt)]
#[structopt(name = "erraidd", about = "per-user job-scheduling daemon")]
struct Args {
    /// Run directory (overrides the default <prefix>/<user><suffix> rule)
    #[structopt(short = "p", long = "pipes-dir")]
    root: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::from_args();
    let config = Config::resolve(args.root);

    let mut daemon = Daemon::init(&config).context("daemon initialization failed")?;
    let run_result = daemon.run().context("daemon event loop failed");
    signals::uninstall().context("restoring prior signal handlers failed")?;
    run_result
}
