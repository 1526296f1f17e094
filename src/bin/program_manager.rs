//! Program Manager daemon.
//!
//! Watches the fleet status feed and reconciles every converter that raises
//! `SYNC_REGFGC3` against its expected inventory.

use std::{path::PathBuf, process, sync::atomic::Ordering, sync::Arc};

use clap::Parser;
use log::{error, info};

use regfgc3_pm::{
    logging::{self, LogLevel},
    reconcile::ReconcileCtx,
    server::{ProgramManagerServer, PropertyStatusFeed, StatusFeed, STATUS_SRV_DEVICE},
    session::{TcpSession, TcpSessionFactory},
    Config, Directory, Result, Timing,
};

#[derive(Parser, Debug)]
#[command(name = "program_manager", version, about = "REGFGC3 Program Manager daemon")]
struct Args {
    /// Increase output verbosity.
    #[arg(short = 'v', long = "verbosity", action = clap::ArgAction::Count)]
    verbosity: u8,

    /// Program Manager configuration file location.
    #[arg(short = 'c', long = "config-file", default_value = "../data/pm_config.cfg")]
    config_file: PathBuf,
}

fn main() {
    let args = Args::parse();
    logging::init(LogLevel::from_verbosity(args.verbosity));

    if let Err(e) = run(&args) {
        error!("{e}");
        process::exit(2);
    }
}

fn run(args: &Args) -> Result<()> {
    let config = Config::from_file(args.config_file.as_path())?;
    let directory = Directory::load(config.name_file.as_path())?;

    let adapter = config.adapter.build(None)?;
    let ctx = Arc::new(ReconcileCtx {
        sessions: Arc::new(TcpSessionFactory),
        fw_files: config.adapter.fw_files(),
        timing: Timing::default(),
    });

    let mut server = ProgramManagerServer::new(
        directory,
        adapter,
        ctx,
        Box::new(|| {
            let session = TcpSession::connect(STATUS_SRV_DEVICE)?;
            Ok(Box::new(PropertyStatusFeed::new(Box::new(session))) as Box<dyn StatusFeed>)
        }),
    );

    let stop = server.stop_flag();
    ctrlc::set_handler(move || {
        stop.store(true, Ordering::SeqCst);
    })
    .map_err(|e| regfgc3_pm::Error::rpc(format!("could not install signal handlers: {e}")))?;

    info!("signal handlers configured");

    server.start();
    server.stop();

    info!("ProgramManagerServer terminated, exiting");

    Ok(())
}
