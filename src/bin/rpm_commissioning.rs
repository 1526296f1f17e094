//! Commissioning batch tool.
//!
//! Reads a programming data file, reprograms every listed target for a
//! number of rounds (switching boards into DownloadBoot and back), and
//! logs a per-target summary at the end.

use std::{path::PathBuf, process};

use clap::Parser;
use log::error;

use regfgc3_pm::{
    commissioning::{program_loop, read_programming_data, SummaryCollector, BOOT_SWITCH_DELAY},
    fsm::Timing,
    logging::{self, LogLevel},
    session::TcpSessionFactory,
    Result,
};

#[derive(Parser, Debug)]
#[command(
    name = "rpm_commissioning",
    version,
    about = "Batch-reprogram REGFGC3 boards for commissioning"
)]
struct Args {
    /// Increase output verbosity.
    #[arg(short = 'v', long = "verbosity", action = clap::ArgAction::Count)]
    verbosity: u8,

    /// Programming data file (converter,slot,board,device,variant,var_rev,
    /// api_rev,bin_crc,fw_file_loc per line).
    #[arg(short = 'd', long = "data-file", default_value = "data/prog_data.csv")]
    data_file: PathBuf,

    /// Number of programming rounds.
    #[arg(short = 'r', long = "repetitions", default_value_t = 3)]
    repetitions: u32,
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
    let tasks = read_programming_data(args.data_file.as_path())?;

    let mut collector = SummaryCollector::new();
    let total_iterations = program_loop(
        tasks.as_slice(),
        &TcpSessionFactory,
        &mut collector,
        Timing::default(),
        BOOT_SWITCH_DELAY,
        args.repetitions,
    );

    collector.write_summary(total_iterations);

    Ok(())
}
