//! Single-device reprogramming tool.
//!
//! Validates the operator's request against what the converter reports,
//! asks for confirmation, and runs the retry envelope on one device.
//!
//! Exit codes: 0 on success (or nothing to do), 1 when the board or device
//! is not found, 2 on validation failure or when the maximum number of
//! programming attempts is reached.

use std::{io::BufRead, path::PathBuf, process};

use clap::Parser;
use log::{error, info, warn};

use regfgc3_pm::{
    firmware::FirmwareName,
    fsm::{ProgramRequest, Timing},
    logging::{self, LogLevel},
    programmer::{
        detected_identity, program, run_security_checks, CheckOutcome, MAX_PROGRAM_ATTEMPTS,
    },
    session::{FgcSession, TcpSession, TcpSessionFactory},
    ErrorKind,
};

#[derive(Parser, Debug)]
#[command(
    name = "regfgc3_programmer",
    version,
    about = "Reprogram one device on a REGFGC3 board"
)]
struct Args {
    /// Increase output verbosity.
    #[arg(short = 'v', long = "verbosity", action = clap::ArgAction::Count)]
    verbosity: u8,

    /// Upgrade FW even if the variant on the board differs from the input
    /// argument.
    #[arg(short = 'l', long = "loose")]
    loose: bool,

    converter: String,
    slot: String,
    board: String,
    device: String,
    variant: String,
    var_revision: String,
    api_revision: String,
    fw_file_loc: PathBuf,
}

fn main() {
    let args = Args::parse();
    logging::init(LogLevel::from_verbosity(args.verbosity));

    process::exit(run(&args));
}

fn run(args: &Args) -> i32 {
    let mut session = match TcpSession::connect(args.converter.as_str()) {
        Ok(session) => session,
        Err(e) => {
            error!("{e}");
            return 2;
        }
    };

    let detected = match detected_identity(&mut session, args.slot.as_str(), args.device.as_str())
    {
        Ok(detected) => detected,
        Err(e) => {
            error!("{e}");
            return match e.kind() {
                ErrorKind::NotFound => 1,
                _ => 2,
            };
        }
    };

    let bin_crc = match FirmwareName::parse_path(args.fw_file_loc.as_path()) {
        Ok(name) => name.crc,
        Err(e) => {
            error!("{e}");
            return 2;
        }
    };

    let request = ProgramRequest {
        converter: args.converter.clone(),
        slot: args.slot.clone(),
        board: args.board.clone(),
        device: args.device.clone(),
        variant: args.variant.clone(),
        var_revision: args.var_revision.clone(),
        api_revision: args.api_revision.clone(),
        bin_crc,
        fw_file_path: args.fw_file_loc.clone(),
    };

    info!("running security checks");
    match run_security_checks(&request, &detected, args.loose) {
        Ok(CheckOutcome::Proceed) => {}
        Ok(CheckOutcome::NothingToDo) => return 0,
        Err(e) => {
            error!("{e}");
            return 2;
        }
    }

    warn!(
        "DEVICE: {} from BOARD: {} (slot {}) in CONVERTER {} will be programmed",
        detected.device, detected.board, args.slot, args.converter
    );
    warn!(
        "{:<13}: {:<13} ---> {:<13}: {}",
        "VARIANT(old)", detected.variant, "VARIANT(new)", args.variant
    );
    warn!(
        "{:<13}: {:<13} ---> {:<13}: {}",
        "REVISION(old)", detected.var_rev, "REVISION(new)", args.var_revision
    );
    warn!("{:<13}: {}", "Binary file", args.fw_file_loc.display());
    warn!("PROCEED? [Y/n]");

    let mut confirmation = String::new();
    if std::io::stdin().lock().read_line(&mut confirmation).is_err() {
        info!("action cancelled, exiting");
        return 0;
    }

    match confirmation.trim() {
        "Y" => {}
        "n" | "N" => {
            info!("action cancelled by user, exiting");
            return 0;
        }
        _ => {
            warn!("unknown option, exiting");
            return 2;
        }
    }

    if let Err(e) = session.disconnect() {
        warn!("could not close connection to {}: {e}", args.converter);
    }

    let attempts = program(&request, &TcpSessionFactory, Timing::default());
    if attempts >= MAX_PROGRAM_ATTEMPTS {
        error!(
            "maximum attempts to reprogram {} reached: board {}, device {}",
            args.converter, args.board, args.device
        );
        return 2;
    }

    0
}
