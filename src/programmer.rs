use log::{error, info, warn};

use crate::{
    firmware::FirmwareName,
    fsm::{ProgramFsm, ProgramRequest, Timing},
    session::{props, FgcSession, SessionFactory},
    slot_info::{is_in_download_boot, parse_slot_info},
    Error, Result,
};

/// Devices a board may expose.
pub const DEVICES: [&str; 6] = ["DB", "MF", "DEVICE_2", "DEVICE_3", "DEVICE_4", "DEVICE_5"];

/// Attempts the retry envelope makes before giving up.
pub const MAX_PROGRAM_ATTEMPTS: u32 = 3;

/// Gets whether `device` is one of the known device names.
pub fn is_known_device(device: &str) -> bool {
    DEVICES.contains(&device)
}

/// Reprograms one `(converter, slot, board, device)` with up to
/// [MAX_PROGRAM_ATTEMPTS] attempts, each on a fresh FSM and session.
///
/// Returns the zero-based attempt index that succeeded, or
/// [MAX_PROGRAM_ATTEMPTS] on exhaustion. Never raises: failures are logged,
/// exhaustion is left to the caller to classify.
pub fn program(request: &ProgramRequest, factory: &dyn SessionFactory, timing: Timing) -> u32 {
    for attempt in 0..MAX_PROGRAM_ATTEMPTS {
        let mut fsm = match ProgramFsm::connect(request.clone(), factory, timing) {
            Ok(fsm) => fsm,
            Err(e) => {
                error!(
                    "error in {} while reprogramming {} in board {} (attempt {}): {e}",
                    request.converter,
                    request.device,
                    request.board,
                    attempt + 1
                );
                continue;
            }
        };

        match fsm.process() {
            Ok(()) => {
                info!(
                    "{}: device {} on board {} successfully reprogrammed",
                    request.converter, request.device, request.board
                );
                fsm.reset();
                return attempt;
            }
            Err(e) => {
                error!(
                    "error in {} while reprogramming {} in board {} (attempt {}): {e}",
                    request.converter,
                    request.device,
                    request.board,
                    attempt + 1
                );
                fsm.reset();
            }
        }
    }

    error!(
        "{}: reached maximum programming attempts. Device {} on {} was NOT successfully reprogrammed",
        request.converter, request.device, request.board
    );

    MAX_PROGRAM_ATTEMPTS
}

/// Identity detected on the converter for one `(slot, device)`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DetectedInfo {
    pub board: String,
    pub device: String,
    pub variant: String,
    pub var_rev: String,
    pub api_rev: String,
}

/// Reads `SLOT_INFO` and extracts the identity of `device` in `slot`.
///
/// Fails with `NotFound` when the slot is empty, the board is not running
/// in DownloadBoot, or the board does not expose the device.
pub fn detected_identity(
    session: &mut dyn FgcSession,
    slot: &str,
    device: &str,
) -> Result<DetectedInfo> {
    let reply = session.get(props::SLOT_INFO)?;
    let boards = parse_slot_info(reply.value.as_str())?;

    let board = boards
        .get(slot)
        .ok_or_else(|| Error::not_found(format!("board not found in slot {slot}")))?;

    if !is_in_download_boot(board) {
        return Err(Error::not_found(format!(
            "board {} is not running in DownloadBoot",
            board.board
        )));
    }

    let dev = board.devices.get(device).ok_or_else(|| {
        Error::not_found(format!(
            "device {device} not found in slot {slot}, board {}",
            board.board
        ))
    })?;

    Ok(DetectedInfo {
        board: board.board.clone(),
        device: dev.device.clone(),
        variant: dev.variant.clone(),
        var_rev: dev.var_rev.clone(),
        api_rev: dev.api_rev.clone(),
    })
}

/// Outcome of the pre-programming checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Everything validated, programming may proceed.
    Proceed,
    /// Detected revision already matches the request.
    NothingToDo,
}

/// Validates a command-line request against the detected identity and the
/// firmware file name.
///
/// With `loose`, a variant mismatch is downgraded to a warning and the
/// nothing-to-do short circuit is skipped.
pub fn run_security_checks(
    request: &ProgramRequest,
    detected: &DetectedInfo,
    loose: bool,
) -> Result<CheckOutcome> {
    if !is_known_device(request.device.as_str()) {
        return Err(Error::inconsistent(format!(
            "device {} is not a valid device, possible values are {}",
            request.device,
            DEVICES.join(",")
        )));
    }

    if request.board != detected.board {
        return Err(Error::inconsistent(format!(
            "input board {} is different than fgc board {}, board programming NOT ALLOWED",
            request.board, detected.board
        )));
    }

    if request.device != detected.device {
        return Err(Error::inconsistent(format!(
            "input device {} is different than fgc device {}, board programming NOT ALLOWED",
            request.device, detected.device
        )));
    }

    if request.variant != detected.variant {
        let variant_msg = format!(
            "input variant {} is different than fgc variant {}",
            request.variant, detected.variant
        );

        if loose {
            warn!("{variant_msg}");
        } else {
            return Err(Error::inconsistent(format!(
                "{variant_msg}, board programming NOT ALLOWED"
            )));
        }
    }

    info!("input arguments successfully validated");

    // The file must exist and its name must agree with the request.
    crate::firmware::FirmwareFile::open(request.fw_file_path.as_path())?;
    let name = FirmwareName::parse_path(request.fw_file_path.as_path())?;
    name.check_consistency(
        request.device.as_str(),
        request.variant.as_str(),
        request.var_revision.as_str(),
    )?;

    info!("file naming consistency successfully validated");

    if !loose && request.var_revision == detected.var_rev {
        info!(
            "nothing to do: input var_revision {} = fgc var_revision {}",
            request.var_revision, detected.var_rev
        );
        return Ok(CheckOutcome::NothingToDo);
    }

    Ok(CheckOutcome::Proceed)
}
