use std::{path::PathBuf, sync::Arc};

use log::{info, warn};

use crate::{
    adapter::{Adapter, ExpectedInventory},
    firmware::find_firmware,
    fsm::{ProgramRequest, Timing},
    programmer::program,
    session::{props, FgcSession, SessionFactory},
    slot_info::{is_in_download_boot, parse_slot_info, Device, SlotInventory},
    Result,
};

/// Shared context for reconciliation jobs: how to reach converters, where
/// firmware images live, and how to pace the protocol.
pub struct ReconcileCtx {
    pub sessions: Arc<dyn SessionFactory>,
    pub fw_files: PathBuf,
    pub timing: Timing,
}

/// One `(slot, device)` whose detected firmware differs from the expected
/// identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Difference {
    pub slot: String,
    pub board: String,
    /// Expected identity the device should be brought to.
    pub expected: Device,
}

/// Computes the `(slot, device)` pairs present in both inventories whose
/// `(variant, var_rev)` differ.
///
/// Expected entries with no detected counterpart cannot be programmed and
/// are logged and skipped.
pub fn expected_detected_differences(
    converter: &str,
    expected: &ExpectedInventory,
    detected: &SlotInventory,
) -> Vec<Difference> {
    let mut differences = Vec::new();

    for (slot, expected_board) in expected {
        let Some(board) = detected.get(slot) else {
            warn!("{converter}: expected board {} in slot {slot} was not detected", expected_board.board);
            continue;
        };

        for (name, expected_device) in &expected_board.devices {
            let Some(device) = board.devices.get(name) else {
                warn!("{converter}: expected device {name} in slot {slot} was not detected");
                continue;
            };

            if device.variant != expected_device.variant
                || device.var_rev != expected_device.var_rev
            {
                differences.push(Difference {
                    slot: slot.clone(),
                    board: board.board.clone(),
                    expected: expected_device.clone(),
                });
            }
        }
    }

    differences
}

/// Reconciles one converter against its expected inventory.
///
/// Fetches the expected record, reads and parses `SLOT_INFO`, and runs the
/// retry envelope for every differing device on a board in DownloadBoot.
/// Boards in any other boot mode need the operator switch tool and are
/// skipped.
pub fn reconcile(converter: &str, adapter: &dyn Adapter, ctx: &ReconcileCtx) -> Result<()> {
    info!("getting expected data for {converter}");

    let expected = match adapter.get_expected(converter)? {
        Some(expected) => expected,
        None => {
            info!("nothing to do for {converter}: expected data unchanged");
            return Ok(());
        }
    };

    info!("getting detected data for {converter}");
    let mut session = ctx.sessions.connect(converter)?;

    let result = reconcile_with_session(converter, &expected, session.as_mut(), adapter, ctx);

    if let Err(e) = session.disconnect() {
        warn!("could not close connection to {converter}: {e}");
    }

    result
}

fn reconcile_with_session(
    converter: &str,
    expected: &ExpectedInventory,
    session: &mut dyn FgcSession,
    adapter: &dyn Adapter,
    ctx: &ReconcileCtx,
) -> Result<()> {
    let reply = session.get(props::SLOT_INFO)?;
    let detected = parse_slot_info(reply.value.as_str())?;

    if let Err(e) = adapter.record_detected(converter, &detected) {
        warn!("could not record detected data for {converter}: {e}");
    }

    let differences = expected_detected_differences(converter, expected, &detected);
    if differences.is_empty() {
        info!("nothing to do for {converter}: expected data == detected data");
        return Ok(());
    }

    for diff in differences {
        let board = &detected[&diff.slot];

        if !is_in_download_boot(board) {
            warn!(
                "{converter}: board {} in slot {} is not in DownloadBoot, operator switch required",
                board.board, diff.slot
            );
            continue;
        }

        let (fw_file_path, fw_name) = match find_firmware(
            ctx.fw_files.as_path(),
            diff.expected.device.as_str(),
            diff.expected.variant.as_str(),
            diff.expected.var_rev.as_str(),
            diff.expected.api_rev.as_str(),
        ) {
            Ok(found) => found,
            Err(e) => {
                warn!(
                    "{converter}: no firmware for device {} in slot {}: {e}",
                    diff.expected.device, diff.slot
                );
                continue;
            }
        };

        let request = ProgramRequest {
            converter: converter.to_string(),
            slot: diff.slot.clone(),
            board: diff.board.clone(),
            device: diff.expected.device.clone(),
            variant: diff.expected.variant.clone(),
            var_revision: diff.expected.var_rev.clone(),
            api_revision: diff.expected.api_rev.clone(),
            bin_crc: fw_name.crc.clone(),
            fw_file_path,
        };

        program(&request, ctx.sessions.as_ref(), ctx.timing);
    }

    Ok(())
}
