use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Board state in which reprogramming is permitted.
pub const STATE_DOWNLOAD_BOOT: &str = "DownloadBoot";
/// Board state after a return to production.
pub const STATE_PRODUCTION_BOOT: &str = "ProductionBoot";
/// Download-boot loader device present on every reprogrammable board.
pub const DB_DEVICE: &str = "DB";
/// Loader variant required for reprogramming.
pub const DOWNLOAD_BOOT_VARIANT: &str = "DOWNLDBOOT_3";

/// Slot-boundary marker token in a `SLOT_INFO` reply.
const SLOT_SEPARATOR: &str = "------------------------------";

/// Firmware identity of one sub-device on a board.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Device {
    pub device: String,
    pub variant: String,
    pub var_rev: String,
    pub api_rev: String,
}

/// One populated slot of a converter.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Board {
    pub slot: String,
    pub board: String,
    pub state: String,
    /// Sub-devices keyed by device name (`DB`, `MF`, `DEVICE_2`..`DEVICE_5`).
    pub devices: BTreeMap<String, Device>,
}

/// Detected inventory of a converter, keyed by slot number.
pub type SlotInventory = BTreeMap<String, Board>;

/// Gets whether `board` may be reprogrammed.
///
/// True iff the board runs in `DownloadBoot` and its `DB` device reports the
/// `DOWNLDBOOT_3` loader variant.
pub fn is_in_download_boot(board: &Board) -> bool {
    if board.state != STATE_DOWNLOAD_BOOT {
        return false;
    }

    match board.devices.get(DB_DEVICE) {
        Some(db) => db.variant == DOWNLOAD_BOOT_VARIANT,
        None => false,
    }
}

/// Splits a `KEY value` token, trimming surrounding whitespace.
fn split_pair<'a>(token: &'a str, index: usize) -> Result<(&'a str, &'a str)> {
    let mut parts = token.split_whitespace();

    match (parts.next(), parts.next(), parts.next()) {
        (Some(key), Some(value), None) => Ok((key, value)),
        _ => Err(Error::parse_at(
            index,
            format!("expected `KEY value`, got {token:?}"),
        )),
    }
}

/// Splits a `KEY value` token and checks the key.
fn expect_pair<'a>(token: &'a str, index: usize, key: &str) -> Result<&'a str> {
    let (k, value) = split_pair(token, index)?;

    if k != key {
        return Err(Error::parse_at(
            index,
            format!("expected key {key}, got {k:?}"),
        ));
    }

    Ok(value)
}

/// Parses one device block (`Device`, `Variant`, `Var_Rev`, `API_Rev`).
fn parse_device(tokens: &[(usize, &str)]) -> Result<Device> {
    let last = tokens
        .last()
        .map(|(i, _)| *i)
        .unwrap_or_default();

    if tokens.len() != 4 {
        return Err(Error::parse_at(
            last,
            format!("device block has {} tokens, expected 4", tokens.len()),
        ));
    }

    Ok(Device {
        device: expect_pair(tokens[0].1, tokens[0].0, "Device")?.to_string(),
        variant: expect_pair(tokens[1].1, tokens[1].0, "Variant")?.to_string(),
        var_rev: expect_pair(tokens[2].1, tokens[2].0, "Var_Rev")?.to_string(),
        api_rev: expect_pair(tokens[3].1, tokens[3].0, "API_Rev")?.to_string(),
    })
}

/// Parses one slot block (`SLOT`, `BOARD`, `STATE`, device blocks).
fn parse_single_slot(tokens: &[(usize, &str)]) -> Result<Board> {
    let first = tokens.first().map(|(i, _)| *i).unwrap_or_default();

    if tokens.len() < 3 {
        return Err(Error::parse_at(first, "truncated slot block"));
    }

    let slot = expect_pair(tokens[0].1, tokens[0].0, "SLOT")?.to_string();
    let board = expect_pair(tokens[1].1, tokens[1].0, "BOARD")?.to_string();
    let state = expect_pair(tokens[2].1, tokens[2].0, "STATE")?.to_string();

    let body = &tokens[3..];
    let mut starts: Vec<usize> = body
        .iter()
        .enumerate()
        .filter(|(_, (_, t))| t.trim_start().starts_with("Device"))
        .map(|(pos, _)| pos)
        .collect();
    starts.push(body.len());

    if let Some(&(index, token)) = body.first() {
        if starts.first() != Some(&0) {
            return Err(Error::parse_at(
                index,
                format!("expected Device block, got {token:?}"),
            ));
        }
    }

    let mut devices = BTreeMap::new();
    for pair in starts.windows(2) {
        let device = parse_device(&body[pair[0]..pair[1]])?;
        devices.insert(device.device.clone(), device);
    }

    Ok(Board {
        slot,
        board,
        state,
        devices,
    })
}

/// Parses the value of the `REGFGC3.SLOT_INFO` property.
///
/// Tokens are comma-separated; a dash run marks a slot boundary; empty
/// tokens are ignored. Fails with a parse error naming the offending token
/// index on malformed input.
pub fn parse_slot_info(reply: &str) -> Result<SlotInventory> {
    // Keep original token indices for error reporting; separators and empty
    // tokens carry no data.
    let tokens: Vec<(usize, &str)> = reply
        .split(',')
        .enumerate()
        .filter(|(_, t)| {
            let t = t.trim();
            !t.is_empty() && !t.starts_with('-')
        })
        .collect();

    let mut starts: Vec<usize> = tokens
        .iter()
        .enumerate()
        .filter(|(_, (_, t))| t.trim_start().starts_with("SLOT"))
        .map(|(pos, _)| pos)
        .collect();
    starts.push(tokens.len());

    if let Some(&(index, token)) = tokens.first() {
        if starts.first() != Some(&0) {
            return Err(Error::parse_at(
                index,
                format!("expected SLOT block, got {token:?}"),
            ));
        }
    }

    let mut boards = SlotInventory::new();
    for pair in starts.windows(2) {
        let board = parse_single_slot(&tokens[pair[0]..pair[1]])?;
        boards.insert(board.slot.clone(), board);
    }

    Ok(boards)
}

/// Renders an inventory back into the comma-delimited `SLOT_INFO` form.
///
/// `parse_slot_info(render_slot_info(inv))` equals `inv` modulo separator
/// normalization and whitespace.
pub fn render_slot_info(inventory: &SlotInventory) -> String {
    let mut tokens = Vec::new();

    for board in inventory.values() {
        tokens.push(SLOT_SEPARATOR.to_string());
        tokens.push(format!("SLOT       {}", board.slot));
        tokens.push(format!("BOARD       {}", board.board));
        tokens.push(format!("STATE      {}", board.state));

        for device in board.devices.values() {
            tokens.push(format!("Device     {}", device.device));
            tokens.push(format!("Variant    {}", device.variant));
            tokens.push(format!("Var_Rev    {}", device.var_rev));
            tokens.push(format!("API_Rev    {}", device.api_rev));
            tokens.push(String::new());
        }
    }

    tokens.join(",")
}
