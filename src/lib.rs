//! # REGFGC3 Program Manager
//!
//! This crate implements the firmware program manager for a fleet of FGC
//! power-converter controllers, and the related types for driving their
//! REGFGC3 boards through the reprogramming protocol.
//!
//! A converter hosts several boards in numbered slots, and each board hosts
//! several named sub-devices. The manager watches the fleet status feed,
//! compares each converter's detected board/device inventory against the
//! expected inventory read from a backing store, and drives every mismatch
//! through the multi-step reprogramming protocol: transfer the firmware
//! image, flash it, and return the board to production boot.
//!
//! The pieces compose bottom-up:
//!
//! * [slot_info] parses the `REGFGC3.SLOT_INFO` reply into a board map,
//! * [firmware] loads and validates firmware images and their names,
//! * [fsm] shadows the remote programming FSM for a single device,
//! * [programmer] wraps the FSM in the 3-attempt retry envelope,
//! * [adapter] serves the expected inventory (filesystem or database),
//! * [worker] schedules reconciliation jobs per area with deduplication,
//! * [server] is the daemon control loop tying all of the above together.
//!
//! Converters are reached through the [session::FgcSession] trait; any
//! request/reply transport that can get and set named properties can be
//! plugged in.

/// Expected-inventory adapters (filesystem and database)
pub mod adapter;
/// Commissioning batch loop and its summary collector
pub mod commissioning;
/// Daemon configuration file
pub mod config;
/// Library error types
pub mod error;
/// Firmware image loading and file-name convention
pub mod firmware;
/// The reprogramming protocol state machine
pub mod fsm;
/// Logging convenience helpers
pub mod logging;
/// Single-device programming entry points and checks
pub mod programmer;
/// Per-converter reconciliation job
pub mod reconcile;
/// Program manager server loop, directory and status feed
pub mod server;
/// Converter RPC session traits and the TCP client
pub mod session;
/// `SLOT_INFO` parsing and the detected-inventory model
pub mod slot_info;
/// Area worker pools
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

pub use adapter::*;
pub use commissioning::*;
pub use config::*;
pub use error::*;
pub use firmware::*;
pub use fsm::*;
pub use logging::*;
pub use programmer::*;
pub use reconcile::*;
pub use server::*;
pub use session::*;
pub use slot_info::*;
pub use worker::*;

pub use crate::error::{Error, ErrorKind, Result};

/// Hex characters per firmware word as sent over the wire.
pub const CHARS_PER_WORD: usize = 8;
/// Bytes per firmware word.
pub const WORD_SIZE_BYTES: usize = 4;
/// Upper bound on a firmware image, in bytes.
pub const FW_FILE_LIMIT_BYTES: u64 = 4_194_304;
/// Maximum number of words in a single gateway command.
pub const LIMIT_GW_CMD_WORDS: usize = 66_100;
