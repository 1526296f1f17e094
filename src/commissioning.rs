use std::{
    collections::{BTreeMap, HashMap},
    fmt, fs,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use log::{error, info};

use crate::{
    fsm::{ProgramRequest, Timing},
    programmer::program,
    session::{props, FgcSession, SessionFactory},
    slot_info::{is_in_download_boot, parse_slot_info},
    Error, Result,
};

/// Attempts made to switch a board's boot mode.
pub const MAX_ATTEMPTS_SWITCH: u32 = 3;

/// Delay for a boot-mode switch to take effect on the board.
pub const BOOT_SWITCH_DELAY: Duration = Duration::from_secs(10);

/// Boot mode a board can be commanded into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootMode {
    Download,
    Production,
}

impl From<BootMode> for &'static str {
    fn from(mode: BootMode) -> Self {
        match mode {
            BootMode::Download => "DownloadBoot",
            BootMode::Production => "ProductionBoot",
        }
    }
}

impl fmt::Display for BootMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", <&'static str>::from(*self))
    }
}

/// Outcome counters for one `(converter, board, device)` target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProgrammingSummary {
    pub to_pb_fail: u32,
    pub to_db_fail: u32,
    pub reprog_fail: u32,
    pub reprog_1st: u32,
    pub reprog_2nd: u32,
    pub reprog_3rd: u32,
}

impl fmt::Display for ProgrammingSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "to production boot failures: {}; to download boot failures: {}; \
             reprog failures: {}; reprog success_1st: {}; reprog success_2nd: {}; \
             reprog success_3rd: {}",
            self.to_pb_fail,
            self.to_db_fail,
            self.reprog_fail,
            self.reprog_1st,
            self.reprog_2nd,
            self.reprog_3rd
        )
    }
}

/// Collects per-target outcomes for the commissioning report.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SummaryCollector {
    entries: BTreeMap<(String, String, String), ProgrammingSummary>,
}

impl SummaryCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(
        &mut self,
        converter: &str,
        board: &str,
        device: &str,
    ) -> &mut ProgrammingSummary {
        self.entries
            .entry((
                converter.to_string(),
                board.to_string(),
                device.to_string(),
            ))
            .or_default()
    }

    /// Records the return of the retry envelope for a target.
    pub fn record_attempts(&mut self, converter: &str, board: &str, device: &str, attempts: u32) {
        let summary = self.entry(converter, board, device);

        match attempts {
            0 => summary.reprog_1st += 1,
            1 => summary.reprog_2nd += 1,
            2 => summary.reprog_3rd += 1,
            _ => summary.reprog_fail += 1,
        }
    }

    /// Records a failed boot-mode switch for a target.
    pub fn record_switch_failure(
        &mut self,
        converter: &str,
        board: &str,
        device: &str,
        mode: BootMode,
    ) {
        let summary = self.entry(converter, board, device);

        match mode {
            BootMode::Download => summary.to_db_fail += 1,
            BootMode::Production => summary.to_pb_fail += 1,
        }
    }

    /// Gets the summary recorded for a target, if any.
    pub fn summary(
        &self,
        converter: &str,
        board: &str,
        device: &str,
    ) -> Option<&ProgrammingSummary> {
        self.entries.get(&(
            converter.to_string(),
            board.to_string(),
            device.to_string(),
        ))
    }

    /// Logs the full report.
    pub fn write_summary(&self, total_iterations: u32) {
        info!("SUMMARY");
        info!("TOTAL iterations: {total_iterations}");

        for ((converter, board, device), summary) in &self.entries {
            info!("converter: {converter}, board {board}, device {device}: {summary}");
        }
    }
}

/// One row of the commissioning batch file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProgTask {
    pub converter: String,
    pub slot: String,
    pub board: String,
    pub device: String,
    pub variant: String,
    pub var_rev: String,
    pub api_rev: String,
    pub bin_crc: String,
    pub fw_file_loc: PathBuf,
}

impl ProgTask {
    fn request(&self) -> ProgramRequest {
        ProgramRequest {
            converter: self.converter.clone(),
            slot: self.slot.clone(),
            board: self.board.clone(),
            device: self.device.clone(),
            variant: self.variant.clone(),
            var_revision: self.var_rev.clone(),
            api_revision: self.api_rev.clone(),
            bin_crc: self.bin_crc.clone(),
            fw_file_path: self.fw_file_loc.clone(),
        }
    }
}

/// Reads the commissioning batch file.
///
/// Lines are `converter,slot,board,device,variant,var_rev,api_rev,bin_crc,
/// fw_file_loc`; blank lines and `#` comments are ignored.
pub fn read_programming_data(path: &Path) -> Result<Vec<ProgTask>> {
    let contents = fs::read_to_string(path)
        .map_err(|_| Error::not_found(format!("programming data file {} not found", path.display())))?;

    let mut tasks = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let [converter, slot, board, device, variant, var_rev, api_rev, bin_crc, fw_file_loc] =
            fields.as_slice()
        else {
            return Err(Error::parse(format!(
                "{}:{}: expected 9 comma-separated fields, got {}",
                path.display(),
                lineno + 1,
                fields.len()
            )));
        };

        tasks.push(ProgTask {
            converter: converter.to_string(),
            slot: slot.to_string(),
            board: board.to_string(),
            device: device.to_string(),
            variant: variant.to_string(),
            var_rev: var_rev.to_string(),
            api_rev: api_rev.to_string(),
            bin_crc: bin_crc.to_string(),
            fw_file_loc: PathBuf::from(fw_file_loc),
        });
    }

    Ok(tasks)
}

fn board_in_mode(session: &mut dyn FgcSession, slot: &str, mode: BootMode) -> Result<bool> {
    let reply = session.get(props::SLOT_INFO)?;
    let boards = parse_slot_info(reply.value.as_str())?;

    let board = boards
        .get(slot)
        .ok_or_else(|| Error::not_found(format!("board not found in slot {slot}")))?;

    Ok(match mode {
        BootMode::Download => is_in_download_boot(board),
        BootMode::Production => !is_in_download_boot(board),
    })
}

/// Switches the board in `slot` into `mode`, retrying up to
/// [MAX_ATTEMPTS_SWITCH] times.
///
/// Each attempt commands the switch, waits `switch_delay` for the board to
/// come back, clears the cached `SLOT_INFO` and re-reads it.
pub fn switch_board_boot(
    session: &mut dyn FgcSession,
    converter: &str,
    slot: &str,
    mode: BootMode,
    switch_delay: Duration,
) -> Result<()> {
    if board_in_mode(session, slot, mode)? {
        info!("board in slot {slot} of converter {converter} already in boot mode {mode}");
        return Ok(());
    }

    for attempt in 0..MAX_ATTEMPTS_SWITCH {
        session.set(props::PROG_SLOT, slot)?;
        session.set(props::DEBUG_ACTION, "SWITCH")?;

        info!("waiting for board in slot {slot} to switch to {mode}");
        thread::sleep(switch_delay);

        session.set(props::SLOT_INFO, "")?;

        if board_in_mode(session, slot, mode)? {
            info!(
                "board in slot {slot} of converter {converter} switched to {mode}, attempt {attempt}"
            );
            return Ok(());
        }
    }

    Err(Error::rpc(format!(
        "board in slot {slot} of converter {converter} did not switch to {mode} after {MAX_ATTEMPTS_SWITCH} attempts"
    )))
}

/// Runs the commissioning batch: for `repetitions` rounds, switches each
/// target board into DownloadBoot, reprograms it, and returns a slot's
/// boards to ProductionBoot once all of the slot's tasks are done.
///
/// Returns the number of completed rounds.
pub fn program_loop(
    tasks: &[ProgTask],
    sessions: &dyn SessionFactory,
    collector: &mut SummaryCollector,
    timing: Timing,
    switch_delay: Duration,
    repetitions: u32,
) -> u32 {
    let mut quota: HashMap<(String, String), u32> = HashMap::new();
    for task in tasks {
        *quota
            .entry((task.converter.clone(), task.slot.clone()))
            .or_default() += 1;
    }

    let mut total_iterations = 0;

    for iteration in 0..repetitions {
        info!("programming loop iteration {iteration}");
        let mut done: HashMap<(String, String), u32> = HashMap::new();

        for task in tasks {
            info!(
                "target: board {}, device {}, file {}",
                task.board,
                task.device,
                task.fw_file_loc.display()
            );

            let mut session = match sessions.connect(task.converter.as_str()) {
                Ok(session) => session,
                Err(e) => {
                    error!("{e}");
                    collector.record_switch_failure(
                        task.converter.as_str(),
                        task.board.as_str(),
                        task.device.as_str(),
                        BootMode::Download,
                    );
                    continue;
                }
            };

            if let Err(e) = switch_board_boot(
                session.as_mut(),
                task.converter.as_str(),
                task.slot.as_str(),
                BootMode::Download,
                switch_delay,
            ) {
                error!("{e}");
                collector.record_switch_failure(
                    task.converter.as_str(),
                    task.board.as_str(),
                    task.device.as_str(),
                    BootMode::Download,
                );
                let _ = session.disconnect();
                continue;
            }

            let attempts = program(&task.request(), sessions, timing);
            collector.record_attempts(
                task.converter.as_str(),
                task.board.as_str(),
                task.device.as_str(),
                attempts,
            );

            let key = (task.converter.clone(), task.slot.clone());
            *done.entry(key.clone()).or_default() += 1;

            if done.get(&key) == quota.get(&key) {
                info!("all tasks done for slot {}, board {}", task.slot, task.board);

                if let Err(e) = switch_board_boot(
                    session.as_mut(),
                    task.converter.as_str(),
                    task.slot.as_str(),
                    BootMode::Production,
                    switch_delay,
                ) {
                    error!("{e}");
                    collector.record_switch_failure(
                        task.converter.as_str(),
                        task.board.as_str(),
                        task.device.as_str(),
                        BootMode::Production,
                    );
                }
            }

            let _ = session.disconnect();
        }

        total_iterations += 1;
    }

    total_iterations
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::programmer::MAX_PROGRAM_ATTEMPTS;
    use crate::test_support::MockSession;

    const DOWNLOAD_BOOT: &str = "------,SLOT 5,BOARD VS_STATE_CTRL,STATE DownloadBoot,\
                                 Device DB,Variant DOWNLDBOOT_3,Var_Rev 208,API_Rev 200,,";

    const PRODUCTION_BOOT: &str = "------,SLOT 5,BOARD VS_STATE_CTRL,STATE ProductionBoot,\
                                   Device MF,Variant VSFW_4,Var_Rev 21,API_Rev 1,,";

    #[test]
    fn test_summary_collector_counters() {
        let mut collector = SummaryCollector::new();

        collector.record_attempts("C", "B", "D", 0);
        collector.record_attempts("C", "B", "D", 1);
        collector.record_attempts("C", "B", "D", 2);
        collector.record_attempts("C", "B", "D", MAX_PROGRAM_ATTEMPTS);
        collector.record_switch_failure("C", "B", "D", BootMode::Download);
        collector.record_switch_failure("C", "B", "D", BootMode::Production);

        let summary = collector.summary("C", "B", "D").unwrap();
        assert_eq!(summary.reprog_1st, 1);
        assert_eq!(summary.reprog_2nd, 1);
        assert_eq!(summary.reprog_3rd, 1);
        assert_eq!(summary.reprog_fail, 1);
        assert_eq!(summary.to_db_fail, 1);
        assert_eq!(summary.to_pb_fail, 1);
    }

    #[test]
    fn test_read_programming_data() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("prog_data.csv");
        fs::write(
            &path,
            "# converter,slot,board,device,variant,var_rev,api_rev,bin_crc,fw_file_loc\n\
             RPAGM.866.21.ETH1,5,VS_STATE_CTRL,MF,VSFW_4,22,1,ABCD,fw/EDA_02173-MF-VSFW_4-22-1-ABCD.bin\n",
        )?;

        let tasks = read_programming_data(&path)?;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].converter, "RPAGM.866.21.ETH1");
        assert_eq!(tasks[0].bin_crc, "ABCD");

        Ok(())
    }

    #[test]
    fn test_read_programming_data_rejects_short_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prog_data.csv");
        fs::write(&path, "RPAGM.866.21.ETH1,5,VS_STATE_CTRL\n").unwrap();

        let err = read_programming_data(&path).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Parse);
    }

    #[test]
    fn test_switch_is_a_no_op_when_already_in_mode() -> Result<()> {
        let mut session = MockSession::new().with_reply(props::SLOT_INFO, DOWNLOAD_BOOT);
        let log = session.log();

        switch_board_boot(
            &mut session,
            "RPAGM.866.21.ETH1",
            "5",
            BootMode::Download,
            Duration::from_millis(1),
        )?;

        // Only the initial SLOT_INFO read; no switch commands.
        assert_eq!(log.lock().len(), 1);

        Ok(())
    }

    #[test]
    fn test_switch_retries_until_exhausted() {
        // The board stays in ProductionBoot forever.
        let mut session = MockSession::new().with_reply(props::SLOT_INFO, PRODUCTION_BOOT);
        let log = session.log();

        let err = switch_board_boot(
            &mut session,
            "RPAGM.866.21.ETH1",
            "5",
            BootMode::Download,
            Duration::from_millis(1),
        )
        .unwrap_err();

        assert_eq!(err.kind(), crate::ErrorKind::Rpc);

        // Three switch commands were issued.
        let switches = log
            .lock()
            .iter()
            .filter(|op| {
                matches!(
                    op,
                    crate::test_support::Op::Set(prop, value)
                        if prop == props::DEBUG_ACTION && value == "SWITCH"
                )
            })
            .count();
        assert_eq!(switches, MAX_ATTEMPTS_SWITCH as usize);
    }

    #[test]
    fn test_switch_to_production_from_production_is_satisfied() -> Result<()> {
        let mut session = MockSession::new().with_reply(props::SLOT_INFO, PRODUCTION_BOOT);

        switch_board_boot(
            &mut session,
            "RPAGM.866.21.ETH1",
            "5",
            BootMode::Production,
            Duration::from_millis(1),
        )
    }
}
