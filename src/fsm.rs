use std::{fmt, path::PathBuf, thread, time::Duration};

use log::{debug, error, info};

use crate::{
    firmware::FirmwareFile,
    session::{props, FgcSession, SessionFactory},
    Error, Result, LIMIT_GW_CMD_WORDS,
};

/// Local shadow of the remote program-manager FSM states.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsmState {
    Uninitialized,
    Waiting,
    Transferring,
    Transferred,
    GetProgInfo,
    Programming,
    ProgCheck,
    Programmed,
    SetPbPars,
    ToProdBoot,
    CleanUp,
    Error,
}

impl FsmState {
    /// Gets the wire name reported by `REGFGC3.PROG.FSM.STATE`.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::Waiting => "WAITING",
            Self::Transferring => "TRANSFERRING",
            Self::Transferred => "TRANSFERRED",
            Self::GetProgInfo => "GET_PROG_INFO",
            Self::Programming => "PROGRAMMING",
            Self::ProgCheck => "PROG_CHK",
            Self::Programmed => "PROGRAMMED",
            Self::SetPbPars => "SET_PB_PARS",
            Self::ToProdBoot => "TO_PROD_BOOT",
            Self::CleanUp => "CLEAN_UP",
            Self::Error => "ERROR",
        }
    }
}

impl From<FsmState> for &'static str {
    fn from(state: FsmState) -> Self {
        state.as_str()
    }
}

impl fmt::Display for FsmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Target modes the remote FSM can be commanded to.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Waiting,
    Transferred,
    Programmed,
    SetPbPars,
    ToProdBoot,
    CleanUp,
}

impl Mode {
    /// Gets the wire name written to `REGFGC3.PROG.FSM.MODE`.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Transferred => "TRANSFERRED",
            Self::Programmed => "PROGRAMMED",
            Self::SetPbPars => "SET_PB_PARS",
            Self::ToProdBoot => "TO_PROD_BOOT",
            Self::CleanUp => "CLEAN_UP",
        }
    }
}

impl From<Mode> for &'static str {
    fn from(mode: Mode) -> Self {
        mode.as_str()
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Number of distinct modes in a full reprogramming walk.
pub const MODE_WALK_LEN: usize = 6;

/// Mode commanded from a given state, and the interim states the local FSM
/// runs through while the remote works towards it.
///
/// States with no outgoing mode (the interim states themselves) map to
/// `None`.
pub const fn transition(state: FsmState) -> Option<(Mode, &'static [FsmState])> {
    match state {
        FsmState::Uninitialized => Some((Mode::Waiting, &[FsmState::Waiting])),
        FsmState::Waiting => Some((
            Mode::Transferred,
            &[FsmState::Transferring, FsmState::Transferred],
        )),
        FsmState::Transferred => Some((
            Mode::Programmed,
            &[
                FsmState::GetProgInfo,
                FsmState::Programming,
                FsmState::ProgCheck,
                FsmState::Programmed,
            ],
        )),
        FsmState::Programmed => Some((Mode::SetPbPars, &[FsmState::SetPbPars])),
        FsmState::SetPbPars => Some((Mode::ToProdBoot, &[FsmState::ToProdBoot])),
        FsmState::ToProdBoot => Some((Mode::CleanUp, &[FsmState::CleanUp])),
        FsmState::CleanUp => Some((Mode::Waiting, &[FsmState::Waiting])),
        FsmState::Error => Some((Mode::CleanUp, &[FsmState::CleanUp])),
        _ => None,
    }
}

/// Everything needed to reprogram one device, immutable once the FSM is
/// instantiated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramRequest {
    pub converter: String,
    pub slot: String,
    pub board: String,
    pub device: String,
    pub variant: String,
    pub var_revision: String,
    pub api_revision: String,
    /// 16-bit image CRC as a hex token (from the firmware file name).
    pub bin_crc: String,
    pub fw_file_path: PathBuf,
}

/// Pacing of the protocol: state polling, state timeout, and the settle
/// delay after the binary upload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timing {
    pub poll_interval: Duration,
    pub state_timeout: Duration,
    pub settle_delay: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            state_timeout: Duration::from_secs(30),
            settle_delay: Duration::from_secs(5),
        }
    }
}

/// Drives one converter through the reprogramming protocol.
///
/// The local FSM shadows the remote one: each local state is an instruction
/// to drive the remote into the state of the same name.
pub struct ProgramFsm {
    request: ProgramRequest,
    session: Box<dyn FgcSession>,
    session_owned: bool,
    timing: Timing,
    state: FsmState,
    mode: Option<Mode>,
}

impl ProgramFsm {
    /// Creates an FSM over a session owned by the caller.
    pub fn with_session(
        request: ProgramRequest,
        session: Box<dyn FgcSession>,
        timing: Timing,
    ) -> Self {
        Self {
            request,
            session,
            session_owned: false,
            timing,
            state: FsmState::Uninitialized,
            mode: None,
        }
    }

    /// Creates an FSM with its own session to the request's converter.
    ///
    /// The session is closed again by [reset](Self::reset).
    pub fn connect(
        request: ProgramRequest,
        factory: &dyn SessionFactory,
        timing: Timing,
    ) -> Result<Self> {
        let session = factory.connect(request.converter.as_str())?;

        let mut fsm = Self::with_session(request, session, timing);
        fsm.session_owned = true;

        Ok(fsm)
    }

    /// Gets the current local state.
    pub fn state(&self) -> FsmState {
        self.state
    }

    /// Gets the last commanded mode, if any.
    pub fn mode(&self) -> Option<Mode> {
        self.mode
    }

    /// Gets the request this FSM was built for.
    pub fn request(&self) -> &ProgramRequest {
        &self.request
    }

    /// Runs the full reprogramming walk.
    ///
    /// Walks the modes of the transition table from `UNINITIALIZED` through
    /// `CLEAN_UP -> WAITING`. A first failure diverts the walk into `ERROR`
    /// and schedules only `CLEAN_UP`; a second failure aborts it. Whatever
    /// the outcome, one final `WAITING` transition is attempted to leave the
    /// remote in its initial state; failures there are fatal.
    pub fn process(&mut self) -> Result<()> {
        if self.state != FsmState::Uninitialized {
            return Err(Error::reprogram_failed(format!(
                "initial FSM state '{}' should be 'UNINITIALIZED'",
                self.state
            )));
        }

        let mut remaining = MODE_WALK_LEN;
        let mut error_during_reprogram = false;

        while remaining > 0 {
            // The walk only ever rests on table states.
            let mode = match transition(self.state) {
                Some((mode, _)) => mode,
                None => {
                    return Err(Error::reprogram_failed(format!(
                        "no mode reachable from state {}",
                        self.state
                    )))
                }
            };

            info!("processing mode {mode} in state {}", self.state);

            match self.process_mode(mode) {
                Ok(()) => remaining -= 1,
                Err(e) => {
                    error!("{e}");

                    if error_during_reprogram {
                        // Second failure: abort the walk.
                        remaining = 0;
                    } else {
                        // First failure: try to recover through CLEAN_UP.
                        error_during_reprogram = true;
                        self.state = FsmState::Error;
                        remaining = 1;
                    }
                }
            }
        }

        // Try to leave the remote FSM in its initial state.
        self.process_mode(Mode::Waiting)?;

        if error_during_reprogram {
            return Err(Error::reprogram_failed(
                "error during reprogramming after recovery attempt",
            ));
        }

        Ok(())
    }

    /// Restores the local FSM to `UNINITIALIZED`, closing the session if
    /// this FSM created it.
    pub fn reset(&mut self) {
        self.mode = None;
        self.state = FsmState::Uninitialized;

        if self.session_owned {
            if let Err(e) = self.session.disconnect() {
                error!("could not close connection to the FGC: {e}");
            }
        }
    }

    /// Commands `target` and runs its interim states in order.
    ///
    /// The MODE property is written once per interim state, even when the
    /// interim equals the current local state (in which case the state body
    /// is skipped).
    fn process_mode(&mut self, target: Mode) -> Result<()> {
        self.mode = Some(target);

        let interim_states = match transition(self.state) {
            Some((mode, interim)) if mode == target => interim,
            _ => {
                return Err(Error::reprogram_failed(format!(
                    "mode {target} not allowed for current state {}",
                    self.state
                )))
            }
        };

        for &next in interim_states {
            self.session.set(props::FSM_MODE, target.as_str())?;

            if self.state == next {
                continue;
            }

            self.run_state(next)?;
            self.state = next;
        }

        Ok(())
    }

    /// Runs one interim state: uploads the image first when entering
    /// `TRANSFERRING`, then polls the remote until it reports the state.
    fn run_state(&mut self, state: FsmState) -> Result<()> {
        if state == FsmState::Transferring {
            self.upload()?;
        }

        self.poll_state(state)
    }

    /// Polls `REGFGC3.PROG.FSM.STATE` until it matches `target` or the state
    /// timeout budget runs out.
    fn poll_state(&mut self, target: FsmState) -> Result<()> {
        let mut remaining = self.timing.state_timeout;

        while remaining > Duration::ZERO {
            let fgc_state = self.session.get(props::FSM_STATE)?;
            debug!("FGC PM FSM state after polling: {}", fgc_state.value);

            if fgc_state.value == target.as_str() {
                info!("FGC PM FSM state {target} processed successfully");
                return Ok(());
            }

            thread::sleep(self.timing.poll_interval);
            remaining = remaining.saturating_sub(self.timing.poll_interval);
        }

        let board_error = self.session.get(props::BOARD_ERROR)?;
        let last_state = self.session.get(props::FSM_LAST_STATE)?;

        Err(Error::Timeout {
            target: target.as_str().to_string(),
            last_state: last_state.value,
            board_error: board_error.value,
        })
    }

    /// Transfers the firmware image.
    ///
    /// Writes the programming parameters in their required order, then the
    /// word stream in `LIMIT_GW_CMD_WORDS` groups, then leaves the remote
    /// the settle delay to digest before the caller polls.
    fn upload(&mut self) -> Result<()> {
        let fw_file = FirmwareFile::open(self.request.fw_file_path.as_path())?;
        let bin_crc = u16::from_str_radix(self.request.bin_crc.as_str(), 16).map_err(|e| {
            Error::parse(format!("invalid BIN_CRC {:?}: {e}", self.request.bin_crc))
        })?;

        self.session.set(props::PROG_SLOT, &self.request.slot)?;
        self.session.set(props::PROG_DEVICE, &self.request.device)?;
        self.session
            .set(props::PROG_VARIANT, &self.request.variant)?;
        self.session
            .set(props::PROG_VARIANT_REVISION, &self.request.var_revision)?;
        self.session
            .set(props::PROG_API_REVISION, &self.request.api_revision)?;
        self.session
            .set(props::PROG_BIN_SIZE_BYTES, &fw_file.size_bytes().to_string())?;
        self.session
            .set(props::PROG_BIN_CRC, &bin_crc.to_string())?;

        let mut words = fw_file.words()?;
        let mut offset = 0usize;

        loop {
            let mut group = Vec::new();
            for word in words.by_ref().take(LIMIT_GW_CMD_WORDS) {
                group.push(word.map_err(Error::from)?);
            }

            if group.is_empty() {
                break;
            }

            self.session
                .set(&props::prog_bin(offset), &group.join(","))?;
            offset += group.len();
        }

        // Leave the FGC time to digest.
        thread::sleep(self.timing.settle_delay);

        Ok(())
    }
}

impl fmt::Display for ProgramFsm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            Some(mode) => write!(f, "<ProgramFsm: {mode}, {}>", self.state),
            None => write!(f, "<ProgramFsm: -, {}>", self.state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    use crate::test_support::{MockSession, Op, SessionLog};
    use crate::ErrorKind;

    /// Poll replies for a full successful walk, one per interim state.
    const HAPPY_WALK: &[&str] = &[
        "WAITING",
        "TRANSFERRING",
        "TRANSFERRED",
        "GET_PROG_INFO",
        "PROGRAMMING",
        "PROG_CHK",
        "PROGRAMMED",
        "SET_PB_PARS",
        "TO_PROD_BOOT",
        "CLEAN_UP",
        "WAITING",
    ];

    fn fast_timing() -> Timing {
        Timing {
            poll_interval: Duration::from_millis(1),
            state_timeout: Duration::from_millis(3),
            settle_delay: Duration::from_millis(1),
        }
    }

    fn request(fw_file_path: PathBuf) -> ProgramRequest {
        ProgramRequest {
            converter: "RPAGM.866.21.ETH1".into(),
            slot: "5".into(),
            board: "VS_STATE_CTRL".into(),
            device: "MF".into(),
            variant: "VSFW_4".into(),
            var_revision: "22".into(),
            api_revision: "1".into(),
            bin_crc: "ABCD".into(),
            fw_file_path,
        }
    }

    fn mode_sets(log: &SessionLog) -> Vec<String> {
        log.lock()
            .iter()
            .filter_map(|op| match op {
                Op::Set(prop, value) if prop == props::FSM_MODE => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_transition_table_shape() {
        let (mode, interim) = transition(FsmState::Waiting).unwrap();
        assert_eq!(mode, Mode::Transferred);
        assert_eq!(interim, &[FsmState::Transferring, FsmState::Transferred]);

        let (mode, interim) = transition(FsmState::Error).unwrap();
        assert_eq!(mode, Mode::CleanUp);
        assert_eq!(interim, &[FsmState::CleanUp]);

        assert!(transition(FsmState::Transferring).is_none());
        assert!(transition(FsmState::Programming).is_none());
    }

    #[test]
    fn test_full_walk_success() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let fw = dir.path().join("EDA_02173-MF-VSFW_4-22-1-ABCD.bin");
        fs::write(&fw, [0u8, 0, 0, 1, 0xab])?;

        let session = MockSession::new().with_states(HAPPY_WALK);
        let log = session.log();

        let mut fsm = ProgramFsm::with_session(request(fw), Box::new(session), fast_timing());
        fsm.process()?;

        assert_eq!(fsm.state(), FsmState::Waiting);
        assert_eq!(fsm.mode(), Some(Mode::Waiting));

        // One MODE write per interim state, in walk order, final WAITING
        // included.
        assert_eq!(
            mode_sets(&log),
            vec![
                "WAITING",
                "TRANSFERRED",
                "TRANSFERRED",
                "PROGRAMMED",
                "PROGRAMMED",
                "PROGRAMMED",
                "PROGRAMMED",
                "SET_PB_PARS",
                "TO_PROD_BOOT",
                "CLEAN_UP",
                "WAITING",
            ]
        );

        Ok(())
    }

    #[test]
    fn test_upload_property_order_and_chunking() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let fw = dir.path().join("EDA_02173-MF-VSFW_4-22-1-ABCD.bin");

        // 66,101 words: one full group plus one word.
        let size = LIMIT_GW_CMD_WORDS * 4 + 4;
        fs::write(&fw, vec![0x5au8; size])?;

        let session = MockSession::new();
        let log = session.log();

        let mut fsm = ProgramFsm::with_session(request(fw), Box::new(session), fast_timing());
        fsm.upload()?;

        let sets: Vec<(String, String)> = log
            .lock()
            .iter()
            .filter_map(|op| match op {
                Op::Set(prop, value) => Some((prop.clone(), value.clone())),
                _ => None,
            })
            .collect();

        let props_in_order: Vec<&str> = sets.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(
            props_in_order,
            vec![
                props::PROG_SLOT,
                props::PROG_DEVICE,
                props::PROG_VARIANT,
                props::PROG_VARIANT_REVISION,
                props::PROG_API_REVISION,
                props::PROG_BIN_SIZE_BYTES,
                props::PROG_BIN_CRC,
                "REGFGC3.PROG.BIN[0,]",
                "REGFGC3.PROG.BIN[66100,]",
            ]
        );

        assert_eq!(sets[5].1, size.to_string());
        assert_eq!(sets[6].1, 0xabcd_u16.to_string());

        let first_chunk = &sets[7].1;
        assert_eq!(first_chunk.split(',').count(), LIMIT_GW_CMD_WORDS);
        assert!(first_chunk.starts_with("5a5a5a5a,"));

        let second_chunk = &sets[8].1;
        assert_eq!(second_chunk, "5a5a5a5a");

        Ok(())
    }

    #[test]
    fn test_first_failure_recovers_through_clean_up() {
        let dir = tempfile::tempdir().unwrap();
        let fw = dir.path().join("EDA_02173-MF-VSFW_4-22-1-ABCD.bin");
        fs::write(&fw, [0u8; 4]).unwrap();

        // First poll (WAITING) never matches, then recovery succeeds.
        let session = MockSession::new()
            .with_states(&["UNKNOWN", "UNKNOWN", "UNKNOWN", "UNKNOWN", "CLEAN_UP", "WAITING"])
            .with_reply(props::BOARD_ERROR, "17")
            .with_reply(props::FSM_LAST_STATE, "UNINITIALIZED");
        let log = session.log();

        let mut fsm = ProgramFsm::with_session(request(fw), Box::new(session), fast_timing());
        let err = fsm.process().unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ReprogramFailed);

        // First failure leads straight into CLEAN_UP, then the final
        // return-to-WAITING.
        assert_eq!(mode_sets(&log), vec!["WAITING", "CLEAN_UP", "WAITING"]);
        assert_eq!(fsm.state(), FsmState::Waiting);
    }

    #[test]
    fn test_second_failure_aborts_the_walk() {
        let dir = tempfile::tempdir().unwrap();
        let fw = dir.path().join("EDA_02173-MF-VSFW_4-22-1-ABCD.bin");
        fs::write(&fw, [0u8; 4]).unwrap();

        // Nothing ever matches: the first mode and the recovery both time
        // out, and the final WAITING attempt is illegal from ERROR.
        let session = MockSession::new()
            .with_reply(props::BOARD_ERROR, "17")
            .with_reply(props::FSM_LAST_STATE, "ERROR");
        let log = session.log();

        let mut fsm = ProgramFsm::with_session(request(fw), Box::new(session), fast_timing());
        let err = fsm.process().unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ReprogramFailed);
        assert!(format!("{err}").contains("not allowed for current state ERROR"));

        // The final WAITING attempt fails the table lookup before it ever
        // writes MODE.
        assert_eq!(mode_sets(&log), vec!["WAITING", "CLEAN_UP"]);
        assert_eq!(fsm.state(), FsmState::Error);
    }

    #[test]
    fn test_process_requires_uninitialized() {
        let dir = tempfile::tempdir().unwrap();
        let fw = dir.path().join("EDA_02173-MF-VSFW_4-22-1-ABCD.bin");
        fs::write(&fw, [0u8; 4]).unwrap();

        let session = MockSession::new().with_states(HAPPY_WALK);
        let mut fsm = ProgramFsm::with_session(request(fw), Box::new(session), fast_timing());

        fsm.process().unwrap();

        let err = fsm.process().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReprogramFailed);
    }

    #[test]
    fn test_reset_restores_uninitialized() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let fw = dir.path().join("EDA_02173-MF-VSFW_4-22-1-ABCD.bin");
        fs::write(&fw, [0u8; 4])?;

        let session = MockSession::new().with_states(HAPPY_WALK);
        let mut fsm = ProgramFsm::with_session(request(fw), Box::new(session), fast_timing());

        fsm.process()?;
        assert_eq!(fsm.state(), FsmState::Waiting);

        fsm.reset();
        assert_eq!(fsm.state(), FsmState::Uninitialized);
        assert_eq!(fsm.mode(), None);

        Ok(())
    }

    #[test]
    fn test_timeout_carries_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let fw = dir.path().join("EDA_02173-MF-VSFW_4-22-1-ABCD.bin");
        fs::write(&fw, [0u8; 4]).unwrap();

        let session = MockSession::new()
            .with_reply(props::BOARD_ERROR, "0x21")
            .with_reply(props::FSM_LAST_STATE, "TRANSFERRING");

        let mut fsm =
            ProgramFsm::with_session(request(fw), Box::new(session), fast_timing());

        let err = fsm.poll_state(FsmState::Transferred).unwrap_err();
        assert_eq!(
            err,
            Error::Timeout {
                target: "TRANSFERRED".into(),
                last_state: "TRANSFERRING".into(),
                board_error: "0x21".into(),
            }
        );
    }
}
