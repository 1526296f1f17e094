use std::{fmt, io, result};

pub type Result<T> = result::Result<T, Error>;

/// Errors raised while reconciling and reprogramming converters.
///
/// Each variant carries a human-readable message; [Timeout](Error::Timeout)
/// additionally carries the diagnostic properties read from the remote when
/// the state poll gave up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Expected record, firmware file, or directory entry is missing.
    NotFound(String),
    /// Malformed `SLOT_INFO` reply, expected-inventory line, or firmware
    /// file name.
    Parse(String),
    /// Empty or oversize firmware file.
    SizeViolation(String),
    /// Firmware file name fields disagree with the caller's arguments.
    Inconsistent(String),
    /// Transport failure or error reply from the remote controller.
    Rpc(String),
    /// The remote FSM did not reach the expected state within budget.
    Timeout {
        /// State the remote was expected to reach.
        target: String,
        /// `REGFGC3.PROG.FSM.LAST_STATE` at the time of the timeout.
        last_state: String,
        /// `REGFGC3.PROG.DEBUG.BOARD_ERROR` at the time of the timeout.
        board_error: String,
    },
    /// A reprogram walk failed twice (initial + recovery), or the retry
    /// envelope was exhausted.
    ReprogramFailed(String),
}

impl Error {
    /// Create a [NotFound](Error::NotFound) error.
    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::NotFound(message.into())
    }

    /// Create a [Parse](Error::Parse) error.
    pub fn parse<S: Into<String>>(message: S) -> Self {
        Self::Parse(message.into())
    }

    /// Create a [Parse](Error::Parse) error naming the offending token index.
    pub fn parse_at<M: fmt::Display>(index: usize, message: M) -> Self {
        Self::Parse(format!("token {index}: {message}"))
    }

    /// Create a [SizeViolation](Error::SizeViolation) error.
    pub fn size_violation<S: Into<String>>(message: S) -> Self {
        Self::SizeViolation(message.into())
    }

    /// Create an [Inconsistent](Error::Inconsistent) error.
    pub fn inconsistent<S: Into<String>>(message: S) -> Self {
        Self::Inconsistent(message.into())
    }

    /// Create an [Rpc](Error::Rpc) error.
    pub fn rpc<S: Into<String>>(message: S) -> Self {
        Self::Rpc(message.into())
    }

    /// Create a [ReprogramFailed](Error::ReprogramFailed) error.
    pub fn reprogram_failed<S: Into<String>>(message: S) -> Self {
        Self::ReprogramFailed(message.into())
    }

    /// Get the discriminant-only [ErrorKind] for matching without the payload.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Parse(_) => ErrorKind::Parse,
            Self::SizeViolation(_) => ErrorKind::SizeViolation,
            Self::Inconsistent(_) => ErrorKind::Inconsistent,
            Self::Rpc(_) => ErrorKind::Rpc,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ReprogramFailed(_) => ErrorKind::ReprogramFailed,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Parse(msg) => write!(f, "parse error: {msg}"),
            Self::SizeViolation(msg) => write!(f, "size violation: {msg}"),
            Self::Inconsistent(msg) => write!(f, "inconsistent: {msg}"),
            Self::Rpc(msg) => write!(f, "RPC failure: {msg}"),
            Self::Timeout {
                target,
                last_state,
                board_error,
            } => write!(
                f,
                "timeout: FGC did not reach state {target} (last state: {last_state}, board error: {board_error})"
            ),
            Self::ReprogramFailed(msg) => write!(f, "reprogram failed: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(format!("{err}")),
            _ => Self::Rpc(format!("I/O error: {err}")),
        }
    }
}

/// Error kinds, one per [Error] variant.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Parse,
    SizeViolation,
    Inconsistent,
    Rpc,
    Timeout,
    ReprogramFailed,
}

impl From<ErrorKind> for &'static str {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::NotFound => "not found",
            ErrorKind::Parse => "parse error",
            ErrorKind::SizeViolation => "size violation",
            ErrorKind::Inconsistent => "inconsistent",
            ErrorKind::Rpc => "RPC failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ReprogramFailed => "reprogram failed",
        }
    }
}

impl From<&ErrorKind> for &'static str {
    fn from(kind: &ErrorKind) -> Self {
        (*kind).into()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", <&'static str>::from(self))
    }
}
