use std::io::Write;

/// Verbosity levels accepted by the command-line tools.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LogLevel {
    Off = 0,
    Critical,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Map a `-v` occurrence count to a level (none: Info, `-v`: Debug,
    /// anything more: Trace).
    pub fn from_verbosity(count: u8) -> Self {
        match count {
            0 => Self::Info,
            1 => Self::Debug,
            _ => Self::Trace,
        }
    }
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Critical | LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

/// Install the stderr log handler used by the command-line tools.
///
/// Format: `[timestamp] [  LEVEL](     module): message`.
pub fn init(level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(level.into())
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{:>7}]({:>11}): {}",
                buf.timestamp(),
                record.level(),
                record.module_path().unwrap_or("unknown"),
                record.args()
            )
        })
        .init();
}
