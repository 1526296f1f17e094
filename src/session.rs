use std::{
    io::{BufRead, BufReader, Write},
    net::TcpStream,
    time::Duration,
};

use crate::{Error, Result};

/// TCP port of the converter property service.
pub const FGC_PORT: u16 = 1905;

/// Read/write timeout applied to the property service socket.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(20);

/// Reply to a property get.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reply {
    pub value: String,
}

impl Reply {
    /// Creates a [Reply] carrying `value`.
    pub fn new<S: Into<String>>(value: S) -> Self {
        Self {
            value: value.into(),
        }
    }
}

/// Request/reply client for named properties on a remote controller.
///
/// All program-manager components talk to converters exclusively through
/// this trait; the transport behind it is interchangeable.
pub trait FgcSession: Send {
    /// Get the value of a named property.
    fn get(&mut self, property: &str) -> Result<Reply>;

    /// Set a named property.
    fn set(&mut self, property: &str, value: &str) -> Result<()>;

    /// Close the session.
    fn disconnect(&mut self) -> Result<()>;
}

/// Opens sessions to converters by device name.
pub trait SessionFactory: Send + Sync {
    fn connect(&self, device: &str) -> Result<Box<dyn FgcSession>>;
}

/// Property names used by the program manager.
pub mod props {
    pub const SLOT_INFO: &str = "REGFGC3.SLOT_INFO";
    pub const FSM_STATE: &str = "REGFGC3.PROG.FSM.STATE";
    pub const FSM_LAST_STATE: &str = "REGFGC3.PROG.FSM.LAST_STATE";
    pub const FSM_MODE: &str = "REGFGC3.PROG.FSM.MODE";
    pub const BOARD_ERROR: &str = "REGFGC3.PROG.DEBUG.BOARD_ERROR";
    pub const DEBUG_ACTION: &str = "REGFGC3.PROG.DEBUG.ACTION";
    pub const PROG_SLOT: &str = "REGFGC3.PROG.SLOT";
    pub const PROG_DEVICE: &str = "REGFGC3.PROG.DEVICE";
    pub const PROG_VARIANT: &str = "REGFGC3.PROG.VARIANT";
    pub const PROG_VARIANT_REVISION: &str = "REGFGC3.PROG.VARIANT_REVISION";
    pub const PROG_API_REVISION: &str = "REGFGC3.PROG.API_REVISION";
    pub const PROG_BIN_SIZE_BYTES: &str = "REGFGC3.PROG.BIN_SIZE_BYTES";
    pub const PROG_BIN_CRC: &str = "REGFGC3.PROG.BIN_CRC";

    /// Indexed binary write, `REGFGC3.PROG.BIN[<offset>,]`.
    pub fn prog_bin(offset: usize) -> String {
        format!("REGFGC3.PROG.BIN[{offset},]")
    }
}

/// Line-based TCP session to a converter's property service.
///
/// One request per line (`get <property>` / `set <property> <value>`), one
/// reply per line (`ok[ <value>]` / `err <message>`). This is deliberately
/// the only place in the crate that knows any wire detail; everything else
/// depends on [FgcSession].
pub struct TcpSession {
    device: String,
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl TcpSession {
    /// Connect to the property service of `device`.
    pub fn connect(device: &str) -> Result<Self> {
        let stream = TcpStream::connect((device, FGC_PORT))
            .map_err(|e| Error::rpc(format!("could not connect to {device}: {e}")))?;
        stream.set_read_timeout(Some(SOCKET_TIMEOUT))?;
        stream.set_write_timeout(Some(SOCKET_TIMEOUT))?;

        let reader = BufReader::new(stream.try_clone()?);

        Ok(Self {
            device: device.to_string(),
            reader,
            writer: stream,
        })
    }

    /// Get the device name this session is connected to.
    pub fn device(&self) -> &str {
        self.device.as_str()
    }

    fn round_trip(&mut self, request: &str) -> Result<String> {
        self.writer.write_all(request.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;

        let mut line = String::new();
        self.reader.read_line(&mut line)?;

        let line = line.trim_end();
        match line.split_once(' ') {
            Some(("ok", value)) => Ok(value.to_string()),
            Some(("err", message)) => Err(Error::rpc(format!("{}: {message}", self.device))),
            _ if line == "ok" => Ok(String::new()),
            _ => Err(Error::rpc(format!(
                "{}: malformed reply {line:?}",
                self.device
            ))),
        }
    }
}

impl FgcSession for TcpSession {
    fn get(&mut self, property: &str) -> Result<Reply> {
        let value = self.round_trip(&format!("get {property}"))?;
        Ok(Reply::new(value))
    }

    fn set(&mut self, property: &str, value: &str) -> Result<()> {
        self.round_trip(&format!("set {property} {value}"))?;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.writer
            .shutdown(std::net::Shutdown::Both)
            .map_err(Error::from)
    }
}

/// [SessionFactory] producing [TcpSession]s.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpSessionFactory;

impl SessionFactory for TcpSessionFactory {
    fn connect(&self, device: &str) -> Result<Box<dyn FgcSession>> {
        Ok(Box::new(TcpSession::connect(device)?))
    }
}
