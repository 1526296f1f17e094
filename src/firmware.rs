use std::{
    fmt, fs,
    fs::File,
    io::{self, BufReader, Read},
    path::{Path, PathBuf},
};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::{Error, Result, CHARS_PER_WORD, FW_FILE_LIMIT_BYTES, WORD_SIZE_BYTES};

/// Firmware file naming convention:
/// `EDA_<digits>-<device>-<variant>-<var_rev>-<api_rev>-<crc4>.bin`.
static FW_FILE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"EDA_\d{1,5}-([A-Z]{2,6}_*\d*)-([A-Z]+_\d+)-(\d*)-(\d*)-([0-9A-Z]{4})\.bin")
        .unwrap()
});

/// Fields encoded in a firmware file name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FirmwareName {
    pub device: String,
    pub variant: String,
    pub var_rev: String,
    pub api_rev: String,
    /// 16-bit image CRC, as the 4-hex-character token from the file name.
    pub crc: String,
}

impl FirmwareName {
    /// Parses a bare file name against the naming convention.
    pub fn parse(file_name: &str) -> Result<Self> {
        let caps = FW_FILE_REGEX.captures(file_name).ok_or_else(|| {
            Error::parse(format!(
                "firmware file {file_name:?} does not conform to naming standards"
            ))
        })?;

        Ok(Self {
            device: caps[1].to_string(),
            variant: caps[2].to_string(),
            var_rev: caps[3].to_string(),
            api_rev: caps[4].to_string(),
            crc: caps[5].to_string(),
        })
    }

    /// Parses the file-name component of a path.
    pub fn parse_path(path: &Path) -> Result<Self> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::parse(format!("no file name in {}", path.display())))?;

        Self::parse(file_name)
    }

    /// Gets the CRC token as a 16-bit value.
    pub fn crc16(&self) -> Result<u16> {
        u16::from_str_radix(self.crc.as_str(), 16)
            .map_err(|e| Error::parse(format!("invalid firmware CRC {:?}: {e}", self.crc)))
    }

    /// Checks the name fields against caller-supplied values.
    ///
    /// Used on the command-line path, where the device, variant and revision
    /// come from the operator rather than the inventory.
    pub fn check_consistency(&self, device: &str, variant: &str, var_rev: &str) -> Result<()> {
        if self.variant != variant {
            return Err(Error::inconsistent(format!(
                "file variant {} is different than input variant {variant}",
                self.variant
            )));
        }

        if self.device != device {
            return Err(Error::inconsistent(format!(
                "file device {} is different than input device {device}",
                self.device
            )));
        }

        if self.var_rev != var_rev {
            return Err(Error::inconsistent(format!(
                "file revision {} is different than input revision {var_rev}",
                self.var_rev
            )));
        }

        Ok(())
    }

    /// Gets whether this name targets the given device identity.
    pub fn matches(&self, device: &str, variant: &str, var_rev: &str, api_rev: &str) -> bool {
        self.device == device
            && self.variant == variant
            && self.var_rev == var_rev
            && self.api_rev == api_rev
    }
}

impl fmt::Display for FirmwareName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "device: {}, variant: {}, var_rev: {}, api_rev: {}, crc: {}",
            self.device, self.variant, self.var_rev, self.api_rev, self.crc
        )
    }
}

/// A size-validated firmware image on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirmwareFile {
    path: PathBuf,
    size: u64,
}

impl FirmwareFile {
    /// Opens `path`, enforcing `0 < size <= FW_FILE_LIMIT_BYTES`.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let meta = fs::metadata(&path).map_err(|_| {
            Error::not_found(format!("could not open firmware file {}", path.display()))
        })?;

        let size = meta.len();
        if size == 0 {
            return Err(Error::size_violation(format!(
                "file {} is empty, nothing to do",
                path.display()
            )));
        }

        if size > FW_FILE_LIMIT_BYTES {
            return Err(Error::size_violation(format!(
                "file {} size {size} over limit {FW_FILE_LIMIT_BYTES}",
                path.display()
            )));
        }

        Ok(Self { path, size })
    }

    /// Gets the image size in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.size
    }

    /// Gets the image path.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Gets the number of 32-bit words the image streams into.
    pub fn word_count(&self) -> u64 {
        self.size.div_ceil(WORD_SIZE_BYTES as u64)
    }

    /// Opens the word stream.
    pub fn words(&self) -> Result<Words<BufReader<File>>> {
        let file = File::open(&self.path).map_err(|_| {
            Error::not_found(format!("could not open firmware file {}", self.path.display()))
        })?;

        Ok(Words::new(BufReader::new(file)))
    }
}

/// Lazy stream of zero-padded 8-hex-character firmware words.
///
/// Reads the source in 4-byte groups; a short final group is right-padded
/// with `0` so every emitted token is 8 characters.
pub struct Words<R> {
    reader: R,
    done: bool,
}

impl<R: Read> Words<R> {
    /// Creates a word stream over `reader`.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            done: false,
        }
    }

    fn read_group(&mut self) -> io::Result<Option<String>> {
        let mut group = [0u8; WORD_SIZE_BYTES];
        let mut filled = 0;

        while filled < group.len() {
            match self.reader.read(&mut group[filled..])? {
                0 => break,
                n => filled += n,
            }
        }

        if filled == 0 {
            return Ok(None);
        }

        let mut word = String::with_capacity(CHARS_PER_WORD);
        for byte in &group[..filled] {
            word.push_str(&format!("{byte:02x}"));
        }
        while word.len() < CHARS_PER_WORD {
            word.push('0');
        }

        Ok(Some(word))
    }
}

impl<R: Read> Iterator for Words<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.read_group() {
            Ok(Some(word)) => Some(Ok(word)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Finds the firmware file for a device identity in the repository dir.
///
/// Exactly one file must match; none is `NotFound`, several is
/// `Inconsistent`.
pub fn find_firmware(
    fw_dir: &Path,
    device: &str,
    variant: &str,
    var_rev: &str,
    api_rev: &str,
) -> Result<(PathBuf, FirmwareName)> {
    let entries = fs::read_dir(fw_dir)
        .map_err(|_| Error::not_found(format!("firmware repository {} not found", fw_dir.display())))?;

    let mut matches = Vec::new();
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();

        let name = match file_name.to_str().map(FirmwareName::parse) {
            Some(Ok(name)) => name,
            _ => continue,
        };

        if name.matches(device, variant, var_rev, api_rev) {
            matches.push((entry.path(), name));
        }
    }

    match matches.len() {
        0 => Err(Error::not_found(format!(
            "no firmware file for device {device}, variant {variant}, var_rev {var_rev}, api_rev {api_rev} in {}",
            fw_dir.display()
        ))),
        1 => Ok(matches.remove(0)),
        n => Err(Error::inconsistent(format!(
            "{n} firmware files match device {device}, variant {variant}, var_rev {var_rev}, api_rev {api_rev} in {}",
            fw_dir.display()
        ))),
    }
}
