use std::{
    collections::{BTreeMap, HashMap},
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use log::info;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    slot_info::{Device, SlotInventory},
    Error, Result,
};

/// Expected contents of one slot (boot-mode independent).
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExpectedBoard {
    pub board: String,
    /// Expected sub-devices keyed by device name.
    pub devices: BTreeMap<String, Device>,
}

/// Expected inventory of a converter, keyed by slot number.
pub type ExpectedInventory = BTreeMap<String, ExpectedBoard>;

/// Source of the expected inventory for a converter.
///
/// Called concurrently from many workers; implementations are internally
/// synchronized.
pub trait Adapter: Send + Sync {
    /// Gets the expected inventory for `converter`.
    ///
    /// Fails with `NotFound` if no expected record exists, returns
    /// `Some(inventory)` if the record changed since the last call, and
    /// `None` if it is unchanged.
    fn get_expected(&self, converter: &str) -> Result<Option<ExpectedInventory>>;

    /// Records the inventory detected on `converter`.
    fn record_detected(&self, converter: &str, detected: &SlotInventory) -> Result<()>;
}

/// One expected-inventory row, the shape shared by both backing stores.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExpectedRow {
    pub slot: String,
    pub board: String,
    pub device: String,
    pub variant: String,
    pub var_rev: String,
    pub api_rev: String,
}

/// Folds rows into the nested inventory; duplicate `(slot, device)` rows
/// are a hard error.
fn rows_to_inventory<D: fmt::Display>(
    rows: Vec<(D, ExpectedRow)>,
) -> Result<ExpectedInventory> {
    let mut inventory = ExpectedInventory::new();

    for (context, row) in rows {
        let board = inventory
            .entry(row.slot.clone())
            .or_insert_with(|| ExpectedBoard {
                board: row.board.clone(),
                devices: BTreeMap::new(),
            });

        let device = Device {
            device: row.device.clone(),
            variant: row.variant,
            var_rev: row.var_rev,
            api_rev: row.api_rev,
        };

        if board.devices.insert(row.device.clone(), device).is_some() {
            return Err(Error::parse(format!(
                "{context}: duplicate device {} in slot {}",
                row.device, row.slot
            )));
        }
    }

    Ok(inventory)
}

/// Expected inventory kept as one file per converter under
/// `{root}/{db_subfolder}`, re-read when its modification time advances.
pub struct FileSystemAdapter {
    db_files: PathBuf,
    fw_files: PathBuf,
    last_updated: Mutex<HashMap<String, SystemTime>>,
}

impl FileSystemAdapter {
    /// Creates an adapter rooted at `root`.
    pub fn new(fw_subfolder: &str, db_subfolder: &str, root: &Path) -> Self {
        info!("adapter FileSystemAdapter created");

        Self {
            db_files: root.join(db_subfolder),
            fw_files: root.join(fw_subfolder),
            last_updated: Mutex::new(HashMap::new()),
        }
    }

    /// Gets the firmware repository directory.
    pub fn fw_files(&self) -> &Path {
        self.fw_files.as_path()
    }

    /// Parses an expected-inventory file.
    ///
    /// Lines are UTF-8; blank lines and `#` comments are ignored; data
    /// lines are `slot,board,device,variant,var_rev,api_rev`.
    fn parse_expected_file(path: &Path) -> Result<ExpectedInventory> {
        let contents = fs::read_to_string(path)?;

        let mut rows = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let [slot, board, device, variant, var_rev, api_rev] = fields.as_slice() else {
                return Err(Error::parse(format!(
                    "{}:{}: expected 6 comma-separated fields, got {}",
                    path.display(),
                    lineno + 1,
                    fields.len()
                )));
            };

            rows.push((
                format!("{}:{}", path.display(), lineno + 1),
                ExpectedRow {
                    slot: slot.to_string(),
                    board: board.to_string(),
                    device: device.to_string(),
                    variant: variant.to_string(),
                    var_rev: var_rev.to_string(),
                    api_rev: api_rev.to_string(),
                },
            ));
        }

        rows_to_inventory(rows)
    }
}

impl Adapter for FileSystemAdapter {
    fn get_expected(&self, converter: &str) -> Result<Option<ExpectedInventory>> {
        let path = self.db_files.join(converter);
        let meta = fs::metadata(&path).map_err(|_| {
            Error::not_found(format!("expected data (file) not found for converter {converter}"))
        })?;
        let mtime = meta.modified()?;

        // Compare, reparse and update run under one lock; a change is
        // reported exactly once.
        let mut last_updated = self.last_updated.lock();

        if let Some(last) = last_updated.get(converter) {
            if mtime <= *last {
                return Ok(None);
            }
        }

        let inventory = Self::parse_expected_file(path.as_path())?;
        last_updated.insert(converter.to_string(), mtime);

        Ok(Some(inventory))
    }

    fn record_detected(&self, converter: &str, detected: &SlotInventory) -> Result<()> {
        let mut lines = String::new();
        for board in detected.values() {
            for device in board.devices.values() {
                lines.push_str(&format!(
                    "{},{},{},{},{},{}\n",
                    board.slot,
                    board.board,
                    device.device,
                    device.variant,
                    device.var_rev,
                    device.api_rev
                ));
            }
        }

        let path = self.db_files.join(format!("{converter}.detected"));
        fs::write(path, lines)?;

        Ok(())
    }
}

/// Deployment-specific relational backend for [DbAdapter].
///
/// `fetch` returns the record revision (monotonically increasing) and the
/// expected rows, or `None` when the converter has no record. The SQL
/// behind it is not part of the core contract.
pub trait ExpectedQuery: Send + Sync {
    fn fetch(&self, converter: &str) -> Result<Option<(u64, Vec<ExpectedRow>)>>;

    fn record_detected(&self, converter: &str, rows: &[ExpectedRow]) -> Result<()> {
        let _ = (converter, rows);
        Ok(())
    }
}

/// Expected inventory backed by a relational store, memoized by record
/// revision the way [FileSystemAdapter] memoizes modification times.
pub struct DbAdapter {
    connection_string: String,
    username: String,
    fw_files: PathBuf,
    query: Box<dyn ExpectedQuery>,
    revisions: Mutex<HashMap<String, u64>>,
}

impl DbAdapter {
    /// Creates an adapter over a query backend.
    ///
    /// The password travels to the backend only; it is neither stored nor
    /// logged here.
    pub fn new(
        connection_string: &str,
        username: &str,
        root: &Path,
        query: Box<dyn ExpectedQuery>,
    ) -> Self {
        info!("adapter DbAdapter created for {username}@{connection_string}");

        Self {
            connection_string: connection_string.to_string(),
            username: username.to_string(),
            fw_files: root.to_path_buf(),
            query,
            revisions: Mutex::new(HashMap::new()),
        }
    }

    /// Gets the firmware repository directory.
    pub fn fw_files(&self) -> &Path {
        self.fw_files.as_path()
    }

    /// Gets the backend connection string.
    pub fn connection_string(&self) -> &str {
        self.connection_string.as_str()
    }

    /// Gets the backend user name.
    pub fn username(&self) -> &str {
        self.username.as_str()
    }
}

impl Adapter for DbAdapter {
    fn get_expected(&self, converter: &str) -> Result<Option<ExpectedInventory>> {
        let (revision, rows) = self.query.fetch(converter)?.ok_or_else(|| {
            Error::not_found(format!("expected data (record) not found for converter {converter}"))
        })?;

        let mut revisions = self.revisions.lock();

        if let Some(last) = revisions.get(converter) {
            if revision <= *last {
                return Ok(None);
            }
        }

        let inventory =
            rows_to_inventory(rows.into_iter().map(|r| (converter.to_string(), r)).collect())?;
        revisions.insert(converter.to_string(), revision);

        Ok(Some(inventory))
    }

    fn record_detected(&self, converter: &str, detected: &SlotInventory) -> Result<()> {
        let mut rows = Vec::new();
        for board in detected.values() {
            for device in board.devices.values() {
                rows.push(ExpectedRow {
                    slot: board.slot.clone(),
                    board: board.board.clone(),
                    device: device.device.clone(),
                    variant: device.variant.clone(),
                    var_rev: device.var_rev.clone(),
                    api_rev: device.api_rev.clone(),
                });
            }
        }

        self.query.record_detected(converter, rows.as_slice())
    }
}

/// Which backing store the daemon reads expected inventories from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdapterConfig {
    Filesystem {
        fw_subfolder: String,
        db_subfolder: String,
        root: PathBuf,
    },
    Database {
        connection_string: String,
        username: String,
        password: String,
        root: PathBuf,
    },
}

impl AdapterConfig {
    /// Builds the adapter.
    ///
    /// A `Database` configuration needs a deployment-registered
    /// [ExpectedQuery] backend; without one it is refused.
    pub fn build(&self, db_backend: Option<Box<dyn ExpectedQuery>>) -> Result<Arc<dyn Adapter>> {
        match self {
            Self::Filesystem {
                fw_subfolder,
                db_subfolder,
                root,
            } => Ok(Arc::new(FileSystemAdapter::new(
                fw_subfolder.as_str(),
                db_subfolder.as_str(),
                root.as_path(),
            ))),
            Self::Database {
                connection_string,
                username,
                root,
                ..
            } => match db_backend {
                Some(query) => Ok(Arc::new(DbAdapter::new(
                    connection_string.as_str(),
                    username.as_str(),
                    root.as_path(),
                    query,
                ))),
                None => Err(Error::not_found(
                    "expected_data_location is 'db' but no database backend is registered",
                )),
            },
        }
    }

    /// Gets the firmware repository directory this configuration implies.
    pub fn fw_files(&self) -> PathBuf {
        match self {
            Self::Filesystem {
                fw_subfolder, root, ..
            } => root.join(fw_subfolder),
            Self::Database { root, .. } => root.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs::File;
    use std::time::Duration;

    use crate::ErrorKind;

    const EXPECTED_FILE: &str = "\
# slot,board,device,variant,var_rev,api_rev
5,VS_STATE_CTRL,DB,DOWNLDBOOT_3,208,200
5,VS_STATE_CTRL,MF,VSFW_4,22,1

9,VS_ANA_INTK_2,MF,VSFW_9,4,1
";

    fn adapter_with_file(converter: &str) -> (tempfile::TempDir, FileSystemAdapter) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("db")).unwrap();
        fs::create_dir(dir.path().join("fw")).unwrap();
        fs::write(dir.path().join("db").join(converter), EXPECTED_FILE).unwrap();

        let adapter = FileSystemAdapter::new("fw", "db", dir.path());
        (dir, adapter)
    }

    #[test]
    fn test_expected_file_parsing() -> Result<()> {
        let (_dir, adapter) = adapter_with_file("RPAGM.866.21.ETH1");

        let inventory = adapter.get_expected("RPAGM.866.21.ETH1")?.unwrap();

        assert_eq!(inventory.len(), 2);
        assert_eq!(inventory["5"].board, "VS_STATE_CTRL");
        assert_eq!(inventory["5"].devices["MF"].variant, "VSFW_4");
        assert_eq!(inventory["5"].devices["MF"].var_rev, "22");
        assert_eq!(inventory["9"].devices["MF"].api_rev, "1");

        Ok(())
    }

    #[test]
    fn test_missing_record_is_not_found() {
        let (_dir, adapter) = adapter_with_file("RPAGM.866.21.ETH1");

        let err = adapter.get_expected("RPAGM.999.99.ETH1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_mtime_memoization() -> Result<()> {
        let converter = "RPAGM.866.21.ETH1";
        let (dir, adapter) = adapter_with_file(converter);

        // First call parses, second reports no change.
        assert!(adapter.get_expected(converter)?.is_some());
        assert!(adapter.get_expected(converter)?.is_none());
        assert!(adapter.get_expected(converter)?.is_none());

        // Touch the file into the future and the change is reported exactly
        // once.
        let path = dir.path().join("db").join(converter);
        let file = File::options().write(true).open(&path)?;
        file.set_modified(SystemTime::now() + Duration::from_secs(5))?;

        assert!(adapter.get_expected(converter)?.is_some());
        assert!(adapter.get_expected(converter)?.is_none());

        Ok(())
    }

    #[test]
    fn test_duplicate_rows_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("db")).unwrap();
        fs::write(
            dir.path().join("db").join("X"),
            "5,VS_STATE_CTRL,MF,VSFW_4,22,1\n5,VS_STATE_CTRL,MF,VSFW_4,23,1\n",
        )
        .unwrap();

        let adapter = FileSystemAdapter::new("fw", "db", dir.path());
        let err = adapter.get_expected("X").unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Parse);
        assert!(format!("{err}").contains("duplicate device MF"));
    }

    #[test]
    fn test_short_line_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("db")).unwrap();
        fs::write(dir.path().join("db").join("X"), "5,VS_STATE_CTRL,MF\n").unwrap();

        let adapter = FileSystemAdapter::new("fw", "db", dir.path());
        let err = adapter.get_expected("X").unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    #[test]
    fn test_record_detected_round_trips() -> Result<()> {
        let converter = "RPAGM.866.21.ETH1";
        let (dir, adapter) = adapter_with_file(converter);

        let detected = crate::slot_info::parse_slot_info(
            "------,SLOT 5,BOARD VS_STATE_CTRL,STATE DownloadBoot,\
             Device MF,Variant VSFW_4,Var_Rev 21,API_Rev 1,,",
        )?;

        adapter.record_detected(converter, &detected)?;

        let recorded =
            fs::read_to_string(dir.path().join("db").join(format!("{converter}.detected")))?;
        assert_eq!(recorded, "5,VS_STATE_CTRL,MF,VSFW_4,21,1\n");

        Ok(())
    }

    struct FixedQuery {
        revision: Mutex<u64>,
    }

    impl ExpectedQuery for FixedQuery {
        fn fetch(&self, converter: &str) -> Result<Option<(u64, Vec<ExpectedRow>)>> {
            if converter == "UNKNOWN" {
                return Ok(None);
            }

            Ok(Some((
                *self.revision.lock(),
                vec![ExpectedRow {
                    slot: "5".into(),
                    board: "VS_STATE_CTRL".into(),
                    device: "MF".into(),
                    variant: "VSFW_4".into(),
                    var_rev: "22".into(),
                    api_rev: "1".into(),
                }],
            )))
        }
    }

    #[test]
    fn test_db_adapter_revision_memoization() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let query = Box::new(FixedQuery {
            revision: Mutex::new(1),
        });

        let adapter = DbAdapter::new("db-host/svc", "pm", dir.path(), query);

        assert!(adapter.get_expected("RPAGM.866.21.ETH1")?.is_some());
        assert!(adapter.get_expected("RPAGM.866.21.ETH1")?.is_none());

        let err = adapter.get_expected("UNKNOWN").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        Ok(())
    }

    #[test]
    fn test_database_config_requires_backend() {
        let config = AdapterConfig::Database {
            connection_string: "db-host/svc".into(),
            username: "pm".into(),
            password: "secret".into(),
            root: PathBuf::from("/tmp"),
        };

        assert!(config.build(None).is_err());
    }
}
