use std::path::{Path, PathBuf};

use ini::Ini;

use crate::{adapter::AdapterConfig, Error, Result};

/// Daemon configuration, read from an INI file.
///
/// ```ini
/// [BASIC]
/// name_file_location = /etc/pm/name.json
/// fs_fw_repo_location = /var/lib/pm
/// expected_data_location = fs
/// pm_log_file_name = program_manager.log
///
/// [fs]
/// fw_subfolder = fw
/// db_subfolder = db
/// ```
///
/// With `expected_data_location = db`, a `[db]` section with
/// `connection_string`, `username` and `password` is required instead of
/// `[fs]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub name_file: PathBuf,
    pub fw_repo: PathBuf,
    pub log_file: String,
    pub adapter: AdapterConfig,
}

impl Config {
    /// Reads and validates the configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let ini = Ini::load_from_file(path)
            .map_err(|e| Error::parse(format!("config {}: {e}", path.display())))?;

        let name_file = PathBuf::from(get(&ini, path, "BASIC", "name_file_location")?);
        let fw_repo = PathBuf::from(get(&ini, path, "BASIC", "fs_fw_repo_location")?);
        let expected_data = get(&ini, path, "BASIC", "expected_data_location")?;
        let log_file = get(&ini, path, "BASIC", "pm_log_file_name")?;

        let adapter = match expected_data {
            "fs" => AdapterConfig::Filesystem {
                fw_subfolder: get(&ini, path, "fs", "fw_subfolder")?.to_string(),
                db_subfolder: get(&ini, path, "fs", "db_subfolder")?.to_string(),
                root: fw_repo.clone(),
            },
            "db" => AdapterConfig::Database {
                connection_string: get(&ini, path, "db", "connection_string")?.to_string(),
                username: get(&ini, path, "db", "username")?.to_string(),
                password: get(&ini, path, "db", "password")?.to_string(),
                root: fw_repo.clone(),
            },
            other => {
                return Err(Error::parse(format!(
                    "config {}: expected_data_location must be 'db' or 'fs', got {other:?}",
                    path.display()
                )))
            }
        };

        Ok(Self {
            name_file,
            fw_repo,
            log_file: log_file.to_string(),
            adapter,
        })
    }
}

fn get<'a>(ini: &'a Ini, path: &Path, section: &str, key: &str) -> Result<&'a str> {
    ini.section(Some(section))
        .and_then(|s| s.get(key))
        .ok_or_else(|| {
            Error::parse(format!(
                "config {}: missing [{section}] {key}",
                path.display()
            ))
        })
}
