//! Cross-platform application paths

use std::fs;
use std::path::PathBuf;

use crate::error::DaemonError;

pub const DATA_DIR_ENV: &str = "NEUROCLUSTERD_DATA_DIR";

#[derive(Debug, Clone)]
pub struct AppPaths {
    data_dir: PathBuf,
}

impl AppPaths {
    /// `$NEUROCLUSTERD_DATA_DIR` if set, else `<OS data dir>/neurocluster`.
    pub fn new() -> Result<Self, DaemonError> {
        let data_dir = match std::env::var_os(DATA_DIR_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => Self::default_data_dir()?,
        };
        Self::at(data_dir)
    }

    pub fn at(data_dir: PathBuf) -> Result<Self, DaemonError> {
        // Ensure directory exists
        fs::create_dir_all(&data_dir).map_err(|source| DaemonError::DataDir {
            path: data_dir.clone(),
            source,
        })?;
        Ok(Self { data_dir })
    }

    fn default_data_dir() -> Result<PathBuf, DaemonError> {
        let base = dirs::data_dir().ok_or(DaemonError::NoDataDir)?;
        Ok(base.join("neurocluster"))
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    /// Root handed to `ClusterResolver::open`.
    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    pub fn config_file(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }
}
