use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::DataSourceKey;
use crate::error::SyncError;
use crate::paging::DEFAULT_PAGE_SIZE;
use crate::remote::DEFAULT_BASE_URL;
use crate::source::{self, DataSource};

pub const CONFIG_FILE: &str = "msi-sync.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub data_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub download_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub page_size: Option<usize>,
    /// Empty means every catalog source.
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SourceEntry {
    Shorthand(String),
    Detailed(SourceEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SourceEntryObject {
    pub key: String,
    #[serde(default)]
    pub refresh_minutes: Option<u64>,
    /// Extra query parameters appended to the remote request.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub base_url: String,
    pub data_dir: Utf8PathBuf,
    pub download_dir: Utf8PathBuf,
    pub page_size: usize,
    pub sources: Vec<DataSource>,
}

impl ResolvedConfig {
    pub fn store_path(&self) -> Utf8PathBuf {
        self.data_dir.join("records.json")
    }

    pub fn ledger_path(&self) -> Utf8PathBuf {
        self.data_dir.join("ledger.json")
    }

    pub fn staging_dir(&self) -> Utf8PathBuf {
        self.data_dir.join("transfers")
    }

    pub fn source(&self, key: &DataSourceKey) -> Result<&DataSource, SyncError> {
        self.sources
            .iter()
            .find(|source| &source.key == key)
            .ok_or_else(|| SyncError::UnknownDataSource(key.to_string()))
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, SyncError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(SyncError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| SyncError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| SyncError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    /// Like [`ConfigLoader::resolve`], but an absent default file means
    /// defaults for everything.
    pub fn resolve_or_default(path: Option<&str>) -> Result<ResolvedConfig, SyncError> {
        match Self::resolve(path) {
            Err(SyncError::MissingConfig) => Self::resolve_config(Config::default()),
            other => other,
        }
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, SyncError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let data_dir = match config.data_dir {
            Some(dir) => dir,
            None => default_data_dir()?,
        };
        let download_dir = config
            .download_dir
            .unwrap_or_else(|| data_dir.join("publications"));

        let sources = if config.sources.is_empty() {
            source::catalog()
        } else {
            config
                .sources
                .into_iter()
                .map(|entry| match entry {
                    SourceEntry::Shorthand(value) => source::find(&value.parse()?),
                    SourceEntry::Detailed(obj) => {
                        let mut source = source::find(&obj.key.parse()?)?;
                        if let Some(minutes) = obj.refresh_minutes {
                            source.refresh_interval = Duration::from_secs(minutes * 60);
                        }
                        source.params.extend(obj.params);
                        Ok(source)
                    }
                })
                .collect::<Result<Vec<_>, SyncError>>()?
        };

        Ok(ResolvedConfig {
            schema_version,
            base_url: config
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            data_dir,
            download_dir,
            page_size: config.page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1),
            sources,
        })
    }
}

pub fn default_data_dir() -> Result<Utf8PathBuf, SyncError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.data_local_dir().join("msi-sync")).ok()
        })
        .ok_or_else(|| SyncError::Filesystem("unable to resolve data directory".to_string()))
}
