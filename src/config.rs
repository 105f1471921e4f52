use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::{ArtifactKind, ArtifactSelection};
use crate::error::FetchError;
use crate::ftp::{DEFAULT_HOST, DEFAULT_PORT};
use crate::layout::DownloadLayout;
use crate::progress::DEFAULT_PROGRESS_INTERVAL;
use crate::transfer::DEFAULT_CHUNK_SIZE;

pub const DEFAULT_CONFIG_FILE: &str = "bvbrc-fetch.json";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub progress_interval_ms: Option<u64>,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default)]
    pub download_root: Option<String>,
    #[serde(default)]
    pub artifacts: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub chunk_size: usize,
    pub progress_interval: Duration,
    pub connect_timeout: Duration,
    pub download_root: Utf8PathBuf,
    pub artifacts: ArtifactSelection,
}

impl Settings {
    pub fn layout(&self) -> DownloadLayout {
        DownloadLayout::new(self.download_root.clone())
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// An explicit path must exist; the default file is optional.
    pub fn resolve(path: Option<&str>) -> Result<Settings, FetchError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| FetchError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| FetchError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<Settings, FetchError> {
        let chunk_size = config.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
        if chunk_size == 0 {
            return Err(FetchError::ConfigParse(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        let port = config.port.unwrap_or(DEFAULT_PORT);
        if port == 0 {
            return Err(FetchError::ConfigParse("port must be non-zero".to_string()));
        }

        let artifacts = match config.artifacts {
            Some(names) => {
                let kinds = names
                    .iter()
                    .map(|name| name.parse::<ArtifactKind>())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|err| FetchError::ConfigParse(err.to_string()))?;
                let selection = ArtifactSelection::from_kinds(&kinds);
                if selection.is_empty() {
                    return Err(FetchError::ConfigParse(
                        "artifacts must name at least one kind".to_string(),
                    ));
                }
                selection
            }
            None => ArtifactSelection::all(),
        };

        let download_root = match config.download_root {
            Some(root) => Utf8PathBuf::from(root),
            None => DownloadLayout::default_root()?,
        };

        Ok(Settings {
            host: config.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port,
            chunk_size,
            progress_interval: config
                .progress_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_PROGRESS_INTERVAL),
            connect_timeout: Duration::from_secs(
                config
                    .connect_timeout_secs
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
            ),
            download_root,
            artifacts,
        })
    }
}
