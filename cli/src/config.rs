use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use basket_core::controller::PUSH_DEBOUNCE;

const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";

/// Optional `config.toml` in the config directory. Every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    remote_url: Option<String>,
    remote_api_key: Option<String>,
    gemini_api_key: Option<String>,
    gemini_model: Option<String>,
    sync_debounce_secs: Option<u64>,
}

pub struct Config {
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
    /// Document-store server. `None` means local-only mode.
    pub remote_url: Option<String>,
    pub remote_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub sync_debounce: Duration,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Invalid config file: {}", path.display()))
}

impl Config {
    pub fn load() -> Result<Self> {
        let proj_dirs =
            ProjectDirs::from("", "", "basket").context("Could not determine home directory")?;

        let data_dir = proj_dirs.data_dir().to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let file = read_file_config(&proj_dirs.config_dir().join("config.toml"))?;
        Ok(Self::resolve(data_dir, file, |key| std::env::var(key).ok()))
    }

    /// Environment wins over the config file.
    fn resolve(data_dir: PathBuf, file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let db_path = data_dir.join("basket.db");
        Config {
            db_path,
            data_dir,
            remote_url: non_empty(env("BASKET_REMOTE_URL").or(file.remote_url))
                .map(|url| url.trim_end_matches('/').to_string()),
            remote_api_key: non_empty(env("BASKET_REMOTE_KEY").or(file.remote_api_key)),
            gemini_api_key: non_empty(env("GEMINI_API_KEY").or(file.gemini_api_key)),
            gemini_model: non_empty(env("BASKET_GEMINI_MODEL").or(file.gemini_model))
                .unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            sync_debounce: file
                .sync_debounce_secs
                .map_or(PUSH_DEBOUNCE, Duration::from_secs),
        }
    }

    /// Load the server API key from disk, or generate a new one.
    ///
    /// Returns `(key, newly_created)`.
    pub fn load_or_create_api_key(&self) -> Result<(String, bool)> {
        use rand::Rng;
        use std::fmt::Write;

        let path = self.data_dir.join("api_key");

        if path.exists() {
            let key = std::fs::read_to_string(&path).context("Failed to read API key file")?;
            let key = key.trim().to_string();
            if !key.is_empty() {
                return Ok((key, false));
            }
        }

        let bytes: [u8; 32] = rand::rng().random();
        let key = bytes
            .iter()
            .fold(String::with_capacity(64), |mut acc: String, b| {
                let _ = write!(acc, "{b:02x}");
                acc
            });
        std::fs::write(&path, &key).context("Failed to write API key file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .context("Failed to set API key file permissions")?;
        }
        eprintln!("Generated new API key: {key}");
        eprintln!("Set BASKET_REMOTE_KEY={key} on clients that sync through this server");
        Ok((key, true))
    }
}
