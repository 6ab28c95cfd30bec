use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Real-ESRGAN on Replicate, pinned to a known-good version.
pub const ESRGAN_MODEL_VERSION: &str =
    "f121d640bd286e1fdc67f9799164c1d5be36ff74576ee11c803ae5b665dd46aa";

pub const REPLICATE_TOKEN_ENV_VAR: &str = "REPLICATE_API_TOKEN";

const DEFAULT_OUTPUT_FORMAT: &str = "webp";
const DEFAULT_OUTPUT_QUALITY: u8 = 85;
const DEFAULT_UPSCALE_FACTOR: u32 = 2;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Enhancement backend id ("replicate" or "passthrough").
    pub provider: String,
    pub model_version: String,
    pub output_format: String,
    pub output_quality: u8,
    pub upscale_factor: u32,
    /// Longest-side bound applied by the optimizer; no resize when absent.
    #[serde(default)]
    pub max_dimension: Option<u32>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: "replicate".to_string(),
            model_version: ESRGAN_MODEL_VERSION.to_string(),
            output_format: DEFAULT_OUTPUT_FORMAT.to_string(),
            output_quality: DEFAULT_OUTPUT_QUALITY,
            upscale_factor: DEFAULT_UPSCALE_FACTOR,
            max_dimension: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

pub fn load_settings(paths: &AppPaths) -> Result<Settings> {
    let path = paths.settings_path();
    if !path.exists() {
        return Ok(Settings::default());
    }
    let bytes = std::fs::read(&path)?;
    let parsed: Settings = serde_json::from_slice(&bytes).map_err(|e| {
        EngineError::Config(format!(
            "failed to parse settings at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    Ok(parsed)
}

pub fn save_settings(paths: &AppPaths, settings: &Settings) -> Result<()> {
    let path = paths.settings_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(&path, format!("{json}\n"))?;
    Ok(())
}

/// Environment variable wins over the token file.
pub fn replicate_api_token(paths: &AppPaths) -> Result<Option<String>> {
    if let Ok(raw) = std::env::var(REPLICATE_TOKEN_ENV_VAR) {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            return Ok(Some(trimmed.to_string()));
        }
    }

    let token_path = paths.replicate_token_path();
    if !token_path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(token_path)?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    Ok(Some(trimmed.to_string()))
}

pub fn set_replicate_api_token(paths: &AppPaths, token: &str) -> Result<()> {
    write_secret_token(&paths.replicate_token_path(), token)
}

pub fn clear_replicate_api_token(paths: &AppPaths) -> Result<()> {
    let token_path = paths.replicate_token_path();
    if token_path.exists() {
        std::fs::remove_file(token_path)?;
    }
    Ok(())
}

fn write_secret_token(path: &Path, token: &str) -> Result<()> {
    let token = token.trim();
    if token.is_empty() {
        return Err(EngineError::Config("token is empty".to_string()));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{token}\n"))?;
    Ok(())
}
