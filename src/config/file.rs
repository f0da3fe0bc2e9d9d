//! TOML configuration file loading
//!
//! Supports `~/.config/clarion/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ClarionConfigFile {
    /// API keys for the TTS provider
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,

    /// Voice selection
    #[serde(default)]
    pub voice: VoiceFileConfig,

    /// Provider endpoints
    #[serde(default)]
    pub provider: ProviderFileConfig,

    /// Speech pipeline tuning
    #[serde(default)]
    pub speech: SpeechFileConfig,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub deepgram: Option<String>,
}

/// Voice configuration
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// Voice identifier (e.g. "aura-2-thalia-en")
    pub model: Option<String>,

    /// Switch to a per-language voice for non-English text
    pub detect_language: Option<bool>,
}

/// Provider endpoint overrides
#[derive(Debug, Default, Deserialize)]
pub struct ProviderFileConfig {
    /// Base URL for one-shot requests
    pub rest_url: Option<String>,

    /// Base URL for streaming sessions
    pub stream_url: Option<String>,
}

/// Speech pipeline tuning
#[derive(Debug, Default, Deserialize)]
pub struct SpeechFileConfig {
    pub stream_threshold: Option<usize>,
    pub flush_every: Option<usize>,
    pub send_interval_ms: Option<u64>,
    pub rest_timeout_secs: Option<u64>,
    pub stream_idle_timeout_ms: Option<u64>,
}

/// Parse config file contents, falling back to defaults on error
pub fn parse_config_file(content: &str) -> ClarionConfigFile {
    match toml::from_str(content) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(error = %e, "failed to parse config file, using defaults");
            ClarionConfigFile::default()
        }
    }
}

/// Load the config file from the default location
///
/// Returns defaults if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> ClarionConfigFile {
    config_file_path().map_or_else(ClarionConfigFile::default, |path| load_config_from(&path))
}

/// Load a config file from an explicit path
pub fn load_config_from(path: &Path) -> ClarionConfigFile {
    if !path.exists() {
        return ClarionConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => {
            tracing::info!(path = %path.display(), "loaded config file");
            parse_config_file(&content)
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file, using defaults"
            );
            ClarionConfigFile::default()
        }
    }
}

/// Get the config file path (`~/.config/clarion/config.toml`)
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("clarion").join("config.toml"))
}
