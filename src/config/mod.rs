//! Configuration management for Clarion
//!
//! Values resolve as env > TOML file > default.

pub mod file;

use std::time::Duration;

use crate::voice::DEFAULT_VOICE;
use file::ClarionConfigFile;

/// Default one-shot endpoint
pub const DEFAULT_REST_URL: &str = "https://api.deepgram.com";

/// Default streaming endpoint
pub const DEFAULT_STREAM_URL: &str = "wss://api.deepgram.com";

/// Clarion configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Provider credential
    pub api_key: Option<String>,

    /// Voice configuration
    pub voice: VoiceConfig,

    /// Provider endpoints
    pub provider: ProviderConfig,

    /// Speech pipeline tuning
    pub speech: SpeechConfig,
}

/// Voice selection
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Selected voice identifier
    pub model: String,

    /// Switch to a per-language voice for non-English text
    pub detect_language: bool,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_VOICE.to_string(),
            detect_language: true,
        }
    }
}

/// Provider endpoints
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Base URL for one-shot requests
    pub rest_url: String,

    /// Base URL for streaming sessions
    pub stream_url: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            rest_url: DEFAULT_REST_URL.to_string(),
            stream_url: DEFAULT_STREAM_URL.to_string(),
        }
    }
}

/// Speech pipeline tuning
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    /// Text at or above this many characters is streamed
    pub stream_threshold: usize,

    /// Flush after every this many segments
    pub flush_every: usize,

    /// Pause between segment sends
    pub send_interval: Duration,

    /// Deadline for one-shot synthesis
    pub rest_timeout: Duration,

    /// Quiet period after the last segment before playback stops waiting for
    /// the provider
    pub stream_idle_timeout: Duration,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            stream_threshold: 1000,
            flush_every: 3,
            send_interval: Duration::from_millis(10),
            rest_timeout: Duration::from_secs(30),
            stream_idle_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Load configuration from the environment and config file
    #[must_use]
    pub fn load() -> Self {
        let fc = file::load_config_file();
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Merge a parsed config file with an environment lookup
    pub fn from_sources<F>(fc: ClarionConfigFile, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let voice = VoiceConfig {
            model: non_empty("CLARION_VOICE")
                .or(fc.voice.model)
                .unwrap_or(defaults.voice.model),
            detect_language: fc
                .voice
                .detect_language
                .unwrap_or(defaults.voice.detect_language),
        };

        let provider = ProviderConfig {
            rest_url: non_empty("CLARION_REST_URL")
                .or(fc.provider.rest_url)
                .unwrap_or(defaults.provider.rest_url),
            stream_url: non_empty("CLARION_STREAM_URL")
                .or(fc.provider.stream_url)
                .unwrap_or(defaults.provider.stream_url),
        };

        let speech = SpeechConfig {
            stream_threshold: fc
                .speech
                .stream_threshold
                .unwrap_or(defaults.speech.stream_threshold),
            flush_every: fc
                .speech
                .flush_every
                .filter(|n| *n > 0)
                .unwrap_or(defaults.speech.flush_every),
            send_interval: fc
                .speech
                .send_interval_ms
                .map_or(defaults.speech.send_interval, Duration::from_millis),
            rest_timeout: fc
                .speech
                .rest_timeout_secs
                .filter(|n| *n > 0)
                .map_or(defaults.speech.rest_timeout, Duration::from_secs),
            stream_idle_timeout: fc
                .speech
                .stream_idle_timeout_ms
                .filter(|n| *n > 0)
                .map_or(defaults.speech.stream_idle_timeout, Duration::from_millis),
        };

        Self {
            api_key: non_empty("DEEPGRAM_API_KEY").or(fc.api_keys.deepgram),
            voice,
            provider,
            speech,
        }
    }
}
