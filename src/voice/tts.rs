//! One-shot text-to-speech over REST
//!
//! Short utterances, credential probes and voice samples go through plain
//! HTTP requests rather than a streaming session.

use std::time::Duration;

use rand::seq::SliceRandom;

use super::playback::SAMPLE_RATE;
use crate::error::Stage;
use crate::{Error, Result};

/// Default deadline for synthesis requests
pub const SYNTHESIZE_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for the credential probe
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for voice samples
pub const SAMPLE_TIMEOUT: Duration = Duration::from_secs(15);

/// Phrases spoken when previewing a voice
const SAMPLE_QUOTES: &[&str] = &[
    "We are all connected in ways we don't always see. What we do for each other matters more than what we do for ourselves.",
    "The only true wisdom is in knowing you know nothing, and in that emptiness, finding room for wonder.",
    "In the middle of difficulty lies opportunity. Every obstacle is a doorway, if you have the courage to walk through it.",
    "We do not inherit the earth from our ancestors. We borrow it from our children, and we owe them a beautiful return.",
    "What matters most is how well you walk through the fire. Not the absence of flames, but the grace with which you move.",
    "Every person you meet is fighting a battle you know nothing about. Be kind. Always.",
    "The cosmos is within us. We are made of star stuff. We are a way for the universe to know itself.",
    "To live is the rarest thing in the world. Most people exist, that is all. But to truly live is to be awake to every moment.",
];

/// Synthesizes speech with single HTTP requests
#[derive(Debug, Clone)]
pub struct TextToSpeech {
    client: reqwest::Client,
    base_url: String,
}

impl TextToSpeech {
    /// Create a client for the provider at `base_url` (e.g. `https://api.deepgram.com`)
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Synthesize `text` with `voice` into a 48 kHz linear16 WAV file
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] past `timeout`, [`Error::Provider`] on a
    /// non-200 status, or a transport error if the request fails
    pub async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        credential: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let sample_rate = SAMPLE_RATE.to_string();
        let response = self
            .client
            .post(format!("{}/v1/speak", self.base_url))
            .query(&[
                ("model", voice),
                ("encoding", "linear16"),
                ("sample_rate", sample_rate.as_str()),
                ("container", "wav"),
            ])
            .header("Authorization", format!("Token {credential}"))
            .header("Content-Type", "text/plain")
            .body(text.to_string())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| request_error(e, "synthesis"))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Provider(format!("TTS error {status}: {body}")));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| request_error(e, "synthesis"))?;

        tracing::debug!(voice, bytes = audio.len(), "synthesized audio");
        Ok(audio.to_vec())
    }

    /// Check that `credential` is accepted by the provider
    ///
    /// # Errors
    ///
    /// Returns [`Error::Provider`] on a non-200 status, or a transport or
    /// timeout error if the request fails
    pub async fn verify_credential(&self, credential: &str) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/v1/auth/token", self.base_url))
            .header("Authorization", format!("Token {credential}"))
            .timeout(AUTH_TIMEOUT)
            .send()
            .await
            .map_err(|e| request_error(e, "auth probe"))?;

        let status = response.status();
        if status == reqwest::StatusCode::OK {
            Ok(())
        } else {
            Err(Error::Provider(format!("credential rejected with status {status}")))
        }
    }

    /// Whether `credential` is valid; failures are logged and reported as `false`
    pub async fn test_connection(&self, credential: &str) -> bool {
        match self.verify_credential(credential).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "auth test failed");
                false
            }
        }
    }

    /// Fetch a WAV preview of `voice` speaking a random built-in quote
    ///
    /// Returns `None` for an empty credential or on any failure.
    pub async fn fetch_sample(&self, credential: &str, voice: &str) -> Option<Vec<u8>> {
        if credential.is_empty() {
            return None;
        }

        let quote = random_quote();
        match self.synthesize(quote, voice, credential, SAMPLE_TIMEOUT).await {
            Ok(audio) => Some(audio),
            Err(e) => {
                tracing::warn!(voice, error = %e, "voice sample failed");
                None
            }
        }
    }
}

/// Pick one of the built-in preview phrases
#[must_use]
pub fn random_quote() -> &'static str {
    SAMPLE_QUOTES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(SAMPLE_QUOTES[0])
}

fn request_error(err: reqwest::Error, what: &str) -> Error {
    if err.is_timeout() {
        Error::Timeout(format!("{what} request exceeded its deadline"))
    } else if err.is_connect() {
        Error::transport(Stage::Connect, err)
    } else if err.is_body() || err.is_decode() {
        Error::transport(Stage::Receive, err)
    } else {
        Error::transport(Stage::Send, err)
    }
}
