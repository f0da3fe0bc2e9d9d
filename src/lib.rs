//! Clarion - Streaming text-to-speech reader
//!
//! This library turns arbitrary text into speech through Deepgram Aura:
//! - Text chunking into provider-sized segments
//! - Streaming WebSocket sessions for long text, one-shot REST for short text
//! - Incremental, gapless playback of decoded PCM
//! - A single controller that owns start, stop and interruption
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                     Callers                          │
//! │      CLI  │  hotkey shell  │  settings UI  │  ...    │
//! └────────────────────┬────────────────────────────────┘
//!                      │ speak / stop / set_voice
//! ┌────────────────────▼────────────────────────────────┐
//! │                    Speaker                           │
//! │   Chunker  │  Session  │  REST client  │  Player    │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │          Deepgram Aura (REST + WebSocket)            │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod speaker;
pub mod voice;

pub use config::Config;
pub use error::{Error, Result, Stage};
pub use speaker::{SpeechPath, SpeechStatus, Speaker};
