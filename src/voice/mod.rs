//! Voice pipeline
//!
//! Text segmentation, provider clients (streaming and one-shot), and
//! incremental playback. The [`crate::speaker`] controller ties them together.

pub mod chunker;
mod language;
mod output;
mod playback;
mod session;
mod tts;

pub use chunker::{MAX_SEGMENT_CHARS, chunk};
pub use language::{DEFAULT_VOICE, resolve_voice, voice_for_language};
pub use output::{CpalOutput, CpalSink};
pub use playback::{
    AudioOutput, AudioSink, AudioStreamPlayer, CHANNELS, CompletionCallback, PlayerEvent,
    SAMPLE_RATE, decode_wav, pcm_to_f32,
};
pub use session::{
    ControlFrame, FLUSH_THRESHOLD, MAX_MESSAGE_CHARS, SessionEvent, SessionState,
    StreamingSession, speak_url,
};
pub use tts::{AUTH_TIMEOUT, SAMPLE_TIMEOUT, SYNTHESIZE_TIMEOUT, TextToSpeech, random_quote};
