//! Incremental audio playback
//!
//! [`AudioStreamPlayer`] turns raw 16-bit PCM into f32 buffers and schedules
//! them on an [`AudioSink`] in arrival order. It counts scheduled and
//! completed buffers under one lock and reports [`PlayerEvent::Drained`] once,
//! when input has been marked finished and every scheduled buffer has played.

use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::{Error, Result};

/// Playback sample rate (matches the provider's linear16 output)
pub const SAMPLE_RATE: u32 = 48_000;

/// Playback channel count
pub const CHANNELS: u16 = 1;

/// Called by a sink once a buffer has been fully played
pub type CompletionCallback = Box<dyn FnOnce() + Send + 'static>;

/// Destination for decoded audio
///
/// Implementations must play buffers strictly in the order they were scheduled
/// and invoke each buffer's callback exactly once, after its last sample.
/// Callbacks for buffers still pending at [`AudioSink::stop`] may be dropped.
pub trait AudioSink: Send {
    /// Open the output at [`SAMPLE_RATE`] / [`CHANNELS`]
    ///
    /// # Errors
    ///
    /// Returns error if the output cannot be opened
    fn start(&mut self) -> Result<()>;

    /// Queue a buffer behind everything scheduled so far
    fn schedule(&mut self, samples: Vec<f32>, on_complete: CompletionCallback);

    /// Halt playback and release the output
    fn stop(&mut self);
}

/// Factory for per-utterance sinks
pub trait AudioOutput: Send + Sync {
    /// Create a fresh, unstarted sink
    ///
    /// # Errors
    ///
    /// Returns error if no output is available
    fn open_sink(&self) -> Result<Box<dyn AudioSink>>;
}

/// Notifications from the player to its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerEvent {
    /// Input is finished and every scheduled buffer has played
    Drained,
}

#[derive(Debug, Default)]
struct Counters {
    scheduled: u64,
    completed: u64,
    input_finished: bool,
    drained_fired: bool,
    generation: u64,
}

impl Counters {
    /// Mark drained if the condition holds for the first time
    fn take_drained(&mut self) -> bool {
        let fire = self.input_finished && self.completed == self.scheduled && !self.drained_fired;
        if fire {
            self.drained_fired = true;
        }
        fire
    }
}

/// Plays one utterance's audio through a sink
pub struct AudioStreamPlayer {
    sink: Option<Box<dyn AudioSink>>,
    started: bool,
    counters: Arc<Mutex<Counters>>,
    events: mpsc::UnboundedSender<PlayerEvent>,
    /// Odd trailing byte from the previous PCM frame
    carry: Option<u8>,
}

impl AudioStreamPlayer {
    /// Create a player that reports on `events`
    #[must_use]
    pub fn new(sink: Box<dyn AudioSink>, events: mpsc::UnboundedSender<PlayerEvent>) -> Self {
        Self {
            sink: Some(sink),
            started: false,
            counters: Arc::new(Mutex::new(Counters::default())),
            events,
            carry: None,
        }
    }

    /// Start the sink; does nothing if already started
    ///
    /// # Errors
    ///
    /// Returns error if the sink cannot be opened or the player was stopped
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }

        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| Error::Audio("player already stopped".to_string()))?;

        if let Err(e) = sink.start() {
            tracing::error!(error = %e, "failed to start audio output");
            return Err(e);
        }

        self.started = true;
        tracing::debug!(sample_rate = SAMPLE_RATE, "audio stream player started");
        Ok(())
    }

    /// Whether [`start`](Self::start) succeeded and [`stop`](Self::stop) has not run
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.started
    }

    /// Queue little-endian signed 16-bit PCM bytes
    pub fn enqueue(&mut self, pcm: &[u8]) {
        if !self.started || pcm.is_empty() {
            return;
        }

        let mut bytes = Vec::with_capacity(pcm.len() + 1);
        if let Some(b) = self.carry.take() {
            bytes.push(b);
        }
        bytes.extend_from_slice(pcm);

        let pairs = bytes.chunks_exact(2);
        self.carry = pairs.remainder().first().copied();
        let samples: Vec<f32> = pairs
            .map(|pair| pcm_to_f32(i16::from_le_bytes([pair[0], pair[1]])))
            .collect();

        self.schedule(samples);
    }

    /// Queue already-decoded samples as one buffer
    pub fn enqueue_samples(&mut self, samples: &[i16]) {
        if !self.started || samples.is_empty() {
            return;
        }
        self.schedule(samples.iter().copied().map(pcm_to_f32).collect());
    }

    fn schedule(&mut self, samples: Vec<f32>) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        if samples.is_empty() {
            return;
        }

        let generation = {
            let mut c = lock(&self.counters);
            c.scheduled += 1;
            c.generation
        };

        let counters = Arc::clone(&self.counters);
        let events = self.events.clone();
        sink.schedule(
            samples,
            Box::new(move || buffer_completed(&counters, generation, &events)),
        );
    }

    /// Declare that no further audio will be enqueued
    ///
    /// Fires [`PlayerEvent::Drained`] right away when nothing is left to play.
    pub fn finish_input(&mut self) {
        if self.sink.is_none() {
            return;
        }
        let fire = {
            let mut c = lock(&self.counters);
            c.input_finished = true;
            c.take_drained()
        };
        if fire {
            tracing::debug!("player drained at end of input");
            let _ = self.events.send(PlayerEvent::Drained);
        }
    }

    /// Halt playback, release the sink and reset the counters
    ///
    /// Safe to call repeatedly or before [`start`](Self::start).
    pub fn stop(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            if self.started {
                sink.stop();
                tracing::debug!("audio stream player stopped");
            }
        }
        self.started = false;
        self.carry = None;

        let mut c = lock(&self.counters);
        c.scheduled = 0;
        c.completed = 0;
        c.input_finished = false;
        c.drained_fired = false;
        c.generation += 1;
    }

    /// Buffers handed to the sink since the last reset
    #[must_use]
    pub fn scheduled(&self) -> u64 {
        lock(&self.counters).scheduled
    }

    /// Buffers finished since the last reset
    #[must_use]
    pub fn completed(&self) -> u64 {
        lock(&self.counters).completed
    }

    /// Whether every scheduled buffer has finished
    #[must_use]
    pub fn is_drained(&self) -> bool {
        let c = lock(&self.counters);
        c.completed == c.scheduled
    }
}

impl Drop for AudioStreamPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock(counters: &Mutex<Counters>) -> MutexGuard<'_, Counters> {
    counters.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sink-side completion; runs on the sink's thread
fn buffer_completed(
    counters: &Mutex<Counters>,
    generation: u64,
    events: &mpsc::UnboundedSender<PlayerEvent>,
) {
    let fire = {
        let mut c = lock(counters);
        if c.generation != generation || c.completed >= c.scheduled {
            return;
        }
        c.completed += 1;
        c.take_drained()
    };

    if fire {
        tracing::debug!("all scheduled buffers drained");
        let _ = events.send(PlayerEvent::Drained);
    }
}

/// Map a signed 16-bit sample onto [-1.0, 1.0]
#[must_use]
pub fn pcm_to_f32(sample: i16) -> f32 {
    (f32::from(sample) / f32::from(i16::MAX)).max(-1.0)
}

/// Decode a WAV container into mono 16-bit samples at [`SAMPLE_RATE`]
///
/// Stereo input is averaged down to mono. A truncated data chunk keeps the
/// samples read so far.
///
/// # Errors
///
/// Returns error if the header is invalid or the format does not match
pub fn decode_wav(data: &[u8]) -> Result<Vec<i16>> {
    let reader = hound::WavReader::new(Cursor::new(data))
        .map_err(|e| Error::Decode(format!("invalid WAV: {e}")))?;
    let spec = reader.spec();

    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(Error::Decode(format!(
            "unsupported WAV format: {:?} {} bits",
            spec.sample_format, spec.bits_per_sample
        )));
    }
    if spec.sample_rate != SAMPLE_RATE {
        return Err(Error::Decode(format!(
            "unexpected sample rate {} (want {SAMPLE_RATE})",
            spec.sample_rate
        )));
    }

    // Header sizes are untrusted; streamed files often carry a placeholder
    let mut samples = Vec::with_capacity((reader.len() as usize).min(data.len() / 2));
    for sample in reader.into_samples::<i16>() {
        match sample {
            Ok(s) => samples.push(s),
            Err(e) => {
                tracing::debug!(error = %e, read = samples.len(), "WAV data ended early");
                break;
            }
        }
    }

    match spec.channels {
        1 => Ok(samples),
        2 => Ok(samples
            .chunks(2)
            .map(|pair| {
                let left = i32::from(pair[0]);
                let right = i32::from(pair.get(1).copied().unwrap_or(pair[0]));
                i16::try_from((left + right) / 2).unwrap_or_default()
            })
            .collect()),
        n => Err(Error::Decode(format!("unsupported channel count {n}"))),
    }
}
