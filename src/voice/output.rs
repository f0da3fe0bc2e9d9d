//! Speaker output through cpal

use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use tokio::runtime::{Handle, RuntimeFlavor};

use super::playback::{AudioOutput, AudioSink, CHANNELS, CompletionCallback, SAMPLE_RATE};
use crate::{Error, Result};

/// Opens a [`CpalSink`] on the default output device for each utterance
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalOutput;

impl AudioOutput for CpalOutput {
    fn open_sink(&self) -> Result<Box<dyn AudioSink>> {
        Ok(Box::new(CpalSink::new()))
    }
}

struct QueuedBuffer {
    samples: Vec<f32>,
    position: usize,
    on_complete: Option<CompletionCallback>,
}

/// Buffers waiting to be written to the device, in schedule order
#[derive(Default)]
struct PlaybackQueue {
    buffers: VecDeque<QueuedBuffer>,
}

impl PlaybackQueue {
    fn push(&mut self, samples: Vec<f32>, on_complete: CompletionCallback) {
        self.buffers.push_back(QueuedBuffer {
            samples,
            position: 0,
            on_complete: Some(on_complete),
        });
    }

    /// Next sample to play, or silence when empty
    ///
    /// Callbacks of buffers that ran out are moved into `finished` so they can
    /// run after the queue lock is released.
    fn next_sample(&mut self, finished: &mut Vec<CompletionCallback>) -> f32 {
        while let Some(front) = self.buffers.front_mut() {
            if let Some(&sample) = front.samples.get(front.position) {
                front.position += 1;
                if front.position == front.samples.len() {
                    self.retire_front(finished);
                }
                return sample;
            }
            self.retire_front(finished);
        }
        0.0
    }

    fn retire_front(&mut self, finished: &mut Vec<CompletionCallback>) {
        if let Some(cb) = self.buffers.pop_front().and_then(|b| b.on_complete) {
            finished.push(cb);
        }
    }

    fn clear(&mut self) {
        self.buffers.clear();
    }
}

/// Plays scheduled buffers on the default output device
///
/// `cpal::Stream` is not `Send`, so the stream lives on a dedicated thread
/// that parks until [`AudioSink::stop`]. Stopping signals the thread and
/// returns; the thread drops the stream on its own.
pub struct CpalSink {
    queue: Arc<Mutex<PlaybackQueue>>,
    shutdown: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalSink {
    /// Create an unstarted sink
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: Arc::new(Mutex::new(PlaybackQueue::default())),
            shutdown: None,
            thread: None,
        }
    }
}

impl Default for CpalSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for CpalSink {
    fn start(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }

        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();
        let queue = Arc::clone(&self.queue);

        let thread = std::thread::Builder::new()
            .name("clarion-audio".to_string())
            .spawn(move || {
                let stream = match open_stream(queue) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Returns on explicit shutdown or when the sender is dropped
                let _ = shutdown_rx.recv();
                drop(stream);
            })?;

        match wait_blocking(|| ready_rx.recv()) {
            Ok(Ok(())) => {
                self.shutdown = Some(shutdown_tx);
                self.thread = Some(thread);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Audio("audio thread exited during startup".to_string())),
        }
    }

    fn schedule(&mut self, samples: Vec<f32>, on_complete: CompletionCallback) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push(samples, on_complete);
        }
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.thread = None;
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run a blocking wait without stalling other tasks on the runtime
///
/// Outside a multi-threaded runtime the wait simply runs in place.
fn wait_blocking<T>(wait: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(wait)
        }
        _ => wait(),
    }
}

/// Open and start an output stream fed from `queue`
fn open_stream(queue: Arc<Mutex<PlaybackQueue>>) -> Result<Stream> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

    let config = output_config(&device)?;
    let channels = usize::from(config.channels);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut finished = Vec::new();
                match queue.lock() {
                    Ok(mut queue) => {
                        for frame in data.chunks_mut(channels) {
                            frame.fill(queue.next_sample(&mut finished));
                        }
                    }
                    Err(_) => data.fill(0.0),
                }
                for cb in finished {
                    cb();
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = SAMPLE_RATE,
        channels,
        "audio output opened"
    );

    Ok(stream)
}

/// Pick a mono config at [`SAMPLE_RATE`], falling back to stereo
fn output_config(device: &cpal::Device) -> Result<StreamConfig> {
    let supports = |channels: u16| -> Result<Option<StreamConfig>> {
        Ok(device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == channels
                    && c.sample_format() == cpal::SampleFormat::F32
                    && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
            })
            .map(|c| c.with_sample_rate(SampleRate(SAMPLE_RATE)).config()))
    };

    if let Some(config) = supports(CHANNELS)? {
        return Ok(config);
    }
    // Stereo fallback duplicates each sample across both channels
    supports(2)?.ok_or_else(|| Error::Audio("no suitable output config found".to_string()))
}
