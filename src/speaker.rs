//! Speech orchestrator
//!
//! A [`Speaker`] is a handle to one controller task that owns every piece of
//! utterance state. Short text goes through a one-shot REST request; long text
//! is chunked and streamed over a [`StreamingSession`]. Either way decoded
//! audio ends up in an [`AudioStreamPlayer`].
//!
//! ```text
//!  Speaker ──Command──▶ controller ──▶ ActiveUtterance
//!                          ▲             ├─ StreamingSession ◀─ feed task
//!                          │             ├─ AudioStreamPlayer ─▶ AudioSink
//!                          └── events ───┴─ REST task
//! ```
//!
//! Each utterance has its own event channels. Replacing or stopping an
//! utterance drops its receivers, so a superseded session can never feed
//! audio to the next one.

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::Config;
use crate::voice::{
    AudioOutput, AudioStreamPlayer, PlayerEvent, SessionEvent, StreamingSession, TextToSpeech,
    chunk, decode_wav, resolve_voice,
};
use crate::Result;

/// Observable speaker state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpeechStatus {
    /// An utterance is active
    pub speaking: bool,
    /// A streaming session is open
    pub session_open: bool,
}

/// How an utterance is synthesized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechPath {
    /// One-shot request returning a WAV file
    Rest,
    /// Chunked text over a streaming session
    Stream,
}

/// Text accepted for speaking
#[derive(Debug, Clone)]
struct Utterance {
    id: u64,
    text: String,
    voice: String,
    path: SpeechPath,
}

enum Command {
    Speak {
        text: String,
        ack: oneshot::Sender<()>,
    },
    Stop {
        ack: oneshot::Sender<()>,
    },
    SetVoice {
        voice: String,
        ack: oneshot::Sender<()>,
    },
    SetCredential {
        credential: Option<String>,
        ack: oneshot::Sender<()>,
    },
    Settings {
        ack: oneshot::Sender<(Option<String>, String)>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Handle to the speech controller
///
/// Cheap to clone. The controller stops when [`shutdown`](Self::shutdown) is
/// called or every handle is dropped.
#[derive(Clone)]
pub struct Speaker {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SpeechStatus>,
    tts: TextToSpeech,
}

impl Speaker {
    /// Spawn the controller task
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn spawn(config: &Config, output: Arc<dyn AudioOutput>) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let (status_tx, status_rx) = watch::channel(SpeechStatus::default());
        let tts = TextToSpeech::new(config.provider.rest_url.clone());

        let controller = Controller {
            tts: tts.clone(),
            output,
            stream_url: config.provider.stream_url.clone(),
            detect_language: config.voice.detect_language,
            stream_threshold: config.speech.stream_threshold,
            flush_every: config.speech.flush_every.max(1),
            send_interval: config.speech.send_interval,
            rest_timeout: config.speech.rest_timeout,
            stream_idle_timeout: config.speech.stream_idle_timeout,
            credential: config.api_key.clone(),
            voice: config.voice.model.clone(),
            status: status_tx,
            active: None,
            next_id: 0,
        };
        tokio::spawn(controller.run(commands_rx));

        Self {
            commands: commands_tx,
            status: status_rx,
            tts,
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (ack, done) = oneshot::channel();
        if self.commands.send(make(ack)).await.is_err() {
            tracing::debug!("speech controller has stopped");
            return None;
        }
        done.await.ok()
    }

    /// Speak `text`, replacing whatever is currently playing
    ///
    /// Returns once the previous utterance is torn down and the new one has
    /// started. Does nothing without a credential or for blank text.
    pub async fn speak(&self, text: impl Into<String>) {
        let text = text.into();
        self.request(|ack| Command::Speak { text, ack }).await;
    }

    /// Stop the current utterance
    pub async fn stop(&self) {
        self.request(|ack| Command::Stop { ack }).await;
    }

    /// Change the voice used for subsequent utterances
    pub async fn set_voice(&self, voice: impl Into<String>) {
        let voice = voice.into();
        self.request(|ack| Command::SetVoice { voice, ack }).await;
    }

    /// Replace or clear the provider credential
    pub async fn set_credential(&self, credential: Option<String>) {
        self.request(|ack| Command::SetCredential { credential, ack }).await;
    }

    /// Whether `credential` is accepted by the provider
    pub async fn test_connection(&self, credential: &str) -> bool {
        self.tts.test_connection(credential).await
    }

    /// Fetch a WAV preview of a voice
    ///
    /// Falls back to the configured credential and the selected voice.
    pub async fn fetch_sample(&self, credential: Option<&str>, voice: Option<&str>) -> Option<Vec<u8>> {
        let (stored_credential, stored_voice) = self.request(|ack| Command::Settings { ack }).await?;
        let credential = credential.map(ToString::to_string).or(stored_credential)?;
        let voice = voice.map_or(stored_voice, ToString::to_string);
        self.tts.fetch_sample(&credential, &voice).await
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> SpeechStatus {
        *self.status.borrow()
    }

    /// Watch status changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SpeechStatus> {
        self.status.clone()
    }

    /// Wait until nothing is speaking
    pub async fn wait_idle(&self) {
        let mut rx = self.status.clone();
        let _ = rx.wait_for(|s| !s.speaking).await;
    }

    /// Stop playback and end the controller task
    pub async fn shutdown(&self) {
        self.request(|ack| Command::Shutdown { ack }).await;
    }
}

/// Everything owned by the utterance currently playing
struct ActiveUtterance {
    utterance: Utterance,
    session: Option<Arc<Mutex<StreamingSession>>>,
    session_events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    flushes_acked: usize,
    /// When a quiet provider stops being waited on
    idle_deadline: Option<Instant>,
    player: Option<AudioStreamPlayer>,
    player_events: mpsc::UnboundedReceiver<PlayerEvent>,
    player_tx: mpsc::UnboundedSender<PlayerEvent>,
    cancel: watch::Sender<bool>,
    feed: Option<JoinHandle<()>>,
    rest: Option<JoinHandle<()>>,
    rest_result: Option<oneshot::Receiver<Result<Vec<u8>>>>,
}

impl ActiveUtterance {
    fn new(utterance: Utterance) -> Self {
        let (player_tx, player_events) = mpsc::unbounded_channel();
        let (cancel, _) = watch::channel(false);
        Self {
            utterance,
            session: None,
            session_events: None,
            flushes_acked: 0,
            idle_deadline: None,
            player: None,
            player_events,
            player_tx,
            cancel,
            feed: None,
            rest: None,
            rest_result: None,
        }
    }

    fn session_open(&self) -> bool {
        self.session.as_ref().is_some_and(|s| lock(s).is_open())
    }

    /// Release everything; `interrupt` discards text the provider has not spoken yet
    fn teardown(mut self, interrupt: bool) {
        let _ = self.cancel.send(true);
        drop(self.feed.take());
        if let Some(rest) = self.rest.take() {
            rest.abort();
        }
        if let Some(session) = self.session.take() {
            let mut session = lock(&session);
            if interrupt {
                session.clear();
            }
            session.close();
        }
        if let Some(mut player) = self.player.take() {
            player.stop();
        }
        tracing::debug!(id = self.utterance.id, interrupt, "utterance ended");
    }
}

enum UtteranceEvent {
    Session(SessionEvent),
    Player(PlayerEvent),
    Rest(Result<Vec<u8>>),
    StreamIdle,
}

async fn recv_session(rx: &mut Option<mpsc::UnboundedReceiver<SessionEvent>>) -> Option<SessionEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => None,
    }
}

async fn recv_rest(rx: &mut Option<oneshot::Receiver<Result<Vec<u8>>>>) -> Option<Result<Vec<u8>>> {
    match rx {
        Some(rx) => Some(rx.await.unwrap_or(Err(crate::Error::Cancelled))),
        None => None,
    }
}

async fn idle_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Next event for the active utterance; pending forever when idle
async fn next_event(active: &mut Option<ActiveUtterance>) -> UtteranceEvent {
    let Some(active) = active.as_mut() else {
        return std::future::pending().await;
    };

    tokio::select! {
        Some(event) = recv_session(&mut active.session_events) => UtteranceEvent::Session(event),
        Some(event) = active.player_events.recv() => UtteranceEvent::Player(event),
        Some(result) = recv_rest(&mut active.rest_result) => UtteranceEvent::Rest(result),
        () = idle_timer(active.idle_deadline) => UtteranceEvent::StreamIdle,
        else => std::future::pending().await,
    }
}

struct Controller {
    tts: TextToSpeech,
    output: Arc<dyn AudioOutput>,
    stream_url: String,
    detect_language: bool,
    stream_threshold: usize,
    flush_every: usize,
    send_interval: Duration,
    rest_timeout: Duration,
    stream_idle_timeout: Duration,
    credential: Option<String>,
    voice: String,
    status: watch::Sender<SpeechStatus>,
    active: Option<ActiveUtterance>,
    next_id: u64,
}

impl Controller {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        tracing::debug!("speech controller started");

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if self.handle_command(command).is_break() {
                        break;
                    }
                }
                event = next_event(&mut self.active) => self.handle_event(event),
            }
            self.publish();
        }

        self.stop_active();
        self.publish();
        tracing::debug!("speech controller stopped");
    }

    fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Speak { text, ack } => {
                self.speak(&text);
                self.publish();
                let _ = ack.send(());
            }
            Command::Stop { ack } => {
                self.stop_active();
                self.publish();
                let _ = ack.send(());
            }
            Command::SetVoice { voice, ack } => {
                tracing::info!(voice, "voice changed");
                self.voice = voice;
                let _ = ack.send(());
            }
            Command::SetCredential { credential, ack } => {
                self.credential = credential.filter(|c| !c.trim().is_empty());
                tracing::debug!(configured = self.credential.is_some(), "credential updated");
                let _ = ack.send(());
            }
            Command::Settings { ack } => {
                let _ = ack.send((self.credential.clone(), self.voice.clone()));
            }
            Command::Shutdown { ack } => {
                self.stop_active();
                self.publish();
                let _ = ack.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn speak(&mut self, text: &str) {
        let Some(credential) = self.credential.clone() else {
            tracing::warn!("no API key configured, ignoring speak request");
            return;
        };

        let trimmed = text.trim();
        if trimmed.is_empty() {
            tracing::debug!("ignoring blank speak request");
            return;
        }

        self.stop_active();

        let voice = if self.detect_language {
            resolve_voice(trimmed, &self.voice)
        } else {
            self.voice.clone()
        };
        let chars = trimmed.chars().count();
        let path = if chars < self.stream_threshold {
            SpeechPath::Rest
        } else {
            SpeechPath::Stream
        };

        self.next_id += 1;
        let utterance = Utterance {
            id: self.next_id,
            text: trimmed.to_string(),
            voice,
            path,
        };
        tracing::info!(id = utterance.id, chars, voice = %utterance.voice, path = ?path, "speaking");

        match path {
            SpeechPath::Rest => self.start_rest(utterance, credential),
            SpeechPath::Stream => self.start_stream(utterance, &credential),
        }
    }

    fn start_rest(&mut self, utterance: Utterance, credential: String) {
        let (result_tx, result_rx) = oneshot::channel();
        let tts = self.tts.clone();
        let text = utterance.text.clone();
        let voice = utterance.voice.clone();
        let timeout = self.rest_timeout;

        let task = tokio::spawn(async move {
            let result = tts.synthesize(&text, &voice, &credential, timeout).await;
            let _ = result_tx.send(result);
        });

        let mut active = ActiveUtterance::new(utterance);
        active.rest = Some(task);
        active.rest_result = Some(result_rx);
        self.active = Some(active);
    }

    fn start_stream(&mut self, utterance: Utterance, credential: &str) {
        let segments = chunk(&utterance.text);
        if segments.is_empty() {
            tracing::debug!(id = utterance.id, "nothing speakable after chunking");
            return;
        }

        let mut active = ActiveUtterance::new(utterance);

        let mut player = match self.output.open_sink() {
            Ok(sink) => AudioStreamPlayer::new(sink, active.player_tx.clone()),
            Err(e) => {
                tracing::error!(error = %e, "failed to open audio output");
                return;
            }
        };
        if player.start().is_err() {
            return;
        }

        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let mut session = StreamingSession::new();
        if let Err(e) = session.connect(&self.stream_url, credential, &active.utterance.voice, session_tx) {
            tracing::error!(error = %e, "failed to start streaming session");
            player.stop();
            return;
        }
        let session = Arc::new(Mutex::new(session));

        tracing::debug!(id = active.utterance.id, segments = segments.len(), "streaming utterance");
        let feed = tokio::spawn(feed_segments(
            Arc::clone(&session),
            segments,
            active.cancel.subscribe(),
            self.flush_every,
            self.send_interval,
        ));

        active.player = Some(player);
        active.session = Some(session);
        active.session_events = Some(session_rx);
        active.feed = Some(feed);
        active.idle_deadline = Some(Instant::now() + self.stream_idle_timeout);
        self.active = Some(active);
    }

    fn handle_event(&mut self, event: UtteranceEvent) {
        match event {
            UtteranceEvent::Session(event) => self.on_session_event(event),
            UtteranceEvent::Player(PlayerEvent::Drained) => self.finish(),
            UtteranceEvent::Rest(result) => self.on_rest_result(result),
            UtteranceEvent::StreamIdle => self.on_stream_idle(),
        }
    }

    fn on_session_event(&mut self, event: SessionEvent) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if let Some(deadline) = active.idle_deadline.as_mut() {
            *deadline = Instant::now() + self.stream_idle_timeout;
        }

        match event {
            SessionEvent::Audio(pcm) => {
                if let Some(player) = active.player.as_mut() {
                    player.enqueue(&pcm);
                }
            }
            SessionEvent::Control(frame) => {
                if frame.kind == "Flushed" {
                    active.flushes_acked += 1;
                    let input_complete = active.session.as_ref().is_some_and(|s| {
                        let s = lock(s);
                        s.input_ended() && active.flushes_acked >= s.flushes_sent()
                    });
                    if input_complete {
                        tracing::debug!(id = active.utterance.id, "all audio received");
                        active.idle_deadline = None;
                        if let Some(player) = active.player.as_mut() {
                            player.finish_input();
                        }
                    }
                }
            }
            SessionEvent::Closed(error) => {
                match &error {
                    Some(e) => tracing::warn!(
                        id = active.utterance.id,
                        stage = ?e.stage(),
                        error = %e,
                        "streaming session ended with error"
                    ),
                    None => tracing::debug!(id = active.utterance.id, "streaming session ended"),
                }

                let _ = active.cancel.send(true);
                active.session = None;
                active.session_events = None;
                active.idle_deadline = None;

                // Audio already scheduled keeps playing; Drained ends the utterance
                let Some(player) = active.player.as_mut() else {
                    self.finish();
                    return;
                };
                player.finish_input();
            }
        }
    }

    /// The provider went quiet while the utterance still waits for audio
    ///
    /// Flush acknowledgements can go missing (a rejected flush is answered
    /// with a `Warning`), so once all text is sent silence ends the input.
    fn on_stream_idle(&mut self) {
        let timeout = self.stream_idle_timeout;
        let Some(active) = self.active.as_mut() else {
            return;
        };

        let input_ended = active.session.as_ref().is_some_and(|s| lock(s).input_ended());
        if !input_ended {
            active.idle_deadline = Some(Instant::now() + timeout);
            return;
        }

        let flushes_sent = active.session.as_ref().map_or(0, |s| lock(s).flushes_sent());
        tracing::warn!(
            id = active.utterance.id,
            flushes_sent,
            flushes_acked = active.flushes_acked,
            "provider went quiet before acknowledging every flush, finishing playback"
        );
        active.idle_deadline = None;
        if let Some(player) = active.player.as_mut() {
            player.finish_input();
        }
    }

    fn on_rest_result(&mut self, result: Result<Vec<u8>>) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.rest = None;
        active.rest_result = None;

        let playback = result.and_then(|wav| decode_wav(&wav)).and_then(|samples| {
            let sink = self.output.open_sink()?;
            let mut player = AudioStreamPlayer::new(sink, active.player_tx.clone());
            player.start()?;
            player.enqueue_samples(&samples);
            player.finish_input();
            Ok(player)
        });

        match playback {
            Ok(player) => {
                tracing::debug!(id = active.utterance.id, "playing synthesized audio");
                active.player = Some(player);
            }
            Err(e) if e.is_cancellation() => self.finish(),
            Err(e) => {
                tracing::warn!(id = active.utterance.id, stage = ?e.stage(), error = %e, "one-shot synthesis failed");
                self.finish();
            }
        }
    }

    /// Natural end of the active utterance
    fn finish(&mut self) {
        if let Some(active) = self.active.take() {
            tracing::debug!(id = active.utterance.id, path = ?active.utterance.path, "utterance finished");
            active.teardown(false);
        }
    }

    fn stop_active(&mut self) {
        if let Some(active) = self.active.take() {
            active.teardown(true);
        }
    }

    fn publish(&self) {
        let next = self.active.as_ref().map_or_else(SpeechStatus::default, |active| SpeechStatus {
            speaking: true,
            session_open: active.session_open(),
        });
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

/// Send segments in order, flushing every `flush_every` and after the last
async fn feed_segments(
    session: Arc<Mutex<StreamingSession>>,
    segments: Vec<String>,
    mut cancel: watch::Receiver<bool>,
    flush_every: usize,
    interval: Duration,
) {
    let total = segments.len();

    for (index, segment) in segments.iter().enumerate() {
        if *cancel.borrow() {
            return;
        }

        let last = index + 1 == total;
        {
            let mut session = lock(&session);
            if !session.is_open() {
                return;
            }
            session.send(segment);
            if (index + 1) % flush_every == 0 || last {
                session.flush();
            }
            if last {
                session.end_input();
            }
        }

        if last {
            break;
        }

        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            _ = cancel.changed() => return,
        }
    }

    tracing::debug!(segments = total, "all segments sent");
}

fn lock(session: &Mutex<StreamingSession>) -> MutexGuard<'_, StreamingSession> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}
