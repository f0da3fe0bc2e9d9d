//! Shared test utilities
//!
//! [`FakeProvider`] serves the one-shot, auth and streaming endpoints on a
//! local port and records what it receives. [`MemoryOutput`] stands in for the
//! sound card.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;

use clarion::Config;
use clarion::voice::{AudioOutput, AudioSink, CompletionCallback, SAMPLE_RATE};

/// Credential the fake provider accepts
pub const VALID_KEY: &str = "good-key";

/// Samples in each audio frame sent per `Speak`
pub const FRAME_SAMPLES: usize = 480;

/// Samples in the WAV body returned by the one-shot endpoint
pub const WAV_SAMPLES: usize = 4800;

/// Sample value used for audio on the `n`th streaming connection (1-based)
#[must_use]
pub fn connection_sample(n: usize) -> i16 {
    i16::try_from(n * 1000).unwrap_or(i16::MAX)
}

/// One request to the one-shot endpoint
#[derive(Debug, Clone)]
pub struct RestRequest {
    pub query: HashMap<String, String>,
    pub authorization: Option<String>,
    pub content_type: Option<String>,
    pub body: String,
}

#[derive(Default)]
struct ProviderState {
    rest_status: Mutex<Option<StatusCode>>,
    rest_delay: Mutex<Duration>,
    rest_requests: Mutex<Vec<RestRequest>>,
    ws_queries: Mutex<Vec<HashMap<String, String>>>,
    frames: Mutex<Vec<(usize, serde_json::Value)>>,
    connections: AtomicUsize,
    rejected_flush: Mutex<Option<usize>>,
    hang_up: Mutex<Option<HangUp>>,
}

/// Provider-initiated close after a number of audio frames
#[derive(Clone, Copy)]
struct HangUp {
    after_frames: usize,
    code: u16,
}

/// Local stand-in for the TTS provider
pub struct FakeProvider {
    pub rest_url: String,
    pub stream_url: String,
    state: Arc<ProviderState>,
}

impl FakeProvider {
    /// Bind to an ephemeral port and start serving
    pub async fn start() -> Self {
        let state = Arc::new(ProviderState::default());
        let app = Router::new()
            .route("/v1/speak", get(stream_handler).post(rest_handler))
            .route("/v1/auth/token", get(auth_handler))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind fake provider");
        let addr = listener.local_addr().expect("no local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            rest_url: format!("http://{addr}"),
            stream_url: format!("ws://{addr}"),
            state,
        }
    }

    /// Make the one-shot endpoint answer with `status`
    pub fn fail_rest_with(&self, status: StatusCode) {
        *self.state.rest_status.lock().unwrap() = Some(status);
    }

    /// Delay one-shot responses
    pub fn delay_rest(&self, delay: Duration) {
        *self.state.rest_delay.lock().unwrap() = delay;
    }

    /// Answer the `n`th flush (1-based) of each connection with a `Warning`
    /// instead of `Flushed`
    pub fn reject_flush(&self, n: usize) {
        *self.state.rejected_flush.lock().unwrap() = Some(n);
    }

    /// Close each connection with `code` after sending `frames` audio frames
    pub fn hang_up_after(&self, frames: usize, code: u16) {
        *self.state.hang_up.lock().unwrap() = Some(HangUp {
            after_frames: frames,
            code,
        });
    }

    /// Requests seen by the one-shot endpoint
    pub fn rest_requests(&self) -> Vec<RestRequest> {
        self.state.rest_requests.lock().unwrap().clone()
    }

    /// Query strings of accepted streaming connections
    pub fn stream_queries(&self) -> Vec<HashMap<String, String>> {
        self.state.ws_queries.lock().unwrap().clone()
    }

    /// Number of accepted streaming connections
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Frame types received on connection `n` (1-based)
    pub fn frame_kinds(&self, n: usize) -> Vec<String> {
        self.frames(n)
            .iter()
            .filter_map(|f| f["type"].as_str().map(ToString::to_string))
            .collect()
    }

    /// JSON frames received on connection `n` (1-based)
    pub fn frames(&self, n: usize) -> Vec<serde_json::Value> {
        self.state
            .frames
            .lock()
            .unwrap()
            .iter()
            .filter(|(conn, _)| *conn == n)
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    /// Config pointing at this provider with a valid credential
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.api_key = Some(VALID_KEY.to_string());
        config.provider.rest_url = self.rest_url.clone();
        config.provider.stream_url = self.stream_url.clone();
        config.voice.detect_language = false;
        config.speech.send_interval = Duration::from_millis(1);
        config
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Token {VALID_KEY}"))
}

async fn rest_handler(
    State(state): State<Arc<ProviderState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let header_str = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
    };
    state.rest_requests.lock().unwrap().push(RestRequest {
        query,
        authorization: header_str(header::AUTHORIZATION),
        content_type: header_str(header::CONTENT_TYPE),
        body,
    });

    let delay = *state.rest_delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if let Some(status) = *state.rest_status.lock().unwrap() {
        return (status, "provider unavailable").into_response();
    }

    let samples = vec![1000i16; WAV_SAMPLES];
    ([(header::CONTENT_TYPE, "audio/wav")], wav_bytes(&samples)).into_response()
}

async fn auth_handler(headers: HeaderMap) -> StatusCode {
    if authorized(&headers) {
        StatusCode::OK
    } else {
        StatusCode::UNAUTHORIZED
    }
}

async fn stream_handler(
    State(state): State<Arc<ProviderState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    state.ws_queries.lock().unwrap().push(query);
    let id = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
    ws.on_upgrade(move |socket| serve_session(socket, state, id))
}

async fn serve_session(mut socket: WebSocket, state: Arc<ProviderState>, id: usize) {
    let pcm: Vec<u8> = std::iter::repeat_n(connection_sample(id), FRAME_SAMPLES)
        .flat_map(i16::to_le_bytes)
        .collect();
    let mut flushes = 0;
    let mut audio_frames = 0;
    let rejected_flush = *state.rejected_flush.lock().unwrap();
    let hang_up = *state.hang_up.lock().unwrap();

    let _ = socket
        .send(Message::Text(
            r#"{"type":"Metadata","request_id":"fake"}"#.into(),
        ))
        .await;

    while let Some(Ok(msg)) = socket.recv().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(frame) = serde_json::from_str::<serde_json::Value>(text.as_str()) else {
            continue;
        };
        let kind = frame["type"].as_str().unwrap_or_default().to_string();
        state.frames.lock().unwrap().push((id, frame));

        let reply = match kind.as_str() {
            "Speak" => {
                audio_frames += 1;
                Some(Message::Binary(Bytes::from(pcm.clone())))
            }
            "Flush" => {
                flushes += 1;
                if rejected_flush == Some(flushes) {
                    Some(Message::Text(
                        r#"{"type":"Warning","warn_msg":"flush limit exceeded","warn_code":"FLUSH_LIMIT"}"#.into(),
                    ))
                } else {
                    Some(Message::Text(
                        format!(r#"{{"type":"Flushed","sequence_id":{flushes}}}"#).into(),
                    ))
                }
            }
            "Clear" => Some(Message::Text(r#"{"type":"Cleared"}"#.into())),
            "Close" => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            _ => None,
        };
        if let Some(reply) = reply {
            if socket.send(reply).await.is_err() {
                break;
            }
        }

        if let Some(hang_up) = hang_up.filter(|h| h.after_frames == audio_frames) {
            let frame = CloseFrame {
                code: hang_up.code,
                reason: "provider hang-up".into(),
            };
            let _ = socket.send(Message::Close(Some(frame))).await;
            break;
        }
    }
}

/// Encode mono 16-bit samples at the playback rate as WAV
pub fn wav_bytes(samples: &[i16]) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("wav writer");
        for &s in samples {
            writer.write_sample(s).expect("write sample");
        }
        writer.finalize().expect("finalize wav");
    }
    cursor.into_inner()
}

/// What one sink saw
#[derive(Default)]
pub struct SinkLog {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub buffers: Mutex<Vec<Vec<f32>>>,
    pending: Mutex<VecDeque<CompletionCallback>>,
}

impl SinkLog {
    /// Number of scheduled buffers
    pub fn buffer_count(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }

    /// All samples scheduled, in order
    pub fn samples(&self) -> Vec<f32> {
        self.buffers.lock().unwrap().concat()
    }

    /// Finish the oldest pending buffer; false when none is pending
    pub fn complete_next(&self) -> bool {
        let next = self.pending.lock().unwrap().pop_front();
        next.map(|cb| cb()).is_some()
    }

    /// Finish every pending buffer, oldest first
    pub fn complete_all(&self) {
        loop {
            let next = self.pending.lock().unwrap().pop_front();
            match next {
                Some(cb) => cb(),
                None => break,
            }
        }
    }

    pub fn stopped(&self) -> bool {
        self.stops.load(Ordering::SeqCst) > 0
    }
}

struct MemorySink {
    log: Arc<SinkLog>,
    auto_complete: bool,
}

impl AudioSink for MemorySink {
    fn start(&mut self) -> clarion::Result<()> {
        self.log.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn schedule(&mut self, samples: Vec<f32>, on_complete: CompletionCallback) {
        self.log.buffers.lock().unwrap().push(samples);
        if self.auto_complete {
            on_complete();
        } else {
            self.log.pending.lock().unwrap().push_back(on_complete);
        }
    }

    fn stop(&mut self) {
        self.log.stops.fetch_add(1, Ordering::SeqCst);
        self.log.pending.lock().unwrap().clear();
    }
}

/// Audio output that records every sink it opens
#[derive(Clone, Default)]
pub struct MemoryOutput {
    sinks: Arc<Mutex<Vec<Arc<SinkLog>>>>,
    auto_complete: bool,
}

impl MemoryOutput {
    /// Buffers finish as soon as they are scheduled
    pub fn auto_complete() -> Self {
        Self {
            auto_complete: true,
            ..Self::default()
        }
    }

    /// Buffers finish only through [`SinkLog::complete_all`]
    pub fn manual() -> Self {
        Self::default()
    }

    pub fn sinks(&self) -> Vec<Arc<SinkLog>> {
        self.sinks.lock().unwrap().clone()
    }

    pub fn sink(&self, index: usize) -> Arc<SinkLog> {
        Arc::clone(&self.sinks.lock().unwrap()[index])
    }
}

impl AudioOutput for MemoryOutput {
    fn open_sink(&self) -> clarion::Result<Box<dyn AudioSink>> {
        let log = Arc::new(SinkLog::default());
        self.sinks.lock().unwrap().push(Arc::clone(&log));
        Ok(Box::new(MemorySink {
            log,
            auto_complete: self.auto_complete,
        }))
    }
}

/// Poll `check` until it holds or five seconds pass
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Text long enough to take the streaming path: twelve ~100 character sentences
pub fn long_text() -> String {
    (1..=12)
        .map(|i| {
            format!(
                "Sentence number {i:02} describes the quiet harbor at dawn, where boats rest and gulls circle."
            )
        })
        .collect::<Vec<_>>()
        .join(" ")
}
