//! Streaming TTS session over WebSocket
//!
//! A [`StreamingSession`] owns one provider connection for one utterance.
//! Text goes out as JSON `Speak` frames with explicit `Flush` control frames;
//! audio comes back as raw linear16 binary frames. Everything inbound is
//! delivered on a [`SessionEvent`] channel.
//!
//! `connect` is optimistic: it returns once the connection task is spawned and
//! outbound frames queue until the handshake completes. Failures at any stage
//! tear the session down and surface exactly once as
//! [`SessionEvent::Closed`]. Nothing is retried.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, Request, header};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};

use super::playback::SAMPLE_RATE;
use crate::error::Stage;
use crate::{Error, Result};

/// Unflushed characters allowed before an implicit flush
pub const FLUSH_THRESHOLD: usize = 900;

/// Provider hard limit per `Speak` frame
pub const MAX_MESSAGE_CHARS: usize = 2000;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not yet connected
    Idle,
    /// Connection task starting
    Connecting,
    /// Accepting text
    Open,
    /// Graceful close in progress
    Closing,
    /// Finished; all further calls are no-ops
    Closed,
}

/// Inbound traffic from the provider
#[derive(Debug)]
pub enum SessionEvent {
    /// Raw linear16 PCM
    Audio(Bytes),
    /// Parsed JSON control frame
    Control(ControlFrame),
    /// Session ended on the provider side or failed
    Closed(Option<Error>),
}

/// JSON control frame sent by the provider (`Metadata`, `Flushed`, `Warning`, ...)
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ControlFrame {
    /// Frame type
    #[serde(rename = "type")]
    pub kind: String,

    /// Remaining fields
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl ControlFrame {
    /// Human-readable message carried by warnings, if any
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        ["warn_msg", "description", "err_msg"]
            .iter()
            .find_map(|key| self.fields.get(*key).and_then(serde_json::Value::as_str))
    }
}

/// Outbound JSON frames
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ClientMessage<'a> {
    Speak { text: &'a str },
    Flush,
    Clear,
    Close,
}

enum Outbound {
    Frame(Message),
    Shutdown,
}

/// One streaming connection to the provider
pub struct StreamingSession {
    state: SessionState,
    unflushed_chars: usize,
    flushes_sent: usize,
    input_ended: bool,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    /// Set by the connection task once the handshake completes
    connected: Arc<AtomicBool>,
    /// Set by whichever side ends the session first
    terminated: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl StreamingSession {
    /// Create an idle session
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            unflushed_chars: 0,
            flushes_sent: 0,
            input_ended: false,
            outbound: None,
            connected: Arc::new(AtomicBool::new(false)),
            terminated: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    /// Open the connection and start the receive loop
    ///
    /// Returns without waiting for the handshake. Must be called from within
    /// a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the session was already used or the endpoint or
    /// credential cannot form a valid request
    pub fn connect(
        &mut self,
        base_url: &str,
        credential: &str,
        voice: &str,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(Error::Config("session already connected".to_string()));
        }

        let request = build_request(base_url, credential, voice)?;
        self.state = SessionState::Connecting;

        let (tx, rx) = mpsc::unbounded_channel();
        let connected = Arc::clone(&self.connected);
        let terminated = Arc::clone(&self.terminated);
        self.task = Some(tokio::spawn(run_connection(request, rx, events, connected, terminated)));
        self.outbound = Some(tx);

        tracing::debug!(voice, "streaming session opening");
        Ok(())
    }

    /// Current state
    ///
    /// `Connecting` becomes `Open` when the handshake completes, and `Closing`
    /// becomes `Closed` once the connection task has finished.
    #[must_use]
    pub fn state(&self) -> SessionState {
        match self.state {
            SessionState::Connecting | SessionState::Open
                if self.terminated.load(Ordering::Acquire) =>
            {
                SessionState::Closed
            }
            SessionState::Connecting if self.connected.load(Ordering::Acquire) => SessionState::Open,
            SessionState::Closing if self.task.as_ref().is_none_or(JoinHandle::is_finished) => {
                SessionState::Closed
            }
            state => state,
        }
    }

    /// Whether text can be sent
    ///
    /// True while connecting as well; frames queue until the handshake is done.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self.state(), SessionState::Connecting | SessionState::Open)
    }

    /// Characters sent since the last flush
    #[must_use]
    pub const fn unflushed_chars(&self) -> usize {
        self.unflushed_chars
    }

    /// Flush frames sent so far, including implicit ones
    #[must_use]
    pub const fn flushes_sent(&self) -> usize {
        self.flushes_sent
    }

    /// Record that the caller has no more text for this session
    pub fn end_input(&mut self) {
        self.input_ended = true;
    }

    /// Whether [`end_input`](Self::end_input) has been called
    #[must_use]
    pub const fn input_ended(&self) -> bool {
        self.input_ended
    }

    /// Queue a segment for synthesis
    ///
    /// Flushes first when the segment would push the unflushed count past
    /// [`FLUSH_THRESHOLD`]. An oversized segment is never split: whatever is
    /// buffered is flushed and the segment is sent on its own.
    pub fn send(&mut self, text: &str) {
        if !self.is_open() {
            return;
        }

        let chars = text.chars().count();
        if chars > MAX_MESSAGE_CHARS {
            tracing::warn!(chars, limit = MAX_MESSAGE_CHARS, "segment exceeds provider message limit");
        }

        if self.unflushed_chars > 0 && self.unflushed_chars + chars > FLUSH_THRESHOLD {
            self.flush();
        }

        self.queue(&ClientMessage::Speak { text });
        self.unflushed_chars += chars;
    }

    /// Ask the provider to synthesize everything buffered
    pub fn flush(&mut self) {
        if !self.is_open() {
            return;
        }
        self.queue(&ClientMessage::Flush);
        self.unflushed_chars = 0;
        self.flushes_sent += 1;
    }

    /// Discard buffered, unsynthesized text on the provider side
    pub fn clear(&mut self) {
        if !self.is_open() {
            return;
        }
        self.queue(&ClientMessage::Clear);
        self.unflushed_chars = 0;
    }

    /// Send the graceful-end frame and shut the transport down
    ///
    /// No [`SessionEvent::Closed`] is emitted for a caller-initiated close.
    pub fn close(&mut self) {
        if !self.is_open() {
            return;
        }

        self.state = SessionState::Closing;
        self.queue(&ClientMessage::Close);
        self.terminated.store(true, Ordering::Release);
        if let Some(tx) = self.outbound.take() {
            let _ = tx.send(Outbound::Shutdown);
        }
        self.unflushed_chars = 0;
        tracing::debug!("streaming session closing");
    }

    fn queue(&self, message: &ClientMessage<'_>) {
        let Some(tx) = self.outbound.as_ref() else {
            return;
        };
        match serde_json::to_string(message) {
            Ok(json) => {
                if tx.send(Outbound::Frame(Message::text(json))).is_err() {
                    tracing::debug!("connection task gone, dropping frame");
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to encode control frame"),
        }
    }
}

impl Default for StreamingSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Build the `/v1/speak` URL for `voice`
///
/// # Errors
///
/// Returns error if `base_url` is not a valid URL
pub fn speak_url(base_url: &str, voice: &str) -> Result<Url> {
    let mut url = Url::parse(base_url)
        .and_then(|u| u.join("/v1/speak"))
        .map_err(|e| Error::Config(format!("invalid streaming endpoint {base_url}: {e}")))?;
    url.query_pairs_mut()
        .append_pair("encoding", "linear16")
        .append_pair("sample_rate", &SAMPLE_RATE.to_string())
        .append_pair("model", voice);
    Ok(url)
}

fn build_request(base_url: &str, credential: &str, voice: &str) -> Result<Request<()>> {
    let url = speak_url(base_url, voice)?;
    let mut request = url.as_str().into_client_request()?;
    let auth = HeaderValue::from_str(&format!("Token {credential}"))
        .map_err(|_| Error::Config("credential contains invalid header characters".to_string()))?;
    request.headers_mut().insert(header::AUTHORIZATION, auth);
    Ok(request)
}

/// Report the end of the session unless someone already did
fn report_closed(
    terminated: &AtomicBool,
    events: &mpsc::UnboundedSender<SessionEvent>,
    error: Option<Error>,
) {
    if terminated.swap(true, Ordering::AcqRel) {
        return;
    }
    match &error {
        Some(e) => tracing::warn!(stage = ?e.stage(), error = %e, "streaming session failed"),
        None => tracing::debug!("streaming session closed by provider"),
    }
    let _ = events.send(SessionEvent::Closed(error));
}

fn connect_error(err: tungstenite::Error) -> Error {
    match err {
        tungstenite::Error::Http(response) => Error::Provider(format!(
            "streaming handshake rejected with status {}",
            response.status()
        )),
        other => Error::transport(Stage::Connect, other),
    }
}

fn handle_control(text: &str, events: &mpsc::UnboundedSender<SessionEvent>) {
    let frame = match serde_json::from_str::<ControlFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(error = %e, "ignoring unparseable control frame");
            return;
        }
    };

    match frame.kind.as_str() {
        "Warning" => tracing::warn!(
            message = frame.message().unwrap_or("unknown"),
            "provider warning"
        ),
        "Metadata" => tracing::debug!(fields = ?frame.fields, "session metadata"),
        kind => tracing::debug!(kind, "control frame"),
    }
    let _ = events.send(SessionEvent::Control(frame));
}

async fn run_connection(
    request: Request<()>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<SessionEvent>,
    connected: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
) {
    let ws = match tokio_tungstenite::connect_async(request).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            report_closed(&terminated, &events, Some(connect_error(e)));
            return;
        }
    };
    connected.store(true, Ordering::Release);
    tracing::debug!("streaming session connected");

    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(Outbound::Frame(msg)) => {
                    if let Err(e) = sink.send(msg).await {
                        report_closed(&terminated, &events, Some(Error::transport(Stage::Send, e)));
                        break;
                    }
                }
                Some(Outbound::Shutdown) | None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Binary(data))) => {
                    if !terminated.load(Ordering::Acquire) {
                        let _ = events.send(SessionEvent::Audio(data));
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    if !terminated.load(Ordering::Acquire) {
                        handle_control(text.as_str(), &events);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let error = frame
                        .filter(|f| f.code != CloseCode::Normal)
                        .map(|f| Error::Provider(format!(
                            "session closed by provider ({}): {}",
                            u16::from(f.code),
                            f.reason.as_str()
                        )));
                    report_closed(&terminated, &events, error);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    report_closed(&terminated, &events, Some(Error::transport(Stage::Receive, e)));
                    break;
                }
                None => {
                    report_closed(&terminated, &events, None);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio_tungstenite::WebSocketStream;

    use super::*;

    type ServerWs = WebSocketStream<tokio::net::TcpStream>;

    /// Accept one WebSocket connection and hand it to `handler`
    async fn spawn_server<F, Fut>(handler: F) -> String
    where
        F: FnOnce(ServerWs) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            handler(ws).await;
        });
        format!("ws://{addr}")
    }

    /// Collect text frames until the client closes
    async fn record_text(mut ws: ServerWs, out: mpsc::UnboundedSender<String>) {
        while let Some(Ok(msg)) = ws.next().await {
            match msg {
                Message::Text(t) => {
                    let _ = out.send(t.as_str().to_string());
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    }

    async fn wait_for_state(session: &StreamingSession, want: SessionState) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while session.state() != want {
            assert!(tokio::time::Instant::now() < deadline, "session never reached {want:?}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("event channel closed")
    }

    #[test]
    fn speak_url_carries_audio_format_and_voice() {
        let url = speak_url("wss://api.deepgram.com", "aura-2-thalia-en").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://api.deepgram.com/v1/speak?encoding=linear16&sample_rate=48000&model=aura-2-thalia-en"
        );
        assert!(speak_url("not a url", "v").is_err());
    }

    #[test]
    fn client_messages_serialize_to_provider_format() {
        let speak = serde_json::to_string(&ClientMessage::Speak { text: "hi" }).unwrap();
        assert_eq!(speak, r#"{"type":"Speak","text":"hi"}"#);
        assert_eq!(serde_json::to_string(&ClientMessage::Flush).unwrap(), r#"{"type":"Flush"}"#);
        assert_eq!(serde_json::to_string(&ClientMessage::Clear).unwrap(), r#"{"type":"Clear"}"#);
        assert_eq!(serde_json::to_string(&ClientMessage::Close).unwrap(), r#"{"type":"Close"}"#);
    }

    #[test]
    fn control_frame_exposes_warning_message() {
        let frame: ControlFrame =
            serde_json::from_str(r#"{"type":"Warning","warn_msg":"slow down","warn_code":"X"}"#).unwrap();
        assert_eq!(frame.kind, "Warning");
        assert_eq!(frame.message(), Some("slow down"));
    }

    #[test]
    fn calls_before_connect_are_noops() {
        let mut session = StreamingSession::new();
        session.send("hello");
        session.flush();
        session.clear();
        session.close();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.unflushed_chars(), 0);
    }

    #[tokio::test]
    async fn flushes_before_send_that_crosses_threshold() {
        let (frames_tx, mut frames) = mpsc::unbounded_channel();
        let url = spawn_server(move |ws| record_text(ws, frames_tx)).await;

        let (events_tx, _events) = mpsc::unbounded_channel();
        let mut session = StreamingSession::new();
        session.connect(&url, "secret", "aura-2-thalia-en", events_tx).unwrap();
        assert!(session.is_open());

        let first = "a".repeat(950);
        let second = "b".repeat(50);
        session.send(&first);
        assert_eq!(session.unflushed_chars(), 950);
        session.send(&second);
        assert_eq!(session.unflushed_chars(), 50);
        assert_eq!(session.flushes_sent(), 1);
        session.close();
        assert!(!session.is_open());

        let mut received = Vec::new();
        while let Some(frame) = frames.recv().await {
            received.push(serde_json::from_str::<serde_json::Value>(&frame).unwrap());
        }
        let kinds: Vec<&str> = received.iter().map(|v| v["type"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["Speak", "Flush", "Speak", "Close"]);
        assert_eq!(received[0]["text"].as_str().unwrap().len(), 950);
        assert_eq!(received[2]["text"].as_str().unwrap().len(), 50);

        wait_for_state(&session, SessionState::Closed).await;
    }

    #[tokio::test]
    async fn state_follows_handshake_and_shutdown() {
        // Accepts TCP through the backlog but holds the handshake back
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let (events_tx, _events) = mpsc::unbounded_channel();
        let mut session = StreamingSession::new();
        session.connect(&url, "secret", "voice", events_tx).unwrap();
        assert_eq!(session.state(), SessionState::Connecting);
        session.send("queued while connecting");
        assert_eq!(session.unflushed_chars(), 23);

        let (frames_tx, mut frames) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            record_text(ws, frames_tx).await;
        });
        wait_for_state(&session, SessionState::Open).await;

        session.close();
        assert!(matches!(session.state(), SessionState::Closing | SessionState::Closed));
        wait_for_state(&session, SessionState::Closed).await;

        let mut kinds = Vec::new();
        while let Some(frame) = frames.recv().await {
            let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
            kinds.push(v["type"].as_str().unwrap().to_string());
        }
        assert_eq!(kinds, vec!["Speak", "Close"]);
    }

    #[tokio::test]
    async fn clear_resets_counter_and_close_silences_session() {
        let (frames_tx, mut frames) = mpsc::unbounded_channel();
        let url = spawn_server(move |ws| record_text(ws, frames_tx)).await;

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut session = StreamingSession::new();
        session.connect(&url, "secret", "voice", events_tx).unwrap();
        session.send("hello");
        session.clear();
        assert_eq!(session.unflushed_chars(), 0);
        session.close();

        // No-ops after close
        session.send("ignored");
        session.flush();

        let mut kinds = Vec::new();
        while let Some(frame) = frames.recv().await {
            let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
            kinds.push(v["type"].as_str().unwrap().to_string());
        }
        assert_eq!(kinds, vec!["Speak", "Clear", "Close"]);

        // Caller-initiated close is not reported
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn forwards_audio_and_control_then_reports_remote_close_once() {
        let url = spawn_server(|mut ws| async move {
            ws.send(Message::text(r#"{"type":"Metadata","request_id":"r1"}"#)).await.unwrap();
            ws.send(Message::binary(vec![1u8, 2])).await.unwrap();
            ws.send(Message::text(r#"{"type":"Warning","warn_msg":"careful"}"#)).await.unwrap();
            ws.send(Message::binary(vec![3u8, 4])).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut session = StreamingSession::new();
        session.connect(&url, "secret", "voice", events_tx).unwrap();

        assert!(matches!(next_event(&mut events).await, SessionEvent::Control(f) if f.kind == "Metadata"));
        assert!(matches!(next_event(&mut events).await, SessionEvent::Audio(b) if b == vec![1u8, 2]));
        assert!(matches!(next_event(&mut events).await, SessionEvent::Control(f) if f.message() == Some("careful")));
        assert!(matches!(next_event(&mut events).await, SessionEvent::Audio(b) if b == vec![3u8, 4]));
        assert!(matches!(next_event(&mut events).await, SessionEvent::Closed(None)));

        // Exactly once
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(session.state(), SessionState::Closed);

        // Teardown made the session inert
        session.send("late");
        assert_eq!(session.unflushed_chars(), 0);
    }

    #[tokio::test]
    async fn connect_failure_is_reported_as_transport_error() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut session = StreamingSession::new();
        session
            .connect(&format!("ws://{addr}"), "secret", "voice", events_tx)
            .unwrap();
        // Optimistically open until the failure lands
        session.send("queued");

        match next_event(&mut events).await {
            SessionEvent::Closed(Some(Error::Transport { stage, .. })) => {
                assert_eq!(stage, Stage::Connect);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn second_connect_is_rejected() {
        let url = spawn_server(|ws| async move {
            let (tx, _rx) = mpsc::unbounded_channel();
            record_text(ws, tx).await;
        })
        .await;

        let (events_tx, _events) = mpsc::unbounded_channel();
        let mut session = StreamingSession::new();
        session.connect(&url, "secret", "voice", events_tx.clone()).unwrap();
        assert!(session.connect(&url, "secret", "voice", events_tx).is_err());
    }
}
