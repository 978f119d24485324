//! Streaming speech-to-text over a provider WebSocket.
//!
//! One connection per call. Audio frames are forwarded as binary
//! messages; results come back as JSON text messages. On a provider
//! disconnect the task reopens the socket, replays the last ~2 s of
//! audio, and keeps the in-flight utterance id. Three reconnects inside
//! a 10 s window trip the breaker and the stream reports
//! [`AsrEvent::Unavailable`].

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use vl_domain::config::AsrConfig;
use vl_domain::error::{Error, Result};
use vl_domain::trace::TraceEvent;
use vl_media::FRAME_MS;

use crate::traits::{AsrEvent, AsrInput, AsrStream, SpeechToText, Transcript};

const EVENT_QUEUE: usize = 64;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reconnect breaker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Sliding-window reconnect counter. Trips after `max` reconnects within
/// `window`.
pub struct ReconnectTracker {
    window: Duration,
    max: u32,
    attempts: VecDeque<Instant>,
}

impl ReconnectTracker {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            window,
            max,
            attempts: VecDeque::new(),
        }
    }

    /// Record a reconnect at `now`. Returns the attempt number inside the
    /// window and whether the breaker tripped.
    pub fn record(&mut self, now: Instant) -> (u32, bool) {
        while let Some(front) = self.attempts.front() {
            if now.duration_since(*front) > self.window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
        self.attempts.push_back(now);
        let attempt = self.attempts.len() as u32;
        (attempt, attempt >= self.max)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider result parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pull `(text, is_final, confidence)` out of a provider results message.
/// Empty transcripts (silence keepalives) are skipped.
pub fn parse_provider_event(raw: &str) -> Option<(String, bool, f32)> {
    let v: Value = serde_json::from_str(raw).ok()?;
    if v.get("type").and_then(|t| t.as_str()) != Some("Results") {
        return None;
    }
    let alt = v
        .get("channel")?
        .get("alternatives")?
        .as_array()?
        .first()?;
    let text = alt.get("transcript")?.as_str()?.trim();
    if text.is_empty() {
        return None;
    }
    let confidence = alt
        .get("confidence")
        .and_then(|c| c.as_f64())
        .unwrap_or(0.0) as f32;
    let is_final = v.get("is_final").and_then(|f| f.as_bool()).unwrap_or(false);
    Some((text.to_owned(), is_final, confidence))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct WsAsr {
    cfg: AsrConfig,
}

impl WsAsr {
    pub fn new(cfg: AsrConfig) -> Self {
        Self { cfg }
    }

    fn stream_url(&self) -> String {
        format!(
            "{}?encoding=mulaw&sample_rate=8000&channels=1&interim_results=true&punctuate=true",
            self.cfg.base_url
        )
    }
}

#[async_trait::async_trait]
impl SpeechToText for WsAsr {
    async fn open(&self, call_id: &str) -> Result<AsrStream> {
        let (input_tx, input_rx) = mpsc::channel::<AsrInput>(EVENT_QUEUE);
        let (event_tx, event_rx) = mpsc::channel::<AsrEvent>(EVENT_QUEUE);

        let task = AsrTask {
            cfg: self.cfg.clone(),
            url: self.stream_url(),
            call_id: call_id.to_owned(),
            input_rx,
            event_tx,
            replay: VecDeque::new(),
            replay_cap: (self.cfg.replay_ms / FRAME_MS) as usize,
            current_utterance: None,
            tracker: ReconnectTracker::new(
                self.cfg.max_reconnects,
                Duration::from_millis(self.cfg.reconnect_window_ms),
            ),
        };
        tokio::spawn(task.run());

        Ok(AsrStream {
            input: input_tx,
            events: event_rx,
        })
    }
}

type WsConn =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct AsrTask {
    cfg: AsrConfig,
    url: String,
    call_id: String,
    input_rx: mpsc::Receiver<AsrInput>,
    event_tx: mpsc::Sender<AsrEvent>,
    replay: VecDeque<Vec<u8>>,
    replay_cap: usize,
    current_utterance: Option<String>,
    tracker: ReconnectTracker,
}

impl AsrTask {
    async fn run(mut self) {
        let mut first_connect = true;
        loop {
            let mut conn = match self.connect().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(call_id = %self.call_id, error = %e, "recognition connect failed");
                    if self.note_reconnect(0).await {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                }
            };

            if !first_connect {
                let replayed = self.replay_audio(&mut conn).await;
                tracing::info!(
                    call_id = %self.call_id,
                    replayed_frames = replayed,
                    "recognition stream reopened"
                );
            }
            first_connect = false;

            if self.pump(&mut conn).await {
                // Input channel closed: the call is over.
                let _ = conn
                    .send(WsMessage::Text(r#"{"type":"CloseStream"}"#.into()))
                    .await;
                let _ = conn.close(None).await;
                return;
            }

            // Connection lost mid-call.
            if self.note_reconnect(self.replay.len()).await {
                return;
            }
        }
    }

    /// Drive one live connection. Returns `true` when the input channel
    /// closed (normal end of call), `false` on connection loss.
    async fn pump(&mut self, conn: &mut WsConn) -> bool {
        loop {
            tokio::select! {
                input = self.input_rx.recv() => {
                    match input {
                        None => return true,
                        Some(AsrInput::Begin { utterance_id }) => {
                            self.current_utterance = Some(utterance_id);
                        }
                        Some(AsrInput::Audio(frame)) => {
                            if self.replay.len() == self.replay_cap {
                                self.replay.pop_front();
                            }
                            self.replay.push_back(frame.clone());
                            if conn.send(WsMessage::Binary(frame)).await.is_err() {
                                return false;
                            }
                        }
                        Some(AsrInput::Commit { .. }) => {
                            if conn
                                .send(WsMessage::Text(r#"{"type":"Finalize"}"#.into()))
                                .await
                                .is_err()
                            {
                                return false;
                            }
                        }
                    }
                }
                msg = conn.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(raw))) => self.handle_result(&raw).await,
                        Some(Ok(WsMessage::Close(_))) | None => return false,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::debug!(call_id = %self.call_id, error = %e, "recognition socket error");
                            return false;
                        }
                    }
                }
            }
        }
    }

    async fn handle_result(&mut self, raw: &str) {
        let Some((text, is_final, confidence)) = parse_provider_event(raw) else {
            return;
        };
        // Results arriving outside an utterance are stray echo; skip.
        let Some(utterance_id) = self.current_utterance.clone() else {
            return;
        };
        let _ = self
            .event_tx
            .send(AsrEvent::Transcript(Transcript {
                utterance_id,
                text,
                is_final,
                confidence,
            }))
            .await;
    }

    async fn connect(&self) -> Result<WsConn> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Ws(e.to_string()))?;
        if let Some(key) = &self.cfg.api_key {
            let value = format!("Token {key}")
                .parse()
                .map_err(|_| Error::Ws("invalid api key header".into()))?;
            request.headers_mut().insert("Authorization", value);
        }
        let (conn, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| Error::Ws(e.to_string()))?;
        Ok(conn)
    }

    async fn replay_audio(&mut self, conn: &mut WsConn) -> usize {
        let frames: Vec<Vec<u8>> = self.replay.iter().cloned().collect();
        let mut sent = 0;
        for frame in frames {
            if conn.send(WsMessage::Binary(frame)).await.is_err() {
                break;
            }
            sent += 1;
        }
        sent
    }

    /// Record a reconnect; emits `Unavailable` and returns `true` when the
    /// breaker trips.
    async fn note_reconnect(&mut self, replayed_frames: usize) -> bool {
        let (attempt, tripped) = self.tracker.record(Instant::now());
        TraceEvent::AsrReconnect {
            call_id: self.call_id.clone(),
            attempt,
            replayed_frames,
        }
        .emit();
        if tripped {
            tracing::warn!(
                call_id = %self.call_id,
                attempts = attempt,
                window_ms = self.cfg.reconnect_window_ms,
                "recognition breaker tripped"
            );
            let _ = self.event_tx.send(AsrEvent::Unavailable).await;
            return true;
        }
        let _ = self.event_tx.send(AsrEvent::Reconnected { attempt }).await;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_trips_on_third_reconnect_in_window() {
        let mut tracker = ReconnectTracker::new(3, Duration::from_secs(10));
        let t0 = Instant::now();
        assert_eq!(tracker.record(t0), (1, false));
        assert_eq!(tracker.record(t0 + Duration::from_secs(2)), (2, false));
        assert_eq!(tracker.record(t0 + Duration::from_secs(4)), (3, true));
    }

    #[test]
    fn old_attempts_age_out_of_the_window() {
        let mut tracker = ReconnectTracker::new(3, Duration::from_secs(10));
        let t0 = Instant::now();
        tracker.record(t0);
        tracker.record(t0 + Duration::from_secs(1));
        // 12 s later the first two have aged out.
        assert_eq!(tracker.record(t0 + Duration::from_secs(13)), (1, false));
    }

    #[test]
    fn results_message_parses_final_transcript() {
        let raw = r#"{"type":"Results","is_final":true,
            "channel":{"alternatives":[{"transcript":"any update on Straus","confidence":0.94}]}}"#;
        let (text, is_final, confidence) = parse_provider_event(raw).unwrap();
        assert_eq!(text, "any update on Straus");
        assert!(is_final);
        assert!((confidence - 0.94).abs() < 1e-6);
    }

    #[test]
    fn empty_transcripts_and_other_types_skipped() {
        assert!(parse_provider_event(
            r#"{"type":"Results","is_final":false,
                "channel":{"alternatives":[{"transcript":"","confidence":0.0}]}}"#
        )
        .is_none());
        assert!(parse_provider_event(r#"{"type":"Metadata"}"#).is_none());
        assert!(parse_provider_event("not json").is_none());
    }
}
