//! The per-call media session: carrier handshake, ordered inbound events,
//! and a paced outbound writer behind the [`MediaOut`] seam.
//!
//! Task layout per call:
//! - a reader task parses carrier messages and forwards them, in arrival
//!   order, to a bounded event channel the orchestrator drains;
//! - a writer task owns the socket sink and drains the outbound ring at
//!   the inbound clock when frames are flowing, or at 50 fps on a local
//!   timer otherwise.
//!
//! Audio and transcript-bearing events are never dropped; the reader
//! applies back-pressure instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use vl_domain::config::MediaConfig;
use vl_domain::error::{Error, Result};

use crate::protocol::CarrierMessage;
use crate::ring::FrameRing;
use crate::{FRAME_MS, FRAME_BYTES};

/// Queue depth between media tasks and the orchestrator.
const EVENT_QUEUE: usize = 64;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Validated metadata from the carrier `start` message.
#[derive(Debug, Clone)]
pub struct CallMeta {
    pub stream_sid: String,
    pub call_sid: String,
    pub account_sid: String,
    pub from: String,
    pub to: String,
}

/// A 20 ms inbound µ-law frame.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub seq: u64,
    pub t_ms: u64,
    pub payload: Vec<u8>,
}

/// Events the orchestrator receives from the media transport, in strict
/// arrival order.
#[derive(Debug, Clone)]
pub enum MediaEvent {
    Frame(InboundFrame),
    /// Sequence numbers were skipped. Gaps are surfaced, never
    /// interpolated.
    Gap { expected: u64, got: u64 },
    Dtmf { digit: char },
    MarkAck { name: String },
    Stopped,
    TransportError(String),
}

/// Outbound surface of a media session. Trait-shaped so call tests can
/// substitute a capture implementation.
#[async_trait]
pub trait MediaOut: Send + Sync {
    /// Enqueue one µ-law frame for paced emission.
    async fn send_frame(&self, frame: Vec<u8>) -> Result<()>;
    /// Flush the outbound ring and the far-side jitter buffer.
    async fn clear(&self) -> Result<()>;
    async fn mark(&self, name: &str) -> Result<()>;
    async fn transfer(&self, to_number: &str, reason: Option<&str>) -> Result<()>;
    async fn close(&self, cause: &str) -> Result<()>;
    /// Frames evicted from the ring because the writer fell behind.
    fn dropped_frames(&self) -> u64;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Accept / handshake
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Perform the carrier handshake on a fresh WebSocket and start the
/// reader/writer tasks.
pub async fn accept(
    socket: WebSocket,
    cfg: &MediaConfig,
) -> Result<(CallMeta, mpsc::Receiver<MediaEvent>, Arc<dyn MediaOut>)> {
    let (sink, mut stream) = socket.split();

    let handshake = tokio::time::timeout(
        Duration::from_millis(cfg.handshake_timeout_ms),
        read_start(&mut stream),
    )
    .await
    .map_err(|_| Error::Handshake("no start message before deadline".into()))??;

    let meta = validate_start(handshake)?;
    tracing::info!(
        call_sid = %meta.call_sid,
        from = %meta.from,
        to = %meta.to,
        "media session accepted"
    );

    let (event_tx, event_rx) = mpsc::channel::<MediaEvent>(EVENT_QUEUE);
    let (cmd_tx, cmd_rx) = mpsc::channel::<WriterCmd>(EVENT_QUEUE);
    let (pulse_tx, pulse_rx) = mpsc::channel::<()>(8);

    let dropped = Arc::new(AtomicU64::new(0));

    tokio::spawn(reader_task(stream, event_tx, pulse_tx));
    tokio::spawn(writer_task(
        sink,
        cmd_rx,
        pulse_rx,
        meta.stream_sid.clone(),
        (cfg.outbound_buffer_ms / FRAME_MS) as usize,
        dropped.clone(),
    ));

    let out: Arc<dyn MediaOut> = Arc::new(WsMediaOut { cmd_tx, dropped });
    Ok((meta, event_rx, out))
}

/// Read messages until the carrier `start` arrives. The `connected`
/// preamble is consumed and checked on the way.
async fn read_start(stream: &mut SplitStream<WebSocket>) -> Result<crate::protocol::StartMeta> {
    let mut saw_connected = false;
    while let Some(msg) = stream.next().await {
        let msg = msg.map_err(|e| Error::Ws(e.to_string()))?;
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => {
                return Err(Error::Handshake("closed before start".into()));
            }
            _ => continue,
        };
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let parsed: CarrierMessage = serde_json::from_str(line)
                .map_err(|e| Error::Handshake(format!("malformed message: {e}")))?;
            match parsed {
                CarrierMessage::Connected { protocol, .. } => {
                    if protocol != "call" {
                        return Err(Error::Handshake(format!("unexpected protocol {protocol}")));
                    }
                    saw_connected = true;
                }
                CarrierMessage::Start { start } => {
                    if !saw_connected {
                        tracing::debug!("start arrived without connected preamble");
                    }
                    return Ok(start);
                }
                other => {
                    return Err(Error::Handshake(format!(
                        "unexpected pre-start message: {other:?}"
                    )));
                }
            }
        }
    }
    Err(Error::Handshake("stream ended before start".into()))
}

fn validate_start(start: crate::protocol::StartMeta) -> Result<CallMeta> {
    let missing = |field: &str| Error::Handshake(format!("start metadata missing {field}"));
    if start.stream_sid.is_empty() {
        return Err(missing("streamSid"));
    }
    if start.call_sid.is_empty() {
        return Err(missing("callSid"));
    }
    if start.account_sid.is_empty() {
        return Err(missing("accountSid"));
    }
    if start.custom_parameters.from.is_empty() {
        return Err(missing("from"));
    }
    if start.custom_parameters.to.is_empty() {
        return Err(missing("to"));
    }
    Ok(CallMeta {
        stream_sid: start.stream_sid,
        call_sid: start.call_sid,
        account_sid: start.account_sid,
        from: start.custom_parameters.from,
        to: start.custom_parameters.to,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound classification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Turn one carrier message into session events, tracking the expected
/// sequence number for gap detection. Pure, so the ordering rules are
/// testable without a socket.
pub fn classify_inbound(msg: CarrierMessage, expected_seq: &mut Option<u64>) -> Vec<MediaEvent> {
    match msg {
        CarrierMessage::Media { media, .. } => {
            let payload = match base64::engine::general_purpose::STANDARD.decode(&media.payload) {
                Ok(p) => p,
                Err(e) => {
                    return vec![MediaEvent::TransportError(format!(
                        "undecodable media payload: {e}"
                    ))];
                }
            };
            if payload.len() != FRAME_BYTES {
                tracing::debug!(len = payload.len(), "unexpected media frame length");
            }
            let seq = media
                .chunk
                .as_deref()
                .and_then(|c| c.parse::<u64>().ok())
                .unwrap_or_else(|| expected_seq.unwrap_or(1));
            let t_ms = media
                .timestamp
                .as_deref()
                .and_then(|t| t.parse::<u64>().ok())
                .unwrap_or_else(|| seq.saturating_sub(1) * FRAME_MS);

            let mut events = Vec::with_capacity(2);
            if let Some(expected) = *expected_seq {
                if seq > expected {
                    events.push(MediaEvent::Gap {
                        expected,
                        got: seq,
                    });
                }
            }
            *expected_seq = Some(seq + 1);
            events.push(MediaEvent::Frame(InboundFrame { seq, t_ms, payload }));
            events
        }
        CarrierMessage::Dtmf { dtmf } => match dtmf.digit.chars().next() {
            Some(digit) => vec![MediaEvent::Dtmf { digit }],
            None => Vec::new(),
        },
        CarrierMessage::Mark { mark, .. } => vec![MediaEvent::MarkAck { name: mark.name }],
        CarrierMessage::Stop { .. } => vec![MediaEvent::Stopped],
        // Late duplicates of the handshake are ignored.
        CarrierMessage::Connected { .. } | CarrierMessage::Start { .. } => Vec::new(),
        CarrierMessage::Clear { .. } | CarrierMessage::Transfer { .. } => Vec::new(),
    }
}

async fn reader_task(
    mut stream: SplitStream<WebSocket>,
    event_tx: mpsc::Sender<MediaEvent>,
    pulse_tx: mpsc::Sender<()>,
) {
    let mut expected_seq: Option<u64> = None;
    let mut stopped = false;

    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                let _ = event_tx
                    .send(MediaEvent::TransportError(e.to_string()))
                    .await;
                return;
            }
        };
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let parsed: CarrierMessage = match serde_json::from_str(line) {
                Ok(p) => p,
                Err(e) => {
                    tracing::debug!(error = %e, "ignoring unparseable carrier message");
                    continue;
                }
            };
            for event in classify_inbound(parsed, &mut expected_seq) {
                let is_frame = matches!(event, MediaEvent::Frame(_));
                let is_stop = matches!(event, MediaEvent::Stopped);
                if event_tx.send(event).await.is_err() {
                    return; // orchestrator gone
                }
                if is_frame {
                    // Inbound clock pulse for the writer; best-effort.
                    let _ = pulse_tx.try_send(());
                }
                if is_stop {
                    stopped = true;
                }
            }
            if stopped {
                return;
            }
        }
    }

    if !stopped {
        // Socket closed without a stop message.
        let _ = event_tx.send(MediaEvent::Stopped).await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outbound writer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum WriterCmd {
    Frame(Vec<u8>),
    Clear,
    Mark(String),
    Transfer { to: String, reason: Option<String> },
    Close,
}

async fn writer_task(
    mut sink: SplitSink<WebSocket, Message>,
    mut cmd_rx: mpsc::Receiver<WriterCmd>,
    mut pulse_rx: mpsc::Receiver<()>,
    stream_sid: String,
    ring_capacity: usize,
    dropped: Arc<AtomicU64>,
) {
    let mut ring = FrameRing::new(ring_capacity);
    let mut tick = tokio::time::interval(Duration::from_millis(FRAME_MS));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    None => break,
                    Some(WriterCmd::Frame(frame)) => {
                        ring.push(frame);
                        dropped.store(ring.dropped(), Ordering::Relaxed);
                    }
                    Some(WriterCmd::Clear) => {
                        ring.flush();
                        if send_msg(&mut sink, &CarrierMessage::outbound_clear(&stream_sid))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(WriterCmd::Mark(name)) => {
                        if send_msg(&mut sink, &CarrierMessage::outbound_mark(&stream_sid, &name))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(WriterCmd::Transfer { to, reason }) => {
                        let msg = CarrierMessage::outbound_transfer(
                            &stream_sid,
                            &to,
                            reason.as_deref(),
                        );
                        if send_msg(&mut sink, &msg).await.is_err() {
                            break;
                        }
                    }
                    Some(WriterCmd::Close) => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            // Inbound clock: emit one frame per inbound frame and realign
            // the local timer to it.
            Some(()) = pulse_rx.recv() => {
                tick.reset();
                if emit_frame(&mut sink, &mut ring, &stream_sid).await.is_err() {
                    break;
                }
            }
            // Local clock fallback at 50 fps.
            _ = tick.tick() => {
                if emit_frame(&mut sink, &mut ring, &stream_sid).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn emit_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    ring: &mut FrameRing,
    stream_sid: &str,
) -> std::result::Result<(), ()> {
    if let Some(frame) = ring.pop() {
        let b64 = base64::engine::general_purpose::STANDARD.encode(&frame);
        send_msg(sink, &CarrierMessage::outbound_media(stream_sid, b64)).await?;
    }
    Ok(())
}

async fn send_msg(
    sink: &mut SplitSink<WebSocket, Message>,
    msg: &CarrierMessage,
) -> std::result::Result<(), ()> {
    let json = serde_json::to_string(msg).map_err(|_| ())?;
    sink.send(Message::Text(json)).await.map_err(|_| ())
}

struct WsMediaOut {
    cmd_tx: mpsc::Sender<WriterCmd>,
    dropped: Arc<AtomicU64>,
}

impl WsMediaOut {
    async fn send_cmd(&self, cmd: WriterCmd) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| Error::Ws("media writer gone".into()))
    }
}

#[async_trait]
impl MediaOut for WsMediaOut {
    async fn send_frame(&self, frame: Vec<u8>) -> Result<()> {
        self.send_cmd(WriterCmd::Frame(frame)).await
    }

    async fn clear(&self) -> Result<()> {
        self.send_cmd(WriterCmd::Clear).await
    }

    async fn mark(&self, name: &str) -> Result<()> {
        self.send_cmd(WriterCmd::Mark(name.to_owned())).await
    }

    async fn transfer(&self, to_number: &str, reason: Option<&str>) -> Result<()> {
        self.send_cmd(WriterCmd::Transfer {
            to: to_number.to_owned(),
            reason: reason.map(str::to_owned),
        })
        .await
    }

    async fn close(&self, cause: &str) -> Result<()> {
        tracing::debug!(cause, "closing media session");
        self.send_cmd(WriterCmd::Close).await
    }

    fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
