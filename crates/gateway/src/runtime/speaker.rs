//! The speaker task: synthesises queued sentences and paces their
//! frames onto the media transport at 20 ms per frame.
//!
//! Synthesis runs faster than real time, so each sentence is buffered in
//! full before playout starts; cancellation is checked on every frame
//! tick, which bounds barge-in cutover well under 100 ms. A cancelled
//! sentence reports the word-proportional prefix that was actually
//! heard.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;

use vl_domain::tenant::TenantContext;
use vl_media::session::MediaOut;
use vl_media::FRAME_MS;
use vl_providers::tts::TtsEngine;
use vl_sessions::log::spoken_prefix;

use super::cancel::CancelToken;
use super::{SessionEvent, SESSION_QUEUE};

#[derive(Debug)]
pub enum SpeakerEvent {
    /// First audio frame of the turn reached the transport.
    FirstFrame { turn_id: String },
    /// A sentence finished playing in full.
    SentenceSpoken { turn_id: String, text: String },
    /// Playout was cancelled mid-sentence; `partial_text` is what the
    /// caller actually heard of the interrupted sentence.
    Cancelled { turn_id: String, partial_text: String },
    /// Every queued sentence played and the turn is flushed.
    Flushed { turn_id: String },
    /// Synthesis failed beyond recovery for this turn.
    Failed { turn_id: String, message: String },
}

#[derive(Debug)]
pub enum SpeakerCmd {
    Sentence(String),
    /// No more sentences will arrive for this turn.
    Finish,
}

/// Handle the orchestrator keeps for the in-flight speaker.
pub struct SpeakerHandle {
    pub turn_id: String,
    pub cmd_tx: mpsc::Sender<SpeakerCmd>,
    pub cancel: CancelToken,
}

impl SpeakerHandle {
    pub async fn say(&self, sentence: String) {
        let _ = self.cmd_tx.send(SpeakerCmd::Sentence(sentence)).await;
    }

    pub async fn finish(&self) {
        let _ = self.cmd_tx.send(SpeakerCmd::Finish).await;
    }
}

#[allow(clippy::too_many_arguments)]
pub fn spawn_speaker(
    call_id: String,
    turn_id: String,
    tts: Arc<TtsEngine>,
    tenant: Arc<TenantContext>,
    media: Arc<dyn MediaOut>,
    first_frame_timeout: Duration,
    cancel: CancelToken,
    tx: mpsc::Sender<SessionEvent>,
) -> SpeakerHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel::<SpeakerCmd>(SESSION_QUEUE);
    let handle = SpeakerHandle {
        turn_id: turn_id.clone(),
        cmd_tx,
        cancel: cancel.clone(),
    };
    tokio::spawn(speaker_task(
        call_id,
        turn_id,
        tts,
        tenant,
        media,
        first_frame_timeout,
        cancel,
        cmd_rx,
        tx,
    ));
    handle
}

#[allow(clippy::too_many_arguments)]
async fn speaker_task(
    call_id: String,
    turn_id: String,
    tts: Arc<TtsEngine>,
    tenant: Arc<TenantContext>,
    media: Arc<dyn MediaOut>,
    first_frame_timeout: Duration,
    cancel: CancelToken,
    mut cmd_rx: mpsc::Receiver<SpeakerCmd>,
    tx: mpsc::Sender<SessionEvent>,
) {
    let mut any_frame_sent = false;

    loop {
        let cmd = tokio::select! {
            cmd = cmd_rx.recv() => cmd,
            // Wake promptly on cancellation even while idle between
            // sentences.
            _ = wait_cancelled(&cancel) => {
                send(&tx, SpeakerEvent::Cancelled { turn_id, partial_text: String::new() }).await;
                return;
            }
        };

        match cmd {
            None => return,
            Some(SpeakerCmd::Finish) => {
                let _ = media.mark(&turn_id).await;
                send(&tx, SpeakerEvent::Flushed { turn_id }).await;
                return;
            }
            Some(SpeakerCmd::Sentence(text)) => {
                match play_sentence(
                    &call_id,
                    &turn_id,
                    &tts,
                    &tenant,
                    &media,
                    first_frame_timeout,
                    &cancel,
                    &tx,
                    &text,
                    &mut any_frame_sent,
                )
                .await
                {
                    SentenceOutcome::Spoken => {
                        send(
                            &tx,
                            SpeakerEvent::SentenceSpoken {
                                turn_id: turn_id.clone(),
                                text,
                            },
                        )
                        .await;
                    }
                    SentenceOutcome::Cancelled { partial_text } => {
                        send(&tx, SpeakerEvent::Cancelled { turn_id, partial_text }).await;
                        return;
                    }
                    SentenceOutcome::Failed { message } => {
                        send(&tx, SpeakerEvent::Failed { turn_id, message }).await;
                        return;
                    }
                }
            }
        }
    }
}

enum SentenceOutcome {
    Spoken,
    Cancelled { partial_text: String },
    Failed { message: String },
}

#[allow(clippy::too_many_arguments)]
async fn play_sentence(
    call_id: &str,
    turn_id: &str,
    tts: &Arc<TtsEngine>,
    tenant: &Arc<TenantContext>,
    media: &Arc<dyn MediaOut>,
    first_frame_timeout: Duration,
    cancel: &CancelToken,
    tx: &mpsc::Sender<SessionEvent>,
    text: &str,
    any_frame_sent: &mut bool,
) -> SentenceOutcome {
    let (mut stream, _choice) = match tts.synthesize(call_id, text, tenant).await {
        Ok(ok) => ok,
        Err(e) => {
            return SentenceOutcome::Failed {
                message: e.to_string(),
            };
        }
    };

    // Buffer the sentence; synthesis outruns the wire.
    let mut frames: Vec<Vec<u8>> = Vec::new();
    loop {
        let next = if frames.is_empty() {
            match tokio::time::timeout(first_frame_timeout, stream.next()).await {
                Ok(item) => item,
                Err(_) => {
                    return SentenceOutcome::Failed {
                        message: "no audio before first-frame deadline".into(),
                    };
                }
            }
        } else {
            stream.next().await
        };

        match next {
            None => break,
            Some(Ok(frame)) => frames.push(frame),
            Some(Err(e)) => {
                if frames.is_empty() {
                    return SentenceOutcome::Failed {
                        message: e.to_string(),
                    };
                }
                // Keep what synthesised; better a clipped sentence than
                // dead air.
                tracing::warn!(call_id, error = %e, "synthesis stream broke mid-sentence");
                break;
            }
        }
        if cancel.is_cancelled() {
            return SentenceOutcome::Cancelled {
                partial_text: String::new(),
            };
        }
    }

    let total = frames.len();
    for (i, frame) in frames.into_iter().enumerate() {
        if cancel.is_cancelled() {
            return SentenceOutcome::Cancelled {
                partial_text: spoken_prefix(text, i, total),
            };
        }
        if media.send_frame(frame).await.is_err() {
            return SentenceOutcome::Failed {
                message: "media transport gone".into(),
            };
        }
        if !*any_frame_sent {
            *any_frame_sent = true;
            send(
                tx,
                SpeakerEvent::FirstFrame {
                    turn_id: turn_id.to_owned(),
                },
            )
            .await;
        }
        tokio::time::sleep(Duration::from_millis(FRAME_MS)).await;
    }

    SentenceOutcome::Spoken
}

async fn wait_cancelled(cancel: &CancelToken) {
    // Polling keeps the token free of waker plumbing; 20 ms matches the
    // frame cadence and stays inside the barge-in budget.
    while !cancel.is_cancelled() {
        tokio::time::sleep(Duration::from_millis(FRAME_MS)).await;
    }
}

async fn send(tx: &mpsc::Sender<SessionEvent>, event: SpeakerEvent) {
    let _ = tx.send(SessionEvent::Speaker(event)).await;
}
