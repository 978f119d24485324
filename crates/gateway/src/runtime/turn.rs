//! One streaming LLM turn.
//!
//! The runner streams the completion, flushes sentences to the
//! orchestrator as boundaries appear, and assembles tool calls. A turn
//! that dies before producing any speech is retried once with identical
//! input; after that it fails into the orchestrator's timeout path. The
//! first-token deadline is enforced here.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;

use vl_domain::msg::ToolCall;
use vl_domain::stream::StreamEvent;
use vl_providers::{ChatRequest, LlmProvider};

use super::cancel::CancelToken;
use super::sentence::SentenceSplitter;
use super::SessionEvent;

#[derive(Debug)]
pub enum TurnEvent {
    /// A complete sentence, ready for synthesis.
    Sentence { turn_id: String, text: String },
    /// The model requested tools; `preamble` is any text it produced
    /// first (already flushed as sentences).
    ToolCalls {
        turn_id: String,
        preamble: String,
        calls: Vec<ToolCall>,
    },
    /// End of turn with no tool calls.
    Completed { turn_id: String, full_text: String },
    /// The turn produced nothing usable (timeout or repeated errors).
    Failed { turn_id: String, message: String },
}

pub fn spawn_turn(
    llm: Arc<dyn LlmProvider>,
    req: ChatRequest,
    turn_id: String,
    first_token_timeout: Duration,
    cancel: CancelToken,
    tx: mpsc::Sender<SessionEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run_turn(llm, req, turn_id, first_token_timeout, cancel, tx))
}

async fn run_turn(
    llm: Arc<dyn LlmProvider>,
    req: ChatRequest,
    turn_id: String,
    first_token_timeout: Duration,
    cancel: CancelToken,
    tx: mpsc::Sender<SessionEvent>,
) {
    let mut last_error = String::from("no token before deadline");

    for attempt in 0..2u8 {
        if cancel.is_cancelled() {
            return;
        }
        if attempt > 0 {
            tracing::debug!(%turn_id, "retrying turn with identical input");
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        match stream_once(&llm, req.clone(), &turn_id, first_token_timeout, &cancel, &tx).await {
            StreamOutcome::Delivered => return,
            StreamOutcome::Cancelled => return,
            StreamOutcome::RetryableFailure(message) => last_error = message,
            StreamOutcome::FatalFailure(message) => {
                send(&tx, TurnEvent::Failed { turn_id, message }).await;
                return;
            }
        }
    }

    send(
        &tx,
        TurnEvent::Failed {
            turn_id,
            message: last_error,
        },
    )
    .await;
}

enum StreamOutcome {
    Delivered,
    Cancelled,
    /// Failed before any speech left this task; identical retry is safe.
    RetryableFailure(String),
    /// Failed after sentences were emitted; retrying would repeat speech.
    FatalFailure(String),
}

async fn stream_once(
    llm: &Arc<dyn LlmProvider>,
    req: ChatRequest,
    turn_id: &str,
    first_token_timeout: Duration,
    cancel: &CancelToken,
    tx: &mpsc::Sender<SessionEvent>,
) -> StreamOutcome {
    let mut stream = match llm.chat_stream(req).await {
        Ok(stream) => stream,
        Err(e) => return StreamOutcome::RetryableFailure(e.to_string()),
    };

    let mut splitter = SentenceSplitter::new();
    let mut full_text = String::new();
    let mut calls: Vec<ToolCall> = Vec::new();
    let mut sentences_emitted = false;
    let mut saw_activity = false;

    loop {
        if cancel.is_cancelled() {
            return StreamOutcome::Cancelled;
        }

        let event = if saw_activity {
            stream.next().await
        } else {
            match tokio::time::timeout(first_token_timeout, stream.next()).await {
                Ok(event) => event,
                // A blown first-token deadline goes straight to the
                // fallback line; only dropped connections are retried.
                Err(_) => {
                    return StreamOutcome::FatalFailure("no token before deadline".into());
                }
            }
        };

        match event {
            None => break,
            Some(Ok(StreamEvent::Token { text })) => {
                saw_activity = true;
                full_text.push_str(&text);
                for sentence in splitter.push(&text) {
                    sentences_emitted = true;
                    send(
                        tx,
                        TurnEvent::Sentence {
                            turn_id: turn_id.to_owned(),
                            text: sentence,
                        },
                    )
                    .await;
                }
            }
            Some(Ok(StreamEvent::ToolCallStarted { .. }))
            | Some(Ok(StreamEvent::ToolCallDelta { .. })) => {
                saw_activity = true;
            }
            Some(Ok(StreamEvent::ToolCallFinished {
                call_id,
                tool_name,
                arguments,
            })) => {
                saw_activity = true;
                calls.push(ToolCall {
                    call_id,
                    tool_name,
                    arguments,
                });
            }
            Some(Ok(StreamEvent::Done { .. })) => break,
            Some(Ok(StreamEvent::Error { message })) => {
                return stream_failure(sentences_emitted, message);
            }
            Some(Err(e)) => {
                return stream_failure(sentences_emitted, e.to_string());
            }
        }
    }

    // Trailing text without a terminal boundary still gets spoken.
    if let Some(tail) = splitter.flush() {
        if calls.is_empty() {
            send(
                tx,
                TurnEvent::Sentence {
                    turn_id: turn_id.to_owned(),
                    text: tail,
                },
            )
            .await;
        }
    }

    if calls.is_empty() {
        send(
            tx,
            TurnEvent::Completed {
                turn_id: turn_id.to_owned(),
                full_text,
            },
        )
        .await;
    } else {
        send(
            tx,
            TurnEvent::ToolCalls {
                turn_id: turn_id.to_owned(),
                preamble: full_text,
                calls,
            },
        )
        .await;
    }
    StreamOutcome::Delivered
}

fn stream_failure(sentences_emitted: bool, message: String) -> StreamOutcome {
    if sentences_emitted {
        StreamOutcome::FatalFailure(message)
    } else {
        StreamOutcome::RetryableFailure(message)
    }
}

async fn send(tx: &mpsc::Sender<SessionEvent>, event: TurnEvent) {
    let _ = tx.send(SessionEvent::Turn(event)).await;
}
