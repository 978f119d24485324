//! Server-sent-events plumbing shared by the HTTP provider adapters.
//!
//! SSE events are `\n\n`-delimited blocks whose `data:` lines carry the
//! payload. [`SseBuffer`] accumulates raw chunks and hands back complete
//! payloads; [`sse_stream`] wraps a `reqwest::Response` body and a
//! payload parser into a [`BoxStream`] of provider events.

use vl_domain::error::{Error, Result};
use vl_domain::stream::{BoxStream, StreamEvent};

/// Incremental SSE decoder. Bytes go in, complete `data:` payloads come
/// out; a trailing partial event stays buffered for the next push.
#[derive(Default)]
pub struct SseBuffer {
    pending: String,
}

impl SseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete event's data payloads.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);
        let mut payloads = Vec::new();
        while let Some(pos) = self.pending.find("\n\n") {
            let block: String = self.pending.drain(..pos + 2).collect();
            collect_data_lines(&block, &mut payloads);
        }
        payloads
    }

    /// Flush whatever remains once the body has closed.
    pub fn finish(&mut self) -> Vec<String> {
        let mut payloads = Vec::new();
        if !self.pending.trim().is_empty() {
            let block = std::mem::take(&mut self.pending);
            collect_data_lines(&block, &mut payloads);
        }
        payloads
    }
}

fn collect_data_lines(block: &str, out: &mut Vec<String>) {
    for line in block.lines() {
        if let Some(data) = line.trim().strip_prefix("data:") {
            let data = data.trim();
            if !data.is_empty() {
                out.push(data.to_owned());
            }
        }
    }
}

/// Adapt an SSE `reqwest::Response` into a stream of [`StreamEvent`]s.
///
/// `parse` receives each data payload and returns zero or more events;
/// it is `FnMut` because tool-call assembly needs state across payloads.
/// A trailing `Done` is synthesised if the provider never sent one.
pub(crate) fn sse_stream<F>(
    response: reqwest::Response,
    mut parse: F,
) -> BoxStream<'static, Result<StreamEvent>>
where
    F: FnMut(&str) -> Vec<Result<StreamEvent>> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer = SseBuffer::new();
        let mut done_seen = false;

        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    for payload in buffer.push(&String::from_utf8_lossy(&bytes)) {
                        for event in parse(&payload) {
                            done_seen |= matches!(&event, Ok(StreamEvent::Done { .. }));
                            yield event;
                        }
                    }
                }
                Ok(None) => {
                    for payload in buffer.finish() {
                        for event in parse(&payload) {
                            done_seen |= matches!(&event, Ok(StreamEvent::Done { .. }));
                            yield event;
                        }
                    }
                    break;
                }
                Err(e) => {
                    yield Err(Error::Http(e.to_string()));
                    break;
                }
            }
        }

        if !done_seen {
            yield Ok(StreamEvent::Done { usage: None, finish_reason: Some("stop".into()) });
        }
    };

    Box::pin(stream)
}
