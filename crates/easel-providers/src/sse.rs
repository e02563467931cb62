//! Generic SSE (Server-Sent Events) parser and vendor event decoding.
//!
//! [`parse_sse`] turns any byte stream into a stream of [`SseEvent`]s;
//! [`decode_events`] feeds those through a vendor [`EventDecoder`] to produce
//! the common [`StreamEvent`] sequence.

use std::collections::VecDeque;
use std::pin::Pin;

use futures::{Stream, StreamExt};

use crate::{EventStream, StreamEvent};

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, String>> + Send>>;

struct SseState {
    bytes: ByteStream,
    // Raw bytes so a multi-byte character split across chunks survives.
    buffer: Vec<u8>,
    current_event: Option<String>,
    current_data: Vec<String>,
}

impl SseState {
    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.current_data.is_empty() {
            self.current_event = None;
            return None;
        }
        let event = SseEvent {
            event: self.current_event.take(),
            data: self.current_data.join("\n"),
        };
        self.current_data.clear();
        Some(event)
    }
}

/// Parse an arbitrary byte stream as SSE.
pub fn parse_sse<S, B, E>(byte_stream: S) -> impl Stream<Item = anyhow::Result<SseEvent>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let bytes: ByteStream = Box::pin(
        byte_stream
            .map(|chunk| chunk.map(|b| b.as_ref().to_vec()).map_err(|e| e.to_string()))
            .fuse(),
    );

    futures::stream::unfold(
        SseState {
            bytes,
            buffer: Vec::new(),
            current_event: None,
            current_data: Vec::new(),
        },
        |mut state| async move {
            loop {
                if let Some(newline_pos) = state.buffer.iter().position(|b| *b == b'\n') {
                    let raw: Vec<u8> = state.buffer.drain(..=newline_pos).collect();
                    let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
                    let line = line.trim_end_matches('\r');

                    if line.is_empty() {
                        if let Some(event) = state.dispatch() {
                            return Some((Ok(event), state));
                        }
                        continue;
                    }

                    if line.starts_with(':') {
                        continue;
                    }

                    if let Some(value) = line.strip_prefix("event:") {
                        state.current_event = Some(value.trim_start().to_string());
                    } else if let Some(value) = line.strip_prefix("data:") {
                        state.current_data.push(value.trim_start().to_string());
                    }
                    continue;
                }

                match state.bytes.next().await {
                    Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        return Some((Err(anyhow::anyhow!("SSE stream error: {e}")), state));
                    }
                    None => {
                        // Trailing line without a newline still counts.
                        if !state.buffer.is_empty() {
                            state.buffer.push(b'\n');
                            continue;
                        }
                        return state.dispatch().map(|event| (Ok(event), state));
                    }
                }
            }
        },
    )
}

/// Parse a reqwest response body as SSE.
pub fn parse_sse_response(
    response: reqwest::Response,
) -> impl Stream<Item = anyhow::Result<SseEvent>> + Send {
    parse_sse(response.bytes_stream())
}

/// Vendor-specific translation from SSE events to [`StreamEvent`]s.
pub trait EventDecoder: Send + 'static {
    /// Translate one SSE event. Returning `Ok(None)` ends the stream.
    fn decode(&mut self, event: &SseEvent) -> anyhow::Result<Option<Vec<StreamEvent>>>;

    /// Called when the byte stream ends without an explicit terminator.
    fn finish(&mut self) -> anyhow::Result<Vec<StreamEvent>>;
}

struct DecodeState<D> {
    sse: Pin<Box<dyn Stream<Item = anyhow::Result<SseEvent>> + Send>>,
    decoder: D,
    queue: VecDeque<StreamEvent>,
    done: bool,
}

/// Run an SSE stream through `decoder`, flattening the produced events.
pub fn decode_events<S, D>(sse: S, decoder: D) -> EventStream
where
    S: Stream<Item = anyhow::Result<SseEvent>> + Send + 'static,
    D: EventDecoder,
{
    let stream = futures::stream::unfold(
        DecodeState {
            sse: Box::pin(sse),
            decoder,
            queue: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(event) = state.queue.pop_front() {
                    return Some((Ok(event), state));
                }
                if state.done {
                    return None;
                }

                let decoded = match state.sse.next().await {
                    Some(Ok(sse_event)) => state.decoder.decode(&sse_event),
                    Some(Err(e)) => Err(e),
                    None => state.decoder.finish().map(Some).map(|events| {
                        state.done = true;
                        events
                    }),
                };

                match decoded {
                    Ok(Some(events)) => state.queue.extend(events),
                    Ok(None) => state.done = true,
                    Err(e) => {
                        state.done = true;
                        return Some((Err(e), state));
                    }
                }
            }
        },
    );
    Box::pin(stream)
}
