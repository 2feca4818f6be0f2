use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use pin_project_lite::pin_project;
use tokio::time::{Instant, Sleep};

use merlin_core::errors::GatewayError;
use merlin_core::stream::Chunk;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// One `event:`/`data:` block of a server-sent event stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Turns provider frames into chunks. Implemented once per wire format.
pub trait FrameDecoder: Send + 'static {
    fn decode(&mut self, frame: &SseFrame) -> Vec<Chunk>;

    /// Called when the byte stream ends. Returning nothing leaves the stream
    /// without a terminal chunk, which consumers treat as an interruption.
    fn finish(&mut self) -> Vec<Chunk> {
        Vec::new()
    }
}

/// Parse raw SSE text into frames. Multi-line data is joined with `\n`;
/// comment lines and unknown fields are ignored.
pub fn parse_sse_lines(raw: &str) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    let mut current = SseFrame::default();
    let mut has_data = false;

    for line in raw.lines() {
        if line.is_empty() {
            if has_data || current.event.is_some() {
                frames.push(std::mem::take(&mut current));
                has_data = false;
            }
            continue;
        }
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => current.event = Some(value.to_string()),
            "data" => {
                if has_data {
                    current.data.push('\n');
                }
                current.data.push_str(value);
                has_data = true;
            }
            _ => {}
        }
    }

    // Trailing frame without a blank line
    if has_data || current.event.is_some() {
        frames.push(current);
    }
    frames
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

pin_project! {
    /// Adapts an HTTP byte stream into generation chunks.
    ///
    /// Yields a `StreamInterrupted` error when no bytes arrive within the idle
    /// timeout. Ends after the first terminal chunk.
    pub struct SseChunkStream<D> {
        inner: ByteStream,
        decoder: D,
        buffer: Vec<u8>,
        pending: VecDeque<Chunk>,
        #[pin]
        idle: Sleep,
        idle_duration: Duration,
        finished: bool,
    }
}

impl<D: FrameDecoder> SseChunkStream<D> {
    pub fn new(
        byte_stream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
        decoder: D,
    ) -> Self {
        Self::with_idle_timeout(byte_stream, decoder, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
        decoder: D,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            decoder,
            buffer: Vec::new(),
            pending: VecDeque::new(),
            idle: tokio::time::sleep(idle_timeout),
            idle_duration: idle_timeout,
            finished: false,
        }
    }
}

fn take_frame(buffer: &mut Vec<u8>) -> Option<String> {
    let pos = buffer.windows(2).position(|w| w == b"\n\n")?;
    let frame: Vec<u8> = buffer.drain(..pos + 2).collect();
    Some(String::from_utf8_lossy(&frame).into_owned())
}

fn decode_into<D: FrameDecoder>(decoder: &mut D, raw: &str, pending: &mut VecDeque<Chunk>) {
    for frame in parse_sse_lines(raw) {
        pending.extend(decoder.decode(&frame));
    }
}

impl<D: FrameDecoder> Stream for SseChunkStream<D> {
    type Item = Chunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Chunk>> {
        let mut this = self.project();

        loop {
            if let Some(chunk) = this.pending.pop_front() {
                if chunk.is_terminal() {
                    *this.finished = true;
                    this.pending.clear();
                }
                return Poll::Ready(Some(chunk));
            }
            if *this.finished {
                return Poll::Ready(None);
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.idle
                        .as_mut()
                        .reset(Instant::now() + *this.idle_duration);
                    this.buffer.extend(bytes.iter().filter(|b| **b != b'\r'));
                    while let Some(raw) = take_frame(this.buffer) {
                        decode_into(this.decoder, &raw, this.pending);
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    *this.finished = true;
                    return Poll::Ready(Some(Chunk::Error {
                        error: GatewayError::StreamInterrupted(e.to_string()),
                    }));
                }
                Poll::Ready(None) => {
                    *this.finished = true;
                    if !this.buffer.is_empty() {
                        let raw = String::from_utf8_lossy(this.buffer).into_owned();
                        this.buffer.clear();
                        decode_into(this.decoder, &raw, this.pending);
                    }
                    this.pending.extend(this.decoder.finish());
                    return Poll::Ready(this.pending.pop_front());
                }
                Poll::Pending => {
                    if this.idle.as_mut().poll(cx).is_ready() {
                        *this.finished = true;
                        return Poll::Ready(Some(Chunk::Error {
                            error: GatewayError::StreamInterrupted(format!(
                                "idle timeout after {}s",
                                this.idle_duration.as_secs()
                            )),
                        }));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}
