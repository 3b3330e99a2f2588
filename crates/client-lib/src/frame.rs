//! Incremental decoder for `text/event-stream` bodies.
//!
//! Bytes arrive in arbitrary chunks; the decoder buffers partial lines and
//! yields a `RawFrame` for every blank-line-terminated block that carried
//! at least one `data:` line. Comment lines (`:`) are skipped.

use std::collections::VecDeque;

use futures_util::stream::{self, BoxStream, StreamExt};

use crate::error::ClientError;

/// Event name used when a block has no `event:` line
pub const DEFAULT_EVENT: &str = "message";

/// Longest line accepted before the stream is treated as broken
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// One dispatched server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub event: String,
    /// `data:` lines joined with `\n`
    pub data: String,
    pub id: Option<String>,
}

#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Bytes of `buf` already searched for a newline
    scanned: usize,
    max_line: usize,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_max_line(DEFAULT_MAX_LINE_BYTES)
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_line,
            event: None,
            data: Vec::new(),
            id: None,
        }
    }

    /// Push a chunk, returning every frame it completed.
    ///
    /// Fails once a partial line grows past the line limit; the decoder
    /// must not be fed again after that.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<RawFrame>, ClientError> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        let mut start = 0;

        while let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset;
            let mut line = &self.buf[start..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            let line = String::from_utf8_lossy(line).into_owned();
            start = end + 1;
            self.scanned = start;
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }

        self.buf.drain(..start);
        self.scanned = self.buf.len();
        if self.buf.len() > self.max_line {
            return Err(ClientError::LineTooLong { limit: self.max_line });
        }
        Ok(frames)
    }

    fn process_line(&mut self, line: &str) -> Option<RawFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            // retry and unknown fields
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<RawFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(RawFrame {
            event: event
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| DEFAULT_EVENT.to_string()),
            data,
            id: self.id.clone(),
        })
    }
}

/// Turn a byte stream into a frame stream.
///
/// A transport error is yielded once and ends the stream; a trailing
/// incomplete block is discarded.
pub fn decode_frames<B>(
    bytes: BoxStream<'static, Result<B, ClientError>>,
) -> BoxStream<'static, Result<RawFrame, ClientError>>
where
    B: AsRef<[u8]> + Send + 'static,
{
    let seed = (bytes, FrameDecoder::new(), VecDeque::new(), false);
    stream::unfold(seed, |(mut bytes, mut decoder, mut ready, done)| async move {
        loop {
            if let Some(frame) = ready.pop_front() {
                return Some((Ok(frame), (bytes, decoder, ready, done)));
            }
            if done {
                return None;
            }
            match bytes.next().await {
                Some(Ok(chunk)) => match decoder.feed(chunk.as_ref()) {
                    Ok(frames) => ready.extend(frames),
                    Err(e) => return Some((Err(e), (bytes, decoder, ready, true))),
                },
                Some(Err(e)) => return Some((Err(e), (bytes, decoder, ready, true))),
                None => return None,
            }
        }
    })
    .boxed()
}
