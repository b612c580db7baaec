//! Line decoding for incrementally delivered response bodies.
//!
//! The transport hands the engine arbitrary fragments of the body.  A
//! [`LineDecoder`] reassembles them into complete lines, and [`lines`] turns a
//! chunk stream into a lazy stream of those lines.

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};

use crate::error::Result;
use crate::observability::STREAM_BYTES;

/// Reassembles complete `\n`-terminated lines from arbitrary chunks.
///
/// Pending state is at most one partial line, kept as raw bytes so that a
/// multi-byte character split across two chunks is decoded intact.  A single
/// `\r` before the terminator is stripped.
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
}

impl LineDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one chunk and returns every line it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            self.pending.extend_from_slice(&rest[..pos]);
            rest = &rest[pos + 1..];
            let line = std::mem::take(&mut self.pending);
            lines.push(decode_line(line));
        }
        self.pending.extend_from_slice(rest);
        lines
    }

    /// Flushes the final unterminated line, if the stream left one behind.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(decode_line(std::mem::take(&mut self.pending)))
        }
    }

    /// Number of bytes waiting for a terminator.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn decode_line(mut line: Vec<u8>) -> String {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    match String::from_utf8(line) {
        Ok(line) => line,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    }
}

/// Turns a stream of body chunks into a lazy, ordered stream of lines.
///
/// Transport errors are forwarded in position; the stream ends after the
/// final unterminated line (if any) once the source is exhausted.
pub fn lines<S>(chunks: S) -> impl Stream<Item = Result<String>>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let state = (chunks, LineDecoder::new(), Vec::<String>::new().into_iter(), false);
    stream::unfold(
        state,
        |(mut chunks, mut decoder, mut ready, mut done)| async move {
            loop {
                if let Some(line) = ready.next() {
                    return Some((Ok(line), (chunks, decoder, ready, done)));
                }
                if done {
                    return None;
                }
                match chunks.next().await {
                    Some(Ok(bytes)) => {
                        STREAM_BYTES.count(bytes.len() as u64);
                        ready = decoder.feed(&bytes).into_iter();
                    }
                    Some(Err(err)) => {
                        return Some((Err(err), (chunks, decoder, ready, done)));
                    }
                    None => {
                        done = true;
                        ready = decoder.finish().into_iter().collect::<Vec<_>>().into_iter();
                    }
                }
            }
        },
    )
}
