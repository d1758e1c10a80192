//! Decoder for the line-delimited chat-completions streaming format.
//!
//! Each line is one frame, optionally prefixed with `data:`. A `[DONE]`
//! payload ends the stream. Lines that are blank or do not parse as a
//! completion chunk (keep-alives, `event:` lines, proxy noise) are skipped.

use serde::Deserialize;
use tracing::debug;

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Incremental text from `choices[0].delta.content`.
    Delta(String),
    Done,
    /// Blank, malformed or content-free frame.
    Skip,
}

#[derive(Deserialize)]
struct Chunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

pub fn decode_line(line: &str) -> Frame {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Frame::Skip;
    }

    let payload = line
        .strip_prefix(DATA_PREFIX)
        .map(str::trim_start)
        .unwrap_or(line)
        .trim_end();

    if payload == DONE_SENTINEL {
        return Frame::Done;
    }

    match serde_json::from_str::<Chunk>(payload) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|s| !s.is_empty())
            .map_or(Frame::Skip, Frame::Delta),
        Err(e) => {
            debug!("skipping unparseable stream frame: {e}");
            Frame::Skip
        }
    }
}

/// Reassembles deltas from raw body chunks that may split lines arbitrarily.
///
/// Bytes are buffered until a full line is available, so multi-byte UTF-8
/// sequences straddling chunk boundaries decode correctly.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    pending: Vec<u8>,
    /// Prefix of `pending` already known to contain no newline.
    scanned: usize,
    text: String,
    done: bool,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Feed a body chunk, invoking `on_delta` once per decoded fragment in
    /// arrival order. Input after `[DONE]` is ignored.
    pub fn feed(&mut self, bytes: &[u8], on_delta: &mut dyn FnMut(&str)) {
        if self.done {
            return;
        }
        self.pending.extend_from_slice(bytes);
        while let Some(offset) = self.pending[self.scanned..]
            .iter()
            .position(|b| *b == b'\n')
        {
            let pos = self.scanned + offset;
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.scanned = 0;
            self.process(&line, on_delta);
            if self.done {
                self.pending.clear();
                return;
            }
        }
        // Bytes already searched hold no newline.
        self.scanned = self.pending.len();
    }

    /// Flush a trailing unterminated line and return the assembled text.
    pub fn finish(mut self, on_delta: &mut dyn FnMut(&str)) -> String {
        if !self.done && !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.process(&line, on_delta);
        }
        self.text
    }

    fn process(&mut self, line: &[u8], on_delta: &mut dyn FnMut(&str)) {
        let Ok(line) = std::str::from_utf8(line) else {
            debug!("skipping non-UTF-8 stream frame");
            return;
        };
        match decode_line(line) {
            Frame::Delta(fragment) => {
                self.text.push_str(&fragment);
                on_delta(&fragment);
            }
            Frame::Done => self.done = true,
            Frame::Skip => {}
        }
    }
}
