//! Output Pipeline
//!
//! Per-session filter chain applied to every PTY chunk:
//!
//! raw bytes -> UTF-8 decode (carrying split characters to the next chunk)
//! -> bracketed-paste toggles stripped (display text, forwarded outward)
//! -> all escapes stripped (clean text) -> failure detector.
//!
//! The pipeline also keeps a bounded replay of the display text so a late
//! consumer can repaint the terminal.

use std::collections::VecDeque;
use tokio::time::Instant;

use crate::ansi::{strip_ansi, strip_bracketed_paste};
use crate::detector::{Failure, FailureDetector};

/// Result of pushing one chunk through the pipeline
#[derive(Debug, Default)]
pub struct ProcessedChunk {
    /// Display-oriented text for the output event (may be empty when the
    /// chunk ended inside a multi-byte character)
    pub display: String,
    pub failure: Option<Failure>,
}

pub struct OutputPipeline {
    detector: FailureDetector,
    pending: Vec<u8>,
    replay: VecDeque<String>,
    replay_bytes: usize,
    max_replay_bytes: usize,
}

impl OutputPipeline {
    pub fn new(detector: FailureDetector, max_replay_bytes: usize) -> Self {
        Self {
            detector,
            pending: Vec::new(),
            replay: VecDeque::new(),
            replay_bytes: 0,
            max_replay_bytes,
        }
    }

    pub fn process(&mut self, now: Instant, raw: &[u8]) -> ProcessedChunk {
        let text = self.decode(raw);
        if text.is_empty() {
            return ProcessedChunk::default();
        }

        let display = strip_bracketed_paste(&text);
        let clean = strip_ansi(&display);
        let failure = self.detector.observe_output(now, &clean);

        self.remember(&display);
        ProcessedChunk { display, failure }
    }

    pub fn observe_input(&mut self, now: Instant, input: &str) {
        self.detector.observe_input(now, input);
    }

    pub fn enable_detection(&mut self, now: Instant) -> bool {
        self.detector.enable(now)
    }

    pub fn detector(&self) -> &FailureDetector {
        &self.detector
    }

    /// Most recent display text, at most `max_bytes` (whole chunks only)
    pub fn recent_output(&self, max_bytes: usize) -> String {
        let mut total = 0usize;
        let mut start = self.replay.len();
        for (i, chunk) in self.replay.iter().enumerate().rev() {
            if total + chunk.len() > max_bytes {
                break;
            }
            total += chunk.len();
            start = i;
        }
        self.replay.range(start..).map(String::as_str).collect()
    }

    fn remember(&mut self, display: &str) {
        if display.is_empty() || self.max_replay_bytes == 0 {
            return;
        }
        self.replay_bytes += display.len();
        self.replay.push_back(display.to_string());
        while self.replay_bytes > self.max_replay_bytes {
            match self.replay.pop_front() {
                Some(removed) => {
                    self.replay_bytes = self.replay_bytes.saturating_sub(removed.len())
                }
                None => break,
            }
        }
    }

    /// Decode as much of `pending + raw` as possible, keeping an incomplete
    /// trailing character for the next chunk. Invalid bytes become U+FFFD.
    fn decode(&mut self, raw: &[u8]) -> String {
        self.pending.extend_from_slice(raw);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // valid_up_to guarantees this prefix is UTF-8
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }
}
