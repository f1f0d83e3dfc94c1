//! Extraction of transfer progress from the sync tool's status output.
//!
//! The tool redraws its stats block with carriage returns and newlines,
//! possibly split across arbitrary read boundaries. [`LineBuffer`] turns the
//! raw byte chunks of one stream into complete lines and [`ProgressParser`]
//! picks out `Transferred: <done> / <total>, <percent>%` lines, reporting a
//! value only when it differs from the previous one.

use regex::Regex;
use shared::TransferProgress;
use std::sync::OnceLock;

const TRANSFERRED_PATTERN: &str =
    r"Transferred:\s+([0-9.]+\s*[KMGTP]?i?B)\s*/\s*([0-9.]+\s*[KMGTP]?i?B),\s*(\d+)%";

fn transferred_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(TRANSFERRED_PATTERN).expect("progress pattern compiles"))
}

/// Splits a byte stream into lines on `\r` and `\n`, keeping the trailing
/// incomplete fragment for the next chunk.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        for (index, byte) in self.pending.iter().enumerate() {
            if *byte == b'\n' || *byte == b'\r' {
                if index > start {
                    let line = String::from_utf8_lossy(&self.pending[start..index]);
                    if !line.trim().is_empty() {
                        lines.push(line.into_owned());
                    }
                }
                start = index + 1;
            }
        }

        self.pending.drain(..start);
        lines
    }

    /// Whatever is left once the stream has closed.
    pub fn finish(&mut self) -> Option<String> {
        let rest = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        if rest.is_empty() {
            None
        } else {
            Some(rest)
        }
    }
}

#[derive(Debug, Default)]
pub struct ProgressParser {
    last: Option<(String, u8)>,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a single status line without de-duplication.
    pub fn parse_line(line: &str) -> Option<TransferProgress> {
        let captures = transferred_regex().captures(line)?;
        let percent: u32 = captures[3].parse().ok()?;

        Some(TransferProgress {
            percent: percent.min(100) as u8,
            transferred: captures[1].trim().to_string(),
            total: captures[2].trim().to_string(),
        })
    }

    /// Returns progress only when `(transferred, percent)` changed since the
    /// last reported value.
    pub fn observe(&mut self, line: &str) -> Option<TransferProgress> {
        self.report(Self::parse_line(line)?)
    }

    /// Same filter as `observe` for progress computed by the caller.
    pub fn report(&mut self, progress: TransferProgress) -> Option<TransferProgress> {
        let key = (progress.transferred.clone(), progress.percent);

        if self.last.as_ref() == Some(&key) {
            return None;
        }

        self.last = Some(key);
        Some(progress)
    }
}
