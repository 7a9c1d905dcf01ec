//! Core data types for a single managed tool's runtime status and the
//! bounded log ring that captures its output. The declared configuration
//! type lives in [`crate::config`].

use serde::{Deserialize, Serialize};

use crate::ansi::TextSegment;
use crate::config::ToolConfig;

/// An immutable, clone-able view of one tool's state at a point in time.
///
/// The manager's real internal state holds a non-`Clone` `tokio::process`
/// handle and must stay behind its lock; this is what `get_tool`/
/// `get_tools` hand back instead, so callers can never mutate what the
/// manager owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSnapshot {
    pub index: usize,
    pub config: ToolConfig,
    pub status: ToolStatus,
    pub pid: Option<i32>,
    pub start_time: Option<i64>,
    pub exit_code: Option<i32>,
    pub logs: Vec<LogLine>,
    pub log_trim_count: u64,
    pub log_version: u64,
    pub is_virtual: bool,
}

/// The lifecycle status of a tool slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ToolStatus {
    Stopped,
    Waiting,
    Running,
    ShuttingDown,
    Error { message: String },
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolStatus::Stopped => "stopped",
            ToolStatus::Waiting => "waiting",
            ToolStatus::Running => "running",
            ToolStatus::ShuttingDown => "shuttingDown",
            ToolStatus::Error { .. } => "error",
        }
    }
}

/// One line of captured output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub segments: Vec<TextSegment>,
    pub is_stderr: bool,
}

impl LogLine {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            segments: crate::ansi::segment_line(&text.into()),
            is_stderr: false,
        }
    }

    /// Concatenation of every segment's text, ignoring style — what the
    /// HTTP API and search return.
    pub fn text(&self) -> String {
        self.segments.iter().map(|s| s.text.as_str()).collect()
    }
}

/// Fixed-capacity ring of [`LogLine`]s with eviction tracking.
///
/// Mirrors the teacher's plain `LogBuffer`, generalized with the two
/// counters the rest of the system relies on to stay consistent in the
/// face of concurrent readers: `trim_count` so a consumer holding stale
/// indices can detect they've shifted, and `version` so a consumer can
/// tell whether anything changed at all without re-reading the buffer.
#[derive(Debug, Clone)]
pub struct LogRing {
    max_lines: usize,
    lines: std::collections::VecDeque<LogLine>,
    trim_count: u64,
    version: u64,
}

impl LogRing {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            lines: std::collections::VecDeque::new(),
            trim_count: 0,
            version: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn trim_count(&self) -> u64 {
        self.trim_count
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &LogLine> {
        self.lines.iter()
    }

    /// Appends a line, evicting from the front if over capacity.
    /// `logVersion` always advances, even when nothing is evicted.
    pub fn append(&mut self, line: LogLine) {
        self.lines.push_back(line);
        self.evict_overflow();
        self.version += 1;
    }

    /// Overwrites the last line (a carriage-return replacement update),
    /// or appends if the ring is currently empty.
    pub fn replace_last(&mut self, line: LogLine) {
        if let Some(last) = self.lines.back_mut() {
            *last = line;
        } else {
            self.lines.push_back(line);
        }
        self.evict_overflow();
        self.version += 1;
    }

    /// Truncates to empty. `logVersion` advances; `logTrimCount` does not
    /// (a clear is not an eviction in the front-trimming sense).
    pub fn clear(&mut self) {
        self.lines.clear();
        self.version += 1;
    }

    fn evict_overflow(&mut self) {
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            self.trim_count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_evicts_from_front_past_capacity() {
        let mut ring = LogRing::new(2);
        ring.append(LogLine::plain("a"));
        ring.append(LogLine::plain("b"));
        ring.append(LogLine::plain("c"));
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.trim_count(), 1);
        let texts: Vec<String> = ring.iter().map(|l| l.text()).collect();
        assert_eq!(texts, vec!["b", "c"]);
    }

    #[test]
    fn version_always_advances_on_append() {
        let mut ring = LogRing::new(10);
        ring.append(LogLine::plain("a"));
        let v1 = ring.version();
        ring.append(LogLine::plain("b"));
        assert!(ring.version() > v1);
    }

    #[test]
    fn replace_last_overwrites_without_growing() {
        let mut ring = LogRing::new(10);
        ring.append(LogLine::plain("a"));
        ring.replace_last(LogLine::plain("b"));
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.iter().next().unwrap().text(), "b");
    }

    #[test]
    fn replace_last_on_empty_ring_appends() {
        let mut ring = LogRing::new(10);
        ring.replace_last(LogLine::plain("a"));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn clear_empties_without_incrementing_trim_count() {
        let mut ring = LogRing::new(10);
        ring.append(LogLine::plain("a"));
        ring.append(LogLine::plain("b"));
        let trim_before = ring.trim_count();
        ring.clear();
        assert_eq!(ring.len(), 0);
        assert_eq!(ring.trim_count(), trim_before);
    }

    #[test]
    fn version_never_decreases_even_across_clear() {
        let mut ring = LogRing::new(10);
        ring.append(LogLine::plain("a"));
        let before_clear = ring.version();
        ring.clear();
        assert!(ring.version() > before_clear);
    }

    #[test]
    fn trim_count_increases_by_exactly_evicted_count_in_one_step() {
        let mut ring = LogRing::new(1);
        ring.append(LogLine::plain("a"));
        let before = ring.trim_count();
        ring.append(LogLine::plain("b"));
        assert_eq!(ring.trim_count() - before, 1);
    }
}
