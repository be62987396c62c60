use std::collections::VecDeque;

use bootkeeper_process::{OutputEvent, SlotId};
use chrono::{DateTime, Utc};

use crate::config::OUTPUT_CAPACITY;

#[derive(Debug, Clone)]
struct StoredLine {
    seq: u64,
    line: String,
    timestamp: DateTime<Utc>,
}

/// Bounded FIFO of one slot's recent output lines.
#[derive(Debug)]
pub struct OutputBuffer {
    slot: SlotId,
    next_seq: u64,
    max_lines: usize,
    lines: VecDeque<StoredLine>,
}

impl OutputBuffer {
    pub fn new(slot: SlotId) -> Self {
        Self::with_capacity(slot, OUTPUT_CAPACITY)
    }

    pub fn with_capacity(slot: SlotId, max_lines: usize) -> Self {
        Self {
            slot,
            next_seq: 1,
            max_lines: max_lines.max(1),
            lines: VecDeque::with_capacity(max_lines.max(1)),
        }
    }

    /// Appends a line, evicting the oldest beyond capacity, and returns the
    /// event to publish for it.
    pub fn push_line(&mut self, line: String) -> OutputEvent {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        let timestamp = Utc::now();
        self.lines.push_back(StoredLine {
            seq,
            line: line.clone(),
            timestamp,
        });
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
        OutputEvent {
            slot: self.slot,
            seq,
            line,
            timestamp,
        }
    }

    /// Most recent `limit` lines, oldest first.
    pub fn tail(&self, limit: usize) -> Vec<String> {
        let start = self.lines.len().saturating_sub(limit);
        self.lines.iter().skip(start).map(|l| l.line.clone()).collect()
    }

    /// Same as [`tail`](Self::tail) but as replayable events with their
    /// original sequence numbers and timestamps.
    pub fn tail_events(&self, limit: usize) -> Vec<OutputEvent> {
        let start = self.lines.len().saturating_sub(limit);
        self.lines
            .iter()
            .skip(start)
            .map(|l| OutputEvent {
                slot: self.slot,
                seq: l.seq,
                line: l.line.clone(),
                timestamp: l.timestamp,
            })
            .collect()
    }

    /// Sequence number of the newest line ever appended (0 if none).
    pub fn last_seq(&self) -> u64 {
        self.next_seq.saturating_sub(1)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let mut buf = OutputBuffer::new(SlotId(1));
        for i in 0..250 {
            buf.push_line(format!("line {i}"));
            assert!(buf.len() <= OUTPUT_CAPACITY);
        }
        assert_eq!(buf.len(), OUTPUT_CAPACITY);
        let all = buf.tail(usize::MAX);
        assert_eq!(all.first().map(String::as_str), Some("line 150"));
        assert_eq!(all.last().map(String::as_str), Some("line 249"));
    }

    #[test]
    fn tail_returns_newest_lines_in_order() {
        let mut buf = OutputBuffer::new(SlotId(2));
        assert!(buf.tail(5).is_empty());
        for l in ["a", "b", "c"] {
            buf.push_line(l.to_string());
        }
        assert_eq!(buf.tail(5), vec!["a", "b", "c"]);
        assert_eq!(buf.tail(2), vec!["b", "c"]);
    }

    #[test]
    fn tail_events_keep_sequence_numbers() {
        let mut buf = OutputBuffer::with_capacity(SlotId(3), 3);
        for i in 1..=5 {
            let ev = buf.push_line(format!("{i}"));
            assert_eq!(ev.seq, i);
            assert_eq!(ev.slot, SlotId(3));
        }
        let seqs: Vec<u64> = buf.tail_events(2).iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![4, 5]);
        assert_eq!(buf.last_seq(), 5);
    }
}
