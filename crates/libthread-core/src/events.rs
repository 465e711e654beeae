//! Structured runtime event journal.
//!
//! A bounded ring of [`Event`] records kept alongside the `log` output.
//! Records serialize to one JSON object per line:
//!
//! ```text
//! {"seq":3,"tid":1,"event":"thread_exited","status":42}
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::kernel::ContextId;
use crate::sync::SpinLock;
use crate::sync::atomic::fetch_and_add;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    RuntimeStarted {
        root_context: ContextId,
        stack_high: usize,
    },
    ThreadCreated {
        stack_high: usize,
        reused_stack: bool,
    },
    ContextStarted {
        context: ContextId,
    },
    CreateFailed {
        reason: String,
    },
    ThreadExited {
        status: usize,
    },
    ThreadJoined {
        status: usize,
    },
    StackGrown {
        new_low: usize,
        bytes: usize,
    },
    FatalFault {
        addr: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub seq: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tid: Option<u32>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug)]
pub struct EventLog {
    capacity: usize,
    next_seq: AtomicUsize,
    ring: SpinLock<VecDeque<Event>>,
}

impl EventLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_seq: AtomicUsize::new(0),
            ring: SpinLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.capacity != 0
    }

    pub fn record(&self, tid: Option<u32>, kind: EventKind) {
        if !self.is_enabled() {
            return;
        }
        let mut ring = self.ring.lock();
        let seq = fetch_and_add(&self.next_seq, 1);
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(Event { seq, tid, kind });
    }

    /// Oldest-first copy of the retained records.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Event> {
        self.ring.lock().iter().cloned().collect()
    }

    /// Records ever offered, including evicted ones.
    #[must_use]
    pub fn total_recorded(&self) -> usize {
        self.next_seq.load(Ordering::Relaxed)
    }

    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        let mut out = String::new();
        for event in self.snapshot() {
            out.push_str(&serde_json::to_string(&event)?);
            out.push('\n');
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_log_keeps_nothing() {
        let log = EventLog::new(0);
        log.record(Some(1), EventKind::ThreadExited { status: 1 });
        assert!(log.snapshot().is_empty());
        assert_eq!(log.total_recorded(), 0);
    }

    #[test]
    fn ring_evicts_oldest() {
        let log = EventLog::new(2);
        for status in 0..3 {
            log.record(Some(1), EventKind::ThreadExited { status });
        }
        let seqs: Vec<_> = log.snapshot().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(log.total_recorded(), 3);
    }

    #[test]
    fn jsonl_is_flat_and_tagged() {
        let log = EventLog::new(4);
        log.record(Some(1), EventKind::ThreadExited { status: 42 });
        log.record(None, EventKind::FatalFault { addr: 16 });
        let text = log.to_jsonl().unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines[0],
            r#"{"seq":0,"tid":1,"event":"thread_exited","status":42}"#
        );
        assert_eq!(lines[1], r#"{"seq":1,"event":"fatal_fault","addr":16}"#);
        let back: Event = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(back.kind, EventKind::ThreadExited { status: 42 });
    }
}
