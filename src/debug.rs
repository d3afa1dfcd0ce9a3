//
// Copyright 2018 yvt, all rights reserved.
//
// This source code is a part of Nightingales.
//
//! Per-task event journal.
//!
//! Every lifecycle step of a task records a short action string here together
//! with a timestamp and the name of the reporting thread. The journal is a
//! bounded ring, so a long-lived task cannot grow it without bound, and the
//! most recent events are the ones retained for a dump.
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::thread;
use std::time::Instant;

/// The number of entries retained per task.
const TASK_LOG_LEN: usize = 64;

lazy_static! {
    static ref EPOCH: Instant = Instant::now();
}

/// Microseconds elapsed since the journal plumbing was first used.
pub(crate) fn micros() -> u64 {
    EPOCH.elapsed().as_micros() as u64
}

/// A single recorded event.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub micros: u64,
    pub thread: String,
    pub action: String,
}

/// Bounded ring of the most recent events of a task.
#[derive(Debug, Default)]
pub struct TaskLog {
    entries: Mutex<VecDeque<LogEntry>>,
}

impl TaskLog {
    /// Append an action to the journal, stamping it with the current time
    /// and the calling thread's name.
    pub fn record(&self, action: impl Into<String>) {
        let mut entries = self.entries.lock();
        if entries.len() == TASK_LOG_LEN {
            entries.pop_front();
        }
        entries.push_back(LogEntry {
            micros: micros(),
            thread: thread::current().name().unwrap_or("<unnamed>").to_owned(),
            action: action.into(),
        });
    }

    /// Snapshot of the retained entries, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Render the retained entries in the table format used by task dumps.
    pub fn dump(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for entry in self.entries.lock().iter() {
            writeln!(
                out,
                "  [{:<16} {:3}.{:03},{:03}]  {}",
                entry.thread,
                entry.micros / 1_000_000,
                (entry.micros / 1_000) % 1_000,
                entry.micros % 1_000,
                entry.action
            )
            .unwrap();
        }
        out
    }
}
