//
// Copyright 2018 yvt, all rights reserved.
//
// This source code is a part of Nightingales.
//
//! Helpers shared by the in-crate test suites.
use std::thread;
use std::time::{Duration, Instant};

use crate::task::{TaskRef, TaskState};

const DEADLINE: Duration = Duration::from_secs(5);

/// Poll until `task` reaches `state` or the deadline expires.
pub fn wait_state(task: &TaskRef, state: TaskState) {
    let deadline = Instant::now() + DEADLINE;
    while task.state() != state {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {} ({:?})",
            state.name(),
            task
        );
        thread::sleep(Duration::from_millis(1));
    }
}

/// Poll until `cond` holds or the deadline expires.
pub fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + DEADLINE;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting until {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}
