//
// Copyright 2018 yvt, all rights reserved.
//
// This source code is a part of Nightingales.
//
use std::sync::Arc;

use crate::error::Result;
use crate::manager::{self, Config, TaskManager};
use crate::task::{DefaultWork, TaskFlags, TaskRef, TaskState, Work};
use crate::test_utils::{wait_state, wait_until};

fn manager() -> Arc<TaskManager> {
    TaskManager::new(&Config::default()).unwrap()
}

/// Stays `Running` until the test calls `done`.
#[derive(Debug)]
struct HoldWork;

impl Work for HoldWork {
    fn run(&self, _task: &TaskRef) -> Result<()> {
        Ok(())
    }
}

#[test]
fn sync_on_idle_manager_returns() {
    let manager = manager();
    manager.sync();
    manager.shutdown();
}

#[test]
fn counters_track_flush_and_retire() {
    let manager = manager();
    for _ in 0..5 {
        TaskRef::new(&manager, TaskFlags::empty(), Box::new(DefaultWork)).flush();
    }
    manager.sync();
    assert_eq!(manager.task_count(), 0);
    assert_eq!(manager.task_count_sync(), 0);
    manager.shutdown();
}

#[test]
fn sync_ignores_no_sync_tasks() {
    let manager = manager();

    let mut held = Vec::new();
    for _ in 0..10 {
        let task = TaskRef::new(&manager, TaskFlags::NO_SYNC, Box::new(HoldWork));
        task.flush();
        held.push(task);
    }
    for _ in 0..5 {
        TaskRef::new(&manager, TaskFlags::empty(), Box::new(DefaultWork)).flush();
    }

    // Returns once the five counted tasks are finalised, regardless of the
    // ten NO_SYNC tasks still running.
    manager.sync();
    assert_eq!(manager.task_count_sync(), 0);
    assert_eq!(manager.task_count(), 10);

    for task in &held {
        task.done();
    }
    wait_until("all tasks retired", || manager.task_count() == 0);
    manager.shutdown();
}

#[test]
fn shutdown_drains_queued_work() {
    let manager = manager();
    let task = TaskRef::new(&manager, TaskFlags::empty(), Box::new(DefaultWork));
    task.flush();
    manager.sync();
    manager.shutdown();
    assert_eq!(task.state(), TaskState::Invalid);

    // A second shutdown is a no-op.
    manager.shutdown();
}

#[test]
fn inert_manager_queues_tasks() {
    let manager = TaskManager::new(&Config {
        task_manager: false,
    })
    .unwrap();

    let task = TaskRef::new(&manager, TaskFlags::empty(), Box::new(DefaultWork));
    task.flush();
    assert_eq!(task.state(), TaskState::Flushed);
    assert_eq!(manager.task_count(), 1);
    manager.shutdown();
}

#[test]
fn dump_tasks_lists_live_tasks() {
    let manager = manager();
    let task = TaskRef::new(&manager, TaskFlags::empty(), Box::new(HoldWork));
    task.flush();
    wait_state(&task, TaskState::Running);
    assert!(manager.dump_tasks().contains("RUNNING"));

    task.done();
    manager.sync();
    assert!(!manager.dump_tasks().contains("RUNNING"));
    manager.shutdown();
}

#[test]
fn global_manager_lifecycle() {
    manager::initialise(&Config::default()).unwrap();
    let task = TaskRef::new(&manager::global(), TaskFlags::empty(), Box::new(DefaultWork));
    task.flush();
    manager::sync();
    assert_eq!(task.state(), TaskState::Invalid);
    manager::shutdown();

    // The slot is reusable after a shutdown.
    manager::initialise(&Config::default()).unwrap();
    manager::shutdown();
}
