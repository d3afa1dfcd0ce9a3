//
// Copyright 2018 yvt, all rights reserved.
//
// This source code is a part of Nightingales.
//
//! The task manager: a single-consumer scheduler fed by a thread-safe queue.
//!
//! Producer threads flush tasks from anywhere; exactly one consumer thread
//! pulls them and owns every lifecycle transition of the form
//! `Flushed → Ready` (setup), `Ready → Running` (emit) and `Done →` teardown
//! (finish). The work between `Running` and `Done` may execute on any thread.
//!
//! The manager also maintains two global task counters. `task_count` counts
//! every in-flight task; `task_count_sync` excludes tasks flagged
//! [`NO_SYNC`](crate::task::TaskFlags::NO_SYNC) and backs the [`sync`]
//! barrier.
//!
//! [`sync`]: TaskManager::sync
use lazy_static::lazy_static;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, ErrorKind, Result};
use crate::task::{TaskFlags, TaskRef, TaskState};

#[cfg(test)]
#[path = "./manager_test.rs"]
mod manager_test;

/// How long `sync` waits before giving up with a task dump.
const SYNC_TIMEOUT: Duration = Duration::from_secs(20);

/// Setup/emit steps exceeding this are recorded to the task's journal.
const SLOW_STEP: Duration = Duration::from_millis(3);

/// Task manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Enable the consumer thread. When `false` the manager is inert:
    /// flushed tasks accumulate in the queue and remain in producer control.
    pub task_manager: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self { task_manager: true }
    }
}

/// The single-consumer scheduler driving tasks through their lifecycle.
#[derive(Debug)]
pub struct TaskManager {
    sender: Mutex<Sender<Option<TaskRef>>>,
    receiver: Mutex<Option<Receiver<Option<TaskRef>>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    task_count: AtomicUsize,
    task_count_sync: AtomicUsize,
    sync_mutex: Mutex<()>,
    sync_cond: Condvar,
    registry: Mutex<Vec<TaskRef>>,
}

impl TaskManager {
    /// Construct a manager and, unless configured inert, start its consumer
    /// thread.
    pub fn new(config: &Config) -> Result<Arc<TaskManager>> {
        let (sender, receiver) = channel();
        let manager = Arc::new(TaskManager {
            sender: Mutex::new(sender),
            receiver: Mutex::new(Some(receiver)),
            thread: Mutex::new(None),
            task_count: AtomicUsize::new(0),
            task_count_sync: AtomicUsize::new(0),
            sync_mutex: Mutex::new(()),
            sync_cond: Condvar::new(),
            registry: Mutex::new(Vec::new()),
        });

        if config.task_manager {
            let receiver = manager.receiver.lock().take().unwrap();
            let this = Arc::clone(&manager);
            let join_handle = thread::Builder::new()
                .name("task manager".to_owned())
                .spawn(move || this.manager_loop(receiver))
                .map_err(|e| Error::with_detail(ErrorKind::Other, e))?;
            *manager.thread.lock() = Some(join_handle);
        }

        Ok(manager)
    }

    /// Stop the consumer thread after it has drained the already queued
    /// work. No-op on an inert or already stopped manager.
    pub fn shutdown(&self) {
        let join_handle = self.thread.lock().take();
        if let Some(join_handle) = join_handle {
            let _ = self.sender.lock().send(None);
            join_handle.join().expect("task manager thread panicked");
        }
    }

    /// Block until every in-flight task not flagged `NO_SYNC` has fully
    /// finalised.
    ///
    /// Gives up after [`SYNC_TIMEOUT`], dumping the live-task table to
    /// stderr, and returns anyway.
    pub fn sync(&self) {
        let deadline = Instant::now() + SYNC_TIMEOUT;
        let mut guard = self.sync_mutex.lock();
        while self.task_count_sync.load(Ordering::SeqCst) != 0 {
            if self.sync_cond.wait_until(&mut guard, deadline).timed_out() {
                drop(guard);
                eprintln!(
                    "TaskManager: timeout while syncing (sync count {}, task count {})\n{}",
                    self.task_count_sync.load(Ordering::SeqCst),
                    self.task_count.load(Ordering::SeqCst),
                    self.dump_tasks()
                );
                return;
            }
        }
    }

    /// The number of in-flight tasks.
    pub fn task_count(&self) -> usize {
        self.task_count.load(Ordering::SeqCst)
    }

    /// The number of in-flight tasks counted by the `sync` barrier.
    pub fn task_count_sync(&self) -> usize {
        self.task_count_sync.load(Ordering::SeqCst)
    }

    /// Render a table of all live tasks, one [`describe`] row each, followed
    /// by the pending notify targets.
    ///
    /// [`describe`]: crate::task::Task::describe
    pub fn dump_tasks(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        writeln!(
            out,
            "task               | state    | flags | no | bl | sl | is | finished"
        )
        .unwrap();
        for task in self.registry.lock().iter() {
            writeln!(out, "{}", task.describe()).unwrap();
            for target in task.notify_targets() {
                writeln!(out, "                       {:?}", target).unwrap();
            }
        }
        out
    }

    /// Enqueue a task. Invoked when a task enters `Flushed` (from a
    /// producer) or `Done` (from whoever executed the work). Entering
    /// `Flushed` is what registers the task with the global counters.
    pub(crate) fn push_task(&self, task: TaskRef) {
        if task.state() == TaskState::Flushed {
            self.task_count.fetch_add(1, Ordering::SeqCst);
            if !task.flags().contains(TaskFlags::NO_SYNC) {
                self.task_count_sync.fetch_add(1, Ordering::SeqCst);
            }
            self.registry.lock().push(task.clone());
        }
        let _ = self.sender.lock().send(Some(task));
    }

    /// Drop a fully finalised task out of the accounting. Wakes up `sync`
    /// callers when the last counted task retires.
    pub(crate) fn retire_task(&self, task: &TaskRef) {
        self.registry.lock().retain(|t| t != task);
        self.task_count.fetch_sub(1, Ordering::SeqCst);
        if !task.flags().contains(TaskFlags::NO_SYNC)
            && self.task_count_sync.fetch_sub(1, Ordering::SeqCst) == 1
        {
            // The lock orders the wakeup against the waiters' counter check.
            let _guard = self.sync_mutex.lock();
            self.sync_cond.notify_all();
        }
    }

    fn manager_loop(&self, receiver: Receiver<Option<TaskRef>>) {
        for message in receiver.iter() {
            match message {
                Some(task) => self.handle_task(task),
                None => return,
            }
        }
    }

    fn handle_task(&self, task: TaskRef) {
        match task.state() {
            TaskState::Flushed => {
                let t0 = Instant::now();
                match task.setup() {
                    Ok(()) => {
                        if t0.elapsed() > SLOW_STEP {
                            task.log().record(format!("setup took {:?}", t0.elapsed()));
                        }
                        if task.block_count() == 0 {
                            let t1 = Instant::now();
                            task.emit(true);
                            if t1.elapsed() > SLOW_STEP {
                                task.log().record(format!("emit took {:?}", t1.elapsed()));
                            }
                        }
                    }
                    Err(err) => {
                        // The task completes with no work accomplished;
                        // dependents unblock through the normal path.
                        task.log().record(format!("setup failed: {}", err));
                        task.force_done();
                        task.finish();
                    }
                }
            }
            TaskState::Done => task.finish(),
            state => {
                task.log()
                    .record(format!("handled in unexpected state {}", state.name()));
            }
        }
    }
}

lazy_static! {
    static ref GLOBAL: Mutex<Option<Arc<TaskManager>>> = Mutex::new(None);
}

/// Start the process-wide manager. Call once; panics if one is already
/// running.
pub fn initialise(config: &Config) -> Result<()> {
    let mut global = GLOBAL.lock();
    assert!(global.is_none(), "task manager is already initialised");
    *global = Some(TaskManager::new(config)?);
    Ok(())
}

/// Stop and release the process-wide manager. No-op if not initialised.
pub fn shutdown() {
    let manager = GLOBAL.lock().take();
    if let Some(manager) = manager {
        manager.shutdown();
    }
}

/// The process-wide manager. Panics if [`initialise`] has not been called.
pub fn global() -> Arc<TaskManager> {
    GLOBAL
        .lock()
        .as_ref()
        .expect("task manager is not initialised")
        .clone()
}

/// [`TaskManager::sync`] on the process-wide manager.
pub fn sync() {
    global().sync()
}
