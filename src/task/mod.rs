//
// Copyright 2018 yvt, all rights reserved.
//
// This source code is a part of Nightingales.
//
//! The task lifecycle state machine.
//!
//! # Terminology
//!
//! - A **task** is a unit of work that reads from and/or writes to shared
//!   resources. Tasks progress through a fixed sequence of states
//!   (`New → Flushed → Ready → Running → Done`) and are torn down on the
//!   manager thread once complete.
//! - A **notification** is the delivery of one upstream completion to a
//!   downstream task, decrementing its block count. A task is emitted (starts
//!   running) when its block count reaches zero.
//! - A **follow edge** marks the downstream as a continuation on the same
//!   execution context as the upstream. Work submitted to one context is
//!   implicitly ordered by that context's command stream, so the CPU-visible
//!   wait can be elided when the upstream is already in flight.
//! - A **master** owns a group of **slave** tasks. Slaves start running when
//!   the master is emitted and the whole group is destroyed only after the
//!   master and every slave have completed.
use bitflags::bitflags;
use parking_lot::Mutex;
use std::fmt;
use std::mem;
use std::ops::Deref;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::debug::TaskLog;
use crate::error::Result;
use crate::manager::TaskManager;


bitflags! {
    /// Per-task behavioral flags.
    pub struct TaskFlags: u8 {
        /// Broadcast notifications when the task is emitted instead of when
        /// it completes.
        const EMIT_NOTIFIES = 0b01;

        /// Exclude the task from the [`sync`](crate::manager::TaskManager::sync)
        /// barrier.
        const NO_SYNC = 0b10;
    }
}

/// The lifecycle states of a task.
///
/// The sequence is monotonic: a task only ever moves rightward through
/// `New → Flushed → Ready → Running → Done`, and `Invalid` marks a task whose
/// teardown has completed. Any other transition is a contract violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskState {
    New = 0,
    Flushed,
    Ready,
    Running,
    Done,
    Invalid,
}

impl TaskState {
    fn from_u8(x: u8) -> TaskState {
        match x {
            0 => TaskState::New,
            1 => TaskState::Flushed,
            2 => TaskState::Ready,
            3 => TaskState::Running,
            4 => TaskState::Done,
            _ => TaskState::Invalid,
        }
    }

    pub fn name(&self) -> &'static str {
        match *self {
            TaskState::New => "NEW",
            TaskState::Flushed => "FLUSHED",
            TaskState::Ready => "READY",
            TaskState::Running => "RUNNING",
            TaskState::Done => "DONE",
            TaskState::Invalid => "INVALID",
        }
    }
}

/// Lock-free cell holding a `TaskState`. `done` may be reported from any
/// thread, so the state must be readable without taking a task lock.
#[derive(Debug)]
struct AtomicState(AtomicU8);

impl AtomicState {
    fn new(state: TaskState) -> Self {
        AtomicState(AtomicU8::new(state as u8))
    }

    fn load(&self) -> TaskState {
        TaskState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, state: TaskState) {
        self.0.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Domain hooks attached to a task.
///
/// The state machine invokes these at fixed points of the lifecycle. The
/// default implementations provide the behavior of a placeholder task that
/// completes as soon as it is emitted; real task kinds override the hooks
/// they care about.
pub trait Work: fmt::Debug + Send + Sync + 'static {
    /// Invoked on the manager thread while the task is `Flushed`, before it
    /// becomes `Ready`. This is where dependency edges are established.
    ///
    /// A failure forces the task to `Done` with no work accomplished;
    /// dependents still unblock through the ordinary notification path.
    fn setup(&self, task: &TaskRef) -> Result<()> {
        let _ = task;
        Ok(())
    }

    /// Invoked when the task is emitted (entered `Running`).
    fn push(&self, task: &TaskRef) -> Result<()> {
        self.run(task)
    }

    /// Perform the work. The implementation must eventually declare
    /// completion by calling [`TaskRef::done`], possibly from another thread.
    fn run(&self, task: &TaskRef) -> Result<()> {
        task.done();
        Ok(())
    }

    /// Invoked on the manager thread after the task reached `Done`, before it
    /// is destroyed. Releases domain-owned resources.
    fn finalise(&self, task: &TaskRef) {
        let _ = task;
    }

    /// Extra text appended to [`Task::describe`].
    fn describe(&self) -> String {
        String::new()
    }
}

/// The placeholder work kind: no dependencies, completes at emit.
#[derive(Debug, Default)]
pub struct DefaultWork;

impl Work for DefaultWork {}

/// A downstream edge: `target` must wait for the owning task.
#[derive(Debug)]
struct Notify {
    target: TaskRef,
    follow: bool,
}

#[derive(Debug, Default)]
struct Sched {
    /// The number of upstream notifications still pending. Zero is a
    /// precondition for entering `Running`.
    block_count: u32,

    /// Ordered downstream edges, broadcast at emit or completion.
    notifies: Vec<Notify>,
}

#[derive(Debug, Default)]
struct Group {
    master: Option<TaskRef>,

    /// Slaves owned by this task, in attachment order. Kept until the group
    /// winds down so they can be destroyed together with the master.
    slaves: Vec<TaskRef>,

    /// Slaves that have not yet finished.
    live_slaves: usize,

    /// Set on the first `finish`; distinguishes "not done yet" from "done,
    /// waiting on slaves".
    finished: bool,
}

/// A single unit of work tracked by the task manager.
///
/// `Task` itself only implements the lifecycle; the domain behavior is
/// supplied by the [`Work`] attached at construction.
pub struct Task {
    manager: Arc<TaskManager>,
    state: AtomicState,
    flags: TaskFlags,
    sched: Mutex<Sched>,
    group: Mutex<Group>,
    work: Box<dyn Work>,
    log: TaskLog,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("state", &self.state())
            .field("flags", &self.flags)
            .field("work", &self.work)
            .finish()
    }
}

/// A reference to a [`Task`].
///
/// Behaves like an `Arc`: cloning the reference does not clone the task, and
/// equality is referential.
#[derive(Clone)]
pub struct TaskRef(Arc<Task>);

impl PartialEq for TaskRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TaskRef {}

impl Deref for TaskRef {
    type Target = Task;

    fn deref(&self) -> &Task {
        &self.0
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskRef({:p}, {})", Arc::as_ptr(&self.0), self.state().name())
    }
}

impl Task {
    pub fn state(&self) -> TaskState {
        self.state.load()
    }

    pub fn flags(&self) -> TaskFlags {
        self.flags
    }

    /// The number of upstream notifications still pending.
    pub fn block_count(&self) -> u32 {
        self.sched.lock().block_count
    }

    pub fn log(&self) -> &TaskLog {
        &self.log
    }

    pub fn manager(&self) -> &Arc<TaskManager> {
        &self.manager
    }

    /// Whether `finish` has run for this task. A finished master may still
    /// be waiting on its slaves.
    pub fn is_finished(&self) -> bool {
        self.group.lock().finished
    }

    pub(crate) fn notify_targets(&self) -> Vec<TaskRef> {
        self.sched
            .lock()
            .notifies
            .iter()
            .map(|notify| notify.target.clone())
            .collect()
    }

    /// One-line summary in the format used by
    /// [`TaskManager::dump_tasks`](crate::manager::TaskManager::dump_tasks).
    pub fn describe(&self) -> String {
        let (notifies, block_count) = {
            let sched = self.sched.lock();
            (sched.notifies.len(), sched.block_count)
        };
        let (live_slaves, has_master, finished) = {
            let group = self.group.lock();
            (group.live_slaves, group.master.is_some(), group.finished)
        };
        let extra = self.work.describe();
        format!(
            "{:p}   {:<7}  0x{:02x}   {:2}   {:2}   {:2}   {}   {}{}{}",
            self as *const Task,
            self.state().name(),
            self.flags.bits(),
            notifies,
            block_count,
            live_slaves,
            if has_master { "><" } else { "  " },
            if finished { "YES" } else { "no " },
            if extra.is_empty() { "" } else { "   " },
            extra
        )
    }
}

impl TaskRef {
    /// Construct a task in the `New` state.
    pub fn new(manager: &Arc<TaskManager>, flags: TaskFlags, work: Box<dyn Work>) -> TaskRef {
        let task = TaskRef(Arc::new(Task {
            manager: Arc::clone(manager),
            state: AtomicState::new(TaskState::New),
            flags,
            sched: Mutex::new(Sched::default()),
            group: Mutex::new(Group::default()),
            work,
            log: TaskLog::default(),
        }));
        task.log.record("new");
        task
    }

    /// Hand the task over to the manager. `New → Flushed`.
    pub fn flush(&self) {
        self.log.record("flush");
        assert_eq!(self.state(), TaskState::New, "flush: invalid state");
        self.state.store(TaskState::Flushed);
        self.manager.push_task(self.clone());
    }

    /// Declare the completion of the task's work. `Running → Done`.
    ///
    /// Safe to call from any thread, including a completion interrupt
    /// handler; only the state changes here and the teardown is re-enqueued
    /// to the manager thread. A call in any other state is a tolerated
    /// duplicate and is ignored.
    pub fn done(&self) {
        if !self.state.transition(TaskState::Running, TaskState::Done) {
            self.log
                .record(format!("done ignored in state {}", self.state().name()));
            return;
        }
        self.log.record("done");
        self.manager.push_task(self.clone());
    }

    /// Attach `slave` to this task's group.
    ///
    /// Valid before this task is flushed, or while it is running (the slave
    /// then joins as a continuation and starts immediately). The slave must
    /// be `New`, must not already have a master and must not own slaves of
    /// its own.
    pub fn add_slave(&self, slave: &TaskRef) {
        let master_state = self.state();
        assert!(
            master_state == TaskState::New || master_state == TaskState::Running,
            "add_slave: master must be NEW or RUNNING, was {}",
            master_state.name()
        );
        assert_eq!(slave.state(), TaskState::New, "add_slave: slave not NEW");
        {
            let mut slave_group = slave.group.lock();
            assert!(slave_group.master.is_none(), "add_slave: slave already has a master");
            assert!(slave_group.slaves.is_empty(), "add_slave: a slave must not own slaves");
            slave_group.master = Some(self.clone());
        }
        {
            let mut group = self.group.lock();
            group.slaves.push(slave.clone());
            group.live_slaves += 1;
        }
        self.log.record("add_slave");

        if master_state == TaskState::Running {
            slave.state.store(TaskState::Running);
            slave.log.record("push (continuation)");
            if let Err(err) = slave.work.push(slave) {
                slave.log.record(format!("push failed: {}", err));
            }
        }
    }

    /// Record a dependency edge "`task` must wait for `self`" and raise the
    /// downstream's block count, unless one of the elision rules applies:
    ///
    ///  - `task` is `self` (a task re-encountering itself during its own
    ///    setup);
    ///  - the edge is a follow edge and `self` is already in flight with no
    ///    slaves — the downstream may consume on the same context without a
    ///    CPU-visible wait;
    ///  - `self` is running with `EMIT_NOTIFIES` — the downstream was
    ///    already covered by the broadcast at emit.
    ///
    /// Must only be invoked from the manager thread, during the downstream's
    /// setup.
    pub fn add_notify(&self, task: &TaskRef, follow: bool) {
        if task == self {
            debug_assert_eq!(self.state(), TaskState::Flushed);
            return;
        }

        let state = self.state();
        assert!(
            state != TaskState::New && state != TaskState::Flushed,
            "add_notify: upstream not set up yet ({})",
            state.name()
        );

        if follow
            && (state == TaskState::Running || state == TaskState::Done)
            && self.group.lock().live_slaves == 0
        {
            self.log.record("add_notify elided (following task in flight)");
            return;
        }

        if state == TaskState::Running && self.flags.contains(TaskFlags::EMIT_NOTIFIES) {
            self.log.record("add_notify elided (notified at emit)");
            return;
        }

        self.sched.lock().notifies.push(Notify {
            target: task.clone(),
            follow,
        });
        task.sched.lock().block_count += 1;
    }

    /// Start the task: `Ready → Running`, invoke the `push` hooks of the task
    /// and of every slave, then release whatever notifications are due at
    /// emit time.
    ///
    /// `following` is true when the upstream that unblocked this task did so
    /// without an intervening wait (or when the task was never blocked); in
    /// that case the task's own follow edges may be released right away.
    pub(crate) fn emit(&self, following: bool) {
        self.log.record("emit");
        assert_eq!(self.state(), TaskState::Ready, "emit: invalid state");
        debug_assert_eq!(self.block_count(), 0);

        self.state.store(TaskState::Running);

        if let Err(err) = self.work.push(self) {
            self.log.record(format!("push failed: {}", err));
        }

        let slaves = self.group.lock().slaves.clone();
        for slave in &slaves {
            slave.state.store(TaskState::Running);
            slave.log.record("push (slave)");
            if let Err(err) = slave.work.push(slave) {
                slave.log.record(format!("push failed: {}", err));
            }
        }

        if self.flags.contains(TaskFlags::EMIT_NOTIFIES) {
            self.notify_all();
        } else if following && slaves.is_empty() {
            let followers: Vec<TaskRef> = {
                let mut sched = self.sched.lock();
                let mut followers = Vec::new();
                sched.notifies.retain(|notify| {
                    if notify.follow {
                        followers.push(notify.target.clone());
                        false
                    } else {
                        true
                    }
                });
                followers
            };
            for target in followers {
                target.handle_notify(false);
            }
        }
    }

    /// Broadcast completion to every recorded downstream edge and clear the
    /// list.
    pub(crate) fn notify_all(&self) {
        let state = self.state();
        debug_assert!(
            state == TaskState::Done
                || (state == TaskState::Running && self.flags.contains(TaskFlags::EMIT_NOTIFIES)),
            "notify_all in state {}",
            state.name()
        );
        let notifies = mem::take(&mut self.sched.lock().notifies);
        for notify in notifies {
            notify.target.handle_notify(true);
        }
    }

    /// Receive one upstream notification. Emits the task once the block
    /// count reaches zero.
    pub(crate) fn handle_notify(&self, following: bool) {
        if self.state() != TaskState::Ready {
            // The downstream was torn down early (e.g. a failed setup); the
            // dependency is vacuously satisfied.
            self.log
                .record(format!("notify ignored in state {}", self.state().name()));
            return;
        }
        let unblocked = {
            let mut sched = self.sched.lock();
            assert!(sched.block_count > 0, "handle_notify: not blocked");
            sched.block_count -= 1;
            sched.block_count == 0
        };
        if unblocked {
            self.emit(following);
        }
    }

    /// Prepare the task on the manager thread: run the domain `setup` hook
    /// (establishing dependency edges), then `Flushed → Ready`.
    pub(crate) fn setup(&self) -> Result<()> {
        self.log.record("setup");
        assert_eq!(self.state(), TaskState::Flushed, "setup: invalid state");
        self.work.setup(self)?;
        self.state.store(TaskState::Ready);
        Ok(())
    }

    /// Coerce a task whose setup failed straight to `Done` so that it is
    /// finalised through the standard path.
    pub(crate) fn force_done(&self) {
        self.log.record("forced done");
        self.state.store(TaskState::Done);
    }

    /// Process a completed task on the manager thread.
    ///
    /// A slave finalises immediately and reports to its master; a master with
    /// live slaves is retained until the last of them finishes. Whichever
    /// call observes the whole group complete performs the shutdown.
    pub(crate) fn finish(&self) {
        self.log.record("finish");
        assert_eq!(self.state(), TaskState::Done, "finish: invalid state");

        let master = {
            let mut group = self.group.lock();
            group.finished = true;
            group.master.clone()
        };

        let shutdown: Option<TaskRef>;
        if let Some(master) = master {
            // Slaves release their resources as soon as they complete; the
            // handle stays linked to the master until the group winds down.
            self.work.finalise(self);
            let mut group = master.group.lock();
            debug_assert!(group.live_slaves > 0);
            group.live_slaves -= 1;
            shutdown = if group.live_slaves == 0 && group.finished {
                Some(master.clone())
            } else {
                None
            };
        } else if self.group.lock().live_slaves > 0 {
            // Slaves still running; the last one to finish shuts us down.
            shutdown = None;
        } else {
            shutdown = Some(self.clone());
        }

        if let Some(task) = shutdown {
            task.shutdown();
        }
    }

    /// Tear down a completed group: broadcast the remaining notifications,
    /// finalise, detach and invalidate the slaves, and drop out of the
    /// manager's accounting.
    fn shutdown(&self) {
        self.log.record("shutdown");

        self.notify_all();
        self.work.finalise(self);

        let slaves = mem::take(&mut self.group.lock().slaves);
        for slave in slaves {
            slave.group.lock().master = None;
            slave.state.store(TaskState::Invalid);
            slave.log.record("destroyed with master");
        }

        self.manager.retire_task(self);
        self.state.store(TaskState::Invalid);
    }
}
