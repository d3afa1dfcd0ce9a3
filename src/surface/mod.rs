//
// Copyright 2018 yvt, all rights reserved.
//
// This source code is a part of Nightingales.
//
//! Surface tasks and the allocation access resolver.
//!
//! A surface task declares, while still under producer control, a list of
//! `(allocation, access flags)` pairs. During setup the declarations are
//! resolved against each allocation's registered users — one current writer
//! slot and a set of current readers — into dependency edges:
//!
//!  - a new **writer** waits for every current reader (or, when there are
//!    none, for the current writer) and supersedes them all;
//!  - a new **reader** waits for the current writer and joins the reader set.
//!
//! Readers take precedence over the prior writer because the writer already
//! happened-before the readers registered against it; edges to the readers
//! cover the writer transitively.
//!
//! Each edge is marked as a follow edge when the upstream was registered by
//! the same accessor (execution context); such an edge is eligible for the
//! emit-time elision implemented by the task state machine.
use bitflags::bitflags;
use parking_lot::Mutex;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::manager::TaskManager;
use crate::task::{TaskFlags, TaskRef, TaskState, Work};

#[cfg(test)]
#[path = "./surface_test.rs"]
mod surface_test;

bitflags! {
    /// Kinds of access a surface task declares against an allocation.
    pub struct AccessFlags: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

/// Identifies the execution context performing a task's accesses (a GPU
/// engine, the CPU, ...). Work submitted to one context is implicitly
/// ordered by that context's command stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Accessor(pub u32);

/// A shared surface allocation tracked by the dependency resolver.
///
/// The user slots are mutated only on the manager thread, during task setup
/// and finalise.
#[derive(Debug)]
pub struct SurfaceAllocation {
    users: Mutex<AllocationUsers>,
    task_count: AtomicUsize,
}

#[derive(Debug, Default)]
struct AllocationUsers {
    write_task: Option<AccessUser>,
    read_tasks: Vec<AccessUser>,
}

/// A task currently registered in one of an allocation's user slots.
#[derive(Debug, Clone)]
struct AccessUser {
    task: TaskRef,
    accessor: Accessor,
}

impl SurfaceAllocation {
    /// The number of tasks currently holding a declared access on this
    /// allocation.
    pub fn task_count(&self) -> usize {
        self.task_count.load(Ordering::SeqCst)
    }

    /// The most recently declared writer, if any.
    pub fn write_task(&self) -> Option<TaskRef> {
        self.users.lock().write_task.as_ref().map(|user| user.task.clone())
    }

    /// Snapshot of the current readers.
    pub fn read_tasks(&self) -> Vec<TaskRef> {
        self.users
            .lock()
            .read_tasks
            .iter()
            .map(|user| user.task.clone())
            .collect()
    }
}

/// Reference to a [`SurfaceAllocation`].
///
/// Behaves like an `Arc`; equality is referential. Every declared access
/// holds one such reference until the declaring task finalises.
#[derive(Debug, Clone)]
pub struct AllocationRef(Arc<SurfaceAllocation>);

impl AllocationRef {
    /// Create a fresh allocation with no registered users.
    pub fn new() -> AllocationRef {
        AllocationRef(Arc::new(SurfaceAllocation {
            users: Mutex::new(AllocationUsers::default()),
            task_count: AtomicUsize::new(0),
        }))
    }
}

impl Default for AllocationRef {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for AllocationRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for AllocationRef {}

impl Deref for AllocationRef {
    type Target = SurfaceAllocation;

    fn deref(&self) -> &SurfaceAllocation {
        &self.0
    }
}

/// Domain extension hooks for a surface task.
///
/// Stands in for subclassing: the surface task performs the access
/// bookkeeping and forwards the rest of the lifecycle here. The defaults
/// describe a task that completes as soon as it is emitted.
pub trait SurfaceOps: fmt::Debug + Send + Sync + 'static {
    /// Runs on the manager thread after the accesses have been resolved,
    /// while the task is still being set up.
    fn setup(&self, task: &TaskRef) -> Result<()> {
        let _ = task;
        Ok(())
    }

    /// Perform the work. Must eventually call [`TaskRef::done`].
    fn run(&self, task: &TaskRef) -> Result<()> {
        task.done();
        Ok(())
    }

    /// Runs on the manager thread before the access registrations are
    /// released.
    fn finalise(&self, task: &TaskRef) {
        let _ = task;
    }
}

#[derive(Debug, Default)]
struct DefaultOps;

impl SurfaceOps for DefaultOps {}

#[derive(Debug)]
struct SurfaceShared {
    accessor: Accessor,
    accesses: Mutex<Vec<SurfaceAccess>>,
}

#[derive(Debug)]
struct SurfaceAccess {
    allocation: AllocationRef,
    flags: AccessFlags,
}

/// The [`Work`] implementation binding access declarations to the task
/// graph.
#[derive(Debug)]
struct SurfaceWork {
    shared: Arc<SurfaceShared>,
    ops: Box<dyn SurfaceOps>,
}

impl Work for SurfaceWork {
    fn setup(&self, task: &TaskRef) -> Result<()> {
        let accessor = self.shared.accessor;
        let accesses = self.shared.accesses.lock();
        for access in accesses.iter() {
            let mut users = access.allocation.users.lock();
            if access.flags.contains(AccessFlags::WRITE) {
                if !users.read_tasks.is_empty() {
                    for reader in users.read_tasks.drain(..) {
                        reader.task.add_notify(task, reader.accessor == accessor);
                    }
                } else if let Some(writer) = users.write_task.as_ref() {
                    writer.task.add_notify(task, writer.accessor == accessor);
                }
                users.write_task = Some(AccessUser {
                    task: task.clone(),
                    accessor,
                });
            } else {
                if let Some(writer) = users.write_task.as_ref() {
                    writer.task.add_notify(task, writer.accessor == accessor);
                }
                users.read_tasks.push(AccessUser {
                    task: task.clone(),
                    accessor,
                });
            }
        }
        drop(accesses);
        self.ops.setup(task)
    }

    fn run(&self, task: &TaskRef) -> Result<()> {
        self.ops.run(task)
    }

    fn finalise(&self, task: &TaskRef) {
        self.ops.finalise(task);
        let mut accesses = self.shared.accesses.lock();
        for access in accesses.drain(..) {
            {
                let mut users = access.allocation.users.lock();
                if users.write_task.as_ref().map_or(false, |user| &user.task == task) {
                    users.write_task = None;
                } else if let Some(index) =
                    users.read_tasks.iter().position(|user| &user.task == task)
                {
                    users.read_tasks.remove(index);
                }
            }
            access.allocation.task_count.fetch_sub(1, Ordering::SeqCst);
            // The allocation reference taken at `add_access` drops with the
            // access entry.
        }
    }

    fn describe(&self) -> String {
        format!(
            "accessor 0x{:02x}, accesses {}",
            self.shared.accessor.0,
            self.shared.accesses.lock().len()
        )
    }
}

/// A task ordered against other surface tasks through declared allocation
/// accesses.
#[derive(Debug, Clone)]
pub struct SurfaceTask {
    task: TaskRef,
    shared: Arc<SurfaceShared>,
}

impl SurfaceTask {
    /// Create a surface task with empty flags and the default ops.
    pub fn new(manager: &Arc<TaskManager>, accessor: Accessor) -> SurfaceTask {
        SurfaceTask::builder(manager).accessor(accessor).build()
    }

    pub fn builder(manager: &Arc<TaskManager>) -> SurfaceTaskBuilder {
        SurfaceTaskBuilder {
            manager: Arc::clone(manager),
            accessor: Accessor(0),
            flags: TaskFlags::empty(),
            ops: None,
        }
    }

    /// Declare an access `(allocation, flags)`.
    ///
    /// Only valid while the task is `New`. Holds a reference to the
    /// allocation and raises its task count until finalise.
    pub fn add_access(&self, allocation: &AllocationRef, flags: AccessFlags) {
        assert_eq!(
            self.task.state(),
            TaskState::New,
            "add_access: task already flushed"
        );
        self.shared.accesses.lock().push(SurfaceAccess {
            allocation: allocation.clone(),
            flags,
        });
        allocation.task_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Hand the task over to the manager. See [`TaskRef::flush`].
    pub fn flush(&self) {
        self.task.flush()
    }

    /// Declare completion. See [`TaskRef::done`].
    pub fn done(&self) {
        self.task.done()
    }

    /// The underlying task handle.
    pub fn task(&self) -> &TaskRef {
        &self.task
    }

    pub fn accessor(&self) -> Accessor {
        self.shared.accessor
    }
}

/// Builder for [`SurfaceTask`].
#[derive(Debug)]
pub struct SurfaceTaskBuilder {
    manager: Arc<TaskManager>,
    accessor: Accessor,
    flags: TaskFlags,
    ops: Option<Box<dyn SurfaceOps>>,
}

impl SurfaceTaskBuilder {
    /// Set the execution context identifier. Defaults to `Accessor(0)`.
    pub fn accessor(&mut self, accessor: Accessor) -> &mut Self {
        self.accessor = accessor;
        self
    }

    /// Set the task flags. Defaults to none.
    pub fn flags(&mut self, flags: TaskFlags) -> &mut Self {
        self.flags = flags;
        self
    }

    /// Attach domain hooks. Defaults to ops that complete at emit.
    pub fn ops(&mut self, ops: Box<dyn SurfaceOps>) -> &mut Self {
        self.ops = Some(ops);
        self
    }

    /// Build a `SurfaceTask` in the `New` state.
    pub fn build(&mut self) -> SurfaceTask {
        let shared = Arc::new(SurfaceShared {
            accessor: self.accessor,
            accesses: Mutex::new(Vec::new()),
        });
        let work = SurfaceWork {
            shared: Arc::clone(&shared),
            ops: self.ops.take().unwrap_or_else(|| Box::new(DefaultOps)),
        };
        SurfaceTask {
            task: TaskRef::new(&self.manager, self.flags, Box::new(work)),
            shared,
        }
    }
}
