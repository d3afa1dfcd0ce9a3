//
// Copyright 2018 yvt, all rights reserved.
//
// This source code is a part of Nightingales.
//
use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::{Error, ErrorKind, Result};
use crate::manager::{Config, TaskManager};
use crate::surface::{AccessFlags, Accessor, AllocationRef, SurfaceOps, SurfaceTask};
use crate::task::{TaskFlags, TaskRef, TaskState};
use crate::test_utils::{wait_state, wait_until};

fn manager() -> Arc<TaskManager> {
    TaskManager::new(&Config::default()).unwrap()
}

type Trace = Arc<Mutex<Vec<&'static str>>>;

/// Records its name when pushed; completes only when the test calls `done`
/// (unless `auto_done` is set).
#[derive(Debug)]
struct TraceOps {
    name: &'static str,
    trace: Trace,
    auto_done: bool,
}

impl SurfaceOps for TraceOps {
    fn run(&self, task: &TaskRef) -> Result<()> {
        self.trace.lock().push(self.name);
        if self.auto_done {
            task.done();
        }
        Ok(())
    }
}

#[derive(Debug)]
struct FailingOps;

impl SurfaceOps for FailingOps {
    fn setup(&self, _task: &TaskRef) -> Result<()> {
        Err(Error::new(ErrorKind::Failed))
    }
}

fn surface_task(
    manager: &Arc<TaskManager>,
    accessor: u32,
    name: &'static str,
    trace: &Trace,
) -> SurfaceTask {
    SurfaceTask::builder(manager)
        .accessor(Accessor(accessor))
        .ops(Box::new(TraceOps {
            name,
            trace: Arc::clone(trace),
            auto_done: false,
        }))
        .build()
}

#[test]
fn write_chain_same_engine_follows() {
    let manager = manager();
    let trace = Trace::default();
    let allocation = AllocationRef::new();

    let t1 = surface_task(&manager, 0, "t1", &trace);
    t1.add_access(&allocation, AccessFlags::WRITE);
    let t2 = surface_task(&manager, 0, "t2", &trace);
    t2.add_access(&allocation, AccessFlags::WRITE);

    t1.flush();
    t2.flush();

    // Same engine: the follow elision lets the second writer start while the
    // first is still in flight.
    wait_state(t1.task(), TaskState::Running);
    wait_state(t2.task(), TaskState::Running);
    assert_eq!(t2.task().block_count(), 0);
    assert_eq!(allocation.write_task().as_ref(), Some(t2.task()));

    t1.done();
    t2.done();
    manager.sync();
    assert_eq!(*trace.lock(), ["t1", "t2"]);
    assert_eq!(allocation.task_count(), 0);
    assert!(allocation.write_task().is_none());
    manager.shutdown();
}

#[test]
fn serial_write_chain_cross_engine() {
    let manager = manager();
    let trace = Trace::default();
    let allocation = AllocationRef::new();

    let t1 = surface_task(&manager, 0, "t1", &trace);
    t1.add_access(&allocation, AccessFlags::WRITE);
    let t2 = surface_task(&manager, 1, "t2", &trace);
    t2.add_access(&allocation, AccessFlags::WRITE);
    let t3 = surface_task(&manager, 2, "t3", &trace);
    t3.add_access(&allocation, AccessFlags::WRITE);

    t1.flush();
    t2.flush();
    t3.flush();

    wait_state(t1.task(), TaskState::Running);
    wait_state(t2.task(), TaskState::Ready);
    wait_state(t3.task(), TaskState::Ready);
    assert_eq!(t2.task().block_count(), 1);
    assert_eq!(t3.task().block_count(), 1);

    t1.done();
    wait_state(t2.task(), TaskState::Running);
    assert_eq!(t3.task().state(), TaskState::Ready);

    t2.done();
    wait_state(t3.task(), TaskState::Running);

    t3.done();
    manager.sync();
    assert_eq!(*trace.lock(), ["t1", "t2", "t3"]);
    assert_eq!(manager.task_count(), 0);
    assert_eq!(allocation.task_count(), 0);
    manager.shutdown();
}

#[test]
fn writer_then_readers_cross_engine() {
    let manager = manager();
    let trace = Trace::default();
    let allocation = AllocationRef::new();

    let writer = surface_task(&manager, 0, "w", &trace);
    writer.add_access(&allocation, AccessFlags::WRITE);
    let reader1 = surface_task(&manager, 1, "r1", &trace);
    reader1.add_access(&allocation, AccessFlags::READ);
    let reader2 = surface_task(&manager, 1, "r2", &trace);
    reader2.add_access(&allocation, AccessFlags::READ);

    writer.flush();
    reader1.flush();
    reader2.flush();

    wait_state(writer.task(), TaskState::Running);
    wait_state(reader1.task(), TaskState::Ready);
    wait_state(reader2.task(), TaskState::Ready);

    // One edge each from the writer; nothing between the readers.
    assert_eq!(reader1.task().block_count(), 1);
    assert_eq!(reader2.task().block_count(), 1);
    let read_tasks = allocation.read_tasks();
    assert_eq!(read_tasks.len(), 2);
    assert!(read_tasks.contains(reader1.task()));
    assert!(read_tasks.contains(reader2.task()));

    // Both readers proceed in parallel once the writer completes.
    writer.done();
    wait_state(reader1.task(), TaskState::Running);
    wait_state(reader2.task(), TaskState::Running);
    wait_until("write slot cleared", || allocation.write_task().is_none());

    reader1.done();
    reader2.done();
    manager.sync();
    assert!(allocation.read_tasks().is_empty());
    assert_eq!(allocation.task_count(), 0);
    manager.shutdown();
}

#[test]
fn writer_then_readers_same_engine() {
    let manager = manager();
    let trace = Trace::default();
    let allocation = AllocationRef::new();

    let writer = surface_task(&manager, 0, "w", &trace);
    writer.add_access(&allocation, AccessFlags::WRITE);
    let reader1 = surface_task(&manager, 0, "r1", &trace);
    reader1.add_access(&allocation, AccessFlags::READ);
    let reader2 = surface_task(&manager, 0, "r2", &trace);
    reader2.add_access(&allocation, AccessFlags::READ);

    writer.flush();
    reader1.flush();
    reader2.flush();

    // Same engine and the writer already running: the follow elision lets
    // the readers start without a wait.
    wait_state(reader1.task(), TaskState::Running);
    wait_state(reader2.task(), TaskState::Running);
    assert_eq!(writer.task().state(), TaskState::Running);
    assert_eq!(allocation.read_tasks().len(), 2);

    writer.done();
    reader1.done();
    reader2.done();
    manager.sync();
    assert_eq!(allocation.task_count(), 0);
    assert!(allocation.write_task().is_none());
    manager.shutdown();
}

#[test]
fn readers_fence_next_writer() {
    let manager = manager();
    let trace = Trace::default();
    let allocation = AllocationRef::new();

    let mut readers = Vec::new();
    for &name in &["r1", "r2", "r3"] {
        let reader = surface_task(&manager, 0, name, &trace);
        reader.add_access(&allocation, AccessFlags::READ);
        reader.flush();
        readers.push(reader);
    }
    for reader in &readers {
        wait_state(reader.task(), TaskState::Running);
    }

    let writer = surface_task(&manager, 1, "w", &trace);
    writer.add_access(&allocation, AccessFlags::WRITE);
    writer.flush();

    // One edge per reader; the writer supersedes them in the slots.
    wait_state(writer.task(), TaskState::Ready);
    assert_eq!(writer.task().block_count(), 3);
    assert!(allocation.read_tasks().is_empty());
    assert_eq!(allocation.write_task().as_ref(), Some(writer.task()));

    readers[0].done();
    readers[1].done();
    wait_until("one edge left", || writer.task().block_count() == 1);
    assert_eq!(writer.task().state(), TaskState::Ready);

    readers[2].done();
    wait_state(writer.task(), TaskState::Running);

    writer.done();
    manager.sync();
    assert_eq!(manager.task_count(), 0);
    assert_eq!(allocation.task_count(), 0);
    manager.shutdown();
}

#[test]
fn setup_failure_unblocks_chain() {
    let manager = manager();
    let trace = Trace::default();
    let allocation = AllocationRef::new();

    let t1 = surface_task(&manager, 0, "t1", &trace);
    t1.add_access(&allocation, AccessFlags::WRITE);
    t1.flush();
    wait_state(t1.task(), TaskState::Running);

    let t2 = SurfaceTask::builder(&manager)
        .accessor(Accessor(1))
        .ops(Box::new(FailingOps))
        .build();
    t2.add_access(&allocation, AccessFlags::WRITE);
    t2.flush();
    wait_state(t2.task(), TaskState::Invalid);

    // The failed task released its registrations, so the next writer is not
    // blocked by it.
    let t3 = surface_task(&manager, 2, "t3", &trace);
    t3.add_access(&allocation, AccessFlags::WRITE);
    t3.flush();
    wait_state(t3.task(), TaskState::Running);
    assert_eq!(t1.task().state(), TaskState::Running);

    // The stale edge recorded on t1 towards the failed task is dropped on
    // delivery.
    t1.done();
    t3.done();
    manager.sync();
    assert_eq!(manager.task_count(), 0);
    assert_eq!(allocation.task_count(), 0);
    assert!(allocation.write_task().is_none());
    manager.shutdown();
}

#[test]
fn self_accesses_are_ignored() {
    let manager = manager();
    let trace = Trace::default();
    let allocation = AllocationRef::new();

    let task = surface_task(&manager, 0, "t", &trace);
    task.add_access(&allocation, AccessFlags::WRITE);
    task.add_access(&allocation, AccessFlags::READ);
    task.add_access(&allocation, AccessFlags::WRITE);
    task.flush();

    wait_state(task.task(), TaskState::Running);
    assert_eq!(task.task().block_count(), 0);
    assert_eq!(allocation.write_task().as_ref(), Some(task.task()));
    assert_eq!(allocation.task_count(), 3);

    task.done();
    manager.sync();
    assert_eq!(allocation.task_count(), 0);
    assert!(allocation.write_task().is_none());
    assert!(allocation.read_tasks().is_empty());
    manager.shutdown();
}

#[test]
fn emit_notifies_elides_reader_edge() {
    let manager = manager();
    let trace = Trace::default();
    let allocation = AllocationRef::new();

    let writer = SurfaceTask::builder(&manager)
        .accessor(Accessor(0))
        .flags(TaskFlags::EMIT_NOTIFIES)
        .ops(Box::new(TraceOps {
            name: "w",
            trace: Arc::clone(&trace),
            auto_done: false,
        }))
        .build();
    writer.add_access(&allocation, AccessFlags::WRITE);
    writer.flush();
    wait_state(writer.task(), TaskState::Running);

    // Cross-engine read; without EMIT_NOTIFIES this would block.
    let reader = surface_task(&manager, 1, "r", &trace);
    reader.add_access(&allocation, AccessFlags::READ);
    reader.flush();
    wait_state(reader.task(), TaskState::Running);
    assert_eq!(writer.task().state(), TaskState::Running);

    writer.done();
    reader.done();
    manager.sync();
    assert_eq!(allocation.task_count(), 0);
    manager.shutdown();
}

#[test]
fn access_references_are_balanced() {
    let manager = manager();
    let trace = Trace::default();
    let allocation = AllocationRef::new();
    let base = Arc::strong_count(&allocation.0);

    let task = surface_task(&manager, 0, "t", &trace);
    task.add_access(&allocation, AccessFlags::WRITE);
    assert_eq!(Arc::strong_count(&allocation.0), base + 1);
    assert_eq!(allocation.task_count(), 1);

    task.flush();
    wait_state(task.task(), TaskState::Running);
    task.done();
    manager.sync();

    assert_eq!(Arc::strong_count(&allocation.0), base);
    assert_eq!(allocation.task_count(), 0);
    manager.shutdown();
}
