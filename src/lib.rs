//
// Copyright 2018 yvt, all rights reserved.
//
// This source code is a part of Nightingales.
//
//! NgsTask — an asynchronous task graph for surface operations.
//!
//! This crate coordinates units of work that read from and write to shared
//! surface allocations. Producers declare each task's accesses, flush the
//! task, and a single manager thread resolves the declarations into a
//! dependency graph, emitting every task as soon as the graph allows and
//! overlapping execution wherever it can.
//!
//! # Overview
//!
//!  - [`task`] — the task lifecycle state machine: states, flags,
//!    notification edges and master/slave grouping.
//!  - [`manager`] — the single-consumer scheduler, its queue, the global
//!    task counters and the `sync` barrier.
//!  - [`surface`] — surface tasks and the per-allocation reader/writer
//!    dependency resolver.
//!
//! # Example
//!
//! ```
//! use ngstask::manager::{Config, TaskManager};
//! use ngstask::surface::{AccessFlags, Accessor, AllocationRef, SurfaceTask};
//!
//! let manager = TaskManager::new(&Config::default()).unwrap();
//! let allocation = AllocationRef::new();
//!
//! // Two writers on the same allocation execute in flush order.
//! for _ in 0..2 {
//!     let task = SurfaceTask::new(&manager, Accessor(0));
//!     task.add_access(&allocation, AccessFlags::WRITE);
//!     task.flush();
//! }
//!
//! manager.sync();
//! assert_eq!(allocation.task_count(), 0);
//! manager.shutdown();
//! ```
mod debug;
mod error;
pub mod manager;
pub mod surface;
pub mod task;

#[cfg(test)]
pub(crate) mod test_utils;

pub use crate::debug::{LogEntry, TaskLog};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::manager::{Config, TaskManager};
pub use crate::surface::{
    AccessFlags, Accessor, AllocationRef, SurfaceAllocation, SurfaceOps, SurfaceTask,
    SurfaceTaskBuilder,
};
pub use crate::task::{DefaultWork, Task, TaskFlags, TaskRef, TaskState, Work};
