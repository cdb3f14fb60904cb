// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The task model.
//!
//! Every task payload is a `#[repr(C)]` struct whose *first field* is the
//! common [`Task`] header; the queues move `ShmPointer`s to these payloads
//! and the worker dispatches on the header alone, downcasting to the typed
//! payload only inside the owning task state.

mod state;

pub use state::{
    GroupDisposition, GroupKey, SrlShape, StateDesc, TaskSerde, TaskState, method,
};

use crate::net::serialize::{Archive, WireSerialize};
use crate::shmem::{Allocator, ShmPointer};
use crate::types::{DomainId, TaskNode, TaskStateId};
use bitflags::bitflags;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: u32 {
        /// Hint that the owning queue should be continuously polled.
        const LOW_LATENCY = 1 << 0;
        /// Not freed on first return; re-entered on each lane visit.
        const LONG_RUNNING = 1 << 1;
        /// Free task storage on completion; no waiter.
        const FIRE_AND_FORGET = 1 << 2;
        /// Opt-out of task-group serialization.
        const UNORDERED = 1 << 3;
        /// Module signaled final completion; ownership returns to the client.
        const COMPLETE = 1 << 4;
        /// Inner method signaled this phase complete.
        const MODULE_COMPLETE = 1 << 5;
        /// Has entered `run` at least once.
        const STARTED = 1 << 6;
        /// Temporarily parked (e.g. awaiting a remote reply).
        const DISABLE_RUN = 1 << 7;
        /// Worker bookkeeping bit for group admission.
        const MARKED = 1 << 8;
        /// Task owns a heap buffer it must free on drop.
        const DATA_OWNER = 1 << 9;
        /// Symmetric serialization shape.
        const SRL_SYM = 1 << 10;
        /// Asymmetric serialization shape.
        const SRL_ASYM = 1 << 11;
        /// Marked complete from outside the worker; treated as
        /// `MODULE_COMPLETE` on the next visit.
        const EXTERNAL_COMPLETE = 1 << 12;
        /// The task finished with an error (remote dispatch failures).
        const FAILED = 1 << 13;
    }
}

/// Flag bits that travel on the wire. Progress bits (started, complete,
/// marked, parked) are runtime-local and never serialized.
const WIRE_FLAGS: TaskFlags = TaskFlags::LOW_LATENCY
    .union(TaskFlags::LONG_RUNNING)
    .union(TaskFlags::FIRE_AND_FORGET)
    .union(TaskFlags::UNORDERED)
    .union(TaskFlags::DATA_OWNER)
    .union(TaskFlags::SRL_SYM)
    .union(TaskFlags::SRL_ASYM);

/// The common task header.
#[derive(Debug)]
#[repr(C)]
pub struct Task {
    /// Which task state owns this task.
    pub task_state: TaskStateId,
    /// Identity in the logical task tree.
    pub task_node: TaskNode,
    /// Where the task should execute.
    pub domain_id: DomainId,
    /// Selects a lane: `lane_hash % num_lanes`.
    pub lane_hash: u32,
    /// Which method of the task state to run.
    pub method: u32,
    flags: AtomicU32,
}

// === impl Task ===

impl Task {
    pub fn new(
        task_node: TaskNode,
        domain_id: DomainId,
        task_state: TaskStateId,
        lane_hash: u32,
        method: u32,
        flags: TaskFlags,
    ) -> Self {
        Self {
            task_state,
            task_node,
            domain_id,
            lane_hash,
            method,
            flags: AtomicU32::new(flags.bits()),
        }
    }

    pub fn flags(&self) -> TaskFlags {
        TaskFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, flags: TaskFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn clear_flags(&self, flags: TaskFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Client-visible completion. Release/acquire on the flag word orders
    /// all in-task writes before the observer's reads.
    pub fn is_complete(&self) -> bool {
        self.flags()
            .intersects(TaskFlags::COMPLETE | TaskFlags::EXTERNAL_COMPLETE)
    }

    pub fn set_complete(&self) {
        self.set_flags(TaskFlags::COMPLETE);
    }

    /// Whether the current phase is finished from the worker's perspective.
    pub fn is_module_complete(&self) -> bool {
        self.flags()
            .intersects(TaskFlags::MODULE_COMPLETE | TaskFlags::EXTERNAL_COMPLETE)
    }

    pub fn set_module_complete(&self) {
        self.set_flags(TaskFlags::MODULE_COMPLETE);
    }

    pub fn set_external_complete(&self) {
        self.set_flags(TaskFlags::EXTERNAL_COMPLETE);
    }

    pub fn is_fire_and_forget(&self) -> bool {
        self.flags().contains(TaskFlags::FIRE_AND_FORGET)
    }

    pub fn is_unordered(&self) -> bool {
        self.flags().contains(TaskFlags::UNORDERED)
    }

    pub fn is_long_running(&self) -> bool {
        self.flags().contains(TaskFlags::LONG_RUNNING)
    }

    pub fn is_started(&self) -> bool {
        self.flags().contains(TaskFlags::STARTED)
    }

    pub fn set_started(&self) {
        self.set_flags(TaskFlags::STARTED);
    }

    pub fn is_run_disabled(&self) -> bool {
        self.flags().contains(TaskFlags::DISABLE_RUN)
    }

    pub fn disable_run(&self) {
        self.set_flags(TaskFlags::DISABLE_RUN);
    }

    pub fn enable_run(&self) {
        self.clear_flags(TaskFlags::DISABLE_RUN);
    }

    pub fn is_marked(&self) -> bool {
        self.flags().contains(TaskFlags::MARKED)
    }

    pub fn set_marked(&self) {
        self.set_flags(TaskFlags::MARKED);
    }

    pub fn unset_marked(&self) {
        self.clear_flags(TaskFlags::MARKED);
    }

    pub fn set_failed(&self) {
        self.set_flags(TaskFlags::FAILED);
    }

    pub fn is_failed(&self) -> bool {
        self.flags().contains(TaskFlags::FAILED)
    }

    /// Spin on completion, cooperatively yielding between bursts.
    pub fn wait(&self) {
        loop {
            for _ in 0..100_000 {
                if self.is_complete() {
                    return;
                }
            }
            std::thread::yield_now();
        }
    }

    /// Serialize the header. Always the first thing on the wire.
    pub fn wire_header<A: Archive>(&mut self, ar: &mut A) {
        self.task_state.wire(ar);
        self.task_node.wire(ar);
        self.domain_id.wire(ar);
        ar.u32(&mut self.lane_hash);
        ar.u32(&mut self.method);
        let mut bits = (self.flags() & WIRE_FLAGS).bits();
        ar.u32(&mut bits);
        if ar.is_loading() {
            self.flags.store(
                (TaskFlags::from_bits_truncate(bits) & WIRE_FLAGS).bits(),
                Ordering::Release,
            );
        }
    }
}

/// Marker for typed task payloads.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` with a [`Task`] header as their first
/// field, and must be safe to place in shared memory (no pointers into
/// process-private memory that another process would chase; runtime-local
/// scratch fields are allowed for tasks that never cross a process boundary).
pub unsafe trait TaskPayload: Send + Sized {
    /// Free any side allocations this payload owns. The task block itself is
    /// freed by the caller afterwards.
    fn release(&mut self, _alloc: &Allocator) {}
}

// Safety: the bare header is itself a complete payload (used by tasks that
// carry no arguments, such as scheduling-policy ticks).
unsafe impl TaskPayload for Task {}

/// An untyped handle to a task in shared memory: the relocatable pointer the
/// queues carry plus the resolved address in this process.
#[derive(Debug, Clone, Copy)]
pub struct TaskRef {
    ptr: ShmPointer,
    raw: NonNull<Task>,
}

// Safety: the pointee is a shared-memory task; cross-thread coordination is
// via the header's atomic flag word.
unsafe impl Send for TaskRef {}
unsafe impl Sync for TaskRef {}

// === impl TaskRef ===

impl TaskRef {
    /// Resolve a queue token into a task handle.
    pub fn from_shm(alloc: &Allocator, ptr: ShmPointer) -> Self {
        Self {
            ptr,
            raw: alloc.convert::<Task>(ptr),
        }
    }

    pub fn shm_ptr(&self) -> ShmPointer {
        self.ptr
    }

    pub fn header(&self) -> &Task {
        // Safety: task blocks live until freed, and freeing is gated on the
        // completion protocol.
        unsafe { self.raw.as_ref() }
    }

    /// View the full typed payload.
    ///
    /// # Safety
    ///
    /// `T` must be the payload type this task was allocated as, and the
    /// caller must hold the execution right for this task (be the running
    /// worker, or the waiter after completion).
    #[expect(clippy::mut_from_ref, reason = "exclusivity follows the task lifecycle")]
    pub unsafe fn downcast<T: TaskPayload>(&self) -> &mut T {
        // Safety: forwarded to the caller.
        unsafe { &mut *self.raw.as_ptr().cast::<T>() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskId;

    fn header() -> Task {
        Task::new(
            TaskNode::new(TaskId::new(1, 9)),
            DomainId::Local,
            TaskStateId::new(1, 2),
            3,
            method::FIRST_USER,
            TaskFlags::SRL_SYM,
        )
    }

    #[test]
    fn completion_flags_fold_together() {
        let task = header();
        assert!(!task.is_complete());
        task.set_external_complete();
        assert!(task.is_complete());
        assert!(task.is_module_complete());
    }

    #[test]
    fn wire_header_round_trips_and_drops_progress_bits() {
        use crate::net::serialize::{BinaryInputArchive, BinaryOutputArchive};

        let mut task = header();
        task.set_flags(TaskFlags::FIRE_AND_FORGET);
        task.set_started();
        task.set_marked();

        let mut out = BinaryOutputArchive::new(1);
        task.wire_header(&mut out);
        let set = out.finish();

        let mut copy = Task::new(
            TaskNode::null(),
            DomainId::Global,
            TaskStateId::null(),
            0,
            0,
            TaskFlags::empty(),
        );
        let mut ar = BinaryInputArchive::from_meta(&set.meta);
        copy.wire_header(&mut ar);

        assert_eq!(copy.task_state, task.task_state);
        assert_eq!(copy.task_node, task.task_node);
        assert_eq!(copy.domain_id, DomainId::Local);
        assert_eq!(copy.lane_hash, 3);
        assert_eq!(copy.method, method::FIRST_USER);
        assert!(copy.is_fire_and_forget());
        assert!(!copy.is_started());
        assert!(!copy.is_marked());
    }
}
