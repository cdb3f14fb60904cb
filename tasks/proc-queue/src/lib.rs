// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The process-queue trampoline: a tiny state for clients that have no queue
//! of their own (adapter front-ends). `push` receives a pointer to a
//! sub-task; the trampoline forwards it into the destination state's queue
//! and tracks its completion so adapter callers only ever touch one queue.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use strata_runtime::queue::MultiQueue;
use strata_runtime::shmem::ShmPointer;
use strata_runtime::{
    Client, DomainId, Result, Runtime, StateDesc, Task, TaskFlags, TaskPayload, TaskRef,
    TaskState, TaskStateId, TypedTask,
};

pub const LIB_NAME: &str = "strata_proc_queue";

pub mod method {
    pub use strata_runtime::method::{CONSTRUCT, DESTRUCT, FIRST_USER};

    pub const PUSH: u32 = FIRST_USER;
}

const PHASE_FORWARD: u32 = 0;
const PHASE_WAIT: u32 = 1;

/// Forwards one sub-task and (unless it is fire-and-forget and unordered)
/// sticks around until it completes.
///
/// The sub-task stays owned by its producer. A producer that frees the
/// sub-task the instant its wait returns can race the trampoline's final
/// visit, which then reads a stale header; the trampoline only ever reads
/// the completion bit after that point, so the race is benign but callers
/// should prefer freeing after the trampoline's queue has gone quiet.
#[repr(C)]
pub struct PushTask {
    pub task: Task,
    pub subtask: ShmPointer,
    phase: u32,
}

// === impl PushTask ===

impl PushTask {
    pub fn new(client: &Client, domain: DomainId, state_id: TaskStateId, subtask: TaskRef) -> Self {
        Self {
            task: Task::new(
                client.make_task_node(),
                domain,
                state_id,
                caller_lane_hash(),
                method::PUSH,
                TaskFlags::FIRE_AND_FORGET,
            ),
            subtask: subtask.shm_ptr(),
            phase: PHASE_FORWARD,
        }
    }
}

// Safety: #[repr(C)], header first, no side allocations (the sub-task is
// owned by its own producer).
unsafe impl TaskPayload for PushTask {}

/// Lane selection for callers without a queue: hash of `(pid, tid)`.
fn caller_lane_hash() -> u32 {
    let mut hasher = DefaultHasher::new();
    (nix::unistd::getpid().as_raw(), nix::unistd::gettid().as_raw()).hash(&mut hasher);
    hasher.finish() as u32
}

pub struct Server {
    desc: StateDesc,
    client: Client,
}

// === impl Server ===

impl Server {
    pub fn new(rt: &Runtime, desc: StateDesc, _ctor: Option<TaskRef>) -> Self {
        Self {
            desc,
            client: rt.client(),
        }
    }

    fn push(&self, task: TaskRef) {
        // Safety: method codes key the payload type.
        let t: &mut PushTask = unsafe { task.downcast() };
        let sub = TaskRef::from_shm(self.client.alloc(), t.subtask);

        if t.phase == PHASE_FORWARD {
            let sub_header = sub.header();
            let detached = sub_header.is_fire_and_forget() && sub_header.is_unordered();
            if let Err(err) = self.client.submit(sub) {
                tracing::error!(state = %sub_header.task_state, %err, "cannot forward sub-task");
                task.header().set_failed();
                task.header().set_module_complete();
                return;
            }
            if detached {
                task.header().set_module_complete();
                return;
            }
            t.phase = PHASE_WAIT;
            return;
        }

        if sub.header().is_complete() {
            task.header().set_module_complete();
        }
    }
}

impl TaskState for Server {
    fn id(&self) -> TaskStateId {
        self.desc.id
    }

    fn name(&self) -> &str {
        &self.desc.name
    }

    fn run(&self, _rt: &Runtime, _queue: MultiQueue, method_id: u32, task: TaskRef) {
        match method_id {
            method::CONSTRUCT | method::DESTRUCT => task.header().set_module_complete(),
            method::PUSH => self.push(task),
            unknown => {
                tracing::error!(state = self.name(), method = unknown, "unknown method");
                task.header().set_module_complete();
            }
        }
    }
}

/// Client handle for the trampoline.
#[derive(Debug, Clone, Copy)]
pub struct ProcQueueClient {
    client: Client,
    pub id: TaskStateId,
}

// === impl ProcQueueClient ===

impl ProcQueueClient {
    pub fn attach(client: Client, id: TaskStateId) -> Self {
        Self { client, id }
    }

    /// Forward `subtask` through the trampoline. The returned handle is the
    /// sub-task itself; the trampoline task frees itself.
    pub fn push<T: TaskPayload>(&self, subtask: &TypedTask<T>) -> Result<()> {
        let push = self.client.new_task(PushTask::new(
            &self.client,
            DomainId::Local,
            self.id,
            subtask.task_ref(),
        ))?;
        self.client.submit(push.task_ref())
    }
}

strata_runtime::declare_task_lib!(Server, "strata_proc_queue");
