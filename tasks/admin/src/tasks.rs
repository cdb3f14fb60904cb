// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task types of the admin state.
//!
//! Every method of the admin surface is a task type. They all serialize
//! symmetrically (request fields out, result id back), so the whole surface
//! works over remote dispatch for cluster administration.

use strata_runtime::net::serialize::{Archive, WireSerialize};
use strata_runtime::queue::QueueFlags;
use strata_runtime::shmem::{Allocator, ShmBuf};
use strata_runtime::{
    Client, DomainId, QueueId, Result, SrlShape, Task, TaskFlags, TaskNode, TaskPayload,
    TaskSerde, TaskStateId,
};

/// Method codes of the admin state.
pub mod method {
    pub use strata_runtime::method::{CONSTRUCT, DESTRUCT, FIRST_USER};

    pub const REGISTER_TASK_LIB: u32 = FIRST_USER;
    pub const DESTROY_TASK_LIB: u32 = FIRST_USER + 1;
    pub const CREATE_TASK_STATE: u32 = FIRST_USER + 2;
    pub const GET_OR_CREATE_TASK_STATE_ID: u32 = FIRST_USER + 3;
    pub const GET_TASK_STATE_ID: u32 = FIRST_USER + 4;
    pub const DESTROY_TASK_STATE: u32 = FIRST_USER + 5;
    pub const STOP_RUNTIME: u32 = FIRST_USER + 6;
    pub const SET_QUEUE_POLICY: u32 = FIRST_USER + 7;
    pub const SET_PROCESS_POLICY: u32 = FIRST_USER + 8;
    pub const CREATE_QUEUE: u32 = FIRST_USER + 9;
    pub const DESTROY_QUEUE: u32 = FIRST_USER + 10;
}

/// Queue geometry for a state created through the admin surface.
#[derive(Debug, Clone, Copy)]
pub struct QueueParams {
    pub max_lanes: u32,
    pub num_lanes: u32,
    pub depth: u32,
    pub flags: QueueFlags,
}

fn admin_header(client: &Client, node: TaskNode, domain: DomainId, method: u32) -> Task {
    Task::new(
        node,
        domain,
        client.admin_state_id(),
        0,
        method,
        TaskFlags::SRL_SYM,
    )
}

/// Registers (or destroys, by method) a task library.
#[repr(C)]
pub struct RegisterTaskLibTask {
    pub task: Task,
    pub lib_name: ShmBuf,
    pub id: TaskStateId,
}

// === impl RegisterTaskLibTask ===

impl RegisterTaskLibTask {
    pub fn new(
        client: &Client,
        node: TaskNode,
        domain: DomainId,
        method: u32,
        lib_name: &str,
    ) -> Result<Self> {
        Ok(Self {
            task: admin_header(client, node, domain, method),
            lib_name: ShmBuf::from_str(client.alloc(), lib_name)?,
            id: TaskStateId::null(),
        })
    }

    pub(crate) fn replica() -> Self {
        Self {
            task: admin_header_null(),
            lib_name: ShmBuf::null(),
            id: TaskStateId::null(),
        }
    }
}

// Safety: #[repr(C)], header first, side allocation released below.
unsafe impl TaskPayload for RegisterTaskLibTask {
    fn release(&mut self, alloc: &Allocator) {
        self.lib_name.free(alloc);
    }
}

impl TaskSerde for RegisterTaskLibTask {
    const SHAPE: SrlShape = SrlShape::Sym;

    fn serialize_start<A: Archive>(&mut self, ar: &mut A, alloc: &Allocator) {
        self.task.wire_header(ar);
        self.lib_name.wire_with(ar, alloc);
    }

    fn serialize_end<A: Archive>(&mut self, ar: &mut A, _alloc: &Allocator) {
        self.id.wire(ar);
    }
}

/// Registers a task state and creates the queue it owns.
#[repr(C)]
pub struct CreateTaskStateTask {
    pub task: Task,
    pub lib_name: ShmBuf,
    pub state_name: ShmBuf,
    pub max_lanes: u32,
    pub num_lanes: u32,
    pub depth: u32,
    pub queue_flags: u32,
    /// In: the desired id, or null to allocate. Out: the bound id, or null
    /// on failure.
    pub id: TaskStateId,
}

// === impl CreateTaskStateTask ===

impl CreateTaskStateTask {
    pub fn new(
        client: &Client,
        node: TaskNode,
        domain: DomainId,
        lib_name: &str,
        state_name: &str,
        id: Option<TaskStateId>,
        queue: QueueParams,
    ) -> Result<Self> {
        Ok(Self {
            task: admin_header(client, node, domain, method::CREATE_TASK_STATE),
            lib_name: ShmBuf::from_str(client.alloc(), lib_name)?,
            state_name: ShmBuf::from_str(client.alloc(), state_name)?,
            max_lanes: queue.max_lanes,
            num_lanes: queue.num_lanes,
            depth: queue.depth,
            queue_flags: queue.flags.bits(),
            id: id.unwrap_or(TaskStateId::null()),
        })
    }

    pub(crate) fn replica() -> Self {
        Self {
            task: admin_header_null(),
            lib_name: ShmBuf::null(),
            state_name: ShmBuf::null(),
            max_lanes: 0,
            num_lanes: 0,
            depth: 0,
            queue_flags: 0,
            id: TaskStateId::null(),
        }
    }
}

// Safety: #[repr(C)], header first, side allocations released below.
unsafe impl TaskPayload for CreateTaskStateTask {
    fn release(&mut self, alloc: &Allocator) {
        self.lib_name.free(alloc);
        self.state_name.free(alloc);
    }
}

impl TaskSerde for CreateTaskStateTask {
    const SHAPE: SrlShape = SrlShape::Sym;

    fn serialize_start<A: Archive>(&mut self, ar: &mut A, alloc: &Allocator) {
        self.task.wire_header(ar);
        self.lib_name.wire_with(ar, alloc);
        self.state_name.wire_with(ar, alloc);
        ar.u32(&mut self.max_lanes);
        ar.u32(&mut self.num_lanes);
        ar.u32(&mut self.depth);
        ar.u32(&mut self.queue_flags);
        self.id.wire(ar);
    }

    fn serialize_end<A: Archive>(&mut self, ar: &mut A, _alloc: &Allocator) {
        self.id.wire(ar);
    }
}

/// Resolves a state name to its id; the get-or-create method also allocates.
#[repr(C)]
pub struct GetTaskStateIdTask {
    pub task: Task,
    pub state_name: ShmBuf,
    pub id: TaskStateId,
}

// === impl GetTaskStateIdTask ===

impl GetTaskStateIdTask {
    pub fn new(
        client: &Client,
        node: TaskNode,
        domain: DomainId,
        method: u32,
        state_name: &str,
    ) -> Result<Self> {
        Ok(Self {
            task: admin_header(client, node, domain, method),
            state_name: ShmBuf::from_str(client.alloc(), state_name)?,
            id: TaskStateId::null(),
        })
    }

    pub(crate) fn replica() -> Self {
        Self {
            task: admin_header_null(),
            state_name: ShmBuf::null(),
            id: TaskStateId::null(),
        }
    }
}

// Safety: #[repr(C)], header first, side allocation released below.
unsafe impl TaskPayload for GetTaskStateIdTask {
    fn release(&mut self, alloc: &Allocator) {
        self.state_name.free(alloc);
    }
}

impl TaskSerde for GetTaskStateIdTask {
    const SHAPE: SrlShape = SrlShape::Sym;

    fn serialize_start<A: Archive>(&mut self, ar: &mut A, alloc: &Allocator) {
        self.task.wire_header(ar);
        self.state_name.wire_with(ar, alloc);
    }

    fn serialize_end<A: Archive>(&mut self, ar: &mut A, _alloc: &Allocator) {
        self.id.wire(ar);
    }
}

/// Destroys a task state (and the queue it owns).
#[repr(C)]
pub struct DestroyTaskStateTask {
    pub task: Task,
    pub id: TaskStateId,
}

// === impl DestroyTaskStateTask ===

impl DestroyTaskStateTask {
    pub fn new(client: &Client, node: TaskNode, domain: DomainId, id: TaskStateId) -> Self {
        Self {
            task: admin_header(client, node, domain, method::DESTROY_TASK_STATE),
            id,
        }
    }

    pub(crate) fn replica() -> Self {
        Self {
            task: admin_header_null(),
            id: TaskStateId::null(),
        }
    }
}

// Safety: #[repr(C)], header first, no side allocations.
unsafe impl TaskPayload for DestroyTaskStateTask {}

impl TaskSerde for DestroyTaskStateTask {
    const SHAPE: SrlShape = SrlShape::Sym;

    fn serialize_start<A: Archive>(&mut self, ar: &mut A, _alloc: &Allocator) {
        self.task.wire_header(ar);
        self.id.wire(ar);
    }

    fn serialize_end<A: Archive>(&mut self, _ar: &mut A, _alloc: &Allocator) {}
}

/// Requests runtime shutdown.
#[repr(C)]
pub struct StopRuntimeTask {
    pub task: Task,
}

// === impl StopRuntimeTask ===

impl StopRuntimeTask {
    pub fn new(client: &Client, node: TaskNode, domain: DomainId) -> Self {
        Self {
            task: admin_header(client, node, domain, method::STOP_RUNTIME),
        }
    }

    pub(crate) fn replica() -> Self {
        Self {
            task: admin_header_null(),
        }
    }
}

// Safety: #[repr(C)], header only.
unsafe impl TaskPayload for StopRuntimeTask {}

impl TaskSerde for StopRuntimeTask {
    const SHAPE: SrlShape = SrlShape::Sym;

    fn serialize_start<A: Archive>(&mut self, ar: &mut A, _alloc: &Allocator) {
        self.task.wire_header(ar);
    }

    fn serialize_end<A: Archive>(&mut self, _ar: &mut A, _alloc: &Allocator) {}
}

/// Installs a scheduling policy (queue or process, by method).
#[repr(C)]
pub struct SetPolicyTask {
    pub task: Task,
    pub policy_id: TaskStateId,
}

// === impl SetPolicyTask ===

impl SetPolicyTask {
    pub fn new(
        client: &Client,
        node: TaskNode,
        domain: DomainId,
        method: u32,
        policy_id: TaskStateId,
    ) -> Self {
        Self {
            task: admin_header(client, node, domain, method),
            policy_id,
        }
    }

    pub(crate) fn replica() -> Self {
        Self {
            task: admin_header_null(),
            policy_id: TaskStateId::null(),
        }
    }
}

// Safety: #[repr(C)], header first, no side allocations.
unsafe impl TaskPayload for SetPolicyTask {}

impl TaskSerde for SetPolicyTask {
    const SHAPE: SrlShape = SrlShape::Sym;

    fn serialize_start<A: Archive>(&mut self, ar: &mut A, _alloc: &Allocator) {
        self.task.wire_header(ar);
        self.policy_id.wire(ar);
    }

    fn serialize_end<A: Archive>(&mut self, _ar: &mut A, _alloc: &Allocator) {}
}

/// Creates a bare queue in the directory. Used by state creation internally
/// and exposed for services that manage auxiliary queues.
#[repr(C)]
pub struct CreateQueueTask {
    pub task: Task,
    pub id: QueueId,
    pub max_lanes: u32,
    pub num_lanes: u32,
    pub depth: u32,
    pub flags: u32,
}

// === impl CreateQueueTask ===

impl CreateQueueTask {
    pub fn new(
        client: &Client,
        node: TaskNode,
        domain: DomainId,
        id: QueueId,
        queue: QueueParams,
    ) -> Self {
        Self {
            task: admin_header(client, node, domain, method::CREATE_QUEUE),
            id,
            max_lanes: queue.max_lanes,
            num_lanes: queue.num_lanes,
            depth: queue.depth,
            flags: queue.flags.bits(),
        }
    }

    pub(crate) fn replica() -> Self {
        Self {
            task: admin_header_null(),
            id: QueueId::null(),
            max_lanes: 0,
            num_lanes: 0,
            depth: 0,
            flags: 0,
        }
    }
}

// Safety: #[repr(C)], header first, no side allocations.
unsafe impl TaskPayload for CreateQueueTask {}

impl TaskSerde for CreateQueueTask {
    const SHAPE: SrlShape = SrlShape::Sym;

    fn serialize_start<A: Archive>(&mut self, ar: &mut A, _alloc: &Allocator) {
        self.task.wire_header(ar);
        self.id.wire(ar);
        ar.u32(&mut self.max_lanes);
        ar.u32(&mut self.num_lanes);
        ar.u32(&mut self.depth);
        ar.u32(&mut self.flags);
    }

    fn serialize_end<A: Archive>(&mut self, _ar: &mut A, _alloc: &Allocator) {}
}

/// Removes a queue from the directory.
#[repr(C)]
pub struct DestroyQueueTask {
    pub task: Task,
    pub id: QueueId,
}

// === impl DestroyQueueTask ===

impl DestroyQueueTask {
    pub fn new(client: &Client, node: TaskNode, domain: DomainId, id: QueueId) -> Self {
        Self {
            task: admin_header(client, node, domain, method::DESTROY_QUEUE),
            id,
        }
    }

    pub(crate) fn replica() -> Self {
        Self {
            task: admin_header_null(),
            id: QueueId::null(),
        }
    }
}

// Safety: #[repr(C)], header first, no side allocations.
unsafe impl TaskPayload for DestroyQueueTask {}

impl TaskSerde for DestroyQueueTask {
    const SHAPE: SrlShape = SrlShape::Sym;

    fn serialize_start<A: Archive>(&mut self, ar: &mut A, _alloc: &Allocator) {
        self.task.wire_header(ar);
        self.id.wire(ar);
    }

    fn serialize_end<A: Archive>(&mut self, _ar: &mut A, _alloc: &Allocator) {}
}

fn admin_header_null() -> Task {
    Task::new(
        TaskNode::null(),
        DomainId::Local,
        TaskStateId::null(),
        0,
        0,
        TaskFlags::SRL_SYM,
    )
}
