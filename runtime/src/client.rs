// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The client surface: allocate tasks in shared memory, enqueue them, wait
//! on completion. Used by external processes attaching to a daemon and by
//! the runtime's own plugins.

use crate::config::{ClientConfig, ServerConfig};
use crate::error::{Result, RuntimeError};
use crate::queue::{LaneData, MultiQueue, QueueManager};
use crate::shmem::{Allocator, ShmPointer, ShmRegion};
use crate::task::{TaskPayload, TaskRef};
use crate::types::{QueueId, TaskNode, TaskStateId};
use core::marker::PhantomData;

/// A typed handle to a task this process created and owns until completion
/// hand-off.
#[derive(Debug)]
pub struct TypedTask<T: TaskPayload> {
    task: TaskRef,
    _marker: PhantomData<*mut T>,
}

// Safety: the payload is `Send` by the `TaskPayload` bound; the handle is
// just a typed pointer wrapper.
unsafe impl<T: TaskPayload> Send for TypedTask<T> {}

// === impl TypedTask ===

impl<T: TaskPayload> TypedTask<T> {
    pub fn task_ref(&self) -> TaskRef {
        self.task
    }

    pub fn get(&self) -> &T {
        // Safety: TypedTask is only built by `Client::new_task` for payload
        // type T, and the creator holds ownership until completion.
        unsafe { self.task.downcast::<T>() }
    }

    pub fn get_mut(&mut self) -> &mut T {
        // Safety: as in `get`, plus `&mut self`.
        unsafe { self.task.downcast::<T>() }
    }
}

/// Cheap, copyable view every task producer works through.
#[derive(Debug, Clone, Copy)]
pub struct Client {
    alloc: Allocator,
    queues: QueueManager,
}

// === impl Client ===

impl Client {
    pub(crate) fn new(alloc: Allocator, queues: QueueManager) -> Self {
        Self { alloc, queues }
    }

    pub fn alloc(&self) -> &Allocator {
        &self.alloc
    }

    pub fn queues(&self) -> &QueueManager {
        &self.queues
    }

    pub fn node_id(&self) -> u32 {
        self.queues.node_id()
    }

    pub fn admin_state_id(&self) -> TaskStateId {
        self.queues.admin_state_id()
    }

    /// Mint the identity for a fresh root task.
    pub fn make_task_node(&self) -> TaskNode {
        self.queues.make_task_node()
    }

    /// Move a fully built payload into shared memory.
    pub fn new_task<T: TaskPayload>(&self, payload: T) -> Result<TypedTask<T>> {
        let (ptr, _) = self.alloc.new_obj(payload)?;
        Ok(TypedTask {
            task: TaskRef::from_shm(&self.alloc, ptr),
            _marker: PhantomData,
        })
    }

    pub fn get_queue(&self, id: QueueId) -> Option<MultiQueue> {
        self.queues.get_queue(id)
    }

    /// The queue owned by a task state (their ids coincide).
    pub fn state_queue(&self, id: TaskStateId) -> Option<MultiQueue> {
        self.queues.get_queue(id.into_kind())
    }

    /// Enqueue a task, retrying with a yield while its lane is full.
    pub fn emplace(&self, queue: MultiQueue, task: TaskRef) {
        let data = LaneData::new(task.shm_ptr());
        let lane_hash = task.header().lane_hash;
        while queue.emplace(lane_hash, data).is_err() {
            std::thread::yield_now();
        }
    }

    /// Enqueue into the queue owned by the task's target state.
    pub fn submit(&self, task: TaskRef) -> Result<()> {
        let queue = self
            .state_queue(task.header().task_state)
            .ok_or_else(|| RuntimeError::NotFound(format!("queue {}", task.header().task_state)))?;
        self.emplace(queue, task);
        Ok(())
    }

    /// Block until `task` completes.
    pub fn wait(&self, task: TaskRef) {
        task.header().wait();
    }

    /// Free a task block without running payload release hooks. For payloads
    /// with side allocations, prefer [`Self::del_task`].
    pub fn free_task(&self, task: TaskRef) {
        self.alloc.free(task.shm_ptr());
    }

    /// Release and free a typed task.
    pub fn del_task<T: TaskPayload>(&self, mut task: TypedTask<T>) {
        task.get_mut().release(&self.alloc);
        self.alloc.free(task.task.shm_ptr());
    }

    pub fn alloc_buffer(&self, len: usize) -> Result<ShmPointer> {
        self.alloc.allocate(len)
    }

    pub fn free_buffer(&self, ptr: ShmPointer) {
        self.alloc.free(ptr);
    }
}

/// A client attached to a daemon's named shared-memory region from another
/// process. Owns the mapping; hand out [`Client`] views via [`Self::client`].
#[derive(Debug)]
pub struct AttachedClient {
    _region: ShmRegion,
    client: Client,
    _config: ClientConfig,
}

// === impl AttachedClient ===

impl AttachedClient {
    /// Attach to the region named in the server configuration.
    pub fn attach(server: &ServerConfig, config: ClientConfig) -> Result<Self> {
        let region = ShmRegion::attach_posix(&server.shm_name, server.shm_size as usize)?;
        let alloc = Allocator::attach(&region)?;
        let queues = QueueManager::client_init(alloc);
        Ok(Self {
            client: Client::new(alloc, queues),
            _region: region,
            _config: config,
        })
    }

    pub fn client(&self) -> Client {
        self.client
    }
}
