// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::{TaskPayload, TaskRef};
use crate::client::Client;
use crate::error::{Result, RuntimeError};
use crate::net::serialize::{Archive, BinaryInputArchive, BinaryOutputArchive};
use crate::queue::MultiQueue;
use crate::runtime::Runtime;
use crate::shmem::Allocator;
use crate::types::TaskStateId;
use smallvec::SmallVec;

/// The method codes every task state shares. User methods start at
/// [`method::FIRST_USER`]; methods below it skip group bookkeeping.
pub mod method {
    pub const CONSTRUCT: u32 = 0;
    pub const DESTRUCT: u32 = 1;
    pub const FIRST_USER: u32 = 2;
}

/// Key of a task group within one queue; derived by the owning state.
pub type GroupKey = SmallVec<[u8; 32]>;

/// What `get_group` decided about a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupDisposition {
    /// The task belongs to the group written into the key; at most one task
    /// of that group runs at a time.
    Ordered,
    /// The task needs no serialization with its peers.
    Unordered,
}

/// Identity handed to a state at construction.
#[derive(Debug, Clone)]
pub struct StateDesc {
    pub id: TaskStateId,
    pub name: String,
}

/// Which archive entry points a task type participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrlShape {
    /// One `serialize` per phase, identical for save and load.
    Sym,
    /// Distinct save/load on the start phase; used when the request carries
    /// a bulk payload whose direction differs from the reply.
    Asym,
}

/// Wire behavior of one task type.
///
/// Symmetric types implement the two `serialize_*` functions and get the
/// four phase entry points for free; asymmetric types additionally override
/// `save_start`/`load_start`.
pub trait TaskSerde: TaskPayload {
    const SHAPE: SrlShape;

    /// Request-phase fields, header first.
    fn serialize_start<A: Archive>(&mut self, ar: &mut A, alloc: &Allocator);

    /// Reply-phase fields.
    fn serialize_end<A: Archive>(&mut self, ar: &mut A, alloc: &Allocator);

    fn save_start(&mut self, ar: &mut BinaryOutputArchive, alloc: &Allocator) {
        self.serialize_start(ar, alloc);
    }

    fn load_start(&mut self, ar: &mut BinaryInputArchive<'_>, alloc: &Allocator) {
        self.serialize_start(ar, alloc);
    }
}

/// A named service plugin: the virtual dispatch table the worker drives.
///
/// States are shared between workers, so `run` takes `&self`; a state keeps
/// whatever interior mutability its service needs. The serialization entry
/// points have non-dispatching defaults so purely local states stay small;
/// any state addressed with a non-local domain must override them.
pub trait TaskState: Send + Sync {
    fn id(&self) -> TaskStateId;

    fn name(&self) -> &str;

    /// Run one quantum of `task`. Must not block; a task that cannot finish
    /// returns without setting `MODULE_COMPLETE` and will be revisited.
    fn run(&self, rt: &Runtime, queue: MultiQueue, method: u32, task: TaskRef);

    /// Compute the task-group key for admission control. The default opts
    /// every task out of group serialization.
    fn get_group(&self, _method: u32, _task: TaskRef, _key: &mut GroupKey) -> GroupDisposition {
        GroupDisposition::Unordered
    }

    /// Serialize the request phase of `task` (archive already positioned).
    fn save_start(&self, method: u32, _ar: &mut BinaryOutputArchive, _task: TaskRef) {
        tracing::error!(state = self.name(), method, "state cannot serialize tasks");
    }

    /// Allocate a replica task from the request-phase archive.
    fn load_start(
        &self,
        method: u32,
        _ar: &mut BinaryInputArchive<'_>,
        _client: &Client,
    ) -> Result<TaskRef> {
        Err(RuntimeError::Protocol(format!(
            "state {} cannot deserialize method {method}",
            self.name()
        )))
    }

    /// Serialize the reply phase of `task`.
    fn save_end(&self, method: u32, _ar: &mut BinaryOutputArchive, _task: TaskRef) {
        tracing::error!(state = self.name(), method, "state cannot serialize replies");
    }

    /// Apply the reply of replica `replica` to the origin task.
    fn load_end(&self, _replica: u32, method: u32, _ar: &mut BinaryInputArchive<'_>, _task: TaskRef) {
        tracing::error!(state = self.name(), method, "state cannot deserialize replies");
    }

    /// Reserve room for `count` replica results on `task`.
    fn replicate_start(&self, _count: u32, _task: TaskRef) {}

    /// All replicas have reported; fold the results.
    fn replicate_end(&self, _task: TaskRef) {}

    /// Free `task` and everything it owns. Called for fire-and-forget tasks
    /// by the worker and for replicas by the remote server path.
    fn del(&self, _method: u32, task: TaskRef, client: &Client) {
        client.free_task(task);
    }
}
