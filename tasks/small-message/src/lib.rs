// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A minimal echo service used to exercise the runtime end to end: a
//! metadata method returning a monotonically increasing counter, and an I/O
//! method that additionally ships a 256-byte payload as a bulk transfer.

use std::sync::atomic::{AtomicU32, Ordering};
use strata_admin::{AdminClient, QueueParams};
use strata_runtime::net::serialize::{
    Archive, BinaryInputArchive, BinaryOutputArchive, DataTransfer, DataTransferFlags,
};
use strata_runtime::queue::{MultiQueue, QueueFlags};
use strata_runtime::shmem::Allocator;
use strata_runtime::{
    Client, DomainId, Result, Runtime, SrlShape, StateDesc, Task, TaskFlags, TaskNode,
    TaskPayload, TaskRef, TaskSerde, TaskState, TaskStateId,
};

pub const LIB_NAME: &str = "strata_small_message";

pub mod method {
    pub use strata_runtime::method::{CONSTRUCT, DESTRUCT, FIRST_USER};

    pub const MD: u32 = FIRST_USER;
    pub const IO: u32 = FIRST_USER + 1;
    pub const FETCH: u32 = FIRST_USER + 2;
}

pub const IO_PAYLOAD_LEN: usize = 256;

/// Byte the server writes into every fetched buffer.
pub const FETCH_FILL: u8 = 0x5a;

/// Metadata round-trip: returns the server's counter.
#[repr(C)]
pub struct MdTask {
    pub task: Task,
    pub ret: u32,
}

// === impl MdTask ===

impl MdTask {
    pub fn new(node: TaskNode, domain: DomainId, state_id: TaskStateId) -> Self {
        Self {
            task: Task::new(node, domain, state_id, 3, method::MD, TaskFlags::SRL_SYM),
            ret: 0,
        }
    }

    fn replica() -> Self {
        Self::new(TaskNode::null(), DomainId::Local, TaskStateId::null())
    }
}

// Safety: #[repr(C)], header first, no side allocations.
unsafe impl TaskPayload for MdTask {}

impl TaskSerde for MdTask {
    const SHAPE: SrlShape = SrlShape::Sym;

    fn serialize_start<A: Archive>(&mut self, ar: &mut A, _alloc: &Allocator) {
        self.task.wire_header(ar);
    }

    fn serialize_end<A: Archive>(&mut self, ar: &mut A, _alloc: &Allocator) {
        ar.u32(&mut self.ret);
    }
}

/// Bulk round-trip: the payload rides a `RECEIVER_READ` transfer next to the
/// metadata, so the start phase is asymmetric.
#[repr(C)]
pub struct IoTask {
    pub task: Task,
    pub data: [u8; IO_PAYLOAD_LEN],
    pub ret: u32,
}

// === impl IoTask ===

impl IoTask {
    pub fn new(node: TaskNode, domain: DomainId, state_id: TaskStateId, fill: u8) -> Self {
        Self {
            task: Task::new(node, domain, state_id, 3, method::IO, TaskFlags::SRL_ASYM),
            data: [fill; IO_PAYLOAD_LEN],
            ret: 0,
        }
    }

    fn replica() -> Self {
        Self::new(TaskNode::null(), DomainId::Local, TaskStateId::null(), 0)
    }
}

// Safety: #[repr(C)], header first; the payload array is inline.
unsafe impl TaskPayload for IoTask {}

impl TaskSerde for IoTask {
    const SHAPE: SrlShape = SrlShape::Asym;

    fn serialize_start<A: Archive>(&mut self, ar: &mut A, _alloc: &Allocator) {
        self.task.wire_header(ar);
    }

    fn serialize_end<A: Archive>(&mut self, ar: &mut A, _alloc: &Allocator) {
        ar.u32(&mut self.ret);
    }

    fn save_start(&mut self, ar: &mut BinaryOutputArchive, alloc: &Allocator) {
        self.serialize_start(ar, alloc);
        // Safety: the task (and the array inside it) lives in shared memory
        // until the dispatch completes.
        let mut rec = unsafe {
            DataTransfer::new(
                DataTransferFlags::RECEIVER_READ,
                self.data.as_ptr(),
                self.data.len(),
            )
        };
        ar.xfer(&mut rec);
    }

    fn load_start(&mut self, ar: &mut BinaryInputArchive<'_>, alloc: &Allocator) {
        self.serialize_start(ar, alloc);
        let mut rec = DataTransfer::null();
        ar.xfer(&mut rec);
        if !rec.is_null() && rec.size as usize == self.data.len() {
            // Safety: the record was built by the receiving endpoint over a
            // buffer it owns for the duration of this call.
            self.data.copy_from_slice(unsafe { rec.as_slice() });
        }
    }
}

/// The inverse of [`IoTask`]: the server fills the caller's buffer, so the
/// payload rides a `RECEIVER_WRITE` transfer and the serving side keeps the
/// staged record as its output sink.
#[repr(C)]
pub struct FetchTask {
    pub task: Task,
    pub data: [u8; IO_PAYLOAD_LEN],
    /// Serving side only: where `run` writes its output. Null when the task
    /// executes locally.
    sink: DataTransfer,
    pub ret: u32,
}

// === impl FetchTask ===

impl FetchTask {
    pub fn new(node: TaskNode, domain: DomainId, state_id: TaskStateId) -> Self {
        Self {
            task: Task::new(node, domain, state_id, 3, method::FETCH, TaskFlags::SRL_ASYM),
            data: [0; IO_PAYLOAD_LEN],
            sink: DataTransfer::null(),
            ret: 0,
        }
    }

    fn replica() -> Self {
        Self::new(TaskNode::null(), DomainId::Local, TaskStateId::null())
    }
}

// Safety: #[repr(C)], header first; `sink` is serving-endpoint-local
// scratch and never crosses a process boundary.
unsafe impl TaskPayload for FetchTask {}

impl TaskSerde for FetchTask {
    const SHAPE: SrlShape = SrlShape::Asym;

    fn serialize_start<A: Archive>(&mut self, ar: &mut A, _alloc: &Allocator) {
        self.task.wire_header(ar);
    }

    fn serialize_end<A: Archive>(&mut self, ar: &mut A, _alloc: &Allocator) {
        ar.u32(&mut self.ret);
    }

    fn save_start(&mut self, ar: &mut BinaryOutputArchive, alloc: &Allocator) {
        self.serialize_start(ar, alloc);
        // Safety: the task (and the array inside it) lives in shared memory
        // until the dispatch completes.
        let mut rec = unsafe {
            DataTransfer::new(
                DataTransferFlags::RECEIVER_WRITE,
                self.data.as_ptr(),
                self.data.len(),
            )
        };
        ar.xfer(&mut rec);
    }

    fn load_start(&mut self, ar: &mut BinaryInputArchive<'_>, alloc: &Allocator) {
        self.serialize_start(ar, alloc);
        ar.xfer(&mut self.sink);
    }
}

/// The service implementation.
pub struct Server {
    desc: StateDesc,
    client: Client,
    count: AtomicU32,
}

// === impl Server ===

impl Server {
    pub fn new(rt: &Runtime, desc: StateDesc, _ctor: Option<TaskRef>) -> Self {
        Self {
            desc,
            client: rt.client(),
            count: AtomicU32::new(0),
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
            method::CONSTRUCT | method::DESTRUCT => {}
            method::MD => {
                // Safety: method codes key the payload type.
                let t: &mut MdTask = unsafe { task.downcast() };
                t.ret = self.count.fetch_add(1, Ordering::Relaxed);
            }
            method::IO => {
                // Safety: as above.
                let t: &mut IoTask = unsafe { task.downcast() };
                t.ret = self.count.fetch_add(1, Ordering::Relaxed);
            }
            method::FETCH => {
                // Safety: as above.
                let t: &mut FetchTask = unsafe { task.downcast() };
                t.ret = self.count.fetch_add(1, Ordering::Relaxed);
                if t.sink.is_null() {
                    t.data.fill(FETCH_FILL);
                } else {
                    // Safety: the serving endpoint staged this write-back
                    // buffer and keeps it alive until the reply is sent.
                    unsafe { t.sink.as_mut_slice() }.fill(FETCH_FILL);
                }
            }
            unknown => {
                tracing::error!(state = self.name(), method = unknown, "unknown method");
            }
        }
        task.header().set_module_complete();
    }

    fn save_start(&self, method_id: u32, ar: &mut BinaryOutputArchive, task: TaskRef) {
        let alloc = self.client.alloc();
        // Safety (both arms): method codes key the payload type.
        match method_id {
            method::MD => unsafe { task.downcast::<MdTask>().save_start(ar, alloc) },
            method::IO => unsafe { task.downcast::<IoTask>().save_start(ar, alloc) },
            method::FETCH => unsafe { task.downcast::<FetchTask>().save_start(ar, alloc) },
            unknown => tracing::error!(method = unknown, "cannot serialize unknown method"),
        }
    }

    fn load_start(
        &self,
        method_id: u32,
        ar: &mut BinaryInputArchive<'_>,
        client: &Client,
    ) -> Result<TaskRef> {
        match method_id {
            method::MD => {
                let mut typed = client.new_task(MdTask::replica())?;
                typed.get_mut().load_start(ar, client.alloc());
                Ok(typed.task_ref())
            }
            method::IO => {
                let mut typed = client.new_task(IoTask::replica())?;
                typed.get_mut().load_start(ar, client.alloc());
                Ok(typed.task_ref())
            }
            method::FETCH => {
                let mut typed = client.new_task(FetchTask::replica())?;
                typed.get_mut().load_start(ar, client.alloc());
                Ok(typed.task_ref())
            }
            unknown => Err(strata_runtime::RuntimeError::Protocol(format!(
                "unknown small-message method {unknown}"
            ))),
        }
    }

    fn save_end(&self, method_id: u32, ar: &mut BinaryOutputArchive, task: TaskRef) {
        let alloc = self.client.alloc();
        // Safety (both arms): method codes key the payload type.
        match method_id {
            method::MD => unsafe { task.downcast::<MdTask>().serialize_end(ar, alloc) },
            method::IO => unsafe { task.downcast::<IoTask>().serialize_end(ar, alloc) },
            method::FETCH => unsafe { task.downcast::<FetchTask>().serialize_end(ar, alloc) },
            _ => {}
        }
    }

    fn load_end(
        &self,
        _replica: u32,
        method_id: u32,
        ar: &mut BinaryInputArchive<'_>,
        task: TaskRef,
    ) {
        let alloc = self.client.alloc();
        // Safety (both arms): method codes key the payload type.
        match method_id {
            method::MD => unsafe { task.downcast::<MdTask>().serialize_end(ar, alloc) },
            method::IO => unsafe { task.downcast::<IoTask>().serialize_end(ar, alloc) },
            method::FETCH => unsafe { task.downcast::<FetchTask>().serialize_end(ar, alloc) },
            _ => {}
        }
    }
}

/// Client handle for one small-message state.
#[derive(Debug, Clone, Copy)]
pub struct SmallMessageClient {
    client: Client,
    pub id: TaskStateId,
}

// === impl SmallMessageClient ===

impl SmallMessageClient {
    /// Create the state (idempotent on the name) and return a handle.
    pub fn create(client: Client, domain: DomainId, state_name: &str) -> Result<Self> {
        let admin = AdminClient::new(client);
        let id = admin.create_task_state(
            domain,
            LIB_NAME,
            state_name,
            None,
            QueueParams {
                flags: QueueFlags::LOW_LATENCY | QueueFlags::UNORDERED,
                ..QueueParams::default()
            },
        )?;
        Ok(Self { client, id })
    }

    pub fn attach(client: Client, id: TaskStateId) -> Self {
        Self { client, id }
    }

    /// Issue one metadata task and return the server counter.
    pub fn md(&self, domain: DomainId) -> Result<u32> {
        self.md_on_lane(domain, 3)
    }

    /// Like [`Self::md`] but keyed to a chosen lane.
    pub fn md_on_lane(&self, domain: DomainId, lane_hash: u32) -> Result<u32> {
        let node = self.client.make_task_node();
        let mut md = MdTask::new(node, domain, self.id);
        md.task.lane_hash = lane_hash;
        let typed = self.client.new_task(md)?;
        self.client.submit(typed.task_ref())?;
        self.client.wait(typed.task_ref());
        let ret = typed.get().ret;
        self.client.del_task(typed);
        Ok(ret)
    }

    /// Issue one bulk task; returns the server counter and proves the caller
    /// buffer survived byte-for-byte.
    pub fn io(&self, domain: DomainId, fill: u8) -> Result<(u32, [u8; IO_PAYLOAD_LEN])> {
        let node = self.client.make_task_node();
        let typed = self
            .client
            .new_task(IoTask::new(node, domain, self.id, fill))?;
        self.client.submit(typed.task_ref())?;
        self.client.wait(typed.task_ref());
        let ret = typed.get().ret;
        let data = typed.get().data;
        self.client.del_task(typed);
        Ok((ret, data))
    }

    /// Have the server fill this caller's buffer; the write-back direction
    /// of the bulk path.
    pub fn fetch(&self, domain: DomainId) -> Result<(u32, [u8; IO_PAYLOAD_LEN])> {
        let node = self.client.make_task_node();
        let typed = self.client.new_task(FetchTask::new(node, domain, self.id))?;
        self.client.submit(typed.task_ref())?;
        self.client.wait(typed.task_ref());
        let ret = typed.get().ret;
        let data = typed.get().data;
        self.client.del_task(typed);
        Ok((ret, data))
    }
}

strata_runtime::declare_task_lib!(Server, "strata_small_message");
