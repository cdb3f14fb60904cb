// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The remote-dispatch plugin.
//!
//! Tasks whose domain is not local are intercepted by the worker and handed
//! to this state, which serializes them, ships one copy to every destination
//! node over the RPC engine, and folds the replies back into the origin
//! task. On the serving side the plugin registers the two push handlers with
//! the engine, executes replicas through the ordinary queue path, and
//! answers with the reply archive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use strata_runtime::net::rpc::{BulkBuffer, IoType, RpcRequest};
use strata_runtime::net::serialize::{
    BinaryInputArchive, BinaryOutputArchive, DataTransfer, DataTransferFlags,
};
use strata_runtime::queue::MultiQueue;
use strata_runtime::shmem::Allocator;
use strata_runtime::{
    Client, DomainId, NodeId, RemoteDispatcher, Runtime, StateDesc, Task, TaskFlags, TaskPayload,
    TaskRef, TaskState, TaskStateId,
};

pub const LIB_NAME: &str = "strata_remote_queue";

pub mod method {
    pub use strata_runtime::method::{CONSTRUCT, DESTRUCT, FIRST_USER};

    pub const DISPERSE: u32 = FIRST_USER;
}

pub const RPC_PUSH_SMALL: &str = "rpc_push_small";
pub const RPC_PUSH_BULK: &str = "rpc_push_bulk";

const PHASE_SEND: u32 = 0;
const PHASE_WAIT: u32 = 1;

/// Ships one origin task to `dests.len()` nodes and completes it when every
/// reply is in.
///
/// This task never leaves the runtime process, so it may carry ordinary heap
/// fields; they are dropped in `release`.
#[repr(C)]
pub struct DisperseTask {
    pub task: Task,
    orig: TaskRef,
    dests: Vec<NodeId>,
    futures: Vec<strata_runtime::net::rpc::RpcFuture>,
    phase: u32,
}

// === impl DisperseTask ===

impl DisperseTask {
    fn new(state_id: TaskStateId, orig: TaskRef, dests: Vec<NodeId>) -> Self {
        let orig_header = orig.header();
        Self {
            task: Task::new(
                orig_header.task_node.child(),
                DomainId::Local,
                state_id,
                orig_header.lane_hash,
                method::DISPERSE,
                TaskFlags::FIRE_AND_FORGET,
            ),
            orig,
            dests,
            futures: Vec::new(),
            phase: PHASE_SEND,
        }
    }
}

// Safety: #[repr(C)], header first; the heap fields stay within this
// process and are released below.
unsafe impl TaskPayload for DisperseTask {
    fn release(&mut self, _alloc: &Allocator) {
        self.dests = Vec::new();
        self.futures = Vec::new();
    }
}

struct Dispatcher {
    state_id: TaskStateId,
}

impl RemoteDispatcher for Dispatcher {
    fn disperse(&self, rt: &Runtime, task: TaskRef, _state: &dyn TaskState, dests: &[NodeId]) {
        let client = rt.client();
        let disperse = DisperseTask::new(self.state_id, task, dests.to_vec());
        let Ok(typed) = client.new_task(disperse) else {
            task.header().set_failed();
            task.header().set_module_complete();
            return;
        };
        if client.submit(typed.task_ref()).is_err() {
            task.header().set_failed();
            task.header().set_module_complete();
        }
    }
}

/// The plugin server.
pub struct Server {
    desc: StateDesc,
    client: Client,
    /// Serve-side deserialization failures, kept for observability; the
    /// server never stops serving over them.
    deser_failures: Arc<AtomicU64>,
}

// === impl Server ===

impl Server {
    pub fn new(rt: &Runtime, desc: StateDesc, _ctor: Option<TaskRef>) -> Self {
        let deser_failures = Arc::new(AtomicU64::new(0));
        let weak = Arc::downgrade(&rt.handle());

        for name in [RPC_PUSH_SMALL, RPC_PUSH_BULK] {
            let weak: Weak<Runtime> = weak.clone();
            let failures = deser_failures.clone();
            rt.engine().register(
                name,
                Arc::new(move |req: RpcRequest| match weak.upgrade() {
                    Some(rt) => serve_push(&rt, req, &failures),
                    None => Vec::new(),
                }),
            );
        }
        rt.install_remote_dispatcher(Arc::new(Dispatcher { state_id: desc.id }));

        Self {
            desc,
            client: rt.client(),
            deser_failures,
        }
    }

    pub fn deserialization_failures(&self) -> u64 {
        self.deser_failures.load(Ordering::Relaxed)
    }

    /// Drive one quantum of a disperse task.
    fn disperse(&self, rt: &Runtime, task: TaskRef) {
        // Safety: method codes key the payload type.
        let t: &mut DisperseTask = unsafe { task.downcast() };
        let orig_header = t.orig.header();
        let Some(exec) = rt.registry().get_state(orig_header.task_state) else {
            tracing::error!(state = %orig_header.task_state, "disperse for unknown task state");
            orig_header.set_failed();
            orig_header.set_module_complete();
            task.header().set_module_complete();
            return;
        };

        match t.phase {
            PHASE_SEND => {
                let mut ar = BinaryOutputArchive::new(rt.node_id());
                exec.save_start(orig_header.method, &mut ar, t.orig);
                let set = ar.finish();
                exec.replicate_start(t.dests.len() as u32, t.orig);

                for &node in &t.dests {
                    let future = if set.is_small() {
                        rt.engine().call_small(
                            node,
                            RPC_PUSH_SMALL,
                            orig_header.task_state,
                            orig_header.method,
                            set.meta.clone(),
                        )
                    } else {
                        let rec = set.records[0];
                        let io_type = if rec.flags.contains(DataTransferFlags::RECEIVER_READ) {
                            IoType::Read
                        } else {
                            IoType::Write
                        };
                        // Safety: the record points into the origin task,
                        // which stays parked in shared memory until this
                        // disperse completes it.
                        let bulk = unsafe { BulkBuffer::new(rec.data as *mut u8, rec.size as usize) };
                        rt.engine().call_bulk(
                            node,
                            RPC_PUSH_BULK,
                            orig_header.task_state,
                            orig_header.method,
                            set.meta.clone(),
                            bulk,
                            io_type,
                        )
                    };
                    t.futures.push(future);
                }
                t.phase = PHASE_WAIT;
            }
            _ => {
                if !t.futures.iter().all(|f| f.is_done()) {
                    return;
                }
                let mut failed = false;
                for (replica, future) in t.futures.iter().enumerate() {
                    match future.wait() {
                        Ok(bytes) if !bytes.is_empty() => {
                            let mut ar = BinaryInputArchive::from_meta(&bytes);
                            exec.load_end(replica as u32, orig_header.method, &mut ar, t.orig);
                        }
                        Ok(_) => {
                            if !orig_header.is_fire_and_forget() {
                                tracing::error!(replica, "empty reply for a waited dispatch");
                                failed = true;
                                break;
                            }
                        }
                        Err(err) => {
                            tracing::error!(replica, %err, "remote dispatch failed");
                            failed = true;
                            break;
                        }
                    }
                }
                if failed {
                    orig_header.set_failed();
                } else {
                    exec.replicate_end(t.orig);
                }
                orig_header.set_module_complete();
                task.header().set_module_complete();
            }
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

    fn run(&self, rt: &Runtime, _queue: MultiQueue, method_id: u32, task: TaskRef) {
        match method_id {
            method::CONSTRUCT | method::DESTRUCT => {
                task.header().set_module_complete();
            }
            method::DISPERSE => self.disperse(rt, task),
            unknown => {
                tracing::error!(state = self.name(), method = unknown, "unknown method");
                task.header().set_module_complete();
            }
        }
    }

    fn del(&self, method_id: u32, task: TaskRef, client: &Client) {
        if method_id == method::DISPERSE {
            // Safety: method codes key the payload type.
            unsafe { task.downcast::<DisperseTask>() }.release(client.alloc());
        }
        client.free_task(task);
    }
}

/// Serve one push: rebuild the task, run it through the local queue path,
/// reply with the end-phase archive.
fn serve_push(rt: &Runtime, req: RpcRequest, failures: &AtomicU64) -> Vec<u8> {
    let Some(state) = rt.registry().get_state(req.state_id) else {
        tracing::error!(state = %req.state_id, "push for unknown task state");
        failures.fetch_add(1, Ordering::Relaxed);
        return Vec::new();
    };
    let client = rt.client();

    // Stage the bulk payload (if any) into a serve-side buffer and present
    // it to the archive as the pending transfer record.
    let mut staged: Vec<u8> = Vec::new();
    let mut records: Vec<DataTransfer> = Vec::new();
    let io_type = req.bulk.map(|(_, io_type)| io_type);
    if let Some((bulk, io_type)) = req.bulk {
        staged = vec![0; bulk.len];
        if io_type == IoType::Read {
            // Safety: the engine guarantees the caller buffer outlives the
            // call; read is the direction this record allows.
            staged.copy_from_slice(unsafe { bulk.as_slice() });
        }
        let flags = match io_type {
            IoType::Read => DataTransferFlags::RECEIVER_READ,
            IoType::Write => DataTransferFlags::RECEIVER_WRITE,
        };
        // Safety: `staged` outlives the archive below.
        records.push(unsafe { DataTransfer::new(flags, staged.as_ptr(), staged.len()) });
    }

    let mut ar = BinaryInputArchive::new(&records, &req.params);
    let replica = match state.load_start(req.method, &mut ar, &client) {
        Ok(replica) if !ar.is_truncated() => replica,
        Ok(replica) => {
            tracing::error!(state = state.name(), "truncated push payload");
            failures.fetch_add(1, Ordering::Relaxed);
            state.del(req.method, replica, &client);
            return Vec::new();
        }
        Err(err) => {
            tracing::error!(state = state.name(), %err, "failed to deserialize push");
            failures.fetch_add(1, Ordering::Relaxed);
            return Vec::new();
        }
    };

    // The replica executes here, whatever the origin intended.
    // Safety: the replica was just allocated by load_start; nothing else
    // references it yet.
    unsafe { replica.downcast::<Task>() }.domain_id = DomainId::Local;
    let fire_and_forget = replica.header().is_fire_and_forget();
    if client.submit(replica).is_err() {
        tracing::error!(state = state.name(), "no queue for pushed task");
        failures.fetch_add(1, Ordering::Relaxed);
        state.del(req.method, replica, &client);
        return Vec::new();
    }
    if fire_and_forget {
        return Vec::new();
    }

    replica.header().wait();

    if io_type == Some(IoType::Write) {
        if let Some((bulk, _)) = req.bulk {
            // Safety: write-back is the direction this call declared; the
            // caller buffer is alive until we return.
            unsafe { bulk.as_mut_slice() }.copy_from_slice(&staged);
        }
    }

    let mut out = BinaryOutputArchive::new(rt.node_id());
    state.save_end(req.method, &mut out, replica);
    let reply = out.finish();
    state.del(req.method, replica, &client);
    reply.meta
}

strata_runtime::declare_task_lib!(Server, "strata_remote_queue");
