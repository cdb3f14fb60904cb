// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Remote dispatch over a two-node loopback cluster.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use strata_admin::{AdminClient, QueueParams};
use strata_runtime::net::rpc::LoopbackFabric;
use strata_runtime::net::serialize::{Archive, BinaryInputArchive, BinaryOutputArchive};
use strata_runtime::queue::MultiQueue;
use strata_runtime::registry::StaticTaskLib;
use strata_runtime::shmem::Allocator;
use strata_runtime::{
    Client, DomainId, Result, Runtime, SrlShape, StateDesc, Task, TaskFlags, TaskNode,
    TaskPayload, TaskRef, TaskSerde, TaskState, TaskStateId, method,
};
use strata_small_message::{FETCH_FILL, IO_PAYLOAD_LEN, SmallMessageClient};

const METHOD_RUN: u32 = method::FIRST_USER;

static REPLICATE_START: AtomicU32 = AtomicU32::new(0);
static REPLICATE_END: AtomicU32 = AtomicU32::new(0);

#[repr(C)]
struct ReplTask {
    task: Task,
    value: u32,
}

// Safety: #[repr(C)], header first, no side allocations.
unsafe impl TaskPayload for ReplTask {}

impl ReplTask {
    fn new(node: TaskNode, domain: DomainId, state_id: TaskStateId) -> Self {
        Self {
            task: Task::new(node, domain, state_id, 0, METHOD_RUN, TaskFlags::SRL_SYM),
            value: 0,
        }
    }

    fn replica() -> Self {
        Self::new(TaskNode::null(), DomainId::Local, TaskStateId::null())
    }
}

impl TaskSerde for ReplTask {
    const SHAPE: SrlShape = SrlShape::Sym;

    fn serialize_start<A: Archive>(&mut self, ar: &mut A, _alloc: &Allocator) {
        self.task.wire_header(ar);
    }

    fn serialize_end<A: Archive>(&mut self, ar: &mut A, _alloc: &Allocator) {
        ar.u32(&mut self.value);
    }
}

struct ReplState {
    desc: StateDesc,
    client: Client,
}

impl TaskState for ReplState {
    fn id(&self) -> TaskStateId {
        self.desc.id
    }

    fn name(&self) -> &str {
        &self.desc.name
    }

    fn run(&self, rt: &Runtime, _queue: MultiQueue, _method: u32, task: TaskRef) {
        // Safety: method codes key the payload type.
        let t: &mut ReplTask = unsafe { task.downcast() };
        t.value = 40 + rt.node_id();
        task.header().set_module_complete();
    }

    fn save_start(&self, _method: u32, ar: &mut BinaryOutputArchive, task: TaskRef) {
        // Safety: method codes key the payload type.
        unsafe { task.downcast::<ReplTask>() }.save_start(ar, self.client.alloc());
    }

    fn load_start(
        &self,
        _method: u32,
        ar: &mut BinaryInputArchive<'_>,
        client: &Client,
    ) -> Result<TaskRef> {
        let mut typed = client.new_task(ReplTask::replica())?;
        typed.get_mut().load_start(ar, client.alloc());
        Ok(typed.task_ref())
    }

    fn save_end(&self, _method: u32, ar: &mut BinaryOutputArchive, task: TaskRef) {
        // Safety: method codes key the payload type.
        unsafe { task.downcast::<ReplTask>() }.serialize_end(ar, self.client.alloc());
    }

    fn load_end(
        &self,
        _replica: u32,
        _method: u32,
        ar: &mut BinaryInputArchive<'_>,
        task: TaskRef,
    ) {
        // Safety: method codes key the payload type.
        unsafe { task.downcast::<ReplTask>() }.serialize_end(ar, self.client.alloc());
    }

    fn replicate_start(&self, _count: u32, _task: TaskRef) {
        REPLICATE_START.fetch_add(1, Ordering::SeqCst);
    }

    fn replicate_end(&self, _task: TaskRef) {
        REPLICATE_END.fetch_add(1, Ordering::SeqCst);
    }
}

fn create_repl_state(rt: &Runtime, desc: StateDesc, _ctor: Option<TaskRef>) -> Box<dyn TaskState> {
    Box::new(ReplState {
        desc,
        client: rt.client(),
    })
}

const REPL_LIB: StaticTaskLib = StaticTaskLib {
    name: "test_repl",
    create_state: create_repl_state,
};

fn two_nodes() -> (Arc<Runtime>, Arc<Runtime>) {
    common::init_tracing();
    let fabric = LoopbackFabric::new();
    let hosts = ["node-a", "node-b"];
    let rt1 = common::serve_node(
        common::test_config(&hosts),
        1,
        Some(fabric.endpoint(1)),
        &[REPL_LIB],
    );
    let rt2 = common::serve_node(
        common::test_config(&hosts),
        2,
        Some(fabric.endpoint(2)),
        &[REPL_LIB],
    );
    (rt1, rt2)
}

/// Create the same state with the same id on both nodes, the way the real
/// deployment does through globally dispatched admin tasks.
fn mirrored_state(
    rt1: &Runtime,
    rt2: &Runtime,
    lib: &str,
    name: &str,
    params: QueueParams,
) -> TaskStateId {
    let id = AdminClient::new(rt1.client())
        .create_task_state(DomainId::Local, lib, name, None, params)
        .unwrap();
    assert!(!id.is_null());
    let mirrored = AdminClient::new(rt2.client())
        .create_task_state(DomainId::Local, lib, name, Some(id), params)
        .unwrap();
    assert_eq!(mirrored, id);
    id
}

#[test]
fn global_disperse_reaches_every_node_once() {
    let (rt1, rt2) = two_nodes();
    let id = mirrored_state(&rt1, &rt2, "test_repl", "replsvc", QueueParams::default());

    let client = rt1.client();
    let task = client
        .new_task(ReplTask::new(
            client.make_task_node(),
            DomainId::Global,
            id,
        ))
        .unwrap();
    client.submit(task.task_ref()).unwrap();
    client.wait(task.task_ref());

    let task_ref = task.task_ref();
    let header = task_ref.header();
    assert!(header.flags().contains(TaskFlags::COMPLETE));
    assert!(!header.is_failed());
    assert_eq!(REPLICATE_START.load(Ordering::SeqCst), 1);
    assert_eq!(REPLICATE_END.load(Ordering::SeqCst), 1);
    // the last reply in destination order wins the result slot
    assert_eq!(task.get().value, 42);

    client.del_task(task);
    rt1.shutdown();
    rt2.shutdown();
}

#[test]
fn node_directed_small_message_executes_remotely() {
    let (rt1, rt2) = two_nodes();
    let id = mirrored_state(
        &rt1,
        &rt2,
        strata_small_message::LIB_NAME,
        "smsvc",
        QueueParams::default(),
    );

    let svc1 = SmallMessageClient::attach(rt1.client(), id);
    let svc2 = SmallMessageClient::attach(rt2.client(), id);

    // ships to node 2 and consumes its counter's zero
    assert_eq!(svc1.md(DomainId::Node(2)).unwrap(), 0);
    assert_eq!(svc2.md(DomainId::Local).unwrap(), 1);
    // node 1's own counter was never touched
    assert_eq!(svc1.md(DomainId::Local).unwrap(), 0);

    rt1.shutdown();
    rt2.shutdown();
}

#[test]
fn bulk_payload_travels_to_the_remote_node() {
    let (rt1, rt2) = two_nodes();
    let id = mirrored_state(
        &rt1,
        &rt2,
        strata_small_message::LIB_NAME,
        "smsvc_io",
        QueueParams::default(),
    );

    let svc1 = SmallMessageClient::attach(rt1.client(), id);
    let svc2 = SmallMessageClient::attach(rt2.client(), id);

    let (ret, data) = svc1.io(DomainId::Node(2), 0x0a).unwrap();
    assert_eq!(ret, 0);
    assert_eq!(data, [0x0a; IO_PAYLOAD_LEN]);
    assert_eq!(svc2.md(DomainId::Local).unwrap(), 1);

    rt1.shutdown();
    rt2.shutdown();
}

#[test]
fn write_direction_bulk_fills_the_caller_buffer() {
    let (rt1, rt2) = two_nodes();
    let id = mirrored_state(
        &rt1,
        &rt2,
        strata_small_message::LIB_NAME,
        "smsvc_fetch",
        QueueParams::default(),
    );

    let svc1 = SmallMessageClient::attach(rt1.client(), id);
    let svc2 = SmallMessageClient::attach(rt2.client(), id);

    // node 2 writes its output back into node 1's buffer over the bulk path
    let (ret, data) = svc1.fetch(DomainId::Node(2)).unwrap();
    assert_eq!(ret, 0);
    assert_eq!(data, [FETCH_FILL; IO_PAYLOAD_LEN]);
    assert_eq!(svc2.md(DomainId::Local).unwrap(), 1);

    rt1.shutdown();
    rt2.shutdown();
}

#[test]
fn transport_failure_fails_the_origin_task() {
    common::init_tracing();
    let fabric = LoopbackFabric::new();
    let hosts = ["node-a", "node-b"];
    // node 2 is configured but never started: calls to it fail
    let rt1 = common::serve_node(
        common::test_config(&hosts),
        1,
        Some(fabric.endpoint(1)),
        &[],
    );
    let id = AdminClient::new(rt1.client())
        .create_task_state(
            DomainId::Local,
            strata_small_message::LIB_NAME,
            "smsvc",
            None,
            QueueParams::default(),
        )
        .unwrap();

    let client = rt1.client();
    let task = client
        .new_task(strata_small_message::MdTask::new(
            client.make_task_node(),
            DomainId::Node(2),
            id,
        ))
        .unwrap();
    client.submit(task.task_ref()).unwrap();

    assert!(common::eventually(Duration::from_secs(5), || {
        task.task_ref().header().is_complete()
    }));
    assert!(task.task_ref().header().is_failed());

    client.del_task(task);
    rt1.shutdown();
}
