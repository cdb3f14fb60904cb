// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task-group serialization and lifecycle properties, exercised through
//! test-local task states.

mod common;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use strata_admin::{AdminClient, QueueParams};
use strata_runtime::queue::MultiQueue;
use strata_runtime::registry::StaticTaskLib;
use strata_runtime::{
    DomainId, GroupDisposition, GroupKey, Runtime, StateDesc, Task, TaskFlags, TaskNode,
    TaskPayload, TaskRef, TaskState, TaskStateId, method,
};

const METHOD_RUN: u32 = method::FIRST_USER;

// === group-serialization state (scenario: two blob streams on one lane) ===

static BUSY: [AtomicBool; 2] = [AtomicBool::new(false), AtomicBool::new(false)];
static OVERLAP: AtomicBool = AtomicBool::new(false);
static FINISHED: [AtomicU32; 2] = [AtomicU32::new(0), AtomicU32::new(0)];

#[repr(C)]
struct GroupTask {
    task: Task,
    blob: u32,
    step: u32,
}

// Safety: #[repr(C)], header first, no side allocations.
unsafe impl TaskPayload for GroupTask {}

impl GroupTask {
    fn new(node: TaskNode, state_id: TaskStateId, blob: u32) -> Self {
        Self {
            task: Task::new(
                node,
                DomainId::Local,
                state_id,
                0,
                METHOD_RUN,
                TaskFlags::FIRE_AND_FORGET,
            ),
            blob,
            step: 0,
        }
    }
}

struct GroupState {
    desc: StateDesc,
}

impl TaskState for GroupState {
    fn id(&self) -> TaskStateId {
        self.desc.id
    }

    fn name(&self) -> &str {
        &self.desc.name
    }

    fn get_group(&self, method_id: u32, task: TaskRef, key: &mut GroupKey) -> GroupDisposition {
        if method_id != METHOD_RUN {
            return GroupDisposition::Unordered;
        }
        // Safety: method codes key the payload type.
        let t: &GroupTask = unsafe { task.downcast() };
        key.extend_from_slice(&t.blob.to_le_bytes());
        GroupDisposition::Ordered
    }

    fn run(&self, _rt: &Runtime, _queue: MultiQueue, _method: u32, task: TaskRef) {
        // Safety: method codes key the payload type.
        let t: &mut GroupTask = unsafe { task.downcast() };
        let blob = t.blob as usize;
        if t.step == 0 {
            // First quantum: mark the blob busy and yield. If group
            // admission ever lets two same-blob tasks in flight, the second
            // one observes the busy bit here.
            if BUSY[blob].swap(true, Ordering::SeqCst) {
                OVERLAP.store(true, Ordering::SeqCst);
            }
            t.step = 1;
            return;
        }
        BUSY[blob].store(false, Ordering::SeqCst);
        FINISHED[blob].fetch_add(1, Ordering::SeqCst);
        task.header().set_module_complete();
    }
}

fn create_group_state(
    _rt: &Runtime,
    desc: StateDesc,
    _ctor: Option<TaskRef>,
) -> Box<dyn TaskState> {
    Box::new(GroupState { desc })
}

#[test]
fn same_blob_tasks_never_overlap() {
    let rt = common::single_node_with(&[StaticTaskLib {
        name: "test_group",
        create_state: create_group_state,
    }]);
    let admin = AdminClient::new(rt.client());
    let id = admin
        .create_task_state(
            DomainId::Local,
            "test_group",
            "grpsvc",
            None,
            QueueParams {
                max_lanes: 4,
                num_lanes: 4,
                depth: 256,
                ..QueueParams::default()
            },
        )
        .unwrap();
    assert!(!id.is_null());

    let client = rt.client();
    for i in 0..100 {
        let task = client
            .new_task(GroupTask::new(client.make_task_node(), id, i % 2))
            .unwrap();
        client.submit(task.task_ref()).unwrap();
    }

    assert!(common::eventually(Duration::from_secs(10), || {
        FINISHED[0].load(Ordering::SeqCst) == 50 && FINISHED[1].load(Ordering::SeqCst) == 50
    }));
    assert!(!OVERLAP.load(Ordering::SeqCst));

    rt.shutdown();
}

// === fire-and-forget state (property: storage is released on completion) ===

static FREED_RUNS: AtomicU32 = AtomicU32::new(0);

#[repr(C)]
struct FireTask {
    task: Task,
    pad: [u8; 640],
}

// Safety: #[repr(C)], header first, no side allocations.
unsafe impl TaskPayload for FireTask {}

struct FireState {
    desc: StateDesc,
}

impl TaskState for FireState {
    fn id(&self) -> TaskStateId {
        self.desc.id
    }

    fn name(&self) -> &str {
        &self.desc.name
    }

    fn run(&self, _rt: &Runtime, _queue: MultiQueue, _method: u32, task: TaskRef) {
        FREED_RUNS.fetch_add(1, Ordering::SeqCst);
        task.header().set_module_complete();
    }
}

fn create_fire_state(
    _rt: &Runtime,
    desc: StateDesc,
    _ctor: Option<TaskRef>,
) -> Box<dyn TaskState> {
    Box::new(FireState { desc })
}

#[test]
fn fire_and_forget_storage_is_recycled() {
    let rt = common::single_node_with(&[StaticTaskLib {
        name: "test_fire",
        create_state: create_fire_state,
    }]);
    let admin = AdminClient::new(rt.client());
    let id = admin
        .create_task_state(
            DomainId::Local,
            "test_fire",
            "firesvc",
            None,
            QueueParams::default(),
        )
        .unwrap();

    let client = rt.client();
    let node = client.make_task_node();
    let mut payload = FireTask {
        task: Task::new(
            node,
            DomainId::Local,
            id,
            0,
            METHOD_RUN,
            TaskFlags::FIRE_AND_FORGET,
        ),
        pad: [0; 640],
    };
    payload.task.set_flags(TaskFlags::UNORDERED);
    let task = client.new_task(payload).unwrap();
    let shm_off = task.task_ref().shm_ptr().off;
    client.submit(task.task_ref()).unwrap();

    assert!(common::eventually(Duration::from_secs(5), || {
        FREED_RUNS.load(Ordering::SeqCst) == 1
    }));
    // Give the worker its moment between running the task and freeing it.
    std::thread::sleep(Duration::from_millis(100));

    // The block went back on the free list, so an allocation of the same
    // class hands the exact storage back.
    let reused = client.alloc_buffer(640).unwrap();
    assert_eq!(reused.off, shm_off);

    rt.shutdown();
}

// === long-running state (property: external complete parks it for good) ===

static TICKS: AtomicU32 = AtomicU32::new(0);

struct LongState {
    desc: StateDesc,
}

impl TaskState for LongState {
    fn id(&self) -> TaskStateId {
        self.desc.id
    }

    fn name(&self) -> &str {
        &self.desc.name
    }

    fn run(&self, _rt: &Runtime, _queue: MultiQueue, _method: u32, _task: TaskRef) {
        TICKS.fetch_add(1, Ordering::SeqCst);
    }
}

fn create_long_state(
    _rt: &Runtime,
    desc: StateDesc,
    _ctor: Option<TaskRef>,
) -> Box<dyn TaskState> {
    Box::new(LongState { desc })
}

#[test]
fn external_complete_stops_a_long_running_task() {
    let rt = common::single_node_with(&[StaticTaskLib {
        name: "test_long",
        create_state: create_long_state,
    }]);
    let admin = AdminClient::new(rt.client());
    let id = admin
        .create_task_state(
            DomainId::Local,
            "test_long",
            "longsvc",
            None,
            QueueParams::default(),
        )
        .unwrap();

    let client = rt.client();
    let task = client
        .new_task(Task::new(
            client.make_task_node(),
            DomainId::Local,
            id,
            0,
            METHOD_RUN,
            TaskFlags::LONG_RUNNING,
        ))
        .unwrap();
    client.submit(task.task_ref()).unwrap();

    assert!(common::eventually(Duration::from_secs(5), || {
        TICKS.load(Ordering::SeqCst) >= 3
    }));

    task.task_ref().header().set_external_complete();
    assert!(common::eventually(Duration::from_secs(5), || {
        task.task_ref()
            .header()
            .flags()
            .contains(TaskFlags::COMPLETE)
    }));

    let settled = TICKS.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(TICKS.load(Ordering::SeqCst), settled);

    client.del_task(task);
    rt.shutdown();
}
