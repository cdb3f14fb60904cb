// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Single-node end-to-end flows: echo counters, bulk payloads, and the
//! task-state lifecycle through the admin surface.

mod common;

use strata_admin::{AdminClient, QueueParams};
use strata_small_message::{FETCH_FILL, IO_PAYLOAD_LEN, SmallMessageClient};
use strata_runtime::DomainId;

#[test]
fn small_message_counter_increments() {
    let rt = common::single_node();
    let svc = SmallMessageClient::create(rt.client(), DomainId::Local, "smsvc").unwrap();

    let rets: Vec<u32> = (0..4)
        .map(|_| svc.md(DomainId::Local).unwrap())
        .collect();
    assert_eq!(rets, vec![0, 1, 2, 3]);

    rt.shutdown();
}

#[test]
fn bulk_payload_round_trips() {
    let rt = common::single_node();
    let svc = SmallMessageClient::create(rt.client(), DomainId::Local, "smsvc_io").unwrap();

    let (ret, data) = svc.io(DomainId::Local, 0x0a).unwrap();
    assert_eq!(ret, 0);
    assert_eq!(data, [0x0a; IO_PAYLOAD_LEN]);

    // the write-back direction: the server fills the caller's buffer
    let (ret, data) = svc.fetch(DomainId::Local).unwrap();
    assert_eq!(ret, 1);
    assert_eq!(data, [FETCH_FILL; IO_PAYLOAD_LEN]);

    // the counter is shared between the methods
    assert_eq!(svc.md(DomainId::Local).unwrap(), 2);

    rt.shutdown();
}

#[test]
fn task_state_lifecycle() {
    let rt = common::single_node();
    let admin = AdminClient::new(rt.client());

    let id = admin
        .create_task_state(
            DomainId::Local,
            strata_small_message::LIB_NAME,
            "mdm_v1",
            None,
            QueueParams {
                max_lanes: 8,
                num_lanes: 4,
                depth: 64,
                ..QueueParams::default()
            },
        )
        .unwrap();
    assert!(!id.is_null());

    // create is idempotent on the name
    let again = admin
        .create_task_state(
            DomainId::Local,
            strata_small_message::LIB_NAME,
            "mdm_v1",
            None,
            QueueParams::default(),
        )
        .unwrap();
    assert_eq!(again, id);

    assert_eq!(admin.get_task_state_id(DomainId::Local, "mdm_v1").unwrap(), id);

    // the state is live: its queue serves tasks
    let svc = SmallMessageClient::attach(rt.client(), id);
    assert_eq!(svc.md(DomainId::Local).unwrap(), 0);

    admin.destroy_task_state(DomainId::Local, id).unwrap();
    assert!(
        admin
            .get_task_state_id(DomainId::Local, "mdm_v1")
            .unwrap()
            .is_null()
    );

    rt.shutdown();
}

#[test]
fn get_or_create_allocates_then_reuses() {
    let rt = common::single_node();
    let admin = AdminClient::new(rt.client());

    let id = admin
        .get_or_create_task_state_id(DomainId::Local, "pending_state")
        .unwrap();
    assert!(!id.is_null());
    let same = admin
        .get_or_create_task_state_id(DomainId::Local, "pending_state")
        .unwrap();
    assert_eq!(same, id);

    rt.shutdown();
}

#[test]
fn trampoline_forwards_into_the_target_queue() {
    let rt = common::single_node();
    let admin = AdminClient::new(rt.client());
    let svc = SmallMessageClient::create(rt.client(), DomainId::Local, "smsvc").unwrap();

    // the trampoline state was brought up at bootstrap
    let pq_id = admin
        .get_task_state_id(DomainId::Local, "proc_queue")
        .unwrap();
    assert!(!pq_id.is_null());
    let trampoline = strata_proc_queue::ProcQueueClient::attach(rt.client(), pq_id);

    let client = rt.client();
    let subtask = client
        .new_task(strata_small_message::MdTask::new(
            client.make_task_node(),
            DomainId::Local,
            svc.id,
        ))
        .unwrap();
    trampoline.push(&subtask).unwrap();
    client.wait(subtask.task_ref());
    assert_eq!(subtask.get().ret, 0);
    client.del_task(subtask);

    // the trampoline did not disturb the direct path
    assert_eq!(svc.md(DomainId::Local).unwrap(), 1);

    rt.shutdown();
}

#[test]
fn stop_runtime_halts_the_worker_pool() {
    let rt = common::single_node();
    let admin = AdminClient::new(rt.client());

    admin.stop_runtime(DomainId::Local).unwrap();
    assert!(!rt.orchestrator().is_alive());
    rt.shutdown();
}
