// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Queue resize under the plug protocol, and the scheduling policy picking
//! up the newly live lanes.

mod common;

use std::time::Duration;
use strata_admin::{AdminClient, QueueParams};
use strata_runtime::DomainId;
use strata_small_message::SmallMessageClient;

#[test]
fn grown_lanes_are_scheduled_and_serve_tasks() {
    let rt = common::single_node();
    let admin = AdminClient::new(rt.client());

    let id = admin
        .create_task_state(
            DomainId::Local,
            strata_small_message::LIB_NAME,
            "resize_svc",
            None,
            QueueParams {
                max_lanes: 16,
                num_lanes: 4,
                depth: 64,
                ..QueueParams::default()
            },
        )
        .unwrap();
    let queue = rt.client().state_queue(id).unwrap();
    assert_eq!(queue.num_lanes(), 4);

    // let the policy bind the initial lanes before growing
    assert!(common::eventually(Duration::from_secs(5), || {
        queue.num_scheduled() == 4
    }));

    queue.plug_for_resize();
    queue.resize(8).unwrap();
    queue.unplug_for_resize();
    assert_eq!(queue.num_lanes(), 8);

    // the policy's next tick binds exactly the new lanes
    assert!(common::eventually(Duration::from_secs(5), || {
        queue.num_scheduled() == 8
    }));

    // a task keyed to a grown lane executes there
    let svc = SmallMessageClient::attach(rt.client(), id);
    assert_eq!(svc.md_on_lane(DomainId::Local, 5).unwrap(), 0);
    assert_eq!(svc.md_on_lane(DomainId::Local, 7).unwrap(), 1);

    rt.shutdown();
}

#[test]
fn emplace_spins_through_a_resize_plug() {
    let rt = common::single_node();
    let admin = AdminClient::new(rt.client());
    let id = admin
        .create_task_state(
            DomainId::Local,
            strata_small_message::LIB_NAME,
            "plug_svc",
            None,
            QueueParams::default(),
        )
        .unwrap();
    let queue = rt.client().state_queue(id).unwrap();
    let svc = SmallMessageClient::attach(rt.client(), id);

    queue.plug_for_resize();
    let unplugger = std::thread::spawn({
        move || {
            std::thread::sleep(Duration::from_millis(50));
            queue.unplug_for_resize();
        }
    });

    // blocks on the plug, then completes once the plug lifts
    assert_eq!(svc.md(DomainId::Local).unwrap(), 0);
    unplugger.join().unwrap();

    rt.shutdown();
}
