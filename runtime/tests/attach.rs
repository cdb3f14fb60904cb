// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The named-segment client path: a daemon over POSIX shared memory and a
//! client attaching to it by name.

mod common;

use strata_runtime::{AttachedClient, ClientConfig, DomainId, RuntimeBuilder};
use strata_small_message::SmallMessageClient;

#[test]
fn attached_client_shares_the_daemon_region() {
    common::init_tracing();
    let mut config = common::test_config(&["localhost"]);
    config.shm_name = format!("strata_test_{}", std::process::id());

    let rt = RuntimeBuilder::new(config.clone())
        .with_node_id(1)
        .with_static_lib(strata_admin::task_lib())
        .with_static_lib(strata_small_message::task_lib())
        .with_static_lib(strata_worch_queue_rr::task_lib())
        .with_static_lib(strata_worch_proc_rr::task_lib())
        .serve()
        .expect("daemon failed to start");

    let attached = AttachedClient::attach(&config, ClientConfig::default()).unwrap();
    assert_eq!(attached.client().node_id(), 1);

    // a state created through the attached client serves tasks produced by it
    let svc = SmallMessageClient::create(attached.client(), DomainId::Local, "smsvc").unwrap();
    assert_eq!(svc.md(DomainId::Local).unwrap(), 0);
    assert_eq!(svc.md(DomainId::Local).unwrap(), 1);

    rt.shutdown();
}
