// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![allow(dead_code, reason = "shared across integration-test binaries")]

use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_runtime::net::rpc::RpcEngine;
use strata_runtime::registry::StaticTaskLib;
use strata_runtime::{NodeId, Runtime, RuntimeBuilder, ServerConfig};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .try_init();
}

pub fn test_config(hosts: &[&str]) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.max_workers = 3;
    config.max_queues = 64;
    config.max_lanes = 8;
    config.queue_depth = 64;
    config.shm_size = 32 << 20;
    config.rpc.host_names = hosts.iter().map(|h| h.to_string()).collect();
    config
}

/// Bring up an in-process node with every bundled task library (plus any
/// test-local ones) registered statically.
pub fn serve_node(
    config: ServerConfig,
    node_id: NodeId,
    engine: Option<Arc<dyn RpcEngine>>,
    extra_libs: &[StaticTaskLib],
) -> Arc<Runtime> {
    let mut builder = RuntimeBuilder::new(config)
        .with_heap_backend()
        .with_node_id(node_id)
        .with_static_lib(strata_admin::task_lib())
        .with_static_lib(strata_small_message::task_lib())
        .with_static_lib(strata_remote_queue::task_lib())
        .with_static_lib(strata_proc_queue::task_lib())
        .with_static_lib(strata_worch_queue_rr::task_lib())
        .with_static_lib(strata_worch_proc_rr::task_lib());
    for lib in extra_libs {
        builder = builder.with_static_lib(*lib);
    }
    if let Some(engine) = engine {
        builder = builder.with_rpc_engine(engine);
    }
    builder.serve().expect("runtime failed to start")
}

pub fn single_node() -> Arc<Runtime> {
    init_tracing();
    serve_node(test_config(&["localhost"]), 1, None, &[])
}

pub fn single_node_with(extra_libs: &[StaticTaskLib]) -> Arc<Runtime> {
    init_tracing();
    serve_node(test_config(&["localhost"]), 1, None, extra_libs)
}

/// Poll `cond` until it holds or the deadline passes.
pub fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
