// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The admin task library: the runtime's management surface.
//!
//! The admin state lives at id `(node, 0)` on every node and exposes one
//! task type per operation: library registration, task-state lifecycle,
//! queue lifecycle, policy installation, and runtime shutdown.

mod client;
mod server;
mod tasks;

pub use client::AdminClient;
pub use server::Server;
pub use tasks::{
    CreateQueueTask, CreateTaskStateTask, DestroyQueueTask, DestroyTaskStateTask,
    GetTaskStateIdTask, QueueParams, RegisterTaskLibTask, SetPolicyTask, StopRuntimeTask, method,
};

impl Default for QueueParams {
    fn default() -> Self {
        Self {
            max_lanes: 16,
            num_lanes: 16,
            depth: 256,
            flags: strata_runtime::queue::QueueFlags::empty(),
        }
    }
}

strata_runtime::declare_task_lib!(Server, "strata_admin");
