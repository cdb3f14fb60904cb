// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Round-robin queue-scheduling policy.
//!
//! Runs as a long-running task on worker 0. Each tick it scans the queue
//! directory and binds every not-yet-scheduled lane: lane 0 of each queue
//! goes to worker 0 (the admin/low-latency worker), later lanes round-robin
//! across workers 1..W-1. `num_scheduled` is the per-queue watermark, so a
//! resize only schedules the lanes it brought live.

use std::sync::atomic::{AtomicU32, Ordering};
use strata_runtime::orchestrator::METHOD_SCHEDULE;
use strata_runtime::queue::MultiQueue;
use strata_runtime::worker::WorkEntry;
use strata_runtime::{Runtime, StateDesc, TaskRef, TaskState, TaskStateId, method};

pub const LIB_NAME: &str = "strata_worch_queue_rr";

pub struct Server {
    desc: StateDesc,
    rr: AtomicU32,
}

// === impl Server ===

impl Server {
    pub fn new(_rt: &Runtime, desc: StateDesc, _ctor: Option<TaskRef>) -> Self {
        Self {
            desc,
            rr: AtomicU32::new(0),
        }
    }

    fn schedule(&self, rt: &Runtime) {
        let orch = rt.orchestrator();
        let num_workers = orch.num_workers() as u32;
        if num_workers == 0 {
            return;
        }

        rt.queues().for_each_queue(|queue| {
            let num_lanes = queue.num_lanes();
            let scheduled = queue.num_scheduled();
            for lane in scheduled..num_lanes {
                let worker_id = if lane == 0 || num_workers == 1 {
                    0
                } else {
                    1 + self.rr.fetch_add(1, Ordering::Relaxed) % (num_workers - 1)
                };
                if let Some(worker) = orch.worker(worker_id) {
                    tracing::debug!(
                        queue = %queue.id(),
                        lane,
                        worker = worker_id,
                        "binding lane",
                    );
                    worker.poll_queues(vec![WorkEntry { lane, queue }]);
                }
            }
            if scheduled < num_lanes {
                queue.set_num_scheduled(num_lanes);
            }
        });
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
            method::CONSTRUCT | method::DESTRUCT => task.header().set_module_complete(),
            METHOD_SCHEDULE => {
                // Long-running: never module-complete on its own; the admin
                // state retires it with an external complete when replaced.
                self.schedule(rt);
            }
            unknown => {
                tracing::error!(state = self.name(), method = unknown, "unknown method");
                task.header().set_module_complete();
            }
        }
    }
}

strata_runtime::declare_task_lib!(Server, "strata_worch_queue_rr");
