// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Round-robin process-scheduling policy: pins worker `i` to CPU
//! `i % ncpu`. Runs as a long-running task and keeps re-applying until every
//! worker thread has announced its OS thread id.

use std::sync::atomic::{AtomicBool, Ordering};
use strata_runtime::orchestrator::METHOD_SCHEDULE;
use strata_runtime::queue::MultiQueue;
use strata_runtime::{Runtime, StateDesc, TaskRef, TaskState, TaskStateId, method};

pub const LIB_NAME: &str = "strata_worch_proc_rr";

pub struct Server {
    desc: StateDesc,
    applied: AtomicBool,
}

// === impl Server ===

impl Server {
    pub fn new(_rt: &Runtime, desc: StateDesc, _ctor: Option<TaskRef>) -> Self {
        Self {
            desc,
            applied: AtomicBool::new(false),
        }
    }

    fn schedule(&self, rt: &Runtime) {
        if self.applied.load(Ordering::Relaxed) {
            return;
        }
        let ncpu = std::thread::available_parallelism().map_or(1, usize::from);
        for worker in rt.orchestrator().workers() {
            worker.set_cpu_affinity(worker.id() as usize % ncpu);
        }
        self.applied.store(true, Ordering::Relaxed);
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
            METHOD_SCHEDULE => self.schedule(rt),
            unknown => {
                tracing::error!(state = self.name(), method = unknown, "unknown method");
                task.header().set_module_complete();
            }
        }
    }
}

strata_runtime::declare_task_lib!(Server, "strata_worch_proc_rr");
