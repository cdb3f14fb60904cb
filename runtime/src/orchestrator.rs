// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The work orchestrator: owner of the worker pool.
//!
//! Scheduling *policy* does not live here. Lane-to-worker assignment and
//! worker CPU placement are long-running tasks in pluggable policy states;
//! the orchestrator only provides the mechanism they drive (worker handles,
//! affinity, shutdown).

use crate::runtime::Runtime;
use crate::task::method;
use crate::worker::{WorkerHandle, spawn_worker};
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// Method code of the single entry point every scheduling-policy state
/// implements.
pub const METHOD_SCHEDULE: u32 = method::FIRST_USER;

#[derive(Debug, Default)]
pub struct WorkOrchestrator {
    workers: OnceLock<Vec<WorkerHandle>>,
    kill_requested: AtomicBool,
}

// === impl WorkOrchestrator ===

impl WorkOrchestrator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Spawn the worker pool. Called exactly once, after the runtime is
    /// behind its `Arc` so workers can hold their own handle to it.
    pub(crate) fn spawn(&self, rt: &Arc<Runtime>, num_workers: usize) {
        let workers = (0..num_workers.max(1) as u32)
            .map(|id| spawn_worker(rt.clone(), id))
            .collect();
        self.workers
            .set(workers)
            .expect("worker pool spawned twice");
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        self.workers.get().map_or(&[], Vec::as_slice)
    }

    pub fn num_workers(&self) -> usize {
        self.workers().len()
    }

    pub fn worker(&self, id: u32) -> Option<&WorkerHandle> {
        self.workers().get(id as usize)
    }

    /// Whether workers should keep polling.
    pub fn is_alive(&self) -> bool {
        !self.kill_requested.load(Ordering::Acquire)
    }

    /// Request shutdown; each worker runs one final tick and exits.
    pub fn finalize(&self) {
        self.kill_requested.store(true, Ordering::Release);
    }

    pub(crate) fn join_all(&self) {
        for worker in self.workers() {
            worker.join();
        }
    }
}
