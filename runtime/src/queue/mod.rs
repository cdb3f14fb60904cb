// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Multi-lane shared-memory task queues.
//!
//! A [`MultiQueue`] is a fixed-capacity collection of [`Lane`]s; a lane is a
//! bounded MPSC ring of task-pointer tokens. Producers select a lane with
//! `lane_hash % num_lanes`; exactly one worker consumes each lane, which is
//! the only ordering and mutual-exclusion primitive the runtime needs on the
//! hot path.

mod lane;
mod manager;
mod multi_queue;

pub use lane::{Lane, lane_block_len};
pub use manager::{CoreHeader, QueueManager};
pub use multi_queue::{MultiQueue, MultiQueueShm};

use crate::shmem::ShmPointer;
use bitflags::bitflags;

bitflags! {
    /// Scheduling and plug bits carried by queues and their lanes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueueFlags: u32 {
        /// The queue holds latency-sensitive tasks and should be polled
        /// continuously.
        const LOW_LATENCY = 1 << 0;
        /// The queue is plugged for a lane-count change; emplace blocks.
        const RESIZE = 1 << 1;
        /// The queue is plugged for a binding update; pop blocks.
        const UPDATE = 1 << 2;
        /// Tasks in this queue may execute in any order.
        const UNORDERED = 1 << 3;
    }
}

/// The token stored in a lane: a relocatable pointer to a task plus the
/// completion bit some producers piggyback on the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneData {
    pub ptr: ShmPointer,
    pub complete: bool,
}

impl LaneData {
    pub fn new(ptr: ShmPointer) -> Self {
        Self {
            ptr,
            complete: false,
        }
    }
}

/// The lane (or queue) cannot accept another token right now. Retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Full;
