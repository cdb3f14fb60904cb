// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::lane::{Lane, LaneShm, lane_block_len};
use super::{Full, LaneData, QueueFlags};
use crate::error::{Result, RuntimeError};
use crate::shmem::{Allocator, ShmPointer};
use crate::types::QueueId;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

/// Shared-memory descriptor of a multi-lane queue.
///
/// Lane storage for all `max_lanes` lanes is allocated up front, so growing
/// the live lane count never allocates; only `num_lanes` moves, and only
/// while the queue is plugged for resize.
#[repr(C)]
pub struct MultiQueueShm {
    id: QueueId,
    flags: AtomicU32,
    max_lanes: u32,
    depth: u32,
    num_lanes: AtomicU32,
    /// How many live lanes the queue-scheduling policy has already bound to
    /// workers. Maintained by the policy, stored here so a resize only
    /// schedules the new lanes.
    num_scheduled: AtomicU32,
    lanes: ShmPointer,
}

/// A borrow of a queue descriptor plus the allocator needed to reach its
/// lanes. Cheap to copy; workers keep these in their work lists.
#[derive(Debug, Clone, Copy)]
pub struct MultiQueue {
    shm: NonNull<MultiQueueShm>,
    alloc: Allocator,
}

// Safety: the descriptor is only mutated through atomics; lane payloads are
// governed by the lane MPSC discipline.
unsafe impl Send for MultiQueue {}
unsafe impl Sync for MultiQueue {}

// === impl MultiQueue ===

impl MultiQueue {
    /// Initialize a queue descriptor in place and allocate its lane block.
    pub(crate) fn init_at(
        shm: NonNull<MultiQueueShm>,
        alloc: Allocator,
        id: QueueId,
        max_lanes: u32,
        num_lanes: u32,
        depth: u32,
        flags: QueueFlags,
    ) -> Result<Self> {
        debug_assert!(num_lanes <= max_lanes);
        let lanes = alloc.allocate(max_lanes as usize * lane_block_len(depth))?;
        // Safety: we own the freshly reserved descriptor slot.
        unsafe {
            shm.as_ptr().write(MultiQueueShm {
                id,
                flags: AtomicU32::new(flags.bits()),
                max_lanes,
                depth,
                num_lanes: AtomicU32::new(num_lanes),
                num_scheduled: AtomicU32::new(0),
                lanes,
            });
        }
        let this = Self { shm, alloc };
        for idx in 0..max_lanes {
            this.lane(idx).init(depth);
        }
        Ok(this)
    }

    /// # Safety
    ///
    /// `shm` must point at an initialized descriptor within `alloc`'s region.
    pub(crate) unsafe fn from_raw(shm: NonNull<MultiQueueShm>, alloc: Allocator) -> Self {
        Self { shm, alloc }
    }

    pub(crate) fn release_lanes(&self) {
        self.alloc.free(self.shm().lanes);
    }

    fn shm(&self) -> &MultiQueueShm {
        // Safety: `init_at`/`from_raw` contract.
        unsafe { self.shm.as_ref() }
    }

    pub fn id(&self) -> QueueId {
        self.shm().id
    }

    pub fn depth(&self) -> u32 {
        self.shm().depth
    }

    pub fn max_lanes(&self) -> u32 {
        self.shm().max_lanes
    }

    pub fn num_lanes(&self) -> u32 {
        self.shm().num_lanes.load(Ordering::Acquire)
    }

    pub fn num_scheduled(&self) -> u32 {
        self.shm().num_scheduled.load(Ordering::Acquire)
    }

    pub fn set_num_scheduled(&self, n: u32) {
        self.shm().num_scheduled.store(n, Ordering::Release);
    }

    pub fn flags(&self) -> QueueFlags {
        QueueFlags::from_bits_truncate(self.shm().flags.load(Ordering::Acquire))
    }

    pub fn is_unordered(&self) -> bool {
        self.flags().contains(QueueFlags::UNORDERED)
    }

    /// Borrow lane `idx`. Valid for `idx < max_lanes`; lanes at or past
    /// `num_lanes` exist but receive no traffic.
    pub fn lane(&self, idx: u32) -> Lane {
        debug_assert!(idx < self.shm().max_lanes);
        let base = self.alloc.convert_raw(self.shm().lanes);
        // Safety: the lane block holds `max_lanes` consecutive lanes.
        unsafe {
            let lane = base.as_ptr().add(idx as usize * lane_block_len(self.depth()));
            Lane::from_raw(NonNull::new_unchecked(lane.cast::<LaneShm>()))
        }
    }

    /// Push a token onto lane `lane_hash % num_lanes`, spinning while the
    /// queue is plugged for resize.
    pub fn emplace(&self, lane_hash: u32, data: LaneData) -> Result<(), Full> {
        while self.is_emplace_plugged() {
            std::thread::yield_now();
        }
        let lane = self.lane(lane_hash % self.num_lanes());
        lane.emplace(data)
    }

    /// Single-consumer pop from lane `idx`.
    pub fn pop(&self, idx: u32) -> Option<LaneData> {
        self.lane(idx).pop()
    }

    /// Look ahead `off` tokens into lane `idx` without consuming.
    pub fn peek(&self, idx: u32, off: u64) -> Option<LaneData> {
        self.lane(idx).peek(off)
    }

    pub fn is_emplace_plugged(&self) -> bool {
        self.flags().contains(QueueFlags::RESIZE)
    }

    /// Pops are blocked only by the update plug; a resize plug lets queued
    /// tokens drain.
    pub fn is_pop_plugged(&self) -> bool {
        self.flags().contains(QueueFlags::UPDATE)
    }

    /// Block new emplaces; existing tokens drain normally.
    pub fn plug_for_resize(&self) {
        self.shm()
            .flags
            .fetch_or(QueueFlags::RESIZE.bits(), Ordering::AcqRel);
    }

    pub fn unplug_for_resize(&self) {
        self.shm()
            .flags
            .fetch_and(!QueueFlags::RESIZE.bits(), Ordering::AcqRel);
    }

    /// Block pops; used while a policy edits lane-to-worker bindings.
    pub fn plug_for_update(&self) {
        self.shm()
            .flags
            .fetch_or(QueueFlags::UPDATE.bits(), Ordering::AcqRel);
    }

    pub fn unplug_for_update(&self) {
        self.shm()
            .flags
            .fetch_and(!QueueFlags::UPDATE.bits(), Ordering::AcqRel);
    }

    /// Change the live lane count. Only valid while plugged for resize.
    /// Growth brings pre-constructed lanes live; shrink requires the trailing
    /// lanes to be empty.
    pub fn resize(&self, new_num_lanes: u32) -> Result<()> {
        if !self.is_emplace_plugged() {
            return Err(RuntimeError::Protocol(
                "resize without plugging the queue".into(),
            ));
        }
        let shm = self.shm();
        let new_num_lanes = new_num_lanes.min(shm.max_lanes);
        let cur = self.num_lanes();
        if new_num_lanes < cur {
            for idx in new_num_lanes..cur {
                if !self.lane(idx).is_empty() {
                    return Err(RuntimeError::ResourceExhausted(
                        "cannot shrink a queue with queued tasks",
                    ));
                }
            }
        }
        shm.num_lanes.store(new_num_lanes, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shmem::ShmRegion;

    fn queue(max_lanes: u32, num_lanes: u32, depth: u32) -> (ShmRegion, MultiQueue) {
        let region = ShmRegion::create_heap(4 << 20).unwrap();
        let alloc = Allocator::init(&region, 1, 0).unwrap();
        let p = alloc.allocate(size_of::<MultiQueueShm>()).unwrap();
        let q = MultiQueue::init_at(
            alloc.convert(p),
            alloc,
            QueueId::new(1, 3),
            max_lanes,
            num_lanes,
            depth,
            QueueFlags::empty(),
        )
        .unwrap();
        (region, q)
    }

    fn token(off: u64) -> LaneData {
        LaneData::new(ShmPointer { alloc_id: 1, off })
    }

    #[test]
    fn lane_selection_is_hash_mod_live_lanes() {
        let (_region, q) = queue(8, 4, 16);
        q.emplace(6, token(64)).unwrap();
        assert!(q.pop(6 % 4).is_some());
        assert!(q.pop(6 % 8).is_none());
    }

    #[test]
    fn resize_requires_the_plug() {
        let (_region, q) = queue(16, 4, 16);
        assert!(q.resize(8).is_err());
        q.plug_for_resize();
        q.resize(8).unwrap();
        q.unplug_for_resize();
        assert_eq!(q.num_lanes(), 8);
        // new lanes are live and functional
        q.emplace(7, token(64)).unwrap();
        assert!(q.pop(7).is_some());
    }

    #[test]
    fn resize_clamps_to_max_lanes() {
        let (_region, q) = queue(8, 4, 16);
        q.plug_for_resize();
        q.resize(32).unwrap();
        assert_eq!(q.num_lanes(), 8);
    }

    #[test]
    fn shrink_refuses_nonempty_trailing_lanes() {
        let (_region, q) = queue(8, 4, 16);
        q.emplace(3, token(64)).unwrap();
        q.plug_for_resize();
        assert!(q.resize(2).is_err());
        assert!(q.pop(3).is_some());
        q.resize(2).unwrap();
        assert_eq!(q.num_lanes(), 2);
    }
}
