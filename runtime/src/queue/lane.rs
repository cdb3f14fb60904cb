// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::{Full, LaneData};
use crate::shmem::ShmPointer;
use core::mem::size_of;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// In-memory layout of a lane: this header followed by `depth` slots.
///
/// Producers claim slots by advancing `tail`; the single consumer drains in
/// `head` order. A slot's `ready` bit is the handoff: a producer publishes it
/// with a release store after filling the slot, the consumer clears it before
/// advancing `head`, so `tail - head < depth` on the producer side implies
/// the claimed slot has been fully vacated.
#[repr(C)]
pub struct LaneShm {
    flags: AtomicU32,
    depth: u32,
    head: AtomicU64,
    tail: AtomicU64,
}

#[repr(C)]
struct Slot {
    ready: AtomicU32,
    complete: u32,
    ptr: ShmPointer,
}

/// Bytes occupied by a lane of the given depth.
pub const fn lane_block_len(depth: u32) -> usize {
    size_of::<LaneShm>() + depth as usize * size_of::<Slot>()
}

/// A borrow of one lane in shared memory.
#[derive(Debug, Clone, Copy)]
pub struct Lane {
    shm: NonNull<LaneShm>,
}

// Safety: all access is through atomics; the MPSC discipline above governs
// the non-atomic slot payload fields.
unsafe impl Send for Lane {}
unsafe impl Sync for Lane {}

// === impl Lane ===

impl Lane {
    /// # Safety
    ///
    /// `shm` must point at `lane_block_len(_)` bytes that stay mapped for the
    /// lifetime of the returned view.
    pub(crate) unsafe fn from_raw(shm: NonNull<LaneShm>) -> Self {
        Self { shm }
    }

    /// Initialize the ring in place. Must happen-before any emplace/pop.
    pub(crate) fn init(&self, depth: u32) {
        let shm = self.shm();
        shm.flags.store(0, Ordering::Relaxed);
        // Safety: init runs before the lane is shared; plain write is fine.
        unsafe {
            (*self.shm.as_ptr()).depth = depth;
        }
        shm.head.store(0, Ordering::Relaxed);
        shm.tail.store(0, Ordering::Relaxed);
        for i in 0..depth {
            self.slot(u64::from(i)).ready.store(0, Ordering::Relaxed);
        }
    }

    fn shm(&self) -> &LaneShm {
        // Safety: guaranteed mapped by the `from_raw` contract.
        unsafe { self.shm.as_ref() }
    }

    #[expect(clippy::mut_from_ref, reason = "slot handoff is guarded by the ready bit")]
    fn slot(&self, idx: u64) -> &mut Slot {
        let depth = u64::from(self.shm().depth);
        // Safety: slots directly follow the header; idx is taken mod depth.
        unsafe {
            let slots = self.shm.as_ptr().add(1).cast::<Slot>();
            &mut *slots.add((idx % depth) as usize)
        }
    }

    pub fn depth(&self) -> u32 {
        self.shm().depth
    }

    pub fn flags(&self) -> &AtomicU32 {
        &self.shm().flags
    }

    /// Number of tokens currently in the ring. Approximate under concurrent
    /// production.
    pub fn len(&self) -> u64 {
        let shm = self.shm();
        shm.tail
            .load(Ordering::Acquire)
            .saturating_sub(shm.head.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Multi-producer push.
    pub fn emplace(&self, data: LaneData) -> Result<(), Full> {
        let shm = self.shm();
        let depth = u64::from(shm.depth);

        let mut tail = shm.tail.load(Ordering::Relaxed);
        loop {
            let head = shm.head.load(Ordering::Acquire);
            if tail.wrapping_sub(head) >= depth {
                return Err(Full);
            }
            match shm.tail.compare_exchange_weak(
                tail,
                tail.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(seen) => tail = seen,
            }
        }

        let slot = self.slot(tail);
        slot.ptr = data.ptr;
        slot.complete = u32::from(data.complete);
        slot.ready.store(1, Ordering::Release);
        Ok(())
    }

    /// Single-consumer pop. The caller must be the worker bound to this lane.
    pub fn pop(&self) -> Option<LaneData> {
        let shm = self.shm();
        let head = shm.head.load(Ordering::Relaxed);
        let slot = self.slot(head);
        if slot.ready.load(Ordering::Acquire) == 0 {
            return None;
        }
        let data = LaneData {
            ptr: slot.ptr,
            complete: slot.complete != 0,
        };
        slot.ready.store(0, Ordering::Release);
        shm.head.store(head.wrapping_add(1), Ordering::Release);
        Some(data)
    }

    /// Look `off` tokens past the head without consuming.
    pub fn peek(&self, off: u64) -> Option<LaneData> {
        let shm = self.shm();
        let head = shm.head.load(Ordering::Relaxed);
        let idx = head.wrapping_add(off);
        if idx >= shm.tail.load(Ordering::Acquire) {
            return None;
        }
        let slot = self.slot(idx);
        if slot.ready.load(Ordering::Acquire) == 0 {
            return None;
        }
        Some(LaneData {
            ptr: slot.ptr,
            complete: slot.complete != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shmem::{Allocator, ShmRegion};

    fn lane(depth: u32) -> (ShmRegion, Lane) {
        let region = ShmRegion::create_heap(1 << 20).unwrap();
        let alloc = Allocator::init(&region, 1, 0).unwrap();
        let p = alloc.allocate(lane_block_len(depth)).unwrap();
        // Safety: freshly allocated block of the right length.
        let lane = unsafe { Lane::from_raw(alloc.convert(p)) };
        lane.init(depth);
        (region, lane)
    }

    fn token(off: u64) -> LaneData {
        LaneData::new(ShmPointer { alloc_id: 1, off })
    }

    #[test]
    fn fifo_order_is_preserved() {
        let (_region, lane) = lane(8);
        for i in 1..=8 {
            lane.emplace(token(i * 64)).unwrap();
        }
        for i in 1..=8 {
            assert_eq!(lane.pop().unwrap().ptr.off, i * 64);
        }
        assert!(lane.pop().is_none());
    }

    #[test]
    fn full_lane_rejects_and_recovers() {
        let (_region, lane) = lane(2);
        lane.emplace(token(64)).unwrap();
        lane.emplace(token(128)).unwrap();
        assert_eq!(lane.emplace(token(192)), Err(Full));
        assert_eq!(lane.pop().unwrap().ptr.off, 64);
        lane.emplace(token(192)).unwrap();
        assert_eq!(lane.pop().unwrap().ptr.off, 128);
        assert_eq!(lane.pop().unwrap().ptr.off, 192);
    }

    #[test]
    fn peek_does_not_consume() {
        let (_region, lane) = lane(4);
        lane.emplace(token(64)).unwrap();
        lane.emplace(token(128)).unwrap();
        assert_eq!(lane.peek(0).unwrap().ptr.off, 64);
        assert_eq!(lane.peek(1).unwrap().ptr.off, 128);
        assert!(lane.peek(2).is_none());
        assert_eq!(lane.len(), 2);
    }

    #[test]
    fn concurrent_producers_lose_no_tokens() {
        let (region, lane) = lane(1024);
        let _keep = &region;
        std::thread::scope(|s| {
            for t in 0..4_u64 {
                s.spawn(move || {
                    for i in 0..128_u64 {
                        let off = 64 + t * 1000 + i;
                        while lane.emplace(token(off)).is_err() {
                            std::hint::spin_loop();
                        }
                    }
                });
            }
        });
        let mut seen = std::collections::HashSet::new();
        while let Some(data) = lane.pop() {
            assert!(seen.insert(data.ptr.off));
        }
        assert_eq!(seen.len(), 4 * 128);
    }
}
