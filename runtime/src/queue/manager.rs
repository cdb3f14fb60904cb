// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::multi_queue::{MultiQueue, MultiQueueShm};
use super::QueueFlags;
use crate::config::ServerConfig;
use crate::error::{Result, RuntimeError};
use crate::shmem::{Allocator, ShmPointer};
use crate::types::{NodeId, QueueId, TaskId, TaskNode, TaskStateId};
use core::mem::size_of;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// The core header, stored as the allocator's custom header so every
/// attached process finds it at the same well-known place.
#[repr(C)]
pub struct CoreHeader {
    node_id: NodeId,
    max_queues: u32,
    /// Monotonic counter behind task-node identities.
    unique: AtomicU64,
    /// The queue directory: `[QueueSlot; max_queues]`, indexed by the queue
    /// id's `unique` field.
    dir: ShmPointer,
    /// Stack of directory slots returned by destroyed queues.
    tickets: ShmPointer,
}

#[repr(C)]
struct QueueSlot {
    used: AtomicU32,
    _pad: u32,
    queue: MultiQueueShm,
}

#[repr(C)]
struct TicketStack {
    lock: AtomicU32,
    top: u32,
    // entries follow
}

/// Directory of every [`MultiQueue`] in the shared-memory region, shared by
/// clients and the runtime.
///
/// Slot `(node_id, 0)` is the admin queue, reserved at server init.
#[derive(Debug, Clone, Copy)]
pub struct QueueManager {
    alloc: Allocator,
    hdr: NonNull<CoreHeader>,
}

// Safety: header mutation goes through atomics or the ticket spinlock.
unsafe impl Send for QueueManager {}
unsafe impl Sync for QueueManager {}

// === impl QueueManager ===

impl QueueManager {
    /// Build the directory in shared memory and reserve the admin queue.
    pub fn server_init(alloc: Allocator, node_id: NodeId, config: &ServerConfig) -> Result<Self> {
        let hdr_ptr = alloc.custom_header::<CoreHeader>();
        let max_queues = config.max_queues;

        let dir = alloc.allocate(max_queues as usize * size_of::<QueueSlot>())?;
        let tickets =
            alloc.allocate(size_of::<TicketStack>() + max_queues as usize * size_of::<u32>())?;

        // Safety: server init runs before any client attaches.
        unsafe {
            hdr_ptr.as_ptr().write(CoreHeader {
                node_id,
                max_queues,
                unique: AtomicU64::new(1),
                dir,
                tickets,
            });
        }
        let this = Self {
            alloc,
            hdr: hdr_ptr,
        };

        for idx in 0..max_queues {
            this.slot(u64::from(idx)).used.store(0, Ordering::Relaxed);
        }
        let stack = this.tickets();
        stack.0.lock.store(0, Ordering::Relaxed);
        stack.0.top = 0;

        // The admin queue occupies slot 0.
        this.create_queue(
            this.admin_queue_id(),
            config.max_lanes,
            config.max_lanes,
            config.queue_depth,
            QueueFlags::LOW_LATENCY,
        )?;
        Ok(this)
    }

    /// Attach to a directory initialized by a runtime daemon.
    pub fn client_init(alloc: Allocator) -> Self {
        Self {
            alloc,
            hdr: alloc.custom_header::<CoreHeader>(),
        }
    }

    fn hdr(&self) -> &CoreHeader {
        // Safety: the core header lives for the lifetime of the region.
        unsafe { self.hdr.as_ref() }
    }

    #[expect(clippy::mut_from_ref, reason = "raw shared-memory view")]
    fn slot(&self, idx: u64) -> &mut QueueSlot {
        debug_assert!(idx < u64::from(self.hdr().max_queues));
        let base = self.alloc.convert::<QueueSlot>(self.hdr().dir);
        // Safety: the directory holds `max_queues` slots.
        unsafe { &mut *base.as_ptr().add(idx as usize) }
    }

    #[expect(clippy::mut_from_ref, reason = "raw shared-memory view")]
    fn tickets(&self) -> (&mut TicketStack, *mut u32) {
        let base = self.alloc.convert::<TicketStack>(self.hdr().tickets);
        // Safety: entries directly follow the stack header.
        unsafe { (&mut *base.as_ptr(), base.as_ptr().add(1).cast::<u32>()) }
    }

    pub fn node_id(&self) -> NodeId {
        self.hdr().node_id
    }

    pub fn max_queues(&self) -> u32 {
        self.hdr().max_queues
    }

    pub fn admin_queue_id(&self) -> QueueId {
        QueueId::new(self.node_id(), 0)
    }

    pub fn admin_state_id(&self) -> TaskStateId {
        TaskStateId::new(self.node_id(), 0)
    }

    /// Mint the identity for a fresh root task.
    pub fn make_task_node(&self) -> TaskNode {
        let unique = self.hdr().unique.fetch_add(1, Ordering::Relaxed);
        TaskNode::new(TaskId::new(self.node_id(), unique))
    }

    /// Look up a queue by id.
    pub fn get_queue(&self, id: QueueId) -> Option<MultiQueue> {
        if id.unique >= u64::from(self.hdr().max_queues) {
            return None;
        }
        let slot = self.slot(id.unique);
        if slot.used.load(Ordering::Acquire) != 2 {
            return None;
        }
        // Safety: the slot is marked used, so the descriptor is initialized.
        Some(unsafe { MultiQueue::from_raw(NonNull::from(&mut slot.queue), self.alloc) })
    }

    /// Create a queue in the slot named by `id.unique`.
    pub fn create_queue(
        &self,
        id: QueueId,
        max_lanes: u32,
        num_lanes: u32,
        depth: u32,
        flags: QueueFlags,
    ) -> Result<MultiQueue> {
        if id.unique >= u64::from(self.hdr().max_queues) {
            return Err(RuntimeError::ResourceExhausted("queue directory is full"));
        }
        let slot = self.slot(id.unique);
        if slot
            .used
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RuntimeError::AlreadyExists(format!("queue {id}")));
        }
        let queue = MultiQueue::init_at(
            NonNull::from(&mut slot.queue),
            self.alloc,
            id,
            max_lanes,
            num_lanes,
            depth,
            flags,
        );
        match queue {
            Ok(queue) => {
                // Full visibility of the descriptor before lookups can win.
                slot.used.store(2, Ordering::Release);
                Ok(queue)
            }
            Err(err) => {
                slot.used.store(0, Ordering::Release);
                Err(err)
            }
        }
    }

    /// Remove a queue and recycle its directory slot. Assumes the queue has
    /// drained; in-flight tokens are dropped with the lanes.
    pub fn destroy_queue(&self, id: QueueId) {
        let Some(queue) = self.get_queue(id) else {
            return;
        };
        queue.release_lanes();
        self.slot(id.unique).used.store(0, Ordering::Release);
        self.push_ticket(id.unique as u32);
    }

    /// Iterate every live queue, in slot order.
    pub fn for_each_queue(&self, mut f: impl FnMut(MultiQueue)) {
        for idx in 0..u64::from(self.hdr().max_queues) {
            let slot = self.slot(idx);
            if slot.used.load(Ordering::Acquire) == 2 {
                // Safety: used slots hold initialized descriptors.
                f(unsafe { MultiQueue::from_raw(NonNull::from(&mut slot.queue), self.alloc) });
            }
        }
    }

    fn push_ticket(&self, slot_idx: u32) {
        let (stack, entries) = self.tickets();
        lock(&stack.lock);
        // Safety: top < max_queues by construction (each slot is pushed at
        // most once per destroy).
        unsafe {
            *entries.add(stack.top as usize) = slot_idx;
        }
        stack.top += 1;
        stack.lock.store(0, Ordering::Release);
    }

    /// Pop a recycled directory slot, if any.
    pub fn pop_ticket(&self) -> Option<u32> {
        let (stack, entries) = self.tickets();
        lock(&stack.lock);
        let out = if stack.top == 0 {
            None
        } else {
            stack.top -= 1;
            // Safety: top was > 0, the entry below it is initialized.
            Some(unsafe { *entries.add(stack.top as usize) })
        };
        stack.lock.store(0, Ordering::Release);
        out
    }
}

fn lock(word: &AtomicU32) {
    while word
        .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shmem::ShmRegion;

    fn manager() -> (ShmRegion, QueueManager) {
        let region = ShmRegion::create_heap(16 << 20).unwrap();
        let alloc = Allocator::init(&region, 1, size_of::<CoreHeader>()).unwrap();
        let qm = QueueManager::server_init(alloc, 1, &ServerConfig::default()).unwrap();
        (region, qm)
    }

    #[test]
    fn admin_queue_is_reserved_at_slot_zero() {
        let (_region, qm) = manager();
        let admin = qm.get_queue(qm.admin_queue_id()).unwrap();
        assert_eq!(admin.id(), QueueId::new(1, 0));
        assert!(admin.flags().contains(QueueFlags::LOW_LATENCY));
    }

    #[test]
    fn create_lookup_destroy() {
        let (_region, qm) = manager();
        let id = QueueId::new(1, 5);
        qm.create_queue(id, 8, 4, 64, QueueFlags::empty()).unwrap();
        assert!(qm.get_queue(id).is_some());
        qm.destroy_queue(id);
        assert!(qm.get_queue(id).is_none());
        assert_eq!(qm.pop_ticket(), Some(5));
    }

    #[test]
    fn task_nodes_are_monotonic() {
        let (_region, qm) = manager();
        let a = qm.make_task_node();
        let b = qm.make_task_node();
        assert!(b.root.unique > a.root.unique);
        assert_eq!(a.root.node_id, 1);
    }

    #[test]
    fn client_attach_shares_the_directory() {
        let (region, qm) = manager();
        let alloc = Allocator::attach(&region).unwrap();
        let client = QueueManager::client_init(alloc);
        assert_eq!(client.node_id(), 1);
        assert!(client.get_queue(client.admin_queue_id()).is_some());
    }
}
