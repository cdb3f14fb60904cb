// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Workers: pinned OS threads running a cooperative poll loop over a private
//! list of lanes.
//!
//! A worker is single-threaded and cooperative internally; a task either
//! completes, yields by being re-queued, or is parked. The orchestrator
//! moves lanes in and out of a worker's responsibility exclusively through
//! the two bounded control channels, so the work list and the group map stay
//! thread-private.

use crate::queue::{LaneData, MultiQueue};
use crate::runtime::Runtime;
use crate::task::{GroupDisposition, GroupKey, TaskRef, TaskState, method};
use crate::types::{QueueId, TaskNode};
use bitflags::bitflags;
use crossbeam_channel::{Receiver, Sender};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Tokens visited per lane per tick.
const POLL_BATCH: u32 = 1024;
/// Capacity of each control channel, in batches.
const CTRL_DEPTH: usize = 1024;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct WorkerFlags: u32 {
        const CONTINUOUS_POLLING = 1 << 0;
    }
}

/// One lane a worker is responsible for polling.
#[derive(Debug, Clone, Copy)]
pub struct WorkEntry {
    pub lane: u32,
    pub queue: MultiQueue,
}

impl PartialEq for WorkEntry {
    fn eq(&self, other: &Self) -> bool {
        self.lane == other.lane && self.queue.id() == other.queue.id()
    }
}

impl Eq for WorkEntry {}

/// Task-group admission bookkeeping.
///
/// Within one queue at most one task per group key runs at a time; child
/// tasks of the already-admitted root recursively admit, tracked by a depth
/// counter that must return to zero exactly when the last task of the group
/// completes.
#[derive(Debug, Default)]
pub(crate) struct GroupMap {
    map: HashMap<GroupKey, TaskNode>,
}

// === impl GroupMap ===

impl GroupMap {
    /// Try to admit a task of group `key` with identity `node`.
    pub(crate) fn admit(&mut self, key: &GroupKey, node: TaskNode) -> bool {
        match self.map.get_mut(key) {
            None => {
                let mut node = node;
                node.depth = 1;
                self.map.insert(key.clone(), node);
                true
            }
            Some(existing) if existing.root == node.root => {
                existing.depth += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Account the completion of a previously admitted task.
    pub(crate) fn remove(&mut self, key: &GroupKey) {
        let Some(existing) = self.map.get_mut(key) else {
            tracing::error!("group depth accounting lost its entry");
            return;
        };
        if existing.depth == 0 {
            tracing::error!(node = %existing, "group depth is already zero");
            return;
        }
        existing.depth -= 1;
        if existing.depth == 0 {
            self.map.remove(key);
        }
    }

    pub(crate) fn depth(&self, key: &GroupKey) -> u32 {
        self.map.get(key).map_or(0, |node| node.depth)
    }
}

/// The orchestrator-side handle to a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    id: u32,
    poll_tx: Sender<Vec<WorkEntry>>,
    relinquish_tx: Sender<Vec<WorkEntry>>,
    /// OS thread id of the worker, for CPU affinity. Zero until the thread
    /// has announced itself.
    tid: Arc<AtomicI32>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

// === impl WorkerHandle ===

impl WorkerHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Hand the worker additional lanes to poll.
    pub fn poll_queues(&self, entries: Vec<WorkEntry>) {
        let _ = self.poll_tx.try_send(entries);
    }

    /// Ask the worker to stop polling the given lanes.
    pub fn relinquish_queues(&self, entries: Vec<WorkEntry>) {
        let _ = self.relinquish_tx.try_send(entries);
    }

    /// Pin the worker thread to `cpu`.
    pub fn set_cpu_affinity(&self, cpu: usize) {
        let tid = self.tid.load(Ordering::Acquire);
        if tid == 0 {
            return;
        }
        let mut set = nix::sched::CpuSet::new();
        if set.set(cpu).is_err() {
            return;
        }
        if let Err(err) = nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(tid), &set) {
            tracing::warn!(worker = self.id, cpu, %err, "failed to set CPU affinity");
        }
    }

    pub(crate) fn join(&self) {
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

/// Spawn worker `id` for `rt`.
pub(crate) fn spawn_worker(rt: Arc<Runtime>, id: u32) -> WorkerHandle {
    let (poll_tx, poll_rx) = crossbeam_channel::bounded(CTRL_DEPTH);
    let (relinquish_tx, relinquish_rx) = crossbeam_channel::bounded(CTRL_DEPTH);
    let tid = Arc::new(AtomicI32::new(0));
    let tid_clone = tid.clone();

    let thread = std::thread::Builder::new()
        .name(format!("strata-worker-{id}"))
        .spawn(move || {
            tid_clone.store(nix::unistd::gettid().as_raw(), Ordering::Release);
            Worker {
                id,
                rt,
                work: Vec::new(),
                poll_rx,
                relinquish_rx,
                flags: WorkerFlags::CONTINUOUS_POLLING,
                sleep_us: 0,
                retries: 1,
                groups: GroupMap::default(),
                group: GroupKey::new(),
                pending: HashMap::new(),
            }
            .run();
        })
        .expect("failed to spawn worker thread");

    WorkerHandle {
        id,
        poll_tx,
        relinquish_tx,
        tid,
        thread: Mutex::new(Some(thread)),
    }
}

struct Worker {
    id: u32,
    rt: Arc<Runtime>,
    /// The lanes this worker polls, in arrival order.
    work: Vec<WorkEntry>,
    poll_rx: Receiver<Vec<WorkEntry>>,
    relinquish_rx: Receiver<Vec<WorkEntry>>,
    flags: WorkerFlags,
    sleep_us: u64,
    retries: u32,
    groups: GroupMap,
    /// Scratch for group keys, reused across tasks.
    group: GroupKey,
    /// Unfinished tokens whose re-emplace lost the race against producers
    /// filling the lane. Drained back into the lane ahead of each visit; the
    /// worker must never block on its own lane, it is the only consumer.
    pending: HashMap<(QueueId, u32), VecDeque<LaneData>>,
}

// === impl Worker ===

impl Worker {
    fn run(mut self) {
        let _span = tracing::debug_span!("worker main loop", worker = self.id).entered();

        while self.rt.orchestrator().is_alive() {
            let mut ran = false;
            for _ in 0..self.retries.max(1) {
                ran |= self.tick();
            }
            if !ran {
                self.idle();
            }
        }
        // One final tick so shutdown-adjacent tasks drain.
        self.tick();
        tracing::debug!(worker = self.id, "stop signal received, shutting down");
    }

    fn tick(&mut self) -> bool {
        while let Ok(entries) = self.poll_rx.try_recv() {
            for entry in entries {
                if !self.work.contains(&entry) {
                    tracing::debug!(
                        worker = self.id,
                        queue = %entry.queue.id(),
                        lane = entry.lane,
                        "scheduled lane",
                    );
                    self.work.push(entry);
                }
            }
        }
        while let Ok(entries) = self.relinquish_rx.try_recv() {
            self.work.retain(|have| !entries.contains(have));
        }

        let mut ran = false;
        for idx in 0..self.work.len() {
            let entry = self.work[idx];
            ran |= self.poll_grouped(entry);
        }
        ran
    }

    fn idle(&self) {
        if self.flags.contains(WorkerFlags::CONTINUOUS_POLLING) {
            return;
        }
        if self.sleep_us > 0 {
            std::thread::sleep(std::time::Duration::from_micros(self.sleep_us));
        } else {
            std::thread::yield_now();
        }
    }

    /// Drain up to [`POLL_BATCH`] tokens from one lane.
    fn poll_grouped(&mut self, entry: WorkEntry) -> bool {
        if entry.queue.is_pop_plugged() {
            return false;
        }
        let key = (entry.queue.id(), entry.lane);
        self.flush_pending(&key, entry);

        let rt = self.rt.clone();
        let client = rt.client();
        let mut ran = false;

        for _ in 0..POLL_BATCH {
            let Some(data) = entry.queue.pop(entry.lane) else {
                break;
            };
            let task = TaskRef::from_shm(client.alloc(), data.ptr);
            let header = task.header();

            let Some(state) = rt.registry().get_state(header.task_state) else {
                tracing::error!(
                    node = rt.node_id(),
                    state = %header.task_state,
                    "could not find the task state",
                );
                header.set_complete();
                if header.is_fire_and_forget() {
                    client.free_task(task);
                }
                continue;
            };

            let is_remote = rt.is_remote(header);
            if !header.is_module_complete()
                && !header.is_run_disabled()
                && self.check_task_group(task, &*state, header.task_node, is_remote)
            {
                if !header.is_marked() {
                    tracing::debug!(
                        node = rt.node_id(),
                        task_node = %header.task_node,
                        state = state.name(),
                        lane = entry.lane,
                        worker = self.id,
                        "popped task",
                    );
                    header.set_marked();
                }
                ran = true;
                if is_remote {
                    let dests = header
                        .domain_id
                        .resolve(rt.rpc().num_hosts(), rt.node_id());
                    rt.disperse(task, &*state, &dests);
                    header.disable_run();
                } else {
                    header.set_started();
                    state.run(&rt, entry.queue, header.method, task);
                }
            }

            if header.is_module_complete() {
                tracing::debug!(
                    node = rt.node_id(),
                    task_node = %header.task_node,
                    state = state.name(),
                    worker = self.id,
                    "ending task",
                );
                self.remove_task_group(task, &*state, is_remote);
                // Check flags before any free: the storage is gone right
                // after.
                if header.is_fire_and_forget() {
                    state.del(header.method, task, &client);
                } else {
                    header.set_complete();
                }
            } else {
                self.requeue(&key, entry, data);
            }
        }
        ran
    }

    /// Re-emplace an unfinished token at the tail of its lane, falling back
    /// to the local pending queue when producers have the lane full.
    fn requeue(&mut self, key: &(QueueId, u32), entry: WorkEntry, data: LaneData) {
        let in_order = self.pending.get(key).is_none_or(VecDeque::is_empty);
        if in_order && entry.queue.lane(entry.lane).emplace(data).is_ok() {
            return;
        }
        self.pending.entry(*key).or_default().push_back(data);
    }

    fn flush_pending(&mut self, key: &(QueueId, u32), entry: WorkEntry) {
        let Some(parked) = self.pending.get_mut(key) else {
            return;
        };
        while let Some(data) = parked.front().copied() {
            if entry.queue.lane(entry.lane).emplace(data).is_err() {
                break;
            }
            parked.pop_front();
        }
        if parked.is_empty() {
            self.pending.remove(key);
        }
    }

    /// Group admission per the task-group rules: remote and already-started
    /// tasks pass through, unordered tasks pass without accounting, and
    /// ordered tasks are admitted iff their group is free or rooted in the
    /// same task tree.
    fn check_task_group(
        &mut self,
        task: TaskRef,
        state: &dyn TaskState,
        node: TaskNode,
        is_remote: bool,
    ) -> bool {
        let header = task.header();
        if is_remote || header.is_started() {
            return true;
        }
        self.group.clear();
        let disposition = state.get_group(header.method, task, &mut self.group);
        if disposition == GroupDisposition::Unordered || header.is_unordered() {
            return true;
        }
        let admitted = self.groups.admit(&self.group, node);
        if admitted {
            tracing::trace!(
                worker = self.id,
                depth = self.groups.depth(&self.group),
                "admitted task into group",
            );
        }
        admitted
    }

    /// Undo the admission accounting for a completed task. Construct and
    /// destruct methods skip group bookkeeping entirely.
    fn remove_task_group(&mut self, task: TaskRef, state: &dyn TaskState, is_remote: bool) {
        let header = task.header();
        if is_remote {
            return;
        }
        if header.method < method::FIRST_USER || header.is_unordered() {
            return;
        }
        self.group.clear();
        let disposition = state.get_group(header.method, task, &mut self.group);
        if disposition == GroupDisposition::Unordered {
            return;
        }
        self.groups.remove(&self.group);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskId;

    fn key(s: &str) -> GroupKey {
        GroupKey::from_slice(s.as_bytes())
    }

    fn node(root: u64) -> TaskNode {
        TaskNode::new(TaskId::new(1, root))
    }

    #[test]
    fn distinct_groups_are_independent() {
        let mut groups = GroupMap::default();
        assert!(groups.admit(&key("a"), node(1)));
        assert!(groups.admit(&key("b"), node(2)));
    }

    #[test]
    fn second_root_is_denied_until_the_group_drains() {
        let mut groups = GroupMap::default();
        assert!(groups.admit(&key("a"), node(1)));
        assert!(!groups.admit(&key("a"), node(2)));
        groups.remove(&key("a"));
        assert!(groups.admit(&key("a"), node(2)));
    }

    #[test]
    fn children_of_the_admitted_root_recurse() {
        let mut groups = GroupMap::default();
        let root = node(7);
        assert!(groups.admit(&key("a"), root));
        assert!(groups.admit(&key("a"), root.child()));
        assert!(groups.admit(&key("a"), root.child().child()));
        assert_eq!(groups.depth(&key("a")), 3);

        groups.remove(&key("a"));
        groups.remove(&key("a"));
        assert!(!groups.admit(&key("a"), node(8)));
        groups.remove(&key("a"));
        // depth returned to zero exactly when the last member completed
        assert_eq!(groups.depth(&key("a")), 0);
        assert!(groups.admit(&key("a"), node(8)));
    }
}
