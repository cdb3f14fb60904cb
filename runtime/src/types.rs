// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Identifier types shared between clients, the runtime, and the wire format.
//!
//! All of these are `#[repr(C)]` because they are embedded in task headers and
//! queue descriptors that live in the shared-memory region and must have the
//! same layout in every attached process.

use crate::net::serialize::{Archive, WireSerialize};
use core::fmt;
use smallvec::SmallVec;

/// Identifies a node in the cluster.
///
/// `0` is reserved for "unassigned"; `1..=N` is the cluster membership order.
pub type NodeId = u32;

/// A 96-bit identifier, unique within the cluster.
///
/// The `KIND` parameter only exists to keep the different identifier spaces
/// (task ids, task-state ids, queue ids, ...) from being mixed up at compile
/// time; it has no runtime representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct UniqueId<const KIND: u32> {
    pub node_id: NodeId,
    pub unique: u64,
}

/// Identifies a single task (the root of a task tree).
pub type TaskId = UniqueId<0>;
/// Identifies a task state (a loaded service plugin instance).
pub type TaskStateId = UniqueId<1>;
/// Identifies a multi-lane queue. Each task state owns exactly one queue
/// whose id equals its state id.
pub type QueueId = UniqueId<2>;
/// Identifies a blob in services built on top of the runtime. Carried here
/// because task groups commonly key on it.
pub type BlobId = UniqueId<3>;

// === impl UniqueId ===

impl<const KIND: u32> UniqueId<KIND> {
    pub const fn new(node_id: NodeId, unique: u64) -> Self {
        Self { node_id, unique }
    }

    /// The null id. An id is null iff *both* fields are zero.
    pub const fn null() -> Self {
        Self {
            node_id: 0,
            unique: 0,
        }
    }

    pub const fn is_null(&self) -> bool {
        self.node_id == 0 && self.unique == 0
    }

    /// Reinterpret this id in a different identifier space.
    ///
    /// `QueueId` and `TaskStateId` are structurally identical and a task
    /// state's queue id *is* its state id, so this conversion is routine.
    pub const fn into_kind<const OTHER: u32>(self) -> UniqueId<OTHER> {
        UniqueId {
            node_id: self.node_id,
            unique: self.unique,
        }
    }
}

impl<const KIND: u32> fmt::Display for UniqueId<KIND> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node_id, self.unique)
    }
}

impl<const KIND: u32> WireSerialize for UniqueId<KIND> {
    fn wire<A: Archive>(&mut self, ar: &mut A) {
        ar.u32(&mut self.node_id);
        ar.u64(&mut self.unique);
    }
}

/// Identity of a node in the logical task tree.
///
/// Child tasks spawned while executing task `T` carry `root = T.root` and
/// `depth = T.depth + 1`, which is what lets the worker's group admission
/// recursively admit children of an already-admitted root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct TaskNode {
    pub root: TaskId,
    pub depth: u32,
}

// === impl TaskNode ===

impl TaskNode {
    pub const fn new(root: TaskId) -> Self {
        Self { root, depth: 0 }
    }

    pub const fn null() -> Self {
        Self {
            root: TaskId::null(),
            depth: 0,
        }
    }

    pub const fn is_null(&self) -> bool {
        self.root.is_null()
    }

    /// The task node for a child spawned at this node.
    pub const fn child(self) -> Self {
        Self {
            root: self.root,
            depth: self.depth + 1,
        }
    }
}

impl fmt::Display for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.root, self.depth)
    }
}

impl WireSerialize for TaskNode {
    fn wire<A: Archive>(&mut self, ar: &mut A) {
        self.root.wire(ar);
        ar.u32(&mut self.depth);
    }
}

/// Addressing hint: where a task should execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, u32)]
pub enum DomainId {
    /// This node.
    Local,
    /// A specific node.
    Node(NodeId),
    /// Every node in the cluster.
    Global,
}

// === impl DomainId ===

impl DomainId {
    /// Whether a task addressed to this domain must leave the current node.
    pub fn is_remote(&self, num_hosts: usize, my_node: NodeId) -> bool {
        match self {
            DomainId::Local => false,
            DomainId::Node(node) => *node != my_node,
            // A global task is dispatched over RPC to every host, self
            // included, so it is remote whenever there is a cluster at all.
            DomainId::Global => num_hosts > 0,
        }
    }

    /// The set of destination nodes this domain resolves to.
    pub fn resolve(&self, num_hosts: usize, my_node: NodeId) -> SmallVec<[NodeId; 4]> {
        match self {
            DomainId::Local => SmallVec::new(),
            DomainId::Node(node) if *node == my_node => SmallVec::new(),
            DomainId::Node(node) => SmallVec::from_slice(&[*node]),
            DomainId::Global => (1..=num_hosts as NodeId).collect(),
        }
    }
}

impl WireSerialize for DomainId {
    fn wire<A: Archive>(&mut self, ar: &mut A) {
        let (mut tag, mut node) = match *self {
            DomainId::Local => (0_u32, 0),
            DomainId::Node(node) => (1, node),
            DomainId::Global => (2, 0),
        };
        ar.u32(&mut tag);
        ar.u32(&mut node);
        *self = match tag {
            1 => DomainId::Node(node),
            2 => DomainId::Global,
            _ => DomainId::Local,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_id_requires_both_fields_zero() {
        assert!(TaskStateId::null().is_null());
        assert!(!TaskStateId::new(1, 0).is_null());
        assert!(!TaskStateId::new(0, 3).is_null());
    }

    #[test]
    fn child_nodes_share_the_root() {
        let root = TaskNode::new(TaskId::new(1, 7));
        let child = root.child();
        let grandchild = child.child();
        assert_eq!(child.root, root.root);
        assert_eq!(grandchild.depth, 2);
    }

    #[test]
    fn domain_resolution() {
        assert!(!DomainId::Local.is_remote(4, 1));
        assert!(!DomainId::Node(2).is_remote(4, 2));
        assert!(DomainId::Node(3).is_remote(4, 2));
        assert!(DomainId::Global.is_remote(2, 1));

        assert_eq!(DomainId::Global.resolve(2, 1).as_slice(), &[1, 2]);
        assert_eq!(DomainId::Node(2).resolve(4, 1).as_slice(), &[2]);
        assert!(DomainId::Node(1).resolve(4, 1).is_empty());
        assert!(DomainId::Local.resolve(4, 1).is_empty());
    }
}
