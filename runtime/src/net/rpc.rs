// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The RPC boundary.
//!
//! The transport itself is an external collaborator; this module fixes its
//! contract ([`RpcEngine`]) and carries the cluster host table the runtime
//! derives node ids from. A loopback engine that routes between in-process
//! nodes ships here too — it backs the test suites and single-node
//! deployments, and doubles as the reference for transport implementors.

use crate::config::ServerConfig;
use crate::error::{Result, RuntimeError};
use crate::types::{NodeId, TaskStateId};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

/// One cluster member.
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub node_id: NodeId,
    pub hostname: String,
}

/// The cluster host table, in membership order.
#[derive(Debug, Clone, Default)]
pub struct RpcContext {
    pub hosts: Vec<HostInfo>,
    pub port: u16,
    pub protocol: String,
}

// === impl RpcContext ===

impl RpcContext {
    /// Build the host table from the host file (one hostname per line) or
    /// the inline host list.
    pub fn server_init(config: &ServerConfig) -> Result<Self> {
        let names: Vec<String> = if config.rpc.host_file.is_empty() {
            config.rpc.host_names.clone()
        } else {
            std::fs::read_to_string(&config.rpc.host_file)?
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()
        };
        let hosts = names
            .into_iter()
            .enumerate()
            .map(|(idx, hostname)| HostInfo {
                node_id: idx as NodeId + 1,
                hostname,
            })
            .collect();
        Ok(Self {
            hosts,
            port: config.rpc.port,
            protocol: config.rpc.protocol.clone(),
        })
    }

    pub fn num_hosts(&self) -> usize {
        self.hosts.len()
    }

    pub fn hostname(&self, node_id: NodeId) -> Option<&str> {
        self.hosts
            .iter()
            .find(|h| h.node_id == node_id)
            .map(|h| h.hostname.as_str())
    }

    /// Pin a hash to a node, 1-based like the membership order.
    pub fn hash_to_node(&self, hash: u64) -> NodeId {
        1 + (hash % self.num_hosts().max(1) as u64) as NodeId
    }
}

/// Direction of a bulk transfer, from the receiver's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoType {
    /// The receiver reads the payload (data flows caller → callee).
    Read,
    /// The receiver writes into the caller's buffer (callee → caller).
    Write,
}

/// A raw bulk buffer handed to the transport.
///
/// Invariants (upheld by the remote-dispatch plugin, the only producer):
/// the buffer outlives the future of the call it rides on, and only the
/// direction named by the accompanying [`IoType`] is performed.
#[derive(Debug, Clone, Copy)]
pub struct BulkBuffer {
    pub ptr: *mut u8,
    pub len: usize,
}

// Safety: see the invariants above; the transport is the only dereferencer.
unsafe impl Send for BulkBuffer {}
unsafe impl Sync for BulkBuffer {}

impl BulkBuffer {
    /// # Safety
    ///
    /// See the type-level invariants.
    pub unsafe fn new(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    /// # Safety
    ///
    /// Caller must be on the owning node with the buffer alive.
    pub unsafe fn as_slice(&self) -> &[u8] {
        // Safety: forwarded.
        unsafe { core::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// # Safety
    ///
    /// Caller must be on the owning node with the buffer alive and have
    /// write direction.
    #[expect(clippy::mut_from_ref, reason = "describes externally owned memory")]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        // Safety: forwarded.
        unsafe { core::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

/// An inbound call as the engine presents it to a registered handler.
pub struct RpcRequest {
    pub state_id: TaskStateId,
    pub method: u32,
    pub params: Vec<u8>,
    /// Present for bulk calls: the payload buffer and its direction.
    pub bulk: Option<(BulkBuffer, IoType)>,
}

/// A handler serves one registered RPC name and returns the reply bytes.
pub type RpcHandler = Arc<dyn Fn(RpcRequest) -> Vec<u8> + Send + Sync>;

/// Completion handle for an async call.
#[derive(Debug, Clone)]
pub struct RpcFuture {
    inner: Arc<FutureInner>,
}

#[derive(Debug)]
struct FutureInner {
    state: Mutex<Option<Result<Vec<u8>, String>>>,
    cond: Condvar,
}

// === impl RpcFuture ===

impl RpcFuture {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FutureInner {
                state: Mutex::new(None),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn fulfill(&self, result: Result<Vec<u8>, String>) {
        let mut state = self.inner.state.lock().unwrap();
        if state.is_none() {
            *state = Some(result);
            self.inner.cond.notify_all();
        }
    }

    /// Nonblocking completion check.
    pub fn is_done(&self) -> bool {
        self.inner.state.lock().unwrap().is_some()
    }

    /// Block for the reply bytes.
    pub fn wait(&self) -> Result<Vec<u8>> {
        let mut state = self.inner.state.lock().unwrap();
        while state.is_none() {
            state = self.inner.cond.wait(state).unwrap();
        }
        match state.take().unwrap() {
            Ok(bytes) => Ok(bytes),
            Err(msg) => Err(RuntimeError::Transport(msg)),
        }
    }
}

impl Default for RpcFuture {
    fn default() -> Self {
        Self::new()
    }
}

/// The contract the runtime requires from its RPC transport.
pub trait RpcEngine: Send + Sync {
    /// Register a named handler. Called once per name at plugin construct.
    fn register(&self, name: &'static str, handler: RpcHandler);

    /// Async unary call carrying only metadata bytes.
    fn call_small(
        &self,
        to: NodeId,
        name: &'static str,
        state_id: TaskStateId,
        method: u32,
        params: Vec<u8>,
    ) -> RpcFuture;

    /// Async call with a bulk payload in the given direction.
    #[expect(clippy::too_many_arguments, reason = "mirrors the wire call")]
    fn call_bulk(
        &self,
        to: NodeId,
        name: &'static str,
        state_id: TaskStateId,
        method: u32,
        params: Vec<u8>,
        bulk: BulkBuffer,
        io_type: IoType,
    ) -> RpcFuture;
}

/// Routes calls between nodes living in one process.
#[derive(Default)]
pub struct LoopbackFabric {
    nodes: Mutex<HashMap<NodeId, Arc<Mutex<HashMap<&'static str, RpcHandler>>>>>,
}

// === impl LoopbackFabric ===

impl LoopbackFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The engine endpoint for one node.
    pub fn endpoint(self: &Arc<Self>, node_id: NodeId) -> Arc<LoopbackEngine> {
        let handlers = self
            .nodes
            .lock()
            .unwrap()
            .entry(node_id)
            .or_default()
            .clone();
        Arc::new(LoopbackEngine {
            fabric: self.clone(),
            handlers,
        })
    }

    fn dispatch(&self, to: NodeId, name: &'static str, req: RpcRequest, future: RpcFuture) {
        let handler = self
            .nodes
            .lock()
            .unwrap()
            .get(&to)
            .and_then(|handlers| handlers.lock().unwrap().get(name).cloned());
        let Some(handler) = handler else {
            future.fulfill(Err(format!("no handler {name:?} on node {to}")));
            return;
        };
        // Handlers block on task completion, so every call gets its own
        // thread, the way a real engine runs handlers on RPC worker threads.
        std::thread::spawn(move || {
            let reply = handler(req);
            future.fulfill(Ok(reply));
        });
    }
}

/// One node's view of the [`LoopbackFabric`].
pub struct LoopbackEngine {
    fabric: Arc<LoopbackFabric>,
    handlers: Arc<Mutex<HashMap<&'static str, RpcHandler>>>,
}

impl RpcEngine for LoopbackEngine {
    fn register(&self, name: &'static str, handler: RpcHandler) {
        self.handlers.lock().unwrap().insert(name, handler);
    }

    fn call_small(
        &self,
        to: NodeId,
        name: &'static str,
        state_id: TaskStateId,
        method: u32,
        params: Vec<u8>,
    ) -> RpcFuture {
        let future = RpcFuture::new();
        self.fabric.dispatch(
            to,
            name,
            RpcRequest {
                state_id,
                method,
                params,
                bulk: None,
            },
            future.clone(),
        );
        future
    }

    fn call_bulk(
        &self,
        to: NodeId,
        name: &'static str,
        state_id: TaskStateId,
        method: u32,
        params: Vec<u8>,
        bulk: BulkBuffer,
        io_type: IoType,
    ) -> RpcFuture {
        let future = RpcFuture::new();
        self.fabric.dispatch(
            to,
            name,
            RpcRequest {
                state_id,
                method,
                params,
                bulk: Some((bulk, io_type)),
            },
            future.clone(),
        );
        future
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_table_is_one_based() {
        let mut config = ServerConfig::default();
        config.rpc.host_names = vec!["a".into(), "b".into(), "c".into()];
        let ctx = RpcContext::server_init(&config).unwrap();
        assert_eq!(ctx.num_hosts(), 3);
        assert_eq!(ctx.hostname(1), Some("a"));
        assert_eq!(ctx.hostname(3), Some("c"));
        assert_eq!(ctx.hash_to_node(4), 2);
    }

    #[test]
    fn loopback_routes_between_nodes() {
        let fabric = LoopbackFabric::new();
        let a = fabric.endpoint(1);
        let b = fabric.endpoint(2);

        b.register(
            "echo",
            Arc::new(|req: RpcRequest| {
                let mut out = req.params;
                out.push(req.method as u8);
                out
            }),
        );

        let future = a.call_small(2, "echo", TaskStateId::new(2, 1), 7, vec![1, 2]);
        assert_eq!(future.wait().unwrap(), vec![1, 2, 7]);
    }

    #[test]
    fn missing_handler_is_a_transport_error() {
        let fabric = LoopbackFabric::new();
        let a = fabric.endpoint(1);
        let future = a.call_small(9, "nope", TaskStateId::null(), 0, vec![]);
        assert!(matches!(future.wait(), Err(RuntimeError::Transport(_))));
    }
}
