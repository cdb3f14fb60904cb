// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Daemon assembly.
//!
//! There are no global singletons: every collaborator — queue manager,
//! registry, orchestrator, RPC engine — hangs off one [`Runtime`] value, and
//! workers and plugins receive a handle to it explicitly.

use crate::client::Client;
use crate::config::ServerConfig;
use crate::error::{Result, RuntimeError};
use crate::net::rpc::{LoopbackFabric, RpcContext, RpcEngine};
use crate::orchestrator::{METHOD_SCHEDULE, WorkOrchestrator};
use crate::queue::{QueueFlags, QueueManager};
use crate::registry::{StaticTaskLib, TaskRegistry};
use crate::shmem::{Allocator, BackendKind, ShmRegion};
use crate::task::{Task, TaskFlags, TaskRef, TaskState};
use crate::types::{DomainId, NodeId, TaskStateId};
use crate::worker::WorkEntry;
use core::mem::size_of;
use std::sync::{Arc, Mutex, OnceLock};

/// Library/state names the daemon instantiates at startup when the
/// corresponding libraries are registered.
pub const ADMIN_LIB: &str = "strata_admin";
pub const ADMIN_STATE: &str = "strata_admin";
const BOOTSTRAP_SERVICES: &[(&str, &str)] = &[
    ("strata_remote_queue", "remote_queue"),
    ("strata_proc_queue", "proc_queue"),
];
const QUEUE_POLICY: (&str, &str) = ("strata_worch_queue_rr", "worch_queue_rr");
const PROC_POLICY: (&str, &str) = ("strata_worch_proc_rr", "worch_proc_rr");

/// Installed by the remote-queue plugin; the worker hands every task whose
/// domain is not local to this hook.
pub trait RemoteDispatcher: Send + Sync {
    fn disperse(&self, rt: &Runtime, task: TaskRef, state: &dyn TaskState, dests: &[NodeId]);
}

#[derive(Debug, Default)]
struct PolicySlots {
    queue: Option<TaskRef>,
    proc: Option<TaskRef>,
}

/// The runtime daemon: shared-memory region, queue directory, registry,
/// worker pool, and the RPC boundary.
pub struct Runtime {
    config: ServerConfig,
    _region: ShmRegion,
    alloc: Allocator,
    queues: QueueManager,
    registry: TaskRegistry,
    orchestrator: WorkOrchestrator,
    rpc: RpcContext,
    engine: Arc<dyn RpcEngine>,
    remote: OnceLock<Arc<dyn RemoteDispatcher>>,
    policies: Mutex<PolicySlots>,
    client: Client,
    node_id: NodeId,
    self_ref: OnceLock<std::sync::Weak<Runtime>>,
}

// === impl Runtime ===

impl Runtime {
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn client(&self) -> Client {
        self.client
    }

    pub fn alloc(&self) -> &Allocator {
        &self.alloc
    }

    pub fn queues(&self) -> &QueueManager {
        &self.queues
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn orchestrator(&self) -> &WorkOrchestrator {
        &self.orchestrator
    }

    pub fn rpc(&self) -> &RpcContext {
        &self.rpc
    }

    pub fn engine(&self) -> &Arc<dyn RpcEngine> {
        &self.engine
    }

    /// Whether `header` addresses an execution domain this node cannot serve
    /// locally. True only when a remote dispatcher is installed; without one
    /// the task falls back to local execution.
    pub fn is_remote(&self, header: &Task) -> bool {
        self.remote.get().is_some()
            && header
                .domain_id
                .is_remote(self.rpc.num_hosts(), self.node_id)
    }

    /// An owning handle to this runtime. Plugins use this to move the
    /// runtime into `'static` contexts such as RPC handlers.
    ///
    /// # Panics
    ///
    /// Panics before `RuntimeBuilder::serve` has finished assembling the
    /// runtime (no plugin code runs that early).
    pub fn handle(&self) -> Arc<Runtime> {
        self.self_ref
            .get()
            .and_then(std::sync::Weak::upgrade)
            .expect("runtime handle requested before serve completed")
    }

    /// Called by the remote-queue plugin at construct.
    pub fn install_remote_dispatcher(&self, dispatcher: Arc<dyn RemoteDispatcher>) {
        let _ = self.remote.set(dispatcher);
    }

    pub(crate) fn disperse(&self, task: TaskRef, state: &dyn TaskState, dests: &[NodeId]) {
        match self.remote.get() {
            Some(dispatcher) => dispatcher.disperse(self, task, state, dests),
            None => {
                tracing::error!("remote task without a remote-queue state");
                task.header().set_failed();
                task.header().set_module_complete();
            }
        }
    }

    /// Create a task state together with the queue it owns. The bound name
    /// is idempotent: creating an existing name returns the existing id.
    pub fn create_service(
        &self,
        lib: &str,
        name: &str,
        id: Option<TaskStateId>,
        max_lanes: u32,
        num_lanes: u32,
        depth: u32,
        flags: QueueFlags,
        ctor: Option<TaskRef>,
    ) -> Result<TaskStateId> {
        let existing = self.registry.get_state_id(name);
        if !existing.is_null() {
            return Ok(existing);
        }
        let id = match id {
            Some(id) if !id.is_null() => id,
            _ => self.registry.get_or_create_state_id(name),
        };
        self.queues
            .create_queue(id.into_kind(), max_lanes, num_lanes, depth, flags)?;
        match self.registry.create_state(self, lib, name, id, ctor) {
            Ok(id) => Ok(id),
            Err(err) => {
                self.queues.destroy_queue(id.into_kind());
                Err(err)
            }
        }
    }

    /// Tear down a task state and its queue.
    pub fn destroy_service(&self, id: TaskStateId) {
        self.registry.destroy_state(id);
        self.queues.destroy_queue(id.into_kind());
    }

    /// Replace the queue-scheduling policy. Returns `false` while the
    /// predecessor is still winding down; callers re-run until it sticks.
    pub fn install_queue_policy(&self, policy: TaskStateId) -> Result<bool> {
        let mut slots = self.policies.lock().unwrap();
        let slot = &mut slots.queue;
        self.install_policy(slot, policy)
    }

    /// Replace the process-scheduling policy. Same contract as
    /// [`Self::install_queue_policy`].
    pub fn install_process_policy(&self, policy: TaskStateId) -> Result<bool> {
        let mut slots = self.policies.lock().unwrap();
        let slot = &mut slots.proc;
        self.install_policy(slot, policy)
    }

    fn install_policy(&self, slot: &mut Option<TaskRef>, policy: TaskStateId) -> Result<bool> {
        if let Some(prev) = slot {
            prev.header().set_external_complete();
            if !prev.header().is_complete() {
                return Ok(false);
            }
            self.client.free_task(*prev);
        }
        let task = self.client.new_task(Task::new(
            self.queues.make_task_node(),
            DomainId::Local,
            policy,
            0,
            METHOD_SCHEDULE,
            TaskFlags::LONG_RUNNING,
        ))?;
        let task = task.task_ref();
        let admin_queue = self
            .queues
            .get_queue(self.queues.admin_queue_id())
            .ok_or_else(|| RuntimeError::NotFound("admin queue".into()))?;
        self.client.emplace(admin_queue, task);
        *slot = Some(task);
        Ok(true)
    }

    /// Stop the worker pool and wait for the threads to exit.
    pub fn shutdown(&self) {
        self.orchestrator.finalize();
        self.orchestrator.join_all();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl core::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Runtime")
            .field("node_id", &self.node_id)
            .field("num_workers", &self.orchestrator.num_workers())
            .finish_non_exhaustive()
    }
}

/// Builds and starts a [`Runtime`].
pub struct RuntimeBuilder {
    config: ServerConfig,
    backend: BackendKind,
    node_id: Option<NodeId>,
    engine: Option<Arc<dyn RpcEngine>>,
    static_libs: Vec<StaticTaskLib>,
}

// === impl RuntimeBuilder ===

impl RuntimeBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            backend: BackendKind::Posix,
            node_id: None,
            engine: None,
            static_libs: Vec::new(),
        }
    }

    /// Back the shared-memory region with an anonymous mapping instead of a
    /// named POSIX segment. For tests and single-process deployments.
    pub fn with_heap_backend(mut self) -> Self {
        self.backend = BackendKind::Heap;
        self
    }

    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn with_rpc_engine(mut self, engine: Arc<dyn RpcEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Register a task library linked into this binary.
    pub fn with_static_lib(mut self, lib: StaticTaskLib) -> Self {
        self.static_libs.push(lib);
        self
    }

    /// Initialize shared memory, spawn workers, and bring up the admin state
    /// plus whichever bootstrap services have registered libraries.
    pub fn serve(self) -> Result<Arc<Runtime>> {
        let config = self.config;
        let rpc = RpcContext::server_init(&config)?;
        let node_id = self.node_id.unwrap_or_else(|| local_node_id(&rpc));

        let region = match self.backend {
            BackendKind::Posix => ShmRegion::create_posix(&config.shm_name, config.shm_size as usize)?,
            BackendKind::Heap => ShmRegion::create_heap(config.shm_size as usize)?,
        };
        let alloc = Allocator::init(&region, 1, size_of::<crate::queue::CoreHeader>())?;
        let queues = QueueManager::server_init(alloc, node_id, &config)?;
        let client = Client::new(alloc, queues);

        let registry = TaskRegistry::new(node_id);
        for lib in self.static_libs {
            registry.register_static(lib);
        }
        registry.load_config_libs(&config);

        let engine: Arc<dyn RpcEngine> = match self.engine {
            Some(engine) => engine,
            None => LoopbackFabric::new().endpoint(node_id),
        };

        let rt = Arc::new(Runtime {
            orchestrator: WorkOrchestrator::new(),
            config,
            _region: region,
            alloc,
            queues,
            registry,
            rpc,
            engine,
            remote: OnceLock::new(),
            policies: Mutex::new(PolicySlots::default()),
            client,
            node_id,
            self_ref: OnceLock::new(),
        });
        rt.self_ref
            .set(Arc::downgrade(&rt))
            .expect("self_ref set twice");

        rt.orchestrator.spawn(&rt, rt.config.max_workers);

        // Bootstrap binding: until the queue policy takes over, worker 0
        // owns every admin lane (admin tasks all hash to lane 0 anyway).
        let admin_queue = rt
            .queues
            .get_queue(rt.queues.admin_queue_id())
            .expect("admin queue exists");
        if let Some(worker) = rt.orchestrator.worker(0) {
            worker.poll_queues(
                (0..admin_queue.num_lanes())
                    .map(|lane| WorkEntry {
                        lane,
                        queue: admin_queue,
                    })
                    .collect(),
            );
        }
        admin_queue.set_num_scheduled(admin_queue.num_lanes());

        // The admin state is mandatory; it occupies id (node, 0) and shares
        // the already-created admin queue.
        if !rt.registry.has_lib(ADMIN_LIB) {
            return Err(RuntimeError::NotFound(format!("task library {ADMIN_LIB}")));
        }
        let admin_id = rt.queues.admin_state_id();
        rt.registry
            .create_state(&rt, ADMIN_LIB, ADMIN_STATE, admin_id, None)?;

        for &(lib, name) in BOOTSTRAP_SERVICES {
            if !rt.registry.has_lib(lib) {
                tracing::debug!(lib, "bootstrap service not registered, skipping");
                continue;
            }
            rt.create_service(
                lib,
                name,
                None,
                rt.config.max_lanes,
                rt.config.max_lanes,
                rt.config.queue_depth,
                QueueFlags::empty(),
                None,
            )?;
        }

        for (which, (lib, name)) in [QUEUE_POLICY, PROC_POLICY].into_iter().enumerate() {
            if !rt.registry.has_lib(lib) {
                tracing::debug!(lib, "scheduling policy not registered, skipping");
                continue;
            }
            let id = rt.create_service(lib, name, None, 1, 1, 4, QueueFlags::empty(), None)?;
            if which == 0 {
                rt.install_queue_policy(id)?;
            } else {
                rt.install_process_policy(id)?;
            }
        }

        Ok(rt)
    }
}

/// This host's position in the cluster order, or 1 when it cannot be
/// determined (single-node deployments).
fn local_node_id(rpc: &RpcContext) -> NodeId {
    let hostname = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    rpc.hosts
        .iter()
        .find(|host| host.hostname == hostname)
        .map_or(1, |host| host.node_id)
}
