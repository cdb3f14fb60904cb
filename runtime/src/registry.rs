// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The task registry: loadable task libraries, name-to-id binding, and the
//! live task-state instances the workers dispatch into.
//!
//! A task library is a shared module exporting two symbols:
//!
//! ```text
//! create_state: fn(&Runtime, StateDesc, Option<TaskRef>) -> Box<dyn TaskState>
//! get_task_lib_name: fn() -> &'static str
//! ```
//!
//! both emitted by [`declare_task_lib!`](crate::declare_task_lib). Libraries
//! can equally be linked into the process and registered statically, which is
//! how the bundled services and the test suites run.

use crate::config::ServerConfig;
use crate::error::{Result, RuntimeError};
use crate::runtime::Runtime;
use crate::task::{StateDesc, TaskRef, TaskState};
use crate::types::{NodeId, TaskStateId};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Environment variable holding the runtime's task-library directories,
/// searched before the loader path.
pub const TASK_PATH_ENV: &str = "STRATA_TASK_PATH";

/// Factory signature exported by every task library.
pub type CreateStateFn = fn(&Runtime, StateDesc, Option<TaskRef>) -> Box<dyn TaskState>;

/// Name accessor exported by every task library.
pub type GetTaskLibNameFn = fn() -> &'static str;

/// A library linked into the binary and registered without `dlopen`.
#[derive(Debug, Clone, Copy)]
pub struct StaticTaskLib {
    pub name: &'static str,
    pub create_state: CreateStateFn,
}

struct TaskLibInfo {
    create_state: CreateStateFn,
    /// Keeps a dlopened module resident; `None` for static registrations.
    /// Dropped only by an explicit library destroy.
    _module: Option<libloading::Library>,
}

/// Process-wide registry of task libraries and task-state instances.
pub struct TaskRegistry {
    node_id: NodeId,
    lib_dirs: Vec<PathBuf>,
    libs: RwLock<HashMap<String, TaskLibInfo>>,
    state_ids: RwLock<HashMap<String, TaskStateId>>,
    states: RwLock<HashMap<TaskStateId, Arc<dyn TaskState>>>,
    /// Issues fresh state ids. `0` is the admin state.
    unique: AtomicU64,
}

// === impl TaskRegistry ===

impl TaskRegistry {
    /// Build the registry and assemble the library search path from
    /// `$STRATA_TASK_PATH` and the loader search path, in that priority.
    pub fn new(node_id: NodeId) -> Self {
        let mut lib_dirs = Vec::new();
        for var in [TASK_PATH_ENV, "LD_LIBRARY_PATH"] {
            if let Ok(paths) = std::env::var(var) {
                lib_dirs.extend(
                    paths
                        .split(':')
                        .filter(|dir| !dir.is_empty())
                        .map(PathBuf::from),
                );
            }
        }
        Self {
            node_id,
            lib_dirs,
            libs: RwLock::new(HashMap::new()),
            state_ids: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            unique: AtomicU64::new(1),
        }
    }

    /// Load the libraries named in the server configuration. Failures are
    /// logged and skipped; a missing optional service is not fatal.
    pub fn load_config_libs(&self, config: &ServerConfig) {
        for name in &config.task_libs {
            if let Err(err) = self.register_lib(name) {
                tracing::warn!(lib = %name, %err, "failed to load task library");
            }
        }
    }

    /// Locate and `dlopen` a task library by name.
    pub fn register_lib(&self, lib_name: &str) -> Result<()> {
        for dir in &self.lib_dirs {
            let candidates = [
                dir.join(format!("{lib_name}.so")),
                dir.join(format!("lib{lib_name}.so")),
            ];
            let Some(path) = candidates.iter().find(|p| p.exists()) else {
                continue;
            };

            // Safety: loading a module runs its initializers; the module is
            // trusted the same way the daemon binary is.
            let module = unsafe { libloading::Library::new(path) }
                .map_err(|err| RuntimeError::Plugin(format!("{}: {err}", path.display())))?;
            // Safety: symbol signatures are fixed by `declare_task_lib!`.
            let (create_state, lib_name) = unsafe {
                let create: libloading::Symbol<'_, CreateStateFn> = module
                    .get(b"create_state")
                    .map_err(|err| RuntimeError::Plugin(format!("missing create_state: {err}")))?;
                let name: libloading::Symbol<'_, GetTaskLibNameFn> =
                    module.get(b"get_task_lib_name").map_err(|err| {
                        RuntimeError::Plugin(format!("missing get_task_lib_name: {err}"))
                    })?;
                (*create, (*name)())
            };
            tracing::debug!(lib = lib_name, path = %path.display(), "loaded task library");
            self.libs.write().unwrap().insert(
                lib_name.to_string(),
                TaskLibInfo {
                    create_state,
                    _module: Some(module),
                },
            );
            return Ok(());
        }
        Err(RuntimeError::NotFound(format!("task library {lib_name}")))
    }

    /// Register a library linked into this binary.
    pub fn register_static(&self, lib: StaticTaskLib) {
        tracing::debug!(lib = lib.name, "registered static task library");
        self.libs.write().unwrap().insert(
            lib.name.to_string(),
            TaskLibInfo {
                create_state: lib.create_state,
                _module: None,
            },
        );
    }

    /// Drop a library registration. Instantiated states keep running; the
    /// module itself is unloaded when the last reference drops.
    pub fn destroy_lib(&self, lib_name: &str) {
        if self.libs.write().unwrap().remove(lib_name).is_none() {
            tracing::warn!(lib = lib_name, "destroy of unknown task library ignored");
        }
    }

    pub fn has_lib(&self, lib_name: &str) -> bool {
        self.libs.read().unwrap().contains_key(lib_name)
    }

    /// Issue a fresh task-state id.
    pub fn create_state_id(&self) -> TaskStateId {
        TaskStateId::new(self.node_id, self.unique.fetch_add(1, Ordering::Relaxed))
    }

    /// The id bound to `name`, allocating one if the name is new. Two racing
    /// calls with the same name observe the same id.
    pub fn get_or_create_state_id(&self, name: &str) -> TaskStateId {
        let mut ids = self.state_ids.write().unwrap();
        if let Some(id) = ids.get(name) {
            return *id;
        }
        let id = TaskStateId::new(self.node_id, self.unique.fetch_add(1, Ordering::Relaxed));
        ids.insert(name.to_string(), id);
        id
    }

    pub fn get_state_id(&self, name: &str) -> TaskStateId {
        self.state_ids
            .read()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(TaskStateId::null())
    }

    pub fn get_state(&self, id: TaskStateId) -> Option<Arc<dyn TaskState>> {
        self.states.read().unwrap().get(&id).cloned()
    }

    /// Instantiate a task state from a registered library and publish it
    /// under `name`/`id`.
    pub fn create_state(
        &self,
        rt: &Runtime,
        lib_name: &str,
        name: &str,
        id: TaskStateId,
        ctor: Option<TaskRef>,
    ) -> Result<TaskStateId> {
        let create_state = {
            let libs = self.libs.read().unwrap();
            let Some(info) = libs.get(lib_name) else {
                return Err(RuntimeError::NotFound(format!("task library {lib_name}")));
            };
            info.create_state
        };

        {
            let ids = self.state_ids.read().unwrap();
            if let Some(existing) = ids.get(name) {
                if self.states.read().unwrap().contains_key(existing) {
                    return Err(RuntimeError::AlreadyExists(format!("task state {name}")));
                }
            }
        }

        let desc = StateDesc {
            id,
            name: name.to_string(),
        };
        let state: Arc<dyn TaskState> = Arc::from(create_state(rt, desc, ctor));
        self.state_ids
            .write()
            .unwrap()
            .insert(name.to_string(), id);
        self.states.write().unwrap().insert(id, state);
        tracing::info!(state = name, %id, lib = lib_name, "created task state");
        Ok(id)
    }

    /// Publish an already-built state instance. Used for the admin state,
    /// which exists before any library runs.
    pub(crate) fn install_state(&self, state: Arc<dyn TaskState>) {
        let id = state.id();
        self.state_ids
            .write()
            .unwrap()
            .insert(state.name().to_string(), id);
        self.states.write().unwrap().insert(id, state);
    }

    /// Drop a state instance and its name binding. The library stays loaded.
    pub fn destroy_state(&self, id: TaskStateId) {
        let Some(state) = self.states.write().unwrap().remove(&id) else {
            tracing::warn!(%id, "destroy of unknown task state ignored");
            return;
        };
        self.state_ids.write().unwrap().remove(state.name());
        tracing::info!(state = state.name(), %id, "destroyed task state");
    }
}

impl core::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("node_id", &self.node_id)
            .field("lib_dirs", &self.lib_dirs)
            .finish_non_exhaustive()
    }
}

/// Emit the `create_state` / `get_task_lib_name` plugin entry points and a
/// [`StaticTaskLib`] descriptor for in-process registration.
///
/// The server type must provide
/// `fn new(&Runtime, StateDesc, Option<TaskRef>) -> Self`.
///
/// The unmangled export names only exist when the crate's `plugin-export`
/// feature is on — that is what the cdylib build enables. Without it the
/// entry points are ordinary (mangled) functions, so any number of task
/// libraries can be linked into one binary and registered statically.
#[macro_export]
macro_rules! declare_task_lib {
    ($server:ty, $name:literal) => {
        #[cfg_attr(feature = "plugin-export", unsafe(export_name = "create_state"))]
        pub fn create_state(
            rt: &$crate::Runtime,
            desc: $crate::StateDesc,
            ctor: Option<$crate::TaskRef>,
        ) -> Box<dyn $crate::TaskState> {
            Box::new(<$server>::new(rt, desc, ctor))
        }

        #[cfg_attr(
            feature = "plugin-export",
            unsafe(export_name = "get_task_lib_name")
        )]
        pub fn get_task_lib_name() -> &'static str {
            $name
        }

        /// Descriptor for registering this library without `dlopen`.
        pub fn task_lib() -> $crate::registry::StaticTaskLib {
            $crate::registry::StaticTaskLib {
                name: $name,
                create_state,
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TaskRegistry {
        TaskRegistry::new(1)
    }

    #[test]
    fn get_or_create_is_idempotent_across_threads() {
        let reg = std::sync::Arc::new(registry());
        let ids: Vec<_> = std::thread::scope(|s| {
            (0..8)
                .map(|_| {
                    let reg = reg.clone();
                    s.spawn(move || reg.get_or_create_state_id("svc"))
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect()
        });
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(reg.get_state_id("svc"), ids[0]);
    }

    #[test]
    fn unknown_names_resolve_to_null() {
        let reg = registry();
        assert!(reg.get_state_id("nope").is_null());
        reg.destroy_state(TaskStateId::new(1, 99));
        reg.destroy_lib("nope");
    }

    #[test]
    fn fresh_ids_are_monotonic_and_nonzero() {
        let reg = registry();
        let a = reg.create_state_id();
        let b = reg.create_state_id();
        assert!(a.unique >= 1);
        assert!(b.unique > a.unique);
    }

    #[test]
    fn missing_library_is_not_found() {
        let reg = registry();
        assert!(matches!(
            reg.register_lib("no_such_strata_lib"),
            Err(RuntimeError::NotFound(_))
        ));
    }
}
