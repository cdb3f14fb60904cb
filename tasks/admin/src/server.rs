// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::tasks::{
    CreateQueueTask, CreateTaskStateTask, DestroyQueueTask, DestroyTaskStateTask,
    GetTaskStateIdTask, RegisterTaskLibTask, SetPolicyTask, StopRuntimeTask, method,
};
use strata_runtime::net::serialize::{BinaryInputArchive, BinaryOutputArchive};
use strata_runtime::queue::{MultiQueue, QueueFlags};
use strata_runtime::{
    Client, Result, Runtime, StateDesc, TaskRef, TaskSerde, TaskState, TaskStateId,
};

/// The admin state: id `(node, 0)`, owner of the admin queue, host of the
/// runtime's management surface.
pub struct Server {
    desc: StateDesc,
    client: Client,
}

// === impl Server ===

impl Server {
    pub fn new(rt: &Runtime, desc: StateDesc, _ctor: Option<TaskRef>) -> Self {
        Self {
            desc,
            client: rt.client(),
        }
    }

    fn register_task_lib(&self, rt: &Runtime, task: &mut RegisterTaskLibTask) {
        let name = task.lib_name.to_string(self.client.alloc());
        task.id = TaskStateId::null();
        if let Err(err) = rt.registry().register_lib(&name) {
            tracing::error!(lib = %name, %err, "failed to register task library");
        }
    }

    fn destroy_task_lib(&self, rt: &Runtime, task: &mut RegisterTaskLibTask) {
        let name = task.lib_name.to_string(self.client.alloc());
        rt.registry().destroy_lib(&name);
    }

    fn create_task_state(&self, rt: &Runtime, task_ref: TaskRef, task: &mut CreateTaskStateTask) {
        let lib = task.lib_name.to_string(self.client.alloc());
        let name = task.state_name.to_string(self.client.alloc());
        let config = rt.config();
        let max_lanes = if task.max_lanes == 0 {
            config.max_lanes
        } else {
            task.max_lanes
        };
        let num_lanes = if task.num_lanes == 0 {
            max_lanes
        } else {
            task.num_lanes
        };
        let depth = if task.depth == 0 {
            config.queue_depth
        } else {
            task.depth
        };
        let id = (!task.id.is_null()).then_some(task.id);

        task.id = rt
            .create_service(
                &lib,
                &name,
                id,
                max_lanes,
                num_lanes,
                depth,
                QueueFlags::from_bits_truncate(task.queue_flags),
                Some(task_ref),
            )
            .unwrap_or_else(|err| {
                tracing::error!(state = %name, lib = %lib, %err, "failed to create task state");
                TaskStateId::null()
            });
    }

    fn set_queue_policy(&self, rt: &Runtime, task: &mut SetPolicyTask) -> bool {
        match rt.install_queue_policy(task.policy_id) {
            Ok(installed) => installed,
            Err(err) => {
                tracing::error!(policy = %task.policy_id, %err, "failed to install queue policy");
                task.task.set_failed();
                true
            }
        }
    }

    fn set_process_policy(&self, rt: &Runtime, task: &mut SetPolicyTask) -> bool {
        match rt.install_process_policy(task.policy_id) {
            Ok(installed) => installed,
            Err(err) => {
                tracing::error!(policy = %task.policy_id, %err, "failed to install process policy");
                task.task.set_failed();
                true
            }
        }
    }
}

fn load_replica<T: TaskSerde>(
    client: &Client,
    make: impl FnOnce() -> T,
    ar: &mut BinaryInputArchive<'_>,
) -> Result<TaskRef> {
    let mut typed = client.new_task(make())?;
    typed.get_mut().load_start(ar, client.alloc());
    Ok(typed.task_ref())
}

impl TaskState for Server {
    fn id(&self) -> TaskStateId {
        self.desc.id
    }

    fn name(&self) -> &str {
        &self.desc.name
    }

    fn run(&self, rt: &Runtime, _queue: MultiQueue, method_id: u32, task: TaskRef) {
        match method_id {
            method::CONSTRUCT | method::DESTRUCT => {}
            method::REGISTER_TASK_LIB => {
                // Safety: method codes key the payload type.
                self.register_task_lib(rt, unsafe { task.downcast() });
            }
            method::DESTROY_TASK_LIB => {
                // Safety: as above.
                self.destroy_task_lib(rt, unsafe { task.downcast() });
            }
            method::CREATE_TASK_STATE => {
                // Safety: as above.
                self.create_task_state(rt, task, unsafe { task.downcast() });
            }
            method::GET_OR_CREATE_TASK_STATE_ID => {
                // Safety: as above.
                let t: &mut GetTaskStateIdTask = unsafe { task.downcast() };
                let name = t.state_name.to_string(self.client.alloc());
                t.id = rt.registry().get_or_create_state_id(&name);
            }
            method::GET_TASK_STATE_ID => {
                // Safety: as above.
                let t: &mut GetTaskStateIdTask = unsafe { task.downcast() };
                let name = t.state_name.to_string(self.client.alloc());
                t.id = rt.registry().get_state_id(&name);
            }
            method::DESTROY_TASK_STATE => {
                // Safety: as above.
                let t: &mut DestroyTaskStateTask = unsafe { task.downcast() };
                rt.destroy_service(t.id);
            }
            method::STOP_RUNTIME => {
                tracing::info!(node = rt.node_id(), "stop requested");
                rt.orchestrator().finalize();
            }
            method::SET_QUEUE_POLICY => {
                // Safety: as above.
                if !self.set_queue_policy(rt, unsafe { task.downcast() }) {
                    // Predecessor still draining; leave the task queued so
                    // the install is retried on the next visit.
                    return;
                }
            }
            method::SET_PROCESS_POLICY => {
                // Safety: as above.
                if !self.set_process_policy(rt, unsafe { task.downcast() }) {
                    return;
                }
            }
            method::CREATE_QUEUE => {
                // Safety: as above.
                let t: &mut CreateQueueTask = unsafe { task.downcast() };
                if let Err(err) = rt.queues().create_queue(
                    t.id,
                    t.max_lanes,
                    t.num_lanes,
                    t.depth,
                    QueueFlags::from_bits_truncate(t.flags),
                ) {
                    tracing::error!(queue = %t.id, %err, "failed to create queue");
                    task.header().set_failed();
                }
            }
            method::DESTROY_QUEUE => {
                // Safety: as above.
                let t: &mut DestroyQueueTask = unsafe { task.downcast() };
                rt.queues().destroy_queue(t.id);
            }
            unknown => {
                tracing::error!(state = self.name(), method = unknown, "unknown admin method");
            }
        }
        task.header().set_module_complete();
    }

    fn save_start(&self, method_id: u32, ar: &mut BinaryOutputArchive, task: TaskRef) {
        let alloc = self.client.alloc();
        // Safety (all arms): method codes key the payload type.
        match method_id {
            method::REGISTER_TASK_LIB | method::DESTROY_TASK_LIB => unsafe {
                task.downcast::<RegisterTaskLibTask>().save_start(ar, alloc);
            },
            method::CREATE_TASK_STATE => unsafe {
                task.downcast::<CreateTaskStateTask>().save_start(ar, alloc);
            },
            method::GET_OR_CREATE_TASK_STATE_ID | method::GET_TASK_STATE_ID => unsafe {
                task.downcast::<GetTaskStateIdTask>().save_start(ar, alloc);
            },
            method::DESTROY_TASK_STATE => unsafe {
                task.downcast::<DestroyTaskStateTask>().save_start(ar, alloc);
            },
            method::STOP_RUNTIME => unsafe {
                task.downcast::<StopRuntimeTask>().save_start(ar, alloc);
            },
            method::SET_QUEUE_POLICY | method::SET_PROCESS_POLICY => unsafe {
                task.downcast::<SetPolicyTask>().save_start(ar, alloc);
            },
            method::CREATE_QUEUE => unsafe {
                task.downcast::<CreateQueueTask>().save_start(ar, alloc);
            },
            method::DESTROY_QUEUE => unsafe {
                task.downcast::<DestroyQueueTask>().save_start(ar, alloc);
            },
            unknown => tracing::error!(method = unknown, "cannot serialize unknown admin method"),
        }
    }

    fn load_start(
        &self,
        method_id: u32,
        ar: &mut BinaryInputArchive<'_>,
        client: &Client,
    ) -> Result<TaskRef> {
        match method_id {
            method::REGISTER_TASK_LIB | method::DESTROY_TASK_LIB => {
                load_replica(client, RegisterTaskLibTask::replica, ar)
            }
            method::CREATE_TASK_STATE => load_replica(client, CreateTaskStateTask::replica, ar),
            method::GET_OR_CREATE_TASK_STATE_ID | method::GET_TASK_STATE_ID => {
                load_replica(client, GetTaskStateIdTask::replica, ar)
            }
            method::DESTROY_TASK_STATE => load_replica(client, DestroyTaskStateTask::replica, ar),
            method::STOP_RUNTIME => load_replica(client, StopRuntimeTask::replica, ar),
            method::SET_QUEUE_POLICY | method::SET_PROCESS_POLICY => {
                load_replica(client, SetPolicyTask::replica, ar)
            }
            method::CREATE_QUEUE => load_replica(client, CreateQueueTask::replica, ar),
            method::DESTROY_QUEUE => load_replica(client, DestroyQueueTask::replica, ar),
            unknown => Err(strata_runtime::RuntimeError::Protocol(format!(
                "unknown admin method {unknown}"
            ))),
        }
    }

    fn save_end(&self, method_id: u32, ar: &mut BinaryOutputArchive, task: TaskRef) {
        let alloc = self.client.alloc();
        // Safety (all arms): method codes key the payload type.
        match method_id {
            method::REGISTER_TASK_LIB | method::DESTROY_TASK_LIB => unsafe {
                task.downcast::<RegisterTaskLibTask>().serialize_end(ar, alloc);
            },
            method::CREATE_TASK_STATE => unsafe {
                task.downcast::<CreateTaskStateTask>().serialize_end(ar, alloc);
            },
            method::GET_OR_CREATE_TASK_STATE_ID | method::GET_TASK_STATE_ID => unsafe {
                task.downcast::<GetTaskStateIdTask>().serialize_end(ar, alloc);
            },
            _ => {}
        }
    }

    fn load_end(
        &self,
        _replica: u32,
        method_id: u32,
        ar: &mut BinaryInputArchive<'_>,
        task: TaskRef,
    ) {
        let alloc = self.client.alloc();
        // Safety (all arms): method codes key the payload type.
        match method_id {
            method::REGISTER_TASK_LIB | method::DESTROY_TASK_LIB => unsafe {
                task.downcast::<RegisterTaskLibTask>().serialize_end(ar, alloc);
            },
            method::CREATE_TASK_STATE => unsafe {
                task.downcast::<CreateTaskStateTask>().serialize_end(ar, alloc);
            },
            method::GET_OR_CREATE_TASK_STATE_ID | method::GET_TASK_STATE_ID => unsafe {
                task.downcast::<GetTaskStateIdTask>().serialize_end(ar, alloc);
            },
            _ => {}
        }
    }
}
