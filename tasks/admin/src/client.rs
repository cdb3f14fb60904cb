// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::tasks::{
    CreateTaskStateTask, DestroyTaskStateTask, GetTaskStateIdTask, QueueParams,
    RegisterTaskLibTask, SetPolicyTask, StopRuntimeTask, method,
};
use strata_runtime::{Client, DomainId, Result, RuntimeError, TaskPayload, TaskStateId, TypedTask};

/// Client wrapper for the admin surface. Every call allocates the task in
/// shared memory, posts it to lane 0 of the admin queue, and spins on
/// completion.
#[derive(Debug, Clone, Copy)]
pub struct AdminClient {
    client: Client,
}

// === impl AdminClient ===

impl AdminClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn call<T: TaskPayload>(&self, task: T) -> Result<TypedTask<T>> {
        let typed = self.client.new_task(task)?;
        let queue = self
            .client
            .get_queue(self.client.queues().admin_queue_id())
            .ok_or_else(|| RuntimeError::NotFound("admin queue".into()))?;
        self.client.emplace(queue, typed.task_ref());
        self.client.wait(typed.task_ref());
        Ok(typed)
    }

    pub fn register_task_lib(&self, domain: DomainId, lib_name: &str) -> Result<()> {
        let node = self.client.make_task_node();
        let task = self.call(RegisterTaskLibTask::new(
            &self.client,
            node,
            domain,
            method::REGISTER_TASK_LIB,
            lib_name,
        )?)?;
        self.client.del_task(task);
        Ok(())
    }

    pub fn destroy_task_lib(&self, domain: DomainId, lib_name: &str) -> Result<()> {
        let node = self.client.make_task_node();
        let task = self.call(RegisterTaskLibTask::new(
            &self.client,
            node,
            domain,
            method::DESTROY_TASK_LIB,
            lib_name,
        )?)?;
        self.client.del_task(task);
        Ok(())
    }

    /// Create a task state (and its queue); returns the bound id, which is
    /// null when creation failed.
    pub fn create_task_state(
        &self,
        domain: DomainId,
        lib_name: &str,
        state_name: &str,
        id: Option<TaskStateId>,
        queue: QueueParams,
    ) -> Result<TaskStateId> {
        let node = self.client.make_task_node();
        let task = self.call(CreateTaskStateTask::new(
            &self.client,
            node,
            domain,
            lib_name,
            state_name,
            id,
            queue,
        )?)?;
        let id = task.get().id;
        self.client.del_task(task);
        Ok(id)
    }

    pub fn get_task_state_id(&self, domain: DomainId, state_name: &str) -> Result<TaskStateId> {
        self.state_id_call(domain, state_name, method::GET_TASK_STATE_ID)
    }

    pub fn get_or_create_task_state_id(
        &self,
        domain: DomainId,
        state_name: &str,
    ) -> Result<TaskStateId> {
        self.state_id_call(domain, state_name, method::GET_OR_CREATE_TASK_STATE_ID)
    }

    fn state_id_call(
        &self,
        domain: DomainId,
        state_name: &str,
        method: u32,
    ) -> Result<TaskStateId> {
        let node = self.client.make_task_node();
        let task = self.call(GetTaskStateIdTask::new(
            &self.client,
            node,
            domain,
            method,
            state_name,
        )?)?;
        let id = task.get().id;
        self.client.del_task(task);
        Ok(id)
    }

    pub fn destroy_task_state(&self, domain: DomainId, id: TaskStateId) -> Result<()> {
        let node = self.client.make_task_node();
        let task = self.call(DestroyTaskStateTask::new(&self.client, node, domain, id))?;
        self.client.del_task(task);
        Ok(())
    }

    pub fn stop_runtime(&self, domain: DomainId) -> Result<()> {
        let node = self.client.make_task_node();
        let task = self.call(StopRuntimeTask::new(&self.client, node, domain))?;
        self.client.del_task(task);
        Ok(())
    }

    pub fn set_work_orchestrator_queue_policy(
        &self,
        domain: DomainId,
        policy_id: TaskStateId,
    ) -> Result<()> {
        let node = self.client.make_task_node();
        let task = self.call(SetPolicyTask::new(
            &self.client,
            node,
            domain,
            method::SET_QUEUE_POLICY,
            policy_id,
        ))?;
        self.client.del_task(task);
        Ok(())
    }

    pub fn set_work_orchestrator_process_policy(
        &self,
        domain: DomainId,
        policy_id: TaskStateId,
    ) -> Result<()> {
        let node = self.client.make_task_node();
        let task = self.call(SetPolicyTask::new(
            &self.client,
            node,
            domain,
            method::SET_PROCESS_POLICY,
            policy_id,
        ))?;
        self.client.del_task(task);
        Ok(())
    }
}
