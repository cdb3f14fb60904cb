// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! # strata-runtime
//!
//! The core of a user-space task-execution runtime for high-throughput,
//! low-latency I/O services. Client processes and a runtime daemon share a
//! memory region; clients allocate task objects there, enqueue them into
//! multi-lane queues, and a pool of dedicated worker threads drains those
//! queues, dispatching each task to the named task state that owns it.
//!
//! The crate provides:
//!
//! - the shared-memory queue manager ([`queue`]),
//! - the task model ([`task`]),
//! - the task registry ([`registry`]),
//! - the work orchestrator and its workers ([`orchestrator`], [`worker`]),
//! - the task wire format and the RPC transport contract ([`net`]).
//!
//! Services plug in as *task states* (see [`TaskState`]) packaged in task
//! libraries; the admin surface, the remote-dispatch plugin, and the
//! scheduling policies live in sibling crates under `tasks/`.

pub mod client;
pub mod config;
pub mod error;
pub mod net;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod shmem;
pub mod task;
pub mod types;
pub mod worker;

pub use client::{AttachedClient, Client, TypedTask};
pub use config::{ClientConfig, ServerConfig};
pub use error::{Result, RuntimeError};
pub use runtime::{RemoteDispatcher, Runtime, RuntimeBuilder};
pub use task::{
    GroupDisposition, GroupKey, SrlShape, StateDesc, Task, TaskFlags, TaskPayload, TaskRef,
    TaskSerde, TaskState, method,
};
pub use types::{BlobId, DomainId, NodeId, QueueId, TaskId, TaskNode, TaskStateId, UniqueId};
