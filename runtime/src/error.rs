// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use thiserror::Error;

/// Errors surfaced by the runtime core.
///
/// The propagation policy is deliberately shallow: workers never propagate
/// errors across plugin calls, and admin-level failures complete the admin
/// task with a null result instead of aborting the runtime. These variants
/// therefore show up at API edges (client calls, transport callbacks), not in
/// the hot dispatch path.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Shared-memory allocation failed, a lane was full past the retry
    /// budget, or the queue directory is out of slots.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// A task state id, queue id, library name, or plugin symbol is missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// A name collision while creating a task state.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// An RPC call or bulk transfer failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed wire bytes, truncated payload, or an unknown method.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A plugin failed to load (missing file, missing symbol, wrong ABI).
    #[error("plugin error: {0}")]
    Plugin(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T, E = RuntimeError> = core::result::Result<T, E>;
