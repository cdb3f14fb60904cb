// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Runtime configuration.
//!
//! Two YAML documents drive the system: the *server* configuration consumed
//! by the daemon, and the much smaller *client* configuration consumed by
//! every attaching process. Paths come from the caller or, failing that, the
//! `SERVER_CONF` / `CLIENT_CONF` environment variables; if neither exists the
//! built-in defaults apply.

use crate::error::{Result, RuntimeError};
use serde::Deserialize;
use std::path::Path;

pub const SERVER_CONF_ENV: &str = "SERVER_CONF";
pub const CLIENT_CONF_ENV: &str = "CLIENT_CONF";

/// Daemon-side configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Number of worker threads to spawn.
    pub max_workers: usize,
    /// Maximum request size unit, in bytes. Accepts suffixed strings.
    #[serde(deserialize_with = "de_size")]
    pub request_unit: u64,
    /// Depth of every lane in every queue.
    pub queue_depth: u32,
    /// Maximum number of queues in the shared-memory directory.
    pub max_queues: u32,
    /// Default maximum lane count for queues created without an override.
    pub max_lanes: u32,
    /// Name of the shared-memory allocator to instantiate.
    pub shm_allocator: String,
    /// Name of the shared-memory region.
    pub shm_name: String,
    /// Size of the shared-memory region, in bytes. Accepts suffixed strings.
    #[serde(deserialize_with = "de_size")]
    pub shm_size: u64,
    /// Task libraries to load at startup, resolved against the registry
    /// search path.
    pub task_libs: Vec<String>,
    pub rpc: RpcConfig,
}

/// RPC transport configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// A file containing one hostname per line; line order is cluster order.
    pub host_file: String,
    /// Hostnames given inline. Ignored when `host_file` is set.
    pub host_names: Vec<String>,
    /// Transport protocol name, passed through to the RPC engine.
    pub protocol: String,
    /// Transport domain, passed through to the RPC engine.
    pub domain: String,
    pub port: u16,
}

/// Client-side configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Thread model the client's `wait` yields through.
    pub thread_model: String,
}

// === impl ServerConfig ===

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            request_unit: 64 * 1024,
            queue_depth: 256,
            max_queues: 1024,
            max_lanes: 16,
            shm_allocator: "freelist".to_string(),
            shm_name: "strata_shm".to_string(),
            shm_size: 64 * 1024 * 1024,
            task_libs: Vec::new(),
            rpc: RpcConfig::default(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            host_file: String::new(),
            host_names: vec!["localhost".to_string()],
            protocol: "tcp".to_string(),
            domain: String::new(),
            port: 9413,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            thread_model: "pthread".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load from `path`, from `$SERVER_CONF`, or fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        load_config(path, SERVER_CONF_ENV)
    }
}

impl ClientConfig {
    /// Load from `path`, from `$CLIENT_CONF`, or fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        load_config(path, CLIENT_CONF_ENV)
    }
}

fn load_config<T: Default + for<'de> Deserialize<'de>>(
    path: Option<&Path>,
    env: &str,
) -> Result<T> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match std::env::var(env) {
            Ok(path) if !path.is_empty() => path.into(),
            _ => return Ok(T::default()),
        },
    };
    let text = std::fs::read_to_string(&path)?;
    serde_yaml::from_str(&text).map_err(|err| RuntimeError::Config(err.to_string()))
}

/// Parse a byte size that may carry a `k`/`m`/`g`/`t` suffix.
pub fn parse_size(text: &str) -> Result<u64> {
    let text = text.trim();
    let split = text.find(|c: char| !c.is_ascii_digit()).unwrap_or(text.len());
    let (digits, suffix) = text.split_at(split);
    let base: u64 = digits
        .parse()
        .map_err(|_| RuntimeError::Config(format!("bad size: {text:?}")))?;
    let mult = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1 << 10,
        "m" | "mb" => 1 << 20,
        "g" | "gb" => 1 << 30,
        "t" | "tb" => 1 << 40,
        other => {
            return Err(RuntimeError::Config(format!("bad size suffix: {other:?}")));
        }
    };
    Ok(base * mult)
}

fn de_size<'de, D>(de: D) -> core::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Text(String),
    }

    match Raw::deserialize(de)? {
        Raw::Num(n) => Ok(n),
        Raw::Text(text) => parse_size(&text).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_accept_suffixes() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("64k").unwrap(), 64 << 10);
        assert_eq!(parse_size("1g").unwrap(), 1 << 30);
        assert!(parse_size("12q").is_err());
    }

    const SERVER_YAML: &str = r#"
max_workers: 2
queue_depth: 128
shm_name: strata_test
shm_size: 16m
rpc:
  host_names: [nodea, nodeb]
  port: 9000
"#;

    #[test]
    fn server_config_parses() {
        let conf: ServerConfig = serde_yaml::from_str(SERVER_YAML).unwrap();
        assert_eq!(conf.max_workers, 2);
        assert_eq!(conf.queue_depth, 128);
        assert_eq!(conf.shm_size, 16 << 20);
        assert_eq!(conf.rpc.host_names, vec!["nodea", "nodeb"]);
        // unset fields keep their defaults
        assert_eq!(conf.max_queues, 1024);
    }

    #[test]
    fn server_config_loads_from_disk() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SERVER_YAML.as_bytes()).unwrap();
        let conf = ServerConfig::load(Some(file.path())).unwrap();
        assert_eq!(conf.max_workers, 2);
        assert_eq!(conf.rpc.port, 9000);
    }

    #[test]
    fn client_config_loads_from_disk() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"thread_model: argobots\n").unwrap();
        let conf = ClientConfig::load(Some(file.path())).unwrap();
        assert_eq!(conf.thread_model, "argobots");
    }

    #[test]
    fn missing_file_is_an_error_but_no_path_is_defaults() {
        assert!(ServerConfig::load(Some(std::path::Path::new("/no/such/strata.yaml"))).is_err());
        let conf = ServerConfig::load(None).unwrap();
        assert_eq!(conf.queue_depth, 256);
    }
}
