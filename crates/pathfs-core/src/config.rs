// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount options

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_MAX_WRITE_BYTES: u32 = 128 * 1024;
const MAX_SUPPORTED_WRITE_BYTES: u32 = 16 * 1024 * 1024;

/// Reply validity durations handed to the kernel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub attr_ttl_ms: u32,
    pub entry_ttl_ms: u32,
    /// Zero answers absent lookups with `ENOENT`; otherwise with a negative entry.
    pub negative_ttl_ms: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            attr_ttl_ms: 1000,
            entry_ttl_ms: 1000,
            negative_ttl_ms: 0,
        }
    }
}

impl CacheConfig {
    pub fn attr_ttl(&self) -> Duration {
        Duration::from_millis(u64::from(self.attr_ttl_ms))
    }

    pub fn entry_ttl(&self) -> Duration {
        Duration::from_millis(u64::from(self.entry_ttl_ms))
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_millis(u64::from(self.negative_ttl_ms))
    }
}

/// Options recognized by [`crate::server::mount`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// Trace every request and reply at debug level.
    pub debug: bool,
    /// Reject all mutating operations before they reach the backend.
    pub read_only: bool,
    pub fs_name: String,
    /// Worker pool size; `None` picks one from the environment or the CPU count.
    pub worker_threads: Option<usize>,
    pub max_write: u32,
    /// Upper bound on waiting for in-flight requests during unmount.
    pub drain_timeout_ms: Option<u64>,
    pub cache: CacheConfig,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            debug: false,
            read_only: false,
            fs_name: "pathfs".to_string(),
            worker_threads: None,
            max_write: DEFAULT_MAX_WRITE_BYTES,
            drain_timeout_ms: None,
            cache: CacheConfig::default(),
        }
    }
}

impl MountOptions {
    /// Load options from a JSON file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                let content = fs::read_to_string(path)?;
                let options: MountOptions = serde_json::from_str(&content)?;
                Ok(options)
            }
            None => Ok(MountOptions::default()),
        }
    }

    /// Apply `PATHFS_DEBUG` and `PATHFS_WORKER_THREADS` overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if env_flag("PATHFS_DEBUG") {
            self.debug = true;
        }
        if let Some(threads) = std::env::var("PATHFS_WORKER_THREADS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n > 0)
        {
            self.worker_threads = Some(threads);
        }
        self
    }

    pub fn worker_count(&self) -> usize {
        self.worker_threads
            .filter(|n| *n > 0)
            .unwrap_or_else(|| thread::available_parallelism().map(|p| p.get()).unwrap_or(1).max(2))
    }

    pub fn effective_max_write(&self) -> u32 {
        self.max_write.clamp(4096, MAX_SUPPORTED_WRITE_BYTES)
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_ms.map(Duration::from_millis)
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
