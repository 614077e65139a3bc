/*
 * debboost - Concurrent package downloader and mirror ranking engine.
 * Copyright (C) 2025  compiledkernel-idk and debboost contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Concurrent download engine with per-mirror connection limits,
//! mirror fallback and integrity verification.

pub mod hash;
pub mod mirror;
pub mod observer;
pub mod scheduler;
pub mod task;
pub mod transport;
pub mod uris;
pub mod worker;

pub use hash::{ExpectedHashes, HashAlgorithm};
pub use mirror::{mirror_origin, MirrorPool, MirrorSlot, MirrorStatsSnapshot};
pub use observer::{NoopObserver, Observer};
pub use scheduler::{AttemptRecord, BatchReport, Scheduler, TaskOutcome};
pub use task::{DownloadTask, TaskSpec, TaskState};
pub use transport::{HttpSettings, HttpTransport, TransferBody, Transport};

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine-facing download settings
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Maximum simultaneous transfers against one mirror origin
    pub per_mirror_limit: usize,
    /// Maximum simultaneous transfers across all mirrors
    pub global_limit: usize,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Time allowed for a mirror to answer a request
    pub attempt_timeout: Duration,
    /// Time allowed between two body chunks
    pub stall_timeout: Duration,
    /// Accept artifacts that carry no hash
    pub allow_unauthenticated: bool,
    /// Cancel the batch on the first failed task
    pub fail_fast: bool,
    /// Directory for in-progress files; next to the destination when unset
    pub partial_dir: Option<PathBuf>,
    pub proxy: Option<String>,
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            per_mirror_limit: 3,
            global_limit: 16,
            connect_timeout: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(30),
            stall_timeout: Duration::from_secs(30),
            allow_unauthenticated: false,
            fail_fast: false,
            partial_dir: None,
            proxy: None,
            user_agent: format!("debboost/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl DownloadConfig {
    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            user_agent: self.user_agent.clone(),
            connect_timeout: self.connect_timeout,
            proxy: self.proxy.clone(),
        }
    }

    /// Where a transfer for `destination` is written before the rename
    pub fn partial_path(&self, destination: &Path) -> PathBuf {
        let file_name = destination
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "download".into());

        match &self.partial_dir {
            // Keyed on the whole destination so equal file names never share a partial
            Some(dir) => {
                let digest = Sha256::digest(destination.to_string_lossy().as_bytes());
                let mut name = file_name;
                name.push(format!(".{}", &hex::encode(digest)[..16]));
                dir.join(name)
            }
            None => {
                let mut name = file_name;
                name.push(".part");
                destination.with_file_name(name)
            }
        }
    }
}
