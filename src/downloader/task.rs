/*
 * debboost - Concurrent package downloader and mirror ranking engine.
 * Copyright (C) 2025  compiledkernel-idk and debboost contributors
 */

//! Download tasks and their lifecycle states.

use super::hash::{ExpectedHashes, HashAlgorithm};
use crate::error::{DebboostError, DebboostResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One artifact to fetch from any of several equivalent locations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    /// Candidate URIs in preference order
    pub candidate_uris: Vec<String>,
    pub destination: PathBuf,
    pub expected_size: Option<u64>,
    pub expected_hashes: ExpectedHashes,
}

/// Lifecycle of a task while the scheduler owns it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InFlight,
    Verifying,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl DownloadTask {
    pub fn new(candidate_uris: Vec<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            candidate_uris,
            destination: destination.into(),
            expected_size: None,
            expected_hashes: ExpectedHashes::new(),
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    pub fn with_hashes(mut self, hashes: ExpectedHashes) -> Self {
        self.expected_hashes = hashes;
        self
    }

    /// File name used in messages
    pub fn display_name(&self) -> String {
        self.destination
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.destination.display().to_string())
    }

    /// Whether verification can prove the artifact's identity
    pub fn is_authenticated(&self) -> bool {
        !self.expected_hashes.is_empty()
    }

    /// Parse `scheme://host/path/file.deb[:ALGORITHM:DIGEST]`
    ///
    /// The file is saved under `dir` using the last path segment of the URI.
    pub fn from_inline(spec: &str, dir: &Path) -> DebboostResult<Self> {
        let invalid = |reason: &str| DebboostError::InvalidUri {
            uri: spec.to_string(),
            reason: reason.to_string(),
        };

        let (uri, hashes) = split_inline_hash(spec)?;
        let parsed = url::Url::parse(uri).map_err(|e| invalid(&e.to_string()))?;
        if parsed.host_str().is_none() {
            return Err(invalid("missing host"));
        }

        let file_name = parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| invalid("no file name in path"))?;

        let mut task = DownloadTask::new(vec![uri.to_string()], dir.join(file_name));
        task.expected_hashes = hashes;
        Ok(task)
    }
}

fn split_inline_hash(spec: &str) -> DebboostResult<(&str, ExpectedHashes)> {
    let mut parts = spec.rsplitn(3, ':');
    let last = parts.next();
    let middle = parts.next();
    let head = parts.next();

    match (head, middle, last) {
        // A port or the scheme separator leaves a '/' in the trailing parts
        (Some(uri), Some(algorithm), Some(digest))
            if !algorithm.contains('/') && !digest.contains('/') && uri.contains("://") =>
        {
            let algorithm: HashAlgorithm = algorithm.parse()?;
            let hashes = ExpectedHashes::new().with(algorithm.name(), digest)?;
            Ok((uri, hashes))
        }
        _ => Ok((spec, ExpectedHashes::new())),
    }
}

/// Manifest entry accepted by the command line front end
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSpec {
    pub uris: Vec<String>,
    pub destination: PathBuf,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub hashes: HashMap<String, String>,
}

impl TaskSpec {
    /// Relative destinations are placed under `dir`
    pub fn into_task(self, dir: &Path) -> DebboostResult<DownloadTask> {
        let destination = if self.destination.is_absolute() {
            self.destination
        } else {
            dir.join(self.destination)
        };
        Ok(DownloadTask {
            candidate_uris: self.uris,
            destination,
            expected_size: self.size,
            expected_hashes: ExpectedHashes::from_map(&self.hashes)?,
        })
    }
}
