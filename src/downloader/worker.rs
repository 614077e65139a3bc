/*
 * debboost - Concurrent package downloader and mirror ranking engine.
 * Copyright (C) 2025  compiledkernel-idk and debboost contributors
 */

//! Transfer worker: stream one candidate URI to disk and verify it.

use super::hash::{digests_match, hash_file};
use super::observer::Observer;
use super::task::DownloadTask;
use super::transport::Transport;
use super::DownloadConfig;
use crate::error::TransferError;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Result of a verified transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSuccess {
    pub bytes: u64,
    /// False when the task carried no hash
    pub authenticated: bool,
}

/// Temporary file removed on drop unless persisted
#[derive(Debug)]
pub struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move the file to `destination` and disarm the guard
    pub async fn persist(mut self, destination: &Path) -> Result<(), TransferError> {
        fs::rename(&self.path, destination)
            .await
            .map_err(|e| TransferError::io(destination, e))?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

async fn ensure_parent(path: &Path) -> Result<(), TransferError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| TransferError::io(parent, e))?;
    }
    Ok(())
}

/// Fetch `task` from `uri` into its destination
///
/// The body is written to the partial path, checked against the expected
/// size and the strongest expected hash, then renamed into place. Any early
/// return removes the partial file.
pub async fn transfer(
    transport: &dyn Transport,
    task: &DownloadTask,
    uri: &str,
    config: &DownloadConfig,
    observer: &dyn Observer,
    cancel: &CancellationToken,
) -> Result<TransferSuccess, TransferError> {
    let file_name = task.display_name();

    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        opened = timeout(config.attempt_timeout, transport.open(uri)) => opened,
    };
    let mut body = match opened {
        Ok(body) => body?,
        Err(_) => {
            return Err(TransferError::Timeout {
                uri: uri.to_string(),
            })
        }
    };

    let content_length = body.content_length.ok_or_else(|| TransferError::NoContentLength {
        uri: uri.to_string(),
    })?;
    observer.started(task, uri, Some(content_length));

    let partial = config.partial_path(&task.destination);
    ensure_parent(&partial).await?;
    ensure_parent(&task.destination).await?;

    let guard = TempFileGuard::new(partial);
    let mut file = File::create(guard.path())
        .await
        .map_err(|e| TransferError::io(guard.path(), e))?;

    let strongest = task.expected_hashes.strongest();
    let mut hasher = strongest.map(|(algorithm, _)| algorithm.hasher());
    let mut received = 0u64;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            next = timeout(config.stall_timeout, body.stream.next()) => next,
        };

        match next {
            Ok(Some(Ok(chunk))) => {
                file.write_all(&chunk)
                    .await
                    .map_err(|e| TransferError::io(guard.path(), e))?;
                if let Some(hasher) = hasher.as_mut() {
                    hasher.update(&chunk);
                }
                received += chunk.len() as u64;
                observer.progress(task, received);
            }
            Ok(Some(Err(e))) => return Err(e),
            Ok(None) => break,
            Err(_) => {
                debug!(uri, received, "download stalled");
                return Err(TransferError::Timeout {
                    uri: uri.to_string(),
                });
            }
        }
    }

    file.flush()
        .await
        .map_err(|e| TransferError::io(guard.path(), e))?;
    drop(file);

    observer.verifying(task, uri);

    // Mirrors occasionally close the connection before the advertised end
    if received != content_length {
        return Err(TransferError::Connection {
            uri: uri.to_string(),
            message: format!(
                "connection closed after {} of {} bytes",
                received, content_length
            ),
        });
    }

    if let Some(expected) = task.expected_size {
        if received != expected {
            return Err(TransferError::SizeMismatch {
                file: file_name,
                expected,
                received,
            });
        }
    }

    let authenticated = match (strongest, hasher) {
        (Some((algorithm, expected)), Some(hasher)) => {
            let digest = hasher.finalize_hex();
            if !digests_match(expected, &digest) {
                return Err(TransferError::HashMismatch {
                    file: file_name,
                    algorithm: algorithm.name().to_string(),
                    expected: expected.to_string(),
                    received: digest,
                });
            }
            true
        }
        _ => false,
    };

    guard.persist(&task.destination).await?;
    observer.completed(task, uri);

    Ok(TransferSuccess {
        bytes: received,
        authenticated,
    })
}

/// Check a destination that already exists before downloading it again
///
/// Returns true when the file matches the expected size and hash. A file
/// that fails verification is removed. Files of tasks without a hash are
/// never trusted.
pub async fn verify_existing(task: &DownloadTask) -> Result<bool, TransferError> {
    let path = &task.destination;
    let metadata = match fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => metadata,
        _ => return Ok(false),
    };

    let Some((algorithm, expected)) = task.expected_hashes.strongest() else {
        return Ok(false);
    };

    let size_ok = task
        .expected_size
        .map_or(true, |size| metadata.len() == size);
    let hash_ok = size_ok
        && hash_file(path, algorithm)
            .await
            .map(|digest| digests_match(expected, &digest))
            .map_err(|e| TransferError::io(path, e))?;

    if !hash_ok {
        warn!(file = %path.display(), "existing file failed verification, removing");
        fs::remove_file(path)
            .await
            .map_err(|e| TransferError::io(path, e))?;
    }
    Ok(hash_ok)
}
