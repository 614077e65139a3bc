/*
 * debboost - Concurrent package downloader and mirror ranking engine.
 * Copyright (C) 2025  compiledkernel-idk and debboost contributors
 */

//! Progress hooks invoked by the scheduler and transfer workers.

use super::scheduler::TaskOutcome;
use super::task::{DownloadTask, TaskState};
use crate::error::ErrorKind;

/// Receives download events as they happen
///
/// Methods are called from worker tasks concurrently and must not block.
/// Every method has a no-op default so observers implement only what they draw.
pub trait Observer: Send + Sync {
    /// An attempt connected and the body is about to stream
    fn started(&self, _task: &DownloadTask, _uri: &str, _size: Option<u64>) {}

    /// Total bytes received so far in the current attempt
    fn progress(&self, _task: &DownloadTask, _bytes_done: u64) {}

    /// Body received, checking size and hash
    fn verifying(&self, _task: &DownloadTask, _uri: &str) {}

    fn completed(&self, _task: &DownloadTask, _uri: &str) {}

    /// One attempt failed; the task may still fall back to another mirror
    fn failed(&self, _task: &DownloadTask, _uri: &str, _kind: ErrorKind) {}

    /// The scheduler moved the task to `state`
    fn state_changed(&self, _task: &DownloadTask, _state: TaskState) {}

    /// The task reached a terminal state
    fn finished(&self, _outcome: &TaskOutcome) {}
}

/// Observer that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {}
