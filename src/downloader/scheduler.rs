/*
 * debboost - Concurrent package downloader and mirror ranking engine.
 * Copyright (C) 2025  compiledkernel-idk and debboost contributors
 */

//! Task scheduler: dispatches transfers round-robin across mirrors.

use super::mirror::{mirror_origin, MirrorPool, MirrorSlot, MirrorStatsSnapshot};
use super::observer::{NoopObserver, Observer};
use super::task::{DownloadTask, TaskState};
use super::transport::Transport;
use super::worker::{transfer, verify_existing, TransferSuccess};
use super::DownloadConfig;
use crate::error::{ErrorKind, TransferError};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// How long the dispatch loop sleeps when it holds no transfers but the
/// pool has no free slot for any queued mirror
const IDLE_BACKOFF: Duration = Duration::from_millis(25);

/// One attempt of a task against one candidate URI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub uri: String,
    /// `None` when the attempt succeeded
    pub error: Option<ErrorKind>,
    pub message: Option<String>,
}

/// Terminal result of one task
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub destination: PathBuf,
    pub state: TaskState,
    /// False when the artifact was accepted without a hash
    pub authenticated: bool,
    /// URI the file was finally fetched from
    pub mirror_used: Option<String>,
    pub attempts: Vec<AttemptRecord>,
    pub error: Option<ErrorKind>,
    pub message: Option<String>,
    pub bytes: u64,
    /// Destination already existed and verified, nothing was fetched
    pub cached: bool,
}

impl TaskOutcome {
    fn new(task: &DownloadTask, state: TaskState) -> Self {
        Self {
            destination: task.destination.clone(),
            state,
            authenticated: task.is_authenticated(),
            mirror_used: None,
            attempts: Vec::new(),
            error: None,
            message: None,
            bytes: 0,
            cached: false,
        }
    }

    fn failure(task: &DownloadTask, attempts: Vec<AttemptRecord>, error: &TransferError) -> Self {
        let state = match error {
            TransferError::Cancelled => TaskState::Cancelled,
            _ => TaskState::Failed,
        };
        Self {
            attempts,
            error: Some(error.kind()),
            message: Some(error.to_string()),
            ..Self::new(task, state)
        }
    }
}

/// Aggregate result of a batch, partitioned by terminal state
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub succeeded: Vec<TaskOutcome>,
    /// Succeeded without a hash because unauthenticated files were allowed
    pub unverified: Vec<TaskOutcome>,
    pub failed: Vec<TaskOutcome>,
    pub cancelled: Vec<TaskOutcome>,
    pub mirrors: Vec<MirrorStatsSnapshot>,
    pub elapsed_ms: u64,
}

impl BatchReport {
    fn push(&mut self, outcome: TaskOutcome) {
        match outcome.state {
            TaskState::Succeeded if !outcome.authenticated => self.unverified.push(outcome),
            TaskState::Succeeded => self.succeeded.push(outcome),
            TaskState::Cancelled => self.cancelled.push(outcome),
            _ => self.failed.push(outcome),
        }
    }

    /// True when every task succeeded
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.cancelled.is_empty()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.unverified.len() + self.failed.len() + self.cancelled.len()
    }

    /// Bytes fetched over the network
    pub fn bytes(&self) -> u64 {
        self.succeeded
            .iter()
            .chain(&self.unverified)
            .map(|outcome| outcome.bytes)
            .sum()
    }
}

/// Bookkeeping for one task while the batch runs
struct Entry {
    task: Arc<DownloadTask>,
    next_candidate: usize,
    attempts: Vec<AttemptRecord>,
    state: TaskState,
    outcome: Option<TaskOutcome>,
}

impl Entry {
    fn next_uri(&self) -> Option<&str> {
        self.task
            .candidate_uris
            .get(self.next_candidate)
            .map(String::as_str)
    }
}

type WorkerResult = (usize, String, Result<TransferSuccess, TransferError>, Duration);

/// Task id and attempt number of a transfer that reached verification
type Stage = (usize, usize);

/// Transfers running for the current batch
struct InFlight {
    workers: JoinSet<WorkerResult>,
    stages: mpsc::UnboundedSender<Stage>,
}

/// Forwards worker events and tells the run loop when verification starts
struct StageReporter {
    stage: Stage,
    stages: mpsc::UnboundedSender<Stage>,
    inner: Arc<dyn Observer>,
}

impl Observer for StageReporter {
    fn started(&self, task: &DownloadTask, uri: &str, size: Option<u64>) {
        self.inner.started(task, uri, size);
    }

    fn progress(&self, task: &DownloadTask, bytes_done: u64) {
        self.inner.progress(task, bytes_done);
    }

    fn verifying(&self, task: &DownloadTask, uri: &str) {
        // The run loop outlives every worker
        let _ = self.stages.send(self.stage);
        self.inner.verifying(task, uri);
    }

    fn completed(&self, task: &DownloadTask, uri: &str) {
        self.inner.completed(task, uri);
    }

    fn failed(&self, task: &DownloadTask, uri: &str, kind: ErrorKind) {
        self.inner.failed(task, uri, kind);
    }

    fn state_changed(&self, task: &DownloadTask, state: TaskState) {
        self.inner.state_changed(task, state);
    }

    fn finished(&self, outcome: &TaskOutcome) {
        self.inner.finished(outcome);
    }
}

/// Drives a batch of [`DownloadTask`]s to completion
pub struct Scheduler {
    transport: Arc<dyn Transport>,
    pool: Arc<MirrorPool>,
    observer: Arc<dyn Observer>,
    config: Arc<DownloadConfig>,
}

impl Scheduler {
    pub fn new(transport: Arc<dyn Transport>, config: DownloadConfig) -> Self {
        let pool = Arc::new(MirrorPool::new(config.per_mirror_limit, config.global_limit));
        Self {
            transport,
            pool,
            observer: Arc::new(NoopObserver),
            config: Arc::new(config),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    /// Run every task until it is terminal or `cancel` fires
    ///
    /// Individual results reach the observer as soon as they are known; the
    /// returned report lists them in the order the tasks were given.
    pub async fn run(&self, tasks: Vec<DownloadTask>, cancel: CancellationToken) -> BatchReport {
        let started = Instant::now();
        // Fail-fast cancels only this batch, never the caller's token
        let cancel = cancel.child_token();

        let mut entries: Vec<Entry> = tasks
            .into_iter()
            .map(|task| Entry {
                task: Arc::new(task),
                next_candidate: 0,
                attempts: Vec::new(),
                state: TaskState::Pending,
                outcome: None,
            })
            .collect();

        info!(tasks = entries.len(), "starting download batch");

        let mut queue = VecDeque::new();
        for id in self.admit(&mut entries).await {
            queue.push_back(id);
        }
        if self.config.fail_fast && entries.iter().any(|e| e.state == TaskState::Failed) {
            cancel.cancel();
        }

        // Larger files first so long transfers overlap the short ones; unknown sizes last
        queue
            .make_contiguous()
            .sort_by_key(|&id| Reverse(entries[id].task.expected_size));

        let mirrors = distinct_mirrors(&entries);
        let mut cursor = 0usize;
        let (stages, mut stage_rx) = mpsc::unbounded_channel();
        let mut in_flight = InFlight {
            workers: JoinSet::new(),
            stages,
        };

        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.dispatch(&mut entries, &mut queue, &mirrors, &mut cursor, &mut in_flight, &cancel);

            if in_flight.workers.is_empty() && queue.is_empty() {
                break;
            }

            // A worker reports verification before it returns, so stages are
            // drained ahead of the results they belong to
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some((id, attempt)) = stage_rx.recv() => {
                    self.mark_verifying(&mut entries[id], attempt);
                }
                joined = in_flight.workers.join_next(), if !in_flight.workers.is_empty() => {
                    if let Some(joined) = joined {
                        self.handle_joined(joined, &mut entries, &mut queue, &cancel);
                    }
                }
                _ = tokio::time::sleep(IDLE_BACKOFF), if in_flight.workers.is_empty() => {}
            }
        }

        // Workers watch the token and return promptly, releasing their slots
        while let Some(joined) = in_flight.workers.join_next().await {
            self.handle_joined(joined, &mut entries, &mut queue, &cancel);
        }

        let mut report = BatchReport::default();
        for entry in entries {
            let outcome = match entry.outcome {
                Some(outcome) => outcome,
                None => {
                    let error = if cancel.is_cancelled() {
                        TransferError::Cancelled
                    } else {
                        TransferError::NoMirrorsRemaining {
                            file: entry.task.display_name(),
                            attempts: entry.attempts.len(),
                        }
                    };
                    let outcome = TaskOutcome::failure(&entry.task, entry.attempts, &error);
                    self.observer.finished(&outcome);
                    outcome
                }
            };
            report.push(outcome);
        }
        report.mirrors = self.pool.snapshot();
        report.elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            succeeded = report.succeeded.len(),
            unverified = report.unverified.len(),
            failed = report.failed.len(),
            cancelled = report.cancelled.len(),
            "download batch finished"
        );
        report
    }

    /// Resolve tasks that need no transfer; returns the ids left to download
    async fn admit(&self, entries: &mut [Entry]) -> Vec<usize> {
        let mut pending = Vec::with_capacity(entries.len());

        for (id, entry) in entries.iter_mut().enumerate() {
            let task = Arc::clone(&entry.task);

            if !task.is_authenticated() && !self.config.allow_unauthenticated {
                let error = TransferError::Unauthenticated {
                    file: task.display_name(),
                };
                warn!(file = %task.display_name(), "refusing unauthenticated file");
                self.finish(entry, TaskOutcome::failure(&task, Vec::new(), &error));
                continue;
            }

            if task.candidate_uris.is_empty() {
                let error = TransferError::NoMirrorsRemaining {
                    file: task.display_name(),
                    attempts: 0,
                };
                self.finish(entry, TaskOutcome::failure(&task, Vec::new(), &error));
                continue;
            }

            match verify_existing(&task).await {
                Ok(true) => {
                    debug!(file = %task.destination.display(), "already downloaded");
                    let mut outcome = TaskOutcome::new(&task, TaskState::Succeeded);
                    outcome.cached = true;
                    self.finish(entry, outcome);
                }
                Ok(false) => pending.push(id),
                Err(e) => {
                    self.finish(entry, TaskOutcome::failure(&task, Vec::new(), &e));
                }
            }
        }

        pending
    }

    fn set_state(&self, entry: &mut Entry, state: TaskState) {
        entry.state = state;
        self.observer.state_changed(&entry.task, state);
    }

    fn finish(&self, entry: &mut Entry, outcome: TaskOutcome) {
        self.set_state(entry, outcome.state);
        self.observer.finished(&outcome);
        entry.outcome = Some(outcome);
    }

    /// Record that the current attempt of `entry` is checking size and hash
    fn mark_verifying(&self, entry: &mut Entry, attempt: usize) {
        if entry.state == TaskState::InFlight && entry.attempts.len() == attempt {
            self.set_state(entry, TaskState::Verifying);
        }
    }

    /// Start as many transfers as the pool allows
    ///
    /// Each round visits the distinct mirrors starting at `cursor` and hands
    /// the first queued task whose next candidate lives on a free mirror to
    /// a worker. The cursor then moves past that mirror.
    fn dispatch(
        &self,
        entries: &mut [Entry],
        queue: &mut VecDeque<usize>,
        mirrors: &[String],
        cursor: &mut usize,
        in_flight: &mut InFlight,
        cancel: &CancellationToken,
    ) {
        if mirrors.is_empty() {
            return;
        }

        'rounds: while !queue.is_empty() {
            for offset in 0..mirrors.len() {
                let index = (*cursor + offset) % mirrors.len();
                let mirror = &mirrors[index];
                if !self.pool.has_capacity(mirror) {
                    continue;
                }

                let position = queue.iter().position(|&id| {
                    entries[id]
                        .next_uri()
                        .map_or(false, |uri| mirror_origin(uri) == *mirror)
                });
                let Some(position) = position else {
                    continue;
                };
                let Some(slot) = self.pool.try_slot(mirror) else {
                    continue;
                };
                let Some(id) = queue.remove(position) else {
                    continue;
                };

                self.spawn(id, &mut entries[id], slot, in_flight, cancel);
                *cursor = (index + 1) % mirrors.len();
                continue 'rounds;
            }
            // No free mirror has queued work
            break;
        }
    }

    fn spawn(
        &self,
        id: usize,
        entry: &mut Entry,
        slot: MirrorSlot,
        in_flight: &mut InFlight,
        cancel: &CancellationToken,
    ) {
        let Some(uri) = entry.next_uri().map(str::to_string) else {
            return;
        };
        self.set_state(entry, TaskState::InFlight);

        let task = Arc::clone(&entry.task);
        let transport = Arc::clone(&self.transport);
        let observer = StageReporter {
            stage: (id, entry.attempts.len()),
            stages: in_flight.stages.clone(),
            inner: Arc::clone(&self.observer),
        };
        let config = Arc::clone(&self.config);
        let cancel = cancel.clone();
        let span = crate::span_download!(uri.as_str());

        debug!(uri = %uri, attempt = entry.attempts.len() + 1, "dispatching");
        in_flight.workers.spawn(
            async move {
                let _slot = slot;
                let started = Instant::now();
                let result = transfer(
                    transport.as_ref(),
                    &task,
                    &uri,
                    &config,
                    &observer,
                    &cancel,
                )
                .await;
                (id, uri, result, started.elapsed())
            }
            .instrument(span),
        );
    }

    fn handle_joined(
        &self,
        joined: Result<WorkerResult, tokio::task::JoinError>,
        entries: &mut [Entry],
        queue: &mut VecDeque<usize>,
        cancel: &CancellationToken,
    ) {
        let (id, uri, result, elapsed) = match joined {
            Ok(result) => result,
            Err(e) => {
                // The task stays without outcome and is reported at the end
                error!("transfer worker aborted: {}", e);
                return;
            }
        };

        let entry = &mut entries[id];
        let task = Arc::clone(&entry.task);
        let origin = mirror_origin(&uri);

        match result {
            Ok(success) => {
                self.pool
                    .stats(&origin)
                    .record_success(success.bytes, elapsed.as_millis() as u64);
                entry.attempts.push(AttemptRecord {
                    uri: uri.clone(),
                    error: None,
                    message: None,
                });
                let outcome = TaskOutcome {
                    authenticated: success.authenticated,
                    mirror_used: Some(uri),
                    attempts: std::mem::take(&mut entry.attempts),
                    bytes: success.bytes,
                    ..TaskOutcome::new(&task, TaskState::Succeeded)
                };
                self.finish(entry, outcome);
            }
            Err(TransferError::Cancelled) => {
                let attempts = std::mem::take(&mut entry.attempts);
                self.finish(
                    entry,
                    TaskOutcome::failure(&task, attempts, &TransferError::Cancelled),
                );
            }
            Err(e) => {
                self.pool.stats(&origin).record_failure();
                self.observer.failed(&task, &uri, e.kind());
                entry.attempts.push(AttemptRecord {
                    uri: uri.clone(),
                    error: Some(e.kind()),
                    message: Some(e.to_string()),
                });
                entry.next_candidate += 1;

                if e.falls_back() && entry.next_uri().is_some() {
                    warn!("{}, trying next mirror", e);
                    self.set_state(entry, TaskState::Pending);
                    queue.push_back(id);
                    return;
                }

                let error = if e.falls_back() {
                    TransferError::NoMirrorsRemaining {
                        file: task.display_name(),
                        attempts: entry.attempts.len(),
                    }
                } else {
                    e
                };
                error!("{}", error);
                let attempts = std::mem::take(&mut entry.attempts);
                self.finish(entry, TaskOutcome::failure(&task, attempts, &error));

                if self.config.fail_fast {
                    warn!("fail-fast: cancelling remaining downloads");
                    cancel.cancel();
                }
            }
        }
    }
}

/// Distinct mirror origins in first-seen order over all candidates
fn distinct_mirrors(entries: &[Entry]) -> Vec<String> {
    let mut mirrors: Vec<String> = Vec::new();
    for entry in entries {
        for uri in &entry.task.candidate_uris {
            let origin = mirror_origin(uri);
            if !mirrors.contains(&origin) {
                mirrors.push(origin);
            }
        }
    }
    mirrors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::hash::ExpectedHashes;
    use crate::test_support::{sha256_hex, FakeTransport, RecordingObserver, Route};
    use std::path::Path;

    fn task(dir: &Path, name: &str, uris: &[&str], body: &[u8]) -> DownloadTask {
        DownloadTask::new(
            uris.iter().map(|u| u.to_string()).collect(),
            dir.join(name),
        )
        .with_size(body.len() as u64)
        .with_hashes(ExpectedHashes::new().with("sha256", &sha256_hex(body)).unwrap())
    }

    fn scheduler(transport: &Arc<FakeTransport>, config: DownloadConfig) -> Scheduler {
        Scheduler::new(Arc::clone(transport) as Arc<dyn Transport>, config)
    }

    #[tokio::test]
    async fn test_fallback_records_failed_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new());
        transport.route("http://a.example/pool/x.deb", Route::refused());
        transport.route("http://b.example/pool/x.deb", Route::ok(b"contents".to_vec()));

        let t = task(
            dir.path(),
            "x.deb",
            &["http://a.example/pool/x.deb", "http://b.example/pool/x.deb"],
            b"contents",
        );
        let report = scheduler(&transport, DownloadConfig::default())
            .run(vec![t], CancellationToken::new())
            .await;

        assert_eq!(report.succeeded.len(), 1);
        let outcome = &report.succeeded[0];
        assert_eq!(outcome.mirror_used.as_deref(), Some("http://b.example/pool/x.deb"));
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.attempts[0].uri, "http://a.example/pool/x.deb");
        assert_eq!(outcome.attempts[0].error, Some(ErrorKind::ConnectionError));
        assert_eq!(outcome.attempts[1].error, None);

        let failures: u64 = report
            .mirrors
            .iter()
            .filter(|m| m.origin == "http://a.example")
            .map(|m| m.failures)
            .sum();
        assert_eq!(failures, 1);
    }

    #[tokio::test]
    async fn test_attempts_bounded_by_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new());
        let uris = ["http://a/x.deb", "http://b/x.deb", "http://c/x.deb"];
        for uri in uris {
            transport.route(uri, Route::status(404));
        }

        let report = scheduler(&transport, DownloadConfig::default())
            .run(vec![task(dir.path(), "x.deb", &uris, b"x")], CancellationToken::new())
            .await;

        assert_eq!(report.failed.len(), 1);
        let outcome = &report.failed[0];
        assert_eq!(outcome.error, Some(ErrorKind::NoMirrorsRemaining));
        assert_eq!(outcome.attempts.len(), 3);
        assert_eq!(transport.attempts(), uris.to_vec());
    }

    #[tokio::test]
    async fn test_no_attempt_after_success() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new());
        transport.route("http://a/x.deb", Route::ok(b"payload".to_vec()));
        transport.route("http://b/x.deb", Route::ok(b"payload".to_vec()));

        let report = scheduler(&transport, DownloadConfig::default())
            .run(
                vec![task(dir.path(), "x.deb", &["http://a/x.deb", "http://b/x.deb"], b"payload")],
                CancellationToken::new(),
            )
            .await;

        assert!(report.is_success());
        assert_eq!(transport.attempts(), vec!["http://a/x.deb".to_string()]);
    }

    #[tokio::test]
    async fn test_hash_match_and_flipped_hash() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new());
        transport.route("http://a/good.deb", Route::ok(b"identical".to_vec()));
        transport.route("http://a/bad.deb", Route::ok(b"identical".to_vec()));

        let good = task(dir.path(), "good.deb", &["http://a/good.deb"], b"identical");

        let mut digest = sha256_hex(b"identical");
        let flipped = if digest.starts_with('0') { "1" } else { "0" };
        digest.replace_range(0..1, flipped);
        let bad = DownloadTask::new(vec!["http://a/bad.deb".to_string()], dir.path().join("bad.deb"))
            .with_size(9)
            .with_hashes(ExpectedHashes::new().with("sha256", &digest).unwrap());

        let observer = Arc::new(RecordingObserver::default());
        let report = scheduler(&transport, DownloadConfig::default())
            .with_observer(observer.clone())
            .run(vec![good, bad], CancellationToken::new())
            .await;

        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].attempts[0].error, Some(ErrorKind::HashMismatch));
        assert_eq!(report.failed[0].error, Some(ErrorKind::NoMirrorsRemaining));
        assert!(!dir.path().join("bad.deb").exists());
        assert!(observer
            .events()
            .contains(&"failed http://a/bad.deb hash mismatch".to_string()));
    }

    #[tokio::test]
    async fn test_state_transitions_include_verification() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new());
        transport.route("http://a.example/pool/x.deb", Route::refused());
        transport.route("http://b.example/pool/x.deb", Route::ok(b"contents".to_vec()));
        transport.route("http://a.example/pool/bad.deb", Route::ok(b"tampered".to_vec()));

        let good = task(
            dir.path(),
            "x.deb",
            &["http://a.example/pool/x.deb", "http://b.example/pool/x.deb"],
            b"contents",
        );
        let observer = Arc::new(RecordingObserver::default());
        let report = scheduler(&transport, DownloadConfig::default())
            .with_observer(observer.clone())
            .run(vec![good], CancellationToken::new())
            .await;
        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(
            observer.states(),
            vec!["InFlight", "Pending", "InFlight", "Verifying", "Succeeded"]
        );

        let bad = task(dir.path(), "bad.deb", &["http://a.example/pool/bad.deb"], b"expected");
        let observer = Arc::new(RecordingObserver::default());
        let report = scheduler(&transport, DownloadConfig::default())
            .with_observer(observer.clone())
            .run(vec![bad], CancellationToken::new())
            .await;
        assert_eq!(report.failed.len(), 1);
        assert_eq!(observer.states(), vec!["InFlight", "Verifying", "Failed"]);
    }

    #[tokio::test]
    async fn test_same_file_name_in_shared_partial_dir() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new());
        let amd64 = b"amd64 build of hello".to_vec();
        let arm64 = b"arm64 build of hello, a little longer".to_vec();
        transport.route(
            "http://a.example/amd64/hello.deb",
            Route::ok(amd64.clone()).chunk_delay(Duration::from_millis(2)),
        );
        transport.route(
            "http://b.example/arm64/hello.deb",
            Route::ok(arm64.clone()).chunk_delay(Duration::from_millis(2)),
        );

        let tasks = vec![
            task(&dir.path().join("amd64"), "hello.deb", &["http://a.example/amd64/hello.deb"], &amd64),
            task(&dir.path().join("arm64"), "hello.deb", &["http://b.example/arm64/hello.deb"], &arm64),
        ];
        let config = DownloadConfig {
            partial_dir: Some(dir.path().join("partial")),
            ..DownloadConfig::default()
        };
        let report = scheduler(&transport, config).run(tasks, CancellationToken::new()).await;

        assert_eq!(report.succeeded.len(), 2);
        assert_eq!(std::fs::read(dir.path().join("amd64/hello.deb")).unwrap(), amd64);
        assert_eq!(std::fs::read(dir.path().join("arm64/hello.deb")).unwrap(), arm64);
        assert_eq!(std::fs::read_dir(dir.path().join("partial")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_per_mirror_limit_respected() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new());
        let mut tasks = Vec::new();
        for i in 0..12 {
            let body = format!("package {}", i).into_bytes();
            for host in ["a", "b"] {
                transport.route(
                    &format!("http://{}/p{}.deb", host, i),
                    Route::ok(body.clone()).chunk_delay(Duration::from_millis(5)),
                );
            }
            let uris = [format!("http://a/p{}.deb", i), format!("http://b/p{}.deb", i)];
            tasks.push(task(
                dir.path(),
                &format!("p{}.deb", i),
                &[uris[i % 2].as_str(), uris[(i + 1) % 2].as_str()],
                &body,
            ));
        }

        let config = DownloadConfig {
            per_mirror_limit: 2,
            global_limit: 3,
            ..DownloadConfig::default()
        };
        let report = scheduler(&transport, config).run(tasks, CancellationToken::new()).await;

        assert_eq!(report.succeeded.len(), 12);
        assert!(transport.peak("http://a") <= 2);
        assert!(transport.peak("http://b") <= 2);
        assert!(transport.peak_total() <= 3);
        assert_eq!(transport.attempts().len(), 12);
    }

    #[tokio::test]
    async fn test_round_robin_across_mirrors() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new());
        let mut tasks = Vec::new();
        // Every task prefers mirror a, two of them also list b first
        for (i, first) in ["a", "a", "b", "a", "b"].iter().enumerate() {
            let uri = format!("http://{}/p{}.deb", first, i);
            transport.route(&uri, Route::ok(b"data".to_vec()));
            tasks.push(task(dir.path(), &format!("p{}.deb", i), &[uri.as_str()], b"data"));
        }

        let config = DownloadConfig {
            per_mirror_limit: 3,
            global_limit: 1,
            ..DownloadConfig::default()
        };
        scheduler(&transport, config).run(tasks, CancellationToken::new()).await;

        let origins: Vec<String> = transport.attempts().iter().map(|u| mirror_origin(u)).collect();
        assert_eq!(origins[0], "http://a");
        assert_eq!(origins[1], "http://b");
        assert_eq!(origins[2], "http://a");
        assert_eq!(origins[3], "http://b");
    }

    #[tokio::test]
    async fn test_cancel_leaves_no_partial_files() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new());
        let mut tasks = Vec::new();
        for i in 0..6 {
            let uri = format!("http://a/slow{}.deb", i);
            transport.route(
                &uri,
                Route::ok(vec![7u8; 64]).chunk_delay(Duration::from_millis(50)),
            );
            tasks.push(task(dir.path(), &format!("slow{}.deb", i), &[uri.as_str()], &[7u8; 64]));
        }

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            trigger.cancel();
        });

        let report = scheduler(&transport, DownloadConfig::default()).run(tasks, cancel).await;

        assert_eq!(report.cancelled.len(), 6);
        assert!(report.succeeded.is_empty());
        assert!(report.failed.is_empty());
        assert!(!report.is_success());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_remaining() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new());
        transport.route("http://a/broken.deb", Route::status(500));
        let mut tasks = vec![task(dir.path(), "broken.deb", &["http://a/broken.deb"], b"zz")];
        for i in 0..3 {
            let uri = format!("http://b/later{}.deb", i);
            transport.route(&uri, Route::ok(vec![1u8; 32]).chunk_delay(Duration::from_millis(200)));
            tasks.push(task(dir.path(), &format!("later{}.deb", i), &[uri.as_str()], &[1u8; 32]));
        }

        let config = DownloadConfig {
            fail_fast: true,
            ..DownloadConfig::default()
        };
        let caller = CancellationToken::new();
        let report = scheduler(&transport, config).run(tasks, caller.clone()).await;

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.cancelled.len(), 3);
        assert!(!caller.is_cancelled());
    }

    #[tokio::test]
    async fn test_unauthenticated_policy() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new());
        transport.route("http://a/plain.deb", Route::ok(b"plain".to_vec()));
        let plain = || DownloadTask::new(vec!["http://a/plain.deb".to_string()], dir.path().join("plain.deb")).with_size(5);

        let report = scheduler(&transport, DownloadConfig::default())
            .run(vec![plain()], CancellationToken::new())
            .await;
        assert_eq!(report.failed[0].error, Some(ErrorKind::Unauthenticated));
        assert!(transport.attempts().is_empty());

        let config = DownloadConfig {
            allow_unauthenticated: true,
            ..DownloadConfig::default()
        };
        let report = scheduler(&transport, config)
            .run(vec![plain()], CancellationToken::new())
            .await;
        assert_eq!(report.unverified.len(), 1);
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_existing_file_is_not_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new());
        let t = task(dir.path(), "cached.deb", &["http://a/cached.deb"], b"cached");
        std::fs::write(&t.destination, b"cached").unwrap();

        let report = scheduler(&transport, DownloadConfig::default())
            .run(vec![t], CancellationToken::new())
            .await;

        assert!(report.succeeded[0].cached);
        assert!(transport.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_larger_files_dispatched_first() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FakeTransport::new());
        let small = b"s".to_vec();
        let large = vec![b'l'; 100];
        transport.route("http://a/small.deb", Route::ok(small.clone()));
        transport.route("http://a/large.deb", Route::ok(large.clone()));

        let config = DownloadConfig {
            global_limit: 1,
            ..DownloadConfig::default()
        };
        scheduler(&transport, config)
            .run(
                vec![
                    task(dir.path(), "small.deb", &["http://a/small.deb"], &small),
                    task(dir.path(), "large.deb", &["http://a/large.deb"], &large),
                ],
                CancellationToken::new(),
            )
            .await;

        assert_eq!(transport.attempts()[0], "http://a/large.deb");
    }
}
