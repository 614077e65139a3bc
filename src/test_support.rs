/*
 * debboost - Concurrent package downloader and mirror ranking engine.
 * Copyright (C) 2025  compiledkernel-idk and debboost contributors
 */

//! Scripted in-memory transport for engine tests.

use crate::downloader::mirror::mirror_origin;
use crate::downloader::observer::Observer;
use crate::downloader::scheduler::TaskOutcome;
use crate::downloader::task::{DownloadTask, TaskState};
use crate::downloader::transport::{TransferBody, Transport};
use crate::error::{ErrorKind, TransferError};
use crate::fetch::selector::Prompt;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Scripted response for one URI
#[derive(Debug, Clone)]
pub struct Route {
    body: Vec<u8>,
    advertise_length: bool,
    status: Option<u16>,
    refuse: bool,
    delay: Duration,
    chunk_delay: Duration,
    chunk_size: usize,
}

impl Route {
    pub fn ok(body: Vec<u8>) -> Self {
        Self {
            body,
            advertise_length: true,
            status: None,
            refuse: false,
            delay: Duration::ZERO,
            chunk_delay: Duration::ZERO,
            chunk_size: 4,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Self::ok(Vec::new())
        }
    }

    pub fn refused() -> Self {
        Self {
            refuse: true,
            ..Self::ok(Vec::new())
        }
    }

    /// Wait before answering
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Wait before each body chunk
    pub fn chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn without_length(mut self) -> Self {
        self.advertise_length = false;
        self
    }
}

#[derive(Debug, Default)]
struct Activity {
    active: HashMap<String, usize>,
    peak: HashMap<String, usize>,
    total: usize,
    peak_total: usize,
}

/// Decrements the open-stream count when the body is dropped
struct ActiveGuard {
    origin: String,
    activity: Arc<Mutex<Activity>>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut activity = self.activity.lock().unwrap();
        if let Some(active) = activity.active.get_mut(&self.origin) {
            *active -= 1;
        }
        activity.total -= 1;
    }
}

/// Transport answering from scripted routes; unknown URIs get a 404
#[derive(Default)]
pub struct FakeTransport {
    routes: Mutex<HashMap<String, Route>>,
    attempts: Mutex<Vec<String>>,
    activity: Arc<Mutex<Activity>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, uri: &str, route: Route) {
        self.routes.lock().unwrap().insert(uri.to_string(), route);
    }

    /// Every URI opened, in order
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn attempts_for(&self, uri: &str) -> usize {
        self.attempts().iter().filter(|a| a.as_str() == uri).count()
    }

    /// Highest number of simultaneously open bodies seen per origin
    pub fn peak(&self, origin: &str) -> usize {
        self.activity.lock().unwrap().peak.get(origin).copied().unwrap_or(0)
    }

    pub fn peak_total(&self) -> usize {
        self.activity.lock().unwrap().peak_total
    }

    fn enter(&self, origin: &str) -> ActiveGuard {
        let mut activity = self.activity.lock().unwrap();
        let active = {
            let entry = activity.active.entry(origin.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        let peak = activity.peak.entry(origin.to_string()).or_insert(0);
        *peak = (*peak).max(active);
        activity.total += 1;
        activity.peak_total = activity.peak_total.max(activity.total);
        ActiveGuard {
            origin: origin.to_string(),
            activity: Arc::clone(&self.activity),
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self, uri: &str) -> Result<TransferBody, TransferError> {
        self.attempts.lock().unwrap().push(uri.to_string());
        let guard = self.enter(&mirror_origin(uri));
        let route = self.routes.lock().unwrap().get(uri).cloned();
        let route = route.unwrap_or_else(|| Route::status(404));

        if !route.delay.is_zero() {
            tokio::time::sleep(route.delay).await;
        }
        if route.refuse {
            return Err(TransferError::Connection {
                uri: uri.to_string(),
                message: "connection refused".to_string(),
            });
        }
        if let Some(status) = route.status {
            return Err(TransferError::HttpStatus {
                uri: uri.to_string(),
                status,
            });
        }

        let content_length = route.advertise_length.then_some(route.body.len() as u64);
        let chunks: VecDeque<Bytes> = route
            .body
            .chunks(route.chunk_size.max(1))
            .map(Bytes::copy_from_slice)
            .collect();
        let chunk_delay = route.chunk_delay;

        let stream = stream::unfold((chunks, guard), move |(mut chunks, guard)| async move {
            match chunks.pop_front() {
                Some(chunk) => {
                    if !chunk_delay.is_zero() {
                        tokio::time::sleep(chunk_delay).await;
                    }
                    Some((Ok(chunk), (chunks, guard)))
                }
                None => None,
            }
        })
        .boxed();

        Ok(TransferBody {
            content_length,
            stream,
        })
    }
}

/// Observer recording every event as a short string
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// Only the state transitions, in order
    pub fn states(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_prefix("state ").map(str::to_string))
            .collect()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl Observer for RecordingObserver {
    fn started(&self, _task: &DownloadTask, uri: &str, size: Option<u64>) {
        self.push(format!("started {} {:?}", uri, size));
    }

    fn completed(&self, _task: &DownloadTask, uri: &str) {
        self.push(format!("completed {}", uri));
    }

    fn failed(&self, _task: &DownloadTask, uri: &str, kind: ErrorKind) {
        self.push(format!("failed {} {}", uri, kind));
    }

    fn state_changed(&self, _task: &DownloadTask, state: TaskState) {
        self.push(format!("state {:?}", state));
    }

    fn finished(&self, outcome: &TaskOutcome) {
        self.push(format!("finished {:?}", outcome.state));
    }
}

/// Prompt answering from a script and recording everything shown
pub struct ScriptedPrompt {
    answers: VecDeque<String>,
    output: String,
}

impl ScriptedPrompt {
    pub fn new(answers: &[&str]) -> Self {
        Self {
            answers: answers.iter().map(|a| a.to_string()).collect(),
            output: String::new(),
        }
    }

    pub fn output(&self) -> &str {
        &self.output
    }
}

impl Prompt for ScriptedPrompt {
    fn show(&mut self, text: &str) {
        self.output.push_str(text);
        self.output.push('\n');
    }

    /// Runs out as if stdin hit end of file
    fn read_line(&mut self, question: &str) -> std::io::Result<String> {
        self.output.push_str(question);
        self.output.push('\n');
        Ok(self.answers.pop_front().unwrap_or_default())
    }
}
