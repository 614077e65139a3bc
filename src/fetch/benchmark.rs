/*
 * debboost - Concurrent package downloader and mirror ranking engine.
 * Copyright (C) 2025  compiledkernel-idk and debboost contributors
 */

//! Mirror benchmark: time a small Release file on every candidate.

use super::masterlist::{MirrorCandidate, Protocol};
use crate::downloader::observer::NoopObserver;
use crate::downloader::transport::Transport;
use crate::error::TransferError;
use futures::stream::{self, StreamExt};
use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Responsiveness of a mirror, lower is better
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Score {
    /// Not probed yet
    Pending,
    /// Time to fetch the Release file
    Latency(Duration),
    /// Probe failed; never selectable
    Unreachable,
}

impl Score {
    pub fn is_reachable(&self) -> bool {
        matches!(self, Score::Latency(_))
    }

    pub fn millis(&self) -> Option<u64> {
        match self {
            Score::Latency(latency) => Some(latency.as_millis() as u64),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Score::Latency(_) => 0,
            Score::Pending => 1,
            Score::Unreachable => 2,
        }
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Score::Latency(a), Score::Latency(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Serialized as milliseconds, `null` when there is no latency
impl Serialize for Score {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.millis().serialize(serializer)
    }
}

/// Receives one event per probed candidate
pub trait BenchmarkObserver: Send + Sync {
    fn probed(&self, _candidate: &MirrorCandidate) {}
}

impl BenchmarkObserver for NoopObserver {}

/// Engine-facing benchmark settings
#[derive(Debug, Clone)]
pub struct BenchmarkConfig {
    /// Suite whose Release file is timed
    pub release: String,
    /// Simultaneous probes
    pub concurrency: usize,
    /// Limit for each probe request including the body
    pub timeout: Duration,
    /// Never fall back to plain http
    pub https_only: bool,
    /// Also require `main/source/Release`
    pub check_sources: bool,
    /// Country codes to keep; empty keeps all
    pub countries: Vec<String>,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            release: "stable".to_string(),
            concurrency: 25,
            timeout: Duration::from_secs(5),
            https_only: false,
            check_sources: false,
            countries: Vec::new(),
        }
    }
}

/// Outcome of a benchmark pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct BenchmarkReport {
    /// Reachable candidates, fastest first
    pub ranked: Vec<MirrorCandidate>,
    pub unreachable: Vec<MirrorCandidate>,
    /// Candidates removed by the protocol or country filter
    pub filtered: usize,
}

/// Parallel prober over a mirror universe
pub struct BenchmarkEngine {
    transport: Arc<dyn Transport>,
    config: BenchmarkConfig,
}

impl BenchmarkEngine {
    pub fn new(transport: Arc<dyn Transport>, config: BenchmarkConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &BenchmarkConfig {
        &self.config
    }

    /// Whether a candidate passes the protocol and country filters
    pub fn accepts(&self, candidate: &MirrorCandidate) -> bool {
        if self.config.https_only && candidate.protocol == Protocol::Ftp {
            return false;
        }
        self.config.countries.is_empty()
            || self
                .config
                .countries
                .iter()
                .any(|c| c.eq_ignore_ascii_case(&candidate.country_code))
    }

    /// Probe every accepted candidate and rank the reachable ones
    ///
    /// A failed probe marks only that candidate unreachable. Cancelling
    /// stops probing; candidates not probed yet are left out of the report.
    pub async fn run(
        &self,
        candidates: Vec<MirrorCandidate>,
        observer: &dyn BenchmarkObserver,
        cancel: &CancellationToken,
    ) -> BenchmarkReport {
        let total = candidates.len();
        let (accepted, rejected): (Vec<_>, Vec<_>) =
            candidates.into_iter().partition(|c| self.accepts(c));

        info!(
            candidates = accepted.len(),
            filtered = rejected.len(),
            release = %self.config.release,
            "benchmarking mirrors"
        );

        let mut report = BenchmarkReport {
            filtered: rejected.len(),
            ..BenchmarkReport::default()
        };

        let probes = stream::iter(accepted)
            .map(|candidate| self.probe(candidate))
            .buffer_unordered(self.config.concurrency.max(1))
            .take_until(cancel.cancelled());
        let mut probes = std::pin::pin!(probes);

        while let Some(candidate) = probes.next().await {
            observer.probed(&candidate);
            if candidate.score.is_reachable() {
                report.ranked.push(candidate);
            } else {
                report.unreachable.push(candidate);
            }
        }

        // Stable sort keeps master-list order among equal scores
        report.ranked.sort_by(|a, b| a.score.cmp(&b.score));
        debug!(
            total,
            reachable = report.ranked.len(),
            unreachable = report.unreachable.len(),
            "benchmark finished"
        );
        report
    }

    /// Score one candidate, trying https before http
    pub async fn probe(&self, mut candidate: MirrorCandidate) -> MirrorCandidate {
        let mut latency = None;

        if candidate.protocol == Protocol::Http {
            let https = candidate.base_url.replacen("http://", "https://", 1);
            match self.time_release(&https).await {
                Ok(elapsed) => {
                    candidate.upgrade_to_https();
                    latency = Some(elapsed);
                }
                Err(e) => debug!(mirror = %https, "https attempt failed: {}", e),
            }
        }

        let plain_allowed = !self.config.https_only || candidate.protocol == Protocol::Https;
        if latency.is_none() && plain_allowed {
            match self.time_release(&candidate.base_url).await {
                Ok(elapsed) => latency = Some(elapsed),
                Err(e) => debug!(mirror = %candidate.base_url, "probe failed: {}", e),
            }
        }

        candidate.score = match latency {
            Some(elapsed) if self.config.check_sources => {
                let uri = format!(
                    "{}dists/{}/main/source/Release",
                    candidate.base_url, self.config.release
                );
                match self.drain(&uri).await {
                    Ok(()) => {
                        candidate.supports_source_repo = true;
                        Score::Latency(elapsed)
                    }
                    Err(e) => {
                        debug!(mirror = %candidate.base_url, "no source repository: {}", e);
                        Score::Unreachable
                    }
                }
            }
            Some(elapsed) => Score::Latency(elapsed),
            None => Score::Unreachable,
        };
        candidate
    }

    async fn time_release(&self, base_url: &str) -> Result<Duration, TransferError> {
        let uri = format!("{}dists/{}/Release", base_url, self.config.release);
        let started = Instant::now();
        self.drain(&uri).await?;
        Ok(started.elapsed())
    }

    /// Fetch `uri` completely within the probe timeout
    async fn drain(&self, uri: &str) -> Result<(), TransferError> {
        let fetch = async {
            let mut body = self.transport.open(uri).await?;
            while let Some(chunk) = body.stream.next().await {
                chunk?;
            }
            Ok::<(), TransferError>(())
        };
        timeout(self.config.timeout, fetch)
            .await
            .map_err(|_| TransferError::Timeout {
                uri: uri.to_string(),
            })?
    }
}
