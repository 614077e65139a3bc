/*
 * debboost - Concurrent package downloader and mirror ranking engine.
 * Copyright (C) 2025  compiledkernel-idk and debboost contributors
 */

//! Finding, ranking and recording fast mirrors.

pub mod benchmark;
pub mod masterlist;
pub mod release;
pub mod selector;
pub mod sources;

pub use benchmark::{BenchmarkConfig, BenchmarkEngine, BenchmarkObserver, BenchmarkReport, Score};
pub use masterlist::{discover_countries, parse_master_list, Distro, MirrorCandidate, Protocol};
pub use release::{detect_release, host_architectures, ReleaseInfo, ReleaseOverride};
pub use selector::{parse_selection, select_automatic, InteractiveSelector, Prompt, TerminalPrompt};
pub use sources::{render_sources, write_sources, ExistingSources, SourceEntry};

use crate::downloader::transport::{fetch_text, Transport};
use crate::error::{DebboostError, DebboostResult, RecoveryStrategy};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Run `op` again while its error asks for a retry, doubling the delay each time
async fn with_retry<T, F, Fut>(mut op: F) -> DebboostResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DebboostResult<T>>,
{
    let mut attempt = 1;
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        match err.recovery_strategy() {
            RecoveryStrategy::Retry {
                max_attempts,
                initial_delay_ms,
            } if attempt < max_attempts => {
                let delay = Duration::from_millis(initial_delay_ms * 2u64.pow(attempt - 1));
                warn!(attempt, "{}, retrying in {:?}", err, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            _ => return Err(err),
        }
    }
}

/// Master list text, from `local` when given, otherwise from the distro
///
/// Each remote request must finish within `limit`; failed requests are retried.
pub async fn fetch_master_list(
    transport: &dyn Transport,
    distro: Distro,
    local: Option<&Path>,
    limit: Duration,
) -> DebboostResult<String> {
    if let Some(path) = local {
        return tokio::fs::read_to_string(path).await.map_err(|e| {
            DebboostError::filesystem(path.display().to_string(), "cannot read master list", e)
        });
    }
    let url = distro.master_list_url();
    info!(url, "fetching mirror master list");
    with_retry(|| async move {
        fetch_text(transport, url, limit)
            .await
            .map_err(|e| DebboostError::network(url, e.to_string()))
    })
    .await
}
