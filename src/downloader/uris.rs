/*
 * debboost - Concurrent package downloader and mirror ranking engine.
 * Copyright (C) 2025  compiledkernel-idk and debboost contributors
 */

//! Expansion of apt mirror-list URIs into plain candidate URIs.
//!
//! `mirror+file:/etc/apt/mirrors.txt/pool/main/h/hello.deb` reads the local
//! list once and yields `<line>/pool/main/h/hello.deb` for each entry.
//! `mirror://host/mirrors.txt/pool/...` fetches `http://host/mirrors.txt`
//! once per resolver and expands the same way.

use super::task::DownloadTask;
use super::transport::{fetch_text, Transport};
use crate::error::{DebboostError, DebboostResult};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

const MIRROR_FILE_PREFIX: &str = "mirror+file:";
const MIRROR_PREFIX: &str = "mirror://";

/// Caches mirror lists while expanding a batch
pub struct MirrorListResolver<'a> {
    transport: &'a dyn Transport,
    timeout: Duration,
    lists: HashMap<String, Vec<String>>,
}

impl<'a> MirrorListResolver<'a> {
    /// `timeout` bounds each remote mirror list request
    pub fn new(transport: &'a dyn Transport, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            lists: HashMap::new(),
        }
    }

    /// Expand one candidate URI; plain URIs pass through, `file:` URIs are dropped
    pub async fn expand(&mut self, uri: &str) -> DebboostResult<Vec<String>> {
        if let Some(rest) = uri.strip_prefix(MIRROR_FILE_PREFIX) {
            let (list, path) = split_list(uri, rest, "/pool")?;
            if !self.lists.contains_key(list) {
                let text = tokio::fs::read_to_string(list)
                    .await
                    .map_err(|e| DebboostError::filesystem(list, "cannot read mirror list", e))?;
                self.lists.insert(list.to_string(), parse_list(&text));
            }
            return Ok(self.join(list, path));
        }

        if let Some(rest) = uri.strip_prefix(MIRROR_PREFIX) {
            let (list, path) = split_list(uri, rest, "")?;
            if !self.lists.contains_key(list) {
                let url = format!("http://{}", list);
                debug!(url = %url, "fetching mirror list");
                let text = fetch_text(self.transport, &url, self.timeout)
                    .await
                    .map_err(|e| DebboostError::network(&url, e.to_string()))?;
                self.lists.insert(list.to_string(), parse_list(&text));
            }
            return Ok(self.join(list, path));
        }

        if uri.starts_with("file:") {
            return Ok(Vec::new());
        }
        Ok(vec![uri.to_string()])
    }

    /// Replace every task's candidates by their expansion, keeping order
    pub async fn resolve(&mut self, tasks: Vec<DownloadTask>) -> DebboostResult<Vec<DownloadTask>> {
        let mut resolved = Vec::with_capacity(tasks.len());
        for mut task in tasks {
            let mut candidates = Vec::new();
            for uri in &task.candidate_uris {
                for expanded in self.expand(uri).await? {
                    if !candidates.contains(&expanded) {
                        candidates.push(expanded);
                    }
                }
            }
            task.candidate_uris = candidates;
            resolved.push(task);
        }
        Ok(resolved)
    }

    fn join(&self, list: &str, path: &str) -> Vec<String> {
        self.lists
            .get(list)
            .map(|bases| {
                bases
                    .iter()
                    .map(|base| format!("{}/{}", base.trim_end_matches('/'), path))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Split `rest` into the list location and the path below the mirror root
///
/// With a marker the list ends where the marker starts (`/pool`). Without
/// one the list is `host/file`, the first two path components.
fn split_list<'u>(uri: &str, rest: &'u str, marker: &str) -> DebboostResult<(&'u str, &'u str)> {
    let invalid = || DebboostError::InvalidUri {
        uri: uri.to_string(),
        reason: "cannot locate mirror list".to_string(),
    };

    let split = if marker.is_empty() {
        let host_end = rest.find('/').ok_or_else(invalid)?;
        rest[host_end + 1..]
            .find('/')
            .map(|i| host_end + 1 + i)
            .ok_or_else(invalid)?
    } else {
        rest.find(marker).ok_or_else(invalid)?
    };

    let (list, path) = rest.split_at(split);
    Ok((list, path.trim_start_matches('/')))
}

fn parse_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        // apt allows tab-separated metadata after the URI
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeTransport, Route};

    const LIMIT: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_plain_and_file_uris() {
        let transport = FakeTransport::new();
        let mut resolver = MirrorListResolver::new(&transport, LIMIT);
        assert_eq!(
            resolver.expand("http://deb.debian.org/debian/pool/a.deb").await.unwrap(),
            vec!["http://deb.debian.org/debian/pool/a.deb".to_string()]
        );
        assert!(resolver.expand("file:/srv/repo/a.deb").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mirror_file_expansion() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("mirrors.txt");
        std::fs::write(
            &list,
            "# primary\nhttp://one.example/debian/\nhttp://two.example/debian\tpriority:1\n\n",
        )
        .unwrap();

        let transport = FakeTransport::new();
        let mut resolver = MirrorListResolver::new(&transport, LIMIT);
        let uri = format!("mirror+file:{}/pool/main/h/hello.deb", list.display());
        assert_eq!(
            resolver.expand(&uri).await.unwrap(),
            vec![
                "http://one.example/debian/pool/main/h/hello.deb".to_string(),
                "http://two.example/debian/pool/main/h/hello.deb".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_mirror_list_fetched_once() {
        let transport = FakeTransport::new();
        transport.route(
            "http://mirrors.example/list.txt",
            Route::ok(b"http://a.example/ubuntu\nhttp://b.example/ubuntu/\n".to_vec()),
        );

        let tasks = vec![
            DownloadTask::new(vec!["mirror://mirrors.example/list.txt/pool/x.deb".into()], "x.deb"),
            DownloadTask::new(vec!["mirror://mirrors.example/list.txt/pool/y.deb".into()], "y.deb"),
        ];
        let mut resolver = MirrorListResolver::new(&transport, LIMIT);
        let resolved = resolver.resolve(tasks).await.unwrap();

        assert_eq!(
            resolved[1].candidate_uris,
            vec![
                "http://a.example/ubuntu/pool/y.deb".to_string(),
                "http://b.example/ubuntu/pool/y.deb".to_string(),
            ]
        );
        assert_eq!(transport.attempts_for("http://mirrors.example/list.txt"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_mirror_list_times_out() {
        let transport = FakeTransport::new();
        transport.route(
            "http://mirrors.example/list.txt",
            Route::ok(b"http://a.example/ubuntu\n".to_vec()).delay(Duration::from_secs(24 * 3600)),
        );

        let mut resolver = MirrorListResolver::new(&transport, LIMIT);
        let err = resolver
            .expand("mirror://mirrors.example/list.txt/pool/x.deb")
            .await
            .unwrap_err();
        assert!(matches!(err, DebboostError::Network { .. }));
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_malformed_mirror_uri() {
        let transport = FakeTransport::new();
        let mut resolver = MirrorListResolver::new(&transport, LIMIT);
        assert!(matches!(
            resolver.expand("mirror://onlyhost").await,
            Err(DebboostError::InvalidUri { .. })
        ));
    }
}
