/*
 * debboost - Concurrent package downloader and mirror ranking engine.
 * Copyright (C) 2025  compiledkernel-idk and debboost contributors
 */

//! Reading the sources apt already has and writing the generated list.

use super::masterlist::{Distro, MirrorCandidate};
use super::selector::Prompt;
use crate::downloader::transport::Transport;
use crate::error::{DebboostError, DebboostResult};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

pub const SOURCE_LIST: &str = "/etc/apt/sources.list";
pub const SOURCE_PARTS: &str = "/etc/apt/sources.list.d";
pub const DEFAULT_OUTPUT: &str = "/etc/apt/sources.list.d/debboost-sources.list";

/// One `deb` line of the generated file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub url: String,
    pub release: String,
    pub components: String,
}

impl SourceEntry {
    fn line(&self, kind: &str) -> String {
        format!("{} {} {} {}", kind, self.url, self.release, self.components)
    }
}

/// Render the sources file, one paragraph per mirror
pub fn render_sources(entries: &[SourceEntry], with_source: bool) -> String {
    let mut out = format!(
        "# Sources file generated by debboost on {}\n\n",
        chrono::Local::now().format("%Y-%m-%d %H:%M")
    );
    for entry in entries {
        out.push_str(&entry.line("deb"));
        out.push('\n');
        if with_source {
            out.push_str(&entry.line("deb-src"));
            out.push('\n');
        }
        out.push('\n');
    }
    out
}

/// Components for one mirror, adding `non-free-firmware` when it serves it
///
/// A mirror that does not answer within `limit` is treated as lacking it.
pub async fn probe_components(
    transport: &dyn Transport,
    url: &str,
    release: &str,
    components: &str,
    non_free: bool,
    limit: Duration,
) -> String {
    if !non_free {
        return components.to_string();
    }
    let index = format!("{}dists/{}/non-free-firmware/", url, release);
    match timeout(limit, transport.open(&index)).await {
        Ok(Ok(_)) => format!("{} non-free-firmware", components),
        Ok(Err(e)) => {
            debug!(url = %index, error = %e, "no non-free-firmware component");
            components.to_string()
        }
        Err(_) => {
            debug!(url = %index, "non-free-firmware check timed out");
            components.to_string()
        }
    }
}

/// Build the entries for the chosen mirrors
pub async fn build_entries(
    transport: &dyn Transport,
    mirrors: &[MirrorCandidate],
    distro: Distro,
    release: &str,
    non_free: bool,
    limit: Duration,
) -> Vec<SourceEntry> {
    let components = distro.components(non_free);
    let mut entries = Vec::with_capacity(mirrors.len());
    for mirror in mirrors {
        entries.push(SourceEntry {
            url: mirror.base_url.clone(),
            release: release.to_string(),
            components: probe_components(
                transport,
                &mirror.base_url,
                release,
                components,
                non_free,
                limit,
            )
            .await,
        });
    }
    entries
}

/// An archive apt is already configured to use
#[derive(Debug, Clone, PartialEq, Eq)]
struct ConfiguredSource {
    url: String,
    suite: String,
}

/// Sources configured on the system, used to skip mirrors already in use
#[derive(Debug, Clone, Default)]
pub struct ExistingSources {
    sources: Vec<ConfiguredSource>,
}

impl ExistingSources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `sources.list` and the `.list`/`.sources` files of `parts`
    ///
    /// `exclude` is our own output file, which is about to be replaced.
    pub fn load(list: &Path, parts: &Path, exclude: &Path) -> Self {
        let mut files: Vec<PathBuf> = fs::read_dir(parts)
            .map(|dir| {
                dir.filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| {
                        matches!(
                            p.extension().and_then(|e| e.to_str()),
                            Some("list") | Some("sources")
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        files.sort();
        files.push(list.to_path_buf());

        let mut existing = Self::new();
        for file in files {
            if file == exclude || !file.is_file() {
                continue;
            }
            let text = match fs::read_to_string(&file) {
                Ok(text) => text,
                Err(e) => {
                    warn!(path = %file.display(), error = %e, "cannot read sources file");
                    continue;
                }
            };
            if file.extension().and_then(|e| e.to_str()) == Some("sources") {
                existing.add_deb822(&text);
            } else {
                existing.add_one_line(&text);
            }
        }
        existing
    }

    /// Add sources written in the one-line style
    pub fn add_one_line(&mut self, text: &str) {
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut tokens = line.split_whitespace();
            if !matches!(tokens.next(), Some("deb") | Some("deb-src")) {
                continue;
            }
            let mut token = tokens.next();
            // skip `[arch=amd64 signed-by=...]`
            if token.is_some_and(|t| t.starts_with('[')) {
                while let Some(t) = token {
                    token = tokens.next();
                    if t.ends_with(']') {
                        break;
                    }
                }
            }
            if let (Some(url), Some(suite)) = (token, tokens.next()) {
                self.push(url, suite);
            }
        }
    }

    /// Add sources written as deb822 paragraphs
    pub fn add_deb822(&mut self, text: &str) {
        for paragraph in text.split("\n\n") {
            let field = |name: &str| -> String {
                paragraph
                    .lines()
                    .filter(|l| !l.trim_start().starts_with('#'))
                    .find_map(|l| {
                        let (key, value) = l.split_once(':')?;
                        key.trim().eq_ignore_ascii_case(name).then(|| value.trim().to_string())
                    })
                    .unwrap_or_default()
            };

            let enabled = field("Enabled").to_ascii_lowercase();
            if matches!(enabled.as_str(), "no" | "false" | "0") {
                continue;
            }
            let types = field("Types");
            if !types.split_whitespace().any(|t| t == "deb" || t == "deb-src") {
                continue;
            }
            let uris = field("URIs");
            let suites = field("Suites");
            for uri in uris.split_whitespace() {
                for suite in suites.split_whitespace() {
                    self.push(uri, suite);
                }
            }
        }
    }

    fn push(&mut self, url: &str, suite: &str) {
        let source = ConfiguredSource {
            url: url.trim_end_matches('/').to_string(),
            suite: suite.to_string(),
        };
        if !self.sources.contains(&source) {
            self.sources.push(source);
        }
    }

    /// Whether `url` is configured for `release` or one of its pockets
    pub fn contains(&self, url: &str, release: &str) -> bool {
        let url = url.trim_end_matches('/');
        self.sources.iter().any(|s| {
            s.url == url
                && (s.suite == release
                    || s.suite
                        .strip_prefix(release)
                        .is_some_and(|pocket| pocket.starts_with('-')))
        })
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Write the generated file, confirming first unless `assume_yes`
pub fn write_sources(
    path: &Path,
    content: &str,
    assume_yes: bool,
    prompt: &mut dyn Prompt,
) -> DebboostResult<()> {
    if !assume_yes {
        let question = if path.exists() {
            format!("{} already exists.\nContinue and overwrite it?", path.display())
        } else {
            format!("The above mirrors will be written to {}. Continue?", path.display())
        };
        let accepted = prompt
            .confirm(&question)
            .map_err(|e| DebboostError::filesystem("<stdin>", "cannot read answer", e))?;
        if !accepted {
            return Err(DebboostError::Aborted);
        }
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            DebboostError::filesystem(parent.display().to_string(), "cannot create directory", e)
        })?;
    }
    fs::write(path, content).map_err(|e| {
        DebboostError::filesystem(path.display().to_string(), "cannot write sources", e)
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeTransport, Route, ScriptedPrompt};

    const LIMIT: Duration = Duration::from_secs(15);

    fn entry(url: &str) -> SourceEntry {
        SourceEntry {
            url: url.to_string(),
            release: "bookworm".to_string(),
            components: "main".to_string(),
        }
    }

    #[test]
    fn test_render_sources() {
        let out = render_sources(&[entry("http://a.example/debian/")], true);
        assert!(out.starts_with("# Sources file generated by debboost on "));
        assert!(out.ends_with(
            "deb http://a.example/debian/ bookworm main\n\
             deb-src http://a.example/debian/ bookworm main\n\n"
        ));

        let out = render_sources(&[entry("http://a.example/debian/"), entry("http://b.example/debian/")], false);
        assert!(!out.contains("deb-src"));
        assert_eq!(out.matches("\ndeb ").count(), 2);
    }

    #[tokio::test]
    async fn test_non_free_firmware_probe() {
        let transport = FakeTransport::new();
        transport.route(
            "http://a.example/debian/dists/bookworm/non-free-firmware/",
            Route::ok(b"index".to_vec()),
        );

        let with = probe_components(&transport, "http://a.example/debian/", "bookworm", "main contrib non-free", true, LIMIT).await;
        assert_eq!(with, "main contrib non-free non-free-firmware");

        let without = probe_components(&transport, "http://b.example/debian/", "bookworm", "main contrib non-free", true, LIMIT).await;
        assert_eq!(without, "main contrib non-free");

        let disabled = probe_components(&transport, "http://a.example/debian/", "bookworm", "main", false, LIMIT).await;
        assert_eq!(disabled, "main");
        assert_eq!(transport.attempts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_free_firmware_check_times_out() {
        let transport = FakeTransport::new();
        transport.route(
            "http://stalled.example/debian/dists/bookworm/non-free-firmware/",
            Route::ok(b"index".to_vec()).delay(Duration::from_secs(24 * 3600)),
        );

        let components = tokio::time::timeout(
            Duration::from_secs(3600),
            probe_components(
                &transport,
                "http://stalled.example/debian/",
                "bookworm",
                "main contrib non-free",
                true,
                LIMIT,
            ),
        )
        .await
        .unwrap();
        assert_eq!(components, "main contrib non-free");
    }

    #[test]
    fn test_one_line_sources() {
        let mut existing = ExistingSources::new();
        existing.add_one_line(
            "# comment\n\
             deb http://deb.debian.org/debian/ bookworm main\n\
             deb [arch=amd64 signed-by=/usr/share/keyrings/x.gpg] http://ftp.us.debian.org/debian bookworm-updates main\n\
             deb-src [ trusted=yes ] http://src.example/debian sid main\n\
             #deb http://commented.example/debian bookworm main\n",
        );

        assert_eq!(existing.len(), 3);
        assert!(existing.contains("http://deb.debian.org/debian", "bookworm"));
        assert!(existing.contains("http://ftp.us.debian.org/debian/", "bookworm"));
        assert!(existing.contains("http://src.example/debian/", "sid"));
        assert!(!existing.contains("http://deb.debian.org/debian/", "trixie"));
        assert!(!existing.contains("http://commented.example/debian/", "bookworm"));
    }

    #[test]
    fn test_deb822_sources() {
        let mut existing = ExistingSources::new();
        existing.add_deb822(
            "Types: deb deb-src\n\
             URIs: http://a.example/debian/ http://b.example/debian/\n\
             Suites: bookworm bookworm-security\n\
             Components: main\n\
             \n\
             Types: deb\n\
             URIs: http://off.example/debian/\n\
             Suites: bookworm\n\
             Enabled: no\n",
        );

        assert_eq!(existing.len(), 4);
        assert!(existing.contains("http://b.example/debian/", "bookworm"));
        assert!(!existing.contains("http://off.example/debian/", "bookworm"));
    }

    #[test]
    fn test_load_skips_own_file() {
        let dir = tempfile::tempdir().unwrap();
        let parts = dir.path().join("sources.list.d");
        std::fs::create_dir(&parts).unwrap();
        let list = dir.path().join("sources.list");
        let own = parts.join("debboost-sources.list");

        std::fs::write(&list, "deb http://main.example/debian bookworm main\n").unwrap();
        std::fs::write(&own, "deb http://own.example/debian bookworm main\n").unwrap();
        std::fs::write(parts.join("extra.sources"), "Types: deb\nURIs: http://extra.example/debian\nSuites: bookworm\n").unwrap();
        std::fs::write(parts.join("notes.txt"), "deb http://ignored.example/debian bookworm main\n").unwrap();

        let existing = ExistingSources::load(&list, &parts, &own);
        assert!(existing.contains("http://main.example/debian/", "bookworm"));
        assert!(existing.contains("http://extra.example/debian/", "bookworm"));
        assert!(!existing.contains("http://own.example/debian/", "bookworm"));
        assert!(!existing.contains("http://ignored.example/debian/", "bookworm"));
    }

    #[test]
    fn test_write_sources_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apt/debboost-sources.list");

        let mut prompt = ScriptedPrompt::new(&["y"]);
        write_sources(&path, "first\n", false, &mut prompt).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\n");
        assert!(prompt.output().contains("will be written to"));

        let mut prompt = ScriptedPrompt::new(&["n"]);
        let result = write_sources(&path, "second\n", false, &mut prompt);
        assert!(matches!(result, Err(DebboostError::Aborted)));
        assert!(prompt.output().contains("already exists"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\n");

        let mut prompt = ScriptedPrompt::new(&[]);
        write_sources(&path, "third\n", true, &mut prompt).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "third\n");
    }
}
