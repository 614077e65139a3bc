/*
 * debboost - Concurrent package downloader and mirror ranking engine.
 * Copyright (C) 2025  compiledkernel-idk and debboost contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Configuration management with validation and defaults.

use crate::downloader::DownloadConfig;
use crate::error::{DebboostError, DebboostResult};
use crate::fetch::sources::DEFAULT_OUTPUT;
use crate::fetch::BenchmarkConfig;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const SYSTEM_CONFIG: &str = "/etc/debboost/debboost.toml";

/// Main configuration structure for debboost
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Package download settings
    pub download: DownloadSection,

    /// Mirror ranking settings
    pub fetch: FetchSection,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// `[download]` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloadSection {
    /// Simultaneous transfers against one mirror
    pub per_mirror_limit: usize,

    /// Simultaneous transfers overall
    pub global_limit: usize,

    pub connect_timeout_secs: u64,

    /// Time a mirror has to answer a request
    pub attempt_timeout_secs: u64,

    /// Time allowed between two chunks of a body
    pub stall_timeout_secs: u64,

    /// Download files that carry no hash sum
    pub allow_unauthenticated: bool,

    /// Stop the whole batch on the first failed file
    pub fail_fast: bool,

    /// Default destination for downloaded archives
    pub archive_dir: PathBuf,

    /// Directory for partial files (empty = next to the destination)
    pub partial_dir: Option<PathBuf>,

    pub proxy: Option<String>,

    pub user_agent: String,
}

impl Default for DownloadSection {
    fn default() -> Self {
        let engine = DownloadConfig::default();
        Self {
            per_mirror_limit: engine.per_mirror_limit,
            global_limit: engine.global_limit,
            connect_timeout_secs: engine.connect_timeout.as_secs(),
            attempt_timeout_secs: engine.attempt_timeout.as_secs(),
            stall_timeout_secs: engine.stall_timeout.as_secs(),
            allow_unauthenticated: false,
            fail_fast: false,
            archive_dir: PathBuf::from("/var/cache/apt/archives"),
            partial_dir: None,
            proxy: None,
            user_agent: engine.user_agent,
        }
    }
}

/// `[fetch]` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchSection {
    /// Simultaneous latency probes
    pub concurrency: usize,

    /// Probe timeout in seconds
    pub timeout_secs: u64,

    /// Mirrors picked in automatic mode
    pub auto_count: usize,

    /// Mirrors offered in interactive mode
    pub display_count: usize,

    pub https_only: bool,

    /// Country codes to keep (empty = all)
    pub countries: Vec<String>,

    /// Add the non-free components
    pub non_free: bool,

    /// Add deb-src lines for mirrors serving sources
    pub sources: bool,

    /// Sources file written by `fetch`
    pub output: PathBuf,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            concurrency: 25,
            timeout_secs: 5,
            auto_count: 3,
            display_count: 16,
            https_only: false,
            countries: Vec::new(),
            non_free: false,
            sources: false,
            output: PathBuf::from(DEFAULT_OUTPUT),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path (empty = no file logging)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            file: None,
        }
    }
}

fn flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes")
}

impl Config {
    /// Load configuration from multiple sources with precedence:
    /// 1. /etc/debboost/debboost.toml (system-wide)
    /// 2. ~/.config/debboost/config.toml (user)
    /// 3. Environment variables (DEBBOOST_*)
    ///
    /// Unreadable or malformed files are skipped with a warning.
    pub fn load() -> Self {
        let mut config = Config::default();

        let mut layers = vec![PathBuf::from(SYSTEM_CONFIG)];
        if let Some(config_dir) = dirs::config_dir() {
            layers.push(config_dir.join("debboost").join("config.toml"));
        }
        for path in layers {
            if !path.exists() {
                continue;
            }
            match Self::from_file(&path) {
                Ok(parsed) => config = config.merge(parsed),
                Err(e) => warn!(error = %e, "ignoring configuration file"),
            }
        }

        config.apply_env_overrides()
    }

    /// Parse one configuration file
    pub fn from_file(path: &Path) -> DebboostResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            DebboostError::filesystem(path.display().to_string(), "cannot read configuration", e)
        })?;
        toml::from_str(&content).map_err(|e| DebboostError::ConfigError {
            message: format!("{}: {}", path.display(), e),
        })
    }

    /// Layer an explicitly requested file on top; errors are not skipped
    pub fn with_file(self, path: &Path) -> DebboostResult<Self> {
        Ok(self.merge(Self::from_file(path)?))
    }

    /// Merge another config into this one (other takes precedence for non-default values)
    fn merge(mut self, other: Config) -> Self {
        self.download = self.download.merge(other.download);
        self.fetch = self.fetch.merge(other.fetch);

        let default = LoggingConfig::default();
        if other.logging.level != default.level {
            self.logging.level = other.logging.level;
        }
        if other.logging.file.is_some() {
            self.logging.file = other.logging.file;
        }

        self
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(n) = var("DEBBOOST_PER_MIRROR").and_then(|v| v.parse().ok()) {
            self.download.per_mirror_limit = n;
        }
        if let Some(n) = var("DEBBOOST_GLOBAL_LIMIT").and_then(|v| v.parse().ok()) {
            self.download.global_limit = n;
        }
        if let Some(val) = var("DEBBOOST_ALLOW_UNAUTHENTICATED") {
            self.download.allow_unauthenticated = flag(&val);
        }
        if let Some(val) = var("DEBBOOST_PROXY").filter(|v| !v.is_empty()) {
            self.download.proxy = Some(val);
        }
        if let Some(val) = var("DEBBOOST_HTTPS_ONLY") {
            self.fetch.https_only = flag(&val);
        }
        if let Some(val) = var("DEBBOOST_LOG_LEVEL") {
            self.logging.level = val;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        let d = &self.download;
        if d.per_mirror_limit == 0 {
            return Err("per_mirror_limit must be at least 1".to_string());
        }
        if d.global_limit == 0 {
            return Err("global_limit must be at least 1".to_string());
        }
        if d.per_mirror_limit > d.global_limit {
            return Err(format!(
                "per_mirror_limit ({}) cannot exceed global_limit ({})",
                d.per_mirror_limit, d.global_limit
            ));
        }
        if d.connect_timeout_secs == 0 || d.attempt_timeout_secs == 0 || d.stall_timeout_secs == 0 {
            return Err("download timeouts must be at least 1 second".to_string());
        }

        let f = &self.fetch;
        if f.concurrency == 0 {
            return Err("fetch concurrency must be at least 1".to_string());
        }
        if f.timeout_secs == 0 {
            return Err("fetch timeout must be at least 1 second".to_string());
        }
        if f.auto_count == 0 || f.display_count == 0 {
            return Err("fetch counts must be at least 1".to_string());
        }
        Ok(())
    }

    /// Settings handed to the download engine
    pub fn download_config(&self) -> DownloadConfig {
        let d = &self.download;
        DownloadConfig {
            per_mirror_limit: d.per_mirror_limit,
            global_limit: d.global_limit,
            connect_timeout: Duration::from_secs(d.connect_timeout_secs),
            attempt_timeout: Duration::from_secs(d.attempt_timeout_secs),
            stall_timeout: Duration::from_secs(d.stall_timeout_secs),
            allow_unauthenticated: d.allow_unauthenticated,
            fail_fast: d.fail_fast,
            partial_dir: d.partial_dir.clone(),
            proxy: d.proxy.clone(),
            user_agent: d.user_agent.clone(),
        }
    }

    /// Settings handed to the benchmark engine for `release`
    pub fn benchmark_config(&self, release: &str) -> BenchmarkConfig {
        let f = &self.fetch;
        BenchmarkConfig {
            release: release.to_string(),
            concurrency: f.concurrency,
            timeout: Duration::from_secs(f.timeout_secs),
            https_only: f.https_only,
            check_sources: f.sources,
            countries: f.countries.iter().map(|c| c.to_ascii_uppercase()).collect(),
        }
    }
}

impl DownloadSection {
    fn merge(mut self, other: DownloadSection) -> Self {
        let default = DownloadSection::default();

        if other.per_mirror_limit != default.per_mirror_limit {
            self.per_mirror_limit = other.per_mirror_limit;
        }
        if other.global_limit != default.global_limit {
            self.global_limit = other.global_limit;
        }
        if other.connect_timeout_secs != default.connect_timeout_secs {
            self.connect_timeout_secs = other.connect_timeout_secs;
        }
        if other.attempt_timeout_secs != default.attempt_timeout_secs {
            self.attempt_timeout_secs = other.attempt_timeout_secs;
        }
        if other.stall_timeout_secs != default.stall_timeout_secs {
            self.stall_timeout_secs = other.stall_timeout_secs;
        }
        if other.allow_unauthenticated != default.allow_unauthenticated {
            self.allow_unauthenticated = other.allow_unauthenticated;
        }
        if other.fail_fast != default.fail_fast {
            self.fail_fast = other.fail_fast;
        }
        if other.archive_dir != default.archive_dir {
            self.archive_dir = other.archive_dir;
        }
        if other.partial_dir.is_some() {
            self.partial_dir = other.partial_dir;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.user_agent != default.user_agent {
            self.user_agent = other.user_agent;
        }

        self
    }
}

impl FetchSection {
    fn merge(mut self, other: FetchSection) -> Self {
        let default = FetchSection::default();

        if other.concurrency != default.concurrency {
            self.concurrency = other.concurrency;
        }
        if other.timeout_secs != default.timeout_secs {
            self.timeout_secs = other.timeout_secs;
        }
        if other.auto_count != default.auto_count {
            self.auto_count = other.auto_count;
        }
        if other.display_count != default.display_count {
            self.display_count = other.display_count;
        }
        if other.https_only != default.https_only {
            self.https_only = other.https_only;
        }
        if !other.countries.is_empty() {
            self.countries = other.countries;
        }
        if other.non_free != default.non_free {
            self.non_free = other.non_free;
        }
        if other.sources != default.sources {
            self.sources = other.sources;
        }
        if other.output != default.output {
            self.output = other.output;
        }

        self
    }
}
