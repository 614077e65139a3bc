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

//! Terminal progress bars and result tables.

use crate::downloader::mirror::{mirror_origin, MirrorStatsSnapshot};
use crate::downloader::observer::Observer;
use crate::downloader::scheduler::{BatchReport, TaskOutcome};
use crate::downloader::task::{DownloadTask, TaskState};
use crate::error::ErrorKind;
use crate::fetch::benchmark::BenchmarkObserver;
use crate::fetch::masterlist::MirrorCandidate;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, CellAlignment, Color, Table};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

fn bar_style(template: &str, chars: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars(chars)
}

/// Human readable byte count
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GiB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MiB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KiB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn truncate_name(name: &str, max: usize) -> String {
    if name.chars().count() <= max {
        return name.to_string();
    }
    let kept: String = name.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}

/// Draws one bar per in-flight file under a bar counting finished files
pub struct ConsoleObserver {
    mp: MultiProgress,
    main_pb: ProgressBar,
    bars: Mutex<HashMap<PathBuf, ProgressBar>>,
}

impl ConsoleObserver {
    pub fn new(total: usize) -> Self {
        Self::with_target(total, ProgressDrawTarget::stdout())
    }

    /// Observer that tracks state without drawing
    pub fn hidden(total: usize) -> Self {
        Self::with_target(total, ProgressDrawTarget::hidden())
    }

    fn with_target(total: usize, target: ProgressDrawTarget) -> Self {
        let mp = MultiProgress::with_draw_target(target);
        let main_pb = mp.add(ProgressBar::new(total as u64));
        main_pb.set_style(bar_style(
            "{spinner:.cyan} {msg} [{bar:40.cyan/blue}] {pos}/{len}",
            "=>-",
        ));
        main_pb.set_message("downloading");
        Self {
            mp,
            main_pb,
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bars(&self) -> MutexGuard<'_, HashMap<PathBuf, ProgressBar>> {
        self.bars.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Files finished so far
    pub fn finished_count(&self) -> u64 {
        self.main_pb.position()
    }

    /// Bars still on screen
    pub fn active_bars(&self) -> usize {
        self.bars().len()
    }

    pub fn finish(&self) {
        for (_, pb) in self.bars().drain() {
            pb.finish_and_clear();
        }
        self.main_pb.finish_and_clear();
    }
}

impl Observer for ConsoleObserver {
    fn started(&self, task: &DownloadTask, uri: &str, size: Option<u64>) {
        let mut bars = self.bars();
        let pb = bars.entry(task.destination.clone()).or_insert_with(|| {
            let pb = self.mp.insert_before(&self.main_pb, ProgressBar::new(0));
            pb.set_style(bar_style(
                "   {spinner:.blue} {msg} [{bar:25.blue/cyan}] {bytes}/{total_bytes} {bytes_per_sec}",
                "=>-",
            ));
            pb
        });
        pb.set_length(size.unwrap_or(0));
        pb.set_position(0);
        pb.set_message(format!(
            "{} {}",
            truncate_name(&task.display_name(), 30),
            style(mirror_origin(uri)).dim()
        ));
    }

    fn progress(&self, task: &DownloadTask, bytes_done: u64) {
        if let Some(pb) = self.bars().get(&task.destination) {
            pb.set_position(bytes_done);
        }
    }

    fn verifying(&self, task: &DownloadTask, _uri: &str) {
        if let Some(pb) = self.bars().get(&task.destination) {
            pb.set_message(format!("verifying {}", truncate_name(&task.display_name(), 30)));
        }
    }

    fn failed(&self, task: &DownloadTask, uri: &str, kind: ErrorKind) {
        let _ = self.mp.println(format!(
            "{} {} from {}: {}",
            style("::").bold().yellow(),
            task.display_name(),
            mirror_origin(uri),
            kind
        ));
    }

    fn finished(&self, outcome: &TaskOutcome) {
        if let Some(pb) = self.bars().remove(&outcome.destination) {
            pb.finish_and_clear();
        }
        if outcome.state == TaskState::Failed {
            let _ = self.mp.println(format!(
                "{} {}",
                style("error:").bold().red(),
                outcome
                    .message
                    .as_deref()
                    .unwrap_or("download failed")
            ));
        }
        self.main_pb.inc(1);
    }
}

/// Counts finished latency probes
pub struct ProbeProgress {
    pb: ProgressBar,
}

impl ProbeProgress {
    pub fn new(total: usize) -> Self {
        let pb = ProgressBar::new(total as u64);
        pb.set_style(bar_style(
            "{spinner:.green} [latency] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            "#>-",
        ));
        Self { pb }
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

impl BenchmarkObserver for ProbeProgress {
    fn probed(&self, candidate: &MirrorCandidate) {
        self.pb.set_message(candidate.host().to_string());
        self.pb.inc(1);
    }
}

/// Per-mirror counters of a finished batch
pub fn mirror_stats_table(mirrors: &[MirrorStatsSnapshot]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec![
        Cell::new("Mirror").fg(Color::Cyan),
        Cell::new("Files").fg(Color::Cyan),
        Cell::new("Failures").fg(Color::Cyan),
        Cell::new("Downloaded").fg(Color::Cyan),
        Cell::new("Speed").fg(Color::Cyan),
    ]);
    for mirror in mirrors {
        let failures = if mirror.failures > 0 { Color::Red } else { Color::Green };
        table.add_row(vec![
            Cell::new(&mirror.origin),
            Cell::new(mirror.successes).set_alignment(CellAlignment::Right),
            Cell::new(mirror.failures)
                .fg(failures)
                .set_alignment(CellAlignment::Right),
            Cell::new(format_bytes(mirror.bytes)).fg(Color::Magenta),
            Cell::new(format!("{}/s", format_bytes(mirror.throughput))),
        ]);
    }
    table
}

/// Print the outcome of a batch
pub fn print_summary(report: &BatchReport) {
    if !report.mirrors.is_empty() {
        println!("{}", mirror_stats_table(&report.mirrors));
    }
    for outcome in &report.unverified {
        println!(
            "{} {} was not verified, it carries no hash",
            style("warning:").bold().yellow(),
            outcome.destination.display()
        );
    }
    for outcome in &report.failed {
        println!(
            "{} {}",
            style("error:").bold().red(),
            outcome.message.as_deref().unwrap_or("download failed")
        );
    }

    let line = format!(
        ":: {} of {} files ready, {} fetched in {:.1}s",
        report.succeeded.len() + report.unverified.len(),
        report.total(),
        format_bytes(report.bytes()),
        report.elapsed_ms as f64 / 1000.0
    );
    if report.is_success() {
        println!("{}", style(line).bold().green());
    } else {
        println!("{}", style(line).bold().red());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GiB");
    }

    #[test]
    fn test_truncate_name() {
        assert_eq!(truncate_name("hello.deb", 30), "hello.deb");
        assert_eq!(truncate_name("libreoffice-core_7.4.7_amd64.deb", 12), "libreoffi...");
    }

    #[test]
    fn test_observer_tracks_bars() {
        let observer = ConsoleObserver::hidden(2);
        let task = DownloadTask::new(vec!["http://a.example/pool/a.deb".into()], "/tmp/a.deb");

        observer.started(&task, "http://a.example/pool/a.deb", Some(100));
        observer.progress(&task, 40);
        assert_eq!(observer.active_bars(), 1);

        // a fallback attempt reuses the bar
        observer.failed(&task, "http://a.example/pool/a.deb", ErrorKind::Timeout);
        observer.started(&task, "http://b.example/pool/a.deb", Some(100));
        assert_eq!(observer.active_bars(), 1);

        let outcome = TaskOutcome {
            destination: task.destination.clone(),
            state: TaskState::Succeeded,
            authenticated: false,
            mirror_used: None,
            attempts: Vec::new(),
            error: None,
            message: None,
            bytes: 100,
            cached: false,
        };
        observer.finished(&outcome);
        assert_eq!(observer.active_bars(), 0);
        assert_eq!(observer.finished_count(), 1);
        observer.finish();
    }

    #[test]
    fn test_mirror_stats_table() {
        let table = mirror_stats_table(&[MirrorStatsSnapshot {
            origin: "http://deb.debian.org".to_string(),
            successes: 3,
            failures: 1,
            bytes: 2048,
            throughput: 1024,
        }]);
        let rendered = table.to_string();
        assert!(rendered.contains("http://deb.debian.org"));
        assert!(rendered.contains("2.00 KiB"));
        assert!(rendered.contains("1.00 KiB/s"));
    }
}
