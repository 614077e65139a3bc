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

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use console::style;
use debboost::config::Config;
use debboost::downloader::uris::MirrorListResolver;
use debboost::downloader::{DownloadTask, HttpTransport, Scheduler, TaskSpec, Transport};
use debboost::error::DebboostError;
use debboost::fetch::release::OS_RELEASE;
use debboost::fetch::sources::{build_entries, SOURCE_LIST, SOURCE_PARTS};
use debboost::fetch::{
    detect_release, discover_countries, fetch_master_list, host_architectures, parse_master_list,
    render_sources, select_automatic, write_sources, BenchmarkEngine, ExistingSources,
    InteractiveSelector, ReleaseOverride, TerminalPrompt,
};
use debboost::logging;
use debboost::progress::{print_summary, ConsoleObserver, ProbeProgress};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\n",
    "Copyright (C) 2025  compiledkernel-idk and debboost contributors\n",
    "License GPLv3+: GNU GPL version 3 or later <https://gnu.org/licenses/gpl.html>\n\n",
    "This is free software; you are free to change and redistribute it.\n",
    "There is NO WARRANTY, to the extent permitted by law."
);

#[derive(Parser)]
#[command(name = "debboost")]
#[command(author = "debboost contributors")]
#[command(version = VERSION)]
#[command(long_version = LONG_VERSION)]
#[command(about = "Concurrent package downloader and mirror ranking for Debian-family systems.")]
struct Cli {
    /// Extra configuration file, applied after the system and user files
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Show debug logs
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true, value_name = "FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download files, falling back across their mirrors
    Download(DownloadArgs),
    /// Rank mirrors by latency and write a sources file
    Fetch(FetchArgs),
}

#[derive(Args)]
struct DownloadArgs {
    /// JSON list of tasks: uris, destination, size, hashes
    #[arg(short, long, value_name = "FILE")]
    manifest: Option<PathBuf>,

    /// URI to download, optionally suffixed with `:sha256:<hex>`
    #[arg(value_name = "URI")]
    uris: Vec<String>,

    /// Directory for downloaded files
    #[arg(short, long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Simultaneous transfers per mirror
    #[arg(long, value_name = "N")]
    per_mirror: Option<usize>,

    /// Simultaneous transfers overall
    #[arg(long, value_name = "N")]
    global_limit: Option<usize>,

    /// Accept files that carry no hash sum
    #[arg(long)]
    allow_unauthenticated: bool,

    /// Stop everything on the first failed file
    #[arg(long)]
    fail_fast: bool,

    /// Write the batch report as JSON
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,
}

#[derive(Args)]
struct FetchArgs {
    /// Debian release to fetch mirrors for
    #[arg(long, value_name = "RELEASE", conflicts_with_all = ["ubuntu", "devuan"])]
    debian: Option<String>,

    /// Ubuntu release to fetch mirrors for
    #[arg(long, value_name = "RELEASE", conflicts_with = "devuan")]
    ubuntu: Option<String>,

    /// Devuan release to fetch mirrors for
    #[arg(long, value_name = "RELEASE")]
    devuan: Option<String>,

    /// Number of mirrors to pick
    #[arg(long, value_name = "N")]
    fetches: Option<usize>,

    /// Only use https mirrors
    #[arg(long)]
    https_only: bool,

    /// Add deb-src lines, keeping only mirrors that serve sources
    #[arg(long)]
    sources: bool,

    /// Add contrib, non-free and non-free-firmware
    #[arg(long)]
    non_free: bool,

    /// Pick the fastest mirrors without asking
    #[arg(long)]
    auto: bool,

    /// Bypass any confirmation prompts
    #[arg(short = 'y', long)]
    assume_yes: bool,

    /// Only keep mirrors from this country code (repeatable)
    #[arg(short = 'c', long = "country", value_name = "CC")]
    countries: Vec<String>,

    /// Where to write the sources file
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Read the mirror master list from a file instead of the network
    #[arg(long, value_name = "FILE")]
    master_list: Option<PathBuf>,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load();
    if let Some(path) = &cli.config {
        config = config
            .with_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?;
    }
    Ok(config)
}

/// Cancel `token` on Ctrl-C or SIGTERM
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!("cannot listen for SIGTERM: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate => {}
        }
        eprintln!("\n{}", style(":: interrupted, cancelling...").yellow());
        token.cancel();
    });
}

fn require_root(path: &Path) -> Result<()> {
    if path.starts_with("/etc") && unsafe { libc::geteuid() } != 0 {
        return Err(DebboostError::PermissionDenied {
            operation: format!("writing {} requires root privileges", path.display()),
        }
        .into());
    }
    Ok(())
}

fn read_tasks(args: &DownloadArgs, dir: &Path) -> Result<Vec<DownloadTask>> {
    let mut tasks = Vec::new();
    if let Some(manifest) = &args.manifest {
        let content = std::fs::read_to_string(manifest)
            .with_context(|| format!("failed to read {}", manifest.display()))?;
        let specs: Vec<TaskSpec> = serde_json::from_str(&content)
            .with_context(|| format!("invalid manifest {}", manifest.display()))?;
        for spec in specs {
            tasks.push(spec.into_task(dir)?);
        }
    }
    for uri in &args.uris {
        tasks.push(DownloadTask::from_inline(uri, dir)?);
    }
    Ok(tasks)
}

async fn run_download(mut config: Config, args: DownloadArgs) -> Result<()> {
    if let Some(n) = args.per_mirror {
        config.download.per_mirror_limit = n;
    }
    if let Some(n) = args.global_limit {
        config.download.global_limit = n;
    }
    config.download.allow_unauthenticated |= args.allow_unauthenticated;
    config.download.fail_fast |= args.fail_fast;
    config
        .validate()
        .map_err(|message| DebboostError::ConfigError { message })?;

    let dir = args
        .output_dir
        .clone()
        .unwrap_or_else(|| config.download.archive_dir.clone());
    let tasks = read_tasks(&args, &dir)?;
    if tasks.is_empty() {
        bail!("nothing to download, pass URIs or --manifest");
    }

    let download = config.download_config();
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&download.http_settings())?);
    let tasks = MirrorListResolver::new(transport.as_ref(), download.attempt_timeout)
        .resolve(tasks)
        .await?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    println!(
        "{}",
        style(format!(":: downloading {} files into {}...", tasks.len(), dir.display())).bold()
    );
    let observer = Arc::new(ConsoleObserver::new(tasks.len()));
    let scheduler = Scheduler::new(Arc::clone(&transport), download).with_observer(observer.clone());
    let report = scheduler.run(tasks, cancel).await;
    observer.finish();

    print_summary(&report);
    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
        debug!(path = %path.display(), "report written");
    }

    if !report.is_success() {
        return Err(anyhow!(
            "{} failed, {} cancelled",
            report.failed.len(),
            report.cancelled.len()
        ));
    }
    Ok(())
}

async fn run_fetch(mut config: Config, args: FetchArgs) -> Result<()> {
    let fetch = &mut config.fetch;
    if let Some(n) = args.fetches {
        fetch.auto_count = n;
    }
    fetch.https_only |= args.https_only;
    fetch.sources |= args.sources;
    fetch.non_free |= args.non_free;
    if !args.countries.is_empty() {
        fetch.countries = args.countries.iter().map(|c| c.to_ascii_uppercase()).collect();
    }
    if let Some(output) = &args.output {
        fetch.output = output.clone();
    }
    config
        .validate()
        .map_err(|message| DebboostError::ConfigError { message })?;
    let fetch = config.fetch.clone();

    let overrides = ReleaseOverride {
        debian: args.debian.clone(),
        ubuntu: args.ubuntu.clone(),
        devuan: args.devuan.clone(),
    };
    let info = detect_release(&overrides, Path::new(OS_RELEASE))?;
    require_root(&fetch.output)?;

    let download = config.download_config();
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&download.http_settings())?);

    println!("{}", style(format!(":: fetching {} mirror list...", info.distro)).bold());
    let text = fetch_master_list(
        transport.as_ref(),
        info.distro,
        args.master_list.as_deref(),
        download.attempt_timeout,
    )
    .await?;

    if !fetch.countries.is_empty() {
        let known = discover_countries(info.distro, &text);
        if let Some(unknown) = fetch.countries.iter().find(|c| !known.contains(*c)) {
            bail!(
                "{} is not a valid country code, choose from: {}",
                unknown,
                known.into_iter().collect::<Vec<_>>().join(" ")
            );
        }
    }

    let arches = host_architectures();
    let candidates = parse_master_list(info.distro, &text, &fetch.countries, &arches);
    if candidates.is_empty() {
        return Err(DebboostError::NoMirrorsFound.into());
    }

    println!(
        "{}",
        style(format!(":: testing {} mirrors for {}...", candidates.len(), info.release)).bold()
    );
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());
    let engine = BenchmarkEngine::new(Arc::clone(&transport), config.benchmark_config(&info.release));
    let progress = ProbeProgress::new(candidates.len());
    let report = engine.run(candidates, &progress, &cancel).await;
    progress.finish();
    if cancel.is_cancelled() {
        bail!("interrupted");
    }
    if report.ranked.is_empty() {
        return Err(DebboostError::NoMirrorsFound.into());
    }

    let existing = ExistingSources::load(Path::new(SOURCE_LIST), Path::new(SOURCE_PARTS), &fetch.output);
    let mut prompt = TerminalPrompt;
    let chosen = if args.auto {
        let chosen = select_automatic(&report.ranked, fetch.auto_count, &existing, &info.release);
        if chosen.len() < fetch.auto_count {
            eprintln!(
                "{} unable to fetch {} mirrors",
                style("notice:").bold().yellow(),
                fetch.auto_count
            );
        }
        chosen
    } else {
        InteractiveSelector::new(fetch.display_count).choose(
            &report.ranked,
            &existing,
            &info.release,
            &mut prompt,
        )?
    };
    if chosen.is_empty() {
        return Err(DebboostError::NoMirrorsFound.into());
    }

    let entries = build_entries(
        transport.as_ref(),
        &chosen,
        info.distro,
        &info.release,
        fetch.non_free,
        download.attempt_timeout,
    )
    .await;
    let content = render_sources(&entries, fetch.sources);
    print!("{}", content);

    write_sources(&fetch.output, &content, args.assume_yes, &mut prompt)?;
    println!(
        "{}",
        style(format!(":: sources have been written to {}", fetch.output.display()))
            .green()
            .bold()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let level = if cli.verbose { "debug" } else { config.logging.level.as_str() };
    let log_file = cli.log_file.as_deref().or(config.logging.file.as_deref());
    logging::init_with_file(level, log_file);

    match cli.command {
        Command::Download(args) => run_download(config, args).await,
        Command::Fetch(args) => run_fetch(config, args).await,
    }
}
