/*
 * debboost - Concurrent package downloader and mirror ranking engine.
 * Copyright (C) 2025  compiledkernel-idk and debboost contributors
 */

//! Choosing mirrors from the ranked list, automatically or by asking.
//!
//! Selection expressions use 1-based indices into the displayed list:
//! `1,3 5` picks single entries, `2..6` an inclusive range and
//! `S..a..b` every S-th index from `a` up to `b`. A stride of 0 means
//! every other index, so `0..1..9` picks the odd entries.

use super::masterlist::MirrorCandidate;
use super::sources::ExistingSources;
use crate::error::{DebboostError, DebboostResult, RecoveryStrategy};
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, CellAlignment, Color, Table};
use console::style;
use std::collections::{BTreeSet, HashSet};
use std::io::{self, Write};
use tracing::debug;

/// Line-oriented questions to the user
pub trait Prompt {
    /// Print a block of text
    fn show(&mut self, text: &str);

    /// Ask a question and return the answer without the newline
    fn read_line(&mut self, question: &str) -> io::Result<String>;

    /// Yes/no question; an empty answer means yes
    fn confirm(&mut self, question: &str) -> io::Result<bool> {
        let answer = self.read_line(&format!("{} [Y/n]", question))?;
        let answer = answer.trim().to_lowercase();
        Ok(answer.is_empty() || answer.starts_with('y'))
    }
}

/// Prompt on stdin/stdout
#[derive(Debug, Default)]
pub struct TerminalPrompt;

impl Prompt for TerminalPrompt {
    fn show(&mut self, text: &str) {
        println!("{}", text);
    }

    fn read_line(&mut self, question: &str) -> io::Result<String> {
        print!("\n{} {} ", style("::").bold().cyan(), question);
        io::stdout().flush()?;
        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        Ok(input.trim_end_matches(['\r', '\n']).to_string())
    }
}

fn parse_index(token: &str, part: &str) -> DebboostResult<usize> {
    part.trim().parse().map_err(|_| DebboostError::SelectionParse {
        reason: format!("'{}' is not a valid selection", token),
    })
}

fn check_index(index: usize, count: usize) -> DebboostResult<usize> {
    if index == 0 || index > count {
        return Err(DebboostError::IndexOutOfRange { index, max: count });
    }
    Ok(index)
}

/// Resolve a selection expression to 1-based indices within `1..=count`
///
/// Empty input selects everything.
pub fn parse_selection(input: &str, count: usize) -> DebboostResult<BTreeSet<usize>> {
    let tokens: Vec<&str> = input
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.is_empty() {
        return Ok((1..=count).collect());
    }

    let mut selected = BTreeSet::new();
    for token in tokens {
        let parts: Vec<&str> = token.split("..").collect();
        let (stride, start, end) = match parts.as_slice() {
            [single] => {
                selected.insert(check_index(parse_index(token, single)?, count)?);
                continue;
            }
            [start, end] => (1, parse_index(token, start)?, parse_index(token, end)?),
            [stride, start, end] => {
                let stride = match parse_index(token, stride)? {
                    0 => 2,
                    n => n,
                };
                (stride, parse_index(token, start)?, parse_index(token, end)?)
            }
            _ => {
                return Err(DebboostError::SelectionParse {
                    reason: format!("'{}' is not a valid range", token),
                })
            }
        };

        if start > end {
            return Err(DebboostError::SelectionParse {
                reason: format!("range '{}' starts after it ends", token),
            });
        }
        check_index(start, count)?;
        check_index(end, count)?;
        selected.extend((start..=end).step_by(stride));
    }
    Ok(selected)
}

/// First `count` reachable mirrors, one per host, skipping configured ones
pub fn select_automatic(
    ranked: &[MirrorCandidate],
    count: usize,
    existing: &ExistingSources,
    release: &str,
) -> Vec<MirrorCandidate> {
    let mut hosts = HashSet::new();
    ranked
        .iter()
        .filter(|m| m.score.is_reachable())
        .filter(|m| {
            let configured = existing.contains(&m.base_url, release);
            if configured {
                debug!(mirror = %m.base_url, "already configured");
            }
            !configured
        })
        .filter(|m| hosts.insert(m.host().to_string()))
        .take(count)
        .cloned()
        .collect()
}

/// Table of mirrors with their 1-based index
pub fn mirror_table(mirrors: &[MirrorCandidate]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec![
        Cell::new("Index").fg(Color::Cyan),
        Cell::new("Mirror").fg(Color::Cyan),
        Cell::new("Country").fg(Color::Cyan),
        Cell::new("Score").fg(Color::Cyan),
    ]);
    for (i, mirror) in mirrors.iter().enumerate() {
        let score = mirror
            .score
            .millis()
            .map_or_else(|| "-".to_string(), |ms| format!("{} ms", ms));
        table.add_row(vec![
            Cell::new(i + 1).set_alignment(CellAlignment::Right),
            Cell::new(&mirror.base_url),
            Cell::new(&mirror.country_code),
            Cell::new(score).fg(Color::Green),
        ]);
    }
    table
}

/// Lets the user pick from the fastest mirrors
pub struct InteractiveSelector {
    display_count: usize,
}

impl InteractiveSelector {
    pub fn new(display_count: usize) -> Self {
        Self {
            display_count: display_count.max(1),
        }
    }

    /// Reachable, not yet configured mirrors offered to the user
    pub fn candidates(
        &self,
        ranked: &[MirrorCandidate],
        existing: &ExistingSources,
        release: &str,
    ) -> Vec<MirrorCandidate> {
        ranked
            .iter()
            .filter(|m| m.score.is_reachable() && !existing.contains(&m.base_url, release))
            .take(self.display_count)
            .cloned()
            .collect()
    }

    /// Ask until the user confirms a selection
    pub fn choose(
        &self,
        ranked: &[MirrorCandidate],
        existing: &ExistingSources,
        release: &str,
        prompt: &mut dyn Prompt,
    ) -> DebboostResult<Vec<MirrorCandidate>> {
        let shown = self.candidates(ranked, existing, release);
        if shown.is_empty() {
            return Err(DebboostError::NoMirrorsFound);
        }
        let io_error = |e: io::Error| DebboostError::filesystem("<stdin>", "cannot read answer", e);

        loop {
            prompt.show(&format!(
                "{}\n{}\n{}",
                style("Fastest Mirrors").bold().green(),
                mirror_table(&shown),
                style("Score is how many milliseconds it takes to download the Release file").italic()
            ));

            let answer = prompt
                .read_line(&format!(
                    "Mirrors you want to keep, separated by space or comma (1..{}):",
                    shown.len()
                ))
                .map_err(io_error)?;

            let indices = match parse_selection(&answer, shown.len()) {
                Ok(indices) => indices,
                Err(e) if e.recovery_strategy() == RecoveryStrategy::Reprompt => {
                    prompt.show(&format!("{} {}", style("error:").bold().red(), e));
                    continue;
                }
                Err(e) => return Err(e),
            };
            debug!(answer = %answer, ?indices, "mirror selection");

            let chosen: Vec<MirrorCandidate> =
                indices.iter().map(|i| shown[i - 1].clone()).collect();
            prompt.show(&format!(
                "{}\n{}",
                style("Selected Mirrors").bold().green(),
                mirror_table(&chosen)
            ));
            if prompt.confirm("Are these mirrors okay?").map_err(io_error)? {
                return Ok(chosen);
            }
        }
    }
}
