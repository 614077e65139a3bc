/*
 * debboost - Concurrent package downloader and mirror ranking engine.
 * Copyright (C) 2025  compiledkernel-idk and debboost contributors
 */

//! Parsers for the mirror master lists published by each distro.

use super::benchmark::Score;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

/// Supported distributions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Distro {
    Debian,
    Ubuntu,
    Devuan,
}

impl Distro {
    pub fn name(&self) -> &'static str {
        match self {
            Distro::Debian => "Debian",
            Distro::Ubuntu => "Ubuntu",
            Distro::Devuan => "Devuan",
        }
    }

    /// Where the distro publishes its list of official mirrors
    pub fn master_list_url(&self) -> &'static str {
        match self {
            Distro::Debian => "https://mirror-master.debian.org/status/Mirrors.masterlist",
            Distro::Ubuntu => "https://launchpad.net/ubuntu/+archivemirrors-rss",
            Distro::Devuan => "https://pkgmaster.devuan.org/mirror_list.txt",
        }
    }

    /// Components written for each mirror
    pub fn components(&self, non_free: bool) -> &'static str {
        match self {
            Distro::Ubuntu => "main restricted universe multiverse",
            Distro::Debian | Distro::Devuan if non_free => "main contrib non-free",
            Distro::Debian | Distro::Devuan => "main",
        }
    }
}

impl fmt::Display for Distro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Ftp,
}

impl Protocol {
    fn from_url(url: &str) -> Self {
        if url.starts_with("https://") {
            Protocol::Https
        } else if url.starts_with("ftp://") {
            Protocol::Ftp
        } else {
            Protocol::Http
        }
    }
}

/// One mirror entry from a master list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MirrorCandidate {
    /// Archive root, always ending in `/`
    pub base_url: String,
    pub country_code: String,
    pub protocol: Protocol,
    pub supports_source_repo: bool,
    pub score: Score,
}

impl MirrorCandidate {
    pub fn new(base_url: &str, country_code: &str) -> Self {
        let base_url = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        Self {
            protocol: Protocol::from_url(&base_url),
            base_url,
            country_code: country_code.to_ascii_uppercase(),
            supports_source_repo: false,
            score: Score::Pending,
        }
    }

    /// Host part of the base URL, used to spot one mirror under several URLs
    pub fn host(&self) -> &str {
        let rest = self
            .base_url
            .split_once("://")
            .map_or(self.base_url.as_str(), |(_, rest)| rest);
        rest.split(['/', ':']).next().unwrap_or(rest)
    }

    /// Switch the base URL and protocol to `https`
    pub(crate) fn upgrade_to_https(&mut self) {
        if let Some(rest) = self.base_url.strip_prefix("http://") {
            self.base_url = format!("https://{}", rest);
            self.protocol = Protocol::Https;
        }
    }
}

fn ubuntu_country() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<mirror:countrycode>\s*([A-Za-z]+)\s*</mirror:countrycode>").ok())
        .as_ref()
}

fn ubuntu_link() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<link>\s*(\S+?)\s*</link>").ok())
        .as_ref()
}

/// Split a master list into one chunk per mirror
fn entries(distro: Distro, text: &str) -> Vec<&str> {
    match distro {
        // The text before the first <item> is the channel header
        Distro::Ubuntu => text.split("<item>").skip(1).collect(),
        Distro::Debian | Distro::Devuan => text
            .split("\n\n")
            .filter(|chunk| !chunk.trim().is_empty())
            .collect(),
    }
}

fn field_values<'t>(entry: &'t str, key: &str) -> impl Iterator<Item = &'t str> + 't {
    let prefix = format!("{}:", key);
    entry.lines().filter_map(move |line| {
        line.strip_prefix(prefix.as_str()).map(str::trim)
    })
}

/// Country codes an entry serves
fn entry_countries(distro: Distro, entry: &str) -> Vec<String> {
    match distro {
        // Country: NL Netherlands
        Distro::Debian => field_values(entry, "Country")
            .filter_map(|value| value.split_whitespace().next())
            .map(str::to_ascii_uppercase)
            .collect(),
        // CountryCode:  NL | BE | CH
        Distro::Devuan => field_values(entry, "CountryCode")
            .flat_map(|value| value.split('|'))
            .map(|code| code.trim().to_ascii_uppercase())
            .filter(|code| !code.is_empty())
            .collect(),
        Distro::Ubuntu => ubuntu_country()
            .map(|re| {
                re.captures_iter(entry)
                    .map(|caps| caps[1].to_ascii_uppercase())
                    .collect()
            })
            .unwrap_or_default(),
    }
}

fn debian_url(entry: &str, arches: &[String]) -> Option<String> {
    let site = field_values(entry, "Site").next()?;
    let path = field_values(entry, "Archive-http").next()?;

    let listed: Vec<&str> = field_values(entry, "Archive-architecture")
        .flat_map(str::split_whitespace)
        .collect();
    let serves_all = listed.is_empty()
        || listed.contains(&"any")
        || arches.iter().all(|arch| listed.contains(&arch.as_str()));
    if !serves_all {
        return None;
    }

    Some(format!("http://{}{}", site, path))
}

fn ubuntu_url(entry: &str, arches: &[String]) -> Option<String> {
    let link = ubuntu_link()?.captures(entry)?.get(1)?.as_str();
    // Architectures other than amd64 and i386 live on the ports archive
    let ports_only = !arches.iter().any(|arch| arch == "amd64" || arch == "i386");
    if ports_only && !link.contains("ubuntu-ports") {
        return None;
    }
    Some(link.to_string())
}

fn devuan_url(entry: &str) -> Option<String> {
    let protocols = field_values(entry, "Protocols").next()?;
    if !protocols.split('|').any(|p| p.trim().eq_ignore_ascii_case("http")) {
        return None;
    }
    let base = field_values(entry, "BaseURL").next()?.trim_end_matches('/');
    if base.ends_with("/devuan") {
        Some(format!("http://{}/", base))
    } else {
        Some(format!("http://{}/devuan/", base))
    }
}

/// Parse a master list into candidates
///
/// With an empty `countries` every country is accepted. A candidate's
/// country is the first requested country it serves, or its first listed
/// country when unfiltered. Duplicate URLs keep their first occurrence.
pub fn parse_master_list(
    distro: Distro,
    text: &str,
    countries: &[String],
    arches: &[String],
) -> Vec<MirrorCandidate> {
    let wanted: Vec<String> = countries.iter().map(|c| c.to_ascii_uppercase()).collect();
    let mut seen = BTreeSet::new();
    let mut candidates = Vec::new();

    for entry in entries(distro, text) {
        let served = entry_countries(distro, entry);
        let country = if wanted.is_empty() {
            served.first().cloned().unwrap_or_default()
        } else {
            match wanted.iter().find(|c| served.contains(c)) {
                Some(country) => country.clone(),
                None => continue,
            }
        };

        let url = match distro {
            Distro::Debian => debian_url(entry, arches),
            Distro::Ubuntu => ubuntu_url(entry, arches),
            Distro::Devuan => devuan_url(entry),
        };
        let Some(url) = url else {
            continue;
        };

        let candidate = MirrorCandidate::new(&url, &country);
        if seen.insert(candidate.base_url.clone()) {
            candidates.push(candidate);
        }
    }

    candidates
}

/// Every country code mentioned in a master list
pub fn discover_countries(distro: Distro, text: &str) -> BTreeSet<String> {
    entries(distro, text)
        .into_iter()
        .flat_map(|entry| entry_countries(distro, entry))
        .collect()
}
