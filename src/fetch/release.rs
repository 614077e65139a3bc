/*
 * debboost - Concurrent package downloader and mirror ranking engine.
 * Copyright (C) 2025  compiledkernel-idk and debboost contributors
 */

//! Working out which distro and release the mirrors are for.

use super::masterlist::Distro;
use crate::error::{DebboostError, DebboostResult};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::process::Command;
use tracing::debug;

pub const OS_RELEASE: &str = "/etc/os-release";

/// Distro and codename the sources are generated for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseInfo {
    pub distro: Distro,
    pub release: String,
}

/// Releases given explicitly on the command line
#[derive(Debug, Clone, Default)]
pub struct ReleaseOverride {
    pub debian: Option<String>,
    pub ubuntu: Option<String>,
    pub devuan: Option<String>,
}

impl ReleaseOverride {
    fn pick(&self) -> Option<ReleaseInfo> {
        [
            (Distro::Debian, &self.debian),
            (Distro::Devuan, &self.devuan),
            (Distro::Ubuntu, &self.ubuntu),
        ]
        .into_iter()
        .find_map(|(distro, release)| {
            release
                .as_deref()
                .filter(|r| !r.is_empty())
                .map(|r| ReleaseInfo {
                    distro,
                    release: r.to_string(),
                })
        })
    }
}

fn parse_fields(text: &str) -> HashMap<&str, &str> {
    text.lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim(), value.trim().trim_matches(|c: char| c == '"' || c == '\'')))
        .collect()
}

fn distro_from_id(id: &str) -> Option<Distro> {
    match id.to_ascii_lowercase().as_str() {
        "debian" => Some(Distro::Debian),
        "ubuntu" => Some(Distro::Ubuntu),
        "devuan" => Some(Distro::Devuan),
        _ => None,
    }
}

/// Read distro and codename from the contents of an os-release file
pub fn parse_os_release(text: &str) -> DebboostResult<ReleaseInfo> {
    let fields = parse_fields(text);
    let field = |key: &str| fields.get(key).copied().filter(|v| !v.is_empty());

    let distro = field("ID")
        .and_then(distro_from_id)
        .or_else(|| {
            field("ID_LIKE")?
                .split_whitespace()
                .find_map(distro_from_id)
        })
        .ok_or_else(|| DebboostError::ReleaseDetection {
            reason: format!("{} is not supported", field("NAME").unwrap_or("this distro")),
        })?;

    let specific = match distro {
        Distro::Ubuntu => "UBUNTU_CODENAME",
        Distro::Debian | Distro::Devuan => "DEBIAN_CODENAME",
    };
    let release = match field(specific).or_else(|| field("VERSION_CODENAME")) {
        Some(codename) => codename.to_string(),
        // testing and sid only carry the codename in PRETTY_NAME, e.g. "trixie/sid"
        None if distro == Distro::Debian => field("PRETTY_NAME")
            .and_then(|name| name.split_whitespace().last())
            .and_then(|last| last.split('/').next())
            .map(str::to_string)
            .ok_or_else(|| DebboostError::ReleaseDetection {
                reason: "no codename in os-release".to_string(),
            })?,
        None => {
            return Err(DebboostError::ReleaseDetection {
                reason: "no codename in os-release".to_string(),
            })
        }
    };

    if release == "n/a" {
        return Err(DebboostError::ReleaseDetection {
            reason: format!("{} {} is unsupported", distro, release),
        });
    }
    Ok(ReleaseInfo { distro, release })
}

/// Release from the overrides, falling back to the os-release file
pub fn detect_release(overrides: &ReleaseOverride, os_release: &Path) -> DebboostResult<ReleaseInfo> {
    if let Some(info) = overrides.pick() {
        return Ok(info);
    }
    let text = fs::read_to_string(os_release).map_err(|e| {
        DebboostError::filesystem(os_release.display().to_string(), "cannot read os-release", e)
    })?;
    let info = parse_os_release(&text)?;
    debug!(distro = %info.distro, release = %info.release, "detected release");
    Ok(info)
}

/// Debian name of the architecture this binary was built for
pub fn native_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "x86" => "i386",
        "aarch64" => "arm64",
        "arm" => "armhf",
        "powerpc64" => "ppc64el",
        "loongarch64" => "loong64",
        other => other,
    }
}

/// Architectures dpkg is configured for, native first
pub fn host_architectures() -> Vec<String> {
    let dpkg = |flag: &str| -> Option<String> {
        let output = Command::new("dpkg").arg(flag).output().ok()?;
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).into_owned())
    };

    let mut arches: Vec<String> = match dpkg("--print-architecture") {
        Some(native) => native.split_whitespace().map(str::to_string).collect(),
        None => Vec::new(),
    };
    if arches.is_empty() {
        arches.push(native_architecture().to_string());
    }
    if let Some(foreign) = dpkg("--print-foreign-architectures") {
        for arch in foreign.split_whitespace() {
            if !arches.iter().any(|a| a == arch) {
                arches.push(arch.to_string());
            }
        }
    }
    arches
}
