/*
 * debboost - Concurrent package downloader and mirror ranking engine.
 * Copyright (C) 2025  compiledkernel-idk and debboost contributors
 */

//! Hash sum algorithms accepted for integrity verification.
//!
//! Only SHA256 and SHA512 are accepted. Debian repository clients must not
//! use MD5Sum or SHA1 for security purposes. Index records carry those next
//! to a SHA256 sum, so they are skipped there, but a hash map offering
//! nothing stronger is rejected instead of silently skipping verification.

use crate::error::TransferError;
use serde::Serialize;
use sha2::{Digest, Sha256, Sha512};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Supported digest algorithms, ordered weakest to strongest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "SHA256",
            HashAlgorithm::Sha512 => "SHA512",
        }
    }

    /// Length of the hex encoded digest
    pub fn hex_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 64,
            HashAlgorithm::Sha512 => 128,
        }
    }

    pub fn hasher(&self) -> StreamingHasher {
        match self {
            HashAlgorithm::Sha256 => StreamingHasher::Sha256(Sha256::new()),
            HashAlgorithm::Sha512 => StreamingHasher::Sha512(Sha512::new()),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha512" => Ok(HashAlgorithm::Sha512),
            _ => Err(TransferError::UnsupportedHash { name: s.to_string() }),
        }
    }
}

/// Incremental digest fed while the body streams to disk
pub enum StreamingHasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl StreamingHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            StreamingHasher::Sha256(h) => h.update(data),
            StreamingHasher::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize_hex(self) -> String {
        match self {
            StreamingHasher::Sha256(h) => hex::encode(h.finalize()),
            StreamingHasher::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// Expected digests of one artifact, keyed by algorithm
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectedHashes(BTreeMap<HashAlgorithm, String>);

impl ExpectedHashes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from loosely typed `name -> digest` pairs as found in package indices
    ///
    /// Unsupported algorithms are skipped. A non-empty map in which none of
    /// the names is supported is an error.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, TransferError> {
        let mut hashes = Self::new();
        let mut skipped = Vec::new();
        for (name, digest) in map {
            if name.parse::<HashAlgorithm>().is_err() {
                debug!(algorithm = %name, "skipping unsupported hash");
                skipped.push(name.as_str());
                continue;
            }
            hashes.insert(name, digest)?;
        }
        if hashes.is_empty() && !skipped.is_empty() {
            skipped.sort_unstable();
            return Err(TransferError::UnsupportedHash {
                name: skipped.join(", "),
            });
        }
        Ok(hashes)
    }

    pub fn insert(&mut self, name: &str, digest: &str) -> Result<(), TransferError> {
        let algorithm: HashAlgorithm = name.parse()?;
        let digest = digest.trim();
        if digest.len() != algorithm.hex_len() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(TransferError::InvalidDigest {
                algorithm: algorithm.name().to_string(),
                digest: digest.to_string(),
            });
        }
        self.0.insert(algorithm, digest.to_ascii_lowercase());
        Ok(())
    }

    pub fn with(mut self, name: &str, digest: &str) -> Result<Self, TransferError> {
        self.insert(name, digest)?;
        Ok(self)
    }

    /// The strongest algorithm present and its expected digest
    pub fn strongest(&self) -> Option<(HashAlgorithm, &str)> {
        self.0
            .iter()
            .next_back()
            .map(|(alg, digest)| (*alg, digest.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Compare a computed digest with the expected one, ignoring case
pub fn digests_match(expected: &str, received: &str) -> bool {
    expected.eq_ignore_ascii_case(received)
}

/// Hash a file already on disk
pub async fn hash_file(path: &Path, algorithm: HashAlgorithm) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = algorithm.hasher();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize_hex())
}
