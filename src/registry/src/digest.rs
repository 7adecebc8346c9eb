//! Content digests.
//!
//! A digest is both the address of a blob and its integrity check. This module
//! parses `algorithm:hex` strings and hashes byte streams incrementally so a
//! blob can be verified while it is being written.

use std::io::Read;
use std::path::Path;

use hoist_core::error::{HoistError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512};

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    fn hex_len(&self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha512 => 128,
        }
    }
}

/// A parsed content digest (e.g., `sha256:e3b0c442...`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: DigestAlgorithm,
    hex: String,
}

impl Digest {
    /// Parse and validate an `algorithm:hex` digest string.
    pub fn parse(s: &str) -> Result<Self> {
        let (algo, hex) = s.split_once(':').ok_or_else(|| {
            HoistError::InvalidManifest(format!("digest '{}' is not algorithm:hex", s))
        })?;

        let algorithm = match algo {
            "sha256" => DigestAlgorithm::Sha256,
            "sha512" => DigestAlgorithm::Sha512,
            other => {
                return Err(HoistError::UnsupportedFormat(format!(
                    "digest algorithm '{}' in '{}'",
                    other, s
                )))
            }
        };

        let well_formed = hex.len() == algorithm.hex_len()
            && hex
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if !well_formed {
            return Err(HoistError::InvalidManifest(format!(
                "digest '{}' does not carry a lowercase {}-character hex value",
                s,
                algorithm.hex_len()
            )));
        }

        Ok(Self {
            algorithm,
            hex: hex.to_string(),
        })
    }

    /// Digest of an in-memory buffer.
    pub fn of_bytes(algorithm: DigestAlgorithm, data: &[u8]) -> Self {
        let mut verifier = DigestVerifier::new(algorithm);
        verifier.update(data);
        verifier.finalize()
    }

    /// Digest of a file on disk.
    pub fn of_file(algorithm: DigestAlgorithm, path: &Path) -> Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut verifier = DigestVerifier::new(algorithm);
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            verifier.update(&buf[..n]);
        }
        Ok(verifier.finalize())
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Hex-encoded hash value without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Filesystem-safe name (e.g., "sha256_abc...").
    pub fn file_name(&self) -> String {
        format!("{}_{}", self.algorithm.name(), self.hex)
    }

    /// Fail with an integrity error unless `actual` equals this digest.
    pub fn verify(&self, actual: &Digest) -> Result<()> {
        if self == actual {
            Ok(())
        } else {
            Err(HoistError::Integrity {
                digest: self.to_string(),
                expected: self.to_string(),
                actual: actual.to_string(),
            })
        }
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm.name(), self.hex)
    }
}

impl std::str::FromStr for Digest {
    type Err = HoistError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = HoistError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.to_string()
    }
}

/// Incremental hasher fed while a blob streams to disk.
pub enum DigestVerifier {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl DigestVerifier {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            DigestAlgorithm::Sha512 => Self::Sha512(Sha512::new()),
        }
    }

    /// Hasher matching the algorithm of an expected digest.
    pub fn for_digest(expected: &Digest) -> Self {
        Self::new(expected.algorithm())
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Digest {
        match self {
            Self::Sha256(h) => Digest {
                algorithm: DigestAlgorithm::Sha256,
                hex: hex::encode(h.finalize()),
            },
            Self::Sha512(h) => Digest {
                algorithm: DigestAlgorithm::Sha512,
                hex: hex::encode(h.finalize()),
            },
        }
    }
}
