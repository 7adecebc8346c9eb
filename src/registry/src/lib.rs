//! Hoist Registry - Docker Registry V2 pull client
//!
//! Pulls an image from a registry speaking the distribution API and writes
//! it as a gzip-compressed tar that `docker load` accepts.
//!
//! # Pipeline
//!
//! ```text
//! ImageReference → TokenManager → ManifestResolver → BlobFetcher → archive::assemble
//! ```
//!
//! [`RegistryClient`] drives the pipeline and publishes [`hoist_core::PullEvent`]s.

pub mod archive;
pub mod auth;
pub mod blob;
pub mod client;
pub mod digest;
pub mod manifest;
pub mod reference;
pub mod transport;

pub use archive::{assemble, ArchiveSummary, StagedArchive};
pub use auth::{AuthState, Challenge, ChallengeScheme, Token, TokenManager};
pub use blob::{BlobFetcher, VerifiedBlob};
pub use client::{PullState, RegistryClient};
pub use digest::{Digest, DigestAlgorithm, DigestVerifier};
pub use manifest::{Descriptor, Manifest, ManifestDocument, ManifestList, ManifestResolver};
pub use reference::ImageReference;
pub use transport::RegistryTransport;
