//! Manifest resolution and tag listing.
//!
//! Manifests are negotiated with an `Accept` header naming every supported
//! representation. A manifest list (or OCI index) is narrowed to exactly one
//! platform entry, which is then fetched by digest and verified.

use std::collections::HashSet;

use hoist_core::config::Platform;
use hoist_core::error::{HoistError, Result};
use reqwest::header::{CONTENT_TYPE, LINK};
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::transport::RegistryTransport;

/// Manifest media types.
pub mod media_types {
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const DOCKER_MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
    pub const DOCKER_MANIFEST_V1_SIGNED: &str =
        "application/vnd.docker.distribution.manifest.v1+prettyjws";
}

/// `Accept` header value listing every manifest representation this client handles.
pub fn accept_header() -> String {
    [
        media_types::DOCKER_MANIFEST,
        media_types::DOCKER_MANIFEST_LIST,
        media_types::OCI_MANIFEST,
        media_types::OCI_INDEX,
    ]
    .join(", ")
}

/// Platform of a manifest list entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformSpec {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl PlatformSpec {
    /// Whether this entry serves `target`. A target variant must match exactly.
    pub fn matches(&self, target: &Platform) -> bool {
        self.os == target.os
            && self.architecture == target.architecture
            && target
                .variant
                .as_ref()
                .map_or(true, |v| self.variant.as_ref() == Some(v))
    }
}

impl std::fmt::Display for PlatformSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(v) = &self.variant {
            write!(f, "/{}", v)?;
        }
        Ok(())
    }
}

/// Reference to a retrievable blob or manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    pub digest: Digest,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformSpec>,
}

impl Descriptor {
    fn validate(&self, role: &str) -> Result<()> {
        if self.size < 0 {
            return Err(HoistError::InvalidManifest(format!(
                "{} {} has negative size {}",
                role, self.digest, self.size
            )));
        }
        Ok(())
    }
}

/// Single-platform image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

impl Manifest {
    /// Check structural consistency of the config and layer descriptors.
    pub fn validate(&self) -> Result<()> {
        self.config.validate("config")?;
        if self.layers.is_empty() {
            return Err(HoistError::InvalidManifest(
                "manifest lists no layers".to_string(),
            ));
        }
        for layer in &self.layers {
            layer.validate("layer")?;
        }
        Ok(())
    }
}

/// Manifest list / OCI image index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestList {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
}

impl ManifestList {
    /// Pick the entry for `target`: the first entry whose platform matches.
    pub fn select(&self, target: &Platform) -> Result<&Descriptor> {
        self.manifests
            .iter()
            .find(|entry| entry.platform.as_ref().map_or(false, |p| p.matches(target)))
            .ok_or_else(|| {
                let available: Vec<String> = self
                    .manifests
                    .iter()
                    .filter_map(|e| e.platform.as_ref().map(|p| p.to_string()))
                    .collect();
                HoistError::UnsupportedFormat(format!(
                    "no manifest for platform {} (available: {})",
                    target,
                    if available.is_empty() {
                        "none".to_string()
                    } else {
                        available.join(", ")
                    }
                ))
            })
    }
}

/// A fetched manifest document of either kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestDocument {
    Image(Manifest),
    List(ManifestList),
}

/// Fields inspected before committing to a document kind.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentProbe {
    schema_version: Option<u32>,
    media_type: Option<String>,
    manifests: Option<serde_json::Value>,
}

/// Content types that say nothing about the manifest kind.
const GENERIC_CONTENT_TYPES: &[&str] = &["", "application/json", "text/plain", "application/octet-stream"];

/// Decode a manifest body.
///
/// The kind comes from the `Content-Type` header, then the body's
/// `mediaType`, then structure.
pub fn parse_document(content_type: Option<&str>, body: &[u8]) -> Result<ManifestDocument> {
    let probe: DocumentProbe = serde_json::from_slice(body)
        .map_err(|e| HoistError::InvalidManifest(format!("undecodable manifest: {}", e)))?;

    let header_type = content_type
        .map(|ct| ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
        .filter(|ct| !GENERIC_CONTENT_TYPES.contains(&ct.as_str()));

    let media_type = header_type.or_else(|| probe.media_type.clone());

    let is_list = match media_type.as_deref() {
        Some(media_types::DOCKER_MANIFEST) | Some(media_types::OCI_MANIFEST) => false,
        Some(media_types::DOCKER_MANIFEST_LIST) | Some(media_types::OCI_INDEX) => true,
        Some(media_types::DOCKER_MANIFEST_V1) | Some(media_types::DOCKER_MANIFEST_V1_SIGNED) => {
            return Err(HoistError::UnsupportedFormat(
                "schema 1 manifests are not supported".to_string(),
            ))
        }
        Some(other) => {
            return Err(HoistError::UnsupportedFormat(format!(
                "media type '{}'",
                other
            )))
        }
        None => probe.manifests.is_some(),
    };

    match probe.schema_version {
        Some(2) => {}
        Some(1) => {
            return Err(HoistError::UnsupportedFormat(
                "schema 1 manifests are not supported".to_string(),
            ))
        }
        Some(v) => {
            return Err(HoistError::UnsupportedFormat(format!(
                "schema version {}",
                v
            )))
        }
        None => {
            return Err(HoistError::InvalidManifest(
                "missing schemaVersion".to_string(),
            ))
        }
    }

    if is_list {
        let list: ManifestList = serde_json::from_slice(body)
            .map_err(|e| HoistError::InvalidManifest(format!("invalid manifest list: {}", e)))?;
        for entry in &list.manifests {
            entry.validate("manifest list entry")?;
        }
        Ok(ManifestDocument::List(list))
    } else {
        let manifest: Manifest = serde_json::from_slice(body)
            .map_err(|e| HoistError::InvalidManifest(format!("invalid manifest: {}", e)))?;
        manifest.validate()?;
        Ok(ManifestDocument::Image(manifest))
    }
}

/// Extract the `rel="next"` target from an RFC 5988 `Link` header.
pub fn parse_next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let mut pieces = part.split(';');
        let target = pieces.next()?.trim();
        let is_next = pieces.any(|p| {
            let p = p.trim();
            p == r#"rel="next""# || p == "rel=next"
        });
        if is_next && target.starts_with('<') && target.ends_with('>') {
            Some(target[1..target.len() - 1].to_string())
        } else {
            None
        }
    })
}

/// Tag listing response body.
#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// Fetches tags and manifests for one repository.
pub struct ManifestResolver<'a> {
    transport: &'a RegistryTransport,
    platform: &'a Platform,
}

impl<'a> ManifestResolver<'a> {
    pub fn new(transport: &'a RegistryTransport, platform: &'a Platform) -> Self {
        Self {
            transport,
            platform,
        }
    }

    /// List tags in registry order, following pagination.
    pub async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        let mut url = self.transport.api_url(&format!("{}/tags/list", repository));
        let mut visited = HashSet::new();
        let mut seen = HashSet::new();
        let mut tags = Vec::new();

        loop {
            visited.insert(url.clone());
            let resp = self
                .transport
                .get(&url, Some("application/json"), &format!("tags of {}", repository))
                .await?;

            let next = resp
                .headers()
                .get(LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_next_link);

            let page: TagList = resp.json().await.map_err(|e| {
                HoistError::InvalidManifest(format!("invalid tag list for {}: {}", repository, e))
            })?;

            for tag in page.tags.unwrap_or_default() {
                if seen.insert(tag.clone()) {
                    tags.push(tag);
                }
            }

            let Some(next) = next else { break };
            let next_url = reqwest::Url::parse(&url)
                .and_then(|base| base.join(&next))
                .map_err(|e| HoistError::network(&url, format!("invalid pagination link '{}': {}", next, e)))?
                .to_string();
            if visited.contains(&next_url) {
                break;
            }
            url = next_url;
        }

        tracing::debug!(repository = %repository, count = tags.len(), "Listed tags");
        Ok(tags)
    }

    /// Resolve `repository:tag` to a single-platform manifest.
    pub async fn get_manifest(&self, repository: &str, tag: &str) -> Result<Manifest> {
        match self.fetch_document(repository, tag, None).await? {
            ManifestDocument::Image(manifest) => Ok(manifest),
            ManifestDocument::List(list) => {
                let entry = list.select(self.platform)?;
                tracing::debug!(
                    repository = %repository,
                    tag = %tag,
                    platform = %self.platform,
                    digest = %entry.digest,
                    "Selected manifest list entry"
                );
                let digest = entry.digest.clone();
                match self
                    .fetch_document(repository, &digest.to_string(), Some(&digest))
                    .await?
                {
                    ManifestDocument::Image(manifest) => Ok(manifest),
                    ManifestDocument::List(_) => Err(HoistError::UnsupportedFormat(format!(
                        "manifest list entry {} is itself a manifest list",
                        digest
                    ))),
                }
            }
        }
    }

    async fn fetch_document(
        &self,
        repository: &str,
        reference: &str,
        expected: Option<&Digest>,
    ) -> Result<ManifestDocument> {
        let url = self
            .transport
            .api_url(&format!("{}/manifests/{}", repository, reference));
        let accept = accept_header();
        let resp = self
            .transport
            .get(
                &url,
                Some(&accept),
                &format!("manifest {}:{}", repository, reference),
            )
            .await?;

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = resp.bytes().await?;

        if let Some(expected) = expected {
            expected.verify(&Digest::of_bytes(expected.algorithm(), &body))?;
        }

        parse_document(content_type.as_deref(), &body)
    }
}
