//! Loadable image archive assembly.
//!
//! Produces a gzip-compressed tar in the layout `docker load` reads:
//!
//! ```text
//! <config-hex>.json
//! <layer-hex>/layer.tar      (one directory per distinct layer)
//! manifest.json              [{"Config", "RepoTags", "Layers"}]
//! ```
//!
//! Entry order, header fields and the gzip header are fixed, so the same
//! inputs always produce the same bytes.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use flate2::{Compression, GzBuilder};
use hoist_core::error::{HoistError, Result};
use serde::Serialize;
use tar::{EntryType, Header};
use tempfile::NamedTempFile;

use crate::blob::VerifiedBlob;
use crate::digest::Digest;

/// One entry of `manifest.json`.
#[derive(Debug, Serialize)]
struct ArchiveManifestEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags")]
    repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

/// Result of a successful assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    /// Compressed archive size in bytes
    pub size: u64,
    pub layers: usize,
}

fn config_entry_name(config: &VerifiedBlob) -> String {
    format!("{}.json", config.digest().hex())
}

fn layer_dir_name(layer: &VerifiedBlob) -> String {
    layer.digest().hex().to_string()
}

fn check_input(blob: &VerifiedBlob, role: &str) -> Result<u64> {
    let meta = std::fs::metadata(blob.path()).map_err(|e| {
        HoistError::Precondition(format!(
            "{} {} is missing at {}: {}",
            role,
            blob.digest(),
            blob.path().display(),
            e
        ))
    })?;
    if !meta.is_file() {
        return Err(HoistError::Precondition(format!(
            "{} {} at {} is not a regular file",
            role,
            blob.digest(),
            blob.path().display()
        )));
    }
    if blob.descriptor().size > 0 && meta.len() != blob.size() {
        return Err(HoistError::Precondition(format!(
            "{} {} is {} bytes on disk, expected {}",
            role,
            blob.digest(),
            meta.len(),
            blob.size()
        )));
    }
    let on_disk = Digest::of_file(blob.digest().algorithm(), blob.path())?;
    if &on_disk != blob.digest() {
        return Err(HoistError::Precondition(format!(
            "{} {} at {} changed after verification (now {})",
            role,
            blob.digest(),
            blob.path().display(),
            on_disk
        )));
    }
    Ok(meta.len())
}

fn header(entry_type: EntryType, mode: u32, size: u64) -> Header {
    let mut h = Header::new_gnu();
    h.set_entry_type(entry_type);
    h.set_mode(mode);
    h.set_size(size);
    h.set_mtime(0);
    h.set_uid(0);
    h.set_gid(0);
    h
}

fn append_dir<W: Write>(builder: &mut tar::Builder<W>, name: &str) -> io::Result<()> {
    let mut h = header(EntryType::Directory, 0o755, 0);
    builder.append_data(&mut h, format!("{}/", name), io::empty())
}

fn append_file<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    source: &Path,
    size: u64,
) -> io::Result<()> {
    let mut h = header(EntryType::Regular, 0o644, size);
    builder.append_data(&mut h, name, File::open(source)?)
}

fn append_bytes<W: Write>(builder: &mut tar::Builder<W>, name: &str, data: &[u8]) -> io::Result<()> {
    let mut h = header(EntryType::Regular, 0o644, data.len() as u64);
    builder.append_data(&mut h, name, data)
}

/// A complete archive in a staging file beside its destination.
///
/// Dropping it without [`StagedArchive::commit`] removes the staging file.
#[derive(Debug)]
pub struct StagedArchive {
    file: NamedTempFile,
    layers: usize,
}

impl StagedArchive {
    /// Staging file path.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Atomically move the archive to `output`, replacing any file there.
    pub fn commit(self, output: &Path) -> Result<ArchiveSummary> {
        let layers = self.layers;
        self.file
            .persist(output)
            .map_err(|e| HoistError::Io(e.error))?;
        let size = std::fs::metadata(output)?.len();
        tracing::info!(path = %output.display(), size, layers, "Image archive written");
        Ok(ArchiveSummary {
            path: output.to_path_buf(),
            size,
            layers,
        })
    }
}

/// Write the image archive for `repo_tag` into a staging file next to `output`.
///
/// `layers` is in manifest order (base first). All blobs must already be
/// verified and present on disk. Every call gets its own staging file, so
/// concurrent calls for the same `output` never share one.
pub fn stage(
    config: &VerifiedBlob,
    layers: &[VerifiedBlob],
    repo_tag: &str,
    output: &Path,
) -> Result<StagedArchive> {
    if layers.is_empty() {
        return Err(HoistError::Precondition(
            "an image archive needs at least one layer".to_string(),
        ));
    }

    let config_size = check_input(config, "config")?;
    let mut layer_sizes = Vec::with_capacity(layers.len());
    for layer in layers {
        layer_sizes.push(check_input(layer, "layer")?);
    }

    let index = vec![ArchiveManifestEntry {
        config: config_entry_name(config),
        repo_tags: vec![repo_tag.to_string()],
        layers: layers
            .iter()
            .map(|l| format!("{}/layer.tar", layer_dir_name(l)))
            .collect(),
    }];
    let index = serde_json::to_vec(&index)?;

    let parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut builder = tempfile::Builder::new();
    builder.prefix(".hoist-").suffix(".partial");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(std::fs::Permissions::from_mode(0o644));
    }
    let mut file = builder.tempfile_in(parent)?;
    tracing::debug!(staging = %file.path().display(), "Writing image archive");

    write_archive(config, config_size, layers, &layer_sizes, &index, file.as_file_mut())?;

    Ok(StagedArchive {
        file,
        layers: layers.len(),
    })
}

/// Write the image archive for `repo_tag` to `output`.
///
/// The archive only appears at `output` once complete; on failure nothing
/// is left behind.
pub fn assemble(
    config: &VerifiedBlob,
    layers: &[VerifiedBlob],
    repo_tag: &str,
    output: &Path,
) -> Result<ArchiveSummary> {
    stage(config, layers, repo_tag, output)?.commit(output)
}

fn write_archive(
    config: &VerifiedBlob,
    config_size: u64,
    layers: &[VerifiedBlob],
    layer_sizes: &[u64],
    index: &[u8],
    file: &mut File,
) -> Result<()> {
    let encoder = GzBuilder::new().mtime(0).write(&mut *file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.mode(tar::HeaderMode::Deterministic);

    append_file(&mut builder, &config_entry_name(config), config.path(), config_size)?;

    let mut written = HashSet::new();
    for (layer, size) in layers.iter().zip(layer_sizes) {
        let dir = layer_dir_name(layer);
        if !written.insert(dir.clone()) {
            continue;
        }
        append_dir(&mut builder, &dir)?;
        append_file(&mut builder, &format!("{}/layer.tar", dir), layer.path(), *size)?;
    }

    append_bytes(&mut builder, "manifest.json", index)?;

    let encoder = builder.into_inner()?;
    encoder.finish()?;
    file.sync_all()?;
    Ok(())
}
