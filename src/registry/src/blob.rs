//! Verified blob downloads.
//!
//! Blobs stream straight to disk while their digest is computed. A blob is
//! only ever handed out as a [`VerifiedBlob`] after the digest and size check
//! passed; every other outcome leaves no file behind.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use hoist_core::error::{HoistError, Result};
use hoist_core::event::{EventEmitter, Outcome, PullEvent, Stage};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::digest::{Digest, DigestVerifier};
use crate::manifest::Descriptor;
use crate::transport::RegistryTransport;

/// A blob on disk whose content matched its descriptor.
#[derive(Debug, Clone)]
pub struct VerifiedBlob {
    descriptor: Descriptor,
    path: PathBuf,
}

impl VerifiedBlob {
    #[cfg(test)]
    pub(crate) fn from_parts(descriptor: Descriptor, path: PathBuf) -> Self {
        Self { descriptor, path }
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn digest(&self) -> &Digest {
        &self.descriptor.digest
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Verified size in bytes.
    pub fn size(&self) -> u64 {
        self.descriptor.size.max(0) as u64
    }
}

/// Removes an in-progress download unless it was promoted.
struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn promote(mut self, final_path: &Path) -> Result<()> {
        std::fs::rename(&self.path, final_path)?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Write a byte stream to `path`, hashing as it goes, and check it against `descriptor`.
///
/// A body longer than the declared size is rejected as soon as it overruns.
/// With `idle_timeout` set, a stream that yields nothing for that long fails
/// with a retryable network error. Returns the number of bytes written. The
/// caller owns cleanup of `path` on error.
pub async fn write_verified<S, B, E>(
    stream: S,
    descriptor: &Descriptor,
    path: &Path,
    idle_timeout: Option<Duration>,
) -> Result<u64>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    HoistError: From<E>,
{
    futures::pin_mut!(stream);
    let mut file = tokio::fs::File::create(path).await?;
    let mut verifier = DigestVerifier::for_digest(&descriptor.digest);
    let mut written: u64 = 0;
    let declared = (descriptor.size > 0).then(|| descriptor.size as u64);

    loop {
        let next = match idle_timeout {
            Some(idle) => tokio::time::timeout(idle, stream.next()).await.map_err(|_| {
                HoistError::network(
                    format!("blob {}", descriptor.digest),
                    format!("no data for {}s after {} bytes", idle.as_secs_f32(), written),
                )
            })?,
            None => stream.next().await,
        };
        let Some(chunk) = next else { break };
        let chunk = chunk?;
        let data = chunk.as_ref();
        written += data.len() as u64;
        if let Some(expected) = declared {
            if written > expected {
                return Err(size_mismatch(descriptor, format!("more than {} bytes", expected)));
            }
        }
        verifier.update(data);
        file.write_all(data).await?;
    }
    file.flush().await?;
    drop(file);

    if declared.is_some_and(|expected| written != expected) {
        return Err(size_mismatch(descriptor, format!("{} bytes", written)));
    }

    descriptor.digest.verify(&verifier.finalize())?;
    Ok(written)
}

fn size_mismatch(descriptor: &Descriptor, actual: String) -> HoistError {
    HoistError::Integrity {
        digest: descriptor.digest.to_string(),
        expected: format!("{} bytes", descriptor.size),
        actual,
    }
}

/// Downloads config and layer blobs for one pull.
pub struct BlobFetcher {
    transport: Arc<RegistryTransport>,
    events: EventEmitter,
}

impl BlobFetcher {
    pub fn new(transport: Arc<RegistryTransport>, events: EventEmitter) -> Self {
        Self { transport, events }
    }

    /// Download one blob into `dest_dir` and verify it.
    ///
    /// Digest mismatches are returned as [`HoistError::Integrity`] and are
    /// never retried here.
    pub async fn fetch_blob(
        &self,
        repository: &str,
        descriptor: &Descriptor,
        dest_dir: &Path,
    ) -> Result<VerifiedBlob> {
        let final_path = dest_dir.join(descriptor.digest.file_name());
        let partial = PartialFile::new(
            dest_dir.join(format!("{}.partial", descriptor.digest.file_name())),
        );
        let url = self
            .transport
            .api_url(&format!("{}/blobs/{}", repository, descriptor.digest));

        tracing::debug!(
            digest = %descriptor.digest,
            size = descriptor.size,
            "Fetching blob"
        );

        let resp = self
            .transport
            .get_blob(&url, &format!("blob {}", descriptor.digest))
            .await?;
        let written = write_verified(
            resp.bytes_stream(),
            descriptor,
            &partial.path,
            self.transport.request_timeout(),
        )
        .await
            .map_err(|e| {
                if matches!(e, HoistError::Integrity { .. }) {
                    tracing::warn!(digest = %descriptor.digest, url = %url, "Blob failed verification");
                }
                e
            })?;
        partial.promote(&final_path)?;

        tracing::debug!(digest = %descriptor.digest, bytes = written, "Blob verified");

        Ok(VerifiedBlob {
            descriptor: descriptor.clone(),
            path: final_path,
        })
    }

    /// Download every descriptor with at most `max_concurrency` transfers in flight.
    ///
    /// Each distinct digest is fetched once. The result follows the input
    /// order, duplicates included. The first failure aborts every other
    /// transfer and waits for them to stop before returning.
    pub async fn fetch_all(
        self: &Arc<Self>,
        repository: &str,
        descriptors: &[Descriptor],
        dest_dir: &Path,
        max_concurrency: usize,
    ) -> Result<Vec<VerifiedBlob>> {
        let mut seen = HashSet::new();
        let unique: Vec<Descriptor> = descriptors
            .iter()
            .filter(|d| seen.insert(d.digest.clone()))
            .cloned()
            .collect();

        let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for descriptor in unique {
            let fetcher = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let repository = repository.to_string();
            let dest_dir = dest_dir.to_path_buf();

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|_| {
                    HoistError::Io(std::io::Error::new(
                        std::io::ErrorKind::Interrupted,
                        "download pool closed",
                    ))
                })?;

                let item = descriptor.digest.to_string();
                fetcher
                    .events
                    .emit(PullEvent::started(Stage::FetchLayer, item.clone()));

                match fetcher.fetch_blob(&repository, &descriptor, &dest_dir).await {
                    Ok(blob) => {
                        fetcher.events.emit(PullEvent::new(
                            Stage::FetchLayer,
                            item,
                            Outcome::Transferred { bytes: blob.size() },
                        ));
                        Ok(blob)
                    }
                    Err(e) => {
                        fetcher
                            .events
                            .emit(PullEvent::failed(Stage::FetchLayer, item, &e));
                        Err(e)
                    }
                }
            });
        }

        let mut fetched: HashMap<Digest, VerifiedBlob> = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            let failure = match joined {
                Ok(Ok(blob)) => {
                    fetched.insert(blob.digest().clone(), blob);
                    continue;
                }
                Ok(Err(e)) => e,
                Err(join_err) => HoistError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("blob download task failed: {}", join_err),
                )),
            };

            tracing::debug!(error = %failure, pending = tasks.len(), "Aborting outstanding downloads");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            return Err(failure);
        }

        descriptors
            .iter()
            .map(|d| {
                fetched.get(&d.digest).cloned().ok_or_else(|| {
                    HoistError::Precondition(format!("blob {} was not fetched", d.digest))
                })
            })
            .collect()
    }
}
