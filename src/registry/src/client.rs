//! Registry client facade.
//!
//! One [`RegistryClient`] can serve many pulls. Every pull gets its own HTTP
//! client, token state and scratch workspace, so nothing mutable is shared
//! between concurrent pulls.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use hoist_core::config::EndpointConfig;
use hoist_core::error::{HoistError, Result};
use hoist_core::event::{EventEmitter, PullEvent, Stage};

use crate::archive::{self, ArchiveSummary};
use crate::auth::TokenManager;
use crate::blob::BlobFetcher;
use crate::manifest::ManifestResolver;
use crate::reference::ImageReference;
use crate::transport::{build_http_client, RegistryTransport};

/// Lifecycle of a single pull. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PullState {
    Unauthenticated,
    Authenticated,
    ManifestResolved,
    BlobsFetched,
    Assembled,
}

impl PullState {
    /// Move to `next`, which must be the immediately following state.
    pub fn advance(&mut self, next: PullState) -> Result<()> {
        let expected = match self {
            Self::Unauthenticated => Some(Self::Authenticated),
            Self::Authenticated => Some(Self::ManifestResolved),
            Self::ManifestResolved => Some(Self::BlobsFetched),
            Self::BlobsFetched => Some(Self::Assembled),
            Self::Assembled => None,
        };
        if expected != Some(next) {
            return Err(HoistError::Precondition(format!(
                "pull cannot move from {:?} to {:?}",
                self, next
            )));
        }
        tracing::trace!(from = ?self, to = ?next, "Pull state transition");
        *self = next;
        Ok(())
    }
}

/// Entry point for listing tags and pulling images.
pub struct RegistryClient {
    config: EndpointConfig,
    events: EventEmitter,
}

impl RegistryClient {
    /// Create a client. The configuration is validated up front.
    pub fn new(config: EndpointConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            events: EventEmitter::default(),
        })
    }

    /// Publish progress on `events` instead of a private channel.
    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    fn session(&self, reference: &ImageReference) -> Result<Arc<RegistryTransport>> {
        let client = build_http_client(&self.config)?;
        let base_url = self.config.base_url();
        let timeout = self.config.timeout();
        let tokens = TokenManager::new(
            client.clone(),
            base_url.clone(),
            self.config.credentials.clone(),
            reference.pull_scope(),
        )
        .with_request_timeout(timeout);
        Ok(Arc::new(
            RegistryTransport::new(client, base_url, tokens).with_request_timeout(timeout),
        ))
    }

    async fn stage<T, F>(&self, stage: Stage, item: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.events.emit(PullEvent::started(stage, item));
        match fut.await {
            Ok(value) => {
                self.events.emit(PullEvent::completed(stage, item));
                Ok(value)
            }
            Err(e) => {
                self.events.emit(PullEvent::failed(stage, item, &e));
                Err(e)
            }
        }
    }

    /// List the tags of `reference`'s repository in registry order.
    pub async fn list_tags(&self, reference: &ImageReference) -> Result<Vec<String>> {
        let transport = self.session(reference)?;
        let item = reference.repository.clone();

        self.stage(Stage::Authenticate, &item, transport.tokens().authenticate())
            .await?;

        let resolver = ManifestResolver::new(&transport, &self.config.platform);
        self.stage(Stage::ListTags, &item, resolver.list_tags(&reference.repository))
            .await
    }

    /// Pull `reference` into `<output_dir>/<repository>.tar.gz`.
    ///
    /// Either a complete, verified archive exists at the returned path or the
    /// call fails and leaves neither the archive nor any scratch files behind.
    pub async fn pull(&self, reference: &ImageReference, output_dir: &Path) -> Result<ArchiveSummary> {
        let item = reference.to_string();
        tracing::info!(reference = %item, registry = %self.config.base_url(), "Pulling image");

        tokio::fs::create_dir_all(output_dir).await?;
        let scratch = match &self.config.scratch_dir {
            Some(parent) => {
                tokio::fs::create_dir_all(parent).await?;
                tempfile::Builder::new().prefix("hoist-").tempdir_in(parent)?
            }
            None => tempfile::Builder::new().prefix("hoist-").tempdir()?,
        };
        tracing::debug!(scratch = %scratch.path().display(), "Created scratch workspace");

        let mut state = PullState::Unauthenticated;
        let transport = self.session(reference)?;

        let auth = self
            .stage(Stage::Authenticate, &item, transport.tokens().authenticate())
            .await?;
        tracing::debug!(reference = %item, auth = ?auth, "Authenticated");
        state.advance(PullState::Authenticated)?;

        let resolver = ManifestResolver::new(&transport, &self.config.platform);
        let manifest = self
            .stage(
                Stage::ResolveManifest,
                &item,
                resolver.get_manifest(&reference.repository, &reference.tag),
            )
            .await?;
        state.advance(PullState::ManifestResolved)?;
        tracing::info!(
            reference = %item,
            config = %manifest.config.digest,
            layers = manifest.layers.len(),
            "Resolved manifest"
        );

        let fetcher = Arc::new(BlobFetcher::new(Arc::clone(&transport), self.events.clone()));
        let config_item = manifest.config.digest.to_string();
        let config_blob = self
            .stage(
                Stage::FetchConfig,
                &config_item,
                fetcher.fetch_blob(&reference.repository, &manifest.config, scratch.path()),
            )
            .await?;
        let layers = fetcher
            .fetch_all(
                &reference.repository,
                &manifest.layers,
                scratch.path(),
                self.config.max_concurrent_downloads,
            )
            .await?;
        state.advance(PullState::BlobsFetched)?;

        let output = output_dir.join(format!("{}.tar.gz", reference.file_stem()));
        let repo_tag = reference.repo_tag();
        let output_item = output.display().to_string();
        let summary = self
            .stage(Stage::Assemble, &output_item, async move {
                let staging_output = output.clone();
                // The archive is only published here, after the blocking
                // writer has returned. If this future is dropped first, the
                // staged file is dropped with the task's result.
                let staged = tokio::task::spawn_blocking(move || {
                    archive::stage(&config_blob, &layers, &repo_tag, &staging_output)
                })
                .await
                .map_err(|e| {
                    HoistError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("archive task failed: {}", e),
                    ))
                })??;
                staged.commit(&output)
            })
            .await?;
        state.advance(PullState::Assembled)?;

        let scratch_path = scratch.path().display().to_string();
        self.stage(Stage::Cleanup, &scratch_path, async move {
            scratch.close().map_err(HoistError::from)
        })
        .await?;

        Ok(summary)
    }
}
