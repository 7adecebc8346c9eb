//! `hoist pull` command.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use hoist_core::config::DEFAULT_MAX_CONCURRENT_DOWNLOADS;
use hoist_core::{EventEmitter, HoistError, Outcome, PullEvent, Stage};
use hoist_registry::{ImageReference, RegistryClient};
use tokio::sync::broadcast::error::RecvError;

use super::EndpointArgs;
use crate::output;

/// Attempts after the first one for transient network failures.
const DEFAULT_RETRIES: u32 = 2;

/// Delay before the first retry; doubled on each further attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

#[derive(Args)]
pub struct PullArgs {
    /// Image reference (e.g., "redis", "redis:7", "bitnami/redis:7.2")
    pub image: String,

    /// Directory the archive is written to
    #[arg(short, long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Maximum number of concurrent layer downloads
    #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENT_DOWNLOADS)]
    pub concurrency: usize,

    /// Retries after a transient network failure
    #[arg(long, default_value_t = DEFAULT_RETRIES)]
    pub retries: u32,

    /// Suppress progress output; print only the archive path
    #[arg(short, long)]
    pub quiet: bool,
}

impl PullArgs {
    /// Defaults used for `hoist <image>`.
    pub fn for_image(image: String) -> Self {
        Self {
            image,
            output_dir: PathBuf::from("."),
            concurrency: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            retries: DEFAULT_RETRIES,
            quiet: false,
        }
    }
}

pub async fn execute(args: PullArgs, endpoint: &EndpointArgs) -> Result<(), Box<dyn std::error::Error>> {
    let reference = ImageReference::parse(&args.image)?;
    let mut config = endpoint.to_config()?;
    config.max_concurrent_downloads = args.concurrency;

    let events = EventEmitter::default();
    let verbose = endpoint.verbose;
    let printer = (!args.quiet).then(|| {
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        // Per-layer lines only with --verbose
                        if event.is_item_level() && !verbose {
                            continue;
                        }
                        if let Some(line) = describe(&event) {
                            println!("{line}");
                        }
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        })
    });

    let client = RegistryClient::new(config)?.with_events(events);

    if !args.quiet {
        println!("Pulling {} from {}", reference, client.config().base_url());
    }

    let result = with_retries(args.retries, RETRY_BASE_DELAY, || {
        client.pull(&reference, &args.output_dir)
    })
    .await;

    drop(client);
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    let summary = result?;
    if args.quiet {
        println!("{}", summary.path.display());
    } else {
        println!(
            "Pulled {} to {} ({}, {} layers)",
            reference,
            summary.path.display(),
            output::format_bytes(summary.size),
            summary.layers
        );
    }

    Ok(())
}

/// Run `op`, retrying retryable failures with exponential backoff.
pub(crate) async fn with_retries<T, F, Fut>(
    retries: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T, HoistError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, HoistError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < retries => {
                let delay = base_delay * 2u32.saturating_pow(attempt);
                attempt += 1;
                tracing::warn!(
                    error = %e,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Pull failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// One progress line for an event, if it is worth showing.
fn describe(event: &PullEvent) -> Option<String> {
    let item = output::short_digest(&event.item);
    match (&event.stage, &event.outcome) {
        (Stage::ResolveManifest, Outcome::Completed) => Some(format!("Resolved {}", event.item)),
        (Stage::FetchConfig, Outcome::Completed) => Some(format!("{}: config fetched", item)),
        (Stage::FetchLayer, Outcome::Started) => Some(format!("{}: downloading", item)),
        (Stage::FetchLayer, Outcome::Transferred { bytes }) => Some(format!(
            "{}: verified ({})",
            item,
            output::format_bytes(*bytes)
        )),
        (Stage::Assemble, Outcome::Started) => Some("Writing archive".to_string()),
        (_, Outcome::Failed { error }) => Some(format!("{} failed for {}: {}", event.stage, item, error)),
        _ => None,
    }
}
