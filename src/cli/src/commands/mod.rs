//! CLI command definitions and dispatch.

mod pull;
mod tags;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use hoist_core::config::{DEFAULT_INDEX_URL, DEFAULT_TIMEOUT_SECS};
use hoist_core::{Credentials, EndpointConfig, HoistError, Platform};

/// Hoist: pull images from a Docker registry into `docker load` archives.
#[derive(Parser)]
#[command(name = "hoist", version, about, args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(flatten)]
    pub endpoint: EndpointArgs,

    #[command(subcommand)]
    pub command: Option<Command>,

    /// Image to pull when no subcommand is given (e.g., "redis:7")
    pub image: Option<String>,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Pull an image into a gzip-compressed tar archive
    Pull(pull::PullArgs),
    /// List the tags of a repository
    Tags(tags::TagsArgs),
}

/// Registry endpoint options shared by every command.
#[derive(Args, Debug, Clone)]
pub struct EndpointArgs {
    /// Registry index URL
    #[arg(long, global = true, env = "HOIST_INDEX", default_value = DEFAULT_INDEX_URL)]
    pub index: String,

    /// Registry URL used for API requests instead of the index
    #[arg(long, global = true, env = "HOIST_REGISTRY")]
    pub registry: Option<String>,

    /// HTTP/HTTPS proxy URL
    #[arg(long, global = true, env = "HTTPS_PROXY")]
    pub proxy: Option<String>,

    /// Skip TLS certificate verification
    #[arg(long, global = true)]
    pub insecure: bool,

    /// Registry username
    #[arg(short, long, global = true, env = "HOIST_USERNAME")]
    pub user: Option<String>,

    /// Registry password
    #[arg(short, long, global = true, env = "HOIST_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Platform to select from multi-platform images (e.g., "linux/arm64/v8")
    #[arg(long, global = true)]
    pub platform: Option<String>,

    /// Per-request timeout in seconds (0 disables it)
    #[arg(long, global = true, default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout: u64,

    /// Directory holding per-pull scratch space (system temp dir by default)
    #[arg(long, global = true)]
    pub scratch_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl EndpointArgs {
    /// Build the endpoint configuration these flags describe.
    pub fn to_config(&self) -> Result<EndpointConfig, HoistError> {
        let credentials = match (&self.user, &self.password) {
            (Some(user), Some(password)) => Some(Credentials::new(user, password)),
            (Some(user), None) => {
                return Err(HoistError::Config(format!(
                    "a password is required for user '{}'",
                    user
                )))
            }
            (None, Some(_)) => {
                return Err(HoistError::Config(
                    "--password given without --user".to_string(),
                ))
            }
            (None, None) => None,
        };

        let platform = match &self.platform {
            Some(p) => p.parse::<Platform>()?,
            None => Platform::host(),
        };

        Ok(EndpointConfig {
            index_url: self.index.clone(),
            registry_url: self.registry.clone(),
            proxy: self.proxy.clone().filter(|p| !p.is_empty()),
            insecure: self.insecure,
            credentials,
            platform,
            timeout_secs: self.timeout,
            scratch_dir: self.scratch_dir.clone(),
            ..Default::default()
        })
    }
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match (cli.command, cli.image) {
        (Some(Command::Pull(args)), _) => pull::execute(args, &cli.endpoint).await,
        (Some(Command::Tags(args)), _) => tags::execute(args, &cli.endpoint).await,
        (None, Some(image)) => pull::execute(pull::PullArgs::for_image(image), &cli.endpoint).await,
        (None, None) => Err("no image given; run `hoist --help` for usage".into()),
    }
}
