//! `hoist tags` command.

use clap::Args;
use hoist_registry::{ImageReference, RegistryClient};

use super::EndpointArgs;
use crate::output;

#[derive(Args)]
pub struct TagsArgs {
    /// Repository to list (e.g., "redis", "bitnami/redis"); a tag, if given, is ignored
    pub image: String,

    /// Only show tags (one per line)
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: TagsArgs, endpoint: &EndpointArgs) -> Result<(), Box<dyn std::error::Error>> {
    let reference = ImageReference::parse(&args.image)?;
    let client = RegistryClient::new(endpoint.to_config()?)?;
    let tags = client.list_tags(&reference).await?;

    if args.quiet {
        for tag in &tags {
            println!("{tag}");
        }
        return Ok(());
    }

    let mut table = output::new_table(&["REPOSITORY", "TAG"]);
    for tag in &tags {
        table.add_row(&[reference.repository.as_str(), tag.as_str()]);
    }
    println!("{table}");

    Ok(())
}
