//! The `provision` subcommand: bake the agent base image.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Args;

use incus_azure_pipelines::incus::{IncusClient, InstanceServer};
use incus_azure_pipelines::provision::{build_image, ProvisionConfig};

#[derive(Args, Debug)]
pub struct ProvisionCmd {
    /// Base image alias (starting point).
    #[arg(long, short = 'b')]
    base: String,

    /// Target image alias (name of the newly-built image).
    #[arg(long, short = 't')]
    target: String,

    /// Paths to provisioning scripts, run in order.
    #[arg(long = "script", short = 's')]
    scripts: Vec<PathBuf>,

    /// Incus project to build the image in.
    #[arg(long, short = 'p')]
    project: Option<String>,
}

impl ProvisionCmd {
    pub async fn run(self) -> Result<()> {
        let client: Arc<dyn InstanceServer> = Arc::new(IncusClient::connect()?);

        let conf = ProvisionConfig {
            base_alias: self.base,
            target_alias: self.target,
            project_name: self.project.unwrap_or_default(),
            scripts: self.scripts,
        };

        build_image(client, &conf).await?;
        Ok(())
    }
}
