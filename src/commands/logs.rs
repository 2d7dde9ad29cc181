//! The `logs` subcommand.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;

use incus_azure_pipelines::config::CliConfig;
use incus_azure_pipelines::incus::{IncusClient, InstanceServer};
use incus_azure_pipelines::pool::Pool;

#[derive(Args, Debug)]
pub struct LogsCmd {
    /// Pool name as configured.
    pool: String,

    /// Agent index within the pool.
    index: usize,
}

impl LogsCmd {
    pub async fn run(self, config_path: &Path) -> Result<()> {
        let conf = CliConfig::load(config_path)
            .with_context(|| format!("loading config at {}", config_path.display()))?;

        let Some(pool_conf) = conf.pools.into_iter().find(|p| p.name == self.pool) else {
            bail!(
                "pool {:?} not found in {}",
                self.pool,
                config_path.display()
            );
        };

        if self.index >= pool_conf.agent_count {
            bail!(
                "invalid agent index {}, pool {:?} has {} agents",
                self.index,
                self.pool,
                pool_conf.agent_count
            );
        }

        let client: Arc<dyn InstanceServer> = Arc::new(IncusClient::connect()?);
        let pool = Pool::new(client, pool_conf)?;

        let logs = pool.agent_logs(self.index).await?;
        std::io::stdout().write_all(&logs)?;
        Ok(())
    }
}
