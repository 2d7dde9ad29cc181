//! Image-bake pipeline.
//!
//! Builds the container image agent containers are cloned from: spin up a
//! builder container from a public base image, bootstrap it (agent user,
//! Docker, the pinned Azure Pipelines agent tarball), run user-supplied
//! provisioning scripts, stop, publish under the target alias, and delete
//! the builder. Runs once under the `provision` subcommand, never from the
//! daemon.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info};

use crate::incus::{
    Error as HostError, ExecPost, FileArgs, ImageAliasesPost, ImageSource, ImagesPost,
    InstanceServer, InstanceSource, InstanceStatePut, InstancesPost,
};

/// Canonical agent user inside every agent container.
pub const AGENT_USER: &str = "agent";
pub const AGENT_UID: u32 = 1100;
pub const AGENT_GID: u32 = 1100;

/// Public image server builder containers are pulled from.
const IMAGE_SERVER: &str = "https://images.linuxcontainers.org";

/// Worker entrypoint installed into the image.
const RUN_AGENT_SCRIPT: &str = include_str!("run_agent.sh");

/// Where provisioning scripts are staged inside the builder.
const SCRIPT_STAGE_DIR: &str = "/root";

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("error reading script {path}: {source}")]
    Script {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{name} failed with exit code {code}")]
    ScriptFailed { name: String, code: i64 },

    #[error("unsupported architecture: {0}")]
    UnsupportedArch(String),

    #[error("failed to fetch latest agent release: {0}")]
    Release(String),

    #[error(transparent)]
    Host(#[from] HostError),
}

/// Settings for one bake.
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    /// Base image alias on the public image server.
    pub base_alias: String,
    /// Alias the finished image is published under.
    pub target_alias: String,
    /// Incus project to build in. Empty means the default project.
    pub project_name: String,
    /// Local paths of user provisioning scripts, run in order.
    pub scripts: Vec<PathBuf>,
}

/// Bake the agent base image.
pub async fn build_image(
    client: Arc<dyn InstanceServer>,
    conf: &ProvisionConfig,
) -> Result<(), ProvisionError> {
    let agent_url = latest_agent_url().await?;
    build_image_from(client, conf, &agent_url).await
}

/// Bake with an explicit agent tarball URL.
pub async fn build_image_from(
    client: Arc<dyn InstanceServer>,
    conf: &ProvisionConfig,
    agent_url: &str,
) -> Result<(), ProvisionError> {
    let client = if conf.project_name.is_empty() {
        client
    } else {
        client.with_project(&conf.project_name)
    };

    // Read every user script before touching the host.
    let mut scripts = Vec::with_capacity(conf.scripts.len());
    for path in &conf.scripts {
        let data = std::fs::read(path).map_err(|source| ProvisionError::Script {
            path: path.clone(),
            source,
        })?;
        scripts.push(data);
    }

    let builder_name = format!("{}-builder-{}", conf.target_alias, random_suffix(8));
    let req = InstancesPost {
        name: builder_name.clone(),
        instance_type: "container".to_string(),
        source: InstanceSource::pull(&conf.base_alias, IMAGE_SERVER),
        start: true,
        ephemeral: false,
        config: Default::default(),
        devices: Default::default(),
    };

    info!(instance = %builder_name, "creating");
    let op = client.create_instance(&req).await?;
    client.wait_operation(&op.id).await?;

    // The builder exists from here on: delete it on every exit path.
    let result = bake(&client, conf, &builder_name, agent_url, &scripts).await;

    match client.delete_instance(&builder_name).await {
        Ok(op) => {
            if let Err(e) = client.wait_operation(&op.id).await {
                error!(instance = %builder_name, err = %e, "error deleting builder");
            }
        }
        Err(e) => error!(instance = %builder_name, err = %e, "error deleting builder"),
    }

    result
}

/// Everything between builder creation and deletion.
async fn bake(
    client: &Arc<dyn InstanceServer>,
    conf: &ProvisionConfig,
    builder: &str,
    agent_url: &str,
    scripts: &[Vec<u8>],
) -> Result<(), ProvisionError> {
    let (_, etag) = client.get_instance(builder).await?;

    run_script(
        client,
        builder,
        "bootstrap",
        bootstrap_script(agent_url).as_bytes(),
    )
    .await?;

    client
        .create_instance_file(
            builder,
            "/home/agent/run_agent.sh",
            RUN_AGENT_SCRIPT.as_bytes(),
            &FileArgs {
                mode: 0o744,
                uid: AGENT_UID as i64,
                gid: AGENT_GID as i64,
                write_mode: "overwrite".to_string(),
            },
        )
        .await?;

    for (i, script) in scripts.iter().enumerate() {
        let name = conf.scripts[i].display().to_string();
        info!(script = %name, "running provisioning script");
        run_script(client, builder, &format!("script-{i}"), script)
            .await
            .map_err(|e| match e {
                ProvisionError::ScriptFailed { code, .. } => {
                    ProvisionError::ScriptFailed { name: name.clone(), code }
                }
                other => other,
            })?;
    }

    info!(instance = %builder, "stopping instance");
    let stop = InstanceStatePut {
        action: "stop".to_string(),
        force: false,
        timeout: 0,
    };
    let op = client.update_instance_state(builder, &stop, &etag).await?;
    client.wait_operation(&op.id).await?;

    info!(instance = %builder, target = %conf.target_alias, "publishing image");
    let publish = ImagesPost {
        source: ImageSource {
            name: builder.to_string(),
            source_type: "container".to_string(),
        },
        properties: [(
            "description".to_string(),
            format!("azure pipeline runner built on {}", conf.base_alias),
        )]
        .into(),
    };
    let op = client.create_image(&publish).await?;
    let op = wait_with_progress(client, &op.id).await?;
    let fingerprint = op.fingerprint()?;

    // Swap the alias. The window between delete and create is accepted: a
    // bake can be re-run safely and agent creation retries every tick.
    match client.get_image_alias(&conf.target_alias).await {
        Ok(_) => client.delete_image_alias(&conf.target_alias).await?,
        Err(HostError::NotFound) => {}
        Err(e) => return Err(e.into()),
    }

    client
        .create_image_alias(&ImageAliasesPost {
            name: conf.target_alias.clone(),
            target: fingerprint,
            alias_type: "container".to_string(),
        })
        .await?;

    Ok(())
}

/// Stage a script into the builder and run it, failing on nonzero exit.
async fn run_script(
    client: &Arc<dyn InstanceServer>,
    builder: &str,
    name: &str,
    content: &[u8],
) -> Result<(), ProvisionError> {
    let path = format!("{SCRIPT_STAGE_DIR}/provision-{name}.sh");
    client
        .create_instance_file(
            builder,
            &path,
            content,
            &FileArgs {
                mode: 0o700,
                uid: 0,
                gid: 0,
                write_mode: "overwrite".to_string(),
            },
        )
        .await?;

    let exec = ExecPost {
        command: vec!["bash".to_string(), path],
        wait_for_websocket: true,
        interactive: false,
        user: None,
        group: None,
    };
    let op = client.exec_instance(builder, &exec).await?;
    let op = client.wait_operation(&op.id).await?;

    let code = op.exit_code()?;
    if code != 0 {
        return Err(ProvisionError::ScriptFailed {
            name: name.to_string(),
            code,
        });
    }
    Ok(())
}

/// Wait for a publish operation while rendering its progress on stderr.
async fn wait_with_progress(
    client: &Arc<dyn InstanceServer>,
    id: &str,
) -> Result<crate::incus::Operation, ProvisionError> {
    let poller = tokio::spawn({
        let client = client.clone();
        let id = id.to_string();
        async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(500));
            loop {
                ticker.tick().await;
                let Ok(op) = client.get_operation(&id).await else {
                    break;
                };
                if let Some(percent) = op.progress_percent() {
                    eprint!("\rpublishing: {percent:3}%");
                    let _ = std::io::stderr().flush();
                }
            }
        }
    });

    let result = client.wait_operation(id).await;
    poller.abort();
    eprintln!();
    Ok(result?)
}

/// The fixed bootstrap: agent user and group at the canonical IDs, Docker,
/// and the pinned agent tarball unpacked into the agent home.
fn bootstrap_script(agent_url: &str) -> String {
    format!(
        r#"
set -euo pipefail
AGENT_URL="{agent_url}"
AGENT_USER="{AGENT_USER}"
AGENT_UID="{AGENT_UID}"
AGENT_GID="{AGENT_GID}"
AGENT_HOME="/home/${{AGENT_USER}}"

apt-get update
apt-get install -y curl wget tar sudo

groupadd --gid ${{AGENT_GID}} "${{AGENT_USER}}"
useradd -m -s /bin/bash --uid ${{AGENT_UID}} --gid ${{AGENT_GID}} "${{AGENT_USER}}"
echo "${{AGENT_USER}} ALL=(ALL) NOPASSWD:ALL" > /etc/sudoers.d/${{AGENT_USER}}
chmod 440 /etc/sudoers.d/${{AGENT_USER}}

# Add Docker repo
install -m 0755 -d /etc/apt/keyrings
curl -fsSL https://download.docker.com/linux/ubuntu/gpg -o /etc/apt/keyrings/docker.asc
chmod a+r /etc/apt/keyrings/docker.asc

echo "deb [arch=$(dpkg --print-architecture) signed-by=/etc/apt/keyrings/docker.asc] https://download.docker.com/linux/ubuntu $(. /etc/os-release && echo "$VERSION_CODENAME") stable" > /etc/apt/sources.list.d/docker.list

apt-get update
apt-get install -y docker-ce docker-ce-cli containerd.io docker-buildx-plugin docker-compose-plugin

usermod -aG docker "${{AGENT_USER}}"

su - "${{AGENT_USER}}" -c "
  cd ${{AGENT_HOME}}
  curl -fsSL -o agent.tar.gz ${{AGENT_URL}}
  tar -xzf agent.tar.gz
  rm agent.tar.gz
"
"#
    )
}

/// Map the build architecture to the agent tarball suffix.
fn arch_suffix() -> Result<&'static str, ProvisionError> {
    match std::env::consts::ARCH {
        "x86_64" => Ok("x64"),
        "aarch64" => Ok("arm64"),
        "arm" => Ok("arm"),
        other => Err(ProvisionError::UnsupportedArch(other.to_string())),
    }
}

#[derive(Deserialize)]
struct Release {
    tag_name: String,
}

/// Resolve the download URL of the latest Azure Pipelines agent for this
/// architecture.
async fn latest_agent_url() -> Result<String, ProvisionError> {
    let suffix = arch_suffix()?;

    let response = reqwest::Client::new()
        .get("https://api.github.com/repos/microsoft/azure-pipelines-agent/releases/latest")
        .header("User-Agent", "incus-azure-pipelines")
        .send()
        .await
        .map_err(|e| ProvisionError::Release(e.to_string()))?;

    if !response.status().is_success() {
        return Err(ProvisionError::Release(format!(
            "unexpected status code: {}",
            response.status()
        )));
    }

    let release: Release = response
        .json()
        .await
        .map_err(|e| ProvisionError::Release(e.to_string()))?;

    let version = release.tag_name.trim_start_matches('v');
    Ok(download_url(version, suffix))
}

fn download_url(version: &str, arch_suffix: &str) -> String {
    format!(
        "https://download.agent.dev.azure.com/agent/{version}/vsts-agent-linux-{arch_suffix}-{version}.tar.gz"
    )
}

/// Random lowercase-alphanumeric suffix for builder names.
fn random_suffix(n: usize) -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..n)
        .map(|_| CHARS[rng.random_range(0..CHARS.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_suffix_is_lowercase_alphanumeric() {
        for _ in 0..32 {
            let suffix = random_suffix(8);
            assert_eq!(suffix.len(), 8);
            assert!(suffix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn download_url_pins_version_and_arch() {
        assert_eq!(
            download_url("4.255.0", "x64"),
            "https://download.agent.dev.azure.com/agent/4.255.0/vsts-agent-linux-x64-4.255.0.tar.gz"
        );
    }

    #[test]
    fn bootstrap_script_pins_agent_identity() {
        let script = bootstrap_script("https://example.com/agent.tar.gz");
        assert!(script.contains(r#"AGENT_URL="https://example.com/agent.tar.gz""#));
        assert!(script.contains(r#"AGENT_UID="1100""#));
        assert!(script.contains(r#"AGENT_GID="1100""#));
        assert!(script.contains("groupadd --gid"));
    }

    #[test]
    fn run_agent_script_is_embedded() {
        assert!(RUN_AGENT_SCRIPT.contains("--acceptTeeEula"));
        assert!(RUN_AGENT_SCRIPT.contains("run.sh --once"));
    }
}
