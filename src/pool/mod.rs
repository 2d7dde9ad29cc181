//! Per-pool control core.
//!
//! A [`Pool`] owns the state shared by the control loops of one agent
//! pool: the immutable config, the compiled agent-name pattern, the
//! in-flight index set that makes creates and reaps mutually exclusive,
//! and the uptime snapshot backing the metrics collector.
//!
//! The loops themselves are scheduled by [`crate::daemon`]; this module
//! implements their single passes: [`Pool::reconcile`],
//! [`Pool::create_agent`], [`Pool::reap`], and the event handling in
//! [`listener`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use regex::Regex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::incus::{
    Error as HostError, ExecPost, FileArgs, Instance, InstanceFull, InstanceServer,
    InstanceSource, InstanceStatePut, InstancesPost,
};
use crate::provision::{AGENT_GID, AGENT_UID, AGENT_USER};

mod listener;
pub mod metrics;

use metrics::UptimeSnapshot;

/// Path the PAT is delivered to inside an agent container.
const TOKEN_PATH: &str = "/home/agent/.token";

/// Path the worker appends its logs to.
const LOG_PATH: &str = "/home/agent/azp-agent.log";

/// Worker entrypoint inside an agent container.
const RUN_AGENT_PATH: &str = "/home/agent/run_agent.sh";

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("unable to construct agent pattern from name {name:?}: {source}")]
    Pattern { name: String, source: regex::Error },

    #[error("agent index {idx} out of range, pool capacity is {capacity}")]
    OutOfRange { idx: usize, capacity: usize },

    /// Sentinel: a name does not belong to this pool. Not an error at the
    /// API boundary; used to short-circuit filtering.
    #[error("not a pool agent")]
    NotPoolAgent,

    #[error("parse agent index from {name:?}: {source}")]
    IndexParse {
        name: String,
        source: std::num::ParseIntError,
    },

    #[error("hostname lookup failed: {0}")]
    Hostname(nix::errno::Errno),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// State and operations of one agent pool.
pub struct Pool {
    client: Arc<dyn InstanceServer>,
    conf: PoolConfig,
    agent_re: Regex,
    in_flight: Mutex<HashSet<usize>>,
    uptime: Arc<UptimeSnapshot>,
    counters: &'static metrics::PoolCounters,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").field("conf", &self.conf).finish_non_exhaustive()
    }
}

/// Ownership of an index in the in-flight set, released on drop.
///
/// Drop-based release keeps the mutual-exclusion invariant even when the
/// owning task is cancelled mid-operation.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<usize>>,
    idx: usize,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .expect("in-flight set lock poisoned")
            .remove(&self.idx);
    }
}

impl Pool {
    pub fn new(client: Arc<dyn InstanceServer>, conf: PoolConfig) -> Result<Self, PoolError> {
        let client = if conf.incus.project_name.is_empty() {
            client
        } else {
            client.with_project(&conf.incus.project_name)
        };

        let agent_re =
            Regex::new(&format!(r"^{}-(\d+)$", conf.name)).map_err(|source| PoolError::Pattern {
                name: conf.name.clone(),
                source,
            })?;

        let uptime = Arc::new(UptimeSnapshot::default());
        metrics::register_uptime_collector(&conf.name, uptime.clone())?;
        let counters = metrics::counters()?;

        Ok(Self {
            client,
            conf,
            agent_re,
            in_flight: Mutex::new(HashSet::new()),
            uptime,
            counters,
        })
    }

    pub fn name(&self) -> &str {
        &self.conf.name
    }

    pub fn project(&self) -> &str {
        &self.conf.incus.project_name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.conf
    }

    /// Container name for an agent index.
    pub fn agent_name(&self, idx: usize) -> String {
        format!("{}-{}", self.conf.name, idx)
    }

    /// The 0-based index of an agent based on its container name.
    ///
    /// Returns [`PoolError::NotPoolAgent`] if the name does not match this
    /// pool's naming pattern.
    pub fn agent_index(&self, name: &str) -> Result<usize, PoolError> {
        let captures = self.agent_re.captures(name).ok_or(PoolError::NotPoolAgent)?;
        captures[1].parse().map_err(|source| PoolError::IndexParse {
            name: name.to_string(),
            source,
        })
    }

    fn is_agent(&self, name: &str) -> bool {
        self.agent_re.is_match(name)
    }

    /// Atomically claim an index; `None` if a builder or reaper owns it.
    fn try_claim(&self, idx: usize) -> Option<InFlightGuard<'_>> {
        let mut set = self.in_flight.lock().expect("in-flight set lock poisoned");
        set.insert(idx).then_some(InFlightGuard {
            set: &self.in_flight,
            idx,
        })
    }

    /// List this pool's agent containers.
    pub async fn list_agents(&self) -> Result<Vec<Instance>, PoolError> {
        let instances = self.client.list_instances().await?;
        Ok(instances
            .into_iter()
            .filter(|i| self.is_agent(&i.name))
            .collect())
    }

    /// List this pool's agent containers including runtime state.
    pub async fn list_agents_full(&self) -> Result<Vec<InstanceFull>, PoolError> {
        let instances = self.client.list_instances_full().await?;
        Ok(instances
            .into_iter()
            .filter(|i| self.is_agent(&i.name))
            .collect())
    }

    /// A single reconcile pass: list the fleet, enqueue every missing
    /// index in ascending order.
    ///
    /// Also refreshes the uptime snapshot, since the fleet was just
    /// listed. Indices at or above the pool capacity are observed (their
    /// containers exist) but never enqueued.
    pub async fn reconcile(&self, tx: &mpsc::Sender<usize>) -> Result<(), PoolError> {
        let agents = self.list_agents().await?;

        let mut observed = HashSet::with_capacity(agents.len());
        let mut created_at = HashMap::with_capacity(agents.len());
        for agent in &agents {
            // The listing was already pattern-filtered; any failure here is
            // a programmer error and fails the pass.
            let idx = self.agent_index(&agent.name)?;
            observed.insert(idx);
            created_at.insert(idx, agent.created_at);
        }
        self.uptime.replace(created_at);

        for idx in 0..self.conf.agent_count {
            if observed.contains(&idx) {
                continue;
            }
            if tx.send(idx).await.is_err() {
                // Dispatcher is gone; the daemon is shutting down.
                return Ok(());
            }
        }

        Ok(())
    }

    /// Create and configure the agent at `idx`.
    ///
    /// A no-op if the index is already owned by another builder or the
    /// reaper. On success the agent worker has been started inside the
    /// container.
    pub async fn create_agent(&self, idx: usize) -> Result<(), PoolError> {
        if idx >= self.conf.agent_count {
            return Err(PoolError::OutOfRange {
                idx,
                capacity: self.conf.agent_count,
            });
        }

        let Some(_guard) = self.try_claim(idx) else {
            warn!(
                pool = %self.conf.name,
                idx,
                reason = "in-flight",
                "skipping agent creation"
            );
            return Ok(());
        };

        let result = self.create_agent_inner(idx).await;
        match &result {
            Ok(()) => self.counters.created.with_label_values(&[&self.conf.name]).inc(),
            Err(_) => self
                .counters
                .created_error
                .with_label_values(&[&self.conf.name])
                .inc(),
        }
        result
    }

    async fn create_agent_inner(&self, idx: usize) -> Result<(), PoolError> {
        let name = self.agent_name(idx);
        let req = self.create_request(&name);

        let op = self.client.create_instance(&req).await?;
        self.client.wait_operation(&op.id).await?;

        self.client
            .create_instance_file(
                &name,
                TOKEN_PATH,
                self.conf.azure.pat.as_bytes(),
                &FileArgs {
                    mode: 0o400,
                    uid: AGENT_UID as i64,
                    gid: AGENT_GID as i64,
                    write_mode: "overwrite".to_string(),
                },
            )
            .await?;

        let label_prefix = match &self.conf.agent_prefix {
            Some(prefix) => prefix.clone(),
            None => hostname()?,
        };

        let exec = ExecPost {
            command: vec![
                "setsid".to_string(),
                "--fork".to_string(),
                RUN_AGENT_PATH.to_string(),
                "--agent".to_string(),
                format!("{label_prefix}-{idx}"),
                "--pool".to_string(),
                self.conf.name.clone(),
                "--url".to_string(),
                self.conf.azure.url.clone(),
            ],
            wait_for_websocket: true,
            interactive: false,
            user: Some(AGENT_UID),
            group: Some(AGENT_GID),
        };
        let op = self.client.exec_instance(&name, &exec).await?;
        self.client.wait_operation(&op.id).await?;

        Ok(())
    }

    fn create_request(&self, name: &str) -> InstancesPost {
        let mut config = BTreeMap::from([(
            "boot.host_shutdown_action".to_string(),
            "force-stop".to_string(),
        )]);
        let mut devices = BTreeMap::new();

        let incus = &self.conf.incus;
        if incus.max_cores > 0 {
            config.insert(
                "limits.cpu.allowance".to_string(),
                format!("{}%", incus.max_cores * 100),
            );
        }
        if incus.max_ram_in_gb > 0 {
            config.insert("limits.memory".to_string(), format!("{}GiB", incus.max_ram_in_gb));
        }
        if incus.tmpfs_size_in_gb > 0 {
            devices.insert(
                "tmpfs".to_string(),
                BTreeMap::from([
                    ("type".to_string(), "disk".to_string()),
                    ("source".to_string(), "tmpfs:".to_string()),
                    ("path".to_string(), "/tmp".to_string()),
                    ("size".to_string(), format!("{}GiB", incus.tmpfs_size_in_gb)),
                ]),
            );
        }

        InstancesPost {
            name: name.to_string(),
            instance_type: "container".to_string(),
            source: InstanceSource::image(&incus.image),
            start: true,
            ephemeral: true,
            config,
            devices,
        }
    }

    /// A single reaper pass: force-stop every running agent whose worker
    /// process has exited.
    ///
    /// Stopping an ephemeral container also removes it; the reconciler or
    /// the event listener recreates the index afterwards.
    pub async fn reap(&self) -> Result<(), PoolError> {
        let now = Utc::now();
        let agents = self.list_agents_full().await?;

        for agent in agents {
            let Ok(idx) = self.agent_index(&agent.name) else {
                continue;
            };

            let Some(state) = &agent.state else {
                debug!(
                    pool = %self.conf.name,
                    idx,
                    reason = "instance state unknown",
                    "reaper: skipping instance"
                );
                continue;
            };

            if state.status != "Running" {
                debug!(
                    pool = %self.conf.name,
                    idx,
                    reason = %format!("container status: {}", state.status),
                    "reaper: skipping instance"
                );
                continue;
            }

            let age = (now - agent.created_at).to_std().unwrap_or_default();
            if age < self.conf.incus.startup_grace_period {
                debug!(
                    pool = %self.conf.name,
                    idx,
                    age_secs = age.as_secs(),
                    reason = "age < grace period",
                    "reaper: skipping instance"
                );
                continue;
            }

            match self.is_agent_process_running(idx).await {
                Ok(true) => {
                    debug!(
                        pool = %self.conf.name,
                        idx,
                        reason = "agent process is running",
                        "reaper: skipping instance"
                    );
                    continue;
                }
                Ok(false) => {}
                // A container that cannot even be probed is as wedged as
                // one with a dead worker: fall through and stop it.
                Err(e) => {
                    warn!(pool = %self.conf.name, idx, err = %e, "reaper: health check failed");
                }
            }

            let Some(_guard) = self.try_claim(idx) else {
                debug!(
                    pool = %self.conf.name,
                    idx,
                    reason = "in-flight",
                    "reaper: skipping instance"
                );
                continue;
            };

            info!(pool = %self.conf.name, idx, age_secs = age.as_secs(), "reaper: reaping stale instance");
            match self.reap_instance(idx).await {
                Ok(()) => self.counters.reaped.with_label_values(&[&self.conf.name]).inc(),
                Err(e) => {
                    error!(pool = %self.conf.name, idx, err = %e, "reaper: failed to reap");
                    self.counters
                        .reaped_error
                        .with_label_values(&[&self.conf.name])
                        .inc();
                }
            }
        }

        Ok(())
    }

    /// Probe whether the worker process is alive inside an agent container.
    async fn is_agent_process_running(&self, idx: usize) -> Result<bool, PoolError> {
        let exec = ExecPost {
            command: vec![
                "pgrep".to_string(),
                "-u".to_string(),
                AGENT_USER.to_string(),
                "-f".to_string(),
                "run_agent.sh".to_string(),
            ],
            wait_for_websocket: true,
            interactive: false,
            user: None,
            group: None,
        };
        let op = self.client.exec_instance(&self.agent_name(idx), &exec).await?;
        let op = self.client.wait_operation(&op.id).await?;
        Ok(op.exit_code()? == 0)
    }

    /// Force-stop an agent container. The container being already gone
    /// counts as success.
    async fn reap_instance(&self, idx: usize) -> Result<(), PoolError> {
        let req = InstanceStatePut {
            action: "stop".to_string(),
            force: true,
            timeout: 30,
        };
        let op = match self
            .client
            .update_instance_state(&self.agent_name(idx), &req, "")
            .await
        {
            Ok(op) => op,
            Err(HostError::NotFound) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        match self.client.wait_operation(&op.id).await {
            Ok(_) | Err(HostError::NotFound) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch the worker log of an agent.
    pub async fn agent_logs(&self, idx: usize) -> Result<Vec<u8>, PoolError> {
        if idx >= self.conf.agent_count {
            return Err(PoolError::OutOfRange {
                idx,
                capacity: self.conf.agent_count,
            });
        }
        Ok(self
            .client
            .read_instance_file(&self.agent_name(idx), LOG_PATH)
            .await?)
    }
}

fn hostname() -> Result<String, PoolError> {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .map_err(PoolError::Hostname)
}
