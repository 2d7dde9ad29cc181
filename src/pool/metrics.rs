//! Prometheus series for the agent pools.
//!
//! Counters live on the default registry and are labelled by pool. Agent
//! uptime is served by a per-pool collector: `Collector::collect` is
//! synchronous, so instead of listing the fleet during a scrape it reads a
//! snapshot of created-at stamps that the reconciler refreshes on every
//! pass, and computes the uptime at scrape time.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use chrono::{DateTime, Utc};
use prometheus::core::{Collector, Desc};
use prometheus::{proto, GaugeVec, IntCounterVec, Opts};
use tracing::error;

pub(crate) struct PoolCounters {
    pub created: IntCounterVec,
    pub created_error: IntCounterVec,
    pub reaped: IntCounterVec,
    pub reaped_error: IntCounterVec,
}

static COUNTERS: OnceLock<PoolCounters> = OnceLock::new();

impl PoolCounters {
    fn build() -> Result<Self, prometheus::Error> {
        let counters = Self {
            created: IntCounterVec::new(
                Opts::new(
                    "iap_agents_created_success",
                    "Count of the number of agents created by the orchestrator",
                ),
                &["pool"],
            )?,
            created_error: IntCounterVec::new(
                Opts::new(
                    "iap_agents_created_error",
                    "Count of the number of errors that have occurred while creating an agent",
                ),
                &["pool"],
            )?,
            reaped: IntCounterVec::new(
                Opts::new("iap_agents_reaped", "Count of stale agents reaped"),
                &["pool"],
            )?,
            reaped_error: IntCounterVec::new(
                Opts::new(
                    "iap_agents_reaped_error",
                    "Count of errors while reaping stale agents",
                ),
                &["pool"],
            )?,
        };

        let registry = prometheus::default_registry();
        for collector in [
            &counters.created,
            &counters.created_error,
            &counters.reaped,
            &counters.reaped_error,
        ] {
            match registry.register(Box::new(collector.clone())) {
                Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(counters)
    }
}

/// Fetch the process-wide pool counters, building and registering them on
/// first use.
pub(crate) fn counters() -> Result<&'static PoolCounters, prometheus::Error> {
    if let Some(counters) = COUNTERS.get() {
        return Ok(counters);
    }
    let built = PoolCounters::build()?;
    Ok(COUNTERS.get_or_init(|| built))
}

/// Created-at stamps of the currently-observed agents of one pool, keyed
/// by index. Refreshed wholesale by each reconciler pass.
#[derive(Default)]
pub struct UptimeSnapshot {
    agents: RwLock<HashMap<usize, DateTime<Utc>>>,
}

impl UptimeSnapshot {
    /// Replace the snapshot with the latest observation.
    pub fn replace(&self, agents: HashMap<usize, DateTime<Utc>>) {
        *self.agents.write().expect("uptime snapshot lock poisoned") = agents;
    }

    fn created_at(&self) -> HashMap<usize, DateTime<Utc>> {
        self.agents
            .read()
            .expect("uptime snapshot lock poisoned")
            .clone()
    }
}

/// Per-pool `iap_agent_uptime{pool, idx}` gauge collector.
pub(crate) struct AgentUptimeCollector {
    desc: Desc,
    pool: String,
    agents: Arc<UptimeSnapshot>,
}

const UPTIME_NAME: &str = "iap_agent_uptime";
const UPTIME_HELP: &str = "Time (in seconds) an agent is up and running";

impl AgentUptimeCollector {
    pub fn new(pool: &str, agents: Arc<UptimeSnapshot>) -> Result<Self, prometheus::Error> {
        let desc = Desc::new(
            UPTIME_NAME.to_string(),
            UPTIME_HELP.to_string(),
            vec!["idx".to_string()],
            HashMap::from([("pool".to_string(), pool.to_string())]),
        )?;
        Ok(Self {
            desc,
            pool: pool.to_string(),
            agents,
        })
    }
}

impl Collector for AgentUptimeCollector {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.desc]
    }

    fn collect(&self) -> Vec<proto::MetricFamily> {
        let opts = Opts::new(UPTIME_NAME, UPTIME_HELP).const_label("pool", &self.pool);
        let gauge = match GaugeVec::new(opts, &["idx"]) {
            Ok(gauge) => gauge,
            Err(e) => {
                error!(err = %e, "error producing agent uptime metric");
                return Vec::new();
            }
        };

        let now = Utc::now();
        for (idx, created_at) in self.agents.created_at() {
            let uptime = (now - created_at).num_milliseconds() as f64 / 1000.0;
            gauge.with_label_values(&[&idx.to_string()]).set(uptime);
        }
        gauge.collect()
    }
}

/// Register a pool's uptime collector on the default registry. Registering
/// the same pool twice is not an error.
pub(crate) fn register_uptime_collector(
    pool: &str,
    agents: Arc<UptimeSnapshot>,
) -> Result<(), prometheus::Error> {
    let collector = AgentUptimeCollector::new(pool, agents)?;
    match prometheus::default_registry().register(Box::new(collector)) {
        Ok(()) | Err(prometheus::Error::AlreadyReg) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn collector_reports_snapshot_agents() {
        let snapshot = Arc::new(UptimeSnapshot::default());
        snapshot.replace(HashMap::from([
            (0, Utc::now() - Duration::seconds(300)),
            (1, Utc::now() - Duration::seconds(300)),
        ]));

        let collector = AgentUptimeCollector::new("azp-agent", snapshot.clone()).unwrap();
        let registry = prometheus::Registry::new();
        registry.register(Box::new(collector)).unwrap();

        let families = registry.gather();
        assert_eq!(families.len(), 1);
        let family = &families[0];
        assert_eq!(family.get_name(), "iap_agent_uptime");

        let metrics = family.get_metric();
        assert_eq!(metrics.len(), 2);

        let mut idx_labels = Vec::new();
        for metric in metrics {
            let uptime = metric.get_gauge().get_value();
            assert!((295.0..=305.0).contains(&uptime), "uptime was {uptime}");
            for label in metric.get_label() {
                match label.get_name() {
                    "idx" => idx_labels.push(label.get_value().to_string()),
                    "pool" => assert_eq!(label.get_value(), "azp-agent"),
                    other => panic!("unexpected label {other}"),
                }
            }
        }
        idx_labels.sort();
        assert_eq!(idx_labels, vec!["0", "1"]);
    }

    #[test]
    fn collector_is_empty_without_agents() {
        let snapshot = Arc::new(UptimeSnapshot::default());
        let collector = AgentUptimeCollector::new("azp-agent", snapshot).unwrap();
        let families = collector.collect();
        assert_eq!(families.len(), 1);
        assert!(families[0].get_metric().is_empty());
    }

    #[test]
    fn registering_same_pool_twice_is_ok() {
        let snapshot = Arc::new(UptimeSnapshot::default());
        register_uptime_collector("metrics-test-pool", snapshot.clone()).unwrap();
        register_uptime_collector("metrics-test-pool", snapshot).unwrap();
    }

    #[test]
    fn counters_are_labelled_by_pool() {
        let counters = counters().unwrap();
        counters
            .created
            .with_label_values(&["metrics-test-pool"])
            .inc();
        let value = counters
            .created
            .with_label_values(&["metrics-test-pool"])
            .get();
        assert!(value >= 1);
    }
}
