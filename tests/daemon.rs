//! End-to-end daemon tests: all four control loops against the mock host.

use std::sync::Arc;
use std::time::Duration;

use incus_azure_pipelines::config::{
    AzureConfig, DaemonConfig, IncusConfig, ListenerConfig, PoolConfig,
};
use incus_azure_pipelines::daemon;
use incus_azure_pipelines::incus::{Event, MockServer};
use incus_azure_pipelines::pool::Pool;
use tokio::sync::watch;
use tokio::time::timeout;

fn pool_config(name: &str, agent_count: usize) -> PoolConfig {
    PoolConfig {
        name: name.to_string(),
        agent_count,
        agent_prefix: Some("ci-host".to_string()),
        azure: AzureConfig {
            pat: "test-token".to_string(),
            url: "https://dev.azure.com/myorg".to_string(),
        },
        incus: IncusConfig {
            image: "test-image".to_string(),
            project_name: String::new(),
            max_cores: 0,
            max_ram_in_gb: 0,
            tmpfs_size_in_gb: 0,
            startup_grace_period: Duration::from_secs(600),
        },
    }
}

fn daemon_config(reconcile: Duration) -> DaemonConfig {
    DaemonConfig {
        reconcile_interval: reconcile,
        reaper_interval: Duration::from_secs(600),
        listener: ListenerConfig {
            retry_delay: Duration::from_millis(10),
            max_retry_delay: Duration::from_millis(100),
        },
    }
}

/// Poll until `predicate` holds or the deadline passes.
async fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}

#[tokio::test]
async fn empty_fleet_converges_to_desired_count() {
    let mock = MockServer::new();
    let pool = Arc::new(Pool::new(Arc::new(mock.clone()), pool_config("conv-pool", 3)).unwrap());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(daemon::run(
        pool,
        daemon_config(Duration::from_millis(50)),
        shutdown_rx,
    ));

    let converged = wait_until(Duration::from_secs(5), || {
        let mut names = mock.instance_names();
        names.sort();
        names == vec!["conv-pool-0", "conv-pool-1", "conv-pool-2"]
    })
    .await;
    assert!(converged, "fleet never converged: {:?}", mock.instance_names());

    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("daemon did not drain after shutdown")
        .unwrap();
}

#[tokio::test]
async fn delete_event_triggers_recreate_between_ticks() {
    let mock = MockServer::new();
    mock.add_instance("ev-pool-0");
    mock.add_instance("ev-pool-1");
    mock.add_instance("ev-pool-2");

    let pool = Arc::new(Pool::new(Arc::new(mock.clone()), pool_config("ev-pool", 3)).unwrap());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Reconcile interval far beyond the test horizon: a recreate can only
    // come from the event listener.
    let handle = tokio::spawn(daemon::run(
        pool,
        daemon_config(Duration::from_secs(600)),
        shutdown_rx,
    ));

    // Let the initial reconcile pass and the listener subscription settle.
    tokio::time::sleep(Duration::from_millis(100)).await;

    mock.remove_instance("ev-pool-1");
    mock.push_event(Event {
        event_type: "logging".to_string(),
        metadata: serde_json::json!({
            "level": "info",
            "message": "Deleted instance",
            "context": { "instance": "ev-pool-1" },
        }),
    });

    let recreated = wait_until(Duration::from_secs(5), || {
        mock.instance_names().contains(&"ev-pool-1".to_string())
    })
    .await;
    assert!(recreated, "listener never recreated the deleted agent");

    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("daemon did not drain after shutdown")
        .unwrap();
}

#[tokio::test]
async fn listener_reconnects_after_stream_drop() {
    let mock = MockServer::new();
    mock.add_instance("rc-pool-0");
    let pool = Arc::new(Pool::new(Arc::new(mock.clone()), pool_config("rc-pool", 1)).unwrap());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(daemon::run(
        pool,
        daemon_config(Duration::from_secs(600)),
        shutdown_rx,
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;
    mock.drop_event_streams();

    // After the backoff the listener resubscribes and still reacts.
    tokio::time::sleep(Duration::from_millis(200)).await;
    mock.remove_instance("rc-pool-0");
    mock.push_event(Event {
        event_type: "logging".to_string(),
        metadata: serde_json::json!({
            "level": "info",
            "message": "Deleted instance",
            "context": { "instance": "rc-pool-0" },
        }),
    });

    let recreated = wait_until(Duration::from_secs(5), || {
        mock.instance_names().contains(&"rc-pool-0".to_string())
    })
    .await;
    assert!(recreated, "listener did not recover from a dropped stream");

    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("daemon did not drain after shutdown")
        .unwrap();
}

#[tokio::test]
async fn shutdown_before_any_work_drains_cleanly() {
    let mock = MockServer::new();
    let pool = Arc::new(Pool::new(Arc::new(mock.clone()), pool_config("halt-pool", 2)).unwrap());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(daemon::run(
        pool,
        daemon_config(Duration::from_secs(600)),
        shutdown_rx,
    ));

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(true).unwrap();

    timeout(Duration::from_secs(5), handle)
        .await
        .expect("daemon did not drain after shutdown")
        .unwrap();
}

#[tokio::test]
async fn reaper_replaces_stale_agent_via_reconcile() {
    let mock = MockServer::new();
    mock.add_instance_with("reap-pool-0", "Running", chrono::Duration::minutes(30));
    mock.set_exec_exit("reap-pool-0", 1.0);

    let mut conf = pool_config("reap-pool", 1);
    conf.incus.startup_grace_period = Duration::from_secs(60);
    let pool = Arc::new(Pool::new(Arc::new(mock.clone()), conf).unwrap());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let daemon_conf = DaemonConfig {
        reconcile_interval: Duration::from_millis(50),
        reaper_interval: Duration::from_millis(50),
        listener: ListenerConfig {
            retry_delay: Duration::from_millis(10),
            max_retry_delay: Duration::from_millis(100),
        },
    };
    let handle = tokio::spawn(daemon::run(pool, daemon_conf, shutdown_rx));

    // The reaper stops the wedged container; the reconciler recreates it.
    // The replacement reports a live worker, so it stays.
    let replaced = wait_until(Duration::from_secs(5), || {
        !mock.state_changes().is_empty() && !mock.created_requests().is_empty()
    })
    .await;
    assert!(replaced, "stale agent was not reaped and replaced");

    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("daemon did not drain after shutdown")
        .unwrap();
}
