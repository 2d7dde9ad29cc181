//! Integration tests for reconcile passes against the mock host.

use std::sync::Arc;
use std::time::Duration;

use incus_azure_pipelines::config::{AzureConfig, IncusConfig, PoolConfig};
use incus_azure_pipelines::incus::MockServer;
use incus_azure_pipelines::pool::Pool;
use tokio::sync::mpsc;

fn test_config(agent_count: usize) -> PoolConfig {
    PoolConfig {
        name: "azp-agent".to_string(),
        agent_count,
        agent_prefix: None,
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
            startup_grace_period: Duration::ZERO,
        },
    }
}

async fn reconcile_once(mock: &MockServer, agent_count: usize) -> Vec<usize> {
    let pool = Pool::new(Arc::new(mock.clone()), test_config(agent_count)).unwrap();
    let (tx, mut rx) = mpsc::channel(64);
    pool.reconcile(&tx).await.unwrap();
    drop(tx);

    let mut enqueued = Vec::new();
    while let Some(idx) = rx.recv().await {
        enqueued.push(idx);
    }
    enqueued
}

#[tokio::test]
async fn empty_fleet_enqueues_all_indices() {
    let mock = MockServer::new();
    assert_eq!(reconcile_once(&mock, 3).await, vec![0, 1, 2]);
}

#[tokio::test]
async fn partial_fleet_enqueues_only_missing() {
    let mock = MockServer::new();
    mock.add_instance("azp-agent-0");
    mock.add_instance("azp-agent-2");
    assert_eq!(reconcile_once(&mock, 3).await, vec![1]);
}

#[tokio::test]
async fn full_fleet_enqueues_nothing() {
    let mock = MockServer::new();
    mock.add_instance("azp-agent-0");
    mock.add_instance("azp-agent-1");
    mock.add_instance("azp-agent-2");
    assert!(reconcile_once(&mock, 3).await.is_empty());
}

#[tokio::test]
async fn foreign_names_are_ignored() {
    let mock = MockServer::new();
    mock.add_instance("azp-agent-0");
    mock.add_instance("other-container");
    mock.add_instance("other-agent-1");
    assert_eq!(reconcile_once(&mock, 3).await, vec![1, 2]);
}

#[tokio::test]
async fn out_of_range_indices_are_not_enqueued() {
    let mock = MockServer::new();
    // Exists on the host but is outside [0, agent_count).
    mock.add_instance("azp-agent-50");
    assert_eq!(reconcile_once(&mock, 3).await, vec![0, 1, 2]);
}

#[tokio::test]
async fn single_agent_pool_reconciles() {
    let mock = MockServer::new();
    assert_eq!(reconcile_once(&mock, 1).await, vec![0]);
}

#[tokio::test]
async fn max_size_pool_reconciles() {
    let mock = MockServer::new();
    let enqueued = reconcile_once(&mock, 64).await;
    assert_eq!(enqueued.len(), 64);
    assert_eq!(enqueued[0], 0);
    assert_eq!(enqueued[63], 63);
}

#[tokio::test]
async fn list_error_fails_the_pass() {
    let mock = MockServer::new();
    mock.fail_listings(true);

    let pool = Pool::new(Arc::new(mock.clone()), test_config(3)).unwrap();
    let (tx, mut rx) = mpsc::channel(64);
    let err = pool.reconcile(&tx).await.unwrap_err();
    assert!(err.to_string().contains("connection refused"));

    drop(tx);
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn reconcile_is_idempotent_across_passes() {
    let mock = MockServer::new();
    mock.add_instance("azp-agent-0");
    mock.add_instance("azp-agent-1");
    mock.add_instance("azp-agent-2");

    for _ in 0..3 {
        assert!(reconcile_once(&mock, 3).await.is_empty());
    }
}
