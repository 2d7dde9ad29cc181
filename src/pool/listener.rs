//! Deleted-instance event listener.
//!
//! Cuts the recreate latency from a full reconcile interval down to one
//! round-trip: when the host logs a `Deleted instance` event for one of
//! this pool's agents, its index is enqueued immediately.
//!
//! Event metadata is an untyped map. This is the one place where the host's
//! loose JSON meets the strict core, so every access is defensive: a
//! missing or mistyped field drops the event with a warning, never more.

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use super::{Pool, PoolError};
use crate::incus::Event;

/// Await until `shutdown` fires.
///
/// Wrapping the `wait_for` await here (rather than inlining it in a
/// `select!` branch) keeps the branch's output type `Send`: the `watch::Ref`
/// that `wait_for` resolves to is not `Send`, and `select!`'s generated
/// output enum must be `Send` across all branches for the surrounding
/// future to be spawnable.
async fn shutdown_signal(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

impl Pool {
    /// Listen for deleted-instance events and enqueue their indices.
    ///
    /// Returns `Ok` when `shutdown` fires, `Err` when the stream drops;
    /// the daemon retries the latter with backoff.
    pub async fn listen_for_deletes(
        &self,
        tx: &mpsc::Sender<usize>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), PoolError> {
        let mut events = self.client.events().await?;

        loop {
            tokio::select! {
                _ = shutdown_signal(&mut shutdown) => return Ok(()),
                event = events.recv() => match event {
                    Some(event) => self.handle_event(&event, tx).await,
                    None => {
                        return Err(PoolError::Host(crate::incus::Error::Transport(
                            "event stream closed".to_string(),
                        )))
                    }
                },
            }
        }
    }

    async fn handle_event(&self, event: &Event, tx: &mpsc::Sender<usize>) {
        let meta = &event.metadata;
        if meta.get("level").and_then(Value::as_str) != Some("info")
            || meta.get("message").and_then(Value::as_str) != Some("Deleted instance")
        {
            return;
        }

        let Some(context) = meta.get("context").and_then(Value::as_object) else {
            warn!(
                pool = %self.conf.name,
                data = %meta,
                "unexpected event format, no 'context' map found"
            );
            return;
        };

        let Some(instance) = context.get("instance").and_then(Value::as_str) else {
            warn!(
                pool = %self.conf.name,
                data = %meta,
                "unexpected event format, context.instance is not a string"
            );
            return;
        };

        // The host event stream may span projects even when the client is
        // project-scoped; filtering is this listener's job.
        if !self.conf.incus.project_name.is_empty() {
            let project = context.get("project").and_then(Value::as_str);
            if project != Some(self.conf.incus.project_name.as_str()) {
                return;
            }
        }

        let Ok(idx) = self.agent_index(instance) else {
            return;
        };

        info!(pool = %self.conf.name, name = instance, "container deleted");
        let _ = tx.send(idx).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::{AzureConfig, IncusConfig, PoolConfig};
    use crate::incus::MockServer;

    fn pool_with(name: &str, project: &str) -> Pool {
        let conf = PoolConfig {
            name: name.to_string(),
            agent_count: 16,
            agent_prefix: None,
            azure: AzureConfig {
                pat: "t".to_string(),
                url: "https://dev.azure.com/org".to_string(),
            },
            incus: IncusConfig {
                image: "img".to_string(),
                project_name: project.to_string(),
                max_cores: 0,
                max_ram_in_gb: 0,
                tmpfs_size_in_gb: 0,
                startup_grace_period: std::time::Duration::ZERO,
            },
        };
        Pool::new(Arc::new(MockServer::new()), conf).unwrap()
    }

    fn deleted_event(instance: &str, project: Option<&str>) -> Event {
        let mut context = serde_json::json!({ "instance": instance });
        if let Some(project) = project {
            context["project"] = serde_json::json!(project);
        }
        Event {
            event_type: "logging".to_string(),
            metadata: serde_json::json!({
                "level": "info",
                "message": "Deleted instance",
                "context": context,
            }),
        }
    }

    async fn delivered(pool: &Pool, event: Event) -> Vec<usize> {
        let (tx, mut rx) = mpsc::channel(16);
        pool.handle_event(&event, &tx).await;
        drop(tx);
        let mut indices = Vec::new();
        while let Some(idx) = rx.recv().await {
            indices.push(idx);
        }
        indices
    }

    #[tokio::test]
    async fn matching_delete_event_enqueues_index() {
        let pool = pool_with("azp-agent", "");
        let got = delivered(&pool, deleted_event("azp-agent-7", None)).await;
        assert_eq!(got, vec![7]);
    }

    #[tokio::test]
    async fn foreign_names_are_ignored() {
        let pool = pool_with("azp-agent", "");
        assert!(delivered(&pool, deleted_event("other-agent-7", None))
            .await
            .is_empty());
        assert!(delivered(&pool, deleted_event("azp-agent-x", None))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn project_scoped_pool_filters_by_project() {
        let pool = pool_with("azp-agent", "P");
        assert_eq!(
            delivered(&pool, deleted_event("azp-agent-7", Some("P"))).await,
            vec![7]
        );
        assert!(delivered(&pool, deleted_event("azp-agent-7", Some("Q")))
            .await
            .is_empty());
        // No project in the event at all.
        assert!(delivered(&pool, deleted_event("azp-agent-7", None))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn unscoped_pool_ignores_event_project() {
        let pool = pool_with("azp-agent", "");
        assert_eq!(
            delivered(&pool, deleted_event("azp-agent-3", Some("anything"))).await,
            vec![3]
        );
    }

    #[tokio::test]
    async fn non_delete_and_malformed_events_are_dropped() {
        let pool = pool_with("azp-agent", "");

        let wrong_level = Event {
            event_type: "logging".to_string(),
            metadata: serde_json::json!({
                "level": "debug",
                "message": "Deleted instance",
                "context": { "instance": "azp-agent-1" },
            }),
        };
        assert!(delivered(&pool, wrong_level).await.is_empty());

        let no_context = Event {
            event_type: "logging".to_string(),
            metadata: serde_json::json!({
                "level": "info",
                "message": "Deleted instance",
            }),
        };
        assert!(delivered(&pool, no_context).await.is_empty());

        let bad_instance = Event {
            event_type: "logging".to_string(),
            metadata: serde_json::json!({
                "level": "info",
                "message": "Deleted instance",
                "context": { "instance": 7 },
            }),
        };
        assert!(delivered(&pool, bad_instance).await.is_empty());

        let empty = Event {
            event_type: "lifecycle".to_string(),
            metadata: serde_json::Value::Null,
        };
        assert!(delivered(&pool, empty).await.is_empty());
    }

    #[tokio::test]
    async fn listener_exits_on_stream_close_with_error() {
        let mock = MockServer::new();
        let conf = PoolConfig {
            name: "azp-agent".to_string(),
            agent_count: 4,
            agent_prefix: None,
            azure: AzureConfig {
                pat: "t".to_string(),
                url: "https://dev.azure.com/org".to_string(),
            },
            incus: IncusConfig {
                image: "img".to_string(),
                project_name: String::new(),
                max_cores: 0,
                max_ram_in_gb: 0,
                tmpfs_size_in_gb: 0,
                startup_grace_period: std::time::Duration::ZERO,
            },
        };
        let pool = Pool::new(Arc::new(mock.clone()), conf).unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let listen = tokio::spawn(async move {
            pool.listen_for_deletes(&tx, shutdown_rx).await
        });

        // Give the listener time to subscribe, feed it one event, then
        // drop the stream.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        mock.push_event(deleted_event("azp-agent-2", None));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        mock.drop_event_streams();

        let result = listen.await.unwrap();
        assert!(result.is_err());
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn listener_exits_cleanly_on_shutdown() {
        let pool = pool_with("azp-agent", "");

        let (tx, _rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let listen = tokio::spawn(async move {
            pool.listen_for_deletes(&tx, shutdown_rx).await
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();

        assert!(listen.await.unwrap().is_ok());
    }
}
